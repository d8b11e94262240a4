// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The capture path: frames delivered by interfaces, turned into records.

use crate::TAP;
use crate::descriptor::{Descriptor, TapFlags, TapState, TimerState};
use crate::frame::Frame;
use crate::link::{Direction, LinkType, TimestampMode};
use crate::notify::wakeup;
use crate::record::{ExtendedFields, HeaderFormat, PendingRecord, RecordHeader};
use crate::registry::{Attachment, InterfaceTaps};
use crate::subsystem::Shared;
use crate::truncate::truncated_len;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
#[allow(unused)]
use tracing::{debug, trace};

/// Handle an interface uses to hand frames to the tap subsystem.
///
/// Obtained when registering the interface. Tapping never blocks on readers and never fails:
/// frames that cannot be buffered are counted as dropped.
#[derive(Clone)]
pub struct TapPoint {
    taps: Arc<InterfaceTaps>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapPoint")
            .field("interface", &self.taps.iface.name())
            .finish_non_exhaustive()
    }
}

impl TapPoint {
    pub(crate) fn new(taps: Arc<InterfaceTaps>, shared: Arc<Shared>) -> Self {
        Self { taps, shared }
    }

    /// Tell if some descriptor captures frames of the given link type.
    #[must_use]
    pub fn is_active(&self, link: LinkType) -> bool {
        self.taps
            .attachment(link)
            .is_some_and(|att| !att.is_empty())
    }

    /// Offer a frame of the given link type to the descriptors attached to it.
    pub fn tap(&self, link: LinkType, frame: &Frame<'_>) {
        let Some(att) = self.taps.attachment(link) else {
            return;
        };
        let descriptors = att.descriptors.load();
        for desc in descriptors.iter() {
            desc.capture(&self.shared, att, frame);
        }
    }

    /// Offer a received frame of the primary link type.
    pub fn tap_in(&self, data: &[u8]) {
        self.tap_primary(&Frame::new(data, Direction::In));
    }

    /// Offer a transmitted frame of the primary link type.
    pub fn tap_out(&self, data: &[u8]) {
        self.tap_primary(&Frame::new(data, Direction::Out));
    }

    fn tap_primary(&self, frame: &Frame<'_>) {
        if let Some(att) = self.taps.attachments.first() {
            self.tap(att.link.link, frame);
        }
    }
}

fn timestamp(mode: TimestampMode, shared: &Shared) -> (u32, u32) {
    let elapsed = match mode {
        TimestampMode::Realtime => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO),
        TimestampMode::Monotonic => shared.epoch.elapsed(),
        TimestampMode::Disabled => Duration::ZERO,
    };
    // wraps in 2106, like the 32 bit timestamps of classic capture records
    #[allow(clippy::cast_possible_truncation)]
    let secs = elapsed.as_secs() as u32;
    (secs, elapsed.subsec_micros())
}

fn header_format(flags: TapFlags) -> HeaderFormat {
    if flags.contains(TapFlags::EXTENDED_HEADER) {
        HeaderFormat::Extended
    } else if flags.contains(TapFlags::COMP_ENABLED) {
        HeaderFormat::Compressed
    } else {
        HeaderFormat::Plain
    }
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl Descriptor {
    fn captures(&self, st: &TapState, att: &Arc<Attachment>, direction: Direction) -> bool {
        let bound = st
            .binding
            .as_ref()
            .is_some_and(|binding| Arc::ptr_eq(binding, att));
        bound
            && !st
                .flags
                .intersects(TapFlags::CLOSING | TapFlags::DETACHING | TapFlags::DETACHED)
            && st.settings.direction.admits(direction)
    }

    /// Filter a frame and append the resulting record to the store buffer.
    pub(crate) fn capture(&self, shared: &Shared, att: &Arc<Attachment>, frame: &Frame<'_>) {
        let mut st = self.state.lock();
        if !self.captures(&st, att, frame.direction) {
            return;
        }
        st.stats.received += 1;

        let snaplen = match &st.filter {
            Some(program) => shared.evaluator.evaluate(program, frame.data, frame.wire_len),
            None => u32::MAX,
        };
        if snaplen == 0 {
            return;
        }

        let mut caplen = (snaplen as usize).min(frame.data.len());
        if st.flags.contains(TapFlags::TRUNCATE) {
            caplen = caplen.min(truncated_len(att.link, frame.data));
        }
        let format = header_format(st.flags);
        let hdrlen = att.headers.get(format);
        let room = (st.settings.buffer_size as usize).saturating_sub(usize::from(hdrlen));
        caplen = caplen.min(room);

        let (ts_sec, ts_usec) = timestamp(st.settings.timestamps, shared);
        let ext = (format == HeaderFormat::Extended).then_some(ExtendedFields {
            direction: frame.direction,
            service_class: frame.meta.service_class,
            hints: frame.meta.hints,
            flow_id: frame.meta.flow_id,
            pid: frame.meta.pid,
        });
        let record = PendingRecord {
            header: RecordHeader {
                ts_sec,
                ts_usec,
                caplen: saturating_u32(caplen),
                datalen: saturating_u32(frame.wire_len.max(frame.data.len())),
                hdrlen,
                complen: 0,
                ext,
            },
            format,
            payload: &frame.data[..caplen],
        };

        let head_drop = st.flags.contains(TapFlags::HEAD_DROP);
        let Some(ring) = st.buffers.as_mut() else {
            st.stats.dropped += 1;
            return;
        };
        let outcome = ring.append(&record, head_drop);
        st.stats.captured += 1;
        st.stats.dropped += outcome.discarded;
        if outcome.stored {
            if format.compressible() && st.flags.contains(TapFlags::COMP_ENABLED) {
                st.comp_stats.account(hdrlen, outcome.complen);
            }
        } else {
            st.stats.dropped += 1;
            trace!(target: TAP, "{}: dropped {} byte record", self.minor, record.len(0));
        }

        if outcome.rotated
            || (outcome.stored && st.flags.contains(TapFlags::IMMEDIATE))
            || st.timer == TimerState::TimedOut
        {
            wakeup(self, &mut st);
        }
    }
}
