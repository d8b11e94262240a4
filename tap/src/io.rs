// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Reading captured records and writing frames.

use crate::TAP;
use crate::descriptor::{Descriptor, Lease, LeaseKind, TapFlags, TimerState};
use crate::error::TapError;
use crate::frame::OutboundFrame;
use crate::link::{Cast, LinkType, TrafficClass};
use crate::record::{HeaderFormat, PLAIN_HEADER_LEN, RecordHeader, finalize_records, word_align};
use crate::registry::Attachment;
use crate::subsystem::Shared;
use crate::timer::arm_timer;
use etherparse::{Ipv4Header, Ipv6Header};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
#[allow(unused)]
use tracing::{debug, trace, warn};

/// Read the oldest batch of records into `out`, which must be exactly as large as the capture
/// buffers. Returns the number of bytes read, 0 if the read timeout expired with nothing
/// captured.
pub(crate) fn read(
    shared: &Shared,
    desc: &Arc<Descriptor>,
    out: &mut [u8],
) -> Result<usize, TapError> {
    let mut st = desc.state.lock();
    if st.closing() {
        return Err(TapError::NoSuchDevice);
    }
    if out.len() != st.settings.buffer_size as usize {
        return Err(TapError::InvalidArgument(
            "read size must equal the buffer size",
        ));
    }

    let mut timed_out = false;
    match st.timer {
        TimerState::Waiting => {
            st.timer = TimerState::Idle;
            st.timer_deadline = None;
        }
        TimerState::TimedOut => {
            st.timer = TimerState::Idle;
            timed_out = true;
        }
        TimerState::Idle | TimerState::Draining => {}
    }

    let mut lease = loop {
        if st.closing() {
            return Err(TapError::NoSuchDevice);
        }
        // one drain at a time
        if st.busy.read || st.busy.control {
            desc.cond.wait(&mut st);
            continue;
        }
        let force = timed_out
            || st
                .flags
                .intersects(TapFlags::IMMEDIATE | TapFlags::NON_BLOCKING);
        let Some(ring) = st.buffers.as_mut() else {
            return Err(TapError::NoSuchDevice);
        };
        if ring.has_hold() || (force && ring.rotate()) {
            let mut lease = Lease::acquire(desc, LeaseKind::Read, &mut st)?;
            lease.lent = st.buffers.as_mut().and_then(|ring| ring.lend_hold());
            break lease;
        }
        if st.binding.is_none() || st.flags.contains(TapFlags::DETACHED) {
            return Err(TapError::NoSuchDevice);
        }
        if st.flags.contains(TapFlags::NON_BLOCKING) {
            return Err(TapError::WouldBlock);
        }
        if st.interrupt {
            st.interrupt = false;
            return Err(TapError::Interrupted);
        }
        if timed_out {
            return Ok(0);
        }
        arm_timer(desc, &mut st);
        desc.cond.wait(&mut st);
        if st.timer == TimerState::TimedOut {
            st.timer = TimerState::Idle;
            timed_out = true;
        }
    };
    let extended = st.flags.contains(TapFlags::EXTENDED_HEADER);
    drop(st);

    // the hold buffer is ours: no lock needed
    let len = match lease.lent.as_mut() {
        Some(buffer) => {
            if extended && let Some(finalizer) = &shared.finalizer {
                finalize_records(buffer.bytes_mut(), finalizer.as_ref());
            }
            let len = buffer.len();
            out[..len].copy_from_slice(buffer.bytes());
            trace!(target: TAP, "{}: read {} records, {len} bytes", desc.minor, buffer.records());
            len
        }
        None => 0,
    };
    drop(lease);
    Ok(len)
}

fn classify(link: LinkType, link_header_len: usize, frame: &[u8]) -> Cast {
    match link {
        LinkType::Ethernet => match frame.get(..6) {
            Some([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]) => Cast::Broadcast,
            Some(dst) if dst[0] & 0x01 != 0 => Cast::Multicast,
            _ => Cast::Unicast,
        },
        _ => {
            let Some(packet) = frame.get(link_header_len..) else {
                return Cast::Unicast;
            };
            match packet.first().map(|b| b >> 4) {
                Some(4) => match Ipv4Header::from_slice(packet) {
                    Ok((ip, _)) => {
                        let dst = Ipv4Addr::from(ip.destination);
                        if dst.is_broadcast() {
                            Cast::Broadcast
                        } else if dst.is_multicast() {
                            Cast::Multicast
                        } else {
                            Cast::Unicast
                        }
                    }
                    Err(_) => Cast::Unicast,
                },
                Some(6) => match Ipv6Header::from_slice(packet) {
                    Ok((ip, _)) if Ipv6Addr::from(ip.destination).is_multicast() => {
                        Cast::Multicast
                    }
                    _ => Cast::Unicast,
                },
                _ => Cast::Unicast,
            }
        }
    }
}

struct WriteContext {
    att: Arc<Attachment>,
    flags: TapFlags,
    traffic_class: TrafficClass,
    max: usize,
}

impl WriteContext {
    fn check(&self, frame: &[u8]) -> Result<(), TapError> {
        if frame.len() > self.max {
            return Err(TapError::MessageTooLong {
                len: frame.len(),
                max: self.max,
            });
        }
        if frame.len() < self.att.link.header_len as usize {
            return Err(TapError::InvalidArgument("frame shorter than its link header"));
        }
        Ok(())
    }

    fn build(&self, mut data: Vec<u8>) -> OutboundFrame {
        let link = self.att.link.link;
        if link == LinkType::Ethernet
            && !self.flags.contains(TapFlags::HEADER_COMPLETE)
            && let Some(mac) = self.att.iface.mac()
            && data.len() >= 12
        {
            data[6..12].copy_from_slice(&mac);
        }
        let cast = classify(link, self.att.link.header_len as usize, &data);
        OutboundFrame {
            link,
            data,
            cast,
            traffic_class: self.traffic_class,
        }
    }

    fn send(&self, frame: OutboundFrame) -> Result<(), TapError> {
        let iface = &self.att.iface;
        let result = if self.flags.contains(TapFlags::DIVERT_INPUT) {
            iface.inject_input(frame)
        } else if iface.has_fast_transmit(frame.link) {
            iface.fast_transmit(frame)
        } else {
            iface.transmit(frame)
        };
        result.map_err(TapError::from)
    }
}

/// Split a batch into its frames, validating every one of them.
fn split_batch<'a>(ctx: &WriteContext, data: &'a [u8]) -> Result<Vec<&'a [u8]>, TapError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let header = RecordHeader::decode(HeaderFormat::Plain, &data[offset..])
            .map_err(|_| TapError::InvalidArgument("malformed batch record header"))?;
        let start = offset + usize::from(header.hdrlen);
        let end = start + header.caplen as usize;
        let Some(frame) = data.get(start..end) else {
            return Err(TapError::InvalidArgument("batch record exceeds the write"));
        };
        ctx.check(frame)?;
        frames.push(frame);
        offset = word_align(end);
    }
    Ok(frames)
}

/// Write one frame, or a batch of frames in batch-write mode. Returns the number of bytes
/// consumed. Nothing is sent unless everything validates.
pub(crate) fn write(
    shared: &Shared,
    desc: &Arc<Descriptor>,
    data: &[u8],
) -> Result<usize, TapError> {
    let lease = desc.lease(LeaseKind::Write)?;
    let ctx = {
        let st = desc.state.lock();
        let Some(att) = st.binding.clone() else {
            return Err(TapError::NoSuchDevice);
        };
        let mtu = att.iface.mtu();
        let max = st
            .settings
            .write_max
            .unwrap_or(mtu.saturating_add(shared.config.write_leeway));
        WriteContext {
            att,
            flags: st.flags,
            traffic_class: st.settings.traffic_class,
            max: max as usize,
        }
    };

    if !ctx.att.iface.is_up() {
        return Err(TapError::NetworkDown);
    }
    if data.is_empty() {
        return Ok(0);
    }

    let frames = if ctx.flags.contains(TapFlags::BATCH_WRITE) {
        if data.len() < PLAIN_HEADER_LEN {
            return Err(TapError::InvalidArgument("batch shorter than a record header"));
        }
        split_batch(&ctx, data)?
    } else {
        ctx.check(data)?;
        vec![data]
    };

    let mut written = 0;
    let mut result = Ok(data.len());
    for frame in frames {
        if let Err(e) = ctx.send(ctx.build(frame.to_vec())) {
            debug!(target: TAP, "{}: write to {} failed: {e}", desc.minor, ctx.att.name);
            result = Err(e);
            break;
        }
        written += 1;
    }

    {
        let mut st = desc.state.lock();
        st.stats.written += written;
        if result.is_err() {
            st.stats.write_dropped += 1;
        }
    }
    drop(lease);
    result
}
