// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-open tap state.

use crate::buffer::{BufferRing, CaptureBuffer};
use crate::error::TapError;
use crate::link::{DirectionMask, TimestampMode, TrafficClass};
use crate::notify::SignalSink;
use crate::registry::Attachment;
use crate::table::{Minor, ProcessId};
use bitflags::bitflags;
use filter::Program;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

bitflags! {
    /// Boolean state and options of a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TapFlags: u32 {
        /// Close in progress. Every operation but close fails.
        const CLOSING = 1 << 0;
        /// Being detached from its attachment.
        const DETACHING = 1 << 1;
        /// The interface it was attached to went away.
        const DETACHED = 1 << 2;
        const EXTENDED_HEADER = 1 << 3;
        const TRUNCATE = 1 << 4;
        const BATCH_WRITE = 1 << 5;
        /// Header compression asked for. Takes effect at the next attach.
        const COMP_REQUESTED = 1 << 6;
        /// Header compression in effect for the current buffers.
        const COMP_ENABLED = 1 << 7;
        /// Written frames are injected as input instead of being transmitted.
        const DIVERT_INPUT = 1 << 8;
        /// A readiness subscriber exists.
        const EVENT_QUEUE = 1 << 9;
        /// Written frames carry a complete link header.
        const HEADER_COMPLETE = 1 << 10;
        const IMMEDIATE = 1 << 11;
        const HEAD_DROP = 1 << 12;
        /// The capture-all link type may be selected by default.
        const WANT_CAPTURE_ALL = 1 << 13;
        const NON_BLOCKING = 1 << 14;
        /// Deliver a signal to the owner when data becomes available.
        const ASYNC = 1 << 15;
        /// This descriptor turned promiscuous mode on.
        const PROMISC = 1 << 16;
    }
}

/// State of the read timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerState {
    #[default]
    Idle,
    /// Armed by a blocking read or a poll that found no data.
    Waiting,
    /// Fired. Observed and reset by the next read.
    TimedOut,
    /// The descriptor is closing: the timer worker must exit.
    Draining,
}

/// Cumulative counters of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TapStats {
    /// Frames seen on the attachment, in a matching direction.
    pub received: u64,
    /// Frames accepted by the filter that could not be buffered, or were discarded to make room.
    pub dropped: u64,
    /// Frames accepted by the filter.
    pub captured: u64,
    pub written: u64,
    pub write_dropped: u64,
}

/// Counters of header compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressionStats {
    pub total_records: u64,
    pub compressed_records: u64,
    /// Bytes not stored thanks to compression.
    pub total_prefix_bytes: u64,
    pub total_header_bytes: u64,
    pub max_prefix: u16,
}

impl CompressionStats {
    pub(crate) fn account(&mut self, hdrlen: u16, complen: u16) {
        self.total_records += 1;
        self.total_header_bytes += u64::from(hdrlen);
        if complen > 0 {
            self.compressed_records += 1;
            self.total_prefix_bytes += u64::from(complen);
            self.max_prefix = self.max_prefix.max(complen);
        }
    }
}

/// Scalar settings of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) buffer_size: u32,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) traffic_class: TrafficClass,
    pub(crate) direction: DirectionMask,
    pub(crate) write_max: Option<u32>,
    pub(crate) timestamps: TimestampMode,
    pub(crate) signal: u32,
}

/// Signal delivered by default in async mode.
pub const DEFAULT_SIGNAL: u32 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Busy {
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) control: bool,
}

impl Busy {
    pub(crate) fn any(self) -> bool {
        self.read || self.write || self.control
    }
}

/// Everything about a descriptor that changes, protected by its lock.
pub(crate) struct TapState {
    pub(crate) flags: TapFlags,
    pub(crate) settings: Settings,
    pub(crate) filter: Option<Program>,
    pub(crate) buffers: Option<BufferRing>,
    pub(crate) binding: Option<Arc<Attachment>>,
    pub(crate) timer: TimerState,
    pub(crate) timer_deadline: Option<Instant>,
    pub(crate) busy: Busy,
    /// Set by an interrupt, consumed by the next sleeping read.
    pub(crate) interrupt: bool,
    pub(crate) stats: TapStats,
    pub(crate) comp_stats: CompressionStats,
}

impl TapState {
    pub(crate) fn closing(&self) -> bool {
        self.flags.contains(TapFlags::CLOSING)
    }

    /// Discard buffered records and zero the capture counters.
    pub(crate) fn reset_capture(&mut self) {
        if let Some(ring) = &mut self.buffers {
            ring.reset();
        }
        self.stats.received = 0;
        self.stats.dropped = 0;
        self.stats.captured = 0;
    }
}

/// An open tap.
pub(crate) struct Descriptor {
    pub(crate) minor: Minor,
    pub(crate) owner: ProcessId,
    pub(crate) uuid: Uuid,
    pub(crate) state: Mutex<TapState>,
    /// Signalled when data may be available and when a lease is released.
    pub(crate) cond: Condvar,
    /// Signalled when the timer gets armed or drained.
    pub(crate) timer_cond: Condvar,
    pub(crate) timer_worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) events: Arc<Notify>,
    pub(crate) signals: Option<Arc<dyn SignalSink>>,
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("minor", &self.minor)
            .field("owner", &self.owner)
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

impl Descriptor {
    pub(crate) fn new(
        minor: Minor,
        owner: ProcessId,
        buffer_size: u32,
        signals: Option<Arc<dyn SignalSink>>,
    ) -> Self {
        let state = TapState {
            flags: TapFlags::empty(),
            settings: Settings {
                buffer_size,
                read_timeout: None,
                traffic_class: TrafficClass::default(),
                direction: DirectionMask::BOTH,
                write_max: None,
                timestamps: TimestampMode::default(),
                signal: DEFAULT_SIGNAL,
            },
            filter: None,
            buffers: None,
            binding: None,
            timer: TimerState::Idle,
            timer_deadline: None,
            busy: Busy::default(),
            interrupt: false,
            stats: TapStats::default(),
            comp_stats: CompressionStats::default(),
        };
        Self {
            minor,
            owner,
            uuid: Uuid::new_v4(),
            state: Mutex::new(state),
            cond: Condvar::new(),
            timer_cond: Condvar::new(),
            timer_worker: Mutex::new(None),
            events: Arc::new(Notify::new()),
            signals,
        }
    }

    /// Take a lease of the given kind, waiting for conflicting leases to be released.
    pub(crate) fn lease(&self, kind: LeaseKind) -> Result<Lease<'_>, TapError> {
        let mut st = self.state.lock();
        Lease::acquire(self, kind, &mut st)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaseKind {
    /// Draining the hold buffer.
    Read,
    /// Sending frames.
    Write,
    /// Reconfiguring. Excludes everything else.
    Control,
}

impl LeaseKind {
    fn admissible(self, busy: Busy) -> bool {
        match self {
            LeaseKind::Read => !busy.read && !busy.control,
            LeaseKind::Write => !busy.write && !busy.control,
            LeaseKind::Control => !busy.any(),
        }
    }

    fn set(self, busy: &mut Busy, value: bool) {
        match self {
            LeaseKind::Read => busy.read = value,
            LeaseKind::Write => busy.write = value,
            LeaseKind::Control => busy.control = value,
        }
    }
}

/// Exclusive right to perform one kind of operation on a descriptor, released on drop.
///
/// A read lease may carry the hold buffer, lent for copy-out; it is handed back to the
/// descriptor as its free buffer on release.
///
/// The lock of the descriptor must not be held when a lease is dropped.
pub(crate) struct Lease<'a> {
    desc: &'a Descriptor,
    kind: LeaseKind,
    pub(crate) lent: Option<CaptureBuffer>,
}

impl<'a> Lease<'a> {
    /// Take a lease with the descriptor already locked. Fails if the descriptor is closing.
    pub(crate) fn acquire(
        desc: &'a Descriptor,
        kind: LeaseKind,
        st: &mut MutexGuard<'_, TapState>,
    ) -> Result<Self, TapError> {
        loop {
            if st.closing() {
                return Err(TapError::NoSuchDevice);
            }
            if kind.admissible(st.busy) {
                break;
            }
            desc.cond.wait(st);
        }
        kind.set(&mut st.busy, true);
        Ok(Self {
            desc,
            kind,
            lent: None,
        })
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut st = self.desc.state.lock();
        self.kind.set(&mut st.busy, false);
        if let Some(buffer) = self.lent.take()
            && let Some(ring) = &mut st.buffers
        {
            ring.restore_free(buffer);
        }
        drop(st);
        self.desc.cond.notify_all();
    }
}
