// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Readiness notification of readers.

use crate::descriptor::{Descriptor, TapFlags, TapState, TimerState};
use crate::table::ProcessId;
use crate::timer::arm_timer;
use crate::TAP;
use std::sync::Arc;
use tokio::sync::Notify;
#[allow(unused)]
use tracing::{debug, trace};

/// Delivers asynchronous signals to the owner of a descriptor.
pub trait SignalSink: Send + Sync {
    fn deliver(&self, owner: ProcessId, signal: u32);
}

impl<F> SignalSink for F
where
    F: Fn(ProcessId, u32) + Send + Sync,
{
    fn deliver(&self, owner: ProcessId, signal: u32) {
        self(owner, signal);
    }
}

/// Readiness of a descriptor, as reported by [`TapFile::poll`](crate::TapFile::poll).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// A read would not block.
    pub readable: bool,
    /// Bytes buffered, including those not yet readable.
    pub bytes: usize,
    /// The descriptor is closing or is not attached to an interface.
    pub hangup: bool,
}

/// Wake everybody waiting for data, without touching the timer.
pub(crate) fn notify_readers(desc: &Descriptor, st: &TapState) {
    desc.cond.notify_all();
    if st.flags.contains(TapFlags::EVENT_QUEUE) {
        desc.events.notify_one();
    }
    if st.flags.contains(TapFlags::ASYNC)
        && let Some(signals) = &desc.signals
    {
        trace!(target: TAP, "signal {} to {} for {}", st.settings.signal, desc.owner, desc.minor);
        signals.deliver(desc.owner, st.settings.signal);
    }
}

/// Data became available: cancel a pending timer and wake readers.
pub(crate) fn wakeup(desc: &Descriptor, st: &mut TapState) {
    if st.timer == TimerState::Waiting {
        st.timer = TimerState::Idle;
        st.timer_deadline = None;
    }
    notify_readers(desc, st);
}

fn readable(st: &TapState) -> bool {
    st.buffers.as_ref().is_some_and(|ring| {
        ring.has_hold()
            || (!ring.store().is_empty()
                && (st.flags.contains(TapFlags::IMMEDIATE) || st.timer == TimerState::TimedOut))
    })
}

/// Report readiness. If nothing is readable, arm the read timer so that buffered data
/// eventually becomes readable.
pub(crate) fn poll(desc: &Arc<Descriptor>) -> Readiness {
    let mut st = desc.state.lock();
    let hangup = st.closing() || st.binding.is_none();
    let readiness = Readiness {
        readable: readable(&st),
        bytes: st.buffers.as_ref().map_or(0, |ring| ring.available()),
        hangup,
    };
    if !readiness.readable && !hangup && st.settings.read_timeout.is_some() {
        arm_timer(desc, &mut st);
    }
    readiness
}

/// Register for event-queue style notification.
pub(crate) fn subscribe(desc: &Descriptor) -> Arc<Notify> {
    let mut st = desc.state.lock();
    st.flags.insert(TapFlags::EVENT_QUEUE);
    if readable(&st) {
        desc.events.notify_one();
    }
    desc.events.clone()
}
