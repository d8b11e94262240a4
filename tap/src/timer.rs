// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The read timer.
//!
//! Each descriptor gets a worker thread the first time its timer is armed. The worker sleeps
//! until the deadline of the armed timer, then moves the timer to [`TimerState::TimedOut`] and
//! wakes readers. Cancelling is just moving the timer back to idle: the worker notices when it
//! wakes up. The worker exits once the timer is drained at close.

use crate::TAP;
use crate::descriptor::{Descriptor, TapState, TimerState};
use crate::notify::notify_readers;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

fn run(desc: &Descriptor) {
    let mut st = desc.state.lock();
    loop {
        match (st.timer, st.timer_deadline) {
            (TimerState::Draining, _) => break,
            (TimerState::Waiting, Some(deadline)) => {
                if Instant::now() >= deadline {
                    st.timer = TimerState::TimedOut;
                    st.timer_deadline = None;
                    notify_readers(desc, &st);
                } else {
                    desc.timer_cond.wait_until(&mut st, deadline);
                }
            }
            _ => desc.timer_cond.wait(&mut st),
        }
    }
    debug!(target: TAP, "Read timer of {} drained", desc.minor);
}

/// Arm the read timer of a descriptor if it is idle and has a read timeout.
pub(crate) fn arm_timer(desc: &Arc<Descriptor>, st: &mut TapState) {
    let Some(timeout) = st.settings.read_timeout else {
        return;
    };
    if st.timer != TimerState::Idle {
        return;
    }
    let mut worker = desc.timer_worker.lock();
    if worker.is_none() {
        let runner = desc.clone();
        match std::thread::Builder::new()
            .name(format!("tap-timer-{}", desc.minor))
            .spawn(move || run(&runner))
        {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                warn!(target: TAP, "Failed to start read timer of {}: {e}", desc.minor);
                return;
            }
        }
    }
    st.timer = TimerState::Waiting;
    st.timer_deadline = Some(Instant::now() + timeout);
    desc.timer_cond.notify_all();
}

/// Drain the timer of a closing descriptor and wait for its worker to exit.
pub(crate) fn stop_timer(desc: &Descriptor) {
    {
        let mut st = desc.state.lock();
        st.timer = TimerState::Draining;
        st.timer_deadline = None;
        desc.timer_cond.notify_all();
    }
    let worker = desc.timer_worker.lock().take();
    if let Some(handle) = worker
        && handle.join().is_err()
    {
        warn!(target: TAP, "Read timer of {} panicked", desc.minor);
    }
}
