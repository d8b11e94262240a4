// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The tap subsystem and the handles of open descriptors.

use crate::TAP;
use crate::capture::TapPoint;
use crate::config::{ConfigError, TapConfig};
use crate::control::{Control, ControlReply, control};
use crate::descriptor::{Descriptor, TapFlags};
use crate::error::TapError;
use crate::interface::NetInterface;
use crate::io::{read, write};
use crate::notify::{Readiness, SignalSink, poll, subscribe, wakeup};
use crate::record::RecordFinalizer;
use crate::registry::{Registry, detach, register_interface, unregister_interface};
use crate::table::{Minor, ProcessId, Slot};
use crate::timer::stop_timer;
use filter::FilterEvaluator;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Notify;
#[allow(unused)]
use tracing::{debug, info, warn};
use uuid::Uuid;

/// State shared by the subsystem, the handles of open descriptors and the tap points.
pub(crate) struct Shared {
    pub(crate) config: TapConfig,
    /// The global lock.
    pub(crate) registry: Mutex<Registry>,
    /// Signalled when an opener is done growing the device table.
    pub(crate) grown: Condvar,
    pub(crate) evaluator: Arc<dyn FilterEvaluator>,
    pub(crate) signals: Option<Arc<dyn SignalSink>>,
    pub(crate) finalizer: Option<Arc<dyn RecordFinalizer>>,
    /// Origin of monotonic timestamps.
    pub(crate) epoch: Instant,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Builder of a [`TapSubsystem`].
pub struct TapSubsystemBuilder {
    config: TapConfig,
    evaluator: Arc<dyn FilterEvaluator>,
    signals: Option<Arc<dyn SignalSink>>,
    finalizer: Option<Arc<dyn RecordFinalizer>>,
}

impl TapSubsystemBuilder {
    #[must_use]
    pub fn config(mut self, config: TapConfig) -> Self {
        self.config = config;
        self
    }

    /// Deliver signals to the owners of descriptors in async mode.
    #[must_use]
    pub fn signals(mut self, signals: impl SignalSink + 'static) -> Self {
        self.signals = Some(Arc::new(signals));
        self
    }

    /// Complete extended record headers when they are read.
    #[must_use]
    pub fn finalizer(mut self, finalizer: impl RecordFinalizer + 'static) -> Self {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    /// Validate the configuration and build the subsystem.
    pub fn build(self) -> Result<TapSubsystem, ConfigError> {
        self.config.validate()?;
        let registry = Registry::new(self.config.initial_devices);
        debug!(target: TAP, "Starting tap subsystem: {:?}", self.config);
        Ok(TapSubsystem {
            shared: Arc::new(Shared {
                config: self.config,
                registry: Mutex::new(registry),
                grown: Condvar::new(),
                evaluator: self.evaluator,
                signals: self.signals,
                finalizer: self.finalizer,
                epoch: Instant::now(),
            }),
        })
    }
}

/// The tap subsystem: a table of devices that open into descriptors capturing from, and
/// writing to, registered interfaces.
#[derive(Debug, Clone)]
pub struct TapSubsystem {
    shared: Arc<Shared>,
}

impl TapSubsystem {
    /// Start building a subsystem that runs filter programs with `evaluator`.
    #[must_use]
    pub fn builder(evaluator: impl FilterEvaluator + 'static) -> TapSubsystemBuilder {
        TapSubsystemBuilder {
            config: TapConfig::default(),
            evaluator: Arc::new(evaluator),
            signals: None,
            finalizer: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TapConfig {
        &self.shared.config
    }

    /// Number of device slots.
    #[must_use]
    pub fn devices(&self) -> u32 {
        self.shared.registry.lock().table.len()
    }

    /// Number of open descriptors.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.shared.registry.lock().table.open_count()
    }

    /// Open device `minor`.
    ///
    /// Opening the last device slot grows the table, up to the configured maximum. Openers of
    /// slots past the end wait for a growth in progress.
    pub fn open(&self, minor: Minor, owner: ProcessId) -> Result<TapFile, TapError> {
        let shared = &self.shared;
        let config = &shared.config;

        let mut reg = shared.registry.lock();
        while minor.0 >= reg.table.len() && reg.table.growing {
            shared.grown.wait(&mut reg);
        }
        reg.table.reserve(minor)?;
        let grow = !reg.table.growing && reg.table.needs_growth(minor, config.max_devices);
        let len = reg.table.len();
        if grow {
            reg.table.growing = true;
        }
        drop(reg);

        let desc = Arc::new(Descriptor::new(
            minor,
            owner,
            config.default_buffer_size,
            shared.signals.clone(),
        ));
        let slots: Vec<Slot> = if grow {
            let added = config.device_increment.min(config.max_devices - len);
            (0..added).map(|_| Slot::Empty).collect()
        } else {
            Vec::new()
        };

        let mut reg = shared.registry.lock();
        if grow {
            reg.table.extend(slots);
            reg.table.growing = false;
            shared.grown.notify_all();
            debug!(target: TAP, "Device table grown to {} slots", reg.table.len());
        }
        reg.table.publish(minor, desc.clone());
        drop(reg);

        info!(target: TAP, "Opened {minor} for {owner} ({})", desc.uuid);
        Ok(TapFile {
            shared: shared.clone(),
            desc,
            closed: AtomicBool::new(false),
        })
    }

    /// Open the first free device.
    pub fn open_any(&self, owner: ProcessId) -> Result<TapFile, TapError> {
        loop {
            let minor = self
                .shared
                .registry
                .lock()
                .table
                .first_empty()
                .ok_or(TapError::Busy)?;
            match self.open(minor, owner) {
                // raced with another opener
                Err(TapError::Busy) => {}
                result => return result,
            }
        }
    }

    /// Close device `minor`. Closing a device that is not open does nothing.
    pub fn close(&self, minor: Minor) {
        close(&self.shared, minor, None);
    }

    fn descriptor(&self, minor: Minor) -> Result<Arc<Descriptor>, TapError> {
        self.shared
            .registry
            .lock()
            .table
            .descriptor(minor)
            .ok_or(TapError::NoSuchDevice)
    }

    /// See [`TapFile::read`].
    pub fn read(&self, minor: Minor, out: &mut [u8]) -> Result<usize, TapError> {
        read(&self.shared, &self.descriptor(minor)?, out)
    }

    /// See [`TapFile::write`].
    pub fn write(&self, minor: Minor, data: &[u8]) -> Result<usize, TapError> {
        write(&self.shared, &self.descriptor(minor)?, data)
    }

    /// See [`TapFile::control`].
    pub fn control(&self, minor: Minor, cmd: Control) -> Result<ControlReply, TapError> {
        control(&self.shared, &self.descriptor(minor)?, cmd)
    }

    /// See [`TapFile::poll`].
    pub fn poll(&self, minor: Minor) -> Result<Readiness, TapError> {
        let desc = self.descriptor(minor)?;
        Ok(poll(&desc))
    }

    /// See [`TapFile::interrupt`].
    pub fn interrupt(&self, minor: Minor) -> Result<(), TapError> {
        let desc = self.descriptor(minor)?;
        interrupt(&desc);
        Ok(())
    }

    /// Make an interface available for capture. The returned [`TapPoint`] is how the interface
    /// hands its frames over.
    pub fn register_interface(&self, iface: Arc<dyn NetInterface>) -> Result<TapPoint, TapError> {
        register_interface(&self.shared, iface)
    }

    /// Withdraw an interface. Descriptors attached to it are detached and their blocked
    /// readers fail with [`TapError::NoSuchDevice`].
    pub fn unregister_interface(&self, name: &str) -> Result<(), TapError> {
        unregister_interface(&self.shared, name)
    }
}

fn interrupt(desc: &Descriptor) {
    desc.state.lock().interrupt = true;
    desc.cond.notify_all();
}

/// Close the descriptor in slot `minor`, if it is open and, when given, is `expected`.
fn close(shared: &Shared, minor: Minor, expected: Option<&Arc<Descriptor>>) {
    let Some(desc) = shared.registry.lock().table.begin_close(minor, expected) else {
        return;
    };

    {
        let mut st = desc.state.lock();
        st.flags.insert(TapFlags::CLOSING);
        wakeup(&desc, &mut st);
        while st.busy.any() {
            desc.cond.wait(&mut st);
        }
    }
    stop_timer(&desc);
    detach(shared, &desc);
    {
        let mut st = desc.state.lock();
        st.buffers = None;
        st.filter = None;
    }

    shared.registry.lock().table.finish_close(minor);
    info!(target: TAP, "Closed {minor}");
}

/// An open descriptor. Dropping it closes the descriptor.
///
/// All operations may be called concurrently from several threads.
pub struct TapFile {
    shared: Arc<Shared>,
    desc: Arc<Descriptor>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapFile")
            .field("minor", &self.desc.minor)
            .field("uuid", &self.desc.uuid)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TapFile {
    #[must_use]
    pub fn minor(&self) -> Minor {
        self.desc.minor
    }

    #[must_use]
    pub fn owner(&self) -> ProcessId {
        self.desc.owner
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.desc.uuid
    }

    /// Read the oldest batch of captured records. `out` must be exactly as large as the capture
    /// buffers.
    ///
    /// Blocks until records are available, unless in immediate or non-blocking mode, or until
    /// the read timeout expires, in which case 0 is returned.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, TapError> {
        read(&self.shared, &self.desc, out)
    }

    /// Send a frame, or a batch of frames in batch-write mode, through the interface the
    /// descriptor is attached to.
    pub fn write(&self, data: &[u8]) -> Result<usize, TapError> {
        write(&self.shared, &self.desc, data)
    }

    pub fn control(&self, cmd: Control) -> Result<ControlReply, TapError> {
        control(&self.shared, &self.desc, cmd)
    }

    /// Report readiness for reading. Arms the read timer if nothing is readable yet.
    #[must_use]
    pub fn poll(&self) -> Readiness {
        poll(&self.desc)
    }

    /// Get notified each time records become readable.
    #[must_use]
    pub fn subscribe(&self) -> Arc<Notify> {
        subscribe(&self.desc)
    }

    /// Interrupt a blocked read, which fails with [`TapError::Interrupted`]. If no read is
    /// blocked, the next read that would block is interrupted.
    pub fn interrupt(&self) {
        interrupt(&self.desc);
    }

    /// Close the descriptor. Closing twice does nothing.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            close(&self.shared, self.desc.minor, Some(&self.desc));
        }
    }

    #[cfg(test)]
    pub(crate) fn descriptor(&self) -> &Arc<Descriptor> {
        &self.desc
    }
}

impl Drop for TapFile {
    fn drop(&mut self) {
        self.close();
    }
}
