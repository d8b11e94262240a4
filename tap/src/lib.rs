// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Packet capture taps.
//!
//! Readers open tap devices, attach them to registered interfaces, install filter programs and
//! read batches of captured records. They may also write frames out through the interface they
//! are attached to. Interfaces hand their traffic over through a [`TapPoint`], which never
//! blocks: what cannot be buffered is dropped and counted.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

use tracectl::trace_target;

mod buffer;
mod capture;
pub mod config;
pub mod control;
mod descriptor;
pub mod error;
pub mod frame;
pub mod interface;
mod io;
pub mod link;
mod notify;
pub mod record;
mod registry;
mod subsystem;
mod table;
mod timer;
pub mod truncate;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


// re-exports
pub use capture::TapPoint;
pub use config::{ConfigError, TapConfig};
pub use control::{Control, ControlReply};
pub use descriptor::{CompressionStats, DEFAULT_SIGNAL, TapStats};
pub use error::{DriverError, TapError};
pub use filter::{FilterEvaluator, Instruction, Program};
pub use frame::{Frame, FrameMeta, OutboundFrame, PacketHints};
pub use interface::NetInterface;
pub use link::{Cast, Direction, DirectionMask, LinkSpec, LinkType, TimestampMode, TrafficClass};
pub use notify::{Readiness, SignalSink};
pub use record::{HeaderFormat, Reassembler, Record, RecordFinalizer, RecordHeader, Records};
pub use subsystem::{TapFile, TapSubsystem, TapSubsystemBuilder};
pub use table::{Minor, ProcessId};

/// Tracing target of this crate.
pub const TAP: &str = "tapdev";
trace_target!(TAP, LevelFilter::INFO, &["tap"]);
