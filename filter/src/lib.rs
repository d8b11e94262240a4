// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Storage and structural validation of classic packet filter programs.
//!
//! This crate does not execute programs: evaluation is delegated to an implementation of
//! [`FilterEvaluator`] supplied by the user of the tap subsystem.

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

use tracectl::trace_target;

pub mod eval;
pub mod insn;
pub mod program;

pub use eval::FilterEvaluator;
pub use insn::{INSTRUCTION_SIZE, Instruction, op};
pub use program::{MAX_INSTRUCTIONS, MEM_WORDS, Program, ProgramError};

/// Tracing target of this crate.
pub const FILTER: &str = "tapdev-filter";
trace_target!(FILTER, LevelFilter::INFO, &["tap"]);
