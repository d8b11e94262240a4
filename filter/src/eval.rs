// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The seam through which validated programs get executed.

use crate::program::Program;

/// Runs a filter program over a frame.
///
/// The return value is the number of bytes of the frame to capture: 0 rejects the frame and
/// values larger than the frame mean "all of it". Evaluators are pure functions and are called
/// concurrently from every thread that delivers frames.
pub trait FilterEvaluator: Send + Sync {
    /// Evaluate `program` over `frame`, the contiguous bytes available to the filter, of a
    /// packet that was `wire_len` bytes long on the wire.
    fn evaluate(&self, program: &Program, frame: &[u8], wire_len: usize) -> u32;
}

impl<F> FilterEvaluator for F
where
    F: Fn(&Program, &[u8], usize) -> u32 + Send + Sync,
{
    fn evaluate(&self, program: &Program, frame: &[u8], wire_len: usize) -> u32 {
        self(program, frame, wire_len)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test {
    use super::*;

    #[test]
    fn closures_are_evaluators() {
        let evaluator = |_: &Program, frame: &[u8], _: usize| {
            u32::try_from(frame.len() / 2).unwrap_or(u32::MAX)
        };
        let program = Program::accept(u32::MAX);
        assert_eq!(evaluator.evaluate(&program, &[0u8; 10], 10), 5);
    }
}
