// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Frames as seen by the tap subsystem.

use crate::link::{Cast, Direction, LinkType, TrafficClass};
use bitflags::bitflags;

bitflags! {
    /// Hints about a packet, reported in extended record headers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketHints: u32 {
        const RETRANSMIT = 0x01;
        const KEEPALIVE = 0x02;
        const NEW_FLOW = 0x04;
        const LAST_PACKET = 0x08;
        const WAKE = 0x10;
    }
}

/// Metadata about a frame, reported in extended record headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMeta {
    pub service_class: u32,
    pub flow_id: u32,
    pub hints: PacketHints,
    /// Process the frame is attributed to, if known when the frame is captured.
    pub pid: Option<u32>,
}

/// A frame handed to the capture path.
///
/// `data` holds the contiguous bytes available for filtering and copy, which may be a prefix of
/// a packet that was `wire_len` bytes long.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub wire_len: usize,
    pub direction: Direction,
    pub meta: FrameMeta,
}

impl<'a> Frame<'a> {
    #[must_use]
    pub fn new(data: &'a [u8], direction: Direction) -> Self {
        Self {
            data,
            wire_len: data.len(),
            direction,
            meta: FrameMeta::default(),
        }
    }

    #[must_use]
    pub fn with_wire_len(mut self, wire_len: usize) -> Self {
        self.wire_len = wire_len.max(self.data.len());
        self
    }

    #[must_use]
    pub fn with_meta(mut self, meta: FrameMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// A frame handed to an interface driver for transmission or injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub link: LinkType,
    pub data: Vec<u8>,
    pub cast: Cast,
    pub traffic_class: TrafficClass,
}
