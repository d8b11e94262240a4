// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link types, directions and the other per-frame scalars.

use bitflags::bitflags;
use std::fmt::Display;

/// Data link type of the frames delivered through an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    /// Loopback with a 4 byte host-order protocol family header.
    Null,
    Ethernet,
    /// Raw IP, no link header.
    Raw,
    /// Loopback with a 4 byte network-order protocol family header.
    Loopback,
    /// Per-packet metadata followed by the frame, available on every interface.
    PktAp,
    Other(u32),
}

impl LinkType {
    /// The numeric data link type.
    #[must_use]
    pub fn dlt(self) -> u32 {
        match self {
            LinkType::Null => 0,
            LinkType::Ethernet => 1,
            LinkType::Raw => 12,
            LinkType::Loopback => 108,
            LinkType::PktAp => 149,
            LinkType::Other(dlt) => dlt,
        }
    }

    /// Build from the numeric data link type.
    #[must_use]
    pub fn from_dlt(dlt: u32) -> Self {
        match dlt {
            0 => LinkType::Null,
            1 => LinkType::Ethernet,
            12 => LinkType::Raw,
            108 => LinkType::Loopback,
            149 => LinkType::PktAp,
            other => LinkType::Other(other),
        }
    }
}

impl Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkType::Null => write!(f, "null"),
            LinkType::Ethernet => write!(f, "ethernet"),
            LinkType::Raw => write!(f, "raw"),
            LinkType::Loopback => write!(f, "loopback"),
            LinkType::PktAp => write!(f, "pktap"),
            LinkType::Other(dlt) => write!(f, "dlt-{dlt}"),
        }
    }
}

/// A link type supported by an interface, along with the length of its link header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkSpec {
    pub link: LinkType,
    pub header_len: u32,
}

impl LinkSpec {
    #[must_use]
    pub const fn new(link: LinkType, header_len: u32) -> Self {
        Self { link, header_len }
    }
    #[must_use]
    pub const fn ethernet() -> Self {
        Self::new(LinkType::Ethernet, 14)
    }
    #[must_use]
    pub const fn raw() -> Self {
        Self::new(LinkType::Raw, 0)
    }
    #[must_use]
    pub const fn pktap() -> Self {
        Self::new(LinkType::PktAp, 0)
    }
}

/// The direction a frame traveled through an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

bitflags! {
    /// Set of directions a descriptor captures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirectionMask: u8 {
        const IN = 0b01;
        const OUT = 0b10;
        const BOTH = Self::IN.bits() | Self::OUT.bits();
    }
}

impl DirectionMask {
    /// Tell if frames traveling in `direction` are captured.
    #[must_use]
    pub fn admits(self, direction: Direction) -> bool {
        match direction {
            Direction::In => self.contains(DirectionMask::IN),
            Direction::Out => self.contains(DirectionMask::OUT),
        }
    }
}

/// Service class attached to written frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum TrafficClass {
    #[default]
    BestEffort = 0,
    BackgroundSystem = 100,
    Background = 200,
    ResponsiveData = 300,
    OperationsAdmin = 400,
    MultimediaAv = 500,
    ResponsiveAv = 600,
    Video = 700,
    Voice = 800,
    Control = 900,
}

impl TryFrom<u32> for TrafficClass {
    type Error = u32;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => TrafficClass::BestEffort,
            100 => TrafficClass::BackgroundSystem,
            200 => TrafficClass::Background,
            300 => TrafficClass::ResponsiveData,
            400 => TrafficClass::OperationsAdmin,
            500 => TrafficClass::MultimediaAv,
            600 => TrafficClass::ResponsiveAv,
            700 => TrafficClass::Video,
            800 => TrafficClass::Voice,
            900 => TrafficClass::Control,
            other => return Err(other),
        })
    }
}

/// How record timestamps are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    /// Wall clock.
    #[default]
    Realtime,
    /// Time elapsed since the subsystem was created.
    Monotonic,
    /// All zeros.
    Disabled,
}

/// Destination class of a written frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cast {
    Unicast,
    Broadcast,
    Multicast,
}
