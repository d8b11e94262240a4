// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! What the tap subsystem needs from an interface driver.

use crate::error::DriverError;
use crate::frame::OutboundFrame;
use crate::link::{LinkSpec, LinkType};
use std::fmt::Debug;

/// An interface that frames can be captured from and written to.
///
/// Hooks are never called with the lock of a descriptor held. `tap_enable`, `tap_disable` and
/// `set_fast_tap` may be called with the subsystem-wide lock held and must not call back into
/// the subsystem. The other methods are called with no lock held.
pub trait NetInterface: Debug + Send + Sync {
    /// Name of the interface. Must be unique among registered interfaces.
    fn name(&self) -> &str;

    /// Supported link types. The first one is the primary link type of the interface.
    fn link_types(&self) -> Vec<LinkSpec>;

    /// Start delivering frames of the given link type to the tap subsystem.
    fn tap_enable(&self, link: LinkType) -> Result<(), DriverError>;

    /// Stop delivering frames of the given link type.
    fn tap_disable(&self, link: LinkType);

    /// Enable or disable delivery from the driver's fast path, for the primary link type.
    fn set_fast_tap(&self, _enabled: bool) {}

    fn set_promiscuous(&self, enabled: bool) -> Result<(), DriverError>;

    fn is_up(&self) -> bool;

    fn mtu(&self) -> u32;

    /// Hardware address, for link types that have one.
    fn mac(&self) -> Option<[u8; 6]>;

    /// Transmit through the generic output path.
    fn transmit(&self, frame: OutboundFrame) -> Result<(), DriverError>;

    /// Tell if [`NetInterface::fast_transmit`] is available for the given link type.
    fn has_fast_transmit(&self, _link: LinkType) -> bool {
        false
    }

    /// Transmit bypassing the generic output path.
    fn fast_transmit(&self, _frame: OutboundFrame) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    /// Hand a frame to the input path, as if it had been received.
    fn inject_input(&self, _frame: OutboundFrame) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }
}
