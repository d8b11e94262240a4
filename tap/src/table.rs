// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Device table: the slots descriptors are opened in.

use crate::descriptor::Descriptor;
use crate::error::TapError;
use std::fmt::Display;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of a device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Minor(pub u32);

impl Display for Minor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tap{}", self.0)
    }
}

/// Identifier of the process owning a descriptor.
pub type ProcessId = u32;

/// Why a slot is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reservation {
    Opening,
    Closing,
}

#[derive(Debug)]
pub(crate) enum Slot {
    Empty,
    Reserved(Reservation),
    Open(Arc<Descriptor>),
}

#[derive(Debug)]
pub(crate) struct DeviceTable {
    slots: Vec<Slot>,
    /// An opener is adding slots, with the global lock dropped.
    pub(crate) growing: bool,
}

impl DeviceTable {
    pub(crate) fn new(size: u32) -> Self {
        Self {
            slots: (0..size).map(|_| Slot::Empty).collect(),
            growing: false,
        }
    }

    pub(crate) fn len(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    fn slot(&self, minor: Minor) -> Option<&Slot> {
        self.slots.get(minor.0 as usize)
    }

    fn slot_mut(&mut self, minor: Minor) -> Option<&mut Slot> {
        self.slots.get_mut(minor.0 as usize)
    }

    /// Reserve an empty slot for opening.
    pub(crate) fn reserve(&mut self, minor: Minor) -> Result<(), TapError> {
        let slot = self.slot_mut(minor).ok_or(TapError::NotFound)?;
        if !matches!(slot, Slot::Empty) {
            return Err(TapError::Busy);
        }
        *slot = Slot::Reserved(Reservation::Opening);
        Ok(())
    }

    /// Publish a descriptor in a slot reserved for opening.
    pub(crate) fn publish(&mut self, minor: Minor, desc: Arc<Descriptor>) {
        if let Some(slot) = self.slot_mut(minor)
            && matches!(slot, Slot::Reserved(Reservation::Opening))
        {
            *slot = Slot::Open(desc);
        }
    }

    /// Move an open slot to closing, returning its descriptor. If `expected` is given, the slot
    /// must hold that very descriptor.
    pub(crate) fn begin_close(
        &mut self,
        minor: Minor,
        expected: Option<&Arc<Descriptor>>,
    ) -> Option<Arc<Descriptor>> {
        let slot = self.slot_mut(minor)?;
        let Slot::Open(desc) = slot else {
            return None;
        };
        if expected.is_some_and(|e| !Arc::ptr_eq(e, desc)) {
            return None;
        }
        let desc = desc.clone();
        *slot = Slot::Reserved(Reservation::Closing);
        Some(desc)
    }

    pub(crate) fn finish_close(&mut self, minor: Minor) {
        if let Some(slot) = self.slot_mut(minor)
            && matches!(slot, Slot::Reserved(Reservation::Closing))
        {
            *slot = Slot::Empty;
        }
    }

    /// Tell if opening `minor` must grow the table: it is the last slot and there is room.
    pub(crate) fn needs_growth(&self, minor: Minor, max: u32) -> bool {
        minor.0 + 1 == self.len() && self.len() < max
    }

    /// Append slots allocated with the global lock dropped.
    pub(crate) fn extend(&mut self, slots: Vec<Slot>) {
        self.slots.extend(slots);
    }

    pub(crate) fn descriptor(&self, minor: Minor) -> Option<Arc<Descriptor>> {
        match self.slot(minor)? {
            Slot::Open(desc) => Some(desc.clone()),
            Slot::Empty | Slot::Reserved(_) => None,
        }
    }

    pub(crate) fn find_by_uuid(&self, uuid: Uuid) -> Option<Arc<Descriptor>> {
        self.slots.iter().find_map(|slot| match slot {
            Slot::Open(desc) if desc.uuid == uuid => Some(desc.clone()),
            _ => None,
        })
    }

    pub(crate) fn first_empty(&self) -> Option<Minor> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Empty))
            .and_then(|i| u32::try_from(i).ok())
            .map(Minor)
    }

    pub(crate) fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Open(_)))
            .count()
    }
}
