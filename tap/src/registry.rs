// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Interfaces, their attachments and the descriptors bound to them.
//!
//! All changes happen with the global lock held, then the lock of the descriptor being changed.
//! The capture path reads attachment lists lock-free.

use crate::TAP;
use crate::buffer::BufferRing;
use crate::capture::TapPoint;
use crate::descriptor::{CompressionStats, Descriptor, TapFlags};
use crate::error::TapError;
use crate::interface::NetInterface;
use crate::link::{LinkSpec, LinkType};
use crate::notify::wakeup;
use crate::record::HeaderSizes;
use crate::subsystem::Shared;
use crate::table::DeviceTable;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
#[allow(unused)]
use tracing::{debug, info, warn};

/// A link type of an interface, and the descriptors capturing from it.
pub(crate) struct Attachment {
    pub(crate) iface: Arc<dyn NetInterface>,
    pub(crate) name: String,
    pub(crate) link: LinkSpec,
    /// First link type of the interface.
    pub(crate) primary: bool,
    pub(crate) headers: HeaderSizes,
    /// All the link types of the interface.
    pub(crate) links: Arc<[LinkSpec]>,
    pub(crate) descriptors: ArcSwap<Vec<Arc<Descriptor>>>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("name", &self.name)
            .field("link", &self.link)
            .field("primary", &self.primary)
            .field("descriptors", &self.descriptors.load().len())
            .finish_non_exhaustive()
    }
}

impl Attachment {
    pub(crate) fn is_empty(&self) -> bool {
        self.descriptors.load().is_empty()
    }

    fn add(&self, desc: Arc<Descriptor>) {
        let mut list = Vec::clone(&self.descriptors.load());
        list.push(desc);
        self.descriptors.store(Arc::new(list));
    }

    /// Remove a descriptor. Returns true if it was the last one.
    fn remove(&self, desc: &Arc<Descriptor>) -> bool {
        let mut list = Vec::clone(&self.descriptors.load());
        let before = list.len();
        list.retain(|d| !Arc::ptr_eq(d, desc));
        let last = before > 0 && list.is_empty();
        self.descriptors.store(Arc::new(list));
        last
    }

    fn disable(&self) {
        debug!(target: TAP, "Disabling tap on {} ({})", self.name, self.link.link);
        if self.primary {
            self.iface.set_fast_tap(false);
        }
        self.iface.tap_disable(self.link.link);
    }
}

/// The attachments of a registered interface.
#[derive(Debug)]
pub(crate) struct InterfaceTaps {
    pub(crate) iface: Arc<dyn NetInterface>,
    pub(crate) attachments: Vec<Arc<Attachment>>,
}

impl InterfaceTaps {
    pub(crate) fn attachment(&self, link: LinkType) -> Option<&Arc<Attachment>> {
        self.attachments.iter().find(|a| a.link.link == link)
    }

    fn select(
        &self,
        link: Option<LinkType>,
        want_all: bool,
    ) -> Result<Arc<Attachment>, TapError> {
        match link {
            Some(link) => self
                .attachment(link)
                .cloned()
                .ok_or(TapError::InvalidArgument("link type not supported by interface")),
            None => self
                .attachments
                .iter()
                .find(|a| want_all || a.link.link != LinkType::PktAp)
                .cloned()
                .ok_or(TapError::InvalidArgument("interface has no default link type")),
        }
    }
}

/// State protected by the global lock.
#[derive(Debug)]
pub(crate) struct Registry {
    pub(crate) table: DeviceTable,
    pub(crate) interfaces: HashMap<String, Arc<InterfaceTaps>>,
}

impl Registry {
    pub(crate) fn new(devices: u32) -> Self {
        Self {
            table: DeviceTable::new(devices),
            interfaces: HashMap::new(),
        }
    }
}

/// Make an interface available for capture.
pub(crate) fn register_interface(
    shared: &Arc<Shared>,
    iface: Arc<dyn NetInterface>,
) -> Result<TapPoint, TapError> {
    let name = iface.name().to_owned();
    let links: Arc<[LinkSpec]> = iface.link_types().into();
    if links.is_empty() {
        return Err(TapError::InvalidArgument("interface has no link type"));
    }
    let attachments = links
        .iter()
        .enumerate()
        .map(|(i, link)| {
            Arc::new(Attachment {
                iface: iface.clone(),
                name: name.clone(),
                link: *link,
                primary: i == 0,
                headers: HeaderSizes::for_link_header(link.header_len),
                links: links.clone(),
                descriptors: ArcSwap::from_pointee(Vec::new()),
            })
        })
        .collect();
    let taps = Arc::new(InterfaceTaps { iface, attachments });

    let mut reg = shared.registry.lock();
    if reg.interfaces.contains_key(&name) {
        return Err(TapError::Busy);
    }
    reg.interfaces.insert(name.clone(), taps.clone());
    drop(reg);
    info!(target: TAP, "Registered interface {name} with {} link type(s)", links.len());
    Ok(TapPoint::new(taps, shared.clone()))
}

/// Withdraw an interface. Attached descriptors are flagged detached and their readers woken.
pub(crate) fn unregister_interface(shared: &Shared, name: &str) -> Result<(), TapError> {
    let mut reg = shared.registry.lock();
    let taps = reg.interfaces.remove(name).ok_or(TapError::NoSuchDevice)?;
    let mut promisc = 0;
    for att in &taps.attachments {
        let list = att.descriptors.swap(Arc::new(Vec::new()));
        if !list.is_empty() {
            att.disable();
        }
        for desc in list.iter() {
            let mut st = desc.state.lock();
            if st.binding.as_ref().is_some_and(|b| Arc::ptr_eq(b, att)) {
                st.binding = None;
            }
            st.flags.insert(TapFlags::DETACHED);
            if st.flags.contains(TapFlags::PROMISC) {
                st.flags.remove(TapFlags::PROMISC);
                promisc += 1;
            }
            wakeup(desc, &mut st);
        }
    }
    drop(reg);
    for _ in 0..promisc {
        if let Err(e) = taps.iface.set_promiscuous(false) {
            debug!(target: TAP, "Failed to turn off promiscuous mode on {name}: {e}");
        }
    }
    info!(target: TAP, "Unregistered interface {name}");
    Ok(())
}

/// Bind a descriptor to an interface, detaching it from its current attachment if any.
///
/// Captured data and counters are reset unless `preserve` is set. With `restore_promisc`,
/// promiscuous mode, if this descriptor had turned it on, is turned on again on the new
/// attachment.
pub(crate) fn bind(
    shared: &Shared,
    desc: &Arc<Descriptor>,
    name: &str,
    link: Option<LinkType>,
    preserve: bool,
    restore_promisc: bool,
) -> Result<(), TapError> {
    let reg = shared.registry.lock();
    let taps = reg
        .interfaces
        .get(name)
        .cloned()
        .ok_or(TapError::NoSuchDevice)?;

    let (att, old) = {
        let mut st = desc.state.lock();
        if st.closing() {
            return Err(TapError::NoSuchDevice);
        }
        let att = taps.select(link, st.flags.contains(TapFlags::WANT_CAPTURE_ALL))?;
        if st.buffers.is_none() {
            let compress = st.flags.contains(TapFlags::COMP_REQUESTED)
                && att.link.link != LinkType::PktAp;
            let prefix = compress.then_some(shared.config.max_compression_prefix);
            st.buffers = Some(BufferRing::new(st.settings.buffer_size as usize, prefix)?);
        }
        (att, st.binding.clone())
    };

    if let Some(old) = &old
        && Arc::ptr_eq(old, &att)
    {
        if !preserve {
            desc.state.lock().reset_capture();
        }
        return Ok(());
    }

    // the first descriptor enables the tap, before anything is committed
    let first = att.is_empty();
    if first {
        att.iface.tap_enable(att.link.link)?;
        if att.primary {
            att.iface.set_fast_tap(true);
        }
        debug!(target: TAP, "Enabled tap on {} ({})", att.name, att.link.link);
    }

    let promisc = {
        let mut st = desc.state.lock();
        if st.closing() {
            drop(st);
            if first {
                att.disable();
            }
            return Err(TapError::NoSuchDevice);
        }
        let old_emptied = old.as_ref().is_some_and(|old| old.remove(desc));
        att.add(desc.clone());
        st.binding = Some(att.clone());
        st.flags.remove(TapFlags::DETACHED | TapFlags::DETACHING);
        let compress = st.buffers.as_ref().is_some_and(BufferRing::compression);
        st.flags.set(TapFlags::COMP_ENABLED, compress);
        if !preserve {
            st.reset_capture();
            st.comp_stats = CompressionStats::default();
        }
        let promisc = old.is_some() && st.flags.contains(TapFlags::PROMISC);
        if promisc {
            st.flags.remove(TapFlags::PROMISC);
        }
        drop(st);
        if old_emptied && let Some(old) = &old {
            old.disable();
        }
        promisc
    };
    drop(reg);
    debug!(target: TAP, "{} bound to {} ({})", desc.minor, att.name, att.link.link);

    if promisc && let Some(old) = &old {
        if let Err(e) = old.iface.set_promiscuous(false) {
            warn!(target: TAP, "Failed to turn off promiscuous mode on {}: {e}", old.name);
        }
        if restore_promisc {
            match att.iface.set_promiscuous(true) {
                Ok(()) => desc.state.lock().flags.insert(TapFlags::PROMISC),
                Err(e) => {
                    warn!(target: TAP, "Promiscuous mode left off on {}: {e}", att.name);
                }
            }
        }
    }
    Ok(())
}

/// Detach a descriptor from its attachment, if any.
pub(crate) fn detach(shared: &Shared, desc: &Arc<Descriptor>) {
    let reg = shared.registry.lock();
    let (att, promisc) = {
        let mut st = desc.state.lock();
        st.flags.insert(TapFlags::DETACHING);
        let promisc = st.flags.contains(TapFlags::PROMISC);
        st.flags.remove(TapFlags::PROMISC);
        (st.binding.take(), promisc)
    };
    if let Some(att) = &att
        && att.remove(desc)
    {
        att.disable();
    }
    desc.state.lock().flags.remove(TapFlags::DETACHING);
    drop(reg);

    if let Some(att) = att {
        debug!(target: TAP, "{} detached from {} ({})", desc.minor, att.name, att.link.link);
        if promisc && let Err(e) = att.iface.set_promiscuous(false) {
            warn!(target: TAP, "Failed to turn off promiscuous mode on {}: {e}", att.name);
        }
    }
}
