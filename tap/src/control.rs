// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Out-of-band configuration of a descriptor.

use crate::TAP;
use crate::buffer::BufferRing;
use crate::descriptor::{
    CompressionStats, Descriptor, LeaseKind, Settings, TapFlags, TapState, TapStats,
};
use crate::error::TapError;
use crate::link::{DirectionMask, LinkType, TimestampMode, TrafficClass};
use crate::registry::bind;
use crate::subsystem::Shared;
use filter::{Instruction, Program};
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Version of the capture record format, major part.
pub const VERSION_MAJOR: u16 = 1;
/// Version of the capture record format, minor part.
pub const VERSION_MINOR: u16 = 1;

/// Configuration commands.
///
/// Every command is validated before anything is changed: a failed command leaves the
/// descriptor as it was. Commands that change something wait for in-flight reads and writes on
/// the descriptor to complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    GetBufferSize,
    /// Set the size of the capture buffers. Clamped to the configured bounds; rejected once
    /// attached.
    SetBufferSize(u32),
    /// Install a filter, discarding buffered records. An empty program removes the filter.
    SetFilter(Vec<Instruction>),
    /// Install a filter, keeping buffered records.
    SetFilterNoReset(Vec<Instruction>),
    /// Discard buffered records and zero the capture counters.
    Flush,
    Promiscuous,
    GetLinkType,
    /// List the link types of the interface.
    ListLinkTypes,
    SetLinkType(LinkType),
    GetInterface,
    /// Attach to an interface, optionally with a given link type.
    SetInterface {
        name: String,
        link: Option<LinkType>,
    },
    GetReadTimeout,
    /// `None` or a zero duration blocks reads until data is available.
    SetReadTimeout(Option<Duration>),
    GetStats,
    GetImmediate,
    SetImmediate(bool),
    GetVersion,
    GetHeaderComplete,
    SetHeaderComplete(bool),
    GetDirection,
    SetDirection(DirectionMask),
    /// Tell if outbound frames are captured.
    GetSeeSent,
    SetSeeSent(bool),
    SetNonBlocking(bool),
    SetAsync(bool),
    GetSignal,
    SetSignal(u32),
    /// Bytes buffered, readable or not.
    BytesAvailable,
    GetExtendedHeader,
    SetExtendedHeader(bool),
    GetTruncate,
    SetTruncate(bool),
    GetHeadDrop,
    SetHeadDrop(bool),
    GetTrafficClass,
    SetTrafficClass(TrafficClass),
    GetBatchWrite,
    SetBatchWrite(bool),
    GetWriteMax,
    /// `None` or 0 caps writes at the interface MTU plus the configured leeway.
    SetWriteMax(Option<u32>),
    GetTimestampMode,
    SetTimestampMode(TimestampMode),
    GetHeaderCompression,
    /// Request header compression, effective at the next attach. Rejected once attached.
    SetHeaderCompression(bool),
    GetCompressionStats,
    GetDivertInput,
    SetDivertInput(bool),
    GetWantCaptureAll,
    SetWantCaptureAll(bool),
    /// Token identifying this descriptor to [`Control::Setup`].
    GetUuid,
    /// Take over the buffered records and the configuration of another descriptor of the same
    /// owner, then attach to an interface without losing them.
    Setup { from: Uuid, interface: String },
}

/// Replies to [`Control`] commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Done,
    Size(u32),
    Flag(bool),
    Link(LinkType),
    Links(Vec<LinkType>),
    Interface(String),
    Timeout(Option<Duration>),
    Stats(TapStats),
    Version { major: u16, minor: u16 },
    Direction(DirectionMask),
    Signal(u32),
    Available(usize),
    TrafficClass(TrafficClass),
    WriteMax(Option<u32>),
    Timestamp(TimestampMode),
    Compression(CompressionStats),
    Uuid(Uuid),
}

/// Largest signal number accepted.
const MAX_SIGNAL: u32 = 31;

fn flag(st: &TapState, flag: TapFlags) -> ControlReply {
    ControlReply::Flag(st.flags.contains(flag))
}

/// Run `f` holding a control lease and the lock of the descriptor.
fn mutate<F>(desc: &Descriptor, f: F) -> Result<ControlReply, TapError>
where
    F: FnOnce(&mut TapState) -> Result<ControlReply, TapError>,
{
    let lease = desc.lease(LeaseKind::Control)?;
    let mut st = desc.state.lock();
    let reply = if st.closing() {
        Err(TapError::NoSuchDevice)
    } else {
        f(&mut st)
    };
    drop(st);
    drop(lease);
    reply
}

fn set_flag(desc: &Descriptor, which: TapFlags, value: bool) -> Result<ControlReply, TapError> {
    mutate(desc, |st| {
        st.flags.set(which, value);
        Ok(ControlReply::Done)
    })
}

fn set_filter(
    shared: &Shared,
    desc: &Descriptor,
    insns: Vec<Instruction>,
    reset: bool,
) -> Result<ControlReply, TapError> {
    let program = if insns.is_empty() {
        None
    } else {
        Some(Program::with_limit(
            insns,
            shared.config.max_filter_instructions,
        )?)
    };
    mutate(desc, |st| {
        st.filter = program;
        if reset {
            st.reset_capture();
        }
        Ok(ControlReply::Done)
    })
}

fn promiscuous(desc: &Descriptor) -> Result<ControlReply, TapError> {
    let lease = desc.lease(LeaseKind::Control)?;
    let att = {
        let st = desc.state.lock();
        if st.flags.contains(TapFlags::PROMISC) {
            return Ok(ControlReply::Done);
        }
        st.binding.clone().ok_or(TapError::NoSuchDevice)?
    };
    // driver call with no lock held, the lease keeps reconfiguration out
    att.iface.set_promiscuous(true)?;
    let mut st = desc.state.lock();
    let still_bound = st
        .binding
        .as_ref()
        .is_some_and(|binding| Arc::ptr_eq(binding, &att));
    if still_bound {
        st.flags.insert(TapFlags::PROMISC);
    }
    drop(st);
    drop(lease);
    if !still_bound {
        if let Err(e) = att.iface.set_promiscuous(false) {
            warn!(target: TAP, "Failed to turn off promiscuous mode on {}: {e}", att.name);
        }
        return Err(TapError::NoSuchDevice);
    }
    Ok(ControlReply::Done)
}

fn set_interface(
    shared: &Shared,
    desc: &Arc<Descriptor>,
    name: &str,
    link: Option<LinkType>,
) -> Result<ControlReply, TapError> {
    let lease = desc.lease(LeaseKind::Control)?;
    let result = bind(shared, desc, name, link, false, false);
    drop(lease);
    result.map(|()| ControlReply::Done)
}

fn set_link_type(
    shared: &Shared,
    desc: &Arc<Descriptor>,
    link: LinkType,
) -> Result<ControlReply, TapError> {
    let lease = desc.lease(LeaseKind::Control)?;
    let att = desc.state.lock().binding.clone();
    let result = match att {
        None => Err(TapError::NoSuchDevice),
        Some(att) if att.link.link == link => Ok(()),
        Some(att) => bind(shared, desc, &att.name, Some(link), false, true),
    };
    drop(lease);
    result.map(|()| ControlReply::Done)
}

/// Take over the buffers and configuration of the descriptor identified by `from`.
fn setup(
    shared: &Shared,
    desc: &Arc<Descriptor>,
    from: Uuid,
    interface: &str,
) -> Result<ControlReply, TapError> {
    let source = shared
        .registry
        .lock()
        .table
        .find_by_uuid(from)
        .ok_or(TapError::NotFound)?;
    if Arc::ptr_eq(&source, desc) {
        return Err(TapError::InvalidArgument("cannot set up a descriptor from itself"));
    }
    if source.owner != desc.owner {
        return Err(TapError::PermissionDenied);
    }

    // both leases, in minor order
    let (first, second) = if source.minor < desc.minor {
        (&source, desc)
    } else {
        (desc, &source)
    };
    let first_lease = first.lease(LeaseKind::Control)?;
    let second_lease = second.lease(LeaseKind::Control)?;

    let result = take_over(shared, &source, desc, interface);

    drop(second_lease);
    drop(first_lease);
    result.map(|()| ControlReply::Done)
}

/// Lock the states of two descriptors in minor order, returning them as `(a, b)`.
fn lock_pair<'a>(
    a: &'a Descriptor,
    b: &'a Descriptor,
) -> (MutexGuard<'a, TapState>, MutexGuard<'a, TapState>) {
    if a.minor < b.minor {
        let first = a.state.lock();
        (first, b.state.lock())
    } else {
        let first = b.state.lock();
        (a.state.lock(), first)
    }
}

/// What the target of a take-over had before, to put back if attaching fails.
struct Prior {
    flags: TapFlags,
    settings: Settings,
    buffers: Option<BufferRing>,
    /// The source's buffers were moved to the target.
    moved: bool,
}

fn take_over(
    shared: &Shared,
    source: &Arc<Descriptor>,
    desc: &Arc<Descriptor>,
    interface: &str,
) -> Result<(), TapError> {
    if !shared.registry.lock().interfaces.contains_key(interface) {
        return Err(TapError::NoSuchDevice);
    }
    let prior = {
        let (mut src, mut dst) = lock_pair(source, desc);
        if src.closing() || dst.closing() {
            return Err(TapError::NoSuchDevice);
        }
        if dst.binding.is_some() {
            return Err(TapError::InvalidArgument("target descriptor already attached"));
        }
        if src.settings.buffer_size != dst.settings.buffer_size {
            return Err(TapError::InvalidArgument("buffer sizes differ"));
        }
        let size = src.settings.buffer_size as usize;

        // a bound source keeps capturing into fresh buffers
        let replacement = match &src.buffers {
            Some(ring) if src.binding.is_some() => {
                let prefix = ring
                    .compression()
                    .then_some(shared.config.max_compression_prefix);
                Some(BufferRing::new(size, prefix)?)
            }
            _ => None,
        };
        let moved = std::mem::replace(&mut src.buffers, replacement);
        let prior = Prior {
            flags: dst.flags,
            settings: dst.settings,
            moved: moved.is_some(),
            buffers: std::mem::replace(&mut dst.buffers, moved),
        };

        let carried = TapFlags::HEAD_DROP
            | TapFlags::EXTENDED_HEADER
            | TapFlags::TRUNCATE
            | TapFlags::IMMEDIATE
            | TapFlags::COMP_REQUESTED
            | TapFlags::HEADER_COMPLETE
            | TapFlags::BATCH_WRITE;
        dst.flags = (dst.flags - carried) | (src.flags & carried);
        dst.settings.direction = src.settings.direction;
        dst.settings.timestamps = src.settings.timestamps;
        dst.settings.traffic_class = src.settings.traffic_class;
        prior
    };

    if let Err(e) = bind(shared, desc, interface, None, true, false) {
        let (mut src, mut dst) = lock_pair(source, desc);
        if prior.moved {
            // records captured by a bound source in the meantime are lost
            src.buffers = dst.buffers.take();
        }
        dst.buffers = prior.buffers;
        dst.flags = prior.flags;
        dst.settings = prior.settings;
        drop(dst);
        drop(src);
        debug!(target: TAP, "{} failed to set up from {}: {e}", desc.minor, source.minor);
        return Err(e);
    }
    info!(target: TAP, "{} set up from {}", desc.minor, source.minor);
    Ok(())
}

/// Execute a control command on a descriptor.
#[allow(clippy::too_many_lines)]
pub(crate) fn control(
    shared: &Shared,
    desc: &Arc<Descriptor>,
    cmd: Control,
) -> Result<ControlReply, TapError> {
    debug!(target: TAP, "{}: {cmd:?}", desc.minor);
    let get = move || desc.state.lock();
    match cmd {
        Control::GetBufferSize => Ok(ControlReply::Size(get().settings.buffer_size)),
        Control::SetBufferSize(size) => {
            let size = shared.config.clamp_buffer_size(size);
            mutate(desc, |st| {
                if st.binding.is_some() {
                    return Err(TapError::InvalidArgument(
                        "buffer size cannot change once attached",
                    ));
                }
                st.settings.buffer_size = size;
                st.buffers = None;
                Ok(ControlReply::Size(size))
            })
        }
        Control::SetFilter(insns) => set_filter(shared, desc, insns, true),
        Control::SetFilterNoReset(insns) => set_filter(shared, desc, insns, false),
        Control::Flush => mutate(desc, |st| {
            st.reset_capture();
            Ok(ControlReply::Done)
        }),
        Control::Promiscuous => promiscuous(desc),
        Control::GetLinkType => get()
            .binding
            .as_ref()
            .map(|att| ControlReply::Link(att.link.link))
            .ok_or(TapError::NoSuchDevice),
        Control::ListLinkTypes => {
            let st = get();
            let att = st.binding.as_ref().ok_or(TapError::NoSuchDevice)?;
            let want_all = st.flags.contains(TapFlags::WANT_CAPTURE_ALL);
            Ok(ControlReply::Links(
                att.links
                    .iter()
                    .map(|spec| spec.link)
                    .filter(|link| want_all || *link != LinkType::PktAp)
                    .collect(),
            ))
        }
        Control::SetLinkType(link) => set_link_type(shared, desc, link),
        Control::GetInterface => get()
            .binding
            .as_ref()
            .map(|att| ControlReply::Interface(att.name.clone()))
            .ok_or(TapError::NoSuchDevice),
        Control::SetInterface { name, link } => set_interface(shared, desc, &name, link),
        Control::GetReadTimeout => Ok(ControlReply::Timeout(get().settings.read_timeout)),
        Control::SetReadTimeout(timeout) => mutate(desc, |st| {
            st.settings.read_timeout = timeout.filter(|t| !t.is_zero());
            Ok(ControlReply::Done)
        }),
        Control::GetStats => Ok(ControlReply::Stats(get().stats)),
        Control::GetImmediate => Ok(flag(&get(), TapFlags::IMMEDIATE)),
        Control::SetImmediate(on) => set_flag(desc, TapFlags::IMMEDIATE, on),
        Control::GetVersion => Ok(ControlReply::Version {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
        }),
        Control::GetHeaderComplete => Ok(flag(&get(), TapFlags::HEADER_COMPLETE)),
        Control::SetHeaderComplete(on) => mutate(desc, |st| {
            if !on && st.flags.contains(TapFlags::BATCH_WRITE) {
                return Err(TapError::InvalidArgument(
                    "batch write requires complete headers",
                ));
            }
            st.flags.set(TapFlags::HEADER_COMPLETE, on);
            Ok(ControlReply::Done)
        }),
        Control::GetDirection => Ok(ControlReply::Direction(get().settings.direction)),
        Control::SetDirection(mask) => mutate(desc, |st| {
            st.settings.direction = mask;
            Ok(ControlReply::Done)
        }),
        Control::GetSeeSent => Ok(ControlReply::Flag(
            get().settings.direction.contains(DirectionMask::OUT),
        )),
        Control::SetSeeSent(on) => mutate(desc, |st| {
            st.settings.direction.set(DirectionMask::OUT, on);
            st.settings.direction.insert(DirectionMask::IN);
            Ok(ControlReply::Done)
        }),
        Control::SetNonBlocking(on) => set_flag(desc, TapFlags::NON_BLOCKING, on),
        Control::SetAsync(on) => set_flag(desc, TapFlags::ASYNC, on),
        Control::GetSignal => Ok(ControlReply::Signal(get().settings.signal)),
        Control::SetSignal(signal) => {
            if signal == 0 || signal > MAX_SIGNAL {
                return Err(TapError::InvalidArgument("invalid signal number"));
            }
            mutate(desc, |st| {
                st.settings.signal = signal;
                Ok(ControlReply::Done)
            })
        }
        Control::BytesAvailable => Ok(ControlReply::Available(
            get().buffers.as_ref().map_or(0, BufferRing::available),
        )),
        Control::GetExtendedHeader => Ok(flag(&get(), TapFlags::EXTENDED_HEADER)),
        Control::SetExtendedHeader(on) => mutate(desc, |st| {
            if st.flags.contains(TapFlags::EXTENDED_HEADER) != on {
                st.flags.set(TapFlags::EXTENDED_HEADER, on);
                // records of both formats must not share a buffer
                if let Some(ring) = &mut st.buffers {
                    ring.reset();
                }
            }
            Ok(ControlReply::Done)
        }),
        Control::GetTruncate => Ok(flag(&get(), TapFlags::TRUNCATE)),
        Control::SetTruncate(on) => set_flag(desc, TapFlags::TRUNCATE, on),
        Control::GetHeadDrop => Ok(flag(&get(), TapFlags::HEAD_DROP)),
        Control::SetHeadDrop(on) => set_flag(desc, TapFlags::HEAD_DROP, on),
        Control::GetTrafficClass => {
            Ok(ControlReply::TrafficClass(get().settings.traffic_class))
        }
        Control::SetTrafficClass(class) => mutate(desc, |st| {
            if class != TrafficClass::BestEffort && st.flags.contains(TapFlags::BATCH_WRITE) {
                return Err(TapError::InvalidArgument(
                    "traffic class cannot be set in batch write mode",
                ));
            }
            st.settings.traffic_class = class;
            Ok(ControlReply::Done)
        }),
        Control::GetBatchWrite => Ok(flag(&get(), TapFlags::BATCH_WRITE)),
        Control::SetBatchWrite(on) => mutate(desc, |st| {
            if on {
                if !st.flags.contains(TapFlags::HEADER_COMPLETE) {
                    return Err(TapError::InvalidArgument(
                        "batch write requires complete headers",
                    ));
                }
                if st.settings.traffic_class != TrafficClass::BestEffort {
                    return Err(TapError::InvalidArgument(
                        "batch write requires the default traffic class",
                    ));
                }
            }
            st.flags.set(TapFlags::BATCH_WRITE, on);
            Ok(ControlReply::Done)
        }),
        Control::GetWriteMax => Ok(ControlReply::WriteMax(get().settings.write_max)),
        Control::SetWriteMax(max) => mutate(desc, |st| {
            st.settings.write_max = max.filter(|m| *m != 0);
            Ok(ControlReply::Done)
        }),
        Control::GetTimestampMode => Ok(ControlReply::Timestamp(get().settings.timestamps)),
        Control::SetTimestampMode(mode) => mutate(desc, |st| {
            st.settings.timestamps = mode;
            Ok(ControlReply::Done)
        }),
        Control::GetHeaderCompression => {
            let st = get();
            let which = if st.binding.is_some() {
                TapFlags::COMP_ENABLED
            } else {
                TapFlags::COMP_REQUESTED
            };
            Ok(flag(&st, which))
        }
        Control::SetHeaderCompression(on) => mutate(desc, |st| {
            if st.binding.is_some() {
                return Err(TapError::InvalidArgument(
                    "header compression cannot change once attached",
                ));
            }
            if st.flags.contains(TapFlags::COMP_REQUESTED) != on {
                st.flags.set(TapFlags::COMP_REQUESTED, on);
                st.buffers = None;
            }
            Ok(ControlReply::Done)
        }),
        Control::GetCompressionStats => Ok(ControlReply::Compression(get().comp_stats)),
        Control::GetDivertInput => Ok(flag(&get(), TapFlags::DIVERT_INPUT)),
        Control::SetDivertInput(on) => set_flag(desc, TapFlags::DIVERT_INPUT, on),
        Control::GetWantCaptureAll => Ok(flag(&get(), TapFlags::WANT_CAPTURE_ALL)),
        Control::SetWantCaptureAll(on) => set_flag(desc, TapFlags::WANT_CAPTURE_ALL, on),
        Control::GetUuid => Ok(ControlReply::Uuid(desc.uuid)),
        Control::Setup { from, interface } => setup(shared, desc, from, &interface),
    }
}
