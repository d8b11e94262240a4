// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Test doubles: a fake interface, trivial evaluators and frame builders.

#![allow(clippy::expect_used, clippy::missing_panics_doc)]

use crate::error::DriverError;
use crate::frame::OutboundFrame;
use crate::interface::NetInterface;
use crate::link::{LinkSpec, LinkType};
use etherparse::PacketBuilder;
use filter::{FilterEvaluator, Program, op};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Hardware address of fake interfaces.
pub const IFACE_MAC: [u8; 6] = [0x02, 0xca, 0xfe, 0x00, 0x00, 0x01];
/// Source address of generated frames.
pub const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
/// Destination address of generated frames.
pub const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

/// A call made by the tap subsystem to a [`FakeInterface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookCall {
    TapEnable(LinkType),
    TapDisable(LinkType),
    FastTap(bool),
    Promiscuous(bool),
}

/// Runs once, from inside a driver call.
pub struct Hook(Box<dyn FnOnce() + Send>);

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Hook")
    }
}

/// An interface that records what is done to it.
#[derive(Debug)]
pub struct FakeInterface {
    name: String,
    links: Vec<LinkSpec>,
    mtu: u32,
    mac: Option<[u8; 6]>,
    fast_path: bool,
    up: AtomicBool,
    fail_promisc: AtomicBool,
    fail_promisc_off: AtomicBool,
    on_promisc: Mutex<Option<Hook>>,
    fail_enable: AtomicBool,
    fail_transmit: AtomicBool,
    calls: Mutex<Vec<HookCall>>,
    transmitted: Mutex<Vec<OutboundFrame>>,
    fast_transmitted: Mutex<Vec<OutboundFrame>>,
    injected: Mutex<Vec<OutboundFrame>>,
}

impl FakeInterface {
    /// An Ethernet interface with a 1500 byte MTU.
    #[must_use]
    pub fn ethernet(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            links: vec![LinkSpec::ethernet()],
            mtu: 1500,
            mac: Some(IFACE_MAC),
            fast_path: false,
            up: AtomicBool::new(true),
            fail_promisc: AtomicBool::new(false),
            fail_promisc_off: AtomicBool::new(false),
            on_promisc: Mutex::new(None),
            fail_enable: AtomicBool::new(false),
            fail_transmit: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            transmitted: Mutex::new(Vec::new()),
            fast_transmitted: Mutex::new(Vec::new()),
            injected: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_links(mut self, links: Vec<LinkSpec>) -> Self {
        self.links = links;
        self
    }

    #[must_use]
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    #[must_use]
    pub fn with_mac(mut self, mac: Option<[u8; 6]>) -> Self {
        self.mac = mac;
        self
    }

    /// Offer a fast transmit path for every link type.
    #[must_use]
    pub fn with_fast_path(mut self) -> Self {
        self.fast_path = true;
        self
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn fail_promiscuous(&self, fail: bool) {
        self.fail_promisc.store(fail, Ordering::SeqCst);
    }

    pub fn fail_promiscuous_off(&self, fail: bool) {
        self.fail_promisc_off.store(fail, Ordering::SeqCst);
    }

    /// Run `hook` during the next call turning promiscuous mode on, before it returns.
    pub fn on_promiscuous(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_promisc.lock() = Some(Hook(Box::new(hook)));
    }

    pub fn fail_enable(&self, fail: bool) {
        self.fail_enable.store(fail, Ordering::SeqCst);
    }

    pub fn fail_transmit(&self, fail: bool) {
        self.fail_transmit.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn transmitted(&self) -> Vec<OutboundFrame> {
        self.transmitted.lock().clone()
    }

    #[must_use]
    pub fn fast_transmitted(&self) -> Vec<OutboundFrame> {
        self.fast_transmitted.lock().clone()
    }

    #[must_use]
    pub fn injected(&self) -> Vec<OutboundFrame> {
        self.injected.lock().clone()
    }

    fn send(
        &self,
        queue: &Mutex<Vec<OutboundFrame>>,
        frame: OutboundFrame,
    ) -> Result<(), DriverError> {
        if self.fail_transmit.load(Ordering::SeqCst) {
            return Err(DriverError::Failed("transmit failure".to_owned()));
        }
        queue.lock().push(frame);
        Ok(())
    }
}

impl NetInterface for FakeInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn link_types(&self) -> Vec<LinkSpec> {
        self.links.clone()
    }

    fn tap_enable(&self, link: LinkType) -> Result<(), DriverError> {
        if self.fail_enable.load(Ordering::SeqCst) {
            return Err(DriverError::Failed("enable failure".to_owned()));
        }
        self.calls.lock().push(HookCall::TapEnable(link));
        Ok(())
    }

    fn tap_disable(&self, link: LinkType) {
        self.calls.lock().push(HookCall::TapDisable(link));
    }

    fn set_fast_tap(&self, enabled: bool) {
        self.calls.lock().push(HookCall::FastTap(enabled));
    }

    fn set_promiscuous(&self, enabled: bool) -> Result<(), DriverError> {
        let fail = if enabled {
            &self.fail_promisc
        } else {
            &self.fail_promisc_off
        };
        if fail.load(Ordering::SeqCst) {
            return Err(DriverError::Failed("promiscuous failure".to_owned()));
        }
        self.calls.lock().push(HookCall::Promiscuous(enabled));
        if enabled {
            let hook = self.on_promisc.lock().take();
            if let Some(Hook(hook)) = hook {
                hook();
            }
        }
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn mac(&self) -> Option<[u8; 6]> {
        self.mac
    }

    fn transmit(&self, frame: OutboundFrame) -> Result<(), DriverError> {
        self.send(&self.transmitted, frame)
    }

    fn has_fast_transmit(&self, _link: LinkType) -> bool {
        self.fast_path
    }

    fn fast_transmit(&self, frame: OutboundFrame) -> Result<(), DriverError> {
        if !self.fast_path {
            return Err(DriverError::Unsupported);
        }
        self.send(&self.fast_transmitted, frame)
    }

    fn inject_input(&self, frame: OutboundFrame) -> Result<(), DriverError> {
        self.send(&self.injected, frame)
    }
}

/// Accepts every frame whole, whatever the program.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl FilterEvaluator for AcceptAll {
    fn evaluate(&self, _program: &Program, _frame: &[u8], _wire_len: usize) -> u32 {
        u32::MAX
    }
}

/// Accepts the first bytes of every frame, whatever the program.
#[derive(Debug, Clone, Copy)]
pub struct SnapLength(pub u32);

impl FilterEvaluator for SnapLength {
    fn evaluate(&self, _program: &Program, _frame: &[u8], _wire_len: usize) -> u32 {
        self.0
    }
}

/// Returns the constant of the first `ret k` instruction of the program, which is all a
/// program built with [`Program::accept`] does.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReturnConstant;

impl FilterEvaluator for ReturnConstant {
    fn evaluate(&self, program: &Program, _frame: &[u8], _wire_len: usize) -> u32 {
        program
            .instructions()
            .iter()
            .find(|insn| op::class(insn.code) == op::RET && op::rval(insn.code) == op::K)
            .map_or(0, |insn| insn.k)
    }
}

/// An Ethernet frame of `len` bytes with a local experimental ether type.
#[must_use]
pub fn ethernet_frame(len: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(len.max(14));
    frame.extend_from_slice(&DST_MAC);
    frame.extend_from_slice(&SRC_MAC);
    frame.extend_from_slice(&[0x88, 0xb5]);
    frame.extend((0..len.saturating_sub(14)).map(|i| u8::try_from(i % 251).unwrap_or_default()));
    frame.truncate(len.max(14));
    frame
}

/// An ARP request in an Ethernet frame.
#[must_use]
pub fn arp_frame() -> Vec<u8> {
    let mut frame = Vec::with_capacity(42);
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&SRC_MAC);
    frame.extend_from_slice(&[0x08, 0x06]);
    // ethernet, ipv4, request
    frame.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
    frame.extend_from_slice(&SRC_MAC);
    frame.extend_from_slice(&[192, 168, 1, 1]);
    frame.extend_from_slice(&[0; 6]);
    frame.extend_from_slice(&[192, 168, 1, 2]);
    frame
}

/// An ICMP echo request in an IPv4 Ethernet frame.
#[must_use]
pub fn ipv4_icmp_frame(payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4([192, 168, 1, 1], [192, 168, 1, 2], 64)
        .icmpv4_echo_request(1, 1);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).expect("icmp frame");
    frame
}

/// A UDP datagram in an IPv4 Ethernet frame.
#[must_use]
pub fn ipv4_udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4([192, 168, 1, 1], [192, 168, 1, 2], 64)
        .udp(src_port, dst_port);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).expect("udp frame");
    frame
}

/// A TCP segment in an IPv4 Ethernet frame.
#[must_use]
pub fn ipv4_tcp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4([192, 168, 1, 1], [192, 168, 1, 2], 64)
        .tcp(src_port, dst_port, 1, 65535);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).expect("tcp frame");
    frame
}

/// A UDP datagram in an IPv6 Ethernet frame.
#[must_use]
pub fn ipv6_udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv6(
            [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
            [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2],
            64,
        )
        .udp(src_port, dst_port);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).expect("udp frame");
    frame
}
