// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Header-only capture.
//!
//! With truncation enabled, frames are cut right after their headers, except for protocols whose
//! payload is mostly control data (address resolution, ICMP, DNS, DHCP, name services), which are
//! kept whole.

use crate::link::{LinkSpec, LinkType};
use etherparse::{
    EtherType, Ethernet2Header, IpNumber, Ipv4Header, Ipv6Header, TcpHeader, UdpHeader,
};

/// UDP ports whose datagrams are captured whole.
const FULL_UDP_PORTS: [u16; 9] = [53, 67, 68, 137, 138, 546, 547, 5353, 5355];

/// TCP ports whose segments are captured whole.
const FULL_TCP_PORTS: [u16; 1] = [53];

enum Keep {
    Full,
    Bytes(usize),
}

fn transport(protocol: IpNumber, ip_header_len: usize, rest: &[u8]) -> Keep {
    if protocol == IpNumber::ICMP || protocol == IpNumber::IPV6_ICMP {
        Keep::Full
    } else if protocol == IpNumber::UDP {
        match UdpHeader::from_slice(rest) {
            Ok((udp, _)) => {
                if FULL_UDP_PORTS.contains(&udp.source_port)
                    || FULL_UDP_PORTS.contains(&udp.destination_port)
                {
                    Keep::Full
                } else {
                    Keep::Bytes(ip_header_len + UdpHeader::LEN)
                }
            }
            Err(_) => Keep::Bytes(ip_header_len),
        }
    } else if protocol == IpNumber::TCP {
        match TcpHeader::from_slice(rest) {
            Ok((tcp, _)) => {
                if FULL_TCP_PORTS.contains(&tcp.source_port)
                    || FULL_TCP_PORTS.contains(&tcp.destination_port)
                {
                    Keep::Full
                } else {
                    Keep::Bytes(ip_header_len + tcp.header_len())
                }
            }
            Err(_) => Keep::Bytes(ip_header_len),
        }
    } else {
        Keep::Bytes(ip_header_len)
    }
}

fn network(packet: &[u8]) -> Option<Keep> {
    match packet.first()? >> 4 {
        4 => {
            let (ip, rest) = Ipv4Header::from_slice(packet).ok()?;
            Some(transport(ip.protocol, ip.header_len(), rest))
        }
        6 => {
            let (ip, rest) = Ipv6Header::from_slice(packet).ok()?;
            Some(transport(ip.next_header, Ipv6Header::LEN, rest))
        }
        _ => None,
    }
}

/// Number of leading bytes of `frame` worth capturing.
#[must_use]
pub fn truncated_len(link: LinkSpec, frame: &[u8]) -> usize {
    let link_header_len = (link.header_len as usize).min(frame.len());
    let keep = match link.link {
        LinkType::Ethernet => match Ethernet2Header::from_slice(frame) {
            Ok((eth, _)) if eth.ether_type == EtherType::ARP => Some(Keep::Full),
            Ok((eth, rest))
                if eth.ether_type == EtherType::IPV4 || eth.ether_type == EtherType::IPV6 =>
            {
                network(rest)
            }
            _ => None,
        },
        LinkType::Raw => network(frame),
        LinkType::Null | LinkType::Loopback => network(&frame[link_header_len..]),
        LinkType::PktAp | LinkType::Other(_) => None,
    };
    match keep {
        Some(Keep::Full) => frame.len(),
        Some(Keep::Bytes(n)) => (link_header_len + n).min(frame.len()),
        None => link_header_len,
    }
}
