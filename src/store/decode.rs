/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Captured packet decoding.
//!
//! Packets arrive as raw IP datagrams. The IP and transport headers are
//! walked by hand to find the DNS payload, which hickory decodes; DNS over
//! TCP carries a two byte length prefix that is stripped first.

use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::serialize::binary::BinDecodable;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const TCP_MIN_HEADER_LEN: usize = 20;

/// Some connectivity probes send this as the UDP payload to a DNS server.
const UDP_PING_PREFIX: &[u8] = b"UDP PING";

/// A DNS message with the addresses of the datagram that carried it.
#[derive(Debug, Clone)]
pub struct DnsPacketInfo {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No IP header or no UDP/TCP payload.
    NoTransport,
    UdpPing,
    Malformed,
    NonQuery,
    NoQuestions,
}

#[derive(Debug)]
pub enum Decoded {
    Request(DnsPacketInfo),
    Response(DnsPacketInfo),
    Dropped(DropReason),
}

struct Transport<'a> {
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    segment: &'a [u8],
}

fn parse_ip(data: &[u8]) -> Option<Transport<'_>> {
    let version = data.first()? >> 4;
    match version {
        4 => {
            let ihl = usize::from(data[0] & 0x0f) * 4;
            if ihl < 20 || data.len() < ihl {
                return None;
            }
            let total = usize::from(u16::from_be_bytes([data[2], data[3]]));
            let end = if total >= ihl { total.min(data.len()) } else { data.len() };
            // Only the first fragment carries the transport header.
            let fragment_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1fff;
            if fragment_offset != 0 {
                return None;
            }
            Some(Transport {
                src: IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15])),
                dst: IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19])),
                protocol: data[9],
                segment: &data[ihl..end],
            })
        }
        6 => {
            if data.len() < IPV6_HEADER_LEN {
                return None;
            }
            let payload_len = usize::from(u16::from_be_bytes([data[4], data[5]]));
            let end = (IPV6_HEADER_LEN + payload_len).min(data.len());
            let src: [u8; 16] = data[8..24].try_into().ok()?;
            let dst: [u8; 16] = data[24..40].try_into().ok()?;
            Some(Transport {
                src: IpAddr::V6(Ipv6Addr::from(src)),
                dst: IpAddr::V6(Ipv6Addr::from(dst)),
                protocol: data[6],
                segment: &data[IPV6_HEADER_LEN..end],
            })
        }
        _ => None,
    }
}

fn transport_payload(protocol: u8, segment: &[u8]) -> Option<&[u8]> {
    match protocol {
        PROTO_UDP => segment.get(UDP_HEADER_LEN..),
        PROTO_TCP => {
            let offset = usize::from(*segment.get(12)? >> 4) * 4;
            if offset < TCP_MIN_HEADER_LEN {
                return None;
            }
            let payload = segment.get(offset..)?;
            if payload.len() >= 2 {
                let framed = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
                if framed == payload.len() - 2 {
                    return Some(&payload[2..]);
                }
            }
            Some(payload)
        }
        _ => None,
    }
}

/// Classify one captured IP packet.
pub fn decode_packet(data: &[u8]) -> Decoded {
    let Some(transport) = parse_ip(data) else {
        debug!("Ignoring packet with no IP header");
        return Decoded::Dropped(DropReason::NoTransport);
    };
    debug!(src = %transport.src, dst = %transport.dst, "decoding packet");

    let Some(payload) = transport_payload(transport.protocol, transport.segment) else {
        debug!("Ignoring packet with no transport layer");
        return Decoded::Dropped(DropReason::NoTransport);
    };

    if payload.starts_with(UDP_PING_PREFIX) {
        debug!("Ignoring UDP ping packet");
        return Decoded::Dropped(DropReason::UdpPing);
    }

    let message = match Message::from_bytes(payload) {
        Ok(message) => message,
        Err(e) => {
            debug!("Failed to decode DNS packet: {}", e);
            return Decoded::Dropped(DropReason::Malformed);
        }
    };
    if message.op_code() != OpCode::Query {
        debug!("Ignoring non-Query DNS packet");
        return Decoded::Dropped(DropReason::NonQuery);
    }

    let info = DnsPacketInfo {
        src: transport.src,
        dst: transport.dst,
        message,
    };
    match info.message.message_type() {
        MessageType::Query => Decoded::Request(info),
        MessageType::Response => {
            if info.message.queries().is_empty() {
                debug!("Ignoring DNS response with no questions");
                return Decoded::Dropped(DropReason::NoQuestions);
            }
            Decoded::Response(info)
        }
    }
}

/// Lowercase presentation form without the trailing root dot.
pub(crate) fn normalize_name(name: &hickory_proto::rr::Name) -> String {
    let ascii = name.to_ascii();
    ascii.strip_suffix('.').unwrap_or(&ascii).to_lowercase()
}

/// Wrap a DNS payload in IPv4 and UDP headers. Checksums are left zero.
#[cfg(test)]
pub(crate) fn ipv4_udp_packet(src: Ipv4Addr, dst: Ipv4Addr, dns: &[u8]) -> Vec<u8> {
    let total = 20 + UDP_HEADER_LEN + dns.len();
    let mut packet = Vec::with_capacity(total);
    packet.extend_from_slice(&[0x45, 0]);
    packet.extend_from_slice(&(total as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0, 64, PROTO_UDP, 0, 0]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    packet.extend_from_slice(&53u16.to_be_bytes());
    packet.extend_from_slice(&40000u16.to_be_bytes());
    packet.extend_from_slice(&((UDP_HEADER_LEN + dns.len()) as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(dns);
    packet
}
