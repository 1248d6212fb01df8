//! Packet parsing and building using smoltcp
//!
//! This module derives the canonical `FlowMatch` from raw frames and builds
//! the frames the router emits itself (ARP, ICMP echo replies and ICMP
//! destination-unreachable errors).

use std::net::Ipv4Addr;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4DstUnreachable, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpProtocol,
    Ipv4Packet, Ipv4Repr, TcpPacket, UdpPacket,
};

use crate::flow::{
    ETH_TYPE_ARP, ETH_TYPE_IPV4, FlowMatch, IP_PROTO_ICMP, IP_PROTO_TCP, IP_PROTO_UDP,
};

/// Ethernet header size
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// ARP packet size (for Ethernet + IPv4)
pub const ARP_PACKET_SIZE: usize = 28;

/// IPv4 header size without options
pub const IPV4_HEADER_SIZE: usize = 20;

/// Bytes of the offending datagram's payload quoted in ICMP errors
const ICMP_ERROR_QUOTE_LEN: usize = 8;

/// TTL for packets generated by the router
const GENERATED_HOP_LIMIT: u8 = 64;

/// Reason carried in a generated ICMP destination-unreachable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableCode {
    /// No route to the destination network
    Net,
    /// Next hop could not be reached
    Host,
    /// Dropped by a REJECT route or rule
    FilterProhibited,
}

impl From<UnreachableCode> for Icmpv4DstUnreachable {
    fn from(code: UnreachableCode) -> Self {
        match code {
            UnreachableCode::Net => Icmpv4DstUnreachable::NetUnreachable,
            UnreachableCode::Host => Icmpv4DstUnreachable::HostUnreachable,
            UnreachableCode::FilterProhibited => Icmpv4DstUnreachable::CommProhibited,
        }
    }
}

/// Parse an Ethernet frame
pub fn parse_ethernet(data: &[u8]) -> Option<EthernetFrame<&[u8]>> {
    EthernetFrame::new_checked(data).ok()
}

/// Parse an ARP packet from Ethernet payload
pub fn parse_arp(data: &[u8]) -> Option<ArpRepr> {
    let packet = ArpPacket::new_checked(data).ok()?;
    ArpRepr::parse(&packet).ok()
}

/// Derive the exact switch match for a frame received on `in_port`.
///
/// Returns `None` if the Ethernet header is truncated, or if an IPv4 or ARP
/// frame carries a header too malformed to describe. Any other ethertype
/// yields an L2-only match.
pub fn flow_match(data: &[u8], in_port: u16) -> Option<FlowMatch> {
    let frame = parse_ethernet(data)?;
    let dl_type: u16 = frame.ethertype().into();
    let mut m = FlowMatch::l2(in_port, frame.src_addr().0, frame.dst_addr().0, dl_type);

    match dl_type {
        ETH_TYPE_IPV4 => {
            // An unreadable IPv4 header leaves the L2-only match.
            if let Some((ip, payload)) = split_ipv4(frame.payload()) {
                let proto: u8 = ip.next_header().into();
                m.nw_tos = Some((ip.dscp() << 2) | ip.ecn());
                m.nw_proto = Some(proto);
                m.nw_src = Some(Ipv4Addr::from(ip.src_addr()));
                m.nw_dst = Some(Ipv4Addr::from(ip.dst_addr()));

                // Only the first fragment carries the transport header.
                if ip.frag_offset() == 0 {
                    let (tp_src, tp_dst) = transport_fields(proto, payload);
                    m.tp_src = tp_src;
                    m.tp_dst = tp_dst;
                }
            }
        }
        ETH_TYPE_ARP => {
            let packet = ArpPacket::new_checked(frame.payload()).ok()?;
            let ArpRepr::EthernetIpv4 {
                operation,
                source_protocol_addr,
                target_protocol_addr,
                ..
            } = ArpRepr::parse(&packet).ok()?
            else {
                return None;
            };
            let op: u16 = operation.into();
            m.nw_proto = Some(op as u8);
            m.nw_src = Some(Ipv4Addr::from(source_protocol_addr));
            m.nw_dst = Some(Ipv4Addr::from(target_protocol_addr));
        }
        _ => {}
    }

    Some(m)
}

/// IPv4 header and the captured part of its payload.
///
/// Switches usually hand up only the first bytes of a buffered packet, so
/// only the header has to be complete. The payload is cut at the datagram's
/// total length or the end of the capture, whichever comes first.
fn split_ipv4(data: &[u8]) -> Option<(Ipv4Packet<&[u8]>, &[u8])> {
    if data.len() < IPV4_HEADER_SIZE {
        return None;
    }
    let ip = Ipv4Packet::new_unchecked(data);
    let header_len = ip.header_len() as usize;
    if ip.version() != 4 || header_len < IPV4_HEADER_SIZE || header_len > data.len() {
        return None;
    }
    let end = (ip.total_len() as usize).clamp(header_len, data.len());
    Some((ip, &data[header_len..end]))
}

/// Ports (ICMP: type and code) from the first bytes of an L4 header.
fn transport_fields(proto: u8, payload: &[u8]) -> (Option<u16>, Option<u16>) {
    if payload.len() < 4 {
        return (None, None);
    }
    match proto {
        IP_PROTO_UDP => {
            let udp = UdpPacket::new_unchecked(payload);
            (Some(udp.src_port()), Some(udp.dst_port()))
        }
        IP_PROTO_TCP => {
            let tcp = TcpPacket::new_unchecked(payload);
            (Some(tcp.src_port()), Some(tcp.dst_port()))
        }
        IP_PROTO_ICMP => {
            let icmp = Icmpv4Packet::new_unchecked(payload);
            let msg_type: u8 = icmp.msg_type().into();
            (Some(msg_type as u16), Some(icmp.msg_code() as u16))
        }
        _ => (None, None),
    }
}

/// Build an Ethernet frame with the given payload
pub fn build_ethernet_frame(
    dst_mac: EthernetAddress,
    src_mac: EthernetAddress,
    ethertype: EthernetProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype,
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

fn build_arp(repr: ArpRepr, dst_mac: EthernetAddress, src_mac: EthernetAddress) -> Vec<u8> {
    let mut payload = vec![0u8; repr.buffer_len()];
    let mut packet = ArpPacket::new_unchecked(&mut payload);
    repr.emit(&mut packet);
    build_ethernet_frame(dst_mac, src_mac, EthernetProtocol::Arp, &payload)
}

/// Build a broadcast ARP request asking who has `target_ip`.
pub fn build_arp_request_frame(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let sender = EthernetAddress(sender_mac);
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: sender,
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: target_ip,
    };
    build_arp(repr, EthernetAddress::BROADCAST, sender)
}

/// Build a complete ARP reply Ethernet frame
pub fn build_arp_reply_frame(
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_mac: [u8; 6],
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: EthernetAddress(sender_mac),
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress(target_mac),
        target_protocol_addr: target_ip,
    };
    build_arp(repr, EthernetAddress(target_mac), EthernetAddress(sender_mac))
}

/// Whether an ICMP error may be generated in response to `frame`.
///
/// Errors are never sent about ICMP errors, non-initial fragments, or
/// packets addressed to or from broadcast/multicast addresses.
pub fn can_send_icmp_error(frame: &[u8]) -> bool {
    let Some(eth) = parse_ethernet(frame) else {
        return false;
    };
    if eth.ethertype() != EthernetProtocol::Ipv4 || !eth.dst_addr().is_unicast() {
        return false;
    }
    let Some((ip, payload)) = split_ipv4(eth.payload()) else {
        return false;
    };
    let src = Ipv4Addr::from(ip.src_addr());
    let dst = Ipv4Addr::from(ip.dst_addr());
    if dst.is_broadcast() || dst.is_multicast() {
        return false;
    }
    if src.is_unspecified() || src.is_broadcast() || src.is_multicast() {
        return false;
    }
    if ip.frag_offset() != 0 {
        return false;
    }
    if ip.next_header() == IpProtocol::Icmp {
        if payload.is_empty() {
            return false;
        }
        let icmp = Icmpv4Packet::new_unchecked(payload);
        return matches!(
            icmp.msg_type(),
            Icmpv4Message::EchoRequest | Icmpv4Message::EchoReply
        );
    }
    true
}

/// Build an ICMP destination-unreachable error about `original`.
///
/// The error is addressed back to the original sender, from `src_ip` and
/// `src_mac` (the router port that refuses the packet). Returns `None` if
/// `original` has no readable IPv4 header. A truncated capture is quoted as
/// far as it goes.
pub fn build_icmp_unreachable(
    original: &[u8],
    src_mac: [u8; 6],
    src_ip: Ipv4Addr,
    code: UnreachableCode,
) -> Option<Vec<u8>> {
    let eth = parse_ethernet(original)?;
    let (ip, payload) = split_ipv4(eth.payload())?;

    let header_len = ip.header_len() as usize;
    let quote_len = header_len + payload.len().min(ICMP_ERROR_QUOTE_LEN);
    let quoted = &eth.payload()[..quote_len];

    let icmp_len = 8 + quoted.len();
    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: ip.src_addr(),
        next_header: IpProtocol::Icmp,
        payload_len: icmp_len,
        hop_limit: GENERATED_HOP_LIMIT,
    };

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(src_mac),
        dst_addr: eth.src_addr(),
        ethertype: EthernetProtocol::Ipv4,
    };

    let mut reply = vec![0u8; ETHERNET_HEADER_SIZE + ip_repr.buffer_len() + icmp_len];
    let mut out_eth = EthernetFrame::new_unchecked(&mut reply[..]);
    eth_repr.emit(&mut out_eth);

    let mut out_ip = Ipv4Packet::new_unchecked(out_eth.payload_mut());
    ip_repr.emit(&mut out_ip, &ChecksumCapabilities::default());

    let mut out_icmp = Icmpv4Packet::new_unchecked(out_ip.payload_mut());
    out_icmp.set_msg_type(Icmpv4Message::DstUnreachable);
    out_icmp.set_msg_code(Icmpv4DstUnreachable::from(code).into());
    out_icmp.data_mut()[..quoted.len()].copy_from_slice(quoted);
    out_icmp.fill_checksum();

    Some(reply)
}

/// Build an ICMP echo reply for an echo request addressed to the router.
///
/// Returns `None` unless `request` is an IPv4 ICMP echo request.
pub fn build_icmp_echo_reply(request: &[u8], src_mac: [u8; 6]) -> Option<Vec<u8>> {
    let eth = parse_ethernet(request)?;
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != IpProtocol::Icmp {
        return None;
    }
    let icmp = Icmpv4Packet::new_checked(ip.payload()).ok()?;
    if icmp.msg_type() != Icmpv4Message::EchoRequest {
        return None;
    }

    let icmp_repr = Icmpv4Repr::EchoReply {
        ident: icmp.echo_ident(),
        seq_no: icmp.echo_seq_no(),
        data: icmp.data(),
    };

    let ip_repr = Ipv4Repr {
        src_addr: ip.dst_addr(),
        dst_addr: ip.src_addr(),
        next_header: IpProtocol::Icmp,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: GENERATED_HOP_LIMIT,
    };

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(src_mac),
        dst_addr: eth.src_addr(),
        ethertype: EthernetProtocol::Ipv4,
    };

    let mut reply =
        vec![0u8; ETHERNET_HEADER_SIZE + ip_repr.buffer_len() + icmp_repr.buffer_len()];
    let mut out_eth = EthernetFrame::new_unchecked(&mut reply[..]);
    eth_repr.emit(&mut out_eth);

    let mut out_ip = Ipv4Packet::new_unchecked(out_eth.payload_mut());
    ip_repr.emit(&mut out_ip, &ChecksumCapabilities::default());

    let mut out_icmp = Icmpv4Packet::new_unchecked(out_ip.payload_mut());
    icmp_repr.emit(&mut out_icmp, &ChecksumCapabilities::default());

    Some(reply)
}
