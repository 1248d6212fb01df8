//! Switch-level flow representation.
//!
//! `FlowMatch` is the canonical field set derived from a packet (see
//! `packet::flow_match`). The controller hands `FlowMod`s and `PacketOut`s
//! to the switch driver; it never owns their lifecycle on the switch.

use std::fmt;
use std::net::Ipv4Addr;

/// Idle timeout for every flow installed by the forwarding pipeline.
///
/// Drop, reject and forward flows all share this value.
pub const IDLE_TIMEOUT_SECS: u16 = 20;

/// Buffer id used by the switch for packets carried in full in the message.
pub const UNBUFFERED_ID: u32 = 0xffff_ffff;

/// Ingress port used for packets generated by the controller itself.
pub const PORT_NONE: u16 = 0xffff;

/// Ethertypes the pipeline cares about.
pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;

/// IP protocol numbers used in matches.
pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

/// Exact-match description of one packet as seen on a switch port.
///
/// L3/L4 fields are `None` when the packet does not carry them (they are
/// wildcarded on the switch). For ARP, `nw_src`/`nw_dst` hold the sender and
/// target protocol addresses and `nw_proto` the low byte of the opcode. For
/// ICMP, `tp_src`/`tp_dst` hold the message type and code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub in_port: u16,
    pub dl_src: [u8; 6],
    pub dl_dst: [u8; 6],
    pub dl_type: u16,
    pub nw_tos: Option<u8>,
    pub nw_proto: Option<u8>,
    pub nw_src: Option<Ipv4Addr>,
    pub nw_dst: Option<Ipv4Addr>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

impl FlowMatch {
    /// A match carrying only L2 fields.
    pub fn l2(in_port: u16, dl_src: [u8; 6], dl_dst: [u8; 6], dl_type: u16) -> Self {
        FlowMatch {
            in_port,
            dl_src,
            dl_dst,
            dl_type,
            nw_tos: None,
            nw_proto: None,
            nw_src: None,
            nw_dst: None,
            tp_src: None,
            tp_dst: None,
        }
    }

    /// Exact match for a frame received on `in_port`. See `packet::flow_match`.
    pub fn from_packet(data: &[u8], in_port: u16) -> Option<Self> {
        crate::packet::flow_match(data, in_port)
    }

    pub fn is_ipv4(&self) -> bool {
        self.dl_type == ETH_TYPE_IPV4
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in_port={} dl_type={:#06x}", self.in_port, self.dl_type)?;
        if let (Some(src), Some(dst)) = (self.nw_src, self.nw_dst) {
            write!(f, " nw={}->{}", src, dst)?;
        }
        if let Some(proto) = self.nw_proto {
            write!(f, " proto={}", proto)?;
        }
        if let (Some(src), Some(dst)) = (self.tp_src, self.tp_dst) {
            write!(f, " tp={}->{}", src, dst)?;
        }
        Ok(())
    }
}

/// One action in an installed flow or packet-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    SetDlSrc([u8; 6]),
    SetDlDst([u8; 6]),
    SetNwSrc(Ipv4Addr),
    SetNwDst(Ipv4Addr),
    SetTpSrc(u16),
    SetTpDst(u16),
    Output(u16),
}

/// A flow installation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub flow_match: FlowMatch,
    /// Empty means drop.
    pub actions: Vec<FlowAction>,
    pub idle_timeout: u16,
    /// Buffered packet to run through the new flow, or `UNBUFFERED_ID`.
    pub buffer_id: u32,
    pub send_flow_removed: bool,
}

impl FlowMod {
    /// Cached drop decision for `flow_match`.
    pub fn drop(flow_match: FlowMatch, buffer_id: u32) -> Self {
        Self::forward(flow_match, Vec::new(), buffer_id)
    }

    pub fn forward(flow_match: FlowMatch, actions: Vec<FlowAction>, buffer_id: u32) -> Self {
        FlowMod {
            flow_match,
            actions,
            idle_timeout: IDLE_TIMEOUT_SECS,
            buffer_id,
            send_flow_removed: true,
        }
    }

    pub fn is_drop(&self) -> bool {
        self.actions.is_empty()
    }
}

/// A single packet sent out through the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    pub buffer_id: u32,
    pub in_port: u16,
    pub actions: Vec<FlowAction>,
    /// Full frame; empty when `buffer_id` references a switch buffer.
    pub data: Vec<u8>,
}

impl PacketOut {
    /// Unbuffered frame generated by the controller, sent out `port`.
    pub fn generated(port: u16, data: Vec<u8>) -> Self {
        PacketOut {
            buffer_id: UNBUFFERED_ID,
            in_port: PORT_NONE,
            actions: vec![FlowAction::Output(port)],
            data,
        }
    }
}

/// Build the action list that turns `original` into `translated` and sends
/// it out `out_port`.
///
/// MAC rewrites always come first, then any L3/L4 rewrites, and the output
/// action is last.
pub fn forward_actions(original: &FlowMatch, translated: &FlowMatch, out_port: u16) -> Vec<FlowAction> {
    let mut actions = vec![
        FlowAction::SetDlSrc(translated.dl_src),
        FlowAction::SetDlDst(translated.dl_dst),
    ];
    if let Some(src) = translated.nw_src
        && original.nw_src != Some(src)
    {
        actions.push(FlowAction::SetNwSrc(src));
    }
    if let Some(dst) = translated.nw_dst
        && original.nw_dst != Some(dst)
    {
        actions.push(FlowAction::SetNwDst(dst));
    }
    // ICMP reuses tp_* for type/code, which are never translated.
    if translated.nw_proto != Some(IP_PROTO_ICMP) {
        if let Some(src) = translated.tp_src
            && original.tp_src != Some(src)
        {
            actions.push(FlowAction::SetTpSrc(src));
        }
        if let Some(dst) = translated.tp_dst
            && original.tp_dst != Some(dst)
        {
            actions.push(FlowAction::SetTpDst(dst));
        }
    }
    actions.push(FlowAction::Output(out_port));
    actions
}
