//! Packet predicates.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PacketContext;

/// Inclusive L4 port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        PortRange { start, end }
    }

    pub fn single(port: u16) -> Self {
        PortRange { start: port, end: port }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

/// Conjunction of optional field predicates, each individually invertible.
///
/// An unset field matches everything. A set field never matches a packet
/// that lacks the field (before inversion). `conjunction_inv` inverts the
/// result of the whole conjunction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Condition {
    pub conjunction_inv: bool,
    pub in_port_ids: Vec<Uuid>,
    pub in_port_inv: bool,
    pub out_port_ids: Vec<Uuid>,
    pub out_port_inv: bool,
    pub dl_type: Option<u16>,
    pub dl_type_inv: bool,
    pub dl_src: Option<[u8; 6]>,
    pub dl_src_inv: bool,
    pub dl_dst: Option<[u8; 6]>,
    pub dl_dst_inv: bool,
    pub nw_proto: Option<u8>,
    pub nw_proto_inv: bool,
    pub nw_src: Option<Ipv4Net>,
    pub nw_src_inv: bool,
    pub nw_dst: Option<Ipv4Net>,
    pub nw_dst_inv: bool,
    pub tp_src: Option<PortRange>,
    pub tp_src_inv: bool,
    pub tp_dst: Option<PortRange>,
    pub tp_dst_inv: bool,
}

/// Evaluate one optional predicate.
fn field<C, P>(cond: &Option<C>, inv: bool, pkt: Option<P>, test: impl FnOnce(&C, P) -> bool) -> bool {
    match cond {
        None => true,
        Some(c) => pkt.is_some_and(|p| test(c, p)) != inv,
    }
}

fn port_set(ids: &[Uuid], inv: bool, port: Option<Uuid>) -> bool {
    if ids.is_empty() {
        return true;
    }
    port.is_some_and(|p| ids.contains(&p)) != inv
}

impl Condition {
    /// Matches every packet.
    pub const TRUE: Condition = Condition {
        conjunction_inv: false,
        in_port_ids: Vec::new(),
        in_port_inv: false,
        out_port_ids: Vec::new(),
        out_port_inv: false,
        dl_type: None,
        dl_type_inv: false,
        dl_src: None,
        dl_src_inv: false,
        dl_dst: None,
        dl_dst_inv: false,
        nw_proto: None,
        nw_proto_inv: false,
        nw_src: None,
        nw_src_inv: false,
        nw_dst: None,
        nw_dst_inv: false,
        tp_src: None,
        tp_src_inv: false,
        tp_dst: None,
        tp_dst_inv: false,
    };

    pub fn matches(&self, ctx: &PacketContext) -> bool {
        let m = &ctx.flow_match;
        let all = port_set(&self.in_port_ids, self.in_port_inv, Some(ctx.in_port_id))
            && port_set(&self.out_port_ids, self.out_port_inv, ctx.out_port_id)
            && field(&self.dl_type, self.dl_type_inv, Some(m.dl_type), |c, p| *c == p)
            && field(&self.dl_src, self.dl_src_inv, Some(m.dl_src), |c, p| *c == p)
            && field(&self.dl_dst, self.dl_dst_inv, Some(m.dl_dst), |c, p| *c == p)
            && field(&self.nw_proto, self.nw_proto_inv, m.nw_proto, |c, p| *c == p)
            && field(&self.nw_src, self.nw_src_inv, m.nw_src, |c, p| c.contains(&p))
            && field(&self.nw_dst, self.nw_dst_inv, m.nw_dst, |c, p| c.contains(&p))
            && field(&self.tp_src, self.tp_src_inv, m.tp_src, |c, p| c.contains(p))
            && field(&self.tp_dst, self.tp_dst_inv, m.tp_dst, |c, p| c.contains(p));
        all != self.conjunction_inv
    }
}
