//! Per-packet working state for chain evaluation.

use uuid::Uuid;

use crate::flow::FlowMatch;

/// Mutable state carried through one packet's evaluation.
///
/// Rules only ever modify this context, never the topology they belong to.
#[derive(Debug, Clone)]
pub struct PacketContext {
    /// Match as rewritten so far by NAT and L2 transform rules
    pub flow_match: FlowMatch,
    /// Virtual port the packet entered the current device on
    pub in_port_id: Uuid,
    /// Virtual port the packet is about to leave through, once routed
    pub out_port_id: Option<Uuid>,
    traced: bool,
    flow_tags: Vec<String>,
    matched_rules: Vec<(Uuid, bool)>,
    applied_rules: Vec<(Uuid, bool)>,
}

impl PacketContext {
    pub fn new(flow_match: FlowMatch, in_port_id: Uuid) -> Self {
        PacketContext {
            flow_match,
            in_port_id,
            out_port_id: None,
            traced: false,
            flow_tags: Vec::new(),
            matched_rules: Vec::new(),
            applied_rules: Vec::new(),
        }
    }

    pub fn record_matched_rule(&mut self, rule_id: Uuid, matched: bool) {
        self.matched_rules.push((rule_id, matched));
    }

    pub fn record_applied_rule(&mut self, rule_id: Uuid, applied: bool) {
        self.applied_rules.push((rule_id, applied));
    }

    pub fn add_flow_tag(&mut self, tag: &str) {
        if !self.flow_tags.iter().any(|t| t == tag) {
            self.flow_tags.push(tag.to_string());
        }
    }

    pub fn enable_tracing(&mut self) {
        self.traced = true;
    }

    pub fn is_traced(&self) -> bool {
        self.traced
    }

    /// Meter tags collected from matching rules
    pub fn flow_tags(&self) -> &[String] {
        &self.flow_tags
    }

    /// `(rule id, condition matched)` in evaluation order
    pub fn matched_rules(&self) -> &[(Uuid, bool)] {
        &self.matched_rules
    }

    /// `(rule id, action applied)` in evaluation order
    pub fn applied_rules(&self) -> &[(Uuid, bool)] {
        &self.applied_rules
    }
}
