//! Rules: a condition bound to an action, plus kind-specific behaviour.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{Condition, NatRuleData, NatTable, PacketContext};
use crate::validation::{Result, ValidationError};

/// Verdict of a rule or chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Accept,
    Drop,
    Reject,
    /// Fall through to the next rule
    Continue,
    /// Evaluate another chain
    Jump,
    /// Leave the current chain
    Return,
}

impl Action {
    /// Accept, Drop and Reject end evaluation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Action::Accept | Action::Drop | Action::Reject)
    }
}

/// Outcome of processing one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleResult {
    pub action: Action,
    pub jump_to: Option<Uuid>,
}

impl RuleResult {
    pub const CONTINUE: RuleResult = RuleResult {
        action: Action::Continue,
        jump_to: None,
    };

    pub fn new(action: Action) -> Self {
        RuleResult {
            action,
            jump_to: None,
        }
    }
}

/// MAC rewrite payload. Unset fields are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct L2TransformData {
    pub dl_src: Option<[u8; 6]>,
    pub dl_dst: Option<[u8; 6]>,
}

/// Kind-specific part of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    Literal,
    Jump { jump_to: Uuid },
    Trace,
    Nat(NatRuleData),
    L2Transform(L2TransformData),
}

/// Rule discriminant as it appears in topology definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    Literal,
    Jump,
    Trace,
    Nat,
    L2transform,
}

/// Unvalidated rule definition, as replicated from the topology store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    pub id: Uuid,
    pub chain_id: Uuid,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub jump_chain_id: Option<Uuid>,
    #[serde(default)]
    pub nat: Option<NatRuleData>,
    #[serde(default)]
    pub l2_transform: Option<L2TransformData>,
    #[serde(default)]
    pub meter_name: Option<String>,
}

/// A validated rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: Uuid,
    pub chain_id: Uuid,
    pub condition: Condition,
    pub action: Action,
    pub meter: Option<String>,
    pub kind: RuleKind,
}

impl Rule {
    /// Literal rule: returns `action` whenever `condition` matches.
    pub fn literal(id: Uuid, chain_id: Uuid, condition: Condition, action: Action) -> Self {
        Rule {
            id,
            chain_id,
            condition,
            action,
            meter: None,
            kind: RuleKind::Literal,
        }
    }

    pub fn jump(id: Uuid, chain_id: Uuid, condition: Condition, jump_to: Uuid) -> Self {
        Rule {
            id,
            chain_id,
            condition,
            action: Action::Jump,
            meter: None,
            kind: RuleKind::Jump { jump_to },
        }
    }

    pub fn with_meter(mut self, meter: impl Into<String>) -> Self {
        self.meter = Some(meter.into());
        self
    }

    /// Evaluate the rule against `ctx`.
    ///
    /// Returns `RuleResult::CONTINUE` when the condition does not match or
    /// the kind-specific part declines to apply (e.g. a reverse NAT rule
    /// without a binding).
    pub fn process(&self, ctx: &mut PacketContext, nat: &NatTable) -> RuleResult {
        if self.condition.matches(ctx) {
            debug!(
                rule = %self.id,
                chain = %self.chain_id,
                action = ?self.action,
                "Rule condition matched"
            );
            ctx.record_matched_rule(self.id, true);
            if let Some(meter) = &self.meter {
                ctx.add_flow_tag(meter);
            }
            if self.apply(ctx, nat) {
                ctx.record_applied_rule(self.id, true);
                return self.result();
            }
        } else {
            ctx.record_matched_rule(self.id, false);
        }
        ctx.record_applied_rule(self.id, false);
        RuleResult::CONTINUE
    }

    fn result(&self) -> RuleResult {
        match self.kind {
            RuleKind::Jump { jump_to } => RuleResult {
                action: self.action,
                jump_to: Some(jump_to),
            },
            _ => RuleResult::new(self.action),
        }
    }

    fn apply(&self, ctx: &mut PacketContext, nat: &NatTable) -> bool {
        match &self.kind {
            RuleKind::Literal | RuleKind::Jump { .. } => true,
            RuleKind::Trace => {
                ctx.enable_tracing();
                true
            }
            RuleKind::Nat(data) => {
                if !ctx.flow_match.is_ipv4() {
                    return false;
                }
                if data.reverse {
                    nat.apply_reverse(data.dnat, &mut ctx.flow_match)
                } else {
                    nat.apply_forward(data.dnat, &data.targets, &mut ctx.flow_match)
                }
            }
            RuleKind::L2Transform(data) => {
                if let Some(src) = data.dl_src {
                    ctx.flow_match.dl_src = src;
                }
                if let Some(dst) = data.dl_dst {
                    ctx.flow_match.dl_dst = dst;
                }
                true
            }
        }
    }
}

impl TryFrom<RuleDef> for Rule {
    type Error = ValidationError;

    fn try_from(def: RuleDef) -> Result<Self> {
        let id = def.id;
        let action = def.action.ok_or(ValidationError::MissingAction(id))?;

        let kind = match def.rule_type {
            RuleType::Jump => {
                let jump_to = def
                    .jump_chain_id
                    .ok_or(ValidationError::JumpWithoutTarget(id))?;
                if action != Action::Jump {
                    return Err(ValidationError::JumpActionMismatch(id));
                }
                RuleKind::Jump { jump_to }
            }
            RuleType::Nat => {
                let nat = def.nat.ok_or(ValidationError::NatWithoutData(id))?;
                if !nat.reverse && nat.targets.is_empty() {
                    return Err(ValidationError::ForwardNatWithoutTargets(id));
                }
                if let Some(bad) = nat.targets.iter().find(|t| !t.is_valid()) {
                    return Err(ValidationError::InvalidNatTarget(
                        id,
                        format!(
                            "{}-{}:{}-{}",
                            bad.nw_start, bad.nw_end, bad.tp_start, bad.tp_end
                        ),
                    ));
                }
                RuleKind::Nat(nat)
            }
            RuleType::Trace => {
                if action != Action::Continue {
                    return Err(ValidationError::TraceActionNotContinue(id));
                }
                RuleKind::Trace
            }
            RuleType::L2transform => RuleKind::L2Transform(
                def.l2_transform
                    .ok_or(ValidationError::L2TransformWithoutData(id))?,
            ),
            RuleType::Literal => RuleKind::Literal,
        };

        if action == Action::Jump && !matches!(kind, RuleKind::Jump { .. }) {
            return Err(ValidationError::JumpActionWithoutJumpRule(id));
        }

        Ok(Rule {
            id,
            chain_id: def.chain_id,
            condition: def.condition.unwrap_or(Condition::TRUE),
            action,
            meter: def.meter_name,
            kind,
        })
    }
}
