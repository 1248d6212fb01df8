//! Firewall and NAT rule evaluation
//!
//! - `Condition`: pure predicate over a packet's match fields
//! - `Rule`: condition + action + kind-specific behaviour (jump, trace, NAT, L2 rewrite)
//! - `Chain`: ordered rules, evaluated with an explicit jump stack
//! - `NatTable`: connection bindings shared by forward and reverse NAT rules

pub mod chain;
pub mod condition;
pub mod context;
pub mod nat;
pub mod rule;

pub use chain::{Chain, ChainDef, ChainEnv, ChainResult, ChainSet, MAX_JUMP_DEPTH};
pub use condition::{Condition, PortRange};
pub use context::PacketContext;
pub use nat::{NatRuleData, NatTable, NatTarget};
pub use rule::{Action, L2TransformData, Rule, RuleDef, RuleKind, RuleResult, RuleType};
