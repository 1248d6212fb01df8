//! Rule chains and jump evaluation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Action, NatTable, PacketContext, Rule, RuleDef};
use crate::flow::FlowMatch;
use crate::validation::{Result, ValidationError};

/// Maximum number of chains on one evaluation path.
pub const MAX_JUMP_DEPTH: usize = 32;

/// Unvalidated chain definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDef {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

/// A validated, immutable chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub id: Uuid,
    pub name: String,
    rules: Vec<Rule>,
}

/// Everything chain evaluation reads besides the packet.
#[derive(Clone, Copy)]
pub struct ChainEnv<'a> {
    pub chains: &'a ChainSet,
    pub nat: &'a NatTable,
}

/// Verdict of a whole chain evaluation, with the match as rewritten by the
/// rules that applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainResult {
    pub action: Action,
    pub flow_match: FlowMatch,
}

impl ChainResult {
    /// Continue at the top level means no rule objected.
    pub fn is_accept(&self) -> bool {
        matches!(self.action, Action::Accept | Action::Continue)
    }
}

impl Chain {
    pub fn new(id: Uuid, name: impl Into<String>, rules: Vec<Rule>) -> Result<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if rule.chain_id != id {
                return Err(ValidationError::RuleChainMismatch(rule.id, rule.chain_id, id));
            }
            if !seen.insert(rule.id) {
                return Err(ValidationError::DuplicateRule(id, rule.id));
            }
        }
        Ok(Chain {
            id,
            name: name.into(),
            rules,
        })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Run `ctx` through this chain and any chains it jumps to.
    ///
    /// Jumps are followed with an explicit stack. Re-entering a chain that is
    /// already on the path, or exceeding `MAX_JUMP_DEPTH`, yields Drop. A
    /// jump to an unknown chain is skipped.
    pub fn apply<'a>(&'a self, ctx: &mut PacketContext, env: &ChainEnv<'a>) -> ChainResult {
        let action = self.evaluate(ctx, env);
        ChainResult {
            action,
            flow_match: ctx.flow_match,
        }
    }

    fn evaluate<'a>(&'a self, ctx: &mut PacketContext, env: &ChainEnv<'a>) -> Action {
        let mut stack: Vec<(&'a Chain, usize)> = vec![(self, 0)];
        let mut on_path: HashSet<Uuid> = HashSet::from([self.id]);

        while let Some(frame) = stack.last_mut() {
            let chain = frame.0;
            let Some(rule) = chain.rules.get(frame.1) else {
                on_path.remove(&chain.id);
                stack.pop();
                continue;
            };
            frame.1 += 1;

            let result = rule.process(ctx, env.nat);
            match result.action {
                Action::Accept | Action::Drop | Action::Reject => {
                    debug!(chain = %chain.id, rule = %rule.id, action = ?result.action, "Chain verdict");
                    return result.action;
                }
                Action::Continue => {}
                Action::Return => {
                    on_path.remove(&chain.id);
                    stack.pop();
                }
                Action::Jump => {
                    let Some(target_id) = result.jump_to else {
                        continue;
                    };
                    let Some(target) = env.chains.get(&target_id) else {
                        warn!(chain = %chain.id, rule = %rule.id, target = %target_id, "Jump to unknown chain, skipping");
                        continue;
                    };
                    if on_path.contains(&target_id) {
                        warn!(chain = %chain.id, target = %target_id, "Jump cycle detected, dropping packet");
                        return Action::Drop;
                    }
                    if stack.len() >= MAX_JUMP_DEPTH {
                        warn!(chain = %chain.id, target = %target_id, depth = stack.len(), "Jump depth exceeded, dropping packet");
                        return Action::Drop;
                    }
                    on_path.insert(target_id);
                    stack.push((target.as_ref(), 0));
                }
            }
        }
        Action::Continue
    }
}

impl TryFrom<ChainDef> for Chain {
    type Error = ValidationError;

    fn try_from(def: ChainDef) -> Result<Self> {
        let rules = def
            .rules
            .into_iter()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>>>()?;
        Chain::new(def.id, def.name, rules)
    }
}

/// Immutable, versioned set of all chains known to the controller.
#[derive(Debug, Clone, Default)]
pub struct ChainSet {
    chains: HashMap<Uuid, Arc<Chain>>,
    version: u64,
}

impl ChainSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Arc<Chain>> {
        self.chains.get(id)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Copy of this set with `chain` added or replaced.
    pub fn with_chain(&self, chain: Chain) -> Self {
        let mut chains = self.chains.clone();
        chains.insert(chain.id, Arc::new(chain));
        ChainSet {
            chains,
            version: self.version + 1,
        }
    }

    /// Copy of this set without chain `id`.
    pub fn without_chain(&self, id: &Uuid) -> Self {
        let mut chains = self.chains.clone();
        chains.remove(id);
        ChainSet {
            chains,
            version: self.version + 1,
        }
    }
}
