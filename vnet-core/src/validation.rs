//! Validation of topology definitions.
//!
//! Every rule, chain, route and port definition is checked when it is loaded.
//! A failed check rejects the whole update and leaves the previous state in
//! place; packet processing never sees an invalid object.

use thiserror::Error;
use uuid::Uuid;

/// Validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Rule {0} has no action set")]
    MissingAction(Uuid),

    #[error("Rule {0} is a JUMP rule but does not have its JUMP data set")]
    JumpWithoutTarget(Uuid),

    #[error("Rule {0} is a JUMP rule but its action is not JUMP")]
    JumpActionMismatch(Uuid),

    #[error("Rule {0} has action JUMP but is not a JUMP rule")]
    JumpActionWithoutJumpRule(Uuid),

    #[error("Rule {0} is a NAT rule but does not have its NAT data set")]
    NatWithoutData(Uuid),

    #[error("Rule {0} is a forward NAT rule but has no targets set")]
    ForwardNatWithoutTargets(Uuid),

    #[error("Rule {0} has an invalid NAT target: {1}")]
    InvalidNatTarget(Uuid, String),

    #[error("Rule {0} is a TRACE rule but its action is not CONTINUE")]
    TraceActionNotContinue(Uuid),

    #[error("Rule {0} is an L2 transform rule but does not have its transform data set")]
    L2TransformWithoutData(Uuid),

    #[error("Rule {0} belongs to chain {1}, not chain {2}")]
    RuleChainMismatch(Uuid, Uuid, Uuid),

    #[error("Chain {0} contains rule {1} more than once")]
    DuplicateRule(Uuid, Uuid),

    #[error("Route {0} has a PORT next hop but no next hop port")]
    PortRouteWithoutPort(Uuid),

    #[error("Route {0} next hop port {1} does not belong to router {2}")]
    RoutePortNotOnRouter(Uuid, Uuid, Uuid),

    #[error("Router {0} not found")]
    UnknownRouter(Uuid),

    #[error("Port {0} not found")]
    UnknownPort(Uuid),

    #[error("Port {0} address {1} is not within its network {2}")]
    PortAddressOutsideNetwork(Uuid, String, String),

    #[error("Port {0} route {1} does not belong to router {2}")]
    PortRouteForeignRouter(Uuid, Uuid, Uuid),

    #[error("Logical port {0} cannot be its own peer")]
    SelfPeeredPort(Uuid),
}

pub type Result<T> = std::result::Result<T, ValidationError>;
