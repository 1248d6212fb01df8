//! NAT target selection and connection bindings.
//!
//! Forward rules choose a translation with a stable hash of the flow's
//! 5-tuple, so every packet of a connection picks the same target. The
//! chosen binding is recorded keyed by the tuple of the *return* traffic,
//! which is what reverse rules look up.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Clock, SystemClock};
use crate::flow::{FlowMatch, IP_PROTO_ICMP};

/// Endpoints probed past the hashed choice when a binding collides
const MAX_PROBES: u64 = 64;

/// Idle lifetime of a binding when none is configured
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One translation range: addresses `nw_start..=nw_end`, ports
/// `tp_start..=tp_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatTarget {
    pub nw_start: Ipv4Addr,
    pub nw_end: Ipv4Addr,
    pub tp_start: u16,
    pub tp_end: u16,
}

impl NatTarget {
    pub fn new(nw_start: Ipv4Addr, nw_end: Ipv4Addr, tp_start: u16, tp_end: u16) -> Self {
        NatTarget {
            nw_start,
            nw_end,
            tp_start,
            tp_end,
        }
    }

    pub fn is_valid(&self) -> bool {
        u32::from(self.nw_start) <= u32::from(self.nw_end) && self.tp_start <= self.tp_end
    }

    fn address_count(&self) -> u64 {
        u64::from(u32::from(self.nw_end) - u32::from(self.nw_start)) + 1
    }

    fn address(&self, offset: u64) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.nw_start) + (offset % self.address_count()) as u32)
    }

    fn port_count(&self) -> u64 {
        u64::from(self.tp_end - self.tp_start) + 1
    }

    fn port(&self, offset: u64) -> u16 {
        self.tp_start + (offset % self.port_count()) as u16
    }
}

/// NAT payload of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NatRuleData {
    /// Translate the destination (DNAT) rather than the source (SNAT)
    pub dnat: bool,
    /// Undo an existing translation on return traffic
    pub reverse: bool,
    pub targets: Vec<NatTarget>,
}

/// Transport-level identity of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    proto: u8,
    nw_src: Ipv4Addr,
    tp_src: u16,
    nw_dst: Ipv4Addr,
    tp_dst: u16,
}

impl FlowKey {
    fn from_match(m: &FlowMatch) -> Option<Self> {
        let proto = m.nw_proto?;
        // ICMP type/code live in tp_*; they identify nothing to translate.
        let (tp_src, tp_dst) = if proto == IP_PROTO_ICMP {
            (0, 0)
        } else {
            (m.tp_src.unwrap_or(0), m.tp_dst.unwrap_or(0))
        };
        Some(FlowKey {
            proto,
            nw_src: m.nw_src?,
            tp_src,
            nw_dst: m.nw_dst?,
            tp_dst,
        })
    }

    fn reversed(&self) -> Self {
        FlowKey {
            proto: self.proto,
            nw_src: self.nw_dst,
            tp_src: self.tp_dst,
            nw_dst: self.nw_src,
            tp_dst: self.tp_src,
        }
    }

    fn stable_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn translates_ports(&self) -> bool {
        self.proto != IP_PROTO_ICMP
    }

    /// Endpoint a translation of this tuple replaces.
    fn original(&self, dnat: bool) -> (Ipv4Addr, u16) {
        if dnat {
            (self.nw_dst, self.tp_dst)
        } else {
            (self.nw_src, self.tp_src)
        }
    }
}

type BindingKey = (bool, FlowKey);

struct Binding {
    nat: (Ipv4Addr, u16),
    last_used: Instant,
}

#[derive(Default)]
struct Bindings {
    /// Forward tuple (pre-translation) -> translation
    forward: HashMap<BindingKey, Binding>,
    /// Return tuple (post-translation) -> forward tuple
    reverse: HashMap<BindingKey, FlowKey>,
}

/// Connection bindings shared by forward and reverse NAT rules.
///
/// A binding lives until it has seen no traffic in either direction for the
/// idle timeout and `expire` runs. Its endpoint is not handed out again
/// before that.
pub struct NatTable {
    inner: Mutex<Bindings>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
}

impl Default for NatTable {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock), DEFAULT_IDLE_TIMEOUT)
    }
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>, idle_timeout: Duration) -> Self {
        NatTable {
            inner: Mutex::new(Bindings::default()),
            clock,
            idle_timeout,
        }
    }

    fn bindings(&self) -> MutexGuard<'_, Bindings> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of active bindings.
    pub fn len(&self) -> usize {
        self.bindings().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a forward translation to `m`. Returns false if the packet has no
    /// L3 tuple, no target is configured, or every candidate endpoint is
    /// bound to another connection.
    pub fn apply_forward(&self, dnat: bool, targets: &[NatTarget], m: &mut FlowMatch) -> bool {
        let Some(key) = FlowKey::from_match(m) else {
            return false;
        };
        if targets.is_empty() {
            return false;
        }
        let now = self.clock.now();

        let mut bindings = self.bindings();
        let existing = bindings.forward.get_mut(&(dnat, key)).map(|binding| {
            binding.last_used = now;
            binding.nat
        });
        let translated = match existing {
            Some(nat) => nat,
            None => {
                let Some(chosen) = select(&bindings, dnat, key, targets) else {
                    let (orig_ip, orig_port) = key.original(dnat);
                    warn!(dnat, orig = %orig_ip, orig_port, "NAT targets exhausted, not translating");
                    return false;
                };
                bindings.forward.insert(
                    (dnat, key),
                    Binding {
                        nat: chosen,
                        last_used: now,
                    },
                );
                bindings.reverse.insert((dnat, return_key(dnat, key, chosen)), key);
                let (orig_ip, orig_port) = key.original(dnat);
                debug!(
                    dnat,
                    orig = %orig_ip,
                    orig_port,
                    nat = %chosen.0,
                    nat_port = chosen.1,
                    "Created NAT binding"
                );
                chosen
            }
        };
        drop(bindings);

        rewrite(m, dnat, false, translated, key.translates_ports());
        true
    }

    /// Undo a translation on return traffic. Returns false if no binding
    /// exists for this packet.
    pub fn apply_reverse(&self, dnat: bool, m: &mut FlowMatch) -> bool {
        let Some(key) = FlowKey::from_match(m) else {
            return false;
        };
        let now = self.clock.now();
        let original = {
            let mut bindings = self.bindings();
            let Some(forward) = bindings.reverse.get(&(dnat, key)).copied() else {
                return false;
            };
            if let Some(binding) = bindings.forward.get_mut(&(dnat, forward)) {
                binding.last_used = now;
            }
            forward.original(dnat)
        };
        rewrite(m, dnat, true, original, key.translates_ports());
        true
    }

    /// Drop bindings idle for longer than the idle timeout. Returns how many
    /// were removed.
    pub fn expire(&self, now: Instant) -> usize {
        let idle_timeout = self.idle_timeout;
        let mut bindings = self.bindings();
        let mut stale = Vec::new();
        bindings.forward.retain(|&(dnat, key), binding| {
            let keep = now.saturating_duration_since(binding.last_used) < idle_timeout;
            if !keep {
                stale.push((dnat, return_key(dnat, key, binding.nat)));
            }
            keep
        });
        for key in &stale {
            bindings.reverse.remove(key);
        }
        if !stale.is_empty() {
            debug!(expired = stale.len(), remaining = bindings.forward.len(), "Expired NAT bindings");
        }
        stale.len()
    }
}

/// Tuple the return traffic of `key` carries once translated to `nat`.
fn return_key(dnat: bool, key: FlowKey, nat: (Ipv4Addr, u16)) -> FlowKey {
    let mut translated = key;
    if dnat {
        translated.nw_dst = nat.0;
        translated.tp_dst = nat.1;
    } else {
        translated.nw_src = nat.0;
        translated.tp_src = nat.1;
    }
    translated.reversed()
}

/// Pick a free target endpoint for `key`.
///
/// The hash picks the target and a starting endpoint. Ports (or, for ICMP,
/// addresses) after it are probed until one has no return traffic bound to
/// it.
fn select(bindings: &Bindings, dnat: bool, key: FlowKey, targets: &[NatTarget]) -> Option<(Ipv4Addr, u16)> {
    let hash = key.stable_hash();
    let target = &targets[(hash % targets.len() as u64) as usize];
    let addr_offset = hash >> 16;
    let port_offset = hash >> 32;
    let ports = key.translates_ports();
    let candidates = if ports {
        target.port_count()
    } else {
        target.address_count()
    };

    for probe in 0..candidates.min(MAX_PROBES) {
        let nat = if ports {
            (target.address(addr_offset), target.port(port_offset + probe))
        } else {
            (target.address(addr_offset + probe), 0)
        };
        if !bindings.reverse.contains_key(&(dnat, return_key(dnat, key, nat))) {
            return Some(nat);
        }
    }
    None
}

fn rewrite(m: &mut FlowMatch, dnat: bool, reverse: bool, endpoint: (Ipv4Addr, u16), ports: bool) {
    // Forward DNAT and reverse SNAT touch the destination; the other two
    // touch the source.
    let dst_side = dnat != reverse;
    if dst_side {
        m.nw_dst = Some(endpoint.0);
        if ports {
            m.tp_dst = Some(endpoint.1);
        }
    } else {
        m.nw_src = Some(endpoint.0);
        if ports {
            m.tp_src = Some(endpoint.1);
        }
    }
}
