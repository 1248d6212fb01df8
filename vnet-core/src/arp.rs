//! Next-hop address resolution.
//!
//! One entry per (egress port, next-hop IP). An entry is either pending,
//! holding the packets waiting for the address, or resolved with an expiry.
//! Entries are locked individually; the index lock is only held to find or
//! create an entry. Nothing here talks to the switch: callers get back the
//! work to do and perform it after every lock is released.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::flow::FlowMatch;
use crate::rules::PacketContext;

/// A packet suspended until its next hop's MAC is known.
#[derive(Debug, Clone)]
pub struct ForwardingWork {
    /// Match of the packet as received; the flow is installed with it
    pub original: FlowMatch,
    /// Packet state after every router it crossed
    pub ctx: PacketContext,
    /// Switch port the packet arrived on
    pub in_port: u16,
    pub buffer_id: u32,
    pub data: Vec<u8>,
    /// Router owning the egress port
    pub router_id: Uuid,
    pub egress_port: Uuid,
    pub next_hop_ip: Ipv4Addr,
}

/// Resolver policy.
#[derive(Debug, Clone, Copy)]
pub struct ArpPolicy {
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub expiry: Duration,
    pub max_pending: usize,
}

impl From<&ControllerConfig> for ArpPolicy {
    fn from(config: &ControllerConfig) -> Self {
        ArpPolicy {
            retry_interval: config.arp_retry_interval(),
            max_retries: config.arp_max_retries,
            expiry: config.arp_expiry(),
            max_pending: config.max_pending_packets,
        }
    }
}

/// Outcome of asking for a next hop's MAC.
#[derive(Debug)]
pub enum Lookup {
    /// Known: forward now
    Resolved([u8; 6], Box<ForwardingWork>),
    /// First miss: the caller must send an ARP request
    Requested,
    /// Already being resolved; the packet waits
    Queued,
    /// Queue full; the packet is handed back to be dropped
    Overflow(Box<ForwardingWork>),
}

/// What a timer pass requires of the caller.
#[derive(Debug, Default)]
pub struct TimerActions {
    /// ARP requests to send again, as (egress port, target IP)
    pub resend: Vec<(Uuid, Ipv4Addr)>,
    /// Packets whose next hop never answered
    pub expired: Vec<ForwardingWork>,
}

#[derive(Debug)]
enum ArpState {
    Pending {
        queue: VecDeque<ForwardingWork>,
        retries: u32,
        first_queued_at: Instant,
        last_request_at: Instant,
    },
    Resolved {
        mac: [u8; 6],
        expires_at: Instant,
    },
}

#[derive(Debug)]
struct ArpEntry {
    state: ArpState,
    /// Set once the entry has left the index
    removed: bool,
}

type Key = (Uuid, Ipv4Addr);

/// ARP cache and pending-packet queues.
pub struct ArpTable {
    entries: Mutex<HashMap<Key, Arc<Mutex<ArpEntry>>>>,
    policy: ArpPolicy,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ArpTable {
    pub fn new(policy: ArpPolicy) -> Self {
        ArpTable {
            entries: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolved MAC of `ip` on `port`, if known and not expired.
    pub fn lookup(&self, port: Uuid, ip: Ipv4Addr, now: Instant) -> Option<[u8; 6]> {
        let entry = lock(&self.entries).get(&(port, ip)).cloned()?;
        let entry = lock(&entry);
        match entry.state {
            ArpState::Resolved { mac, expires_at } if now < expires_at => Some(mac),
            _ => None,
        }
    }

    /// Number of packets waiting for `ip` on `port`.
    pub fn pending_len(&self, port: Uuid, ip: Ipv4Addr) -> usize {
        let Some(entry) = lock(&self.entries).get(&(port, ip)).cloned() else {
            return 0;
        };
        match &lock(&entry).state {
            ArpState::Pending { queue, .. } => queue.len(),
            ArpState::Resolved { .. } => 0,
        }
    }

    /// Resolve `work.next_hop_ip` on `work.egress_port`, queueing the work
    /// if the address is not known yet.
    pub fn resolve(&self, work: ForwardingWork, now: Instant) -> Lookup {
        let key = (work.egress_port, work.next_hop_ip);
        loop {
            let entry = {
                let mut entries = lock(&self.entries);
                match entries.get(&key) {
                    Some(entry) => entry.clone(),
                    None => {
                        let mut queue = VecDeque::new();
                        queue.push_back(work);
                        entries.insert(
                            key,
                            Arc::new(Mutex::new(ArpEntry {
                                state: ArpState::Pending {
                                    queue,
                                    retries: 1,
                                    first_queued_at: now,
                                    last_request_at: now,
                                },
                                removed: false,
                            })),
                        );
                        debug!(port = %key.0, ip = %key.1, "Resolving next hop");
                        return Lookup::Requested;
                    }
                }
            };

            let mut entry = lock(&entry);
            if entry.removed {
                continue;
            }
            match &mut entry.state {
                ArpState::Resolved { mac, expires_at } if now < *expires_at => {
                    return Lookup::Resolved(*mac, Box::new(work));
                }
                ArpState::Resolved { .. } => {
                    // Stale: start over, keeping the entry.
                    let mut queue = VecDeque::new();
                    queue.push_back(work);
                    entry.state = ArpState::Pending {
                        queue,
                        retries: 1,
                        first_queued_at: now,
                        last_request_at: now,
                    };
                    debug!(port = %key.0, ip = %key.1, "ARP entry expired, resolving again");
                    return Lookup::Requested;
                }
                ArpState::Pending { queue, .. } => {
                    if queue.len() >= self.policy.max_pending {
                        warn!(port = %key.0, ip = %key.1, queued = queue.len(), "ARP pending queue full, dropping packet");
                        return Lookup::Overflow(Box::new(work));
                    }
                    queue.push_back(work);
                    return Lookup::Queued;
                }
            }
        }
    }

    /// Record `ip` at `mac` on `port`. Returns the packets that were waiting
    /// for it, oldest first.
    pub fn learn(&self, port: Uuid, ip: Ipv4Addr, mac: [u8; 6], now: Instant) -> Vec<ForwardingWork> {
        let expires_at = now + self.policy.expiry;
        let resolved = ArpState::Resolved { mac, expires_at };

        let entry = {
            let mut entries = lock(&self.entries);
            match entries.get(&(port, ip)) {
                Some(entry) => entry.clone(),
                None => {
                    entries.insert(
                        (port, ip),
                        Arc::new(Mutex::new(ArpEntry {
                            state: resolved,
                            removed: false,
                        })),
                    );
                    debug!(port = %port, %ip, "Learned neighbor");
                    return Vec::new();
                }
            }
        };

        let mut entry = lock(&entry);
        match std::mem::replace(&mut entry.state, resolved) {
            ArpState::Pending {
                queue,
                first_queued_at,
                ..
            } => {
                debug!(
                    port = %port,
                    %ip,
                    waiting = queue.len(),
                    waited_ms = now.saturating_duration_since(first_queued_at).as_millis() as u64,
                    "Resolved next hop"
                );
                queue.into()
            }
            ArpState::Resolved { .. } => Vec::new(),
        }
    }

    /// Advance retry and expiry state to `now`.
    pub fn run_timers(&self, now: Instant) -> TimerActions {
        let mut actions = TimerActions::default();
        let mut entries = lock(&self.entries);

        entries.retain(|key, entry| {
            let mut entry = lock(entry);
            let keep = match &mut entry.state {
                ArpState::Resolved { expires_at, .. } => now < *expires_at,
                ArpState::Pending {
                    queue,
                    retries,
                    last_request_at,
                    ..
                } => {
                    if now.saturating_duration_since(*last_request_at) < self.policy.retry_interval {
                        true
                    } else if *retries >= self.policy.max_retries {
                        warn!(
                            port = %key.0,
                            ip = %key.1,
                            retries = *retries,
                            dropped = queue.len(),
                            "Next hop did not answer, dropping queued packets"
                        );
                        actions.expired.extend(queue.drain(..));
                        false
                    } else {
                        *retries += 1;
                        *last_request_at = now;
                        actions.resend.push(*key);
                        true
                    }
                }
            };
            if !keep {
                entry.removed = true;
            }
            keep
        });
        actions
    }

    /// Forget everything about `port`. Returns its waiting packets.
    pub fn remove_port(&self, port: Uuid) -> Vec<ForwardingWork> {
        let mut dropped = Vec::new();
        lock(&self.entries).retain(|key, entry| {
            if key.0 != port {
                return true;
            }
            let mut entry = lock(entry);
            entry.removed = true;
            if let ArpState::Pending { queue, .. } = &mut entry.state {
                dropped.extend(queue.drain(..));
            }
            false
        });
        dropped
    }
}
