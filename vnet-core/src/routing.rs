//! LPM (Longest Prefix Match) route tables.
//!
//! This module provides:
//! - `Route`: A prefix route with its next hop and weight
//! - `RoutingTable`: One router's routes, published as lock-free snapshots
//! - `RouteUpdate`: Add/remove messages replicated from the topology store

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use prefix_trie::PrefixMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::validation::{Result, ValidationError};

/// What to do with packets matching a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NextHop {
    /// Forward through `next_hop_port`
    Port,
    /// Drop silently
    Blackhole,
    /// Drop and tell the sender (ICMP filter prohibited)
    Reject,
    /// Deliver to the router itself
    Local,
}

/// A single route of a virtual router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: Uuid,
    pub router_id: Uuid,
    /// Source addresses this route applies to (`0.0.0.0/0` for all)
    pub src_prefix: Ipv4Net,
    pub dst_prefix: Ipv4Net,
    pub next_hop: NextHop,
    #[serde(default)]
    pub next_hop_port: Option<Uuid>,
    /// Gateway to resolve instead of the packet's destination
    #[serde(default)]
    pub next_hop_gateway: Option<Ipv4Addr>,
    /// Lower wins among routes of equal prefix length
    pub weight: u32,
}

impl Route {
    /// A route for all sources to `dst_prefix`.
    pub fn new(id: Uuid, router_id: Uuid, dst_prefix: Ipv4Net, next_hop: NextHop, weight: u32) -> Self {
        Route {
            id,
            router_id,
            src_prefix: Ipv4Net::default(),
            dst_prefix,
            next_hop,
            next_hop_port: None,
            next_hop_gateway: None,
            weight,
        }
    }

    /// A PORT route through `port_id`.
    pub fn via_port(id: Uuid, router_id: Uuid, dst_prefix: Ipv4Net, port_id: Uuid, weight: u32) -> Self {
        Route {
            next_hop_port: Some(port_id),
            ..Route::new(id, router_id, dst_prefix, NextHop::Port, weight)
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.next_hop_gateway = Some(gateway);
        self
    }

    pub fn with_src_prefix(mut self, src_prefix: Ipv4Net) -> Self {
        self.src_prefix = src_prefix;
        self
    }

    /// Check the route's internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.next_hop == NextHop::Port && self.next_hop_port.is_none() {
            return Err(ValidationError::PortRouteWithoutPort(self.id));
        }
        Ok(())
    }

    /// Address whose MAC must be resolved to forward `dst` over this route.
    pub fn next_hop_ip(&self, dst: Ipv4Addr) -> Ipv4Addr {
        self.next_hop_gateway
            .filter(|gw| !gw.is_unspecified())
            .unwrap_or(dst)
    }
}

/// Immutable view of a routing table.
#[derive(Clone)]
pub struct RouteSnapshot {
    /// Routes grouped by (truncated) destination prefix
    routes: PrefixMap<Ipv4Net, Vec<Route>>,
    /// Route id -> destination prefix, for removal
    index: HashMap<Uuid, Ipv4Net>,
    version: u64,
}

impl Default for RouteSnapshot {
    fn default() -> Self {
        RouteSnapshot {
            routes: PrefixMap::new(),
            index: HashMap::new(),
            version: 0,
        }
    }
}

impl RouteSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// All routes applying to a packet from `src` to `dst`, best first.
    ///
    /// Longer destination prefixes come first, then lower weight, then
    /// lower route id.
    pub fn lookup(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<Route> {
        let mut candidates = Vec::new();
        for len in (0..=32u8).rev() {
            let Ok(prefix) = Ipv4Net::new(dst, len) else {
                continue;
            };
            let Some(routes) = self.routes.get(&prefix.trunc()) else {
                continue;
            };
            let mut group: Vec<Route> = routes
                .iter()
                .filter(|r| r.src_prefix.contains(&src))
                .cloned()
                .collect();
            group.sort_by_key(|r| (r.weight, r.id));
            candidates.extend(group);
        }
        candidates
    }

    pub fn best_route(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<Route> {
        self.lookup(src, dst).into_iter().next()
    }

    fn insert(&mut self, route: Route) {
        self.remove(&route.id);
        let prefix = route.dst_prefix.trunc();
        self.index.insert(route.id, prefix);
        match self.routes.get_mut(&prefix) {
            Some(routes) => routes.push(route),
            None => {
                self.routes.insert(prefix, vec![route]);
            }
        }
    }

    fn remove(&mut self, id: &Uuid) -> Option<Route> {
        let prefix = self.index.remove(id)?;
        let routes = self.routes.get_mut(&prefix)?;
        let pos = routes.iter().position(|r| r.id == *id)?;
        let removed = routes.remove(pos);
        if routes.is_empty() {
            self.routes.remove(&prefix);
        }
        Some(removed)
    }
}

/// A router's route table.
///
/// Readers load the current snapshot without locking. Writers serialize on
/// `write_lock`, copy the snapshot, modify it and publish it atomically.
pub struct RoutingTable {
    router_id: Uuid,
    snapshot: ArcSwap<RouteSnapshot>,
    write_lock: Mutex<()>,
}

impl RoutingTable {
    pub fn new(router_id: Uuid) -> Self {
        RoutingTable {
            router_id,
            snapshot: ArcSwap::new(Arc::new(RouteSnapshot::default())),
            write_lock: Mutex::new(()),
        }
    }

    pub fn router_id(&self) -> Uuid {
        self.router_id
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.snapshot.load_full()
    }

    pub fn lookup(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<Route> {
        self.snapshot.load().lookup(src, dst)
    }

    pub fn best_route(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<Route> {
        self.snapshot.load().best_route(src, dst)
    }

    /// Add or replace a route.
    pub fn add_route(&self, route: Route) -> Result<()> {
        route.validate()?;
        if route.router_id != self.router_id {
            return Err(ValidationError::UnknownRouter(route.router_id));
        }
        debug!(
            router = %self.router_id,
            route = %route.id,
            dst = %route.dst_prefix,
            next_hop = ?route.next_hop,
            weight = route.weight,
            "Adding route"
        );
        self.modify(|snap| snap.insert(route));
        Ok(())
    }

    /// Remove a route. Returns the removed route, if it existed.
    pub fn remove_route(&self, route_id: &Uuid) -> Option<Route> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**self.snapshot.load()).clone();
        let removed = next.remove(route_id)?;
        next.version += 1;
        self.snapshot.store(Arc::new(next));
        debug!(router = %self.router_id, route = %route_id, "Removed route");
        Some(removed)
    }

    /// Swap the routes in `old` for those in `new` in a single snapshot.
    ///
    /// Readers see either the old set or the new one. If any new route is
    /// invalid nothing changes.
    pub fn replace_routes(&self, old: &[Route], new: &[Route]) -> Result<()> {
        for route in new {
            route.validate()?;
            if route.router_id != self.router_id {
                return Err(ValidationError::UnknownRouter(route.router_id));
            }
        }
        self.modify(|snap| {
            for route in old {
                snap.remove(&route.id);
            }
            for route in new {
                snap.insert(route.clone());
            }
        });
        debug!(
            router = %self.router_id,
            removed = old.len(),
            added = new.len(),
            "Replaced routes"
        );
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut RouteSnapshot)) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**self.snapshot.load()).clone();
        f(&mut next);
        next.version += 1;
        self.snapshot.store(Arc::new(next));
    }
}

/// Routing change replicated from the topology store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteUpdate {
    AddRoute(Route),
    RemoveRoute { router_id: Uuid, route_id: Uuid },
}

impl RouteUpdate {
    pub fn router_id(&self) -> Uuid {
        match self {
            RouteUpdate::AddRoute(route) => route.router_id,
            RouteUpdate::RemoveRoute { router_id, .. } => *router_id,
        }
    }

    /// Apply this update to the router's table.
    pub fn apply(self, table: &RoutingTable) -> Result<()> {
        match self {
            RouteUpdate::AddRoute(route) => table.add_route(route),
            RouteUpdate::RemoveRoute { route_id, .. } => {
                table.remove_route(&route_id);
                Ok(())
            }
        }
    }
}
