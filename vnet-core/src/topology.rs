//! Virtual topology: routers, their ports, and rule chains.
//!
//! Each collection is an `ArcSwap` snapshot. Packet processing loads the
//! current snapshot and never blocks; updates are serialized on
//! `write_lock` and published with copy-on-write.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::PhysicalPort;
use crate::routing::{Route, RouteUpdate, RoutingTable};
use crate::rules::{Chain, ChainDef, ChainSet};
use crate::validation::{Result, ValidationError};

/// Router definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    /// Chain applied to packets entering the router
    #[serde(default)]
    pub inbound_filter: Option<Uuid>,
    /// Chain applied to packets leaving the router
    #[serde(default)]
    pub outbound_filter: Option<Uuid>,
}

impl RouterConfig {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        RouterConfig {
            id,
            name: name.into(),
            inbound_filter: None,
            outbound_filter: None,
        }
    }
}

/// A router and its route table.
#[derive(Clone)]
pub struct Router {
    pub config: RouterConfig,
    pub routes: Arc<RoutingTable>,
}

impl Router {
    pub fn id(&self) -> Uuid {
        self.config.id
    }
}

/// Port-type specific configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum PortKind {
    /// Bound to a switch port. `routes` are active only while the port is
    /// present on this host; the MAC is the switch port's.
    Materialized {
        #[serde(default)]
        routes: Vec<Route>,
    },
    /// Link to a port of another router.
    Logical { hw_addr: [u8; 6], peer_id: Uuid },
}

/// Router port definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub id: Uuid,
    pub router_id: Uuid,
    /// The router's own address on this port
    pub port_addr: Ipv4Addr,
    /// Network reachable directly through this port
    pub nw: Ipv4Net,
    #[serde(flatten)]
    pub kind: PortKind,
}

impl PortConfig {
    pub fn materialized(id: Uuid, router_id: Uuid, port_addr: Ipv4Addr, nw: Ipv4Net, routes: Vec<Route>) -> Self {
        PortConfig {
            id,
            router_id,
            port_addr,
            nw,
            kind: PortKind::Materialized { routes },
        }
    }

    pub fn logical(
        id: Uuid,
        router_id: Uuid,
        port_addr: Ipv4Addr,
        nw: Ipv4Net,
        hw_addr: [u8; 6],
        peer_id: Uuid,
    ) -> Self {
        PortConfig {
            id,
            router_id,
            port_addr,
            nw,
            kind: PortKind::Logical { hw_addr, peer_id },
        }
    }

    pub fn is_logical(&self) -> bool {
        matches!(self.kind, PortKind::Logical { .. })
    }

    pub fn peer_id(&self) -> Option<Uuid> {
        match self.kind {
            PortKind::Logical { peer_id, .. } => Some(peer_id),
            PortKind::Materialized { .. } => None,
        }
    }

    fn routes(&self) -> &[Route] {
        match &self.kind {
            PortKind::Materialized { routes } => routes.as_slice(),
            PortKind::Logical { .. } => &[],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.nw.contains(&self.port_addr) {
            return Err(ValidationError::PortAddressOutsideNetwork(
                self.id,
                self.port_addr.to_string(),
                self.nw.to_string(),
            ));
        }
        match &self.kind {
            PortKind::Materialized { routes } => {
                for route in routes {
                    if route.router_id != self.router_id {
                        return Err(ValidationError::PortRouteForeignRouter(
                            self.id,
                            route.id,
                            self.router_id,
                        ));
                    }
                    route.validate()?;
                }
            }
            PortKind::Logical { peer_id, .. } => {
                if *peer_id == self.id {
                    return Err(ValidationError::SelfPeeredPort(self.id));
                }
            }
        }
        Ok(())
    }
}

/// Topology change replicated from the topology store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterUpdate {
    Upsert(RouterConfig),
    Remove(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortUpdate {
    Upsert(PortConfig),
    Remove(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainUpdate {
    Upsert(ChainDef),
    Remove(Uuid),
}

/// Switch ports of this host bound to virtual ports.
#[derive(Debug, Clone, Default)]
struct LocalPorts {
    by_number: HashMap<u16, PhysicalPort>,
    by_id: HashMap<Uuid, u16>,
}

/// Replicated topology state.
pub struct Topology {
    routers: ArcSwap<HashMap<Uuid, Arc<Router>>>,
    ports: ArcSwap<HashMap<Uuid, Arc<PortConfig>>>,
    chains: ArcSwap<ChainSet>,
    local: ArcSwap<LocalPorts>,
    write_lock: Mutex<()>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        Topology {
            routers: ArcSwap::new(Arc::new(HashMap::new())),
            ports: ArcSwap::new(Arc::new(HashMap::new())),
            chains: ArcSwap::new(Arc::new(ChainSet::new())),
            local: ArcSwap::new(Arc::new(LocalPorts::default())),
            write_lock: Mutex::new(()),
        }
    }

    pub fn router(&self, id: &Uuid) -> Option<Arc<Router>> {
        self.routers.load().get(id).cloned()
    }

    pub fn port(&self, id: &Uuid) -> Option<Arc<PortConfig>> {
        self.ports.load().get(id).cloned()
    }

    /// Current chain set.
    pub fn chains(&self) -> Arc<ChainSet> {
        self.chains.load_full()
    }

    /// Virtual port bound to switch port `number` on this host.
    pub fn local_port(&self, number: u16) -> Option<(Arc<PortConfig>, PhysicalPort)> {
        let local = self.local.load();
        let phy = local.by_number.get(&number)?;
        let port = self.port(&phy.port_id)?;
        Some((port, phy.clone()))
    }

    /// Switch port number of virtual port `id`, if it is local.
    pub fn local_number(&self, id: &Uuid) -> Option<u16> {
        self.local.load().by_id.get(id).copied()
    }

    /// MAC address the router uses on port `id`.
    ///
    /// Materialized ports use their switch port's address, so they have one
    /// only while local.
    pub fn port_mac(&self, port: &PortConfig) -> Option<[u8; 6]> {
        match &port.kind {
            PortKind::Logical { hw_addr, .. } => Some(*hw_addr),
            PortKind::Materialized { .. } => {
                let local = self.local.load();
                let number = local.by_id.get(&port.id)?;
                local.by_number.get(number).map(|p| p.hw_addr)
            }
        }
    }

    /// Port of `router_id` whose address is `addr`.
    pub fn router_port_with_addr(&self, router_id: &Uuid, addr: Ipv4Addr) -> Option<Arc<PortConfig>> {
        self.ports
            .load()
            .values()
            .find(|p| p.router_id == *router_id && p.port_addr == addr)
            .cloned()
    }

    pub fn apply_router_update(&self, update: RouterUpdate) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut routers = (**self.routers.load()).clone();
        match update {
            RouterUpdate::Upsert(config) => {
                let id = config.id;
                // Keep the existing route table across config changes.
                let routes = routers
                    .get(&id)
                    .map(|r| r.routes.clone())
                    .unwrap_or_else(|| Arc::new(RoutingTable::new(id)));
                info!(router = %id, name = %config.name, "Router updated");
                routers.insert(id, Arc::new(Router { config, routes }));
            }
            RouterUpdate::Remove(id) => {
                if routers.remove(&id).is_none() {
                    return Err(ValidationError::UnknownRouter(id));
                }
                info!(router = %id, "Router removed");
            }
        }
        self.routers.store(Arc::new(routers));
        Ok(())
    }

    pub fn apply_port_update(&self, update: PortUpdate) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ports = (**self.ports.load()).clone();
        match update {
            PortUpdate::Upsert(config) => {
                config.validate()?;
                let router = self
                    .router(&config.router_id)
                    .ok_or(ValidationError::UnknownRouter(config.router_id))?;

                // Swap the active routes of a local port to the new set.
                if self.local_number(&config.id).is_some() {
                    let old = ports.get(&config.id).map(|old| old.routes()).unwrap_or_default();
                    router.routes.replace_routes(old, config.routes())?;
                }
                debug!(port = %config.id, router = %config.router_id, addr = %config.port_addr, "Port updated");
                ports.insert(config.id, Arc::new(config));
            }
            PortUpdate::Remove(id) => {
                let old = ports.remove(&id).ok_or(ValidationError::UnknownPort(id))?;
                if self.local_number(&id).is_some()
                    && let Some(router) = self.router(&old.router_id)
                {
                    withdraw_routes(&router.routes, old.routes());
                }
                debug!(port = %id, "Port removed");
            }
        }
        self.ports.store(Arc::new(ports));
        Ok(())
    }

    pub fn apply_route_update(&self, update: RouteUpdate) -> Result<()> {
        let router_id = update.router_id();
        let router = self
            .router(&router_id)
            .ok_or(ValidationError::UnknownRouter(router_id))?;
        if let RouteUpdate::AddRoute(route) = &update
            && let Some(port_id) = route.next_hop_port
        {
            let port = self.port(&port_id).ok_or(ValidationError::UnknownPort(port_id))?;
            if port.router_id != router_id {
                return Err(ValidationError::RoutePortNotOnRouter(route.id, port_id, router_id));
            }
        }
        update.apply(&router.routes)
    }

    pub fn apply_chain_update(&self, update: ChainUpdate) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.chains.load();
        let next = match update {
            ChainUpdate::Upsert(def) => {
                let chain = Chain::try_from(def)?;
                debug!(chain = %chain.id, rules = chain.rules().len(), "Chain updated");
                current.with_chain(chain)
            }
            ChainUpdate::Remove(id) => {
                debug!(chain = %id, "Chain removed");
                current.without_chain(&id)
            }
        };
        self.chains.store(Arc::new(next));
        Ok(())
    }

    /// Bind a switch port to its virtual port and activate the port's routes.
    ///
    /// Returns the bound port config, or `None` if the virtual port is unknown.
    pub fn port_added(&self, phy: PhysicalPort) -> Option<Arc<PortConfig>> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(port) = self.port(&phy.port_id) else {
            warn!(number = phy.number, port = %phy.port_id, "Switch port bound to unknown virtual port");
            return None;
        };

        let mut local = (**self.local.load()).clone();
        local.by_id.insert(phy.port_id, phy.number);
        local.by_number.insert(phy.number, phy.clone());
        self.local.store(Arc::new(local));

        if let Some(router) = self.router(&port.router_id) {
            if let Err(e) = router.routes.replace_routes(&[], port.routes()) {
                warn!(port = %port.id, "Failed to activate port routes: {}", e);
            }
        }
        info!(number = phy.number, port = %port.id, router = %port.router_id, "Port is local");
        Some(port)
    }

    /// Unbind a switch port and withdraw its routes. Returns the virtual
    /// port that was bound.
    pub fn port_removed(&self, number: u16) -> Option<Arc<PortConfig>> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut local = (**self.local.load()).clone();
        let phy = local.by_number.remove(&number)?;
        local.by_id.remove(&phy.port_id);
        self.local.store(Arc::new(local));

        let port = self.port(&phy.port_id)?;
        if let Some(router) = self.router(&port.router_id) {
            withdraw_routes(&router.routes, port.routes());
        }
        info!(number, port = %port.id, "Port is no longer local");
        Some(port)
    }
}

fn withdraw_routes(table: &RoutingTable, routes: &[Route]) {
    if let Err(e) = table.replace_routes(routes, &[]) {
        warn!(router = %table.router_id(), "Failed to withdraw port routes: {}", e);
    }
}
