//! Router forwarding pipeline.
//!
//! `Controller` receives packets the switch could not match, walks them
//! through the virtual routers they cross, and turns the outcome into a
//! cached switch flow:
//!
//! 1. Parse; ARP is consumed locally, non-IPv4 gets a drop flow
//! 2. Inbound filter of the router
//! 3. Route lookup (logical ports continue at the peer router)
//! 4. Next-hop MAC resolution, possibly suspending the packet
//! 5. Outbound filter, then flow install and (if unbuffered) packet out

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smoltcp::wire::{ArpOperation, ArpRepr, EthernetFrame};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::arp::{ArpPolicy, ArpTable, ForwardingWork, Lookup, TimerActions};
use crate::config::{Clock, ControllerConfig};
use crate::driver::{PhysicalPort, PortStatus, SwitchDriver};
use crate::flow::{ETH_TYPE_ARP, FlowMatch, FlowMod, PacketOut, UNBUFFERED_ID, forward_actions};
use crate::packet::{self, UnreachableCode};
use crate::routing::{NextHop, RouteUpdate};
use crate::rules::{Action, ChainEnv, NatTable, PacketContext};
use crate::topology::{ChainUpdate, PortConfig, PortUpdate, Router, RouterUpdate, Topology};
use crate::validation::Result;

/// What happened to a packet handed to `on_packet_in`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A drop flow was installed (or the packet was discarded)
    Dropped,
    /// Dropped with an ICMP error sent to the source
    Rejected,
    /// A forwarding flow was installed
    Forwarded,
    /// Handled by the router itself; no flow
    Consumed,
    /// Waiting for next-hop resolution
    Pending,
}

/// Packet-in facts that stay fixed while crossing routers.
struct Ingress<'a> {
    original: FlowMatch,
    in_port: u16,
    buffer_id: u32,
    data: &'a [u8],
}

/// Result of passing a packet through one router.
enum Step {
    Done(Disposition),
    Peer {
        router_id: Uuid,
        ingress: Arc<PortConfig>,
    },
    Egress(Box<ForwardingWork>),
}

/// Packet decision engine for one switch.
pub struct Controller {
    driver: Arc<dyn SwitchDriver>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
    topology: Topology,
    arp: ArpTable,
    nat: NatTable,
}

impl Controller {
    pub fn new(driver: Arc<dyn SwitchDriver>, clock: Arc<dyn Clock>, config: ControllerConfig) -> Self {
        let arp = ArpTable::new(ArpPolicy::from(&config));
        let nat = NatTable::with_clock(clock.clone(), config.nat_idle_timeout());
        Controller {
            driver,
            clock,
            config,
            topology: Topology::new(),
            arp,
            nat,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn arp(&self) -> &ArpTable {
        &self.arp
    }

    pub fn nat(&self) -> &NatTable {
        &self.nat
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn apply_router_update(&self, update: RouterUpdate) -> Result<()> {
        self.topology.apply_router_update(update)
    }

    pub fn apply_port_update(&self, update: PortUpdate) -> Result<()> {
        let removed = match &update {
            PortUpdate::Remove(id) => Some(*id),
            PortUpdate::Upsert(_) => None,
        };
        self.topology.apply_port_update(update)?;
        if let Some(id) = removed {
            self.discard(self.arp.remove_port(id));
        }
        Ok(())
    }

    pub fn apply_route_update(&self, update: RouteUpdate) -> Result<()> {
        self.topology.apply_route_update(update)
    }

    pub fn apply_chain_update(&self, update: ChainUpdate) -> Result<()> {
        self.topology.apply_chain_update(update)
    }

    /// Switch port added or removed on this host.
    pub fn on_port_status(&self, phy: PhysicalPort, status: PortStatus) {
        match status {
            PortStatus::Added => {
                self.topology.port_added(phy);
            }
            PortStatus::Removed => {
                if let Some(port) = self.topology.port_removed(phy.number) {
                    self.discard(self.arp.remove_port(port.id));
                }
            }
        }
    }

    /// Decide what to do with a packet the switch sent up.
    pub fn on_packet_in(&self, buffer_id: u32, total_len: usize, in_port: u16, data: &[u8]) -> Disposition {
        let Some(original) = FlowMatch::from_packet(data, in_port) else {
            debug!(in_port, buffer_id, total_len, "Malformed packet, discarding");
            self.free_buffer(buffer_id, in_port);
            return Disposition::Dropped;
        };
        trace!(%original, buffer_id, total_len, "Packet in");

        let local = self.topology.local_port(in_port);

        if original.dl_type == ETH_TYPE_ARP {
            match &local {
                Some((port, phy)) => self.handle_arp(port, phy, data),
                None => debug!(in_port, "ARP from switch port without a virtual port, ignoring"),
            }
            self.free_buffer(buffer_id, in_port);
            return Disposition::Consumed;
        }

        let Some((port, _)) = local else {
            warn!(in_port, "Packet from switch port without a virtual port");
            self.install_drop(original, buffer_id);
            return Disposition::Dropped;
        };

        if !original.is_ipv4() {
            debug!(in_port, dl_type = original.dl_type, "Not IPv4, installing drop flow");
            self.install_drop(original, buffer_id);
            return Disposition::Dropped;
        }

        let pkt = Ingress {
            original,
            in_port,
            buffer_id,
            data,
        };
        let mut ctx = PacketContext::new(original, port.id);
        let mut router_id = port.router_id;
        let mut ingress = port;

        for _ in 0..self.config.max_router_hops {
            let Some(router) = self.topology.router(&router_id) else {
                warn!(router = %router_id, port = %ingress.id, "Port belongs to unknown router");
                self.install_drop(original, buffer_id);
                return Disposition::Dropped;
            };
            match self.traverse(&router, &ingress, &mut ctx, &pkt) {
                Step::Done(disposition) => return disposition,
                Step::Peer {
                    router_id: next,
                    ingress: peer,
                } => {
                    router_id = next;
                    ingress = peer;
                }
                Step::Egress(work) => return self.resolve(*work),
            }
        }

        warn!(%original, hops = self.config.max_router_hops, "Router hop limit exceeded, dropping");
        self.install_drop(original, buffer_id);
        Disposition::Dropped
    }

    /// Advance resolver retries, resolver expiry and NAT binding expiry to
    /// `now`.
    pub fn run_timers(&self, now: Instant) {
        let TimerActions { resend, expired } = self.arp.run_timers(now);
        for (port_id, ip) in resend {
            match self.topology.port(&port_id) {
                Some(port) => self.send_arp_request(&port, ip),
                None => debug!(port = %port_id, %ip, "Port gone, not re-sending ARP request"),
            }
        }
        self.discard(expired);
        self.nat.expire(now);
    }

    /// Current time of the controller's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    fn traverse(&self, router: &Router, ingress: &PortConfig, ctx: &mut PacketContext, pkt: &Ingress<'_>) -> Step {
        ctx.in_port_id = ingress.id;
        ctx.out_port_id = None;

        match self.apply_filter(router.config.inbound_filter, ctx) {
            Action::Drop => return Step::Done(self.drop_packet(pkt)),
            Action::Reject => {
                return Step::Done(self.reject_packet(pkt, ingress.port_addr, UnreachableCode::FilterProhibited));
            }
            _ => {}
        }

        let (Some(src), Some(dst)) = (ctx.flow_match.nw_src, ctx.flow_match.nw_dst) else {
            return Step::Done(self.drop_packet(pkt));
        };

        if self.topology.router_port_with_addr(&router.id(), dst).is_some() {
            return Step::Done(self.deliver_local(pkt));
        }

        let Some(route) = router.routes.best_route(src, dst) else {
            debug!(router = %router.id(), %src, %dst, "No route");
            return Step::Done(self.reject_packet(pkt, ingress.port_addr, UnreachableCode::Net));
        };
        trace!(router = %router.id(), route = %route.id, next_hop = ?route.next_hop, "Route matched");

        let port_id = match route.next_hop {
            NextHop::Blackhole => return Step::Done(self.drop_packet(pkt)),
            NextHop::Reject => {
                return Step::Done(self.reject_packet(pkt, ingress.port_addr, UnreachableCode::FilterProhibited));
            }
            NextHop::Local => return Step::Done(self.deliver_local(pkt)),
            NextHop::Port => match route.next_hop_port {
                Some(id) => id,
                None => return Step::Done(self.drop_packet(pkt)),
            },
        };

        let Some(egress) = self.topology.port(&port_id) else {
            warn!(route = %route.id, port = %port_id, "Route points at unknown port");
            return Step::Done(self.drop_packet(pkt));
        };
        ctx.out_port_id = Some(egress.id);

        if let Some(peer_id) = egress.peer_id() {
            match self.apply_filter(router.config.outbound_filter, ctx) {
                Action::Drop => return Step::Done(self.drop_packet(pkt)),
                Action::Reject => {
                    return Step::Done(self.reject_packet(pkt, egress.port_addr, UnreachableCode::FilterProhibited));
                }
                _ => {}
            }
            let Some(peer) = self.topology.port(&peer_id) else {
                warn!(port = %egress.id, peer = %peer_id, "Logical port peer unknown");
                return Step::Done(self.drop_packet(pkt));
            };
            return Step::Peer {
                router_id: peer.router_id,
                ingress: peer,
            };
        }

        if self.topology.local_number(&egress.id).is_none() {
            // Tunnelling to other hosts is not handled here.
            warn!(port = %egress.id, %dst, "Egress port is not on this host, dropping");
            return Step::Done(self.drop_packet(pkt));
        }

        Step::Egress(Box::new(ForwardingWork {
            original: pkt.original,
            ctx: ctx.clone(),
            in_port: pkt.in_port,
            buffer_id: pkt.buffer_id,
            data: pkt.data.to_vec(),
            router_id: router.id(),
            egress_port: egress.id,
            next_hop_ip: route.next_hop_ip(dst),
        }))
    }

    fn resolve(&self, work: ForwardingWork) -> Disposition {
        let egress = work.egress_port;
        let next_hop = work.next_hop_ip;
        match self.arp.resolve(work, self.clock.now()) {
            Lookup::Resolved(mac, work) => self.complete(*work, mac),
            Lookup::Requested => {
                match self.topology.port(&egress) {
                    Some(port) => self.send_arp_request(&port, next_hop),
                    None => warn!(port = %egress, "Egress port vanished before ARP request"),
                }
                Disposition::Pending
            }
            Lookup::Queued => Disposition::Pending,
            Lookup::Overflow(work) => {
                self.free_buffer(work.buffer_id, work.in_port);
                Disposition::Dropped
            }
        }
    }

    /// Finish forwarding once the next hop's MAC is known.
    fn complete(&self, mut work: ForwardingWork, next_hop_mac: [u8; 6]) -> Disposition {
        let (Some(port), Some(out_port)) = (
            self.topology.port(&work.egress_port),
            self.topology.local_number(&work.egress_port),
        ) else {
            warn!(port = %work.egress_port, "Egress port left this host, dropping");
            self.install_drop(work.original, work.buffer_id);
            return Disposition::Dropped;
        };
        let Some(port_mac) = self.topology.port_mac(&port) else {
            self.install_drop(work.original, work.buffer_id);
            return Disposition::Dropped;
        };

        work.ctx.flow_match.dl_src = port_mac;
        work.ctx.flow_match.dl_dst = next_hop_mac;

        let outbound = self
            .topology
            .router(&work.router_id)
            .and_then(|r| r.config.outbound_filter);
        let pkt = Ingress {
            original: work.original,
            in_port: work.in_port,
            buffer_id: work.buffer_id,
            data: &work.data,
        };
        match self.apply_filter(outbound, &mut work.ctx) {
            Action::Drop => return self.drop_packet(&pkt),
            Action::Reject => return self.reject_packet(&pkt, port.port_addr, UnreachableCode::FilterProhibited),
            _ => {}
        }

        let actions = forward_actions(&work.original, &work.ctx.flow_match, out_port);
        debug!(
            flow = %work.original,
            out_port,
            next_hop = %work.next_hop_ip,
            "Installing forward flow"
        );
        if let Err(e) = self
            .driver
            .install_flow(FlowMod::forward(work.original, actions.clone(), work.buffer_id))
        {
            warn!(flow = %work.original, "Failed to install flow: {}", e);
        }

        if work.buffer_id == UNBUFFERED_ID {
            let out = PacketOut {
                buffer_id: UNBUFFERED_ID,
                in_port: work.in_port,
                actions,
                data: work.data,
            };
            if let Err(e) = self.driver.send_packet(out) {
                warn!(in_port = work.in_port, "Failed to send packet: {}", e);
            }
        }
        Disposition::Forwarded
    }

    fn apply_filter(&self, chain_id: Option<Uuid>, ctx: &mut PacketContext) -> Action {
        let Some(chain_id) = chain_id else {
            return Action::Accept;
        };
        let chains = self.topology.chains();
        let Some(chain) = chains.get(&chain_id) else {
            warn!(chain = %chain_id, "Filter chain not found, accepting");
            return Action::Accept;
        };
        let env = ChainEnv {
            chains: &chains,
            nat: &self.nat,
        };
        let result = chain.apply(ctx, &env);
        if ctx.is_traced() {
            info!(
                chain = %chain_id,
                action = ?result.action,
                matched = ?ctx.matched_rules(),
                "Traced packet"
            );
        }
        match result.action {
            Action::Drop | Action::Reject => result.action,
            _ => Action::Accept,
        }
    }

    fn handle_arp(&self, port: &PortConfig, phy: &PhysicalPort, data: &[u8]) {
        let Some(repr) = EthernetFrame::new_checked(data)
            .ok()
            .and_then(|frame| packet::parse_arp(frame.payload()))
        else {
            return;
        };
        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = repr
        else {
            return;
        };
        let sender_ip = Ipv4Addr::from(source_protocol_addr);
        let sender_mac = source_hardware_addr.0;
        let target_ip = Ipv4Addr::from(target_protocol_addr);

        if operation == ArpOperation::Request && target_ip == port.port_addr {
            debug!(port = %port.id, %sender_ip, "Answering ARP request for port address");
            let reply = packet::build_arp_reply_frame(phy.hw_addr, port.port_addr, sender_mac, sender_ip);
            self.send(PacketOut::generated(phy.number, reply));
        }

        if port.nw.contains(&sender_ip) && sender_ip != port.port_addr && !sender_ip.is_unspecified() {
            let waiting = self.arp.learn(port.id, sender_ip, sender_mac, self.clock.now());
            for work in waiting {
                self.complete(work, sender_mac);
            }
        }
    }

    /// Packet addressed to the router itself.
    fn deliver_local(&self, pkt: &Ingress<'_>) -> Disposition {
        if let Some((_, phy)) = self.topology.local_port(pkt.in_port)
            && let Some(reply) = packet::build_icmp_echo_reply(pkt.data, phy.hw_addr)
        {
            debug!(in_port = pkt.in_port, "Answering ICMP echo request");
            self.send(PacketOut::generated(pkt.in_port, reply));
        }
        self.free_buffer(pkt.buffer_id, pkt.in_port);
        Disposition::Consumed
    }

    fn drop_packet(&self, pkt: &Ingress<'_>) -> Disposition {
        self.install_drop(pkt.original, pkt.buffer_id);
        Disposition::Dropped
    }

    fn reject_packet(&self, pkt: &Ingress<'_>, src_ip: Ipv4Addr, code: UnreachableCode) -> Disposition {
        if packet::can_send_icmp_error(pkt.data)
            && let Some((_, phy)) = self.topology.local_port(pkt.in_port)
            && let Some(error) = packet::build_icmp_unreachable(pkt.data, phy.hw_addr, src_ip, code)
        {
            debug!(in_port = pkt.in_port, ?code, "Sending ICMP unreachable");
            self.send(PacketOut::generated(pkt.in_port, error));
        }
        self.install_drop(pkt.original, pkt.buffer_id);
        Disposition::Rejected
    }

    fn send_arp_request(&self, port: &PortConfig, target: Ipv4Addr) {
        let (Some(number), Some(mac)) = (self.topology.local_number(&port.id), self.topology.port_mac(port)) else {
            debug!(port = %port.id, %target, "Port not local, cannot send ARP request");
            return;
        };
        debug!(port = %port.id, %target, "Sending ARP request");
        let request = packet::build_arp_request_frame(mac, port.port_addr, target);
        self.send(PacketOut::generated(number, request));
    }

    /// Drop packets that will never be forwarded.
    fn discard(&self, works: Vec<ForwardingWork>) {
        for work in works {
            self.free_buffer(work.buffer_id, work.in_port);
        }
    }

    fn install_drop(&self, flow_match: FlowMatch, buffer_id: u32) {
        debug!(flow = %flow_match, buffer_id, "Installing drop flow");
        if let Err(e) = self.driver.install_flow(FlowMod::drop(flow_match, buffer_id)) {
            warn!(flow = %flow_match, "Failed to install drop flow: {}", e);
        }
    }

    fn send(&self, packet: PacketOut) {
        if let Err(e) = self.driver.send_packet(packet) {
            warn!("Failed to send packet: {}", e);
        }
    }

    fn free_buffer(&self, buffer_id: u32, in_port: u16) {
        if buffer_id == UNBUFFERED_ID {
            return;
        }
        if let Err(e) = self.driver.free_buffer(buffer_id, in_port) {
            warn!(buffer_id, in_port, "Failed to free buffer: {}", e);
        }
    }
}

/// Drive `controller.run_timers` every `period` until the task is aborted.
pub fn spawn_resolution_timer(controller: Arc<Controller>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            controller.run_timers(controller.now());
        }
    })
}
