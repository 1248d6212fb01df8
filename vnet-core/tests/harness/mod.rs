//! Test harness for controller integration tests
//!
//! Builds a three-router topology on a mock switch:
//!
//! - Router `i` (0..3) rejects `10.i.0.0/16` (weight 100) and owns ports
//!   `i*10 + j` (j = 0, 1) with network `10.i.j.0/24` at address `.1`.
//!   Only even ports are on this host.
//! - Router 0 links to routers 1 and 2 over logical ports; routers 1 and 2
//!   use that link as their default route.
//! - Router 0 blackholes the rest of `10.0.0.0/8`.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use uuid::Uuid;

use vnet_core::config::ControllerConfig;
use vnet_core::controller::Controller;
use vnet_core::driver::{PhysicalPort, PortStatus};
use vnet_core::routing::{NextHop, Route, RouteUpdate};
use vnet_core::test_util::{ManualClock, MockSwitchDriver};
use vnet_core::topology::{PortConfig, PortUpdate, RouterConfig, RouterUpdate};

/// Source MAC of the test hosts
pub const HOST_MAC: [u8; 6] = [0x02, 0x00, 0x11, 0x22, 0x00, 0x01];

/// MAC of the host answering ARP on router 2's local port
pub const NEXT_HOP_MAC: [u8; 6] = [0x02, 0xdd, 0xdd, 0xdd, 0xdd, 0x01];

pub const PORT_ON_0_TO_1: Uuid = Uuid::from_u128(331);
pub const PORT_ON_1_TO_0: Uuid = Uuid::from_u128(332);
pub const PORT_ON_0_TO_2: Uuid = Uuid::from_u128(333);
pub const PORT_ON_2_TO_0: Uuid = Uuid::from_u128(334);

pub struct TestNetwork {
    pub controller: Arc<Controller>,
    pub driver: Arc<MockSwitchDriver>,
    pub clock: Arc<ManualClock>,
    pub routers: Vec<Uuid>,
    /// Local switch ports: numbers 0, 10 and 20
    pub phy_ports: Vec<PhysicalPort>,
    next_route: u128,
}

pub fn router_id(i: u64) -> Uuid {
    Uuid::from_u64_pair(1234, i)
}

pub fn port_id(number: u16) -> Uuid {
    Uuid::from_u128(number as u128)
}

pub fn port_mac(number: u16) -> [u8; 6] {
    [0x02, 0xee, 0xdd, 0xcc, 0xff, number as u8]
}

fn net(addr: Ipv4Addr, len: u8) -> Ipv4Net {
    Ipv4Net::new(addr, len).unwrap()
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let driver = Arc::new(MockSwitchDriver::new());
        let clock = Arc::new(ManualClock::new());
        let controller = Arc::new(Controller::new(driver.clone(), clock.clone(), config));

        let mut network = TestNetwork {
            controller,
            driver,
            clock,
            routers: Vec::new(),
            phy_ports: Vec::new(),
            next_route: 1,
        };
        network.build();
        network
    }

    fn route_id(&mut self) -> Uuid {
        let id = Uuid::from_u64_pair(9999, self.next_route as u64);
        self.next_route += 1;
        id
    }

    fn build(&mut self) {
        let ctrl = self.controller.clone();

        for i in 0..3u8 {
            let rtr = router_id(i as u64);
            self.routers.push(rtr);
            ctrl.apply_router_update(RouterUpdate::Upsert(RouterConfig::new(rtr, format!("Test Router {}", i))))
                .unwrap();

            let router_nw = net(Ipv4Addr::new(10, i, 0, 0), 16);
            let reject = Route::new(self.route_id(), rtr, router_nw, NextHop::Reject, 100);
            ctrl.apply_route_update(RouteUpdate::AddRoute(reject)).unwrap();

            for j in 0..2u8 {
                let number = (i as u16) * 10 + j as u16;
                let id = port_id(number);
                let port_nw = net(Ipv4Addr::new(10, i, j, 0), 24);
                let route = Route::via_port(self.route_id(), rtr, port_nw, id, 2);
                let port = PortConfig::materialized(id, rtr, Ipv4Addr::new(10, i, j, 1), port_nw, vec![route]);
                ctrl.apply_port_update(PortUpdate::Upsert(port)).unwrap();

                if j % 2 == 0 {
                    let phy = PhysicalPort {
                        number,
                        hw_addr: port_mac(number),
                        port_id: id,
                    };
                    ctrl.on_port_status(phy.clone(), PortStatus::Added);
                    self.phy_ports.push(phy);
                }
            }
        }

        let link = net(Ipv4Addr::new(192, 168, 1, 0), 30);
        let near = Ipv4Addr::new(192, 168, 1, 1);
        let far = Ipv4Addr::new(192, 168, 1, 2);
        let (r0, r1, r2) = (self.routers[0], self.routers[1], self.routers[2]);

        for (port, rtr, addr, mac, peer) in [
            (PORT_ON_0_TO_1, r0, near, [0x02, 0xab, 0, 0, 3, 0x31], PORT_ON_1_TO_0),
            (PORT_ON_1_TO_0, r1, far, [0x02, 0xab, 0, 0, 3, 0x32], PORT_ON_0_TO_1),
            (PORT_ON_0_TO_2, r0, near, [0x02, 0xab, 0, 0, 3, 0x33], PORT_ON_2_TO_0),
            (PORT_ON_2_TO_0, r2, far, [0x02, 0xab, 0, 0, 3, 0x34], PORT_ON_0_TO_2),
        ] {
            ctrl.apply_port_update(PortUpdate::Upsert(PortConfig::logical(port, rtr, addr, link, mac, peer)))
                .unwrap();
        }

        let routes = [
            Route::via_port(self.route_id(), r0, net(Ipv4Addr::new(10, 1, 0, 0), 16), PORT_ON_0_TO_1, 2),
            Route::via_port(self.route_id(), r1, net(Ipv4Addr::UNSPECIFIED, 0), PORT_ON_1_TO_0, 10),
            Route::via_port(self.route_id(), r0, net(Ipv4Addr::new(10, 2, 0, 0), 16), PORT_ON_0_TO_2, 2),
            Route::via_port(self.route_id(), r2, net(Ipv4Addr::UNSPECIFIED, 0), PORT_ON_2_TO_0, 10),
            Route::new(self.route_id(), r0, net(Ipv4Addr::new(10, 0, 0, 0), 8), NextHop::Blackhole, 2),
        ];
        for route in routes {
            ctrl.apply_route_update(RouteUpdate::AddRoute(route)).unwrap();
        }
    }
}
