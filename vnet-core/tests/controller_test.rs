//! Forwarding pipeline scenarios on the three-router test network.

mod harness;

use std::net::Ipv4Addr;
use std::time::Duration;

use smoltcp::wire::{EthernetFrame, Icmpv4Message, Icmpv4Packet, Ipv4Packet};
use uuid::Uuid;

use harness::{HOST_MAC, NEXT_HOP_MAC, TestNetwork, port_mac};
use vnet_core::Disposition;
use vnet_core::config::ControllerConfig;
use vnet_core::driver::PortStatus;
use vnet_core::flow::{FlowAction, FlowMatch, FlowMod, IDLE_TIMEOUT_SECS, PORT_NONE, UNBUFFERED_ID};
use vnet_core::packet::{UnreachableCode, build_icmp_unreachable};
use vnet_core::rules::{Action, ChainDef, Condition, NatRuleData, NatTarget, PortRange, RuleDef, RuleType};
use vnet_core::test_util::packets::{make_arp_reply, make_arp_request, make_ethernet, make_icmp_echo_request, make_udp};
use vnet_core::topology::{ChainUpdate, RouterConfig, RouterUpdate};

const PAYLOAD: &[u8] = &[0xab, 0xcd, 0xef];

fn udp_to(net: &TestNetwork, port_index: usize, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let phy = &net.phy_ports[port_index];
    make_udp(HOST_MAC, phy.hw_addr, src, dst, 101, 212, PAYLOAD)
}

fn assert_drop_flow(flow: &FlowMod, data: &[u8], in_port: u16, buffer_id: u32) {
    assert_eq!(flow.flow_match, FlowMatch::from_packet(data, in_port).unwrap());
    assert_eq!(flow.idle_timeout, IDLE_TIMEOUT_SECS);
    assert_eq!(flow.buffer_id, buffer_id);
    assert!(flow.send_flow_removed);
    assert!(flow.actions.is_empty());
}

/// (ICMP type, code, IP source, IP destination) of an emitted frame
fn icmp_summary(frame: &[u8]) -> (Icmpv4Message, u8, Ipv4Addr, Ipv4Addr) {
    let eth = EthernetFrame::new_checked(frame).unwrap();
    let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
    let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
    (
        icmp.msg_type(),
        icmp.msg_code(),
        Ipv4Addr::from(ip.src_addr()),
        Ipv4Addr::from(ip.dst_addr()),
    )
}

#[test]
fn test_one_router_blackhole() {
    let net = TestNetwork::new();
    let data = udp_to(&net, 0, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 4, 0, 5));

    let d = net.controller.on_packet_in(55, data.len(), 0, &data);
    assert_eq!(d, Disposition::Dropped);

    assert!(net.driver.packets().is_empty());
    assert!(net.driver.dropped().is_empty());
    let flows = net.driver.flows();
    assert_eq!(flows.len(), 1);
    assert_drop_flow(&flows[0], &data, 0, 55);
}

#[test]
fn test_partially_captured_packet_gets_a_flow() {
    // Switches send only the head of a buffered packet.
    let net = TestNetwork::new();
    let phy = &net.phy_ports[0];
    let data = make_udp(
        HOST_MAC,
        phy.hw_addr,
        Ipv4Addr::new(10, 0, 0, 5),
        Ipv4Addr::new(10, 4, 0, 5),
        101,
        212,
        &[0x5a; 400],
    );

    let d = net.controller.on_packet_in(55, data.len(), 0, &data[..128]);
    assert_eq!(d, Disposition::Dropped);

    assert!(net.driver.dropped().is_empty());
    let flows = net.driver.flows();
    assert_eq!(flows.len(), 1);
    assert_drop_flow(&flows[0], &data, 0, 55);
}

#[test]
fn test_partially_captured_packet_is_forwarded() {
    let net = TestNetwork::new();
    let port_out = net.phy_ports[2].clone();
    let reply = make_arp_reply(NEXT_HOP_MAC, port_out.hw_addr, Ipv4Addr::new(10, 2, 0, 8), Ipv4Addr::new(10, 2, 0, 1));
    net.controller.on_packet_in(UNBUFFERED_ID, reply.len(), port_out.number, &reply);

    let data = make_udp(
        HOST_MAC,
        net.phy_ports[1].hw_addr,
        Ipv4Addr::new(10, 1, 0, 5),
        Ipv4Addr::new(10, 2, 0, 8),
        101,
        212,
        &[0x5a; 1400],
    );
    let d = net.controller.on_packet_in(56, data.len(), 10, &data[..128]);
    assert_eq!(d, Disposition::Forwarded);

    let flows = net.driver.flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].flow_match, FlowMatch::from_packet(&data, 10).unwrap());
    assert_eq!(flows[0].buffer_id, 56);
    assert_eq!(flows[0].actions.last(), Some(&FlowAction::Output(port_out.number)));
}

#[test]
fn test_same_packet_twice_installs_equal_flows() {
    let net = TestNetwork::new();
    let data = udp_to(&net, 0, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 4, 0, 5));

    net.controller.on_packet_in(55, data.len(), 0, &data);
    net.controller.on_packet_in(55, data.len(), 0, &data);

    let flows = net.driver.flows();
    assert_eq!(flows.len(), 2);
    assert_eq!(flows[0], flows[1]);
}

#[test]
fn test_one_router_pkt_consumed() {
    let net = TestNetwork::new();
    let data = make_arp_request(
        [0x02, 0xaa, 0xbb, 0xaa, 0xbb, 0x0c],
        Ipv4Addr::from(0x0123_4567),
        Ipv4Addr::from(0x7654_3210),
    );

    let d = net.controller.on_packet_in(1001, data.len(), 0, &data);
    assert_eq!(d, Disposition::Consumed);
    assert!(net.driver.packets().is_empty());
    assert!(net.driver.flows().is_empty());
    assert_eq!(net.driver.dropped(), vec![1001]);

    // Unbuffered: nothing to free.
    net.controller.on_packet_in(UNBUFFERED_ID, data.len(), 0, &data);
    assert!(net.driver.packets().is_empty());
    assert!(net.driver.flows().is_empty());
    assert_eq!(net.driver.dropped(), vec![1001]);
}

#[test]
fn test_one_router_not_ipv4() {
    let net = TestNetwork::new();
    let data = make_ethernet([0x02, 0xab, 0xcd, 0xef, 0x01, 0x23], port_mac(0), 0x86dd, 100);

    let d = net.controller.on_packet_in(123456, data.len(), 0, &data);
    assert_eq!(d, Disposition::Dropped);

    assert!(net.driver.packets().is_empty());
    assert!(net.driver.dropped().is_empty());
    let flows = net.driver.flows();
    assert_eq!(flows.len(), 1);
    assert_drop_flow(&flows[0], &data, 0, 123456);
    assert_eq!(flows[0].flow_match.nw_src, None);
}

#[test]
fn test_one_router_no_route() {
    let net = TestNetwork::new();
    let data = udp_to(&net, 0, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(11, 0, 0, 5));

    let d = net.controller.on_packet_in(565656, data.len(), 0, &data);
    assert_eq!(d, Disposition::Rejected);

    assert!(net.driver.dropped().is_empty());
    let flows = net.driver.flows();
    assert_eq!(flows.len(), 1);
    assert_drop_flow(&flows[0], &data, 0, 565656);

    let packets = net.driver.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].actions, vec![FlowAction::Output(0)]);
    assert_eq!(packets[0].buffer_id, UNBUFFERED_ID);
    let (msg, code, src, dst) = icmp_summary(&packets[0].data);
    assert_eq!(msg, Icmpv4Message::DstUnreachable);
    assert_eq!(code, 0);
    assert_eq!(src, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(dst, Ipv4Addr::new(10, 0, 0, 5));
    assert_eq!(&packets[0].data[0..6], &HOST_MAC);
}

#[test]
fn test_one_router_reject() {
    let net = TestNetwork::new();
    let data = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 1, 3, 5));

    let d = net.controller.on_packet_in(11111, data.len(), 10, &data);
    assert_eq!(d, Disposition::Rejected);

    assert!(net.driver.dropped().is_empty());
    let flows = net.driver.flows();
    assert_eq!(flows.len(), 1);
    assert_drop_flow(&flows[0], &data, 10, 11111);

    let packets = net.driver.packets();
    assert_eq!(packets.len(), 1);
    let (msg, code, src, _) = icmp_summary(&packets[0].data);
    assert_eq!(msg, Icmpv4Message::DstUnreachable);
    assert_eq!(code, 13);
    assert_eq!(src, Ipv4Addr::new(10, 1, 0, 1));
}

#[test]
fn test_routes_of_remote_port_are_inactive() {
    // Port 1 is not on this host, so 10.0.1.0/24 falls to the REJECT route.
    let net = TestNetwork::new();
    let data = udp_to(&net, 0, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 1, 5));

    assert_eq!(net.controller.on_packet_in(7, data.len(), 0, &data), Disposition::Rejected);
}

#[test]
fn test_no_icmp_error_about_icmp_error() {
    let net = TestNetwork::new();
    let original = make_udp(HOST_MAC, port_mac(0), Ipv4Addr::new(11, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 5), 53, 53, PAYLOAD);
    let error = build_icmp_unreachable(&original, HOST_MAC, Ipv4Addr::new(10, 0, 0, 5), UnreachableCode::Host).unwrap();

    // 11.0.0.5 has no route, but the packet is itself an ICMP error.
    let d = net.controller.on_packet_in(2, error.len(), 0, &error);
    assert_eq!(d, Disposition::Rejected);
    assert!(net.driver.packets().is_empty());
    assert_eq!(net.driver.flows().len(), 1);
}

#[test]
fn test_three_routers_local_output() {
    let net = TestNetwork::new();
    let port_in = net.phy_ports[1].clone();
    let port_out = net.phy_ports[2].clone();
    let data = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 2, 0, 8));

    let d = net.controller.on_packet_in(UNBUFFERED_ID, data.len(), port_in.number, &data);
    assert_eq!(d, Disposition::Pending);

    // The router has to ARP first: no flow, one ARP request.
    assert!(net.driver.flows().is_empty());
    assert!(net.driver.dropped().is_empty());
    let packets = net.driver.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].actions, vec![FlowAction::Output(port_out.number)]);
    assert_eq!(packets[0].buffer_id, UNBUFFERED_ID);
    assert_eq!(packets[0].in_port, PORT_NONE);
    let expected_arp = make_arp_request(port_out.hw_addr, Ipv4Addr::new(10, 2, 0, 1), Ipv4Addr::new(10, 2, 0, 8));
    assert_eq!(packets[0].data, expected_arp);

    // The reply installs the flow, re-emits the unbuffered packet, and is
    // itself consumed.
    let reply = make_arp_reply(NEXT_HOP_MAC, port_out.hw_addr, Ipv4Addr::new(10, 2, 0, 8), Ipv4Addr::new(10, 2, 0, 1));
    let d = net.controller.on_packet_in(8765, reply.len(), port_out.number, &reply);
    assert_eq!(d, Disposition::Consumed);
    assert_eq!(net.driver.dropped(), vec![8765]);

    let expected_actions = vec![
        FlowAction::SetDlSrc(port_out.hw_addr),
        FlowAction::SetDlDst(NEXT_HOP_MAC),
        FlowAction::Output(port_out.number),
    ];
    let flows = net.driver.flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].flow_match, FlowMatch::from_packet(&data, port_in.number).unwrap());
    assert_eq!(flows[0].idle_timeout, IDLE_TIMEOUT_SECS);
    assert_eq!(flows[0].buffer_id, UNBUFFERED_ID);
    assert!(flows[0].send_flow_removed);
    assert_eq!(flows[0].actions, expected_actions);

    let packets = net.driver.packets();
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[1].buffer_id, UNBUFFERED_ID);
    assert_eq!(packets[1].in_port, port_in.number);
    assert_eq!(packets[1].data, data);
    assert_eq!(packets[1].actions, expected_actions);

    // Resolved now: the next packet is forwarded at once.
    let d = net.controller.on_packet_in(99, data.len(), port_in.number, &data);
    assert_eq!(d, Disposition::Forwarded);
    let flows = net.driver.flows();
    assert_eq!(flows.len(), 2);
    assert_eq!(flows[1].actions, expected_actions);
    assert_eq!(flows[1].buffer_id, 99);
    // Buffered: the switch applies the flow, no packet out.
    assert_eq!(net.driver.packets().len(), 2);
}

#[test]
fn test_pending_packets_flush_in_order() {
    let net = TestNetwork::new();
    let port_out = net.phy_ports[2].clone();
    let first = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 2, 0, 8));
    let second = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 6), Ipv4Addr::new(10, 2, 0, 8));

    assert_eq!(net.controller.on_packet_in(1, first.len(), 10, &first), Disposition::Pending);
    assert_eq!(net.controller.on_packet_in(2, second.len(), 10, &second), Disposition::Pending);
    // Only one ARP request per next hop.
    assert_eq!(net.driver.packets().len(), 1);

    let reply = make_arp_reply(NEXT_HOP_MAC, port_out.hw_addr, Ipv4Addr::new(10, 2, 0, 8), Ipv4Addr::new(10, 2, 0, 1));
    net.controller.on_packet_in(UNBUFFERED_ID, reply.len(), port_out.number, &reply);

    let buffers: Vec<u32> = net.driver.flows().iter().map(|f| f.buffer_id).collect();
    assert_eq!(buffers, vec![1, 2]);
}

#[test]
fn test_arp_timeout_drops_queued_packets() {
    let net = TestNetwork::new();
    let retries = net.controller.config().arp_max_retries;
    let interval = net.controller.config().arp_retry_interval();
    let data = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 2, 0, 8));

    assert_eq!(net.controller.on_packet_in(77, data.len(), 10, &data), Disposition::Pending);
    assert_eq!(net.driver.packets().len(), 1);

    for attempt in 2..=retries {
        net.clock.advance(interval);
        net.controller.run_timers(net.controller.now());
        assert_eq!(net.driver.packets().len(), attempt as usize);
    }

    net.clock.advance(interval);
    net.controller.run_timers(net.controller.now());
    assert_eq!(net.driver.packets().len(), retries as usize);
    assert!(net.driver.flows().is_empty());
    assert_eq!(net.driver.dropped(), vec![77]);
    assert!(net.controller.arp().is_empty());
}

#[test]
fn test_pending_queue_cap() {
    let config = ControllerConfig {
        max_pending_packets: 1,
        ..Default::default()
    };
    let net = TestNetwork::with_config(config);
    let data = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 2, 0, 8));

    assert_eq!(net.controller.on_packet_in(1, data.len(), 10, &data), Disposition::Pending);
    assert_eq!(net.controller.on_packet_in(2, data.len(), 10, &data), Disposition::Dropped);
    assert_eq!(net.driver.dropped(), vec![2]);
    assert!(net.driver.flows().is_empty());
}

#[test]
fn test_port_removal_drops_pending() {
    let net = TestNetwork::new();
    let data = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 2, 0, 8));
    net.controller.on_packet_in(31, data.len(), 10, &data);

    net.controller.on_port_status(net.phy_ports[2].clone(), PortStatus::Removed);
    assert_eq!(net.driver.dropped(), vec![31]);

    // Its subnet route is gone too: 10.2.0.0/24 now hits router 2's REJECT.
    let d = net.controller.on_packet_in(32, data.len(), 10, &data);
    assert_eq!(d, Disposition::Rejected);
}

#[test]
fn test_router_hop_limit() {
    let config = ControllerConfig {
        max_router_hops: 2,
        ..Default::default()
    };
    let net = TestNetwork::with_config(config);
    let data = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 2, 0, 8));

    assert_eq!(net.controller.on_packet_in(5, data.len(), 10, &data), Disposition::Dropped);
    let flows = net.driver.flows();
    assert_eq!(flows.len(), 1);
    assert!(flows[0].is_drop());
}

#[test]
fn test_echo_request_to_port_address() {
    let net = TestNetwork::new();
    let ping = make_icmp_echo_request(HOST_MAC, port_mac(0), Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1), 7, 1);

    let d = net.controller.on_packet_in(400, ping.len(), 0, &ping);
    assert_eq!(d, Disposition::Consumed);
    assert!(net.driver.flows().is_empty());
    assert_eq!(net.driver.dropped(), vec![400]);

    let packets = net.driver.packets();
    assert_eq!(packets.len(), 1);
    let (msg, _, src, dst) = icmp_summary(&packets[0].data);
    assert_eq!(msg, Icmpv4Message::EchoReply);
    assert_eq!(src, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(dst, Ipv4Addr::new(10, 0, 0, 5));
}

#[test]
fn test_arp_request_for_port_address_is_answered() {
    let net = TestNetwork::new();
    let request = make_arp_request(HOST_MAC, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1));

    net.controller.on_packet_in(UNBUFFERED_ID, request.len(), 0, &request);

    let packets = net.driver.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].actions, vec![FlowAction::Output(0)]);
    let expected = make_arp_reply(port_mac(0), HOST_MAC, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 5));
    assert_eq!(packets[0].data, expected);
}

#[test]
fn test_gratuitous_arp_fills_cache() {
    let net = TestNetwork::new();
    let port_out = net.phy_ports[2].clone();
    let announce = make_arp_request(NEXT_HOP_MAC, Ipv4Addr::new(10, 2, 0, 8), Ipv4Addr::new(10, 2, 0, 8));
    net.controller.on_packet_in(UNBUFFERED_ID, announce.len(), port_out.number, &announce);

    let data = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 2, 0, 8));
    assert_eq!(net.controller.on_packet_in(3, data.len(), 10, &data), Disposition::Forwarded);
    assert_eq!(net.driver.flows()[0].actions[1], FlowAction::SetDlDst(NEXT_HOP_MAC));
}

fn rule(id: u128, chain: Uuid, action: Action, condition: Condition) -> RuleDef {
    RuleDef {
        id: Uuid::from_u128(id),
        chain_id: chain,
        rule_type: RuleType::Literal,
        action: Some(action),
        condition: Some(condition),
        jump_chain_id: None,
        nat: None,
        l2_transform: None,
        meter_name: None,
    }
}

fn set_filters(net: &TestNetwork, router: usize, inbound: Option<Uuid>, outbound: Option<Uuid>) {
    let mut config = RouterConfig::new(net.routers[router], format!("Test Router {}", router));
    config.inbound_filter = inbound;
    config.outbound_filter = outbound;
    net.controller.apply_router_update(RouterUpdate::Upsert(config)).unwrap();
}

#[test]
fn test_inbound_filter_drop_and_reject() {
    let net = TestNetwork::new();
    let chain = Uuid::from_u128(0xc1);
    let dns_only = Condition {
        tp_dst: Some(PortRange::single(212)),
        ..Condition::TRUE
    };
    net.controller
        .apply_chain_update(ChainUpdate::Upsert(ChainDef {
            id: chain,
            name: "in".into(),
            rules: vec![rule(1, chain, Action::Drop, dns_only.clone())],
        }))
        .unwrap();
    set_filters(&net, 1, Some(chain), None);

    let data = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 2, 0, 8));
    assert_eq!(net.controller.on_packet_in(1, data.len(), 10, &data), Disposition::Dropped);
    assert!(net.driver.packets().is_empty());
    assert!(net.driver.flows()[0].is_drop());

    net.driver.clear();
    net.controller
        .apply_chain_update(ChainUpdate::Upsert(ChainDef {
            id: chain,
            name: "in".into(),
            rules: vec![rule(1, chain, Action::Reject, dns_only)],
        }))
        .unwrap();
    assert_eq!(net.controller.on_packet_in(2, data.len(), 10, &data), Disposition::Rejected);
    let packets = net.driver.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(icmp_summary(&packets[0].data).1, 13);
}

#[test]
fn test_outbound_snat_rewrites_flow() {
    let net = TestNetwork::new();
    let port_out = net.phy_ports[2].clone();
    let chain = Uuid::from_u128(0xc2);
    let nat_ip = Ipv4Addr::new(192, 0, 2, 10);
    net.controller
        .apply_chain_update(ChainUpdate::Upsert(ChainDef {
            id: chain,
            name: "out".into(),
            rules: vec![RuleDef {
                rule_type: RuleType::Nat,
                nat: Some(NatRuleData {
                    dnat: false,
                    reverse: false,
                    targets: vec![NatTarget::new(nat_ip, nat_ip, 40000, 40000)],
                }),
                ..rule(1, chain, Action::Accept, Condition::TRUE)
            }],
        }))
        .unwrap();
    set_filters(&net, 2, None, Some(chain));

    let reply = make_arp_reply(NEXT_HOP_MAC, port_out.hw_addr, Ipv4Addr::new(10, 2, 0, 8), Ipv4Addr::new(10, 2, 0, 1));
    net.controller.on_packet_in(UNBUFFERED_ID, reply.len(), port_out.number, &reply);

    let data = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 2, 0, 8));
    assert_eq!(net.controller.on_packet_in(4, data.len(), 10, &data), Disposition::Forwarded);
    assert_eq!(
        net.driver.flows()[0].actions,
        vec![
            FlowAction::SetDlSrc(port_out.hw_addr),
            FlowAction::SetDlDst(NEXT_HOP_MAC),
            FlowAction::SetNwSrc(nat_ip),
            FlowAction::SetTpSrc(40000),
            FlowAction::Output(port_out.number),
        ]
    );
    assert_eq!(net.controller.nat().len(), 1);

    // Idle bindings are reclaimed by the controller timers.
    net.clock.advance(net.controller.config().nat_idle_timeout());
    net.controller.run_timers(net.controller.now());
    assert!(net.controller.nat().is_empty());
}

#[test]
fn test_driver_failures_are_not_fatal() {
    let net = TestNetwork::new();
    net.driver.set_failing(true);
    let data = udp_to(&net, 0, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 4, 0, 5));

    assert_eq!(net.controller.on_packet_in(55, data.len(), 0, &data), Disposition::Dropped);
    assert_eq!(net.driver.flows().len(), 1);
}

#[test]
fn test_unknown_switch_port() {
    let net = TestNetwork::new();
    let data = udp_to(&net, 0, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 4, 0, 5));

    assert_eq!(net.controller.on_packet_in(8, data.len(), 42, &data), Disposition::Dropped);
    assert_eq!(net.driver.flows()[0].flow_match.in_port, 42);
}

#[test]
fn test_arp_from_unbound_switch_port_is_consumed() {
    let net = TestNetwork::new();
    let data = make_arp_request(HOST_MAC, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1));

    let d = net.controller.on_packet_in(1002, data.len(), 42, &data);
    assert_eq!(d, Disposition::Consumed);
    assert!(net.driver.flows().is_empty());
    assert!(net.driver.packets().is_empty());
    assert_eq!(net.driver.dropped(), vec![1002]);
}

#[test]
fn test_truncated_frame_is_discarded() {
    let net = TestNetwork::new();
    let d = net.controller.on_packet_in(9, 4, 0, &[1, 2, 3, 4]);
    assert_eq!(d, Disposition::Dropped);
    assert!(net.driver.flows().is_empty());
    assert_eq!(net.driver.dropped(), vec![9]);
}

#[test]
fn test_expired_arp_entry_is_resolved_again() {
    let net = TestNetwork::new();
    let port_out = net.phy_ports[2].clone();
    let reply = make_arp_reply(NEXT_HOP_MAC, port_out.hw_addr, Ipv4Addr::new(10, 2, 0, 8), Ipv4Addr::new(10, 2, 0, 1));
    net.controller.on_packet_in(UNBUFFERED_ID, reply.len(), port_out.number, &reply);

    net.clock.advance(net.controller.config().arp_expiry() + Duration::from_secs(1));
    let data = udp_to(&net, 1, Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(10, 2, 0, 8));
    assert_eq!(net.controller.on_packet_in(6, data.len(), 10, &data), Disposition::Pending);
    assert_eq!(net.driver.packets().len(), 1);
}
