//! Rule-based firewall: ordered rules, first match wins, with alias
//! resolution for hosts/networks/ports.
//!
//! Evaluation is a pure function over one flow description and the
//! router's configuration — no mutable state, no table of its own, unlike
//! [`crate::arp::ArpTable`] or [`crate::nat::NatEngine`]. The orchestrator
//! calls [`evaluate`] once per outbound flow and once per inbound
//! connection before handing it to NAT or the port forwarder.

use std::net::Ipv4Addr;

use crate::address::Mac;
use crate::config::{
    Action, AliasTable, CidrMatch, Direction, FirewallRule, L3Proto, Layer, Policy, PortMatch,
};

/// The L3 half of a flow being evaluated, absent for pure L2 frames
/// (e.g. ARP, or an unparseable IPv4 payload).
#[derive(Debug, Clone, Copy)]
pub struct L3Flow {
    pub proto: L3Proto,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

/// One flow presented to the firewall for a verdict.
#[derive(Debug, Clone, Copy)]
pub struct FlowFlow<'a> {
    pub direction: Direction,
    pub eth_src: Mac,
    pub eth_dst: Mac,
    pub ethertype: u16,
    pub l3: Option<&'a L3Flow>,
}

/// Evaluate `rules` against `flow` in order, returning the first matching
/// rule's action translated to a yes/no verdict, or `default` if nothing
/// matches. `Action::Redirect` is treated as allow at this layer — actual
/// redirection is a [`crate::port_forward`] concern, not a firewall action.
pub fn evaluate(
    rules: &[FirewallRule],
    default: Policy,
    aliases: &AliasTable,
    flow: &FlowFlow<'_>,
) -> bool {
    for rule in rules {
        if !rule.enabled {
            continue;
        }
        if !rule.direction.matches(flow.direction) {
            continue;
        }
        let matched = match rule.layer {
            Layer::L2 => l2_matches(rule, flow),
            Layer::L3 => flow
                .l3
                .is_some_and(|l3| l3_matches(rule, l3, aliases)),
        };
        if matched {
            return rule.action != Action::Block;
        }
    }
    default == Policy::Allow
}

fn l2_matches(rule: &FirewallRule, flow: &FlowFlow<'_>) -> bool {
    let l2 = &rule.l2;
    if let Some(src) = l2.src_mac
        && src != flow.eth_src
    {
        return false;
    }
    if let Some(dst) = l2.dst_mac
        && dst != flow.eth_dst
    {
        return false;
    }
    if let Some(et) = l2.ethertype
        && et != flow.ethertype
    {
        return false;
    }
    if l2.block_broadcast && !flow.eth_dst.is_broadcast() {
        return false;
    }
    if !l2.block_broadcast && l2.src_mac.is_none() && l2.dst_mac.is_none() && l2.ethertype.is_none()
    {
        // An L2 rule with no fields set at all never matches; it would
        // otherwise swallow every frame regardless of intent.
        return false;
    }
    true
}

fn l3_matches(rule: &FirewallRule, l3: &L3Flow, aliases: &AliasTable) -> bool {
    let m = &rule.l3;
    if !proto_matches(m.proto, l3.proto) {
        return false;
    }
    if !cidr_matches(&m.src, l3.src_ip, aliases) {
        return false;
    }
    if !cidr_matches(&m.dst, l3.dst_ip, aliases) {
        return false;
    }
    if !port_matches(&m.src_port, l3.src_port, aliases) {
        return false;
    }
    if !port_matches(&m.dst_port, l3.dst_port, aliases) {
        return false;
    }
    true
}

fn proto_matches(rule_proto: L3Proto, actual: L3Proto) -> bool {
    matches!(rule_proto, L3Proto::Any) || rule_proto == actual
}

fn cidr_matches(m: &CidrMatch, ip: Ipv4Addr, aliases: &AliasTable) -> bool {
    match m {
        CidrMatch::Any => true,
        CidrMatch::Cidr(net) => net.contains(&ip),
        CidrMatch::Alias(name) => {
            aliases.host_contains(name, ip) || aliases.network_contains(name, ip)
        }
    }
}

fn port_matches(m: &PortMatch, port: Option<u16>, aliases: &AliasTable) -> bool {
    match m {
        PortMatch::Any => true,
        PortMatch::Port(p) => port == Some(*p),
        PortMatch::Alias(name) => port.is_some_and(|p| aliases.port_contains(name, p)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{L2Match, L3Match};
    use crate::packet::ETHERTYPE_IPV4;
    use std::str::FromStr;

    fn mac(n: u8) -> Mac {
        Mac::new([0x02, 0, 0, 0, 0, n])
    }

    fn l3(src: &str, dst: &str, proto: L3Proto, dst_port: Option<u16>) -> L3Flow {
        L3Flow {
            proto,
            src_ip: Ipv4Addr::from_str(src).unwrap(),
            dst_ip: Ipv4Addr::from_str(dst).unwrap(),
            src_port: None,
            dst_port,
        }
    }

    #[test]
    fn empty_rules_default_block_drops_everything() {
        let l3flow = l3("10.100.0.10", "8.8.8.8", L3Proto::Udp, Some(53));
        let flow = FlowFlow {
            direction: Direction::Outbound,
            eth_src: mac(1),
            eth_dst: mac(2),
            ethertype: ETHERTYPE_IPV4,
            l3: Some(&l3flow),
        };
        assert!(!evaluate(&[], Policy::Block, &AliasTable::default(), &flow));
    }

    #[test]
    fn block_rule_beats_default_allow() {
        let rule = FirewallRule {
            enabled: true,
            direction: Direction::Outbound,
            layer: Layer::L3,
            action: Action::Block,
            l2: L2Match::default(),
            l3: L3Match {
                dst: CidrMatch::Cidr(ipnet::Ipv4Net::from_str("10.0.0.0/8").unwrap()),
                ..Default::default()
            },
            label: "block-rfc1918".into(),
        };
        let blocked = l3("10.100.0.10", "10.0.0.5", L3Proto::Tcp, Some(80));
        let allowed = l3("10.100.0.10", "8.8.8.8", L3Proto::Tcp, Some(80));
        let aliases = AliasTable::default();

        let blocked_flow = FlowFlow {
            direction: Direction::Outbound,
            eth_src: mac(1),
            eth_dst: mac(2),
            ethertype: ETHERTYPE_IPV4,
            l3: Some(&blocked),
        };
        let allowed_flow = FlowFlow {
            l3: Some(&allowed),
            ..blocked_flow
        };

        assert!(!evaluate(&[rule.clone()], Policy::Allow, &aliases, &blocked_flow));
        assert!(evaluate(&[rule], Policy::Allow, &aliases, &allowed_flow));
    }

    #[test]
    fn first_match_wins_over_later_contradicting_rule() {
        let allow_first = FirewallRule {
            enabled: true,
            direction: Direction::Both,
            layer: Layer::L3,
            action: Action::Allow,
            l2: L2Match::default(),
            l3: L3Match {
                dst: CidrMatch::Cidr(ipnet::Ipv4Net::from_str("8.8.8.8/32").unwrap()),
                ..Default::default()
            },
            label: "allow-dns".into(),
        };
        let block_everything = FirewallRule {
            enabled: true,
            direction: Direction::Both,
            layer: Layer::L3,
            action: Action::Block,
            l2: L2Match::default(),
            l3: L3Match::default(),
            label: "block-all".into(),
        };
        let flow_l3 = l3("10.100.0.10", "8.8.8.8", L3Proto::Udp, Some(53));
        let flow = FlowFlow {
            direction: Direction::Outbound,
            eth_src: mac(1),
            eth_dst: mac(2),
            ethertype: ETHERTYPE_IPV4,
            l3: Some(&flow_l3),
        };
        assert!(evaluate(
            &[allow_first, block_everything],
            Policy::Block,
            &AliasTable::default(),
            &flow
        ));
    }

    #[test]
    fn alias_resolution_matches_any_member() {
        let mut aliases = AliasTable::default();
        aliases.networks.insert(
            "blocklist".into(),
            vec![ipnet::Ipv4Net::from_str("203.0.113.0/24").unwrap()],
        );
        let rule = FirewallRule {
            enabled: true,
            direction: Direction::Outbound,
            layer: Layer::L3,
            action: Action::Block,
            l2: L2Match::default(),
            l3: L3Match {
                dst: CidrMatch::Alias("blocklist".into()),
                ..Default::default()
            },
            label: "block-alias".into(),
        };
        let flow_l3 = l3("10.100.0.10", "203.0.113.50", L3Proto::Tcp, Some(443));
        let flow = FlowFlow {
            direction: Direction::Outbound,
            eth_src: mac(1),
            eth_dst: mac(2),
            ethertype: ETHERTYPE_IPV4,
            l3: Some(&flow_l3),
        };
        assert!(!evaluate(&[rule], Policy::Allow, &aliases, &flow));
    }

    #[test]
    fn block_broadcast_rule_only_matches_broadcast_destination() {
        let rule = FirewallRule {
            enabled: true,
            direction: Direction::Both,
            layer: Layer::L2,
            action: Action::Block,
            l2: L2Match {
                block_broadcast: true,
                ..Default::default()
            },
            l3: L3Match::default(),
            label: "no-broadcast".into(),
        };
        let unicast_flow = FlowFlow {
            direction: Direction::Outbound,
            eth_src: mac(1),
            eth_dst: mac(2),
            ethertype: ETHERTYPE_IPV4,
            l3: None,
        };
        let broadcast_flow = FlowFlow {
            eth_dst: Mac::BROADCAST,
            ..unicast_flow
        };
        assert!(evaluate(&[rule.clone()], Policy::Allow, &AliasTable::default(), &unicast_flow));
        assert!(!evaluate(&[rule], Policy::Allow, &AliasTable::default(), &broadcast_flow));
    }

    #[test]
    fn ethertype_rule_only_matches_its_own_ethertype() {
        const ETHERTYPE_ARP: u16 = 0x0806;
        let rule = FirewallRule {
            enabled: true,
            direction: Direction::Both,
            layer: Layer::L2,
            action: Action::Block,
            l2: L2Match {
                ethertype: Some(ETHERTYPE_ARP),
                ..Default::default()
            },
            l3: L3Match::default(),
            label: "block-arp".into(),
        };
        let arp_flow = FlowFlow {
            direction: Direction::Outbound,
            eth_src: mac(1),
            eth_dst: mac(2),
            ethertype: ETHERTYPE_ARP,
            l3: None,
        };
        let ipv4_flow = FlowFlow {
            ethertype: ETHERTYPE_IPV4,
            ..arp_flow
        };
        assert!(!evaluate(&[rule.clone()], Policy::Allow, &AliasTable::default(), &arp_flow));
        assert!(evaluate(&[rule], Policy::Allow, &AliasTable::default(), &ipv4_flow));
    }
}
