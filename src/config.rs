//! Router configuration: the immutable description of one guest's LAN,
//! DHCP pool, DNS policy, firewall rules, aliases, and port forwards.
//!
//! A `RouterConfig` is built once, validated, and handed to
//! [`crate::orchestrator::Router::start`]. There is no dynamic
//! reconfiguration API — per the design notes, policy changes are applied
//! by constructing a new router, which keeps all concurrency reasoning
//! linear (see DESIGN.md, "config immutability").

use crate::address::{Mac, derive_gateway_mac};
use crate::error::ConfigError;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Layer-4 protocol a NAT mapping, firewall rule, or port forward applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Tcp,
    Udp,
}

/// The guest's virtual LAN: gateway address, subnet, and the gateway's
/// synthetic MAC identity on the fabric.
#[derive(Debug, Clone)]
pub struct LanConfig {
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Net,
    pub gateway_mac: Mac,
}

impl LanConfig {
    /// Build a LAN config, deriving the gateway MAC from `network_id` so
    /// that restarting the router with the same id keeps the same MAC.
    pub fn new(network_id: &str, gateway: Ipv4Addr, subnet: Ipv4Net) -> Self {
        LanConfig {
            gateway,
            subnet,
            gateway_mac: derive_gateway_mac(network_id),
        }
    }
}

/// A DHCP static reservation: a MAC permanently bound to an IP.
#[derive(Debug, Clone)]
pub struct StaticLease {
    pub mac: Mac,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
}

/// DHCP server configuration.
#[derive(Debug, Clone)]
pub struct DhcpConfig {
    pub enabled: bool,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub lease_ttl: Duration,
    pub static_leases: Vec<StaticLease>,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        DhcpConfig {
            enabled: true,
            pool_start: Ipv4Addr::new(0, 0, 0, 0),
            pool_end: Ipv4Addr::new(0, 0, 0, 0),
            lease_ttl: Duration::from_secs(3600),
            static_leases: Vec::new(),
        }
    }
}

/// DNS forwarding policy.
#[derive(Debug, Clone)]
pub enum DnsMode {
    /// Forward queries to the given upstream resolvers, in order.
    Custom(Vec<Ipv4Addr>),
    /// Drop every query silently; no DNS option is offered over DHCP.
    Blocked,
    /// Forward queries to a fixed set of public resolvers.
    Passthrough,
}

impl DnsMode {
    /// Public resolvers advertised (and used) in passthrough mode.
    pub const PUBLIC_RESOLVERS: [Ipv4Addr; 2] =
        [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

    /// DNS servers to hand out over DHCP option 6, per mode.
    pub fn dhcp_servers(&self) -> Vec<Ipv4Addr> {
        match self {
            DnsMode::Custom(servers) => servers.clone(),
            DnsMode::Blocked => Vec::new(),
            DnsMode::Passthrough => Self::PUBLIC_RESOLVERS.to_vec(),
        }
    }

    /// Upstream resolvers to actually query, in order of preference.
    pub fn upstream_resolvers(&self) -> Vec<Ipv4Addr> {
        match self {
            DnsMode::Custom(servers) => servers.clone(),
            DnsMode::Blocked => Vec::new(),
            DnsMode::Passthrough => Self::PUBLIC_RESOLVERS.to_vec(),
        }
    }
}

/// Direction a firewall rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    Both,
}

impl Direction {
    pub fn matches(&self, actual: Direction) -> bool {
        matches!(self, Direction::Both) || *self == actual
    }
}

/// The OSI layer a firewall rule evaluates at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    L2,
    L3,
}

/// Firewall rule action. `Redirect` is accepted at parse time but treated
/// as `Allow` by this router core — inbound redirection is handled by
/// `port_forward`, a distinct mechanism from firewall rule actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Block,
    Redirect,
}

/// A CIDR-like match target: a literal network/host, or a named alias.
#[derive(Debug, Clone)]
pub enum CidrMatch {
    Any,
    Cidr(Ipv4Net),
    Alias(String),
}

/// A port match target: a literal port, or a named alias.
#[derive(Debug, Clone)]
pub enum PortMatch {
    Any,
    Port(u16),
    Alias(String),
}

/// IP protocol a firewall rule's L3 fields match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Proto {
    Tcp,
    Udp,
    Icmp,
    Any,
}

/// L2 match fields.
#[derive(Debug, Clone, Default)]
pub struct L2Match {
    pub src_mac: Option<Mac>,
    pub dst_mac: Option<Mac>,
    pub ethertype: Option<u16>,
    pub block_broadcast: bool,
}

/// L3 match fields.
#[derive(Debug, Clone)]
pub struct L3Match {
    pub src: CidrMatch,
    pub dst: CidrMatch,
    pub proto: L3Proto,
    pub src_port: PortMatch,
    pub dst_port: PortMatch,
}

impl Default for L3Match {
    fn default() -> Self {
        L3Match {
            src: CidrMatch::Any,
            dst: CidrMatch::Any,
            proto: L3Proto::Any,
            src_port: PortMatch::Any,
            dst_port: PortMatch::Any,
        }
    }
}

/// One ordered firewall rule. First match wins; see [`crate::firewall`].
#[derive(Debug, Clone)]
pub struct FirewallRule {
    pub enabled: bool,
    pub direction: Direction,
    pub layer: Layer,
    pub action: Action,
    pub l2: L2Match,
    pub l3: L3Match,
    /// Free-form identifier for log/audit correlation only; has no
    /// semantic effect on matching.
    pub label: String,
}

/// Default policy applied when no firewall rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Allow,
    Block,
}

/// Named sets referenced by firewall rules.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    pub hosts: HashMap<String, Vec<Ipv4Net>>,
    pub networks: HashMap<String, Vec<Ipv4Net>>,
    pub ports: HashMap<String, Vec<u16>>,
}

impl AliasTable {
    /// True if `ip` is contained by any member of the `hosts` alias `name`.
    pub fn host_contains(&self, name: &str, ip: Ipv4Addr) -> bool {
        self.hosts
            .get(name)
            .is_some_and(|members| members.iter().any(|net| net.contains(&ip)))
    }

    /// True if `ip` is contained by any member of the `networks` alias `name`.
    pub fn network_contains(&self, name: &str, ip: Ipv4Addr) -> bool {
        self.networks
            .get(name)
            .is_some_and(|members| members.iter().any(|net| net.contains(&ip)))
    }

    /// True if `port` is an exact member of the `ports` alias `name`.
    pub fn port_contains(&self, name: &str, port: u16) -> bool {
        self.ports
            .get(name)
            .is_some_and(|members| members.contains(&port))
    }

    fn alias_exists(&self, name: &str) -> bool {
        self.hosts.contains_key(name) || self.networks.contains_key(name)
    }
}

/// One inbound port-forward rule: external host port -> internal guest endpoint.
#[derive(Debug, Clone)]
pub struct PortForwardRule {
    pub proto: L4Proto,
    pub external_port: u16,
    pub internal_ip: Ipv4Addr,
    pub internal_port: u16,
    pub enabled: bool,
    pub label: String,
}

/// The router's complete, immutable configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub lan: LanConfig,
    pub dhcp: DhcpConfig,
    pub dns: DnsMode,
    pub firewall_rules: Vec<FirewallRule>,
    pub firewall_default: Policy,
    pub aliases: AliasTable,
    pub port_forwards: Vec<PortForwardRule>,
}

impl RouterConfig {
    /// Validate internal consistency. Called by
    /// [`crate::orchestrator::Router::start`]; a failure here aborts
    /// `start` and leaves the router in its idle state.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.lan.subnet.contains(&self.lan.gateway) {
            return Err(ConfigError::GatewayNotInSubnet {
                gateway: self.lan.gateway,
                subnet: self.lan.subnet,
            });
        }

        if self.dhcp.enabled {
            self.validate_dhcp()?;
        }

        self.validate_port_forwards()?;
        self.validate_firewall_aliases()?;

        Ok(())
    }

    fn validate_dhcp(&self) -> Result<(), ConfigError> {
        let d = &self.dhcp;
        if u32::from(d.pool_start) > u32::from(d.pool_end) {
            return Err(ConfigError::InvertedPoolRange {
                start: d.pool_start,
                end: d.pool_end,
            });
        }
        if !self.lan.subnet.contains(&d.pool_start) || !self.lan.subnet.contains(&d.pool_end) {
            return Err(ConfigError::PoolRangeOutsideSubnet {
                start: d.pool_start,
                end: d.pool_end,
                subnet: self.lan.subnet,
            });
        }

        let mut seen_ip: HashMap<Ipv4Addr, Mac> = HashMap::new();
        let mut seen_mac: HashMap<Mac, Ipv4Addr> = HashMap::new();
        for lease in &d.static_leases {
            if !self.lan.subnet.contains(&lease.ip) {
                return Err(ConfigError::StaticLeaseOutsideSubnet {
                    mac: lease.mac,
                    ip: lease.ip,
                    subnet: self.lan.subnet,
                });
            }
            if seen_ip.contains_key(&lease.ip) {
                return Err(ConfigError::DuplicateStaticLeaseIp { ip: lease.ip });
            }
            if seen_mac.contains_key(&lease.mac) {
                return Err(ConfigError::DuplicateStaticLeaseMac { mac: lease.mac });
            }
            seen_ip.insert(lease.ip, lease.mac);
            seen_mac.insert(lease.mac, lease.ip);
        }
        Ok(())
    }

    fn validate_port_forwards(&self) -> Result<(), ConfigError> {
        let mut seen: HashMap<(L4Proto, u16), ()> = HashMap::new();
        for rule in &self.port_forwards {
            if !rule.enabled {
                continue;
            }
            if seen.insert((rule.proto, rule.external_port), ()).is_some() {
                return Err(ConfigError::DuplicatePortForward {
                    proto: rule.proto,
                    port: rule.external_port,
                });
            }
        }
        Ok(())
    }

    fn validate_firewall_aliases(&self) -> Result<(), ConfigError> {
        for rule in &self.firewall_rules {
            for side in [&rule.l3.src, &rule.l3.dst] {
                if let CidrMatch::Alias(name) = side
                    && !self.aliases.alias_exists(name)
                {
                    return Err(ConfigError::FirewallUnknownAlias {
                        label: rule.label.clone(),
                        alias: name.clone(),
                    });
                }
            }
            for side in [&rule.l3.src_port, &rule.l3.dst_port] {
                if let PortMatch::Alias(name) = side
                    && !self.aliases.ports.contains_key(name)
                {
                    return Err(ConfigError::FirewallUnknownAlias {
                        label: rule.label.clone(),
                        alias: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn base_config() -> RouterConfig {
        let subnet = Ipv4Net::from_str("10.100.0.0/24").unwrap();
        RouterConfig {
            lan: LanConfig::new("test-net", Ipv4Addr::new(10, 100, 0, 1), subnet),
            dhcp: DhcpConfig {
                enabled: true,
                pool_start: Ipv4Addr::new(10, 100, 0, 10),
                pool_end: Ipv4Addr::new(10, 100, 0, 254),
                lease_ttl: Duration::from_secs(3600),
                static_leases: Vec::new(),
            },
            dns: DnsMode::Passthrough,
            firewall_rules: Vec::new(),
            firewall_default: Policy::Allow,
            aliases: AliasTable::default(),
            port_forwards: Vec::new(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn gateway_outside_subnet_rejected() {
        let mut cfg = base_config();
        cfg.lan.gateway = Ipv4Addr::new(10, 200, 0, 1);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::GatewayNotInSubnet { .. })
        ));
    }

    #[test]
    fn inverted_pool_range_rejected() {
        let mut cfg = base_config();
        cfg.dhcp.pool_start = Ipv4Addr::new(10, 100, 0, 254);
        cfg.dhcp.pool_end = Ipv4Addr::new(10, 100, 0, 10);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvertedPoolRange { .. })
        ));
    }

    #[test]
    fn duplicate_static_lease_ip_rejected() {
        let mut cfg = base_config();
        cfg.dhcp.static_leases.push(StaticLease {
            mac: Mac::new([0x02, 0, 0, 0, 0, 1]),
            ip: Ipv4Addr::new(10, 100, 0, 50),
            hostname: None,
        });
        cfg.dhcp.static_leases.push(StaticLease {
            mac: Mac::new([0x02, 0, 0, 0, 0, 2]),
            ip: Ipv4Addr::new(10, 100, 0, 50),
            hostname: None,
        });
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateStaticLeaseIp { .. })
        ));
    }

    #[test]
    fn duplicate_port_forward_rejected() {
        let mut cfg = base_config();
        cfg.port_forwards.push(PortForwardRule {
            proto: L4Proto::Tcp,
            external_port: 8080,
            internal_ip: Ipv4Addr::new(10, 100, 0, 10),
            internal_port: 80,
            enabled: true,
            label: "web".into(),
        });
        cfg.port_forwards.push(PortForwardRule {
            proto: L4Proto::Tcp,
            external_port: 8080,
            internal_ip: Ipv4Addr::new(10, 100, 0, 11),
            internal_port: 8081,
            enabled: true,
            label: "web2".into(),
        });
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicatePortForward { .. })
        ));
    }

    #[test]
    fn unknown_firewall_alias_rejected() {
        let mut cfg = base_config();
        cfg.firewall_rules.push(FirewallRule {
            enabled: true,
            direction: Direction::Outbound,
            layer: Layer::L3,
            action: Action::Block,
            l2: L2Match::default(),
            l3: L3Match {
                dst: CidrMatch::Alias("blocklist".into()),
                ..Default::default()
            },
            label: "block-bad-hosts".into(),
        });
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::FirewallUnknownAlias { .. })
        ));
    }
}
