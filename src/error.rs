//! Error taxonomy for the router core.
//!
//! Only two classes of failure are ever surfaced to the caller (see
//! spec §7): a bad configuration at `start`, and a terminal guest-channel
//! failure during steady state. Everything else — malformed packets,
//! resource exhaustion, upstream socket failures — is handled locally and
//! only observable through `tracing` events and [`crate::orchestrator::RouterSnapshot`].

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Failures detected while validating a [`crate::config::RouterConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("gateway {gateway} is not within subnet {subnet}")]
    GatewayNotInSubnet { gateway: Ipv4Addr, subnet: Ipv4Net },

    #[error("DHCP pool start {start} is after pool end {end}")]
    InvertedPoolRange { start: Ipv4Addr, end: Ipv4Addr },

    #[error("DHCP pool range {start}-{end} is not contained in subnet {subnet}")]
    PoolRangeOutsideSubnet {
        start: Ipv4Addr,
        end: Ipv4Addr,
        subnet: Ipv4Net,
    },

    #[error("static lease for {mac} assigns {ip}, which is outside subnet {subnet}")]
    StaticLeaseOutsideSubnet {
        mac: crate::address::Mac,
        ip: Ipv4Addr,
        subnet: Ipv4Net,
    },

    #[error("static lease address {ip} is assigned to more than one MAC")]
    DuplicateStaticLeaseIp { ip: Ipv4Addr },

    #[error("static lease MAC {mac} has more than one reservation")]
    DuplicateStaticLeaseMac { mac: crate::address::Mac },

    #[error("two port forward rules both claim {proto:?} external port {port}")]
    DuplicatePortForward { proto: crate::config::L4Proto, port: u16 },

    #[error("firewall rule '{label}' references unknown alias '{alias}'")]
    FirewallUnknownAlias { label: String, alias: String },
}

/// Top-level router failure.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("guest channel failed: {0}")]
    Channel(#[source] std::io::Error),

    #[error("router already started")]
    AlreadyStarted,

    #[error("router already stopped")]
    AlreadyStopped,
}
