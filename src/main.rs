use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ipnet::Ipv4Net;
use mvirt_net::channel::tokio_impl::{TokioPortListenerFactory, TokioUpstreamSocketFactory};
use mvirt_net::config::{DhcpConfig, DnsMode, LanConfig, RouterConfig};
use mvirt_net::orchestrator::Router;
use mvirt_net::tap::TapDevice;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// Default TAP device name, mirroring the teacher's default TUN name.
const TAP_NAME: &str = "mvirt0";

#[derive(Parser, Debug)]
#[command(about = "User-space L2/L3 router between a guest vNIC and the host")]
struct Args {
    /// Identifier for this guest network; also seeds the gateway's
    /// synthetic MAC so it stays stable across restarts.
    #[arg(long, default_value = "default")]
    network_id: String,

    /// TAP device to bind as the guest channel.
    #[arg(long, default_value = TAP_NAME)]
    tap: String,

    /// Gateway IP, as seen by the guest.
    #[arg(long, default_value = "10.0.0.1")]
    gateway: Ipv4Addr,

    /// Guest subnet in CIDR form.
    #[arg(long, default_value = "10.0.0.0/24")]
    subnet: Ipv4Net,

    /// First address of the DHCP pool.
    #[arg(long, default_value = "10.0.0.100")]
    dhcp_pool_start: Ipv4Addr,

    /// Last address of the DHCP pool.
    #[arg(long, default_value = "10.0.0.200")]
    dhcp_pool_end: Ipv4Addr,

    /// Disable the DHCP server entirely.
    #[arg(long)]
    no_dhcp: bool,

    /// Comma-separated upstream DNS resolvers. Omit for passthrough
    /// (resolve with the host's own nameservers); pass `blocked` to
    /// drop every query.
    #[arg(long)]
    dns: Option<String>,
}

impl Args {
    fn dns_mode(&self) -> DnsMode {
        match self.dns.as_deref() {
            None => DnsMode::Passthrough,
            Some("blocked") => DnsMode::Blocked,
            Some(csv) => {
                let resolvers = csv
                    .split(',')
                    .filter_map(|s| s.trim().parse::<Ipv4Addr>().ok())
                    .collect();
                DnsMode::Custom(resolvers)
            }
        }
    }

    fn router_config(&self) -> RouterConfig {
        RouterConfig {
            lan: LanConfig::new(&self.network_id, self.gateway, self.subnet),
            dhcp: DhcpConfig {
                enabled: !self.no_dhcp,
                pool_start: self.dhcp_pool_start,
                pool_end: self.dhcp_pool_end,
                lease_ttl: Duration::from_secs(3600),
                static_leases: Vec::new(),
            },
            dns: self.dns_mode(),
            firewall_rules: Vec::new(),
            firewall_default: mvirt_net::config::Policy::Allow,
            aliases: Default::default(),
            port_forwards: Vec::new(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = args.router_config();

    info!(
        network_id = %args.network_id,
        tap = %args.tap,
        gateway = %config.lan.gateway,
        subnet = %config.lan.subnet,
        "starting mvirt-net router"
    );

    let tap = TapDevice::create(&args.tap).with_context(|| {
        format!(
            "failed to create TAP device '{}' (do you have CAP_NET_ADMIN? try running with 'sudo')",
            args.tap
        )
    })?;

    let router = Router::new(
        config,
        Arc::new(TokioUpstreamSocketFactory),
        Arc::new(TokioPortListenerFactory),
    );

    router
        .start(Box::new(tap))
        .await
        .context("failed to start router")?;

    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    router.stop().context("failed to stop router cleanly")?;

    info!("router stopped");
    Ok(())
}
