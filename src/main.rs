use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

use rawnat::error::Result;
use rawnat::net::forwarder::Forwarder;
use rawnat::net::nat::{NatConfig, NatTable};
use rawnat::net::rules::ForwardingRules;
use rawnat::net::transport::RawSocketTransport;
use rawnat::utils::consts::*;
use rawnat::utils::logging::init_logging;

// Note: raw sockets need root (or CAP_NET_RAW)

#[derive(Parser)]
#[command(author, version, about = "Userspace TCP NAT forwarder", long_about = None)]
struct Cli {
    /// Forwarding rule file
    #[arg(short, long, default_value = DEFAULT_RULES_FILE)]
    rules: PathBuf,
    /// Source address for the checksum of rewritten segments
    /// (defaults to the address the routing table picks for each destination)
    #[arg(long)]
    source_ip: Option<Ipv4Addr>,
    /// Random port draws before a colliding flow is dropped
    #[arg(long, default_value_t = MAX_PORT_ATTEMPTS)]
    max_port_attempts: usize,
}

fn run(cli: Cli) -> Result<()> {
    let rules = ForwardingRules::load(&cli.rules)?;
    let transport = RawSocketTransport::open()?;
    let nat = NatTable::with_config(
        NatConfig {
            max_port_attempts: cli.max_port_attempts,
            ..NatConfig::default()
        },
        StdRng::from_os_rng(),
    );
    let mut forwarder =
        Forwarder::with_nat_table(transport, rules, nat).with_source_ip(cli.source_ip);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok(); // Ignore error if handler already set

    info!("Press Ctrl+C to stop.");
    forwarder.run(&running)?;
    Ok(())
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}
