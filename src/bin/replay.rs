use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use tracing::{error, info, warn};

use rawnat::error::{NatError, Result};
use rawnat::net::Protocol;
use rawnat::net::checksum::tcp_checksum;
use rawnat::net::forwarder::Forwarder;
use rawnat::net::ip::IpHeader;
use rawnat::net::pcap_utils::{PcapReplayTransport, open_offline, strip_link_layer};
use rawnat::net::rules::ForwardingRules;
use rawnat::net::tcp::TcpHeader;
use rawnat::utils::consts::DEFAULT_RULES_FILE;
use rawnat::utils::logging::init_logging;

/// Runs a capture file through the forwarder without sending anything.
///
/// Captures can be recorded with `tcpdump -w`. Reading them needs no privileges.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// pcap file to read
    capture: PathBuf,
    #[arg(short, long, default_value = DEFAULT_RULES_FILE)]
    rules: PathBuf,
    #[arg(long)]
    source_ip: Option<Ipv4Addr>,
    /// Print every TCP header and check its checksum instead of forwarding
    #[arg(long)]
    inspect: bool,
}

fn inspect(cli: &Cli) -> Result<()> {
    let mut cap = open_offline(&cli.capture)?;
    let linktype = cap.get_datalink();
    let (mut valid, mut invalid) = (0usize, 0usize);

    loop {
        let packet = match cap.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(e.into()),
        };
        let Some(bytes) = strip_link_layer(linktype, packet.data) else {
            continue;
        };

        let ip = match IpHeader::parse(bytes) {
            Ok(ip) if Protocol::from(ip.protocol) == Protocol::Tcp => ip,
            Ok(_) => continue,
            Err(e) => {
                warn!("Unparsable packet: {}", e);
                continue;
            }
        };
        let segment = match ip.payload_range(bytes.len()) {
            Ok(range) => &bytes[range],
            Err(e) => {
                warn!("Unparsable packet: {}", e);
                continue;
            }
        };
        let tcp = match TcpHeader::parse(segment) {
            Ok(tcp) => tcp,
            Err(e) => {
                warn!("Unparsable TCP header: {}", e);
                continue;
            }
        };

        let mut zeroed = segment[..tcp.data_offset()].to_vec();
        zeroed[16] = 0;
        zeroed[17] = 0;
        let calculated = tcp_checksum(ip.src, ip.dst, &zeroed, &segment[tcp.data_offset()..]);

        println!("{}\n{}", ip, tcp);
        println!(
            "Actual checksum: {:#06x}; calculated checksum: {:#06x}\n",
            tcp.checksum(),
            calculated
        );
        if calculated == tcp.checksum() {
            valid += 1;
        } else {
            invalid += 1;
        }
    }

    info!("{} segment(s) with valid checksums, {} invalid", valid, invalid);
    Ok(())
}

fn replay(cli: &Cli) -> Result<()> {
    let rules = ForwardingRules::load(&cli.rules)?;
    let transport = PcapReplayTransport::open(&cli.capture)?;
    let mut forwarder = Forwarder::new(transport, rules).with_source_ip(cli.source_ip);

    let running = AtomicBool::new(true);
    match forwarder.run(&running) {
        Ok(_) | Err(NatError::TransportClosed) => {}
        Err(e) => return Err(e),
    }

    for (segment, destination) in forwarder.transport().sent() {
        match TcpHeader::parse(segment) {
            Ok(tcp) => info!(
                "-> {}:{} from port {} [{}] {} byte(s)",
                destination,
                tcp.dst_port(),
                tcp.src_port(),
                tcp.flags(),
                segment.len() - tcp.data_offset()
            ),
            Err(e) => error!("Forwarder emitted an unparsable segment: {}", e),
        }
    }
    Ok(())
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let result = if cli.inspect { inspect(&cli) } else { replay(&cli) };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
