//! PeerTalk CLI
//!
//! Inspect the wire format and exercise the session engine without a network.

mod config;

use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

use config::Config;
use peertalk_core::codec::PacketKind;
use peertalk_core::codec::batch::Batch;
use peertalk_core::codec::capability::CapabilityMessage;
use peertalk_core::codec::fragment::FragmentHeader;
use peertalk_core::codec::udp::Datagram;
use peertalk_core::{
    DiscoveryPacket, Engine, EngineConfig, Event, Message, MessageFlags, MessageType, PeerId,
    Priority,
};

/// PeerTalk - peer-to-peer session engine tools
#[derive(Parser)]
#[command(name = "peertalk")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a discovery packet for this node as hex
    Announce {
        /// Packet type
        #[arg(short = 't', long = "type", value_enum, default_value = "announce")]
        kind: AnnounceKind,

        /// Override the advertised name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Decode a hex-encoded packet or frame
    Decode {
        /// Hex bytes (whitespace is ignored)
        #[arg(required = true)]
        hex: Vec<String>,
    },

    /// Run two engines against each other in memory
    Selftest {
        /// Number of small messages to exchange
        #[arg(short, long, default_value_t = 16)]
        messages: usize,

        /// Size of the message that must be fragmented
        #[arg(long, default_value_t = 4000)]
        large: usize,

        /// Print final peer state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or create the configuration file
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,

        /// Overwrite an existing file with --init
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AnnounceKind {
    Announce,
    Query,
    Goodbye,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::resolve(cli.config.as_deref())?;
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    match cli.command {
        Commands::Announce { kind, name } => announce(&config, kind, name),
        Commands::Decode { hex } => decode(&hex.concat()),
        Commands::Selftest {
            messages,
            large,
            json,
        } => selftest(&config.engine, messages, large, json),
        Commands::Config { init, force } => show_config(&config, cli.config, init, force),
    }
}

/// Print a discovery packet
fn announce(config: &Config, kind: AnnounceKind, name: Option<String>) -> anyhow::Result<()> {
    let mut engine_config = config.engine.clone();
    if let Some(name) = name {
        engine_config.local_name = name;
    }
    let engine = Engine::new(engine_config)?;

    let bytes = match kind {
        AnnounceKind::Announce => engine.build_announce(),
        AnnounceKind::Query => engine.build_query(),
        AnnounceKind::Goodbye => engine.build_goodbye(),
    };
    println!("{}", hex::encode(bytes));
    Ok(())
}

/// Decode and describe a packet
fn decode(input: &str) -> anyhow::Result<()> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(cleaned)?;

    match PacketKind::sniff(&bytes)? {
        PacketKind::Discovery => {
            let packet = DiscoveryPacket::decode(&bytes)?;
            println!("Discovery {:?}", packet.packet_type);
            println!("  name:       {}", packet.name);
            println!("  port:       {}", packet.sender_port);
            println!("  flags:      {:#06x}", packet.flags.bits());
            println!("  transports: {:#04x}", packet.transports.bits());
        }
        PacketKind::Message => {
            let message = Message::parse(&bytes)?;
            println!("Message {:?}", message.message_type());
            println!("  sequence: {}", message.sequence());
            println!("  flags:    {:#04x}", message.flags().as_u8());
            println!("  payload:  {} bytes", message.payload().len());
            describe_payload(message.message_type(), message.flags(), message.payload())?;
            if bytes.len() > message.frame_len() {
                println!("  trailing: {} bytes", bytes.len() - message.frame_len());
            }
        }
        PacketKind::Datagram => {
            let datagram = Datagram::decode(&bytes)?;
            println!("Datagram");
            println!("  port:    {}", datagram.sender_port);
            println!("  payload: {}", hex::encode(datagram.payload));
        }
    }
    Ok(())
}

fn describe_payload(kind: MessageType, flags: MessageFlags, payload: &[u8]) -> anyhow::Result<()> {
    match kind {
        MessageType::Capability => {
            let caps = CapabilityMessage::decode(payload)?;
            println!("  max message:     {}", caps.max_message_size);
            println!("  preferred chunk: {}", caps.preferred_chunk);
            println!("  buffer pressure: {}%", caps.buffer_pressure);
            println!("  capabilities:    {:#06x}", caps.flags.bits());
        }
        MessageType::Data if flags.is_fragment() => {
            let (header, data) = FragmentHeader::split(payload)?;
            println!(
                "  fragment: message {} offset {}/{} ({} bytes, flags {:#04x})",
                header.message_id,
                header.offset,
                header.total_length,
                data.len(),
                header.flags.as_u8()
            );
        }
        MessageType::Data if flags.is_batch() => {
            for (i, entry) in Batch::entries(payload).enumerate() {
                println!("  [{}] {}", i, hex::encode(entry?));
            }
        }
        _ if !payload.is_empty() => println!("  data: {}", hex::encode(payload)),
        _ => {}
    }
    Ok(())
}

const SELFTEST_A: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 1)),
    7354,
);
const SELFTEST_B: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 2)),
    7354,
);

/// Move every queued frame from one engine to the other
fn pump(from: &mut Engine, from_id: PeerId, to: &mut Engine, to_id: PeerId, now: u64) -> anyhow::Result<usize> {
    let mut frames = 0;
    while let Some(frame) = from.next_outbound_batch(from_id)? {
        to.handle_frame(to_id, &frame, now)?;
        frames += 1;
    }
    Ok(frames)
}

/// Two engines, one of them constrained to 1 KiB messages, exchanging
/// traffic through in-memory buffers.
fn selftest(base: &EngineConfig, messages: usize, large: usize, json: bool) -> anyhow::Result<()> {
    let mut a = Engine::new(EngineConfig {
        local_name: "selftest-a".to_string(),
        ..base.clone()
    })?;
    let mut b_config = EngineConfig {
        local_name: "selftest-b".to_string(),
        ..base.clone()
    };
    b_config.capabilities.max_message_size = 1024;
    b_config.capabilities.preferred_chunk = 512;
    let mut b = Engine::new(b_config)?;

    let mut now = 1_000;
    a.handle_discovery(&b.build_announce(), SELFTEST_B, now)?;
    b.handle_discovery(&a.build_announce(), SELFTEST_A, now)?;
    let b_id = a
        .peers()
        .find_by_name(b"selftest-b")
        .ok_or_else(|| anyhow::anyhow!("selftest-b was not discovered"))?;

    a.connect(b_id)?;
    a.on_connected(b_id, Some(1), now)?;
    let a_id = b.on_accepted(SELFTEST_A, Some(1), now)?;

    now += 10;
    pump(&mut a, b_id, &mut b, a_id, now)?;
    pump(&mut b, a_id, &mut a, b_id, now)?;
    tracing::info!(
        "Negotiated max {} bytes",
        a.peer(b_id).map_or(0, |p| p.capabilities().max_message_size)
    );

    for i in 0..messages {
        let body = format!("message {i}");
        a.send(b_id, body.as_bytes(), Priority::Normal, MessageFlags::new(), 0)?;
    }
    let big: Vec<u8> = (0..large).map(|i| (i % 251) as u8).collect();
    if !big.is_empty() {
        a.send(b_id, &big, Priority::High, MessageFlags::new(), 0)?;
    }
    a.ping(b_id, now)?;

    now += 10;
    let frames = pump(&mut a, b_id, &mut b, a_id, now)?;
    now += 15;
    pump(&mut b, a_id, &mut a, b_id, now)?;

    let received: Vec<Vec<u8>> = b
        .poll(now)
        .into_iter()
        .filter_map(|event| match event {
            Event::Message { data, .. } => Some(data),
            _ => None,
        })
        .collect();

    let expected = messages + usize::from(!big.is_empty());
    anyhow::ensure!(
        received.len() == expected,
        "expected {} messages, received {}",
        expected,
        received.len()
    );
    if !big.is_empty() {
        anyhow::ensure!(
            received.iter().any(|m| *m == big),
            "large message was not reassembled intact"
        );
    }

    let a_info = a.peer(b_id).map(|p| p.info());
    let b_info = b.peer(a_id).map(|p| p.info());

    a.disconnect(b_id)?;
    pump(&mut a, b_id, &mut b, a_id, now)?;
    a.on_closed(b_id)?;

    if json {
        let report = serde_json::json!({
            "frames": frames,
            "received": received.len(),
            "a": a_info,
            "b": b_info,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Selftest passed");
        println!("  frames sent:       {}", frames);
        println!("  messages received: {}", received.len());
        if let Some(info) = &a_info {
            println!("  fragments sent:    {}", info.stats.fragments_sent);
            println!("  effective max:     {}", info.effective_max);
            if let Some(rtt) = info.latency_ms {
                println!("  latency:           {} ms", rtt);
            }
        }
    }
    Ok(())
}

/// Print the active configuration, or write a default one
fn show_config(config: &Config, path: Option<PathBuf>, init: bool, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(Config::default_path);
    if init {
        if path.exists() && !force {
            anyhow::bail!("{} exists (use --force to overwrite)", path.display());
        }
        Config::default().save(&path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
