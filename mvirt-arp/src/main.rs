use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ipnet::Ipv4Net;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mvirt_arp::ArpConfig;
use mvirt_arp::handler::{ArpCommand, probe_targets};
use mvirt_arp::wire::{self, InboundFrame};

#[derive(Parser)]
#[command(name = "mvirt-arp")]
#[command(about = "mvirt ARP resolver diagnostics")]
struct Args {
    /// JSON configuration file (replaces the --arp-* flags)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    arp: ArpConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration as JSON
    Config,
    /// Decode a hex-encoded Ethernet frame the way the handler classifies it
    Decode {
        /// Frame bytes, e.g. ffffffffffff0200...
        hex: String,
    },
    /// List the addresses probed for an allowed-address-pair block
    Probes {
        prefix: Ipv4Net,
        /// Probe only this address
        #[arg(long)]
        target: Option<Ipv4Addr>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_arp=info".parse()?))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ArpConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            args.arp.validate()?;
            args.arp.clone()
        }
    };

    match args.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Decode { hex } => {
            let bytes = decode_hex(&hex)?;
            match wire::parse_frame(&bytes)? {
                InboundFrame::Arp(message) => {
                    let frame = InboundFrame::Arp(message);
                    println!("{:?}", ArpCommand::classify(&frame));
                    println!("sender {} at {}", message.sender_ip, message.sender_mac);
                    println!("target {} at {}", message.target_ip, message.target_mac);
                    println!("resolves {}", frame.resolution_target());
                }
                InboundFrame::Ipv4 { destination } => {
                    println!("IPv4 packet, resolves {}", destination);
                }
            }
        }
        Command::Probes { prefix, target } => {
            let mut count = 0;
            for addr in probe_targets(prefix, target, config.max_arp_probe_addresses()) {
                println!("{}", addr);
                count += 1;
            }
            info!(prefix = %prefix, count, "Probe plan");
        }
    }

    Ok(())
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let digits: String = hex.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        bail!("expected an even number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte at offset {}", i / 2))
        })
        .collect()
}
