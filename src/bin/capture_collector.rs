//! Collector for the UDP exporter.
//!
//! Receives export datagrams, reassembles split records and writes them to a
//! pcap file until interrupted.
//!
//! Usage:
//! ```
//! cargo run --bin capture_collector -- --listen 0.0.0.0:1234 --output capture.pcap
//! ```

use std::path::PathBuf;

use capture_core::dump::{DumpBackend, ExportReassembler, PcapFileBackend};
use tokio::net::UdpSocket;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::FmtSubscriber;

struct CollectorArgs {
    listen: String,
    output: PathBuf,
    snaplen: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = parse_args();

    let socket = UdpSocket::bind(&args.listen).await?;
    let mut writer = PcapFileBackend::create(&args.output, args.snaplen)?;
    let mut reassembler = ExportReassembler::new();
    let mut buf = vec![0u8; 65536];

    tracing::info!(
        "Collecting on {} into {}",
        socket.local_addr()?,
        args.output.display()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Receive failed: {}", e);
                        continue;
                    }
                };
                let Some(record) = reassembler.push(&buf[..len]) else {
                    continue;
                };
                if let Err(e) = writer.write(&record) {
                    tracing::error!("Failed to write record from {}: {}", peer, e);
                    if e.is_unrecoverable() {
                        break;
                    }
                }
            }
        }
    }

    writer.flush_and_close()?;
    tracing::info!("Collector stopped, {} records written", writer.records_written());
    Ok(())
}

fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(LevelFilter::INFO)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn parse_args() -> CollectorArgs {
    let mut args = std::env::args().skip(1);
    let mut parsed = CollectorArgs {
        listen: "0.0.0.0:1234".to_string(),
        output: PathBuf::from("collected.pcap"),
        snaplen: 65535,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => {
                if let Some(addr) = args.next() {
                    parsed.listen = addr;
                }
            }
            "--output" => {
                if let Some(path) = args.next() {
                    parsed.output = PathBuf::from(path);
                }
            }
            "--snaplen" => match args.next().map(|v| v.parse::<u32>()) {
                Some(Ok(snaplen)) if snaplen > 0 => parsed.snaplen = snaplen,
                _ => eprintln!("--snaplen expects a positive number"),
            },
            "--help" | "-h" => {
                eprintln!("Capture Core UDP collector");
                eprintln!();
                eprintln!("Usage: capture_collector [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --listen <ADDR>     Address to receive on (default: 0.0.0.0:1234)");
                eprintln!("  --output <PATH>     Pcap file to write (default: collected.pcap)");
                eprintln!("  --snaplen <BYTES>   Maximum bytes stored per record (default: 65535)");
                eprintln!("  --help, -h          Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    parsed
}
