use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use cpch::logging::init_rust_logging;
use cpch::{
    Headstage, HeadstageConfig, SerialTransport, SignalSource, SimulatedHeadstage,
    SimulatorOptions, SourceKind, Transport,
};

#[derive(Parser, Debug)]
#[command(name = "cpch-demo", about = "Stream from a CPC headstage and print the newest samples")]
struct Args {
    /// Serial port of the RS-485 adaptor
    #[arg(long, default_value = "/dev/ttyUSB0")]
    port: String,
    /// Differential channel mask (hex with 0x prefix, or decimal)
    #[arg(long, value_parser = parse_mask, default_value = "0xFFFF")]
    diff_mask: u16,
    /// Single-ended channel mask (hex with 0x prefix, or decimal)
    #[arg(long, value_parser = parse_mask, default_value = "0xFFFF")]
    se_mask: u16,
    /// Buffer height in samples
    #[arg(long, default_value_t = 3000)]
    samples: usize,
    /// How long to stream
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    /// Use the in-process simulated headstage instead of a serial port
    #[arg(long)]
    simulate: bool,
    /// Append raw received bytes to this file
    #[arg(long)]
    raw_log: Option<PathBuf>,
}

fn parse_mask(s: &str) -> std::result::Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid channel mask {s:?}: {e}"))
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = HeadstageConfig {
        port: args.port.clone(),
        num_samples: args.samples,
        raw_log_path: args.raw_log.clone(),
        ..HeadstageConfig::with_masks(args.diff_mask, args.se_mask)
    };
    config.validate().context("invalid settings")?;

    let (transport, kind): (Box<dyn Transport>, SourceKind) = if args.simulate {
        let sim = SimulatedHeadstage::new(SimulatorOptions {
            sample_rate: config.sample_frequency,
            ..SimulatorOptions::default()
        });
        (Box::new(sim), SourceKind::Simulated)
    } else {
        let port = SerialTransport::from_config(&config)
            .with_context(|| format!("opening {}", config.port))?;
        (Box::new(port), SourceKind::SerialHeadstage)
    };

    let mut headstage = Headstage::new(transport, config).with_kind(kind);
    println!("--- CPC headstage ({}) ---", headstage.kind());

    headstage.connect().context("device configuration failed")?;
    if let (Some(device), Some(map)) = (headstage.device_info(), headstage.channel_map()) {
        println!(
            "Device id {} | channels: {}",
            device.device_id,
            map.labels().join(" ")
        );
    }

    headstage.start().context("starting stream")?;
    let until = Instant::now() + Duration::from_secs(args.seconds);
    while Instant::now() < until {
        thread::sleep(Duration::from_secs(1));
        let window = headstage.get_data(None, None).context("reading samples")?;
        let newest: Vec<String> = window
            .rows()
            .into_iter()
            .last()
            .map(|row| row.iter().map(|v| format!("{v:+.4}")).collect())
            .unwrap_or_default();
        println!("{} | {}", headstage.status_text(), newest.join(" "));
    }

    let errors = headstage.error_totals();
    info!(
        "{} candidate frames, defects: {:?}",
        headstage.total_messages(),
        errors
    );
    println!("Stopping...");
    headstage.close().context("closing")?;
    println!("Done.");
    Ok(())
}
