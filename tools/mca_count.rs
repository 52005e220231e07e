//! MCA Count CLI Tool
//!
//! Opens one configured channel, counts for a preset time and prints the
//! run statistics and ROI integrals.
//!
//! # Usage
//!
//! ```bash
//! # Count 2 s of real time on channel mca1
//! cargo run --bin mca_count -- --config config/mca.toml --channel mca1 --seconds 2
//!
//! # Count live time with two ROIs, JSON output
//! cargo run --bin mca_count -- -c mca1 -s 5 --mode live --roi 100:200 --roi 450:520 --json
//! ```
//!
//! Only mock and remote channels can be opened here; local vendor libraries
//! are bound by the embedding application.

use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::{debug, info, Level};

use rust_mca::config::McaConfig;
use rust_mca::derived::{livetime_corrected_integral, rate_corrected_integral};
use rust_mca::logging::{self, OutputFormat, TracingConfig};
use rust_mca::{LibraryBindings, McaRegistry, Roi, TimerMode};

// =============================================================================
// CLI Argument Structure
// =============================================================================

/// Count on one MCA channel for a preset time
#[derive(Parser, Debug)]
#[command(name = "mca_count")]
#[command(version = "0.1.0")]
#[command(about = "Count on an MCA channel and print statistics", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "config/mca.toml", value_name = "FILE")]
    config: PathBuf,

    /// Channel id
    #[arg(short, long)]
    channel: String,

    /// Preset time in seconds
    #[arg(short, long, default_value_t = 1.0)]
    seconds: f64,

    /// Clock to count (defaults to the channel's configured mode)
    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    /// Region of interest (format: low:high), repeatable
    #[arg(long = "roi", value_name = "LOW:HIGH", value_parser = parse_roi)]
    rois: Vec<Roi>,

    /// Print one JSON object instead of a table
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Real time
    Real,
    /// Live time
    Live,
}

impl From<ModeArg> for TimerMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Real => TimerMode::RealTime,
            ModeArg::Live => TimerMode::LiveTime,
        }
    }
}

fn parse_roi(s: &str) -> std::result::Result<Roi, String> {
    let (low, high) = s
        .split_once(':')
        .ok_or_else(|| format!("ROI '{}' must be LOW:HIGH", s))?;
    let low: usize = low.trim().parse().map_err(|_| format!("Invalid ROI low bin '{}'", low))?;
    let high: usize = high
        .trim()
        .parse()
        .map_err(|_| format!("Invalid ROI high bin '{}'", high))?;
    if high < low {
        return Err(format!("ROI '{}' has high < low", s));
    }
    Ok(Roi::new(low, high))
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

// =============================================================================
// Core Logic
// =============================================================================

fn run(args: &Args) -> Result<()> {
    let config = McaConfig::load_from(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let mut tracing_config = TracingConfig::from_logging_config(&config.logging)?;
    if args.verbose {
        tracing_config = TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact);
    }
    logging::init(tracing_config)?;

    if config.channel(&args.channel).is_none() {
        bail!("Channel '{}' is not configured", args.channel);
    }
    let registry = McaRegistry::from_config(&config, &LibraryBindings::new())?;
    let mut timer = registry.timer(&args.channel)?;
    if let Some(mode) = args.mode {
        timer.set_mode(mode.into());
    }

    let poll = {
        let mut controller = timer.controller().lock();
        if !args.rois.is_empty() {
            controller.set_rois(&args.rois)?;
        }
        controller.retry_policy().busy_poll_interval
    };

    info!(channel = %args.channel, seconds = args.seconds, mode = ?timer.mode(), "Counting");
    timer.start(args.seconds)?;

    let deadline = Instant::now()
        + Duration::try_from_secs_f64(args.seconds * 2.0 + 5.0)
            .with_context(|| format!("Invalid preset time {} s", args.seconds))?;
    while timer.is_busy()? {
        if Instant::now() >= deadline {
            timer.stop()?;
            bail!("Channel '{}' did not finish counting", args.channel);
        }
        thread::sleep(poll);
    }

    let mut controller = timer.controller().lock();
    controller.refresh_spectrum()?;
    let stats = controller.read_statistics()?;
    debug!(?stats, "Run finished");

    let mut rois = Vec::new();
    for index in 0..controller.rois().len() {
        let raw = controller.raw_roi_integral(index)?;
        rois.push(json!({
            "index": index,
            "low": controller.rois()[index].low,
            "high": controller.rois()[index].high,
            "raw": raw,
            "rate_corrected": rate_corrected_integral(raw, &stats),
            "livetime_corrected": livetime_corrected_integral(raw, &stats),
        }));
    }

    if args.json {
        let report = json!({
            "channel": args.channel,
            "statistics": stats,
            "rois": rois,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Channel {} ({})", args.channel, controller.backend_name());
    println!("  real time         {:>14.6} s", stats.real_time);
    println!("  live time         {:>14.6} s", stats.live_time);
    println!("  input count rate  {:>14.1} /s", stats.input_count_rate);
    println!("  output count rate {:>14.1} /s", stats.output_count_rate);
    println!("  events            {:>14.0}", stats.num_events);
    println!("  dead time         {:>13.2} %", stats.dead_time_fraction() * 100.0);
    for roi in &rois {
        println!(
            "  ROI {} [{}..{}]  raw {}  corrected {:.1}",
            roi["index"], roi["low"], roi["high"], roi["raw"], roi["livetime_corrected"]
        );
    }
    Ok(())
}
