//! CAN Monitor CLI Application
//!
//! Command-line front end for the can-monitor-core library:
//! - Lists and searches the messages of a DBC file
//! - Connects to a CAN channel and shows the selected messages live

use anyhow::{bail, Context, Result};
use can_monitor_core::{
    load_dbc_file, transport, CanMonitor, Database, DisconnectReason, MessageTracker,
    MonitorEvent, MonitorStats,
};
use clap::Parser;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

mod config;

use config::{parse_can_id, AppConfig, CanIdSpec};

/// CAN Monitor - Watch decoded CAN signals live
#[derive(Parser, Debug)]
#[command(name = "can-monitor")]
#[command(about = "Decode and watch live CAN traffic with a DBC file", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the DBC file
    #[arg(long, value_name = "FILE")]
    dbc: Option<PathBuf>,

    /// CAN channel (interface) to open
    #[arg(long, value_name = "NAME")]
    channel: Option<String>,

    /// Bus bitrate in bit/s (125000, 250000, 500000, 1000000)
    #[arg(long, value_name = "BPS")]
    bitrate: Option<u32>,

    /// Message identifier to watch (can be repeated, e.g. 0x100 or 256)
    #[arg(long, value_name = "ID", value_parser = parse_id_arg)]
    select: Vec<u32>,

    /// Watch every message in the database
    #[arg(long)]
    select_all: bool,

    /// Print the messages of the database and exit
    #[arg(long)]
    list: bool,

    /// Print messages whose name or identifier matches TEXT and exit
    #[arg(long, value_name = "TEXT")]
    search: Option<String>,

    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Screen refresh interval in milliseconds
    #[arg(long, value_name = "MS")]
    refresh_ms: Option<u64>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn parse_id_arg(text: &str) -> std::result::Result<u32, String> {
    parse_can_id(text).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Monitor CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using monitor library v{}", can_monitor_core::VERSION);

    let config = build_config(&args)?;
    let Some(dbc_path) = config.input.dbc.clone() else {
        bail!("No DBC file given (use --dbc or set [input] dbc in the config file)");
    };

    if args.list || args.search.is_some() {
        let loaded = load_dbc_file(&dbc_path)
            .with_context(|| format!("Failed to load DBC file {:?}", dbc_path))?;
        print_messages(&loaded.database, args.search.as_deref());
        return Ok(());
    }

    live_mode(&config, &dbc_path)
}

/// Merge the optional config file with command-line overrides
fn build_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    if let Some(dbc) = &args.dbc {
        config.input.dbc = Some(dbc.clone());
    }
    if let Some(channel) = &args.channel {
        config.channel.name = channel.clone();
    }
    if let Some(bitrate) = args.bitrate {
        config.channel.bitrate = bitrate;
    }
    if let Some(refresh_ms) = args.refresh_ms {
        config.display.refresh_ms = refresh_ms.max(10);
    }
    if args.select_all {
        config.selection.all = true;
    }
    config
        .selection
        .ids
        .extend(args.select.iter().map(|id| CanIdSpec::Number(*id)));

    Ok(config)
}

/// Print a table of database messages, optionally filtered
fn print_messages(database: &Database, filter: Option<&str>) {
    let stats = database.stats();
    println!("Database: {}", database.source());
    println!("  Messages: {}", stats.num_messages);
    println!("  Signals:  {}", stats.num_signals);
    println!();

    let messages = match filter {
        Some(text) => database.search(text),
        None => database.messages(),
    };
    if messages.is_empty() {
        println!("No matching messages");
        return;
    }

    println!("{:<12} {:<32} {:>5} {:>8}  Sender", "ID", "Name", "DLC", "Signals");
    for message in messages {
        println!(
            "{:<12} {:<32} {:>5} {:>8}  {}",
            format!("0x{:X}", message.id),
            message.name,
            message.size,
            message.signals.len(),
            message.sender.as_deref().unwrap_or("-")
        );
    }
}

/// Connect, route selected messages into a live table and render it
fn live_mode(config: &AppConfig, dbc_path: &Path) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let driver = transport::default_driver()?;
    // Bounded like the capture queue; messages the screen cannot keep up with are refused
    let (tx, rx) = mpsc::sync_channel::<MonitorEvent>(config.monitor.queue_depth);
    let monitor = CanMonitor::new(driver, config.monitor.clone(), tx);

    let count = monitor
        .load_database(dbc_path)
        .with_context(|| format!("Failed to load DBC file {:?}", dbc_path))?;
    log::info!("Loaded {} messages from {:?}", count, dbc_path);

    if config.selection.all {
        monitor.select_all();
    }
    for id in config.selected_ids()? {
        if !monitor.database().contains(id) {
            log::warn!("0x{:X} is not defined in the database", id);
        }
        monitor.select(id);
    }
    if monitor.selection().is_empty() {
        log::warn!("Nothing selected; use --select ID or --select-all");
    }

    let channel = &config.channel;
    monitor
        .connect(&channel.name, channel.bitrate)
        .with_context(|| format!("Failed to open {} at {} bit/s", channel.name, channel.bitrate))?;

    let refresh = Duration::from_millis(config.display.refresh_ms);
    let mut tracker = MessageTracker::new();
    let mut last_render = Instant::now();
    let mut ended = None;

    while running.load(Ordering::SeqCst) && ended.is_none() {
        match rx.recv_timeout(refresh) {
            Ok(event) => ended = handle_event(event, &mut tracker),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        // The Disconnected event itself may have been refused by a full buffer
        if ended.is_none() && !monitor.is_connected() {
            ended = rx.try_iter().find_map(|event| handle_event(event, &mut tracker));
            ended.get_or_insert(DisconnectReason::LinkLost);
        }
        if last_render.elapsed() >= refresh {
            render(&tracker, &channel.name, channel.bitrate, &monitor.stats())?;
            last_render = Instant::now();
        }
    }

    monitor.disconnect();
    let stats = monitor.stats();
    log::info!(
        "Received {} frames: {} decoded, {} unmatched, {} truncated, {} dropped, {} shown, {} refused",
        stats.received,
        stats.decoded,
        stats.unmatched,
        stats.truncated,
        stats.dropped,
        stats.delivered,
        stats.rejected
    );

    if ended == Some(DisconnectReason::LinkLost) {
        bail!("Link lost on {}", channel.name);
    }
    Ok(())
}

/// Apply one monitor event; returns the disconnect reason when the session ended
fn handle_event(event: MonitorEvent, tracker: &mut MessageTracker) -> Option<DisconnectReason> {
    match event {
        MonitorEvent::Message(message) => tracker.record(&message),
        MonitorEvent::Error { kind, detail } => log::warn!("{}: {}", kind, detail),
        MonitorEvent::Connected { channel, bitrate } => {
            log::info!("Connected to {} at {} bit/s", channel, bitrate)
        }
        MonitorEvent::DatabaseLoaded { count } => log::debug!("Database active ({} messages)", count),
        MonitorEvent::Disconnected { reason } => {
            log::info!("Disconnected ({})", reason);
            return Some(reason);
        }
    }
    None
}

fn render(tracker: &MessageTracker, channel: &str, bitrate: u32, stats: &MonitorStats) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    // Clear screen and home the cursor
    write!(out, "\x1B[2J\x1B[H")?;
    writeln!(
        out,
        "{}  {} @ {} bit/s  rx {}  shown {}  dropped {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        channel,
        bitrate,
        stats.received,
        stats.delivered,
        stats.dropped
    )?;
    writeln!(out)?;
    writeln!(out, "{:<12} {:<28} {:>8} {:>10}  Signals", "ID", "Name", "Count", "Time (s)")?;

    for entry in tracker.snapshot() {
        let signals: Vec<String> = entry.signals.iter().map(|s| s.to_string()).collect();
        writeln!(
            out,
            "{:<12} {:<28} {:>8} {:>10.3}  {}{}",
            format!("0x{:X}", entry.can_id),
            entry.message_name,
            entry.count,
            entry.last_timestamp_ns as f64 / 1e9,
            signals.join(", "),
            if entry.truncated { "  [truncated]" } else { "" }
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
