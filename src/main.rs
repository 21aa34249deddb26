//! Command-line entry point.
//!
//! Owns only process concerns: argument parsing, logging setup, signal
//! handling, and printing the finished run's report.  All measurement
//! behaviour lives in the library crate.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};

use udp_probe::packet::DEFAULT_PACKET_SIZE;
use udp_probe::receiver::{Receiver, ReceiverConfig};
use udp_probe::sender::{Sender, SenderConfig};
use udp_probe::socket::SetupError;

/// Raised by SIGINT/SIGTERM; both loops poll it and drain gracefully.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    // Only the async-signal-safe store happens here; the loops do the rest.
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }
}

#[derive(Parser)]
#[command(name = "udp-probe", version, about = "One-way UDP link quality probe")]
struct Cli {
    /// Debug-level diagnostics on stderr (RUST_LOG still takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Emit timestamped probes toward a receiver.
    Send(SendArgs),
    /// Listen for probes, accounting for loss and delay.
    Recv(RecvArgs),
}

#[derive(Args)]
struct SendArgs {
    /// Receiver address, e.g. 192.168.1.20:20001.
    #[arg(long)]
    remote: SocketAddr,

    /// Local address to bind the sending socket to.
    #[arg(long, default_value = "0.0.0.0:20002")]
    local: SocketAddr,

    /// Datagram size in bytes, padding included.
    #[arg(long, default_value_t = DEFAULT_PACKET_SIZE)]
    packet_size: usize,

    /// Probes per second.
    #[arg(long, default_value_t = 10.0)]
    frequency: f64,

    /// Sending duration in seconds.
    #[arg(long = "time", default_value_t = 60)]
    running_time: u64,

    /// Directory for the timestamped CSV log.
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Seconds to wait after a failed send before the next attempt.
    #[arg(long, default_value_t = 1.0)]
    retry_delay: f64,

    /// Do not log rows for failed send attempts.
    #[arg(long)]
    no_error_rows: bool,

    /// Stamp this link RSSI (dBm) into each probe's extended header.
    #[arg(long)]
    rssi: Option<i16>,
}

#[derive(Args)]
struct RecvArgs {
    /// Local address to listen on.
    #[arg(long, default_value = "0.0.0.0:20001")]
    local: SocketAddr,

    /// Datagram size the sender is configured with.
    #[arg(long, default_value_t = DEFAULT_PACKET_SIZE)]
    packet_size: usize,

    /// Receive buffer size in bytes.
    #[arg(long, default_value_t = 1500)]
    buffer_size: usize,

    /// Listening duration in seconds.
    #[arg(long = "time", default_value_t = 3600)]
    running_time: u64,

    /// Directory for the timestamped CSV log.
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Probes carry the extended header with a link RSSI field.
    #[arg(long)]
    expect_rssi: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    install_signal_handlers();
    match cli.mode {
        Mode::Send(args) => run_send(args),
        Mode::Recv(args) => run_recv(args),
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn run_send(args: SendArgs) -> anyhow::Result<()> {
    let config = SenderConfig {
        local: args.local,
        remote: args.remote,
        packet_size: args.packet_size,
        frequency: args.frequency,
        running_time: Duration::from_secs(args.running_time),
        log_dir: args.log_dir,
        retry_delay: parse_delay(args.retry_delay)?,
        log_error_rows: !args.no_error_rows,
        link_rssi: args.rssi,
    };
    let mut sender = Sender::new(config).context("invalid sender configuration")?;
    match sender.run(&SHUTDOWN) {
        Ok(report) => {
            println!("{report}");
            Ok(())
        }
        Err(SetupError::Interrupted { addr }) => {
            log::info!("[main] stopped while waiting to bind {addr}");
            Ok(())
        }
        Err(e) => Err(e).context("sender failed"),
    }
}

fn run_recv(args: RecvArgs) -> anyhow::Result<()> {
    let config = ReceiverConfig {
        local: args.local,
        packet_size: args.packet_size,
        buffer_size: args.buffer_size,
        running_time: Duration::from_secs(args.running_time),
        log_dir: args.log_dir,
        expect_rssi: args.expect_rssi,
        ..ReceiverConfig::default()
    };
    let mut receiver = Receiver::new(config).context("invalid receiver configuration")?;
    match receiver.run(&SHUTDOWN) {
        Ok(report) => {
            println!("{report}");
            Ok(())
        }
        Err(SetupError::Interrupted { addr }) => {
            log::info!("[main] stopped while waiting to bind {addr}");
            Ok(())
        }
        Err(e) => Err(e).context("receiver failed"),
    }
}

/// CLI delays arrive as float seconds; reject values `Duration` cannot hold.
fn parse_delay(seconds: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| anyhow!("retry delay {seconds} is not a representable number of seconds"))
}
