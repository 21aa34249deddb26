//! Probe receiver loop.
//!
//! Binds the measurement port, collects probes for a fixed duration, and
//! logs one CSV row per valid packet.  Lifecycle:
//!
//! ```text
//!        +------+  bind ok   +-----------+  deadline / stop  +----------+
//!        | INIT | ---------> | LISTENING | ----------------> | DRAINING |
//!        +------+            +-----------+                   +----------+
//!                              |    ^                             |
//!                     transient: retry same socket                v
//!                     unusable:  rebind, tracker kept        +--------+
//!                                                            | CLOSED |
//!                                                            +--------+
//! ```
//!
//! Reads run with a short timeout so the loop can notice the deadline and
//! the stop flag while the link is quiet.  Loss accounting lives in
//! [`SequenceTracker`]; per-packet delay is sender clock vs receiver clock,
//! so absolute values are only meaningful when the hosts are synchronised,
//! while jitter and spread are robust either way.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::logfile::{timestamped_log_path, ResilientCsvWriter};
use crate::packet::{fmt_ts, unix_now, PacketCodec};
use crate::socket::{bind_probe_socket, classify_io_error, IoErrorClass, SetupError};
use crate::stats::DelayStats;
use crate::tracker::SequenceTracker;

/// Column header of the receive log.
pub const RECEIVER_HEADER: &[&str] = &[
    "seq_num",
    "send_timestamp",
    "recv_timestamp",
    "delay",
    "src_ip",
    "src_port",
    "packet_size",
];

/// File-name role prefix of the receive log.
pub const RECEIVER_LOG_ROLE: &str = "udp_receiver";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Local address probes arrive on.
    pub local: SocketAddr,
    /// Datagram size the sender was configured with.
    pub packet_size: usize,
    /// Receive buffer length; anything longer is truncated by the kernel.
    pub buffer_size: usize,
    /// How long to keep listening.
    pub running_time: Duration,
    /// Directory the timestamped log file is created in.
    pub log_dir: PathBuf,
    /// Read timeout, which doubles as the stop/deadline poll tick.
    pub read_timeout: Duration,
    /// Pause after a transient receive failure, and between bind retries.
    pub retry_delay: Duration,
    /// Decode the extended header variant carrying a link RSSI field.
    pub expect_rssi: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            local: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 20001),
            packet_size: crate::packet::DEFAULT_PACKET_SIZE,
            buffer_size: 1500,
            running_time: Duration::from_secs(3600),
            log_dir: PathBuf::from("./logs"),
            read_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            expect_rssi: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle + report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Init,
    Listening,
    Draining,
    Closed,
}

impl std::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Counters and delay statistics accumulated over one run.  Reported at the
/// end of the run only; never written to the log file.
#[derive(Debug, Clone, Default)]
pub struct ReceiverReport {
    pub received: u64,
    /// Sequence numbers skipped over, per the gap accounting rules.
    pub lost: u64,
    /// Datagrams that did not parse as probes.
    pub discarded: u64,
    pub socket_rebinds: u64,
    /// Rows the log writer refused while backed off.
    pub dropped_log_rows: u64,
    pub elapsed: Duration,
    pub delay: DelayStats,
}

impl ReceiverReport {
    /// Lost fraction of all packets accounted for (received + lost).
    pub fn loss_rate(&self) -> f64 {
        let total = self.received + self.lost;
        if total == 0 {
            return 0.0;
        }
        self.lost as f64 / total as f64
    }
}

impl std::fmt::Display for ReceiverReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "receive complete: {} packets in {:.1} s",
            self.received,
            self.elapsed.as_secs_f64()
        )?;
        writeln!(
            f,
            "  lost              {} ({:.1}%)",
            self.lost,
            self.loss_rate() * 100.0
        )?;
        writeln!(f, "  discarded         {}", self.discarded)?;
        writeln!(f, "  socket rebinds    {}", self.socket_rebinds)?;
        write!(f, "  dropped log rows  {}", self.dropped_log_rows)?;
        if let (Some(min), Some(mean), Some(max), Some(stddev)) = (
            self.delay.min(),
            self.delay.mean(),
            self.delay.max(),
            self.delay.stddev(),
        ) {
            writeln!(f)?;
            writeln!(
                f,
                "  delay min/avg/max {min:.6} / {mean:.6} / {max:.6} s"
            )?;
            writeln!(f, "  delay stddev      {stddev:.6} s")?;
            write!(f, "  jitter            {:.6} s", self.delay.jitter())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Receiver {
    config: ReceiverConfig,
    codec: PacketCodec,
    state: ReceiverState,
}

impl Receiver {
    /// Validate the configuration and build the codec for it.
    pub fn new(config: ReceiverConfig) -> Result<Self, SetupError> {
        let codec = if config.expect_rssi {
            PacketCodec::with_link_rssi(config.packet_size)?
        } else {
            PacketCodec::new(config.packet_size)?
        };
        Ok(Self {
            config,
            codec,
            state: ReceiverState::Init,
        })
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Collect probes until the running time elapses or `stop` is raised.
    ///
    /// Returns an error only for setup-class failures; everything after a
    /// successful bind is absorbed into the report.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<ReceiverReport, SetupError> {
        self.state = ReceiverState::Init;
        let log_path = timestamped_log_path(&self.config.log_dir, RECEIVER_LOG_ROLE);
        let mut log = ResilientCsvWriter::new(&log_path, RECEIVER_HEADER);
        // Open eagerly so even an immediately stopped run leaves a header.
        log.ensure_open();

        let mut socket = self.bind_and_configure(stop)?;
        log::info!(
            "[recv] listening on {} for {:?} (expected probe size {})",
            self.config.local,
            self.config.running_time,
            self.codec.packet_size()
        );

        self.state = ReceiverState::Listening;
        let mut report = ReceiverReport::default();
        let mut tracker = SequenceTracker::new();
        let mut buf = vec![0u8; self.config.buffer_size];
        // Comparing elapsed time against the configured Duration keeps the
        // loop safe for arbitrarily large running times.
        let started = Instant::now();

        while started.elapsed() < self.config.running_time && !stop.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    // Stamp arrival before any parsing or logging work.
                    let recv_time = unix_now();
                    let probe = match self.codec.decode(&buf[..len]) {
                        Some(p) => p,
                        None => {
                            // Not a probe: drop it without touching the
                            // loss accounting.
                            report.discarded += 1;
                            log::debug!("[recv] discarded {len} bytes from {src}");
                            continue;
                        }
                    };
                    let delay = recv_time - probe.send_time;
                    report.received += 1;
                    report.delay.record(delay);
                    log::debug!("[recv] seq {} from {src}: delay {delay:.6} s", probe.seq);
                    let newly_lost = tracker.record(probe.seq);
                    if newly_lost > 0 {
                        log::info!(
                            "[recv] gap before seq {}: {newly_lost} packet(s) missing",
                            probe.seq
                        );
                    }
                    if let Some(rssi) = probe.rssi {
                        log::debug!("[recv] seq {} rssi {rssi} dBm", probe.seq);
                    }
                    let row_ok = log.write_row(&[
                        &probe.seq.to_string(),
                        &fmt_ts(probe.send_time),
                        &fmt_ts(recv_time),
                        &fmt_ts(delay),
                        &src.ip().to_string(),
                        &src.port().to_string(),
                        &len.to_string(),
                    ]);
                    if !row_ok {
                        report.dropped_log_rows += 1;
                    }
                }
                // Timeout tick: nothing arrived, loop around to re-check the
                // deadline and the stop flag.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => match classify_io_error(&e) {
                    IoErrorClass::Transient => {
                        log::warn!("[recv] recv failed: {e}");
                        thread::sleep(self.config.retry_delay);
                    }
                    IoErrorClass::ResetSocket => {
                        log::warn!(
                            "[recv] socket unusable ({e}); rebinding {}",
                            self.config.local
                        );
                        // Release the port before binding it again.
                        drop(socket);
                        socket = match self.bind_and_configure(stop) {
                            Ok(s) => {
                                report.socket_rebinds += 1;
                                s
                            }
                            Err(SetupError::Interrupted { .. }) => break,
                            Err(e) => return Err(e),
                        };
                    }
                },
            }
        }

        self.state = ReceiverState::Draining;
        report.lost = tracker.lost();
        report.elapsed = started.elapsed();
        log.close();
        log::info!(
            "[recv] done: {} received, {} lost, log at {}",
            report.received,
            report.lost,
            log_path.display()
        );
        self.state = ReceiverState::Closed;
        Ok(report)
    }

    /// Bind the listen address and apply the read timeout.  Shared by
    /// startup and by mid-run socket replacement.
    fn bind_and_configure(&self, stop: &AtomicBool) -> Result<UdpSocket, SetupError> {
        let socket = bind_probe_socket(self.config.local, self.config.retry_delay, stop)?;
        socket
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(|source| SetupError::Configure {
                addr: self.config.local,
                source,
            })?;
        Ok(socket)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
