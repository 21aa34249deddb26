//! Probe sender loop.
//!
//! Emits sequence-numbered probes toward the receiver at a fixed rate for a
//! fixed duration, logging one CSV row per attempt.  Lifecycle:
//!
//! ```text
//!        +------+  bind ok   +--------+  deadline / stop   +----------+
//!        | INIT | ---------> | ACTIVE | -----------------> | DRAINING |
//!        +------+            +--------+                    +----------+
//!                              |    ^                           |
//!                     transient: retry same socket              v
//!                     unusable:  rebind, keep seq          +--------+
//!                                                          | CLOSED |
//!                                                          +--------+
//! ```
//!
//! Send failures never abort the run.  A transient failure consumes the
//! sequence number (the receiver must see a gap, because the packet never
//! left) and is paced by the retry delay; an unusable socket is dropped and
//! rebound without consuming the sequence number, so the probe is reissued
//! once the fresh socket is up.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::logfile::{timestamped_log_path, ResilientCsvWriter};
use crate::packet::{fmt_ts, unix_now, PacketCodec, Probe};
use crate::socket::{bind_probe_socket, classify_io_error, IoErrorClass, SetupError};

/// Column header of the send log.
pub const SENDER_HEADER: &[&str] = &["seq_num", "timestamp", "send_done_timestamp", "packet_size"];

/// File-name role prefix of the send log.
pub const SENDER_LOG_ROLE: &str = "udp_sender";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Local address the sending socket binds to.
    pub local: SocketAddr,
    /// Receiver address probes are sent to.
    pub remote: SocketAddr,
    /// On-wire datagram size in bytes, padding included.
    pub packet_size: usize,
    /// Probes per second.
    pub frequency: f64,
    /// How long to keep sending.
    pub running_time: Duration,
    /// Directory the timestamped log file is created in.
    pub log_dir: PathBuf,
    /// Pause after a transient send failure, and between bind retries.
    pub retry_delay: Duration,
    /// Log a row for failed attempts as well as successful ones.
    pub log_error_rows: bool,
    /// When set, probes carry this link RSSI reading in the extended header.
    pub link_rssi: Option<i16>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            local: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 20002),
            remote: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 20001),
            packet_size: crate::packet::DEFAULT_PACKET_SIZE,
            frequency: 10.0,
            running_time: Duration::from_secs(60),
            log_dir: PathBuf::from("./logs"),
            retry_delay: Duration::from_secs(1),
            log_error_rows: true,
            link_rssi: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle + report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Init,
    Active,
    Draining,
    Closed,
}

impl std::fmt::Display for SenderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Counters accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderReport {
    /// Attempts that consumed a sequence number (successful or not).
    pub attempts: u64,
    pub sent: u64,
    pub send_errors: u64,
    pub socket_rebinds: u64,
    /// Rows the log writer refused while backed off.
    pub dropped_log_rows: u64,
    pub elapsed: Duration,
}

impl SenderReport {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.sent as f64 / self.attempts as f64
    }
}

impl std::fmt::Display for SenderReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "send complete: {} attempts in {:.1} s",
            self.attempts,
            self.elapsed.as_secs_f64()
        )?;
        writeln!(
            f,
            "  sent              {} ({:.1}%)",
            self.sent,
            self.success_rate() * 100.0
        )?;
        writeln!(f, "  send errors       {}", self.send_errors)?;
        writeln!(f, "  socket rebinds    {}", self.socket_rebinds)?;
        write!(f, "  dropped log rows  {}", self.dropped_log_rows)
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Sender {
    config: SenderConfig,
    codec: PacketCodec,
    period: Duration,
    state: SenderState,
}

impl Sender {
    /// Validate the configuration, derive the send period, and build the
    /// codec for it.
    pub fn new(config: SenderConfig) -> Result<Self, SetupError> {
        if !config.frequency.is_finite() || config.frequency <= 0.0 {
            return Err(SetupError::InvalidFrequency {
                value: config.frequency,
            });
        }
        // A positive but near-zero frequency asks for a period Duration
        // cannot represent.
        let period = Duration::try_from_secs_f64(1.0 / config.frequency).map_err(|_| {
            SetupError::InvalidFrequency {
                value: config.frequency,
            }
        })?;
        let codec = match config.link_rssi {
            Some(_) => PacketCodec::with_link_rssi(config.packet_size)?,
            None => PacketCodec::new(config.packet_size)?,
        };
        Ok(Self {
            config,
            codec,
            period,
            state: SenderState::Init,
        })
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Send probes until the running time elapses or `stop` is raised.
    ///
    /// Returns an error only for setup-class failures (unbindable local
    /// address, mid-run rebind hitting a configuration error); everything
    /// else is absorbed into the report.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<SenderReport, SetupError> {
        self.state = SenderState::Init;
        let log_path = timestamped_log_path(&self.config.log_dir, SENDER_LOG_ROLE);
        let mut log = ResilientCsvWriter::new(&log_path, SENDER_HEADER);
        // Open eagerly so even an immediately stopped run leaves a header.
        log.ensure_open();

        let mut socket = bind_probe_socket(self.config.local, self.config.retry_delay, stop)?;
        log::info!(
            "[sender] {} -> {}: {} byte probes every {:?} for {:?}",
            self.config.local,
            self.config.remote,
            self.codec.packet_size(),
            self.period,
            self.config.running_time
        );

        self.state = SenderState::Active;
        let mut report = SenderReport::default();
        let mut seq: u32 = 1;
        // Comparing elapsed time against the configured Duration keeps the
        // loop safe for arbitrarily large running times.
        let started = Instant::now();

        while started.elapsed() < self.config.running_time && !stop.load(Ordering::Relaxed) {
            let attempt_started = Instant::now();
            // One clock read serves both the wire header and the log row.
            let send_time = unix_now();
            let payload = self.codec.encode(&Probe {
                seq,
                send_time,
                rssi: self.config.link_rssi,
            });

            match socket.send_to(&payload, self.config.remote) {
                Ok(n) => {
                    report.attempts += 1;
                    report.sent += 1;
                    let done_time = unix_now();
                    let row_ok = log.write_row(&[
                        &seq.to_string(),
                        &fmt_ts(send_time),
                        &fmt_ts(done_time),
                        &n.to_string(),
                    ]);
                    if !row_ok {
                        report.dropped_log_rows += 1;
                    }
                    log::debug!("[sender] seq {seq}: {n} bytes");
                    seq = next_seq(seq);
                    let busy = attempt_started.elapsed();
                    if busy < self.period {
                        thread::sleep(self.period - busy);
                    }
                }
                Err(e) => match classify_io_error(&e) {
                    IoErrorClass::Transient => {
                        report.attempts += 1;
                        report.send_errors += 1;
                        log::warn!("[sender] seq {seq} send failed: {e}");
                        if self.config.log_error_rows {
                            // Error rows keep the column shape: the message
                            // replaces the byte count.
                            let row_ok = log.write_row(&[
                                &seq.to_string(),
                                &fmt_ts(send_time),
                                &fmt_ts(unix_now()),
                                &format!("ERROR: {e}"),
                            ]);
                            if !row_ok {
                                report.dropped_log_rows += 1;
                            }
                        }
                        // The probe never left, so its number is burned and
                        // shows up at the receiver as a gap.
                        seq = next_seq(seq);
                        thread::sleep(self.config.retry_delay);
                    }
                    IoErrorClass::ResetSocket => {
                        log::warn!(
                            "[sender] socket unusable ({e}); rebinding {}",
                            self.config.local
                        );
                        // Release the port before binding it again.
                        drop(socket);
                        socket = match bind_probe_socket(
                            self.config.local,
                            self.config.retry_delay,
                            stop,
                        ) {
                            Ok(s) => {
                                report.socket_rebinds += 1;
                                s
                            }
                            Err(SetupError::Interrupted { .. }) => break,
                            Err(e) => return Err(e),
                        };
                        // seq is untouched: the probe goes out on the new
                        // socket on the next pass.
                    }
                },
            }
        }

        self.state = SenderState::Draining;
        report.elapsed = started.elapsed();
        log.close();
        log::info!(
            "[sender] done: {}/{} sent, log at {}",
            report.sent,
            report.attempts,
            log_path.display()
        );
        self.state = SenderState::Closed;
        Ok(report)
    }
}

/// Advance the sequence counter, wrapping past `u32::MAX` back to 1 so the
/// zero sentinel is never emitted.
#[inline]
fn next_seq(seq: u32) -> u32 {
    match seq.checked_add(1) {
        Some(n) => n,
        None => 1,
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CodecError, HEADER_LEN, RSSI_HEADER_LEN};

    fn loopback_config(log_dir: PathBuf) -> SenderConfig {
        SenderConfig {
            local: "127.0.0.1:0".parse().unwrap(),
            // Discard port; nothing listens, and unconnected UDP does not
            // report that.
            remote: "127.0.0.1:9".parse().unwrap(),
            log_dir,
            ..SenderConfig::default()
        }
    }

    #[test]
    fn rejects_non_positive_frequency() {
        for bad in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let config = SenderConfig {
                frequency: bad,
                ..SenderConfig::default()
            };
            match Sender::new(config) {
                Err(SetupError::InvalidFrequency { value }) => {
                    assert!(if bad.is_nan() { value.is_nan() } else { value == bad })
                }
                other => panic!("expected InvalidFrequency for {bad}, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_frequency_with_unrepresentable_period() {
        // Positive but so close to zero that the derived period would need
        // ~1e30 seconds; construction must refuse it, not defer the failure
        // to run().
        let config = SenderConfig {
            frequency: 1e-30,
            ..SenderConfig::default()
        };
        assert!(matches!(
            Sender::new(config),
            Err(SetupError::InvalidFrequency { .. })
        ));
    }

    #[test]
    fn rejects_packet_size_below_header() {
        let config = SenderConfig {
            packet_size: HEADER_LEN - 1,
            ..SenderConfig::default()
        };
        match Sender::new(config) {
            Err(SetupError::Codec(CodecError::PacketSizeTooSmall { size, min })) => {
                assert_eq!(size, HEADER_LEN - 1);
                assert_eq!(min, HEADER_LEN);
            }
            other => panic!("expected codec error, got {other:?}"),
        }
    }

    #[test]
    fn rssi_probes_need_the_extended_header() {
        let config = SenderConfig {
            packet_size: RSSI_HEADER_LEN - 1,
            link_rssi: Some(-60),
            ..SenderConfig::default()
        };
        assert!(matches!(
            Sender::new(config),
            Err(SetupError::Codec(CodecError::PacketSizeTooSmall { .. }))
        ));
    }

    #[test]
    fn zero_duration_run_leaves_header_only_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = SenderConfig {
            running_time: Duration::from_secs(0),
            ..loopback_config(dir.path().to_path_buf())
        };
        let mut sender = Sender::new(config).unwrap();
        let stop = AtomicBool::new(false);
        let report = sender.run(&stop).unwrap();

        assert_eq!(report.attempts, 0);
        assert_eq!(report.sent, 0);
        assert_eq!(sender.state(), SenderState::Closed);

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(SENDER_LOG_ROLE));
        let contents = std::fs::read_to_string(&entries[0]).unwrap();
        assert_eq!(
            contents,
            "seq_num,timestamp,send_done_timestamp,packet_size\n"
        );
    }

    #[test]
    fn pre_raised_stop_flag_prevents_any_send() {
        let dir = tempfile::tempdir().unwrap();
        let mut sender = Sender::new(loopback_config(dir.path().to_path_buf())).unwrap();
        let stop = AtomicBool::new(true);
        let report = sender.run(&stop).unwrap();
        assert_eq!(report.attempts, 0);
    }

    #[test]
    fn maximal_running_time_does_not_break_the_deadline() {
        // u64::MAX seconds is a valid Duration; the run must still start
        // (and here stop immediately) without any clock arithmetic tripping.
        let dir = tempfile::tempdir().unwrap();
        let config = SenderConfig {
            running_time: Duration::from_secs(u64::MAX),
            ..loopback_config(dir.path().to_path_buf())
        };
        let mut sender = Sender::new(config).unwrap();
        let stop = AtomicBool::new(true);
        let report = sender.run(&stop).unwrap();
        assert_eq!(report.attempts, 0);
        assert_eq!(sender.state(), SenderState::Closed);
    }

    #[test]
    fn sequence_wraps_to_one_not_zero() {
        assert_eq!(next_seq(1), 2);
        assert_eq!(next_seq(u32::MAX - 1), u32::MAX);
        assert_eq!(next_seq(u32::MAX), 1);
    }

    #[test]
    fn report_success_rate() {
        let report = SenderReport {
            attempts: 4,
            sent: 3,
            ..SenderReport::default()
        };
        assert!((report.success_rate() - 0.75).abs() < 1e-12);
        assert_eq!(SenderReport::default().success_rate(), 0.0);
    }
}
