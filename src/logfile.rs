//! Rotation-tolerant append-only CSV logging.
//!
//! Measurement runs last hours on unattended field units, and their log files
//! are grabbed from outside: synced, rotated, sometimes atomically replaced
//! by tooling while the run is still writing.  [`ResilientCsvWriter`] is the
//! append sink built for that environment:
//!
//! - **Replacement detection**: every N writes or T seconds the writer
//!   compares its open handle's file identity against the path on disk; a
//!   mismatch (or the path vanishing) means an external actor swapped the
//!   file, so the stale handle is closed and the path reopened, with a fresh
//!   header if the new file is empty.  Throttled so the hot path does not pay
//!   a stat() per row.
//! - **Batched flushing**: rows are pushed to the OS every N writes or T
//!   seconds, bounding the data-loss-on-crash window without per-row flush
//!   overhead.
//! - **Backoff on I/O failure**: any open/write/flush failure closes the
//!   handle and schedules a retry after the current backoff delay, which then
//!   doubles up to a ceiling.  A successful open resets the delay to its
//!   base.  Rows written while backed off are dropped.
//!
//! Every failure is absorbed into `bool` results; nothing here panics or
//! terminates the owning process.  Header and rows are caller-supplied, so
//! the same sink serves the send log, the receive log, and any auxiliary
//! telemetry stream appended through it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunable cadence and backoff parameters.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush after this many rows.
    pub flush_every: u32,
    /// Flush when this long has passed since the last flush.
    pub flush_interval: Duration,
    /// Re-check file identity after this many rows.
    pub identity_check_every: u32,
    /// Re-check file identity when this long has passed since the last check.
    pub identity_check_interval: Duration,
    /// First retry delay after an I/O failure.
    pub retry_base: Duration,
    /// Ceiling for the doubling retry delay.
    pub retry_max: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_every: 10,
            flush_interval: Duration::from_secs(1),
            identity_check_every: 50,
            identity_check_interval: Duration::from_secs(1),
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// File identity
// ---------------------------------------------------------------------------

/// Kernel-level identity of an open file, used to detect replacement.
///
/// On non-Unix targets no stable identity token is available, so every
/// comparison matches and rotation detection is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
}

#[cfg(unix)]
fn file_id(meta: &fs::Metadata) -> FileId {
    use std::os::unix::fs::MetadataExt;
    FileId {
        dev: meta.dev(),
        ino: meta.ino(),
    }
}

#[cfg(not(unix))]
fn file_id(_meta: &fs::Metadata) -> FileId {
    FileId {}
}

// ---------------------------------------------------------------------------
// ResilientCsvWriter
// ---------------------------------------------------------------------------

struct Handle {
    out: BufWriter<File>,
    id: FileId,
}

/// Append-only CSV writer that survives external file replacement and
/// transient I/O trouble.  See the module docs for the full contract.
pub struct ResilientCsvWriter {
    path: PathBuf,
    header_line: String,
    label: String,
    config: WriterConfig,
    out: Option<Handle>,
    write_count: u64,
    writes_since_flush: u32,
    writes_since_identity_check: u32,
    last_flush: Instant,
    last_identity_check: Instant,
    next_retry_at: Option<Instant>,
    retry_interval: Duration,
}

impl ResilientCsvWriter {
    /// Writer for `path` with the default cadence/backoff parameters.
    ///
    /// `header` is written as the first row whenever the file is empty (new
    /// file, or replaced by an empty one).  Nothing is opened yet; the first
    /// [`ensure_open`](Self::ensure_open) or [`write_row`](Self::write_row)
    /// does that.
    pub fn new<P: Into<PathBuf>>(path: P, header: &[&str]) -> Self {
        Self::with_config(path, header, WriterConfig::default())
    }

    pub fn with_config<P: Into<PathBuf>>(path: P, header: &[&str], config: WriterConfig) -> Self {
        let path = path.into();
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "csv".to_string());
        let now = Instant::now();
        let retry_interval = config.retry_base;
        Self {
            path,
            header_line: csv_line(header),
            label,
            config,
            out: None,
            write_count: 0,
            writes_since_flush: 0,
            writes_since_identity_check: 0,
            last_flush: now,
            last_identity_check: now,
            next_retry_at: None,
            retry_interval,
        }
    }

    /// Open (or create) the target path in append mode.
    ///
    /// Returns `true` when a handle is held afterwards.  Returns `false` and
    /// schedules a retry when the open fails, or immediately when a
    /// previously scheduled retry deadline has not been reached yet.
    pub fn ensure_open(&mut self) -> bool {
        if self.out.is_some() {
            return true;
        }
        let now = Instant::now();
        if let Some(retry_at) = self.next_retry_at {
            if now < retry_at {
                return false;
            }
        }
        match self.open_and_prepare() {
            Ok(handle) => {
                self.out = Some(handle);
                self.next_retry_at = None;
                // Reset-on-success: trouble has cleared.
                self.retry_interval = self.config.retry_base;
                self.writes_since_flush = 0;
                self.writes_since_identity_check = 0;
                self.last_flush = now;
                self.last_identity_check = now;
                log::debug!("[csv:{}] opened {}", self.label, self.path.display());
                true
            }
            Err(e) => {
                log::warn!(
                    "[csv:{}] open {} failed: {e}",
                    self.label,
                    self.path.display()
                );
                self.schedule_retry(now);
                false
            }
        }
    }

    /// Append one row.  Returns `false` when the row was dropped (writer in
    /// backoff, reopen after replacement failed, or the write itself failed).
    pub fn write_row(&mut self, fields: &[&str]) -> bool {
        let now = Instant::now();
        if !self.ensure_open() {
            return false;
        }
        if self.identity_check_due(now) {
            self.verify_identity(now);
        }
        let handle = match self.out.as_mut() {
            Some(h) => h,
            None => return false,
        };
        let line = csv_line(fields);
        if let Err(e) = handle.out.write_all(line.as_bytes()) {
            log::warn!("[csv:{}] write failed: {e}", self.label);
            self.handle_io_error(now);
            return false;
        }
        self.write_count += 1;
        self.writes_since_flush += 1;
        self.writes_since_identity_check += 1;
        self.maybe_flush(now);
        true
    }

    /// Push buffered rows to the OS.  A failure degrades to close + backoff.
    pub fn flush(&mut self) {
        let now = Instant::now();
        if let Some(handle) = self.out.as_mut() {
            if let Err(e) = handle.out.flush() {
                log::warn!("[csv:{}] flush failed: {e}", self.label);
                self.handle_io_error(now);
                return;
            }
            self.writes_since_flush = 0;
            self.last_flush = now;
        }
    }

    /// Best-effort flush, then release the handle.  Idempotent.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.out.take() {
            let _ = handle.out.flush();
        }
    }

    /// `true` while a file handle is held.
    pub fn is_open(&self) -> bool {
        self.out.is_some()
    }

    /// Rows successfully written since construction (dropped rows excluded).
    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    /// Deadline before which no reopen will be attempted, when backed off.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    /// Delay the next I/O failure will schedule before retrying.
    ///
    /// Starts at `retry_base`, doubles per consecutive failure up to
    /// `retry_max`, and resets to `retry_base` on a successful open.
    pub fn current_backoff(&self) -> Duration {
        self.retry_interval
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn open_and_prepare(&self) -> io::Result<Handle> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let meta = file.metadata()?;
        let id = file_id(&meta);
        let mut out = BufWriter::new(file);
        if meta.len() == 0 {
            out.write_all(self.header_line.as_bytes())?;
            out.flush()?;
        }
        Ok(Handle { out, id })
    }

    fn identity_check_due(&self, now: Instant) -> bool {
        self.writes_since_identity_check >= self.config.identity_check_every
            || now.duration_since(self.last_identity_check) >= self.config.identity_check_interval
    }

    /// Compare the open handle's identity against the path on disk; reopen
    /// when an external actor has replaced or removed the file.
    fn verify_identity(&mut self, now: Instant) {
        self.last_identity_check = now;
        self.writes_since_identity_check = 0;
        let held = match &self.out {
            Some(h) => h.id,
            None => return,
        };
        let on_disk = fs::metadata(&self.path).map(|m| file_id(&m)).ok();
        if on_disk != Some(held) {
            log::info!(
                "[csv:{}] {} was replaced externally; reopening",
                self.label,
                self.path.display()
            );
            self.close();
            // Reopen right away; on failure the normal backoff path takes over.
            self.ensure_open();
        }
    }

    fn maybe_flush(&mut self, now: Instant) {
        if self.writes_since_flush >= self.config.flush_every
            || now.duration_since(self.last_flush) >= self.config.flush_interval
        {
            self.flush();
        }
    }

    /// Drop the handle (best-effort flush on drop) and schedule the retry.
    fn handle_io_error(&mut self, now: Instant) {
        self.out = None;
        self.schedule_retry(now);
    }

    fn schedule_retry(&mut self, now: Instant) {
        self.next_retry_at = Some(now + self.retry_interval);
        log::warn!(
            "[csv:{}] backing off {:?} before retrying {}",
            self.label,
            self.retry_interval,
            self.path.display()
        );
        self.retry_interval = (self.retry_interval * 2).min(self.config.retry_max);
    }
}

impl Drop for ResilientCsvWriter {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// CSV formatting
// ---------------------------------------------------------------------------

/// Join fields into one CSV line, quoting where necessary.
fn csv_line(fields: &[&str]) -> String {
    let mut line = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        push_field(&mut line, field);
    }
    line.push('\n');
    line
}

/// Append one field, quoted and with embedded quotes doubled when the value
/// contains a delimiter, quote, or line break.
fn push_field(line: &mut String, field: &str) {
    let needs_quoting = field.contains([',', '"', '\n', '\r']);
    if !needs_quoting {
        line.push_str(field);
        return;
    }
    line.push('"');
    for ch in field.chars() {
        if ch == '"' {
            line.push('"');
        }
        line.push(ch);
    }
    line.push('"');
}

/// Log file path for one run: `<dir>/<role>_<YYYYMMDD_HHMMSS>.csv`, local
/// time, stamped once at call time (process start).
pub fn timestamped_log_path(dir: &Path, role: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{role}_{stamp}.csv"))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
