//! Socket setup and I/O error classification.
//!
//! Measurement loops never terminate on a socket error; they either retry
//! the operation or rebuild the socket.  [`classify_io_error`] sorts every
//! `io::Error` from `send_to`/`recv_from` into one of those two buckets, and
//! [`bind_probe_socket`] performs the startup bind with the same split:
//! configuration mistakes fail fast, environment trouble is retried until
//! the interface comes up or the run is stopped.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::packet::CodecError;

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// What a failed socket operation means for the loop that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorClass {
    /// The condition can clear on its own; wait briefly and retry with the
    /// same socket.
    Transient,
    /// The socket itself is no longer usable; drop it and bind a fresh one.
    ResetSocket,
}

/// Classify a `send_to`/`recv_from` error.
///
/// Anything unrecognised is treated as transient: retrying a healthy socket
/// costs one delay tick, while discarding it for nothing costs a rebind.
pub fn classify_io_error(e: &io::Error) -> IoErrorClass {
    use io::ErrorKind;
    match e.kind() {
        ErrorKind::WouldBlock
        | ErrorKind::TimedOut
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset => IoErrorClass::Transient,
        ErrorKind::NotConnected | ErrorKind::BrokenPipe | ErrorKind::InvalidInput => {
            IoErrorClass::ResetSocket
        }
        _ => match e.raw_os_error() {
            Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH) | Some(libc::ENOBUFS) => {
                IoErrorClass::Transient
            }
            Some(libc::EBADF) => IoErrorClass::ResetSocket,
            _ => IoErrorClass::Transient,
        },
    }
}

// ---------------------------------------------------------------------------
// Setup errors
// ---------------------------------------------------------------------------

/// Fatal conditions detected while constructing or starting a loop.  Once a
/// loop is past setup it only reports, it does not fail.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The bind failed for a reason retrying cannot fix (address in use,
    /// no privilege, nonsense address).
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("cannot configure socket on {addr}: {source}")]
    Configure {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Stop was requested while still waiting for a usable socket.
    #[error("stopped before {addr} could be bound")]
    Interrupted { addr: SocketAddr },
    #[error("cannot derive a usable send period from frequency {value} packets per second")]
    InvalidFrequency { value: f64 },
}

/// Bind errors that point at the configuration rather than the environment.
fn is_config_bind_error(e: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::AddrInUse | ErrorKind::PermissionDenied | ErrorKind::InvalidInput
    )
}

/// Bind `addr`, retrying environment failures (interface not up yet, address
/// not assigned yet) every `retry_delay` until `stop` is raised.
pub fn bind_probe_socket(
    addr: SocketAddr,
    retry_delay: Duration,
    stop: &AtomicBool,
) -> Result<UdpSocket, SetupError> {
    loop {
        match UdpSocket::bind(addr) {
            Ok(socket) => return Ok(socket),
            Err(e) if is_config_bind_error(&e) => {
                return Err(SetupError::Bind { addr, source: e });
            }
            Err(e) => {
                log::warn!("[socket] bind {addr} failed: {e}; retrying in {retry_delay:?}");
                thread::sleep(retry_delay);
            }
        }
        if stop.load(Ordering::Relaxed) {
            return Err(SetupError::Interrupted { addr });
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
