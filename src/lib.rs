//! One-way UDP link quality probe.
//!
//! A field test harness for radio links: a sender machine emits
//! sequence-numbered, timestamped datagrams at a fixed rate, a receiver
//! machine collects them, and both sides append what they saw to CSV logs
//! built to survive rotation, replacement, and flaky storage.
//!
//! ```text
//!        sender host                            receiver host
//!   +--------------------+                 +----------------------+
//!   | Sender             |  UDP datagrams  | Receiver             |
//!   |   PacketCodec -----+---------------->+----> PacketCodec     |
//!   |     |              | seq + send time |        |             |
//!   |     v              |                 |        v             |
//!   | ResilientCsvWriter |                 | SequenceTracker      |
//!   |  udp_sender_*.csv  |                 | DelayStats           |
//!   +--------------------+                 |        |             |
//!                                          |        v             |
//!                                          | ResilientCsvWriter   |
//!                                          |  udp_receiver_*.csv  |
//!                                          +----------------------+
//! ```
//!
//! Module map:
//! - [`packet`]: on-wire layout and the probe codec.
//! - [`tracker`]: sequence-gap loss accounting.
//! - [`stats`]: running delay statistics (spread and jitter).
//! - [`logfile`]: rotation-tolerant append-only CSV writer.
//! - [`socket`]: bind/retry policy and I/O error classification.
//! - [`sender`]: the transmit state machine.
//! - [`receiver`]: the listen state machine.
//!
//! The two loops are deliberately independent: a run only needs one of them
//! per host, and neither sends anything back to the other.

pub mod logfile;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod socket;
pub mod stats;
pub mod tracker;

pub use logfile::{ResilientCsvWriter, WriterConfig};
pub use packet::{PacketCodec, Probe};
pub use receiver::{Receiver, ReceiverConfig, ReceiverReport};
pub use sender::{Sender, SenderConfig, SenderReport};
pub use socket::SetupError;
pub use stats::DelayStats;
pub use tracker::SequenceTracker;
