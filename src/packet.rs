//! Wire-format definitions for measurement packets.
//!
//! Every datagram sent by the probe is one measurement packet.  This module is
//! responsible for:
//! - Defining the on-wire binary layout (sequence, timestamp, padding).
//! - Serialising a [`Probe`] into a zero-padded buffer of the configured size.
//! - Deserialising a raw byte slice back into a [`Probe`], rejecting
//!   malformed or truncated input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte fields are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                   Send Time (IEEE-754 double,                 +
//! |                     seconds since epoch)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       [Link RSSI (i16)]       |  Zero padding to packet_size  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Base header: [`HEADER_LEN`] = 12 bytes (seq(4) + send_time(8)).
//! The extended variant inserts a signed 16-bit link RSSI directly after the
//! timestamp ([`RSSI_HEADER_LEN`] = 14); whether that field is present is a
//! sender/receiver configuration agreement, not self-describing on the wire.
//! A receiver that does not expect it treats those two bytes as padding.
//!
//! Sequence numbers are 1-based; 0 is the invalid sentinel used to discard
//! malformed traffic without touching loss accounting.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Byte length of the base fixed header on the wire.
pub const HEADER_LEN: usize = 12;

/// Byte length of the extended header carrying a link RSSI field.
pub const RSSI_HEADER_LEN: usize = 14;

/// Default total datagram size, padding included.
pub const DEFAULT_PACKET_SIZE: usize = 1000;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_SEND_TIME: usize = 4;
const OFF_RSSI: usize = 12;

/// Decoded contents of one measurement packet.
///
/// Fields are in host byte order; [`PacketCodec::encode`] converts to
/// big-endian on the wire and [`PacketCodec::decode`] converts back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probe {
    /// 1-based sequence number assigned immediately before transmission.
    pub seq: u32,
    /// Wall-clock send time, seconds since the unix epoch.
    pub send_time: f64,
    /// Link signal strength in dBm, present only in the extended variant.
    pub rssi: Option<i16>,
}

/// Errors detected when a codec is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The configured datagram size cannot hold the fixed header.
    #[error("packet size {size} is smaller than the {min}-byte header")]
    PacketSizeTooSmall { size: usize, min: usize },
}

/// Encoder/decoder for one agreed packet layout.
///
/// The codec is fixed at construction: datagram size and whether the RSSI
/// field is carried.  Construction fails if the size cannot hold the header,
/// so `encode` itself is infallible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketCodec {
    packet_size: usize,
    carry_rssi: bool,
}

impl PacketCodec {
    /// Codec for the base layout (sequence + timestamp).
    pub fn new(packet_size: usize) -> Result<Self, CodecError> {
        if packet_size < HEADER_LEN {
            return Err(CodecError::PacketSizeTooSmall {
                size: packet_size,
                min: HEADER_LEN,
            });
        }
        Ok(Self {
            packet_size,
            carry_rssi: false,
        })
    }

    /// Codec for the extended layout (sequence + timestamp + link RSSI).
    pub fn with_link_rssi(packet_size: usize) -> Result<Self, CodecError> {
        if packet_size < RSSI_HEADER_LEN {
            return Err(CodecError::PacketSizeTooSmall {
                size: packet_size,
                min: RSSI_HEADER_LEN,
            });
        }
        Ok(Self {
            packet_size,
            carry_rssi: true,
        })
    }

    /// Total datagram size produced by [`encode`](Self::encode).
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Bytes occupied by header fields before the padding starts.
    pub fn header_len(&self) -> usize {
        if self.carry_rssi {
            RSSI_HEADER_LEN
        } else {
            HEADER_LEN
        }
    }

    /// `true` when this codec reads/writes the extended RSSI field.
    pub fn carries_rssi(&self) -> bool {
        self.carry_rssi
    }

    /// Serialise a probe into a newly allocated, zero-padded datagram.
    ///
    /// The result is always exactly [`packet_size`](Self::packet_size) bytes.
    /// For the extended layout a missing `probe.rssi` is written as 0.
    pub fn encode(&self, probe: &Probe) -> Vec<u8> {
        let mut buf = vec![0u8; self.packet_size];
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&probe.seq.to_be_bytes());
        buf[OFF_SEND_TIME..OFF_SEND_TIME + 8].copy_from_slice(&probe.send_time.to_be_bytes());
        if self.carry_rssi {
            let rssi = probe.rssi.unwrap_or(0);
            buf[OFF_RSSI..OFF_RSSI + 2].copy_from_slice(&rssi.to_be_bytes());
        }
        buf
    }

    /// Parse a [`Probe`] from a raw datagram.
    ///
    /// Returns `None` for invalid input:
    /// - `buf` shorter than [`HEADER_LEN`] (truncated/garbage traffic), or
    /// - a wire sequence of 0, which no sender produces.
    ///
    /// Invalid datagrams are discarded by the receive loop without being
    /// counted as received or lost.  The RSSI field is read only when this
    /// codec expects it and the datagram is long enough to hold it.
    pub fn decode(&self, buf: &[u8]) -> Option<Probe> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let seq = u32::from_be_bytes(buf[OFF_SEQ..OFF_SEQ + 4].try_into().unwrap());
        if seq == 0 {
            return None;
        }
        let send_time =
            f64::from_be_bytes(buf[OFF_SEND_TIME..OFF_SEND_TIME + 8].try_into().unwrap());
        let rssi = if self.carry_rssi && buf.len() >= RSSI_HEADER_LEN {
            Some(i16::from_be_bytes(
                buf[OFF_RSSI..OFF_RSSI + 2].try_into().unwrap(),
            ))
        } else {
            None
        };
        Some(Probe {
            seq,
            send_time,
            rssi,
        })
    }
}

/// Wall-clock time as float seconds since the unix epoch, the timestamp
/// format carried inside each packet and written to the logs.
#[inline]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Render a unix-seconds timestamp (or a delay) for a log row, microsecond
/// precision.
#[inline]
pub fn fmt_ts(seconds: f64) -> String {
    format!("{seconds:.6}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_codec(size: usize) -> PacketCodec {
        PacketCodec::new(size).unwrap()
    }

    #[test]
    fn encode_decode_roundtrip() {
        let codec = base_codec(DEFAULT_PACKET_SIZE);
        let probe = Probe {
            seq: 42,
            send_time: 1_700_000_000.123_456,
            rssi: None,
        };
        let decoded = codec.decode(&codec.encode(&probe)).unwrap();
        assert_eq!(decoded, probe);
    }

    #[test]
    fn roundtrip_is_bit_exact() {
        let codec = base_codec(64);
        for &t in &[0.0, -1.5, 1e-300, std::f64::consts::PI * 1e9, 1_756_000_000.000_001] {
            let probe = Probe {
                seq: u32::MAX,
                send_time: t,
                rssi: None,
            };
            let decoded = codec.decode(&codec.encode(&probe)).unwrap();
            assert_eq!(decoded.send_time.to_bits(), t.to_bits());
            assert_eq!(decoded.seq, u32::MAX);
        }
    }

    #[test]
    fn encode_pads_to_packet_size() {
        let codec = base_codec(DEFAULT_PACKET_SIZE);
        let bytes = codec.encode(&Probe {
            seq: 1,
            send_time: 123.5,
            rssi: None,
        });
        assert_eq!(bytes.len(), DEFAULT_PACKET_SIZE);
        assert!(bytes[HEADER_LEN..].iter().all(|&b| b == 0));
    }

    #[test]
    fn min_packet_size_is_header_only() {
        let codec = base_codec(HEADER_LEN);
        let bytes = codec.encode(&Probe {
            seq: 9,
            send_time: 1.0,
            rssi: None,
        });
        assert_eq!(bytes.len(), HEADER_LEN);
    }

    #[test]
    fn packet_size_below_header_rejected() {
        assert_eq!(
            PacketCodec::new(HEADER_LEN - 1),
            Err(CodecError::PacketSizeTooSmall {
                size: HEADER_LEN - 1,
                min: HEADER_LEN,
            })
        );
    }

    #[test]
    fn rssi_codec_needs_fourteen_bytes() {
        assert_eq!(
            PacketCodec::with_link_rssi(13),
            Err(CodecError::PacketSizeTooSmall { size: 13, min: 14 })
        );
        assert!(PacketCodec::with_link_rssi(14).is_ok());
    }

    #[test]
    fn decode_short_buffer_is_invalid() {
        let codec = base_codec(DEFAULT_PACKET_SIZE);
        assert_eq!(codec.decode(&[]), None);
        assert_eq!(codec.decode(&[0u8; HEADER_LEN - 1]), None);
    }

    #[test]
    fn decode_zero_sequence_is_invalid() {
        let codec = base_codec(64);
        // A well-formed buffer whose sequence field is the reserved sentinel.
        let bytes = vec![0u8; 64];
        assert_eq!(codec.decode(&bytes), None);
    }

    #[test]
    fn seq_and_send_time_big_endian_on_wire() {
        let codec = base_codec(16);
        let bytes = codec.encode(&Probe {
            seq: 0x0102_0304,
            send_time: f64::from_be_bytes([0x40, 0x09, 0x21, 0xfb, 0x54, 0x44, 0x2d, 0x18]),
            rssi: None,
        });
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(
            &bytes[OFF_SEND_TIME..OFF_SEND_TIME + 8],
            &[0x40, 0x09, 0x21, 0xfb, 0x54, 0x44, 0x2d, 0x18]
        );
    }

    #[test]
    fn rssi_variant_roundtrip() {
        let codec = PacketCodec::with_link_rssi(100).unwrap();
        let probe = Probe {
            seq: 7,
            send_time: 1_700_000_001.25,
            rssi: Some(-72),
        };
        let decoded = codec.decode(&codec.encode(&probe)).unwrap();
        assert_eq!(decoded.rssi, Some(-72));
        assert_eq!(decoded.seq, 7);
    }

    #[test]
    fn base_decoder_treats_rssi_bytes_as_padding() {
        let extended = PacketCodec::with_link_rssi(100).unwrap();
        let bytes = extended.encode(&Probe {
            seq: 5,
            send_time: 10.0,
            rssi: Some(-40),
        });
        let decoded = base_codec(100).decode(&bytes).unwrap();
        assert_eq!(decoded.rssi, None);
        assert_eq!(decoded.seq, 5);
        assert_eq!(decoded.send_time, 10.0);
    }

    #[test]
    fn missing_rssi_encodes_as_zero() {
        let codec = PacketCodec::with_link_rssi(20).unwrap();
        let bytes = codec.encode(&Probe {
            seq: 3,
            send_time: 1.0,
            rssi: None,
        });
        assert_eq!(&bytes[OFF_RSSI..OFF_RSSI + 2], &[0, 0]);
        assert_eq!(codec.decode(&bytes).unwrap().rssi, Some(0));
    }

    #[test]
    fn decode_arbitrary_bytes_never_panics() {
        use rand::Rng;
        let codec = base_codec(64);
        let extended = PacketCodec::with_link_rssi(64).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let len = rng.gen_range(0..128);
            let buf: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let _ = codec.decode(&buf);
            let _ = extended.decode(&buf);
        }
    }

    #[test]
    fn unix_now_is_sane() {
        let t = unix_now();
        // Well after 2020-01-01 and monotone enough for two adjacent calls.
        assert!(t > 1.577e9);
        assert!(unix_now() >= t);
    }
}
