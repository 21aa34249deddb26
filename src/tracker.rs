//! Receive-side sequence accounting.
//!
//! [`SequenceTracker`] infers packet loss from discontinuities in the
//! sequence-number stream.  It only manages state; decoding and socket I/O
//! are the caller's responsibility.
//!
//! # Accounting contract
//!
//! - The first packet seen initialises the reference point; nothing before it
//!   is judged lost (sequences missing before the run joined the stream are
//!   left to the offline log join).
//! - A forward jump charges `current - last_seen - 1` packets as lost.
//! - Out-of-order and duplicate arrivals (current ≤ last_seen) charge
//!   nothing: the negative gap is clamped to zero.  `last_seen` still takes
//!   the new value, so reordering resets the reference point rather than
//!   being corrected retroactively.
//! - Sequence 0 is the invalid sentinel and must be filtered out before the
//!   tracker is updated.

/// Cumulative loss/receipt state for one receive loop.
///
/// ```text
///   last_seen                current
///       │                       │
///   ────┼───────────────────────┼────▶ seq space
///       │ ◀──── gap charged ───▶│
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    /// Most recently recorded sequence number (0 = nothing seen yet).
    last_seen: u32,
    /// Packets successfully decoded and recorded.
    received: u64,
    /// Packets inferred missing from sequence gaps.
    lost: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one decoded packet and return the gap charged for it.
    ///
    /// # Panics
    ///
    /// Panics in debug mode when fed the sequence-0 sentinel; the receive
    /// loop discards those before accounting.
    pub fn record(&mut self, seq: u32) -> u64 {
        debug_assert!(seq != 0, "sequence 0 is the invalid sentinel");
        let gap = if self.last_seen == 0 {
            // First packet of the run: establish the reference point.
            0
        } else {
            u64::from(seq).saturating_sub(u64::from(self.last_seen) + 1)
        };
        self.lost += gap;
        // Unconditional: out-of-order arrivals move the reference point too.
        self.last_seen = seq;
        self.received += 1;
        gap
    }

    /// Most recently recorded sequence number (0 until the first packet).
    #[inline]
    pub fn last_seen(&self) -> u32 {
        self.last_seen
    }

    #[inline]
    pub fn received(&self) -> u64 {
        self.received
    }

    #[inline]
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Fraction of expected packets that never arrived,
    /// `lost / (received + lost)`.  Zero before any packet is seen.
    ///
    /// Defined over decodable traffic only: discarded malformed datagrams are
    /// in neither the numerator nor the denominator.
    pub fn loss_rate(&self) -> f64 {
        let total = self.received + self.lost;
        if total == 0 {
            0.0
        } else {
            self.lost as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(tracker: &mut SequenceTracker, seqs: &[u32]) {
        for &s in seqs {
            tracker.record(s);
        }
    }

    #[test]
    fn initial_state() {
        let t = SequenceTracker::new();
        assert_eq!(t.last_seen(), 0);
        assert_eq!(t.received(), 0);
        assert_eq!(t.lost(), 0);
        assert_eq!(t.loss_rate(), 0.0);
    }

    #[test]
    fn first_packet_judges_no_loss() {
        let mut t = SequenceTracker::new();
        let gap = t.record(7);
        assert_eq!(gap, 0);
        assert_eq!(t.received(), 1);
        assert_eq!(t.lost(), 0);
        assert_eq!(t.last_seen(), 7);
    }

    #[test]
    fn consecutive_stream_counts_nothing_lost() {
        let mut t = SequenceTracker::new();
        feed(&mut t, &[1, 2, 3, 4, 5]);
        assert_eq!(t.received(), 5);
        assert_eq!(t.lost(), 0);
    }

    #[test]
    fn gap_charges_missing_packets() {
        let mut t = SequenceTracker::new();
        feed(&mut t, &[1, 2, 3, 6, 7]);
        // 4 and 5 never arrived.
        assert_eq!(t.lost(), 2);
        assert_eq!(t.received(), 5);
    }

    #[test]
    fn gap_is_returned_per_packet() {
        let mut t = SequenceTracker::new();
        t.record(1);
        assert_eq!(t.record(2), 0);
        assert_eq!(t.record(6), 3);
        assert_eq!(t.record(7), 0);
    }

    #[test]
    fn out_of_order_clamps_to_zero() {
        let mut t = SequenceTracker::new();
        feed(&mut t, &[5, 3]);
        assert_eq!(t.lost(), 0);
        assert_eq!(t.received(), 2);
        // The reference point moved backwards with the late arrival.
        assert_eq!(t.last_seen(), 3);
        // 4 now looks consecutive-ish again; only the re-jump charges nothing.
        assert_eq!(t.record(4), 0);
    }

    #[test]
    fn duplicate_charges_nothing() {
        let mut t = SequenceTracker::new();
        feed(&mut t, &[4, 4]);
        assert_eq!(t.lost(), 0);
        assert_eq!(t.received(), 2);
    }

    #[test]
    fn reorder_then_forward_jump_recharges_from_new_reference() {
        let mut t = SequenceTracker::new();
        feed(&mut t, &[10, 8]);
        // Reference is now 8, so 12 charges 9..=11.
        assert_eq!(t.record(12), 3);
        assert_eq!(t.lost(), 3);
    }

    #[test]
    fn large_jump() {
        let mut t = SequenceTracker::new();
        t.record(1);
        t.record(1001);
        assert_eq!(t.lost(), 999);
    }

    #[test]
    fn loss_rate_over_decodable_traffic() {
        let mut t = SequenceTracker::new();
        feed(&mut t, &[1, 2, 3, 6, 7, 8, 9, 10]);
        assert_eq!(t.received(), 8);
        assert_eq!(t.lost(), 2);
        assert!((t.loss_rate() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn first_packet_not_one_still_judges_no_loss() {
        // A receiver started late sees e.g. 500 first; earlier sequences are
        // the offline joiner's problem, not wire loss.
        let mut t = SequenceTracker::new();
        assert_eq!(t.record(500), 0);
        assert_eq!(t.lost(), 0);
    }
}
