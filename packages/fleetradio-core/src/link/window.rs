//! Per-destination ARQ sliding window: send-side retransmission bookkeeping
//! and receive-side selective-ACK tracking.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// A contiguous range of sequence numbers, inclusive, as carried in a SACK
/// block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackRange {
    /// First sequence number in the range.
    pub start: u32,
    /// Last sequence number in the range, inclusive.
    pub end: u32,
}

/// A selective-ACK block: the receiver's current base plus up to
/// `max_sacks` ranges of out-of-order sequences received above it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sack {
    /// The receiver's current `recv_base` (oldest not-yet-received
    /// sequence).
    pub recv_base: u32,
    /// Ranges of sequences received above `recv_base`.
    pub ranges: Vec<SackRange>,
}

struct UnackedPacket {
    tx_time: f64,
    nretrans: u32,
    deadline: f64,
}

/// Sender-side window state for one destination.
pub struct SendWindow {
    window_size: u32,
    send_base: u32,
    send_next: u32,
    unacked: BTreeMap<u32, UnackedPacket>,
    /// EWMA of observed RTTs, in seconds. `None` until the first sample.
    rtt_ewma: Option<f64>,
    retransmission_delay: Duration,
    retransmission_delay_slop: f64,
    min_retransmission_delay: Duration,
    max_retransmissions: Option<u32>,
}

/// What happened to a packet when a SACK or timeout sweep was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// The packet was acknowledged and removed from the window.
    Acked,
    /// The packet is due for retransmission (timed out or selectively
    /// NAKed).
    Retransmit,
    /// The packet exceeded `max_retransmissions` and the peer should be
    /// marked unreachable.
    Unreachable,
}

impl SendWindow {
    /// Creates a new send window with no in-flight packets.
    #[must_use]
    pub fn new(
        window_size: u32,
        retransmission_delay: Duration,
        retransmission_delay_slop: f64,
        min_retransmission_delay: Duration,
        max_retransmissions: Option<u32>,
    ) -> Self {
        Self {
            window_size,
            send_base: 0,
            send_next: 0,
            unacked: BTreeMap::new(),
            rtt_ewma: None,
            retransmission_delay,
            retransmission_delay_slop,
            min_retransmission_delay,
            max_retransmissions,
        }
    }

    /// Returns whether the window has room for another packet.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.send_next.wrapping_sub(self.send_base) < self.window_size
    }

    fn current_r(&self) -> f64 {
        let r = self
            .rtt_ewma
            .map(|rtt| rtt * self.retransmission_delay_slop)
            .unwrap_or_else(|| self.retransmission_delay.as_secs_f64());
        r.max(self.min_retransmission_delay.as_secs_f64())
    }

    /// Assigns the next sequence number to a new packet, recording it as
    /// unacked. Caller must check [`has_capacity`](Self::has_capacity)
    /// first.
    pub fn assign(&mut self, now: f64) -> u32 {
        let seq = self.send_next;
        self.send_next = self.send_next.wrapping_add(1);
        let r = self.current_r();
        self.unacked.insert(
            seq,
            UnackedPacket {
                tx_time: now,
                nretrans: 0,
                deadline: now + r,
            },
        );
        seq
    }

    /// Returns `send_base` (oldest unacked sequence).
    #[must_use]
    pub fn send_base(&self) -> u32 {
        self.send_base
    }

    /// Returns `send_next` (next sequence to assign).
    #[must_use]
    pub fn send_next(&self) -> u32 {
        self.send_next
    }

    /// Applies a received SACK: clears acknowledged packets, advances
    /// `send_base` over contiguous acked sequences, and returns selectively
    /// NAKed sequences (gaps below the highest SACKed sequence) that should
    /// be retransmitted immediately.
    pub fn apply_sack(&mut self, sack: &Sack, now: f64) -> Vec<(u32, PacketOutcome)> {
        let mut outcomes = Vec::new();

        let mut acked: BTreeSet<u32> = BTreeSet::new();
        if sack.recv_base > 0 {
            for seq in self.unacked.keys().copied().collect::<Vec<_>>() {
                if seq < sack.recv_base {
                    acked.insert(seq);
                }
            }
        }
        for range in &sack.ranges {
            for seq in range.start..=range.end {
                if self.unacked.contains_key(&seq) {
                    acked.insert(seq);
                }
            }
        }

        for seq in &acked {
            if let Some(pkt) = self.unacked.remove(seq) {
                let rtt = (now - pkt.tx_time).max(0.0);
                self.rtt_ewma = Some(match self.rtt_ewma {
                    Some(prev) => 0.875 * prev + 0.125 * rtt,
                    None => rtt,
                });
                outcomes.push((*seq, PacketOutcome::Acked));
            }
        }

        while !self.unacked.contains_key(&self.send_base) && self.send_base != self.send_next {
            self.send_base = self.send_base.wrapping_add(1);
        }

        let highest_sacked = sack.ranges.iter().map(|r| r.end).max();
        if let Some(highest) = highest_sacked {
            let gaps: Vec<u32> = self
                .unacked
                .keys()
                .copied()
                .filter(|&seq| seq < highest)
                .collect();
            for seq in gaps {
                outcomes.push(self.mark_retransmit(seq, now));
            }
        }

        outcomes
    }

    fn mark_retransmit(&mut self, seq: u32, now: f64) -> (u32, PacketOutcome) {
        let r = self.current_r();
        if let Some(pkt) = self.unacked.get_mut(&seq) {
            pkt.nretrans += 1;
            pkt.tx_time = now;
            pkt.deadline = now + r;
            if let Some(max) = self.max_retransmissions {
                if pkt.nretrans > max {
                    self.unacked.remove(&seq);
                    return (seq, PacketOutcome::Unreachable);
                }
            }
        }
        (seq, PacketOutcome::Retransmit)
    }

    /// Sweeps for packets whose retransmission deadline has passed at `now`,
    /// retransmitting or declaring them lost.
    pub fn sweep_timeouts(&mut self, now: f64) -> Vec<(u32, PacketOutcome)> {
        let expired: Vec<u32> = self
            .unacked
            .iter()
            .filter(|(_, pkt)| pkt.deadline <= now)
            .map(|(&seq, _)| seq)
            .collect();
        expired
            .into_iter()
            .map(|seq| self.mark_retransmit(seq, now))
            .collect()
    }

    /// Number of packets currently unacknowledged.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }
}

/// What a single [`RecvWindow::receive`] call produced: which sequences are
/// now safe to hand to the IP shim, and whether a gap opened up that
/// warrants an explicit NAK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveOutcome {
    /// Sequences to deliver upward, in order. Empty if nothing is
    /// deliverable yet (ordering enforced, packet arrived out of order).
    pub delivered: Vec<u32>,
    /// The gap sequence an explicit NAK should be sent for, if a gap opened
    /// or widened on this call and the explicit-NAK rate limit allows it.
    pub explicit_nak: Option<u32>,
}

/// Receiver-side window state for one destination.
pub struct RecvWindow {
    recv_base: u32,
    out_of_order: BTreeSet<u32>,
    max_sacks: usize,
    recent_naks: Vec<(u32, f64)>,
    explicit_nak_window: u32,
    explicit_nak_window_duration: Duration,
    enforce_ordering: bool,
}

impl RecvWindow {
    /// Creates a new receive window starting at sequence 0.
    #[must_use]
    pub fn new(
        max_sacks: usize,
        explicit_nak_window: u32,
        explicit_nak_window_duration: Duration,
        enforce_ordering: bool,
    ) -> Self {
        Self {
            recv_base: 0,
            out_of_order: BTreeSet::new(),
            max_sacks,
            recent_naks: Vec::new(),
            explicit_nak_window,
            explicit_nak_window_duration,
            enforce_ordering,
        }
    }

    /// Records receipt of `seq` at `now`, advancing `recv_base` over any
    /// now-contiguous run and deciding whether an explicit NAK is due for
    /// the gap below it.
    ///
    /// With `enforce_ordering` set, a packet landing ahead of `recv_base` is
    /// buffered (nothing is delivered) until the gap closes; the whole
    /// contiguous run is then delivered at once. Without it, every packet is
    /// delivered as it arrives, in receipt order, and out-of-order sequences
    /// are only tracked for the SACK block.
    pub fn receive(&mut self, seq: u32, now: f64) -> ReceiveOutcome {
        if seq < self.recv_base {
            return ReceiveOutcome::default(); // duplicate of an already-delivered packet
        }

        let explicit_nak = if seq > self.recv_base && self.should_emit_nak(self.recv_base, now) {
            Some(self.recv_base)
        } else {
            None
        };

        let mut delivered = if self.enforce_ordering { Vec::new() } else { vec![seq] };
        if seq == self.recv_base {
            if self.enforce_ordering {
                delivered.push(self.recv_base);
            }
            self.recv_base = self.recv_base.wrapping_add(1);
            while self.out_of_order.remove(&self.recv_base) {
                if self.enforce_ordering {
                    delivered.push(self.recv_base);
                }
                self.recv_base = self.recv_base.wrapping_add(1);
            }
        } else {
            self.out_of_order.insert(seq);
        }

        ReceiveOutcome { delivered, explicit_nak }
    }

    /// Builds the SACK block to attach to the next outgoing packet or
    /// standalone ACK.
    #[must_use]
    pub fn build_sack(&self) -> Sack {
        let mut ranges = Vec::new();
        let mut iter = self.out_of_order.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            ranges.push(SackRange { start, end });
            if ranges.len() >= self.max_sacks {
                break;
            }
        }
        Sack {
            recv_base: self.recv_base,
            ranges,
        }
    }

    /// Returns whether an explicit NAK for `seq` should be emitted at `now`,
    /// subject to the explicit-NAK-window rate limit. Suppresses duplicates
    /// within the window.
    pub fn should_emit_nak(&mut self, seq: u32, now: f64) -> bool {
        self.recent_naks
            .retain(|&(_, t)| now - t < self.explicit_nak_window_duration.as_secs_f64());
        if self.recent_naks.iter().any(|&(s, _)| s == seq) {
            return false;
        }
        if self.recent_naks.len() as u32 >= self.explicit_nak_window {
            return false;
        }
        self.recent_naks.push((seq, now));
        true
    }

    /// Returns `recv_base`.
    #[must_use]
    pub fn recv_base(&self) -> u32 {
        self.recv_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> SendWindow {
        SendWindow::new(
            1024,
            Duration::from_millis(500),
            2.0,
            Duration::from_millis(100),
            Some(10),
        )
    }

    #[test]
    fn assign_advances_send_next_and_respects_capacity() {
        let mut w = SendWindow::new(2, Duration::from_millis(500), 2.0, Duration::from_millis(100), None);
        assert!(w.has_capacity());
        w.assign(0.0);
        assert!(w.has_capacity());
        w.assign(0.0);
        assert!(!w.has_capacity());
    }

    #[test]
    fn sack_with_gap_triggers_selective_retransmit() {
        let mut send = window();
        for _ in 0..10 {
            send.assign(0.0);
        }
        // Receiver got 0..4 and 7..9, gap at 5..6.
        let sack = Sack {
            recv_base: 5,
            ranges: vec![SackRange { start: 7, end: 9 }],
        };
        let outcomes = send.apply_sack(&sack, 1.0);
        let retransmitted: Vec<u32> = outcomes
            .iter()
            .filter(|(_, o)| *o == PacketOutcome::Retransmit)
            .map(|(seq, _)| *seq)
            .collect();
        assert_eq!(retransmitted, vec![5, 6]);
    }

    #[test]
    fn full_ack_advances_window_to_end() {
        let mut send = window();
        for _ in 0..10 {
            send.assign(0.0);
        }
        let sack = Sack {
            recv_base: 10,
            ranges: vec![],
        };
        send.apply_sack(&sack, 1.0);
        assert_eq!(send.send_base(), 10);
        assert_eq!(send.send_next(), 10);
        assert_eq!(send.unacked_count(), 0);
    }

    #[test]
    fn exceeding_max_retransmissions_marks_unreachable() {
        let mut send = SendWindow::new(
            4,
            Duration::from_millis(10),
            1.0,
            Duration::from_millis(1),
            Some(1),
        );
        send.assign(0.0);
        let outcomes = send.sweep_timeouts(1.0);
        assert_eq!(outcomes, vec![(0, PacketOutcome::Retransmit)]);
        let outcomes = send.sweep_timeouts(3.0);
        assert_eq!(outcomes, vec![(0, PacketOutcome::Unreachable)]);
    }

    #[test]
    fn recv_window_reorders_reverse_order_burst() {
        let mut recv = RecvWindow::new(8, 4, Duration::from_secs(1), false);
        for seq in (0..8).rev() {
            recv.receive(seq, 0.0);
        }
        assert_eq!(recv.recv_base(), 8);
    }

    #[test]
    fn nak_rate_limit_suppresses_duplicates_and_caps_count() {
        let mut recv = RecvWindow::new(8, 2, Duration::from_secs(10), false);
        assert!(recv.should_emit_nak(5, 0.0));
        assert!(!recv.should_emit_nak(5, 0.1));
        assert!(recv.should_emit_nak(6, 0.1));
        assert!(!recv.should_emit_nak(7, 0.1));
    }

    #[test]
    fn gap_triggers_single_explicit_nak_per_window() {
        let mut recv = RecvWindow::new(8, 4, Duration::from_secs(1), false);
        let outcome = recv.receive(3, 0.0);
        assert_eq!(outcome.explicit_nak, Some(0));
        let outcome = recv.receive(4, 0.1);
        assert_eq!(outcome.explicit_nak, None); // same gap, suppressed as a duplicate
    }

    #[test]
    fn immediate_mode_delivers_every_packet_on_arrival() {
        let mut recv = RecvWindow::new(8, 4, Duration::from_secs(1), false);
        assert_eq!(recv.receive(2, 0.0).delivered, vec![2]);
        assert_eq!(recv.receive(0, 0.0).delivered, vec![0]);
        assert_eq!(recv.receive(1, 0.0).delivered, vec![1]);
        assert_eq!(recv.recv_base(), 3);
    }

    #[test]
    fn enforced_ordering_buffers_until_gap_closes() {
        let mut recv = RecvWindow::new(8, 4, Duration::from_secs(1), true);
        assert_eq!(recv.receive(2, 0.0).delivered, Vec::<u32>::new());
        assert_eq!(recv.receive(1, 0.0).delivered, Vec::<u32>::new());
        assert_eq!(recv.receive(0, 0.0).delivered, vec![0, 1, 2]);
        assert_eq!(recv.recv_base(), 3);
    }
}
