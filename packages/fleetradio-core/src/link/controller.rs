//! Public API for the ARQ + adaptive-MCS link controller.
//!
//! Owns per-destination [`SendWindow`]/[`RecvWindow`]/[`LinkAmc`] triples.
//! State is hot-path, synchronous, and never held across an `.await`, so it
//! lives behind `parking_lot::Mutex` rather than a Tokio lock, matching the
//! concurrency model described for the ARQ window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::events::{ControlPlaneEvent, EventListener};
use crate::link::amc::{LinkAmc, McsProposal};
use crate::link::window::{PacketOutcome, ReceiveOutcome, RecvWindow, Sack, SendWindow};
use crate::neighborhood::NodeId;

/// An explicit NAK due for transmission, carrying the fixed MCS/gain that
/// ACK-class traffic uses rather than the peer's adaptively-selected data
/// MCS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NakSignal {
    /// The gap sequence being NAKed.
    pub seq: u32,
    /// Fixed MCS index for ACK-class traffic.
    pub mcs: u8,
    /// Gain offset for ACK-class traffic.
    pub gain_db: f64,
}

/// What [`LinkController::receive`] produced: the payloads now ready for the
/// IP shim, and an explicit NAK to send, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveResult {
    /// Sequence numbers to deliver upward, in order.
    pub delivered: Vec<u32>,
    /// An explicit NAK to transmit for a newly observed gap, if the
    /// explicit-NAK rate limit allows one.
    pub explicit_nak: Option<NakSignal>,
}

/// Counts of packets dropped at the link layer, reported upward so
/// `FlowPerformance` can attribute sent-but-lost bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    /// Packets dropped after exceeding `max_retransmissions`.
    pub ll_drop: u64,
    /// Packets dropped because the send window was full.
    pub queue_drop: u64,
}

struct PeerLink {
    send: SendWindow,
    recv: RecvWindow,
    amc: LinkAmc,
    reachable: bool,
    drops: DropCounters,
}

/// Tunables the link controller needs to construct new per-peer state,
/// pulled from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct LinkTunables {
    /// ARQ window size.
    pub window_size: u32,
    /// Max SACK ranges per block.
    pub max_sacks: usize,
    /// Initial/default retransmission delay.
    pub retransmission_delay: Duration,
    /// EWMA-to-deadline multiplier.
    pub retransmission_delay_slop: f64,
    /// Floor on the retransmission deadline.
    pub min_retransmission_delay: Duration,
    /// Retry budget before declaring a peer unreachable.
    pub max_retransmissions: Option<u32>,
    /// Explicit-NAK rate limit.
    pub explicit_nak_window: u32,
    /// Explicit-NAK rate-limit window.
    pub explicit_nak_window_duration: Duration,
    /// Lowest usable MCS index.
    pub mcs_min: u8,
    /// Highest usable MCS index.
    pub mcs_max: u8,
    /// Per-MCS EVM thresholds.
    pub evm_thresholds: Vec<f64>,
    /// PER at/below which an up-shift is proposed.
    pub up_threshold: f64,
    /// PER at/above which a down-shift is proposed.
    pub down_threshold: f64,
    /// Short PER window.
    pub short_per_window: Duration,
    /// Long PER window.
    pub long_per_window: Duration,
    /// Markov decay factor.
    pub mcs_markov_alpha: f64,
    /// Markov probability floor.
    pub mcs_prob_floor: f64,
    /// Fixed MCS index used for broadcast traffic.
    pub mcs_broadcast: u8,
    /// Fixed MCS index used for ACK traffic.
    pub mcs_ack: u8,
    /// Gain offset applied to broadcast transmissions.
    pub broadcast_gain_db: f64,
    /// Gain offset applied to ACK transmissions.
    pub ack_gain_db: f64,
    /// If set, the receiver delivers packets to the IP shim strictly in
    /// sequence order, buffering out-of-order packets.
    pub enforce_ordering: bool,
}

impl PeerLink {
    fn new(tunables: &LinkTunables) -> Self {
        Self {
            send: SendWindow::new(
                tunables.window_size,
                tunables.retransmission_delay,
                tunables.retransmission_delay_slop,
                tunables.min_retransmission_delay,
                tunables.max_retransmissions,
            ),
            recv: RecvWindow::new(
                tunables.max_sacks,
                tunables.explicit_nak_window,
                tunables.explicit_nak_window_duration,
                tunables.enforce_ordering,
            ),
            amc: LinkAmc::new(
                tunables.mcs_min,
                tunables.mcs_max,
                tunables.evm_thresholds.clone(),
                tunables.up_threshold,
                tunables.down_threshold,
                tunables.short_per_window,
                tunables.long_per_window,
                tunables.mcs_markov_alpha,
                tunables.mcs_prob_floor,
            ),
            reachable: true,
            drops: DropCounters::default(),
        }
    }
}

/// Reliable, rate-adaptive per-destination link control.
pub struct LinkController {
    tunables: LinkTunables,
    peers: Mutex<HashMap<NodeId, PeerLink>>,
    listener: Arc<dyn EventListener>,
}

impl LinkController {
    /// Creates a new, empty link controller.
    #[must_use]
    pub fn new(tunables: LinkTunables, listener: Arc<dyn EventListener>) -> Self {
        Self {
            tunables,
            peers: Mutex::new(HashMap::new()),
            listener,
        }
    }

    /// Assigns a sequence number for a new outbound packet to `dest`,
    /// dropping it as a queue-full drop if the window has no capacity.
    pub fn send(&self, dest: NodeId, now: f64) -> Option<u32> {
        let mut peers = self.peers.lock();
        let peer = peers
            .entry(dest)
            .or_insert_with(|| PeerLink::new(&self.tunables));
        if !peer.send.has_capacity() {
            peer.drops.queue_drop += 1;
            return None;
        }
        Some(peer.send.assign(now))
    }

    /// Records receipt of a data packet from `src` at `now`, updating the
    /// receive window and deciding delivery order and NAK emission per
    /// `enforce_ordering`/`explicit_nak_window`.
    pub fn receive(&self, src: NodeId, seq: u32, now: f64) -> ReceiveResult {
        let mut peers = self.peers.lock();
        let peer = peers
            .entry(src)
            .or_insert_with(|| PeerLink::new(&self.tunables));
        let ReceiveOutcome { delivered, explicit_nak } = peer.recv.receive(seq, now);
        ReceiveResult {
            delivered,
            explicit_nak: explicit_nak.map(|seq| NakSignal {
                seq,
                mcs: self.tunables.mcs_ack,
                gain_db: self.tunables.ack_gain_db,
            }),
        }
    }

    /// Returns the fixed MCS index used for broadcast transmissions.
    #[must_use]
    pub fn broadcast_mcs(&self) -> u8 {
        self.tunables.mcs_broadcast
    }

    /// Returns the gain offset used for broadcast transmissions.
    #[must_use]
    pub fn broadcast_gain_db(&self) -> f64 {
        self.tunables.broadcast_gain_db
    }

    /// Returns the fixed MCS index used for ACK-class transmissions.
    #[must_use]
    pub fn ack_mcs(&self) -> u8 {
        self.tunables.mcs_ack
    }

    /// Returns the gain offset used for ACK-class transmissions.
    #[must_use]
    pub fn ack_gain_db(&self) -> f64 {
        self.tunables.ack_gain_db
    }

    /// Builds the SACK block to attach to the next packet or standalone ACK
    /// destined for `peer`.
    #[must_use]
    pub fn build_sack(&self, peer: NodeId) -> Sack {
        let mut peers = self.peers.lock();
        peers
            .entry(peer)
            .or_insert_with(|| PeerLink::new(&self.tunables))
            .recv
            .build_sack()
    }

    /// Applies a SACK received from `peer`, updating retransmission state
    /// and possibly declaring the peer unreachable. Returns the sequence
    /// numbers that must be retransmitted.
    pub fn apply_sack(&self, peer: NodeId, sack: &Sack, now: f64) -> Vec<u32> {
        let mut peers = self.peers.lock();
        let link = peers
            .entry(peer)
            .or_insert_with(|| PeerLink::new(&self.tunables));

        let outcomes = link.send.apply_sack(sack, now);
        self.apply_outcomes(peer, link, outcomes)
    }

    /// Sweeps for retransmission timeouts on `peer`'s send window.
    pub fn sweep_timeouts(&self, peer: NodeId, now: f64) -> Vec<u32> {
        let mut peers = self.peers.lock();
        let link = peers
            .entry(peer)
            .or_insert_with(|| PeerLink::new(&self.tunables));

        let outcomes = link.send.sweep_timeouts(now);
        self.apply_outcomes(peer, link, outcomes)
    }

    fn apply_outcomes(
        &self,
        peer: NodeId,
        link: &mut PeerLink,
        outcomes: Vec<(u32, PacketOutcome)>,
    ) -> Vec<u32> {
        let mut retransmit = Vec::new();
        let mut became_unreachable = false;
        for (seq, outcome) in outcomes {
            match outcome {
                PacketOutcome::Acked => {}
                PacketOutcome::Retransmit => retransmit.push(seq),
                PacketOutcome::Unreachable => {
                    link.drops.ll_drop += 1;
                    became_unreachable = true;
                }
            }
        }
        if became_unreachable && link.reachable {
            link.reachable = false;
            self.listener
                .on_event(ControlPlaneEvent::PeerUnreachable { node_id: peer });
        } else if !became_unreachable && !retransmit.is_empty() && !link.reachable {
            link.reachable = true;
            self.listener
                .on_event(ControlPlaneEvent::PeerReachable { node_id: peer });
        }
        retransmit
    }

    /// Records an ACK/NAK observation for `peer`'s adaptive MCS state and
    /// returns the resulting proposal.
    pub fn on_ack_or_nak(&self, peer: NodeId, now: f64, is_nak: bool, evm: f64) -> McsProposal {
        let mut peers = self.peers.lock();
        let link = peers
            .entry(peer)
            .or_insert_with(|| PeerLink::new(&self.tunables));
        link.amc.on_ack_or_nak(now, is_nak, evm)
    }

    /// Returns the current MCS index for `peer`.
    #[must_use]
    pub fn mcs_idx(&self, peer: NodeId) -> u8 {
        let mut peers = self.peers.lock();
        peers
            .entry(peer)
            .or_insert_with(|| PeerLink::new(&self.tunables))
            .amc
            .mcs_idx()
    }

    /// Returns whether `peer` is currently considered reachable.
    #[must_use]
    pub fn is_reachable(&self, peer: NodeId) -> bool {
        self.peers
            .lock()
            .get(&peer)
            .map(|p| p.reachable)
            .unwrap_or(true)
    }

    /// Returns drop counters accumulated for `peer`.
    #[must_use]
    pub fn drop_counters(&self, peer: NodeId) -> DropCounters {
        self.peers
            .lock()
            .get(&peer)
            .map(|p| p.drops)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventListener;
    use crate::link::window::SackRange;

    fn tunables() -> LinkTunables {
        LinkTunables {
            window_size: 4,
            max_sacks: 8,
            retransmission_delay: Duration::from_millis(10),
            retransmission_delay_slop: 1.0,
            min_retransmission_delay: Duration::from_millis(1),
            max_retransmissions: Some(1),
            explicit_nak_window: 4,
            explicit_nak_window_duration: Duration::from_secs(1),
            mcs_min: 0,
            mcs_max: 3,
            evm_thresholds: vec![f64::INFINITY, 30.0, 25.0, 20.0],
            up_threshold: 0.02,
            down_threshold: 0.1,
            short_per_window: Duration::from_secs(1),
            long_per_window: Duration::from_secs(10),
            mcs_markov_alpha: 0.9,
            mcs_prob_floor: 0.05,
            mcs_broadcast: 0,
            mcs_ack: 1,
            broadcast_gain_db: 3.0,
            ack_gain_db: 2.0,
            enforce_ordering: false,
        }
    }

    #[test]
    fn send_respects_window_capacity_and_counts_queue_drops() {
        let lc = LinkController::new(tunables(), Arc::new(NoopEventListener));
        for _ in 0..4 {
            assert!(lc.send(2, 0.0).is_some());
        }
        assert!(lc.send(2, 0.0).is_none());
        assert_eq!(lc.drop_counters(2).queue_drop, 1);
    }

    #[test]
    fn repeated_timeout_marks_peer_unreachable_and_notifies() {
        let lc = LinkController::new(tunables(), Arc::new(NoopEventListener));
        lc.send(2, 0.0);
        assert!(lc.is_reachable(2));
        lc.sweep_timeouts(2, 1.0);
        assert!(lc.is_reachable(2));
        lc.sweep_timeouts(2, 3.0);
        assert!(!lc.is_reachable(2));
        assert_eq!(lc.drop_counters(2).ll_drop, 1);
    }

    #[test]
    fn sack_gap_returns_retransmit_list() {
        let mut t = tunables();
        t.window_size = 16;
        let lc = LinkController::new(t, Arc::new(NoopEventListener));
        for _ in 0..10 {
            lc.send(2, 0.0);
        }
        let sack = Sack {
            recv_base: 5,
            ranges: vec![SackRange { start: 7, end: 9 }],
        };
        let retransmit = lc.apply_sack(2, &sack, 1.0);
        assert_eq!(retransmit, vec![5, 6]);
    }

    #[test]
    fn receive_gap_emits_ack_mcs_nak() {
        let lc = LinkController::new(tunables(), Arc::new(NoopEventListener));
        let result = lc.receive(2, 3, 0.0);
        assert!(result.delivered.is_empty());
        let nak = result.explicit_nak.expect("gap below recv_base should NAK");
        assert_eq!(nak.seq, 0);
        assert_eq!(nak.mcs, 1);
        assert_eq!(nak.gain_db, 2.0);
    }

    #[test]
    fn receive_without_ordering_delivers_immediately() {
        let lc = LinkController::new(tunables(), Arc::new(NoopEventListener));
        assert_eq!(lc.receive(2, 1, 0.0).delivered, vec![1]);
        assert_eq!(lc.receive(2, 0, 0.0).delivered, vec![0]);
    }

    #[test]
    fn receive_with_enforce_ordering_buffers_out_of_order() {
        let mut t = tunables();
        t.enforce_ordering = true;
        let lc = LinkController::new(t, Arc::new(NoopEventListener));
        assert!(lc.receive(2, 1, 0.0).delivered.is_empty());
        assert_eq!(lc.receive(2, 0, 0.0).delivered, vec![0, 1]);
    }

    #[test]
    fn broadcast_and_ack_transmit_params_come_from_tunables() {
        let lc = LinkController::new(tunables(), Arc::new(NoopEventListener));
        assert_eq!(lc.broadcast_mcs(), 0);
        assert_eq!(lc.broadcast_gain_db(), 3.0);
        assert_eq!(lc.ack_mcs(), 1);
        assert_eq!(lc.ack_gain_db(), 2.0);
    }
}
