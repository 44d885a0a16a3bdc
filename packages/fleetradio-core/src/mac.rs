//! MAC-layer channel access binding: ALOHA, TDMA, or FDMA, one active at a
//! time, transitioned via idempotent, monotonic schedule installs.

use rand::Rng;

use crate::neighborhood::NodeId;
use crate::schedule::{ChannelIdx, Schedule};

/// Per-channel transmit-slot sample counts accumulated since the last
/// [`MacBinding::pop_load`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Monotonic time the accumulation window started.
    pub window_start_ms: u64,
    /// Monotonic time `pop_load` was called.
    pub window_end_ms: u64,
    /// Per-channel count of slots this node transmitted in during the
    /// window.
    pub per_channel_samples: Vec<u64>,
}

/// The active channel-access scheme for a node.
pub enum MacBinding {
    /// Transmit with probability `prob` on `channel` each slot.
    Aloha {
        /// The single channel this binding transmits on.
        channel: ChannelIdx,
        /// Per-slot transmit probability.
        prob: f64,
    },
    /// Transmit in every slot the installed schedule assigns to `node_id` on
    /// `channel`.
    Tdma {
        /// This node's id, used to match schedule cells.
        node_id: NodeId,
        /// The channel this node was assigned.
        channel: ChannelIdx,
        /// The installed schedule.
        schedule: Schedule,
        /// Whether consecutive owned slots are concatenated into one
        /// transmission.
        superslot: bool,
    },
    /// Transmit continuously on a single dedicated channel.
    Fdma {
        /// The channel this node owns exclusively.
        channel: ChannelIdx,
    },
}

/// Owns the currently installed [`MacBinding`] and enforces monotonic,
/// idempotent schedule installs.
pub struct MacController {
    binding: MacBinding,
    seq: u32,
    nchannels: usize,
    samples: Vec<u64>,
    window_start_ms: u64,
}

impl MacController {
    /// Creates a controller starting in ALOHA on a randomly chosen channel
    /// out of `nchannels`, as used during discovery.
    #[must_use]
    pub fn new_aloha(nchannels: usize, prob: f64, now_ms: u64) -> Self {
        let channel = if nchannels <= 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..nchannels)
        };
        Self {
            binding: MacBinding::Aloha { channel, prob },
            seq: 0,
            nchannels,
            samples: vec![0; nchannels.max(1)],
            window_start_ms: now_ms,
        }
    }

    /// Installs a new schedule-derived binding with sequence number `seq`.
    /// Older or equal sequence numbers are ignored (idempotent, monotonic).
    /// A change in MAC class tears down the old binding.
    pub fn install_tdma(
        &mut self,
        seq: u32,
        node_id: NodeId,
        channel: ChannelIdx,
        schedule: Schedule,
        superslot: bool,
    ) -> bool {
        if seq <= self.seq && self.seq != 0 {
            return false;
        }
        self.seq = seq;
        self.binding = MacBinding::Tdma {
            node_id,
            channel,
            schedule,
            superslot,
        };
        true
    }

    /// Installs a dedicated-channel FDMA binding with sequence number `seq`.
    pub fn install_fdma(&mut self, seq: u32, channel: ChannelIdx) -> bool {
        if seq <= self.seq && self.seq != 0 {
            return false;
        }
        self.seq = seq;
        self.binding = MacBinding::Fdma { channel };
        true
    }

    /// Returns the most recently installed sequence number.
    #[must_use]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Returns whether this node should transmit in `slot` on `channel`,
    /// given the active binding. For ALOHA, each call to this function for
    /// the reserved channel consumes one random draw.
    pub fn should_transmit(&mut self, channel: ChannelIdx, slot: usize) -> bool {
        let transmits = match &self.binding {
            MacBinding::Aloha { channel: c, prob } => {
                *c == channel && rand::thread_rng().gen_bool(*prob)
            }
            MacBinding::Tdma {
                node_id,
                channel: c,
                schedule,
                ..
            } => *c == channel && schedule.get(channel, slot % schedule.nslots()) == Some(*node_id),
            MacBinding::Fdma { channel: c } => *c == channel,
        };
        if transmits {
            self.record_sample(channel);
        }
        transmits
    }

    fn record_sample(&mut self, channel: ChannelIdx) {
        if channel >= self.samples.len() {
            self.samples.resize(channel + 1, 0);
        }
        self.samples[channel] += 1;
    }

    /// Drains accumulated per-channel transmit-slot counts since the last
    /// call, returning `(window_start, window_end, per_channel_samples)`.
    pub fn pop_load(&mut self, now_ms: u64) -> LoadReport {
        let report = LoadReport {
            window_start_ms: self.window_start_ms,
            window_end_ms: now_ms,
            per_channel_samples: std::mem::replace(&mut self.samples, vec![0; self.nchannels.max(1)]),
        };
        self.window_start_ms = now_ms;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::pure_tdma;

    #[test]
    fn older_seq_is_ignored() {
        let mut mac = MacController::new_aloha(2, 0.1, 0);
        assert!(mac.install_fdma(5, 0));
        assert!(!mac.install_fdma(3, 1));
        assert_eq!(mac.seq(), 5);
    }

    #[test]
    fn tdma_transmits_only_in_owned_slots() {
        let mut mac = MacController::new_aloha(1, 0.1, 0);
        let schedule = pure_tdma(&[1, 2, 3]);
        mac.install_tdma(1, 2, 0, schedule, false);
        assert!(!mac.should_transmit(0, 0));
        assert!(mac.should_transmit(0, 1));
        assert!(!mac.should_transmit(0, 2));
    }

    #[test]
    fn fdma_always_transmits_on_owned_channel() {
        let mut mac = MacController::new_aloha(1, 0.1, 0);
        mac.install_fdma(1, 3);
        assert!(mac.should_transmit(3, 0));
        assert!(mac.should_transmit(3, 99));
        assert!(!mac.should_transmit(2, 0));
    }

    #[test]
    fn pop_load_drains_and_resets_counters() {
        let mut mac = MacController::new_aloha(1, 0.1, 0);
        mac.install_fdma(1, 0);
        mac.should_transmit(0, 0);
        mac.should_transmit(0, 1);
        let report = mac.pop_load(100);
        assert_eq!(report.per_channel_samples[0], 2);
        let report2 = mac.pop_load(200);
        assert_eq!(report2.per_channel_samples[0], 0);
        assert_eq!(report2.window_start_ms, 100);
    }
}
