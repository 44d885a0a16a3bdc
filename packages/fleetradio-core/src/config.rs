//! Control-plane configuration.
//!
//! Every tunable named in the component descriptions lives here as a single
//! flat, serializable struct, following the server's load-from-YAML-then-
//! environment-override pattern.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// All tunables governing discovery, scheduling, link control, scoring, and
/// collaboration reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mean interval between discovery-phase HELLOs, before a schedule
    /// exists. Actual interval is this plus `U(0,1)` jitter.
    pub discovery_hello_interval_s: f64,

    /// HELLO interval once a schedule has been installed, for liveness.
    pub standard_hello_interval_s: f64,

    /// Time allowed for two-node discovery before escalation logic may
    /// re-randomize the discovery channel.
    pub neighbor_discovery_period_s: f64,

    /// ARQ sliding window size, in packets.
    pub arq_window_size: u32,

    /// Max time a receiver waits with a pending ACK before sending a
    /// standalone ACK.
    pub sack_delay: Duration,

    /// Max number of SACK ranges attached to one outgoing packet/ACK.
    pub max_sacks: usize,

    /// Initial retransmission delay assumed for a peer with no RTT samples
    /// yet.
    pub retransmission_delay: Duration,

    /// Multiplier applied to the EWMA RTT estimate to get the retransmission
    /// deadline.
    pub retransmission_delay_slop: f64,

    /// Floor under the computed retransmission delay.
    pub min_retransmission_delay: Duration,

    /// Number of retransmissions after which a packet is dropped and the
    /// peer may be marked unreachable. `None` means never mark unreachable
    /// purely by retry count.
    pub max_retransmissions: Option<u32>,

    /// Max explicit NAKs emitted within `explicit_nak_window_duration`.
    pub explicit_nak_window: u32,

    /// Window over which `explicit_nak_window` duplicate NAKs are
    /// suppressed.
    pub explicit_nak_window_duration: Duration,

    /// Lowest usable MCS index.
    pub mcs_min: u8,

    /// Highest usable MCS index.
    pub mcs_max: u8,

    /// Per-MCS EVM threshold table, indexed by MCS index. Must have at least
    /// `mcs_max + 1` entries.
    pub evm_thresholds: Vec<f64>,

    /// Packet-error rate at or below which an up-shift is proposed.
    pub up_threshold: f64,

    /// Packet-error rate at or above which a down-shift is proposed.
    pub down_threshold: f64,

    /// Short PER rolling-window duration (triggers up-shifts).
    pub short_per_window: Duration,

    /// Long PER rolling-window duration (triggers down-shifts).
    pub long_per_window: Duration,

    /// Decay factor for the Markov transition-probability filter.
    pub mcs_markov_alpha: f64,

    /// Floor under any learned transition probability; proposals below this
    /// are rejected.
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
    /// sequence order, buffering out-of-order packets; otherwise delivery is
    /// immediate.
    pub enforce_ordering: bool,

    /// Per-slot transmit probability for ALOHA MAC.
    pub aloha_prob: f64,

    /// Interval between clock-sync probe exchanges with the time master.
    pub clock_sync_period: Duration,

    /// Interval between status reports to the gateway (or local ingestion,
    /// if self is gateway).
    pub status_update_period: Duration,

    /// Trailing number of MPs excluded from a status report window, to avoid
    /// racing with in-flight counter updates.
    pub stats_ignore_window: u64,

    /// Interval between LOCATION_UPDATE messages to each collaboration peer.
    pub location_update_period: Duration,

    /// Minimum interval between SPECTRUM_USAGE reports.
    pub spectrum_usage_update_period_min: Duration,

    /// Maximum interval between SPECTRUM_USAGE reports.
    pub spectrum_usage_update_period_max: Duration,

    /// Interval between DETAILED_PERFORMANCE reports.
    pub detailed_performance_update_period: Duration,

    /// Collaboration registration keepalive period; a KEEPALIVE is sent
    /// every half of this.
    pub keepalive_seconds: u64,

    /// Max age of a peer's last known location before it is excluded from a
    /// location report.
    pub max_location_age: Duration,

    /// Fraction of a channel's bandwidth trimmed from the low edge when
    /// predicting spectrum-usage voxels.
    pub spec_chan_trim_lo: f64,

    /// Fraction of a channel's bandwidth trimmed from the high edge when
    /// predicting spectrum-usage voxels.
    pub spec_chan_trim_hi: f64,

    /// Forward time horizon for predicted spectrum-usage voxels.
    pub spec_future_period: Duration,

    /// Measurement period length used to bucket flow statistics and scoring.
    pub measurement_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_hello_interval_s: 5.0,
            standard_hello_interval_s: 15.0,
            neighbor_discovery_period_s: 12.0,
            arq_window_size: 1024,
            sack_delay: Duration::from_millis(100),
            max_sacks: 8,
            retransmission_delay: Duration::from_millis(500),
            retransmission_delay_slop: 2.0,
            min_retransmission_delay: Duration::from_millis(100),
            max_retransmissions: Some(10),
            explicit_nak_window: 4,
            explicit_nak_window_duration: Duration::from_secs(1),
            mcs_min: 0,
            mcs_max: 11,
            evm_thresholds: vec![
                f64::INFINITY,
                35.0,
                33.0,
                31.0,
                29.0,
                27.0,
                25.0,
                23.0,
                21.0,
                19.0,
                17.0,
                15.0,
            ],
            up_threshold: 0.02,
            down_threshold: 0.1,
            short_per_window: Duration::from_secs(1),
            long_per_window: Duration::from_secs(10),
            mcs_markov_alpha: 0.9,
            mcs_prob_floor: 0.05,
            mcs_broadcast: 0,
            mcs_ack: 0,
            broadcast_gain_db: 3.0,
            ack_gain_db: 3.0,
            enforce_ordering: false,
            aloha_prob: 0.1,
            clock_sync_period: Duration::from_secs(10),
            status_update_period: Duration::from_secs(1),
            stats_ignore_window: 1,
            location_update_period: Duration::from_secs(5),
            spectrum_usage_update_period_min: Duration::from_secs(5),
            spectrum_usage_update_period_max: Duration::from_secs(30),
            detailed_performance_update_period: Duration::from_secs(5),
            keepalive_seconds: 30,
            max_location_age: Duration::from_secs(60),
            spec_chan_trim_lo: 0.1,
            spec_chan_trim_hi: 0.1,
            spec_future_period: Duration::from_secs(10),
            measurement_period: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Returns the EVM threshold for the given MCS index, or `+inf` if the
    /// table doesn't cover it (treated as "always passes").
    #[must_use]
    pub fn evm_threshold(&self, mcs_idx: u8) -> f64 {
        self.evm_thresholds
            .get(mcs_idx as usize)
            .copied()
            .unwrap_or(f64::INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_valid_mcs_range() {
        let cfg = Config::default();
        assert!(cfg.mcs_min <= cfg.mcs_max);
        assert!(cfg.evm_thresholds.len() >= cfg.mcs_max as usize + 1);
    }

    #[test]
    fn evm_threshold_out_of_range_is_infinite() {
        let cfg = Config::default();
        assert_eq!(cfg.evm_threshold(200), f64::INFINITY);
    }

    #[test]
    fn round_trips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.arq_window_size, back.arq_window_size);
    }
}
