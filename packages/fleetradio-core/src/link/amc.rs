//! Adaptive modulation and coding (AMC): per-link MCS selection driven by
//! rolling packet-error-rate windows and a Markov transition filter.

use std::collections::VecDeque;
use std::time::Duration;

/// A rolling window of boolean packet outcomes (true = error), used to
/// compute a packet error rate over a trailing time span.
struct PerWindow {
    window: Duration,
    samples: VecDeque<(f64, bool)>,
}

impl PerWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, now: f64, is_error: bool) {
        self.samples.push_back((now, is_error));
        self.evict(now);
    }

    fn evict(&mut self, now: f64) {
        let cutoff = now - self.window.as_secs_f64();
        while matches!(self.samples.front(), Some(&(t, _)) if t < cutoff) {
            self.samples.pop_front();
        }
    }

    fn rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let errors = self.samples.iter().filter(|&&(_, e)| e).count();
        errors as f64 / self.samples.len() as f64
    }

    fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Learned transition probabilities for the Markov proposal filter, keyed by
/// `(from_mcs, to_mcs)`.
struct MarkovFilter {
    alpha: f64,
    prob_floor: f64,
    probs: std::collections::HashMap<(u8, u8), f64>,
}

impl MarkovFilter {
    fn new(alpha: f64, prob_floor: f64) -> Self {
        Self {
            alpha,
            prob_floor,
            probs: std::collections::HashMap::new(),
        }
    }

    /// Returns whether a proposed transition is accepted, given whether the
    /// most recent frame on this link actually succeeded. `outcome_success`
    /// must come from the real ACK/NAK signal, independent of the
    /// accept/reject decision being made here — otherwise the learned
    /// probability never moves off its initial value.
    fn evaluate(&mut self, from: u8, to: u8, outcome_success: bool) -> bool {
        let key = (from, to);
        let prior = *self.probs.get(&key).unwrap_or(&1.0);
        let accept = prior >= self.prob_floor;
        let observed = if outcome_success { 1.0 } else { 0.0 };
        let updated = self.alpha * prior + (1.0 - self.alpha) * observed;
        self.probs.insert(key, updated);
        accept
    }
}

/// A proposed MCS change, before the Markov filter has had a chance to
/// reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McsProposal {
    /// No change proposed.
    Hold,
    /// Propose moving up one MCS index.
    Up,
    /// Propose moving down one MCS index.
    Down,
}

/// Per-link adaptive MCS state.
pub struct LinkAmc {
    mcs_idx: u8,
    mcs_min: u8,
    mcs_max: u8,
    evm_thresholds: Vec<f64>,
    up_threshold: f64,
    down_threshold: f64,
    short_per: PerWindow,
    long_per: PerWindow,
    evm_samples: VecDeque<f64>,
    markov: MarkovFilter,
}

impl LinkAmc {
    /// Creates AMC state for a new link, starting at `mcs_min`.
    #[must_use]
    pub fn new(
        mcs_min: u8,
        mcs_max: u8,
        evm_thresholds: Vec<f64>,
        up_threshold: f64,
        down_threshold: f64,
        short_per_window: Duration,
        long_per_window: Duration,
        markov_alpha: f64,
        markov_prob_floor: f64,
    ) -> Self {
        Self {
            mcs_idx: mcs_min,
            mcs_min,
            mcs_max,
            evm_thresholds,
            up_threshold,
            down_threshold,
            short_per: PerWindow::new(short_per_window),
            long_per: PerWindow::new(long_per_window),
            evm_samples: VecDeque::with_capacity(64),
            markov: MarkovFilter::new(markov_alpha, markov_prob_floor),
        }
    }

    /// Returns the current MCS index.
    #[must_use]
    pub fn mcs_idx(&self) -> u8 {
        self.mcs_idx
    }

    fn evm_mean(&self) -> f64 {
        if self.evm_samples.is_empty() {
            return 0.0;
        }
        self.evm_samples.iter().sum::<f64>() / self.evm_samples.len() as f64
    }

    fn evm_threshold(&self, mcs_idx: u8) -> f64 {
        self.evm_thresholds
            .get(mcs_idx as usize)
            .copied()
            .unwrap_or(f64::INFINITY)
    }

    /// Records a received ACK or NAK for this link, along with the
    /// measured EVM on the receive, and returns the outcome of the rate
    /// decision + Markov filter.
    pub fn on_ack_or_nak(&mut self, now: f64, is_nak: bool, evm: f64) -> McsProposal {
        self.short_per.push(now, is_nak);
        self.long_per.push(now, is_nak);
        self.evm_samples.push_back(evm);
        if self.evm_samples.len() > 64 {
            self.evm_samples.pop_front();
        }

        let proposal = if self.short_per.rate() <= self.up_threshold
            && self.mcs_idx < self.mcs_max
            && self.evm_mean() <= self.evm_threshold(self.mcs_idx + 1)
        {
            McsProposal::Up
        } else if self.long_per.rate() >= self.down_threshold && self.mcs_idx > self.mcs_min {
            McsProposal::Down
        } else {
            McsProposal::Hold
        };

        let outcome_success = !is_nak;
        match proposal {
            McsProposal::Hold => {}
            McsProposal::Up => {
                let target = self.mcs_idx + 1;
                if self.markov.evaluate(self.mcs_idx, target, outcome_success) {
                    self.mcs_idx = target;
                }
            }
            McsProposal::Down => {
                let target = self.mcs_idx - 1;
                if self.markov.evaluate(self.mcs_idx, target, outcome_success) {
                    self.mcs_idx = target;
                    self.short_per.reset();
                }
            }
        }

        proposal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amc() -> LinkAmc {
        LinkAmc::new(
            0,
            5,
            vec![f64::INFINITY, 35.0, 33.0, 31.0, 29.0, 27.0],
            0.02,
            0.1,
            Duration::from_secs(1),
            Duration::from_secs(10),
            0.9,
            0.05,
        )
    }

    #[test]
    fn clean_link_proposes_up() {
        let mut amc = amc();
        let mut last = McsProposal::Hold;
        for _ in 0..20 {
            last = amc.on_ack_or_nak(0.0, false, 0.0);
        }
        assert_eq!(last, McsProposal::Up);
        assert!(amc.mcs_idx() >= 1);
    }

    #[test]
    fn noisy_link_stays_at_floor() {
        let mut amc = amc();
        for i in 0..20 {
            amc.on_ack_or_nak(i as f64 * 0.01, true, 100.0);
        }
        assert_eq!(amc.mcs_idx(), 0);
    }

    #[test]
    fn down_shift_resets_short_window() {
        let mut amc = amc();
        for _ in 0..20 {
            amc.on_ack_or_nak(0.0, false, 0.0);
        }
        let before = amc.mcs_idx();
        assert!(before > 0);
        for i in 0..20 {
            amc.on_ack_or_nak(1.0 + i as f64 * 0.01, true, 100.0);
        }
        assert!(amc.mcs_idx() < before);
    }
}
