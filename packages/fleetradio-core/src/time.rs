//! Node clock and clock synchronization.
//!
//! Every node keeps a monotonic clock `mono` and derives wall-clock time from
//! it via a skew/offset pair `(sigma, delta)` such that `wall = sigma * mono +
//! delta`. The pair is updated by periodically solving a linear regression
//! over timestamp exchanges with the time master (the gateway); see
//! [`regress`] and [`regress_no_skew`].

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// A monotonic timestamp, measured in seconds since an arbitrary node-local
/// epoch.
pub type MonoTime = f64;

/// A wall-clock timestamp, measured in seconds since the Unix epoch.
pub type WallTime = f64;

/// The skew/offset pair relating monotonic time to wall time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockParams {
    /// Clock skew (`sigma`). `1.0` means the monotonic clock runs at the same
    /// rate as wall time.
    pub sigma: f64,
    /// Clock offset (`delta`), in seconds.
    pub delta: f64,
}

impl Default for ClockParams {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            delta: 0.0,
        }
    }
}

/// A node's time source: a monotonic clock plus a synchronization state that
/// maps it onto wall time.
///
/// `(sigma, delta)` is held behind a single lock so that concurrent readers
/// never observe a torn pair: either both fields are from the old
/// regression or both are from the new one.
pub struct TimeSource {
    epoch: Instant,
    wall_epoch: WallTime,
    params: RwLock<ClockParams>,
}

impl TimeSource {
    /// Creates a new `TimeSource` anchored to the current instant.
    #[must_use]
    pub fn new() -> Self {
        let wall_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            epoch: Instant::now(),
            wall_epoch,
            params: RwLock::new(ClockParams::default()),
        }
    }

    /// Returns the current monotonic time.
    #[must_use]
    pub fn now(&self) -> MonoTime {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Returns the current wall-clock time, derived from the monotonic clock
    /// via the current `(sigma, delta)` pair.
    #[must_use]
    pub fn now_wall(&self) -> WallTime {
        self.mono_to_wall(self.now())
    }

    /// Converts a monotonic timestamp to wall time using the current
    /// parameters.
    #[must_use]
    pub fn mono_to_wall(&self, mono: MonoTime) -> WallTime {
        let params = *self.params.read();
        params.sigma * mono + params.delta + self.wall_epoch
    }

    /// Returns the current `(sigma, delta)` pair.
    #[must_use]
    pub fn params(&self) -> ClockParams {
        *self.params.read()
    }

    /// Atomically installs a new `(sigma, delta)` pair. Ignored if either
    /// value is non-finite, matching the original implementation's guard
    /// against a degenerate regression.
    pub fn set_params(&self, params: ClockParams) {
        if params.sigma.is_finite() && params.delta.is_finite() {
            *self.params.write() = params;
        }
    }

    /// Runs a clock-sync update from echoed and master timestamp samples,
    /// installing the result if it is well-formed.
    ///
    /// `gps_disciplined` forces `sigma = 1.0` and solves only for `delta`,
    /// matching hardware with a GPS-disciplined oscillator.
    pub fn synchronize(
        &self,
        echoed: &[(f64, f64)],
        master: &[(f64, f64)],
        gps_disciplined: bool,
    ) {
        if echoed.len() < 2 || master.len() < 2 {
            return;
        }
        let result = if gps_disciplined {
            regress_no_skew(echoed, master)
        } else {
            regress(echoed, master)
        };
        self.set_params(ClockParams {
            sigma: result.sigma,
            delta: result.delta,
        });
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a timestamp regression: skew, offset, and estimated one-way
/// delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionResult {
    /// Estimated clock skew.
    pub sigma: f64,
    /// Estimated clock offset, in seconds.
    pub delta: f64,
    /// Estimated one-way propagation delay, in seconds.
    pub tau: f64,
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Solves for skew, offset, and one-way delay from two sets of
/// (send, receive) timestamp pairs: `echoed` (our sends, master's receives
/// echoed back to us) and `master` (master's sends, our receives).
#[must_use]
pub fn regress(echoed: &[(f64, f64)], master: &[(f64, f64)]) -> RegressionResult {
    let avec: Vec<f64> = echoed.iter().map(|&(a, _)| a).collect();
    let bvec: Vec<f64> = echoed.iter().map(|&(_, b)| b).collect();
    let cvec: Vec<f64> = master.iter().map(|&(c, _)| c).collect();
    let dvec: Vec<f64> = master.iter().map(|&(_, d)| d).collect();

    let abar = mean(&avec);
    let bbar = mean(&bvec);
    let cbar = mean(&cvec);
    let dbar = mean(&dvec);

    let covab: f64 = echoed.iter().map(|&(a, b)| (a - abar) * (b - bbar)).sum();
    let vara: f64 = avec.iter().map(|a| (a - abar).powi(2)).sum();

    let covcd: f64 = master.iter().map(|&(c, d)| (c - cbar) * (d - dbar)).sum();
    let vard: f64 = dvec.iter().map(|d| (d - dbar).powi(2)).sum();

    let sigma = (covab + covcd) / (vara + vard);

    let delta_plus_tau = bbar - sigma * abar;
    let delta_minus_tau = cbar - sigma * dbar;

    let delta = (delta_plus_tau + delta_minus_tau) / 2.0;
    let tau = (delta_plus_tau - delta_minus_tau) / 2.0;

    RegressionResult { sigma, delta, tau }
}

/// Like [`regress`], but assumes `sigma == 1.0` (no skew) and solves only for
/// offset and one-way delay. Used when the radio's oscillator is
/// GPS-disciplined.
#[must_use]
pub fn regress_no_skew(echoed: &[(f64, f64)], master: &[(f64, f64)]) -> RegressionResult {
    let abar = mean(&echoed.iter().map(|&(a, _)| a).collect::<Vec<_>>());
    let bbar = mean(&echoed.iter().map(|&(_, b)| b).collect::<Vec<_>>());
    let cbar = mean(&master.iter().map(|&(c, _)| c).collect::<Vec<_>>());
    let dbar = mean(&master.iter().map(|&(_, d)| d).collect::<Vec<_>>());

    let delta_plus_tau = bbar - abar;
    let delta_minus_tau = cbar - dbar;

    let delta = (delta_plus_tau + delta_minus_tau) / 2.0;
    let tau = (delta_plus_tau - delta_minus_tau) / 2.0;

    RegressionResult {
        sigma: 1.0,
        delta,
        tau,
    }
}

/// Time since the Unix epoch, used to convert a `WallTime` into an MP index
/// given a scenario start time and measurement period.
#[must_use]
pub fn time_to_mp(wall: WallTime, scenario_start: WallTime, mp_len: Duration) -> u64 {
    let elapsed = (wall - scenario_start).max(0.0);
    (elapsed / mp_len.as_secs_f64()).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regress_recovers_known_skew_and_offset() {
        // Simulate a peer whose clock runs 1% fast with a 2s offset and
        // negligible one-way delay.
        let true_sigma = 1.01;
        let true_delta = 2.0;
        let mut echoed = Vec::new();
        let mut master = Vec::new();
        for i in 0..20 {
            let a = i as f64;
            let b = true_sigma * a + true_delta;
            echoed.push((a, b));

            let d = i as f64 * 1.3;
            let c = true_sigma * d + true_delta;
            master.push((c, d));
        }
        let result = regress(&echoed, &master);
        assert!((result.sigma - true_sigma).abs() < 1e-6);
        assert!((result.delta - true_delta).abs() < 1e-6);
    }

    #[test]
    fn regress_no_skew_forces_unit_sigma() {
        let echoed = vec![(0.0, 5.0), (1.0, 6.0), (2.0, 7.0)];
        let master = vec![(5.0, 0.0), (6.0, 1.0), (7.0, 2.0)];
        let result = regress_no_skew(&echoed, &master);
        assert_eq!(result.sigma, 1.0);
    }

    #[test]
    fn set_params_rejects_non_finite() {
        let ts = TimeSource::new();
        let before = ts.params();
        ts.set_params(ClockParams {
            sigma: f64::NAN,
            delta: 0.0,
        });
        assert_eq!(ts.params(), before);
    }

    #[test]
    fn time_to_mp_buckets_correctly() {
        let mp_len = Duration::from_secs(1);
        assert_eq!(time_to_mp(100.0, 100.0, mp_len), 0);
        assert_eq!(time_to_mp(103.5, 100.0, mp_len), 3);
        assert_eq!(time_to_mp(99.0, 100.0, mp_len), 0);
    }
}
