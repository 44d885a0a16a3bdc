//! Per-flow traffic counters.
//!
//! Every IP packet is classified into a flow by destination UDP port (or
//! broadcast); [`FlowPerformance`] keeps dense, per-measurement-period
//! counters of bytes and packets sent/received for each flow, serialized
//! per-flow so that concurrent transmit and receive tasks never race on the
//! same counter.

use dashmap::DashMap;

use crate::time::{time_to_mp, TimeSource, WallTime};

/// Identifies a flow: every IP packet is classified into one by destination
/// UDP port (or broadcast).
pub type FlowId = u16;

/// Per-(flow, MP) traffic counters. Monotonically non-decreasing within a
/// scenario stage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MpStats {
    /// Packets sent in this MP.
    pub npackets_sent: u64,
    /// Bytes sent in this MP.
    pub nbytes_sent: u64,
    /// Wall time of the most recent send in this MP.
    pub ts_sent: WallTime,
    /// Packets received in this MP.
    pub npackets_recv: u64,
    /// Bytes received in this MP.
    pub nbytes_recv: u64,
    /// Wall time of the most recent receive in this MP.
    pub ts_recv: WallTime,
}

/// A densely-indexed series of [`MpStats`], starting at `low_mp` — the first
/// MP in which the flow was observed.
#[derive(Debug, Clone, Default)]
pub struct FlowSeries {
    low_mp: u64,
    stats: Vec<MpStats>,
}

impl FlowSeries {
    fn ensure_len(&mut self, mp: u64) {
        if self.stats.is_empty() {
            self.low_mp = mp;
            self.stats.push(MpStats::default());
            return;
        }
        if mp < self.low_mp {
            let prefix = (self.low_mp - mp) as usize;
            let mut extended = vec![MpStats::default(); prefix];
            extended.append(&mut self.stats);
            self.stats = extended;
            self.low_mp = mp;
        } else {
            let idx = (mp - self.low_mp) as usize;
            if idx >= self.stats.len() {
                self.stats.resize(idx + 1, MpStats::default());
            }
        }
    }

    fn cell_mut(&mut self, mp: u64) -> &mut MpStats {
        self.ensure_len(mp);
        let idx = (mp - self.low_mp) as usize;
        &mut self.stats[idx]
    }

    /// Returns the first MP this series has data for, if any.
    #[must_use]
    pub fn low_mp(&self) -> Option<u64> {
        if self.stats.is_empty() {
            None
        } else {
            Some(self.low_mp)
        }
    }

    /// Returns the last MP this series has data for, if any.
    #[must_use]
    pub fn high_mp(&self) -> Option<u64> {
        if self.stats.is_empty() {
            None
        } else {
            Some(self.low_mp + self.stats.len() as u64 - 1)
        }
    }

    /// Returns an iterator of `(mp, stats)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &MpStats)> {
        self.stats
            .iter()
            .enumerate()
            .map(move |(i, s)| (self.low_mp + i as u64, s))
    }

    /// Clears all counters (the measurement period range is preserved).
    pub fn reset(&mut self) {
        for s in &mut self.stats {
            *s = MpStats::default();
        }
    }
}

/// A snapshot of one flow's counters over a drain window, as carried on the
/// wire in a `FlowStats` message.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStats {
    /// The flow these counters describe.
    pub flow_id: FlowId,
    /// First MP covered by `npackets`/`nbytes`.
    pub first_mp: u64,
    /// Dense per-MP packet counts starting at `first_mp`, source side.
    pub npackets_sent: Vec<u64>,
    /// Dense per-MP byte counts starting at `first_mp`, source side.
    pub nbytes_sent: Vec<u64>,
    /// Dense per-MP packet counts starting at `first_mp`, sink side.
    pub npackets_recv: Vec<u64>,
    /// Dense per-MP byte counts starting at `first_mp`, sink side.
    pub nbytes_recv: Vec<u64>,
}

/// Per-flow traffic counters for both source-side (sent) and sink-side
/// (received) roles. Per-flow updates are serialized via `DashMap`'s shard
/// locking, so concurrent sends/receives on distinct flows never contend.
#[derive(Default)]
pub struct FlowPerformance {
    sources: DashMap<FlowId, FlowSeries>,
    sinks: DashMap<FlowId, FlowSeries>,
}

impl FlowPerformance {
    /// Creates an empty `FlowPerformance`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a send of `nbytes` for `flow` at the measurement period
    /// derived from `time.now_wall()`.
    pub fn record_sent(&self, flow: FlowId, nbytes: u64, scenario_start: WallTime, time: &TimeSource, mp_len: std::time::Duration) {
        let mp = time_to_mp(time.now_wall(), scenario_start, mp_len);
        let mut series = self.sources.entry(flow).or_default();
        let cell = series.cell_mut(mp);
        cell.npackets_sent += 1;
        cell.nbytes_sent += nbytes;
        cell.ts_sent = time.now_wall();
    }

    /// Records a receive of `nbytes` for `flow` at the measurement period
    /// derived from `time.now_wall()`.
    pub fn record_recv(&self, flow: FlowId, nbytes: u64, scenario_start: WallTime, time: &TimeSource, mp_len: std::time::Duration) {
        let mp = time_to_mp(time.now_wall(), scenario_start, mp_len);
        let mut series = self.sinks.entry(flow).or_default();
        let cell = series.cell_mut(mp);
        cell.npackets_recv += 1;
        cell.nbytes_recv += nbytes;
        cell.ts_recv = time.now_wall();
    }

    /// Snapshots every flow with source and/or sink activity into
    /// [`FlowStats`] records, optionally clearing counters afterward.
    pub fn drain(&self, reset: bool) -> Vec<FlowStats> {
        let mut flows: Vec<FlowId> = self
            .sources
            .iter()
            .map(|e| *e.key())
            .chain(self.sinks.iter().map(|e| *e.key()))
            .collect();
        flows.sort_unstable();
        flows.dedup();

        let mut out = Vec::with_capacity(flows.len());
        for flow in flows {
            let sent = self.sources.get(&flow);
            let recv = self.sinks.get(&flow);

            let low = sent
                .as_ref()
                .and_then(|s| s.low_mp())
                .into_iter()
                .chain(recv.as_ref().and_then(|s| s.low_mp()))
                .min();
            let high = sent
                .as_ref()
                .and_then(|s| s.high_mp())
                .into_iter()
                .chain(recv.as_ref().and_then(|s| s.high_mp()))
                .max();

            let (Some(first_mp), Some(last_mp)) = (low, high) else {
                continue;
            };
            let n = (last_mp - first_mp + 1) as usize;

            let mut npackets_sent = vec![0u64; n];
            let mut nbytes_sent = vec![0u64; n];
            let mut npackets_recv = vec![0u64; n];
            let mut nbytes_recv = vec![0u64; n];

            if let Some(series) = &sent {
                for (mp, stats) in series.iter() {
                    let idx = (mp - first_mp) as usize;
                    npackets_sent[idx] = stats.npackets_sent;
                    nbytes_sent[idx] = stats.nbytes_sent;
                }
            }
            if let Some(series) = &recv {
                for (mp, stats) in series.iter() {
                    let idx = (mp - first_mp) as usize;
                    npackets_recv[idx] = stats.npackets_recv;
                    nbytes_recv[idx] = stats.nbytes_recv;
                }
            }

            out.push(FlowStats {
                flow_id: flow,
                first_mp,
                npackets_sent,
                nbytes_sent,
                npackets_recv,
                nbytes_recv,
            });
        }

        if reset {
            for mut s in self.sources.iter_mut() {
                s.reset();
            }
            for mut s in self.sinks.iter_mut() {
                s.reset();
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn record_sent_and_recv_accumulate_independently() {
        let fp = FlowPerformance::new();
        let time = TimeSource::new();
        let mp_len = Duration::from_secs(1);
        let scenario_start = time.now_wall();

        fp.record_sent(1, 100, scenario_start, &time, mp_len);
        fp.record_sent(1, 200, scenario_start, &time, mp_len);
        fp.record_recv(1, 150, scenario_start, &time, mp_len);

        let drained = fp.drain(false);
        assert_eq!(drained.len(), 1);
        let stats = &drained[0];
        assert_eq!(stats.flow_id, 1);
        assert_eq!(stats.nbytes_sent[0], 300);
        assert_eq!(stats.npackets_sent[0], 2);
        assert_eq!(stats.nbytes_recv[0], 150);
    }

    #[test]
    fn drain_with_reset_clears_counters() {
        let fp = FlowPerformance::new();
        let time = TimeSource::new();
        let mp_len = Duration::from_secs(1);
        let scenario_start = time.now_wall();

        fp.record_sent(1, 100, scenario_start, &time, mp_len);
        let first = fp.drain(true);
        assert_eq!(first[0].nbytes_sent[0], 100);

        let second = fp.drain(false);
        assert_eq!(second[0].nbytes_sent[0], 0);
    }

    #[test]
    fn series_extends_backward_when_earlier_mp_arrives() {
        let mut series = FlowSeries::default();
        series.cell_mut(5).nbytes_sent = 10;
        series.cell_mut(3).nbytes_sent = 20;
        assert_eq!(series.low_mp(), Some(3));
        assert_eq!(series.high_mp(), Some(5));
        let values: Vec<u64> = series.iter().map(|(_, s)| s.nbytes_sent).collect();
        assert_eq!(values, vec![20, 0, 10]);
    }

    #[test]
    fn flows_with_no_activity_are_absent_from_drain() {
        let fp = FlowPerformance::new();
        assert!(fp.drain(false).is_empty());
    }
}
