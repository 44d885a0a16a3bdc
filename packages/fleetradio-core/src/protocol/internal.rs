//! Internal peer protocol: node-to-node status, schedule distribution, and
//! flow/spectrum statistics, exchanged over UDP port 4096.

use crate::flow::{FlowId, FlowStats};
use crate::neighborhood::{Location, NodeId};
use crate::protocol::framing::{BinaryCodec, Reader, Writer};
use crate::protocol::ProtocolError;

/// A single spectrum-usage voxel, as carried in a [`SpectrumStats`] report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumVoxel {
    /// Lower edge of the occupied frequency range, in Hz.
    pub f_start: f64,
    /// Upper edge of the occupied frequency range, in Hz.
    pub f_end: f64,
    /// Fraction of the reporting window this voxel was occupied, in
    /// `[0, 1]`.
    pub duty_cycle: f64,
}

impl BinaryCodec for SpectrumVoxel {
    fn write_to(&self, w: &mut Writer) {
        self.f_start.write_to(w);
        self.f_end.write_to(w);
        self.duty_cycle.write_to(w);
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        Ok(Self {
            f_start: f64::read_from(r)?,
            f_end: f64::read_from(r)?,
            duty_cycle: f64::read_from(r)?,
        })
    }
}

/// A report of observed or predicted spectrum usage over a time window.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumStats {
    /// Window start, wall time (seconds).
    pub start: f64,
    /// Window end, wall time (seconds).
    pub end: f64,
    /// Voxels observed or predicted in the window.
    pub voxels: Vec<SpectrumVoxel>,
}

impl BinaryCodec for SpectrumStats {
    fn write_to(&self, w: &mut Writer) {
        self.start.write_to(w);
        self.end.write_to(w);
        self.voxels.write_to(w);
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        Ok(Self {
            start: f64::read_from(r)?,
            end: f64::read_from(r)?,
            voxels: Vec::read_from(r)?,
        })
    }
}

/// A wire-encodable [`FlowStats`] record. Mirrors the in-memory type but
/// keeps the protocol module decoupled from internal field additions.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStatsWire {
    /// The flow these counters describe.
    pub flow_uid: FlowId,
    /// Source node id.
    pub src: NodeId,
    /// Destination node id.
    pub dest: NodeId,
    /// First MP covered by the dense arrays below.
    pub first_mp: u64,
    /// Dense per-MP sent-packet counts starting at `first_mp`.
    pub npackets: Vec<u64>,
    /// Dense per-MP sent-byte counts starting at `first_mp`.
    pub nbytes: Vec<u64>,
}

impl FlowStatsWire {
    /// Builds the source-side wire record from an in-memory [`FlowStats`].
    #[must_use]
    pub fn from_source(stats: &FlowStats, src: NodeId, dest: NodeId) -> Self {
        Self {
            flow_uid: stats.flow_id,
            src,
            dest,
            first_mp: stats.first_mp,
            npackets: stats.npackets_sent.clone(),
            nbytes: stats.nbytes_sent.clone(),
        }
    }
}

impl BinaryCodec for FlowStatsWire {
    fn write_to(&self, w: &mut Writer) {
        self.flow_uid.write_to(w);
        self.src.write_to(w);
        self.dest.write_to(w);
        self.first_mp.write_to(w);
        self.npackets.write_to(w);
        self.nbytes.write_to(w);
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        Ok(Self {
            flow_uid: FlowId::read_from(r)?,
            src: NodeId::read_from(r)?,
            dest: NodeId::read_from(r)?,
            first_mp: u64::read_from(r)?,
            npackets: Vec::read_from(r)?,
            nbytes: Vec::read_from(r)?,
        })
    }
}

/// A message exchanged between peers on the internal protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalMessage {
    /// A node's periodic status report, sent to the gateway.
    Status {
        /// Sending node's id.
        radio_id: NodeId,
        /// Report timestamp, wall time (seconds).
        timestamp: f64,
        /// Sender's last known location.
        location: Option<Location>,
        /// Source-role flow statistics observed since the last report.
        source_flows: Vec<FlowStatsWire>,
        /// Sink-role flow statistics observed since the last report.
        sink_flows: Vec<FlowStatsWire>,
        /// Spectrum usage observed since the last report.
        spectrum_stats: Vec<SpectrumStats>,
    },
    /// A MAC schedule, distributed by the gateway.
    Schedule {
        /// Monotonic install sequence number.
        seq: u32,
        /// Scenario center frequency, in Hz.
        frequency: f64,
        /// Scenario RF bandwidth, in Hz.
        bandwidth: f64,
        /// Scenario start time, wall time (seconds).
        scenario_start_time: f64,
        /// Number of channels in the schedule.
        nchannels: u32,
        /// Number of slots per channel in the schedule.
        nslots: u32,
        /// Node ids participating in the schedule.
        nodes: Vec<NodeId>,
        /// Flattened `nchannels * nslots` row-major schedule, `0` for idle
        /// slots.
        schedule: Vec<u8>,
    },
}

impl BinaryCodec for InternalMessage {
    fn write_to(&self, w: &mut Writer) {
        match self {
            Self::Status {
                radio_id,
                timestamp,
                location,
                source_flows,
                sink_flows,
                spectrum_stats,
            } => {
                w.put_u8(0);
                radio_id.write_to(w);
                timestamp.write_to(w);
                location.write_to(w);
                source_flows.write_to(w);
                sink_flows.write_to(w);
                spectrum_stats.write_to(w);
            }
            Self::Schedule {
                seq,
                frequency,
                bandwidth,
                scenario_start_time,
                nchannels,
                nslots,
                nodes,
                schedule,
            } => {
                w.put_u8(1);
                seq.write_to(w);
                frequency.write_to(w);
                bandwidth.write_to(w);
                scenario_start_time.write_to(w);
                nchannels.write_to(w);
                nslots.write_to(w);
                nodes.write_to(w);
                schedule.write_to(w);
            }
        }
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        match r.get_u8()? {
            0 => Ok(Self::Status {
                radio_id: NodeId::read_from(r)?,
                timestamp: f64::read_from(r)?,
                location: Option::read_from(r)?,
                source_flows: Vec::read_from(r)?,
                sink_flows: Vec::read_from(r)?,
                spectrum_stats: Vec::read_from(r)?,
            }),
            1 => Ok(Self::Schedule {
                seq: u32::read_from(r)?,
                frequency: f64::read_from(r)?,
                bandwidth: f64::read_from(r)?,
                scenario_start_time: f64::read_from(r)?,
                nchannels: u32::read_from(r)?,
                nslots: u32::read_from(r)?,
                nodes: Vec::read_from(r)?,
                schedule: Vec::read_from(r)?,
            }),
            tag => Err(ProtocolError::UnknownVariant(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::{decode, encode};

    #[test]
    fn schedule_message_round_trips() {
        let msg = InternalMessage::Schedule {
            seq: 3,
            frequency: 915_000_000.0,
            bandwidth: 5_000_000.0,
            scenario_start_time: 0.0,
            nchannels: 1,
            nslots: 2,
            nodes: vec![1, 2],
            schedule: vec![1, 2],
        };
        let frame = encode(&msg).unwrap();
        let decoded: InternalMessage = decode(&frame).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn status_message_round_trips_with_empty_stats() {
        let msg = InternalMessage::Status {
            radio_id: 1,
            timestamp: 0.0,
            location: None,
            source_flows: vec![],
            sink_flows: vec![],
            spectrum_stats: vec![],
        };
        let frame = encode(&msg).unwrap();
        let decoded: InternalMessage = decode(&frame).unwrap();
        assert_eq!(msg, decoded);
    }
}
