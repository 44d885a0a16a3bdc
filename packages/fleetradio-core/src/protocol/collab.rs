//! Collaboration bus protocol: registration with a well-known server, plus
//! push/pull of HELLO, LOCATION_UPDATE, SPECTRUM_USAGE, and
//! DETAILED_PERFORMANCE reports exchanged with peer fleets.

use crate::neighborhood::{Location, NodeId};
use crate::protocol::framing::{BinaryCodec, Reader, Writer};
use crate::protocol::ProtocolError;

/// A CIL spectrum-usage voxel: occupancy of a frequency/time block,
/// optionally tagged with transmitter/receiver identity.
#[derive(Debug, Clone, PartialEq)]
pub struct CilVoxel {
    /// Lower edge of the occupied frequency range, in Hz.
    pub f_start: f64,
    /// Upper edge of the occupied frequency range, in Hz.
    pub f_end: f64,
    /// Window start, wall time (seconds).
    pub t_start: f64,
    /// Window end, wall time (seconds).
    pub t_end: f64,
    /// Fraction of the window this voxel was occupied, in `[0, 1]`.
    pub duty_cycle: f64,
    /// Transmitting node, if known.
    pub tx: Option<NodeId>,
    /// Receiving nodes, if known.
    pub rx: Vec<NodeId>,
    /// `true` if drained from observed load reports; `false` if predicted
    /// from the current schedule/ALOHA channel set.
    pub measured: bool,
}

impl BinaryCodec for CilVoxel {
    fn write_to(&self, w: &mut Writer) {
        self.f_start.write_to(w);
        self.f_end.write_to(w);
        self.t_start.write_to(w);
        self.t_end.write_to(w);
        self.duty_cycle.write_to(w);
        self.tx.write_to(w);
        self.rx.write_to(w);
        self.measured.write_to(w);
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        Ok(Self {
            f_start: f64::read_from(r)?,
            f_end: f64::read_from(r)?,
            t_start: f64::read_from(r)?,
            t_end: f64::read_from(r)?,
            duty_cycle: f64::read_from(r)?,
            tx: Option::read_from(r)?,
            rx: Vec::read_from(r)?,
            measured: bool::read_from(r)?,
        })
    }
}

/// A per-flow performance summary, as carried on a DETAILED_PERFORMANCE
/// report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowPerformanceSummary {
    /// The flow this summary describes.
    pub flow_uid: u16,
    /// Ensemble score contributed by this flow at the time of the report.
    pub mp_score: u32,
    /// Whether the flow's goal was stable at the time of the report.
    pub goal_stable: bool,
}

impl BinaryCodec for FlowPerformanceSummary {
    fn write_to(&self, w: &mut Writer) {
        self.flow_uid.write_to(w);
        self.mp_score.write_to(w);
        self.goal_stable.write_to(w);
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        Ok(Self {
            flow_uid: u16::read_from(r)?,
            mp_score: u32::read_from(r)?,
            goal_stable: bool::read_from(r)?,
        })
    }
}

/// Messages exchanged with the registration server.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationMessage {
    /// Initial registration request.
    Register {
        /// This node's id.
        sender_id: NodeId,
    },
    /// The server's reply to a successful registration.
    Inform {
        /// Session nonce to include on subsequent messages.
        nonce: u64,
        /// Keepalive period; the client sends a KEEPALIVE every half of
        /// this.
        keepalive_seconds: u64,
        /// Initial known neighbor set.
        neighbors: Vec<NodeId>,
    },
    /// Periodic liveness ping.
    Keepalive {
        /// This node's id.
        sender_id: NodeId,
        /// Session nonce from the `Inform` reply.
        nonce: u64,
    },
    /// Sent before the client's peer sockets close.
    Leave {
        /// This node's id.
        sender_id: NodeId,
        /// Session nonce from the `Inform` reply.
        nonce: u64,
    },
    /// Asynchronous notification of a neighbor-set change.
    Notify {
        /// Updated known neighbor set.
        neighbors: Vec<NodeId>,
    },
}

impl BinaryCodec for RegistrationMessage {
    fn write_to(&self, w: &mut Writer) {
        match self {
            Self::Register { sender_id } => {
                w.put_u8(0);
                sender_id.write_to(w);
            }
            Self::Inform {
                nonce,
                keepalive_seconds,
                neighbors,
            } => {
                w.put_u8(1);
                nonce.write_to(w);
                keepalive_seconds.write_to(w);
                neighbors.write_to(w);
            }
            Self::Keepalive { sender_id, nonce } => {
                w.put_u8(2);
                sender_id.write_to(w);
                nonce.write_to(w);
            }
            Self::Leave { sender_id, nonce } => {
                w.put_u8(3);
                sender_id.write_to(w);
                nonce.write_to(w);
            }
            Self::Notify { neighbors } => {
                w.put_u8(4);
                neighbors.write_to(w);
            }
        }
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        match r.get_u8()? {
            0 => Ok(Self::Register {
                sender_id: NodeId::read_from(r)?,
            }),
            1 => Ok(Self::Inform {
                nonce: u64::read_from(r)?,
                keepalive_seconds: u64::read_from(r)?,
                neighbors: Vec::read_from(r)?,
            }),
            2 => Ok(Self::Keepalive {
                sender_id: NodeId::read_from(r)?,
                nonce: u64::read_from(r)?,
            }),
            3 => Ok(Self::Leave {
                sender_id: NodeId::read_from(r)?,
                nonce: u64::read_from(r)?,
            }),
            4 => Ok(Self::Notify {
                neighbors: Vec::read_from(r)?,
            }),
            tag => Err(ProtocolError::UnknownVariant(tag)),
        }
    }
}

/// Messages pushed to, or pulled from, peer fleets.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Sent once, on connecting to a peer.
    Hello {
        /// Sending node's id.
        sender_id: NodeId,
        /// Monotonically increasing per-sender message counter.
        msg_count: u64,
        /// Message timestamp, wall time (seconds).
        timestamp: f64,
    },
    /// Periodic location report.
    LocationUpdate {
        /// Sending node's id.
        sender_id: NodeId,
        /// Monotonically increasing per-sender message counter.
        msg_count: u64,
        /// Message timestamp, wall time (seconds).
        timestamp: f64,
        /// Locations of peers whose last report is younger than
        /// `MAX_LOCATION_AGE`.
        locations: Vec<(NodeId, Location)>,
    },
    /// Periodic spectrum-occupancy report.
    SpectrumUsage {
        /// Sending node's id.
        sender_id: NodeId,
        /// Monotonically increasing per-sender message counter.
        msg_count: u64,
        /// Message timestamp, wall time (seconds).
        timestamp: f64,
        /// Voxels drained from accumulated load reports (`measured =
        /// true`).
        historical: Vec<CilVoxel>,
        /// Voxels predicted from the current schedule/ALOHA channel set
        /// (`measured = false`).
        predicted: Vec<CilVoxel>,
    },
    /// Periodic per-flow performance report.
    DetailedPerformance {
        /// Sending node's id.
        sender_id: NodeId,
        /// Monotonically increasing per-sender message counter.
        msg_count: u64,
        /// Message timestamp, wall time (seconds).
        timestamp: f64,
        /// Per-flow performance summaries.
        flows: Vec<FlowPerformanceSummary>,
    },
}

impl BinaryCodec for PeerMessage {
    fn write_to(&self, w: &mut Writer) {
        match self {
            Self::Hello {
                sender_id,
                msg_count,
                timestamp,
            } => {
                w.put_u8(0);
                sender_id.write_to(w);
                msg_count.write_to(w);
                timestamp.write_to(w);
            }
            Self::LocationUpdate {
                sender_id,
                msg_count,
                timestamp,
                locations,
            } => {
                w.put_u8(1);
                sender_id.write_to(w);
                msg_count.write_to(w);
                timestamp.write_to(w);
                locations.write_to(w);
            }
            Self::SpectrumUsage {
                sender_id,
                msg_count,
                timestamp,
                historical,
                predicted,
            } => {
                w.put_u8(2);
                sender_id.write_to(w);
                msg_count.write_to(w);
                timestamp.write_to(w);
                historical.write_to(w);
                predicted.write_to(w);
            }
            Self::DetailedPerformance {
                sender_id,
                msg_count,
                timestamp,
                flows,
            } => {
                w.put_u8(3);
                sender_id.write_to(w);
                msg_count.write_to(w);
                timestamp.write_to(w);
                flows.write_to(w);
            }
        }
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        match r.get_u8()? {
            0 => Ok(Self::Hello {
                sender_id: NodeId::read_from(r)?,
                msg_count: u64::read_from(r)?,
                timestamp: f64::read_from(r)?,
            }),
            1 => Ok(Self::LocationUpdate {
                sender_id: NodeId::read_from(r)?,
                msg_count: u64::read_from(r)?,
                timestamp: f64::read_from(r)?,
                locations: Vec::read_from(r)?,
            }),
            2 => Ok(Self::SpectrumUsage {
                sender_id: NodeId::read_from(r)?,
                msg_count: u64::read_from(r)?,
                timestamp: f64::read_from(r)?,
                historical: Vec::read_from(r)?,
                predicted: Vec::read_from(r)?,
            }),
            3 => Ok(Self::DetailedPerformance {
                sender_id: NodeId::read_from(r)?,
                msg_count: u64::read_from(r)?,
                timestamp: f64::read_from(r)?,
                flows: Vec::read_from(r)?,
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
    fn registration_round_trips() {
        let msg = RegistrationMessage::Inform {
            nonce: 42,
            keepalive_seconds: 30,
            neighbors: vec![1, 2, 3],
        };
        let frame = encode(&msg).unwrap();
        let decoded: RegistrationMessage = decode(&frame).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn peer_spectrum_usage_round_trips() {
        let msg = PeerMessage::SpectrumUsage {
            sender_id: 1,
            msg_count: 3,
            timestamp: 0.0,
            historical: vec![CilVoxel {
                f_start: 900e6,
                f_end: 905e6,
                t_start: 0.0,
                t_end: 1.0,
                duty_cycle: 0.5,
                tx: Some(1),
                rx: vec![2],
                measured: true,
            }],
            predicted: vec![],
        };
        let frame = encode(&msg).unwrap();
        let decoded: PeerMessage = decode(&frame).unwrap();
        assert_eq!(msg, decoded);
    }
}
