//! Local remote-control protocol: the request/response messages exchanged
//! over the TCP loopback control socket.

use serde::{Deserialize, Serialize};

use super::framing::{BinaryCodec, Reader, Writer};
use super::ProtocolError;

/// The three remote commands a client may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCommandKind {
    /// Transition `Ready -> Active`.
    Start,
    /// Transition to `Stopping`.
    Stop,
    /// Request a status report without changing state.
    Status,
}

impl BinaryCodec for RadioCommandKind {
    fn write_to(&self, w: &mut Writer) {
        let tag = match self {
            Self::Start => 0,
            Self::Stop => 1,
            Self::Status => 2,
        };
        w.put_u8(tag);
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        match r.get_u8()? {
            0 => Ok(Self::Start),
            1 => Ok(Self::Stop),
            2 => Ok(Self::Status),
            tag => Err(ProtocolError::UnknownVariant(tag)),
        }
    }
}

/// One goal's requirement, as carried in the `requirements` object of a
/// goal JSON payload. At most one field is populated per goal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalRequirements {
    /// Maximum tolerated latency, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency_s: Option<f64>,
    /// Minimum required throughput, in bits per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_throughput_bps: Option<f64>,
    /// Maximum file-transfer deadline, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_transfer_deadline_s: Option<f64>,
}

fn default_point_value() -> f64 {
    1.0
}

/// One mandate, as received in an `UpdateMandatedOutcomes` request's
/// `goals` JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// The flow this goal applies to.
    pub flow_uid: u16,
    /// Number of consecutive MPs the goal must hold to count as stable.
    pub hold_period: f64,
    /// Points awarded per MP while the goal is stable.
    #[serde(default = "default_point_value")]
    pub point_value: f64,
    /// The goal's requirement.
    pub requirements: GoalRequirements,
    /// Optional, currently unused forward-compatibility field accepted but
    /// ignored, matching the upstream source's `goal_type` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_type: Option<String>,
}

/// One environment update, applied in array order. All fields optional;
/// present fields are applied, absent ones left unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentUpdate {
    /// New scenario center frequency, in Hz.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_center_frequency: Option<f64>,
    /// New scenario RF bandwidth, in Hz.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_rf_bandwidth: Option<f64>,
    /// New ensemble scoring threshold, as a percentage (0..100).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring_percent_threshold: Option<f64>,
    /// New ensemble scoring threshold, as a raw point total.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring_point_threshold: Option<i64>,
}

/// A request sent over the local remote-control socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// START/STOP/STATUS.
    RadioCommand {
        /// Request timestamp (wall time, seconds).
        timestamp: f64,
        /// The requested command.
        command: RadioCommandKind,
    },
    /// Installs a new set of mandates, JSON-encoded per [`Goal`].
    UpdateMandatedOutcomes {
        /// Request timestamp (wall time, seconds).
        timestamp: f64,
        /// Mandates to install, as a JSON-encoded array of [`Goal`].
        goals: String,
    },
    /// Applies a sequence of environment updates, JSON-encoded per
    /// [`EnvironmentUpdate`].
    UpdateEnvironment {
        /// Request timestamp (wall time, seconds).
        timestamp: f64,
        /// Updates to apply in order, JSON-encoded array of
        /// [`EnvironmentUpdate`].
        environment: String,
    },
}

impl BinaryCodec for ControlRequest {
    fn write_to(&self, w: &mut Writer) {
        match self {
            Self::RadioCommand { timestamp, command } => {
                w.put_u8(0);
                timestamp.write_to(w);
                command.write_to(w);
            }
            Self::UpdateMandatedOutcomes { timestamp, goals } => {
                w.put_u8(1);
                timestamp.write_to(w);
                goals.write_to(w);
            }
            Self::UpdateEnvironment { timestamp, environment } => {
                w.put_u8(2);
                timestamp.write_to(w);
                environment.write_to(w);
            }
        }
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        match r.get_u8()? {
            0 => Ok(Self::RadioCommand {
                timestamp: f64::read_from(r)?,
                command: RadioCommandKind::read_from(r)?,
            }),
            1 => Ok(Self::UpdateMandatedOutcomes {
                timestamp: f64::read_from(r)?,
                goals: String::read_from(r)?,
            }),
            2 => Ok(Self::UpdateEnvironment {
                timestamp: f64::read_from(r)?,
                environment: String::read_from(r)?,
            }),
            tag => Err(ProtocolError::UnknownVariant(tag)),
        }
    }
}

/// The control plane's lifecycle state, as reported in a [`ControlResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    /// Not yet booted.
    Off,
    /// Services are being wired up.
    Booting,
    /// Booted, awaiting a START command.
    Ready,
    /// Running cooperative tasks.
    Active,
    /// Tasks are being cancelled and drained.
    Stopping,
    /// Shutdown complete.
    Finished,
    /// An unrecoverable error occurred.
    Error,
}

impl BinaryCodec for RadioState {
    fn write_to(&self, w: &mut Writer) {
        let tag = match self {
            Self::Off => 0,
            Self::Booting => 1,
            Self::Ready => 2,
            Self::Active => 3,
            Self::Stopping => 4,
            Self::Finished => 5,
            Self::Error => 6,
        };
        w.put_u8(tag);
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        match r.get_u8()? {
            0 => Ok(Self::Off),
            1 => Ok(Self::Booting),
            2 => Ok(Self::Ready),
            3 => Ok(Self::Active),
            4 => Ok(Self::Stopping),
            5 => Ok(Self::Finished),
            6 => Ok(Self::Error),
            tag => Err(ProtocolError::UnknownVariant(tag)),
        }
    }
}

/// The response to every control request.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlResponse {
    /// The current (or resulting) lifecycle state, plus free-form details.
    Status {
        /// Current lifecycle state.
        state: RadioState,
        /// Human-readable detail (e.g. an error message).
        info: String,
    },
}

impl BinaryCodec for ControlResponse {
    fn write_to(&self, w: &mut Writer) {
        match self {
            Self::Status { state, info } => {
                w.put_u8(0);
                state.write_to(w);
                info.write_to(w);
            }
        }
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        match r.get_u8()? {
            0 => Ok(Self::Status {
                state: RadioState::read_from(r)?,
                info: String::read_from(r)?,
            }),
            tag => Err(ProtocolError::UnknownVariant(tag)),
        }
    }
}

/// Parses a JSON-encoded goal array, as carried in
/// [`ControlRequest::UpdateMandatedOutcomes`].
pub fn parse_goals(goals_json: &str) -> Result<Vec<Goal>, serde_json::Error> {
    serde_json::from_str(goals_json)
}

/// Parses a JSON-encoded environment-update array, as carried in
/// [`ControlRequest::UpdateEnvironment`].
pub fn parse_environment_updates(
    environment_json: &str,
) -> Result<Vec<EnvironmentUpdate>, serde_json::Error> {
    serde_json::from_str(environment_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_defaults_point_value_to_one() {
        let json = r#"[{"flow_uid":101,"hold_period":5,"requirements":{"min_throughput_bps":1000000}}]"#;
        let goals = parse_goals(json).unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].point_value, 1.0);
        assert_eq!(goals[0].requirements.min_throughput_bps, Some(1_000_000.0));
    }

    #[test]
    fn goal_type_field_is_accepted_and_ignored() {
        let json = r#"[{"flow_uid":1,"hold_period":1,"goal_type":"legacy","requirements":{}}]"#;
        let goals = parse_goals(json).unwrap();
        assert_eq!(goals[0].goal_type.as_deref(), Some("legacy"));
    }

    #[test]
    fn environment_update_round_trips_through_frame() {
        use crate::protocol::framing::{decode, encode};

        let request = ControlRequest::RadioCommand {
            timestamp: 123.0,
            command: RadioCommandKind::Start,
        };
        let frame = encode(&request).unwrap();
        let decoded: ControlRequest = decode(&frame).unwrap();
        assert_eq!(request, decoded);
    }
}
