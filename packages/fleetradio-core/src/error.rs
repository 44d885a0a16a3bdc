//! Centralized error types for the control-plane core library.
//!
//! Each subsystem defines its own leaf error enum with `thiserror`; this
//! module unifies them behind [`ControlPlaneError`] the way a single
//! application error type typically wraps several narrower ones.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::schedule::ScheduleError;

/// Link-layer (ARQ/AMC) errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The destination has exceeded `max_retransmissions` on some packet and
    /// is currently considered unreachable.
    #[error("peer {0} is unreachable")]
    Unreachable(u8),

    /// The send window is full; caller must wait for acknowledgment before
    /// assigning another sequence number.
    #[error("send window full for peer {0}")]
    WindowFull(u8),
}

/// Collaboration-bus errors (registration, peer push/pull).
#[derive(Debug, Error)]
pub enum CollabError {
    /// The ZMQ transport failed to bind/connect/send.
    #[error("collaboration transport error: {0}")]
    Transport(#[from] zmq::Error),

    /// A received message could not be decoded.
    #[error("collaboration protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Top-level error type for the control plane.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Bad configuration discovered at startup (§7 kind 1: fatal).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A wire message failed to parse or used an unrecognized variant.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Schedule construction or installation failed.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Link-controller error.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Collaboration bus error.
    #[error(transparent)]
    Collab(#[from] CollabError),

    /// Transient I/O failure (§7 kind 2): retried elsewhere, logged here.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;
