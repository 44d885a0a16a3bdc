//! fleetradio-core - shared control-plane library for a fleet radio node.
//!
//! This crate implements the radio-agnostic control plane of a cognitive
//! radio node: neighbor discovery, MAC scheduling, ARQ/AMC link control,
//! mandate scoring, time synchronization, and collaboration-bus reporting.
//! It has no DSP/SDR dependency of its own; `apps/fleetradio-server` supplies
//! the concrete transports (UDP, ZMQ, local TCP) behind the traits this
//! crate defines, and the DSP layer drives packet ingest and clock-probe
//! exchanges through [`controller::ControlPlaneController`].
//!
//! # Architecture
//!
//! - [`config`]: Flat, YAML-serializable tunables for every subsystem below
//! - [`time`]: Skew-corrected wall clock and measurement-period arithmetic
//! - [`neighborhood`]: Known-peer set, gateway/time-master election
//! - [`discovery`]: Two-phase HELLO broadcasting and neighbor admission
//! - [`schedule`]: Pure MAC schedule construction
//! - [`mac`]: ALOHA/TDMA transmit-opportunity state machine
//! - [`link`]: Per-peer ARQ sliding window and adaptive MCS selection
//! - [`flow`]: Per-flow packet/byte counters feeding mandate scoring
//! - [`mandate`]: Stage-boundary mandate scoring
//! - [`collab`]: Collaboration-bus registration and periodic peer reports
//! - [`controller`]: Lifecycle state machine and cooperative task orchestration
//! - [`persistence`]: `score_reported.csv` logging
//! - [`protocol`]: Wire formats for the three external protocols
//! - [`events`]: Cross-subsystem event notification, decoupling cyclic owners
//! - [`runtime`]: Task-spawning abstraction for runtime independence
//! - [`error`]: Centralized error types
//! - [`bootstrap`]: Composition root wiring every subsystem together

#![warn(clippy::all)]

pub mod bootstrap;
pub mod collab;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod events;
pub mod flow;
pub mod link;
pub mod mac;
pub mod mandate;
pub mod neighborhood;
pub mod persistence;
pub mod protocol;
pub mod runtime;
pub mod schedule;
pub mod time;

pub use config::Config;
pub use controller::{ControlPlaneController, ControllerEventBridge};
pub use error::{ControlPlaneError, ControlPlaneResult};
pub use events::{ControlPlaneEvent, EventListener};
pub use neighborhood::{Neighborhood, NodeId};
pub use runtime::{TaskSpawner, TokioSpawner};

pub use bootstrap::{bootstrap_node, BootstrappedNode};
