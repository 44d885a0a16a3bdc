//! Reliable, rate-adaptive point-to-point link control: sliding-window ARQ
//! with selective ACK/NAK plus adaptive MCS selection.

pub mod amc;
pub mod controller;
pub mod window;

pub use controller::{DropCounters, LinkController, LinkTunables, NakSignal, ReceiveResult};
pub use window::{ReceiveOutcome, Sack, SackRange};
