//! FleetGate - Clustered Industrial-Protocol Gateway
//!
//! A cluster of peer nodes cooperates to manage a dynamic population of
//! field devices (TCP/UDP/HTTP/Modbus/SECS-GEM endpoints), executing
//! user-authored command scripts against them and emitting tagged readings
//! and status changes to downstream sinks.
//!
//! # Architecture
//!
//! Three layers compose the core:
//!
//! - [`cluster`] — membership, deterministic leader election, heartbeats,
//!   and a replicated shared-object store (the coordination plane).
//! - [`driver`] — device ownership and placement on top of the cluster
//!   layer: assigns devices to exactly one owning node, detects duplicates,
//!   and rebalances on membership change.
//! - [`protocol`] and [`command`] — the per-device connection state machine,
//!   packet buffering/framing, and the scripted command runtime.
//!
//! Readings and status changes flow out through [`sink`]; [`api`] exposes
//! both the cluster RPC wire protocol and the driver REST surface over
//! HTTP+JSON.

pub mod api;
pub mod cluster;
pub mod command;
pub mod config;
pub mod driver;
pub mod error;
pub mod model;
pub mod protocol;
pub mod sink;

pub use config::FleetGateConfig;
pub use error::{Error, Result};
