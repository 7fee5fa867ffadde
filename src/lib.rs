//! # EV Telemetry Agent
//!
//! An in-vehicle telemetry core that polls an electric vehicle's diagnostic
//! bus over CAN, decodes UDS responses into a normalized set of telemetry
//! fields, and emits them as newline-delimited JSON records for a
//! route-planning relay to pick up.
//!
//! ## Features
//!
//! - **ISO-TP transport**: ISO 15765-2 segmentation, reassembly, and flow
//!   control over classic 8-byte CAN frames
//! - **UDS requests**: Read/Write-Data-By-Identifier exchanges against any
//!   per-signal ECU address pair
//! - **Signal decoding**: windowed big-endian extraction with optional bit
//!   selection, scale, and offset
//! - **Poll-driven scheduling**: a single cooperative pass per host tick,
//!   derived-field synthesis, and a 1 Hz JSON log
//! - **Embedded-friendly**: bounded buffers, no heap growth in the hot path
//!
//! ## Quick Start
//!
//! ```no_run
//! use evtel::agent::TelemetryAgent;
//! use evtel::config::AgentConfig;
//! use evtel::sim::SimEcu;
//! use evtel::storage::JsonLogger;
//!
//! let mut agent: TelemetryAgent<SimEcu, JsonLogger> =
//!     TelemetryAgent::new(SimEcu::new(), AgentConfig::default());
//!
//! // Host super-loop: one cooperative pass per tick.
//! let now_ms = 1000;
//! agent.update_utc();
//! agent.poll_uds(now_ms);
//! agent.log_json(now_ms);
//! ```
//!
//! ## Architecture
//!
//! - [`can`] - CAN frame port: the seam to the host CAN driver
//! - [`isotp`] - ISO-TP segmentation/reassembly engine
//! - [`uds`] - UDS request layer on top of ISO-TP
//! - [`fields`] - the closed telemetry field set and its store
//! - [`signal`] - per-signal configuration and the pure decoder
//! - [`config`] - INI-style configuration loader
//! - [`agent`] - polling scheduler and JSON emitter
//! - [`storage`] - append-only log sink
//! - [`sim`] - in-process ECU simulation for tests and the demo binary

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod agent;
pub mod can;
pub mod config;
pub mod fields;
pub mod isotp;
pub mod signal;
pub mod sim;
pub mod storage;
pub mod uds;

// Re-export main public types for convenience
pub use agent::{GpsFix, TelemetryAgent};
pub use can::{Bitrate, CanBus, CanError, Frame};
pub use config::AgentConfig;
pub use fields::{FieldStore, TelemetryField};
pub use signal::SignalConfig;
pub use uds::{EcuAddress, UdsClient};
