//! Measurement engine for network speed tests.
//!
//! The engine drives time-bounded transfers, converts byte checkpoints into
//! Mbps samples, estimates round-trip latency from noisy probes, and fans
//! live progress out to any number of subscribers.
//!
//! Data flows leaf-first:
//! [`source`] → [`throughput`] → [`progress`], with [`latency`] alongside,
//! all sequenced by [`orchestrator`] which hands the final record to a
//! [`store::ResultStore`].

pub mod config;
pub mod error;
pub mod latency;
pub mod orchestrator;
pub mod progress;
pub mod source;
pub mod store;
pub mod throughput;

pub use config::EngineConfig;
pub use error::EngineError;
pub use speedtest_common::protocol::LegKind;
