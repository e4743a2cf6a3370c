//! Shared types for the speed test service.
//!
//! This crate contains:
//! - **Data models**: `SpeedTestRecord` and its stored form
//! - **Progress events**: the JSON messages pushed to live subscribers
//! - **ID generation**: Prefixed UUIDv7 helpers (`spt_`, `run_`)

pub mod ids;
pub mod models;
pub mod protocol;
