//! Speed test service library.
//!
//! Re-exports the API router, shared state, and the PostgreSQL result store
//! so they can be used by integration tests.

pub mod api;
pub mod db;
pub mod state;
pub mod ws_progress;
