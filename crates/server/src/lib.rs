//! Phoenix control-plane server: REST + WebSocket surface, long-poll task
//! dispatch, and the background loops that drive experiments.
//!
//! The binary entry point lives in `main.rs`; everything is exported here
//! so the integration suite can drive a fully wired server in-process.

pub mod api;
pub mod background;
pub mod poll;
pub mod router;
pub mod state;
pub mod ws;

pub use router::build_router;
pub use state::AppState;
