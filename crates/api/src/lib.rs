//! Segmentation API server library.
//!
//! Exposes config, state, error handling, routes and the WebSocket layer so
//! integration tests and the binary entrypoint share them. The server is a
//! thin transport over [`spheroseg_pipeline`]: it reports queue status and
//! health, and pushes progress events to browser clients.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;
