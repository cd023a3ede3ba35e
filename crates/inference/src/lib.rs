//! Client side of the external inference service.
//!
//! - [`api`]: thin reqwest wrapper over `/segment`, `/extract_features`
//!   and `/health`.
//! - [`breaker`]: a rolling-window circuit breaker usable around any
//!   async call.
//! - [`service`]: [`InferenceService`](service::InferenceService), which
//!   puts one breaker in front of each expensive endpoint and leaves the
//!   health probe unwrapped.

pub mod api;
pub mod breaker;
pub mod config;
pub mod error;
pub mod service;

pub use api::HealthStatus;
pub use breaker::{BreakerState, BreakerStats, BreakerTransition, CircuitBreaker};
pub use config::{BreakerConfig, InferenceConfig};
pub use error::InferenceError;
pub use service::{InferenceService, InferenceStats};
