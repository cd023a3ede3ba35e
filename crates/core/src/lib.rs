//! Shared building blocks for the segmentation backend.
//!
//! - [`types`]: common type aliases.
//! - [`error`]: the domain-level [`CoreError`](error::CoreError).
//! - [`queue`]: the in-process task queue with bounded concurrency,
//!   priority ordering, retry and time-out handling and a typed lifecycle
//!   event stream.
//!
//! This crate has no knowledge of segmentation, storage or transport.

pub mod error;
pub mod queue;
pub mod types;
