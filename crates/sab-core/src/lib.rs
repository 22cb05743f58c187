//! Core domain + application logic for the Signal agent bridge.
//!
//! This crate is intentionally framework-agnostic. signal-cli and the agent
//! HTTP service live behind ports (traits) implemented in adapter crates.

pub mod bridge;
pub mod completion;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod logging;
pub mod pending;
pub mod transport;
pub mod trigger;

pub use errors::{Error, Result};
