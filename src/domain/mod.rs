//! Domain layer for the evaluation orchestrator
//!
//! Core models, the evaluation state machine and the ports adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult, FailureClass};
