//! Sentra: a resilience layer for broker connectivity.
//!
//! Keeps a trading daemon's view of the world correct across credential
//! expiry, dropped realtime feeds, rate limits, and flaky REST
//! endpoints. Orders flow through an idempotent execution path; state
//! divergence is reconciled away after every gap.

pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod realtime;
pub mod reconcile;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use config::AppConfig;
pub use coordinator::{Coordinator, StateSnapshot};
pub use error::{ErrorClass, Result, SentraError};
