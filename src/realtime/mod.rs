//! Realtime feed management.

pub mod connection;

pub use connection::{ConnectionManager, ConnectionState, Subscription};
