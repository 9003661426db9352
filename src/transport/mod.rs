pub mod http;
pub mod realtime;
pub mod rest;
pub mod store;
pub mod ws;

pub use http::BrokerRestClient;
pub use realtime::{Inbound, RealtimeSession, RealtimeTransport};
pub use rest::{AuthApi, BrokerApi};
pub use store::{MemoryStateStore, StateStore};
pub use ws::WsTransport;
