pub mod account;
pub mod events;
pub mod order;

pub use account::{AccountStatus, Position};
pub use events::{AccountUpdate, OrderUpdate, PositionUpdate, RealtimeEvent, TradeUpdate};
pub use order::{
    OrderAck, OrderIntent, OrderRequest, OrderSide, OrderSnapshot, OrderStatus, OrderType,
    TimeInForce,
};
