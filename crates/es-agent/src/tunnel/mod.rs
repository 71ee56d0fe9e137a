//! Duplex connection to the control server

mod connector;
mod dispatch;
mod outbound;

pub use connector::{
    agent_ws_url, ConnectionManager, ConnectionState, KEEPALIVE_INTERVAL, MIN_KEEPALIVE_INTERVAL,
    RECONNECT_DELAY,
};
pub use dispatch::Dispatcher;
pub use outbound::{Outbound, PushChannel, WsSink, WsStream};
