#![doc = include_str!("../README.md")]

pub mod connect;
pub mod io;
pub mod pool;

mod error;
mod registry;
mod session;

pub use connect::{IpScreen, CONNECT_TIMEOUT};
pub use error::NetworkError;
pub use io::{FrameHandler, IDLE_TIMEOUT, PING_INTERVAL};
pub use pool::{
    ConnectionPool, PeerServer, PoolSettings, PoolStats, ServerHealthAlert, EVENT_SERVER_HEALTH,
};
pub use registry::{AggregateStats, ConnectionRegistry, RegistrySettings};
pub use session::{
    CloseReason, RateWindow, ReadOutcome, Session, SessionId, SessionState, TrafficStats,
    SEND_BUFFER_SIZE,
};
