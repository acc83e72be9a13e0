use std::io;

use destiny_protocol::ProtocolError;
use thiserror::Error;

/// Transport and resource failures. `WouldBlock` is a flow-control signal
/// rather than a failure; `ConnectionClosed` is terminal for its session.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("operation would block")]
    WouldBlock,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("connection refused: {0}")]
    ConnectionRefused(&'static str),

    #[error("send buffer full")]
    BufferFull,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("server {0} is required and cannot be removed")]
    RequiredServer(u32),
    #[error("no pooled connection became available")]
    Unavailable,
    #[error("no healthy server to connect to")]
    NoHealthyServer,
    #[error("connection pool exhausted")]
    PoolExhausted,
}
