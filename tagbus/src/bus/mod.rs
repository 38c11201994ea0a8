//! The bus itself: server process state, the embedded client, and the
//! outbound queue between them and the socket.

pub mod client;
pub mod queue;
pub mod server;

pub use client::{BusClient, ClientStatus};
pub use queue::CoalescingQueue;
pub use server::BusServer;

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Transport and lifecycle faults at the bus layer. Transient ones are
/// handled by reconnecting; `ConnIdsExhausted` is fatal to the server
/// process (the supervisor restarts it).
#[derive(Debug, Error)]
pub enum BusError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection id space exhausted")]
    ConnIdsExhausted,
    #[error("connection closed by peer")]
    Closed,
    #[error("no traffic from the bus within the idle limit")]
    IdleTimeout,
    #[error("expected hello from the bus, got something else")]
    BadHello,
}
