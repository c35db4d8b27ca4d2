//! Instrument transport adapters
//!
//! This module contains implementations of the [`ScpiTransport`] trait,
//! the request/response channel each instrument controller owns exclusively.
//!
//! The protocol has no framing beyond "one receive returns one reply", so a
//! caller must never have two requests outstanding on one connection.

pub mod mock_adapter;
pub mod tcp_adapter;

pub use mock_adapter::MockAdapter;
pub use tcp_adapter::TcpAdapter;

use crate::error::AppResult;
use async_trait::async_trait;

/// Composite abort-and-clear issued once when a connection is established.
pub const RESET_COMMAND: &str = "*RST; *WAI; *CLS";

/// Newline-terminated ASCII command channel to one instrument.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Short label used in logs (e.g. "analyzer").
    fn name(&self) -> &str;

    /// Send one command line; the line terminator is appended here.
    async fn send(&mut self, command: &str) -> AppResult<()>;

    /// Read one reply with trailing whitespace removed.
    async fn receive(&mut self) -> AppResult<String>;

    /// Send a query and read its reply.
    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.send(command).await?;
        self.receive().await
    }

    /// Abort whatever the instrument is doing and clear its status.
    async fn reset(&mut self) -> AppResult<()> {
        self.send(RESET_COMMAND).await
    }

    /// Close the connection. Calling it again is a no-op.
    async fn disconnect(&mut self) -> AppResult<()>;

    fn is_connected(&self) -> bool;
}
