//! Collaborator seams consumed by the supervisor: the pipe transport and
//! the per-message dispatcher. Framing and message content live behind
//! these traits.

use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub mod loopback;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("connect i/o failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    /// A single undecodable message. The pipe itself is still healthy.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("pipe i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("pipe closed by remote")]
    Closed,
}

#[derive(Debug, Error)]
#[error("close failed: {0}")]
pub struct CloseError(pub String);

#[derive(Debug, Error)]
#[error("dispatch failed: {0}")]
pub struct DispatchError(pub String);

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    async fn open(&self) -> Result<Self::Connection, ConnectError>;
}

#[async_trait]
pub trait Connection: Send + 'static {
    type Message: Debug + Send + 'static;
    /// Published to other components while the pipe is open. Holders may
    /// use it to talk over the pipe but never open, read or close it.
    type Handle: Clone + Debug + Send + Sync + 'static;

    fn handle(&self) -> Self::Handle;

    /// Waits at most `timeout` for the next message.
    ///
    /// Must be cancel safe: the supervisor drops an in-flight read when it
    /// is interrupted and closes the pipe right after.
    async fn read(&mut self, timeout: Duration) -> Result<Self::Message, ReadError>;

    async fn close(self) -> Result<(), CloseError>;
}

#[async_trait]
pub trait Dispatch<M: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, message: M) -> Result<(), DispatchError>;
}

/// Dispatcher that only logs what it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDispatch;

#[async_trait]
impl<M> Dispatch<M> for LoggingDispatch
where
    M: Debug + Send + 'static,
{
    async fn handle(&self, message: M) -> Result<(), DispatchError> {
        tracing::info!(message = ?message, "retrieved message");
        Ok(())
    }
}
