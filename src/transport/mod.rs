//! Channel transport seam.
//!
//! The messaging platform is reached only through [`ChannelTransport`]: it
//! stores opaque byte blobs as channel messages and hands back message
//! identifiers. It never sees file names or paths.

mod memory;

pub use memory::MemoryTransport;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::DriveError;

/// Opaque identifier of a message stored in the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteMessageId(String);

impl RemoteMessageId {
    /// Wrap a transport-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RemoteMessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Errors reported by a transport implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The payload does not fit the tier, or the tier is unknown.
    #[error("{0}")]
    Rejected(String),

    /// Transient failure (network, rate limit); the call may be retried.
    #[error("{0}")]
    Unavailable(String),

    /// The referenced message does not exist.
    #[error("{0}")]
    NotFound(String),
}

impl From<TransportError> for DriveError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Rejected(msg) => DriveError::TransportRejected(msg),
            TransportError::Unavailable(msg) => DriveError::TransportUnavailable(msg),
            TransportError::NotFound(msg) => DriveError::NotFound(format!("remote message {msg}")),
        }
    }
}

/// A channel that stores byte blobs as messages.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Send `data` on the given tier and return the new message's identifier.
    ///
    /// `data` never exceeds the tier's ceiling when called by the engine.
    async fn send(&self, tier: &str, data: &[u8]) -> Result<RemoteMessageId, TransportError>;

    /// Fetch the bytes of a previously sent message.
    async fn fetch(&self, id: &RemoteMessageId) -> Result<Vec<u8>, TransportError>;

    /// Remove a message. Used for best-effort cleanup only.
    async fn delete(&self, id: &RemoteMessageId) -> Result<(), TransportError> {
        let _ = id;
        Ok(())
    }
}
