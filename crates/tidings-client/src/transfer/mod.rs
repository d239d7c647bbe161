//! File transfer handlers.
//!
//! One [`FileTransferHandler`] per transfer, in either direction. The
//! handler owns the transfer's cancellation token, hashing and progress
//! estimation; the dispatcher feeds it channel state notifications.

pub mod checksum;
pub mod handler;
pub mod progress;

use std::path::PathBuf;

use serde::Serialize;

use tidings_net::TransportResult;
use tidings_shared::error::FileTransferError;
use tidings_shared::protocol::FileTransferProperties;

pub use checksum::{hash_file, Checksum, HashError};
pub use handler::FileTransferHandler;
pub use progress::{ProgressEstimate, ProgressSampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    /// Inspecting the source file or fetching channel properties.
    Preparing,
    /// Incoming: waiting for a destination. Outgoing: offered, waiting for the peer.
    Ready,
    Hashing,
    Transferring,
    Done,
    Error,
    Cancelled,
}

impl TransferPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

/// Results of work started by a transfer handler.
pub enum TransferCompletion {
    /// Outgoing source file inspected.
    Inspected(Result<(PathBuf, FileTransferProperties), FileTransferError>),
    /// Incoming channel properties fetched.
    PropertiesFetched(TransportResult<FileTransferProperties>),
    Hashed(Result<String, HashError>),
    /// `accept_file` or `offer_file` returned.
    Started(TransportResult<()>),
}
