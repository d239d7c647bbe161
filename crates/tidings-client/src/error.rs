use thiserror::Error;

use tidings_shared::error::{FileTransferError, TransportError};
use tidings_shared::types::{AccountId, ChannelPath, TransferId};

use crate::operation::OperationError;

#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("Unknown account: {0}")]
    UnknownAccount(AccountId),

    #[error("Account not connected: {0}")]
    NotConnected(AccountId),

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelPath),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(TransferId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("File transfer error: {0}")]
    FileTransfer(#[from] FileTransferError),

    #[error("Dispatch operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("Store error: {0}")]
    Store(#[from] tidings_store::StoreError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Dispatcher closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DispatcherError>;
