use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by, or while talking to, the transport daemon.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Call timed out: {method}")]
    Timeout { method: String },

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Not available: {0}")]
    NotAvailable(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Why a file transfer ended in the error state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileTransferError {
    #[error("File transfer failed: {0}")]
    Failed(String),

    #[error("The hash of the received file and the sent one do not match")]
    HashMismatch { expected: String, actual: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("File transfer not supported by remote contact")]
    NotSupported,

    #[error("The selected file is not a regular file: {0}")]
    InvalidSourceFile(String),

    #[error("The selected file is empty")]
    EmptySourceFile,
}

/// Stable code of a [`FileTransferError`], suitable for UI lookup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTransferErrorCode {
    Failed,
    HashMismatch,
    TransportError,
    Socket,
    NotSupported,
    InvalidSourceFile,
    EmptySourceFile,
}

impl FileTransferError {
    pub fn code(&self) -> FileTransferErrorCode {
        match self {
            Self::Failed(_) => FileTransferErrorCode::Failed,
            Self::HashMismatch { .. } => FileTransferErrorCode::HashMismatch,
            Self::Transport(_) => FileTransferErrorCode::TransportError,
            Self::Socket(_) => FileTransferErrorCode::Socket,
            Self::NotSupported => FileTransferErrorCode::NotSupported,
            Self::InvalidSourceFile(_) => FileTransferErrorCode::InvalidSourceFile,
            Self::EmptySourceFile => FileTransferErrorCode::EmptySourceFile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = FileTransferError::HashMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(err.code(), FileTransferErrorCode::HashMismatch);
        let err: FileTransferError = TransportError::Disconnected.into();
        assert_eq!(err.code(), FileTransferErrorCode::TransportError);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::Io(msg) if msg.contains("pipe closed")));
    }
}
