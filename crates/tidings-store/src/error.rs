use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The document is not well-formed XML.
    #[error("XML parse error: {0}")]
    Xml(#[from] minidom::Error),

    /// The document parsed but does not describe a chatroom list.
    #[error("Invalid chatrooms document: {0}")]
    Validation(String),

    /// Failed to determine a platform configuration directory.
    #[error("Could not determine application config directory")]
    NoConfigDir,

    /// Generic I/O error (reading, writing or renaming the file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
