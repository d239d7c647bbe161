//! Streaming content hashes for file transfers.
//!
//! Files are read on the blocking pool in [`HASH_BUFFER_SIZE`] chunks. The
//! cancellation token is checked between chunks.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task;
use tokio_util::sync::CancellationToken;

use tidings_shared::constants::HASH_BUFFER_SIZE;
use tidings_shared::types::ContentHashType;

/// Bytes hashed between two progress reports.
const PROGRESS_STEP: u64 = 256 * 1024;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("Hashing cancelled")]
    Cancelled,

    #[error("No hash algorithm for {0:?}")]
    Unsupported(ContentHashType),

    #[error("I/O error while hashing: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hashing task failed: {0}")]
    Join(String),
}

pub enum Checksum {
    Md5(md5::Context),
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Checksum {
    pub fn new(kind: ContentHashType) -> Result<Self, HashError> {
        match kind {
            ContentHashType::Md5 => Ok(Self::Md5(md5::Context::new())),
            ContentHashType::Sha256 => Ok(Self::Sha256(Sha256::new())),
            ContentHashType::Blake3 => Ok(Self::Blake3(Box::new(blake3::Hasher::new()))),
            ContentHashType::None => Err(HashError::Unsupported(kind)),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(data),
            Self::Sha256(hasher) => hasher.update(data),
            Self::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    /// Lowercase hex digest.
    #[allow(deprecated)]
    pub fn finalize(self) -> String {
        match self {
            Self::Md5(ctx) => hex::encode(ctx.compute().0),
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
            Self::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        }
    }
}

/// Hash the file at `path`.
///
/// `on_progress(hashed)` is called every few hundred KiB and once at the end.
pub async fn hash_file<F>(
    path: PathBuf,
    kind: ContentHashType,
    token: CancellationToken,
    mut on_progress: F,
) -> Result<String, HashError>
where
    F: FnMut(u64) + Send + 'static,
{
    let mut checksum = Checksum::new(kind)?;

    task::spawn_blocking(move || {
        let mut file = File::open(&path)?;
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        let mut hashed: u64 = 0;
        let mut reported: u64 = 0;

        loop {
            if token.is_cancelled() {
                return Err(HashError::Cancelled);
            }
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            checksum.update(&buf[..n]);
            hashed += n as u64;
            if hashed - reported >= PROGRESS_STEP {
                reported = hashed;
                on_progress(hashed);
            }
        }

        on_progress(hashed);
        Ok(checksum.finalize())
    })
    .await
    .map_err(|e| HashError::Join(e.to_string()))?
}
