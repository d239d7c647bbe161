//! Daemon configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;

use tidings_client::DispatcherConfig;
use tidings_net::RpcConfig;
use tidings_shared::constants::{DEFAULT_RPC_TIMEOUT_MS, DEFAULT_SOCKET_NAME};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Unix socket of the transport daemon.
    /// Env: `TIDINGS_SOCKET`
    /// Default: `tidings.sock` in the user runtime directory, else the temp dir.
    pub socket_path: PathBuf,

    /// Upper bound on a single transport call.
    /// Env: `TIDINGS_RPC_TIMEOUT_MS`
    /// Default: 25000 ms
    pub rpc_timeout: Duration,

    pub dispatcher: DispatcherConfig,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let socket_path = match std::env::var("TIDINGS_SOCKET") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => default_socket_path(),
        };

        let mut rpc_timeout = Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS);
        if let Ok(val) = std::env::var("TIDINGS_RPC_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => rpc_timeout = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid TIDINGS_RPC_TIMEOUT_MS, using default"),
            }
        }

        Self {
            socket_path,
            rpc_timeout,
            dispatcher: DispatcherConfig::from_env(),
        }
    }

    pub fn rpc(&self) -> RpcConfig {
        RpcConfig {
            call_timeout: self.rpc_timeout,
            ..RpcConfig::default()
        }
    }
}

fn default_socket_path() -> PathBuf {
    ProjectDirs::from("org", "tidings", "tidings")
        .and_then(|dirs| dirs.runtime_dir().map(|d| d.join(DEFAULT_SOCKET_NAME)))
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SOCKET_NAME))
}
