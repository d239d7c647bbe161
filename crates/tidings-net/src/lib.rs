//! # tidings-net
//!
//! The boundary between the coordinator and the transport daemon that owns
//! the real protocol connections.
//!
//! - [`transport`] defines the [`Transport`] trait and the notifications the
//!   daemon pushes back ([`TransportEvent`]).
//! - [`rpc`] speaks line-delimited JSON-RPC 2.0 over any byte stream.
//! - [`memory`] is an in-process double that records every call.

pub mod memory;
pub mod rpc;
pub mod transport;

pub use memory::{MemoryTransport, RecordedCall};
pub use rpc::{spawn_rpc_client, JsonRpcTransport, RpcConfig};
pub use transport::{Transport, TransportEvent, TransportResult};
