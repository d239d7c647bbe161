//! JSON-RPC 2.0 client over a line-delimited byte stream.
//!
//! A dedicated tokio task owns both halves of the stream. Callers talk to it
//! through an mpsc command channel and receive replies on oneshot channels;
//! notifications from the daemon are decoded into [`TransportEvent`]s and
//! forwarded on a bounded mpsc channel.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use tidings_shared::constants::{
    DEFAULT_COMMAND_CAPACITY, DEFAULT_EVENT_CAPACITY, DEFAULT_RPC_TIMEOUT_MS, JSONRPC_VERSION,
};
use tidings_shared::error::TransportError;
use tidings_shared::protocol::{
    AccountInfo, ChannelDescriptor, ChannelRequest, ConnectionInfo, ContactInfo,
    FileTransferProperties, GroupMembers, OutgoingMessage, PendingMessage,
};
use tidings_shared::types::{AccountId, ChannelPath, ChatState, ConnectionId, Handle, HandleType};

use crate::transport::{Transport, TransportEvent, TransportResult};

/// Error code the daemon uses for calls on a channel that no longer exists.
pub const ERROR_INVALID_CHANNEL: i64 = -32001;
/// Error code for operations the connection does not implement.
pub const ERROR_NOT_AVAILABLE: i64 = -32002;

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Either a response (has `id`) or a notification (has `method`).
#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

impl From<RpcErrorObject> for TransportError {
    fn from(err: RpcErrorObject) -> Self {
        match err.code {
            ERROR_INVALID_CHANNEL => TransportError::InvalidChannel(err.message),
            ERROR_NOT_AVAILABLE => TransportError::NotAvailable(err.message),
            code => TransportError::Remote {
                code,
                message: err.message,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Client task
// ---------------------------------------------------------------------------

/// Configuration for spawning the RPC client.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Upper bound on a single call, reply included.
    pub call_timeout: Duration,
    /// Capacity of the notification channel.
    pub event_capacity: usize,
    /// Capacity of the outgoing command channel.
    pub command_capacity: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

enum RpcCommand {
    Call {
        method: &'static str,
        params: Value,
        reply: oneshot::Sender<TransportResult<Value>>,
    },
    /// A caller gave up waiting: drop calls nobody listens to anymore.
    Expire,
    #[cfg(test)]
    PendingCount(oneshot::Sender<usize>),
    Shutdown,
}

struct PendingCall {
    method: &'static str,
    reply: oneshot::Sender<TransportResult<Value>>,
}

/// Handle to the RPC client task. Cheap to clone.
#[derive(Clone)]
pub struct JsonRpcTransport {
    cmd_tx: mpsc::Sender<RpcCommand>,
    call_timeout: Duration,
}

/// Spawn the RPC client over `reader`/`writer`.
///
/// Returns the transport handle and the receiver of daemon notifications.
/// When the stream closes every outstanding call fails with
/// [`TransportError::Disconnected`] and the notification channel ends.
pub fn spawn_rpc_client<R, W>(
    reader: R,
    writer: W,
    config: RpcConfig,
) -> (JsonRpcTransport, mpsc::Receiver<TransportEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<RpcCommand>(config.command_capacity);
    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(config.event_capacity);

    tokio::spawn(async move {
        let mut lines = FramedRead::new(reader, LinesCodec::new());
        let mut sink = FramedWrite::new(writer, LinesCodec::new());
        let mut pending: HashMap<u64, PendingCall> = HashMap::new();
        let mut next_id: u64 = 1;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RpcCommand::Call { method, params, reply }) => {
                            let id = next_id;
                            next_id += 1;
                            let request = RpcRequest {
                                jsonrpc: JSONRPC_VERSION,
                                id,
                                method,
                                params,
                            };
                            match serde_json::to_string(&request) {
                                Ok(line) => {
                                    if let Err(e) = sink.send(line).await {
                                        warn!(method, error = %e, "Failed to write request");
                                        let _ = reply.send(Err(TransportError::Io(e.to_string())));
                                        break;
                                    }
                                    debug!(id, method, "Request sent");
                                    pending.insert(id, PendingCall { method, reply });
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(e.into()));
                                }
                            }
                        }
                        Some(RpcCommand::Expire) => {
                            pending.retain(|id, call| {
                                let waiting = !call.reply.is_closed();
                                if !waiting {
                                    debug!(id, method = call.method, "Dropping expired call");
                                }
                                waiting
                            });
                        }
                        #[cfg(test)]
                        Some(RpcCommand::PendingCount(reply)) => {
                            let _ = reply.send(pending.len());
                        }
                        Some(RpcCommand::Shutdown) => {
                            info!("RPC client shutdown requested");
                            break;
                        }
                        None => {
                            info!("Command channel closed, shutting down RPC client");
                            break;
                        }
                    }
                }

                line = lines.next() => {
                    match line {
                        Some(Ok(line)) => handle_line(&line, &mut pending, &event_tx).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "Failed to read from transport");
                            break;
                        }
                        None => {
                            info!("Transport stream closed");
                            break;
                        }
                    }
                }
            }
        }

        for (_, call) in pending.drain() {
            debug!(method = call.method, "Failing outstanding call");
            let _ = call.reply.send(Err(TransportError::Disconnected));
        }
    });

    (
        JsonRpcTransport {
            cmd_tx,
            call_timeout: config.call_timeout,
        },
        event_rx,
    )
}

async fn handle_line(
    line: &str,
    pending: &mut HashMap<u64, PendingCall>,
    event_tx: &mpsc::Sender<TransportEvent>,
) {
    let incoming: Incoming = match serde_json::from_str(line) {
        Ok(incoming) => incoming,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed line");
            return;
        }
    };

    if let Some(id) = incoming.id {
        match pending.remove(&id) {
            Some(call) => {
                let result = match incoming.error {
                    Some(err) => Err(err.into()),
                    None => Ok(incoming.result.unwrap_or(Value::Null)),
                };
                let _ = call.reply.send(result);
            }
            None => debug!(id, "Response for unknown or expired call"),
        }
        return;
    }

    let Some(method) = incoming.method else {
        warn!("Ignoring message without id or method");
        return;
    };

    let envelope = json!({ "method": method, "params": incoming.params });
    match serde_json::from_value::<TransportEvent>(envelope) {
        Ok(event) => {
            if event_tx.send(event).await.is_err() {
                debug!(method = %method, "Notification receiver dropped");
            }
        }
        Err(e) => warn!(method = %method, error = %e, "Ignoring unknown notification"),
    }
}

impl JsonRpcTransport {
    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> TransportResult<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::Call {
                method,
                params,
                reply,
            })
            .await
            .map_err(|_| TransportError::Disconnected)?;

        let value = match tokio::time::timeout(self.call_timeout, rx).await {
            Err(_) => {
                let _ = self.cmd_tx.send(RpcCommand::Expire).await;
                return Err(TransportError::Timeout {
                    method: method.to_string(),
                });
            }
            Ok(Err(_)) => return Err(TransportError::Disconnected),
            Ok(Ok(result)) => result?,
        };

        Ok(serde_json::from_value(value)?)
    }

    /// Ask the client task to stop. Outstanding calls fail with `Disconnected`.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RpcCommand::Shutdown).await;
    }
}

#[async_trait]
impl Transport for JsonRpcTransport {
    async fn list_accounts(&self) -> TransportResult<Vec<AccountInfo>> {
        self.call("list_accounts", json!({})).await
    }

    async fn request_connection(&self, account: &AccountId) -> TransportResult<ConnectionInfo> {
        self.call("request_connection", json!({ "account": account }))
            .await
    }

    async fn list_channels(
        &self,
        connection: &ConnectionId,
    ) -> TransportResult<Vec<ChannelDescriptor>> {
        self.call("list_channels", json!({ "connection": connection }))
            .await
    }

    async fn subscribe_channels(&self, connection: &ConnectionId) -> TransportResult<()> {
        self.call("subscribe_channels", json!({ "connection": connection }))
            .await
    }

    async fn request_channel(
        &self,
        connection: &ConnectionId,
        request: &ChannelRequest,
    ) -> TransportResult<ChannelDescriptor> {
        self.call(
            "request_channel",
            json!({ "connection": connection, "request": request }),
        )
        .await
    }

    async fn close_channel(&self, channel: &ChannelPath) -> TransportResult<()> {
        self.call("close_channel", json!({ "channel": channel })).await
    }

    async fn get_contacts(
        &self,
        connection: &ConnectionId,
        handles: &[Handle],
    ) -> TransportResult<Vec<ContactInfo>> {
        self.call(
            "get_contacts",
            json!({ "connection": connection, "handles": handles }),
        )
        .await
    }

    async fn request_handles(
        &self,
        connection: &ConnectionId,
        handle_type: HandleType,
        ids: &[String],
    ) -> TransportResult<Vec<Handle>> {
        self.call(
            "request_handles",
            json!({ "connection": connection, "handle_type": handle_type, "ids": ids }),
        )
        .await
    }

    async fn list_pending_messages(
        &self,
        channel: &ChannelPath,
    ) -> TransportResult<Vec<PendingMessage>> {
        self.call("list_pending_messages", json!({ "channel": channel }))
            .await
    }

    async fn send_message(
        &self,
        channel: &ChannelPath,
        message: &OutgoingMessage,
    ) -> TransportResult<()> {
        self.call(
            "send_message",
            json!({ "channel": channel, "message": message }),
        )
        .await
    }

    async fn acknowledge_pending_messages(
        &self,
        channel: &ChannelPath,
        ids: &[u32],
    ) -> TransportResult<()> {
        self.call(
            "acknowledge_pending_messages",
            json!({ "channel": channel, "ids": ids }),
        )
        .await
    }

    async fn set_chat_state(&self, channel: &ChannelPath, state: ChatState) -> TransportResult<()> {
        self.call(
            "set_chat_state",
            json!({ "channel": channel, "state": state }),
        )
        .await
    }

    async fn list_members(&self, channel: &ChannelPath) -> TransportResult<GroupMembers> {
        self.call("list_members", json!({ "channel": channel })).await
    }

    async fn add_members(
        &self,
        channel: &ChannelPath,
        handles: &[Handle],
        message: &str,
    ) -> TransportResult<()> {
        self.call(
            "add_members",
            json!({ "channel": channel, "handles": handles, "message": message }),
        )
        .await
    }

    async fn remove_members(
        &self,
        channel: &ChannelPath,
        handles: &[Handle],
        message: &str,
    ) -> TransportResult<()> {
        self.call(
            "remove_members",
            json!({ "channel": channel, "handles": handles, "message": message }),
        )
        .await
    }

    async fn get_file_properties(
        &self,
        channel: &ChannelPath,
    ) -> TransportResult<FileTransferProperties> {
        self.call("get_file_properties", json!({ "channel": channel }))
            .await
    }

    async fn accept_file(
        &self,
        channel: &ChannelPath,
        destination: &Path,
        offset: u64,
    ) -> TransportResult<()> {
        self.call(
            "accept_file",
            json!({ "channel": channel, "destination": destination, "offset": offset }),
        )
        .await
    }

    async fn offer_file(&self, channel: &ChannelPath, source: &Path) -> TransportResult<()> {
        self.call(
            "offer_file",
            json!({ "channel": channel, "source": source }),
        )
        .await
    }

    async fn cancel_file(&self, channel: &ChannelPath) -> TransportResult<()> {
        self.call("cancel_file", json!({ "channel": channel })).await
    }

    async fn list_rooms(&self, channel: &ChannelPath) -> TransportResult<()> {
        self.call("list_rooms", json!({ "channel": channel })).await
    }

    async fn stop_listing(&self, channel: &ChannelPath) -> TransportResult<()> {
        self.call("stop_listing", json!({ "channel": channel })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidings_shared::types::ConnectionStatus;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Spawn a client over an in-memory pipe and return the daemon side halves.
    fn pipe(
        config: RpcConfig,
    ) -> (
        JsonRpcTransport,
        mpsc::Receiver<TransportEvent>,
        tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (client, daemon) = tokio::io::duplex(16 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (daemon_read, daemon_write) = tokio::io::split(daemon);
        let (transport, events) = spawn_rpc_client(client_read, client_write, config);
        (
            transport,
            events,
            BufReader::new(daemon_read).lines(),
            daemon_write,
        )
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (transport, _events, mut requests, mut daemon_write) = pipe(RpcConfig::default());

        let call = tokio::spawn(async move { transport.list_accounts().await });

        let line = requests.next_line().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "list_accounts");
        let id = request["id"].as_u64().unwrap();

        let response = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": [{ "id": "gabble/jabber/alice0", "status": "connected" }]
        });
        daemon_write
            .write_all(format!("{response}\n").as_bytes())
            .await
            .unwrap();

        let accounts = call.await.unwrap().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, AccountId::new("gabble/jabber/alice0"));
        assert!(accounts[0].enabled);
        assert_eq!(accounts[0].status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_remote_error_mapping() {
        let (transport, _events, mut requests, mut daemon_write) = pipe(RpcConfig::default());

        let call = tokio::spawn(async move {
            transport
                .close_channel(&ChannelPath::new("/chan/gone"))
                .await
        });

        let line = requests.next_line().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(&line).unwrap();
        let response = json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": { "code": ERROR_INVALID_CHANNEL, "message": "no such channel" }
        });
        daemon_write
            .write_all(format!("{response}\n").as_bytes())
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, TransportError::InvalidChannel("no such channel".into()));
    }

    #[tokio::test]
    async fn test_notification_forwarded() {
        let (_transport, mut events, _requests, mut daemon_write) = pipe(RpcConfig::default());

        let note = json!({
            "jsonrpc": "2.0",
            "method": "subject_changed",
            "params": { "channel": "/chan/room", "subject": "release day" }
        });
        daemon_write
            .write_all(format!("{note}\nnot json at all\n").as_bytes())
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            TransportEvent::SubjectChanged {
                channel: ChannelPath::new("/chan/room"),
                subject: "release day".into(),
            }
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_call_timeout() {
        let config = RpcConfig {
            call_timeout: Duration::from_millis(500),
            ..RpcConfig::default()
        };
        let (transport, _events, _requests, _daemon_write) = pipe(config);

        let err = transport
            .subscribe_channels(&ConnectionId::new("conn/1"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Timeout {
                method: "subscribe_channels".into()
            }
        );
    }

    async fn pending_count(transport: &JsonRpcTransport) -> usize {
        let (tx, rx) = oneshot::channel();
        transport
            .cmd_tx
            .send(RpcCommand::PendingCount(tx))
            .await
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_timed_out_call_is_forgotten() {
        let config = RpcConfig {
            call_timeout: Duration::from_millis(500),
            ..RpcConfig::default()
        };
        let (transport, _events, mut requests, mut daemon_write) = pipe(config);

        let err = transport
            .list_channels(&ConnectionId::new("conn/1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert_eq!(pending_count(&transport).await, 0);

        // The late reply is ignored and the client keeps working.
        let line = requests.next_line().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(&line).unwrap();
        let late = json!({ "jsonrpc": "2.0", "id": request["id"], "result": [] });
        daemon_write
            .write_all(format!("{late}\n").as_bytes())
            .await
            .unwrap();

        let caller = transport.clone();
        let call = tokio::spawn(async move { caller.close_channel(&ChannelPath::new("/chan/1")).await });
        let line = requests.next_line().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(request["method"], "close_channel");
        let reply = json!({ "jsonrpc": "2.0", "id": request["id"], "result": null });
        daemon_write
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .unwrap();
        call.await.unwrap().unwrap();
        assert_eq!(pending_count(&transport).await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_fails_outstanding_calls() {
        let (transport, _events, mut requests, daemon_write) = pipe(RpcConfig::default());

        let call = tokio::spawn(async move {
            transport
                .list_channels(&ConnectionId::new("conn/1"))
                .await
        });

        // Wait until the request is on the wire, then hang up.
        let _ = requests.next_line().await.unwrap().unwrap();
        drop(daemon_write);
        drop(requests);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, TransportError::Disconnected);
    }
}
