//! Transport trait and notification types.
//!
//! Every method maps to one remote call on the daemon. Calls never block the
//! caller's event loop beyond the await; the daemon pushes asynchronous state
//! changes back as [`TransportEvent`]s.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tidings_shared::error::TransportError;
use tidings_shared::protocol::{
    AccountInfo, ChannelDescriptor, ChannelRequest, ConnectionInfo, ContactInfo,
    FileTransferProperties, GroupMembers, MembersChange, OutgoingMessage, PendingMessage,
    RoomInfo,
};
use tidings_shared::types::{
    AccountId, ChannelPath, ChatState, ConnectionId, ConnectionStatus, ConnectionStatusReason,
    Handle, HandleType, MessageType, TransferState, TransferStateReason,
};

pub type TransportResult<T> = Result<T, TransportError>;

#[async_trait]
pub trait Transport: Send + Sync {
    // -- Accounts and connections --

    async fn list_accounts(&self) -> TransportResult<Vec<AccountInfo>>;

    async fn request_connection(&self, account: &AccountId) -> TransportResult<ConnectionInfo>;

    async fn list_channels(&self, connection: &ConnectionId)
        -> TransportResult<Vec<ChannelDescriptor>>;

    /// Start pushing `NewChannel` notifications for this connection.
    async fn subscribe_channels(&self, connection: &ConnectionId) -> TransportResult<()>;

    async fn request_channel(
        &self,
        connection: &ConnectionId,
        request: &ChannelRequest,
    ) -> TransportResult<ChannelDescriptor>;

    async fn close_channel(&self, channel: &ChannelPath) -> TransportResult<()>;

    // -- Contacts --

    /// Resolve metadata for `handles`. Unknown handles are omitted from the reply.
    async fn get_contacts(
        &self,
        connection: &ConnectionId,
        handles: &[Handle],
    ) -> TransportResult<Vec<ContactInfo>>;

    async fn request_handles(
        &self,
        connection: &ConnectionId,
        handle_type: HandleType,
        ids: &[String],
    ) -> TransportResult<Vec<Handle>>;

    // -- Text --

    async fn list_pending_messages(&self, channel: &ChannelPath)
        -> TransportResult<Vec<PendingMessage>>;

    async fn send_message(
        &self,
        channel: &ChannelPath,
        message: &OutgoingMessage,
    ) -> TransportResult<()>;

    async fn acknowledge_pending_messages(
        &self,
        channel: &ChannelPath,
        ids: &[u32],
    ) -> TransportResult<()>;

    async fn set_chat_state(&self, channel: &ChannelPath, state: ChatState) -> TransportResult<()>;

    // -- Group membership --

    async fn list_members(&self, channel: &ChannelPath) -> TransportResult<GroupMembers>;

    async fn add_members(
        &self,
        channel: &ChannelPath,
        handles: &[Handle],
        message: &str,
    ) -> TransportResult<()>;

    async fn remove_members(
        &self,
        channel: &ChannelPath,
        handles: &[Handle],
        message: &str,
    ) -> TransportResult<()>;

    // -- File transfer --

    async fn get_file_properties(&self, channel: &ChannelPath)
        -> TransportResult<FileTransferProperties>;

    /// Accept an incoming file and have the daemon stream it into `destination`.
    async fn accept_file(
        &self,
        channel: &ChannelPath,
        destination: &Path,
        offset: u64,
    ) -> TransportResult<()>;

    /// Start streaming `source` over an outgoing file channel.
    async fn offer_file(&self, channel: &ChannelPath, source: &Path) -> TransportResult<()>;

    async fn cancel_file(&self, channel: &ChannelPath) -> TransportResult<()>;

    // -- Room directory --

    async fn list_rooms(&self, channel: &ChannelPath) -> TransportResult<()>;

    async fn stop_listing(&self, channel: &ChannelPath) -> TransportResult<()>;
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Notifications pushed by the transport daemon.
///
/// On the wire each variant is a JSON-RPC notification whose `method` is the
/// snake_case variant name and whose `params` hold the fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum TransportEvent {
    AccountStatusChanged {
        account: AccountId,
        status: ConnectionStatus,
        #[serde(default)]
        reason: ConnectionStatusReason,
    },
    ConnectionInvalidated {
        connection: ConnectionId,
        error: TransportError,
    },
    NewChannel {
        connection: ConnectionId,
        channel: ChannelDescriptor,
        /// Set when the channel was requested by the local side.
        #[serde(default)]
        suppress_handler: bool,
    },
    ChannelClosed {
        channel: ChannelPath,
    },
    MessageReceived {
        channel: ChannelPath,
        message: PendingMessage,
    },
    /// Echo of a message the local user sent, possibly from another client.
    MessageSent {
        channel: ChannelPath,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        message_type: MessageType,
        body: String,
    },
    SendError {
        channel: ChannelPath,
        error: TransportError,
        #[serde(default)]
        message_type: MessageType,
        body: String,
    },
    ChatStateChanged {
        channel: ChannelPath,
        contact: Handle,
        state: ChatState,
    },
    MembersChanged {
        channel: ChannelPath,
        change: MembersChange,
    },
    SubjectChanged {
        channel: ChannelPath,
        subject: String,
    },
    ContactsUpdated {
        connection: ConnectionId,
        contacts: Vec<ContactInfo>,
    },
    FileTransferStateChanged {
        channel: ChannelPath,
        state: TransferState,
        #[serde(default)]
        reason: TransferStateReason,
    },
    TransferredBytesChanged {
        channel: ChannelPath,
        bytes: u64,
    },
    RoomsListed {
        channel: ChannelPath,
        rooms: Vec<RoomInfo>,
    },
    ListingRooms {
        channel: ChannelPath,
        listing: bool,
    },
}

impl TransportEvent {
    /// Wire name of the notification, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AccountStatusChanged { .. } => "account_status_changed",
            Self::ConnectionInvalidated { .. } => "connection_invalidated",
            Self::NewChannel { .. } => "new_channel",
            Self::ChannelClosed { .. } => "channel_closed",
            Self::MessageReceived { .. } => "message_received",
            Self::MessageSent { .. } => "message_sent",
            Self::SendError { .. } => "send_error",
            Self::ChatStateChanged { .. } => "chat_state_changed",
            Self::MembersChanged { .. } => "members_changed",
            Self::SubjectChanged { .. } => "subject_changed",
            Self::ContactsUpdated { .. } => "contacts_updated",
            Self::FileTransferStateChanged { .. } => "file_transfer_state_changed",
            Self::TransferredBytesChanged { .. } => "transferred_bytes_changed",
            Self::RoomsListed { .. } => "rooms_listed",
            Self::ListingRooms { .. } => "listing_rooms",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_from_notification() {
        let value = json!({
            "method": "channel_closed",
            "params": { "channel": "/chan/7" }
        });
        let event: TransportEvent = serde_json::from_value(value).unwrap();
        assert_eq!(
            event,
            TransportEvent::ChannelClosed {
                channel: ChannelPath::new("/chan/7")
            }
        );
        assert_eq!(event.name(), "channel_closed");
    }

    #[test]
    fn test_new_channel_defaults_suppress_handler() {
        let value = json!({
            "method": "new_channel",
            "params": {
                "connection": "conn/1",
                "channel": {
                    "path": "/chan/1",
                    "channel_type": "text",
                    "handle_type": "contact",
                    "handle": 3
                }
            }
        });
        let event: TransportEvent = serde_json::from_value(value).unwrap();
        match event {
            TransportEvent::NewChannel {
                suppress_handler, ..
            } => assert!(!suppress_handler),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
