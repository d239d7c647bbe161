//! Payloads exchanged with the transport daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AccountId, ChannelPath, ChannelType, ConnectionId, ConnectionStatus, ContentHashType, Handle,
    HandleType, MessageFlags, MessageType, TransferState,
};

/// An account known to the account manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountInfo {
    pub id: AccountId,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub status: ConnectionStatus,
}

fn default_true() -> bool {
    true
}

/// A live connection returned by `request_connection`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub account: AccountId,
    /// Handle of the local user on this connection.
    pub self_handle: Handle,
}

/// Immutable description of a channel as announced by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub path: ChannelPath,
    pub channel_type: ChannelType,
    pub handle_type: HandleType,
    pub handle: Handle,
    /// Human-readable identifier of the target (contact id, room id, list name).
    #[serde(default)]
    pub target_id: Option<String>,
    /// True when the local side asked for this channel.
    #[serde(default)]
    pub requested: bool,
    /// Channel exposes group membership (rooms, contact lists).
    #[serde(default)]
    pub has_group_interface: bool,
}

/// A message the transport still holds, waiting for acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: u32,
    pub timestamp: DateTime<Utc>,
    pub sender: Handle,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub flags: MessageFlags,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    #[serde(default)]
    pub message_type: MessageType,
    pub body: String,
}

impl OutgoingMessage {
    pub fn normal(body: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Normal,
            body: body.into(),
        }
    }
}

/// Contact metadata resolved from a handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactInfo {
    pub handle: Handle,
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl ContactInfo {
    /// Placeholder for the "no handle" sender (server notices, system messages).
    pub fn anonymous() -> Self {
        Self {
            handle: Handle::NONE,
            id: String::new(),
            alias: None,
        }
    }

    pub fn display_name(&self) -> &str {
        match &self.alias {
            Some(alias) if !alias.is_empty() => alias,
            _ => &self.id,
        }
    }
}

/// Properties describing a request to create a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelRequest {
    pub channel_type: ChannelType,
    pub handle_type: HandleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileTransferProperties>,
}

impl ChannelRequest {
    pub fn new(channel_type: ChannelType, handle_type: HandleType) -> Self {
        Self {
            channel_type,
            handle_type,
            handle: None,
            target_id: None,
            file: None,
        }
    }

    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_target_id(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    pub fn with_file(mut self, file: FileTransferProperties) -> Self {
        self.file = Some(file);
        self
    }
}

/// Metadata of a file channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileTransferProperties {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde(default)]
    pub content_hash_type: ContentHashType,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transferred_bytes: u64,
    #[serde(default)]
    pub state: TransferState,
}

/// Membership snapshot of a group channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct GroupMembers {
    pub members: Vec<Handle>,
    pub local_pending: Vec<Handle>,
    pub remote_pending: Vec<Handle>,
}

/// Membership delta of a group channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MembersChange {
    pub added: Vec<Handle>,
    pub removed: Vec<Handle>,
    pub local_pending: Vec<Handle>,
    pub remote_pending: Vec<Handle>,
    pub actor: Handle,
    pub message: String,
}

impl From<GroupMembers> for MembersChange {
    fn from(snapshot: GroupMembers) -> Self {
        Self {
            added: snapshot.members,
            local_pending: snapshot.local_pending,
            remote_pending: snapshot.remote_pending,
            ..Self::default()
        }
    }
}

/// A room advertised by a room-list channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomInfo {
    pub handle: Handle,
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub members: Option<u32>,
    #[serde(default)]
    pub password_protected: bool,
}
