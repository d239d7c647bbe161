use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use tidings_shared::error::{FileTransferErrorCode, TransportError};
use tidings_shared::protocol::{ContactInfo, OutgoingMessage, RoomInfo};
use tidings_shared::types::{
    AccountId, ChannelPath, ChannelType, ChatState, ConnectionId, ConnectionStatusReason, Handle,
    HandleType, MessageFlags, MessageType, TransferId,
};

use crate::operation::OperationState;
use crate::transfer::TransferDirection;

/// A message made visible by a chat session.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    /// Pending-message id; `None` for echoes of our own sends.
    pub id: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub sender: ContactInfo,
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub body: String,
    /// Authored by the local user.
    pub outgoing: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationInfo {
    pub channel: ChannelPath,
    pub account: AccountId,
    pub connection: ConnectionId,
    pub channel_type: ChannelType,
    pub handle_type: HandleType,
    pub handle: Handle,
    pub target_id: Option<String>,
    pub incoming: bool,
    pub state: OperationState,
    pub transfer: Option<TransferId>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransferInfo {
    pub id: TransferId,
    pub account: AccountId,
    pub direction: TransferDirection,
    pub contact: Handle,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatroomInfo {
    pub account: AccountId,
    pub room: String,
    pub name: String,
    pub auto_connect: bool,
    pub favorite: bool,
}

/// Everything the dispatcher reports to its subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatcherEvent {
    // -- Accounts --
    AccountConnected {
        account: AccountId,
        connection: ConnectionId,
    },
    AccountDisconnected {
        account: AccountId,
        reason: ConnectionStatusReason,
    },

    // -- Dispatch operations --
    Observe(OperationInfo),
    /// An unsolicited channel waits for the user to approve or reject it.
    Approve(OperationInfo),
    Dispatch(OperationInfo),
    OperationClaimed {
        channel: ChannelPath,
    },
    /// The channel went away before anyone claimed it.
    OperationAborted {
        channel: ChannelPath,
    },

    // -- Chat sessions --
    MessageReceived {
        channel: ChannelPath,
        message: ChatMessage,
    },
    SendError {
        channel: ChannelPath,
        message: OutgoingMessage,
        error: TransportError,
    },
    ChatStateChanged {
        channel: ChannelPath,
        contact: Handle,
        state: ChatState,
    },
    SubjectChanged {
        channel: ChannelPath,
        subject: String,
    },
    MembersCountChanged {
        channel: ChannelPath,
        count: usize,
    },
    ChatDestroyed {
        channel: ChannelPath,
    },

    // -- Contact list --
    MembersChanged {
        account: AccountId,
        contact: ContactInfo,
        is_member: bool,
    },
    PendingsChanged {
        account: AccountId,
        contact: ContactInfo,
        message: String,
        is_pending: bool,
    },
    GroupsChanged {
        account: AccountId,
        contact: ContactInfo,
        group: String,
        is_member: bool,
    },

    // -- File transfer --
    TransferReady(TransferInfo),
    HashingStarted {
        transfer: TransferId,
    },
    HashingProgress {
        transfer: TransferId,
        current: u64,
        total: u64,
    },
    HashingDone {
        transfer: TransferId,
    },
    TransferStarted {
        transfer: TransferId,
    },
    TransferProgress {
        transfer: TransferId,
        transferred: u64,
        total: u64,
        speed: f64,
        remaining_secs: Option<u64>,
    },
    TransferDone {
        transfer: TransferId,
    },
    TransferError {
        transfer: TransferId,
        code: FileTransferErrorCode,
        message: String,
    },
    TransferCancelled {
        transfer: TransferId,
    },

    // -- Chatrooms --
    ChatroomAdded(ChatroomInfo),
    ChatroomRemoved {
        account: AccountId,
        room: String,
    },
    ChatroomChanged(ChatroomInfo),

    // -- Room directory --
    RoomsListed {
        channel: ChannelPath,
        rooms: Vec<RoomInfo>,
    },
    ListingChanged {
        channel: ChannelPath,
        listing: bool,
    },
}

impl DispatcherEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AccountConnected { .. } => "account-connected",
            Self::AccountDisconnected { .. } => "account-disconnected",
            Self::Observe(_) => "observe",
            Self::Approve(_) => "approve",
            Self::Dispatch(_) => "dispatch",
            Self::OperationClaimed { .. } => "operation-claimed",
            Self::OperationAborted { .. } => "operation-aborted",
            Self::MessageReceived { .. } => "message-received",
            Self::SendError { .. } => "send-error",
            Self::ChatStateChanged { .. } => "chat-state-changed",
            Self::SubjectChanged { .. } => "subject-changed",
            Self::MembersCountChanged { .. } => "members-count-changed",
            Self::ChatDestroyed { .. } => "chat-destroyed",
            Self::MembersChanged { .. } => "members-changed",
            Self::PendingsChanged { .. } => "pendings-changed",
            Self::GroupsChanged { .. } => "groups-changed",
            Self::TransferReady(_) => "transfer-ready",
            Self::HashingStarted { .. } => "hashing-started",
            Self::HashingProgress { .. } => "hashing-progress",
            Self::HashingDone { .. } => "hashing-done",
            Self::TransferStarted { .. } => "transfer-started",
            Self::TransferProgress { .. } => "transfer-progress",
            Self::TransferDone { .. } => "transfer-done",
            Self::TransferError { .. } => "transfer-error",
            Self::TransferCancelled { .. } => "transfer-cancelled",
            Self::ChatroomAdded(_) => "chatroom-added",
            Self::ChatroomRemoved { .. } => "chatroom-removed",
            Self::ChatroomChanged(_) => "chatroom-changed",
            Self::RoomsListed { .. } => "rooms-listed",
            Self::ListingChanged { .. } => "listing-changed",
        }
    }
}

/// Broadcast bus for [`DispatcherEvent`]s.
///
/// Subscribing returns a receiver; dropping it unsubscribes.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DispatcherEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DispatcherEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "No subscribers for event");
        }
    }
}
