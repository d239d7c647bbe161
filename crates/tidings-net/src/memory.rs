//! In-process transport double.
//!
//! Answers calls from canned state, records every call in order and can be
//! told to fail a given method. Used by the coordinator's tests and by local
//! tooling that runs without a daemon.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use tidings_shared::error::TransportError;
use tidings_shared::protocol::{
    AccountInfo, ChannelDescriptor, ChannelRequest, ConnectionInfo, ContactInfo,
    FileTransferProperties, GroupMembers, OutgoingMessage, PendingMessage,
};
use tidings_shared::types::{
    AccountId, ChannelPath, ChatState, ConnectionId, Handle, HandleType,
};

use crate::transport::{Transport, TransportResult};

/// One call observed by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    ListAccounts,
    RequestConnection(AccountId),
    ListChannels(ConnectionId),
    SubscribeChannels(ConnectionId),
    RequestChannel(ConnectionId, ChannelRequest),
    CloseChannel(ChannelPath),
    GetContacts(ConnectionId, Vec<Handle>),
    RequestHandles(ConnectionId, HandleType, Vec<String>),
    ListPendingMessages(ChannelPath),
    SendMessage(ChannelPath, OutgoingMessage),
    AcknowledgePendingMessages(ChannelPath, Vec<u32>),
    SetChatState(ChannelPath, ChatState),
    ListMembers(ChannelPath),
    AddMembers(ChannelPath, Vec<Handle>, String),
    RemoveMembers(ChannelPath, Vec<Handle>, String),
    GetFileProperties(ChannelPath),
    AcceptFile(ChannelPath, PathBuf, u64),
    OfferFile(ChannelPath, PathBuf),
    CancelFile(ChannelPath),
    ListRooms(ChannelPath),
    StopListing(ChannelPath),
}

impl RecordedCall {
    /// Method name as used by [`MemoryTransport::fail`].
    pub fn method(&self) -> &'static str {
        match self {
            Self::ListAccounts => "list_accounts",
            Self::RequestConnection(_) => "request_connection",
            Self::ListChannels(_) => "list_channels",
            Self::SubscribeChannels(_) => "subscribe_channels",
            Self::RequestChannel(..) => "request_channel",
            Self::CloseChannel(_) => "close_channel",
            Self::GetContacts(..) => "get_contacts",
            Self::RequestHandles(..) => "request_handles",
            Self::ListPendingMessages(_) => "list_pending_messages",
            Self::SendMessage(..) => "send_message",
            Self::AcknowledgePendingMessages(..) => "acknowledge_pending_messages",
            Self::SetChatState(..) => "set_chat_state",
            Self::ListMembers(_) => "list_members",
            Self::AddMembers(..) => "add_members",
            Self::RemoveMembers(..) => "remove_members",
            Self::GetFileProperties(_) => "get_file_properties",
            Self::AcceptFile(..) => "accept_file",
            Self::OfferFile(..) => "offer_file",
            Self::CancelFile(_) => "cancel_file",
            Self::ListRooms(_) => "list_rooms",
            Self::StopListing(_) => "stop_listing",
        }
    }
}

#[derive(Default)]
struct MemoryState {
    calls: Vec<RecordedCall>,
    accounts: Vec<AccountInfo>,
    connections: HashMap<AccountId, ConnectionInfo>,
    channels: HashMap<ConnectionId, Vec<ChannelDescriptor>>,
    contacts: HashMap<Handle, ContactInfo>,
    handles: HashMap<String, Handle>,
    pending: HashMap<ChannelPath, Vec<PendingMessage>>,
    members: HashMap<ChannelPath, GroupMembers>,
    files: HashMap<ChannelPath, FileTransferProperties>,
    channel_replies: VecDeque<ChannelDescriptor>,
    failures: HashMap<&'static str, TransportError>,
    next_channel: u32,
}

/// Transport double backed by in-memory state.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Record `call` and return the configured failure for its method, if any.
    fn record(&self, call: RecordedCall) -> TransportResult<()> {
        self.with_state(|s| {
            let method = call.method();
            s.calls.push(call);
            match s.failures.get(method) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }

    // -- Setup --

    pub fn add_account(&self, account: AccountInfo) {
        self.with_state(|s| s.accounts.push(account));
    }

    pub fn set_connection(&self, info: ConnectionInfo) {
        self.with_state(|s| {
            s.connections.insert(info.account.clone(), info);
        });
    }

    pub fn add_channel(&self, connection: &ConnectionId, channel: ChannelDescriptor) {
        self.with_state(|s| {
            s.channels
                .entry(connection.clone())
                .or_default()
                .push(channel)
        });
    }

    pub fn add_contact(&self, contact: ContactInfo) {
        self.with_state(|s| {
            s.handles.insert(contact.id.clone(), contact.handle);
            s.contacts.insert(contact.handle, contact);
        });
    }

    pub fn set_pending_messages(&self, channel: &ChannelPath, messages: Vec<PendingMessage>) {
        self.with_state(|s| {
            s.pending.insert(channel.clone(), messages);
        });
    }

    pub fn set_members(&self, channel: &ChannelPath, members: GroupMembers) {
        self.with_state(|s| {
            s.members.insert(channel.clone(), members);
        });
    }

    pub fn set_file_properties(&self, channel: &ChannelPath, props: FileTransferProperties) {
        self.with_state(|s| {
            s.files.insert(channel.clone(), props);
        });
    }

    /// Queue the descriptor returned by the next `request_channel` call.
    ///
    /// Without a queued reply a descriptor is synthesized from the request.
    pub fn push_channel_reply(&self, channel: ChannelDescriptor) {
        self.with_state(|s| s.channel_replies.push_back(channel));
    }

    /// Make every subsequent call to `method` fail with `error`.
    pub fn fail(&self, method: &'static str, error: TransportError) {
        self.with_state(|s| {
            s.failures.insert(method, error);
        });
    }

    pub fn clear_failure(&self, method: &'static str) {
        self.with_state(|s| {
            s.failures.remove(method);
        });
    }

    // -- Inspection --

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.with_state(|s| s.calls.clone())
    }

    /// Calls whose method name is `method`, in order.
    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter(|c| c.method() == method)
                .cloned()
                .collect()
        })
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn list_accounts(&self) -> TransportResult<Vec<AccountInfo>> {
        self.record(RecordedCall::ListAccounts)?;
        Ok(self.with_state(|s| s.accounts.clone()))
    }

    async fn request_connection(&self, account: &AccountId) -> TransportResult<ConnectionInfo> {
        self.record(RecordedCall::RequestConnection(account.clone()))?;
        self.with_state(|s| s.connections.get(account).cloned())
            .ok_or_else(|| TransportError::NotAvailable(format!("no connection for {account}")))
    }

    async fn list_channels(
        &self,
        connection: &ConnectionId,
    ) -> TransportResult<Vec<ChannelDescriptor>> {
        self.record(RecordedCall::ListChannels(connection.clone()))?;
        Ok(self.with_state(|s| s.channels.get(connection).cloned().unwrap_or_default()))
    }

    async fn subscribe_channels(&self, connection: &ConnectionId) -> TransportResult<()> {
        self.record(RecordedCall::SubscribeChannels(connection.clone()))
    }

    async fn request_channel(
        &self,
        connection: &ConnectionId,
        request: &ChannelRequest,
    ) -> TransportResult<ChannelDescriptor> {
        self.record(RecordedCall::RequestChannel(
            connection.clone(),
            request.clone(),
        ))?;
        Ok(self.with_state(|s| {
            if let Some(reply) = s.channel_replies.pop_front() {
                return reply;
            }
            s.next_channel += 1;
            ChannelDescriptor {
                path: ChannelPath::new(format!("{connection}/requested/{}", s.next_channel)),
                channel_type: request.channel_type,
                handle_type: request.handle_type,
                handle: request.handle.unwrap_or(Handle::NONE),
                target_id: request.target_id.clone(),
                requested: true,
                has_group_interface: false,
            }
        }))
    }

    async fn close_channel(&self, channel: &ChannelPath) -> TransportResult<()> {
        self.record(RecordedCall::CloseChannel(channel.clone()))
    }

    async fn get_contacts(
        &self,
        connection: &ConnectionId,
        handles: &[Handle],
    ) -> TransportResult<Vec<ContactInfo>> {
        self.record(RecordedCall::GetContacts(
            connection.clone(),
            handles.to_vec(),
        ))?;
        Ok(self.with_state(|s| {
            handles
                .iter()
                .filter_map(|h| s.contacts.get(h).cloned())
                .collect()
        }))
    }

    async fn request_handles(
        &self,
        connection: &ConnectionId,
        handle_type: HandleType,
        ids: &[String],
    ) -> TransportResult<Vec<Handle>> {
        self.record(RecordedCall::RequestHandles(
            connection.clone(),
            handle_type,
            ids.to_vec(),
        ))?;
        self.with_state(|s| {
            ids.iter()
                .map(|id| {
                    s.handles
                        .get(id)
                        .copied()
                        .ok_or_else(|| TransportError::NotAvailable(format!("unknown id {id}")))
                })
                .collect()
        })
    }

    async fn list_pending_messages(
        &self,
        channel: &ChannelPath,
    ) -> TransportResult<Vec<PendingMessage>> {
        self.record(RecordedCall::ListPendingMessages(channel.clone()))?;
        Ok(self.with_state(|s| s.pending.get(channel).cloned().unwrap_or_default()))
    }

    async fn send_message(
        &self,
        channel: &ChannelPath,
        message: &OutgoingMessage,
    ) -> TransportResult<()> {
        self.record(RecordedCall::SendMessage(channel.clone(), message.clone()))
    }

    async fn acknowledge_pending_messages(
        &self,
        channel: &ChannelPath,
        ids: &[u32],
    ) -> TransportResult<()> {
        self.record(RecordedCall::AcknowledgePendingMessages(
            channel.clone(),
            ids.to_vec(),
        ))?;
        self.with_state(|s| {
            if let Some(pending) = s.pending.get_mut(channel) {
                pending.retain(|m| !ids.contains(&m.id));
            }
        });
        Ok(())
    }

    async fn set_chat_state(&self, channel: &ChannelPath, state: ChatState) -> TransportResult<()> {
        self.record(RecordedCall::SetChatState(channel.clone(), state))
    }

    async fn list_members(&self, channel: &ChannelPath) -> TransportResult<GroupMembers> {
        self.record(RecordedCall::ListMembers(channel.clone()))?;
        Ok(self.with_state(|s| s.members.get(channel).cloned().unwrap_or_default()))
    }

    async fn add_members(
        &self,
        channel: &ChannelPath,
        handles: &[Handle],
        message: &str,
    ) -> TransportResult<()> {
        self.record(RecordedCall::AddMembers(
            channel.clone(),
            handles.to_vec(),
            message.to_string(),
        ))
    }

    async fn remove_members(
        &self,
        channel: &ChannelPath,
        handles: &[Handle],
        message: &str,
    ) -> TransportResult<()> {
        self.record(RecordedCall::RemoveMembers(
            channel.clone(),
            handles.to_vec(),
            message.to_string(),
        ))
    }

    async fn get_file_properties(
        &self,
        channel: &ChannelPath,
    ) -> TransportResult<FileTransferProperties> {
        self.record(RecordedCall::GetFileProperties(channel.clone()))?;
        self.with_state(|s| s.files.get(channel).cloned())
            .ok_or_else(|| TransportError::InvalidChannel(channel.to_string()))
    }

    async fn accept_file(
        &self,
        channel: &ChannelPath,
        destination: &Path,
        offset: u64,
    ) -> TransportResult<()> {
        self.record(RecordedCall::AcceptFile(
            channel.clone(),
            destination.to_path_buf(),
            offset,
        ))
    }

    async fn offer_file(&self, channel: &ChannelPath, source: &Path) -> TransportResult<()> {
        self.record(RecordedCall::OfferFile(
            channel.clone(),
            source.to_path_buf(),
        ))
    }

    async fn cancel_file(&self, channel: &ChannelPath) -> TransportResult<()> {
        self.record(RecordedCall::CancelFile(channel.clone()))
    }

    async fn list_rooms(&self, channel: &ChannelPath) -> TransportResult<()> {
        self.record(RecordedCall::ListRooms(channel.clone()))
    }

    async fn stop_listing(&self, channel: &ChannelPath) -> TransportResult<()> {
        self.record(RecordedCall::StopListing(channel.clone()))
    }
}
