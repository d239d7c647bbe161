//! The dispatcher: single owner of every component.
//!
//! Transport notifications, completions of in-flight calls and commands are
//! fed to it one at a time by the task in [`crate::service`]. Nothing here
//! awaits a transport call directly; components push futures into the
//! [`Context`] and their replies come back through [`Dispatcher::handle_completion`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tidings_net::{Transport, TransportEvent, TransportResult};
use tidings_shared::error::{FileTransferError, TransportError};
use tidings_shared::protocol::{
    AccountInfo, ChannelDescriptor, ChannelRequest, ConnectionInfo, ContactInfo, OutgoingMessage,
};
use tidings_shared::types::{
    AccountId, ChannelPath, ChannelType, ChatState, ConnectionId, ConnectionStatus,
    ConnectionStatusReason, Handle, HandleType, TransferId,
};
use tidings_store::ChatroomStore;

use crate::chat::ChatSession;
use crate::chatrooms::{Chatroom, ChatroomManager};
use crate::classifier::{classify, ChannelKind};
use crate::config::DispatcherConfig;
use crate::contact_list::{ContactListView, ListCompletion};
use crate::context::{Completion, Context, HandlePurpose, RequestOrigin};
use crate::error::{DispatcherError, Result};
use crate::events::{ChatMessage, ChatroomInfo, DispatcherEvent, EventBus, OperationInfo};
use crate::operation::{DispatchOperation, OperationState, OperationTable, OutstandingRequest};
use crate::registry::ConnectionRegistry;
use crate::roomlist::RoomList;
use crate::transfer::{FileTransferHandler, TransferDirection, TransferPhase};

pub struct Dispatcher {
    config: DispatcherConfig,
    ctx: Context,
    registry: ConnectionRegistry,
    tables: HashMap<ConnectionId, OperationTable>,
    chats: HashMap<ChannelPath, ChatSession>,
    lists: HashMap<ConnectionId, ContactListView>,
    transfers: HashMap<TransferId, FileTransferHandler>,
    transfer_channels: HashMap<ChannelPath, TransferId>,
    room_lists: HashMap<ChannelPath, RoomList>,
    chatrooms: ChatroomManager,
    next_request_id: u64,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
        store: Option<Box<dyn ChatroomStore>>,
    ) -> Self {
        Self {
            ctx: Context::new(transport, EventBus::new(config.event_capacity)),
            chatrooms: ChatroomManager::new(store, config.save_debounce),
            registry: ConnectionRegistry::new(),
            tables: HashMap::new(),
            chats: HashMap::new(),
            lists: HashMap::new(),
            transfers: HashMap::new(),
            transfer_channels: HashMap::new(),
            room_lists: HashMap::new(),
            next_request_id: 0,
            config,
        }
    }

    /// Load favourite chatrooms and pick up already connected accounts.
    pub fn start(&mut self) {
        self.chatrooms.load(&self.ctx.events);

        let transport = self.ctx.transport();
        self.ctx.spawn(async move { Completion::AccountsListed(transport.list_accounts().await) });
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.ctx.events.subscribe()
    }

    /// Drive every in-flight call to completion.
    pub async fn settle(&mut self) {
        loop {
            self.process_requests();
            match self.ctx.next_completion().await {
                Some(completion) => self.handle_completion(completion),
                None => break,
            }
        }
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.ctx.has_in_flight()
    }

    pub(crate) async fn next_completion(&mut self) -> Option<Completion> {
        self.ctx.next_completion().await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn connected_accounts(&self) -> Vec<AccountId> {
        self.registry.connected_accounts()
    }

    pub fn connection(&self, account: &AccountId) -> Option<&ConnectionInfo> {
        self.registry.connection(account)
    }

    pub fn chat_session(&self, channel: &ChannelPath) -> Option<&ChatSession> {
        self.chats.get(channel)
    }

    pub fn chat_sessions(&self) -> impl Iterator<Item = &ChatSession> {
        self.chats.values()
    }

    pub fn contact_list(&self, account: &AccountId) -> Option<&ContactListView> {
        let connection = self.registry.connection(account)?;
        self.lists.get(&connection.id)
    }

    pub fn transfers(&self) -> impl Iterator<Item = &FileTransferHandler> {
        self.transfers.values()
    }

    pub fn transfer(&self, id: TransferId) -> Option<&FileTransferHandler> {
        self.transfers.get(&id)
    }

    pub fn transfer_for_channel(&self, channel: &ChannelPath) -> Option<&FileTransferHandler> {
        let id = self.transfer_channels.get(channel)?;
        self.transfers.get(id)
    }

    pub fn room_list(&self, channel: &ChannelPath) -> Option<&RoomList> {
        self.room_lists.get(channel)
    }

    pub fn chatroom_manager(&self) -> &ChatroomManager {
        &self.chatrooms
    }

    pub fn operation(&self, channel: &ChannelPath) -> Option<OperationInfo> {
        self.tables
            .values()
            .find_map(|t| t.operation(channel))
            .map(DispatchOperation::info)
    }

    // -----------------------------------------------------------------------
    // Transport notifications
    // -----------------------------------------------------------------------

    pub fn handle_event(&mut self, event: TransportEvent) {
        debug!(event = event.name(), "Transport event");

        match event {
            TransportEvent::AccountStatusChanged {
                account,
                status,
                reason,
            } => self.on_account_status_changed(account, status, reason),
            TransportEvent::ConnectionInvalidated { connection, error } => {
                warn!(connection = %connection, error = %error, "Connection invalidated");
                self.teardown_connection(&connection, ConnectionStatusReason::NetworkError);
            }
            TransportEvent::NewChannel {
                connection,
                channel,
                suppress_handler,
            } => self.on_new_channel(&connection, channel, suppress_handler),
            TransportEvent::ChannelClosed { channel } => self.on_channel_closed(&channel),
            TransportEvent::MessageReceived { channel, message } => {
                if let Some(chat) = self.chats.get_mut(&channel) {
                    chat.on_message_received(message, &mut self.ctx);
                }
            }
            TransportEvent::MessageSent {
                channel,
                timestamp,
                message_type,
                body,
            } => {
                if let Some(chat) = self.chats.get_mut(&channel) {
                    chat.on_message_sent(timestamp, message_type, body, &mut self.ctx);
                }
            }
            TransportEvent::SendError {
                channel,
                error,
                message_type,
                body,
            } => {
                if let Some(chat) = self.chats.get_mut(&channel) {
                    chat.on_send_error(OutgoingMessage { message_type, body }, error, &mut self.ctx);
                }
            }
            TransportEvent::ChatStateChanged {
                channel,
                contact,
                state,
            } => {
                if let Some(chat) = self.chats.get_mut(&channel) {
                    chat.on_chat_state_changed(contact, state, &mut self.ctx);
                }
            }
            TransportEvent::MembersChanged { channel, change } => {
                if let Some(chat) = self.chats.get_mut(&channel) {
                    chat.on_members_changed(change, &mut self.ctx);
                } else if let Some(view) = self.lists.values_mut().find(|v| v.knows(&channel)) {
                    view.on_members_changed(&channel, change, &mut self.ctx);
                }
            }
            TransportEvent::SubjectChanged { channel, subject } => {
                if let Some(chat) = self.chats.get_mut(&channel) {
                    chat.on_subject_changed(subject, &mut self.ctx);
                }
            }
            TransportEvent::ContactsUpdated {
                connection,
                contacts,
            } => {
                if self.registry.account_for(&connection).is_some() {
                    let handles = self.ctx.contacts.insert(&connection, contacts);
                    self.on_contacts_resolved(&connection, &handles);
                }
            }
            TransportEvent::FileTransferStateChanged {
                channel,
                state,
                reason,
            } => {
                let handler = self
                    .transfer_channels
                    .get(&channel)
                    .and_then(|id| self.transfers.get_mut(id));
                if let Some(handler) = handler {
                    handler.on_state_changed(state, reason, &mut self.ctx);
                }
            }
            TransportEvent::TransferredBytesChanged { channel, bytes } => {
                let handler = self
                    .transfer_channels
                    .get(&channel)
                    .and_then(|id| self.transfers.get_mut(id));
                if let Some(handler) = handler {
                    handler.on_transferred_bytes(bytes, &mut self.ctx);
                }
            }
            TransportEvent::RoomsListed { channel, rooms } => {
                if let Some(list) = self.room_lists.get_mut(&channel) {
                    list.on_rooms_listed(rooms, &mut self.ctx);
                }
            }
            TransportEvent::ListingRooms { channel, listing } => {
                if let Some(list) = self.room_lists.get_mut(&channel) {
                    list.on_listing_changed(listing, &mut self.ctx);
                }
            }
        }

        self.process_requests();
        self.prune_transfers();
    }

    // -----------------------------------------------------------------------
    // Completions
    // -----------------------------------------------------------------------

    pub fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::AccountsListed(result) => self.on_accounts_listed(result),
            Completion::ConnectionRequested { account, result } => {
                self.on_connection_requested(account, result)
            }
            Completion::ChannelsListed { connection, result } => match result {
                Ok(channels) => {
                    debug!(connection = %connection, count = channels.len(), "Existing channels listed");
                    for channel in channels {
                        self.on_new_channel(&connection, channel, false);
                    }
                }
                Err(e) => warn!(connection = %connection, error = %e, "Failed to list channels"),
            },
            Completion::ChannelsSubscribed { connection, result } => {
                if let Err(e) = result {
                    warn!(connection = %connection, error = %e, "Failed to subscribe to new channels");
                }
            }
            Completion::ContactsResolved {
                connection,
                requested,
                result,
            } => {
                self.ctx.contacts.finish_lookup(&connection, &requested);
                if self.registry.account_for(&connection).is_none() {
                    return;
                }
                let resolved = match result {
                    Ok(contacts) => {
                        // Handles the transport did not describe must not block their consumers.
                        let mut resolved = self.ctx.contacts.insert(&connection, contacts);
                        resolved.extend(self.ctx.contacts.insert_placeholders(&connection, &requested));
                        resolved
                    }
                    Err(e) => {
                        warn!(connection = %connection, error = %e, "Failed to resolve contacts");
                        self.ctx.contacts.insert_placeholders(&connection, &requested)
                    }
                };
                self.on_contacts_resolved(&connection, &resolved);
            }
            Completion::ChannelRequested {
                connection,
                request_id,
                result,
            } => self.on_channel_requested(&connection, request_id, result),
            Completion::HandlesRequested {
                account,
                purpose,
                result,
            } => self.on_handles_requested(account, purpose, result),
            Completion::Chat {
                channel,
                completion,
            } => {
                let Some(chat) = self.chats.get_mut(&channel) else {
                    debug!(channel = %channel, "Discarding completion for closed chat");
                    return;
                };
                chat.on_completion(completion, &mut self.ctx);
                let connection = chat.connection().clone();
                self.maybe_ready(&connection, &channel);
            }
            Completion::ContactList {
                connection,
                completion,
            } => {
                let created = match &completion {
                    ListCompletion::GroupRequested {
                        result: Ok(descriptor),
                        ..
                    } => Some(descriptor.clone()),
                    _ => None,
                };
                if let Some(view) = self.lists.get_mut(&connection) {
                    view.on_completion(completion, &mut self.ctx);
                }
                if let Some(descriptor) = created {
                    self.on_new_channel(&connection, descriptor, true);
                }
            }
            Completion::Transfer {
                transfer,
                completion,
            } => {
                let Some(handler) = self.transfers.get_mut(&transfer) else {
                    debug!(transfer = %transfer, "Discarding completion for unknown transfer");
                    return;
                };
                handler.on_completion(completion, &mut self.ctx);
                if let Some(channel) = handler.channel().cloned() {
                    let connection = handler.connection().clone();
                    self.maybe_ready(&connection, &channel);
                }
            }
            Completion::Logged {
                operation,
                channel,
                result,
            } => {
                if let Err(e) = result {
                    warn!(operation, channel = %channel, error = %e, "Transport call failed");
                }
            }
        }

        self.process_requests();
        self.prune_transfers();
    }

    // -----------------------------------------------------------------------
    // Accounts and connections
    // -----------------------------------------------------------------------

    fn on_accounts_listed(&mut self, result: TransportResult<Vec<AccountInfo>>) {
        let accounts = match result {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "Failed to list accounts");
                return;
            }
        };
        info!(count = accounts.len(), "Accounts listed");
        for account in accounts {
            if account.enabled && account.status == ConnectionStatus::Connected {
                self.connect(account.id);
            }
        }
    }

    fn on_account_status_changed(
        &mut self,
        account: AccountId,
        status: ConnectionStatus,
        reason: ConnectionStatusReason,
    ) {
        debug!(account = %account, status = ?status, reason = ?reason, "Account status changed");
        match status {
            ConnectionStatus::Connected => self.connect(account),
            ConnectionStatus::Disconnected => {
                match self.registry.connection(&account).map(|i| i.id.clone()) {
                    Some(connection) => self.teardown_connection(&connection, reason),
                    // Still requesting: a late reply is now stale.
                    None => {
                        self.registry.remove_account(&account);
                    }
                }
            }
            ConnectionStatus::Connecting => {}
        }
    }

    fn connect(&mut self, account: AccountId) {
        if !self.registry.begin_connect(&account) {
            debug!(account = %account, "Connection already known");
            return;
        }
        info!(account = %account, "Requesting connection");
        let transport = self.ctx.transport();
        self.ctx.spawn(async move {
            let result = transport.request_connection(&account).await;
            Completion::ConnectionRequested { account, result }
        });
    }

    fn on_connection_requested(&mut self, account: AccountId, result: TransportResult<ConnectionInfo>) {
        let connection_info = match result {
            Ok(info) => info,
            Err(e) => {
                warn!(account = %account, error = %e, "Failed to request connection");
                self.registry.connection_failed(&account);
                return;
            }
        };
        if !self.registry.connection_ready(connection_info.clone()) {
            debug!(account = %account, "Discarding stale connection");
            return;
        }

        let connection = connection_info.id;
        info!(account = %account, connection = %connection, "Account connected");
        self.tables.insert(connection.clone(), OperationTable::new());
        self.lists.insert(
            connection.clone(),
            ContactListView::new(account.clone(), connection.clone()),
        );
        self.ctx.events.emit(DispatcherEvent::AccountConnected {
            account: account.clone(),
            connection: connection.clone(),
        });

        let transport = self.ctx.transport();
        let listed = connection.clone();
        self.ctx.spawn(async move {
            let result = transport.list_channels(&listed).await;
            Completion::ChannelsListed {
                connection: listed,
                result,
            }
        });

        if self.registry.mark_subscribed(&connection) {
            let transport = self.ctx.transport();
            let subscribed = connection.clone();
            self.ctx.spawn(async move {
                let result = transport.subscribe_channels(&subscribed).await;
                Completion::ChannelsSubscribed {
                    connection: subscribed,
                    result,
                }
            });
        }

        for room in self.chatrooms.auto_connect_rooms(&account) {
            debug!(account = %account, room = %room, "Auto-joining chatroom");
            self.join_room(account.clone(), room, RequestOrigin::Detached);
        }
    }

    fn teardown_connection(&mut self, connection: &ConnectionId, reason: ConnectionStatusReason) {
        let Some(connection_info) = self.registry.remove_connection(connection) else {
            return;
        };
        info!(
            account = %connection_info.account,
            connection = %connection,
            reason = ?reason,
            "Tearing down connection"
        );

        let mut aborted = Vec::new();
        let mut requests = Vec::new();
        let mut paths = Vec::new();
        if let Some(mut table) = self.tables.remove(connection) {
            paths = table.paths();
            aborted = paths
                .iter()
                .filter(|p| table.operation(p).is_some())
                .cloned()
                .collect();
            requests = table.drain_requests();
        }
        self.lists.remove(connection);

        for path in &paths {
            self.release_channel(path);
        }
        for channel in aborted {
            self.ctx
                .events
                .emit(DispatcherEvent::OperationAborted { channel });
        }
        for request in requests {
            self.fail_origin(request.origin, TransportError::Disconnected.into());
        }
        // Incoming files being verified no longer need the connection.
        for handler in self.transfers.values_mut().filter(|h| {
            h.connection() == connection
                && !(h.direction() == TransferDirection::Incoming
                    && h.phase() == TransferPhase::Hashing)
        }) {
            handler.on_request_failed(
                FileTransferError::Transport(TransportError::Disconnected),
                &mut self.ctx,
            );
        }

        self.ctx.contacts.forget_connection(connection);
        self.ctx.events.emit(DispatcherEvent::AccountDisconnected {
            account: connection_info.account,
            reason,
        });
    }

    // -----------------------------------------------------------------------
    // Channels and dispatch operations
    // -----------------------------------------------------------------------

    fn on_new_channel(&mut self, connection: &ConnectionId, descriptor: ChannelDescriptor, suppress_handler: bool) {
        let Some(account) = self.registry.account_for(connection).cloned() else {
            debug!(connection = %connection, channel = %descriptor.path, "Channel for unknown connection");
            return;
        };
        let Some(table) = self.tables.get_mut(connection) else {
            return;
        };
        if table.knows(&descriptor.path) {
            debug!(channel = %descriptor.path, "Ignoring known channel");
            return;
        }

        let classification = classify(&descriptor, suppress_handler);
        debug!(
            channel = %descriptor.path,
            channel_type = %descriptor.channel_type,
            kind = ?classification.kind,
            incoming = classification.incoming,
            "New channel"
        );

        if let ChannelKind::ContactList(kind) = &classification.kind {
            table.insert_dispatched(descriptor.path.clone());
            if let Some(view) = self.lists.get_mut(connection) {
                view.attach(&descriptor, kind.clone(), &mut self.ctx);
            }
            return;
        }

        let path = descriptor.path.clone();
        let op = DispatchOperation::new(descriptor, account, connection.clone(), classification);
        if table.can_start(op.channel_type()) {
            table.insert_dispatching(op);
            self.setup_operation(connection, &path);
        } else {
            debug!(channel = %path, "Holding channel until local requests resolve");
            table.hold(op);
        }
    }

    /// Create the component that handles the operation's channel.
    fn setup_operation(&mut self, connection: &ConnectionId, path: &ChannelPath) {
        let Some(op) = self.tables.get(connection).and_then(|t| t.operation(path)) else {
            return;
        };
        let descriptor = op.descriptor().clone();
        let account = op.account().clone();
        let kind = op.kind().clone();

        match kind {
            ChannelKind::Chat | ChannelKind::Room => {
                let self_handle = self
                    .registry
                    .connection_info(connection)
                    .map(|i| i.self_handle)
                    .unwrap_or(Handle::NONE);
                if kind == ChannelKind::Room {
                    let room = descriptor
                        .target_id
                        .clone()
                        .unwrap_or_else(|| descriptor.handle.to_string());
                    self.chatrooms
                        .on_channel_joined(&account, &room, path.clone(), &self.ctx.events);
                }
                let mut session =
                    ChatSession::new(account, connection.clone(), self_handle, descriptor);
                session.start(&mut self.ctx);
                self.chats.insert(path.clone(), session);
            }
            ChannelKind::FileTransfer => {
                let outgoing = self.tables.get(connection).and_then(|t| t.transfer_for(path));
                let transfer = match outgoing {
                    Some(id) => {
                        let Some(handler) = self.transfers.get_mut(&id) else {
                            debug!(transfer = %id, channel = %path, "Closing channel of finished transfer");
                            self.close_channel_rpc(path);
                            return;
                        };
                        handler.on_channel_ready(path.clone(), &mut self.ctx);
                        id
                    }
                    None => {
                        let mut handler =
                            FileTransferHandler::incoming(account, connection.clone(), &descriptor);
                        handler.prepare(&mut self.ctx);
                        let id = handler.id();
                        self.transfers.insert(id, handler);
                        id
                    }
                };
                self.transfer_channels.insert(path.clone(), transfer);
                if let Some(op) = self
                    .tables
                    .get_mut(connection)
                    .and_then(|t| t.operation_mut(path))
                {
                    op.set_transfer(transfer);
                }
            }
            ChannelKind::RoomList => {
                self.room_lists
                    .insert(path.clone(), RoomList::new(account, path.clone()));
            }
            ChannelKind::ContactList(_) | ChannelKind::Unhandled => {}
        }

        self.maybe_ready(connection, path);
    }

    fn component_ready(&self, path: &ChannelPath) -> bool {
        if let Some(chat) = self.chats.get(path) {
            return chat.is_ready();
        }
        if let Some(id) = self.transfer_channels.get(path) {
            return self.transfers.get(id).map_or(true, FileTransferHandler::is_ready);
        }
        true
    }

    /// Once the channel's component is ready: announce the operation,
    /// resolve waiting requests and start it.
    fn maybe_ready(&mut self, connection: &ConnectionId, path: &ChannelPath) {
        if !self.component_ready(path) {
            return;
        }
        let Some(table) = self.tables.get_mut(connection) else {
            return;
        };
        if table.is_held(path) {
            return;
        }
        let Some(op) = table.operation_mut(path) else {
            return;
        };
        if !op.mark_ready() {
            return;
        }
        self.ctx.events.emit(DispatcherEvent::Observe(op.info()));

        self.flush_requests(connection, path);
        self.start_operation(connection, path);
    }

    fn start_operation(&mut self, connection: &ConnectionId, path: &ChannelPath) {
        let Some(op) = self
            .tables
            .get_mut(connection)
            .and_then(|t| t.operation_mut(path))
        else {
            return;
        };
        if op.state() != OperationState::Pending {
            return;
        }

        let state = op.start();
        let info = op.info();
        let outgoing_transfer = op
            .transfer()
            .and_then(|id| self.transfers.get(&id))
            .map_or(false, |h| h.direction() == TransferDirection::Outgoing);

        match state {
            OperationState::Dispatching => {
                debug!(channel = %path, "Dispatching channel");
                self.ctx.events.emit(DispatcherEvent::Dispatch(info));
            }
            OperationState::Approving => {
                info!(channel = %path, channel_type = %info.channel_type, "Channel waiting for approval");
                self.ctx.events.emit(DispatcherEvent::Approve(info));
            }
            _ => {}
        }

        // Outgoing transfers are driven by their handler, nobody else claims them.
        if state == OperationState::Dispatching && outgoing_transfer {
            if let Err(e) = self.claim(path) {
                debug!(channel = %path, error = %e, "Could not claim transfer channel");
            }
        }
    }

    fn on_channel_closed(&mut self, path: &ChannelPath) {
        let connection = self.connection_for_channel(path);
        debug!(channel = %path, "Channel closed");

        let mut aborted = false;
        let mut requests = Vec::new();
        if let Some(table) = connection.as_ref().and_then(|c| self.tables.get_mut(c)) {
            aborted = table.remove(path).is_some();
            requests = table.take_requests_for(path);
        }
        for request in requests {
            self.fail_origin(
                request.origin,
                TransportError::InvalidChannel(path.to_string()).into(),
            );
        }

        self.release_channel(path);
        if aborted {
            self.ctx.events.emit(DispatcherEvent::OperationAborted {
                channel: path.clone(),
            });
        }
        if let Some(connection) = connection {
            self.release_held(&connection);
        }
    }

    /// Drop every component bound to `path`.
    fn release_channel(&mut self, path: &ChannelPath) {
        if let Some(mut chat) = self.chats.remove(path) {
            chat.destroy(&mut self.ctx);
        }
        self.chatrooms.on_channel_closed(path, &self.ctx.events);
        if let Some(id) = self.transfer_channels.remove(path) {
            if let Some(handler) = self.transfers.get_mut(&id) {
                handler.on_channel_closed(&mut self.ctx);
            }
        }
        self.room_lists.remove(path);
        for view in self.lists.values_mut() {
            view.detach(path, &mut self.ctx);
        }
    }

    fn connection_for_channel(&self, path: &ChannelPath) -> Option<ConnectionId> {
        self.tables
            .iter()
            .find(|(_, t)| t.knows(path))
            .map(|(c, _)| c.clone())
    }

    // -----------------------------------------------------------------------
    // Channel requests
    // -----------------------------------------------------------------------

    /// Ask the transport for a channel. `origin` learns the outcome once the
    /// channel is ready, or the error.
    pub fn request_channel(&mut self, account: AccountId, request: ChannelRequest, origin: RequestOrigin) {
        let Some(connection) = self.registry.connection(&account).map(|i| i.id.clone()) else {
            self.fail_origin(origin, DispatcherError::NotConnected(account));
            return;
        };
        let Some(table) = self.tables.get_mut(&connection) else {
            self.fail_origin(origin, DispatcherError::NotConnected(account));
            return;
        };

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        table.push_request(OutstandingRequest {
            id: request_id,
            channel_type: request.channel_type,
            path: None,
            origin,
        });
        info!(
            account = %account,
            channel_type = %request.channel_type,
            target = ?request.target_id,
            request = request_id,
            "Requesting channel"
        );

        let transport = self.ctx.transport();
        self.ctx.spawn(async move {
            let result = transport.request_channel(&connection, &request).await;
            Completion::ChannelRequested {
                connection,
                request_id,
                result,
            }
        });
    }

    /// Open a one-to-one chat with `contact_id`.
    pub fn chat_with_contact(&mut self, account: AccountId, contact_id: String, origin: RequestOrigin) {
        self.request_handles(
            account,
            HandleType::Contact,
            contact_id.clone(),
            HandlePurpose::ChatWith { contact_id, origin },
        );
    }

    pub fn join_room(&mut self, account: AccountId, room: String, origin: RequestOrigin) {
        let request = ChannelRequest::new(ChannelType::Text, HandleType::Room).with_target_id(room);
        self.request_channel(account, request, origin);
    }

    fn request_handles(&mut self, account: AccountId, handle_type: HandleType, id: String, purpose: HandlePurpose) {
        let Some(connection) = self.registry.connection(&account).map(|i| i.id.clone()) else {
            match purpose {
                HandlePurpose::ChatWith { origin, .. } => {
                    self.fail_origin(origin, DispatcherError::NotConnected(account))
                }
                HandlePurpose::AddContact { .. } => {
                    warn!(account = %account, "Cannot add contact, account not connected")
                }
            }
            return;
        };

        let transport = self.ctx.transport();
        self.ctx.spawn(async move {
            let result = transport.request_handles(&connection, handle_type, &[id]).await;
            Completion::HandlesRequested {
                account,
                purpose,
                result,
            }
        });
    }

    fn on_handles_requested(&mut self, account: AccountId, purpose: HandlePurpose, result: TransportResult<Vec<Handle>>) {
        let handle = result.and_then(|handles| {
            handles
                .first()
                .copied()
                .ok_or_else(|| TransportError::NotAvailable("no handle returned".into()))
        });

        match purpose {
            HandlePurpose::ChatWith { contact_id, origin } => match handle {
                Ok(handle) => {
                    let request = ChannelRequest::new(ChannelType::Text, HandleType::Contact)
                        .with_handle(handle)
                        .with_target_id(contact_id);
                    self.request_channel(account, request, origin);
                }
                Err(e) => self.fail_origin(origin, e.into()),
            },
            HandlePurpose::AddContact { message } => match handle {
                Ok(handle) => {
                    if let Err(e) = self.with_view(&account, |view, ctx| view.add(handle, &message, ctx)) {
                        warn!(account = %account, error = %e, "Cannot add contact");
                    }
                }
                Err(e) => warn!(account = %account, error = %e, "Failed to resolve contact id"),
            },
        }
    }

    fn on_channel_requested(&mut self, connection: &ConnectionId, request_id: u64, result: TransportResult<ChannelDescriptor>) {
        match result {
            Ok(descriptor) => self.on_channel_request_resolved(connection, request_id, descriptor),
            Err(e) => {
                warn!(connection = %connection, request = request_id, error = %e, "Channel request failed");
                let request = self
                    .tables
                    .get_mut(connection)
                    .and_then(|t| t.take_request(request_id));
                if let Some(request) = request {
                    self.fail_origin(request.origin, e.into());
                }
            }
        }
        self.release_held(connection);
    }

    fn on_channel_request_resolved(&mut self, connection: &ConnectionId, request_id: u64, descriptor: ChannelDescriptor) {
        let path = descriptor.path.clone();
        let Some(table) = self.tables.get_mut(connection) else {
            return;
        };
        match table.request_mut(request_id) {
            Some(request) => request.path = Some(path.clone()),
            None => return,
        }
        debug!(channel = %path, request = request_id, "Channel request resolved");

        if table.is_dispatched(&path) {
            self.flush_requests(connection, &path);
            return;
        }

        let held = table.is_held(&path);
        let state = table.operation(&path).map(DispatchOperation::state);
        match state {
            // The reply beat the announcement.
            None => {
                let Some(account) = self.registry.account_for(connection).cloned() else {
                    return;
                };
                let classification = classify(&descriptor, true);
                if let ChannelKind::ContactList(kind) = &classification.kind {
                    table.insert_dispatched(path.clone());
                    if let Some(view) = self.lists.get_mut(connection) {
                        view.attach(&descriptor, kind.clone(), &mut self.ctx);
                    }
                    self.flush_requests(connection, &path);
                    return;
                }
                table.insert_dispatching(DispatchOperation::new(
                    descriptor,
                    account,
                    connection.clone(),
                    classification,
                ));
                self.setup_operation(connection, &path);
            }
            Some(_) if held => {
                if let Some(op) = table.operation_mut(&path) {
                    let _ = op.approve();
                }
                table.unhold(&path);
                self.setup_operation(connection, &path);
            }
            Some(OperationState::Preparing) => {
                // Pre-approved; requests are resolved once it is ready.
                if let Some(op) = table.operation_mut(&path) {
                    let _ = op.approve();
                }
            }
            Some(_) => {
                let dispatched = table
                    .operation_mut(&path)
                    .and_then(|op| op.approve().ok().filter(|moved| *moved).map(|_| op.info()));
                if let Some(info) = dispatched {
                    self.ctx.events.emit(DispatcherEvent::Dispatch(info));
                }
                self.flush_requests(connection, &path);
            }
        }
    }

    fn release_held(&mut self, connection: &ConnectionId) {
        let released = self
            .tables
            .get_mut(connection)
            .map(OperationTable::release_startable)
            .unwrap_or_default();
        for path in released {
            debug!(channel = %path, "Releasing held channel");
            self.setup_operation(connection, &path);
        }
    }

    fn flush_requests(&mut self, connection: &ConnectionId, path: &ChannelPath) {
        let requests = self
            .tables
            .get_mut(connection)
            .map(|t| t.take_requests_for(path))
            .unwrap_or_default();
        for request in requests {
            if let RequestOrigin::Caller(reply) = request.origin {
                let _ = reply.send(Ok(path.clone()));
            }
        }
    }

    fn fail_origin(&mut self, origin: RequestOrigin, error: DispatcherError) {
        match origin {
            RequestOrigin::Caller(reply) => {
                let _ = reply.send(Err(error));
            }
            RequestOrigin::Transfer(id) => {
                if let Some(handler) = self.transfers.get_mut(&id) {
                    let error = match error {
                        DispatcherError::Transport(e) => FileTransferError::Transport(e),
                        other => FileTransferError::Failed(other.to_string()),
                    };
                    handler.on_request_failed(error, &mut self.ctx);
                }
            }
            RequestOrigin::Detached => warn!(error = %error, "Channel request failed"),
        }
    }

    /// Execute channel requests raised by components.
    fn process_requests(&mut self) {
        for request in self.ctx.take_requests() {
            self.request_channel(request.account, request.request, request.origin);
        }
    }

    fn on_contacts_resolved(&mut self, connection: &ConnectionId, handles: &[Handle]) {
        if handles.is_empty() {
            return;
        }
        for chat in self
            .chats
            .values_mut()
            .filter(|c| c.connection() == connection)
        {
            chat.on_contacts_resolved(handles, &mut self.ctx);
        }
        if let Some(view) = self.lists.get_mut(connection) {
            view.on_contacts_resolved(&mut self.ctx);
        }

        let mut channels = Vec::new();
        for handler in self
            .transfers
            .values_mut()
            .filter(|h| h.connection() == connection)
        {
            handler.on_contacts_resolved(&mut self.ctx);
            if let Some(channel) = handler.channel() {
                channels.push(channel.clone());
            }
        }
        for channel in channels {
            self.maybe_ready(connection, &channel);
        }
    }

    // -----------------------------------------------------------------------
    // Operation commands
    // -----------------------------------------------------------------------

    pub fn approve(&mut self, channel: &ChannelPath) -> Result<()> {
        let op = self.operation_mut(channel)?;
        let dispatched = if op.approve()? { Some(op.info()) } else { None };
        if let Some(info) = dispatched {
            info!(channel = %channel, "Channel approved");
            self.ctx.events.emit(DispatcherEvent::Dispatch(info));
        }
        Ok(())
    }

    /// Decline an unsolicited channel by closing it.
    pub fn reject(&mut self, channel: &ChannelPath) -> Result<()> {
        self.operation_mut(channel)?;
        info!(channel = %channel, "Channel rejected");
        self.close_channel_rpc(channel);
        Ok(())
    }

    pub fn claim(&mut self, channel: &ChannelPath) -> Result<()> {
        let connection = self
            .connection_for_channel(channel)
            .ok_or_else(|| DispatcherError::UnknownChannel(channel.clone()))?;
        let table = self
            .tables
            .get_mut(&connection)
            .ok_or_else(|| DispatcherError::UnknownChannel(channel.clone()))?;
        if table.is_held(channel) {
            return Err(DispatcherError::InvalidState(format!("{channel} is held")));
        }
        table
            .operation_mut(channel)
            .ok_or_else(|| DispatcherError::UnknownChannel(channel.clone()))?
            .claim()?;
        table.mark_dispatched(channel);

        debug!(channel = %channel, "Channel claimed");
        self.ctx.events.emit(DispatcherEvent::OperationClaimed {
            channel: channel.clone(),
        });
        Ok(())
    }

    fn operation_mut(&mut self, channel: &ChannelPath) -> Result<&mut DispatchOperation> {
        self.tables
            .values_mut()
            .find_map(|t| t.operation_mut(channel))
            .ok_or_else(|| DispatcherError::UnknownChannel(channel.clone()))
    }

    // -----------------------------------------------------------------------
    // Chat commands
    // -----------------------------------------------------------------------

    fn with_chat<T>(&mut self, channel: &ChannelPath, f: impl FnOnce(&mut ChatSession, &mut Context) -> T) -> Result<T> {
        let chat = self
            .chats
            .get_mut(channel)
            .ok_or_else(|| DispatcherError::UnknownChannel(channel.clone()))?;
        Ok(f(chat, &mut self.ctx))
    }

    pub fn send_message(&mut self, channel: &ChannelPath, message: OutgoingMessage) -> Result<()> {
        self.with_chat(channel, |chat, ctx| chat.send(message, ctx))
    }

    pub fn acknowledge(&mut self, channel: &ChannelPath, ids: &[u32]) -> Result<usize> {
        self.with_chat(channel, |chat, ctx| chat.acknowledge(ids, ctx))
    }

    pub fn set_chat_state(&mut self, channel: &ChannelPath, state: ChatState) -> Result<()> {
        self.with_chat(channel, |chat, ctx| chat.set_chat_state(state, ctx))
    }

    pub fn pending_messages(&self, channel: &ChannelPath) -> Result<Vec<ChatMessage>> {
        let chat = self
            .chats
            .get(channel)
            .ok_or_else(|| DispatcherError::UnknownChannel(channel.clone()))?;
        Ok(chat.pending_messages().cloned().collect())
    }

    /// Close any known channel. Components are released on `ChannelClosed`.
    pub fn close_channel(&mut self, channel: &ChannelPath) -> Result<()> {
        if let Some(chat) = self.chats.get_mut(channel) {
            chat.close(&mut self.ctx);
            return Ok(());
        }
        if self.connection_for_channel(channel).is_none() {
            return Err(DispatcherError::UnknownChannel(channel.clone()));
        }
        self.close_channel_rpc(channel);
        Ok(())
    }

    fn close_channel_rpc(&mut self, channel: &ChannelPath) {
        let transport = self.ctx.transport();
        let path = channel.clone();
        self.ctx.spawn_logged("close_channel", channel.clone(), async move {
            transport.close_channel(&path).await
        });
    }

    // -----------------------------------------------------------------------
    // Contact list commands
    // -----------------------------------------------------------------------

    fn with_view<T>(&mut self, account: &AccountId, f: impl FnOnce(&mut ContactListView, &mut Context) -> T) -> Result<T> {
        let connection = self
            .registry
            .connection(account)
            .map(|i| i.id.clone())
            .ok_or_else(|| DispatcherError::NotConnected(account.clone()))?;
        let view = self
            .lists
            .get_mut(&connection)
            .ok_or_else(|| DispatcherError::NotConnected(account.clone()))?;
        Ok(f(view, &mut self.ctx))
    }

    /// Add `contact_id` to the roster, sending `message` with the request.
    pub fn add_contact(&mut self, account: AccountId, contact_id: String, message: String) -> Result<()> {
        if self.registry.connection(&account).is_none() {
            return Err(DispatcherError::NotConnected(account));
        }
        self.request_handles(
            account,
            HandleType::Contact,
            contact_id,
            HandlePurpose::AddContact { message },
        );
        Ok(())
    }

    pub fn remove_contact(&mut self, account: &AccountId, contact: Handle, message: &str) -> Result<()> {
        self.with_view(account, |view, ctx| view.remove(contact, message, ctx))
    }

    pub fn accept_pending(&mut self, account: &AccountId, contact: Handle) -> Result<()> {
        self.with_view(account, |view, ctx| view.accept_pending(contact, ctx))
    }

    pub fn reject_pending(&mut self, account: &AccountId, contact: Handle) -> Result<()> {
        self.with_view(account, |view, ctx| view.reject_pending(contact, ctx))
    }

    pub fn add_to_group(&mut self, account: &AccountId, contact: Handle, group: &str) -> Result<()> {
        self.with_view(account, |view, ctx| view.add_to_group(contact, group, ctx))
    }

    pub fn remove_from_group(&mut self, account: &AccountId, contact: Handle, group: &str) -> Result<()> {
        self.with_view(account, |view, ctx| view.remove_from_group(contact, group, ctx))
    }

    pub fn rename_group(&mut self, account: &AccountId, old: &str, new: &str) -> Result<bool> {
        self.with_view(account, |view, ctx| view.rename_group(old, new, ctx))
    }

    pub fn members(&mut self, account: &AccountId) -> Result<Vec<ContactInfo>> {
        self.with_view(account, |view, ctx| {
            view.members()
                .into_iter()
                .map(|h| ctx.contacts.resolved_or_placeholder(view.connection(), h))
                .collect()
        })
    }

    pub fn pendings(&mut self, account: &AccountId) -> Result<Vec<(ContactInfo, String)>> {
        self.with_view(account, |view, ctx| {
            view.pendings()
                .into_iter()
                .map(|(h, message)| (ctx.contacts.resolved_or_placeholder(view.connection(), h), message))
                .collect()
        })
    }

    pub fn groups(&mut self, account: &AccountId) -> Result<Vec<String>> {
        self.with_view(account, |view, _| view.groups())
    }

    // -----------------------------------------------------------------------
    // File transfer commands
    // -----------------------------------------------------------------------

    fn with_transfer<T>(&mut self, id: TransferId, f: impl FnOnce(&mut FileTransferHandler, &mut Context) -> T) -> Result<T> {
        let handler = self
            .transfers
            .get_mut(&id)
            .ok_or(DispatcherError::UnknownTransfer(id))?;
        let result = f(handler, &mut self.ctx);
        self.prune_transfers();
        Ok(result)
    }

    /// Forget handlers that reached a terminal phase. Their terminal event
    /// has been emitted already.
    fn prune_transfers(&mut self) {
        self.transfers.retain(|id, handler| {
            let done = handler.phase().is_terminal();
            if done {
                debug!(transfer = %id, phase = ?handler.phase(), "Dropping finished transfer");
            }
            !done
        });
        let transfers = &self.transfers;
        self.transfer_channels
            .retain(|_, id| transfers.contains_key(id));
    }

    /// Offer `source` to `contact`. Progress is reported through events.
    pub fn send_file(&mut self, account: AccountId, contact: Handle, source: PathBuf) -> Result<TransferId> {
        let connection = self
            .registry
            .connection(&account)
            .map(|i| i.id.clone())
            .ok_or_else(|| DispatcherError::NotConnected(account.clone()))?;

        let mut handler = FileTransferHandler::outgoing(
            account,
            connection,
            contact,
            source,
            self.config.outgoing_hash,
        );
        handler.prepare(&mut self.ctx);
        let id = handler.id();
        info!(transfer = %id, contact = %contact, "Sending file");
        self.transfers.insert(id, handler);
        Ok(id)
    }

    pub fn set_transfer_destination(&mut self, id: TransferId, destination: PathBuf, use_hash: bool) -> Result<()> {
        self.with_transfer(id, |handler, _| handler.set_destination(destination, use_hash))?
    }

    pub fn accept_transfer(&mut self, id: TransferId) -> Result<()> {
        self.with_transfer(id, |handler, ctx| handler.start(ctx))?
    }

    pub fn cancel_transfer(&mut self, id: TransferId) -> Result<bool> {
        self.with_transfer(id, |handler, ctx| handler.cancel(ctx))
    }

    /// `None` once the transfer has ended and its handler was dropped.
    pub fn transfer_phase(&self, id: TransferId) -> Option<TransferPhase> {
        self.transfers.get(&id).map(FileTransferHandler::phase)
    }

    // -----------------------------------------------------------------------
    // Chatrooms and room lists
    // -----------------------------------------------------------------------

    /// Save `room` as a favourite.
    pub fn add_chatroom(&mut self, account: AccountId, room: String, name: String, auto_connect: bool) -> bool {
        let events = &self.ctx.events;
        if self.chatrooms.find(&account, &room).is_some() {
            self.chatrooms.set_favorite(&account, &room, true, events);
            return self
                .chatrooms
                .set_auto_connect(&account, &room, auto_connect, events);
        }
        let mut entry = Chatroom::new(account, room, name);
        entry.favorite = true;
        entry.auto_connect = auto_connect;
        self.chatrooms.add(entry, events)
    }

    pub fn remove_chatroom(&mut self, account: &AccountId, room: &str) -> bool {
        self.chatrooms.remove(account, room, &self.ctx.events)
    }

    pub fn set_chatroom_favorite(&mut self, account: &AccountId, room: &str, favorite: bool) -> bool {
        self.chatrooms
            .set_favorite(account, room, favorite, &self.ctx.events)
    }

    pub fn set_chatroom_auto_connect(&mut self, account: &AccountId, room: &str, auto_connect: bool) -> bool {
        self.chatrooms
            .set_auto_connect(account, room, auto_connect, &self.ctx.events)
    }

    pub fn chatrooms(&self, account: Option<&AccountId>) -> Vec<ChatroomInfo> {
        self.chatrooms
            .chatrooms(account)
            .into_iter()
            .map(Chatroom::info)
            .collect()
    }

    pub fn chatroom_save_deadline(&self) -> Option<Instant> {
        self.chatrooms.save_deadline()
    }

    /// Write favourites now if a save is scheduled.
    pub fn flush_chatrooms(&mut self) {
        if self.chatrooms.save_deadline().is_none() {
            return;
        }
        if let Err(e) = self.chatrooms.flush() {
            warn!(error = %e, "Failed to save chatrooms");
        }
    }

    pub fn start_room_listing(&mut self, channel: &ChannelPath) -> Result<()> {
        let list = self
            .room_lists
            .get_mut(channel)
            .ok_or_else(|| DispatcherError::UnknownChannel(channel.clone()))?;
        list.start_listing(&mut self.ctx);
        Ok(())
    }

    pub fn stop_room_listing(&mut self, channel: &ChannelPath) -> Result<()> {
        let list = self
            .room_lists
            .get_mut(channel)
            .ok_or_else(|| DispatcherError::UnknownChannel(channel.clone()))?;
        list.stop_listing(&mut self.ctx);
        Ok(())
    }
}
