//! Text channel sessions.
//!
//! A session lists the transport's pending messages when it starts and
//! defers live messages until that listing completes. Every message then
//! goes through one FIFO wait queue: it becomes visible only once its
//! sender's metadata is resolved, and nothing overtakes a message that is
//! still waiting.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use tidings_net::TransportResult;
use tidings_shared::error::TransportError;
use tidings_shared::protocol::{ChannelDescriptor, GroupMembers, MembersChange, OutgoingMessage, PendingMessage};
use tidings_shared::types::{
    AccountId, ChannelPath, ChatState, ConnectionId, Handle, MessageFlags, MessageType,
};

use crate::context::{Completion, Context};
use crate::events::{ChatMessage, DispatcherEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSessionState {
    ListingBacklog,
    Ready,
    Closed,
}

/// Transport replies owned by a chat session.
pub enum ChatCompletion {
    BacklogListed(TransportResult<Vec<PendingMessage>>),
    MessageSent {
        message: OutgoingMessage,
        result: TransportResult<()>,
    },
    MembersListed(TransportResult<GroupMembers>),
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: Option<u32>,
    timestamp: DateTime<Utc>,
    sender: Handle,
    message_type: MessageType,
    flags: MessageFlags,
    body: String,
    outgoing: bool,
}

impl From<PendingMessage> for QueuedMessage {
    fn from(msg: PendingMessage) -> Self {
        Self {
            id: Some(msg.id),
            timestamp: msg.timestamp,
            sender: msg.sender,
            message_type: msg.message_type,
            flags: msg.flags,
            body: msg.body,
            outgoing: false,
        }
    }
}

pub struct ChatSession {
    account: AccountId,
    connection: ConnectionId,
    descriptor: ChannelDescriptor,
    self_handle: Handle,
    state: ChatSessionState,
    /// Live messages that arrived while the backlog was being listed.
    deferred: Vec<PendingMessage>,
    /// Every pending-message id ever queued.
    seen: HashSet<u32>,
    wait_queue: VecDeque<QueuedMessage>,
    /// Sender the head of the wait queue is waiting for.
    blocked_on: Option<Handle>,
    /// Visible messages not yet acknowledged.
    pending_ack: VecDeque<ChatMessage>,
    subject: Option<String>,
    members: HashSet<Handle>,
}

impl ChatSession {
    pub fn new(
        account: AccountId,
        connection: ConnectionId,
        self_handle: Handle,
        descriptor: ChannelDescriptor,
    ) -> Self {
        Self {
            account,
            connection,
            descriptor,
            self_handle,
            state: ChatSessionState::ListingBacklog,
            deferred: Vec::new(),
            seen: HashSet::new(),
            wait_queue: VecDeque::new(),
            blocked_on: None,
            pending_ack: VecDeque::new(),
            subject: None,
            members: HashSet::new(),
        }
    }

    /// Kick off the backlog listing (and the member listing for rooms).
    pub fn start(&mut self, ctx: &mut Context) {
        let transport = ctx.transport();
        let channel = self.path().clone();
        ctx.spawn(async move {
            let result = transport.list_pending_messages(&channel).await;
            Completion::Chat {
                channel,
                completion: ChatCompletion::BacklogListed(result),
            }
        });

        if self.descriptor.has_group_interface {
            let transport = ctx.transport();
            let channel = self.path().clone();
            ctx.spawn(async move {
                let result = transport.list_members(&channel).await;
                Completion::Chat {
                    channel,
                    completion: ChatCompletion::MembersListed(result),
                }
            });
        }
    }

    // -- Accessors --

    pub fn path(&self) -> &ChannelPath {
        &self.descriptor.path
    }

    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.descriptor
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// `"<account>/<target id>"`, stable across reconnects.
    pub fn id(&self) -> String {
        let target = self
            .descriptor
            .target_id
            .clone()
            .unwrap_or_else(|| self.descriptor.handle.to_string());
        format!("{}/{}", self.account, target)
    }

    pub fn state(&self) -> ChatSessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state != ChatSessionState::ListingBacklog
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn members_count(&self) -> usize {
        self.members.len()
    }

    /// Visible messages awaiting acknowledgement, oldest first.
    pub fn pending_messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.pending_ack.iter()
    }

    pub fn queued_len(&self) -> usize {
        self.wait_queue.len()
    }

    // -- Inbound --

    pub fn on_completion(&mut self, completion: ChatCompletion, ctx: &mut Context) {
        match completion {
            ChatCompletion::BacklogListed(result) => self.on_backlog_listed(result, ctx),
            ChatCompletion::MessageSent { message, result } => {
                if let Err(error) = result {
                    self.on_send_error(message, error, ctx);
                }
            }
            ChatCompletion::MembersListed(result) => match result {
                Ok(snapshot) => self.on_members_changed(snapshot.into(), ctx),
                Err(e) => warn!(channel = %self.path(), error = %e, "Failed to list room members"),
            },
        }
    }

    fn on_backlog_listed(&mut self, result: TransportResult<Vec<PendingMessage>>, ctx: &mut Context) {
        if self.state != ChatSessionState::ListingBacklog {
            return;
        }

        let backlog = match result {
            Ok(messages) => messages,
            Err(e) => {
                warn!(channel = %self.path(), error = %e, "Failed to list pending messages");
                Vec::new()
            }
        };
        debug!(
            channel = %self.path(),
            backlog = backlog.len(),
            deferred = self.deferred.len(),
            "Chat session ready"
        );

        self.state = ChatSessionState::Ready;
        for msg in backlog {
            self.enqueue(msg, ctx);
        }
        for msg in std::mem::take(&mut self.deferred) {
            self.enqueue(msg, ctx);
        }
    }

    pub fn on_message_received(&mut self, message: PendingMessage, ctx: &mut Context) {
        match self.state {
            ChatSessionState::ListingBacklog => self.deferred.push(message),
            ChatSessionState::Ready => self.enqueue(message, ctx),
            ChatSessionState::Closed => {}
        }
    }

    /// Echo of a message sent by the local user.
    pub fn on_message_sent(
        &mut self,
        timestamp: DateTime<Utc>,
        message_type: MessageType,
        body: String,
        ctx: &mut Context,
    ) {
        if self.state == ChatSessionState::Closed {
            return;
        }
        self.wait_queue.push_back(QueuedMessage {
            id: None,
            timestamp,
            sender: self.self_handle,
            message_type,
            flags: MessageFlags::default(),
            body,
            outgoing: true,
        });
        self.drain(ctx);
    }

    pub fn on_send_error(&mut self, message: OutgoingMessage, error: TransportError, ctx: &mut Context) {
        warn!(channel = %self.path(), error = %error, "Failed to send message");
        ctx.events.emit(DispatcherEvent::SendError {
            channel: self.path().clone(),
            message,
            error,
        });
    }

    /// Some contacts of this session's connection were resolved.
    pub fn on_contacts_resolved(&mut self, handles: &[Handle], ctx: &mut Context) {
        match self.blocked_on {
            Some(blocking) if handles.contains(&blocking) => {
                self.blocked_on = None;
                self.drain(ctx);
            }
            _ => {}
        }
    }

    pub fn on_chat_state_changed(&mut self, contact: Handle, state: ChatState, ctx: &mut Context) {
        ctx.events.emit(DispatcherEvent::ChatStateChanged {
            channel: self.path().clone(),
            contact,
            state,
        });
    }

    pub fn on_subject_changed(&mut self, subject: String, ctx: &mut Context) {
        self.subject = Some(subject.clone());
        ctx.events.emit(DispatcherEvent::SubjectChanged {
            channel: self.path().clone(),
            subject,
        });
    }

    pub fn on_members_changed(&mut self, change: MembersChange, ctx: &mut Context) {
        let before = self.members.len();
        for h in &change.removed {
            self.members.remove(h);
        }
        self.members.extend(change.added.iter().copied());
        if self.members.len() != before {
            ctx.events.emit(DispatcherEvent::MembersCountChanged {
                channel: self.path().clone(),
                count: self.members.len(),
            });
        }
    }

    // -- Outbound --

    /// Send a message. Failures surface as `SendError` events, never retried.
    pub fn send(&mut self, message: OutgoingMessage, ctx: &mut Context) {
        let transport = ctx.transport();
        let channel = self.path().clone();
        ctx.spawn(async move {
            let result = transport.send_message(&channel, &message).await;
            Completion::Chat {
                channel,
                completion: ChatCompletion::MessageSent { message, result },
            }
        });
    }

    /// Acknowledge visible messages by id.
    ///
    /// Issues at most one transport call carrying the ids of remote-authored
    /// messages. Returns how many messages left the local queue.
    pub fn acknowledge(&mut self, ids: &[u32], ctx: &mut Context) -> usize {
        let mut removed = 0;
        let mut remote_ids = Vec::new();

        self.pending_ack.retain(|msg| match msg.id {
            Some(id) if ids.contains(&id) => {
                removed += 1;
                if !msg.outgoing && msg.sender.handle != self.self_handle {
                    remote_ids.push(id);
                }
                false
            }
            _ => true,
        });

        if !remote_ids.is_empty() {
            self.spawn_ack(remote_ids, ctx);
        }
        removed
    }

    pub fn set_chat_state(&mut self, state: ChatState, ctx: &mut Context) {
        let transport = ctx.transport();
        let channel = self.path().clone();
        ctx.spawn_logged("set_chat_state", channel.clone(), async move {
            transport.set_chat_state(&channel, state).await
        });
    }

    /// Ask the transport to close the channel. Teardown follows its
    /// `ChannelClosed` notification.
    pub fn close(&mut self, ctx: &mut Context) {
        let transport = ctx.transport();
        let channel = self.path().clone();
        ctx.spawn_logged("close_channel", channel.clone(), async move {
            transport.close_channel(&channel).await
        });
    }

    /// Local teardown: drop waiting messages and announce destruction.
    pub fn destroy(&mut self, ctx: &mut Context) {
        if self.state == ChatSessionState::Closed {
            return;
        }
        info!(channel = %self.path(), dropped = self.wait_queue.len(), "Chat session destroyed");
        self.state = ChatSessionState::Closed;
        self.wait_queue.clear();
        self.deferred.clear();
        self.blocked_on = None;
        ctx.events.emit(DispatcherEvent::ChatDestroyed {
            channel: self.path().clone(),
        });
    }

    // -- Internals --

    fn enqueue(&mut self, msg: PendingMessage, ctx: &mut Context) {
        if !self.seen.insert(msg.id) {
            debug!(channel = %self.path(), id = msg.id, "Skipping duplicate message");
            return;
        }

        if msg.flags.non_text_content && msg.body.is_empty() {
            debug!(channel = %self.path(), id = msg.id, "Acknowledging empty non-text message");
            self.spawn_ack(vec![msg.id], ctx);
            return;
        }

        self.wait_queue.push_back(msg.into());
        self.drain(ctx);
    }

    /// Deliver queued messages up to the first unresolved sender.
    fn drain(&mut self, ctx: &mut Context) {
        if self.blocked_on.is_some() {
            return;
        }

        while let Some(head) = self.wait_queue.front() {
            let Some(sender) = ctx.contacts.resolved(&self.connection, head.sender) else {
                let handle = head.sender;
                debug!(channel = %self.path(), sender = %handle, "Waiting for sender metadata");
                self.blocked_on = Some(handle);
                ctx.request_contacts(&self.connection, &[handle]);
                return;
            };

            let Some(queued) = self.wait_queue.pop_front() else {
                break;
            };
            let message = ChatMessage {
                id: queued.id,
                timestamp: queued.timestamp,
                sender,
                message_type: queued.message_type,
                flags: queued.flags,
                body: queued.body,
                outgoing: queued.outgoing,
            };
            if message.id.is_some() {
                self.pending_ack.push_back(message.clone());
            }
            ctx.events.emit(DispatcherEvent::MessageReceived {
                channel: self.path().clone(),
                message,
            });
        }
    }

    fn spawn_ack(&mut self, ids: Vec<u32>, ctx: &mut Context) {
        let transport = ctx.transport();
        let channel = self.path().clone();
        ctx.spawn_logged("acknowledge_pending_messages", channel.clone(), async move {
            transport.acknowledge_pending_messages(&channel, &ids).await
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use tidings_net::{MemoryTransport, RecordedCall};
    use tidings_shared::protocol::ContactInfo;
    use tidings_shared::types::{ChannelType, HandleType};
    use tokio::sync::broadcast;

    use crate::events::EventBus;

    const SELF: Handle = Handle(1);

    struct Harness {
        transport: Arc<MemoryTransport>,
        ctx: Context,
        events: broadcast::Receiver<DispatcherEvent>,
        session: ChatSession,
    }

    impl Harness {
        fn new() -> Self {
            let transport = Arc::new(MemoryTransport::new());
            let bus = EventBus::new(64);
            let events = bus.subscribe();
            let ctx = Context::new(transport.clone(), bus);
            let descriptor = ChannelDescriptor {
                path: ChannelPath::new("/chan/bob"),
                channel_type: ChannelType::Text,
                handle_type: HandleType::Contact,
                handle: Handle(2),
                target_id: Some("bob@example.org".into()),
                requested: false,
                has_group_interface: false,
            };
            let session = ChatSession::new(
                AccountId::new("alice"),
                ConnectionId::new("conn/a"),
                SELF,
                descriptor,
            );
            Self {
                transport,
                ctx,
                events,
                session,
            }
        }

        fn know(&mut self, handle: u32) {
            let contact = ContactInfo {
                handle: Handle(handle),
                id: format!("user{handle}@example.org"),
                alias: None,
            };
            self.transport.add_contact(contact.clone());
            self.ctx
                .contacts
                .insert(&ConnectionId::new("conn/a"), vec![contact]);
        }

        /// Drive every in-flight call to completion, routing chat replies.
        async fn settle(&mut self) {
            while let Some(completion) = self.ctx.next_completion().await {
                match completion {
                    Completion::Chat { completion, .. } => {
                        self.session.on_completion(completion, &mut self.ctx)
                    }
                    Completion::ContactsResolved {
                        connection,
                        requested,
                        result,
                    } => {
                        self.ctx.contacts.finish_lookup(&connection, &requested);
                        let resolved = self.ctx.contacts.insert(&connection, result.unwrap());
                        self.session.on_contacts_resolved(&resolved, &mut self.ctx);
                    }
                    _ => {}
                }
            }
        }

        fn received(&mut self) -> Vec<(Option<u32>, String)> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let DispatcherEvent::MessageReceived { message, .. } = event {
                    out.push((message.id, message.body));
                }
            }
            out
        }
    }

    fn msg(id: u32, sender: u32, body: &str) -> PendingMessage {
        PendingMessage {
            id,
            timestamp: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap(),
            sender: Handle(sender),
            message_type: MessageType::Normal,
            flags: MessageFlags::default(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_backlog_then_deferred_without_duplicates() {
        let mut h = Harness::new();
        h.know(2);
        let path = h.session.path().clone();
        h.transport
            .set_pending_messages(&path, vec![msg(1, 2, "one"), msg(2, 2, "two")]);

        h.session.start(&mut h.ctx);
        // Arrives while listing: one overlaps the backlog, one is new.
        h.session.on_message_received(msg(2, 2, "two"), &mut h.ctx);
        h.session.on_message_received(msg(3, 2, "three"), &mut h.ctx);
        assert!(h.received().is_empty());

        h.settle().await;
        assert!(h.session.is_ready());
        assert_eq!(
            h.received(),
            vec![
                (Some(1), "one".to_string()),
                (Some(2), "two".to_string()),
                (Some(3), "three".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_fifo_holds_behind_unresolved_sender() {
        let mut h = Harness::new();
        h.know(2);
        h.session.start(&mut h.ctx);
        h.settle().await;

        h.session.on_message_received(msg(1, 2, "known"), &mut h.ctx);
        h.session.on_message_received(msg(2, 7, "stranger"), &mut h.ctx);
        h.session.on_message_received(msg(3, 2, "known again"), &mut h.ctx);
        h.settle().await;

        // Handle 7 is unknown to the transport: the queue stays blocked.
        assert_eq!(h.received(), vec![(Some(1), "known".to_string())]);
        assert_eq!(h.session.queued_len(), 2);
        assert_eq!(h.transport.calls_to("get_contacts").len(), 1);

        let carol = ContactInfo {
            handle: Handle(7),
            id: "carol@example.org".into(),
            alias: Some("Carol".into()),
        };
        let resolved = h
            .ctx
            .contacts
            .insert(&ConnectionId::new("conn/a"), vec![carol]);
        h.session.on_contacts_resolved(&resolved, &mut h.ctx);

        assert_eq!(
            h.received(),
            vec![
                (Some(2), "stranger".to_string()),
                (Some(3), "known again".to_string()),
            ]
        );
        assert_eq!(h.session.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_empty_non_text_message_is_acked_not_shown() {
        let mut h = Harness::new();
        h.know(2);
        h.session.start(&mut h.ctx);
        h.settle().await;

        let mut m = msg(9, 2, "");
        m.flags.non_text_content = true;
        h.session.on_message_received(m, &mut h.ctx);
        h.settle().await;

        assert!(h.received().is_empty());
        assert_eq!(
            h.transport.calls_to("acknowledge_pending_messages"),
            vec![RecordedCall::AcknowledgePendingMessages(
                ChannelPath::new("/chan/bob"),
                vec![9]
            )]
        );
    }

    #[tokio::test]
    async fn test_acknowledge_batch_single_call() {
        let mut h = Harness::new();
        h.know(2);
        h.know(1);
        h.session.start(&mut h.ctx);
        h.settle().await;

        for id in 1..=3 {
            h.session.on_message_received(msg(id, 2, "hi"), &mut h.ctx);
        }
        // Our own message, replayed from another client.
        h.session.on_message_received(msg(4, 1, "mine"), &mut h.ctx);
        h.settle().await;
        h.transport.clear_calls();

        let removed = h.session.acknowledge(&[1, 2, 3, 4], &mut h.ctx);
        h.settle().await;

        assert_eq!(removed, 4);
        assert_eq!(
            h.transport.calls(),
            vec![RecordedCall::AcknowledgePendingMessages(
                ChannelPath::new("/chan/bob"),
                vec![1, 2, 3]
            )]
        );
        assert_eq!(h.session.pending_messages().count(), 0);
    }

    #[tokio::test]
    async fn test_acknowledge_only_self_issues_no_call() {
        let mut h = Harness::new();
        h.know(1);
        h.session.start(&mut h.ctx);
        h.settle().await;

        h.session.on_message_received(msg(5, 1, "mine"), &mut h.ctx);
        h.settle().await;
        h.transport.clear_calls();

        assert_eq!(h.session.acknowledge(&[5, 6], &mut h.ctx), 1);
        h.settle().await;
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_send_error_event() {
        let mut h = Harness::new();
        h.transport.fail("send_message", TransportError::NotAvailable("offline".into()));
        h.session.start(&mut h.ctx);
        h.settle().await;

        h.session.send(OutgoingMessage::normal("hello"), &mut h.ctx);
        h.settle().await;

        let mut errors = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let DispatcherEvent::SendError { message, error, .. } = event {
                errors.push((message.body, error));
            }
        }
        assert_eq!(
            errors,
            vec![(
                "hello".to_string(),
                TransportError::NotAvailable("offline".into())
            )]
        );
        assert_eq!(h.transport.calls_to("send_message").len(), 1);
    }

    #[tokio::test]
    async fn test_sent_echo_is_visible_and_outgoing() {
        let mut h = Harness::new();
        h.know(1);
        h.session.start(&mut h.ctx);
        h.settle().await;

        h.session.on_message_sent(Utc::now(), MessageType::Action, "waves".into(), &mut h.ctx);
        let event = h.events.try_recv().unwrap();
        match event {
            DispatcherEvent::MessageReceived { message, .. } => {
                assert!(message.outgoing);
                assert_eq!(message.id, None);
                assert_eq!(message.sender.handle, SELF);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.session.pending_messages().count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_drops_queue_and_ignores_later_messages() {
        let mut h = Harness::new();
        h.session.start(&mut h.ctx);
        h.settle().await;

        h.session.on_message_received(msg(1, 7, "waiting"), &mut h.ctx);
        h.session.destroy(&mut h.ctx);
        h.session.on_message_received(msg(2, 7, "late"), &mut h.ctx);

        assert_eq!(h.session.state(), ChatSessionState::Closed);
        assert_eq!(h.session.queued_len(), 0);
        let destroyed = std::iter::from_fn(|| h.events.try_recv().ok())
            .filter(|e| matches!(e, DispatcherEvent::ChatDestroyed { .. }))
            .count();
        assert_eq!(destroyed, 1);
    }

    #[test]
    fn test_id() {
        let h = Harness::new();
        assert_eq!(h.session.id(), "alice/bob@example.org");
    }
}
