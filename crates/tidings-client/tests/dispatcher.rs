use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use tidings_client::events::DispatcherEvent;
use tidings_client::transfer::TransferPhase;
use tidings_client::{spawn_dispatcher, Dispatcher, DispatcherConfig, DispatcherError, RequestOrigin};
use tidings_net::{MemoryTransport, RecordedCall, TransportEvent};
use tidings_shared::error::TransportError;
use tidings_shared::protocol::{
    AccountInfo, ChannelDescriptor, ConnectionInfo, ContactInfo, FileTransferProperties,
    GroupMembers, OutgoingMessage,
};
use tidings_shared::types::{
    AccountId, ChannelPath, ChannelType, ConnectionId, ConnectionStatus, ConnectionStatusReason,
    ContentHashType, Handle, HandleType, MessageType, TransferId, TransferState,
    TransferStateReason,
};
use tidings_store::{ChatroomRecord, ChatroomStore};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

fn alice() -> AccountId {
    AccountId::new("alice")
}

fn conn() -> ConnectionId {
    ConnectionId::new("/conn/alice")
}

fn bob() -> ContactInfo {
    ContactInfo {
        handle: Handle(2),
        id: "bob@example.org".into(),
        alias: Some("Bob".into()),
    }
}

fn transport() -> Arc<MemoryTransport> {
    let transport = Arc::new(MemoryTransport::new());
    transport.add_account(AccountInfo {
        id: alice(),
        enabled: true,
        status: ConnectionStatus::Connected,
    });
    transport.set_connection(ConnectionInfo {
        id: conn(),
        account: alice(),
        self_handle: Handle(1),
    });
    transport.add_contact(bob());
    transport
}

fn text_channel(path: &str, requested: bool) -> ChannelDescriptor {
    ChannelDescriptor {
        path: ChannelPath::new(path),
        channel_type: ChannelType::Text,
        handle_type: HandleType::Contact,
        handle: Handle(2),
        target_id: Some("bob@example.org".into()),
        requested,
        has_group_interface: false,
    }
}

fn list_channel(path: &str, name: &str) -> ChannelDescriptor {
    ChannelDescriptor {
        path: ChannelPath::new(path),
        channel_type: ChannelType::ContactList,
        handle_type: HandleType::List,
        handle: Handle(100),
        target_id: Some(name.into()),
        requested: false,
        has_group_interface: true,
    }
}

fn new_channel(channel: ChannelDescriptor) -> TransportEvent {
    TransportEvent::NewChannel {
        connection: conn(),
        channel,
        suppress_handler: false,
    }
}

async fn connected(transport: &Arc<MemoryTransport>) -> (Dispatcher, broadcast::Receiver<DispatcherEvent>) {
    let mut dispatcher = Dispatcher::new(transport.clone(), DispatcherConfig::default(), None);
    let rx = dispatcher.subscribe();
    dispatcher.start();
    dispatcher.settle().await;
    (dispatcher, rx)
}

fn drain(rx: &mut broadcast::Receiver<DispatcherEvent>) -> Vec<DispatcherEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

fn names(events: &[DispatcherEvent]) -> Vec<&'static str> {
    events.iter().map(DispatcherEvent::name).collect()
}

fn channel_requests(transport: &MemoryTransport) -> Vec<tidings_shared::protocol::ChannelRequest> {
    transport
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            RecordedCall::RequestChannel(_, request) => Some(request),
            _ => None,
        })
        .collect()
}

#[derive(Clone, Default)]
struct CountingStore {
    saved: Arc<Mutex<Vec<Vec<ChatroomRecord>>>>,
    initial: Vec<ChatroomRecord>,
}

impl ChatroomStore for CountingStore {
    fn load(&self) -> tidings_store::Result<Vec<ChatroomRecord>> {
        Ok(self.initial.clone())
    }

    fn save(&self, records: &[ChatroomRecord]) -> tidings_store::Result<()> {
        self.saved.lock().unwrap().push(records.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connections and existing channels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_existing_channels_are_picked_up() {
    let transport = transport();
    transport.add_channel(&conn(), text_channel("/conn/alice/text/1", false));
    transport.add_channel(&conn(), list_channel("/conn/alice/list/subscribe", "subscribe"));
    transport.set_members(
        &ChannelPath::new("/conn/alice/list/subscribe"),
        GroupMembers {
            members: vec![Handle(2)],
            ..GroupMembers::default()
        },
    );

    let (mut dispatcher, mut rx) = connected(&transport).await;

    assert_eq!(dispatcher.connected_accounts(), vec![alice()]);
    assert_eq!(dispatcher.chat_sessions().count(), 1);
    assert!(dispatcher
        .chat_session(&ChannelPath::new("/conn/alice/text/1"))
        .is_some());
    let view = dispatcher.contact_list(&alice()).expect("contact list view");
    assert!(view.is_member(Handle(2)));
    assert_eq!(transport.calls_to("subscribe_channels").len(), 1);

    let events = drain(&mut rx);
    let names = names(&events);
    assert_eq!(names[0], "account-connected");
    assert!(names.contains(&"observe"));
    assert!(names.contains(&"approve"));
    assert!(names.contains(&"members-changed"));

    // The same channel announced again and a repeated status change are no-ops.
    dispatcher.handle_event(new_channel(text_channel("/conn/alice/text/1", false)));
    dispatcher.handle_event(TransportEvent::AccountStatusChanged {
        account: alice(),
        status: ConnectionStatus::Connected,
        reason: ConnectionStatusReason::Requested,
    });
    dispatcher.settle().await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(transport.calls_to("request_connection").len(), 1);
    assert_eq!(transport.calls_to("list_pending_messages").len(), 1);
}

#[tokio::test]
async fn test_stale_connection_reply_is_dropped() {
    let transport = transport();
    let mut dispatcher = Dispatcher::new(transport.clone(), DispatcherConfig::default(), None);
    let mut rx = dispatcher.subscribe();

    dispatcher.handle_event(TransportEvent::AccountStatusChanged {
        account: alice(),
        status: ConnectionStatus::Connected,
        reason: ConnectionStatusReason::Requested,
    });
    dispatcher.handle_event(TransportEvent::AccountStatusChanged {
        account: alice(),
        status: ConnectionStatus::Disconnected,
        reason: ConnectionStatusReason::Requested,
    });
    dispatcher.settle().await;

    assert!(dispatcher.connected_accounts().is_empty());
    assert!(drain(&mut rx).is_empty());
    assert!(transport.calls_to("list_channels").is_empty());
}

#[tokio::test]
async fn test_disconnect_tears_everything_down() {
    let transport = transport();
    transport.add_channel(&conn(), text_channel("/conn/alice/text/1", false));
    let (mut dispatcher, mut rx) = connected(&transport).await;
    drain(&mut rx);

    // A request still in flight when the account goes away.
    let (tx, reply) = oneshot::channel();
    dispatcher.join_room(alice(), "rust@conference.example.org".into(), RequestOrigin::Caller(tx));
    dispatcher.handle_event(TransportEvent::AccountStatusChanged {
        account: alice(),
        status: ConnectionStatus::Disconnected,
        reason: ConnectionStatusReason::NetworkError,
    });

    let err = reply.await.unwrap().unwrap_err();
    assert!(matches!(err, DispatcherError::Transport(TransportError::Disconnected)));

    dispatcher.settle().await;
    assert!(dispatcher.connected_accounts().is_empty());
    assert_eq!(dispatcher.chat_sessions().count(), 0);
    assert!(dispatcher.contact_list(&alice()).is_none());

    let events = drain(&mut rx);
    assert_eq!(
        names(&events),
        vec!["chat-destroyed", "operation-aborted", "account-disconnected"]
    );
    assert!(matches!(
        events.last(),
        Some(DispatcherEvent::AccountDisconnected {
            reason: ConnectionStatusReason::NetworkError,
            ..
        })
    ));
}

#[tokio::test]
async fn test_invalidated_connection_is_torn_down() {
    let transport = transport();
    transport.add_channel(&conn(), text_channel("/conn/alice/text/1", false));
    let (mut dispatcher, mut rx) = connected(&transport).await;
    drain(&mut rx);

    dispatcher.handle_event(TransportEvent::ConnectionInvalidated {
        connection: conn(),
        error: TransportError::Disconnected,
    });
    dispatcher.settle().await;

    assert!(dispatcher.connected_accounts().is_empty());
    assert_eq!(dispatcher.chat_sessions().count(), 0);
    assert!(dispatcher.contact_list(&alice()).is_none());
    let events = drain(&mut rx);
    assert_eq!(
        names(&events),
        vec!["chat-destroyed", "operation-aborted", "account-disconnected"]
    );
    assert!(matches!(
        events.last(),
        Some(DispatcherEvent::AccountDisconnected {
            reason: ConnectionStatusReason::NetworkError,
            ..
        })
    ));

    // Notifications for the dead connection are ignored.
    dispatcher.handle_event(new_channel(text_channel("/conn/alice/text/2", false)));
    dispatcher.settle().await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_failed_connection_waits_for_next_status() {
    let transport = transport();
    transport.fail("request_connection", TransportError::NotAvailable("offline".into()));
    let (mut dispatcher, mut rx) = connected(&transport).await;

    assert!(dispatcher.connected_accounts().is_empty());
    assert!(drain(&mut rx).is_empty());
    assert_eq!(transport.calls_to("request_connection").len(), 1);
    assert!(transport.calls_to("list_channels").is_empty());

    // Nothing retries on its own.
    dispatcher.settle().await;
    assert_eq!(transport.calls_to("request_connection").len(), 1);

    transport.clear_failure("request_connection");
    dispatcher.handle_event(TransportEvent::AccountStatusChanged {
        account: alice(),
        status: ConnectionStatus::Connected,
        reason: ConnectionStatusReason::Requested,
    });
    dispatcher.settle().await;
    assert_eq!(transport.calls_to("request_connection").len(), 2);
    assert_eq!(dispatcher.connected_accounts(), vec![alice()]);
    assert_eq!(names(&drain(&mut rx))[0], "account-connected");
}

// ---------------------------------------------------------------------------
// Dispatch operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_requested_room_is_dispatched_without_approval() {
    let transport = transport();
    let (mut dispatcher, mut rx) = connected(&transport).await;
    drain(&mut rx);

    let (tx, reply) = oneshot::channel();
    dispatcher.join_room(alice(), "rust@conference.example.org".into(), RequestOrigin::Caller(tx));
    dispatcher.settle().await;

    let path = reply.await.unwrap().unwrap();
    let events = drain(&mut rx);
    assert!(!names(&events).contains(&"approve"));
    assert!(events
        .iter()
        .any(|e| matches!(e, DispatcherEvent::Dispatch(info) if info.channel == path)));

    let room = dispatcher
        .chatroom_manager()
        .find(&alice(), "rust@conference.example.org")
        .expect("joined room tracked");
    assert!(!room.favorite);
    assert_eq!(room.channel.as_ref(), Some(&path));

    // Closing a joined, non-favourite room forgets it.
    dispatcher.handle_event(TransportEvent::ChannelClosed {
        channel: path.clone(),
    });
    assert!(dispatcher.chat_session(&path).is_none());
    assert!(dispatcher
        .chatroom_manager()
        .find(&alice(), "rust@conference.example.org")
        .is_none());
    let names = names(&drain(&mut rx));
    assert!(names.contains(&"chat-destroyed"));
    assert!(names.contains(&"chatroom-removed"));
    assert!(names.contains(&"operation-aborted"));
}

#[tokio::test]
async fn test_unsolicited_channel_needs_approval() {
    let transport = transport();
    let (mut dispatcher, mut rx) = connected(&transport).await;
    drain(&mut rx);

    let path = ChannelPath::new("/conn/alice/text/7");
    dispatcher.handle_event(new_channel(text_channel("/conn/alice/text/7", false)));
    dispatcher.settle().await;
    assert_eq!(names(&drain(&mut rx)), vec!["observe", "approve"]);

    dispatcher.approve(&path).unwrap();
    dispatcher.claim(&path).unwrap();
    assert_eq!(names(&drain(&mut rx)), vec!["dispatch", "operation-claimed"]);

    // Claimed operations are gone; closing the channel aborts nothing.
    assert!(dispatcher.claim(&path).is_err());
    dispatcher.handle_event(TransportEvent::ChannelClosed {
        channel: path.clone(),
    });
    assert_eq!(names(&drain(&mut rx)), vec!["chat-destroyed"]);
}

#[tokio::test]
async fn test_reject_closes_the_channel() {
    let transport = transport();
    let (mut dispatcher, mut rx) = connected(&transport).await;

    let path = ChannelPath::new("/conn/alice/text/8");
    dispatcher.handle_event(new_channel(text_channel("/conn/alice/text/8", false)));
    dispatcher.settle().await;
    drain(&mut rx);

    dispatcher.reject(&path).unwrap();
    dispatcher.settle().await;
    assert_eq!(
        transport.calls_to("close_channel"),
        vec![RecordedCall::CloseChannel(path.clone())]
    );

    dispatcher.handle_event(TransportEvent::ChannelClosed { channel: path });
    assert_eq!(names(&drain(&mut rx)), vec!["chat-destroyed", "operation-aborted"]);
}

#[tokio::test]
async fn test_chat_with_contact() {
    let transport = transport();
    let (mut dispatcher, mut rx) = connected(&transport).await;
    drain(&mut rx);

    let desc = text_channel("/conn/alice/text/9", false);
    transport.push_channel_reply(desc.clone());

    let (tx, reply) = oneshot::channel();
    dispatcher.chat_with_contact(alice(), "bob@example.org".into(), RequestOrigin::Caller(tx));
    dispatcher.settle().await;

    assert_eq!(reply.await.unwrap().unwrap(), desc.path);
    let requests = channel_requests(&transport);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].handle, Some(Handle(2)));
    assert_eq!(requests[0].target_id.as_deref(), Some("bob@example.org"));

    let chat = dispatcher.chat_session(&desc.path).expect("chat session");
    assert_eq!(chat.id(), "alice/bob@example.org");
    assert!(!names(&drain(&mut rx)).contains(&"approve"));
}

#[tokio::test]
async fn test_held_channel_is_released_by_reply() {
    let transport = transport();
    let (mut dispatcher, mut rx) = connected(&transport).await;
    drain(&mut rx);

    let desc = text_channel("/conn/alice/text/10", false);
    transport.push_channel_reply(desc.clone());

    let (tx, reply) = oneshot::channel();
    dispatcher.request_channel(
        alice(),
        tidings_shared::protocol::ChannelRequest::new(ChannelType::Text, HandleType::Contact)
            .with_handle(Handle(2)),
        RequestOrigin::Caller(tx),
    );
    // The announcement overtakes the reply: it must not be offered for approval.
    dispatcher.handle_event(new_channel(desc.clone()));
    assert!(dispatcher.chat_session(&desc.path).is_none());

    dispatcher.settle().await;
    assert_eq!(reply.await.unwrap().unwrap(), desc.path);
    assert!(dispatcher.chat_session(&desc.path).is_some());

    let names = names(&drain(&mut rx));
    assert!(names.contains(&"dispatch"));
    assert!(!names.contains(&"approve"));
}

#[tokio::test]
async fn test_failed_request_reaches_the_caller() {
    let transport = transport();
    let (mut dispatcher, _rx) = connected(&transport).await;
    transport.fail("request_channel", TransportError::NotAvailable("room is closed".into()));

    let (tx, reply) = oneshot::channel();
    dispatcher.join_room(alice(), "closed@conference.example.org".into(), RequestOrigin::Caller(tx));
    dispatcher.settle().await;

    let err = reply.await.unwrap().unwrap_err();
    assert!(matches!(err, DispatcherError::Transport(TransportError::NotAvailable(_))));

    let (tx, reply) = oneshot::channel();
    dispatcher.chat_with_contact(alice(), "nobody@example.org".into(), RequestOrigin::Caller(tx));
    dispatcher.settle().await;
    assert!(reply.await.unwrap().is_err());
}

// ---------------------------------------------------------------------------
// Chat and contact list commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_chat_commands_reach_the_transport() {
    let transport = transport();
    let (mut dispatcher, _rx) = connected(&transport).await;

    let path = ChannelPath::new("/conn/alice/text/11");
    dispatcher.handle_event(new_channel(text_channel("/conn/alice/text/11", true)));
    dispatcher.settle().await;

    let message = OutgoingMessage {
        message_type: MessageType::Normal,
        body: "hi".into(),
    };
    dispatcher.send_message(&path, message.clone()).unwrap();
    dispatcher.settle().await;
    assert_eq!(
        transport.calls_to("send_message"),
        vec![RecordedCall::SendMessage(path.clone(), message.clone())]
    );

    let err = dispatcher
        .send_message(&ChannelPath::new("/nowhere"), message)
        .unwrap_err();
    assert!(matches!(err, DispatcherError::UnknownChannel(_)));
}

#[tokio::test]
async fn test_add_contact_resolves_the_id() {
    let transport = transport();
    transport.add_channel(&conn(), list_channel("/conn/alice/list/subscribe", "subscribe"));
    let (mut dispatcher, _rx) = connected(&transport).await;

    dispatcher
        .add_contact(alice(), "bob@example.org".into(), "hello".into())
        .unwrap();
    dispatcher.settle().await;

    assert_eq!(
        transport.calls_to("add_members"),
        vec![RecordedCall::AddMembers(
            ChannelPath::new("/conn/alice/list/subscribe"),
            vec![Handle(2)],
            "hello".into(),
        )]
    );
    assert!(matches!(
        dispatcher.add_contact(AccountId::new("carol"), "x".into(), String::new()),
        Err(DispatcherError::NotConnected(_))
    ));
}

// ---------------------------------------------------------------------------
// File transfers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_outgoing_transfer_end_to_end() {
    let transport = transport();
    let (mut dispatcher, mut rx) = connected(&transport).await;
    drain(&mut rx);

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("hello.txt");
    std::fs::write(&source, b"hello").unwrap();

    let id = dispatcher.send_file(alice(), Handle(2), source.clone()).unwrap();
    dispatcher.settle().await;

    let requests = channel_requests(&transport);
    assert_eq!(requests.len(), 1);
    let file = requests[0].file.as_ref().expect("file properties");
    assert_eq!(file.filename, "hello.txt");
    assert_eq!(file.size, 5);
    assert_eq!(file.content_hash_type, ContentHashType::Md5);
    assert_eq!(file.content_hash.as_deref(), Some(HELLO_MD5));

    let handler = dispatcher.transfer(id).expect("transfer");
    let channel = handler.channel().cloned().expect("channel");
    assert_eq!(handler.phase(), TransferPhase::Ready);
    assert!(transport
        .calls()
        .contains(&RecordedCall::OfferFile(channel.clone(), source)));

    dispatcher.handle_event(TransportEvent::FileTransferStateChanged {
        channel: channel.clone(),
        state: TransferState::Open,
        reason: TransferStateReason::None,
    });
    dispatcher.handle_event(TransportEvent::TransferredBytesChanged {
        channel: channel.clone(),
        bytes: 5,
    });
    dispatcher.handle_event(TransportEvent::FileTransferStateChanged {
        channel: channel.clone(),
        state: TransferState::Completed,
        reason: TransferStateReason::None,
    });
    // The handler is dropped once it is done.
    assert_eq!(dispatcher.transfer_phase(id), None);
    assert!(dispatcher.transfer_for_channel(&channel).is_none());

    let names: Vec<&str> = names(&drain(&mut rx))
        .into_iter()
        .filter(|n| *n != "hashing-progress")
        .collect();
    assert_eq!(
        names,
        vec![
            "hashing-started",
            "hashing-done",
            "transfer-ready",
            "observe",
            "dispatch",
            "operation-claimed",
            "transfer-started",
            "transfer-progress",
            "transfer-done",
        ]
    );
}

/// Offer "hello" on an incoming channel, accept it and report it written.
/// Returns with the transfer verifying the received file.
async fn receive_hello(
    dispatcher: &mut Dispatcher,
    transport: &Arc<MemoryTransport>,
    rx: &mut broadcast::Receiver<DispatcherEvent>,
    dir: &tempfile::TempDir,
) -> (TransferId, ChannelPath) {
    let path = ChannelPath::new("/conn/alice/ft/1");
    transport.set_file_properties(
        &path,
        FileTransferProperties {
            filename: "hello.txt".into(),
            content_type: "text/plain".into(),
            size: 5,
            content_hash_type: ContentHashType::Md5,
            content_hash: Some(HELLO_MD5.to_uppercase()),
            description: None,
            date: None,
            transferred_bytes: 0,
            state: TransferState::Pending,
        },
    );
    dispatcher.handle_event(new_channel(ChannelDescriptor {
        path: path.clone(),
        channel_type: ChannelType::FileTransfer,
        handle_type: HandleType::Contact,
        handle: Handle(2),
        target_id: Some("bob@example.org".into()),
        requested: false,
        has_group_interface: false,
    }));
    dispatcher.settle().await;

    let id = dispatcher.transfer_for_channel(&path).expect("transfer").id();
    assert_eq!(dispatcher.transfer_phase(id), Some(TransferPhase::Ready));
    let events = drain(rx);
    assert!(names(&events).contains(&"transfer-ready"));
    assert!(names(&events).contains(&"approve"));

    let destination = dir.path().join("hello.txt");
    dispatcher.approve(&path).unwrap();
    dispatcher.claim(&path).unwrap();
    dispatcher
        .set_transfer_destination(id, destination.clone(), true)
        .unwrap();
    dispatcher.accept_transfer(id).unwrap();
    dispatcher.settle().await;
    assert!(transport
        .calls()
        .contains(&RecordedCall::AcceptFile(path.clone(), destination.clone(), 0)));

    // The transport writes the file, then reports completion.
    std::fs::write(&destination, b"hello").unwrap();
    dispatcher.handle_event(TransportEvent::FileTransferStateChanged {
        channel: path.clone(),
        state: TransferState::Open,
        reason: TransferStateReason::None,
    });
    dispatcher.handle_event(TransportEvent::FileTransferStateChanged {
        channel: path.clone(),
        state: TransferState::Completed,
        reason: TransferStateReason::None,
    });
    assert_eq!(dispatcher.transfer_phase(id), Some(TransferPhase::Hashing));
    (id, path)
}

#[tokio::test]
async fn test_incoming_transfer_is_verified() {
    let transport = transport();
    let (mut dispatcher, mut rx) = connected(&transport).await;
    let dir = tempfile::tempdir().unwrap();
    let (id, path) = receive_hello(&mut dispatcher, &transport, &mut rx, &dir).await;

    // Closing the channel while verifying does not fail the transfer.
    dispatcher.handle_event(TransportEvent::ChannelClosed { channel: path });
    dispatcher.settle().await;
    assert_eq!(dispatcher.transfer_phase(id), None);
    let names = names(&drain(&mut rx));
    assert!(names.contains(&"transfer-done"));
    assert!(!names.contains(&"transfer-error"));
}

#[tokio::test]
async fn test_verification_survives_disconnect() {
    let transport = transport();
    let (mut dispatcher, mut rx) = connected(&transport).await;
    let dir = tempfile::tempdir().unwrap();
    let (id, _path) = receive_hello(&mut dispatcher, &transport, &mut rx, &dir).await;

    dispatcher.handle_event(TransportEvent::AccountStatusChanged {
        account: alice(),
        status: ConnectionStatus::Disconnected,
        reason: ConnectionStatusReason::NetworkError,
    });
    dispatcher.settle().await;

    assert_eq!(dispatcher.transfer_phase(id), None);
    let names = names(&drain(&mut rx));
    assert!(names.contains(&"account-disconnected"));
    assert!(names.contains(&"transfer-done"));
    assert!(!names.contains(&"transfer-error"));
}

#[tokio::test]
async fn test_cancel_transfer() {
    let transport = transport();
    let (mut dispatcher, _rx) = connected(&transport).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("hello.txt");
    std::fs::write(&source, b"hello").unwrap();
    let id = dispatcher.send_file(alice(), Handle(2), source).unwrap();
    dispatcher.settle().await;

    assert_eq!(dispatcher.transfer_phase(id), Some(TransferPhase::Ready));
    assert!(dispatcher.cancel_transfer(id).unwrap());
    assert!(matches!(
        dispatcher.cancel_transfer(id),
        Err(DispatcherError::UnknownTransfer(_))
    ));
    dispatcher.settle().await;
    assert_eq!(dispatcher.transfer_phase(id), None);
    assert_eq!(transport.calls_to("cancel_file").len(), 1);
}

#[tokio::test]
async fn test_finished_transfers_are_dropped() {
    let transport = transport();
    let (mut dispatcher, mut rx) = connected(&transport).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("hello.txt");
    std::fs::write(&source, b"hello").unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(dispatcher.send_file(alice(), Handle(2), source.clone()).unwrap());
    }
    dispatcher.settle().await;
    assert_eq!(dispatcher.transfers().count(), 5);

    for id in &ids[..4] {
        assert!(dispatcher.cancel_transfer(*id).unwrap());
    }
    dispatcher.settle().await;
    assert_eq!(dispatcher.transfers().count(), 1);
    let channel = dispatcher
        .transfer(ids[4])
        .and_then(|h| h.channel().cloned())
        .expect("channel");
    drain(&mut rx);

    // The last one is still waiting for the peer when the account goes away.
    dispatcher.handle_event(TransportEvent::AccountStatusChanged {
        account: alice(),
        status: ConnectionStatus::Disconnected,
        reason: ConnectionStatusReason::NetworkError,
    });
    dispatcher.settle().await;

    assert_eq!(dispatcher.transfers().count(), 0);
    assert!(dispatcher.transfer_for_channel(&channel).is_none());
    assert!(names(&drain(&mut rx)).contains(&"transfer-error"));
}

// ---------------------------------------------------------------------------
// Chatrooms
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_auto_connect_rooms_are_joined() {
    let transport = transport();
    let mut record = ChatroomRecord::new(alice(), "rust@conference.example.org", "Rust");
    record.auto_connect = true;
    let store = CountingStore {
        initial: vec![record, ChatroomRecord::new(alice(), "quiet@conference.example.org", "Quiet")],
        ..CountingStore::default()
    };

    let mut dispatcher = Dispatcher::new(transport.clone(), DispatcherConfig::default(), Some(Box::new(store)));
    dispatcher.start();
    dispatcher.settle().await;

    let requests = channel_requests(&transport);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].target_id.as_deref(), Some("rust@conference.example.org"));
    assert_eq!(requests[0].handle_type, HandleType::Room);

    let room = dispatcher
        .chatroom_manager()
        .find(&alice(), "rust@conference.example.org")
        .expect("favourite room");
    assert!(room.favorite);
    assert!(room.channel.is_some());
    assert_eq!(dispatcher.chatrooms(Some(&alice())).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_chatroom_saves_are_coalesced() {
    let transport = Arc::new(MemoryTransport::new());
    let store = CountingStore::default();
    let saved = store.saved.clone();
    let (_event_tx, event_rx) = mpsc::channel(8);
    let config = DispatcherConfig {
        save_debounce: Duration::from_secs(4),
        ..DispatcherConfig::default()
    };
    let (handle, task) = spawn_dispatcher(transport, event_rx, config, Some(Box::new(store)));

    assert!(handle
        .add_chatroom(alice(), "a@conference.example.org".into(), "A".into(), false)
        .await
        .unwrap());
    assert!(handle
        .add_chatroom(alice(), "b@conference.example.org".into(), "B".into(), true)
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(saved.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    {
        let saved = saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].len(), 2);
    }

    // A pending save is flushed on shutdown.
    handle
        .remove_chatroom(alice(), "a@conference.example.org".into())
        .await
        .unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap();
    let saved = saved.lock().unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[1].len(), 1);
}
