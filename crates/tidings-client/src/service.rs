//! The dispatcher task and the handle used to talk to it.
//!
//! [`spawn_dispatcher`] moves a [`Dispatcher`] onto its own tokio task. The
//! task multiplexes commands from [`DispatcherHandle`]s, transport
//! notifications, completions of in-flight transport calls and the chatroom
//! save deadline in a single `select!` loop.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use tidings_net::{Transport, TransportEvent};
use tidings_shared::protocol::{ChannelRequest, ContactInfo, OutgoingMessage};
use tidings_shared::types::{AccountId, ChannelPath, ChatState, Handle, TransferId};
use tidings_store::ChatroomStore;

use crate::config::DispatcherConfig;
use crate::context::RequestOrigin;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatcherError, Result};
use crate::events::{ChatMessage, ChatroomInfo, DispatcherEvent, EventBus};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands sent *to* the dispatcher task.
#[derive(Debug)]
pub enum DispatcherCommand {
    // -- Channels --
    /// Answered once the channel is ready, or with the failure.
    RequestChannel {
        account: AccountId,
        request: ChannelRequest,
        reply: Reply<ChannelPath>,
    },
    ChatWithContact {
        account: AccountId,
        contact_id: String,
        reply: Reply<ChannelPath>,
    },
    JoinRoom {
        account: AccountId,
        room: String,
        reply: Reply<ChannelPath>,
    },
    Approve {
        channel: ChannelPath,
        reply: Reply<()>,
    },
    Reject {
        channel: ChannelPath,
        reply: Reply<()>,
    },
    Claim {
        channel: ChannelPath,
        reply: Reply<()>,
    },
    CloseChannel {
        channel: ChannelPath,
        reply: Reply<()>,
    },

    // -- Chat --
    SendMessage {
        channel: ChannelPath,
        message: OutgoingMessage,
        reply: Reply<()>,
    },
    Acknowledge {
        channel: ChannelPath,
        ids: Vec<u32>,
        reply: Reply<usize>,
    },
    SetChatState {
        channel: ChannelPath,
        state: ChatState,
        reply: Reply<()>,
    },
    PendingMessages {
        channel: ChannelPath,
        reply: Reply<Vec<ChatMessage>>,
    },

    // -- Contact list --
    AddContact {
        account: AccountId,
        contact_id: String,
        message: String,
        reply: Reply<()>,
    },
    RemoveContact {
        account: AccountId,
        contact: Handle,
        message: String,
        reply: Reply<()>,
    },
    AcceptPending {
        account: AccountId,
        contact: Handle,
        reply: Reply<()>,
    },
    RejectPending {
        account: AccountId,
        contact: Handle,
        reply: Reply<()>,
    },
    AddToGroup {
        account: AccountId,
        contact: Handle,
        group: String,
        reply: Reply<()>,
    },
    RemoveFromGroup {
        account: AccountId,
        contact: Handle,
        group: String,
        reply: Reply<()>,
    },
    RenameGroup {
        account: AccountId,
        old: String,
        new: String,
        reply: Reply<bool>,
    },
    Members {
        account: AccountId,
        reply: Reply<Vec<ContactInfo>>,
    },
    Pendings {
        account: AccountId,
        reply: Reply<Vec<(ContactInfo, String)>>,
    },
    Groups {
        account: AccountId,
        reply: Reply<Vec<String>>,
    },

    // -- File transfers --
    SendFile {
        account: AccountId,
        contact: Handle,
        source: PathBuf,
        reply: Reply<TransferId>,
    },
    SetTransferDestination {
        transfer: TransferId,
        destination: PathBuf,
        use_hash: bool,
        reply: Reply<()>,
    },
    AcceptTransfer {
        transfer: TransferId,
        reply: Reply<()>,
    },
    CancelTransfer {
        transfer: TransferId,
        reply: Reply<bool>,
    },

    // -- Chatrooms --
    AddChatroom {
        account: AccountId,
        room: String,
        name: String,
        auto_connect: bool,
        reply: oneshot::Sender<bool>,
    },
    RemoveChatroom {
        account: AccountId,
        room: String,
        reply: oneshot::Sender<bool>,
    },
    SetChatroomFavorite {
        account: AccountId,
        room: String,
        favorite: bool,
        reply: oneshot::Sender<bool>,
    },
    SetChatroomAutoConnect {
        account: AccountId,
        room: String,
        auto_connect: bool,
        reply: oneshot::Sender<bool>,
    },
    Chatrooms {
        account: Option<AccountId>,
        reply: oneshot::Sender<Vec<ChatroomInfo>>,
    },
    StartRoomListing {
        channel: ChannelPath,
        reply: Reply<()>,
    },
    StopRoomListing {
        channel: ChannelPath,
        reply: Reply<()>,
    },

    ConnectedAccounts(oneshot::Sender<Vec<AccountId>>),
    /// Flush pending saves and stop the task.
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the dispatcher task. Cheap to clone.
#[derive(Clone)]
pub struct DispatcherHandle {
    cmd_tx: mpsc::Sender<DispatcherCommand>,
    events: EventBus,
}

/// Spawn the dispatcher task.
///
/// `events` is the notification stream of `transport`. The task stops on
/// [`DispatcherHandle::shutdown`] or once every handle is dropped.
pub fn spawn_dispatcher(
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    config: DispatcherConfig,
    store: Option<Box<dyn ChatroomStore>>,
) -> (DispatcherHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity);
    let dispatcher = Dispatcher::new(transport, config, store);
    let handle = DispatcherHandle {
        cmd_tx,
        events: dispatcher.events().clone(),
    };
    let task = tokio::spawn(run(dispatcher, cmd_rx, events));
    (handle, task)
}

async fn run(
    mut dispatcher: Dispatcher,
    mut cmd_rx: mpsc::Receiver<DispatcherCommand>,
    mut event_rx: mpsc::Receiver<TransportEvent>,
) {
    dispatcher.start();
    info!("Dispatcher started");

    let mut events_open = true;
    let mut shutdown_reply = None;

    loop {
        let in_flight = dispatcher.has_in_flight();
        let deadline = dispatcher.chatroom_save_deadline();

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(DispatcherCommand::Shutdown(reply)) => {
                        info!("Dispatcher shutdown requested");
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(cmd) => handle_command(&mut dispatcher, cmd),
                    None => {
                        info!("All dispatcher handles dropped, shutting down");
                        break;
                    }
                }
            }

            event = event_rx.recv(), if events_open => {
                match event {
                    Some(event) => dispatcher.handle_event(event),
                    None => {
                        warn!("Transport notification stream closed");
                        events_open = false;
                    }
                }
            }

            Some(completion) = dispatcher.next_completion(), if in_flight => {
                dispatcher.handle_completion(completion);
            }

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                debug!("Chatroom save deadline reached");
                dispatcher.flush_chatrooms();
            }
        }
    }

    dispatcher.flush_chatrooms();
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
    info!("Dispatcher loop terminated");
}

fn handle_command(dispatcher: &mut Dispatcher, cmd: DispatcherCommand) {
    match cmd {
        DispatcherCommand::RequestChannel {
            account,
            request,
            reply,
        } => dispatcher.request_channel(account, request, RequestOrigin::Caller(reply)),
        DispatcherCommand::ChatWithContact {
            account,
            contact_id,
            reply,
        } => dispatcher.chat_with_contact(account, contact_id, RequestOrigin::Caller(reply)),
        DispatcherCommand::JoinRoom {
            account,
            room,
            reply,
        } => dispatcher.join_room(account, room, RequestOrigin::Caller(reply)),
        DispatcherCommand::Approve { channel, reply } => {
            let _ = reply.send(dispatcher.approve(&channel));
        }
        DispatcherCommand::Reject { channel, reply } => {
            let _ = reply.send(dispatcher.reject(&channel));
        }
        DispatcherCommand::Claim { channel, reply } => {
            let _ = reply.send(dispatcher.claim(&channel));
        }
        DispatcherCommand::CloseChannel { channel, reply } => {
            let _ = reply.send(dispatcher.close_channel(&channel));
        }
        DispatcherCommand::SendMessage {
            channel,
            message,
            reply,
        } => {
            let _ = reply.send(dispatcher.send_message(&channel, message));
        }
        DispatcherCommand::Acknowledge {
            channel,
            ids,
            reply,
        } => {
            let _ = reply.send(dispatcher.acknowledge(&channel, &ids));
        }
        DispatcherCommand::SetChatState {
            channel,
            state,
            reply,
        } => {
            let _ = reply.send(dispatcher.set_chat_state(&channel, state));
        }
        DispatcherCommand::PendingMessages { channel, reply } => {
            let _ = reply.send(dispatcher.pending_messages(&channel));
        }
        DispatcherCommand::AddContact {
            account,
            contact_id,
            message,
            reply,
        } => {
            let _ = reply.send(dispatcher.add_contact(account, contact_id, message));
        }
        DispatcherCommand::RemoveContact {
            account,
            contact,
            message,
            reply,
        } => {
            let _ = reply.send(dispatcher.remove_contact(&account, contact, &message));
        }
        DispatcherCommand::AcceptPending {
            account,
            contact,
            reply,
        } => {
            let _ = reply.send(dispatcher.accept_pending(&account, contact));
        }
        DispatcherCommand::RejectPending {
            account,
            contact,
            reply,
        } => {
            let _ = reply.send(dispatcher.reject_pending(&account, contact));
        }
        DispatcherCommand::AddToGroup {
            account,
            contact,
            group,
            reply,
        } => {
            let _ = reply.send(dispatcher.add_to_group(&account, contact, &group));
        }
        DispatcherCommand::RemoveFromGroup {
            account,
            contact,
            group,
            reply,
        } => {
            let _ = reply.send(dispatcher.remove_from_group(&account, contact, &group));
        }
        DispatcherCommand::RenameGroup {
            account,
            old,
            new,
            reply,
        } => {
            let _ = reply.send(dispatcher.rename_group(&account, &old, &new));
        }
        DispatcherCommand::Members { account, reply } => {
            let _ = reply.send(dispatcher.members(&account));
        }
        DispatcherCommand::Pendings { account, reply } => {
            let _ = reply.send(dispatcher.pendings(&account));
        }
        DispatcherCommand::Groups { account, reply } => {
            let _ = reply.send(dispatcher.groups(&account));
        }
        DispatcherCommand::SendFile {
            account,
            contact,
            source,
            reply,
        } => {
            let _ = reply.send(dispatcher.send_file(account, contact, source));
        }
        DispatcherCommand::SetTransferDestination {
            transfer,
            destination,
            use_hash,
            reply,
        } => {
            let _ = reply.send(dispatcher.set_transfer_destination(transfer, destination, use_hash));
        }
        DispatcherCommand::AcceptTransfer { transfer, reply } => {
            let _ = reply.send(dispatcher.accept_transfer(transfer));
        }
        DispatcherCommand::CancelTransfer { transfer, reply } => {
            let _ = reply.send(dispatcher.cancel_transfer(transfer));
        }
        DispatcherCommand::AddChatroom {
            account,
            room,
            name,
            auto_connect,
            reply,
        } => {
            let _ = reply.send(dispatcher.add_chatroom(account, room, name, auto_connect));
        }
        DispatcherCommand::RemoveChatroom {
            account,
            room,
            reply,
        } => {
            let _ = reply.send(dispatcher.remove_chatroom(&account, &room));
        }
        DispatcherCommand::SetChatroomFavorite {
            account,
            room,
            favorite,
            reply,
        } => {
            let _ = reply.send(dispatcher.set_chatroom_favorite(&account, &room, favorite));
        }
        DispatcherCommand::SetChatroomAutoConnect {
            account,
            room,
            auto_connect,
            reply,
        } => {
            let _ = reply.send(dispatcher.set_chatroom_auto_connect(&account, &room, auto_connect));
        }
        DispatcherCommand::Chatrooms { account, reply } => {
            let _ = reply.send(dispatcher.chatrooms(account.as_ref()));
        }
        DispatcherCommand::StartRoomListing { channel, reply } => {
            let _ = reply.send(dispatcher.start_room_listing(&channel));
        }
        DispatcherCommand::StopRoomListing { channel, reply } => {
            let _ = reply.send(dispatcher.stop_room_listing(&channel));
        }
        DispatcherCommand::ConnectedAccounts(reply) => {
            let _ = reply.send(dispatcher.connected_accounts());
        }
        DispatcherCommand::Shutdown(reply) => {
            let _ = reply.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

impl DispatcherHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.events.subscribe()
    }

    async fn send<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> DispatcherCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| DispatcherError::Closed)?;
        rx.await.map_err(|_| DispatcherError::Closed)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> DispatcherCommand) -> Result<T> {
        self.send(make).await?
    }

    // -- Channels --

    pub async fn request_channel(&self, account: AccountId, request: ChannelRequest) -> Result<ChannelPath> {
        self.call(|reply| DispatcherCommand::RequestChannel {
            account,
            request,
            reply,
        })
        .await
    }

    pub async fn chat_with_contact(&self, account: AccountId, contact_id: impl Into<String>) -> Result<ChannelPath> {
        let contact_id = contact_id.into();
        self.call(|reply| DispatcherCommand::ChatWithContact {
            account,
            contact_id,
            reply,
        })
        .await
    }

    pub async fn join_room(&self, account: AccountId, room: impl Into<String>) -> Result<ChannelPath> {
        let room = room.into();
        self.call(|reply| DispatcherCommand::JoinRoom {
            account,
            room,
            reply,
        })
        .await
    }

    pub async fn approve(&self, channel: ChannelPath) -> Result<()> {
        self.call(|reply| DispatcherCommand::Approve { channel, reply })
            .await
    }

    pub async fn reject(&self, channel: ChannelPath) -> Result<()> {
        self.call(|reply| DispatcherCommand::Reject { channel, reply })
            .await
    }

    pub async fn claim(&self, channel: ChannelPath) -> Result<()> {
        self.call(|reply| DispatcherCommand::Claim { channel, reply })
            .await
    }

    pub async fn close_channel(&self, channel: ChannelPath) -> Result<()> {
        self.call(|reply| DispatcherCommand::CloseChannel { channel, reply })
            .await
    }

    // -- Chat --

    pub async fn send_message(&self, channel: ChannelPath, message: OutgoingMessage) -> Result<()> {
        self.call(|reply| DispatcherCommand::SendMessage {
            channel,
            message,
            reply,
        })
        .await
    }

    pub async fn acknowledge(&self, channel: ChannelPath, ids: Vec<u32>) -> Result<usize> {
        self.call(|reply| DispatcherCommand::Acknowledge {
            channel,
            ids,
            reply,
        })
        .await
    }

    pub async fn set_chat_state(&self, channel: ChannelPath, state: ChatState) -> Result<()> {
        self.call(|reply| DispatcherCommand::SetChatState {
            channel,
            state,
            reply,
        })
        .await
    }

    pub async fn pending_messages(&self, channel: ChannelPath) -> Result<Vec<ChatMessage>> {
        self.call(|reply| DispatcherCommand::PendingMessages { channel, reply })
            .await
    }

    // -- Contact list --

    pub async fn add_contact(&self, account: AccountId, contact_id: String, message: String) -> Result<()> {
        self.call(|reply| DispatcherCommand::AddContact {
            account,
            contact_id,
            message,
            reply,
        })
        .await
    }

    pub async fn remove_contact(&self, account: AccountId, contact: Handle, message: String) -> Result<()> {
        self.call(|reply| DispatcherCommand::RemoveContact {
            account,
            contact,
            message,
            reply,
        })
        .await
    }

    pub async fn accept_pending(&self, account: AccountId, contact: Handle) -> Result<()> {
        self.call(|reply| DispatcherCommand::AcceptPending {
            account,
            contact,
            reply,
        })
        .await
    }

    pub async fn reject_pending(&self, account: AccountId, contact: Handle) -> Result<()> {
        self.call(|reply| DispatcherCommand::RejectPending {
            account,
            contact,
            reply,
        })
        .await
    }

    pub async fn add_to_group(&self, account: AccountId, contact: Handle, group: String) -> Result<()> {
        self.call(|reply| DispatcherCommand::AddToGroup {
            account,
            contact,
            group,
            reply,
        })
        .await
    }

    pub async fn remove_from_group(&self, account: AccountId, contact: Handle, group: String) -> Result<()> {
        self.call(|reply| DispatcherCommand::RemoveFromGroup {
            account,
            contact,
            group,
            reply,
        })
        .await
    }

    pub async fn rename_group(&self, account: AccountId, old: String, new: String) -> Result<bool> {
        self.call(|reply| DispatcherCommand::RenameGroup {
            account,
            old,
            new,
            reply,
        })
        .await
    }

    pub async fn members(&self, account: AccountId) -> Result<Vec<ContactInfo>> {
        self.call(|reply| DispatcherCommand::Members { account, reply })
            .await
    }

    pub async fn pendings(&self, account: AccountId) -> Result<Vec<(ContactInfo, String)>> {
        self.call(|reply| DispatcherCommand::Pendings { account, reply })
            .await
    }

    pub async fn groups(&self, account: AccountId) -> Result<Vec<String>> {
        self.call(|reply| DispatcherCommand::Groups { account, reply })
            .await
    }

    // -- File transfers --

    pub async fn send_file(&self, account: AccountId, contact: Handle, source: PathBuf) -> Result<TransferId> {
        self.call(|reply| DispatcherCommand::SendFile {
            account,
            contact,
            source,
            reply,
        })
        .await
    }

    pub async fn set_transfer_destination(&self, transfer: TransferId, destination: PathBuf, use_hash: bool) -> Result<()> {
        self.call(|reply| DispatcherCommand::SetTransferDestination {
            transfer,
            destination,
            use_hash,
            reply,
        })
        .await
    }

    pub async fn accept_transfer(&self, transfer: TransferId) -> Result<()> {
        self.call(|reply| DispatcherCommand::AcceptTransfer { transfer, reply })
            .await
    }

    pub async fn cancel_transfer(&self, transfer: TransferId) -> Result<bool> {
        self.call(|reply| DispatcherCommand::CancelTransfer { transfer, reply })
            .await
    }

    // -- Chatrooms --

    pub async fn add_chatroom(&self, account: AccountId, room: String, name: String, auto_connect: bool) -> Result<bool> {
        self.send(|reply| DispatcherCommand::AddChatroom {
            account,
            room,
            name,
            auto_connect,
            reply,
        })
        .await
    }

    pub async fn remove_chatroom(&self, account: AccountId, room: String) -> Result<bool> {
        self.send(|reply| DispatcherCommand::RemoveChatroom {
            account,
            room,
            reply,
        })
        .await
    }

    pub async fn set_chatroom_favorite(&self, account: AccountId, room: String, favorite: bool) -> Result<bool> {
        self.send(|reply| DispatcherCommand::SetChatroomFavorite {
            account,
            room,
            favorite,
            reply,
        })
        .await
    }

    pub async fn set_chatroom_auto_connect(&self, account: AccountId, room: String, auto_connect: bool) -> Result<bool> {
        self.send(|reply| DispatcherCommand::SetChatroomAutoConnect {
            account,
            room,
            auto_connect,
            reply,
        })
        .await
    }

    pub async fn chatrooms(&self, account: Option<AccountId>) -> Result<Vec<ChatroomInfo>> {
        self.send(|reply| DispatcherCommand::Chatrooms { account, reply })
            .await
    }

    pub async fn start_room_listing(&self, channel: ChannelPath) -> Result<()> {
        self.call(|reply| DispatcherCommand::StartRoomListing { channel, reply })
            .await
    }

    pub async fn stop_room_listing(&self, channel: ChannelPath) -> Result<()> {
        self.call(|reply| DispatcherCommand::StopRoomListing { channel, reply })
            .await
    }

    pub async fn connected_accounts(&self) -> Result<Vec<AccountId>> {
        self.send(DispatcherCommand::ConnectedAccounts).await
    }

    /// Stop the dispatcher task after flushing pending chatroom saves.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(DispatcherCommand::Shutdown).await
    }
}
