//! Per-dispatcher context handed to every component.
//!
//! Components never await transport calls themselves. They push futures into
//! the context's in-flight set; the dispatcher task polls that set and routes
//! each [`Completion`] back to its owner, if the owner still exists.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::oneshot;

use tidings_net::{Transport, TransportResult};
use tidings_shared::protocol::{
    AccountInfo, ChannelDescriptor, ChannelRequest, ConnectionInfo, ContactInfo,
};
use tidings_shared::types::{AccountId, ChannelPath, ConnectionId, Handle, TransferId};

use crate::chat::ChatCompletion;
use crate::contact_list::ListCompletion;
use crate::contacts::ContactCache;
use crate::error::DispatcherError;
use crate::events::EventBus;
use crate::transfer::TransferCompletion;

/// Who is waiting for a channel request to resolve.
#[derive(Debug)]
pub enum RequestOrigin {
    /// A caller awaiting the channel path.
    Caller(oneshot::Sender<Result<ChannelPath, DispatcherError>>),
    /// An outgoing file transfer waiting for its channel.
    Transfer(TransferId),
    /// Nobody; failures are only logged.
    Detached,
}

/// A channel request raised by a component, executed by the dispatcher.
#[derive(Debug)]
pub struct InternalRequest {
    pub account: AccountId,
    pub request: ChannelRequest,
    pub origin: RequestOrigin,
}

/// Handles to resolve before a contact-id based action can proceed.
#[derive(Debug)]
pub enum HandlePurpose {
    AddContact { message: String },
    ChatWith {
        contact_id: String,
        origin: RequestOrigin,
    },
}

/// Result of an in-flight transport call, routed back to its owner.
pub enum Completion {
    AccountsListed(TransportResult<Vec<AccountInfo>>),
    ConnectionRequested {
        account: AccountId,
        result: TransportResult<ConnectionInfo>,
    },
    ChannelsListed {
        connection: ConnectionId,
        result: TransportResult<Vec<ChannelDescriptor>>,
    },
    ChannelsSubscribed {
        connection: ConnectionId,
        result: TransportResult<()>,
    },
    ContactsResolved {
        connection: ConnectionId,
        requested: Vec<Handle>,
        result: TransportResult<Vec<ContactInfo>>,
    },
    ChannelRequested {
        connection: ConnectionId,
        request_id: u64,
        result: TransportResult<ChannelDescriptor>,
    },
    HandlesRequested {
        account: AccountId,
        purpose: HandlePurpose,
        result: TransportResult<Vec<Handle>>,
    },
    Chat {
        channel: ChannelPath,
        completion: ChatCompletion,
    },
    ContactList {
        connection: ConnectionId,
        completion: ListCompletion,
    },
    Transfer {
        transfer: TransferId,
        completion: TransferCompletion,
    },
    /// Fire-and-forget call whose failure is only logged.
    Logged {
        operation: &'static str,
        channel: ChannelPath,
        result: TransportResult<()>,
    },
}

pub struct Context {
    transport: Arc<dyn Transport>,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    requests: Vec<InternalRequest>,
    pub events: EventBus,
    pub contacts: ContactCache,
}

impl Context {
    pub fn new(transport: Arc<dyn Transport>, events: EventBus) -> Self {
        Self {
            transport,
            in_flight: FuturesUnordered::new(),
            requests: Vec::new(),
            events,
            contacts: ContactCache::new(),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.in_flight.push(fut.boxed());
    }

    /// Spawn a call whose only interesting outcome is a logged failure.
    pub fn spawn_logged<F>(&mut self, operation: &'static str, channel: ChannelPath, fut: F)
    where
        F: Future<Output = TransportResult<()>> + Send + 'static,
    {
        self.spawn(async move {
            Completion::Logged {
                operation,
                channel,
                result: fut.await,
            }
        });
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Next finished call. Returns `None` immediately when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.in_flight.next().await
    }

    /// Fetch metadata for whichever of `handles` is neither known nor being fetched.
    pub fn request_contacts(&mut self, connection: &ConnectionId, handles: &[Handle]) {
        let missing = self.contacts.begin_lookup(connection, handles);
        if missing.is_empty() {
            return;
        }

        tracing::debug!(connection = %connection, count = missing.len(), "Resolving contacts");
        let transport = self.transport();
        let connection = connection.clone();
        self.spawn(async move {
            let result = transport.get_contacts(&connection, &missing).await;
            Completion::ContactsResolved {
                connection,
                requested: missing,
                result,
            }
        });
    }

    /// Ask the dispatcher to create a channel on behalf of a component.
    pub fn push_request(&mut self, account: AccountId, request: ChannelRequest, origin: RequestOrigin) {
        self.requests.push(InternalRequest {
            account,
            request,
            origin,
        });
    }

    pub fn take_requests(&mut self) -> Vec<InternalRequest> {
        std::mem::take(&mut self.requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidings_net::{MemoryTransport, RecordedCall};

    #[tokio::test]
    async fn test_request_contacts_issues_one_call() {
        let transport = Arc::new(MemoryTransport::new());
        let mut ctx = Context::new(transport.clone(), EventBus::new(8));
        let conn = ConnectionId::new("conn/1");

        ctx.request_contacts(&conn, &[Handle(2), Handle::NONE]);
        ctx.request_contacts(&conn, &[Handle(2)]);
        assert_eq!(ctx.in_flight_len(), 1);

        match ctx.next_completion().await {
            Some(Completion::ContactsResolved { requested, .. }) => {
                assert_eq!(requested, vec![Handle(2)])
            }
            _ => panic!("expected contacts completion"),
        }
        assert!(ctx.next_completion().await.is_none());
        assert_eq!(
            transport.calls(),
            vec![RecordedCall::GetContacts(conn, vec![Handle(2)])]
        );
    }
}
