//! Dispatch operations and the per-connection tables that track them.
//!
//! Every new channel that is not a contact list becomes a
//! [`DispatchOperation`]:
//!
//! ```text
//! Preparing ──ready──► Pending ──start──► Approving ──approve──► Dispatching ──claim──► Claimed
//!                                    └────────────(requested / pre-approved)──┘
//! ```
//!
//! Channels of a type for which a local request is still waiting for its
//! reply are held back as *outstanding*, so a channel we asked for is never
//! offered to the user for approval.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;

use tidings_shared::protocol::ChannelDescriptor;
use tidings_shared::types::{AccountId, ChannelPath, ChannelType, ConnectionId, TransferId};

use crate::classifier::{ChannelKind, Classification, Route};
use crate::context::RequestOrigin;
use crate::events::OperationInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// The handler for the channel is still loading.
    Preparing,
    Pending,
    Approving,
    Dispatching,
    Claimed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("operation already claimed")]
    AlreadyClaimed,

    #[error("operation is still preparing")]
    NotReady,
}

#[derive(Debug, Clone)]
pub struct DispatchOperation {
    descriptor: ChannelDescriptor,
    account: AccountId,
    connection: ConnectionId,
    kind: ChannelKind,
    incoming: bool,
    approved: bool,
    state: OperationState,
    transfer: Option<TransferId>,
}

impl DispatchOperation {
    pub fn new(
        descriptor: ChannelDescriptor,
        account: AccountId,
        connection: ConnectionId,
        classification: Classification,
    ) -> Self {
        Self {
            descriptor,
            account,
            connection,
            kind: classification.kind,
            incoming: classification.incoming,
            approved: classification.route == Route::Dispatch,
            state: OperationState::Preparing,
            transfer: None,
        }
    }

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

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    pub fn channel_type(&self) -> ChannelType {
        self.descriptor.channel_type
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn transfer(&self) -> Option<TransferId> {
        self.transfer
    }

    pub fn set_transfer(&mut self, transfer: TransferId) {
        self.transfer = Some(transfer);
    }

    /// Preparing → Pending. Returns `true` on the transition.
    pub fn mark_ready(&mut self) -> bool {
        if self.state != OperationState::Preparing {
            return false;
        }
        self.state = OperationState::Pending;
        true
    }

    /// Pending → Approving or Dispatching, depending on approval.
    pub fn start(&mut self) -> OperationState {
        if self.state == OperationState::Pending {
            self.state = if self.approved {
                OperationState::Dispatching
            } else {
                OperationState::Approving
            };
        }
        self.state
    }

    /// Approve the operation. Returns `true` if it moved to Dispatching now.
    ///
    /// Approving a not yet started operation pre-approves it.
    pub fn approve(&mut self) -> Result<bool, OperationError> {
        match self.state {
            OperationState::Claimed => Err(OperationError::AlreadyClaimed),
            OperationState::Approving => {
                self.approved = true;
                self.state = OperationState::Dispatching;
                Ok(true)
            }
            OperationState::Preparing | OperationState::Pending => {
                self.approved = true;
                Ok(false)
            }
            OperationState::Dispatching => Ok(false),
        }
    }

    pub fn claim(&mut self) -> Result<(), OperationError> {
        match self.state {
            OperationState::Claimed => Err(OperationError::AlreadyClaimed),
            OperationState::Preparing => Err(OperationError::NotReady),
            _ => {
                self.state = OperationState::Claimed;
                Ok(())
            }
        }
    }

    pub fn info(&self) -> OperationInfo {
        OperationInfo {
            channel: self.descriptor.path.clone(),
            account: self.account.clone(),
            connection: self.connection.clone(),
            channel_type: self.descriptor.channel_type,
            handle_type: self.descriptor.handle_type,
            handle: self.descriptor.handle,
            target_id: self.descriptor.target_id.clone(),
            incoming: self.incoming,
            state: self.state,
            transfer: self.transfer,
        }
    }
}

/// A local channel request waiting for its reply or for its channel to be ready.
#[derive(Debug)]
pub struct OutstandingRequest {
    pub id: u64,
    pub channel_type: ChannelType,
    /// Filled in once the transport replies.
    pub path: Option<ChannelPath>,
    pub origin: RequestOrigin,
}

/// Dispatch bookkeeping of one connection.
#[derive(Debug, Default)]
pub struct OperationTable {
    dispatched: HashSet<ChannelPath>,
    dispatching: HashMap<ChannelPath, DispatchOperation>,
    outstanding_channels: HashMap<ChannelPath, DispatchOperation>,
    requests: Vec<OutstandingRequest>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The path is already tracked in some stage.
    pub fn knows(&self, path: &ChannelPath) -> bool {
        self.dispatched.contains(path)
            || self.dispatching.contains_key(path)
            || self.outstanding_channels.contains_key(path)
    }

    /// No request of this channel type is still waiting for its reply.
    pub fn can_start(&self, channel_type: ChannelType) -> bool {
        !self
            .requests
            .iter()
            .any(|r| r.path.is_none() && r.channel_type == channel_type)
    }

    pub fn insert_dispatching(&mut self, op: DispatchOperation) {
        self.dispatching.insert(op.path().clone(), op);
    }

    pub fn hold(&mut self, op: DispatchOperation) {
        self.outstanding_channels.insert(op.path().clone(), op);
    }

    pub fn is_held(&self, path: &ChannelPath) -> bool {
        self.outstanding_channels.contains_key(path)
    }

    /// Move a held channel to dispatching. Returns `false` if it was not held.
    pub fn unhold(&mut self, path: &ChannelPath) -> bool {
        match self.outstanding_channels.remove(path) {
            Some(op) => {
                self.insert_dispatching(op);
                true
            }
            None => false,
        }
    }

    /// Move every held channel whose type may now start to dispatching.
    pub fn release_startable(&mut self) -> Vec<ChannelPath> {
        let startable: Vec<ChannelPath> = self
            .outstanding_channels
            .iter()
            .filter(|(_, op)| self.can_start(op.channel_type()))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &startable {
            self.unhold(path);
        }
        startable
    }

    pub fn operation(&self, path: &ChannelPath) -> Option<&DispatchOperation> {
        self.dispatching
            .get(path)
            .or_else(|| self.outstanding_channels.get(path))
    }

    pub fn operation_mut(&mut self, path: &ChannelPath) -> Option<&mut DispatchOperation> {
        match self.dispatching.get_mut(path) {
            Some(op) => Some(op),
            None => self.outstanding_channels.get_mut(path),
        }
    }

    pub fn is_dispatched(&self, path: &ChannelPath) -> bool {
        self.dispatched.contains(path)
    }

    /// Record a channel handled without an operation (contact lists).
    pub fn insert_dispatched(&mut self, path: ChannelPath) {
        self.dispatched.insert(path);
    }

    /// Claimed: the operation is done with, only the path is remembered.
    pub fn mark_dispatched(&mut self, path: &ChannelPath) -> Option<DispatchOperation> {
        let op = self.dispatching.remove(path)?;
        self.dispatched.insert(path.clone());
        Some(op)
    }

    /// Forget the path in every stage. Returns the operation if one was live.
    pub fn remove(&mut self, path: &ChannelPath) -> Option<DispatchOperation> {
        self.dispatched.remove(path);
        self.dispatching
            .remove(path)
            .or_else(|| self.outstanding_channels.remove(path))
    }

    pub fn paths(&self) -> Vec<ChannelPath> {
        self.dispatched
            .iter()
            .chain(self.dispatching.keys())
            .chain(self.outstanding_channels.keys())
            .cloned()
            .collect()
    }

    // -- Requests --

    pub fn push_request(&mut self, request: OutstandingRequest) {
        self.requests.push(request);
    }

    pub fn take_request(&mut self, id: u64) -> Option<OutstandingRequest> {
        let idx = self.requests.iter().position(|r| r.id == id)?;
        Some(self.requests.remove(idx))
    }

    pub fn request_mut(&mut self, id: u64) -> Option<&mut OutstandingRequest> {
        self.requests.iter_mut().find(|r| r.id == id)
    }

    /// The transfer waiting for `path`, if the request came from one.
    pub fn transfer_for(&self, path: &ChannelPath) -> Option<TransferId> {
        self.requests.iter().find_map(|r| match r.origin {
            RequestOrigin::Transfer(id) if r.path.as_ref() == Some(path) => Some(id),
            _ => None,
        })
    }

    /// Remove and return every request resolved to `path`.
    pub fn take_requests_for(&mut self, path: &ChannelPath) -> Vec<OutstandingRequest> {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.requests)
            .into_iter()
            .partition(|r| r.path.as_ref() == Some(path));
        self.requests = rest;
        matching
    }

    pub fn drain_requests(&mut self) -> Vec<OutstandingRequest> {
        std::mem::take(&mut self.requests)
    }
}
