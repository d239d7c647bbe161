//! Account to connection bookkeeping.
//!
//! The registry is the only writer of this map. Everything bound to a
//! connection refers to it by [`ConnectionId`] and looks it up here.

use std::collections::HashMap;

use tidings_shared::protocol::ConnectionInfo;
use tidings_shared::types::{AccountId, ConnectionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// `request_connection` is in flight.
    Requesting,
    Ready,
}

#[derive(Debug, Clone)]
struct AccountEntry {
    phase: ConnectionPhase,
    connection: Option<ConnectionInfo>,
    subscribed: bool,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    accounts: HashMap<AccountId, AccountEntry>,
    by_connection: HashMap<ConnectionId, AccountId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start acquiring a connection. Returns `false` if one exists or is pending.
    pub fn begin_connect(&mut self, account: &AccountId) -> bool {
        if self.accounts.contains_key(account) {
            return false;
        }
        self.accounts.insert(
            account.clone(),
            AccountEntry {
                phase: ConnectionPhase::Requesting,
                connection: None,
                subscribed: false,
            },
        );
        true
    }

    /// Register the acquired connection. Returns `false` for a stale reply
    /// (the account went away while the request was in flight).
    pub fn connection_ready(&mut self, info: ConnectionInfo) -> bool {
        let Some(entry) = self.accounts.get_mut(&info.account) else {
            return false;
        };
        if entry.phase != ConnectionPhase::Requesting {
            return false;
        }
        entry.phase = ConnectionPhase::Ready;
        self.by_connection
            .insert(info.id.clone(), info.account.clone());
        entry.connection = Some(info);
        true
    }

    /// The request failed; the account counts as not connected.
    pub fn connection_failed(&mut self, account: &AccountId) {
        if matches!(
            self.accounts.get(account),
            Some(entry) if entry.phase == ConnectionPhase::Requesting
        ) {
            self.accounts.remove(account);
        }
    }

    /// Record the new-channel subscription. Returns `true` only the first time.
    pub fn mark_subscribed(&mut self, connection: &ConnectionId) -> bool {
        let Some(account) = self.by_connection.get(connection) else {
            return false;
        };
        match self.accounts.get_mut(account) {
            Some(entry) if !entry.subscribed => {
                entry.subscribed = true;
                true
            }
            _ => false,
        }
    }

    pub fn remove_account(&mut self, account: &AccountId) -> Option<ConnectionInfo> {
        let entry = self.accounts.remove(account)?;
        let info = entry.connection?;
        self.by_connection.remove(&info.id);
        Some(info)
    }

    pub fn remove_connection(&mut self, connection: &ConnectionId) -> Option<ConnectionInfo> {
        let account = self.by_connection.get(connection)?.clone();
        self.remove_account(&account)
    }

    pub fn phase(&self, account: &AccountId) -> Option<ConnectionPhase> {
        self.accounts.get(account).map(|e| e.phase)
    }

    pub fn connection(&self, account: &AccountId) -> Option<&ConnectionInfo> {
        self.accounts.get(account)?.connection.as_ref()
    }

    pub fn connection_info(&self, connection: &ConnectionId) -> Option<&ConnectionInfo> {
        let account = self.by_connection.get(connection)?;
        self.connection(account)
    }

    pub fn account_for(&self, connection: &ConnectionId) -> Option<&AccountId> {
        self.by_connection.get(connection)
    }

    pub fn connected_accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> = self
            .accounts
            .iter()
            .filter(|(_, e)| e.phase == ConnectionPhase::Ready)
            .map(|(a, _)| a.clone())
            .collect();
        accounts.sort();
        accounts
    }
}
