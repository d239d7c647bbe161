//! Contact metadata cache shared by every component of a dispatcher.
//!
//! A handle is *resolved* once its [`ContactInfo`] is known. Lookups are
//! de-duplicated: a handle already being fetched is never requested twice.

use std::collections::{HashMap, HashSet};

use tidings_shared::protocol::ContactInfo;
use tidings_shared::types::{ConnectionId, Handle};

#[derive(Debug, Default)]
pub struct ContactCache {
    known: HashMap<(ConnectionId, Handle), ContactInfo>,
    in_flight: HashSet<(ConnectionId, Handle)>,
}

impl ContactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, connection: &ConnectionId, handle: Handle) -> Option<&ContactInfo> {
        self.known.get(&(connection.clone(), handle))
    }

    /// The "no handle" sender is always resolved.
    pub fn is_resolved(&self, connection: &ConnectionId, handle: Handle) -> bool {
        handle.is_none() || self.known.contains_key(&(connection.clone(), handle))
    }

    /// Metadata for `handle`, with the anonymous placeholder for [`Handle::NONE`].
    pub fn resolved(&self, connection: &ConnectionId, handle: Handle) -> Option<ContactInfo> {
        if handle.is_none() {
            return Some(ContactInfo::anonymous());
        }
        self.get(connection, handle).cloned()
    }

    /// Best-effort metadata, falling back to a bare handle placeholder.
    pub fn resolved_or_placeholder(&self, connection: &ConnectionId, handle: Handle) -> ContactInfo {
        self.resolved(connection, handle)
            .unwrap_or_else(|| placeholder(handle))
    }

    /// Mark the unresolved handles of `handles` as being fetched and return them.
    pub fn begin_lookup(&mut self, connection: &ConnectionId, handles: &[Handle]) -> Vec<Handle> {
        let mut missing = Vec::new();
        for &handle in handles {
            if self.is_resolved(connection, handle) {
                continue;
            }
            if self.in_flight.insert((connection.clone(), handle)) {
                missing.push(handle);
            }
        }
        missing
    }

    pub fn finish_lookup(&mut self, connection: &ConnectionId, handles: &[Handle]) {
        for &handle in handles {
            self.in_flight.remove(&(connection.clone(), handle));
        }
    }

    /// Store `contacts` and return their handles.
    pub fn insert(&mut self, connection: &ConnectionId, contacts: Vec<ContactInfo>) -> Vec<Handle> {
        contacts
            .into_iter()
            .map(|contact| {
                let handle = contact.handle;
                self.known.insert((connection.clone(), handle), contact);
                handle
            })
            .collect()
    }

    /// Resolve `handles` with placeholders after a failed lookup.
    pub fn insert_placeholders(&mut self, connection: &ConnectionId, handles: &[Handle]) -> Vec<Handle> {
        let contacts = handles
            .iter()
            .filter(|h| !self.is_resolved(connection, **h))
            .map(|h| placeholder(*h))
            .collect();
        self.insert(connection, contacts)
    }

    pub fn forget_connection(&mut self, connection: &ConnectionId) {
        self.known.retain(|(conn, _), _| conn != connection);
        self.in_flight.retain(|(conn, _)| conn != connection);
    }
}

fn placeholder(handle: Handle) -> ContactInfo {
    ContactInfo {
        handle,
        id: handle.to_string(),
        alias: None,
    }
}
