//! Roster synchronisation for one connection.
//!
//! A [`ContactListView`] aggregates the connection's contact-list channels
//! (subscribe, publish and one channel per group) into a member set, a
//! pending-authorisation set and group memberships. Membership changes are
//! applied in arrival order once every contact they mention is resolved.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::{debug, info, warn};

use tidings_net::TransportResult;
use tidings_shared::protocol::{ChannelDescriptor, ChannelRequest, ContactInfo, GroupMembers, MembersChange};
use tidings_shared::types::{AccountId, ChannelPath, ChannelType, ConnectionId, Handle, HandleType};

use crate::classifier::ListKind;
use crate::context::{Completion, Context};
use crate::events::DispatcherEvent;

/// Transport replies owned by a contact list view.
pub enum ListCompletion {
    MembersListed {
        channel: ChannelPath,
        result: TransportResult<GroupMembers>,
    },
    GroupRequested {
        name: String,
        result: TransportResult<ChannelDescriptor>,
    },
}

/// A membership change waiting for its contacts to resolve.
#[derive(Debug)]
struct QueuedChange {
    kind: ListKind,
    change: MembersChange,
}

impl QueuedChange {
    fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.change
            .added
            .iter()
            .chain(&self.change.removed)
            .chain(&self.change.local_pending)
            .chain(&self.change.remote_pending)
            .copied()
            .filter(|h| !h.is_none())
    }
}

pub struct ContactListView {
    account: AccountId,
    connection: ConnectionId,
    lists: HashMap<ChannelPath, ListKind>,
    subscribe: Option<ChannelPath>,
    publish: Option<ChannelPath>,
    groups: BTreeMap<String, ChannelPath>,
    members: HashSet<Handle>,
    /// Contacts asking to see our presence, with their request message.
    pendings: HashMap<Handle, String>,
    group_members: HashMap<String, HashSet<Handle>>,
    queued: VecDeque<QueuedChange>,
    /// Contacts to add once a group channel exists.
    group_adds: HashMap<String, Vec<Handle>>,
    requested_groups: HashSet<String>,
}

impl ContactListView {
    pub fn new(account: AccountId, connection: ConnectionId) -> Self {
        Self {
            account,
            connection,
            lists: HashMap::new(),
            subscribe: None,
            publish: None,
            groups: BTreeMap::new(),
            members: HashSet::new(),
            pendings: HashMap::new(),
            group_members: HashMap::new(),
            queued: VecDeque::new(),
            group_adds: HashMap::new(),
            requested_groups: HashSet::new(),
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn knows(&self, channel: &ChannelPath) -> bool {
        self.lists.contains_key(channel)
    }

    /// Take ownership of a contact-list channel and fetch its members.
    pub fn attach(&mut self, descriptor: &ChannelDescriptor, kind: ListKind, ctx: &mut Context) {
        let path = descriptor.path.clone();
        if self.lists.contains_key(&path) {
            return;
        }
        debug!(connection = %self.connection, channel = %path, list = ?kind, "Attaching contact list");

        match &kind {
            ListKind::Subscribe => self.subscribe = Some(path.clone()),
            ListKind::Publish => self.publish = Some(path.clone()),
            ListKind::Group(name) => {
                self.groups.insert(name.clone(), path.clone());
                self.requested_groups.remove(name);
                self.group_members.entry(name.clone()).or_default();
                if let Some(handles) = self.group_adds.remove(name) {
                    self.add_members(&path, handles, String::new(), ctx);
                }
            }
            ListKind::Stored | ListKind::Deny | ListKind::Unknown(_) => {}
        }
        self.lists.insert(path.clone(), kind);

        let transport = ctx.transport();
        let connection = self.connection.clone();
        ctx.spawn(async move {
            let result = transport.list_members(&path).await;
            Completion::ContactList {
                connection,
                completion: ListCompletion::MembersListed {
                    channel: path,
                    result,
                },
            }
        });
    }

    /// Forget a channel that went away.
    pub fn detach(&mut self, channel: &ChannelPath, ctx: &mut Context) {
        let Some(kind) = self.lists.remove(channel) else {
            return;
        };
        debug!(connection = %self.connection, channel = %channel, list = ?kind, "Detaching contact list");

        match kind {
            ListKind::Subscribe => self.subscribe = None,
            ListKind::Publish => self.publish = None,
            ListKind::Group(name) => {
                if self.groups.get(&name) == Some(channel) {
                    self.groups.remove(&name);
                }
                let handles = self.group_members.remove(&name).unwrap_or_default();
                let mut handles: Vec<Handle> = handles.into_iter().collect();
                handles.sort();
                for handle in handles {
                    let contact = ctx.contacts.resolved_or_placeholder(&self.connection, handle);
                    ctx.events.emit(DispatcherEvent::GroupsChanged {
                        account: self.account.clone(),
                        contact,
                        group: name.clone(),
                        is_member: false,
                    });
                }
            }
            ListKind::Stored | ListKind::Deny | ListKind::Unknown(_) => {}
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelPath> {
        self.lists.keys()
    }

    // -- Inbound --

    pub fn on_completion(&mut self, completion: ListCompletion, ctx: &mut Context) {
        match completion {
            ListCompletion::MembersListed { channel, result } => match result {
                Ok(snapshot) => self.on_members_changed(&channel, snapshot.into(), ctx),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Failed to list contact list members")
                }
            },
            // A successful reply is attached by the dispatcher like any new channel.
            ListCompletion::GroupRequested { name, result } => {
                if let Err(e) = result {
                    warn!(group = %name, error = %e, "Failed to create group");
                    self.requested_groups.remove(&name);
                    self.group_adds.remove(&name);
                }
            }
        }
    }

    pub fn on_members_changed(&mut self, channel: &ChannelPath, change: MembersChange, ctx: &mut Context) {
        let Some(kind) = self.lists.get(channel).cloned() else {
            return;
        };
        let queued = QueuedChange { kind, change };
        let handles: Vec<Handle> = queued.handles().collect();
        self.queued.push_back(queued);
        ctx.request_contacts(&self.connection, &handles);
        self.drain(ctx);
    }

    pub fn on_contacts_resolved(&mut self, ctx: &mut Context) {
        self.drain(ctx);
    }

    // -- Outbound --

    /// Request a contact's presence and authorise theirs if they asked.
    pub fn add(&mut self, handle: Handle, message: &str, ctx: &mut Context) {
        match self.subscribe.clone() {
            Some(path) => self.add_members(&path, vec![handle], message.to_string(), ctx),
            None => warn!(connection = %self.connection, "No subscribe list to add a contact to"),
        }
        if self.pendings.contains_key(&handle) {
            self.accept_pending(handle, ctx);
        }
    }

    pub fn remove(&mut self, handle: Handle, message: &str, ctx: &mut Context) {
        for path in [self.subscribe.clone(), self.publish.clone()].into_iter().flatten() {
            self.remove_members(&path, vec![handle], message.to_string(), ctx);
        }
    }

    pub fn accept_pending(&mut self, handle: Handle, ctx: &mut Context) {
        match self.publish.clone() {
            Some(path) => self.add_members(&path, vec![handle], String::new(), ctx),
            None => warn!(connection = %self.connection, "No publish list to authorise on"),
        }
    }

    pub fn reject_pending(&mut self, handle: Handle, ctx: &mut Context) {
        match self.publish.clone() {
            Some(path) => self.remove_members(&path, vec![handle], String::new(), ctx),
            None => warn!(connection = %self.connection, "No publish list to reject on"),
        }
    }

    pub fn add_to_group(&mut self, handle: Handle, group: &str, ctx: &mut Context) {
        self.add_all_to_group(vec![handle], group, ctx);
    }

    pub fn remove_from_group(&mut self, handle: Handle, group: &str, ctx: &mut Context) {
        match self.groups.get(group).cloned() {
            Some(path) => self.remove_members(&path, vec![handle], String::new(), ctx),
            None => debug!(group = %group, "Ignoring removal from unknown group"),
        }
    }

    /// Move every member of `old` into `new` and close `old`.
    /// Returns `false` if `old` is not a known group.
    pub fn rename_group(&mut self, old: &str, new: &str, ctx: &mut Context) -> bool {
        let Some(old_path) = self.groups.get(old).cloned() else {
            return false;
        };
        if old == new {
            return true;
        }
        info!(connection = %self.connection, from = %old, to = %new, "Renaming group");

        let mut handles: Vec<Handle> = self
            .group_members
            .get(old)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        handles.sort();

        if !handles.is_empty() {
            self.add_all_to_group(handles.clone(), new, ctx);
            self.remove_members(&old_path, handles, String::new(), ctx);
        }

        let transport = ctx.transport();
        ctx.spawn_logged("close_channel", old_path.clone(), async move {
            transport.close_channel(&old_path).await
        });
        true
    }

    // -- Queries --

    pub fn members(&self) -> Vec<Handle> {
        let mut members: Vec<Handle> = self.members.iter().copied().collect();
        members.sort();
        members
    }

    pub fn is_member(&self, handle: Handle) -> bool {
        self.members.contains(&handle)
    }

    pub fn pendings(&self) -> Vec<(Handle, String)> {
        let mut pendings: Vec<(Handle, String)> =
            self.pendings.iter().map(|(h, m)| (*h, m.clone())).collect();
        pendings.sort();
        pendings
    }

    pub fn is_pending(&self, handle: Handle) -> bool {
        self.pendings.contains_key(&handle)
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn groups_for(&self, handle: Handle) -> Vec<String> {
        let mut groups: Vec<String> = self
            .group_members
            .iter()
            .filter(|(_, members)| members.contains(&handle))
            .map(|(name, _)| name.clone())
            .collect();
        groups.sort();
        groups
    }

    // -- Internals --

    fn drain(&mut self, ctx: &mut Context) {
        while let Some(head) = self.queued.front() {
            if let Some(missing) = head
                .handles()
                .find(|h| !ctx.contacts.is_resolved(&self.connection, *h))
            {
                debug!(connection = %self.connection, contact = %missing, "Roster update waiting for contact");
                return;
            }
            let Some(QueuedChange { kind, change }) = self.queued.pop_front() else {
                break;
            };
            self.apply(kind, change, ctx);
        }
    }

    fn apply(&mut self, kind: ListKind, change: MembersChange, ctx: &mut Context) {
        match kind {
            ListKind::Subscribe => {
                // Remote-pending subscriptions are shown as members.
                for &handle in change.added.iter().chain(&change.remote_pending) {
                    self.set_member(handle, ctx);
                }
                for &handle in &change.removed {
                    if self.members.remove(&handle) {
                        self.emit_member(handle, false, ctx);
                    }
                }
            }
            ListKind::Publish => {
                for &handle in &change.local_pending {
                    if self.members.contains(&handle) {
                        debug!(contact = %handle, "Auto-accepting publish request from member");
                        self.accept_pending(handle, ctx);
                    } else if !self.pendings.contains_key(&handle) {
                        self.pendings.insert(handle, change.message.clone());
                        self.emit_pending(handle, change.message.clone(), true, ctx);
                    }
                }
                for &handle in change.added.iter().chain(&change.removed) {
                    if let Some(message) = self.pendings.remove(&handle) {
                        self.emit_pending(handle, message, false, ctx);
                    }
                }
            }
            ListKind::Group(name) => {
                let members = self.group_members.entry(name.clone()).or_default();
                let added: Vec<Handle> = change
                    .added
                    .iter()
                    .copied()
                    .filter(|h| members.insert(*h))
                    .collect();
                let removed: Vec<Handle> = change
                    .removed
                    .iter()
                    .copied()
                    .filter(|h| members.remove(h))
                    .collect();
                for handle in added {
                    self.emit_group(handle, &name, true, ctx);
                }
                for handle in removed {
                    self.emit_group(handle, &name, false, ctx);
                }
            }
            ListKind::Stored | ListKind::Deny | ListKind::Unknown(_) => {
                debug!(list = ?kind, "Ignoring membership change");
            }
        }
    }

    fn set_member(&mut self, handle: Handle, ctx: &mut Context) {
        if !self.members.insert(handle) {
            return;
        }
        self.emit_member(handle, true, ctx);

        if let Some(message) = self.pendings.remove(&handle) {
            self.accept_pending(handle, ctx);
            self.emit_pending(handle, message, false, ctx);
        }
    }

    fn add_all_to_group(&mut self, handles: Vec<Handle>, group: &str, ctx: &mut Context) {
        if let Some(path) = self.groups.get(group).cloned() {
            self.add_members(&path, handles, String::new(), ctx);
            return;
        }

        self.group_adds
            .entry(group.to_string())
            .or_default()
            .extend(handles);
        if self.requested_groups.insert(group.to_string()) {
            self.ensure_group(group, ctx);
        }
    }

    fn ensure_group(&mut self, name: &str, ctx: &mut Context) {
        debug!(connection = %self.connection, group = %name, "Requesting group channel");
        let request = ChannelRequest::new(ChannelType::ContactList, HandleType::Group)
            .with_target_id(name);
        let transport = ctx.transport();
        let connection = self.connection.clone();
        let name = name.to_string();
        ctx.spawn(async move {
            let result = transport.request_channel(&connection, &request).await;
            Completion::ContactList {
                connection,
                completion: ListCompletion::GroupRequested { name, result },
            }
        });
    }

    fn add_members(&self, path: &ChannelPath, handles: Vec<Handle>, message: String, ctx: &mut Context) {
        let transport = ctx.transport();
        let channel = path.clone();
        ctx.spawn_logged("add_members", path.clone(), async move {
            transport.add_members(&channel, &handles, &message).await
        });
    }

    fn remove_members(&self, path: &ChannelPath, handles: Vec<Handle>, message: String, ctx: &mut Context) {
        let transport = ctx.transport();
        let channel = path.clone();
        ctx.spawn_logged("remove_members", path.clone(), async move {
            transport.remove_members(&channel, &handles, &message).await
        });
    }

    fn contact(&self, handle: Handle, ctx: &Context) -> ContactInfo {
        ctx.contacts.resolved_or_placeholder(&self.connection, handle)
    }

    fn emit_member(&self, handle: Handle, is_member: bool, ctx: &mut Context) {
        let contact = self.contact(handle, ctx);
        ctx.events.emit(DispatcherEvent::MembersChanged {
            account: self.account.clone(),
            contact,
            is_member,
        });
    }

    fn emit_pending(&self, handle: Handle, message: String, is_pending: bool, ctx: &mut Context) {
        let contact = self.contact(handle, ctx);
        ctx.events.emit(DispatcherEvent::PendingsChanged {
            account: self.account.clone(),
            contact,
            message,
            is_pending,
        });
    }

    fn emit_group(&self, handle: Handle, group: &str, is_member: bool, ctx: &mut Context) {
        let contact = self.contact(handle, ctx);
        ctx.events.emit(DispatcherEvent::GroupsChanged {
            account: self.account.clone(),
            contact,
            group: group.to_string(),
            is_member,
        });
    }
}
