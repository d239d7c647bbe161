//! Decides which component handles a new channel and whether it needs approval.

use serde::Serialize;

use tidings_shared::constants::{LIST_DENY, LIST_PUBLISH, LIST_STORED, LIST_SUBSCRIBE};
use tidings_shared::protocol::ChannelDescriptor;
use tidings_shared::types::{ChannelType, HandleType};

/// Which contact list a contact-list channel carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ListKind {
    Subscribe,
    Publish,
    Stored,
    Deny,
    Group(String),
    Unknown(String),
}

impl ListKind {
    pub fn from_descriptor(desc: &ChannelDescriptor) -> Self {
        let name = desc.target_id.clone().unwrap_or_default();
        match desc.handle_type {
            HandleType::Group => Self::Group(name),
            _ => match name.as_str() {
                LIST_SUBSCRIBE => Self::Subscribe,
                LIST_PUBLISH => Self::Publish,
                LIST_STORED => Self::Stored,
                LIST_DENY => Self::Deny,
                _ => Self::Unknown(name),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// One-to-one text chat.
    Chat,
    /// Multi-user text chat.
    Room,
    ContactList(ListKind),
    FileTransfer,
    RoomList,
    /// Classified but not handled here (media calls, tubes).
    Unhandled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Hand straight to the handler.
    Dispatch,
    /// Surface for approval first.
    Filter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ChannelKind,
    pub route: Route,
    pub incoming: bool,
}

pub fn classify(desc: &ChannelDescriptor, suppress_handler: bool) -> Classification {
    let kind = match desc.channel_type {
        ChannelType::Text if desc.handle_type == HandleType::Room => ChannelKind::Room,
        ChannelType::Text => ChannelKind::Chat,
        ChannelType::ContactList => ChannelKind::ContactList(ListKind::from_descriptor(desc)),
        ChannelType::FileTransfer => ChannelKind::FileTransfer,
        ChannelType::RoomList => ChannelKind::RoomList,
        ChannelType::StreamedMedia | ChannelType::Tubes => ChannelKind::Unhandled,
    };

    let incoming = !(suppress_handler || desc.requested);
    // Contact lists are infrastructure and never need the user's consent.
    let route = match kind {
        ChannelKind::ContactList(_) => Route::Dispatch,
        _ if incoming => Route::Filter,
        _ => Route::Dispatch,
    };

    Classification {
        kind,
        route,
        incoming,
    }
}
