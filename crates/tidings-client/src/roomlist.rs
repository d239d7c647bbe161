//! Room directory listing over a room-list channel.

use tracing::debug;

use tidings_shared::protocol::RoomInfo;
use tidings_shared::types::{AccountId, ChannelPath};

use crate::context::Context;
use crate::events::DispatcherEvent;

pub struct RoomList {
    account: AccountId,
    channel: ChannelPath,
    listing: bool,
    rooms: Vec<RoomInfo>,
}

impl RoomList {
    pub fn new(account: AccountId, channel: ChannelPath) -> Self {
        Self {
            account,
            channel,
            listing: false,
            rooms: Vec::new(),
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn channel(&self) -> &ChannelPath {
        &self.channel
    }

    pub fn is_listing(&self) -> bool {
        self.listing
    }

    /// Rooms seen since the last `start_listing`.
    pub fn rooms(&self) -> &[RoomInfo] {
        &self.rooms
    }

    pub fn start_listing(&mut self, ctx: &mut Context) {
        self.rooms.clear();
        let transport = ctx.transport();
        let channel = self.channel.clone();
        ctx.spawn_logged("list_rooms", channel.clone(), async move {
            transport.list_rooms(&channel).await
        });
    }

    pub fn stop_listing(&mut self, ctx: &mut Context) {
        let transport = ctx.transport();
        let channel = self.channel.clone();
        ctx.spawn_logged("stop_listing", channel.clone(), async move {
            transport.stop_listing(&channel).await
        });
    }

    pub fn on_rooms_listed(&mut self, rooms: Vec<RoomInfo>, ctx: &mut Context) {
        debug!(channel = %self.channel, count = rooms.len(), "Rooms listed");
        self.rooms.extend(rooms.iter().cloned());
        ctx.events.emit(DispatcherEvent::RoomsListed {
            channel: self.channel.clone(),
            rooms,
        });
    }

    pub fn on_listing_changed(&mut self, listing: bool, ctx: &mut Context) {
        if self.listing == listing {
            return;
        }
        self.listing = listing;
        ctx.events.emit(DispatcherEvent::ListingChanged {
            channel: self.channel.clone(),
            listing,
        });
    }
}
