//! Favourite and joined chatrooms.
//!
//! The manager tracks every room the user is in plus the favourites loaded
//! from the store. Only favourites are persisted. Mutations schedule a save
//! `debounce` after the first unsaved change; later changes ride along with
//! that save instead of pushing it back.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use tidings_shared::types::{AccountId, ChannelPath};
use tidings_store::{ChatroomRecord, ChatroomStore, StoreError};

use crate::events::{ChatroomInfo, DispatcherEvent, EventBus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chatroom {
    pub account: AccountId,
    pub room: String,
    pub name: String,
    pub auto_connect: bool,
    pub favorite: bool,
    /// Live text channel, while joined.
    pub channel: Option<ChannelPath>,
}

impl Chatroom {
    pub fn new(account: AccountId, room: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            account,
            room: room.into(),
            name: name.into(),
            auto_connect: false,
            favorite: false,
            channel: None,
        }
    }

    pub fn info(&self) -> ChatroomInfo {
        ChatroomInfo {
            account: self.account.clone(),
            room: self.room.clone(),
            name: self.name.clone(),
            auto_connect: self.auto_connect,
            favorite: self.favorite,
        }
    }

    fn record(&self) -> ChatroomRecord {
        ChatroomRecord {
            account: self.account.clone(),
            room: self.room.clone(),
            name: self.name.clone(),
            auto_connect: self.auto_connect,
        }
    }
}

impl From<ChatroomRecord> for Chatroom {
    fn from(record: ChatroomRecord) -> Self {
        Self {
            account: record.account,
            room: record.room,
            name: record.name,
            auto_connect: record.auto_connect,
            favorite: true,
            channel: None,
        }
    }
}

pub struct ChatroomManager {
    rooms: Vec<Chatroom>,
    store: Option<Box<dyn ChatroomStore>>,
    debounce: Duration,
    save_deadline: Option<Instant>,
}

impl ChatroomManager {
    pub fn new(store: Option<Box<dyn ChatroomStore>>, debounce: Duration) -> Self {
        Self {
            rooms: Vec::new(),
            store,
            debounce,
            save_deadline: None,
        }
    }

    /// Load favourites from the store. A broken document is logged and
    /// ignored; it is not rewritten until the next mutation.
    pub fn load(&mut self, events: &EventBus) -> usize {
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        let records = match store.load() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to load chatrooms, starting empty");
                return 0;
            }
        };

        let mut loaded = 0;
        for record in records {
            let room = Chatroom::from(record);
            if self.find(&room.account, &room.room).is_some() {
                continue;
            }
            events.emit(DispatcherEvent::ChatroomAdded(room.info()));
            self.rooms.push(room);
            loaded += 1;
        }
        info!(count = loaded, "Chatrooms loaded");
        loaded
    }

    // -- Queries --

    pub fn find(&self, account: &AccountId, room: &str) -> Option<&Chatroom> {
        self.rooms
            .iter()
            .find(|r| &r.account == account && r.room == room)
    }

    pub fn find_by_channel(&self, channel: &ChannelPath) -> Option<&Chatroom> {
        self.rooms
            .iter()
            .find(|r| r.channel.as_ref() == Some(channel))
    }

    /// Every room, or only those of `account`.
    pub fn chatrooms(&self, account: Option<&AccountId>) -> Vec<&Chatroom> {
        self.rooms
            .iter()
            .filter(|r| account.map_or(true, |a| &r.account == a))
            .collect()
    }

    pub fn count(&self, account: Option<&AccountId>) -> usize {
        self.chatrooms(account).len()
    }

    /// Favourites of `account` that join on connect.
    pub fn auto_connect_rooms(&self, account: &AccountId) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|r| &r.account == account && r.favorite && r.auto_connect)
            .map(|r| r.room.clone())
            .collect()
    }

    // -- Mutations --

    /// Returns `false` if `(account, room)` is already known.
    pub fn add(&mut self, room: Chatroom, events: &EventBus) -> bool {
        if self.find(&room.account, &room.room).is_some() {
            return false;
        }
        debug!(account = %room.account, room = %room.room, favorite = room.favorite, "Chatroom added");
        if room.favorite {
            self.schedule_save();
        }
        events.emit(DispatcherEvent::ChatroomAdded(room.info()));
        self.rooms.push(room);
        true
    }

    pub fn remove(&mut self, account: &AccountId, room: &str, events: &EventBus) -> bool {
        let Some(index) = self.position(account, room) else {
            return false;
        };
        let removed = self.rooms.remove(index);
        debug!(account = %account, room = %room, "Chatroom removed");
        if removed.favorite {
            self.schedule_save();
        }
        events.emit(DispatcherEvent::ChatroomRemoved {
            account: removed.account,
            room: removed.room,
        });
        true
    }

    /// Mark or unmark a favourite. An unmarked room that is not joined
    /// is forgotten.
    pub fn set_favorite(&mut self, account: &AccountId, room: &str, favorite: bool, events: &EventBus) -> bool {
        let Some(index) = self.position(account, room) else {
            return false;
        };
        if self.rooms[index].favorite == favorite {
            return true;
        }
        self.rooms[index].favorite = favorite;
        self.schedule_save();

        if !favorite && self.rooms[index].channel.is_none() {
            let removed = self.rooms.remove(index);
            events.emit(DispatcherEvent::ChatroomRemoved {
                account: removed.account,
                room: removed.room,
            });
        } else {
            events.emit(DispatcherEvent::ChatroomChanged(self.rooms[index].info()));
        }
        true
    }

    pub fn set_auto_connect(&mut self, account: &AccountId, room: &str, auto_connect: bool, events: &EventBus) -> bool {
        let Some(index) = self.position(account, room) else {
            return false;
        };
        let entry = &mut self.rooms[index];
        if entry.auto_connect == auto_connect {
            return true;
        }
        entry.auto_connect = auto_connect;
        let favorite = entry.favorite;
        events.emit(DispatcherEvent::ChatroomChanged(entry.info()));
        if favorite {
            self.schedule_save();
        }
        true
    }

    /// A text channel for `room` appeared.
    pub fn on_channel_joined(&mut self, account: &AccountId, room: &str, channel: ChannelPath, events: &EventBus) {
        match self.position(account, room) {
            Some(index) => self.rooms[index].channel = Some(channel),
            None => {
                let mut entry = Chatroom::new(account.clone(), room, room);
                entry.channel = Some(channel);
                self.add(entry, events);
            }
        }
    }

    /// The room's channel went away: favourites stay, the rest is forgotten.
    pub fn on_channel_closed(&mut self, channel: &ChannelPath, events: &EventBus) {
        let Some(index) = self
            .rooms
            .iter()
            .position(|r| r.channel.as_ref() == Some(channel))
        else {
            return;
        };

        if self.rooms[index].favorite {
            self.rooms[index].channel = None;
        } else {
            let account = self.rooms[index].account.clone();
            let room = self.rooms[index].room.clone();
            self.remove(&account, &room, events);
        }
    }

    // -- Persistence --

    pub fn save_deadline(&self) -> Option<Instant> {
        self.save_deadline
    }

    pub fn is_save_due(&self, now: Instant) -> bool {
        matches!(self.save_deadline, Some(deadline) if deadline <= now)
    }

    /// Write the favourites now, cancelling any scheduled save.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.save_deadline = None;
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let records: Vec<ChatroomRecord> = self
            .rooms
            .iter()
            .filter(|r| r.favorite)
            .map(Chatroom::record)
            .collect();
        debug!(count = records.len(), "Saving chatrooms");
        store.save(&records)
    }

    fn schedule_save(&mut self) {
        if self.save_deadline.is_none() {
            self.save_deadline = Some(Instant::now() + self.debounce);
        }
    }

    fn position(&self, account: &AccountId, room: &str) -> Option<usize> {
        self.rooms
            .iter()
            .position(|r| &r.account == account && r.room == room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use tidings_store::ChatroomFile;

    /// Store double counting writes.
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

    fn alice() -> AccountId {
        AccountId::new("alice")
    }

    fn favorite(room: &str) -> Chatroom {
        let mut entry = Chatroom::new(alice(), room, room);
        entry.favorite = true;
        entry
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_save() {
        let store = CountingStore::default();
        let saved = store.saved.clone();
        let events = EventBus::new(16);
        let mut manager = ChatroomManager::new(Some(Box::new(store)), Duration::from_secs(4));

        let start = Instant::now();
        manager.add(favorite("a@muc"), &events);
        tokio::time::advance(Duration::from_secs(1)).await;
        manager.add(favorite("b@muc"), &events);
        manager.set_auto_connect(&alice(), "a@muc", true, &events);

        // Later mutations do not push the deadline back.
        assert_eq!(manager.save_deadline(), Some(start + Duration::from_secs(4)));
        assert!(!manager.is_save_due(Instant::now()));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(manager.is_save_due(Instant::now()));
        manager.flush().unwrap();
        assert_eq!(saved.lock().unwrap().len(), 1);
        assert_eq!(saved.lock().unwrap()[0].len(), 2);
        assert!(manager.save_deadline().is_none());

        manager.remove(&alice(), "b@muc", &events);
        assert!(manager.save_deadline().is_some());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(manager.is_save_due(Instant::now()));
        manager.flush().unwrap();
        assert_eq!(saved.lock().unwrap().len(), 2);
        assert_eq!(saved.lock().unwrap()[1].len(), 1);
    }

    #[test]
    fn test_only_favourites_are_saved() {
        let store = CountingStore::default();
        let saved = store.saved.clone();
        let events = EventBus::new(16);
        let mut manager = ChatroomManager::new(Some(Box::new(store)), Duration::from_secs(4));

        manager.on_channel_joined(&alice(), "joined@muc", ChannelPath::new("/chan/1"), &events);
        assert!(manager.save_deadline().is_none());
        manager.add(favorite("fav@muc"), &events);
        manager.flush().unwrap();

        let saved = saved.lock().unwrap();
        assert_eq!(saved[0].len(), 1);
        assert_eq!(saved[0][0].room, "fav@muc");
    }

    #[test]
    fn test_channel_close_keeps_favourites_only() {
        let events = EventBus::new(16);
        let mut manager = ChatroomManager::new(None, Duration::from_secs(4));
        manager.add(favorite("fav@muc"), &events);

        manager.on_channel_joined(&alice(), "fav@muc", ChannelPath::new("/chan/fav"), &events);
        manager.on_channel_joined(&alice(), "adhoc@muc", ChannelPath::new("/chan/adhoc"), &events);
        assert_eq!(manager.count(None), 2);
        assert_eq!(
            manager.find_by_channel(&ChannelPath::new("/chan/adhoc")).map(|r| r.room.as_str()),
            Some("adhoc@muc")
        );

        manager.on_channel_closed(&ChannelPath::new("/chan/fav"), &events);
        manager.on_channel_closed(&ChannelPath::new("/chan/adhoc"), &events);

        assert_eq!(manager.count(None), 1);
        let fav = manager.find(&alice(), "fav@muc").unwrap();
        assert!(fav.channel.is_none());
        assert!(manager.find(&alice(), "adhoc@muc").is_none());
    }

    #[test]
    fn test_add_is_unique_per_account_and_room() {
        let events = EventBus::new(16);
        let mut manager = ChatroomManager::new(None, Duration::from_secs(4));
        assert!(manager.add(favorite("a@muc"), &events));
        assert!(!manager.add(favorite("a@muc"), &events));
        assert!(manager.add(Chatroom::new(AccountId::new("bob"), "a@muc", "A"), &events));

        assert_eq!(manager.count(None), 2);
        assert_eq!(manager.count(Some(&alice())), 1);
    }

    #[test]
    fn test_unfavourite_forgets_unjoined_room() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut manager = ChatroomManager::new(None, Duration::from_secs(4));
        manager.add(favorite("a@muc"), &events);
        assert!(manager.set_favorite(&alice(), "a@muc", false, &events));
        assert!(manager.find(&alice(), "a@muc").is_none());

        let names: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.name()).collect();
        assert_eq!(names, vec!["chatroom-added", "chatroom-removed"]);
    }

    #[test]
    fn test_load_auto_connect_and_broken_file() {
        let events = EventBus::new(16);
        let mut record = ChatroomRecord::new(alice(), "team@muc", "Team");
        record.auto_connect = true;
        let store = CountingStore {
            initial: vec![record, ChatroomRecord::new(alice(), "quiet@muc", "Quiet")],
            ..Default::default()
        };
        let mut manager = ChatroomManager::new(Some(Box::new(store)), Duration::from_secs(4));
        assert_eq!(manager.load(&events), 2);
        assert_eq!(manager.auto_connect_rooms(&alice()), vec!["team@muc".to_string()]);
        assert!(manager.save_deadline().is_none());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatrooms.xml");
        std::fs::write(&path, "<not-chatrooms/>").unwrap();
        let mut broken = ChatroomManager::new(Some(Box::new(ChatroomFile::new(&path))), Duration::from_secs(4));
        assert_eq!(broken.load(&events), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<not-chatrooms/>");
    }
}
