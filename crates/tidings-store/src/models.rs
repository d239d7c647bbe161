//! Domain models persisted by the store.

use serde::{Deserialize, Serialize};
use tidings_shared::types::AccountId;

/// A saved chatroom. `(account, room)` is unique within a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatroomRecord {
    pub account: AccountId,
    /// Protocol room identifier, e.g. `tidings@conference.example.org`.
    pub room: String,
    /// Display name.
    pub name: String,
    /// Join automatically once the account connects.
    pub auto_connect: bool,
}

impl ChatroomRecord {
    pub fn new(account: AccountId, room: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            account,
            room: room.into(),
            name: name.into(),
            auto_connect: false,
        }
    }
}
