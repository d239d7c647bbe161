//! # tidings-store
//!
//! Local persistence for the coordinator. The only durable state is the set
//! of favourite chatrooms, kept in a small XML document in the user's
//! configuration directory and rewritten atomically on every save.

pub mod chatrooms;
pub mod models;

mod error;

pub use chatrooms::{ChatroomFile, ChatroomStore};
pub use error::{Result, StoreError};
pub use models::ChatroomRecord;
