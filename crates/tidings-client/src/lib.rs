//! # tidings-client
//!
//! The channel dispatch and chat-session coordinator.
//!
//! A single [`Dispatcher`] owns every component and is driven by one tokio
//! task: transport notifications, completions of in-flight transport calls,
//! commands from [`DispatcherHandle`]s and the chatroom save deadline are all
//! handled on that task, so component state needs no locking.
//!
//! - [`registry`]: account to connection bookkeeping
//! - [`classifier`] and [`operation`]: routing of new channels
//! - [`chat`]: text channel sessions
//! - [`contact_list`]: roster synchronisation
//! - [`transfer`]: file transfer handlers
//! - [`chatrooms`]: favourite chatrooms
//! - [`roomlist`]: room directory listings

pub mod chat;
pub mod chatrooms;
pub mod classifier;
pub mod config;
pub mod contact_list;
pub mod contacts;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod operation;
pub mod registry;
pub mod roomlist;
pub mod service;
pub mod transfer;

pub use config::DispatcherConfig;
pub use context::RequestOrigin;
pub use dispatcher::Dispatcher;
pub use error::DispatcherError;
pub use events::{DispatcherEvent, EventBus};
pub use service::{spawn_dispatcher, DispatcherCommand, DispatcherHandle};
