use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account identifier as known by the account manager, e.g. `gabble/jabber/alice0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live connection owned by exactly one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object path of a channel. Unique across the whole process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChannelPath(pub String);

impl ChannelPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Connection-scoped numeric handle. 0 means "no handle".
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl Handle {
    pub const NONE: Handle = Handle(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a file transfer tracked by the dispatcher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HandleType {
    None,
    Contact,
    Room,
    List,
    Group,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Text,
    RoomList,
    ContactList,
    StreamedMedia,
    FileTransfer,
    Tubes,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::RoomList => "room_list",
            Self::ContactList => "contact_list",
            Self::StreamedMedia => "streamed_media",
            Self::FileTransfer => "file_transfer",
            Self::Tubes => "tubes",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatusReason {
    #[default]
    None,
    Requested,
    NetworkError,
    AuthenticationFailed,
    EncryptionError,
    NameInUse,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Normal,
    Action,
    Notice,
    AutoReply,
}

/// Flags attached to a received message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MessageFlags {
    pub truncated: bool,
    /// The message had parts that could not be rendered as text.
    pub non_text_content: bool,
    pub scrollback: bool,
    pub rescued: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Gone,
    Inactive,
    Active,
    Paused,
    Composing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentHashType {
    #[default]
    None,
    Md5,
    Sha256,
    Blake3,
}

/// Transfer state as reported by the remote side of a file channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    #[default]
    None,
    Pending,
    Accepted,
    Open,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferStateReason {
    #[default]
    None,
    Requested,
    LocalStopped,
    RemoteStopped,
    LocalError,
    RemoteError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_none() {
        assert!(Handle::NONE.is_none());
        assert!(!Handle(4).is_none());
        assert_eq!(Handle::default(), Handle::NONE);
        assert_eq!(Handle(4).to_string(), "#4");
    }

    #[test]
    fn test_channel_type_wire_names() {
        let json = serde_json::to_string(&ChannelType::FileTransfer).unwrap();
        assert_eq!(json, "\"file_transfer\"");
        let parsed: ChannelType = serde_json::from_str("\"room_list\"").unwrap();
        assert_eq!(parsed, ChannelType::RoomList);
        assert_eq!(ChannelType::ContactList.as_str(), "contact_list");
    }

    #[test]
    fn test_message_flags_default_when_missing() {
        let flags: MessageFlags = serde_json::from_str("{\"truncated\":true}").unwrap();
        assert!(flags.truncated);
        assert!(!flags.non_text_content);
    }

    #[test]
    fn test_transparent_ids() {
        let account: AccountId = serde_json::from_str("\"gabble/jabber/alice0\"").unwrap();
        assert_eq!(account.as_str(), "gabble/jabber/alice0");
        assert_eq!(serde_json::to_string(&Handle(12)).unwrap(), "12");
    }
}
