/// Application name
pub const APP_NAME: &str = "Tidings";

/// JSON-RPC version tag
pub const JSONRPC_VERSION: &str = "2.0";

/// Default socket file name for the transport daemon
pub const DEFAULT_SOCKET_NAME: &str = "tidings.sock";

/// File name of the persisted favourite chatrooms
pub const CHATROOMS_XML_FILENAME: &str = "chatrooms.xml";

/// XML namespace of the chatrooms document
pub const CHATROOMS_NS: &str = "urn:tidings:chatrooms:1";

/// Delay between the first chatroom mutation and the coalesced save (ms)
pub const SAVE_DEBOUNCE_MS: u64 = 4_000;

/// Default timeout for a single transport call (ms)
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 25_000;

/// Default capacity of the dispatcher event broadcast
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default capacity of the dispatcher command queue
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Read buffer used while hashing files
pub const HASH_BUFFER_SIZE: usize = 4096;

/// Minimum interval between two transfer speed estimates (seconds)
pub const PROGRESS_SAMPLE_SECS: u64 = 1;

/// Named contact lists
pub const LIST_SUBSCRIBE: &str = "subscribe";
pub const LIST_PUBLISH: &str = "publish";
pub const LIST_STORED: &str = "stored";
pub const LIST_DENY: &str = "deny";
