//! Favourite chatrooms document.
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8"?>
//! <chatrooms xmlns="urn:tidings:chatrooms:1">
//!   <chatroom>
//!     <name>Tidings</name>
//!     <room>tidings@conference.example.org</room>
//!     <account>gabble/jabber/alice0</account>
//!     <auto_connect>yes</auto_connect>
//!   </chatroom>
//! </chatrooms>
//! ```
//!
//! A document that fails to parse or validate is rejected as a whole.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use minidom::Element;

use tidings_shared::constants::{CHATROOMS_NS, CHATROOMS_XML_FILENAME};
use tidings_shared::types::AccountId;

use crate::error::{Result, StoreError};
use crate::models::ChatroomRecord;

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n";

/// Storage backend for favourite chatrooms.
pub trait ChatroomStore: Send {
    fn load(&self) -> Result<Vec<ChatroomRecord>>;
    fn save(&self, records: &[ChatroomRecord]) -> Result<()>;
}

/// `chatrooms.xml` on the local filesystem.
#[derive(Debug, Clone)]
pub struct ChatroomFile {
    path: PathBuf,
}

impl ChatroomFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `chatrooms.xml` inside the platform config directory.
    pub fn open_default() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("org", "tidings", "tidings").ok_or(StoreError::NoConfigDir)?;
        Ok(Self::new(
            project_dirs.config_dir().join(CHATROOMS_XML_FILENAME),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChatroomStore for ChatroomFile {
    /// A missing file is an empty list.
    fn load(&self) -> Result<Vec<ChatroomRecord>> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no chatrooms file yet");
            return Ok(Vec::new());
        }

        let xml = std::fs::read_to_string(&self.path)?;
        let records = parse_chatrooms(&xml)?;
        tracing::info!(
            path = %self.path.display(),
            count = records.len(),
            "loaded chatrooms"
        );
        Ok(records)
    }

    /// Write to a sibling temp file, then rename over the target.
    fn save(&self, records: &[ChatroomRecord]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let tmp = self.path.with_extension("xml.tmp");
        std::fs::write(&tmp, render_chatrooms(records))?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(
            path = %self.path.display(),
            count = records.len(),
            "saved chatrooms"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Document format
// ---------------------------------------------------------------------------

/// Parse and validate a chatrooms document.
pub fn parse_chatrooms(xml: &str) -> Result<Vec<ChatroomRecord>> {
    let root: Element = xml.trim_start().parse()?;

    if root.name() != "chatrooms" || root.ns() != CHATROOMS_NS {
        return Err(StoreError::Validation(format!(
            "unexpected root element <{}>",
            root.name()
        )));
    }

    root.children().map(parse_chatroom).collect()
}

fn parse_chatroom(el: &Element) -> Result<ChatroomRecord> {
    if el.name() != "chatroom" || el.ns() != CHATROOMS_NS {
        return Err(StoreError::Validation(format!(
            "unexpected element <{}> in <chatrooms>",
            el.name()
        )));
    }

    let mut name = None;
    let mut room = None;
    let mut account = None;
    let mut auto_connect = None;

    for child in el.children() {
        let slot = match child.name() {
            "name" => &mut name,
            "room" => &mut room,
            "account" => &mut account,
            "auto_connect" => &mut auto_connect,
            other => {
                return Err(StoreError::Validation(format!(
                    "unexpected element <{other}> in <chatroom>"
                )))
            }
        };
        if slot.replace(child.text()).is_some() {
            return Err(StoreError::Validation(format!(
                "duplicate <{}> in <chatroom>",
                child.name()
            )));
        }
    }

    let room = required(room, "room")?;
    let account = required(account, "account")?;
    let name = name.unwrap_or_else(|| room.clone());
    let auto_connect = match auto_connect.as_deref().map(str::trim) {
        None | Some("no") => false,
        Some("yes") => true,
        Some(other) => {
            return Err(StoreError::Validation(format!(
                "auto_connect must be yes or no, got {other:?}"
            )))
        }
    };

    Ok(ChatroomRecord {
        account: AccountId::new(account),
        room,
        name: name.trim().to_string(),
        auto_connect,
    })
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(StoreError::Validation(format!("missing <{field}> in <chatroom>"))),
    }
}

/// Render records as a complete document, declaration included.
pub fn render_chatrooms(records: &[ChatroomRecord]) -> String {
    let mut root = Element::builder("chatrooms", CHATROOMS_NS).build();

    for record in records {
        let chatroom = Element::builder("chatroom", CHATROOMS_NS)
            .append(text_element("name", record.name.clone()))
            .append(text_element("room", record.room.clone()))
            .append(text_element("account", record.account.to_string()))
            .append(text_element(
                "auto_connect",
                if record.auto_connect { "yes" } else { "no" }.to_string(),
            ))
            .build();
        root.append_child(chatroom);
    }

    format!("{XML_DECLARATION}{}\n", String::from(&root))
}

fn text_element(name: &str, text: String) -> Element {
    Element::builder(name, CHATROOMS_NS).append(text).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(room: &str, auto_connect: bool) -> ChatroomRecord {
        ChatroomRecord {
            account: AccountId::new("gabble/jabber/alice0"),
            room: room.to_string(),
            name: format!("Room {room}"),
            auto_connect,
        }
    }

    #[test]
    fn test_parse_document() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<chatrooms xmlns="urn:tidings:chatrooms:1">
  <chatroom>
    <name>Tidings &amp; friends</name>
    <room>tidings@conference.example.org</room>
    <account>gabble/jabber/alice0</account>
    <auto_connect>yes</auto_connect>
  </chatroom>
  <chatroom>
    <room>lobby@conference.example.org</room>
    <account>gabble/jabber/alice0</account>
  </chatroom>
</chatrooms>"#;

        let records = parse_chatrooms(xml).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Tidings & friends");
        assert!(records[0].auto_connect);
        assert_eq!(records[1].name, "lobby@conference.example.org");
        assert!(!records[1].auto_connect);
    }

    #[test]
    fn test_render_then_parse() {
        let records = vec![record("a@muc.example.org", true), record("b@muc.example.org", false)];
        let xml = render_chatrooms(&records);
        assert!(xml.starts_with("<?xml"));
        assert_eq!(parse_chatrooms(&xml).unwrap(), records);
    }

    #[test]
    fn test_rejects_wrong_root() {
        let xml = r#"<rooms xmlns="urn:tidings:chatrooms:1"/>"#;
        assert!(matches!(parse_chatrooms(xml), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_rejects_missing_account() {
        let xml = r#"<chatrooms xmlns="urn:tidings:chatrooms:1">
  <chatroom><room>a@muc.example.org</room></chatroom>
</chatrooms>"#;
        assert!(matches!(parse_chatrooms(xml), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_rejects_bad_auto_connect() {
        let xml = r#"<chatrooms xmlns="urn:tidings:chatrooms:1">
  <chatroom>
    <room>a@muc.example.org</room>
    <account>gabble/jabber/alice0</account>
    <auto_connect>maybe</auto_connect>
  </chatroom>
</chatrooms>"#;
        assert!(matches!(parse_chatrooms(xml), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_rejects_malformed_xml() {
        assert!(matches!(
            parse_chatrooms("<chatrooms xmlns=\"urn:tidings:chatrooms:1\">"),
            Err(StoreError::Xml(_))
        ));
    }

    #[test]
    fn test_file_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = ChatroomFile::new(dir.path().join("chatrooms.xml"));
        assert!(file.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = ChatroomFile::new(dir.path().join("nested").join("chatrooms.xml"));
        let records = vec![record("a@muc.example.org", true)];

        file.save(&records).unwrap();
        assert!(file.path().exists());
        assert!(!file.path().with_extension("xml.tmp").exists());
        assert_eq!(file.load().unwrap(), records);

        file.save(&[]).unwrap();
        assert!(file.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_corrupt_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatrooms.xml");
        std::fs::write(&path, "definitely not xml").unwrap();
        assert!(ChatroomFile::new(path).load().is_err());
    }
}
