//! Tag and card model
//!
//! A [`Tag`] is one detection of a physical or logical NFC tag, whatever its
//! source. A [`Card`] is the decorated view the consumer server broadcasts:
//! it carries the parsed NDEF message (or the raw bytes when parsing fails)
//! and the convenience text used by thin clients.

pub mod uid;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ndef::{self, NdefMessage};

/// What a tag source lets us do with a tag. Remote tags are never writable
/// through the Tag itself — writes to a phone-held tag go through the
/// device-directed write protocol instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_read: bool,
    pub can_write: bool,
    pub can_transceive: bool,
    pub can_lock: bool,
    pub supports_ndef: bool,
}

impl Capabilities {
    pub fn hardware() -> Self {
        Self {
            can_read: true,
            can_write: true,
            can_transceive: true,
            can_lock: true,
            supports_ndef: true,
        }
    }

    pub fn remote() -> Self {
        Self {
            can_read: true,
            can_write: false,
            can_transceive: false,
            can_lock: false,
            supports_ndef: true,
        }
    }

    pub fn injected() -> Self {
        Self {
            can_read: true,
            can_write: false,
            can_transceive: false,
            can_lock: false,
            supports_ndef: true,
        }
    }
}

/// Where a tag came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagKind {
    /// Seen by a PC/SC reader; APDU channel available while it is present.
    Hardware,
    /// Pushed by a registered remote device.
    Remote { device_id: Uuid },
    /// Injected over HTTP for testing.
    Injected,
}

/// One detection of an NFC tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Normalized colon-separated uppercase hex (see [`uid::normalize`]).
    pub uid: String,
    /// Human-readable type, e.g. "MIFARE Classic 1K".
    pub tag_type: String,
    /// Radio technology, e.g. "ISO14443A".
    pub technology: String,
    pub scanned_at: DateTime<Utc>,
    /// Raw NDEF message bytes (TLV already stripped), when read.
    pub raw: Option<Vec<u8>>,
    /// Parsed message, when the source supplied one.
    pub message: Option<NdefMessage>,
    pub kind: TagKind,
    pub capabilities: Capabilities,
}

impl Tag {
    pub fn hardware(uid: String, tag_type: String, technology: String) -> Self {
        Self {
            uid,
            tag_type,
            technology,
            scanned_at: Utc::now(),
            raw: None,
            message: None,
            kind: TagKind::Hardware,
            capabilities: Capabilities::hardware(),
        }
    }

    pub fn remote(device_id: Uuid, uid: String, tag_type: String, technology: String) -> Self {
        Self {
            uid,
            tag_type,
            technology,
            scanned_at: Utc::now(),
            raw: None,
            message: None,
            kind: TagKind::Remote { device_id },
            capabilities: Capabilities::remote(),
        }
    }

    pub fn injected(uid: String, tag_type: String, technology: String) -> Self {
        Self {
            uid,
            tag_type,
            technology,
            scanned_at: Utc::now(),
            raw: None,
            message: None,
            kind: TagKind::Injected,
            capabilities: Capabilities::injected(),
        }
    }

    pub fn with_raw(mut self, raw: Vec<u8>) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_message(mut self, message: NdefMessage) -> Self {
        self.message = Some(message);
        self
    }
}

/// Parsed view of the tag contents.
#[derive(Debug, Clone, PartialEq)]
pub enum CardMessage {
    Ndef(NdefMessage),
    Raw(Vec<u8>),
}

/// A tag decorated with its last-parsed message, ready for broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub tag: Tag,
}

impl Card {
    pub fn new(tag: Tag) -> Self {
        Self { tag }
    }

    /// Best-effort message read: the parsed message if the source supplied
    /// one, otherwise an NDEF parse of the raw bytes, otherwise the raw
    /// bytes themselves.
    pub fn read_message(&self) -> Option<CardMessage> {
        if let Some(msg) = &self.tag.message {
            return Some(CardMessage::Ndef(msg.clone()));
        }
        let raw = self.tag.raw.as_ref()?;
        match NdefMessage::decode(raw) {
            Ok(msg) => Some(CardMessage::Ndef(msg)),
            Err(_) => Some(CardMessage::Raw(raw.clone())),
        }
    }

    /// First text or URI record, empty string when the tag is blank.
    pub fn text(&self) -> String {
        match self.read_message() {
            Some(CardMessage::Ndef(msg)) => msg.first_text().unwrap_or_default(),
            Some(CardMessage::Raw(raw)) => String::from_utf8(raw).unwrap_or_default(),
            None => String::new(),
        }
    }
}

/// Event record flowing over the bridge: a successful scan or a failure.
/// Exactly one of the two fields is set.
#[derive(Debug, Clone)]
pub struct NfcData {
    pub card: Option<Card>,
    pub err: Option<String>,
}

impl NfcData {
    pub fn card(card: Card) -> Self {
        Self {
            card: Some(card),
            err: None,
        }
    }

    pub fn error(err: impl Into<String>) -> Self {
        Self {
            card: None,
            err: Some(err.into()),
        }
    }
}

/// Per-reader connection state broadcast to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub connected: bool,
    pub message: String,
    pub card_present: bool,
}

impl DeviceStatus {
    pub fn connected(message: impl Into<String>) -> Self {
        Self {
            connected: true,
            message: message.into(),
            card_present: false,
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self {
            connected: false,
            message: message.into(),
            card_present: false,
        }
    }

    pub fn with_card_present(mut self, present: bool) -> Self {
        self.card_present = present;
        self
    }
}

/// Parse raw tag memory into message bytes, stripping TLV framing when
/// present. Hardware reads hand us full tag memory; remote devices usually
/// send bare message bytes.
pub fn message_bytes_from_memory(memory: &[u8]) -> Option<Vec<u8>> {
    if memory.is_empty() || ndef::tlv::is_blank(memory) {
        return None;
    }
    match ndef::tlv::unwrap(memory) {
        Ok(bytes) => Some(bytes),
        // No TLV block: assume the buffer already is the message.
        Err(_) => Some(memory.to_vec()),
    }
}
