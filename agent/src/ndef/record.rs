//! NDEF record model and the well-known Text / URI record types

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NdefError {
    #[error("input buffer is empty")]
    EmptyBuffer,
    #[error("record header is truncated")]
    TruncatedHeader,
    #[error("record payload extends past the end of the buffer")]
    TruncatedPayload,
    #[error("chunked records are not supported")]
    ChunkedRecord,
    #[error("message has no terminating record (ME flag never set)")]
    UnterminatedMessage,
    #[error("no NDEF TLV block found")]
    NoTlvBlock,
    #[error("TLV length extends past the end of the buffer")]
    TruncatedTlv,
}

/// Type Name Format — how the `type` field of a record is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tnf {
    Empty = 0x00,
    WellKnown = 0x01,
    MimeMedia = 0x02,
    AbsoluteUri = 0x03,
    External = 0x04,
    Unknown = 0x05,
    Unchanged = 0x06,
    Reserved = 0x07,
}

impl Tnf {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0x00 => Tnf::Empty,
            0x01 => Tnf::WellKnown,
            0x02 => Tnf::MimeMedia,
            0x03 => Tnf::AbsoluteUri,
            0x04 => Tnf::External,
            0x05 => Tnf::Unknown,
            0x06 => Tnf::Unchanged,
            _ => Tnf::Reserved,
        }
    }
}

/// URI identifier codes from the NFC Forum URI RTD. The first payload byte
/// of a `U` record selects a prefix from this table.
pub const URI_PREFIXES: [&str; 36] = [
    "",
    "http://www.",
    "https://www.",
    "http://",
    "https://",
    "tel:",
    "mailto:",
    "ftp://anonymous:anonymous@",
    "ftp://ftp.",
    "ftps://",
    "sftp://",
    "smb://",
    "nfs://",
    "ftp://",
    "dav://",
    "news:",
    "telnet://",
    "imap:",
    "rtsp://",
    "urn:",
    "pop:",
    "sip:",
    "sips:",
    "tftp:",
    "btspp://",
    "btl2cap://",
    "btgoep://",
    "tcpobex://",
    "irdaobex://",
    "file://",
    "urn:epc:id:",
    "urn:epc:tag:",
    "urn:epc:pat:",
    "urn:epc:raw:",
    "urn:epc:",
    "urn:nfc:",
];

/// A single NDEF record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdefRecord {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl NdefRecord {
    /// Well-known Text record (`T`): status byte, language code, UTF-8 text.
    pub fn text(content: &str, language: &str) -> Self {
        let lang = if language.is_empty() { "en" } else { language };
        let mut payload = Vec::with_capacity(1 + lang.len() + content.len());
        // Status byte: bit 7 = 0 (UTF-8), bits 0-5 = language code length
        payload.push((lang.len() & 0x3F) as u8);
        payload.extend_from_slice(lang.as_bytes());
        payload.extend_from_slice(content.as_bytes());
        Self {
            tnf: Tnf::WellKnown,
            record_type: b"T".to_vec(),
            id: None,
            payload,
        }
    }

    /// Well-known URI record (`U`): prefix code byte plus the remainder.
    /// Picks the longest matching prefix from [`URI_PREFIXES`].
    pub fn uri(uri: &str) -> Self {
        let mut code = 0u8;
        let mut rest = uri;
        // Skip the empty prefix at index 0; prefer the longest match.
        let mut best_len = 0;
        for (i, prefix) in URI_PREFIXES.iter().enumerate().skip(1) {
            if uri.starts_with(prefix) && prefix.len() > best_len {
                best_len = prefix.len();
                code = i as u8;
                rest = &uri[prefix.len()..];
            }
        }
        let mut payload = Vec::with_capacity(1 + rest.len());
        payload.push(code);
        payload.extend_from_slice(rest.as_bytes());
        Self {
            tnf: Tnf::WellKnown,
            record_type: b"U".to_vec(),
            id: None,
            payload,
        }
    }

    pub fn is_text(&self) -> bool {
        self.tnf == Tnf::WellKnown && self.record_type == b"T"
    }

    pub fn is_uri(&self) -> bool {
        self.tnf == Tnf::WellKnown && self.record_type == b"U"
    }

    /// Decode the text content of a `T` record.
    pub fn text_content(&self) -> Option<String> {
        if !self.is_text() || self.payload.is_empty() {
            return None;
        }
        let lang_len = (self.payload[0] & 0x3F) as usize;
        let text = self.payload.get(1 + lang_len..)?;
        String::from_utf8(text.to_vec()).ok()
    }

    /// Language code of a `T` record.
    pub fn language(&self) -> Option<String> {
        if !self.is_text() || self.payload.is_empty() {
            return None;
        }
        let lang_len = (self.payload[0] & 0x3F) as usize;
        let lang = self.payload.get(1..1 + lang_len)?;
        String::from_utf8(lang.to_vec()).ok()
    }

    /// Decode the full URI of a `U` record, expanding the prefix code.
    pub fn uri_content(&self) -> Option<String> {
        if !self.is_uri() || self.payload.is_empty() {
            return None;
        }
        let prefix = URI_PREFIXES
            .get(self.payload[0] as usize)
            .copied()
            .unwrap_or("");
        let rest = std::str::from_utf8(&self.payload[1..]).ok()?;
        Some(format!("{prefix}{rest}"))
    }

    /// Text of the record if it is a `T` or `U` record.
    pub fn content(&self) -> Option<String> {
        self.text_content().or_else(|| self.uri_content())
    }
}
