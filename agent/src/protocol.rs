//! WebSocket protocol codec
//!
//! Both sockets speak JSON envelopes `{id?, type, payload}`; replies carry
//! `success`/`error` beside the type. The typed payload structs here are the
//! single source of truth for field naming on the wire — everything else in
//! the agent works with the domain types from [`crate::tag`] and
//! [`crate::ndef`] and converts at this boundary.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::ndef::{NdefMessage, NdefRecord};
use crate::tag::{Card, CardMessage, DeviceStatus, Tag, uid};

/// Message type discriminators.
pub mod kind {
    pub const REGISTER_DEVICE: &str = "registerDevice";
    pub const REGISTER_DEVICE_RESPONSE: &str = "registerDeviceResponse";
    pub const TAG_SCANNED: &str = "tagScanned";
    pub const TAG_REMOVED: &str = "tagRemoved";
    pub const DEVICE_HEARTBEAT: &str = "deviceHeartbeat";
    pub const TAG_DATA: &str = "tagData";
    pub const DEVICE_STATUS: &str = "deviceStatus";
    pub const WRITE_REQUEST: &str = "writeRequest";
    pub const WRITE_RESPONSE: &str = "writeResponse";
    pub const ERROR: &str = "error";
}

/// Machine-readable error codes carried in `error` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    WriteFailed,
    UnknownType,
    ParseError,
    InvalidPayload,
    InvalidWriteRequest,
    InvalidRegistration,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no payload")]
    MissingPayload,
}

/// The outer JSON frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn event<T: Serialize>(kind: &str, payload: &T) -> Self {
        Self {
            id: None,
            kind: kind.to_string(),
            success: None,
            error: None,
            payload: serde_json::to_value(payload).ok(),
        }
    }

    /// Successful `writeResponse` echoing the request id.
    pub fn write_response(id: Option<String>) -> Self {
        Self {
            id,
            kind: kind::WRITE_RESPONSE.to_string(),
            success: Some(true),
            error: None,
            payload: None,
        }
    }

    /// `error` frame with a machine-readable code. Keeps the session open.
    pub fn error(id: Option<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            id,
            kind: kind::ERROR.to_string(),
            success: Some(false),
            error: Some(message.into()),
            payload: serde_json::to_value(ErrorPayload { code }).ok(),
        }
    }

    pub fn reply<T: Serialize>(id: Option<String>, kind: &str, payload: &T) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            success: Some(true),
            error: None,
            payload: serde_json::to_value(payload).ok(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        let payload = self.payload.clone().ok_or(ProtocolError::MissingPayload)?;
        Ok(serde_json::from_value(payload)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
}

// ---- device-facing payloads ------------------------------------------------

/// First frame a remote device must send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDevice {
    pub device_name: String,
    pub platform: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub capabilities: RemoteCapabilities,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCapabilities {
    #[serde(default)]
    pub can_read: bool,
    #[serde(default)]
    pub can_write: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfc_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceResponse {
    #[serde(rename = "deviceID")]
    pub device_id: Uuid,
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    #[serde(rename = "supportedNFC")]
    pub supported_nfc: Vec<String>,
}

/// Tag data pushed by a remote device (`tagScanned`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagData {
    #[serde(rename = "deviceID")]
    pub device_id: Uuid,
    pub uid: String,
    #[serde(default)]
    pub technology: String,
    #[serde(rename = "type", default)]
    pub tag_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr: Option<String>,
    pub scanned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ndef_message: Option<WireNdefMessage>,
    /// Base64-encoded raw tag bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
}

impl TagData {
    /// Convert to a domain [`Tag`], normalizing the UID. The tag keeps the
    /// parsed message when the device sent one, otherwise the raw bytes.
    pub fn into_tag(self) -> Result<Tag, uid::UidError> {
        let normalized = uid::normalize(&self.uid)?;
        let mut tag = Tag::remote(self.device_id, normalized, self.tag_type, self.technology);
        tag.scanned_at = self.scanned_at;
        if let Some(wire) = self.ndef_message {
            let records: Vec<NdefRecord> = wire.records.iter().filter_map(WireNdefRecord::to_ndef).collect();
            if !records.is_empty() {
                tag = tag.with_message(NdefMessage::new(records));
            }
        }
        if let Some(raw) = self.raw_data.as_deref() {
            if let Ok(bytes) = BASE64.decode(raw) {
                if let Some(msg) = crate::tag::message_bytes_from_memory(&bytes) {
                    tag = tag.with_raw(msg);
                }
            }
        }
        Ok(tag)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireNdefMessage {
    #[serde(default)]
    pub records: Vec<WireNdefRecord>,
}

/// A record on the wire: either pre-decoded (`recordType` + `content`) or
/// raw (`tnf`/`type`/`payload`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireNdefRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tnf: Option<u8>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub raw_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Base64-encoded raw payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl WireNdefRecord {
    pub fn to_ndef(&self) -> Option<NdefRecord> {
        match (self.record_type.as_deref(), self.content.as_deref()) {
            (Some("text"), Some(content)) => {
                Some(NdefRecord::text(content, self.language.as_deref().unwrap_or("en")))
            }
            (Some("uri"), Some(content)) => Some(NdefRecord::uri(content)),
            _ => {
                let payload = BASE64.decode(self.payload.as_deref()?).ok()?;
                Some(NdefRecord {
                    tnf: crate::ndef::Tnf::from_bits(self.tnf.unwrap_or(0x01)),
                    record_type: self.raw_type.as_deref().unwrap_or("").as_bytes().to_vec(),
                    id: self.id.as_deref().map(|i| i.as_bytes().to_vec()),
                    payload,
                })
            }
        }
    }
}

// ---- client-facing payloads ------------------------------------------------

/// `writeRequest` payload from a client. The written message always
/// replaces the tag's previous content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequestPayload {
    pub records: Vec<WriteRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRecord {
    #[serde(rename = "type")]
    pub kind: WriteRecordKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteRecordKind {
    Text,
    Uri,
}

impl WriteRecord {
    pub fn to_ndef(&self) -> NdefRecord {
        match self.kind {
            WriteRecordKind::Text => {
                NdefRecord::text(&self.content, self.language.as_deref().unwrap_or("en"))
            }
            WriteRecordKind::Uri => NdefRecord::uri(&self.content),
        }
    }
}

/// Build the NDEF message a write request describes.
pub fn build_write_message(records: &[WriteRecord]) -> NdefMessage {
    NdefMessage::new(records.iter().map(WriteRecord::to_ndef).collect())
}

/// `tagData` payload broadcast to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagPayload {
    pub uid: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub tag_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub technology: String,
    #[serde(rename = "scannedAt", default, skip_serializing_if = "Option::is_none")]
    pub scanned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ClientMessage>,
    pub text: String,
    /// Always serialized, `null` on the success path.
    pub err: Option<String>,
}

impl TagPayload {
    pub fn from_card(card: &Card) -> Self {
        let message = card.read_message().map(|m| match m {
            CardMessage::Ndef(msg) => ClientMessage::Ndef {
                records: msg.records.iter().map(ClientRecord::from_ndef).collect(),
            },
            CardMessage::Raw(data) => ClientMessage::Raw { data },
        });
        Self {
            uid: card.tag.uid.clone(),
            tag_type: card.tag.tag_type.clone(),
            technology: card.tag.technology.clone(),
            scanned_at: Some(card.tag.scanned_at),
            message,
            text: card.text(),
            err: None,
        }
    }

    pub fn from_error(err: impl Into<String>) -> Self {
        Self {
            uid: String::new(),
            tag_type: String::new(),
            technology: String::new(),
            scanned_at: None,
            message: None,
            text: String::new(),
            err: Some(err.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ndef { records: Vec<ClientRecord> },
    Raw { data: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Base64 of the raw payload, for records we cannot decode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl ClientRecord {
    pub fn from_ndef(rec: &NdefRecord) -> Self {
        let record_type = String::from_utf8_lossy(&rec.record_type).into_owned();
        match rec.content() {
            Some(content) => Self {
                record_type,
                content: Some(content),
                language: rec.language(),
                payload: None,
            },
            None => Self {
                record_type,
                content: None,
                language: None,
                payload: Some(BASE64.encode(&rec.payload)),
            },
        }
    }
}

/// `deviceStatus` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusPayload {
    pub connected: bool,
    pub message: String,
    pub card_present: bool,
}

impl From<&DeviceStatus> for DeviceStatusPayload {
    fn from(status: &DeviceStatus) -> Self {
        Self {
            connected: status.connected,
            message: status.message.clone(),
            card_present: status.card_present,
        }
    }
}

// ---- HTTP tag injection ----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagInputRequest {
    pub uid: String,
    #[serde(rename = "type", default)]
    pub tag_type: Option<String>,
    #[serde(default)]
    pub technology: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub records: Option<Vec<WriteRecord>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagInputResponse {
    pub status: String,
    pub uid: String,
}
