//! NDEF message codec
//!
//! Record-level model in [`record`], message framing here, type 2 tag TLV
//! framing in [`tlv`]. The encoder always produces a complete message
//! (MB set on the first record, ME on the last); writes through the agent
//! overwrite the tag's previous message entirely.

mod record;
pub mod tlv;

pub use record::{NdefError, NdefRecord, Tnf, URI_PREFIXES};

/// An ordered sequence of NDEF records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NdefMessage {
    pub records: Vec<NdefRecord>,
}

impl NdefMessage {
    pub fn new(records: Vec<NdefRecord>) -> Self {
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First `T` record's text, falling back to the first `U` record's URI.
    pub fn first_text(&self) -> Option<String> {
        self.records
            .iter()
            .find_map(|r| r.text_content())
            .or_else(|| self.records.iter().find_map(|r| r.uri_content()))
    }

    /// Serialize the message. Short-record form is used for payloads under
    /// 256 bytes, the four-byte length form otherwise.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let last = self.records.len().saturating_sub(1);
        for (i, rec) in self.records.iter().enumerate() {
            let short = rec.payload.len() < 256;
            let mut header = rec.tnf as u8;
            if i == 0 {
                header |= 0x80; // MB
            }
            if i == last {
                header |= 0x40; // ME
            }
            if short {
                header |= 0x10; // SR
            }
            if rec.id.is_some() {
                header |= 0x08; // IL
            }
            out.push(header);
            out.push(rec.record_type.len() as u8);
            if short {
                out.push(rec.payload.len() as u8);
            } else {
                out.extend_from_slice(&(rec.payload.len() as u32).to_be_bytes());
            }
            if let Some(id) = &rec.id {
                out.push(id.len() as u8);
            }
            out.extend_from_slice(&rec.record_type);
            if let Some(id) = &rec.id {
                out.extend_from_slice(id);
            }
            out.extend_from_slice(&rec.payload);
        }
        out
    }

    /// Parse a complete NDEF message from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, NdefError> {
        if bytes.is_empty() {
            return Err(NdefError::EmptyBuffer);
        }
        let mut records = Vec::new();
        let mut pos = 0usize;
        loop {
            if pos >= bytes.len() {
                // Ran out of input without seeing ME. Tolerate it when we
                // already parsed at least one record: some writers omit the
                // flag on single-record messages.
                if records.is_empty() {
                    return Err(NdefError::UnterminatedMessage);
                }
                return Ok(Self { records });
            }
            let header = bytes[pos];
            if header & 0x20 != 0 {
                return Err(NdefError::ChunkedRecord);
            }
            let short = header & 0x10 != 0;
            let has_id = header & 0x08 != 0;
            let message_end = header & 0x40 != 0;

            let mut cursor = pos + 1;
            let type_len = *bytes.get(cursor).ok_or(NdefError::TruncatedHeader)? as usize;
            cursor += 1;

            let payload_len = if short {
                let len = *bytes.get(cursor).ok_or(NdefError::TruncatedHeader)? as usize;
                cursor += 1;
                len
            } else {
                let raw = bytes
                    .get(cursor..cursor + 4)
                    .ok_or(NdefError::TruncatedHeader)?;
                cursor += 4;
                u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
            };

            let id_len = if has_id {
                let len = *bytes.get(cursor).ok_or(NdefError::TruncatedHeader)? as usize;
                cursor += 1;
                len
            } else {
                0
            };

            let record_type = bytes
                .get(cursor..cursor + type_len)
                .ok_or(NdefError::TruncatedPayload)?
                .to_vec();
            cursor += type_len;

            let id = if has_id {
                let id = bytes
                    .get(cursor..cursor + id_len)
                    .ok_or(NdefError::TruncatedPayload)?
                    .to_vec();
                cursor += id_len;
                Some(id)
            } else {
                None
            };

            let payload = bytes
                .get(cursor..cursor + payload_len)
                .ok_or(NdefError::TruncatedPayload)?
                .to_vec();
            cursor += payload_len;

            records.push(NdefRecord {
                tnf: Tnf::from_bits(header),
                record_type,
                id,
                payload,
            });

            if message_end {
                return Ok(Self { records });
            }
            pos = cursor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_text_record_round_trip() {
        let msg = NdefMessage::new(vec![NdefRecord::text("Hello", "en")]);
        let bytes = msg.encode();
        // MB | ME | SR | WellKnown
        assert_eq!(bytes[0], 0xD1);
        let decoded = NdefMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.first_text().as_deref(), Some("Hello"));
    }

    #[test]
    fn multi_record_flags() {
        let msg = NdefMessage::new(vec![
            NdefRecord::text("a", "en"),
            NdefRecord::uri("https://example.com"),
        ]);
        let bytes = msg.encode();
        assert_eq!(bytes[0] & 0xC0, 0x80, "first record: MB only");
        let decoded = NdefMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.records.len(), 2);
        assert!(decoded.records[1].is_uri());
    }

    #[test]
    fn long_record_uses_four_byte_length() {
        let body = "x".repeat(600);
        let msg = NdefMessage::new(vec![NdefRecord::text(&body, "en")]);
        let bytes = msg.encode();
        assert_eq!(bytes[0] & 0x10, 0, "SR must be clear");
        let decoded = NdefMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.records[0].text_content().unwrap(), body);
    }

    #[test]
    fn first_text_prefers_text_over_uri() {
        let msg = NdefMessage::new(vec![
            NdefRecord::uri("https://example.com"),
            NdefRecord::text("hello", "en"),
        ]);
        assert_eq!(msg.first_text().as_deref(), Some("hello"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(NdefMessage::decode(&[]), Err(NdefError::EmptyBuffer));
        // SR text record claiming a payload longer than the buffer
        assert_eq!(
            NdefMessage::decode(&[0xD1, 0x01, 0x7F, b'T']),
            Err(NdefError::TruncatedPayload)
        );
    }
}
