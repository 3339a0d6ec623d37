//! Type 2 tag TLV framing
//!
//! On NTAG/Ultralight and NDEF-formatted Classic tags the message sits
//! inside a TLV block: tag `0x03`, one- or three-byte length, value,
//! `0xFE` terminator.

use super::NdefError;

const TLV_NULL: u8 = 0x00;
const TLV_NDEF: u8 = 0x03;
const TLV_TERMINATOR: u8 = 0xFE;

/// Wrap encoded NDEF message bytes in an NDEF TLV block.
pub fn wrap(ndef: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ndef.len() + 4);
    out.push(TLV_NDEF);
    if ndef.len() < 0xFF {
        out.push(ndef.len() as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(ndef.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(ndef);
    out.push(TLV_TERMINATOR);
    out
}

/// Extract the NDEF message bytes from tag memory.
///
/// Leading null TLVs are skipped; anything before the first `0x03` tag is
/// ignored, which also tolerates the lock-control TLVs some tags carry.
pub fn unwrap(memory: &[u8]) -> Result<Vec<u8>, NdefError> {
    let start = memory
        .iter()
        .position(|&b| b == TLV_NDEF)
        .ok_or(NdefError::NoTlvBlock)?;

    let mut cursor = start + 1;
    let len = match memory.get(cursor) {
        None => return Err(NdefError::TruncatedTlv),
        Some(&0xFF) => {
            let raw = memory
                .get(cursor + 1..cursor + 3)
                .ok_or(NdefError::TruncatedTlv)?;
            cursor += 3;
            u16::from_be_bytes([raw[0], raw[1]]) as usize
        }
        Some(&len) => {
            cursor += 1;
            len as usize
        }
    };

    memory
        .get(cursor..cursor + len)
        .map(<[u8]>::to_vec)
        .ok_or(NdefError::TruncatedTlv)
}

/// True when the memory dump contains no NDEF TLV at all, e.g. a blank tag.
pub fn is_blank(memory: &[u8]) -> bool {
    memory
        .iter()
        .all(|&b| b == TLV_NULL || b == TLV_TERMINATOR)
}
