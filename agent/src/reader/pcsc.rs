//! PC/SC backend
//!
//! One [`PcscDevice`] wraps one reader. Card I/O goes through the reader's
//! APDU pipe: `FF CA` for the UID, `FF B0`/`FF D6` for storage-card block
//! reads and writes, `FF 82`/`FF 86` for MIFARE Classic sector auth.
//! All PC/SC calls are blocking and short; they run under
//! `tokio::task::block_in_place` so the polling task never stalls the
//! runtime.

use std::ffi::CString;

use async_trait::async_trait;
use pcsc::{Card, Context, Protocols, Scope, ShareMode};
use tracing::{debug, trace};

use super::{DeviceError, DeviceManager, TagDevice};
use crate::ndef::{self, NdefMessage};
use crate::tag::{self, Tag, uid};

pub const MANAGER_NAME: &str = "pcsc";
const TECHNOLOGY: &str = "ISO14443A";

/// Keys tried for MIFARE Classic sector auth, transport key first.
const COMMON_KEYS: [[u8; 6]; 4] = [
    [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
    [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5],
    [0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7],
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Data blocks of a Classic 1K, sector trailers skipped.
const CLASSIC_DATA_BLOCKS: [u8; 45] = [
    4, 5, 6, 8, 9, 10, 12, 13, 14, 16, 17, 18, 20, 21, 22, 24, 25, 26, 28, 29, 30, 32, 33, 34, 36,
    37, 38, 40, 41, 42, 44, 45, 46, 48, 49, 50, 52, 53, 54, 56, 57, 58, 60, 61, 62,
];

pub struct PcscManager;

impl PcscManager {
    pub fn new() -> Self {
        Self
    }

    fn list_blocking() -> Result<Vec<String>, DeviceError> {
        let ctx = Context::establish(Scope::User)?;
        let mut buf = [0u8; 4096];
        let names = ctx.list_readers(&mut buf)?;
        Ok(names.map(|n| n.to_string_lossy().into_owned()).collect())
    }

    fn open_blocking(path: String) -> Result<PcscDevice, DeviceError> {
        let ctx = Context::establish(Scope::User)?;
        let mut buf = [0u8; 4096];
        let readers: Vec<CString> = ctx.list_readers(&mut buf)?.map(CString::from).collect();
        if readers.is_empty() {
            return Err(DeviceError::NoReader);
        }
        let reader = if path.is_empty() {
            readers[0].clone()
        } else {
            readers
                .iter()
                .find(|r| r.to_string_lossy() == path)
                .cloned()
                .ok_or_else(|| DeviceError::NotFound(path.clone()))?
        };
        let reader_name = reader.to_string_lossy().into_owned();
        debug!(reader = %reader_name, "opened PC/SC reader");
        Ok(PcscDevice {
            ctx,
            reader,
            path: reader_name,
            card: None,
            card_type: String::new(),
        })
    }
}

impl Default for PcscManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceManager for PcscManager {
    fn name(&self) -> &str {
        MANAGER_NAME
    }

    async fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        tokio::task::spawn_blocking(Self::list_blocking)
            .await
            .map_err(|e| DeviceError::Other(e.to_string()))?
    }

    async fn open_device(&self, path: &str) -> Result<Box<dyn TagDevice>, DeviceError> {
        let path = path.to_string();
        let device = tokio::task::spawn_blocking(move || Self::open_blocking(path))
            .await
            .map_err(|e| DeviceError::Other(e.to_string()))??;
        Ok(Box::new(device))
    }
}

pub struct PcscDevice {
    ctx: Context,
    reader: CString,
    path: String,
    card: Option<Card>,
    /// Human type of the present card, drives the block-I/O strategy.
    card_type: String,
}

impl PcscDevice {
    fn connect_card(&mut self) -> Result<bool, DeviceError> {
        match self
            .ctx
            .connect(&self.reader, ShareMode::Shared, Protocols::ANY)
        {
            Ok(card) => {
                self.card = Some(card);
                Ok(true)
            }
            Err(pcsc::Error::NoSmartcard) | Err(pcsc::Error::RemovedCard) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn poll_blocking(&mut self) -> Result<Vec<Tag>, DeviceError> {
        if self.card.is_none() && !self.connect_card()? {
            self.card_type.clear();
            return Ok(Vec::new());
        }
        match self.identify() {
            Ok(tag) => Ok(vec![tag]),
            Err(DeviceError::Pcsc(
                pcsc::Error::RemovedCard | pcsc::Error::ResetCard | pcsc::Error::NoSmartcard,
            )) => {
                // Card left (or was re-tapped) mid-exchange; reconnect on the
                // next poll.
                self.card = None;
                self.card_type.clear();
                Ok(Vec::new())
            }
            Err(e) => {
                self.card = None;
                Err(e)
            }
        }
    }

    fn identify(&mut self) -> Result<Tag, DeviceError> {
        let card = self.card.as_ref().ok_or(DeviceError::Closed)?;
        let uid_raw = transmit(card, &[0xFF, 0xCA, 0x00, 0x00, 0x00])?;
        let uid = uid::normalize(&hex::encode(&uid_raw))
            .map_err(|e| DeviceError::Other(format!("bad UID from reader: {e}")))?;

        let mut names_buf = [0u8; 256];
        let mut atr_buf = [0u8; 64];
        let status = card
            .status2(&mut names_buf, &mut atr_buf)
            .map_err(DeviceError::from)?;
        self.card_type = card_type_from_atr(status.atr()).to_string();

        Ok(Tag::hardware(uid, self.card_type.clone(), TECHNOLOGY.into()))
    }

    fn is_classic(&self) -> bool {
        self.card_type.starts_with("MIFARE Classic") || self.card_type == "MIFARE Mini"
    }

    fn read_blocking(&mut self) -> Result<Option<Vec<u8>>, DeviceError> {
        let memory = if self.is_classic() {
            read_classic(self.card.as_ref().ok_or(DeviceError::Closed)?)?
        } else {
            read_type2(self.card.as_ref().ok_or(DeviceError::Closed)?)?
        };
        Ok(tag::message_bytes_from_memory(&memory))
    }

    fn write_blocking(&mut self, message: &NdefMessage) -> Result<(), DeviceError> {
        if self.card.is_none() && !self.connect_card()? {
            return Err(DeviceError::Other("no card on reader".into()));
        }
        if self.card_type.is_empty() {
            self.identify()?;
        }
        let framed = ndef::tlv::wrap(&message.encode());
        let card = self.card.as_ref().ok_or(DeviceError::Closed)?;
        if self.is_classic() {
            write_classic(card, &framed)
        } else {
            write_type2(card, &framed)
        }
    }
}

#[async_trait]
impl TagDevice for PcscDevice {
    fn path(&self) -> &str {
        &self.path
    }

    async fn get_tags(&mut self) -> Result<Vec<Tag>, DeviceError> {
        tokio::task::block_in_place(|| self.poll_blocking())
    }

    async fn read_message_bytes(&mut self) -> Result<Option<Vec<u8>>, DeviceError> {
        tokio::task::block_in_place(|| self.read_blocking())
    }

    async fn write_message(&mut self, message: &NdefMessage) -> Result<(), DeviceError> {
        tokio::task::block_in_place(|| self.write_blocking(message))
    }

    async fn transceive(&mut self, apdu: &[u8]) -> Result<Vec<u8>, DeviceError> {
        tokio::task::block_in_place(|| {
            let card = self.card.as_ref().ok_or(DeviceError::NoReader)?;
            transmit(card, apdu)
        })
    }

    async fn close(&mut self) {
        if let Some(card) = self.card.take() {
            let _ = card.disconnect(pcsc::Disposition::LeaveCard);
        }
        self.card_type.clear();
    }
}

/// Send an APDU and strip the `90 00` status word.
fn transmit(card: &Card, apdu: &[u8]) -> Result<Vec<u8>, DeviceError> {
    let mut buf = [0u8; pcsc::MAX_BUFFER_SIZE];
    let resp = card.transmit(apdu, &mut buf).map_err(DeviceError::from)?;
    if resp.len() >= 2 && resp[resp.len() - 2] == 0x90 && resp[resp.len() - 1] == 0x00 {
        Ok(resp[..resp.len() - 2].to_vec())
    } else {
        Err(DeviceError::Other(format!(
            "APDU rejected: {:02X?}",
            &resp[resp.len().saturating_sub(2)..]
        )))
    }
}

fn read_binary(card: &Card, block: u8, len: u8) -> Result<Vec<u8>, DeviceError> {
    transmit(card, &[0xFF, 0xB0, 0x00, block, len])
}

fn update_binary(card: &Card, block: u8, data: &[u8]) -> Result<(), DeviceError> {
    let mut apdu = vec![0xFF, 0xD6, 0x00, block, data.len() as u8];
    apdu.extend_from_slice(data);
    transmit(card, &apdu).map(|_| ())
}

fn load_key(card: &Card, key: &[u8; 6]) -> Result<(), DeviceError> {
    let mut apdu = vec![0xFF, 0x82, 0x00, 0x00, 0x06];
    apdu.extend_from_slice(key);
    transmit(card, &apdu).map(|_| ())
}

fn authenticate(card: &Card, block: u8, key_type: u8) -> Result<(), DeviceError> {
    transmit(
        card,
        &[0xFF, 0x86, 0x00, 0x00, 0x05, 0x01, 0x00, block, key_type, 0x00],
    )
    .map(|_| ())
}

fn auth_sector(card: &Card, block: u8) -> Result<(), DeviceError> {
    for key in &COMMON_KEYS {
        if load_key(card, key).is_ok() {
            // Key A, then key B
            if authenticate(card, block, 0x60).is_ok() || authenticate(card, block, 0x61).is_ok() {
                return Ok(());
            }
        }
    }
    Err(DeviceError::Other(format!(
        "authentication failed for sector {}",
        block / 4
    )))
}

/// Dump the data blocks of a MIFARE Classic tag until an all-zero block.
fn read_classic(card: &Card) -> Result<Vec<u8>, DeviceError> {
    let mut memory = Vec::new();
    for &block in &CLASSIC_DATA_BLOCKS {
        if block % 4 == 0 {
            auth_sector(card, block)?;
        }
        match read_binary(card, block, 16) {
            Ok(data) if data.iter().all(|&b| b == 0x00) => break,
            Ok(data) => memory.extend(data),
            Err(_) => break,
        }
    }
    Ok(memory)
}

/// Read a type 2 tag (NTAG/Ultralight): peek the TLV header on page 4,
/// then read exactly the pages the message length demands.
fn read_type2(card: &Card) -> Result<Vec<u8>, DeviceError> {
    let head = read_binary(card, 4, 16)?;
    if head.first() != Some(&0x03) {
        trace!("no NDEF TLV on tag");
        return Ok(head);
    }
    let (len, header) = if head.get(1) == Some(&0xFF) {
        let hi = *head.get(2).unwrap_or(&0) as usize;
        let lo = *head.get(3).unwrap_or(&0) as usize;
        ((hi << 8) | lo, 4)
    } else {
        (*head.get(1).unwrap_or(&0) as usize, 2)
    };

    let total = header + len;
    let mut memory = Vec::with_capacity(total + 4);
    let pages = total.div_ceil(4);
    for page in 0..pages {
        match read_binary(card, (4 + page) as u8, 4) {
            Ok(data) => memory.extend(data),
            Err(_) => break,
        }
    }
    if memory.len() < total {
        return Err(DeviceError::Other(
            "tag ended before NDEF length was reached".into(),
        ));
    }
    Ok(memory)
}

fn write_classic(card: &Card, data: &[u8]) -> Result<(), DeviceError> {
    let mut offset = 0;
    let mut block = 4u8;
    while offset < data.len() {
        if (block + 1) % 4 == 0 {
            // Sector trailer
            block += 1;
            continue;
        }
        if block % 4 == 0 {
            auth_sector(card, block)?;
        }
        let mut chunk = [0u8; 16];
        let take = (data.len() - offset).min(16);
        chunk[..take].copy_from_slice(&data[offset..offset + take]);
        update_binary(card, block, &chunk)?;
        offset += take;
        block += 1;
    }
    Ok(())
}

fn write_type2(card: &Card, data: &[u8]) -> Result<(), DeviceError> {
    let mut padded = data.to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0x00);
    }
    for (i, page) in padded.chunks(4).enumerate() {
        update_binary(card, (4 + i) as u8, page)?;
    }
    Ok(())
}

/// Map the PC/SC part 3 storage-card ATR onto a human card type. The RID
/// `A0 00 00 03 06` is followed by a standard byte and a two-byte card name.
pub fn card_type_from_atr(atr: &[u8]) -> &'static str {
    let Some(pos) = atr.windows(5).position(|w| w == [0xA0, 0x00, 0x00, 0x03, 0x06]) else {
        return "Unknown";
    };
    match atr.get(pos + 6..pos + 8) {
        Some([0x00, 0x01]) => "MIFARE Classic 1K",
        Some([0x00, 0x02]) => "MIFARE Classic 4K",
        Some([0x00, 0x03]) => "MIFARE Ultralight",
        Some([0x00, 0x26]) => "MIFARE Mini",
        Some([0x00, 0x3A]) => "MIFARE Ultralight C",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ACR122U ATR for a MIFARE Classic 1K.
    const CLASSIC_1K_ATR: [u8; 20] = [
        0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00, 0x01,
        0x00, 0x00, 0x00, 0x00, 0x6A,
    ];

    #[test]
    fn detects_classic_1k() {
        assert_eq!(card_type_from_atr(&CLASSIC_1K_ATR), "MIFARE Classic 1K");
    }

    #[test]
    fn detects_ultralight() {
        let mut atr = CLASSIC_1K_ATR;
        atr[14] = 0x03;
        assert_eq!(card_type_from_atr(&atr), "MIFARE Ultralight");
    }

    #[test]
    fn unknown_atr_is_unknown() {
        assert_eq!(card_type_from_atr(&[0x3B, 0x00]), "Unknown");
        assert_eq!(card_type_from_atr(&[]), "Unknown");
    }
}
