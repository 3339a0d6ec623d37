//! Reader abstraction
//!
//! [`DeviceManager`] enumerates and opens tag sources; [`TagDevice`] is one
//! opened source. The PC/SC backend and the remote pseudo-devices both
//! implement these traits, so the polling loop and the producer server
//! never care where a tag came from.

pub mod cache;
pub mod pcsc;
pub mod poll;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::ndef::NdefMessage;
use crate::tag::Tag;

pub use poll::{Reader, ReaderConfig};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("no reader available")]
    NoReader,
    #[error("device closed")]
    Closed,
    #[error("operation timed out")]
    Timeout,
    #[error("operation not supported by this device")]
    Unsupported,
    #[error("smart-card error: {0}")]
    Pcsc(#[from] ::pcsc::Error),
    #[error("{0}")]
    Other(String),
}

/// Enumerates devices of one kind and opens them by address.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Short name used as the address prefix, e.g. `pcsc` or `remote`.
    fn name(&self) -> &str;

    /// Addresses of currently attached devices, without the manager prefix.
    async fn list_devices(&self) -> Result<Vec<String>, DeviceError>;

    /// Open a device. An empty path means "first available".
    async fn open_device(&self, path: &str) -> Result<Box<dyn TagDevice>, DeviceError>;

    /// Device attach/detach notifications, when the manager supports them.
    fn subscribe_changes(&self) -> Option<broadcast::Receiver<()>> {
        None
    }

    /// Release manager-held resources.
    async fn close(&self) {}
}

/// One opened tag source.
#[async_trait]
pub trait TagDevice: Send {
    fn path(&self) -> &str;

    /// Tags currently visible. For polling sources this returns the present
    /// card (or nothing); for remote devices it blocks briefly for the next
    /// pushed batch and returns empty on timeout.
    async fn get_tags(&mut self) -> Result<Vec<Tag>, DeviceError>;

    /// Read the present tag's NDEF message bytes (TLV stripped). `None`
    /// when the tag is blank. Sources that push content inline return
    /// `Ok(None)`.
    async fn read_message_bytes(&mut self) -> Result<Option<Vec<u8>>, DeviceError> {
        Ok(None)
    }

    /// Overwrite the present tag's message.
    async fn write_message(&mut self, _message: &NdefMessage) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported)
    }

    /// Raw APDU exchange with the present tag.
    async fn transceive(&mut self, _apdu: &[u8]) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::Unsupported)
    }

    async fn close(&mut self) {}
}

/// Recovery policy classes for reader-loop failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with exponential backoff; long cooldown when retries exhaust.
    Transient,
    /// Close the handle and force a reconnect after a short delay.
    IoGone,
    /// Like [`FailureClass::IoGone`] but behind a 10s cooldown — the ACR122
    /// family wedges its USB pipe and needs the breather.
    AcrIoGone,
    /// Driver lost the device node; reconnect immediately.
    DeviceConfig,
    /// Surface the error to clients and keep polling.
    Unknown,
}

/// Map a device error onto the recovery policy. `pcsc::Error` variants carry
/// most of the signal; the string table catches driver messages that only
/// surface as text.
pub fn classify_failure(err: &DeviceError) -> FailureClass {
    match err {
        DeviceError::Timeout | DeviceError::Closed => FailureClass::Transient,
        DeviceError::Pcsc(e) => match e {
            ::pcsc::Error::Timeout => FailureClass::Transient,
            ::pcsc::Error::ReaderUnavailable
            | ::pcsc::Error::UnknownReader
            | ::pcsc::Error::NoService
            | ::pcsc::Error::ServiceStopped => FailureClass::IoGone,
            ::pcsc::Error::CommError => FailureClass::AcrIoGone,
            _ => classify_message(&e.to_string()),
        },
        DeviceError::Other(msg) => classify_message(msg),
        _ => FailureClass::Unknown,
    }
}

fn classify_message(msg: &str) -> FailureClass {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("operation timed out")
        || lower.contains("device closed")
        || lower.contains("unable to write to usb")
    {
        FailureClass::Transient
    } else if lower.contains("operation not permitted")
        || lower.contains("broken pipe")
        || lower.contains("rdr_to_pc_datablock")
    {
        FailureClass::AcrIoGone
    } else if lower.contains("input/output error") {
        FailureClass::IoGone
    } else if lower.contains("device not configured") {
        FailureClass::DeviceConfig
    } else {
        FailureClass::Unknown
    }
}
