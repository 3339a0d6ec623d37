//! Remote device manager
//!
//! Phones and browsers register over the producer's reverse WebSocket and
//! then behave like readers: every `tagScanned` frame lands in the device's
//! bounded inbox, and the device is opened through the manager like any
//! other tag source. A background sweeper unregisters devices that stop
//! heartbeating.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{RegisterDevice, RemoteCapabilities};
use crate::reader::{DeviceError, DeviceManager, TagDevice};
use crate::tag::Tag;

pub const MANAGER_NAME: &str = "remote";
/// Bounded tag batches per device; scans are dropped, not queued, beyond it.
pub const INBOX_CAPACITY: usize = 10;
/// Devices idle longer than this are unregistered by the sweeper.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
/// Sweeper cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

const SUPPORTED_PLATFORMS: [&str; 2] = ["ios", "android"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("device name must not be empty")]
    EmptyName,
    #[error("unsupported platform {0:?}")]
    UnsupportedPlatform(String),
}

/// Snapshot of a registered device.
#[derive(Debug, Clone)]
pub struct RemoteDevice {
    pub id: Uuid,
    pub name: String,
    pub platform: String,
    pub app_version: String,
    pub capabilities: RemoteCapabilities,
    pub metadata: HashMap<String, String>,
    pub last_seen: DateTime<Utc>,
    pub card_present: bool,
    /// True while `last_seen` is within the inactivity timeout.
    pub active: bool,
}

struct DeviceEntry {
    name: String,
    platform: String,
    app_version: String,
    capabilities: RemoteCapabilities,
    metadata: HashMap<String, String>,
    last_seen: DateTime<Utc>,
    card_present: bool,
    inbox_tx: mpsc::Sender<Vec<Tag>>,
    /// Taken by the first `open_device` for this id.
    inbox_rx: Option<mpsc::Receiver<Vec<Tag>>>,
}

impl DeviceEntry {
    fn snapshot(&self, id: Uuid, timeout: Duration) -> RemoteDevice {
        let idle = Utc::now().signed_duration_since(self.last_seen);
        RemoteDevice {
            id,
            name: self.name.clone(),
            platform: self.platform.clone(),
            app_version: self.app_version.clone(),
            capabilities: self.capabilities.clone(),
            metadata: self.metadata.clone(),
            last_seen: self.last_seen,
            card_present: self.card_present,
            active: idle.to_std().map_or(true, |d| d < timeout),
        }
    }
}

pub struct RemoteDeviceManager {
    devices: RwLock<HashMap<Uuid, DeviceEntry>>,
    changes: broadcast::Sender<()>,
    inactivity_timeout: Duration,
    get_tags_timeout: Duration,
    sweeper: std::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl RemoteDeviceManager {
    pub fn new(inactivity_timeout: Duration) -> Self {
        let (changes, _) = broadcast::channel(4);
        Self {
            devices: RwLock::new(HashMap::new()),
            changes,
            inactivity_timeout,
            get_tags_timeout: Duration::from_millis(500),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    /// Validate a registration and add the device. Returns the minted id.
    pub async fn register(&self, reg: RegisterDevice) -> Result<Uuid, RegistrationError> {
        if reg.device_name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if !SUPPORTED_PLATFORMS.contains(&reg.platform.as_str()) {
            return Err(RegistrationError::UnsupportedPlatform(reg.platform));
        }

        let id = Uuid::new_v4();
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let entry = DeviceEntry {
            name: reg.device_name,
            platform: reg.platform,
            app_version: reg.app_version,
            capabilities: reg.capabilities,
            metadata: reg.metadata,
            last_seen: Utc::now(),
            card_present: false,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
        };
        self.devices.write().await.insert(id, entry);
        info!(device_id = %id, "remote device registered");
        let _ = self.changes.send(());
        Ok(id)
    }

    /// Drop a device. Closing the inbox unblocks any reader waiting in
    /// `get_tags`.
    pub async fn unregister(&self, id: Uuid) -> bool {
        let removed = self.devices.write().await.remove(&id).is_some();
        if removed {
            info!(device_id = %id, "remote device unregistered");
            let _ = self.changes.send(());
        }
        removed
    }

    /// Refresh a device's liveness timestamp.
    pub async fn heartbeat(&self, id: Uuid) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(&id) {
            Some(entry) => {
                entry.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Enqueue a batch of scanned tags. Returns `Ok(true)` when queued,
    /// `Ok(false)` when the inbox was full and the batch was dropped.
    pub async fn push_tags(&self, id: Uuid, tags: Vec<Tag>) -> Result<bool, DeviceError> {
        let mut devices = self.devices.write().await;
        let entry = devices
            .get_mut(&id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        entry.last_seen = Utc::now();
        entry.card_present = true;
        match entry.inbox_tx.try_send(tags) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(device_id = %id, "tag inbox full, dropping batch");
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeviceError::Closed),
        }
    }

    /// Record that the device no longer sees its tag.
    pub async fn tag_removed(&self, id: Uuid) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(&id) {
            Some(entry) => {
                entry.last_seen = Utc::now();
                entry.card_present = false;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<RemoteDevice> {
        self.devices
            .read()
            .await
            .get(&id)
            .map(|e| e.snapshot(id, self.inactivity_timeout))
    }

    pub async fn list(&self) -> Vec<RemoteDevice> {
        self.devices
            .read()
            .await
            .iter()
            .map(|(id, e)| e.snapshot(*id, self.inactivity_timeout))
            .collect()
    }

    /// Unregister every device idle past the inactivity timeout. Returns the
    /// removed ids.
    pub async fn sweep(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let mut removed = Vec::new();
        {
            let mut devices = self.devices.write().await;
            devices.retain(|id, entry| {
                let idle = now
                    .signed_duration_since(entry.last_seen)
                    .to_std()
                    .unwrap_or_default();
                if idle > self.inactivity_timeout {
                    warn!(device_id = %id, ?idle, "remote device timed out");
                    removed.push(*id);
                    false
                } else {
                    true
                }
            });
        }
        if !removed.is_empty() {
            let _ = self.changes.send(());
        }
        removed
    }

    /// Start the background liveness sweeper. Idempotent.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.sweeper.lock().expect("sweeper lock poisoned");
        if guard.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.sweep().await;
                    }
                }
            }
        });
        *guard = Some((shutdown_tx, task));
    }

    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().expect("sweeper lock poisoned").take();
        if let Some((shutdown_tx, task)) = sweeper {
            shutdown_tx.send_replace(true);
            let _ = task.await;
        }
        self.devices.write().await.clear();
    }
}

#[async_trait]
impl DeviceManager for RemoteDeviceManager {
    fn name(&self) -> &str {
        MANAGER_NAME
    }

    async fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        Ok(self
            .devices
            .read()
            .await
            .keys()
            .map(Uuid::to_string)
            .collect())
    }

    async fn open_device(&self, path: &str) -> Result<Box<dyn TagDevice>, DeviceError> {
        let id: Uuid = path
            .parse()
            .map_err(|_| DeviceError::NotFound(path.to_string()))?;
        let mut devices = self.devices.write().await;
        let entry = devices
            .get_mut(&id)
            .ok_or_else(|| DeviceError::NotFound(path.to_string()))?;
        let inbox_rx = entry
            .inbox_rx
            .take()
            .ok_or_else(|| DeviceError::Other(format!("remote device {id} is already open")))?;
        Ok(Box::new(RemoteTagDevice {
            path: format!("{MANAGER_NAME}:{id}"),
            inbox_rx,
            timeout: self.get_tags_timeout,
        }))
    }

    fn subscribe_changes(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.changes.subscribe())
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}

/// A registered remote device viewed as a tag source.
pub struct RemoteTagDevice {
    path: String,
    inbox_rx: mpsc::Receiver<Vec<Tag>>,
    timeout: Duration,
}

#[async_trait]
impl TagDevice for RemoteTagDevice {
    fn path(&self) -> &str {
        &self.path
    }

    /// Wait briefly for the next pushed batch: empty on timeout, closed
    /// error once the device is unregistered.
    async fn get_tags(&mut self) -> Result<Vec<Tag>, DeviceError> {
        match tokio::time::timeout(self.timeout, self.inbox_rx.recv()).await {
            Ok(Some(batch)) => Ok(batch),
            Ok(None) => Err(DeviceError::Closed),
            Err(_) => Ok(Vec::new()),
        }
    }
}
