//! Physical reader polling loop
//!
//! Owns exactly one device handle and emits tag and status events on
//! broadcast channels. Single task, cooperative: polls at 100ms while idle
//! and 250ms while a card is present, with a 2s reconnect ticker, a 250ms
//! presence reconciliation ticker and a one-shot cooldown after driver
//! failures. Writes arrive over a single-slot operation channel, so the
//! read phase is naturally skipped while a write is in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::cache::TagCache;
use super::{DeviceError, DeviceManager, FailureClass, TagDevice, classify_failure};
use crate::ndef::NdefMessage;
use crate::tag::{Card, DeviceStatus, NfcData, Tag};

/// Shared allowed-card-type set; `None` admits everything.
pub type TypeFilter = Arc<RwLock<Option<HashSet<String>>>>;

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub idle_poll: Duration,
    pub present_poll: Duration,
    pub device_check: Duration,
    pub presence_check: Duration,
    pub presence_window: Duration,
    pub operation_timeout: Duration,
    pub reconnect_delay: Duration,
    pub acr_cooldown: Duration,
    pub exhausted_cooldown: Duration,
    pub max_transient_retries: u32,
    pub backoff_base: Duration,
    pub unknown_error_pause: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(100),
            present_poll: Duration::from_millis(250),
            device_check: Duration::from_secs(2),
            presence_check: Duration::from_millis(250),
            presence_window: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
            acr_cooldown: Duration::from_secs(10),
            exhausted_cooldown: Duration::from_secs(30),
            max_transient_retries: 5,
            backoff_base: Duration::from_millis(500),
            unknown_error_pause: Duration::from_secs(1),
        }
    }
}

enum ReaderOp {
    Write {
        message: NdefMessage,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
}

/// Handle to a running polling loop.
pub struct Reader {
    op_tx: mpsc::Sender<ReaderOp>,
    tag_events: broadcast::Sender<NfcData>,
    status_events: broadcast::Sender<DeviceStatus>,
    status: watch::Receiver<DeviceStatus>,
    path: watch::Receiver<String>,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Reader {
    /// Start a polling loop over a device from `manager`. An empty
    /// `device_path` autodetects the first available device.
    pub fn spawn(
        manager: Arc<dyn DeviceManager>,
        device_path: impl Into<String>,
        filter: TypeFilter,
        config: ReaderConfig,
    ) -> Self {
        let device_path = device_path.into();
        let (op_tx, op_rx) = mpsc::channel(1);
        let (tag_events, _) = broadcast::channel(32);
        let (status_events, _) = broadcast::channel(32);
        let (status_tx, status_rx) = watch::channel(DeviceStatus::disconnected("Reader not connected"));
        let (path_tx, path_rx) = watch::channel(device_path.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let poll_loop = PollLoop {
            manager,
            requested_path: device_path,
            cache: TagCache::new(config.presence_window),
            config,
            device: None,
            card_present: false,
            transient_retries: 0,
            cooldown_until: None,
            tag_events: tag_events.clone(),
            status_events: status_events.clone(),
            status_watch: status_tx,
            path_watch: path_tx,
            filter,
            last_status: DeviceStatus::disconnected("Reader not connected"),
        };
        let task = tokio::spawn(poll_loop.run(op_rx, shutdown_rx));

        Self {
            op_tx,
            tag_events,
            status_events,
            status: status_rx,
            path: path_rx,
            shutdown: shutdown_tx,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    pub fn subscribe_tags(&self) -> broadcast::Receiver<NfcData> {
        self.tag_events.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<DeviceStatus> {
        self.status_events.subscribe()
    }

    pub fn current_status(&self) -> DeviceStatus {
        self.status.borrow().clone()
    }

    /// Resolved device path; the requested path until a device is opened.
    pub fn device_path(&self) -> String {
        self.path.borrow().clone()
    }

    /// Overwrite the present tag's NDEF message. Serialized with polling
    /// through the loop's operation channel; bounded by the operation
    /// timeout.
    pub async fn write_message(&self, message: NdefMessage) -> Result<(), DeviceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.op_tx
            .send(ReaderOp::Write {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DeviceError::Closed)?;
        reply_rx.await.map_err(|_| DeviceError::Closed)?
    }

    /// Stop the loop; the device handle is closed exactly once and a final
    /// `connected=false` status is emitted.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().expect("reader task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct PollLoop {
    manager: Arc<dyn DeviceManager>,
    requested_path: String,
    config: ReaderConfig,
    cache: TagCache,
    device: Option<Box<dyn TagDevice>>,
    card_present: bool,
    transient_retries: u32,
    cooldown_until: Option<Instant>,
    tag_events: broadcast::Sender<NfcData>,
    status_events: broadcast::Sender<DeviceStatus>,
    status_watch: watch::Sender<DeviceStatus>,
    path_watch: watch::Sender<String>,
    filter: TypeFilter,
    last_status: DeviceStatus,
}

impl PollLoop {
    async fn run(
        mut self,
        mut op_rx: mpsc::Receiver<ReaderOp>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut device_check = tokio::time::interval(self.config.device_check);
        device_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut presence_check = tokio::time::interval(self.config.presence_check);
        presence_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.try_connect().await;

        loop {
            let poll_delay = if self.card_present {
                self.config.present_poll
            } else {
                self.config.idle_poll
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                Some(op) = op_rx.recv() => self.handle_op(op).await,
                _ = device_check.tick() => self.maybe_reconnect().await,
                _ = presence_check.tick() => self.reconcile_presence(),
                _ = tokio::time::sleep(poll_delay), if self.device.is_some() => {
                    self.poll_once().await;
                }
            }
        }

        self.close_device("Reader stopped").await;
    }

    async fn try_connect(&mut self) {
        match self.manager.open_device(&self.requested_path).await {
            Ok(device) => {
                info!(path = %device.path(), "reader connected");
                self.path_watch.send_replace(device.path().to_string());
                self.device = Some(device);
                self.cache.clear();
                self.card_present = false;
                self.transient_retries = 0;
                self.cooldown_until = None;
                self.emit_status(DeviceStatus::connected("Reader connected"));
            }
            Err(err) => {
                debug!(error = %err, "reader not available");
            }
        }
    }

    async fn maybe_reconnect(&mut self) {
        if self.device.is_some() {
            return;
        }
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                return;
            }
            self.cooldown_until = None;
        }
        self.try_connect().await;
    }

    fn reconcile_presence(&mut self) {
        let present = self.cache.is_card_present();
        if present == self.card_present {
            return;
        }
        self.card_present = present;
        let message = if present { "Card detected" } else { "Card removed" };
        let status = DeviceStatus {
            connected: self.device.is_some(),
            message: message.to_string(),
            card_present: present,
        };
        self.emit_status(status);
    }

    async fn poll_once(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };
        match device.get_tags().await {
            Ok(tags) => {
                self.transient_retries = 0;
                if !tags.is_empty() {
                    self.cache.mark_seen();
                }
                let filter = self.filter.read().await.clone();
                for tag in tags {
                    self.handle_tag(device.as_mut(), tag, filter.as_ref()).await;
                }
                self.device = Some(device);
            }
            Err(err) => {
                self.device = Some(device);
                self.handle_poll_error(err).await;
            }
        }
    }

    async fn handle_tag(
        &mut self,
        device: &mut dyn TagDevice,
        mut tag: Tag,
        filter: Option<&HashSet<String>>,
    ) {
        if let Some(allowed) = filter {
            if !allowed.contains(&tag.tag_type) {
                // One rejection event per (uid, type) until the filter or
                // the card changes.
                let marker = format!("rejected:{}", tag.tag_type);
                if self.cache.has_changed(&tag.uid, &marker) {
                    self.emit_tag(NfcData::error(format!(
                        "card type '{}' not allowed by filter",
                        tag.tag_type
                    )));
                }
                return;
            }
        }

        if tag.raw.is_none() && tag.message.is_none() && tag.capabilities.can_read {
            match device.read_message_bytes().await {
                Ok(Some(raw)) => tag.raw = Some(raw),
                Ok(None) => {}
                Err(err) => {
                    debug!(uid = %tag.uid, error = %err, "NDEF read failed");
                }
            }
        }

        let card = Card::new(tag);
        let text = card.text();
        if self.cache.has_changed(&card.tag.uid, &text) {
            self.emit_tag(NfcData::card(card));
        }
    }

    async fn handle_poll_error(&mut self, err: DeviceError) {
        match classify_failure(&err) {
            FailureClass::Transient => {
                self.transient_retries += 1;
                if self.transient_retries >= self.config.max_transient_retries {
                    warn!(error = %err, "transient errors exhausted retries");
                    self.close_device("Reader unresponsive").await;
                    self.cooldown_until = Some(Instant::now() + self.config.exhausted_cooldown);
                    self.transient_retries = 0;
                } else {
                    let backoff =
                        self.config.backoff_base * 2u32.pow(self.transient_retries - 1);
                    debug!(error = %err, ?backoff, "transient error, backing off");
                    tokio::time::sleep(backoff).await;
                }
            }
            FailureClass::IoGone => {
                warn!(error = %err, "reader I/O lost, reconnecting");
                self.close_device("Reader disconnected").await;
                self.cooldown_until = Some(Instant::now() + self.config.reconnect_delay);
            }
            FailureClass::AcrIoGone => {
                warn!(error = %err, "reader USB pipe wedged, cooling down");
                self.close_device("Reader disconnected").await;
                self.cooldown_until = Some(Instant::now() + self.config.acr_cooldown);
            }
            FailureClass::DeviceConfig => {
                warn!(error = %err, "device node lost, reconnecting");
                self.close_device("Reader disconnected").await;
                self.cooldown_until = None;
            }
            FailureClass::Unknown => {
                self.emit_tag(NfcData::error(err.to_string()));
                tokio::time::sleep(self.config.unknown_error_pause).await;
            }
        }
    }

    async fn handle_op(&mut self, op: ReaderOp) {
        match op {
            ReaderOp::Write { message, reply } => {
                let result = match self.device.take() {
                    None => Err(DeviceError::NoReader),
                    Some(mut device) => {
                        let result = match tokio::time::timeout(
                            self.config.operation_timeout,
                            device.write_message(&message),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(DeviceError::Timeout),
                        };
                        self.device = Some(device);
                        result
                    }
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn close_device(&mut self, reason: &str) {
        if let Some(mut device) = self.device.take() {
            device.close().await;
        }
        self.card_present = false;
        self.cache.clear();
        self.emit_status(DeviceStatus::disconnected(reason));
    }

    fn emit_status(&mut self, status: DeviceStatus) {
        if status == self.last_status {
            return;
        }
        self.last_status = status.clone();
        self.status_watch.send_replace(status.clone());
        let _ = self.status_events.send(status);
    }

    fn emit_tag(&mut self, data: NfcData) {
        let _ = self.tag_events.send(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Script = Arc<Mutex<VecDeque<Result<Vec<Tag>, DeviceError>>>>;

    struct ScriptDevice {
        script: Script,
        writes: Arc<Mutex<Vec<NdefMessage>>>,
    }

    #[async_trait]
    impl TagDevice for ScriptDevice {
        fn path(&self) -> &str {
            "script:0"
        }

        async fn get_tags(&mut self) -> Result<Vec<Tag>, DeviceError> {
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn write_message(&mut self, message: &NdefMessage) -> Result<(), DeviceError> {
            self.writes.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct ScriptManager {
        script: Script,
        writes: Arc<Mutex<Vec<NdefMessage>>>,
        available: bool,
    }

    #[async_trait]
    impl DeviceManager for ScriptManager {
        fn name(&self) -> &str {
            "script"
        }

        async fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
            Ok(if self.available { vec!["0".into()] } else { vec![] })
        }

        async fn open_device(&self, _path: &str) -> Result<Box<dyn TagDevice>, DeviceError> {
            if !self.available {
                return Err(DeviceError::NoReader);
            }
            Ok(Box::new(ScriptDevice {
                script: self.script.clone(),
                writes: self.writes.clone(),
            }))
        }
    }

    fn fast_config() -> ReaderConfig {
        ReaderConfig {
            idle_poll: Duration::from_millis(5),
            present_poll: Duration::from_millis(5),
            device_check: Duration::from_millis(20),
            presence_check: Duration::from_millis(10),
            presence_window: Duration::from_millis(50),
            operation_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(20),
            acr_cooldown: Duration::from_millis(40),
            exhausted_cooldown: Duration::from_millis(40),
            max_transient_retries: 2,
            backoff_base: Duration::from_millis(1),
            unknown_error_pause: Duration::from_millis(5),
        }
    }

    fn sample_tag() -> Tag {
        Tag::hardware(
            "04:AB:CD:EF".into(),
            "MIFARE Classic 1K".into(),
            "ISO14443A".into(),
        )
    }

    fn spawn_reader(script: Script, filter: Option<HashSet<String>>) -> Reader {
        let manager = Arc::new(ScriptManager {
            script,
            writes: Arc::new(Mutex::new(Vec::new())),
            available: true,
        });
        Reader::spawn(
            manager,
            "",
            Arc::new(RwLock::new(filter)),
            fast_config(),
        )
    }

    async fn collect_tags(reader: &Reader, window: Duration) -> Vec<NfcData> {
        let mut rx = reader.subscribe_tags();
        let mut events = Vec::new();
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                Ok(data) = rx.recv() => events.push(data),
            }
        }
        events
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_scans_emit_once() {
        let script: Script = Arc::new(Mutex::new(
            (0..20).map(|_| Ok(vec![sample_tag()])).collect(),
        ));
        let reader = spawn_reader(script, None);
        let events = collect_tags(&reader, Duration::from_millis(300)).await;
        reader.stop().await;

        assert_eq!(events.len(), 1, "dedup gate must emit exactly once");
        let card = events[0].card.as_ref().unwrap();
        assert_eq!(card.tag.uid, "04:AB:CD:EF");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn filter_rejection_emits_once_with_message() {
        let script: Script = Arc::new(Mutex::new(
            (0..20).map(|_| Ok(vec![sample_tag()])).collect(),
        ));
        let filter: HashSet<String> = ["MIFARE Ultralight".to_string()].into();
        let reader = spawn_reader(script, Some(filter));
        let events = collect_tags(&reader, Duration::from_millis(300)).await;
        reader.stop().await;

        assert_eq!(events.len(), 1);
        assert!(events[0].card.is_none());
        assert_eq!(
            events[0].err.as_deref(),
            Some("card type 'MIFARE Classic 1K' not allowed by filter")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_exhaustion_disconnects_then_recovers() {
        let script: Script = Arc::new(Mutex::new(
            (0..4)
                .map(|_| Err(DeviceError::Timeout))
                .chain(std::iter::once(Ok(vec![sample_tag()])))
                .collect(),
        ));
        let reader = spawn_reader(script, None);
        let mut status_rx = reader.subscribe_status();

        let mut saw_disconnect = false;
        let mut saw_reconnect = false;
        let deadline = tokio::time::sleep(Duration::from_millis(500));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                Ok(status) = status_rx.recv() => {
                    if !status.connected {
                        saw_disconnect = true;
                    } else if saw_disconnect {
                        saw_reconnect = true;
                        break;
                    }
                }
            }
        }
        reader.stop().await;
        assert!(saw_disconnect, "retry exhaustion must disconnect");
        assert!(saw_reconnect, "cooldown expiry must reconnect");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_without_device_fails() {
        let manager = Arc::new(ScriptManager {
            script: Arc::new(Mutex::new(VecDeque::new())),
            writes: Arc::new(Mutex::new(Vec::new())),
            available: false,
        });
        let reader = Reader::spawn(
            manager,
            "",
            Arc::new(RwLock::new(None)),
            fast_config(),
        );
        let msg = NdefMessage::new(vec![crate::ndef::NdefRecord::text("x", "en")]);
        let err = reader.write_message(msg).await.unwrap_err();
        assert!(matches!(err, DeviceError::NoReader));
        reader.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_emits_final_disconnect() {
        let script: Script = Arc::new(Mutex::new(VecDeque::new()));
        let reader = spawn_reader(script, None);
        for _ in 0..50 {
            if reader.current_status().connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reader.current_status().connected);
        reader.stop().await;
        let last = reader.current_status();
        assert!(!last.connected);
        assert_eq!(last.message, "Reader stopped");
    }
}
