//! Multi-manager
//!
//! One enumeration and open API over an ordered list of sub-managers,
//! typically `[pcsc, remote]`. Addresses are `<manager>:<path>`; bare paths
//! fall through the managers in list order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::warn;

use crate::reader::{DeviceError, DeviceManager, TagDevice};

pub struct MultiManager {
    managers: Vec<Arc<dyn DeviceManager>>,
    change_tx: watch::Sender<u64>,
}

impl MultiManager {
    /// Wrap the sub-managers and start forwarding their change
    /// notifications onto one deduplicated signal.
    pub fn new(managers: Vec<Arc<dyn DeviceManager>>) -> Arc<Self> {
        let (change_tx, _) = watch::channel(0u64);
        let multi = Arc::new(Self {
            managers,
            change_tx,
        });

        for manager in &multi.managers {
            if let Some(mut rx) = manager.subscribe_changes() {
                let change_tx = multi.change_tx.clone();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(()) => {
                                change_tx.send_modify(|n| *n = n.wrapping_add(1));
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                                change_tx.send_modify(|n| *n = n.wrapping_add(1));
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }
        }
        multi
    }

    /// Deduplicated aggregate change signal: the value bumps whenever any
    /// sub-manager reports a device change. Late readers see only the
    /// latest value.
    pub fn change_signal(&self) -> watch::Receiver<u64> {
        self.change_tx.subscribe()
    }
}

#[async_trait]
impl DeviceManager for MultiManager {
    fn name(&self) -> &str {
        "multi"
    }

    /// Aggregate enumeration. Each address is prefixed with its manager's
    /// name unless it already carries a bus-specific `:` address. Failing
    /// sub-managers are logged and skipped.
    async fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        let mut out = Vec::new();
        for manager in &self.managers {
            match manager.list_devices().await {
                Ok(devices) => out.extend(devices.into_iter().map(|d| {
                    if d.contains(':') {
                        d
                    } else {
                        format!("{}:{}", manager.name(), d)
                    }
                })),
                Err(err) => {
                    warn!(manager = manager.name(), error = %err, "device enumeration failed");
                }
            }
        }
        Ok(out)
    }

    /// Route on the `<manager>:` prefix when it names a sub-manager;
    /// otherwise try each sub-manager with the full string, first success
    /// wins, last error surfaces.
    async fn open_device(&self, path: &str) -> Result<Box<dyn TagDevice>, DeviceError> {
        if let Some((prefix, rest)) = path.split_once(':') {
            if let Some(manager) = self.managers.iter().find(|m| m.name() == prefix) {
                return manager.open_device(rest).await;
            }
        }

        let mut last_err = DeviceError::NoReader;
        for manager in &self.managers {
            match manager.open_device(path).await {
                Ok(device) => return Ok(device),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn close(&self) {
        for manager in &self.managers {
            manager.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::Tag;
    use tokio::sync::broadcast;

    struct FakeDevice(String);

    #[async_trait]
    impl TagDevice for FakeDevice {
        fn path(&self) -> &str {
            &self.0
        }

        async fn get_tags(&mut self) -> Result<Vec<Tag>, DeviceError> {
            Ok(Vec::new())
        }
    }

    struct FakeManager {
        name: &'static str,
        devices: Vec<String>,
        fail_list: bool,
        accepts: Option<&'static str>,
        changes: Option<broadcast::Sender<()>>,
    }

    impl FakeManager {
        fn new(name: &'static str, devices: &[&str]) -> Self {
            Self {
                name,
                devices: devices.iter().map(|s| s.to_string()).collect(),
                fail_list: false,
                accepts: None,
                changes: None,
            }
        }
    }

    #[async_trait]
    impl DeviceManager for FakeManager {
        fn name(&self) -> &str {
            self.name
        }

        async fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
            if self.fail_list {
                return Err(DeviceError::Other("enumeration broken".into()));
            }
            Ok(self.devices.clone())
        }

        async fn open_device(&self, path: &str) -> Result<Box<dyn TagDevice>, DeviceError> {
            match self.accepts {
                Some(accepted) if accepted == path => {
                    Ok(Box::new(FakeDevice(format!("{}:{}", self.name, path))))
                }
                _ => Err(DeviceError::NotFound(path.to_string())),
            }
        }

        fn subscribe_changes(&self) -> Option<broadcast::Receiver<()>> {
            self.changes.as_ref().map(|tx| tx.subscribe())
        }
    }

    #[tokio::test]
    async fn list_prefixes_unless_already_addressed() {
        let a = FakeManager::new("pcsc", &["ACR122U 00 00", "bus:07"]);
        let b = FakeManager::new("remote", &["1111"]);
        let multi = MultiManager::new(vec![Arc::new(a), Arc::new(b)]);
        let devices = multi.list_devices().await.unwrap();
        assert_eq!(
            devices,
            vec!["pcsc:ACR122U 00 00", "bus:07", "remote:1111"]
        );
    }

    #[tokio::test]
    async fn list_skips_failing_managers() {
        let mut a = FakeManager::new("pcsc", &[]);
        a.fail_list = true;
        let b = FakeManager::new("remote", &["1111"]);
        let multi = MultiManager::new(vec![Arc::new(a), Arc::new(b)]);
        let devices = multi.list_devices().await.unwrap();
        assert_eq!(devices, vec!["remote:1111"]);
    }

    #[tokio::test]
    async fn open_routes_on_prefix() {
        let mut a = FakeManager::new("pcsc", &[]);
        a.accepts = Some("dev0");
        let b = FakeManager::new("remote", &[]);
        let multi = MultiManager::new(vec![Arc::new(a), Arc::new(b)]);
        let device = multi.open_device("pcsc:dev0").await.unwrap();
        assert_eq!(device.path(), "pcsc:dev0");
    }

    #[tokio::test]
    async fn open_falls_through_in_order() {
        let a = FakeManager::new("pcsc", &[]);
        let mut b = FakeManager::new("remote", &[]);
        b.accepts = Some("anything");
        let multi = MultiManager::new(vec![Arc::new(a), Arc::new(b)]);
        let device = multi.open_device("anything").await.unwrap();
        assert_eq!(device.path(), "remote:anything");
    }

    #[tokio::test]
    async fn open_unknown_prefix_falls_through_with_full_string() {
        let mut a = FakeManager::new("pcsc", &[]);
        // PC/SC reader names can themselves contain a colon.
        a.accepts = Some("weird:name");
        let multi = MultiManager::new(vec![Arc::new(a)]);
        assert!(multi.open_device("weird:name").await.is_ok());
    }

    #[tokio::test]
    async fn open_surfaces_last_error() {
        let a = FakeManager::new("pcsc", &[]);
        let b = FakeManager::new("remote", &[]);
        let multi = MultiManager::new(vec![Arc::new(a), Arc::new(b)]);
        let err = multi.open_device("nope").await.unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(p) if p == "nope"));
    }

    #[tokio::test]
    async fn change_signal_aggregates_submanagers() {
        let (tx, _) = broadcast::channel(4);
        let mut a = FakeManager::new("remote", &[]);
        a.changes = Some(tx.clone());
        let multi = MultiManager::new(vec![Arc::new(a)]);
        let mut signal = multi.change_signal();
        let before = *signal.borrow_and_update();

        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(200), signal.changed())
            .await
            .expect("change signal must fire")
            .unwrap();
        assert_ne!(*signal.borrow(), before);
    }
}
