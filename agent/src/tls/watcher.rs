//! Network change watcher
//!
//! Polls the interface addresses and raises a signal when the set of
//! non-loopback IPv4 addresses changes — the cue for the orchestrator to
//! rotate the certificate and restart the servers.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default poll cadence; well under the 30s freshness bound.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

pub struct NetworkWatcher {
    changes: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl NetworkWatcher {
    /// Watch the real interface list.
    pub fn spawn(interval: Duration) -> Self {
        Self::spawn_with_source(interval, current_addresses)
    }

    /// Watch an injected address source. Used by tests.
    pub fn spawn_with_source<F>(interval: Duration, source: F) -> Self
    where
        F: Fn() -> BTreeSet<String> + Send + 'static,
    {
        let (changes_tx, _) = watch::channel(0u64);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let changes = changes_tx.clone();

        let task = tokio::spawn(async move {
            let mut known = source();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the baseline set
            // does not count as a change.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => break,
                    _ = ticker.tick() => {
                        let now = source();
                        if now != known {
                            info!(
                                before = %join(&known),
                                after = %join(&now),
                                "network addresses changed"
                            );
                            known = now;
                            changes.send_modify(|n| *n = n.wrapping_add(1));
                        } else {
                            debug!("network addresses unchanged");
                        }
                    }
                }
            }
        });

        Self {
            changes: changes_tx,
            shutdown: shutdown_tx,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Signal that bumps on every detected change; late readers only see
    /// the latest value.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().expect("watcher task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Non-loopback IPv4 addresses currently assigned.
pub fn current_addresses() -> BTreeSet<String> {
    let mut addrs = BTreeSet::new();
    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        for iface in interfaces {
            if iface.is_loopback() {
                continue;
            }
            if let IpAddr::V4(ip) = iface.ip() {
                addrs.insert(ip.to_string());
            }
        }
    }
    addrs
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn signals_only_on_set_difference() {
        let addrs = Arc::new(Mutex::new(BTreeSet::from(["10.0.0.5".to_string()])));
        let source = {
            let addrs = addrs.clone();
            move || addrs.lock().unwrap().clone()
        };
        let watcher = NetworkWatcher::spawn_with_source(Duration::from_millis(10), source);
        let mut signal = watcher.subscribe();
        signal.mark_unchanged();

        // Unchanged set: no signal.
        assert!(
            tokio::time::timeout(Duration::from_millis(60), signal.changed())
                .await
                .is_err()
        );

        // Address moves: one signal.
        *addrs.lock().unwrap() = BTreeSet::from(["10.0.0.6".to_string()]);
        tokio::time::timeout(Duration::from_millis(200), signal.changed())
            .await
            .expect("change must be signalled")
            .unwrap();

        watcher.stop().await;
    }
}
