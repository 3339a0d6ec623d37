//! Agent orchestrator
//!
//! Lifecycle glue: owns the reader, the managers, the bridge and both
//! servers. On a network change it rotates the certificate and performs a
//! live server restart — bridge and listeners are rebuilt, the reader keeps
//! running and is re-wired to the fresh bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bridge::Bridge;
use crate::config::Config;
use crate::manager::MultiManager;
use crate::reader::pcsc::PcscManager;
use crate::reader::poll::TypeFilter;
use crate::reader::{DeviceManager, Reader, ReaderConfig};
use crate::remote::{DEFAULT_INACTIVITY_TIMEOUT, RemoteDeviceManager, SWEEP_INTERVAL};
use crate::server::ServeError;
use crate::server::consumer::{ConsumerConfig, ConsumerServer};
use crate::server::producer::{ProducerConfig, ProducerServer};
use crate::tls::watcher::{DEFAULT_POLL_INTERVAL, NetworkWatcher};
use crate::tls::{TlsError, TlsManager};

/// Pause between stopping and restarting the listeners so the ports are
/// released.
const PORT_RELEASE_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Serve(#[from] ServeError),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

struct ServerSet {
    bridge: Arc<Bridge>,
    producer: ProducerServer,
    consumer: ConsumerServer,
}

pub struct Agent {
    config: Config,
    filter: TypeFilter,
    remote: Arc<RemoteDeviceManager>,
    multi: Arc<MultiManager>,
    tls: Option<TlsManager>,
    reader: std::sync::RwLock<Option<Arc<Reader>>>,
    servers: AsyncMutex<Option<ServerSet>>,
    restart_mu: AsyncMutex<()>,
    restarts: watch::Sender<u64>,
    network: std::sync::Mutex<Option<NetworkWatcher>>,
    network_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    change_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    /// Build an agent over the standard manager set `[pcsc, remote]`.
    pub fn new(config: Config) -> Arc<Self> {
        let remote = Arc::new(RemoteDeviceManager::new(DEFAULT_INACTIVITY_TIMEOUT));
        let managers: Vec<Arc<dyn DeviceManager>> =
            vec![Arc::new(PcscManager::new()), remote.clone()];
        Self::with_managers(config, remote, managers)
    }

    /// Build with an explicit manager list.
    pub fn with_managers(
        config: Config,
        remote: Arc<RemoteDeviceManager>,
        managers: Vec<Arc<dyn DeviceManager>>,
    ) -> Arc<Self> {
        remote.spawn_sweeper(SWEEP_INTERVAL);
        let multi = MultiManager::new(managers);
        let filter: TypeFilter = Arc::new(RwLock::new(config.allowed_types.clone()));
        let tls = config
            .tls_enabled
            .then(|| TlsManager::new(config.cert_dir.clone()));
        let (restarts, _) = watch::channel(0u64);

        Arc::new(Self {
            config,
            filter,
            remote,
            multi,
            tls,
            reader: std::sync::RwLock::new(None),
            servers: AsyncMutex::new(None),
            restart_mu: AsyncMutex::new(()),
            restarts,
            network: std::sync::Mutex::new(None),
            network_task: std::sync::Mutex::new(None),
            change_task: std::sync::Mutex::new(None),
        })
    }

    /// Start the reader, the TLS subsystem and both servers.
    pub async fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        if let Some(tls) = &self.tls {
            tls.ensure(&TlsManager::current_hosts())?;
            info!(fingerprint = %tls.ca_fingerprint()?, "CA ready");
            self.install_network_listener();
        }

        let reader = Arc::new(Reader::spawn(
            self.multi.clone() as Arc<dyn DeviceManager>,
            self.config.device.clone().unwrap_or_default(),
            self.filter.clone(),
            ReaderConfig::default(),
        ));
        *self.reader.write().expect("reader lock poisoned") = Some(reader);

        self.watch_device_changes();
        self.start_servers().await
    }

    /// Log device attach/detach so operators see the table move; the
    /// reader's own reconnect ticker picks the hardware up.
    fn watch_device_changes(self: &Arc<Self>) {
        let mut signal = self.multi.change_signal();
        signal.mark_unchanged();
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while signal.changed().await.is_ok() {
                let Some(agent) = weak.upgrade() else { break };
                match agent.multi.list_devices().await {
                    Ok(devices) => info!(count = devices.len(), "device set changed"),
                    Err(err) => error!(error = %err, "device enumeration failed"),
                }
            }
        });
        *self.change_task.lock().expect("change task lock poisoned") = Some(task);
    }

    pub fn reader(&self) -> Option<Arc<Reader>> {
        self.reader.read().expect("reader lock poisoned").clone()
    }

    /// Allowed card types, consulted by the reader per scan.
    pub async fn set_allowed_types(&self, allowed: Option<std::collections::HashSet<String>>) {
        *self.filter.write().await = allowed;
    }

    /// Signal that bumps after each completed server restart.
    pub fn restart_signal(&self) -> watch::Receiver<u64> {
        self.restarts.subscribe()
    }

    async fn start_servers(&self) -> Result<(), AgentError> {
        let mut guard = self.servers.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let acceptor = match &self.tls {
            Some(tls) => Some(tls.acceptor()?),
            None => None,
        };
        let bridge = Arc::new(Bridge::new());

        let consumer = ConsumerServer::start(
            ConsumerConfig {
                addr: SocketAddr::new(self.config.bind_address, self.config.consumer_port),
                api_secret: self.config.api_secret.clone(),
                allow_injection: self.config.allow_injection,
                tls: acceptor.clone(),
            },
            bridge.clone(),
        )
        .await?;

        let producer = ProducerServer::start(
            ProducerConfig {
                addr: SocketAddr::new(self.config.bind_address, self.config.input_port),
                tls: acceptor,
            },
            bridge.clone(),
            self.remote.clone(),
            self.multi.clone(),
            self.reader(),
        )
        .await;
        let producer = match producer {
            Ok(producer) => producer,
            Err(err) => {
                consumer.stop().await;
                bridge.close();
                return Err(err.into());
            }
        };

        info!(
            producer = %producer.local_addr(),
            consumer = %consumer.local_addr(),
            "servers up"
        );
        *guard = Some(ServerSet {
            bridge,
            producer,
            consumer,
        });
        Ok(())
    }

    async fn stop_servers(&self) {
        let set = self.servers.lock().await.take();
        if let Some(set) = set {
            set.consumer.stop().await;
            set.producer.stop().await;
            set.bridge.close();
        }
    }

    /// Stop both servers, let the ports settle, then start them again on
    /// freshly-loaded certificates. The reader is untouched.
    pub async fn restart_servers(&self) -> Result<(), AgentError> {
        let _guard = self.restart_mu.lock().await;
        info!("restarting servers");
        self.stop_servers().await;
        tokio::time::sleep(PORT_RELEASE_GRACE).await;
        self.start_servers().await?;
        self.restarts.send_modify(|n| *n = n.wrapping_add(1));
        Ok(())
    }

    /// Stop everything: servers, bridge, reader, managers.
    pub async fn stop(&self) {
        let network_task = self
            .network_task
            .lock()
            .expect("network task lock poisoned")
            .take();
        if let Some(task) = network_task {
            task.abort();
        }
        let network = self.network.lock().expect("network lock poisoned").take();
        if let Some(watcher) = network {
            watcher.stop().await;
        }
        let change_task = self
            .change_task
            .lock()
            .expect("change task lock poisoned")
            .take();
        if let Some(task) = change_task {
            task.abort();
        }

        self.stop_servers().await;

        let reader = self.reader.write().expect("reader lock poisoned").take();
        if let Some(reader) = reader {
            reader.stop().await;
        }

        self.multi.close().await;
        info!("agent stopped");
    }

    fn install_network_listener(self: &Arc<Self>) {
        let watcher = NetworkWatcher::spawn(DEFAULT_POLL_INTERVAL);
        let mut signal = watcher.subscribe();
        signal.mark_unchanged();
        let weak = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            while signal.changed().await.is_ok() {
                let Some(agent) = weak.upgrade() else { break };
                info!("network changed, rotating certificate");
                if let Some(tls) = &agent.tls {
                    if let Err(err) = tls.ensure(&TlsManager::current_hosts()) {
                        error!(error = %err, "certificate rotation failed");
                        continue;
                    }
                }
                if let Err(err) = agent.restart_servers().await {
                    error!(error = %err, "server restart failed");
                }
            }
        });

        *self.network.lock().expect("network lock poisoned") = Some(watcher);
        *self.network_task.lock().expect("network task lock poisoned") = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::DeviceStatus;

    fn test_config() -> Config {
        Config {
            bind_address: [127, 0, 0, 1].into(),
            input_port: 0,
            consumer_port: 0,
            tls_enabled: false,
            mdns_enabled: false,
            ..Config::default()
        }
    }

    fn test_agent(config: Config) -> Arc<Agent> {
        let remote = Arc::new(RemoteDeviceManager::new(DEFAULT_INACTIVITY_TIMEOUT));
        Agent::with_managers(config, remote.clone(), vec![remote])
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_preserves_the_reader() {
        let agent = test_agent(test_config());
        agent.start().await.unwrap();

        let reader_before = agent.reader().unwrap();
        let path_before = reader_before.device_path();
        let mut status_rx = reader_before.subscribe_status();

        agent.restart_servers().await.unwrap();

        let reader_after = agent.reader().unwrap();
        assert!(
            Arc::ptr_eq(&reader_before, &reader_after),
            "restart must not replace the reader"
        );
        assert_eq!(reader_after.device_path(), path_before);

        // No disconnect status may cross solely because of the restart.
        let disconnect = tokio::time::timeout(Duration::from_millis(150), async {
            loop {
                match status_rx.recv().await {
                    Ok(DeviceStatus {
                        connected: false, ..
                    }) => break,
                    Ok(_) => continue,
                    Err(_) => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        assert!(disconnect.is_err(), "restart leaked a disconnect status");

        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_bumps_the_signal() {
        let agent = test_agent(test_config());
        agent.start().await.unwrap();
        let mut signal = agent.restart_signal();
        let before = *signal.borrow_and_update();
        agent.restart_servers().await.unwrap();
        assert_ne!(*signal.borrow(), before);
        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bind_conflict_surfaces_an_error() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = Config {
            consumer_port: port,
            ..test_config()
        };
        let agent = test_agent(config);
        let err = agent.start().await.unwrap_err();
        assert!(matches!(err, AgentError::Serve(ServeError::Bind { .. })));
        agent.stop().await;
    }
}
