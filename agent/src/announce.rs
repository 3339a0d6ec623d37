//! mDNS announcement
//!
//! Advertises the producer's device-facing endpoint as `_nfc-input._tcp`
//! and the consumer endpoint under its own type, so phones and desktop
//! clients can find the agent without configuration.

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{info, warn};

pub const PRODUCER_SERVICE: &str = "_nfc-input._tcp.local.";
pub const CONSUMER_SERVICE: &str = "_nfc-agent._tcp.local.";

pub struct Announcer {
    daemon: ServiceDaemon,
    registered: Vec<String>,
}

impl Announcer {
    /// Register both services. Addresses are auto-detected per interface by
    /// the daemon, which keeps the records in step with DHCP changes.
    pub fn start(
        instance: &str,
        producer_port: u16,
        consumer_port: u16,
    ) -> Result<Self, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;
        let host = format!("{instance}.local.");
        let props = [("version", env!("CARGO_PKG_VERSION"))];

        let mut registered = Vec::new();
        for (service_type, port) in [
            (PRODUCER_SERVICE, producer_port),
            (CONSUMER_SERVICE, consumer_port),
        ] {
            let info = ServiceInfo::new(service_type, instance, &host, "", port, &props[..])?
                .enable_addr_auto();
            registered.push(info.get_fullname().to_string());
            daemon.register(info)?;
            info!(service = service_type, port, "mDNS service registered");
        }

        Ok(Self { daemon, registered })
    }

    pub fn shutdown(self) {
        for fullname in &self.registered {
            if let Err(err) = self.daemon.unregister(fullname) {
                warn!(service = %fullname, error = %err, "mDNS unregister failed");
            }
        }
        let _ = self.daemon.shutdown();
    }
}
