//! Agent configuration

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;

/// Default device-facing (producer) port.
pub const DEFAULT_INPUT_PORT: u16 = 9470;
/// Default client-facing (consumer) port.
pub const DEFAULT_CONSUMER_PORT: u16 = 9471;

#[derive(Debug, Clone)]
pub struct Config {
    /// Reader address (`pcsc:<name>`, plain reader name, or empty for
    /// autodetect).
    pub device: Option<String>,
    pub bind_address: IpAddr,
    pub input_port: u16,
    pub consumer_port: u16,
    /// Shared secret for consumer sessions; first-connection-wins when
    /// unset.
    pub api_secret: Option<String>,
    /// Allowed card types; `None` admits everything.
    pub allowed_types: Option<HashSet<String>>,
    pub tls_enabled: bool,
    pub cert_dir: PathBuf,
    /// Expose `POST /api/v1/tag` on the consumer.
    pub allow_injection: bool,
    pub mdns_enabled: bool,
    /// mDNS instance name.
    pub instance_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            input_port: DEFAULT_INPUT_PORT,
            consumer_port: DEFAULT_CONSUMER_PORT,
            api_secret: None,
            allowed_types: None,
            tls_enabled: true,
            cert_dir: default_cert_dir(),
            allow_injection: false,
            mdns_enabled: true,
            instance_name: "nfc-agent".to_string(),
        }
    }
}

/// Certificates live next to the binary's state, overridable per run.
fn default_cert_dir() -> PathBuf {
    std::env::var_os("NFC_AGENT_CERT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("certs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_published_ports() {
        let config = Config::default();
        assert_eq!(config.input_port, 9470);
        assert_eq!(config.consumer_port, 9471);
        assert!(config.tls_enabled);
        assert!(config.allowed_types.is_none());
    }
}
