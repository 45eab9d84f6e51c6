//! Client configuration

use serde::{Deserialize, Serialize};

use rovpn_crypto::{CipherKind, StaticKey};

use crate::{ConfigError, Result};

/// Carrier protocol for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// One session packet per datagram
    #[default]
    Udp,
    /// Stream carrier with 2-byte length framing
    Tcp,
}

impl TransportProtocol {
    /// Protocol name as used in the OCC options string
    pub fn occ_name(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDPv4",
            TransportProtocol::Tcp => "TCPv4_CLIENT",
        }
    }
}

/// Host platform, advertised to the server as IV_PLAT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Linux
    Linux,
    /// macOS
    Mac,
    /// FreeBSD
    Freebsd,
    /// Windows
    Windows,
    /// Anything else
    #[default]
    Unknown,
}

impl Platform {
    /// Platform name as used in peer-info
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Mac => "mac",
            Platform::Freebsd => "freebsd",
            Platform::Windows => "win",
            Platform::Unknown => "unknown",
        }
    }
}

/// Tunnel device family
///
/// Determines how decrypted inner frames are tagged; the device itself is
/// managed outside the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Layer-3 tunnel, frames are IP packets
    #[default]
    Tun,
    /// Layer-2 tunnel, frames are Ethernet
    Tap,
}

impl DeviceType {
    /// Device name as used in the OCC options string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Tun => "tun",
            DeviceType::Tap => "tap",
        }
    }
}

/// TLS material and settings for the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCryptoConfig {
    /// Client certificate chain (PEM)
    pub certificate: String,
    /// Client private key (PEM)
    pub private_key: String,
    /// CA certificate(s) used to verify the server (PEM)
    pub ca: String,
    /// Prefer RFC 5705 keying-material export over the legacy PRF
    #[serde(default = "default_true")]
    pub use_key_material_exporters: bool,
}

/// Username/password sent inside the key-method-2 exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

/// Client configuration for the protocol engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server hostname or IP
    pub remote_host: String,
    /// Server port
    pub remote_port: u16,
    /// Carrier protocol
    #[serde(default)]
    pub protocol: TransportProtocol,
    /// Tunnel device family
    #[serde(default)]
    pub device: DeviceType,
    /// Control channel TLS settings
    pub control_crypto: ControlCryptoConfig,
    /// tls-crypt static key (PEM), wraps every control packet when set
    #[serde(default)]
    pub control_wrapper: Option<String>,
    /// Acceptable data channel ciphers, in preference order
    #[serde(default = "default_data_ciphers")]
    pub data_ciphers: Vec<String>,
    /// Tunnel MTU advertised in OCC
    #[serde(default = "default_tun_mtu")]
    pub tun_mtu: u16,
    /// Link MTU advertised in OCC
    #[serde(default = "default_link_mtu")]
    pub link_mtu: u16,
    /// Host platform
    #[serde(default)]
    pub platform: Platform,
    /// Client software name, advertised in peer-info
    #[serde(default = "default_name")]
    pub name: String,
    /// Client software version, advertised in peer-info
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional username/password authentication
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

fn default_true() -> bool {
    true
}

fn default_data_ciphers() -> Vec<String> {
    vec!["AES-256-GCM".to_string(), "AES-128-GCM".to_string()]
}

fn default_tun_mtu() -> u16 {
    1500
}

fn default_link_mtu() -> u16 {
    1543
}

fn default_name() -> String {
    "rovpn".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl ClientConfig {
    /// Parse a TOML configuration document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Remote endpoint as `host:port`
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Parse the tls-crypt static key, if configured
    pub fn wrap_key(&self) -> Result<Option<StaticKey>> {
        match &self.control_wrapper {
            Some(pem) => Ok(Some(StaticKey::from_pem(pem)?)),
            None => Ok(None),
        }
    }

    /// Data ciphers this build can actually negotiate, in preference order
    pub fn supported_data_ciphers(&self) -> Vec<CipherKind> {
        self.data_ciphers
            .iter()
            .filter_map(|name| match CipherKind::from_name(name) {
                Ok(kind) => Some(kind),
                Err(_) => {
                    tracing::warn!(cipher = %name, "ignoring unsupported data cipher");
                    None
                }
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.remote_host.is_empty() {
            return Err(ConfigError::Invalid("remote_host is empty".to_string()));
        }
        if self.remote_port == 0 {
            return Err(ConfigError::Invalid("remote_port is zero".to_string()));
        }
        if self.supported_data_ciphers().is_empty() {
            return Err(ConfigError::Invalid(
                "data_ciphers contains no usable cipher".to_string(),
            ));
        }
        if let Some(pem) = &self.control_wrapper {
            StaticKey::from_pem(pem)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        minimal_toml_with("")
    }

    fn minimal_toml_with(extra: &str) -> String {
        format!(
            r#"
            remote_host = "vpn.example.org"
            remote_port = 1194
            {extra}

            [control_crypto]
            certificate = "CERT"
            private_key = "KEY"
            ca = "CA"
        "#
        )
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = ClientConfig::from_toml_str(&minimal_toml()).unwrap();
        assert_eq!(config.protocol, TransportProtocol::Udp);
        assert_eq!(config.device, DeviceType::Tun);
        assert_eq!(config.tun_mtu, 1500);
        assert_eq!(config.data_ciphers, vec!["AES-256-GCM", "AES-128-GCM"]);
        assert!(config.control_crypto.use_key_material_exporters);
        assert_eq!(config.remote(), "vpn.example.org:1194");
    }

    #[test]
    fn test_protocol_parse() {
        let toml = minimal_toml_with("protocol = \"tcp\"");
        let config = ClientConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.protocol, TransportProtocol::Tcp);
        assert_eq!(config.protocol.occ_name(), "TCPv4_CLIENT");
    }

    #[test]
    fn test_rejects_empty_remote() {
        let toml = minimal_toml().replace("vpn.example.org", "");
        assert!(ClientConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_rejects_unusable_cipher_list() {
        let toml = minimal_toml_with("data_ciphers = [\"AES-256-CBC\"]");
        assert!(ClientConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_cipher_list_filters_unknown() {
        let toml = minimal_toml_with("data_ciphers = [\"AES-256-CBC\", \"AES-128-GCM\"]");
        let config = ClientConfig::from_toml_str(&toml).unwrap();
        assert_eq!(
            config.supported_data_ciphers(),
            vec![CipherKind::Aes128Gcm]
        );
    }
}
