//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the `cifs` binary)

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{secret_hash, KeyMaterial};
use crate::error::{CifsError, Result};
use crate::protocol::{
    Capabilities, CapabilityFlags, SecurityMode, DEFAULT_MAX_FRAME_SIZE, MAX_PREFIX_LENGTH,
};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where and how to connect
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Who to authenticate as
    #[serde(default)]
    pub credentials: Credentials,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| CifsError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| CifsError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("CIFS_HOST") {
            config.connection.host = host;
        }
        if let Ok(port) = std::env::var("CIFS_PORT") {
            if let Ok(port) = port.parse() {
                config.connection.port = Some(port);
            }
        }
        if let Ok(share) = std::env::var("CIFS_SHARE") {
            config.connection.share = Some(share);
        }

        if let Ok(username) = std::env::var("CIFS_USERNAME") {
            config.credentials.username = username;
        }
        if let Ok(domain) = std::env::var("CIFS_DOMAIN") {
            config.credentials.domain = domain;
        }
        if let Ok(password) = std::env::var("CIFS_PASSWORD") {
            config.credentials.password = password;
        }

        config
    }

    /// Default config file location (`<config dir>/cifs/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cifs").join("config.toml"))
    }

    /// Merge with another config (other takes precedence where it is not default)
    pub fn merge(self, other: Self) -> Self {
        let defaults = ConnectionConfig::default();
        let conn = other.connection;
        let base = self.connection;

        Self {
            connection: ConnectionConfig {
                host: if conn.host != defaults.host {
                    conn.host
                } else {
                    base.host
                },
                port: conn.port.or(base.port),
                share: conn.share.or(base.share),
                connect_timeout_ms: if conn.connect_timeout_ms != defaults.connect_timeout_ms {
                    conn.connect_timeout_ms
                } else {
                    base.connect_timeout_ms
                },
                request_timeout_ms: if conn.request_timeout_ms != defaults.request_timeout_ms {
                    conn.request_timeout_ms
                } else {
                    base.request_timeout_ms
                },
                reconnect_delay_ms: if conn.reconnect_delay_ms != defaults.reconnect_delay_ms {
                    conn.reconnect_delay_ms
                } else {
                    base.reconnect_delay_ms
                },
                ..conn
            },
            credentials: Credentials {
                username: pick(other.credentials.username, self.credentials.username),
                domain: pick(other.credentials.domain, self.credentials.domain),
                password: pick(other.credentials.password, self.credentials.password),
            },
        }
    }
}

fn pick(preferred: String, fallback: String) -> String {
    if preferred.is_empty() {
        fallback
    } else {
        preferred
    }
}

/// Connection parameters for one remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Remote host name or address
    pub host: String,

    /// Port override (none tries 445, then 139)
    pub port: Option<u16>,

    /// Share used by the CLI when none is given
    pub share: Option<String>,

    /// Per-attempt connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Bounded wait for a response in milliseconds
    pub request_timeout_ms: u64,

    /// Fixed delay between reconnect attempts in milliseconds
    pub reconnect_delay_ms: u64,

    /// Largest frame body we accept or offer
    pub max_frame_size: u32,

    /// Most requests we allow in flight per transport
    pub max_in_flight: u16,

    /// Sign requests even when the server does not require it
    pub sign: bool,

    /// Use the security blob exchange when the server offers it
    pub extended_security: bool,

    /// Local host name sent in authenticate blobs
    pub workstation: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            share: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            reconnect_delay_ms: 2_000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as u32,
            max_in_flight: 50,
            sign: false,
            extended_security: true,
            workstation: "localhost".to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Config for `host` with everything else default
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Set the port override
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set connect, request and reconnect timings
    pub fn with_timeouts(mut self, connect: Duration, request: Duration, reconnect: Duration) -> Self {
        self.connect_timeout_ms = connect.as_millis() as u64;
        self.request_timeout_ms = request.as_millis() as u64;
        self.reconnect_delay_ms = reconnect.as_millis() as u64;
        self
    }

    /// Set frame-size and in-flight limits
    pub fn with_limits(mut self, max_frame_size: u32, max_in_flight: u16) -> Self {
        self.max_frame_size = max_frame_size.min(MAX_PREFIX_LENGTH as u32);
        self.max_in_flight = max_in_flight;
        self
    }

    /// Ask for request signing
    pub fn with_signing(mut self, sign: bool) -> Self {
        self.sign = sign;
        self
    }

    /// Enable or disable the security blob exchange
    pub fn with_extended_security(mut self, enabled: bool) -> Self {
        self.extended_security = enabled;
        self
    }

    /// Per-attempt connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Response wait bound
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff between reconnect attempts
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Frame limit in bytes, capped at the largest prefix length even when
    /// a config file asks for more
    pub fn frame_limit(&self) -> usize {
        (self.max_frame_size as usize).min(MAX_PREFIX_LENGTH)
    }

    /// Capabilities offered during negotiation
    pub fn capabilities(&self) -> Capabilities {
        let base = Capabilities::default();
        let flags = if self.extended_security {
            base.flags
        } else {
            CapabilityFlags::from_bits(
                base.flags.bits()
                    & !(CapabilityFlags::EXTENDED_SECURITY | CapabilityFlags::KEYED_RESPONSE),
            )
        };
        let security = if self.sign {
            SecurityMode::required()
        } else {
            SecurityMode::enabled()
        };
        base.with_flags(flags)
            .with_security(security)
            .with_limits(self.max_frame_size, self.max_in_flight)
    }
}

/// Account used for authentication
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// Account name
    pub username: String,

    /// Account domain (may be empty)
    pub domain: String,

    /// Shared secret
    pub password: String,
}

impl Credentials {
    /// Create credentials
    pub fn new(username: impl Into<String>, domain: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
            password: password.into(),
        }
    }

    /// Hash of the shared secret, the only form kept past authentication setup
    pub fn secret(&self) -> KeyMaterial {
        secret_hash(&self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.port, None);
        assert_eq!(config.connection.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.connection.max_in_flight, 50);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [connection]
            host = "files.example.com"
            port = 4450
            share = "public"
            reconnect_delay_ms = 250
            sign = true

            [credentials]
            username = "alice"
            domain = "CORP"
            password = "hunter2"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.connection.host, "files.example.com");
        assert_eq!(config.connection.port, Some(4450));
        assert_eq!(config.connection.share.as_deref(), Some("public"));
        assert_eq!(config.connection.reconnect_delay(), Duration::from_millis(250));
        assert_eq!(config.connection.request_timeout_ms, 30_000);
        assert!(config.connection.sign);
        assert_eq!(config.credentials.username, "alice");
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connection]\nhost = \"10.0.0.5\"\n\n[credentials]\nusername = \"bob\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.connection.host, "10.0.0.5");
        assert_eq!(config.credentials.username, "bob");
        assert!(config.credentials.password.is_empty());
    }

    #[test]
    fn test_config_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::from_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(CifsError::Config(_))));
    }

    #[test]
    fn test_merge_prefers_other() {
        let base = Config {
            connection: ConnectionConfig::new("base-host").with_port(1445),
            credentials: Credentials::new("alice", "CORP", "pw"),
        };
        let over = Config {
            connection: ConnectionConfig::new("over-host"),
            credentials: Credentials::new("", "", "secret"),
        };

        let merged = base.merge(over);
        assert_eq!(merged.connection.host, "over-host");
        assert_eq!(merged.connection.port, Some(1445));
        assert_eq!(merged.credentials.username, "alice");
        assert_eq!(merged.credentials.password, "secret");
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = Credentials::new("alice", "", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_capabilities_follow_config() {
        let caps = ConnectionConfig::default()
            .with_extended_security(false)
            .with_signing(true)
            .capabilities();
        assert!(!caps.flags.has(CapabilityFlags::EXTENDED_SECURITY));
        assert!(caps.security.signing_required);
    }

    #[test]
    fn test_frame_limit_capped_at_prefix_length() {
        let config = ConnectionConfig::default().with_limits(0x0200_0000, 8);
        assert_eq!(config.frame_limit(), MAX_PREFIX_LENGTH);

        let config: ConnectionConfig = toml::from_str("max_frame_size = 4294967295").unwrap();
        assert_eq!(config.frame_limit(), MAX_PREFIX_LENGTH);
        assert_eq!(config.capabilities().frame_limit(), MAX_PREFIX_LENGTH);
    }
}
