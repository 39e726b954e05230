//! Responder configuration.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::protocol::{Capabilities, CapabilityFlags, SecurityMode};

/// Account known to the responder
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    /// Account domain
    #[serde(default)]
    pub domain: String,
    /// Shared secret
    pub password: String,
}

impl std::fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEntry")
            .field("domain", &self.domain)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Responder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub addr: SocketAddr,
    /// Accounts by lower-cased user name
    pub users: HashMap<String, UserEntry>,
    /// Shares that accept tree connects
    pub shares: Vec<String>,
    /// Dialects, capability bits, signing policy and limits offered
    #[serde(skip)]
    pub capabilities: Capabilities,
    /// Name placed in challenge blobs
    pub target_name: String,
    /// Answer requests with an interim Pending response first
    pub interim_responses: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 4450)),
            users: HashMap::new(),
            shares: Vec::new(),
            capabilities: Capabilities::default(),
            target_name: "CIFSCORE".to_string(),
            interim_responses: false,
        }
    }
}

impl ServerConfig {
    /// Create with custom port on localhost
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Set address directly
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Add an account
    pub fn with_user(mut self, username: &str, domain: &str, password: &str) -> Self {
        self.users.insert(
            username.to_lowercase(),
            UserEntry {
                domain: domain.to_string(),
                password: password.to_string(),
            },
        );
        self
    }

    /// Add a share
    pub fn with_share(mut self, share: &str) -> Self {
        self.shares.push(share.to_string());
        self
    }

    /// Replace the offered capabilities
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Require request signing
    pub fn with_signing_required(mut self) -> Self {
        self.capabilities.security = SecurityMode::required();
        self
    }

    /// Only offer the legacy single-leg logon
    pub fn without_extended_security(mut self) -> Self {
        let bits = self.capabilities.flags.bits()
            & !(CapabilityFlags::EXTENDED_SECURITY | CapabilityFlags::KEYED_RESPONSE);
        self.capabilities.flags = CapabilityFlags::from_bits(bits);
        self
    }

    /// Send an interim Pending response before each final response
    pub fn with_interim_responses(mut self) -> Self {
        self.interim_responses = true;
        self
    }

    /// Look up an account
    pub fn user(&self, username: &str) -> Option<&UserEntry> {
        self.users.get(&username.to_lowercase())
    }

    /// Whether `share` is exported
    pub fn has_share(&self, share: &str) -> bool {
        self.shares.iter().any(|s| s.eq_ignore_ascii_case(share))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_lookup_ignores_case() {
        let config = ServerConfig::default().with_user("Alice", "CORP", "pw");
        assert!(config.user("ALICE").is_some());
        assert!(config.user("bob").is_none());
    }

    #[test]
    fn test_share_lookup() {
        let config = ServerConfig::default().with_share("Public");
        assert!(config.has_share("public"));
        assert!(!config.has_share("private"));
    }

    #[test]
    fn test_without_extended_security() {
        let config = ServerConfig::default().without_extended_security();
        assert!(!config
            .capabilities
            .flags
            .has(CapabilityFlags::EXTENDED_SECURITY));
    }

    #[test]
    fn test_from_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            addr = "0.0.0.0:4450"
            shares = ["public"]

            [users.alice]
            domain = "CORP"
            password = "pw"
            "#,
        )
        .unwrap();
        assert_eq!(config.addr.port(), 4450);
        assert!(config.user("alice").is_some());
        assert!(config.has_share("PUBLIC"));
    }
}
