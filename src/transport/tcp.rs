//! TCP stream establishment.
//!
//! Resolves the endpoint and opens a stream, trying the primary well-known
//! port first and the fallback port second unless the endpoint carries an
//! explicit port. Each attempt is bounded by the connect timeout.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};

use crate::error::{CifsError, Result};
use crate::protocol::{FALLBACK_PORT, PRIMARY_PORT};

/// Remote endpoint: host plus optional port override.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: Option<u16>,
}

impl Endpoint {
    /// Endpoint using the default port sequence
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
        }
    }

    /// Endpoint pinned to `port`
    pub fn with_port(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
        }
    }

    /// Endpoint for a bound socket address
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::with_port(addr.ip().to_string(), addr.port())
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port override
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Ports to try, in order
    pub fn candidate_ports(&self) -> Vec<u16> {
        match self.port {
            Some(port) => vec![port],
            None => vec![PRIMARY_PORT, FALLBACK_PORT],
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

/// Opens TCP streams to one endpoint.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: Endpoint,
    timeout: Duration,
}

impl TcpConnector {
    /// Create a connector with a per-attempt timeout
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }

    /// Try each candidate port and return the first stream that opens.
    pub async fn connect(&self) -> Result<TcpStream> {
        let mut last_error = None;

        for port in self.endpoint.candidate_ports() {
            match self.attempt(port).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(endpoint = %self.endpoint, port, "Stream connected");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(endpoint = %self.endpoint, port, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CifsError::Transport(format!("No ports to try for {}", self.endpoint))
        }))
    }

    async fn attempt(&self, port: u16) -> Result<TcpStream> {
        let host = self.endpoint.host.as_str();
        let addrs: Vec<SocketAddr> = tokio::time::timeout(self.timeout, lookup_host((host, port)))
            .await
            .map_err(|_| CifsError::Transport(format!("Resolving {host} timed out")))?
            .map_err(|e| CifsError::Transport(format!("Resolving {host} failed: {e}")))?
            .collect();

        let mut last_error = CifsError::Transport(format!("{host} resolved to no addresses"));
        for addr in addrs {
            match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    last_error = CifsError::Transport(format!("Connect to {addr} failed: {e}"));
                }
                Err(_) => {
                    last_error = CifsError::Transport(format!(
                        "Connect to {addr} timed out after {:?}",
                        self.timeout
                    ));
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_candidate_ports() {
        assert_eq!(Endpoint::new("srv").candidate_ports(), vec![445, 139]);
        assert_eq!(Endpoint::with_port("srv", 4450).candidate_ports(), vec![4450]);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("srv").to_string(), "srv");
        assert_eq!(Endpoint::with_port("10.0.0.1", 445).to_string(), "10.0.0.1:445");
    }

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = TcpConnector::new(Endpoint::from_addr(addr), Duration::from_secs(1));
        let (client, accepted) = tokio::join!(connector.connect(), listener.accept());
        assert!(client.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = TcpConnector::new(Endpoint::from_addr(addr), Duration::from_secs(1));
        let result = connector.connect().await;
        assert!(matches!(result, Err(CifsError::Transport(_))));
    }
}
