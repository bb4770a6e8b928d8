//! Establishing the peer connection
//!
//! The receiver listens and shows its LAN address; the sender dials it,
//! retrying with exponential backoff.

use local_ip_address::local_ip;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use crate::config::TransportConfig;
use crate::error::StreamError;

/// Disable Nagle so small control messages and audio go out immediately
fn tune(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
}

/// Normalize `host` or `host:port` to an address string with a port
pub fn with_default_port(peer: &str, port: u16) -> String {
    let peer = peer.trim();
    if peer.parse::<SocketAddr>().is_ok() {
        return peer.to_string();
    }
    // IPv6 literals without brackets have more than one colon
    match peer.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') && p.parse::<u16>().is_ok() => peer.to_string(),
        _ if peer.matches(':').count() > 1 => format!("[{}]:{}", peer, port),
        _ => format!("{}:{}", peer, port),
    }
}

/// Receiver side: accepts one sender at a time
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    pub async fn bind(port: u16) -> Result<Self, StreamError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| StreamError::transport(format!("cannot listen on port {}: {}", port, e)))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        Ok(self.listener.local_addr()?)
    }

    /// The address a user should type on the sender
    pub fn shareable_address(&self) -> Option<String> {
        let port = self.listener.local_addr().ok()?.port();
        match local_ip() {
            Ok(ip) => Some(format!("{}:{}", ip, port)),
            Err(e) => {
                debug!("No LAN address available: {}", e);
                None
            }
        }
    }

    /// Wait for a sender; `None` timeout waits forever
    pub async fn accept(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(TcpStream, SocketAddr), StreamError> {
        let accept = self.listener.accept();
        let (stream, peer) = match timeout {
            Some(t) => tokio::time::timeout(t, accept)
                .await
                .map_err(|_| StreamError::transport("no sender connected in time"))??,
            None => accept.await?,
        };
        tune(&stream);
        info!("Listener: sender connected from {}", peer);
        Ok((stream, peer))
    }
}

/// Sender side: dials the receiver
pub struct Connector {
    peer: String,
    config: TransportConfig,
}

impl Connector {
    pub fn new(peer: &str, config: &TransportConfig) -> Self {
        Self {
            peer: with_default_port(peer, config.port),
            config: config.clone(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// One connection attempt bounded by the connect timeout
    pub async fn connect_once(&self) -> Result<TcpStream, StreamError> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.peer.as_str()),
        )
        .await
        .map_err(|_| StreamError::transport(format!("connect to {} timed out", self.peer)))?
        .map_err(|e| StreamError::transport(format!("connect to {} failed: {}", self.peer, e)))?;
        tune(&stream);
        Ok(stream)
    }

    /// Try up to `max_reconnect_attempts + 1` times, sleeping with
    /// exponential backoff in between. Returns the last error.
    pub async fn connect(&self) -> Result<TcpStream, StreamError> {
        let attempts = self.config.max_reconnect_attempts + 1;
        let mut last_err = StreamError::transport("no connection attempt made");

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.backoff(attempt - 1);
                info!(
                    "Connector: retrying {} in {:?} (attempt {}/{})",
                    self.peer,
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::time::sleep(delay).await;
            }
            match self.connect_once().await {
                Ok(stream) => {
                    info!("Connector: connected to {}", self.peer);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("Connector: {}", e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port() {
        assert_eq!(with_default_port("192.168.1.5", 9999), "192.168.1.5:9999");
        assert_eq!(with_default_port("192.168.1.5:4000", 9999), "192.168.1.5:4000");
        assert_eq!(with_default_port("tv.local", 9999), "tv.local:9999");
        assert_eq!(with_default_port("fe80::1", 9999), "[fe80::1]:9999");
        assert_eq!(with_default_port("[fe80::1]:80", 9999), "[fe80::1]:80");
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = TransportConfig {
            port,
            ..TransportConfig::default()
        };

        let connector = Connector::new("127.0.0.1", &config);
        let (accepted, dialed) = tokio::join!(
            listener.accept(Some(Duration::from_secs(2))),
            connector.connect()
        );
        let (stream, _) = accepted.unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(dialed.is_ok());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_bounded_attempts() {
        // Grab a free port, then close it so nothing listens there
        let port = {
            let l = Listener::bind(0).await.unwrap();
            l.local_addr().unwrap().port()
        };
        let config = TransportConfig {
            port,
            max_reconnect_attempts: 2,
            reconnect_backoff_initial: Duration::from_millis(10),
            reconnect_backoff_max: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(500),
            ..TransportConfig::default()
        };
        let err = Connector::new("127.0.0.1", &config)
            .connect()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TransportError");
    }
}
