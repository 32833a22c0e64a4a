//! Serial endpoints exposed by a TCP serial bridge
//!
//! Each endpoint is addressed as `host:port`. The bridge forwards raw bytes
//! between the socket and the UART and handles the line settings itself, so
//! the requested baud rate is only logged.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use prov_core::{SerialConnector, SerialLink, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::TcpBridgeConfig;

/// Connector for TCP serial bridges
#[derive(Debug, Clone)]
pub struct TcpSerialConnector {
    config: TcpBridgeConfig,
}

impl TcpSerialConnector {
    pub fn new(config: &TcpBridgeConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connect_timeout_ms)
    }

    async fn connect(&self, port: &str) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout(), TcpStream::connect(port))
            .await
            .map_err(|_| TransportError::Timeout(format!("connecting to {}", port)))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", port, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(stream)
    }
}

#[async_trait]
impl SerialConnector for TcpSerialConnector {
    async fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, TransportError> {
        info!(%port, baud_rate, "Opening serial bridge session");
        let stream = self.connect(port).await?;
        Ok(Box::new(TcpLink {
            stream: Some(stream),
        }))
    }

    /// Endpoints that currently accept a connection
    async fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        let probes = self.config.ports.iter().map(|port| async move {
            match self.connect(port).await {
                Ok(_) => Some(port.clone()),
                Err(e) => {
                    debug!(%port, %e, "Bridge endpoint not reachable");
                    None
                }
            }
        });
        Ok(join_all(probes).await.into_iter().flatten().collect())
    }
}

/// Session over one bridge connection
pub struct TcpLink {
    stream: Option<TcpStream>,
}

impl TcpLink {
    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl SerialLink for TcpLink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream()?;
        let mut buf = vec![0u8; len];
        match tokio::time::timeout(timeout, stream.read_exact(&mut buf)).await {
            Err(_) => Err(TransportError::Timeout(format!("waiting for {} bytes", len))),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(TransportError::ConnectionClosed)
            }
            Ok(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            Ok(Ok(_)) => Ok(buf),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .shutdown()
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            socket.read_exact(&mut buf).await.unwrap();
            buf.reverse();
            socket.write_all(&buf).await.unwrap();
        });

        let connector = TcpSerialConnector::new(&TcpBridgeConfig {
            ports: vec![addr.clone()],
            connect_timeout_ms: 1_000,
        });
        let mut link = connector.open(&addr, 115_200).await.unwrap();
        link.write_all(b"abc").await.unwrap();
        let answer = link.read_exact(3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(answer, b"cba");
        link.close().await.unwrap();
        assert!(link.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_list_ports_skips_dead_endpoints() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().to_string();
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };
        let connector = TcpSerialConnector::new(&TcpBridgeConfig {
            ports: vec![live.clone(), dead],
            connect_timeout_ms: 500,
        });
        assert_eq!(connector.list_ports().await.unwrap(), vec![live]);
    }
}
