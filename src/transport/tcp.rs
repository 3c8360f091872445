//! TCP connection to the serial gateway.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use comfoair_bridge::transport::connect;
//!
//! let stream = connect("192.168.40.130", 8899, Duration::from_secs(5)).await?;
//! let (reader, writer) = stream.into_split();
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{BridgeError, Result};

/// A connected TCP stream to the device.
pub struct DeviceStream {
    stream: TcpStream,
    peer: SocketAddr,
}

impl DeviceStream {
    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        // Control frames are tiny; do not let Nagle hold them back
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer })
    }

    /// Address of the gateway.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Split into read and write halves.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

/// Connect to `host:port`, giving up after `timeout`.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<DeviceStream> {
    let addr = format!("{}:{}", host, port);

    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| BridgeError::ConnectTimeout(timeout.as_millis() as u64))??;

    DeviceStream::from_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (stream, accepted) = tokio::join!(
            connect("127.0.0.1", port, Duration::from_secs(1)),
            listener.accept()
        );

        let stream = stream.unwrap();
        let (_, client_addr) = accepted.unwrap();
        assert_eq!(stream.peer_addr().port(), port);
        assert_eq!(stream.stream.local_addr().unwrap(), client_addr);
        assert!(stream.stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = connect("127.0.0.1", port, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BridgeError::Io(_))));
    }
}
