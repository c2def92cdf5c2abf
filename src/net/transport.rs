//! Message-framed byte-stream connections.
//!
//! The core treats every transport as an opaque bidirectional stream that
//! delivers discrete messages. Byte-stream transports without native
//! message boundaries get a 4-byte big-endian length prefix per payload.
//! Additional transport forms slot in as further `Connection` variants.

use super::types::{Address, AddressError, MESSAGE_SIZE_LIMIT, NETWORK_TIMEOUT_SECS};
use crate::net::message::MessageError;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect timeout")]
    Timeout,
    #[error("frame exceeds size limit")]
    Oversized,
    #[error("empty frame")]
    EmptyFrame,
    #[error("connection closed")]
    Closed,
    #[error("message: {0}")]
    Message(#[from] MessageError),
    #[error("address: {0}")]
    Address(#[from] AddressError),
    #[error("unsupported address form")]
    UnsupportedAddress,
}

/// An open, framed stream to one remote.
pub enum Connection {
    Tcp { stream: TcpStream, peer: SocketAddr },
}

impl Connection {
    /// Dial `addr` with the protocol connect timeout.
    pub async fn connect(addr: &Address) -> Result<Connection, NetError> {
        match addr {
            Address::Tcp(sock) => {
                let stream = tokio::time::timeout(
                    Duration::from_secs(NETWORK_TIMEOUT_SECS),
                    TcpStream::connect(sock),
                )
                .await
                .map_err(|_| NetError::Timeout)??;
                stream.set_nodelay(true)?;
                Ok(Connection::Tcp {
                    stream,
                    peer: *sock,
                })
            }
            Address::Opaque(_) => Err(NetError::UnsupportedAddress),
        }
    }

    /// Wrap an accepted inbound stream.
    pub fn from_tcp(stream: TcpStream) -> Result<Connection, NetError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Connection::Tcp { stream, peer })
    }

    /// Socket address of the remote end.
    pub fn peer_socket(&self) -> SocketAddr {
        match self {
            Connection::Tcp { peer, .. } => *peer,
        }
    }

    /// IP the remote is observed on (used to resolve `::` wildcard
    /// server advertisements).
    pub fn peer_ip(&self) -> Option<IpAddr> {
        match self {
            Connection::Tcp { peer, .. } => Some(peer.ip()),
        }
    }

    /// Split into independently owned read and write ends so a peer task
    /// can wait for inbound frames while handlers write replies.
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        match self {
            Connection::Tcp { stream, peer } => {
                let (r, w) = stream.into_split();
                (
                    ConnectionReader::Tcp { half: r, peer },
                    ConnectionWriter::Tcp {
                        half: w,
                        peer,
                        closed: false,
                    },
                )
            }
        }
    }
}

/// Read end: yields one framed message at a time.
pub enum ConnectionReader {
    Tcp { half: OwnedReadHalf, peer: SocketAddr },
}

impl ConnectionReader {
    pub fn peer_socket(&self) -> SocketAddr {
        match self {
            ConnectionReader::Tcp { peer, .. } => *peer,
        }
    }

    /// Next message, or `None` when the remote closed cleanly.
    pub async fn next_message(&mut self) -> Result<Option<Vec<u8>>, NetError> {
        match self {
            ConnectionReader::Tcp { half, .. } => {
                let mut len_buf = [0u8; 4];
                match half.read_exact(&mut len_buf).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len == 0 {
                    return Err(NetError::EmptyFrame);
                }
                if len > MESSAGE_SIZE_LIMIT {
                    return Err(NetError::Oversized);
                }
                let mut payload = vec![0u8; len];
                half.read_exact(&mut payload).await?;
                Ok(Some(payload))
            }
        }
    }
}

/// Write end: frames and sends payloads; `close` is idempotent.
pub enum ConnectionWriter {
    Tcp {
        half: OwnedWriteHalf,
        peer: SocketAddr,
        closed: bool,
    },
}

impl ConnectionWriter {
    /// Send one framed payload. Delivery is not guaranteed; loss shows up
    /// as a timeout or close at the protocol layer.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), NetError> {
        match self {
            ConnectionWriter::Tcp { half, closed, .. } => {
                if *closed {
                    return Err(NetError::Closed);
                }
                if payload.len() > MESSAGE_SIZE_LIMIT {
                    return Err(NetError::Oversized);
                }
                let mut frame = Vec::with_capacity(4 + payload.len());
                frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                frame.extend_from_slice(payload);
                half.write_all(&frame).await?;
                Ok(())
            }
        }
    }

    pub async fn close(&mut self) {
        match self {
            ConnectionWriter::Tcp { half, closed, .. } => {
                if !*closed {
                    *closed = true;
                    let _ = half.shutdown().await;
                }
            }
        }
    }

    pub fn peer_socket(&self) -> SocketAddr {
        match self {
            ConnectionWriter::Tcp { peer, .. } => *peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial_addr = Address::Tcp(addr);
        let dial = Connection::connect(&dial_addr);
        let (accepted, client) = tokio::join!(listener.accept(), dial);
        let (stream, _) = accepted.unwrap();
        (Connection::from_tcp(stream).unwrap(), client.unwrap())
    }

    #[tokio::test]
    async fn frames_roundtrip() {
        let (a, b) = pair().await;
        let (_ar, mut aw) = a.split();
        let (mut br, _bw) = b.split();

        aw.send(b"first").await.unwrap();
        aw.send(b"second message").await.unwrap();

        assert_eq!(br.next_message().await.unwrap().unwrap(), b"first");
        assert_eq!(
            br.next_message().await.unwrap().unwrap(),
            b"second message"
        );
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let (a, b) = pair().await;
        let (_ar, mut aw) = a.split();
        let (mut br, _bw) = b.split();

        aw.close().await;
        aw.close().await; // idempotent
        assert!(br.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_outbound_is_refused() {
        let (a, _b) = pair().await;
        let (_ar, mut aw) = a.split();
        let too_big = vec![0u8; MESSAGE_SIZE_LIMIT + 1];
        assert!(matches!(
            aw.send(&too_big).await,
            Err(NetError::Oversized)
        ));
    }

    #[tokio::test]
    async fn opaque_addresses_cannot_be_dialed() {
        let res = Connection::connect(&Address::Opaque("/dns4/x/tcp/1".into())).await;
        assert!(matches!(res, Err(NetError::UnsupportedAddress)));
    }
}
