//! Inbound connection server.
//!
//! Binds a listen address, wraps each accepted stream in the transport
//! abstraction and hands it to the network manager.

use super::manager::NetworkManager;
use super::transport::{Connection, NetError};
use super::types::Address;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A listening endpoint feeding inbound peers to the manager.
pub struct Server {
    local_addr: SocketAddr,
    dialable: Option<Address>,
    task: JoinHandle<()>,
}

impl Server {
    /// Bind and start accepting. `dialable` is the address remote peers
    /// can reach us back on, if we know one.
    pub async fn bind(
        listen: SocketAddr,
        dialable: Option<Address>,
        manager: Arc<NetworkManager>,
    ) -> Result<Server, NetError> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!("inbound stream from {}", remote);
                        match Connection::from_tcp(stream) {
                            Ok(conn) => {
                                manager.register_connection(conn, true).await;
                            }
                            Err(e) => warn!("failed to adopt stream from {}: {}", remote, e),
                        }
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Server {
            local_addr,
            dialable,
            task,
        })
    }

    /// The bound socket address (with the OS-assigned port when bound to
    /// port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address remote peers can dial us back on, if discoverable.
    pub fn dialable_address(&self) -> Option<&Address> {
        self.dialable.as_ref()
    }

    /// Stop accepting. Established connections are the manager's to close.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.task.abort();
    }
}
