//! WebSocket server hosting relay rooms.
//!
//! Each accepted socket is upgraded and served on its own task; all of them
//! share one `RoomHub`, which does the ordering and fan-out.

use crate::connection;
use anyhow::Result;
use collab_core::RoomHub;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

#[derive(Default)]
pub struct RelayServer {
    hub: Arc<RoomHub>,
    next_conn_id: AtomicU64,
}

impl RelayServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hub(hub: Arc<RoomHub>) -> Self {
        Self {
            hub,
            next_conn_id: AtomicU64::new(0),
        }
    }

    pub fn hub(&self) -> Arc<RoomHub> {
        Arc::clone(&self.hub)
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections forever.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    self.accept_connection(stream, addr);
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }

    /// Upgrade and serve one incoming TCP connection on its own task.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) -> JoinHandle<()> {
        let conn_id = format!("conn-{}", self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1);
        let hub = Arc::clone(&self.hub);

        tokio::spawn(async move {
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    // Health checks connect and close without upgrading
                    let err = e.to_string();
                    if err.contains("Handshake not finished")
                        || err.contains("Connection reset")
                        || err.contains("unexpected EOF")
                    {
                        debug!("Connection closed before upgrade from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                    return;
                }
            };

            info!("New connection from {} ({})", addr, conn_id);
            if let Err(e) = connection::serve(&conn_id, ws, hub).await {
                error!("Connection {} from {} failed: {}", conn_id, addr, e);
            }
        })
    }
}
