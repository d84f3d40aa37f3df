//! WebSocket page server.
//!
//! Architecture:
//! ```text
//! Client A ──ws──┐                              ┌── PageSession (page 1) ── BroadcastGroup
//!                ├── SessionCoordinator ──┐     │
//! Client B ──ws──┘   (one per connection) ├── PageSessionManager
//!                                         │     │
//!                                         │     └── PageSession (page 2) ── BroadcastGroup
//!                                         │
//!                                         └── DocumentStore (RocksDB | memory)
//! ```
//!
//! Each connection runs three pieces:
//! - a reader loop decoding binary frames into [`ClientMessage`]s
//! - the [`SessionCoordinator`] consuming them in order
//! - a writer task draining the connection's outbound queue to the socket
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 5 & 8

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::coordinator::SessionCoordinator;
use crate::error::PagesError;
use crate::identity::{IdentityService, StaticIdentityService};
use crate::manager::PageSessionManager;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::{DocumentStore, MemoryDocumentStore, RocksDocumentStore, StoreConfig};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub decode_errors: u64,
    pub resident_pages: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    decode_errors: AtomicU64,
}

/// The page server.
pub struct PagesServer {
    config: ServerConfig,
    manager: Arc<PageSessionManager>,
    identity: Arc<dyn IdentityService>,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
}

impl PagesServer {
    pub fn new(
        config: ServerConfig,
        documents: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        let manager = Arc::new(PageSessionManager::new(documents, config.pages.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            manager,
            identity,
            counters: Arc::new(Counters::default()),
            shutdown,
        }
    }

    /// Build a server from configuration: RocksDB when a storage path is
    /// set, memory otherwise, and the configured token table.
    pub fn open(config: ServerConfig) -> Result<Self, PagesError> {
        let documents: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksDocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Page store opened at {}", path.display());
                Arc::new(store)
            }
            None => {
                log::warn!("No storage path configured, pages live in memory only");
                Arc::new(MemoryDocumentStore::new())
            }
        };
        let identity = Arc::new(StaticIdentityService::from_grants(&config.tokens));
        if identity.is_empty() {
            log::warn!("No tokens configured, every client will fail to authenticate");
        }
        Ok(Self::new(config, documents, identity))
    }

    pub fn manager(&self) -> &Arc<PageSessionManager> {
        &self.manager
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Page server listening on {}", listener.local_addr()?);
        let maintenance = self.manager.spawn_maintenance();
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            maintenance.abort();
            return Ok(());
        }

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => break Err(e.into()),
                    };
                    log::debug!("New TCP connection from {addr}");

                    let manager = self.manager.clone();
                    let identity = self.identity.clone();
                    let counters = self.counters.clone();
                    let shutdown = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, addr, manager, identity, counters, shutdown).await
                        {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => break Ok(()),
            }
        };
        maintenance.abort();
        result
    }

    /// Stop accepting, close connections, and flush every resident page.
    pub async fn shutdown(&self) -> Result<(), PagesError> {
        log::info!("Page server shutting down");
        self.shutdown.send_replace(true);
        self.manager.shutdown().await
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            resident_pages: self.manager.resident_pages().await.len(),
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    manager: Arc<PageSessionManager>,
    identity: Arc<dyn IdentityService>,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let capacity = manager.config().outbound_capacity;
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel::<ClientMessage>(capacity);

    let coordinator = SessionCoordinator::new(manager, identity, outbound_tx);
    let session_id = coordinator.session_id();
    log::info!("WebSocket connection established from {addr} (session {session_id})");
    let mut coordinator_task = tokio::spawn(coordinator.run(inbound_rx));

    // Ends once the coordinator and its forwarders drop their senders.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let encoded = match message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Failed to encode message for session {session_id}: {e}");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Binary(encoded.into())).await {
                log::debug!("Session {session_id} socket write failed: {e}");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut coordinator_done = false;
    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    counters.total_messages.fetch_add(1, Ordering::Relaxed);
                    counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    match ClientMessage::decode(&data) {
                        Ok(message) => {
                            log::trace!("Session {session_id} <- {message:?}");
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Failed to decode message from {addr}: {e}");
                        }
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Ignoring text frame from {addr}");
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                Some(Err(e)) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
                // Pings are answered by tungstenite on the next write.
                Some(Ok(_)) => {}
            },
            _ = &mut coordinator_task => {
                coordinator_done = true;
                break;
            }
            _ = shutdown.changed() => break,
        }
    }

    drop(inbound_tx);
    if !coordinator_done {
        if let Err(e) = coordinator_task.await {
            log::error!("Session {session_id} coordinator panicked: {e}");
        }
    }
    if let Err(e) = writer.await {
        log::error!("Session {session_id} writer panicked: {e}");
    }

    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("Session {session_id} from {addr} finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::PageInfo;
    use uuid::Uuid;

    fn memory_server() -> PagesServer {
        let mut config = ServerConfig::default();
        config.pages = crate::config::PagesConfig::for_testing();
        PagesServer::open(config).unwrap()
    }

    #[test]
    fn test_server_creation() {
        let server = memory_server();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = memory_server();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = PagesServer::open(config).unwrap();
        let page = PageInfo::new(Uuid::new_v4(), Uuid::new_v4(), "Persisted");
        let page_id = page.id;
        server.manager().create_page(page).await.unwrap();
        let snapshot = server.manager().get_snapshot(page_id).await.unwrap();
        assert_eq!(snapshot.page.title, "Persisted");
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = Arc::new(memory_server());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        tokio::task::yield_now().await;
        server.shutdown().await.unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
