//! WebSocket client for the page server.
//!
//! Provides:
//! - Connection lifecycle (connect, close) with background reader/writer tasks
//! - Request helpers for authentication, subscription, and operations
//! - [`PageReplica`]: a local copy of one page kept current from server messages
//!
//! Reference: Kleppmann, Chapter 5, Replication

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::block::{PageId, SessionId, UserId};
use crate::block_store::{BlockStore, PageSnapshot};
use crate::error::ApplyError;
use crate::operation::{AppliedOperation, OperationRequest};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// The page client.
pub struct PagesClient {
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<ClientMessage>,
    /// Decoded server messages from the reader task
    incoming_rx: mpsc::Receiver<ServerMessage>,
    next_ref: u64,
    timeout: Duration,
}

impl PagesClient {
    /// Connect to a server at `url` (e.g. `ws://127.0.0.1:9090`).
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| {
                log::warn!("Failed to connect to {url}: {e}");
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientMessage>(256);
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let encoded = match message.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Failed to encode {message:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let (incoming_tx, incoming_rx) = mpsc::channel::<ServerMessage>(1024);
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(message) => {
                            if incoming_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
        });

        *state.write().await = ConnectionState::Connected;
        Ok(Self {
            state,
            outgoing_tx,
            incoming_rx,
            next_ref: 0,
            timeout: Duration::from_secs(5),
        })
    }

    /// How long the `recv*` helpers wait before giving up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(message)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Next server message.
    pub async fn recv(&mut self) -> Result<ServerMessage, ProtocolError> {
        tokio::time::timeout(self.timeout, self.incoming_rx.recv())
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .ok_or(ProtocolError::ConnectionClosed)
    }

    /// Receive until `pred` matches, discarding everything before it.
    pub async fn recv_until(
        &mut self,
        mut pred: impl FnMut(&ServerMessage) -> bool,
    ) -> Result<ServerMessage, ProtocolError> {
        loop {
            let message = self.recv().await?;
            if pred(&message) {
                return Ok(message);
            }
            log::trace!("Skipping {message:?}");
        }
    }

    /// Authenticate and return the assigned session and user ids.
    pub async fn authenticate(&mut self, token: &str) -> Result<(SessionId, UserId), ProtocolError> {
        self.send(ClientMessage::Authenticate {
            token: token.to_string(),
        })
        .await?;
        match self.recv().await? {
            ServerMessage::Authenticated {
                session_id,
                user_id,
                ..
            } => Ok((session_id, user_id)),
            ServerMessage::AuthenticationFailed { reason } => {
                Err(ProtocolError::UnexpectedFrame(format!("authentication failed: {reason}")))
            }
            other => Err(ProtocolError::UnexpectedFrame(format!("{other:?}"))),
        }
    }

    /// Subscribe and build a replica from the catch-up message.
    ///
    /// Pass `replica` to resume from its sequence; it is returned updated.
    pub async fn subscribe(
        &mut self,
        page_id: PageId,
        replica: Option<PageReplica>,
    ) -> Result<PageReplica, ProtocolError> {
        let since = replica.as_ref().map(PageReplica::sequence);
        self.send(ClientMessage::Subscribe { page_id, since }).await?;
        let message = self
            .recv_until(|m| {
                matches!(
                    m,
                    ServerMessage::Snapshot { .. }
                        | ServerMessage::Replay { .. }
                        | ServerMessage::Error { .. }
                ) && m.page_id().map_or(true, |p| p == page_id)
            })
            .await?;
        let mut replica = match (&message, replica) {
            (ServerMessage::Snapshot { snapshot, .. }, _) => PageReplica::new(snapshot),
            (ServerMessage::Replay { .. }, Some(replica)) => replica,
            (ServerMessage::Error { message, .. }, _) => {
                return Err(ProtocolError::UnexpectedFrame(message.clone()))
            }
            (other, _) => return Err(ProtocolError::UnexpectedFrame(format!("{other:?}"))),
        };
        replica
            .observe(&message)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(replica)
    }

    /// Submit an operation; returns the `client_ref` the server will echo.
    pub async fn submit(&mut self, request: OperationRequest) -> Result<u64, ProtocolError> {
        self.next_ref += 1;
        let client_ref = self.next_ref;
        self.send(ClientMessage::Operation { client_ref, request })
            .await?;
        Ok(client_ref)
    }

    pub async fn heartbeat(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Heartbeat).await
    }

    /// Ask the server to close the session.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Close).await
    }
}

/// Client-side copy of a page.
///
/// Applied operations may arrive out of sequence order (a client's own acks
/// can overtake broadcasts), so they are buffered and integrated in order.
pub struct PageReplica {
    store: BlockStore,
    pending: BTreeMap<u64, AppliedOperation>,
}

impl PageReplica {
    pub fn new(snapshot: &PageSnapshot) -> Self {
        Self {
            store: BlockStore::from_snapshot(snapshot),
            pending: BTreeMap::new(),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.store.page_id()
    }

    /// Highest sequence integrated.
    pub fn sequence(&self) -> u64 {
        self.store.sequence()
    }

    /// Operations received but waiting on an earlier sequence.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn snapshot(&self) -> PageSnapshot {
        self.store.snapshot()
    }

    /// Fold one server message into the replica. Messages for other pages
    /// and non-content messages are ignored.
    pub fn observe(&mut self, message: &ServerMessage) -> Result<(), ApplyError> {
        if message.page_id() != Some(self.page_id()) {
            return Ok(());
        }
        match message {
            ServerMessage::Snapshot { snapshot, .. } => {
                if snapshot.sequence >= self.sequence() {
                    self.store = BlockStore::from_snapshot(snapshot);
                    let sequence = snapshot.sequence;
                    self.pending.retain(|seq, _| *seq > sequence);
                }
            }
            ServerMessage::Replay { operations, .. } => {
                for op in operations {
                    self.buffer(op.clone());
                }
            }
            ServerMessage::OperationAck { applied, .. }
            | ServerMessage::OperationApplied { applied } => self.buffer(applied.clone()),
            _ => return Ok(()),
        }
        self.drain()
    }

    fn buffer(&mut self, applied: AppliedOperation) {
        if applied.sequence > self.sequence() {
            self.pending.insert(applied.sequence, applied);
        }
    }

    fn drain(&mut self) -> Result<(), ApplyError> {
        loop {
            let next = self.sequence() + 1;
            let Some(entry) = self.pending.first_entry() else {
                break;
            };
            if *entry.key() != next {
                break;
            }
            let applied = entry.remove();
            self.store.integrate(&applied)?;
        }
        Ok(())
    }
}
