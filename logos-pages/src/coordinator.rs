//! Per-connection session coordinator.
//!
//! State machine:
//! ```text
//!  Connecting ──auth ok──▶ Authenticated ──subscribe──▶ Subscribed(pages)
//!      │                        │                        │  ▲
//!      │ auth failed            │                        └──┘ subscribe /
//!      ▼                        ▼                             unsubscribe
//!   Closing ◀──────── close / transport failure / idle ◀──────┘
//!      │
//!      ▼
//!    Closed   (every joined page: presence removed, subscription dropped)
//! ```
//!
//! The coordinator handles one client message at a time, so a client's
//! operations reach each page in the order it sent them. One forwarder task
//! per subscribed page relays that page's broadcast to the connection's
//! outbound queue.
//!
//! A client's own operations are acknowledged directly by the coordinator
//! and skipped by the forwarder. An `OperationAck` can therefore overtake
//! `OperationApplied` messages with lower sequence numbers; clients apply
//! operations in sequence order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::block::{PageId, SessionId};
use crate::broadcast::PageEvent;
use crate::error::{PagesError, RejectReason};
use crate::identity::{Credentials, Identity, IdentityService};
use crate::manager::PageSessionManager;
use crate::operation::{unix_millis, Operation, OperationRequest};
use crate::page_session::{CatchUp, PageSession, SubmitResult, Subscriber};
use crate::presence::DepartureReason;
use crate::protocol::{ClientMessage, ServerMessage};

/// Connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Subscribed(BTreeSet<PageId>),
    Closing,
    Closed,
}

/// Signals from forwarder tasks back to their coordinator.
#[derive(Debug)]
enum Control {
    /// The page dropped this session after a presence timeout
    PageExpired(PageId),
    /// The outbound queue is gone
    TransportFailed(String),
}

struct PageLink {
    session: Arc<PageSession>,
    forwarder: JoinHandle<()>,
}

/// Drives one client connection.
pub struct SessionCoordinator {
    session_id: SessionId,
    state: SessionState,
    identity: Option<Identity>,
    manager: Arc<PageSessionManager>,
    identity_service: Arc<dyn IdentityService>,
    outbound: mpsc::Sender<ServerMessage>,
    links: HashMap<PageId, PageLink>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: Option<mpsc::UnboundedReceiver<Control>>,
}

impl SessionCoordinator {
    pub fn new(
        manager: Arc<PageSessionManager>,
        identity_service: Arc<dyn IdentityService>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            session_id: Uuid::new_v4(),
            state: SessionState::Connecting,
            identity: None,
            manager,
            identity_service,
            outbound,
            links: HashMap::new(),
            control_tx,
            control_rx: Some(control_rx),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn subscribed_pages(&self) -> BTreeSet<PageId> {
        self.links.keys().copied().collect()
    }

    /// Process inbound messages until the client closes, the transport
    /// fails, or the connection goes idle.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientMessage>) {
        let Some(mut control_rx) = self.control_rx.take() else {
            return;
        };
        let idle_timeout = self.manager.config().idle_timeout;
        // Only client traffic pushes the deadline out.
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let reason = loop {
            tokio::select! {
                () = &mut idle => {
                    log::warn!("Session {} idle for {idle_timeout:?}, closing", self.session_id);
                    break DepartureReason::TimedOut;
                }
                received = inbound.recv() => match received {
                    None => break DepartureReason::Disconnected,
                    Some(message) => {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        if let Err(e) = self.handle(message).await {
                            log::warn!("Session {} closing: {e}", self.session_id);
                            break DepartureReason::Disconnected;
                        }
                        if self.state == SessionState::Closing {
                            break DepartureReason::Unsubscribed;
                        }
                    }
                },
                Some(control) = control_rx.recv() => match control {
                    Control::PageExpired(page_id) => self.drop_link(page_id),
                    Control::TransportFailed(e) => {
                        log::warn!("Session {} transport failed: {e}", self.session_id);
                        break DepartureReason::Disconnected;
                    }
                },
            }
        };
        self.close(reason).await;
    }

    /// Handle one client message.
    ///
    /// Only fatal errors (failed authentication, dead transport) are
    /// returned; everything else is reported to the client and the
    /// connection carries on.
    pub async fn handle(&mut self, message: ClientMessage) -> Result<(), PagesError> {
        let result = match message {
            ClientMessage::Authenticate { token } => self.authenticate(token).await,
            ClientMessage::Close => {
                self.state = SessionState::Closing;
                Ok(())
            }
            other if self.identity.is_none() => {
                log::debug!("Session {} sent {other:?} before authenticating", self.session_id);
                self.send(ServerMessage::AuthenticationFailed {
                    reason: "not authenticated".into(),
                })
                .await?;
                Err(PagesError::Authentication("message before authentication".into()))
            }
            ClientMessage::Subscribe { page_id, since } => self.subscribe(page_id, since).await,
            ClientMessage::Unsubscribe { page_id } => self.unsubscribe(page_id).await,
            ClientMessage::Operation {
                client_ref,
                request,
            } => self.submit(client_ref, request).await,
            ClientMessage::PresenceUpdate {
                page_id,
                cursor,
                selection,
                typing,
            } => match self.links.get(&page_id) {
                Some(link) => link
                    .session
                    .update_presence(self.session_id, cursor, selection, typing, Instant::now())
                    .await
                    .map(|_| ()),
                None => Err(self.not_subscribed(page_id)),
            },
            ClientMessage::Acknowledge { page_id, sequence } => match self.links.get(&page_id) {
                Some(link) => link.session.acknowledge(self.session_id, sequence).await,
                None => Err(self.not_subscribed(page_id)),
            },
            ClientMessage::Undo {
                client_ref,
                page_id,
                sequence,
            } => self.undo(client_ref, page_id, sequence).await,
            ClientMessage::Heartbeat => {
                let now = Instant::now();
                for link in self.links.values() {
                    link.session.heartbeat(self.session_id, now).await;
                }
                self.send(ServerMessage::HeartbeatAck).await
            }
        };

        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                log::debug!("Session {}: {e}", self.session_id);
                self.send(ServerMessage::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                })
                .await
            }
            Ok(()) => Ok(()),
        }
    }

    async fn authenticate(&mut self, token: String) -> Result<(), PagesError> {
        if self.identity.is_some() {
            return Err(PagesError::Invalid("already authenticated".into()));
        }
        match self
            .identity_service
            .authenticate(&Credentials { token })
            .await
        {
            Ok(identity) => {
                log::info!(
                    "Session {} authenticated as {} ({})",
                    self.session_id,
                    identity.display_name,
                    identity.user_id
                );
                let message = ServerMessage::Authenticated {
                    session_id: self.session_id,
                    user_id: identity.user_id,
                    display_name: identity.display_name.clone(),
                };
                self.identity = Some(identity);
                self.state = SessionState::Authenticated;
                self.send(message).await
            }
            Err(e) => {
                log::warn!("Session {} failed to authenticate: {e}", self.session_id);
                self.send(ServerMessage::AuthenticationFailed {
                    reason: e.to_string(),
                })
                .await?;
                Err(PagesError::Authentication(e.to_string()))
            }
        }
    }

    async fn subscribe(&mut self, page_id: PageId, since: Option<u64>) -> Result<(), PagesError> {
        if self.links.contains_key(&page_id) {
            return Err(PagesError::Invalid(format!("already subscribed to page {page_id}")));
        }
        let identity = self
            .identity
            .clone()
            .ok_or_else(|| PagesError::Authentication("not authenticated".into()))?;
        let subscriber = Subscriber {
            session_id: self.session_id,
            user_id: identity.user_id,
            display_name: identity.display_name,
        };
        let (session, subscription) = self.manager.subscribe(page_id, subscriber, since).await?;

        let catch_up = match &subscription.catch_up {
            CatchUp::Snapshot(snapshot) => ServerMessage::Snapshot {
                page_id,
                snapshot: snapshot.clone(),
            },
            CatchUp::Replay { operations, .. } => ServerMessage::replay(page_id, operations),
        };
        self.send(catch_up).await?;
        self.send(ServerMessage::PresenceList {
            page_id,
            entries: subscription.presence,
        })
        .await?;

        let forwarder = tokio::spawn(forward(
            page_id,
            self.session_id,
            subscription.receiver,
            Arc::clone(&session),
            self.outbound.clone(),
            self.control_tx.clone(),
        ));
        self.links.insert(page_id, PageLink { session, forwarder });
        self.sync_state();
        Ok(())
    }

    async fn unsubscribe(&mut self, page_id: PageId) -> Result<(), PagesError> {
        let Some(link) = self.links.remove(&page_id) else {
            return Err(self.not_subscribed(page_id));
        };
        link.forwarder.abort();
        self.sync_state();
        self.manager
            .unsubscribe(page_id, self.session_id, DepartureReason::Unsubscribed)
            .await?;
        self.send(ServerMessage::Unsubscribed { page_id }).await
    }

    async fn submit(&mut self, client_ref: u64, request: OperationRequest) -> Result<(), PagesError> {
        let page_id = request.page_id;
        let Some(link) = self.links.get(&page_id) else {
            return self.reject(client_ref, page_id, RejectReason::NotSubscribed).await;
        };
        let author = self.identity.as_ref().map(|i| i.user_id).unwrap_or_default();
        let op = Operation::from_request(request, self.session_id, author, unix_millis());
        let result = link.session.submit(op).await;
        self.settle(client_ref, page_id, result).await
    }

    async fn undo(&mut self, client_ref: u64, page_id: PageId, sequence: u64) -> Result<(), PagesError> {
        let Some(link) = self.links.get(&page_id) else {
            return self.reject(client_ref, page_id, RejectReason::NotSubscribed).await;
        };
        let author = self.identity.as_ref().map(|i| i.user_id).unwrap_or_default();
        let result = link
            .session
            .undo(self.session_id, author, sequence, unix_millis())
            .await;
        self.settle(client_ref, page_id, result).await
    }

    /// Report a submit outcome to the client.
    async fn settle(
        &mut self,
        client_ref: u64,
        page_id: PageId,
        result: Result<SubmitResult, PagesError>,
    ) -> Result<(), PagesError> {
        match result {
            Ok(SubmitResult::Applied(applied)) => {
                self.send(ServerMessage::OperationAck {
                    client_ref,
                    applied: applied.as_ref().clone(),
                })
                .await
            }
            Ok(SubmitResult::Rejected(reason)) => self.reject(client_ref, page_id, reason).await,
            Err(PagesError::NotSubscribed { .. }) => {
                // The page expired us but the forwarder has not reported it yet.
                self.drop_link(page_id);
                self.reject(client_ref, page_id, RejectReason::NotSubscribed).await
            }
            Err(PagesError::Capacity(_)) => {
                self.drop_link(page_id);
                self.reject(client_ref, page_id, RejectReason::Capacity).await
            }
            Err(e) => Err(e),
        }
    }

    async fn reject(
        &mut self,
        client_ref: u64,
        page_id: PageId,
        reason: RejectReason,
    ) -> Result<(), PagesError> {
        log::debug!(
            "Session {} operation {client_ref} on page {page_id} rejected: {reason:?}",
            self.session_id
        );
        self.send(ServerMessage::OperationRejected {
            client_ref,
            page_id,
            reason,
        })
        .await
    }

    /// Forget a page locally; the page session already dropped us.
    fn drop_link(&mut self, page_id: PageId) {
        if let Some(link) = self.links.remove(&page_id) {
            link.forwarder.abort();
            log::debug!("Session {} lost page {page_id}", self.session_id);
        }
        self.sync_state();
    }

    fn sync_state(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        if self.identity.is_some() {
            let pages = self.subscribed_pages();
            if !pages.is_empty() || matches!(self.state, SessionState::Subscribed(_)) {
                self.state = SessionState::Subscribed(pages);
            }
        }
    }

    fn not_subscribed(&self, page_id: PageId) -> PagesError {
        PagesError::NotSubscribed {
            session_id: self.session_id,
            page_id,
        }
    }

    async fn send(&self, message: ServerMessage) -> Result<(), PagesError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| PagesError::Transport("outbound channel closed".into()))
    }

    /// Leave every page and mark the session closed.
    pub async fn close(&mut self, reason: DepartureReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;
        let pages: Vec<PageId> = self.links.keys().copied().collect();
        for page_id in pages {
            if let Some(link) = self.links.remove(&page_id) {
                link.forwarder.abort();
            }
            if let Err(e) = self
                .manager
                .unsubscribe(page_id, self.session_id, reason)
                .await
            {
                log::error!(
                    "Session {} leaving page {page_id} failed: {e}",
                    self.session_id
                );
            }
        }
        self.state = SessionState::Closed;
        log::info!("Session {} closed ({reason:?})", self.session_id);
    }
}

/// Relay one page's events to a connection.
async fn forward(
    page_id: PageId,
    session_id: SessionId,
    mut events: broadcast::Receiver<PageEvent>,
    page: Arc<PageSession>,
    outbound: mpsc::Sender<ServerMessage>,
    control: mpsc::UnboundedSender<Control>,
) {
    loop {
        let messages = match events.recv().await {
            Ok(PageEvent::Applied(op)) => {
                let mut out = Vec::new();
                if op.origin() != session_id {
                    out.push(ServerMessage::applied(&op));
                }
                if let Some(block) = op.target() {
                    for (_, fields) in op.overwritten().filter(|(s, _)| **s == session_id) {
                        out.push(ServerMessage::EditOverwritten {
                            page_id,
                            block: block.clone(),
                            fields: fields.to_vec(),
                        });
                    }
                }
                out
            }
            Ok(PageEvent::Presence(change)) => {
                if change.session_id() == session_id {
                    continue;
                }
                vec![ServerMessage::PresenceChanged { page_id, change }]
            }
            Ok(PageEvent::Expired { session_id: expired }) => {
                if expired != session_id {
                    continue;
                }
                if outbound
                    .send(ServerMessage::SubscriptionExpired { page_id })
                    .await
                    .is_err()
                {
                    let _ = control.send(Control::TransportFailed("outbound closed".into()));
                }
                let _ = control.send(Control::PageExpired(page_id));
                return;
            }
            Err(RecvError::Lagged(missed)) => {
                log::warn!(
                    "Session {session_id} lagged {missed} events on page {page_id}, resyncing"
                );
                vec![ServerMessage::Snapshot {
                    page_id,
                    snapshot: page.snapshot().await,
                }]
            }
            Err(RecvError::Closed) => return,
        };
        for message in messages {
            if outbound.send(message).await.is_err() {
                let _ = control.send(Control::TransportFailed("outbound closed".into()));
                return;
            }
        }
    }
}
