//! Relay engine — serialized fan-out of whiteboard events.
//!
//! ARCHITECTURE
//! ============
//! One tokio task owns the `RelayEngine`: the connection registry, the
//! active session pointer and the store handle. Everything that can change
//! what a client sees (connects, client events, disconnects, the two admin
//! hooks) arrives as a `RelayCommand` on a single channel and is processed
//! to completion before the next command. Receipt order is broadcast order.
//!
//! DESIGN
//! ======
//! - Durable events (`draw`, `clearCanvas`) hit the store before fan-out,
//!   so a join snapshot always agrees with what was already broadcast.
//! - Store failures are logged; the broadcast still goes out.
//! - Each connection has a bounded outbound queue, created here at join
//!   with room for the join snapshot. A connection whose queue is full or
//!   closed is evicted exactly like a disconnect. Client streams are
//!   therefore gap-free; a reconnect resyncs through `loadSession`.
//! - A single active session is shared by every connection.
//!
//! LIFECYCLE
//! =========
//! CONNECTING --register--> ACTIVE --close / evict--> CLOSED
//! Events from a CLOSED connection are dropped.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::frame::{ClientEvent, ServerEvent, UserInfo};
use crate::services::registry::{ConnectionIdentity, ConnectionRegistry, RegistryError};
use crate::services::store::{SessionStore, StoreError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay is not running")]
    Unavailable,
    #[error("session not found: {0}")]
    SessionNotFound(i64),
    #[error("connection {0} was evicted while joining")]
    EvictedOnJoin(Uuid),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Queue sizes and limits for the relay.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Capacity of the shared command channel.
    pub command_buffer: usize,
    /// Live-event capacity of each connection's outbound queue. The join
    /// snapshot is allotted on top of this.
    pub outbound_buffer: usize,
    /// Hard cap on live connections; `None` means unlimited.
    pub max_connections: Option<usize>,
    /// Active session at startup.
    pub default_session_id: i64,
}

/// Snapshot of who is connected and which session is live.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub active_session_id: i64,
    pub users: Vec<UserInfo>,
}

/// A registered connection and the queue the relay fills for it. The roster
/// and `loadSession` are already queued when this is handed out.
#[derive(Debug)]
pub struct Joined {
    pub identity: ConnectionIdentity,
    pub outbound: mpsc::Receiver<ServerEvent>,
}

#[derive(Debug)]
pub enum RelayCommand {
    Connect {
        reply: oneshot::Sender<Result<Joined, RelayError>>,
    },
    Event {
        connection_id: Uuid,
        event: ClientEvent,
    },
    Disconnect {
        connection_id: Uuid,
    },
    LoadSession {
        session_id: i64,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    ClearSession {
        session_id: i64,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Presence {
        reply: oneshot::Sender<Presence>,
    },
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable handle to the relay task.
#[derive(Clone)]
pub struct Relay {
    tx: mpsc::Sender<RelayCommand>,
}

impl Relay {
    /// Spawn the relay task. It stops once every handle is dropped.
    pub fn spawn(store: Arc<dyn SessionStore>, config: RelayConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_buffer);
        let engine = RelayEngine::new(store, config);
        let task = tokio::spawn(engine.run(rx));
        (Self { tx }, task)
    }

    /// Register a connection. The returned queue already holds the join
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Registry`] when the connection cap is reached.
    pub async fn connect(&self) -> Result<Joined, RelayError> {
        self.request(|reply| RelayCommand::Connect { reply }).await?
    }

    /// Enqueue a client event. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unavailable`] if the relay task is gone.
    pub async fn submit(&self, connection_id: Uuid, event: ClientEvent) -> Result<(), RelayError> {
        self.tx
            .send(RelayCommand::Event { connection_id, event })
            .await
            .map_err(|_| RelayError::Unavailable)
    }

    /// Mark a connection closed.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unavailable`] if the relay task is gone.
    pub async fn disconnect(&self, connection_id: Uuid) -> Result<(), RelayError> {
        self.tx
            .send(RelayCommand::Disconnect { connection_id })
            .await
            .map_err(|_| RelayError::Unavailable)
    }

    /// Make `session_id` the active session and push it to every connection.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SessionNotFound`] for an unknown session, or a
    /// store error if the elements cannot be read.
    pub async fn load_session(&self, session_id: i64) -> Result<(), RelayError> {
        self.request(|reply| RelayCommand::LoadSession { session_id, reply })
            .await?
    }

    /// Clear a session's elements; broadcasts `clearCanvas` if it is active.
    ///
    /// # Errors
    ///
    /// Returns a store error if the delete fails.
    pub async fn clear_session(&self, session_id: i64) -> Result<(), RelayError> {
        self.request(|reply| RelayCommand::ClearSession { session_id, reply })
            .await?
    }

    /// Current roster and active session.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unavailable`] if the relay task is gone.
    pub async fn presence(&self) -> Result<Presence, RelayError> {
        self.request(|reply| RelayCommand::Presence { reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RelayCommand) -> Result<T, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| RelayError::Unavailable)?;
        rx.await.map_err(|_| RelayError::Unavailable)
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct RelayEngine {
    registry: ConnectionRegistry,
    active_session_id: i64,
    outbound_buffer: usize,
    store: Arc<dyn SessionStore>,
}

impl RelayEngine {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, config: RelayConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.max_connections),
            active_session_id: config.default_session_id,
            outbound_buffer: config.outbound_buffer,
            store,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn active_session_id(&self) -> i64 {
        self.active_session_id
    }

    #[cfg(test)]
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Process commands until every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<RelayCommand>) {
        info!(active_session_id = self.active_session_id, "relay started");
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        info!(connections = self.registry.len(), "relay stopped");
    }

    async fn handle(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Connect { reply } => {
                let _ = reply.send(self.connect().await);
            }
            RelayCommand::Event { connection_id, event } => {
                self.handle_event(connection_id, event).await;
            }
            RelayCommand::Disconnect { connection_id } => {
                self.disconnect(connection_id);
            }
            RelayCommand::LoadSession { session_id, reply } => {
                let _ = reply.send(self.load_session(session_id).await);
            }
            RelayCommand::ClearSession { session_id, reply } => {
                let _ = reply.send(self.clear_session(session_id).await);
            }
            RelayCommand::Presence { reply } => {
                let _ = reply.send(self.presence());
            }
        }
    }

    // -------------------------------------------------------------------------
    // JOIN / LEAVE
    // -------------------------------------------------------------------------

    /// CONNECTING -> ACTIVE. Announces the newcomer to peers, then queues the
    /// roster and the active session snapshot for the newcomer.
    ///
    /// The newcomer's queue holds one `userJoin` per peer plus `loadSession`
    /// on top of `outbound_buffer`, so the snapshot never counts against
    /// the live-event budget.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Registry`] when the connection cap is reached,
    /// or [`RelayError::EvictedOnJoin`] if the snapshot could not be queued.
    pub async fn connect(&mut self) -> Result<Joined, RelayError> {
        let snapshot_len = self.registry.len() + 1;
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_buffer + snapshot_len);
        let identity = self.registry.register(outbound_tx)?;
        let connection_id = identity.connection_id;
        info!(%connection_id, name = %identity.display_name, connections = self.registry.len(), "relay: connection active");

        self.fan_out(&ServerEvent::UserJoin { user: identity.user_info() }, Some(connection_id));

        let roster: Vec<ServerEvent> = self
            .registry
            .all()
            .into_iter()
            .filter(|peer| peer.connection_id != connection_id)
            .map(|peer| ServerEvent::UserJoin { user: peer.user_info() })
            .collect();
        for event in roster {
            if !self.send_to(connection_id, event) {
                return Err(RelayError::EvictedOnJoin(connection_id));
            }
        }

        if let Some(snapshot) = self.session_snapshot(self.active_session_id).await {
            if !self.send_to(connection_id, snapshot) {
                return Err(RelayError::EvictedOnJoin(connection_id));
            }
        }
        Ok(Joined { identity, outbound: outbound_rx })
    }

    /// ACTIVE -> CLOSED. Idempotent.
    pub fn disconnect(&mut self, connection_id: Uuid) {
        self.evict(vec![connection_id]);
    }

    // -------------------------------------------------------------------------
    // CLIENT EVENTS
    // -------------------------------------------------------------------------

    /// Apply one client event and fan it out.
    pub async fn handle_event(&mut self, connection_id: Uuid, event: ClientEvent) {
        if self.registry.lookup(connection_id).is_none() {
            debug!(%connection_id, kind = event.kind(), "relay: dropping event from closed connection");
            return;
        }

        match event {
            ClientEvent::Draw { element } => {
                let session_id = self.active_session_id;
                if let Err(e) = self.store.append_element(session_id, element.clone()).await {
                    warn!(error = %e, %connection_id, session_id, element_id = %element.id, "relay: failed to persist element");
                }
                self.fan_out(&ServerEvent::Draw { element }, Some(connection_id));
            }
            ClientEvent::Cursor { x, y } => {
                let Some(sender) = self.registry.lookup(connection_id) else {
                    return;
                };
                let stamped = ServerEvent::Cursor {
                    x,
                    y,
                    user_id: sender.connection_id,
                    username: sender.display_name.clone(),
                    color: sender.color.clone(),
                };
                self.fan_out(&stamped, Some(connection_id));
            }
            ClientEvent::ClearCanvas => {
                let session_id = self.active_session_id;
                if let Err(e) = self.store.clear_elements(session_id).await {
                    warn!(error = %e, %connection_id, session_id, "relay: failed to clear elements");
                }
                info!(%connection_id, session_id, "relay: canvas cleared");
                self.fan_out(&ServerEvent::ClearCanvas, None);
            }
            ClientEvent::UndoRedo { elements } => {
                debug!(%connection_id, count = elements.len(), "relay: undo/redo state");
                self.fan_out(&ServerEvent::UndoRedo { elements }, Some(connection_id));
            }
        }
    }

    // -------------------------------------------------------------------------
    // ADMIN HOOKS
    // -------------------------------------------------------------------------

    /// Switch the active session and replace every client's state with it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SessionNotFound`] or a store error. The pointer
    /// only moves once the elements have been read.
    pub async fn load_session(&mut self, session_id: i64) -> Result<(), RelayError> {
        if self.store.get_session(session_id).await?.is_none() {
            return Err(RelayError::SessionNotFound(session_id));
        }
        let elements = self.store.list_elements(session_id).await?;

        self.active_session_id = session_id;
        info!(session_id, elements = elements.len(), connections = self.registry.len(), "relay: session loaded");
        self.fan_out(&ServerEvent::LoadSession { session_id, elements }, None);
        Ok(())
    }

    /// Clear a session. Clients only hear about it if it is the active one.
    ///
    /// # Errors
    ///
    /// Returns a store error if the delete fails; nothing is broadcast then.
    pub async fn clear_session(&mut self, session_id: i64) -> Result<(), RelayError> {
        self.store.clear_elements(session_id).await?;
        if session_id == self.active_session_id {
            info!(session_id, "relay: active session cleared");
            self.fan_out(&ServerEvent::ClearCanvas, None);
        } else {
            debug!(session_id, active = self.active_session_id, "relay: cleared inactive session");
        }
        Ok(())
    }

    #[must_use]
    pub fn presence(&self) -> Presence {
        Presence {
            active_session_id: self.active_session_id,
            users: self.registry.all().iter().map(ConnectionIdentity::user_info).collect(),
        }
    }

    // -------------------------------------------------------------------------
    // DELIVERY
    // -------------------------------------------------------------------------

    async fn session_snapshot(&self, session_id: i64) -> Option<ServerEvent> {
        match self.store.get_session(session_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(session_id, "relay: active session missing; skipping session load");
                return None;
            }
            Err(e) => {
                error!(error = %e, session_id, "relay: failed to read active session");
                return None;
            }
        }
        match self.store.list_elements(session_id).await {
            Ok(elements) => Some(ServerEvent::LoadSession { session_id, elements }),
            Err(e) => {
                error!(error = %e, session_id, "relay: failed to load session elements");
                None
            }
        }
    }

    /// Queue an event for one connection. Evicts it and returns false if its
    /// queue cannot take the event.
    fn send_to(&mut self, connection_id: Uuid, event: ServerEvent) -> bool {
        let Some(tx) = self.registry.outbound_for(connection_id) else {
            return false;
        };
        if let Err(e) = tx.try_send(event) {
            log_undeliverable(connection_id, &e);
            self.evict(vec![connection_id]);
            return false;
        }
        true
    }

    /// Queue an event for every ACTIVE connection except `exclude`.
    fn fan_out(&mut self, event: &ServerEvent, exclude: Option<Uuid>) {
        let mut stalled = Vec::new();
        for (connection_id, tx) in self.registry.outbound() {
            if exclude == Some(connection_id) {
                continue;
            }
            if let Err(e) = tx.try_send(event.clone()) {
                log_undeliverable(connection_id, &e);
                stalled.push(connection_id);
            }
        }
        self.evict(stalled);
    }

    /// Close connections and announce each departure exactly once. Peers that
    /// cannot take the `userLeave` are evicted in turn.
    fn evict(&mut self, mut pending: Vec<Uuid>) {
        while let Some(connection_id) = pending.pop() {
            let Some(identity) = self.registry.unregister(connection_id) else {
                continue;
            };
            info!(%connection_id, name = %identity.display_name, remaining = self.registry.len(), "relay: connection closed");
            if self.registry.is_empty() {
                debug!("relay: no connections left");
                continue;
            }

            let leave = ServerEvent::UserLeave { user_id: connection_id };
            for (peer_id, tx) in self.registry.outbound() {
                if let Err(e) = tx.try_send(leave.clone()) {
                    log_undeliverable(peer_id, &e);
                    if !pending.contains(&peer_id) {
                        pending.push(peer_id);
                    }
                }
            }
        }
    }
}

fn log_undeliverable(connection_id: Uuid, err: &TrySendError<ServerEvent>) {
    match err {
        TrySendError::Full(event) => {
            warn!(%connection_id, kind = event.kind(), "relay: outbound queue full; evicting connection");
        }
        TrySendError::Closed(_) => {
            debug!(%connection_id, "relay: outbound queue closed");
        }
    }
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
