//! The hub: single owner of the connected-client set and of message fan-out.
//!
//! Registration, unregistration and broadcast are funneled through one
//! channel into [`HubLoop`], which handles each event to completion before
//! taking the next. The loop is the only writer of the client set; other
//! tasks observe membership through [`Hub::connected_clients`].

use crate::error::{ChatdError, StoreError};
use crate::filter::ContentFilter;
use crate::metrics::{counters, gauges, histograms};
use crate::store::MessageStore;
use chat_common::types::DEFAULT_SEARCH_LIMIT;
use chat_common::{Message, ServerFrame};
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Unique id of one connection.
pub type ClientId = Uuid;

/// One encoded frame queued for a client.
///
/// A broadcast is encoded once and the same allocation is queued to every
/// client. The outbound pump still copies it into the `String` payload a
/// WebSocket text message owns.
pub type Outbound = Arc<str>;

const EVENT_BUFFER: usize = 256;

/// Identity bound to a connection at admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Connection id.
    pub id: ClientId,
    /// User id supplied at connect time.
    pub user_id: Option<String>,
    /// Display name supplied at connect time.
    pub username: String,
}

impl Identity {
    /// Overwrites sender fields and the timestamp of a client-submitted
    /// message with this connection's values.
    ///
    /// Any client-chosen id is discarded so the hub assigns a fresh one.
    #[must_use]
    pub fn stamp(&self, mut msg: Message) -> Message {
        msg.id.clear();
        msg.user_id = self.user_id.clone();
        msg.username = Some(self.username.clone());
        msg.created_at = Some(now_micros());
        msg
    }
}

/// Current time at the microsecond precision the message store keeps.
fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// The hub's view of a registered client.
///
/// The hub holds the only sender of the client's outbound queue, so
/// dropping the handle is what closes the queue.
#[derive(Debug)]
pub struct ClientHandle {
    identity: Identity,
    tx: mpsc::Sender<Outbound>,
    joined_at: DateTime<Utc>,
}

impl ClientHandle {
    /// Creates a handle and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(
        user_id: Option<String>,
        username: String,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            identity: Identity {
                id: Uuid::new_v4(),
                user_id,
                username,
            },
            tx,
            joined_at: Utc::now(),
        };
        (handle, rx)
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.identity.id
    }

    /// Identity bound to this connection.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// When the connection was admitted.
    #[must_use]
    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }
}

enum HubEvent {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(Message),
    DisconnectAll,
}

impl std::fmt::Debug for HubEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(c) => write!(f, "Register({})", c.id()),
            Self::Unregister(id) => write!(f, "Unregister({id})"),
            Self::Broadcast(m) => write!(f, "Broadcast({})", m.id),
            Self::DisconnectAll => f.write_str("DisconnectAll"),
        }
    }
}

/// Cloneable handle used to talk to the hub.
#[derive(Clone, Debug)]
pub struct Hub {
    events: mpsc::Sender<HubEvent>,
    store: Arc<MessageStore>,
    connected: Arc<AtomicUsize>,
}

impl Hub {
    /// Creates a hub handle and the event loop that serves it.
    ///
    /// The loop does nothing until [`HubLoop::run`] is awaited.
    #[must_use]
    pub fn new(
        store: Arc<MessageStore>,
        filter: Arc<ContentFilter>,
        history_limit: usize,
    ) -> (Self, HubLoop) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let connected = Arc::new(AtomicUsize::new(0));
        let hub = Self {
            events: events_tx,
            store: Arc::clone(&store),
            connected: Arc::clone(&connected),
        };
        let event_loop = HubLoop {
            events: events_rx,
            clients: HashMap::new(),
            filter,
            store,
            connected,
            history_limit,
        };
        (hub, event_loop)
    }

    /// Creates a hub and spawns its event loop on the current runtime.
    #[must_use]
    pub fn spawn(
        store: Arc<MessageStore>,
        filter: Arc<ContentFilter>,
        history_limit: usize,
    ) -> Self {
        let (hub, event_loop) = Self::new(store, filter, history_limit);
        tokio::spawn(event_loop.run());
        hub
    }

    async fn send(&self, event: HubEvent) -> Result<(), ChatdError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ChatdError::HubClosed)
    }

    /// Adds a client; the hub replies on its queue with recent history.
    ///
    /// # Errors
    ///
    /// Returns [`ChatdError::HubClosed`] if the event loop has stopped.
    pub async fn register(&self, client: ClientHandle) -> Result<(), ChatdError> {
        self.send(HubEvent::Register(client)).await
    }

    /// Removes a client and closes its queue. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ChatdError::HubClosed`] if the event loop has stopped.
    pub async fn unregister(&self, id: ClientId) -> Result<(), ChatdError> {
        self.send(HubEvent::Unregister(id)).await
    }

    /// Queues a message for filtering, persistence and fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`ChatdError::HubClosed`] if the event loop has stopped.
    pub async fn broadcast(&self, msg: Message) -> Result<(), ChatdError> {
        self.send(HubEvent::Broadcast(msg)).await
    }

    /// Removes every client and closes their queues.
    ///
    /// Each connection then sends a close frame and ends, which lets a
    /// shutting-down server drain its connection tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ChatdError::HubClosed`] if the event loop has stopped.
    pub async fn disconnect_all(&self) -> Result<(), ChatdError> {
        self.send(HubEvent::DisconnectAll).await
    }

    /// Number of currently registered clients.
    #[must_use]
    pub fn connected_clients(&self) -> usize {
        self.connected.load(Ordering::Acquire)
    }

    /// Case-insensitive substring search over persisted messages, newest first.
    ///
    /// A `limit` of zero means [`DEFAULT_SEARCH_LIMIT`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn search_messages(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let store = Arc::clone(&self.store);
        let query = query.to_string();
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        tokio::task::spawn_blocking(move || store.search(&query, limit)).await?
    }

    /// Persisted messages with `start <= created_at < end`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn messages_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.by_date_range(start, end)).await?
    }

    /// Deletes persisted messages older than `retention`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn purge_expired(&self, retention: chrono::Duration) -> Result<usize, StoreError> {
        let store = Arc::clone(&self.store);
        let cutoff = Utc::now() - retention;
        tokio::task::spawn_blocking(move || store.purge_older_than(cutoff)).await?
    }

    /// Spawns the periodic retention sweep.
    ///
    /// The first sweep runs one `period` after the call. Failures are logged
    /// and the schedule continues.
    pub fn spawn_retention_sweep(
        &self,
        retention: chrono::Duration,
        period: Duration,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                match hub.purge_expired(retention).await {
                    Ok(removed) => info!(removed, "retention sweep finished"),
                    Err(e) => {
                        counters::store_errors_total("purge");
                        error!(error = %e, "retention sweep failed");
                    }
                }
            }
        })
    }
}

/// The serialized event loop behind a [`Hub`].
pub struct HubLoop {
    events: mpsc::Receiver<HubEvent>,
    clients: HashMap<ClientId, ClientHandle>,
    filter: Arc<ContentFilter>,
    store: Arc<MessageStore>,
    connected: Arc<AtomicUsize>,
    history_limit: usize,
}

impl HubLoop {
    /// Processes events until every [`Hub`] handle has been dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                HubEvent::Register(client) => self.handle_register(client).await,
                HubEvent::Unregister(id) => self.handle_unregister(id),
                HubEvent::Broadcast(msg) => self.handle_broadcast(msg),
                HubEvent::DisconnectAll => self.handle_disconnect_all(),
            }
        }
        debug!("hub event loop stopped");
    }

    fn publish_count(&self) {
        let count = self.clients.len();
        self.connected.store(count, Ordering::Release);
        gauges::connections_active(count);
    }

    async fn handle_register(&mut self, client: ClientHandle) {
        let id = client.id();
        self.clients.insert(id, client);
        self.publish_count();
        info!(client = %id, total = self.clients.len(), "client connected");

        let history = self.load_history().await;
        let frame = match ServerFrame::RecentMessages(history).serialize() {
            Ok(json) => Outbound::from(json),
            Err(e) => {
                error!(error = %e, "failed to encode history");
                Outbound::from(r#"{"type":"recent_messages","messages":[]}"#)
            }
        };

        let delivered = self
            .clients
            .get(&id)
            .map(|client| client.tx.try_send(frame).is_ok());
        if delivered == Some(false) {
            counters::clients_dropped_total("history_undeliverable");
            warn!(client = %id, "dropping client: could not deliver history");
            let removed = self.clients.remove(&id);
            self.publish_count();
            drop(removed);
        }
    }

    async fn load_history(&self) -> Vec<Message> {
        let store = Arc::clone(&self.store);
        let limit = self.history_limit;
        match tokio::task::spawn_blocking(move || store.recent(limit)).await {
            Ok(Ok(messages)) => messages,
            Ok(Err(e)) => {
                counters::store_errors_total("recent");
                warn!(error = %e, "failed to load recent messages");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "recent messages task failed");
                Vec::new()
            }
        }
    }

    fn handle_unregister(&mut self, id: ClientId) {
        if let Some(client) = self.clients.remove(&id) {
            self.publish_count();
            info!(
                client = %id,
                connected_secs = (Utc::now() - client.joined_at()).num_seconds(),
                total = self.clients.len(),
                "client disconnected"
            );
            drop(client);
        }
    }

    fn handle_disconnect_all(&mut self) {
        let removed: Vec<ClientHandle> = self.clients.drain().map(|(_, client)| client).collect();
        self.publish_count();
        info!(count = removed.len(), "disconnecting all clients");
        drop(removed);
    }

    fn handle_broadcast(&mut self, mut msg: Message) {
        if msg.id.is_empty() {
            msg.id = Uuid::new_v4().to_string();
        }
        msg.created_at.get_or_insert_with(now_micros);
        msg.content = self.filter.mask(&msg.content);

        self.persist(msg.clone());

        let id = msg.id.clone();
        let frame = match ServerFrame::Message(msg).serialize() {
            Ok(json) => Outbound::from(json),
            Err(e) => {
                error!(id = %id, error = %e, "failed to encode message");
                return;
            }
        };

        let start = Instant::now();
        let mut dead = Vec::new();
        for (client_id, client) in &self.clients {
            match client.tx.try_send(Arc::clone(&frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dead.push((*client_id, "slow_consumer")),
                Err(TrySendError::Closed(_)) => dead.push((*client_id, "closed")),
            }
        }

        let removed: Vec<ClientHandle> = dead
            .into_iter()
            .filter_map(|(client_id, reason)| {
                counters::clients_dropped_total(reason);
                warn!(client = %client_id, reason, "dropping client during fan-out");
                self.clients.remove(&client_id)
            })
            .collect();
        if !removed.is_empty() {
            self.publish_count();
        }
        drop(removed);

        counters::messages_broadcast_total();
        histograms::fanout_seconds(start.elapsed().as_secs_f64());
    }

    fn persist(&self, msg: Message) {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.save(&msg) {
                counters::store_errors_total("save");
                warn!(id = %msg.id, error = %e, "failed to persist message");
            }
        });
    }
}
