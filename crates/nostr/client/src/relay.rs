//! Single relay connection management
//!
//! Each [`RelayConnection`] owns a background lifecycle task that connects,
//! pumps frames in both directions, and retries with exponential backoff
//! until the retry budget is spent:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                    ^   |          |
//!                    |   v          v
//!                   Retrying <------+      (retry_count < max_retries)
//!                       |
//!                       v
//!                   Abandoned              (no further automatic attempts)
//! ```
//!
//! Subscriptions are routed by id to per-relay channels and re-issued after
//! every reconnect. Malformed frames are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nostr::Event;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying
    Disconnected,
    /// Attempt in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Waiting out a backoff delay before the next attempt
    Retrying,
    /// Retry budget exhausted; only an explicit `connect()` restarts it
    Abandoned,
}

/// Ceiling for a single backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero based), saturating at
    /// [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(self.initial_interval.as_secs_f64() * factor)
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_retries: 5,
        }
    }
}

/// Relay connection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Timeout for a single connect attempt
    pub connect_timeout: Duration,
    /// Reconnection policy
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Confirmation result for event publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    /// Event ID that was published
    pub event_id: String,
    /// Whether the relay accepted the event
    pub accepted: bool,
    /// Message from the relay (empty if accepted, reason if rejected)
    pub message: String,
}

/// What a relay delivers for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelaySubscriptionMessage {
    Event(Event),
    Eose,
    /// The relay closed the subscription, or the connection dropped.
    Closed(String),
}

struct Route {
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<RelaySubscriptionMessage>,
}

#[derive(Debug, Default)]
struct Status {
    retry_count: u32,
    last_error: Option<String>,
}

/// State shared between the handle and its lifecycle task.
struct Shared {
    url: Url,
    config: RelayConfig,
    state: watch::Sender<ConnectionState>,
    status: Mutex<Status>,
    attempts: AtomicU32,
    routes: Mutex<HashMap<String, Route>>,
    /// Waiters per event id; each publish call registers under its own token.
    pending_confirmations: Mutex<HashMap<String, Vec<(u64, oneshot::Sender<PublishConfirmation>)>>>,
    next_token: AtomicU64,
    /// Present only while connected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

struct Lifecycle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

enum Exit {
    Stopped,
    Lost(String),
}

/// Relay connection
pub struct RelayConnection {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let url = Url::parse(url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            shared: Arc::new(Shared {
                url,
                config,
                state,
                status: Mutex::new(Status::default()),
                attempts: AtomicU32::new(0),
                routes: Mutex::new(HashMap::new()),
                pending_confirmations: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                outbound: Mutex::new(None),
            }),
            lifecycle: Mutex::new(None),
        })
    }

    /// Connect to the relay.
    ///
    /// Waits for the outcome of the first attempt; on failure, retries carry
    /// on in the background. A no-op while connecting or connected. While a
    /// backoff delay is pending it fails with the last error and leaves the
    /// retry schedule alone. Calling this on an abandoned relay restarts it
    /// with a fresh retry budget.
    pub async fn connect(&self) -> Result<()> {
        let first_attempt = {
            let mut lifecycle = self.lifecycle.lock();
            if let Some(running) = lifecycle.as_ref()
                && !running.handle.is_finished()
            {
                match self.state() {
                    ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
                    ConnectionState::Retrying => {
                        let reason = self
                            .last_error()
                            .unwrap_or_else(|| "waiting to retry".to_string());
                        return Err(ClientError::Connection(format!(
                            "{} is retrying: {}",
                            self.shared.url, reason
                        )));
                    }
                    ConnectionState::Disconnected | ConnectionState::Abandoned => {}
                }
            }

            self.shared.status.lock().retry_count = 0;
            self.shared.set_state(ConnectionState::Connecting);

            let (first_tx, first_rx) = oneshot::channel();
            let (shutdown, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(Arc::clone(&self.shared).run(shutdown_rx, first_tx));
            *lifecycle = Some(Lifecycle { handle, shutdown });
            first_rx
        };

        first_attempt
            .await
            .unwrap_or_else(|_| Err(ClientError::Connection("connection cancelled".into())))
    }

    /// Disconnect from the relay: send a close frame and stop retrying.
    pub async fn disconnect(&self) {
        let lifecycle = self.lifecycle.lock().take();
        if let Some(lifecycle) = lifecycle {
            info!("Disconnecting from relay: {}", self.shared.url);
            let _ = lifecycle.shutdown.send(true);
            let _ = lifecycle.handle.await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Relay URL
    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Normalized URL string (no trailing slash)
    pub fn url_str(&self) -> &str {
        self.shared.url.as_str().trim_end_matches('/')
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Retries used since the last successful connection.
    pub fn retry_count(&self) -> u32 {
        self.shared.status.lock().retry_count
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.status.lock().last_error.clone()
    }

    /// Total connection attempts made over this connection's lifetime.
    pub fn connection_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Publish an event and wait for the relay's OK.
    pub async fn publish_event(
        &self,
        event: &Event,
        confirmation_timeout: Duration,
    ) -> Result<PublishConfirmation> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingConfirmation::register(&self.shared, &event.id, tx);

        self.shared.send(&ClientMessage::Event(event.clone()))?;

        match timeout(confirmation_timeout, rx).await {
            Ok(Ok(confirmation)) => Ok(confirmation),
            Ok(Err(_)) => Err(ClientError::Connection(format!(
                "{} disconnected before confirming {}",
                self.shared.url, pending.event_id
            ))),
            Err(_) => Err(ClientError::Timeout(format!(
                "no OK from {} within {:?}",
                self.shared.url, confirmation_timeout
            ))),
        }
    }

    /// Open a subscription on this relay.
    pub fn subscribe(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
    ) -> Result<mpsc::UnboundedReceiver<RelaySubscriptionMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let req = ClientMessage::req(subscription_id, filters.clone());

        self.shared
            .routes
            .lock()
            .insert(subscription_id.to_string(), Route { filters, tx });

        if let Err(e) = self.shared.send(&req) {
            self.shared.routes.lock().remove(subscription_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Close a subscription. Safe to call from `Drop`.
    pub fn unsubscribe(&self, subscription_id: &str) {
        if self.shared.routes.lock().remove(subscription_id).is_none() {
            return;
        }
        if let Err(e) = self.shared.send(&ClientMessage::close(subscription_id)) {
            debug!(
                "CLOSE for {} not sent to {}: {}",
                subscription_id, self.shared.url, e
            );
        }
    }

    /// Get all active subscription IDs
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.shared.routes.lock().keys().cloned().collect()
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(lifecycle) = self.lifecycle.get_mut().take() {
            let _ = lifecycle.shutdown.send(true);
        }
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url_str())
            .field("state", &self.state())
            .finish()
    }
}

/// Removes its own waiter when the publish future ends, including when it
/// is dropped mid-flight. Other waiters on the same event are left alone.
struct PendingConfirmation<'a> {
    shared: &'a Shared,
    event_id: String,
    token: u64,
}

impl<'a> PendingConfirmation<'a> {
    fn register(
        shared: &'a Shared,
        event_id: &str,
        tx: oneshot::Sender<PublishConfirmation>,
    ) -> Self {
        let token = shared.next_token.fetch_add(1, Ordering::Relaxed);
        shared
            .pending_confirmations
            .lock()
            .entry(event_id.to_string())
            .or_default()
            .push((token, tx));
        Self {
            shared,
            event_id: event_id.to_string(),
            token,
        }
    }
}

impl Drop for PendingConfirmation<'_> {
    fn drop(&mut self) {
        let mut pending = self.shared.pending_confirmations.lock();
        if let Some(waiters) = pending.get_mut(&self.event_id) {
            waiters.retain(|(token, _)| *token != self.token);
            if waiters.is_empty() {
                pending.remove(&self.event_id);
            }
        }
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Relay {} state {:?} -> {:?}", self.url, previous, state);
        }
    }

    fn send(&self, msg: &ClientMessage) -> Result<()> {
        let text = msg.to_json()?;
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(ClientError::NotConnected)?;
        debug!("Sending to {}: {}", self.url, text);
        tx.send(Message::text(text))
            .map_err(|_| ClientError::NotConnected)
    }

    async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        first_attempt: oneshot::Sender<Result<()>>,
    ) {
        let mut first_attempt = Some(first_attempt);

        loop {
            self.set_state(ConnectionState::Connecting);
            self.attempts.fetch_add(1, Ordering::SeqCst);
            info!("Connecting to relay: {}", self.url);

            let attempt = tokio::select! {
                _ = shutdown.changed() => {
                    self.finish(ConnectionState::Disconnected, &mut first_attempt);
                    return;
                }
                result = timeout(self.config.connect_timeout, connect_async(self.url.as_str())) => result,
            };

            let failure = match attempt {
                Ok(Ok((ws, _))) => {
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    *self.outbound.lock() = Some(out_tx);
                    {
                        let mut status = self.status.lock();
                        status.retry_count = 0;
                        status.last_error = None;
                    }
                    self.set_state(ConnectionState::Connected);
                    info!("Connected to relay: {}", self.url);
                    self.resubscribe();
                    if let Some(tx) = first_attempt.take() {
                        let _ = tx.send(Ok(()));
                    }

                    let exit = self.drive(ws, out_rx, &mut shutdown).await;
                    self.connection_lost();
                    match exit {
                        Exit::Stopped => {
                            self.set_state(ConnectionState::Disconnected);
                            info!("Disconnected from relay: {}", self.url);
                            return;
                        }
                        Exit::Lost(reason) => reason,
                    }
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                ),
            };

            let retry = {
                let mut status = self.status.lock();
                status.last_error = Some(failure.clone());
                status.retry_count
            };

            if retry >= self.config.retry.max_retries {
                warn!(
                    "Abandoning relay {} after {} retries: {}",
                    self.url, retry, failure
                );
                self.finish(ConnectionState::Abandoned, &mut first_attempt);
                return;
            }

            let delay = self.config.retry.delay_for(retry);
            self.status.lock().retry_count = retry + 1;
            self.set_state(ConnectionState::Retrying);
            warn!(
                "Relay {} failed ({}); retry {} of {} in {:?}",
                self.url,
                failure,
                retry + 1,
                self.config.retry.max_retries,
                delay
            );
            if let Some(tx) = first_attempt.take() {
                let _ = tx.send(Err(ClientError::Connection(failure)));
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    self.finish(ConnectionState::Disconnected, &mut first_attempt);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish(
        &self,
        state: ConnectionState,
        first_attempt: &mut Option<oneshot::Sender<Result<()>>>,
    ) {
        self.set_state(state);
        if let Some(tx) = first_attempt.take() {
            let reason = self
                .status
                .lock()
                .last_error
                .clone()
                .unwrap_or_else(|| format!("{:?}", state));
            let _ = tx.send(Err(ClientError::Connection(reason)));
        }
    }

    async fn drive<S>(
        &self,
        ws: S,
        mut out_rx: mpsc::UnboundedReceiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit
    where
        S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Exit::Stopped;
                }
                outgoing = out_rx.recv() => {
                    let Some(msg) = outgoing else {
                        return Exit::Lost("outbound channel closed".into());
                    };
                    if let Err(e) = sink.send(msg).await {
                        return Exit::Lost(e.to_string());
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return Exit::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Relay {} closed connection", self.url);
                        return Exit::Lost("closed by relay".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", self.url, e);
                        return Exit::Lost(e.to_string());
                    }
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        debug!("Received from {}: {}", self.url, text);

        let msg = match RelayMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed message from {}: {}", self.url, e);
                return;
            }
        };

        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.route(&subscription_id, RelaySubscriptionMessage::Event(event)),
            RelayMessage::Eose { subscription_id } => {
                self.route(&subscription_id, RelaySubscriptionMessage::Eose)
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                info!(
                    "Relay {} closed subscription {}: {}",
                    self.url, subscription_id, message
                );
                if let Some(route) = self.routes.lock().remove(&subscription_id) {
                    let _ = route.tx.send(RelaySubscriptionMessage::Closed(message));
                }
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                let waiters = self.pending_confirmations.lock().remove(&event_id);
                for (_, tx) in waiters.into_iter().flatten() {
                    let _ = tx.send(PublishConfirmation {
                        event_id: event_id.clone(),
                        accepted: success,
                        message: message.clone(),
                    });
                }
            }
            RelayMessage::Notice { message } => {
                info!("NOTICE from {}: {}", self.url, message);
            }
            RelayMessage::Auth { .. } | RelayMessage::Count { .. } => {
                debug!("Ignoring AUTH/COUNT from {}", self.url);
            }
        }
    }

    fn route(&self, subscription_id: &str, msg: RelaySubscriptionMessage) {
        let mut routes = self.routes.lock();
        let Some(route) = routes.get(subscription_id) else {
            debug!(
                "Message for unknown subscription {} from {}",
                subscription_id, self.url
            );
            return;
        };
        if route.tx.send(msg).is_err() {
            debug!("Subscription {} receiver gone, removing", subscription_id);
            routes.remove(subscription_id);
        }
    }

    fn resubscribe(&self) {
        let requests: Vec<ClientMessage> = self
            .routes
            .lock()
            .iter()
            .map(|(id, route)| ClientMessage::req(id.as_str(), route.filters.clone()))
            .collect();

        for req in requests {
            if let Err(e) = self.send(&req) {
                warn!("Failed to re-subscribe on {}: {}", self.url, e);
            }
        }
    }

    fn connection_lost(&self) {
        *self.outbound.lock() = None;
        // Dropping the senders fails every in-flight publish.
        self.pending_confirmations.lock().clear();
        self.routes.lock().retain(|_, route| {
            route
                .tx
                .send(RelaySubscriptionMessage::Closed("connection lost".into()))
                .is_ok()
        });
    }
}
