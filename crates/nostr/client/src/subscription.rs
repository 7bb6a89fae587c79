//! Subscription multiplexing across relays.
//!
//! A subscription is opened under one id on every connected relay. Each
//! relay feeds its own channel; a merge task fans them into a single
//! consumer channel, dropping events that fail verification and events
//! whose id was already delivered. The end-of-stored-events marker is
//! emitted once, after every relay has sent EOSE or closed the
//! subscription.
//!
//! The returned [`SubscriptionHandle`] owns the per-relay subscriptions:
//! closing or dropping it sends CLOSE to each relay.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use nostr::{Event, verify_event};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::relay::{RelayConnection, RelaySubscriptionMessage};

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Tracks which relays still owe an end-of-stored-events signal.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    /// Subscription ID
    pub id: String,
    /// Relays that have this subscription
    pub relays: HashSet<String>,
    /// Relays that sent EOSE or closed the subscription
    pub finished_relays: HashSet<String>,
    /// Whether every relay has finished
    pub all_eose: bool,
    emitted: bool,
}

impl SubscriptionTracker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            relays: HashSet::new(),
            finished_relays: HashSet::new(),
            all_eose: false,
            emitted: false,
        }
    }

    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        self.relays.insert(relay_url.into());
        self.update_all_eose();
    }

    pub fn remove_relay(&mut self, relay_url: &str) {
        self.relays.remove(relay_url);
        self.finished_relays.remove(relay_url);
        self.update_all_eose();
    }

    /// Record EOSE from a relay. Returns true the first time every relay
    /// has finished.
    pub fn mark_eose(&mut self, relay_url: &str) -> bool {
        if self.relays.contains(relay_url) {
            self.finished_relays.insert(relay_url.to_string());
        }
        self.update_all_eose();
        self.take_transition()
    }

    /// A closed subscription no longer holds up the marker.
    pub fn mark_closed(&mut self, relay_url: &str) -> bool {
        self.mark_eose(relay_url)
    }

    fn update_all_eose(&mut self) {
        self.all_eose = !self.relays.is_empty()
            && self.relays.iter().all(|r| self.finished_relays.contains(r));
    }

    fn take_transition(&mut self) -> bool {
        if self.all_eose && !self.emitted {
            self.emitted = true;
            true
        } else {
            false
        }
    }
}

/// Item yielded by a [`SubscriptionHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// A verified, not previously seen event and the relay that sent it first
    Event { relay_url: String, event: Event },
    /// Every relay has delivered its stored events
    EndOfStoredEvents,
}

/// Fans one filter set out to many relays and merges the results.
#[derive(Debug, Clone)]
pub struct SubscriptionMultiplexer {
    verify_events: bool,
    channel_capacity: usize,
}

impl Default for SubscriptionMultiplexer {
    fn default() -> Self {
        Self::new(true, 1024)
    }
}

impl SubscriptionMultiplexer {
    pub fn new(verify_events: bool, channel_capacity: usize) -> Self {
        Self {
            verify_events,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Open `filters` on every relay in `relays` that is connected.
    ///
    /// Fails with [`ClientError::NoConnectedRelays`] if no relay accepts the
    /// subscription.
    pub fn subscribe(
        &self,
        relays: &[Arc<RelayConnection>],
        filters: Vec<Filter>,
    ) -> Result<SubscriptionHandle> {
        let id = generate_subscription_id();
        let mut tracker = SubscriptionTracker::new(id.as_str());
        let mut opened = Vec::new();
        let mut streams = Vec::new();

        for relay in relays.iter().filter(|r| r.is_connected()) {
            match relay.subscribe(&id, filters.clone()) {
                Ok(rx) => {
                    let url = relay.url_str().to_string();
                    tracker.add_relay(url.as_str());
                    streams.push(
                        UnboundedReceiverStream::new(rx)
                            .map(move |msg| (url.clone(), msg))
                            .boxed(),
                    );
                    opened.push(Arc::clone(relay));
                }
                Err(e) => warn!(
                    "Could not open subscription {} on {}: {}",
                    id,
                    relay.url_str(),
                    e
                ),
            }
        }

        if opened.is_empty() {
            return Err(ClientError::NoConnectedRelays);
        }

        debug!("Subscription {} opened on {} relays", id, opened.len());
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let task = tokio::spawn(merge(
            futures::stream::select_all(streams),
            tracker,
            tx,
            self.verify_events,
        ));

        Ok(SubscriptionHandle {
            id,
            relays: opened,
            rx,
            task: Some(task),
        })
    }
}

async fn merge<S>(
    mut merged: S,
    mut tracker: SubscriptionTracker,
    tx: mpsc::Sender<SubscriptionEvent>,
    verify_events: bool,
) where
    S: Stream<Item = (String, RelaySubscriptionMessage)> + Unpin,
{
    let mut seen: HashSet<String> = HashSet::new();

    while let Some((relay_url, msg)) = merged.next().await {
        let out = match msg {
            RelaySubscriptionMessage::Event(event) => {
                if verify_events && !verify_event(&event) {
                    warn!(
                        "Dropping event {} from {}: failed verification",
                        event.id, relay_url
                    );
                    continue;
                }
                if !seen.insert(event.id.clone()) {
                    continue;
                }
                SubscriptionEvent::Event { relay_url, event }
            }
            RelaySubscriptionMessage::Eose => {
                if !tracker.mark_eose(&relay_url) {
                    continue;
                }
                SubscriptionEvent::EndOfStoredEvents
            }
            RelaySubscriptionMessage::Closed(reason) => {
                debug!(
                    "Subscription {} closed on {}: {}",
                    tracker.id, relay_url, reason
                );
                if !tracker.mark_closed(&relay_url) {
                    continue;
                }
                SubscriptionEvent::EndOfStoredEvents
            }
        };

        if tx.send(out).await.is_err() {
            break;
        }
    }
    debug!("Subscription {} merge finished", tracker.id);
}

/// Consumer side of a multiplexed subscription.
///
/// Implements [`Stream`]. Dropping the handle closes the subscription on
/// every relay it was opened on.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: String,
    relays: Vec<Arc<RelayConnection>>,
    rx: mpsc::Receiver<SubscriptionEvent>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Relays this subscription was opened on.
    pub fn relay_urls(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url_str().to_string()).collect()
    }

    /// Next merged item, or `None` once closed.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }

    /// Gather events until the end-of-stored marker, the stream ending, or
    /// `timeout` elapsing, whichever comes first.
    pub async fn collect_until_eose(&mut self, timeout: Duration) -> Vec<Event> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(SubscriptionEvent::Event { event, .. })) => events.push(event),
                Ok(Some(SubscriptionEvent::EndOfStoredEvents)) | Ok(None) => break,
                Err(_) => {
                    debug!(
                        "Subscription {} timed out after {:?} with {} events",
                        self.id,
                        timeout,
                        events.len()
                    );
                    break;
                }
            }
        }
        events
    }

    /// First event delivered before the end-of-stored marker or `timeout`.
    pub async fn first(&mut self, timeout: Duration) -> Option<Event> {
        self.first_matching(timeout, |_| true).await
    }

    /// First event accepted by `matches`, skipping the rest. Gives up at the
    /// end-of-stored marker or once `timeout` has elapsed.
    pub async fn first_matching(
        &mut self,
        timeout: Duration,
        matches: impl Fn(&Event) -> bool,
    ) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(SubscriptionEvent::Event { event, relay_url })) => {
                    if matches(&event) {
                        return Some(event);
                    }
                    debug!(
                        "Subscription {} skipping off-filter event {} from {}",
                        self.id, event.id, relay_url
                    );
                }
                _ => return None,
            }
        }
    }

    /// Close the subscription on every relay. Idempotent.
    pub fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        for relay in &self.relays {
            relay.unsubscribe(&self.id);
        }
        task.abort();
        self.rx.close();
        // Nothing buffered before the close is handed out afterwards.
        while self.rx.try_recv().is_ok() {}
        debug!("Subscription {} closed", self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }
}

impl Stream for SubscriptionHandle {
    type Item = SubscriptionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventTemplate, KIND_SHORT_TEXT_NOTE, finalize_event, generate_secret_key};

    fn signed(content: &str) -> Event {
        finalize_event(
            &EventTemplate {
                created_at: 1700000000,
                kind: KIND_SHORT_TEXT_NOTE,
                tags: vec![],
                content: content.to_string(),
            },
            &generate_secret_key(),
        )
        .unwrap()
    }

    type Feed = mpsc::UnboundedSender<RelaySubscriptionMessage>;

    fn spawn_merge(
        urls: &[&str],
        verify: bool,
    ) -> (Vec<Feed>, mpsc::Receiver<SubscriptionEvent>) {
        let mut tracker = SubscriptionTracker::new("test");
        let mut feeds = Vec::new();
        let mut streams = Vec::new();
        for url in urls {
            let (tx, rx) = mpsc::unbounded_channel();
            let url = url.to_string();
            tracker.add_relay(url.as_str());
            streams.push(
                UnboundedReceiverStream::new(rx)
                    .map(move |msg| (url.clone(), msg))
                    .boxed(),
            );
            feeds.push(tx);
        }
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(merge(futures::stream::select_all(streams), tracker, tx, verify));
        (feeds, rx)
    }

    #[test]
    fn test_generate_subscription_id() {
        let a = generate_subscription_id();
        let b = generate_subscription_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tracker_eose_fires_once() {
        let mut tracker = SubscriptionTracker::new("sub1");
        tracker.add_relay("wss://a");
        tracker.add_relay("wss://b");

        assert!(!tracker.mark_eose("wss://a"));
        assert!(!tracker.all_eose);
        assert!(tracker.mark_eose("wss://b"));
        assert!(tracker.all_eose);
        assert!(!tracker.mark_eose("wss://b"));
    }

    #[test]
    fn test_tracker_closed_relay_counts_as_finished() {
        let mut tracker = SubscriptionTracker::new("sub1");
        tracker.add_relay("wss://a");
        tracker.add_relay("wss://b");
        assert!(!tracker.mark_eose("wss://a"));
        assert!(tracker.mark_closed("wss://b"));
    }

    #[test]
    fn test_tracker_ignores_unknown_relay() {
        let mut tracker = SubscriptionTracker::new("sub1");
        tracker.add_relay("wss://a");
        assert!(!tracker.mark_eose("wss://unknown"));
        tracker.remove_relay("wss://a");
        assert!(!tracker.all_eose);
    }

    #[tokio::test]
    async fn test_merge_dedups_across_relays() {
        let (feeds, mut rx) = spawn_merge(&["wss://a", "wss://b"], true);
        let event = signed("same everywhere");

        feeds[0]
            .send(RelaySubscriptionMessage::Event(event.clone()))
            .unwrap();
        feeds[1]
            .send(RelaySubscriptionMessage::Event(event.clone()))
            .unwrap();
        feeds[0].send(RelaySubscriptionMessage::Eose).unwrap();
        feeds[1].send(RelaySubscriptionMessage::Eose).unwrap();

        match rx.recv().await.unwrap() {
            SubscriptionEvent::Event { event: got, .. } => assert_eq!(got.id, event.id),
            other => panic!("expected event, got {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), SubscriptionEvent::EndOfStoredEvents);
    }

    #[tokio::test]
    async fn test_merge_drops_unverified_events() {
        let (feeds, mut rx) = spawn_merge(&["wss://a"], true);
        let mut forged = signed("original");
        forged.content = "forged".to_string();
        let genuine = signed("genuine");

        feeds[0].send(RelaySubscriptionMessage::Event(forged)).unwrap();
        feeds[0]
            .send(RelaySubscriptionMessage::Event(genuine.clone()))
            .unwrap();

        match rx.recv().await.unwrap() {
            SubscriptionEvent::Event { event, .. } => assert_eq!(event.id, genuine.id),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_merge_keeps_streaming_after_eose() {
        let (feeds, mut rx) = spawn_merge(&["wss://a"], false);
        feeds[0].send(RelaySubscriptionMessage::Eose).unwrap();
        let live = signed("live");
        feeds[0]
            .send(RelaySubscriptionMessage::Event(live.clone()))
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), SubscriptionEvent::EndOfStoredEvents);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SubscriptionEvent::Event { event, .. } if event.id == live.id
        ));
    }

    #[tokio::test]
    async fn test_merge_ends_when_all_relays_close() {
        let (feeds, mut rx) = spawn_merge(&["wss://a", "wss://b"], false);
        drop(feeds);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_subscribe_without_connected_relays_fails() {
        let relay = Arc::new(RelayConnection::new("wss://relay.example.com").unwrap());
        let mux = SubscriptionMultiplexer::default();
        assert!(matches!(
            mux.subscribe(&[relay], vec![Filter::new().kind(1)]),
            Err(ClientError::NoConnectedRelays)
        ));
        assert!(matches!(
            mux.subscribe(&[], vec![Filter::new().kind(1)]),
            Err(ClientError::NoConnectedRelays)
        ));
    }
}
