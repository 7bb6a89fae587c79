//! In-process mock relay for integration tests.
//!
//! Speaks just enough of the relay protocol: answers REQ with scripted
//! frames, stored events and EOSE; answers EVENT with a scripted OK; records
//! every frame it receives.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate, Keys, finalize_event};
use nostr_client::ClientConfig;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// How a mock relay answers.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// OK verdict for published events
    pub accept: bool,
    /// OK message when rejecting
    pub reject_message: String,
    /// Never answer EVENT frames
    pub silent_on_publish: bool,
    /// Never send EOSE
    pub withhold_eose: bool,
    /// Raw text frames sent on every REQ, before stored events
    pub raw_frames: Vec<String>,
    /// Events returned for every REQ (no filtering)
    pub stored: Vec<Event>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            accept: true,
            reject_message: "blocked: test relay".to_string(),
            silent_on_publish: false,
            withhold_eose: false,
            raw_frames: Vec::new(),
            stored: Vec::new(),
        }
    }
}

struct State {
    behavior: Behavior,
    frames: Mutex<Vec<Value>>,
    connections: AtomicUsize,
}

impl State {
    fn replies(&self, frame: &Value) -> Vec<String> {
        match frame.get(0).and_then(Value::as_str) {
            Some("REQ") => {
                let sub = frame.get(1).and_then(Value::as_str).unwrap_or_default();
                let mut out = self.behavior.raw_frames.clone();
                out.extend(
                    self.behavior
                        .stored
                        .iter()
                        .map(|event| json!(["EVENT", sub, event]).to_string()),
                );
                if !self.behavior.withhold_eose {
                    out.push(json!(["EOSE", sub]).to_string());
                }
                out
            }
            Some("EVENT") if !self.behavior.silent_on_publish => {
                let id = frame[1]["id"].as_str().unwrap_or_default();
                let message = if self.behavior.accept {
                    ""
                } else {
                    self.behavior.reject_message.as_str()
                };
                vec![json!(["OK", id, self.behavior.accept, message]).to_string()]
            }
            _ => Vec::new(),
        }
    }
}

pub struct MockRelay {
    pub url: String,
    state: Arc<State>,
    kick: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        Self::with_behavior(Behavior::default()).await
    }

    pub async fn with_behavior(behavior: Behavior) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State {
            behavior,
            frames: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
        });
        let (kick, _) = broadcast::channel(4);

        let task = tokio::spawn({
            let state = Arc::clone(&state);
            let kick = kick.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, Arc::clone(&state), kick.subscribe()));
                }
            }
        });

        Self {
            url: format!("ws://{}", addr),
            state,
            kick,
            task,
        }
    }

    /// Every frame received so far.
    pub fn frames(&self) -> Vec<Value> {
        self.state.frames.lock().clone()
    }

    /// Received frames of one type (`"REQ"`, `"EVENT"`, `"CLOSE"`).
    pub fn frames_of(&self, kind: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f.get(0).and_then(Value::as_str) == Some(kind))
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Close every open socket from the relay side.
    pub fn drop_connections(&self) {
        let _ = self.kick.send(());
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.kick.send(());
    }
}

async fn serve(stream: TcpStream, state: Arc<State>, mut kick: broadcast::Receiver<()>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            _ = kick.recv() => {
                let _ = sink.close().await;
                return;
            }
            msg = source.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let replies = state.replies(&frame);
                state.frames.lock().push(frame);
                for reply in replies {
                    if sink.send(Message::text(reply)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// A `ws://` URL nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}

/// Config with timings short enough for tests.
pub fn test_config(relays: Vec<String>) -> ClientConfig {
    ClientConfig {
        relays,
        connect_timeout_ms: 1_000,
        retry_initial_interval_ms: 50,
        retry_multiplier: 2.0,
        max_retries: 3,
        publish_timeout_ms: 500,
        connect_wait_ms: 2_000,
        connect_poll_interval_ms: 20,
        query_timeout_ms: 1_000,
        ..ClientConfig::default()
    }
}

pub fn signed_event(
    keys: &Keys,
    kind: u16,
    content: &str,
    tags: Vec<Vec<String>>,
    created_at: u64,
) -> Event {
    finalize_event(
        &EventTemplate {
            created_at,
            kind,
            tags,
            content: content.to_string(),
        },
        keys.secret_key(),
    )
    .unwrap()
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
