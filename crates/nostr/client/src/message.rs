//! Relay wire messages.
//!
//! NIP-01 framing, JSON arrays tagged by their first element:
//! - Client to Relay: EVENT, REQ, CLOSE
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE (AUTH and COUNT are
//!   recognised so they are not reported as malformed)

use std::collections::HashMap;

use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Publish an event: ["EVENT", <event JSON>]
    Event(Event),

    /// Subscribe to events: ["REQ", <subscription_id>, <filter1>, <filter2>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: ["CLOSE", <subscription_id>]
    Close { subscription_id: String },
}

impl ClientMessage {
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        ClientMessage::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        ClientMessage::Close {
            subscription_id: subscription_id.into(),
        }
    }

    /// Serialize to the JSON array sent over the socket.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = Vec::with_capacity(filters.len() + 2);
                arr.push(Value::from("REQ"));
                arr.push(Value::from(subscription_id.as_str()));
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// ["EVENT", <subscription_id>, <event JSON>]
    Event {
        subscription_id: String,
        event: Event,
    },

    /// ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },

    /// ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// ["NOTICE", <message>]
    Notice { message: String },

    /// ["AUTH", <challenge>]
    Auth { challenge: String },

    /// ["COUNT", <subscription_id>, {"count": <n>}]
    Count { subscription_id: String, count: u64 },
}

impl RelayMessage {
    /// Parse a JSON frame from the relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        let msg_type = arr
            .first()
            .ok_or_else(|| MessageError::InvalidFormat("empty array".to_string()))?
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;

        match msg_type {
            "EVENT" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let raw = arr
                    .get(2)
                    .ok_or_else(|| MessageError::MissingField("event".to_string()))?;
                let event: Event = serde_json::from_value(raw.clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                let event_id = string_at(&arr, 1, "event_id")?;
                let success = arr
                    .get(2)
                    .ok_or_else(|| MessageError::MissingField("accepted".to_string()))?
                    .as_bool()
                    .ok_or_else(|| {
                        MessageError::InvalidFormat("accepted not a boolean".to_string())
                    })?;
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message: optional_string_at(&arr, 3),
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
                message: optional_string_at(&arr, 2),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(&arr, 1, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: string_at(&arr, 1, "challenge")?,
            }),
            "COUNT" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let count = arr
                    .get(2)
                    .and_then(|v| v.get("count"))
                    .and_then(Value::as_u64)
                    .ok_or_else(|| MessageError::MissingField("count value".to_string()))?;
                Ok(RelayMessage::Count {
                    subscription_id,
                    count,
                })
            }
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

fn string_at(arr: &[Value], index: usize, field: &str) -> Result<String, MessageError> {
    arr.get(index)
        .ok_or_else(|| MessageError::MissingField(field.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} not a string", field)))
}

fn optional_string_at(arr: &[Value], index: usize) -> String {
    arr.get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Tag queries keyed by `#<letter>`
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn author(self, author: impl Into<String>) -> Self {
        self.authors(vec![author.into()])
    }

    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn kind(self, kind: u16) -> Self {
        self.kinds(vec![kind])
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag constraint. `key` is the tag letter without `#`.
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Filter by `#e` (event reference) tags.
    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by `#p` (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }
}
