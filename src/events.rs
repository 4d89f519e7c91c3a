//! Append-only event log kept on [`State`](crate::state::State).
//!
//! Every event has the `{type, meta}` shape. Inputs that are not already in
//! that shape are normalized on the way in: a bare string becomes
//! `{type: <string>, meta: {}}` and a mapping without a `type` key is wrapped
//! as `{type: "unknown", meta: <mapping>}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::State;

pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

pub const AGENT_SUCCEEDED: &str = "agent_succeeded";
pub const AGENT_FAILED: &str = "agent_failed";
pub const ENQUEUE_REJECTED: &str = "enqueue_rejected";
pub const PIPELINE_TERMINATED: &str = "pipeline_terminated";
/// Marker left when an agent consumes pending events of one type.
pub const EVENT_CONSUMED: &str = "event_consumed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>, meta: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            meta,
        }
    }

    pub fn tag(kind: impl Into<String>) -> Self {
        Self::new(kind, Map::new())
    }

    /// Builds an event from a `json!({...})` meta literal. Non-object metas are
    /// stored under a `value` key.
    pub fn with_meta(kind: impl Into<String>, meta: Value) -> Self {
        let meta = match meta {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(kind, meta)
    }

    pub fn normalize(raw: Value) -> Self {
        match raw {
            Value::String(tag) => Self::tag(tag),
            Value::Object(mut map) => match map.remove("type") {
                Some(kind) => {
                    let kind = match kind {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    let meta = match map.remove("meta") {
                        Some(Value::Object(meta)) => meta,
                        Some(other) => {
                            map.insert("meta".to_string(), other);
                            map
                        }
                        None => map,
                    };
                    Self::new(kind, meta)
                }
                None => Self::new(UNKNOWN_EVENT_TYPE, map),
            },
            other => Self::tag(other.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(self.kind.clone()));
        map.insert("meta".to_string(), Value::Object(self.meta.clone()));
        Value::Object(map)
    }
}

impl From<&str> for Event {
    fn from(tag: &str) -> Self {
        Self::tag(tag)
    }
}

impl From<Value> for Event {
    fn from(raw: Value) -> Self {
        Self::normalize(raw)
    }
}

/// Normalizes `event` and appends it to the state's event sequence. Returns the
/// stored event.
pub fn emit(state: &mut State, event: impl Into<Event>) -> Event {
    let event = event.into();
    state.events.push(event.clone());
    event
}

pub fn get_type(event: &Event) -> &str {
    &event.kind
}

pub fn filter_excluding(events: &[Event], kind: &str) -> Vec<Event> {
    events
        .iter()
        .filter(|event| get_type(event) != kind)
        .cloned()
        .collect()
}

pub fn contains_type(events: &[Event], kind: &str) -> bool {
    events.iter().any(|event| get_type(event) == kind)
}

pub fn count_type(events: &[Event], kind: &str) -> usize {
    events.iter().filter(|event| get_type(event) == kind).count()
}
