//! Shared pipeline document.
//!
//! `State` lives for exactly one scheduler run. Agents only ever see it by
//! shared reference; the scheduler is the single writer and applies agent
//! output through [`State::apply_updates`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contract::{Contract, merge_contract};
use crate::events::Event;

pub const GOAL_REACHED: &str = "goal_reached";
pub const EVENTS_KEY: &str = "events";
pub const AGENT_RUNS_KEY: &str = "agent_runs";

/// One invocation outcome, kept on the state so a finished run explains itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub agent_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub tick: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub values: Map<String, Value>,
    pub events: Vec<Event>,
    pub agent_runs: Vec<AgentRun>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: Map<String, Value>) -> Self {
        let mut state = Self::new();
        state.apply_updates(values, &[]);
        state
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn goal_reached(&self) -> bool {
        self.values
            .get(GOAL_REACHED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Reads a contract-shaped key, treating anything malformed as empty.
    pub fn contract(&self, key: &str) -> Contract {
        self.values
            .get(key)
            .map(Contract::from_value)
            .unwrap_or_default()
    }

    /// Merges a partial mapping into the state and reports whether any value
    /// changed. Keys listed in `contract_keys` go through the contract merger;
    /// `events` entries are normalized and appended; everything else is
    /// overwritten.
    pub fn apply_updates(&mut self, updates: Map<String, Value>, contract_keys: &[String]) -> bool {
        let mut changed = false;

        for (key, value) in updates {
            if key == EVENTS_KEY {
                let raw_events = match value {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                self.events
                    .extend(raw_events.into_iter().map(Event::normalize));
                continue;
            }

            if key == AGENT_RUNS_KEY {
                tracing::warn!(key = %key, "ignoring update to reserved state key");
                continue;
            }

            let merged = if contract_keys.iter().any(|k| *k == key) {
                let incoming = Contract::from_value(&value);
                let contract = match self.values.get(&key) {
                    Some(existing) => merge_contract(&Contract::from_value(existing), &incoming),
                    None => incoming.normalized(),
                };
                contract.to_value()
            } else {
                value
            };

            if self.values.get(&key) != Some(&merged) {
                changed = true;
                self.values.insert(key, merged);
            }
        }

        changed
    }

    /// Flattened JSON view: state values plus `events` and `agent_runs`.
    pub fn to_value(&self) -> Value {
        let mut map = self.values.clone();
        map.insert(
            EVENTS_KEY.to_string(),
            Value::Array(self.events.iter().map(Event::to_value).collect()),
        );
        map.insert(
            AGENT_RUNS_KEY.to_string(),
            serde_json::to_value(&self.agent_runs).unwrap_or(Value::Array(Vec::new())),
        );
        Value::Object(map)
    }

    pub fn failed_agents(&self) -> Vec<&str> {
        self.agent_runs
            .iter()
            .filter(|run| !run.success)
            .map(|run| run.agent_id.as_str())
            .collect()
    }
}
