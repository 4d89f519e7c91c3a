//! The agent interface consumed by the scheduler.
//!
//! An agent is a capability predicate plus a run operation. `can_run` must be
//! pure; `run` receives a read-only view of the state and describes its effects
//! in an [`AgentOutput`], which the scheduler alone applies.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::AgentFailure;
use crate::state::State;

/// Whether an agent works toward the goal or only runs once it is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    GoalSeeking,
    Finalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Front,
    Back,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub agent_id: String,
    pub position: Position,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    pub updates: Map<String, Value>,
    pub events: Vec<Value>,
    pub schedule: Vec<ScheduleRequest>,
    /// Event types to drop from the log once the output is applied.
    pub consume_events: Vec<String>,
}

impl AgentOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.updates.insert(key.into(), value);
        self
    }

    pub fn emit(mut self, event: impl Into<Value>) -> Self {
        self.events.push(event.into());
        self
    }

    pub fn schedule_front(mut self, agent_id: impl Into<String>) -> Self {
        self.schedule.push(ScheduleRequest {
            agent_id: agent_id.into(),
            position: Position::Front,
        });
        self
    }

    pub fn schedule_back(mut self, agent_id: impl Into<String>) -> Self {
        self.schedule.push(ScheduleRequest {
            agent_id: agent_id.into(),
            position: Position::Back,
        });
        self
    }

    pub fn consume_event(mut self, kind: impl Into<String>) -> Self {
        self.consume_events.push(kind.into());
        self
    }
}

pub type AgentResult = std::result::Result<AgentOutput, AgentFailure>;

#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn phase(&self) -> Phase {
        Phase::GoalSeeking
    }

    fn can_run(&self, state: &State) -> bool;

    async fn run(&self, state: &State) -> AgentResult;
}

/// Agents known for one run, in registration order. Ids are unique.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: Vec<Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_agents(agents: Vec<Arc<dyn Agent>>) -> Result<Self> {
        let mut registry = Self::new();
        for agent in agents {
            registry.register(agent)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        if self.get(agent.id()).is_some() {
            bail!("agent id '{}' is already registered", agent.id());
        }
        self.agents.push(agent);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Agent>> {
        self.agents.iter().find(|agent| agent.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.agents.iter().map(|agent| agent.id().to_string()).collect()
    }

    pub fn finalize_ids(&self) -> BTreeSet<String> {
        self.agents
            .iter()
            .filter(|agent| agent.phase() == Phase::Finalize)
            .map(|agent| agent.id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Named(&'static str, Phase);

    #[async_trait]
    impl Agent for Named {
        fn id(&self) -> &str {
            self.0
        }

        fn phase(&self) -> Phase {
            self.1
        }

        fn can_run(&self, _state: &State) -> bool {
            true
        }

        async fn run(&self, _state: &State) -> AgentResult {
            Ok(AgentOutput::new())
        }
    }

    #[test]
    fn registry_rejects_duplicate_ids_and_keeps_order() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Arc::new(Named("b", Phase::GoalSeeking)))
            .unwrap();
        registry
            .register(Arc::new(Named("a", Phase::Finalize)))
            .unwrap();
        let err = registry
            .register(Arc::new(Named("a", Phase::GoalSeeking)))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.ids(), vec!["b", "a"]);
        assert_eq!(registry.finalize_ids().into_iter().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn output_builders_accumulate() {
        let output = AgentOutput::new()
            .set("x", json!(1))
            .emit("expand_contract")
            .schedule_front("contract")
            .schedule_back("review")
            .consume_event("stale");
        assert_eq!(output.updates.get("x"), Some(&json!(1)));
        assert_eq!(output.events, vec![json!("expand_contract")]);
        assert_eq!(output.schedule[0].position, Position::Front);
        assert_eq!(output.schedule[1].agent_id, "review");
        assert_eq!(output.consume_events, vec!["stale"]);
    }
}
