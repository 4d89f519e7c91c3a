//! Built-in agents for the project-description pipeline.
//!
//! Every agent asks the configured [`TextGenerator`] for a JSON object and
//! lays the reply over a deterministic fallback, so the pipeline completes
//! with the mock backend or with no model server at all.

pub mod context;
pub mod contract;
pub mod design;
pub mod review;
pub mod tech;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{AgentFailure, GenerationError};
use crate::generator::{TextGenerator, generate_or_fallback, generate_with_retry};
use crate::models::{ModelAssignment, ModelSelector};

pub use context::MemoryAgent;
pub use contract::ContractAgent;
pub use design::{ArchitectureAgent, DatabaseAgent, DeploymentAgent};
pub use review::{EvaluationAgent, ReviewAgent};
pub use tech::TechSelectAgent;

pub const CONTEXT_KEY: &str = "context";
pub const TECH_STACK_KEY: &str = "tech_stack";
pub const CONTRACT_KEY: &str = "contract";
pub const ARCHITECTURE_KEY: &str = "architecture";
pub const SCHEMA_KEY: &str = "schema";
pub const DEPLOYMENT_KEY: &str = "deployment";
pub const REVIEW_KEY: &str = "review";
pub const EVALUATION_KEY: &str = "evaluation";
pub const EXPAND_CONTRACT: &str = "expand_contract";

/// A generator bound to one agent's model assignment.
#[derive(Clone)]
pub struct Generation {
    generator: Arc<dyn TextGenerator>,
    assignment: ModelAssignment,
}

impl Generation {
    pub fn new(generator: Arc<dyn TextGenerator>, selector: Arc<ModelSelector>, agent_class: &str) -> Self {
        Self {
            generator,
            assignment: ModelAssignment::new(agent_class, selector),
        }
    }

    pub fn model(&self) -> String {
        self.assignment.model()
    }

    /// Reply laid over `fallback`; any generation failure yields the fallback.
    pub async fn object_or(&self, system_prompt: &str, user_prompt: &str, fallback: Value) -> Map<String, Value> {
        let fallback = match fallback {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let (reply, _answered) = generate_or_fallback(
            self.generator.as_ref(),
            &self.assignment,
            system_prompt,
            user_prompt,
            fallback,
        )
        .await;
        reply
    }

    /// Strict variant: `Ok(None)` when no backend is configured, an
    /// [`AgentFailure`] for any other generation error.
    pub async fn object(
        &self,
        agent_id: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Option<Map<String, Value>>, AgentFailure> {
        match generate_with_retry(self.generator.as_ref(), &self.assignment, system_prompt, user_prompt).await {
            Ok(reply) => Ok(Some(reply)),
            Err(GenerationError::Disabled) => Ok(None),
            Err(err) => Err(AgentFailure::from_generation(agent_id, &err)),
        }
    }
}

/// Strings from a JSON array, also accepting `{name|path: ...}` objects.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map
                .get("name")
                .or_else(|| map.get("path"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .filter(|s| !s.trim().is_empty())
        .collect()
}
