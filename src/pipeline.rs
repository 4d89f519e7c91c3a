//! Project-description pipeline: wires the built-in agents to the scheduler
//! and feeds each finished run back into memory and retrieval.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::agent::{Agent, AgentRegistry};
use crate::agents::{
    ArchitectureAgent, CONTRACT_KEY, ContractAgent, DatabaseAgent, DeploymentAgent, EVALUATION_KEY,
    EvaluationAgent, Generation, MemoryAgent, ReviewAgent, TECH_STACK_KEY, TechSelectAgent, string_list,
};
use crate::config::RuntimeConfig;
use crate::generator::TextGenerator;
use crate::memory::MemoryStore;
use crate::models::ModelSelector;
use crate::retrieval::RagStore;
use crate::scheduler::{CancelHandle, Scheduler, SchedulerConfig, TerminationReason};
use crate::state::State;
use crate::telemetry::{EventSink, NullSink};

/// Collaborators shared by every run in a process.
#[derive(Clone)]
pub struct PipelineDeps {
    pub scheduler: SchedulerConfig,
    pub memory: Arc<MemoryStore>,
    pub rag: Arc<RagStore>,
    pub generator: Arc<dyn TextGenerator>,
    pub selector: Arc<ModelSelector>,
    pub sink: Arc<dyn EventSink>,
    pub cancel: CancelHandle,
    pub rag_top_k: usize,
    pub rag_max_chars: usize,
    pub review_attempts: usize,
    pub score_baseline: f64,
}

impl PipelineDeps {
    pub fn new(
        cfg: &RuntimeConfig,
        memory: Arc<MemoryStore>,
        rag: Arc<RagStore>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            scheduler: cfg.scheduler_config(),
            memory,
            rag,
            generator,
            selector: Arc::new(cfg.model_selector()),
            sink: Arc::new(NullSink),
            cancel: CancelHandle::new(),
            rag_top_k: cfg.rag_top_k,
            rag_max_chars: cfg.rag_max_chars,
            review_attempts: cfg.review_attempts,
            score_baseline: cfg.score_baseline,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    fn generation(&self, agent_class: &str) -> Generation {
        Generation::new(self.generator.clone(), self.selector.clone(), agent_class)
    }
}

/// The built-in agents in registration order.
pub fn default_agents(deps: &PipelineDeps) -> Vec<Arc<dyn Agent>> {
    vec![
        Arc::new(MemoryAgent::new(
            deps.generation("memory"),
            deps.memory.clone(),
            deps.rag.clone(),
            deps.rag_top_k,
            deps.rag_max_chars,
        )),
        Arc::new(TechSelectAgent::new(deps.generation("tech_select"))),
        Arc::new(ContractAgent::new(deps.generation("contract"))),
        Arc::new(ArchitectureAgent::new(deps.generation("architecture"))),
        Arc::new(DatabaseAgent::new(deps.generation("database"))),
        Arc::new(DeploymentAgent::new(deps.generation("deployment"))),
        Arc::new(ReviewAgent::new(deps.generation("review"), deps.review_attempts)),
        Arc::new(EvaluationAgent::new(deps.generation("evaluation"))),
    ]
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub name: String,
    pub prompt: String,
    pub state: State,
    pub reason: TerminationReason,
    pub iterations: usize,
    pub agents_used: Vec<String>,
    pub score: Option<f64>,
}

/// JSON shape written by `run --output`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub name: String,
    pub prompt: String,
    pub reason: String,
    pub goal_reached: bool,
    pub iterations: usize,
    pub score: Option<f64>,
    pub agents_used: Vec<String>,
    pub failed_agents: Vec<String>,
    pub state: Value,
}

impl PipelineReport {
    pub fn from_outcome(outcome: &PipelineOutcome) -> Self {
        Self {
            name: outcome.name.clone(),
            prompt: outcome.prompt.clone(),
            reason: outcome.reason.label().to_string(),
            goal_reached: outcome.state.goal_reached(),
            iterations: outcome.iterations,
            score: outcome.score,
            agents_used: outcome.agents_used.clone(),
            failed_agents: outcome
                .state
                .failed_agents()
                .into_iter()
                .map(str::to_string)
                .collect(),
            state: outcome.state.to_value(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create report directory '{}'", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(self).context("failed to serialize run report")?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write run report to '{}'", path.display()))
    }
}

/// Lower-case dash-separated name from the first words of the description.
pub fn derive_project_name(description: &str) -> String {
    let words = description
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(4)
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>();
    if words.is_empty() {
        "project".to_string()
    } else {
        words.join("-")
    }
}

pub async fn run_project(
    description: &str,
    name: Option<&str>,
    deps: &PipelineDeps,
) -> Result<PipelineOutcome> {
    let description = description.trim();
    if description.is_empty() {
        anyhow::bail!("project description is empty; pass --prompt with some text");
    }
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| derive_project_name(description));

    let registry = AgentRegistry::from_agents(default_agents(deps))?;
    let scheduler = Scheduler::new(registry, deps.scheduler.clone(), deps.memory.clone())
        .with_sink(deps.sink.clone())
        .with_cancel_handle(deps.cancel.clone());

    let mut initial = Map::new();
    initial.insert("prompt".to_string(), json!(description));
    initial.insert("name".to_string(), json!(name));
    initial.insert("events".to_string(), json!([]));

    tracing::info!(project = %name, "pipeline run started");
    let run = scheduler.run(State::from_values(initial)).await;

    let mut agents_used = Vec::new();
    for record in &run.state.agent_runs {
        if !agents_used.contains(&record.agent_id) {
            agents_used.push(record.agent_id.clone());
        }
    }

    let score = run
        .state
        .get(EVALUATION_KEY)
        .and_then(|evaluation| evaluation.get("score"))
        .and_then(Value::as_f64);

    if let Some(score) = score {
        learn_from_run(description, &name, &run.state, &agents_used, score, deps);
    }

    tracing::info!(
        project = %name,
        reason = %run.reason,
        iterations = run.iterations,
        score = score.unwrap_or(-1.0),
        "pipeline run finished"
    );

    Ok(PipelineOutcome {
        name,
        prompt: description.to_string(),
        state: run.state,
        reason: run.reason,
        iterations: run.iterations,
        agents_used,
        score,
    })
}

/// Records the scored run, feeds the score back to every participating agent
/// and indexes a summary for retrieval by later runs. Store failures are
/// logged; the finished run stands either way.
fn learn_from_run(
    description: &str,
    name: &str,
    state: &State,
    agents_used: &[String],
    score: f64,
    deps: &PipelineDeps,
) {
    let tech_stack = string_list(state.get(TECH_STACK_KEY));
    let contract = state.contract(CONTRACT_KEY);

    if let Err(err) = deps
        .memory
        .record_run(description, tech_stack.clone(), contract.files.clone(), score)
    {
        tracing::warn!(project = %name, error = %err, "failed to record run in memory store");
    }
    if let Err(err) = deps
        .memory
        .apply_feedback(agents_used, score, deps.score_baseline)
    {
        tracing::warn!(project = %name, error = %err, "failed to apply feedback to memory store");
    }

    let summary = format!(
        "Project {name}: {description}\nStack: {}\nFiles: {}\nEndpoints: {}",
        tech_stack.join(", "),
        contract.files.join(", "),
        contract
            .endpoints
            .iter()
            .map(|e| format!("{} {}", e.method, e.path))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut metadata = Map::new();
    metadata.insert("name".to_string(), json!(name));
    metadata.insert("score".to_string(), json!(score));
    if let Err(err) = deps
        .rag
        .add_document(&format!("project:{name}"), &summary, metadata)
    {
        tracing::warn!(project = %name, error = %err, "failed to index run summary in rag store");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_names_are_slugged() {
        assert_eq!(derive_project_name("Blog API, with auth & posts"), "blog-api-with-auth");
        assert_eq!(derive_project_name("!!!"), "project");
    }
}
