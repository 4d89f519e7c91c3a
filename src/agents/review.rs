use async_trait::async_trait;
use serde_json::{Value, json};

use super::{
    ARCHITECTURE_KEY, CONTEXT_KEY, CONTRACT_KEY, DEPLOYMENT_KEY, EVALUATION_KEY, EXPAND_CONTRACT,
    Generation, REVIEW_KEY, SCHEMA_KEY, TECH_STACK_KEY, string_list,
};
use crate::agent::{Agent, AgentOutput, AgentResult, Phase};
use crate::contract::is_contract_empty;
use crate::events::contains_type;
use crate::state::{GOAL_REACHED, State};

const REVIEW_PROMPT: &str = "ROLE: review\nYou check a delivery contract against the project request. \
Return STRICT JSON {\"missing_files\": [path], \"missing_endpoints\": [\"METHOD /path\"], \"notes\": string}.";

const EVALUATION_PROMPT: &str = "ROLE: evaluation\nYou are a fair software evaluator. Score the planned \
project 0-100 on completeness, structure, data design and deployment readiness. \
Return STRICT JSON {\"score\": integer, \"rationale\": string}.";

const REQUIRED_KEYS: &[&str] = &[
    CONTEXT_KEY,
    TECH_STACK_KEY,
    CONTRACT_KEY,
    ARCHITECTURE_KEY,
    SCHEMA_KEY,
    DEPLOYMENT_KEY,
];

const STATUS_EXPANDING: &str = "expanding";
const STATUS_APPROVED: &str = "approved";
const STATUS_APPROVED_WITH_GAPS: &str = "approved_with_gaps";
const STATUS_BLOCKED: &str = "blocked";

/// Gatekeeper for the goal. Sends the contract back for expansion while it is
/// empty or the reviewer reports gaps, up to `max_attempts` times, then
/// declares the goal reached if the contract is usable.
pub struct ReviewAgent {
    generation: Generation,
    max_attempts: u64,
}

impl ReviewAgent {
    pub fn new(generation: Generation, max_attempts: usize) -> Self {
        Self {
            generation,
            max_attempts: max_attempts as u64,
        }
    }
}

fn review_field<'a>(state: &'a State, field: &str) -> Option<&'a Value> {
    state.get(REVIEW_KEY).and_then(|review| review.get(field))
}

#[async_trait]
impl Agent for ReviewAgent {
    fn id(&self) -> &str {
        "review"
    }

    fn can_run(&self, state: &State) -> bool {
        let settled = review_field(state, "status")
            .and_then(Value::as_str)
            .is_some_and(|status| status != STATUS_EXPANDING);

        REQUIRED_KEYS.iter().all(|key| state.contains(key))
            && !contains_type(&state.events, EXPAND_CONTRACT)
            && !settled
    }

    async fn run(&self, state: &State) -> AgentResult {
        let attempts = review_field(state, "attempts")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let contract = state.contract(CONTRACT_KEY);
        let empty = is_contract_empty(&contract);

        let user_prompt = format!(
            "Project: {}\nContract: {}\nArchitecture: {}\n",
            state.get_str("prompt").unwrap_or_default(),
            contract.to_value(),
            state.get(ARCHITECTURE_KEY).cloned().unwrap_or(Value::Null)
        );
        let reply = self
            .generation
            .object(self.id(), REVIEW_PROMPT, &user_prompt)
            .await?
            .unwrap_or_default();

        let missing_files = string_list(reply.get("missing_files"));
        let missing_endpoints = string_list(reply.get("missing_endpoints"));
        let gaps = empty || !missing_files.is_empty() || !missing_endpoints.is_empty();

        if gaps && attempts < self.max_attempts {
            tracing::info!(
                attempt = attempts + 1,
                empty,
                missing_files = missing_files.len(),
                missing_endpoints = missing_endpoints.len(),
                "review requested contract expansion"
            );
            return Ok(AgentOutput::new()
                .set(
                    REVIEW_KEY,
                    json!({
                        "status": STATUS_EXPANDING,
                        "attempts": attempts + 1,
                        "missing_files": missing_files,
                        "missing_endpoints": missing_endpoints,
                    }),
                )
                .emit(json!({
                    "type": EXPAND_CONTRACT,
                    "meta": {
                        "missing_files": missing_files,
                        "missing_endpoints": missing_endpoints,
                        "source": "review",
                    },
                }))
                .schedule_front("contract")
                .schedule_back("review"));
        }

        if empty {
            tracing::warn!(attempts, "contract still empty after review attempts");
            return Ok(AgentOutput::new().set(
                REVIEW_KEY,
                json!({"status": STATUS_BLOCKED, "attempts": attempts}),
            ));
        }

        let status = if gaps {
            STATUS_APPROVED_WITH_GAPS
        } else {
            STATUS_APPROVED
        };
        Ok(AgentOutput::new()
            .set(
                REVIEW_KEY,
                json!({
                    "status": status,
                    "attempts": attempts,
                    "files": contract.files.len(),
                    "endpoints": contract.endpoints.len(),
                    "notes": reply.get("notes").cloned().unwrap_or(json!("")),
                }),
            )
            .set(GOAL_REACHED, json!(true)))
    }
}

/// Scores the finished plan once the goal is reached.
pub struct EvaluationAgent {
    generation: Generation,
}

impl EvaluationAgent {
    pub fn new(generation: Generation) -> Self {
        Self { generation }
    }
}

const COMPLEXITY_WORDS: &[&str] = &[
    "authentication",
    "admin",
    "dashboard",
    "real-time",
    "search",
    "comprehensive",
    "platform",
    "system",
];

pub fn heuristic_score(state: &State) -> f64 {
    let mut score = 25.0;

    let models = state
        .get(SCHEMA_KEY)
        .and_then(|schema| schema.get("model_count"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as f64;
    score += (models * 3.0).min(15.0);

    let files = state
        .get(ARCHITECTURE_KEY)
        .and_then(|arch| arch.get("files"))
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if files >= 8 {
        score += 15.0;
    } else if files >= 5 {
        score += 10.0;
    }

    if state.contains(DEPLOYMENT_KEY) {
        score += 10.0;
    }

    let prompt = state.get_str("prompt").unwrap_or_default().to_lowercase();
    let complexity = COMPLEXITY_WORDS
        .iter()
        .filter(|word| prompt.contains(*word))
        .count() as f64;
    score += (complexity * 5.0).min(15.0);

    if review_field(state, "status").and_then(Value::as_str) == Some(STATUS_APPROVED_WITH_GAPS) {
        score -= 10.0;
    }

    score.clamp(0.0, 100.0)
}

#[async_trait]
impl Agent for EvaluationAgent {
    fn id(&self) -> &str {
        "evaluation"
    }

    fn phase(&self) -> Phase {
        Phase::Finalize
    }

    fn can_run(&self, state: &State) -> bool {
        state.goal_reached() && !state.contains(EVALUATION_KEY)
    }

    async fn run(&self, state: &State) -> AgentResult {
        let heuristic = heuristic_score(state);
        let summary = json!({
            "prompt": state.get_str("prompt").unwrap_or_default(),
            "tech_stack": string_list(state.get(TECH_STACK_KEY)),
            "contract": state.contract(CONTRACT_KEY).to_value(),
            "schema_tables": state.get(SCHEMA_KEY).and_then(|s| s.get("model_count")).cloned(),
            "deployment": state.get(DEPLOYMENT_KEY).and_then(|d| d.get("strategy")).cloned(),
        });

        let reply = self
            .generation
            .object_or(
                EVALUATION_PROMPT,
                &format!("Project analysis: {summary}"),
                json!({"score": heuristic, "rationale": "heuristic fallback based on plan coverage"}),
            )
            .await;

        let score = reply
            .get("score")
            .and_then(Value::as_f64)
            .filter(|score| score.is_finite())
            .unwrap_or(heuristic)
            .clamp(0.0, 100.0)
            .round();

        Ok(AgentOutput::new().set(
            EVALUATION_KEY,
            json!({
                "score": score,
                "heuristic": heuristic,
                "rationale": reply.get("rationale").cloned().unwrap_or(json!("")),
            }),
        ))
    }
}
