use async_trait::async_trait;
use serde_json::{Value, json};

use super::{CONTRACT_KEY, EXPAND_CONTRACT, Generation, TECH_STACK_KEY, string_list};
use crate::agent::{Agent, AgentOutput, AgentResult};
use crate::contract::{Contract, DEFAULT_SOURCE, Endpoint, merge_contract};
use crate::events::contains_type;
use crate::state::State;

const SYSTEM_PROMPT: &str = "ROLE: contract\nGiven the chosen stack, propose a practical delivery contract. \
Return STRICT JSON {\"files\": [path], \"endpoints\": [{\"method\": string, \"path\": string}], \
\"tables\": [{\"name\": string}]}. Keep it under 30 files and match file extensions to the backend.";

/// Files and endpoints every contract ships regardless of stack.
const BASELINE_FILES: &[&str] = &["README.md", ".env.example", "docker-compose.yml", "Makefile"];
const BASELINE_ENDPOINTS: &[(&str, &str)] = &[("GET", "/api/health"), ("GET", "/docs")];

/// Proposes the delivery contract and re-proposes it whenever an
/// `expand_contract` event is pending. The scheduler merges each proposal into
/// the accumulated contract.
pub struct ContractAgent {
    generation: Generation,
}

impl ContractAgent {
    pub fn new(generation: Generation) -> Self {
        Self { generation }
    }
}

fn fallback_proposal() -> Value {
    json!({
        "files": ["backend/app.py", "frontend/src/App.js"],
        "endpoints": [{"method": "GET", "path": "/api/health"}],
        "tables": [{"name": "users"}],
    })
}

fn baseline() -> Contract {
    Contract {
        files: BASELINE_FILES.iter().map(|f| f.to_string()).collect(),
        endpoints: BASELINE_ENDPOINTS
            .iter()
            .map(|(method, path)| Endpoint::new(method, path))
            .collect(),
        ..Contract::default()
    }
}

/// Missing files and endpoints named by pending expansion requests.
fn requested_additions(state: &State) -> Contract {
    let mut additions = Contract::default();
    for event in state.events.iter().filter(|e| e.kind == EXPAND_CONTRACT) {
        additions.files.extend(string_list(event.meta.get("missing_files")));
        let endpoints = Contract::from_value(&json!({
            "endpoints": event.meta.get("missing_endpoints").cloned().unwrap_or(Value::Null)
        }));
        additions.endpoints.extend(endpoints.endpoints);
    }
    additions
}

#[async_trait]
impl Agent for ContractAgent {
    fn id(&self) -> &str {
        "contract"
    }

    fn can_run(&self, state: &State) -> bool {
        state.contains(TECH_STACK_KEY)
            && (!state.contains(CONTRACT_KEY) || contains_type(&state.events, EXPAND_CONTRACT))
    }

    async fn run(&self, state: &State) -> AgentResult {
        let tech_stack = state.get(TECH_STACK_KEY).cloned().unwrap_or(Value::Null);
        let existing = state.contract(CONTRACT_KEY);
        let additions = requested_additions(state);

        let mut user_prompt = format!(
            "PROJECT:\n{}\n\nTECH_STACK:\n{}\n",
            state.get_str("prompt").unwrap_or_default(),
            tech_stack
        );
        if !existing.files.is_empty() {
            user_prompt.push_str(&format!("CURRENT_FILES:\n{}\n", existing.files.join("\n")));
        }
        if !additions.files.is_empty() || !additions.endpoints.is_empty() {
            user_prompt.push_str(&format!(
                "MISSING:\n{}\n",
                additions.to_value()
            ));
        }

        let reply = self
            .generation
            .object_or(SYSTEM_PROMPT, &user_prompt, fallback_proposal())
            .await;

        let proposed = Contract::from_value(&Value::Object(reply));
        let mut proposal = merge_contract(&merge_contract(&proposed, &baseline()), &additions);
        proposal.source = DEFAULT_SOURCE.to_string();

        tracing::info!(
            files = proposal.files.len(),
            endpoints = proposal.endpoints.len(),
            tables = proposal.tables.len(),
            expansion = !additions.files.is_empty() || !additions.endpoints.is_empty(),
            "contract proposed"
        );

        Ok(AgentOutput::new()
            .set(CONTRACT_KEY, proposal.to_value())
            .consume_event(EXPAND_CONTRACT))
    }
}
