use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{CONTEXT_KEY, Generation, TECH_STACK_KEY};
use crate::agent::{Agent, AgentOutput, AgentResult};
use crate::state::State;

const SYSTEM_PROMPT: &str = "ROLE: tech_select\nYou pick pragmatic technology stacks for small web projects. \
Return STRICT JSON {\"stack\": [{\"name\": string, \"role\": string}], \"reasoning\": string}.";

/// Picks the stack: reuses a close past run when memory offers one, otherwise
/// asks the generator with a Python/FastAPI/SQLite fallback.
pub struct TechSelectAgent {
    generation: Generation,
}

impl TechSelectAgent {
    pub fn new(generation: Generation) -> Self {
        Self { generation }
    }
}

fn default_stack() -> Value {
    json!([
        {"name": "python", "role": "language"},
        {"name": "fastapi", "role": "backend"},
        {"name": "sqlite", "role": "database"},
    ])
}

/// Lower-cased `{name, role?}` entries; bare strings and single names are accepted.
fn normalize_stack(raw: &Value) -> Vec<Value> {
    let items = match raw {
        Value::Array(items) => items.clone(),
        Value::String(_) => vec![raw.clone()],
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(name) if !name.trim().is_empty() => {
                Some(json!({"name": name.trim().to_lowercase()}))
            }
            Value::Object(mut map) => {
                let name = ["name", "id", "value"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_str))
                    .map(|name| name.trim().to_lowercase())
                    .filter(|name| !name.is_empty())?;
                map.insert("name".to_string(), Value::String(name));
                Some(Value::Object(map))
            }
            _ => None,
        })
        .collect()
}

#[async_trait]
impl Agent for TechSelectAgent {
    fn id(&self) -> &str {
        "tech_select"
    }

    fn can_run(&self, state: &State) -> bool {
        state.contains(CONTEXT_KEY) && !state.contains(TECH_STACK_KEY)
    }

    async fn run(&self, state: &State) -> AgentResult {
        let context = state.get(CONTEXT_KEY).cloned().unwrap_or(Value::Null);

        if let Some(reused) = context
            .get("reuse_candidate")
            .and_then(|candidate| candidate.get("tech_stack"))
        {
            let stack = normalize_stack(reused);
            if !stack.is_empty() {
                tracing::info!(entries = stack.len(), "reusing stack from a similar past run");
                return Ok(AgentOutput::new()
                    .set(TECH_STACK_KEY, Value::Array(stack))
                    .set("tech_source", json!("memory_reuse")));
            }
        }

        let prompt = state.get_str("prompt").unwrap_or_default();
        let mut user_prompt = format!("Prompt: {prompt}\n");
        if let Some(rag) = context.get("rag").and_then(Value::as_str)
            && !rag.is_empty()
        {
            user_prompt.push_str(&format!("Relevant prior artifacts:\n{rag}\n"));
        }

        let mut fallback = Map::new();
        fallback.insert("stack".to_string(), default_stack());
        let reply = self
            .generation
            .object_or(SYSTEM_PROMPT, &user_prompt, Value::Object(fallback))
            .await;

        let mut stack = normalize_stack(reply.get("stack").unwrap_or(&Value::Null));
        if stack.is_empty() {
            stack = normalize_stack(&default_stack());
        }

        Ok(AgentOutput::new()
            .set(TECH_STACK_KEY, Value::Array(stack))
            .set("tech_source", json!(self.generation.model())))
    }
}
