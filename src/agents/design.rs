use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{ARCHITECTURE_KEY, CONTRACT_KEY, DEPLOYMENT_KEY, Generation, SCHEMA_KEY, TECH_STACK_KEY, string_list};
use crate::agent::{Agent, AgentOutput, AgentResult};
use crate::contract::is_contract_empty;
use crate::state::State;

const ARCHITECTURE_PROMPT: &str = "ROLE: architecture\nYou design production-ready project layouts. \
Return STRICT JSON {\"files\": [{\"path\": string, \"purpose\": string}], \"directories\": [string], \"pattern\": string}.";

const DATABASE_PROMPT: &str = "ROLE: database\nYou design relational schemas. Return STRICT JSON \
{\"tables\": {\"table_name\": {\"columns\": {\"col\": \"type\"}, \"indexes\": [string]}}, \"notes\": string}.";

const DEPLOYMENT_PROMPT: &str = "ROLE: deployment\nYou validate deployment strategies. Return STRICT JSON \
{\"strategy\": \"dockerfile\" | \"compose\" | \"kubernetes\", \"rationale\": string}.";

const STRATEGIES: &[&str] = &["dockerfile", "compose", "kubernetes"];

fn stack_names(state: &State) -> Vec<String> {
    string_list(state.get(TECH_STACK_KEY))
}

/// Lays out the project's files from the contract.
pub struct ArchitectureAgent {
    generation: Generation,
}

impl ArchitectureAgent {
    pub fn new(generation: Generation) -> Self {
        Self { generation }
    }
}

fn normalize_files(raw: Option<&Value>) -> Vec<Value> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(path) if !path.trim().is_empty() => {
                Some(json!({"path": path.trim(), "purpose": "generated"}))
            }
            Value::Object(map) if map.get("path").and_then(Value::as_str).is_some() => {
                Some(Value::Object(map.clone()))
            }
            _ => None,
        })
        .collect()
}

#[async_trait]
impl Agent for ArchitectureAgent {
    fn id(&self) -> &str {
        "architecture"
    }

    fn can_run(&self, state: &State) -> bool {
        !is_contract_empty(&state.contract(CONTRACT_KEY)) && !state.contains(ARCHITECTURE_KEY)
    }

    async fn run(&self, state: &State) -> AgentResult {
        let contract = state.contract(CONTRACT_KEY);
        let stack = stack_names(state);

        let directories = contract
            .files
            .iter()
            .filter_map(|path| path.rsplit_once('/').map(|(dir, _)| dir.to_string()))
            .chain(std::iter::once("tests".to_string()))
            .collect::<std::collections::BTreeSet<_>>();
        let fallback = json!({
            "files": contract
                .files
                .iter()
                .map(|path| json!({"path": path, "purpose": "contract"}))
                .collect::<Vec<_>>(),
            "directories": directories,
            "pattern": "layered",
        });

        let user_prompt = format!(
            "Design a project layout for: \"{}\"\nTech stack: {}\nContract files:\n{}\n",
            state.get_str("prompt").unwrap_or_default(),
            stack.join(", "),
            contract.files.join("\n")
        );
        let mut reply = self
            .generation
            .object_or(ARCHITECTURE_PROMPT, &user_prompt, fallback.clone())
            .await;

        let mut files = normalize_files(reply.get("files"));
        if files.is_empty() {
            files = normalize_files(fallback.get("files"));
        }
        reply.insert("files".to_string(), Value::Array(files));

        Ok(AgentOutput::new().set(ARCHITECTURE_KEY, Value::Object(reply)))
    }
}

/// Derives a schema for every table the contract names.
pub struct DatabaseAgent {
    generation: Generation,
}

impl DatabaseAgent {
    pub fn new(generation: Generation) -> Self {
        Self { generation }
    }
}

#[async_trait]
impl Agent for DatabaseAgent {
    fn id(&self) -> &str {
        "database"
    }

    fn can_run(&self, state: &State) -> bool {
        state.contains(CONTRACT_KEY) && !state.contains(SCHEMA_KEY)
    }

    async fn run(&self, state: &State) -> AgentResult {
        let contract = state.contract(CONTRACT_KEY);
        let engine = state
            .get(TECH_STACK_KEY)
            .and_then(Value::as_array)
            .and_then(|stack| {
                stack
                    .iter()
                    .find(|entry| entry.get("role").and_then(Value::as_str) == Some("database"))
            })
            .and_then(|entry| entry.get("name").and_then(Value::as_str))
            .unwrap_or("sqlite")
            .to_string();

        let mut tables = Map::new();
        for table in &contract.tables {
            let columns = table
                .extra
                .get("columns")
                .cloned()
                .unwrap_or_else(|| json!({"id": "PRIMARY KEY"}));
            tables.insert(table.name.clone(), json!({"columns": columns, "indexes": []}));
        }

        let user_prompt = format!(
            "Project: {}\nDatabase: {engine}\nTables: {}\n",
            state.get_str("prompt").unwrap_or_default(),
            contract.tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        let reply = self
            .generation
            .object_or(DATABASE_PROMPT, &user_prompt, json!({}))
            .await;

        // contract tables are always present; the reply may refine or add
        if let Some(Value::Object(designed)) = reply.get("tables") {
            for (name, definition) in designed {
                if definition.is_object() {
                    tables.insert(name.clone(), definition.clone());
                }
            }
        }

        let schema = json!({
            "engine": engine,
            "model_count": tables.len(),
            "tables": tables,
            "notes": reply.get("notes").cloned().unwrap_or(json!("")),
        });
        Ok(AgentOutput::new().set(SCHEMA_KEY, schema))
    }
}

/// Chooses how the project ships: a single Dockerfile, compose or kubernetes.
pub struct DeploymentAgent {
    generation: Generation,
}

impl DeploymentAgent {
    pub fn new(generation: Generation) -> Self {
        Self { generation }
    }
}

fn heuristic_strategy(prompt: &str, file_count: usize, has_tables: bool) -> &'static str {
    let prompt = prompt.to_lowercase();
    let k8s = ["k8s", "kubernetes"].iter().any(|k| prompt.contains(k));
    let scale = ["scale", "scalable", "microservice", "cluster", "multi-region"]
        .iter()
        .any(|k| prompt.contains(k));

    if k8s || (scale && file_count > 6) {
        "kubernetes"
    } else if has_tables || file_count > 3 {
        "compose"
    } else {
        "dockerfile"
    }
}

#[async_trait]
impl Agent for DeploymentAgent {
    fn id(&self) -> &str {
        "deployment"
    }

    fn can_run(&self, state: &State) -> bool {
        state.contains(ARCHITECTURE_KEY) && !state.contains(DEPLOYMENT_KEY)
    }

    async fn run(&self, state: &State) -> AgentResult {
        let prompt = state.get_str("prompt").unwrap_or_default();
        let file_count = state
            .get(ARCHITECTURE_KEY)
            .and_then(|arch| arch.get("files"))
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let has_tables = !state.contract(CONTRACT_KEY).tables.is_empty();
        let proposed = heuristic_strategy(prompt, file_count, has_tables);

        let reply = self
            .generation
            .object_or(
                DEPLOYMENT_PROMPT,
                &format!("Prompt: {prompt}\nFiles: {file_count}\nProposed: {proposed}"),
                json!({"strategy": proposed, "rationale": "heuristic"}),
            )
            .await;

        let strategy = reply
            .get("strategy")
            .and_then(Value::as_str)
            .filter(|s| STRATEGIES.contains(s))
            .unwrap_or(proposed);

        Ok(AgentOutput::new().set(
            DEPLOYMENT_KEY,
            json!({
                "strategy": strategy,
                "rationale": reply.get("rationale").cloned().unwrap_or(json!("")),
            }),
        ))
    }
}
