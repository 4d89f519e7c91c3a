use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{CONTEXT_KEY, Generation};
use crate::agent::{Agent, AgentOutput, AgentResult};
use crate::memory::MemoryStore;
use crate::retrieval::RagStore;
use crate::state::State;

const SYSTEM_PROMPT: &str = "ROLE: memory\nYou classify software project descriptions by domain. \
Return STRICT JSON {\"domain\": string, \"rationale\": string}.";

/// Past runs at or above this prompt similarity are offered for stack reuse.
const REUSE_SIMILARITY: f64 = 0.8;

/// Gathers prior knowledge for a prompt: retrieved documents, similar past
/// runs and a domain label.
pub struct MemoryAgent {
    generation: Generation,
    memory: Arc<MemoryStore>,
    rag: Arc<RagStore>,
    top_k: usize,
    max_chars: usize,
}

impl MemoryAgent {
    pub fn new(
        generation: Generation,
        memory: Arc<MemoryStore>,
        rag: Arc<RagStore>,
        top_k: usize,
        max_chars: usize,
    ) -> Self {
        Self {
            generation,
            memory,
            rag,
            top_k,
            max_chars,
        }
    }
}

#[async_trait]
impl Agent for MemoryAgent {
    fn id(&self) -> &str {
        "memory"
    }

    fn can_run(&self, state: &State) -> bool {
        state.get_str("prompt").is_some() && !state.contains(CONTEXT_KEY)
    }

    async fn run(&self, state: &State) -> AgentResult {
        let prompt = state.get_str("prompt").unwrap_or_default();

        let rag = self.rag.contextualize(prompt, self.top_k, self.max_chars);
        let similar = self
            .memory
            .similar_prompts(prompt, self.top_k)
            .into_iter()
            .filter(|(_, run)| run.prompt != prompt)
            .collect::<Vec<_>>();

        let reuse_candidate = similar
            .first()
            .filter(|(score, run)| *score >= REUSE_SIMILARITY && !run.tech_stack.is_empty())
            .map(|(score, run)| {
                json!({
                    "prompt": run.prompt,
                    "similarity": score,
                    "tech_stack": run.tech_stack,
                    "score": run.score,
                })
            })
            .unwrap_or(Value::Null);

        let classification = self
            .generation
            .object_or(
                SYSTEM_PROMPT,
                &format!("Classify: {prompt}"),
                json!({"domain": "general", "rationale": "no classifier available"}),
            )
            .await;

        tracing::debug!(
            rag_chars = rag.len(),
            similar = similar.len(),
            reuse = !reuse_candidate.is_null(),
            "memory context assembled"
        );

        let context = json!({
            "rag": rag,
            "similar": similar
                .iter()
                .map(|(score, run)| json!({"prompt": run.prompt, "similarity": score, "score": run.score}))
                .collect::<Vec<_>>(),
            "reuse_candidate": reuse_candidate,
            "domain": classification.get("domain").cloned().unwrap_or(json!("general")),
        });

        Ok(AgentOutput::new().set(CONTEXT_KEY, context))
    }
}
