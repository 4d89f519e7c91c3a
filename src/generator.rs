//! Text-generation collaborators. The scheduler never calls these directly;
//! agents do, and they decide whether a failure means "use my fallback" or
//! "fail this invocation".

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::cli::GeneratorBackend;
use crate::config::RuntimeConfig;
use crate::error::GenerationError;
use crate::models::ModelAssignment;
use crate::store::{JsonFile, StorePersistence};

pub type GenerationResult = std::result::Result<Map<String, Value>, GenerationError>;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn generate(&self, model: &str, system_prompt: &str, user_prompt: &str) -> GenerationResult;
}

/// Parses backend text into a mapping. Anything but a JSON object is an error.
pub fn parse_object(raw: &str) -> GenerationResult {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(GenerationError::Unparseable(format!(
            "expected object, got {}",
            kind_name(&other)
        ))),
        Err(err) => Err(GenerationError::Unparseable(err.to_string())),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationCall {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Debug, Clone)]
enum MockReply {
    Object(Map<String, Value>),
    Fail(String),
}

/// Deterministic stand-in for a model server. Replies are keyed by a marker
/// substring of the system prompt; unmatched prompts fail with
/// [`GenerationError::Disabled`] so agents take their fallback path.
#[derive(Debug, Default)]
pub struct MockGenerator {
    replies: Vec<(String, MockReply)>,
    calls: Mutex<Vec<GenerationCall>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, marker: &str, response: Value) -> Self {
        let reply = match response {
            Value::Object(map) => MockReply::Object(map),
            other => MockReply::Fail(format!("scripted non-object reply: {other}")),
        };
        self.replies.push((marker.to_string(), reply));
        self
    }

    pub fn fail(mut self, marker: &str, reason: &str) -> Self {
        self.replies
            .push((marker.to_string(), MockReply::Fail(reason.to_string())));
        self
    }

    pub fn calls(&self) -> Vec<GenerationCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn generate(&self, model: &str, system_prompt: &str, user_prompt: &str) -> GenerationResult {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(GenerationCall {
                model: model.to_string(),
                system_prompt: system_prompt.to_string(),
                user_prompt: user_prompt.to_string(),
            });

        let reply = self
            .replies
            .iter()
            .find(|(marker, _)| system_prompt.contains(marker.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            Some(MockReply::Object(map)) => Ok(map),
            Some(MockReply::Fail(reason)) => Err(GenerationError::Transport(reason)),
            None => Err(GenerationError::Disabled),
        }
    }
}

const CACHE_KEY_CHARS: usize = 5000;

pub fn cache_key(system_prompt: &str, user_prompt: &str) -> String {
    let source = format!("{system_prompt}\n{user_prompt}")
        .chars()
        .take(CACHE_KEY_CHARS)
        .collect::<String>();
    format!("{:x}", md5::compute(source))
}

type CacheData = BTreeMap<String, Map<String, Value>>;

/// Memoizes successful, non-empty replies of another generator.
pub struct CachingGenerator {
    inner: Arc<dyn TextGenerator>,
    cache: Mutex<CacheData>,
    persistence: Box<dyn StorePersistence<CacheData>>,
}

impl CachingGenerator {
    pub fn new(
        inner: Arc<dyn TextGenerator>,
        persistence: Box<dyn StorePersistence<CacheData>>,
    ) -> Result<Self> {
        let cache = persistence.load()?.unwrap_or_default();
        Ok(Self {
            inner,
            cache: Mutex::new(cache),
            persistence,
        })
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl TextGenerator for CachingGenerator {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn generate(&self, model: &str, system_prompt: &str, user_prompt: &str) -> GenerationResult {
        let key = cache_key(system_prompt, user_prompt);
        let hit = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned();
        if let Some(hit) = hit {
            tracing::debug!(key = &key[..8], "generation cache hit");
            return Ok(hit);
        }

        let reply = self.inner.generate(model, system_prompt, user_prompt).await?;
        if !reply.is_empty() {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.insert(key, reply.clone());
            if let Err(err) = self.persistence.save(&cache) {
                tracing::warn!(error = %err, "generation cache write failed");
            }
        }
        Ok(reply)
    }
}

#[cfg(feature = "ollama")]
pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
}

#[cfg(feature = "ollama")]
impl OllamaGenerator {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build ollama http client: {e}"))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[cfg(feature = "ollama")]
#[async_trait]
impl TextGenerator for OllamaGenerator {
    fn backend_name(&self) -> &'static str {
        "ollama"
    }

    async fn generate(&self, model: &str, system_prompt: &str, user_prompt: &str) -> GenerationResult {
        let payload = serde_json::json!({
            "model": model,
            "prompt": format!("{system_prompt}\n\n{user_prompt}\nRespond with valid JSON only."),
            "format": "json",
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| GenerationError::Unparseable(e.to_string()))?;
        let text = body
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or("{}");
        parse_object(text)
    }
}

pub fn build_generator(cfg: &RuntimeConfig) -> Result<Arc<dyn TextGenerator>> {
    let base: Arc<dyn TextGenerator> = match cfg.generator_backend {
        GeneratorBackend::Mock => Arc::new(MockGenerator::new()),
        GeneratorBackend::Ollama => {
            #[cfg(feature = "ollama")]
            {
                Arc::new(OllamaGenerator::new(
                    &cfg.generator_base_url,
                    std::time::Duration::from_secs(cfg.generator_timeout_secs),
                )?)
            }

            #[cfg(not(feature = "ollama"))]
            {
                return Err(anyhow::anyhow!(
                    "generator backend 'ollama' requires feature 'ollama'. Rebuild with: cargo run --features ollama -- ..."
                ));
            }
        }
    };

    match cfg.generator_cache_path.as_deref() {
        Some(path) => Ok(Arc::new(CachingGenerator::new(
            base,
            Box::new(JsonFile::new(path)),
        )?)),
        None => Ok(base),
    }
}

/// Calls the agent's model and, on a retryable failure, once more with the
/// next preferred model forced on a copy of the assignment.
pub async fn generate_with_retry(
    generator: &dyn TextGenerator,
    assignment: &ModelAssignment,
    system_prompt: &str,
    user_prompt: &str,
) -> GenerationResult {
    let first = generator
        .generate(&assignment.model(), system_prompt, user_prompt)
        .await;

    match first {
        Err(GenerationError::Disabled) => Err(GenerationError::Disabled),
        Err(err) => match assignment.fallback_model() {
            Some(model) => {
                tracing::warn!(
                    agent_class = assignment.agent_class(),
                    error = %err,
                    retry_model = %model,
                    "generation failed, retrying with fallback model"
                );
                let retry = assignment.with_forced(&model);
                generator
                    .generate(&retry.model(), system_prompt, user_prompt)
                    .await
            }
            None => Err(err),
        },
        ok => ok,
    }
}

/// Successful replies are laid over `fallback`; failures and empty replies
/// return `fallback` unchanged. The flag reports whether the backend answered.
pub async fn generate_or_fallback(
    generator: &dyn TextGenerator,
    assignment: &ModelAssignment,
    system_prompt: &str,
    user_prompt: &str,
    fallback: Map<String, Value>,
) -> (Map<String, Value>, bool) {
    match generate_with_retry(generator, assignment, system_prompt, user_prompt).await {
        Ok(reply) if !reply.is_empty() => {
            let mut merged = fallback;
            merged.extend(reply);
            (merged, true)
        }
        Ok(_) => {
            tracing::debug!(agent_class = assignment.agent_class(), "empty generation, using fallback");
            (fallback, false)
        }
        Err(err) => {
            tracing::debug!(
                agent_class = assignment.agent_class(),
                error = %err,
                "generation unavailable, using fallback"
            );
            (fallback, false)
        }
    }
}
