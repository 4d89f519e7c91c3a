use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::{Cli, GeneratorBackend};
use crate::memory::MemoryPolicy;
use crate::models::{DEFAULT_MODEL, ModelSelector};
use crate::scheduler::SchedulerConfig;

pub const DEFAULT_MEMORY_PATH: &str = ".forgeline/memory.json";
pub const DEFAULT_RAG_PATH: &str = ".forgeline/rag.json";
pub const DEFAULT_TELEMETRY_PATH: &str = ".forgeline/telemetry.jsonl";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub rag: RagSection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    pub max_iterations: Option<usize>,
    pub max_enqueues: Option<usize>,
    pub order_by_success_rate: Option<bool>,
    pub contract_keys: Option<Vec<String>>,
    pub review_attempts: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySection {
    pub path: Option<String>,
    pub baseline: Option<f64>,
    pub prior_weight: Option<f64>,
    pub feedback_rate: Option<f64>,
    pub score_baseline: Option<f64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RagSection {
    pub path: Option<String>,
    pub top_k: Option<usize>,
    pub max_chars: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelsSection {
    pub default: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    pub available: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorSection {
    pub backend: Option<GeneratorBackend>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub cache_path: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    pub enabled: Option<bool>,
    pub path: Option<String>,
}

/// Fully resolved settings: config file values with CLI overrides applied.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub config_path: String,
    pub max_iterations: usize,
    pub max_enqueues: usize,
    pub order_by_success_rate: bool,
    pub contract_keys: Vec<String>,
    pub review_attempts: usize,
    pub memory_path: String,
    pub memory_baseline: f64,
    pub memory_prior_weight: f64,
    pub memory_feedback_rate: f64,
    pub score_baseline: f64,
    pub rag_path: String,
    pub rag_top_k: usize,
    pub rag_max_chars: usize,
    pub model_default: String,
    pub model_overrides: BTreeMap<String, String>,
    pub models_available: Option<Vec<String>>,
    pub generator_backend: GeneratorBackend,
    pub generator_base_url: String,
    pub generator_timeout_secs: u64,
    pub generator_cache_path: Option<String>,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        resolve_runtime_config(".forgeline/config.toml", &ConfigFile::default(), &CliOverrides::default())
    }
}

impl RuntimeConfig {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_iterations: self.max_iterations,
            max_enqueues: self.max_enqueues,
            order_by_success_rate: self.order_by_success_rate,
            contract_keys: self.contract_keys.clone(),
        }
    }

    pub fn memory_policy(&self) -> MemoryPolicy {
        MemoryPolicy {
            baseline: self.memory_baseline,
            prior_weight: self.memory_prior_weight,
            feedback_rate: self.memory_feedback_rate,
        }
    }

    pub fn model_selector(&self) -> ModelSelector {
        let selector = ModelSelector::new(&self.model_default, self.model_overrides.clone());
        match &self.models_available {
            Some(models) => selector.with_available(models.clone()),
            None => selector,
        }
    }
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub generator: Option<GeneratorBackend>,
    pub memory_path: Option<String>,
    pub rag_path: Option<String>,
    pub telemetry_path: Option<String>,
    pub telemetry: bool,
    pub max_iterations: Option<usize>,
}

impl CliOverrides {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            generator: cli.generator,
            memory_path: cli.memory_path.clone(),
            rag_path: cli.rag_path.clone(),
            telemetry_path: cli.telemetry_path.clone(),
            telemetry: cli.telemetry,
            max_iterations: None,
        }
    }
}

pub fn load_config_file(config_path: &str) -> Result<ConfigFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at '{}'", path.display()))?;
    toml::from_str::<ConfigFile>(&content).with_context(|| {
        format!(
            "invalid configuration in '{}'. Check section and field names.",
            path.display()
        )
    })
}

pub fn resolve_runtime_config(
    config_path: &str,
    file: &ConfigFile,
    overrides: &CliOverrides,
) -> RuntimeConfig {
    let scheduler = &file.scheduler;
    let memory = &file.memory;
    let rag = &file.rag;
    let models = &file.models;
    let generator = &file.generator;
    let telemetry = &file.telemetry;

    RuntimeConfig {
        config_path: config_path.to_string(),
        max_iterations: overrides
            .max_iterations
            .or(scheduler.max_iterations)
            .unwrap_or(60)
            .max(1),
        max_enqueues: scheduler.max_enqueues.unwrap_or(32),
        order_by_success_rate: scheduler.order_by_success_rate.unwrap_or(false),
        contract_keys: scheduler
            .contract_keys
            .clone()
            .unwrap_or_else(|| vec!["contract".to_string()]),
        review_attempts: scheduler.review_attempts.unwrap_or(2),
        memory_path: overrides
            .memory_path
            .clone()
            .or_else(|| memory.path.clone())
            .unwrap_or_else(|| DEFAULT_MEMORY_PATH.to_string()),
        memory_baseline: memory.baseline.unwrap_or(0.5).clamp(0.0, 1.0),
        memory_prior_weight: memory.prior_weight.unwrap_or(1.0).max(0.0),
        memory_feedback_rate: memory.feedback_rate.unwrap_or(0.5).max(0.0),
        score_baseline: memory.score_baseline.unwrap_or(50.0),
        rag_path: overrides
            .rag_path
            .clone()
            .or_else(|| rag.path.clone())
            .unwrap_or_else(|| DEFAULT_RAG_PATH.to_string()),
        rag_top_k: rag.top_k.unwrap_or(3).max(1),
        rag_max_chars: rag.max_chars.unwrap_or(1200),
        model_default: models
            .default
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        model_overrides: models.overrides.clone(),
        models_available: models.available.clone(),
        generator_backend: overrides
            .generator
            .or(generator.backend)
            .unwrap_or(GeneratorBackend::Mock),
        generator_base_url: generator
            .base_url
            .clone()
            .or_else(|| std::env::var("OLLAMA_HOST").ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
        generator_timeout_secs: generator.timeout_secs.unwrap_or(120).max(1),
        generator_cache_path: generator.cache_path.clone(),
        telemetry_enabled: overrides.telemetry || telemetry.enabled.unwrap_or(false),
        telemetry_path: overrides
            .telemetry_path
            .clone()
            .or_else(|| telemetry.path.clone())
            .unwrap_or_else(|| DEFAULT_TELEMETRY_PATH.to_string()),
    }
}

pub fn run_config_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Config path: {}", cfg.config_path);
    println!(
        "Scheduler: max_iterations={} max_enqueues={} order_by_success_rate={} review_attempts={}",
        cfg.max_iterations, cfg.max_enqueues, cfg.order_by_success_rate, cfg.review_attempts
    );
    println!("Contract keys: {}", cfg.contract_keys.join(", "));
    println!("Memory store: {}", cfg.memory_path);
    println!(
        "Memory policy: baseline={} prior_weight={} feedback_rate={} score_baseline={}",
        cfg.memory_baseline, cfg.memory_prior_weight, cfg.memory_feedback_rate, cfg.score_baseline
    );
    println!(
        "RAG store: {} (top_k={} max_chars={})",
        cfg.rag_path, cfg.rag_top_k, cfg.rag_max_chars
    );
    println!("Default model: {}", cfg.model_default);
    println!(
        "Model overrides: {}",
        if cfg.model_overrides.is_empty() {
            "<none>".to_string()
        } else {
            cfg.model_overrides
                .iter()
                .map(|(class, model)| format!("{class}={model}"))
                .collect::<Vec<_>>()
                .join(", ")
        }
    );
    println!("Generator backend: {:?}", cfg.generator_backend);
    println!("Generator base URL: {}", cfg.generator_base_url);
    println!("Generator timeout (secs): {}", cfg.generator_timeout_secs);
    println!(
        "Generator cache: {}",
        cfg.generator_cache_path.as_deref().unwrap_or("<disabled>")
    );
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let file = load_config_file("/definitely/not/here.toml").unwrap();
        let cfg = resolve_runtime_config("x", &file, &CliOverrides::default());
        assert_eq!(cfg.max_iterations, 60);
        assert_eq!(cfg.max_enqueues, 32);
        assert_eq!(cfg.contract_keys, vec!["contract"]);
        assert_eq!(cfg.generator_backend, GeneratorBackend::Mock);
        assert_eq!(cfg.memory_baseline, 0.5);
        assert!(!cfg.telemetry_enabled);
    }

    #[test]
    fn file_values_and_cli_overrides_resolve_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[scheduler]
max_iterations = 12
contract_keys = ["contract", "infra_contract"]

[memory]
path = "file-memory.json"
baseline = 0.3

[models]
default = "llama3.2"

[models.overrides]
architecture = "gpt-4o-mini"

[generator]
backend = "ollama"
cache_path = "cache.json"

[telemetry]
enabled = true
"#,
        )
        .unwrap();

        let file = load_config_file(path.to_str().unwrap()).unwrap();
        let overrides = CliOverrides {
            generator: Some(GeneratorBackend::Mock),
            memory_path: Some("cli-memory.json".to_string()),
            max_iterations: Some(5),
            ..CliOverrides::default()
        };
        let cfg = resolve_runtime_config("config.toml", &file, &overrides);

        assert_eq!(cfg.max_iterations, 5);
        assert_eq!(cfg.contract_keys, vec!["contract", "infra_contract"]);
        assert_eq!(cfg.memory_path, "cli-memory.json");
        assert_eq!(cfg.memory_baseline, 0.3);
        assert_eq!(cfg.generator_backend, GeneratorBackend::Mock);
        assert_eq!(cfg.generator_cache_path.as_deref(), Some("cache.json"));
        assert!(cfg.telemetry_enabled);
        assert_eq!(cfg.model_selector().select("architecture"), "gpt-4o-mini");
        assert_eq!(cfg.model_selector().select("unknown"), "llama3.2");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scheduler]\nmax_iteration = 3\n").unwrap();
        let err = load_config_file(path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid configuration"));
    }
}
