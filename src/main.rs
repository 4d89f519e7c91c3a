use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Map;
use tracing_subscriber::EnvFilter;

use forgeline::cli::{
    Cli, Commands, ConfigCommands, MemoryCommands, ModelCommands, RagCommands, TelemetryCommands,
};
use forgeline::config::{
    CliOverrides, RuntimeConfig, load_config_file, resolve_runtime_config, run_config_show,
};
use forgeline::error::{categorize_error, format_cli_error};
use forgeline::generator::build_generator;
use forgeline::memory::MemoryStore;
use forgeline::models::ModelSelector;
use forgeline::pipeline::{PipelineDeps, PipelineReport, derive_project_name, run_project};
use forgeline::retrieval::{RagStore, RetrievalService};
use forgeline::scheduler::CancelHandle;
use forgeline::store::JsonFile;
use forgeline::telemetry::{FanoutSink, TelemetrySink, TracingSink, run_telemetry_report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_filter)
        .with_context(|| format!("invalid log filter '{log_filter}'"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let file = load_config_file(&cli.config)?;
    let mut overrides = CliOverrides::from_cli(&cli);
    if let Commands::Run { max_iterations, .. } = &cli.command {
        overrides.max_iterations = *max_iterations;
    }
    let cfg = resolve_runtime_config(&cli.config, &file, &overrides);

    match cli.command {
        Commands::Run {
            prompt,
            name,
            output,
            ..
        } => run_pipeline(&cfg, &prompt, name.as_deref(), output.as_deref()).await,
        Commands::Memory(MemoryCommands::Show) => run_memory_show(&cfg),
        Commands::Memory(MemoryCommands::Feedback {
            agents,
            score,
            baseline,
        }) => run_memory_feedback(&cfg, &agents, score, baseline),
        Commands::Rag(RagCommands::Add { id, text, file }) => run_rag_add(&cfg, &id, text, file),
        Commands::Rag(RagCommands::Query { query, top_k }) => run_rag_query(&cfg, &query, top_k),
        Commands::Models(ModelCommands::Show { agent }) => run_models_show(&cfg, agent),
        Commands::Config(ConfigCommands::Show) => run_config_show(&cfg),
        Commands::Telemetry(TelemetryCommands::Report { path, limit }) => {
            run_telemetry_report(&cfg, path, limit)
        }
    }
}

fn open_memory(cfg: &RuntimeConfig) -> Result<MemoryStore> {
    MemoryStore::open(Box::new(JsonFile::new(&cfg.memory_path)), cfg.memory_policy())
        .with_context(|| format!("failed to open memory store at '{}'", cfg.memory_path))
}

fn open_rag(cfg: &RuntimeConfig) -> Result<RagStore> {
    RagStore::open(Box::new(JsonFile::new(&cfg.rag_path)))
        .with_context(|| format!("failed to open rag store at '{}'", cfg.rag_path))
}

async fn run_pipeline(
    cfg: &RuntimeConfig,
    prompt: &str,
    name: Option<&str>,
    output: Option<&str>,
) -> Result<()> {
    let memory = Arc::new(open_memory(cfg)?);
    let rag = Arc::new(open_rag(cfg)?);
    let generator = build_generator(cfg)?;
    tracing::info!(
        backend = generator.backend_name(),
        rag_docs = rag.len(),
        "using text generator"
    );

    let project = name
        .map(str::to_string)
        .unwrap_or_else(|| derive_project_name(prompt));
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(Arc::new(TelemetrySink::new(cfg, &project)));
    let cancel = CancelHandle::new();
    let deps = PipelineDeps::new(cfg, memory, rag, generator)
        .with_sink(Arc::new(sink))
        .with_cancel_handle(cancel.clone());

    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current agent");
            cancel.cancel();
        }
    });
    let outcome = run_project(prompt, name, &deps).await;
    watcher.abort();
    let outcome = outcome?;

    let report = PipelineReport::from_outcome(&outcome);
    println!("Project: {}", report.name);
    println!("Termination: {}", report.reason);
    println!("Goal reached: {}", report.goal_reached);
    println!("Iterations: {}", report.iterations);
    println!("Agents used: {}", report.agents_used.join(", "));
    if !report.failed_agents.is_empty() {
        println!("Failed agents: {}", report.failed_agents.join(", "));
    }
    match report.score {
        Some(score) => println!("Score: {score}"),
        None => println!("Score: <not evaluated>"),
    }

    if let Some(path) = output {
        report.write(Path::new(path))?;
        println!("Report written to {path}");
    }
    Ok(())
}

fn run_memory_show(cfg: &RuntimeConfig) -> Result<()> {
    let memory = open_memory(cfg)?;
    let summary = memory.summary();
    println!("Memory store: {}", cfg.memory_path);
    println!("Past runs: {}", summary.runs);
    println!("Decisions: {}", summary.decisions);
    if summary.agents.is_empty() {
        println!("No agent history yet.");
        return Ok(());
    }
    println!("Agents:");
    for (agent, stats) in &summary.agents {
        let rate = summary.success_rates.get(agent).copied().unwrap_or_default();
        println!(
            "- {agent}: invocations={} successes={} failures={} bonus={:.3} success_rate={:.3}",
            stats.invocations, stats.successes, stats.failures, stats.score_bonus, rate
        );
    }
    Ok(())
}

fn run_memory_feedback(
    cfg: &RuntimeConfig,
    agents: &[String],
    score: f64,
    baseline: Option<f64>,
) -> Result<()> {
    let memory = open_memory(cfg)?;
    let baseline = baseline.unwrap_or(cfg.score_baseline);
    memory.apply_feedback(agents, score, baseline)?;
    for agent in agents {
        println!("{agent}: success_rate={:.3}", memory.success_rate(agent));
    }
    Ok(())
}

fn run_rag_add(cfg: &RuntimeConfig, id: &str, text: Option<String>, file: Option<String>) -> Result<()> {
    let (text, source) = match (text, file) {
        (Some(text), _) => (text, "inline".to_string()),
        (None, Some(path)) => (
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read document file '{path}'"))?,
            path,
        ),
        (None, None) => anyhow::bail!("rag add needs --text or --file"),
    };

    let rag = open_rag(cfg)?;
    let mut metadata = Map::new();
    metadata.insert("source".to_string(), serde_json::Value::String(source));
    if rag.add_document(id, &text, metadata)? {
        println!("Stored document '{id}' ({} docs total).", rag.len());
    } else {
        println!("Document '{id}' is blank; nothing stored.");
    }
    Ok(())
}

fn run_rag_query(cfg: &RuntimeConfig, query: &str, top_k: Option<usize>) -> Result<()> {
    let rag = open_rag(cfg)?;
    let hits = rag.similarity(query, top_k.unwrap_or(cfg.rag_top_k));
    if hits.is_empty() {
        println!("No matching documents.");
        return Ok(());
    }
    for hit in hits {
        println!("{} score={} {}", hit.doc_id, hit.score, hit.snippet);
    }
    Ok(())
}

fn run_models_show(cfg: &RuntimeConfig, agent: Option<String>) -> Result<()> {
    let selector: ModelSelector = cfg.model_selector();
    println!("Default model: {}", selector.default_model());
    match agent {
        Some(class) => println!("{class}: {}", selector.select(&class)),
        None => {
            for (class, model) in selector.allocation() {
                println!("{class}: {model}");
            }
        }
    }
    Ok(())
}
