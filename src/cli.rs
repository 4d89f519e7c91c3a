use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorBackend {
    Mock,
    Ollama,
}

#[derive(Debug, Subcommand)]
pub enum MemoryCommands {
    #[command(about = "Show per-agent invocation counts and success estimates")]
    Show,
    #[command(about = "Apply a final score as feedback to the given agents")]
    Feedback {
        #[arg(long = "agent", required = true)]
        agents: Vec<String>,
        #[arg(long)]
        score: f64,
        #[arg(long)]
        baseline: Option<f64>,
    },
}

#[derive(Debug, Subcommand)]
pub enum RagCommands {
    #[command(about = "Add or replace a document in the retrieval store")]
    Add {
        #[arg(long)]
        id: String,
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,
        #[arg(long)]
        file: Option<String>,
    },
    #[command(about = "Rank stored documents against a query")]
    Query {
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ModelCommands {
    #[command(about = "Show the model chosen for each agent class")]
    Show {
        #[arg(long)]
        agent: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    #[command(about = "Show the resolved runtime configuration")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize pipeline events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the agent pipeline on a free-text project description")]
    Run {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, help = "Write the run report as JSON to this path")]
        output: Option<String>,
        #[arg(long)]
        max_iterations: Option<usize>,
    },
    #[command(subcommand, about = "Inspect or adjust agent outcome memory")]
    Memory(MemoryCommands),
    #[command(subcommand, about = "Manage the retrieval document store")]
    Rag(RagCommands),
    #[command(subcommand, about = "Inspect model selection")]
    Models(ModelCommands),
    #[command(subcommand, about = "Inspect configuration")]
    Config(ConfigCommands),
    #[command(subcommand, about = "Inspect pipeline telemetry")]
    Telemetry(TelemetryCommands),
}

#[derive(Debug, Parser)]
#[command(
    name = "forgeline",
    version,
    about = "Capability-gated agent pipeline for project descriptions"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "FORGELINE_CONFIG",
        default_value = ".forgeline/config.toml"
    )]
    pub config: String,
    #[arg(long, global = true, env = "FORGELINE_LOG", default_value = "warn")]
    pub log_filter: String,
    #[arg(long, global = true, value_enum)]
    pub generator: Option<GeneratorBackend>,
    #[arg(long, global = true)]
    pub memory_path: Option<String>,
    #[arg(long, global = true)]
    pub rag_path: Option<String>,
    #[arg(long, global = true)]
    pub telemetry_path: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    pub telemetry: bool,
    #[command(subcommand)]
    pub command: Commands,
}
