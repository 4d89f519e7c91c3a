use thiserror::Error;

/// Failure of a text-generation call. Agents either fall back on it or turn it
/// into an [`AgentFailure`].
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("text generation backend is disabled")]
    Disabled,
    #[error("generation transport failed: {0}")]
    Transport(String),
    #[error("generation backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation output is not a JSON object: {0}")]
    Unparseable(String),
}

/// Failure of a single agent invocation. The scheduler records it and keeps going.
#[derive(Debug, Clone, Error)]
#[error("agent '{agent_id}' failed: {reason}")]
pub struct AgentFailure {
    pub agent_id: String,
    pub reason: String,
}

impl AgentFailure {
    pub fn new(agent_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            reason: reason.into(),
        }
    }

    pub fn from_generation(agent_id: &str, err: &GenerationError) -> Self {
        Self::new(agent_id, format!("generation failed: {err}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Store,
    Generator,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Store => "STORE",
            ErrorCategory::Generator => "GENERATOR",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Config => {
                "Check .forgeline/config.toml field names or pass --config with a valid file."
            }
            ErrorCategory::Store => {
                "Check the memory/rag store paths are writable. A corrupt store file can be moved aside."
            }
            ErrorCategory::Generator => {
                "Check [generator] settings. Use backend = \"mock\" to run without a model server."
            }
            ErrorCategory::Input => "Run forgeline --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with FORGELINE_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if err.chain().any(|cause| cause.is::<GenerationError>()) {
        return ErrorCategory::Generator;
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("config") || msg.contains("unknown field") {
        return ErrorCategory::Config;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("cannot be empty")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("store") || msg.contains("memory") || msg.contains("rag") {
        return ErrorCategory::Store;
    }

    if msg.contains("generator") || msg.contains("ollama") || msg.contains("generation") {
        return ErrorCategory::Generator;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!("[{}] {:#}\nHint: {}", category.code(), err, category.hint())
}
