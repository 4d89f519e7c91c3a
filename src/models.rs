use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_MODEL: &str = "llama3.1:latest";

/// Built-in preference table: agent class → models in order of preference.
const PREFERENCES: &[(&str, &[&str])] = &[
    ("architecture", &["mistral:7b", "llama3.1:8b", "llama3.1:latest"]),
    ("contract", &["mistral:7b", "llama3.1:8b", "llama3.1:latest"]),
    ("database", &["codellama:7b", "qwen2.5-coder:7b", "llama3.1:8b"]),
    ("deployment", &["mistral:7b", "llama3.1:8b", "llama3.1:latest"]),
    ("evaluation", &["qwen2.5-coder:7b", "llama3.1:8b", "mistral:7b"]),
    ("memory", &["mistral:7b", "llama3.1:8b", "llama3.1:latest"]),
    ("review", &["qwen2.5-coder:7b", "codellama:7b", "mistral:7b"]),
    ("tech_select", &["llama3.1:8b", "mistral:7b", "llama3.1:latest"]),
];

/// Maps agent classes to backend models. Configured overrides beat the
/// built-in table; when a list of installed models is known the first
/// installed preference is chosen.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    default_model: String,
    overrides: BTreeMap<String, String>,
    available: Option<Vec<String>>,
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL, BTreeMap::new())
    }
}

impl ModelSelector {
    pub fn new(default_model: &str, overrides: BTreeMap<String, String>) -> Self {
        Self {
            default_model: default_model.to_string(),
            overrides,
            available: None,
        }
    }

    pub fn with_available(mut self, models: Vec<String>) -> Self {
        self.available = Some(models);
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn preferences(agent_class: &str) -> &'static [&'static str] {
        PREFERENCES
            .iter()
            .find(|(class, _)| *class == agent_class)
            .map(|(_, models)| *models)
            .unwrap_or(&[])
    }

    pub fn select(&self, agent_class: &str) -> String {
        if let Some(model) = self.overrides.get(agent_class) {
            return model.clone();
        }

        let preferred = Self::preferences(agent_class);
        let chosen = match &self.available {
            Some(installed) => preferred
                .iter()
                .find(|model| installed.iter().any(|m| m == *model))
                .map(|model| model.to_string())
                .or_else(|| installed.first().cloned()),
            None => preferred.first().map(|model| model.to_string()),
        };

        chosen.unwrap_or_else(|| self.default_model.clone())
    }

    /// Every class in the built-in table plus configured overrides.
    pub fn allocation(&self) -> BTreeMap<String, String> {
        PREFERENCES
            .iter()
            .map(|(class, _)| class.to_string())
            .chain(self.overrides.keys().cloned())
            .map(|class| {
                let model = self.select(&class);
                (class, model)
            })
            .collect()
    }
}

/// Model choice held by one agent instance. `force` only affects this
/// instance; clones made with `with_forced` leave the original untouched.
#[derive(Debug, Clone)]
pub struct ModelAssignment {
    agent_class: String,
    selector: Arc<ModelSelector>,
    forced: Option<String>,
}

impl ModelAssignment {
    pub fn new(agent_class: &str, selector: Arc<ModelSelector>) -> Self {
        Self {
            agent_class: agent_class.to_string(),
            selector,
            forced: None,
        }
    }

    pub fn agent_class(&self) -> &str {
        &self.agent_class
    }

    pub fn model(&self) -> String {
        self.forced
            .clone()
            .unwrap_or_else(|| self.selector.select(&self.agent_class))
    }

    pub fn force(&mut self, model: &str) {
        self.forced = Some(model.to_string());
    }

    pub fn clear(&mut self) {
        self.forced = None;
    }

    pub fn with_forced(&self, model: &str) -> Self {
        let mut forced = self.clone();
        forced.force(model);
        forced
    }

    /// Next preference after the current model, used when retrying a failed call.
    pub fn fallback_model(&self) -> Option<String> {
        let current = self.model();
        ModelSelector::preferences(&self.agent_class)
            .iter()
            .map(|model| model.to_string())
            .find(|model| *model != current)
            .or_else(|| {
                (current != self.selector.default_model())
                    .then(|| self.selector.default_model().to_string())
            })
    }
}
