//! Persistence boundary for the process-wide stores.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub trait StorePersistence<S>: Send + Sync {
    /// `Ok(None)` means there is nothing persisted yet.
    fn load(&self) -> Result<Option<S>>;
    fn save(&self, state: &S) -> Result<()>;
    fn describe(&self) -> String;
}

/// Pretty-printed JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<S> StorePersistence<S> for JsonFile
where
    S: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<S>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read store file '{}'", self.path.display()))?;
        match serde_json::from_str::<S>(&content) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "store file is not valid, starting empty"
                );
                Ok(None)
            }
        }
    }

    fn save(&self, state: &S) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory '{}'", parent.display())
            })?;
        }

        let json = serde_json::to_string_pretty(state).context("failed to serialize store")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write store file '{}'", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace store file '{}'", self.path.display()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Keeps nothing; every load starts empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ephemeral;

impl<S> StorePersistence<S> for Ephemeral {
    fn load(&self) -> Result<Option<S>> {
        Ok(None)
    }

    fn save(&self, _state: &S) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "<ephemeral>".to_string()
    }
}
