//! Model loading and backend negotiation
//!
//! Backends are discovered once at startup: each registered provider is asked
//! to load the model in turn and the first success wins. When none succeeds
//! the caller gets a typed [`Error::ModelLoad`] listing every provider's
//! reason.

use std::path::{Path, PathBuf};

use super::InferenceEngine;
use crate::{Error, Result};

/// Model file names probed when no explicit file is configured
pub const DEFAULT_MODEL_FILES: &[&str] = &["segformer-model.sentis", "model.sentis", "model.onnx"];

/// Source of inference engines
pub trait ModelProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Load the model at `path`
    fn load_model(&self, path: &Path) -> Result<Box<dyn InferenceEngine>>;
}

/// Find the model file inside `dir`
///
/// `preferred` is tried first, then [`DEFAULT_MODEL_FILES`] in order.
pub fn resolve_model_path(dir: &Path, preferred: Option<&str>) -> Result<PathBuf> {
    let candidates = preferred.into_iter().chain(DEFAULT_MODEL_FILES.iter().copied());
    let mut tried = Vec::new();
    for name in candidates {
        let path = dir.join(name);
        if path.is_file() {
            tracing::debug!("Resolved model path {}", path.display());
            return Ok(path);
        }
        tried.push(name);
    }
    Err(Error::ModelLoad(format!(
        "no model file in {} (tried {})",
        dir.display(),
        tried.join(", ")
    )))
}

/// Load `path` with the first provider that accepts it
pub fn negotiate_engine(
    providers: &[Box<dyn ModelProvider>],
    path: &Path,
) -> Result<Box<dyn InferenceEngine>> {
    if providers.is_empty() {
        return Err(Error::ModelLoad("no model providers registered".into()));
    }

    let mut failures = Vec::with_capacity(providers.len());
    for provider in providers {
        match provider.load_model(path) {
            Ok(engine) => {
                tracing::info!(
                    "Provider '{}' loaded model '{}' from {}",
                    provider.name(),
                    engine.model_id(),
                    path.display()
                );
                return Ok(engine);
            }
            Err(e) => {
                tracing::debug!("Provider '{}' rejected {}: {}", provider.name(), path.display(), e);
                failures.push(format!("{}: {}", provider.name(), e));
            }
        }
    }

    Err(Error::ModelLoad(format!(
        "{} could not be loaded ({})",
        path.display(),
        failures.join("; ")
    )))
}
