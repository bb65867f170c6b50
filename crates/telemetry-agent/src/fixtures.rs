//! Endpoint responses recorded as JSON files on disk.
//!
//! Endpoint `sys/global-settings` is served from `<dir>/sys/global-settings.json`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use telemetry_core::{EndpointLoader, LoadError};

#[derive(Debug, Clone)]
pub struct FixtureLoader {
    dir: PathBuf,
}

impl FixtureLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File backing `endpoint`, or `None` when the endpoint would escape the
    /// fixtures directory.
    pub fn fixture_path(&self, endpoint: &str) -> Option<PathBuf> {
        let relative = Path::new(endpoint.trim_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || relative.as_os_str().is_empty() {
            return None;
        }
        let mut path = self.dir.join(relative);
        let file_name = format!(
            "{}.json",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        path.set_file_name(file_name);
        Some(path)
    }
}

#[async_trait]
impl EndpointLoader for FixtureLoader {
    async fn load_endpoint(&self, endpoint: &str, _key_args: Option<&Value>) -> Result<Value, LoadError> {
        let path = self.fixture_path(endpoint).ok_or_else(|| LoadError::Failed {
            endpoint: endpoint.to_string(),
            message: "endpoint is not a relative path".to_string(),
        })?;

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound(endpoint.to_string()));
            }
            Err(e) => {
                return Err(LoadError::Failed {
                    endpoint: endpoint.to_string(),
                    message: e.to_string(),
                })
            }
        };

        tracing::debug!("serving '{endpoint}' from {}", path.display());
        serde_json::from_str(&text).map_err(|e| LoadError::Failed {
            endpoint: endpoint.to_string(),
            message: format!("{}: {e}", path.display()),
        })
    }
}
