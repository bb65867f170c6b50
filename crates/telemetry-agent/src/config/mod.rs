//! Configuration loading and resolution.

use std::path::{Path, PathBuf};

use telemetry_core::Context;

use crate::error::{AgentError, AgentResult};

/// Resolve the declaration file path.
///
/// Order: explicit flag, `TELEMETRY_DECLARATION`, `./telemetry/declaration.json`,
/// then `~/.telemetry/declaration.json`.
pub fn resolve_declaration_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = std::env::var("TELEMETRY_DECLARATION") {
        return PathBuf::from(env_path);
    }

    let cwd_declaration = PathBuf::from("telemetry/declaration.json");
    if cwd_declaration.exists() {
        return cwd_declaration;
    }

    home_dir().join(".telemetry").join("declaration.json")
}

/// Resolve the directory of recorded endpoint responses.
pub fn resolve_fixtures_dir(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = std::env::var("TELEMETRY_FIXTURES") {
        return PathBuf::from(env_path);
    }

    PathBuf::from("telemetry/fixtures")
}

fn home_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
}

/// Load the device context. No path means an empty context.
pub fn load_context(path: Option<&Path>) -> AgentResult<Context> {
    let Some(path) = path else {
        return Ok(Context::new());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| AgentError::Config(format!("cannot read context {}: {e}", path.display())))?;
    let value: serde_json::Value = serde_json::from_str(&text)?;
    if !value.is_object() {
        return Err(AgentError::Config(format!(
            "context {} must be a JSON object",
            path.display()
        )));
    }
    Ok(Context::from_value(value))
}
