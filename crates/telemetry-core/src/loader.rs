//! Endpoint loading seam.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::LoadError;

/// Fetches the raw response of one device endpoint.
#[async_trait]
pub trait EndpointLoader: Send + Sync {
    async fn load_endpoint(&self, endpoint: &str, key_args: Option<&Value>) -> Result<Value, LoadError>;
}

/// Serves canned responses from memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    responses: HashMap<String, Value>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, endpoint: impl Into<String>, response: Value) -> Self {
        self.insert(endpoint, response);
        self
    }

    pub fn insert(&mut self, endpoint: impl Into<String>, response: Value) {
        self.responses.insert(endpoint.into(), response);
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

#[async_trait]
impl EndpointLoader for MemoryLoader {
    async fn load_endpoint(&self, endpoint: &str, _key_args: Option<&Value>) -> Result<Value, LoadError> {
        self.responses
            .get(endpoint)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(endpoint.to_string()))
    }
}

/// Cache key for one fetch within a collection cycle.
pub fn request_key(endpoint: &str, key_args: Option<&Value>) -> String {
    match key_args {
        Some(args) => format!("{endpoint}?{args}"),
        None => endpoint.to_string(),
    }
}
