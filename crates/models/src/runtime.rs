//! The model runtime boundary.

use orq_domain::Result;
use serde::Serialize;
use serde_json::Value;

/// A schema-constrained generation request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub json_schema: Value,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, json_schema: Value) -> Self {
        Self {
            prompt: prompt.into(),
            json_schema,
            temperature: 0.0,
            max_tokens: 512,
        }
    }
}

/// Trait every model backend implements.
///
/// The runtime returns whatever JSON the model produced; schema
/// enforcement lives in [`crate::SchemaClient`], which owns the retry.
#[async_trait::async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Generate one JSON value for the request.
    async fn generate(&self, req: &GenerateRequest) -> Result<Value>;

    /// A unique identifier for this runtime instance.
    fn runtime_id(&self) -> &str;
}
