//! Schema-validated generation with a single bounded retry.

use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::Value;

use orq_domain::{Error, Result};

use crate::runtime::{GenerateRequest, ModelRuntime};

/// Wraps a [`ModelRuntime`] with JSON-schema enforcement.
///
/// On a schema violation the client retries once with the violation
/// appended to the prompt; a second violation surfaces as
/// [`Error::SchemaInvalid`] and the calling stage falls back to its
/// deterministic path.
pub struct SchemaClient {
    runtime: Arc<dyn ModelRuntime>,
}

impl SchemaClient {
    pub fn new(runtime: Arc<dyn ModelRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime_id(&self) -> &str {
        self.runtime.runtime_id()
    }

    /// Generate a JSON value conforming to `req.json_schema`.
    pub async fn generate_json(&self, req: &GenerateRequest) -> Result<Value> {
        let schema = JSONSchema::compile(&req.json_schema)
            .map_err(|e| Error::Config(format!("invalid stage schema: {e}")))?;

        let first = self.runtime.generate(req).await?;
        match validate(&schema, &first) {
            Ok(()) => return Ok(first),
            Err(violation) => {
                tracing::debug!(
                    runtime = %self.runtime.runtime_id(),
                    %violation,
                    "model output failed schema validation, retrying once"
                );
                let retry_req = GenerateRequest {
                    prompt: format!(
                        "{}\n\nThe previous output was invalid: {}. \
                         Respond with JSON matching the schema exactly.",
                        req.prompt, violation
                    ),
                    ..req.clone()
                };
                let second = self.runtime.generate(&retry_req).await?;
                match validate(&schema, &second) {
                    Ok(()) => Ok(second),
                    Err(violation) => Err(Error::SchemaInvalid(violation)),
                }
            }
        }
    }
}

fn validate(schema: &JSONSchema, instance: &Value) -> std::result::Result<(), String> {
    match schema.validate(instance) {
        Ok(()) => Ok(()),
        Err(errors) => {
            let joined: Vec<String> = errors.map(|e| e.to_string()).take(3).collect();
            Err(joined.join("; "))
        }
    }
}
