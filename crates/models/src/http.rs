//! HTTP adapter for an external model runtime.
//!
//! The runtime accepts `{prompt, json_schema, temperature, max_tokens}`
//! and answers with the generated JSON object as the response body.

use std::time::Duration;

use serde_json::Value;

use orq_domain::{Error, Result};

use crate::runtime::{GenerateRequest, ModelRuntime};

pub struct HttpModelRuntime {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    id: String,
}

impl HttpModelRuntime {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let endpoint = endpoint.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            id: format!("http:{endpoint}"),
            client,
            endpoint,
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl ModelRuntime for HttpModelRuntime {
    async fn generate(&self, req: &GenerateRequest) -> Result<Value> {
        let mut request = self.client.post(&self.endpoint).json(req);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Http(format!("model runtime timed out: {e}"))
            } else {
                Error::Http(format!("model runtime unreachable: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "model runtime returned {status}: {}",
                truncate(&body, 200)
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| Error::Http(format!("model runtime sent non-JSON body: {e}")))
    }

    fn runtime_id(&self) -> &str {
        &self.id
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_id_names_endpoint() {
        let rt = HttpModelRuntime::new("http://localhost:8089/v1/generate", None, Duration::from_millis(250));
        assert_eq!(rt.runtime_id(), "http:http://localhost:8089/v1/generate");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("ññññ", 2), "ññ");
        assert_eq!(truncate("ab", 5), "ab");
    }
}
