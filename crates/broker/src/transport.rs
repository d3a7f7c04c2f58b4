//! Tool transports: HTTP-style tools and in-process callables.
//!
//! A transport turns one attempt into either a payload or a
//! [`TransportError`] classified as transient (retryable) or permanent.
//! The broker owns the retry loop; transports stay attempt-scoped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use orq_domain::config::{ToolCredential, ToolPolicy};
use orq_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / error types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool attempt, as seen by a transport.
pub struct ToolRequest<'a> {
    pub workspace_id: &'a str,
    pub tool_name: &'a str,
    pub args: &'a Value,
    pub retry_safe: bool,
    pub policy: &'a ToolPolicy,
}

/// Attempt failure, classified for the retry loop.
#[derive(Debug)]
pub enum TransportError {
    /// Retryable: transport timeouts, 408, 429, 5xx, declared
    /// retryable application errors.
    Transient {
        status: Option<u16>,
        /// From a 429's `Retry-After` header, when present.
        retry_after: Option<Duration>,
        message: String,
    },
    /// Not retryable: other 4xx, malformed payloads, permanent
    /// application errors.
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Transient { status, .. } => *status,
            TransportError::Permanent { status, .. } => *status,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TransportError::Transient { message, .. } => message,
            TransportError::Permanent { message, .. } => message,
        }
    }
}

/// A transport executes one attempt of one tool call.
#[async_trait::async_trait]
pub trait ToolTransport: Send + Sync {
    async fn invoke(
        &self,
        req: &ToolRequest<'_>,
    ) -> std::result::Result<Value, TransportError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HTTP-style tool: POST with the JSON args as the body.
pub struct HttpToolTransport {
    client: reqwest::Client,
}

impl Default for HttpToolTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpToolTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ToolTransport for HttpToolTransport {
    async fn invoke(
        &self,
        req: &ToolRequest<'_>,
    ) -> std::result::Result<Value, TransportError> {
        let endpoint = req.policy.endpoint.as_deref().ok_or_else(|| {
            TransportError::Permanent {
                status: None,
                message: format!("tool '{}' has no endpoint configured", req.tool_name),
            }
        })?;

        let mut request = self
            .client
            .post(endpoint)
            .header("X-Tool-Name", req.tool_name)
            .header("X-Tool-Retry-Safe", if req.retry_safe { "true" } else { "false" })
            .json(req.args);

        match &req.policy.credential {
            Some(ToolCredential::Bearer { token }) => {
                request = request.bearer_auth(token);
            }
            Some(ToolCredential::ApiKey { header, key }) => {
                request = request.header(header.as_str(), key.as_str());
            }
            None => {}
        }

        let response = request.send().await.map_err(|e| TransportError::Transient {
            status: None,
            retry_after: None,
            message: format!("transport: {e}"),
        })?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(
            response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok()),
            Utc::now(),
        );

        let body = response.bytes().await.map_err(|e| TransportError::Transient {
            status: Some(status),
            retry_after: None,
            message: format!("body read: {e}"),
        })?;

        if body.len() > req.policy.max_body_bytes {
            return Err(TransportError::Permanent {
                status: Some(413),
                message: format!(
                    "response body {} bytes exceeds cap {}",
                    body.len(),
                    req.policy.max_body_bytes
                ),
            });
        }

        match status {
            200..=299 => serde_json::from_slice(&body).map_err(|e| TransportError::Permanent {
                status: Some(status),
                message: format!("tool returned non-JSON body: {e}"),
            }),
            408 | 429 | 500..=599 => Err(TransportError::Transient {
                status: Some(status),
                retry_after,
                message: format!("HTTP {status}"),
            }),
            _ => Err(TransportError::Permanent {
                status: Some(status),
                message: format!("HTTP {status}"),
            }),
        }
    }
}

/// Parse a `Retry-After` header value: either delay-seconds or an
/// HTTP-date (RFC 2822). Dates in the past yield a zero delay.
pub fn parse_retry_after(value: Option<&str>, now: DateTime<Utc>) -> Option<Duration> {
    let value = value?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - now;
    Some(Duration::from_secs(delta.num_seconds().max(0) as u64))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An in-process tool implementation.
#[async_trait::async_trait]
pub trait LocalTool: Send + Sync {
    async fn call(&self, args: &Value) -> Result<Value>;
}

/// Adapter so plain async closures can be registered as tools.
pub struct FnTool<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> LocalTool for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    async fn call(&self, args: &Value) -> Result<Value> {
        (self.0)(args.clone()).await
    }
}

/// Registry of in-process callables, keyed by tool name.
///
/// Return-value conventions (kept from the RPC protocol):
/// - `{"success": true, "data": ...}` — structured success; `data` is
///   the payload.
/// - `{"success": false, "error": ..., "retryable": bool}` — structured
///   failure; `retryable` defaults to false.
/// - anything else — legacy bare payload, treated as success.
#[derive(Default)]
pub struct LocalToolTransport {
    tools: RwLock<HashMap<String, Arc<dyn LocalTool>>>,
}

impl LocalToolTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, tool: Arc<dyn LocalTool>) {
        self.tools.write().insert(name.into(), tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }
}

#[async_trait::async_trait]
impl ToolTransport for LocalToolTransport {
    async fn invoke(
        &self,
        req: &ToolRequest<'_>,
    ) -> std::result::Result<Value, TransportError> {
        let tool = {
            let tools = self.tools.read();
            tools.get(req.tool_name).cloned()
        };
        let tool = tool.ok_or_else(|| TransportError::Permanent {
            status: None,
            message: format!("no local tool registered as '{}'", req.tool_name),
        })?;

        match tool.call(req.args).await {
            Ok(value) => interpret_payload(value),
            Err(e) => {
                let message = e.to_string();
                if e.is_transient() {
                    Err(TransportError::Transient {
                        status: None,
                        retry_after: None,
                        message,
                    })
                } else {
                    Err(TransportError::Permanent {
                        status: None,
                        message,
                    })
                }
            }
        }
    }
}

fn interpret_payload(value: Value) -> std::result::Result<Value, TransportError> {
    let Some(obj) = value.as_object() else {
        return Ok(value);
    };
    match obj.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(obj.get("data").cloned().unwrap_or(Value::Null)),
        Some(false) => {
            let message = obj
                .get("error")
                .map(|e| e.to_string())
                .unwrap_or_else(|| "tool reported failure".into());
            if obj.get("retryable").and_then(Value::as_bool).unwrap_or(false) {
                Err(TransportError::Transient {
                    status: None,
                    retry_after: None,
                    message,
                })
            } else {
                Err(TransportError::Permanent {
                    status: None,
                    message,
                })
            }
        }
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_after_seconds() {
        assert_eq!(
            parse_retry_after(Some("7"), Utc::now()),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 15 Oct 2025 12:00:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let parsed = parse_retry_after(Some("Wed, 15 Oct 2025 12:00:30 GMT"), now);
        assert_eq!(parsed, Some(Duration::from_secs(30)));
    }

    #[test]
    fn retry_after_past_date_is_zero() {
        let now = DateTime::parse_from_rfc2822("Wed, 15 Oct 2025 12:00:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let parsed = parse_retry_after(Some("Wed, 15 Oct 2025 11:00:00 GMT"), now);
        assert_eq!(parsed, Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_garbage_is_none() {
        assert_eq!(parse_retry_after(Some("soonish"), Utc::now()), None);
        assert_eq!(parse_retry_after(None, Utc::now()), None);
    }

    #[test]
    fn structured_success_unwraps_data() {
        let out = interpret_payload(json!({"success": true, "data": {"id": 1}})).unwrap();
        assert_eq!(out, json!({"id": 1}));
    }

    #[test]
    fn structured_failure_maps_to_permanent() {
        let err = interpret_payload(json!({"success": false, "error": "no slots"})).unwrap_err();
        assert!(matches!(err, TransportError::Permanent { .. }));
    }

    #[test]
    fn declared_retryable_failure_is_transient() {
        let err = interpret_payload(
            json!({"success": false, "error": "busy", "retryable": true}),
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::Transient { .. }));
    }

    #[test]
    fn legacy_bare_payload_passes_through() {
        let out = interpret_payload(json!({"services": ["Corte"]})).unwrap();
        assert_eq!(out["services"][0], "Corte");
        let out = interpret_payload(json!([1, 2, 3])).unwrap();
        assert_eq!(out, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn fn_tool_adapts_closures() {
        let transport = LocalToolTransport::new();
        transport.register(
            "echo",
            Arc::new(FnTool(|args: Value| async move { Ok(args) })),
        );
        assert!(transport.contains("echo"));

        let policy = ToolPolicy::default();
        let args = json!({"x": 1});
        let req = ToolRequest {
            workspace_id: "ws",
            tool_name: "echo",
            args: &args,
            retry_safe: true,
            policy: &policy,
        };
        let out = transport.invoke(&req).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_local_tool_is_permanent() {
        let transport = LocalToolTransport::new();
        let policy = ToolPolicy::default();
        let args = json!({});
        let req = ToolRequest {
            workspace_id: "ws",
            tool_name: "ghost",
            args: &args,
            retry_safe: true,
            policy: &policy,
        };
        let err = transport.invoke(&req).await.unwrap_err();
        assert!(matches!(err, TransportError::Permanent { .. }));
    }
}
