//! A scripted runtime for tests: canned outputs, recorded prompts,
//! no external services.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

use orq_domain::{Error, Result};

use crate::runtime::{GenerateRequest, ModelRuntime};

#[derive(Default)]
pub struct ScriptedRuntime {
    outputs: Mutex<VecDeque<Result<Value>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedRuntime {
    /// A runtime with no scripted outputs; every call errors.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outputs(outputs: Vec<Value>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into_iter().map(Ok).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue an error result (e.g. a simulated timeout).
    pub fn push_error(&self, error: Error) {
        self.outputs.lock().push_back(Err(error));
    }

    pub fn push_output(&self, output: Value) {
        self.outputs.lock().push_back(Ok(output));
    }

    /// Prompts seen so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait::async_trait]
impl ModelRuntime for ScriptedRuntime {
    async fn generate(&self, req: &GenerateRequest) -> Result<Value> {
        self.prompts.lock().push(req.prompt.clone());
        self.outputs
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Internal("scripted runtime exhausted".into())))
    }

    fn runtime_id(&self) -> &str {
        "scripted"
    }
}
