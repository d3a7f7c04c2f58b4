//! Model client — schema-constrained JSON generation.
//!
//! Every model interaction in the pipeline goes through
//! [`SchemaClient`]: a prompt plus a JSON schema in, a validated JSON
//! object out. Stages never parse free model text.

mod client;
mod http;
mod runtime;
mod scripted;

pub use client::SchemaClient;
pub use http::HttpModelRuntime;
pub use runtime::{GenerateRequest, ModelRuntime};
pub use scripted::ScriptedRuntime;
