//! Remote text-inference service.
//!
//! The pipeline only ever needs "send one prompt, get one text reply", so the
//! seam is a single-method trait. [`OpenAiClient`] speaks the chat-completions
//! wire format; tests substitute scripted fakes.

mod openai;

use async_trait::async_trait;
use leadflow_shared::Result;

pub use openai::{OpenAiClient, OpenAiOptions};

/// A remote model that turns a prompt into a text reply.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Send `prompt` as a single user message and return the trimmed reply.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Identifier of the model answering, used to key the response cache.
    fn model(&self) -> &str;
}
