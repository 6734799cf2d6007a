//! Language-model collaboration for the classification fallback. The rest of
//! the pipeline only sees the [`CompletionClient`] trait, so batches run
//! without network access when no client is supplied and tests swap in
//! scripted fakes.

pub mod client;
pub mod prompts;

pub use client::*;
pub use prompts::*;

use async_trait::async_trait;

use crate::error::Result;

/// A completion collaborator: send a system prompt and a user prompt, get
/// raw model text back. Implementations own their transport and retry
/// policy.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}
