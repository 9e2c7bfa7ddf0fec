pub mod client;
pub mod conversation;
pub mod parse;
pub mod prompts;

use async_trait::async_trait;

pub use client::{EinsteinClient, EinsteinSettings};
pub use conversation::{Conversation, Message, Role};
pub use parse::parse_json_reply;

/// Sampling limits for one generator call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl CompletionOptions {
    pub const fn deterministic(max_output_tokens: u32) -> Self {
        Self {
            max_output_tokens,
            temperature: 0.0,
        }
    }
}

/// A free-text producing model.
///
/// Implementations are shared across runs and must not keep per-run state;
/// everything the model should see is in the conversation passed in.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(
        &self,
        conversation: &Conversation,
        options: CompletionOptions,
    ) -> anyhow::Result<String>;
}
