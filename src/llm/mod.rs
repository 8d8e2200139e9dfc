pub mod agentic;
pub mod client;
pub mod parse;
pub mod prompts;
pub mod tools;

use anyhow::Result;
use async_trait::async_trait;

pub use client::OpenRouterClient;
pub use tools::{ToolError, ToolRegistry};

/// One request to the model: a system prompt, a user message, optional PNG
/// images, and optionally the tools it may call before answering.
#[derive(Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    pub images: &'a [Vec<u8>],
    pub tools: Option<&'a ToolRegistry>,
}

impl<'a> CompletionRequest<'a> {
    pub fn new(system: &'a str, user: &'a str) -> Self {
        Self {
            system,
            user,
            images: &[],
            tools: None,
        }
    }

    pub fn with_images(mut self, images: &'a [Vec<u8>]) -> Self {
        self.images = images;
        self
    }

    pub fn with_tools(mut self, tools: &'a ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Final text answer of the model
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String>;

    /// Identifier recorded on hypotheses as `analyzed_by`
    fn model_name(&self) -> &str;
}
