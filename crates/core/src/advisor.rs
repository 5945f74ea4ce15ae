//! Repository Advisor
//!
//! Answers free-form questions about a repository with a chat model. Its
//! answers are delivered to the user as-is, without the voice model adding
//! commentary on top.

use crate::project::ProjectStatus;
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use tracing::debug;

const ADVISOR_SYSTEM_PROMPT: &str = "You are a senior software engineer advising a developer \
who is working on a git repository by voice. Answer concisely in plain sentences that read well \
when spoken aloud. Do not use markdown.";

/// Defines the contract for anything that can answer repository questions.
#[async_trait]
pub trait Advisor: Send + Sync {
    /// Answers `question`, optionally in the context of a repository.
    async fn advise(&self, question: &str, repository: Option<&ProjectStatus>) -> Result<String>;
}

/// An `Advisor` backed by an OpenAI-compatible chat completion API.
pub struct LLMAdvisor {
    client: Client<OpenAIConfig>,
    model: String,
}

impl LLMAdvisor {
    /// Creates a new advisor.
    ///
    /// # Arguments
    ///
    /// * `config` - OpenAI API configuration (API key, base URL, etc.).
    /// * `model` - Model identifier to use (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

/// Builds the user prompt for a question.
pub fn advisor_prompt(question: &str, repository: Option<&ProjectStatus>) -> String {
    match repository {
        Some(repo) => format!(
            "Repository: {}\nRemote: {}\nBranch: {}\n\nQuestion: {}",
            repo.full_name.as_deref().unwrap_or(&repo.name),
            repo.url.as_deref().unwrap_or("unknown"),
            repo.branch.as_deref().unwrap_or("unknown"),
            question
        ),
        None => format!("No repository is selected.\n\nQuestion: {}", question),
    }
}

#[async_trait]
impl Advisor for LLMAdvisor {
    async fn advise(&self, question: &str, repository: Option<&ProjectStatus>) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(ADVISOR_SYSTEM_PROMPT)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(advisor_prompt(question, repository))
                    .build()?
                    .into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;

        let answer = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .as_ref()
            .context("No content in LLM response")?;
        debug!(chars = answer.len(), "Advisor answered");
        Ok(answer.trim().to_string())
    }
}
