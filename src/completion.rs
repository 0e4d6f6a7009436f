//! Resilient client for the text-generation provider.
//!
//! One call, one utterance attempt: resolve a healthy model (preferred or
//! fallback), build the prompt, issue an OpenAI-compatible chat completion,
//! and classify the outcome. Transport and contract violations count against
//! the model's health; polite refusals do not, since the model answered and
//! we just don't want the answer.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{Config, Identity};
use crate::model_health::ModelHealth;

/// Chance of ignoring the conversation and saying something unrelated.
const OFF_TOPIC_CHANCE: f64 = 0.05;

/// The one model that gets a hard token cap.
const TOKEN_CAPPED_MODEL: &str = "meta-llama/llama-3.2-3b-instruct";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    top_p: f32,
    presence_penalty: f32,
    frequency_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct CompletionClient {
    api_url: String,
    api_key: String,
    client: reqwest::Client,
    health: Arc<ModelHealth>,
    fallback_models: Vec<String>,
    refusal_phrases: Vec<String>,
}

impl CompletionClient {
    pub fn new(config: &Config, health: Arc<ModelHealth>) -> Self {
        Self {
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
            health,
            fallback_models: config.fallback_models.clone(),
            refusal_phrases: config
                .refusal_phrases
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    /// Produce one chat line for `speaker`, or nothing.
    ///
    /// Never errors: every failure mode resolves to `None` and is logged.
    pub async fn generate(
        &self,
        speaker: &str,
        identity: &Identity,
        context: &[String],
    ) -> Option<String> {
        let model = self.select_model(&identity.model)?;

        let off_topic = rand::thread_rng().gen_bool(OFF_TOPIC_CHANCE);
        let prompt = build_prompt(speaker, identity, context, off_topic);

        match self.request(&model, &prompt).await {
            Ok(content) => {
                let content = if has_reasoning_preamble(&model) {
                    extract_final_answer(&content)
                } else {
                    content
                };
                if self.is_refusal(&content) {
                    // The call itself succeeded; no health penalty.
                    tracing::info!("Model '{}' returned a disclaimer; dropping the line", model);
                    return None;
                }
                self.health.record_success(&model);
                Some(content)
            }
            Err(e) => {
                self.health.record_failure(&model);
                tracing::warn!("Completion via '{}' failed: {:#}", model, e);
                None
            }
        }
    }

    /// Preferred model if healthy, else the first healthy fallback.
    fn select_model(&self, preferred: &str) -> Option<String> {
        if self.health.is_available(preferred) {
            return Some(preferred.to_string());
        }
        for fallback in &self.fallback_models {
            if self.health.is_available(fallback) {
                tracing::info!("Model '{}' disabled, falling back to '{}'", preferred, fallback);
                return Some(fallback.clone());
            }
        }
        tracing::debug!("All candidate models disabled; skipping generation");
        None
    }

    async fn request(&self, model: &str, prompt: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.9,
            top_p: 0.8,
            presence_penalty: 0.6,
            frequency_penalty: 0.3,
            max_tokens: max_tokens_for(model),
        };

        let url = format!("{}/chat/completions", self.api_url);
        let mut req = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .send()
            .await
            .context("Failed to send completion request")?;

        if !response.status().is_success() {
            anyhow::bail!("completion API returned status {}", response.status());
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("'choices' array is empty"))?;
        let message = choice
            .message
            .ok_or_else(|| anyhow!("'message' missing in first choice"))?;
        let content = message
            .content
            .ok_or_else(|| anyhow!("'content' missing in 'message'"))?;

        let content = content.trim().to_string();
        if content.is_empty() {
            anyhow::bail!("model returned empty content");
        }
        Ok(content)
    }

    fn is_refusal(&self, content: &str) -> bool {
        let lower = content.to_lowercase();
        self.refusal_phrases
            .iter()
            .any(|phrase| lower.contains(phrase))
    }
}

/// Per-model generation caps; fixed policy, not caller-configurable.
fn max_tokens_for(model: &str) -> Option<u32> {
    if model == TOKEN_CAPPED_MODEL {
        Some(50)
    } else {
        None
    }
}

/// Models that stream a chain-of-thought scratchpad before the line we want.
fn has_reasoning_preamble(model: &str) -> bool {
    model.contains("deepseek-r1")
}

/// Keep only the final answer from a reasoning transcript: if the last two
/// non-empty lines are identical the model repeated its answer, otherwise the
/// last non-empty line is it.
fn extract_final_answer(content: &str) -> String {
    let lines: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    match lines.as_slice() {
        [] => String::new(),
        [.., a, b] if a == b => (*b).to_string(),
        [.., last] => (*last).to_string(),
    }
}

fn build_prompt(speaker: &str, identity: &Identity, context: &[String], off_topic: bool) -> String {
    if off_topic {
        format!(
            "You are {}, a player in an online multiplayer session. Generate ONE short \
             message like you're chatting on a game server. Be {}. Talk about: your day, \
             games, random thoughts, or complaints. Write like a casual gamer - use \
             abbreviations occasionally, be informal.",
            speaker, identity.personality
        )
    } else {
        format!(
            "You are {}, a player in an online multiplayer session. The recent chat was:\n\n\
             {}\n\n\
             Now respond with a short, casual message that follows naturally. Be {}, write \
             in a {} style, and respond only as {} - just a normal player on the server.",
            speaker,
            context.join("\n"),
            identity.personality,
            identity.text_style,
            speaker
        )
    }
}
