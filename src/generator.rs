//! External text generation used by remediation plans.
//!
//! The HTTP client speaks the chat-completions shape (`model` + `messages`,
//! answer in `choices[0].message.content`). A single attempt is made per
//! request; callers fall back to deterministic synthesis on any failure.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

const USER_AGENT: &str = concat!("proficiency-dashboard/", env!("CARGO_PKG_VERSION"));
const SYSTEM_PROMPT: &str =
    "Você é um especialista em pedagogia. Responda apenas com um objeto JSON válido.";

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

pub struct HttpGenerator {
    http_client: reqwest::Client,
    config: GeneratorConfig,
}

impl HttpGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, GenerationError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            config,
        })
    }
}

#[async_trait]
impl TextGenerator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.4,
        };

        tracing::debug!(model = %self.config.model, prompt_len = prompt.len(), "requesting plan");

        let mut request = self.http_client.post(&self.config.url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api(status.as_u16(), error_text));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(GenerationError::Empty)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::*;

    /// Returns canned responses and records the prompts it was given.
    pub struct ScriptedGenerator {
        pub response: Result<String, String>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub fn replying(text: &str) -> Self {
            Self {
                response: Ok(text.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(reason: &str) -> Self {
            Self {
                response: Err(reason.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.response.clone().map_err(GenerationError::Network)
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }
}
