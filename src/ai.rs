use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} environment variable not set. Set it with: export {0}=your-key-here")]
    MissingCredential(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no content in {0} response")]
    EmptyResponse(&'static str),
}

// --- Provider trait ---

/// The single seam to an external language model.
pub trait AIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ServiceError>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
}

impl ProviderKind {
    pub fn api_key_var(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::OpenAI => "OPENAI_API_KEY",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

pub fn resolve_model(name: &str) -> Result<ModelSpec, String> {
    let (provider, model_id, short_name) = match name {
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-4o-mini" | "mini" => (ProviderKind::OpenAI, "gpt-4o-mini", "gpt-4o-mini"),
        "gpt-4o" => (ProviderKind::OpenAI, "gpt-4o", "gpt-4o"),
        // Anthropic (requires ANTHROPIC_API_KEY)
        "api-sonnet" | "sonnet" => (
            ProviderKind::Anthropic,
            "claude-sonnet-4-5-20250929",
            "api-sonnet",
        ),
        "api-haiku" | "haiku" => (
            ProviderKind::Anthropic,
            "claude-haiku-4-5-20251001",
            "api-haiku",
        ),
        _ => {
            return Err(format!(
                "Unknown model '{}'. Available: gpt-4o-mini (default), gpt-4o, api-sonnet, api-haiku",
                name
            ));
        }
    };

    Ok(ModelSpec {
        provider,
        model_id: model_id.to_string(),
        short_name: short_name.to_string(),
    })
}

pub fn create_provider(spec: &ModelSpec) -> Result<Box<dyn AIProvider>, ServiceError> {
    let api_key = api_key_from(spec.provider.api_key_var())?;
    match spec.provider {
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(api_key, spec.model_id.clone())?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAIProvider::new(api_key, spec.model_id.clone())?)),
    }
}

pub fn api_key_from(var: &str) -> Result<String, ServiceError> {
    env::var(var)
        .ok()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ServiceError::MissingCredential(var.to_string()))
}

fn http_client() -> Result<reqwest::blocking::Client, ServiceError> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?)
}

fn check_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, ServiceError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response.text().unwrap_or_default();
    Err(ServiceError::Api { status, message })
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model_id: String) -> Result<Self, ServiceError> {
        Ok(Self {
            api_key,
            model_id,
            client: http_client()?,
        })
    }
}

impl AIProvider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ServiceError> {
        let request = AnthropicRequest {
            model: &self.model_id,
            max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()?;

        let api_response: AnthropicResponse = check_status(response)?.json()?;

        api_response
            .content
            .into_iter()
            .filter(|block| block.content_type == "text")
            .find_map(|block| block.text)
            .filter(|text| !text.trim().is_empty())
            .ok_or(ServiceError::EmptyResponse("Anthropic"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl OpenAIProvider {
    pub fn new(api_key: String, model_id: String) -> Result<Self, ServiceError> {
        Ok(Self {
            api_key,
            model_id,
            client: http_client()?,
        })
    }
}

impl AIProvider for OpenAIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ServiceError> {
        let request = OpenAIRequest {
            model: &self.model_id,
            max_tokens,
            temperature: 0.3,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()?;

        let api_response: OpenAIResponse = check_status(response)?.json()?;

        api_response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(ServiceError::EmptyResponse("OpenAI"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

/// Cuts `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
pub mod stub {
    use super::*;
    use std::cell::RefCell;

    /// Replies with a fixed text and remembers the prompts it saw.
    pub struct FixedReply {
        reply: String,
        pub prompts: RefCell<Vec<String>>,
    }

    impl FixedReply {
        pub fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl AIProvider for FixedReply {
        fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String, ServiceError> {
            self.prompts.borrow_mut().push(prompt.to_string());
            Ok(self.reply.clone())
        }

        fn model_name(&self) -> &str {
            "fixed-reply"
        }
    }

    /// Fails every call as a quota error would.
    pub struct Failing;

    impl AIProvider for Failing {
        fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, ServiceError> {
            Err(ServiceError::Api {
                status: 429,
                message: "quota exceeded".to_string(),
            })
        }

        fn model_name(&self) -> &str {
            "failing"
        }
    }
}
