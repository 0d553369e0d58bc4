use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{self, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use storyforge_core::{
    Config, LanguageModel, LlmConfig, ModelError, ModelGateway, ModelParameters, ModelSpec,
    Provider, RetryPolicy,
};

use crate::base_url::{
    normalize_base_url, provider_base_url, DEFAULT_GEMINI_BASE_URL, DEFAULT_OPENAI_BASE_URL,
};
use crate::error::AdapterError;

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Builds the backend for a stage selection: a named profile when one
/// exists, otherwise a model spec.
pub fn create_backend(
    config: &Config,
    selection: &str,
) -> Result<Arc<dyn LanguageModel>, AdapterError> {
    if let Some(profile) = config.get_llm_profile(selection) {
        return create_backend_from_profile(profile);
    }
    let spec = ModelSpec::parse(selection)?;
    create_backend_from_spec(&spec, Duration::from_secs(config.generation.call_timeout_secs.max(1)))
}

pub fn create_backend_from_profile(
    profile: &LlmConfig,
) -> Result<Arc<dyn LanguageModel>, AdapterError> {
    let format = profile.interface_format.trim().to_lowercase();
    let timeout = Duration::from_secs(profile.timeout.max(1));
    let api_key = optional_string(&profile.api_key);

    let openai_like = |default_base: &str| -> Result<Arc<dyn LanguageModel>, AdapterError> {
        let base = if profile.base_url.trim().is_empty() {
            default_base
        } else {
            profile.base_url.as_str()
        };
        Ok(Arc::new(OpenAiCompatibleBackend::new(
            base,
            api_key.clone(),
            &profile.model_name,
            timeout,
        )?))
    };

    match format.as_str() {
        "openai" => openai_like(DEFAULT_OPENAI_BASE_URL),
        "deepseek" => openai_like("https://api.deepseek.com/v1"),
        "grok" => openai_like("https://api.x.ai/v1"),
        "ollama" => openai_like("http://localhost:11434/v1"),
        "local" | "lm studio" => openai_like("http://localhost:8080/v1"),
        "gemini" => {
            let base = if profile.base_url.trim().is_empty() {
                DEFAULT_GEMINI_BASE_URL
            } else {
                profile.base_url.as_str()
            };
            Ok(Arc::new(GeminiBackend::new(
                base,
                api_key.clone().unwrap_or_default(),
                &profile.model_name,
                timeout,
            )?))
        }
        other => Err(AdapterError::InvalidConfig(format!(
            "unknown interface_format: {other}"
        ))),
    }
}

/// Builds a backend from a model spec. API keys come from
/// `OPENAI_API_KEY` and `GEMINI_API_KEY`.
pub fn create_backend_from_spec(
    spec: &ModelSpec,
    timeout: Duration,
) -> Result<Arc<dyn LanguageModel>, AdapterError> {
    let api_key = match spec.provider {
        Provider::OpenAi => env::var(OPENAI_API_KEY_ENV).ok(),
        Provider::Gemini => env::var(GEMINI_API_KEY_ENV).ok(),
        Provider::Ollama | Provider::Local => None,
    };
    backend_for_spec(spec, api_key, timeout)
}

pub(crate) fn backend_for_spec(
    spec: &ModelSpec,
    api_key: Option<String>,
    timeout: Duration,
) -> Result<Arc<dyn LanguageModel>, AdapterError> {
    let base = provider_base_url(spec.provider, spec.host.as_deref());
    match spec.provider {
        Provider::Gemini => {
            let api_key = api_key.filter(|key| !key.trim().is_empty()).ok_or_else(|| {
                AdapterError::InvalidConfig(format!(
                    "{GEMINI_API_KEY_ENV} must be set to use `{spec}`"
                ))
            })?;
            Ok(Arc::new(GeminiBackend::new(&base, api_key, &spec.model, timeout)?))
        }
        Provider::OpenAi | Provider::Ollama | Provider::Local => Ok(Arc::new(
            OpenAiCompatibleBackend::new(&base, api_key, &spec.model, timeout)?,
        )),
    }
}

/// A gateway with one route per distinct stage selection, using the
/// configured retry count and per-call deadline.
pub fn build_gateway(config: &Config) -> Result<ModelGateway, AdapterError> {
    let settings = &config.generation;
    let retries = usize::try_from(settings.gateway_retries).unwrap_or(usize::MAX);
    let mut gateway = ModelGateway::unrouted()
        .with_retry_policy(RetryPolicy::default().with_max_retries(retries))
        .with_call_timeout(settings.call_timeout());

    for selection in config.stages.selections() {
        let backend = create_backend(config, &selection)?;
        debug!("routing model selection `{selection}`");
        gateway = gateway.with_route(selection, backend);
    }
    Ok(gateway)
}

fn optional_string(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Chat-completions backend for OpenAI, Ollama, LM Studio and other
/// servers speaking the same protocol.
pub struct OpenAiCompatibleBackend {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    system_prompt: Option<String>,
    timeout: Duration,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model_name: &str,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let base_url = normalize_base_url(base_url);
        if base_url.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "base_url must not be empty".to_string(),
            ));
        }
        if model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model_name must not be empty".to_string(),
            ));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{base_url}/chat/completions"),
            api_key,
            model_name: model_name.trim().to_string(),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            timeout,
        })
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, prompt: &str, params: &ModelParameters) -> Result<String, AdapterError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.system_prompt.as_deref() {
            messages.push(ChatMessageRequest {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessageRequest {
            role: "user",
            content: prompt,
        });

        let body = ChatCompletionRequest {
            model: &self.model_name,
            messages,
            max_tokens: (params.max_tokens > 0).then_some(params.max_tokens),
            temperature: params.temperature,
        };

        let mut request = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        extract_choice_content(parsed)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleBackend {
    async fn complete(&self, prompt: &str, params: &ModelParameters) -> Result<String, ModelError> {
        self.request(prompt, params).await.map_err(|err| {
            warn!("chat completion via {} failed: {err}", self.url);
            err.into_model_error(self.timeout)
        })
    }
}

/// Google Generative Language `generateContent` backend.
pub struct GeminiBackend {
    client: Client,
    url: String,
    api_key: String,
    timeout: Duration,
}

impl GeminiBackend {
    pub fn new(
        base_url: &str,
        api_key: String,
        model_name: &str,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        if api_key.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini api_key must not be empty".to_string(),
            ));
        }
        if model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini model_name must not be empty".to_string(),
            ));
        }

        let base = match base_url.trim().trim_end_matches('/') {
            "" => DEFAULT_GEMINI_BASE_URL,
            base => base,
        };
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{base}/models/{}:generateContent", model_name.trim()),
            api_key,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, prompt: &str, params: &ModelParameters) -> Result<String, AdapterError> {
        let body = GeminiRequest {
            contents: vec![GeminiRequestContent {
                role: "user",
                parts: vec![GeminiRequestPart { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: params.max_tokens,
                temperature: params.temperature,
            },
        };

        let response = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", self.api_key.as_str())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if let Some(secs) = parse_retry_delay(&body) {
                    warn!("Gemini rate limit hit; the server asks to wait {secs}s");
                }
            }
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: GeminiResponse = response.json().await?;
        parse_gemini_response(parsed)
    }
}

#[async_trait]
impl LanguageModel for GeminiBackend {
    async fn complete(&self, prompt: &str, params: &ModelParameters) -> Result<String, ModelError> {
        self.request(prompt, params).await.map_err(|err| {
            warn!("Gemini request to {} failed: {err}", self.url);
            err.into_model_error(self.timeout)
        })
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

fn extract_choice_content(response: ChatCompletionResponse) -> Result<String, AdapterError> {
    for choice in response.choices {
        if choice.finish_reason.as_deref() == Some("length") {
            warn!("chat completion truncated by max_tokens");
        }
        if let Some(message) = choice.message {
            if let Some(refusal) = message.refusal.filter(|r| !r.trim().is_empty()) {
                return Err(AdapterError::Blocked(refusal));
            }
            if let Some(content) = message.content.filter(|c| !c.trim().is_empty()) {
                return Ok(content);
            }
        }
        if let Some(text) = choice.text.filter(|t| !t.trim().is_empty()) {
            return Ok(text);
        }
    }
    Err(AdapterError::EmptyResponse)
}

#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiRequestContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiRequestContent<'a> {
    role: &'static str,
    parts: Vec<GeminiRequestPart<'a>>,
}

#[derive(Serialize)]
struct GeminiRequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason", default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Other(serde_json::Value),
}

fn parse_gemini_response(response: GeminiResponse) -> Result<String, AdapterError> {
    if let Some(reason) = response.prompt_feedback.and_then(|feedback| feedback.block_reason) {
        return Err(AdapterError::Blocked(reason));
    }

    let mut blocked = None;
    for candidate in response.candidates {
        match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => warn!("Gemini response truncated by maxOutputTokens"),
            Some(reason @ ("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT")) => {
                blocked = Some(reason.to_string());
            }
            _ => {}
        }

        let text: String = candidate
            .content
            .into_iter()
            .flat_map(|content| content.parts)
            .filter_map(|part| match part {
                GeminiPart::Text { text } => Some(text),
                GeminiPart::Other(_) => None,
            })
            .collect();
        if !text.trim().is_empty() {
            return Ok(text);
        }
    }

    Err(blocked.map_or(AdapterError::EmptyResponse, AdapterError::Blocked))
}

static RETRY_DELAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)retry[_ ]?delay"?\s*[:=]?\s*"?(\d+)"#).expect("invalid retry delay regex"));

/// Seconds the server asked us to wait, from a `RetryInfo` detail or
/// anywhere in the body text.
fn parse_retry_delay(body: &str) -> Option<u64> {
    let from_details = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.pointer("/error/details").and_then(|d| d.as_array()).cloned())
        .into_iter()
        .flatten()
        .find_map(|detail| {
            let delay = detail.get("retryDelay").or_else(|| detail.get("retry_delay"))?;
            delay
                .as_u64()
                .or_else(|| delay.as_str()?.trim_end_matches('s').parse().ok())
        });

    from_details.or_else(|| {
        RETRY_DELAY_RE
            .captures(body)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    #[test]
    fn chat_reply_takes_first_non_empty_choice() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "  "}}, {"message": {"content": "ready"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_choice_content(response).unwrap(), "ready");
    }

    #[test]
    fn chat_refusal_is_blocked() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": null, "refusal": "I can't help with that."}}]}"#,
        )
        .unwrap();
        assert!(matches!(extract_choice_content(response), Err(AdapterError::Blocked(_))));

        let empty: ChatCompletionResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(extract_choice_content(empty), Err(AdapterError::EmptyResponse)));
    }

    #[test]
    fn gemini_parts_are_joined() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": [{"text": "Once "}, {"inlineData": {}}, {"text": "upon"}]}, "finishReason": "STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(parse_gemini_response(response).unwrap(), "Once upon");
    }

    #[test]
    fn gemini_safety_block_is_reported() {
        let response: GeminiResponse =
            serde_json::from_str(r#"{"candidates": [{"finishReason": "SAFETY"}]}"#).unwrap();
        match parse_gemini_response(response) {
            Err(AdapterError::Blocked(reason)) => assert_eq!(reason, "SAFETY"),
            other => panic!("unexpected result: {other:?}"),
        }

        let prompt_blocked: GeminiResponse =
            serde_json::from_str(r#"{"promptFeedback": {"blockReason": "OTHER"}}"#).unwrap();
        assert!(matches!(parse_gemini_response(prompt_blocked), Err(AdapterError::Blocked(_))));
    }

    #[test]
    fn retry_delay_from_details_or_text() {
        let structured = r#"{"error": {"code": 429, "details": [{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "37s"}]}}"#;
        assert_eq!(parse_retry_delay(structured), Some(37));
        assert_eq!(parse_retry_delay("quota exceeded, retry_delay: 12"), Some(12));
        assert_eq!(parse_retry_delay("quota exceeded"), None);
    }

    #[test]
    fn openai_backend_builds_completion_url() {
        let backend = OpenAiCompatibleBackend::new(
            "http://localhost:11434",
            None,
            "llama3",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(backend.url(), "http://localhost:11434/v1/chat/completions");
        assert!(OpenAiCompatibleBackend::new("http://localhost:11434", None, " ", DEFAULT_TIMEOUT).is_err());
    }

    #[test]
    fn spec_backends_require_gemini_key() {
        let gemini = ModelSpec::parse("gemini:gemini-1.5-pro").unwrap();
        assert!(matches!(
            backend_for_spec(&gemini, None, DEFAULT_TIMEOUT),
            Err(AdapterError::InvalidConfig(_))
        ));
        assert!(backend_for_spec(&gemini, Some("key".into()), DEFAULT_TIMEOUT).is_ok());

        let local = ModelSpec::parse("ollama://gpu-box:11434:llama3:70b").unwrap();
        assert!(backend_for_spec(&local, None, DEFAULT_TIMEOUT).is_ok());
    }

    #[test]
    fn gateway_routes_every_selection() {
        let mut config = Config::new();
        config.upsert_llm_profile(
            "writer",
            LlmConfig {
                interface_format: "ollama".into(),
                model_name: "llama3".into(),
                ..LlmConfig::default()
            },
        );
        config.stages.default = "ollama:mistral".into();
        config.stages.drafter = Some("writer".into());
        assert!(build_gateway(&config).is_ok());

        config.stages.outliner = Some("profile-that-does-not-exist!".into());
        assert!(matches!(build_gateway(&config), Err(AdapterError::ModelSpec(_))));

        let mut unknown = LlmConfig::default();
        unknown.interface_format = "carrier pigeon".into();
        unknown.model_name = "coo".into();
        assert!(create_backend_from_profile(&unknown).is_err());
    }
}
