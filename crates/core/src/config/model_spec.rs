use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

pub const MAX_MODEL_ID_LENGTH: usize = 200;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    Gemini,
    OpenAi,
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ModelSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            "local" => Ok(Self::Local),
            other => Err(ModelSpecError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelSpecError {
    #[error("model selection is empty")]
    Empty,
    #[error("unknown provider `{0}` (expected ollama, gemini, openai or local)")]
    UnknownProvider(String),
    #[error("model id `{0}` contains characters outside [a-zA-Z0-9:._-]")]
    InvalidModelId(String),
    #[error("model id is {0} characters long (limit {MAX_MODEL_ID_LENGTH})")]
    ModelIdTooLong(usize),
    #[error("`{0}` is missing the model name after the host")]
    MissingModel(String),
}

/// A model selection such as `gemini:gemini-1.5-pro`,
/// `ollama://gpu-box:11434:llama3:70b` or a bare `llama3` (ollama).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: Provider,
    pub host: Option<String>,
    pub model: String,
}

impl ModelSpec {
    pub fn parse(input: &str) -> Result<Self, ModelSpecError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ModelSpecError::Empty);
        }

        let (provider, host, model) = if let Some((provider, rest)) = input.split_once("://") {
            let (host, model) = split_host(rest)
                .ok_or_else(|| ModelSpecError::MissingModel(input.to_string()))?;
            (provider.parse()?, Some(host.to_string()), model)
        } else {
            match input.split_once(':') {
                Some((prefix, model)) => match prefix.parse::<Provider>() {
                    Ok(provider) => (provider, None, model),
                    // ollama tags like `llama3:8b` carry a colon of their own
                    Err(_) => (Provider::Ollama, None, input),
                },
                None => (Provider::Ollama, None, input),
            }
        };

        validate_model_id(model)?;
        Ok(Self {
            provider,
            host,
            model: model.to_string(),
        })
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}://{}:{}", self.provider, host, self.model),
            None => write!(f, "{}:{}", self.provider, self.model),
        }
    }
}

/// Host may itself carry a port, so the model starts after the first
/// colon that does not precede a run of digits.
fn split_host(rest: &str) -> Option<(&str, &str)> {
    let mut search_from = 0;
    while let Some(offset) = rest[search_from..].find(':') {
        let colon = search_from + offset;
        let after = &rest[colon + 1..];
        let port_len = after.chars().take_while(|c| c.is_ascii_digit()).count();
        let is_port = port_len > 0 && after[port_len..].starts_with(':');
        if is_port {
            search_from = colon + 1 + port_len;
            continue;
        }
        let model = &rest[colon + 1..];
        if colon == 0 || model.is_empty() {
            return None;
        }
        return Some((&rest[..colon], model));
    }
    None
}

pub fn validate_model_id(model: &str) -> Result<(), ModelSpecError> {
    let length = model.chars().count();
    if length == 0 {
        return Err(ModelSpecError::Empty);
    }
    if length > MAX_MODEL_ID_LENGTH {
        return Err(ModelSpecError::ModelIdTooLong(length));
    }
    if !model_id_regex().is_match(model) {
        return Err(ModelSpecError::InvalidModelId(model.to_string()));
    }
    Ok(())
}

fn model_id_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[a-zA-Z0-9:._-]+$").expect("invalid model id regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_model_defaults_to_ollama() {
        let spec = ModelSpec::parse("llama3").unwrap();
        assert_eq!(spec.provider, Provider::Ollama);
        assert_eq!(spec.model, "llama3");
        assert_eq!(spec.host, None);
    }

    #[test]
    fn ollama_tag_is_not_mistaken_for_provider() {
        let spec = ModelSpec::parse("llama3:70b").unwrap();
        assert_eq!(spec.provider, Provider::Ollama);
        assert_eq!(spec.model, "llama3:70b");
    }

    #[test]
    fn provider_prefix_selects_backend() {
        let spec = ModelSpec::parse("gemini:gemini-1.5-pro").unwrap();
        assert_eq!(spec.provider, Provider::Gemini);
        assert_eq!(spec.model, "gemini-1.5-pro");
    }

    #[test]
    fn host_form_keeps_port_and_tag() {
        let spec = ModelSpec::parse("ollama://gpu-box:11434:llama3:70b").unwrap();
        assert_eq!(spec.host.as_deref(), Some("gpu-box:11434"));
        assert_eq!(spec.model, "llama3:70b");
        assert_eq!(spec.to_string(), "ollama://gpu-box:11434:llama3:70b");

        let spec = ModelSpec::parse("local://studio:mistral").unwrap();
        assert_eq!(spec.provider, Provider::Local);
        assert_eq!(spec.host.as_deref(), Some("studio"));
    }

    #[test]
    fn rejects_unknown_provider_and_bad_ids() {
        assert_eq!(
            ModelSpec::parse("azure://host:gpt"),
            Err(ModelSpecError::UnknownProvider("azure".into()))
        );
        assert!(matches!(
            ModelSpec::parse("openai:gpt 4"),
            Err(ModelSpecError::InvalidModelId(_))
        ));
        let long = "m".repeat(MAX_MODEL_ID_LENGTH + 1);
        assert_eq!(
            ModelSpec::parse(&long),
            Err(ModelSpecError::ModelIdTooLong(MAX_MODEL_ID_LENGTH + 1))
        );
        assert_eq!(ModelSpec::parse("  "), Err(ModelSpecError::Empty));
        assert!(matches!(
            ModelSpec::parse("ollama://gpu-box"),
            Err(ModelSpecError::MissingModel(_))
        ));
    }
}
