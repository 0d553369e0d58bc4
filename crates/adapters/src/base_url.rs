use once_cell::sync::Lazy;
use regex::Regex;
use storyforge_core::Provider;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_HOST: &str = "localhost:11434";
pub const DEFAULT_LOCAL_HOST: &str = "localhost:8080";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

static VERSION_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/v\d+(?:beta|alpha)?\d*(?:/|$)").expect("invalid version segment regex"));

/// Brings an OpenAI-compatible base URL into the `.../v1` shape that
/// `/chat/completions` is appended to. A trailing `#` keeps the URL verbatim.
pub fn normalize_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(verbatim) = trimmed.strip_suffix('#') {
        return verbatim.trim_end_matches('/').to_string();
    }

    let without_slash = trimmed.trim_end_matches('/');
    if VERSION_SEGMENT_RE.is_match(without_slash) {
        without_slash.to_string()
    } else {
        format!("{without_slash}/v1")
    }
}

/// Base URL for a model spec's provider and optional host.
pub fn provider_base_url(provider: Provider, host: Option<&str>) -> String {
    let host = host.map(str::trim).filter(|host| !host.is_empty());
    match (provider, host) {
        (Provider::Ollama, host) => normalize_base_url(&with_scheme(host.unwrap_or(DEFAULT_OLLAMA_HOST), "http")),
        (Provider::Local, host) => normalize_base_url(&with_scheme(host.unwrap_or(DEFAULT_LOCAL_HOST), "http")),
        (Provider::OpenAi, Some(host)) => normalize_base_url(&with_scheme(host, "https")),
        (Provider::OpenAi, None) => DEFAULT_OPENAI_BASE_URL.to_string(),
        (Provider::Gemini, Some(host)) => with_scheme(host, "https").trim_end_matches('/').to_string(),
        (Provider::Gemini, None) => DEFAULT_GEMINI_BASE_URL.to_string(),
    }
}

fn with_scheme(host: &str, scheme: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("{scheme}://{host}")
    }
}
