mod backend;
mod base_url;
mod error;
mod run_store;

pub use backend::{
    build_gateway, create_backend, create_backend_from_profile, create_backend_from_spec,
    GeminiBackend, OpenAiCompatibleBackend, GEMINI_API_KEY_ENV, OPENAI_API_KEY_ENV,
};
pub use base_url::{normalize_base_url, provider_base_url};
pub use error::AdapterError;
pub use run_store::JsonlRunStore;

pub use storyforge_core::{Config, ConfigStore, LanguageModel, LlmConfig, ModelError};
