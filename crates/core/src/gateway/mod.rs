mod retry;

pub use retry::RetryPolicy;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use thiserror::Error;
use tokio_retry2::{Retry, RetryError};

use crate::run_log::RunLog;
use crate::stage::Stage;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Clone, Debug, PartialEq)]
pub struct ModelParameters {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ModelParameters {
    pub fn new(model: impl Into<String>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            temperature,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("model backend unavailable: {0}")]
    Unavailable(String),
    #[error("model call exceeded its {}ms deadline", .0.as_millis())]
    Timeout(Duration),
    #[error("model refused the request: {0}")]
    Refusal(String),
}

impl ModelError {
    /// Unavailable and timed-out calls are worth repeating; a refusal is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// A concrete backend. Implementations perform exactly one request per call
/// and leave retrying to the gateway.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str, params: &ModelParameters) -> Result<String, ModelError>;
}

/// Uniform entry point for every model call of a run: routes by model id,
/// enforces the per-call deadline and retries transient failures with
/// jittered exponential backoff. Holds no per-call state.
pub struct ModelGateway {
    default_backend: Option<Arc<dyn LanguageModel>>,
    routes: BTreeMap<String, Arc<dyn LanguageModel>>,
    retry: RetryPolicy,
    call_timeout: Duration,
    transcript: Option<Arc<RunLog>>,
}

impl ModelGateway {
    pub fn new(default_backend: Arc<dyn LanguageModel>) -> Self {
        Self {
            default_backend: Some(default_backend),
            ..Self::unrouted()
        }
    }

    /// A gateway with no fallback backend; only routed models resolve.
    pub fn unrouted() -> Self {
        Self {
            default_backend: None,
            routes: BTreeMap::new(),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(600),
            transcript: None,
        }
    }

    pub fn with_route(mut self, model: impl Into<String>, backend: Arc<dyn LanguageModel>) -> Self {
        self.routes.insert(model.into(), backend);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_transcript(mut self, run_log: Arc<RunLog>) -> Self {
        self.transcript = Some(run_log);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub async fn complete(&self, prompt: &str, params: &ModelParameters) -> Result<String, ModelError> {
        self.call(None, prompt, params).await
    }

    /// Same as [`complete`](Self::complete), and additionally writes every
    /// exchange to the run transcript under `stage`.
    pub async fn complete_as(
        &self,
        stage: Stage,
        prompt: &str,
        params: &ModelParameters,
    ) -> Result<String, ModelError> {
        self.call(Some(stage), prompt, params).await
    }

    async fn call(
        &self,
        stage: Option<Stage>,
        prompt: &str,
        params: &ModelParameters,
    ) -> Result<String, ModelError> {
        let backend = self.backend_for(&params.model)?;
        let attempts = AtomicUsize::new(0);
        let attempts = &attempts;
        let total = self.retry.max_retries + 1;

        Retry::spawn(self.retry.delays(), move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.call_once(stage, backend, prompt, params).await {
                Ok(text) => Ok(text),
                Err(err) if err.is_transient() => {
                    warn!(
                        "model `{}` attempt {}/{} failed: {}",
                        params.model, attempt, total, err
                    );
                    Err(RetryError::Transient {
                        err,
                        retry_after: None,
                    })
                }
                Err(err) => Err(RetryError::Permanent(err)),
            }
        })
        .await
    }

    async fn call_once(
        &self,
        stage: Option<Stage>,
        backend: &dyn LanguageModel,
        prompt: &str,
        params: &ModelParameters,
    ) -> Result<String, ModelError> {
        let outcome = match tokio::time::timeout(self.call_timeout, backend.complete(prompt, params)).await {
            Ok(Ok(text)) if text.trim().is_empty() => {
                Err(ModelError::Refusal("backend returned an empty payload".to_string()))
            }
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout(self.call_timeout)),
        };

        if let (Some(stage), Some(run_log)) = (stage, self.transcript.as_deref()) {
            if let Err(err) = run_log.record_exchange(stage, &params.model, prompt, outcome.as_deref()) {
                warn!("failed to write transcript: {err}");
            }
        }
        outcome
    }

    fn backend_for(&self, model: &str) -> Result<&dyn LanguageModel, ModelError> {
        self.routes
            .get(model)
            .or(self.default_backend.as_ref())
            .map(|backend| backend.as_ref())
            .ok_or_else(|| ModelError::Unavailable(format!("no backend registered for model `{model}`")))
    }
}
