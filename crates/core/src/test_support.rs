use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::gateway::{LanguageModel, ModelError, ModelGateway, ModelParameters, RetryPolicy};

/// Replays queued replies in order and remembers every prompt it saw.
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModelError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub(crate) fn new<I, S>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Result<S, ModelError>>,
        S: Into<String>,
    {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(|r| r.map(Into::into)).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &str, _params: &ModelParameters) -> Result<String, ModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Refusal("script exhausted".into())))
    }
}

pub(crate) fn gateway(model: Arc<ScriptedModel>) -> ModelGateway {
    ModelGateway::new(model).with_retry_policy(RetryPolicy::immediate(0))
}
