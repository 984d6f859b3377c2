//! Deterministic model that replays canned responses
//!
//! Steps are served in order; the last one repeats once the script runs out.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Completion, LanguageModel, LlmError};

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Fail(String),
}

pub struct ScriptedModel {
    steps: Vec<Step>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self {
            steps,
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_steps(replies.into_iter().map(|r| Step::Reply(r.into())).collect())
    }

    pub fn repeating(reply: impl Into<String>) -> Self {
        Self::from_steps(vec![Step::Reply(reply.into())])
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::from_steps(vec![Step::Fail(message.into())])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, oldest first
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<Completion, LlmError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.steps.get(index).or_else(|| self.steps.last()) {
            Some(Step::Reply(text)) => Ok(Completion::text(text.clone())),
            Some(Step::Fail(message)) => Err(LlmError::Transport(message.clone())),
            None => Err(LlmError::InvalidResponse("script is empty".to_string())),
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order_then_repeats_last() {
        let model = ScriptedModel::from_steps(vec![
            Step::Fail("503".to_string()),
            Step::Reply("SELECT 1".to_string()),
        ]);

        assert!(model.complete("a", 10).await.is_err());
        assert_eq!(model.complete("b", 10).await.unwrap().text, "SELECT 1");
        assert_eq!(model.complete("c", 10).await.unwrap().text, "SELECT 1");
        assert_eq!(model.calls(), 3);
        assert_eq!(model.prompts(), vec!["a", "b", "c"]);
    }
}
