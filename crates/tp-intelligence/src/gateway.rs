use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::{AnthropicProvider, LlmConfig, LlmError, LlmMessage, LlmProvider, LlmUsageTracker};

/// The language-model capability as the engine sees it.
///
/// Wraps an optional provider. With no provider every call returns
/// [`LlmError::Unavailable`] and callers take their deterministic path.
/// Every call is bounded by a timeout and a [`CancellationToken`].
#[derive(Clone)]
pub struct ModelGateway {
    provider: Option<Arc<dyn LlmProvider>>,
    config: LlmConfig,
    timeout: Duration,
    usage: Arc<Mutex<LlmUsageTracker>>,
}

impl ModelGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, config: LlmConfig) -> Self {
        Self {
            provider: Some(provider),
            config,
            timeout: Duration::from_secs(120),
            usage: Arc::new(Mutex::new(LlmUsageTracker::new())),
        }
    }

    /// A gateway with no model behind it.
    pub fn unavailable() -> Self {
        Self {
            provider: None,
            config: LlmConfig::default(),
            timeout: Duration::from_secs(120),
            usage: Arc::new(Mutex::new(LlmUsageTracker::new())),
        }
    }

    /// Build from config; the Anthropic provider is enabled only when the
    /// configured key variable is set.
    pub fn from_config(cfg: &tp_core::Config) -> Self {
        let llm_config = LlmConfig::from_providers(&cfg.providers);
        let timeout = Duration::from_secs(cfg.providers.request_timeout_secs);
        match cfg.anthropic_api_key() {
            Some(key) => {
                let provider = AnthropicProvider::new(key).with_base_url(&cfg.providers.base_url);
                Self::new(Arc::new(provider), llm_config).with_timeout(timeout)
            }
            None => {
                debug!(
                    env = %cfg.providers.anthropic_key_env,
                    "no API key in environment, language model disabled"
                );
                Self::unavailable().with_timeout(timeout)
            }
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_deref().map(|p| p.name())
    }

    pub fn usage(&self) -> LlmUsageTracker {
        self.usage.lock().expect("usage lock poisoned").clone()
    }

    /// `send(prompt, prior)`: prior messages alternate user / assistant,
    /// starting with user.
    pub async fn send(
        &self,
        prompt: &str,
        prior: &[String],
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        self.send_messages(build_messages(None, prompt, prior), cancel)
            .await
    }

    /// Single-turn request with a system prompt.
    pub async fn send_with_system(
        &self,
        system: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        self.send_messages(build_messages(Some(system), prompt, &[]), cancel)
            .await
    }

    pub async fn send_messages(
        &self,
        messages: Vec<LlmMessage>,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        let provider = self.provider.as_ref().ok_or(LlmError::Unavailable)?;
        let result = self
            .guard(provider.complete(&messages, &self.config), cancel)
            .await;

        let mut usage = self.usage.lock().expect("usage lock poisoned");
        match result {
            Ok(resp) => {
                usage.record(&resp);
                debug!(
                    provider = provider.name(),
                    input_tokens = resp.input_tokens,
                    output_tokens = resp.output_tokens,
                    "model call completed"
                );
                Ok(resp.content)
            }
            Err(e) => {
                usage.record_failure();
                warn!(provider = provider.name(), error = %e, "model call failed");
                Err(e)
            }
        }
    }

    /// Streamed variant of [`send`](Self::send). `on_delta` sees each text
    /// delta as it arrives; the concatenated text is returned.
    pub async fn send_streaming<F>(
        &self,
        prompt: &str,
        prior: &[String],
        cancel: &CancellationToken,
        mut on_delta: F,
    ) -> Result<String, LlmError>
    where
        F: FnMut(&str) + Send,
    {
        let provider = self.provider.as_ref().ok_or(LlmError::Unavailable)?;
        let messages = build_messages(None, prompt, prior);
        let config = &self.config;

        let work = async {
            let mut stream = provider.stream(&messages, config).await?;
            let mut out = String::new();
            while let Some(piece) = stream.next().await {
                let piece = piece?;
                on_delta(&piece);
                out.push_str(&piece);
            }
            Ok(out)
        };

        let result = self.guard(work, cancel).await;
        if let Err(ref e) = result {
            self.usage.lock().expect("usage lock poisoned").record_failure();
            warn!(provider = provider.name(), error = %e, "streamed model call failed");
        }
        result
    }

    async fn guard<T, F>(&self, fut: F, cancel: &CancellationToken) -> Result<T, LlmError>
    where
        F: Future<Output = Result<T, LlmError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(LlmError::Timeout),
            },
        }
    }
}

fn build_messages(system: Option<&str>, prompt: &str, prior: &[String]) -> Vec<LlmMessage> {
    let mut messages = Vec::with_capacity(prior.len() + 2);
    if let Some(system) = system {
        messages.push(LlmMessage::system(system));
    }
    for (i, text) in prior.iter().enumerate() {
        if i % 2 == 0 {
            messages.push(LlmMessage::user(text.as_str()));
        } else {
            messages.push(LlmMessage::assistant(text.as_str()));
        }
    }
    messages.push(LlmMessage::user(prompt));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, LlmRole, MockProvider, TextStream};
    use async_trait::async_trait;

    /// Never answers.
    struct HangingProvider;

    #[async_trait]
    impl LlmProvider for HangingProvider {
        async fn complete(
            &self,
            _messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<LlmResponse, LlmError> {
            std::future::pending().await
        }

        async fn stream(
            &self,
            _messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<TextStream, LlmError> {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn unavailable_gateway_reports_unavailable() {
        let gw = ModelGateway::unavailable();
        assert!(!gw.is_available());
        let err = gw
            .send("hi", &[], &CancellationToken::new())
            .await
            .expect_err("no provider");
        assert!(matches!(err, LlmError::Unavailable));
    }

    #[tokio::test]
    async fn send_returns_content_and_records_usage() {
        let mock = MockProvider::new().with_text("hello back");
        let gw = ModelGateway::new(Arc::new(mock.clone()), LlmConfig::default());
        let out = gw
            .send("hello", &["earlier question".into(), "earlier answer".into()], &CancellationToken::new())
            .await
            .expect("send ok");
        assert_eq!(out, "hello back");
        assert_eq!(gw.usage().total_requests, 1);

        let captured = mock.captured_requests();
        let roles: Vec<LlmRole> = captured[0].0.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![LlmRole::User, LlmRole::Assistant, LlmRole::User]);
        assert_eq!(captured[0].0[2].content, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out() {
        let gw = ModelGateway::new(Arc::new(HangingProvider), LlmConfig::default())
            .with_timeout(Duration::from_secs(5));
        let err = gw
            .send("hello", &[], &CancellationToken::new())
            .await
            .expect_err("should time out");
        assert!(matches!(err, LlmError::Timeout));
        assert_eq!(gw.usage().failed_requests, 1);
    }

    #[tokio::test]
    async fn cancelled_call_returns_cancelled() {
        let gw = ModelGateway::new(Arc::new(HangingProvider), LlmConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gw.send("hello", &[], &cancel).await.expect_err("cancelled");
        assert!(matches!(err, LlmError::Cancelled));
    }

    #[tokio::test]
    async fn streaming_collects_deltas() {
        let mock = MockProvider::new().with_text("alpha beta gamma");
        let gw = ModelGateway::new(Arc::new(mock), LlmConfig::default());
        let mut deltas = Vec::new();
        let out = gw
            .send_streaming("go", &[], &CancellationToken::new(), |d| {
                deltas.push(d.to_string())
            })
            .await
            .expect("stream ok");
        assert_eq!(out, "alpha beta gamma");
        assert_eq!(deltas.len(), 3);
    }
}
