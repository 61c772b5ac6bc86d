//! Provider Gateway: one uniform call surface over search providers and
//! LLMs, with per-provider budgets, timeouts, and classified retries.
//!
//! The gateway never returns `Err` across its boundary; every call yields a
//! [`CallOutcome`] so callers decide policy, not providers.

mod errors;
pub mod fixture;
mod limiter;
mod retry;

pub use errors::{ErrorClass, ProviderError};
pub use limiter::ProviderLimiter;
pub use retry::RetryPolicy;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::NexusConfig;
use crate::error::CoreError;
use crate::model::ProviderId;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Which LLM the orchestrator is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Reasoning,
    Task,
}

impl ModelRole {
    fn limiter_key(self) -> &'static str {
        match self {
            ModelRole::Reasoning => "llm_reasoning",
            ModelRole::Task => "llm_task",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub url: String,
    pub content: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub model: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_results: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { max_results: 10 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, ProviderError>;
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, prompt: &str, opts: &LlmOptions)
        -> Result<Completion, ProviderError>;
}

/// Discriminated call result. `Transient` means the retry budget is spent.
#[derive(Debug)]
pub enum CallOutcome<T> {
    Ok(T),
    Transient {
        attempts: u32,
        last_error: ProviderError,
    },
    Permanent(ProviderError),
    Degraded(String),
}

impl<T> CallOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok(_))
    }

    pub fn into_result(self) -> Result<T, CoreError> {
        match self {
            CallOutcome::Ok(value) => Ok(value),
            CallOutcome::Transient {
                attempts,
                last_error,
            } => Err(CoreError::ProviderTransient {
                attempts,
                last_error: last_error.to_string(),
            }),
            CallOutcome::Permanent(err) => Err(CoreError::ProviderPermanent(err.to_string())),
            CallOutcome::Degraded(reason) => Err(CoreError::ProviderDegraded(reason)),
        }
    }
}

pub struct ProviderGateway {
    providers: BTreeMap<ProviderId, Arc<dyn SearchProvider>>,
    reasoning_llm: Option<Arc<dyn LlmClient>>,
    task_llm: Option<Arc<dyn LlmClient>>,
    limiters: BTreeMap<String, ProviderLimiter>,
    fallback_limiter: ProviderLimiter,
    http: reqwest::Client,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl ProviderGateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Providers currently registered, in stable (enum) order. Fan-out
    /// phases iterate this set.
    pub fn enabled_providers(&self) -> Vec<ProviderId> {
        self.providers.keys().copied().collect()
    }

    pub async fn search(
        &self,
        provider: ProviderId,
        query: &str,
        opts: &SearchOptions,
    ) -> CallOutcome<Vec<SearchResult>> {
        let Some(client) = self.providers.get(&provider).cloned() else {
            return CallOutcome::Degraded(format!("provider {provider} is not enabled"));
        };

        let query = query.to_string();
        let opts = opts.clone();
        self.run_with_retry(provider.as_str(), move || {
            let client = Arc::clone(&client);
            let query = query.clone();
            let opts = opts.clone();
            async move { client.search(&query, &opts).await }
        })
        .await
    }

    /// Fetch a document over HTTP. Status codes map onto the taxonomy the
    /// same way provider responses do.
    pub async fn fetch(&self, url: &str) -> CallOutcome<Document> {
        let http = self.http.clone();
        let url = url.to_string();
        self.run_with_retry("fetch", move || {
            let http = http.clone();
            let url = url.clone();
            async move {
                let response = http.get(&url).send().await.map_err(ProviderError::from)?;
                let status = response.status();
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("text/plain")
                    .to_string();
                let body = response.text().await.map_err(ProviderError::from)?;
                if !status.is_success() {
                    return Err(ProviderError::from_status(status, body));
                }
                Ok(Document {
                    url,
                    content: body,
                    content_type,
                })
            }
        })
        .await
    }

    pub async fn llm_complete(
        &self,
        role: ModelRole,
        prompt: &str,
        opts: &LlmOptions,
    ) -> CallOutcome<Completion> {
        let client = match role {
            ModelRole::Reasoning => self.reasoning_llm.clone(),
            ModelRole::Task => self.task_llm.clone(),
        };
        let Some(client) = client else {
            return CallOutcome::Degraded(format!("no LLM configured for {role:?} role"));
        };

        let prompt = prompt.to_string();
        let opts = opts.clone();
        self.run_with_retry(role.limiter_key(), move || {
            let client = Arc::clone(&client);
            let prompt = prompt.clone();
            let opts = opts.clone();
            async move { client.complete(&prompt, &opts).await }
        })
        .await
    }

    fn limiter(&self, key: &str) -> &ProviderLimiter {
        self.limiters.get(key).unwrap_or(&self.fallback_limiter)
    }

    async fn run_with_retry<T, F, Fut>(&self, key: &str, mut call: F) -> CallOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;
        for attempt in 0..self.retry.max_attempts {
            let permit = self.limiter(key).acquire().await;
            let outcome = tokio::time::timeout(self.call_timeout, call()).await;
            drop(permit);

            let err = match outcome {
                Ok(Ok(value)) => return CallOutcome::Ok(value),
                Ok(Err(err)) => err,
                Err(_) => ProviderError::Timeout(self.call_timeout),
            };

            match err.classify() {
                ErrorClass::Degraded => return CallOutcome::Degraded(err.to_string()),
                ErrorClass::Permanent => return CallOutcome::Permanent(err),
                ErrorClass::Transient => {
                    debug!("{key} attempt {} failed transiently: {err}", attempt + 1);
                    last_error = Some(err);
                    if attempt + 1 < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                    }
                }
            }
        }

        CallOutcome::Transient {
            attempts: self.retry.max_attempts,
            last_error: last_error
                .unwrap_or_else(|| ProviderError::RequestFailed("retry budget empty".into())),
        }
    }
}

#[derive(Default)]
pub struct GatewayBuilder {
    providers: Vec<Arc<dyn SearchProvider>>,
    reasoning_llm: Option<Arc<dyn LlmClient>>,
    task_llm: Option<Arc<dyn LlmClient>>,
    retry: Option<RetryPolicy>,
    call_timeout: Option<Duration>,
}

impl GatewayBuilder {
    pub fn with_search_provider(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_reasoning_llm(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.reasoning_llm = Some(client);
        self
    }

    pub fn with_task_llm(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.task_llm = Some(client);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn build(self, config: &NexusConfig) -> ProviderGateway {
        let mut providers = BTreeMap::new();
        let mut limiters = BTreeMap::new();

        for provider in self.providers {
            let id = provider.id();
            limiters.insert(
                id.as_str().to_string(),
                ProviderLimiter::new(
                    config.provider_concurrency(id.as_str()),
                    config.provider_rps(id.as_str()),
                ),
            );
            providers.insert(id, provider);
        }
        for key in ["llm_reasoning", "llm_task", "fetch"] {
            limiters.insert(
                key.to_string(),
                ProviderLimiter::new(
                    config.provider_concurrency(key),
                    config.provider_rps(key),
                ),
            );
        }

        ProviderGateway {
            providers,
            reasoning_llm: self.reasoning_llm,
            task_llm: self.task_llm,
            limiters,
            fallback_limiter: ProviderLimiter::new(
                config.default_provider_concurrency,
                config.default_provider_rps,
            ),
            http: reqwest::Client::new(),
            retry: self.retry.unwrap_or(RetryPolicy {
                max_attempts: config.max_retries.max(1),
                base: config.retry_base,
                jitter: true,
            }),
            call_timeout: self.call_timeout.unwrap_or(DEFAULT_CALL_TIMEOUT),
        }
    }
}
