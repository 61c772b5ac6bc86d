//! Deterministic providers for hermetic tests and the CLI demo mode.
//!
//! These replay scripted responses, optionally with leading failures to
//! exercise retry paths, and never touch the network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    Completion, LlmClient, LlmOptions, ProviderError, SearchOptions, SearchProvider, SearchResult,
};
use crate::model::ProviderId;

/// Search provider that returns canned results. Without explicit results it
/// synthesizes a small, stable result set per query so fan-out pipelines
/// have distinct URLs to dedupe.
pub struct ScriptedSearchProvider {
    id: ProviderId,
    results: Option<Vec<SearchResult>>,
    failures: Mutex<VecDeque<ProviderError>>,
    disabled: bool,
    delay: Option<std::time::Duration>,
    calls: AtomicU32,
}

impl ScriptedSearchProvider {
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            results: None,
            failures: Mutex::new(VecDeque::new()),
            disabled: false,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Sleep before responding, for cancellation and timeout tests.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// A provider with no key configured: every call reports degraded.
    pub fn disabled(id: ProviderId) -> Self {
        let mut provider = Self::new(id);
        provider.disabled = true;
        provider
    }

    pub fn with_results(mut self, results: Vec<SearchResult>) -> Self {
        self.results = Some(results);
        self
    }

    /// Inject `count` leading failures before the script succeeds.
    pub fn failing_first(self, count: usize, error: ProviderError) -> Self {
        {
            let mut failures = self.failures.lock().unwrap();
            for _ in 0..count {
                failures.push_back(error.clone());
            }
        }
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    fn synthesize(&self, query: &str, max_results: usize) -> Vec<SearchResult> {
        let slug: String = query
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect();
        (0..max_results.min(3))
            .map(|i| SearchResult {
                url: format!("https://{}.example/{}/{}", self.id, slug, i),
                title: format!("{query} — result {i}"),
                snippet: format!("Synthesized finding {i} for '{query}'."),
            })
            .collect()
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearchProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.disabled {
            return Err(ProviderError::Disabled(format!(
                "{} has no API key configured",
                self.id
            )));
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        Ok(match &self.results {
            Some(results) => results.clone(),
            None => self.synthesize(query, opts.max_results),
        })
    }
}

enum Responder {
    Text(String),
    /// Computes the response from the prompt, so scripted output can echo
    /// runtime ids the prompt carries.
    Handler(Box<dyn Fn(&str) -> String + Send + Sync>),
}

/// LLM that routes on prompt content: the first rule whose pattern appears
/// in the prompt wins, else the default response.
pub struct ScriptedLlm {
    model: String,
    rules: Vec<(String, Responder)>,
    default: Option<String>,
    failures: Mutex<VecDeque<ProviderError>>,
    calls: AtomicU32,
}

impl ScriptedLlm {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            rules: Vec::new(),
            default: None,
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_rule(mut self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules
            .push((pattern.into(), Responder::Text(response.into())));
        self
    }

    pub fn with_handler(
        mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.rules
            .push((pattern.into(), Responder::Handler(Box::new(handler))));
        self
    }

    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default = Some(response.into());
        self
    }

    pub fn failing_first(self, count: usize, error: ProviderError) -> Self {
        {
            let mut failures = self.failures.lock().unwrap();
            for _ in 0..count {
                failures.push_back(error.clone());
            }
        }
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &str,
        _opts: &LlmOptions,
    ) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let text = self
            .rules
            .iter()
            .find(|(pattern, _)| prompt.contains(pattern.as_str()))
            .map(|(_, responder)| match responder {
                Responder::Text(text) => text.clone(),
                Responder::Handler(handler) => handler(prompt),
            })
            .or_else(|| self.default.clone())
            .ok_or_else(|| {
                let mut end = prompt.len().min(80);
                while end > 0 && !prompt.is_char_boundary(end) {
                    end -= 1;
                }
                ProviderError::RequestFailed(format!(
                    "no scripted response matches prompt: {}",
                    &prompt[..end]
                ))
            })?;

        Ok(Completion {
            model: self.model.clone(),
            text,
        })
    }
}
