//! Test utilities for routing tests
//!
//! [`ScriptedFactory`] hands out adapters whose responses are scripted per
//! (provider, model) or per (provider, model, credential), and records every
//! call so tests can assert on exactly which candidates were tried.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::config::ProviderConfig;
use super::connection_pool::AdapterFactory;
use super::credentials::{fingerprint, Credential};
use crate::backend::{AdapterError, ChatMessage, Completion, FailureKind, ProviderAdapter};

/// What a scripted adapter does on one call
#[derive(Clone, Debug)]
pub enum StepOutcome {
    Succeed(String),
    Fail(FailureKind),
    /// Never completes
    Hang,
    /// Wait, then behave like the inner outcome
    Delay(Duration, Box<StepOutcome>),
}

impl StepOutcome {
    pub fn succeed(content: impl Into<String>) -> Self {
        Self::Succeed(content.into())
    }

    pub fn fail(kind: FailureKind) -> Self {
        Self::Fail(kind)
    }

    pub fn delayed(delay: Duration, then: StepOutcome) -> Self {
        Self::Delay(delay, Box::new(then))
    }
}

/// One recorded adapter call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallRecord {
    pub provider: String,
    pub model: String,
    pub credential: String,
}

type ScriptKey = (String, String, Option<String>);

#[derive(Default)]
struct ScriptState {
    queued: Mutex<HashMap<ScriptKey, VecDeque<StepOutcome>>>,
    always: Mutex<HashMap<ScriptKey, StepOutcome>>,
    calls: Mutex<Vec<CallRecord>>,
    failing_construction: Mutex<HashSet<String>>,
    builds: AtomicUsize,
    released: AtomicUsize,
}

impl ScriptState {
    fn next_outcome(&self, provider: &str, model: &str, credential: &str) -> StepOutcome {
        let specific = (provider.to_string(), model.to_string(), Some(credential.to_string()));
        let general = (provider.to_string(), model.to_string(), None);

        {
            let mut queued = self.queued.lock();
            for key in [&specific, &general] {
                if let Some(step) = queued.get_mut(key).and_then(VecDeque::pop_front) {
                    return step;
                }
            }
        }

        let always = self.always.lock();
        always
            .get(&specific)
            .or_else(|| always.get(&general))
            .cloned()
            .unwrap_or_else(|| StepOutcome::Succeed(format!("ok from {provider}/{model}")))
    }
}

/// Adapter factory with scripted behavior
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    state: Arc<ScriptState>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for every credential of a provider model
    pub fn script(
        &self,
        provider: &str,
        model: &str,
        steps: impl IntoIterator<Item = StepOutcome>,
    ) -> &Self {
        self.state
            .queued
            .lock()
            .entry((provider.to_string(), model.to_string(), None))
            .or_default()
            .extend(steps);
        self
    }

    /// Queue outcomes for one credential (by secret) of a provider model
    pub fn script_credential(
        &self,
        provider: &str,
        model: &str,
        secret: &str,
        steps: impl IntoIterator<Item = StepOutcome>,
    ) -> &Self {
        self.state
            .queued
            .lock()
            .entry((
                provider.to_string(),
                model.to_string(),
                Some(fingerprint(secret)),
            ))
            .or_default()
            .extend(steps);
        self
    }

    /// Behavior once the queue for a provider model is drained
    pub fn always(&self, provider: &str, model: &str, step: StepOutcome) -> &Self {
        self.state
            .always
            .lock()
            .insert((provider.to_string(), model.to_string(), None), step);
        self
    }

    pub fn fail_construction(&self, provider: &str) -> &Self {
        self.state
            .failing_construction
            .lock()
            .insert(provider.to_string());
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.lock().len()
    }

    pub fn build_count(&self) -> usize {
        self.state.builds.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }
}

impl AdapterFactory for ScriptedFactory {
    fn build(
        &self,
        provider: &ProviderConfig,
        model: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn ProviderAdapter>, AdapterError> {
        if self.state.failing_construction.lock().contains(&provider.name) {
            return Err(AdapterError::other("scripted construction failure"));
        }
        self.state.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedAdapter {
            provider: provider.name.clone(),
            model: model.to_string(),
            credential: credential.fingerprint().to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedAdapter {
    provider: String,
    model: String,
    credential: String,
    state: Arc<ScriptState>,
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn process(&self, _messages: &[ChatMessage]) -> Result<Completion, AdapterError> {
        self.state.calls.lock().push(CallRecord {
            provider: self.provider.clone(),
            model: self.model.clone(),
            credential: self.credential.clone(),
        });

        let mut step = self
            .state
            .next_outcome(&self.provider, &self.model, &self.credential);
        loop {
            match step {
                StepOutcome::Succeed(content) => return Ok(Completion::text(content)),
                StepOutcome::Fail(kind) => {
                    return Err(AdapterError::new(kind, format!("scripted {kind}")))
                }
                StepOutcome::Hang => {
                    return std::future::pending::<Result<Completion, AdapterError>>().await
                }
                StepOutcome::Delay(delay, next) => {
                    tokio::time::sleep(delay).await;
                    step = *next;
                }
            }
        }
    }

    fn release(&self) {
        self.state.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Provider with one credential per secret and the given models
pub fn provider(name: &str, models: &[&str], secrets: &[&str]) -> ProviderConfig {
    let mut config = ProviderConfig::new(name, super::config::ApiKind::OpenaiCompatible)
        .with_models(models.iter().copied());
    for secret in secrets {
        config = config.with_credential(*secret);
    }
    config
}
