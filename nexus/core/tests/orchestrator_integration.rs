//! End-to-end routing scenarios through the public API
//!
//! Each test wires an [`Orchestrator`] to a mock adapter factory and drives
//! it the way an embedding application would.
//!
//! Run with: cargo test -p nexus-core --test orchestrator_integration

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::task::JoinSet;
use tokio_test::{assert_pending, assert_ready};
use tokio_util::sync::CancellationToken;

use nexus_core::routing::{fingerprint, Credential};
use nexus_core::{
    AdapterError, AdapterFactory, ApiKind, AttemptOutcome, CandidateKey, ChatMessage, Completion,
    CredentialStatus, FailureKind, GenerateRequest, Orchestrator, PerformanceLedger,
    ProviderAdapter, ProviderConfig, RouterConfig, RouterError, RouterTuning,
};

// ============================================================================
// Mock backend
// ============================================================================

/// Behavior is keyed on the secret and model name:
/// - secret `bad-key` is rejected as an invalid credential
/// - model `hang` never answers
/// - model `flaky` fails with `Other` until the factory is marked healthy
#[derive(Default)]
struct MockBackend {
    calls: AtomicUsize,
    bad_key_calls: AtomicUsize,
    healthy: AtomicBool,
}

impl MockBackend {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct MockFactory(Arc<MockBackend>);

struct MockAdapter {
    backend: Arc<MockBackend>,
    provider: String,
    model: String,
    secret: String,
}

impl AdapterFactory for MockFactory {
    fn build(
        &self,
        provider: &ProviderConfig,
        model: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn ProviderAdapter>, AdapterError> {
        Ok(Arc::new(MockAdapter {
            backend: Arc::clone(&self.0),
            provider: provider.name.clone(),
            model: model.to_string(),
            secret: credential.secret().to_string(),
        }))
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn process(&self, _messages: &[ChatMessage]) -> Result<Completion, AdapterError> {
        self.backend.calls.fetch_add(1, Ordering::SeqCst);

        if self.secret == "bad-key" {
            self.backend.bad_key_calls.fetch_add(1, Ordering::SeqCst);
            return Err(AdapterError::from_http(401, "invalid api key"));
        }
        match self.model.as_str() {
            "hang" => std::future::pending().await,
            "flaky" if !self.backend.healthy.load(Ordering::SeqCst) => {
                Err(AdapterError::other("upstream unavailable"))
            }
            _ => Ok(Completion::text(format!("{}/{}", self.provider, self.model))),
        }
    }
}

fn router(config: &RouterConfig, backend: &Arc<MockBackend>) -> Arc<Orchestrator> {
    router_with_ledger(config, backend, PerformanceLedger::new(config.tuning.ema_alpha))
}

fn router_with_ledger(
    config: &RouterConfig,
    backend: &Arc<MockBackend>,
    ledger: PerformanceLedger,
) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        config,
        Arc::new(ledger),
        Arc::new(MockFactory(Arc::clone(backend))),
    ))
}

fn provider(name: &str, model: &str, secret: &str) -> ProviderConfig {
    ProviderConfig::new(name, ApiKind::OpenaiCompatible)
        .with_model(model)
        .with_credential(secret)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn revoked_key_fails_over_to_sibling_key() {
    let backend = Arc::new(MockBackend::default());
    let config = RouterConfig::default()
        .in_memory()
        .with_provider(provider("a", "m", "bad-key").with_credential("good-key"));
    let router = router(&config, &backend);

    let response = router.generate_text(GenerateRequest::prompt("hi")).await;

    assert!(response.success);
    assert_eq!(response.provider_used.as_deref(), Some("a"));
    assert_eq!(response.fallback_path.len(), 2);
    assert_eq!(
        response.fallback_path[0].outcome,
        AttemptOutcome::Failed(FailureKind::InvalidCredential)
    );
    assert_eq!(response.fallback_path[1].credential, fingerprint("good-key"));

    for _ in 0..3 {
        assert!(router.generate_text(GenerateRequest::prompt("again")).await.success);
    }
    assert_eq!(backend.bad_key_calls.load(Ordering::SeqCst), 1);

    let snapshot = router.credential_snapshot();
    let (_, credentials) = &snapshot[0];
    let revoked = credentials
        .iter()
        .find(|c| c.fingerprint == fingerprint("bad-key"))
        .unwrap();
    assert_eq!(revoked.status, CredentialStatus::Quarantined);
}

#[tokio::test(start_paused = true)]
async fn circuit_breaker_skips_failing_history() {
    let backend = Arc::new(MockBackend::default());
    let config = RouterConfig::default()
        .in_memory()
        .with_provider(provider("a", "m", "k-a").with_weights(1.5, 1.0, 1.0))
        .with_provider(provider("b", "m", "k-b"));

    let ledger = PerformanceLedger::new(config.tuning.ema_alpha);
    let broken = CandidateKey::new("a", "m", fingerprint("k-a"));
    for _ in 0..11 {
        ledger.record_failure(&broken, 100.0, FailureKind::Other);
    }
    let router = router_with_ledger(&config, &backend, ledger);

    let response = router.generate_text(GenerateRequest::prompt("hi")).await;

    assert!(response.success);
    assert_eq!(response.provider_used.as_deref(), Some("b"));
    assert_eq!(response.fallback_path.len(), 1);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn fleet_outage_sleeps_then_recovers() {
    let backend = Arc::new(MockBackend::default());
    let tuning = RouterTuning {
        sleep_duration: Duration::from_secs(10),
        ..RouterTuning::default()
    };
    let config = RouterConfig::default()
        .in_memory()
        .with_tuning(tuning)
        .with_provider(provider("a", "flaky", "k-a"));
    let router = router(&config, &backend);

    let outage = router.generate_text(GenerateRequest::prompt("hi")).await;
    assert_eq!(outage.error, Some(RouterError::NoViableCandidate));
    assert_eq!(outage.fallback_path.len(), 1);
    assert!(router.is_sleeping());

    let rejected = router.generate_text(GenerateRequest::prompt("hi")).await;
    assert!(matches!(rejected.error, Some(RouterError::CoolingDown { .. })));
    assert_eq!(backend.calls(), 1);

    backend.healthy.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(11)).await;

    let recovered = router.generate_text(GenerateRequest::prompt("hi")).await;
    assert!(recovered.success, "{recovered:?}");
    assert!(!router.is_sleeping());
}

#[tokio::test]
async fn concurrent_requests_share_one_router() {
    let backend = Arc::new(MockBackend::default());
    let config = RouterConfig::default()
        .in_memory()
        .with_provider(provider("a", "m", "k-a"))
        .with_provider(provider("b", "m", "k-b"));
    let router = router(&config, &backend);

    let mut tasks = JoinSet::new();
    for i in 0..16 {
        let router = Arc::clone(&router);
        tasks.spawn(async move {
            router
                .generate_text(GenerateRequest::prompt(format!("request {i}")))
                .await
        });
    }

    let mut served = 0;
    while let Some(joined) = tasks.join_next().await {
        assert!(joined.unwrap().success);
        served += 1;
    }

    assert_eq!(served, 16);
    assert_eq!(backend.calls(), 16);
    let recorded: u64 = router
        .ledger()
        .snapshot()
        .values()
        .map(|record| record.total_calls())
        .sum();
    assert_eq!(recorded, 16);
}

#[tokio::test]
async fn cancellation_resolves_a_stuck_request() {
    let backend = Arc::new(MockBackend::default());
    let config = RouterConfig::default()
        .in_memory()
        .with_provider(provider("a", "hang", "k-a"));
    let router = router(&config, &backend);
    let cancel = CancellationToken::new();

    let mut request = tokio_test::task::spawn({
        let router = Arc::clone(&router);
        let cancel = cancel.clone();
        async move {
            router
                .generate_text_with_cancel(GenerateRequest::prompt("hi"), &cancel)
                .await
        }
    });

    assert_pending!(request.poll());
    assert_eq!(backend.calls(), 1);

    cancel.cancel();
    assert!(request.is_woken());
    let response = assert_ready!(request.poll());

    assert_eq!(response.error, Some(RouterError::Cancelled));
    assert!(!router.is_sleeping());
    assert_eq!(router.ledger().len(), 0);
}

#[tokio::test]
async fn ledger_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("performance_db.json");
    let backend = Arc::new(MockBackend::default());

    let mut config = RouterConfig::default().with_provider(provider("a", "m", "k-a"));
    config.persistence.path = Some(path.clone());

    let first = router(&config, &backend);
    first.spawn_background();
    for _ in 0..3 {
        assert!(first.generate_text(GenerateRequest::prompt("hi")).await.success);
    }
    first.shutdown().await.unwrap();

    let reloaded = PerformanceLedger::load(&path, config.tuning.ema_alpha)
        .await
        .unwrap();
    let key = CandidateKey::new("a", "m", fingerprint("k-a"));
    let record = reloaded.record_for(&key).unwrap();
    assert_eq!(record.success_count, 3);
    assert_eq!(record.failure_count, 0);

    let second = router_with_ledger(&config, &backend, reloaded);
    assert_eq!(second.ledger().metrics(&key).total_calls, 3);
}
