//! Dependency Provisioner
//!
//! Guarantees that the models a session needs are installed on their remote
//! services before the session's pipeline is built. State is process-wide: the
//! status cache and the single-flight table are shared by every session start.
//!
//! Concurrent `ensure` calls for the same (service, model) pair join one spawned
//! provisioning task and all observe its outcome. Only `Available` is sticky; a
//! failed model is checked again on the next call.

pub mod catalog;

pub use catalog::{CatalogError, ModelCatalog, OllamaCatalog, PullOutcome, SpeachesCatalog};

use crate::error::ProvisioningError;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The provisioning timeout used when callers have no better figure.
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Stt,
    Llm,
    Tts,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Stt => write!(f, "stt"),
            ModelKind::Llm => write!(f, "llm"),
            ModelKind::Tts => write!(f, "tts"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Unknown,
    Checking,
    Provisioning,
    Available,
    Failed,
}

/// Identity of a model for caching and de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub service: String,
    pub model_id: String,
}

/// A model a session depends on, and the service that hosts it.
#[derive(Clone)]
pub struct ModelDependency {
    pub service: Arc<dyn ModelCatalog>,
    pub model_id: String,
    pub kind: ModelKind,
}

impl ModelDependency {
    pub fn new(service: Arc<dyn ModelCatalog>, model_id: impl Into<String>, kind: ModelKind) -> Self {
        Self {
            service,
            model_id: model_id.into(),
            kind,
        }
    }

    pub fn key(&self) -> ModelKey {
        ModelKey {
            service: self.service.base_url(),
            model_id: self.model_id.clone(),
        }
    }
}

impl fmt::Debug for ModelDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDependency")
            .field("service", &self.service.base_url())
            .field("model_id", &self.model_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// How a successful `ensure` was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Already known to be available; no network call.
    Cached,
    /// Found in the service's catalog.
    Listed,
    /// The provisioning call reported the model already existed.
    AlreadyExisted,
    /// The provisioning call downloaded the model.
    Provisioned,
}

pub type ProvisionResult = Result<Availability, ProvisioningError>;

type SharedOutcome = Shared<BoxFuture<'static, ProvisionResult>>;

#[derive(Default)]
struct ProvisionerState {
    statuses: DashMap<ModelKey, ModelStatus>,
    inflight: DashMap<ModelKey, SharedOutcome>,
}

/// Process-wide provisioning gate. Construct once at startup and share it.
#[derive(Clone, Default)]
pub struct Provisioner {
    state: Arc<ProvisionerState>,
}

impl Provisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, key: &ModelKey) -> ModelStatus {
        self.state
            .statuses
            .get(key)
            .map(|s| *s)
            .unwrap_or(ModelStatus::Unknown)
    }

    /// Forgets a cached status so the next `ensure` checks the service again.
    pub fn invalidate(&self, key: &ModelKey) {
        if self.state.statuses.remove(key).is_some() {
            debug!(service = %key.service, model = %key.model_id, "model status invalidated");
        }
    }

    /// Makes sure `dep` is available on its service, waiting at most `timeout`.
    pub async fn ensure(&self, dep: &ModelDependency, timeout: Duration) -> ProvisionResult {
        let key = dep.key();
        if self.status(&key) == ModelStatus::Available {
            return Ok(Availability::Cached);
        }

        let outcome = match self.state.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!(model = %dep.model_id, kind = %dep.kind, "joining in-flight provisioning");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // A task may have finished between the status check and the entry lock.
                if self.status(&key) == ModelStatus::Available {
                    return Ok(Availability::Cached);
                }
                self.state.statuses.insert(key.clone(), ModelStatus::Checking);
                let outcome = self.launch(dep.clone(), key, timeout);
                entry.insert(outcome.clone());
                outcome
            }
        };
        outcome.await
    }

    /// Ensures every dependency concurrently. The first failure fails the whole gate.
    pub async fn ensure_all(
        &self,
        deps: &[ModelDependency],
        timeout: Duration,
    ) -> Result<(), ProvisioningError> {
        let results = join_all(deps.iter().map(|dep| self.ensure(dep, timeout))).await;
        for (dep, result) in deps.iter().zip(results) {
            if let Err(e) = result {
                warn!(model = %dep.model_id, kind = %dep.kind, error = %e, "dependency gate failed");
                return Err(e);
            }
        }
        Ok(())
    }

    fn launch(&self, dep: ModelDependency, key: ModelKey, timeout: Duration) -> SharedOutcome {
        let state = self.state.clone();
        let service = key.service.clone();
        let model = key.model_id.clone();

        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, resolve(&state, &dep, &key)).await {
                Ok(result) => result,
                Err(_) => Err(ProvisioningError::Timeout {
                    service: key.service.clone(),
                    model: key.model_id.clone(),
                    after: timeout,
                }),
            };
            match &result {
                Ok(availability) => {
                    info!(model = %key.model_id, kind = %dep.kind, ?availability, "model available");
                    state.statuses.insert(key.clone(), ModelStatus::Available);
                }
                Err(e) => {
                    warn!(model = %key.model_id, kind = %dep.kind, error = %e, "model provisioning failed");
                    state.statuses.insert(key.clone(), ModelStatus::Failed);
                }
            }
            state.inflight.remove(&key);
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(ProvisioningError::Transport {
                    service,
                    model,
                    reason: format!("provisioning task aborted: {e}"),
                })
            })
        }
        .boxed()
        .shared()
    }
}

async fn resolve(
    state: &ProvisionerState,
    dep: &ModelDependency,
    key: &ModelKey,
) -> ProvisionResult {
    info!(service = %key.service, model = %key.model_id, kind = %dep.kind, "checking model catalog");
    let installed = dep
        .service
        .list_models()
        .await
        .map_err(|e| catalog_failure(key, e))?;
    if installed.iter().any(|m| m == &key.model_id) {
        return Ok(Availability::Listed);
    }

    state.statuses.insert(key.clone(), ModelStatus::Provisioning);
    info!(model = %key.model_id, kind = %dep.kind, "model not installed, provisioning (this may take a few minutes)");
    let outcome = dep
        .service
        .provision(&key.model_id)
        .await
        .map_err(|e| catalog_failure(key, e))?;
    Ok(match outcome {
        PullOutcome::AlreadyExisted => Availability::AlreadyExisted,
        PullOutcome::Provisioned => Availability::Provisioned,
    })
}

fn catalog_failure(key: &ModelKey, err: CatalogError) -> ProvisioningError {
    if err.is_rejection() {
        ProvisioningError::Rejected {
            service: key.service.clone(),
            model: key.model_id.clone(),
            reason: err.to_string(),
        }
    } else {
        ProvisioningError::Transport {
            service: key.service.clone(),
            model: key.model_id.clone(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::catalog::MockModelCatalog;
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts network calls; provisioning takes `delay` and then returns `outcome`.
    struct SlowCatalog {
        base_url: &'static str,
        installed: Vec<String>,
        delay: Duration,
        fail_with: Option<u16>,
        list_calls: AtomicUsize,
        provision_calls: AtomicUsize,
    }

    impl SlowCatalog {
        fn new(delay: Duration) -> Self {
            Self {
                base_url: "http://speaches:8000",
                installed: vec![],
                delay,
                fail_with: None,
                list_calls: AtomicUsize::new(0),
                provision_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelCatalog for SlowCatalog {
        fn base_url(&self) -> String {
            self.base_url.to_string()
        }

        async fn list_models(&self) -> Result<Vec<String>, CatalogError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.installed.clone())
        }

        async fn provision(&self, _model_id: &str) -> Result<PullOutcome, CatalogError> {
            self.provision_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match self.fail_with {
                Some(status) => Err(CatalogError::Status {
                    status,
                    body: "pull failed".into(),
                }),
                None => Ok(PullOutcome::Provisioned),
            }
        }
    }

    fn mock_catalog(base_url: &'static str) -> MockModelCatalog {
        let mut catalog = MockModelCatalog::new();
        catalog
            .expect_base_url()
            .returning(move || base_url.to_string());
        catalog
    }

    #[tokio::test]
    async fn test_fast_path_skips_provisioning_and_caches() {
        let mut catalog = mock_catalog("http://ollama:11434");
        catalog
            .expect_list_models()
            .times(1)
            .returning(|| Ok(vec!["llama3.2:3b".to_string()]));
        catalog.expect_provision().times(0);

        let dep = ModelDependency::new(Arc::new(catalog), "llama3.2:3b", ModelKind::Llm);
        let provisioner = Provisioner::new();

        let first = provisioner.ensure(&dep, DEFAULT_PROVISION_TIMEOUT).await;
        assert_eq!(first, Ok(Availability::Listed));
        assert_eq!(provisioner.status(&dep.key()), ModelStatus::Available);

        let second = provisioner.ensure(&dep, DEFAULT_PROVISION_TIMEOUT).await;
        assert_eq!(second, Ok(Availability::Cached));
    }

    #[tokio::test]
    async fn test_slow_path_distinguishes_existing_and_fresh() {
        let mut catalog = mock_catalog("http://speaches:8000");
        catalog.expect_list_models().returning(|| Ok(vec![]));
        catalog
            .expect_provision()
            .withf(|model| model == "speaches-ai/Kokoro-82M-v1.0-ONNX")
            .times(1)
            .returning(|_| Ok(PullOutcome::AlreadyExisted));
        catalog
            .expect_provision()
            .withf(|model| model == "Systran/faster-distil-whisper-small.en")
            .times(1)
            .returning(|_| Ok(PullOutcome::Provisioned));

        let catalog: Arc<dyn ModelCatalog> = Arc::new(catalog);
        let tts = ModelDependency::new(
            catalog.clone(),
            "speaches-ai/Kokoro-82M-v1.0-ONNX",
            ModelKind::Tts,
        );
        let stt = ModelDependency::new(
            catalog,
            "Systran/faster-distil-whisper-small.en",
            ModelKind::Stt,
        );
        let provisioner = Provisioner::new();

        assert_eq!(
            provisioner.ensure(&tts, DEFAULT_PROVISION_TIMEOUT).await,
            Ok(Availability::AlreadyExisted)
        );
        assert_eq!(
            provisioner.ensure(&stt, DEFAULT_PROVISION_TIMEOUT).await,
            Ok(Availability::Provisioned)
        );
    }

    #[tokio::test]
    async fn test_rejected_and_transport_failures() {
        let mut catalog = mock_catalog("http://ollama:11434");
        catalog.expect_list_models().returning(|| Ok(vec![]));
        catalog.expect_provision().returning(|_| {
            Err(CatalogError::Status {
                status: 404,
                body: "file does not exist".into(),
            })
        });
        let dep = ModelDependency::new(Arc::new(catalog), "nope:1b", ModelKind::Llm);
        let provisioner = Provisioner::new();

        let err = provisioner
            .ensure(&dep, DEFAULT_PROVISION_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Rejected { .. }));
        assert_eq!(provisioner.status(&dep.key()), ModelStatus::Failed);

        let mut unreachable = mock_catalog("http://ollama:11434");
        unreachable
            .expect_list_models()
            .returning(|| Err(CatalogError::Malformed("connection refused".into())));
        let dep = ModelDependency::new(Arc::new(unreachable), "llama3.2:3b", ModelKind::Llm);
        let err = provisioner
            .ensure(&dep, DEFAULT_PROVISION_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_ensures_share_one_provisioning_call() {
        let catalog = Arc::new(SlowCatalog::new(Duration::from_millis(50)));
        let dep = ModelDependency::new(catalog.clone(), "speaches-ai/Kokoro-82M-v1.0-ONNX", ModelKind::Tts);
        let provisioner = Provisioner::new();

        let results = join_all((0..8).map(|_| provisioner.ensure(&dep, DEFAULT_PROVISION_TIMEOUT))).await;

        assert_eq!(catalog.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.provision_calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| *r == Ok(Availability::Provisioned)));
        assert_eq!(provisioner.status(&dep.key()), ModelStatus::Available);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_reach_every_waiter_once() {
        let mut slow = SlowCatalog::new(Duration::from_millis(50));
        slow.fail_with = Some(500);
        let catalog = Arc::new(slow);
        let dep = ModelDependency::new(catalog.clone(), "llama3.2:3b", ModelKind::Llm);
        let provisioner = Provisioner::new();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let provisioner = provisioner.clone();
                let dep = dep.clone();
                tokio::spawn(async move { provisioner.ensure(&dep, DEFAULT_PROVISION_TIMEOUT).await })
            })
            .collect();
        let results: Vec<ProvisionResult> = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(catalog.provision_calls.load(Ordering::SeqCst), 1);
        let first = results[0].clone();
        assert!(matches!(first, Err(ProvisioningError::Transport { .. })));
        assert!(results.iter().all(|r| *r == first));

        // Failure is not sticky: the next call goes back to the service.
        let _ = provisioner.ensure(&dep, DEFAULT_PROVISION_TIMEOUT).await;
        assert_eq!(catalog.provision_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_to_failed() {
        let catalog = Arc::new(SlowCatalog::new(Duration::from_secs(3600)));
        let dep = ModelDependency::new(catalog, "llama3.2:3b", ModelKind::Llm);
        let provisioner = Provisioner::new();

        let err = provisioner
            .ensure(&dep, Duration::from_secs(600))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProvisioningError::Timeout {
                service: "http://speaches:8000".into(),
                model: "llama3.2:3b".into(),
                after: Duration::from_secs(600),
            }
        );
        assert_eq!(provisioner.status(&dep.key()), ModelStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalidate_forces_recheck() {
        let mut catalog = mock_catalog("http://ollama:11434");
        catalog
            .expect_list_models()
            .times(2)
            .returning(|| Ok(vec!["llama3.2:3b".to_string()]));
        let dep = ModelDependency::new(Arc::new(catalog), "llama3.2:3b", ModelKind::Llm);
        let provisioner = Provisioner::new();

        provisioner.ensure(&dep, DEFAULT_PROVISION_TIMEOUT).await.unwrap();
        provisioner.invalidate(&dep.key());
        assert_eq!(provisioner.status(&dep.key()), ModelStatus::Unknown);
        assert_eq!(
            provisioner.ensure(&dep, DEFAULT_PROVISION_TIMEOUT).await,
            Ok(Availability::Listed)
        );
    }

    #[tokio::test]
    async fn test_ensure_all_is_all_or_nothing() {
        let mut speaches = mock_catalog("http://speaches:8000");
        speaches
            .expect_list_models()
            .returning(|| Ok(vec!["Systran/faster-distil-whisper-small.en".to_string()]));
        speaches.expect_provision().returning(|_| {
            Err(CatalogError::Status {
                status: 404,
                body: "unknown model".into(),
            })
        });
        let speaches: Arc<dyn ModelCatalog> = Arc::new(speaches);
        let deps = vec![
            ModelDependency::new(
                speaches.clone(),
                "Systran/faster-distil-whisper-small.en",
                ModelKind::Stt,
            ),
            ModelDependency::new(speaches, "missing-tts", ModelKind::Tts),
        ];
        let provisioner = Provisioner::new();

        let err = provisioner
            .ensure_all(&deps, DEFAULT_PROVISION_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.model(), "missing-tts");
        assert_eq!(provisioner.status(&deps[0].key()), ModelStatus::Available);
    }
}
