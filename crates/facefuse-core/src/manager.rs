//! Model lifecycle: lazily loads one operator per role through an ordered
//! fallback cascade and hands out borrowed handles.
//!
//! Each role has its own `OnceCell`, so concurrent first callers for the same
//! role share a single in-flight load and independent roles never wait on
//! each other. The outcome of a load, failure included, stays cached until
//! [`ModelManager::cleanup`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::Config;
use crate::device::{DeviceProfile, ExecutionProvider};
use crate::onnx::OnnxBackend;
use crate::operators::{FaceAnalysis, RestorationOperator, SwapOperator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Detector,
    Swapper,
    Restorer,
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelRole::Detector => "detector",
            ModelRole::Swapper => "swapper",
            ModelRole::Restorer => "restorer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStage {
    /// Profile providers, network-enabled acquisition, full module set.
    Preferred,
    /// CPU only, network-enabled acquisition, reduced analysis modules.
    CpuFallback,
    /// CPU only, the model directory path, no acquisition.
    LocalFile,
}

/// How a stage may obtain model files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Cache, then model directory, then download.
    Network,
    /// Model directory only.
    LocalOnly,
}

/// Which analysis sub-models to load. Ignored by the other roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSet {
    Full,
    DetectionRecognition,
}

/// One attempt in a role's fallback cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    pub role: ModelRole,
    pub stage: LoadStage,
    pub providers: Vec<ExecutionProvider>,
    pub acquisition: Acquisition,
    pub modules: ModuleSet,
}

impl LoadPlan {
    /// Whether any provider in this plan is a hardware accelerator.
    pub fn is_accelerated(&self) -> bool {
        self.providers.iter().any(ExecutionProvider::is_accelerated)
    }
}

/// The ordered cascade for `role` under `profile`.
pub fn load_plans(role: ModelRole, profile: &DeviceProfile) -> Vec<LoadPlan> {
    let reduced = match role {
        ModelRole::Detector => ModuleSet::DetectionRecognition,
        _ => ModuleSet::Full,
    };
    vec![
        LoadPlan {
            role,
            stage: LoadStage::Preferred,
            providers: profile.execution_providers.clone(),
            acquisition: Acquisition::Network,
            modules: ModuleSet::Full,
        },
        LoadPlan {
            role,
            stage: LoadStage::CpuFallback,
            providers: vec![ExecutionProvider::Cpu],
            acquisition: Acquisition::Network,
            modules: reduced,
        },
        LoadPlan {
            role,
            stage: LoadStage::LocalFile,
            providers: vec![ExecutionProvider::Cpu],
            acquisition: Acquisition::LocalOnly,
            modules: reduced,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub stage: LoadStage,
    pub reason: String,
}

fn summarize(failures: &[StageFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{:?}: {}", f.stage, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelLoadError {
    #[error("{role} model unavailable ({})", summarize(.failures))]
    Exhausted {
        role: ModelRole,
        failures: Vec<StageFailure>,
    },
    #[error("{role} load task aborted: {reason}")]
    Aborted { role: ModelRole, reason: String },
}

impl ModelLoadError {
    pub fn role(&self) -> ModelRole {
        match self {
            ModelLoadError::Exhausted { role, .. } | ModelLoadError::Aborted { role, .. } => *role,
        }
    }
}

/// Error type returned by a [`ModelBackend`] stage.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Builds operators for one load plan. Called on the blocking pool.
pub trait ModelBackend: Send + Sync {
    fn load_analyzer(&self, plan: &LoadPlan) -> Result<Box<dyn FaceAnalysis>, BackendError>;
    fn load_swapper(&self, plan: &LoadPlan) -> Result<Box<dyn SwapOperator>, BackendError>;
    fn load_restorer(&self, plan: &LoadPlan) -> Result<Box<dyn RestorationOperator>, BackendError>;
}

/// Borrowed operator for one role. Never outlives the manager.
pub enum ModelHandle<'a> {
    Detector(&'a dyn FaceAnalysis),
    Swapper(&'a dyn SwapOperator),
    /// `None` when every restorer stage failed.
    Restorer(Option<&'a dyn RestorationOperator>),
}

impl ModelHandle<'_> {
    pub fn role(&self) -> ModelRole {
        match self {
            ModelHandle::Detector(_) => ModelRole::Detector,
            ModelHandle::Swapper(_) => ModelRole::Swapper,
            ModelHandle::Restorer(_) => ModelRole::Restorer,
        }
    }
}

impl fmt::Debug for ModelHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelHandle::Restorer(None) => write!(f, "ModelHandle::Restorer(unavailable)"),
            other => write!(f, "ModelHandle::{:?}", other.role()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RoleState {
    NotLoaded,
    Loaded,
    Failed(String),
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleStatus {
    pub role: ModelRole,
    #[serde(flatten)]
    pub state: RoleState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub device: DeviceProfile,
    pub roles: Vec<RoleStatus>,
}

type Slot<T> = OnceCell<Result<Box<T>, ModelLoadError>>;

pub struct ModelManager {
    profile: DeviceProfile,
    backend: Arc<dyn ModelBackend>,
    analyzer: Slot<dyn FaceAnalysis>,
    swapper: Slot<dyn SwapOperator>,
    restorer: OnceCell<Option<Box<dyn RestorationOperator>>>,
}

impl ModelManager {
    pub fn new(profile: DeviceProfile, backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            profile,
            backend,
            analyzer: OnceCell::new(),
            swapper: OnceCell::new(),
            restorer: OnceCell::new(),
        }
    }

    /// Resolve the device once and wire the ONNX backend from `config`.
    pub fn from_config(config: &Config) -> Self {
        let profile = DeviceProfile::detect(config.device);
        Self::new(profile, Arc::new(OnnxBackend::new(config)))
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub async fn analyzer(&self) -> Result<&dyn FaceAnalysis, ModelLoadError> {
        let slot = self
            .analyzer
            .get_or_init(|| self.load_role(ModelRole::Detector, |b, p| b.load_analyzer(p)))
            .await;
        match slot {
            Ok(op) => Ok(op.as_ref()),
            Err(e) => Err(e.clone()),
        }
    }

    pub async fn swapper(&self) -> Result<&dyn SwapOperator, ModelLoadError> {
        let slot = self
            .swapper
            .get_or_init(|| self.load_role(ModelRole::Swapper, |b, p| b.load_swapper(p)))
            .await;
        match slot {
            Ok(op) => Ok(op.as_ref()),
            Err(e) => Err(e.clone()),
        }
    }

    /// The restorer, or `None` once its whole cascade has failed.
    pub async fn restorer(&self) -> Option<&dyn RestorationOperator> {
        self.restorer
            .get_or_init(|| async {
                match self
                    .load_role(ModelRole::Restorer, |b, p| b.load_restorer(p))
                    .await
                {
                    Ok(op) => Some(op),
                    Err(e) => {
                        tracing::warn!(error = %e, "restoration model unavailable, classical path will be used");
                        None
                    }
                }
            })
            .await
            .as_deref()
    }

    pub async fn get(&self, role: ModelRole) -> Result<ModelHandle<'_>, ModelLoadError> {
        Ok(match role {
            ModelRole::Detector => ModelHandle::Detector(self.analyzer().await?),
            ModelRole::Swapper => ModelHandle::Swapper(self.swapper().await?),
            ModelRole::Restorer => ModelHandle::Restorer(self.restorer().await),
        })
    }

    /// Warm every role concurrently. Fails only when the detector or the
    /// swapper cannot be loaded.
    pub async fn initialize(&self) -> Result<(), ModelLoadError> {
        let (analyzer, swapper, restorer) =
            tokio::join!(self.analyzer(), self.swapper(), self.restorer());
        analyzer?;
        swapper?;
        tracing::info!(
            restorer = restorer.is_some(),
            backend = ?self.profile.backend,
            "models initialized"
        );
        Ok(())
    }

    /// Drop every handle; the next access loads from scratch.
    pub fn cleanup(&mut self) {
        let released = [
            self.analyzer.take().is_some(),
            self.swapper.take().is_some(),
            self.restorer.take().is_some(),
        ];
        tracing::info!(
            released = released.iter().filter(|r| **r).count(),
            "model handles released"
        );
    }

    pub fn status(&self) -> ManagerStatus {
        fn state<T: ?Sized>(slot: &Slot<T>) -> RoleState {
            match slot.get() {
                None => RoleState::NotLoaded,
                Some(Ok(_)) => RoleState::Loaded,
                Some(Err(e)) => RoleState::Failed(e.to_string()),
            }
        }

        let restorer = match self.restorer.get() {
            None => RoleState::NotLoaded,
            Some(Some(_)) => RoleState::Loaded,
            Some(None) => RoleState::Unavailable,
        };

        ManagerStatus {
            device: self.profile.clone(),
            roles: vec![
                RoleStatus {
                    role: ModelRole::Detector,
                    state: state(&self.analyzer),
                },
                RoleStatus {
                    role: ModelRole::Swapper,
                    state: state(&self.swapper),
                },
                RoleStatus {
                    role: ModelRole::Restorer,
                    state: restorer,
                },
            ],
        }
    }

    async fn load_role<T, F>(&self, role: ModelRole, load: F) -> Result<T, ModelLoadError>
    where
        T: Send + 'static,
        F: Fn(&dyn ModelBackend, &LoadPlan) -> Result<T, BackendError> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let plans = load_plans(role, &self.profile);
        let started = Instant::now();

        let joined = tokio::task::spawn_blocking(move || {
            run_cascade(role, &plans, |plan| load(backend.as_ref(), plan))
        })
        .await;

        match joined {
            Ok(Ok(op)) => {
                tracing::info!(
                    %role,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model ready"
                );
                Ok(op)
            }
            Ok(Err(failures)) => Err(ModelLoadError::Exhausted { role, failures }),
            Err(e) => Err(ModelLoadError::Aborted {
                role,
                reason: e.to_string(),
            }),
        }
    }
}

/// Try each plan in order; the first success wins.
fn run_cascade<T>(
    role: ModelRole,
    plans: &[LoadPlan],
    mut load: impl FnMut(&LoadPlan) -> Result<T, BackendError>,
) -> Result<T, Vec<StageFailure>> {
    let mut failures = Vec::new();
    for plan in plans {
        tracing::debug!(%role, stage = ?plan.stage, providers = ?plan.providers, "loading model");
        match load(plan) {
            Ok(op) => {
                tracing::info!(%role, stage = ?plan.stage, providers = ?plan.providers, "model loaded");
                return Ok(op);
            }
            Err(e) => {
                tracing::warn!(%role, stage = ?plan.stage, error = %e, "model load stage failed");
                failures.push(StageFailure {
                    stage: plan.stage,
                    reason: e.to_string(),
                });
            }
        }
    }
    Err(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use std::time::Duration;

    fn manager(backend: &Arc<FakeBackend>) -> ModelManager {
        ModelManager::new(DeviceProfile::cpu(), backend.clone())
    }

    #[test]
    fn test_load_plans_for_gpu_profile() {
        let profile = DeviceProfile::for_backend(crate::device::Backend::Gpu);
        let plans = load_plans(ModelRole::Detector, &profile);
        let stages: Vec<_> = plans.iter().map(|p| p.stage).collect();
        assert_eq!(
            stages,
            vec![LoadStage::Preferred, LoadStage::CpuFallback, LoadStage::LocalFile]
        );
        assert_eq!(
            plans[0].providers,
            vec![ExecutionProvider::Cuda, ExecutionProvider::Cpu]
        );
        assert_eq!(plans[0].modules, ModuleSet::Full);
        assert_eq!(plans[1].providers, vec![ExecutionProvider::Cpu]);
        assert_eq!(plans[1].modules, ModuleSet::DetectionRecognition);
        assert_eq!(plans[2].acquisition, Acquisition::LocalOnly);

        let accelerated: Vec<_> = plans.iter().map(LoadPlan::is_accelerated).collect();
        assert_eq!(accelerated, vec![true, false, false]);
    }

    #[test]
    fn test_load_plans_keep_full_modules_for_swapper() {
        let plans = load_plans(ModelRole::Swapper, &DeviceProfile::cpu());
        assert!(plans.iter().all(|p| p.modules == ModuleSet::Full));
    }

    #[tokio::test]
    async fn test_concurrent_first_access_loads_once() {
        let backend = Arc::new(FakeBackend::new().with_delay_ms(50));
        let m = manager(&backend);

        let (a, b, c, d) = tokio::join!(m.analyzer(), m.analyzer(), m.analyzer(), m.analyzer());
        let ptrs: Vec<*const ()> = [a, b, c, d]
            .into_iter()
            .map(|r| r.unwrap() as *const dyn FaceAnalysis as *const ())
            .collect();

        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(backend.load_count(ModelRole::Detector), 1);
    }

    #[tokio::test]
    async fn test_concurrent_access_across_tasks_loads_once() {
        let backend = Arc::new(FakeBackend::new().with_delay_ms(50));
        let m = Arc::new(manager(&backend));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let m = Arc::clone(&m);
                tokio::spawn(async move { m.swapper().await.is_ok() })
            })
            .collect();
        for t in tasks {
            assert!(t.await.unwrap());
        }
        assert_eq!(backend.load_count(ModelRole::Swapper), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_one_failed_cascade() {
        let backend = Arc::new(
            FakeBackend::new()
                .failing_role(ModelRole::Detector)
                .with_delay_ms(20),
        );
        let m = manager(&backend);

        let (a, b, c, d) = tokio::join!(m.analyzer(), m.analyzer(), m.analyzer(), m.analyzer());
        let errors: Vec<ModelLoadError> = [a, b, c, d]
            .into_iter()
            .map(|r| r.err().unwrap())
            .collect();

        assert!(matches!(errors[0], ModelLoadError::Exhausted { .. }));
        assert!(errors.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(backend.attempts_for(ModelRole::Detector).len(), 3);
    }

    #[tokio::test]
    async fn test_slow_detector_does_not_block_swapper() {
        let backend = Arc::new(FakeBackend::new().delay_for(ModelRole::Detector, 400));
        let m = manager(&backend);
        let started = Instant::now();

        let (detector, swapper) = tokio::join!(
            async {
                let ok = m.analyzer().await.is_ok();
                (ok, started.elapsed())
            },
            async {
                let ok = m.swapper().await.is_ok();
                (ok, started.elapsed())
            },
        );

        assert!(detector.0 && swapper.0);
        assert!(detector.1 >= Duration::from_millis(400));
        assert!(
            swapper.1 < detector.1,
            "swapper {:?} waited for detector {:?}",
            swapper.1,
            detector.1
        );
        assert_eq!(backend.load_count(ModelRole::Swapper), 1);
    }

    #[tokio::test]
    async fn test_first_stage_failure_falls_through_to_second() {
        let backend = Arc::new(FakeBackend::new().failing(ModelRole::Swapper, LoadStage::Preferred));
        let m = manager(&backend);

        assert!(m.swapper().await.is_ok());
        assert_eq!(
            backend.attempts_for(ModelRole::Swapper),
            vec![LoadStage::Preferred, LoadStage::CpuFallback]
        );
    }

    #[tokio::test]
    async fn test_exhausted_detector_is_fatal_and_cached() {
        let backend = Arc::new(FakeBackend::new().failing_role(ModelRole::Detector));
        let m = manager(&backend);

        let first = m.analyzer().await.err().unwrap();
        match &first {
            ModelLoadError::Exhausted { role, failures } => {
                assert_eq!(*role, ModelRole::Detector);
                assert_eq!(failures.len(), 3);
                assert_eq!(failures[2].stage, LoadStage::LocalFile);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let second = m.analyzer().await.err().unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.attempts_for(ModelRole::Detector).len(), 3);
    }

    #[tokio::test]
    async fn test_restorer_exhaustion_is_not_an_error() {
        let backend = Arc::new(FakeBackend::new().failing_role(ModelRole::Restorer));
        let m = manager(&backend);

        assert!(m.restorer().await.is_none());
        let handle = m.get(ModelRole::Restorer).await.unwrap();
        assert!(matches!(handle, ModelHandle::Restorer(None)));
        assert!(m.initialize().await.is_ok());
    }

    #[tokio::test]
    async fn test_initialize_fails_on_swapper() {
        let backend = Arc::new(FakeBackend::new().failing_role(ModelRole::Swapper));
        let m = manager(&backend);

        let err = m.initialize().await.unwrap_err();
        assert_eq!(err.role(), ModelRole::Swapper);
        // Independent roles still loaded.
        assert_eq!(backend.load_count(ModelRole::Detector), 1);
        assert_eq!(backend.load_count(ModelRole::Restorer), 1);
    }

    #[tokio::test]
    async fn test_get_returns_role_tagged_handles() {
        let backend = Arc::new(FakeBackend::new());
        let m = manager(&backend);
        for role in [ModelRole::Detector, ModelRole::Swapper, ModelRole::Restorer] {
            assert_eq!(m.get(role).await.unwrap().role(), role);
        }
    }

    #[tokio::test]
    async fn test_cleanup_forces_reload() {
        let backend = Arc::new(FakeBackend::new());
        let mut m = manager(&backend);

        m.initialize().await.unwrap();
        m.cleanup();
        assert!(m
            .status()
            .roles
            .iter()
            .all(|r| r.state == RoleState::NotLoaded));

        m.analyzer().await.unwrap();
        assert_eq!(backend.load_count(ModelRole::Detector), 2);
        assert_eq!(backend.load_count(ModelRole::Swapper), 1);
    }

    #[tokio::test]
    async fn test_status_reports_each_role() {
        let backend = Arc::new(
            FakeBackend::new()
                .failing_role(ModelRole::Swapper)
                .failing_role(ModelRole::Restorer),
        );
        let m = manager(&backend);
        let _ = m.initialize().await;

        let states: Vec<_> = m.status().roles.into_iter().map(|r| r.state).collect();
        assert_eq!(states[0], RoleState::Loaded);
        assert!(matches!(states[1], RoleState::Failed(_)));
        assert_eq!(states[2], RoleState::Unavailable);
    }

    #[test]
    fn test_error_message_lists_stages() {
        let err = ModelLoadError::Exhausted {
            role: ModelRole::Swapper,
            failures: vec![
                StageFailure {
                    stage: LoadStage::Preferred,
                    reason: "no url".into(),
                },
                StageFailure {
                    stage: LoadStage::LocalFile,
                    reason: "missing".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "swapper model unavailable (Preferred: no url; LocalFile: missing)"
        );
    }
}
