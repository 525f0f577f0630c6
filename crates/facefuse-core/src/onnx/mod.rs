//! ONNX Runtime implementations of the three model roles.

pub mod analyzer;
pub mod attributes;
pub mod detector;
pub mod initializer;
pub mod recognizer;
pub mod restorer;
pub mod swapper;
pub mod upsampler;

use std::path::{Path, PathBuf};

use ndarray::Array4;
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::Session;
use thiserror::Error;

use crate::config::{Config, ModelSource, ModelSources};
use crate::device::ExecutionProvider;
use crate::image_buffer::ImageBuffer;
use crate::manager::{
    Acquisition, BackendError, LoadPlan, ModelBackend, ModuleSet,
};
use crate::operators::{FaceAnalysis, RestorationOperator, SwapOperator};
use crate::resolver::{ModelResolveError, ModelResolver};

pub use analyzer::FaceAnalyzer;
pub use restorer::GfpganRestorer;
pub use swapper::InSwapper;
pub use upsampler::RealEsrganUpsampler;

#[derive(Error, Debug)]
pub enum OnnxLoadError {
    #[error(transparent)]
    Resolve(#[from] ModelResolveError),
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("invalid model {path}: {reason}")]
    InvalidModel { path: PathBuf, reason: String },
}

fn dispatch(provider: ExecutionProvider) -> Option<ExecutionProviderDispatch> {
    match provider {
        ExecutionProvider::Cuda => {
            #[cfg(feature = "cuda")]
            {
                Some(
                    ort::execution_providers::CUDAExecutionProvider::default()
                        .build()
                        .error_on_failure(),
                )
            }
            #[cfg(not(feature = "cuda"))]
            {
                None
            }
        }
        ExecutionProvider::CoreMl => {
            #[cfg(target_os = "macos")]
            {
                Some(
                    ort::execution_providers::CoreMLExecutionProvider::default()
                        .build()
                        .error_on_failure(),
                )
            }
            #[cfg(not(target_os = "macos"))]
            {
                None
            }
        }
        ExecutionProvider::Cpu => Some(CPUExecutionProvider::default().build()),
    }
}

fn session_builder(
    providers: &[ExecutionProvider],
    intra_threads: usize,
) -> Result<ort::session::builder::SessionBuilder, ort::Error> {
    let dispatches: Vec<ExecutionProviderDispatch> =
        providers.iter().copied().filter_map(dispatch).collect();
    Ok(Session::builder()?
        .with_intra_threads(intra_threads)?
        .with_execution_providers(dispatches)?)
}

/// Open a session for `path` on `providers`, in order.
pub(crate) fn load_session(
    path: &Path,
    providers: &[ExecutionProvider],
    intra_threads: usize,
) -> Result<Session, OnnxLoadError> {
    let session = session_builder(providers, intra_threads)?.commit_from_file(path)?;
    log_session(path, &session);
    Ok(session)
}

/// Same as [`load_session`] for a model already read into memory.
pub(crate) fn load_session_from_memory(
    path: &Path,
    bytes: &[u8],
    providers: &[ExecutionProvider],
    intra_threads: usize,
) -> Result<Session, OnnxLoadError> {
    let session = session_builder(providers, intra_threads)?.commit_from_memory(bytes)?;
    log_session(path, &session);
    Ok(session)
}

fn log_session(path: &Path, session: &Session) {
    tracing::info!(
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
}

/// RGB image → NCHW float tensor with `(pixel * scale) + offset` per value.
pub(crate) fn to_nchw(image: &ImageBuffer, scale: f32, offset: f32) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let src = image.data();
    Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        src[(y * w + x) * 3 + c] as f32 * scale + offset
    })
}

/// NCHW float output → RGB image via `value * scale + offset`, clamped.
pub(crate) fn from_nchw(
    data: &[f32],
    width: usize,
    height: usize,
    scale: f32,
    offset: f32,
) -> Option<ImageBuffer> {
    let plane = width * height;
    if data.len() < plane * 3 {
        return None;
    }
    let mut out = ImageBuffer::filled(width as u32, height as u32, [0, 0, 0]);
    let pixels = out.data_mut();
    for i in 0..plane {
        for c in 0..3 {
            pixels[i * 3 + c] = (data[c * plane + i] * scale + offset).round().clamp(0.0, 255.0) as u8;
        }
    }
    Some(out)
}

/// Production backend: resolves model files and opens ONNX Runtime sessions.
pub struct OnnxBackend {
    resolver: ModelResolver,
    models: ModelSources,
    det_size: usize,
    det_threshold: f32,
    intra_threads: usize,
}

impl OnnxBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            resolver: ModelResolver::from_config(config),
            models: config.models.clone(),
            det_size: config.det_size as usize,
            det_threshold: config.det_threshold,
            intra_threads: config.intra_threads.max(1),
        }
    }

    fn model_path(&self, source: &ModelSource, plan: &LoadPlan) -> Result<PathBuf, OnnxLoadError> {
        match plan.acquisition {
            Acquisition::Network => Ok(self.resolver.resolve(source)?),
            Acquisition::LocalOnly => {
                let path = self.resolver.local_path(source);
                if path.exists() {
                    Ok(path)
                } else {
                    Err(OnnxLoadError::ModelNotFound(path))
                }
            }
        }
    }

    fn detector(&self, plan: &LoadPlan) -> Result<detector::ScrfdDetector, OnnxLoadError> {
        let path = self.model_path(&self.models.detector, plan)?;
        detector::ScrfdDetector::load(
            &path,
            &plan.providers,
            self.intra_threads,
            self.det_size,
            self.det_threshold,
        )
    }
}

impl ModelBackend for OnnxBackend {
    fn load_analyzer(&self, plan: &LoadPlan) -> Result<Box<dyn FaceAnalysis>, BackendError> {
        let detector = self.detector(plan)?;
        let rec_path = self.model_path(&self.models.recognizer, plan)?;
        let recognizer =
            recognizer::ArcFaceRecognizer::load(&rec_path, &plan.providers, self.intra_threads)?;

        let attributes = match plan.modules {
            ModuleSet::Full => {
                let path = self.model_path(&self.models.attributes, plan)?;
                Some(attributes::GenderAgeEstimator::load(
                    &path,
                    &plan.providers,
                    self.intra_threads,
                )?)
            }
            ModuleSet::DetectionRecognition => None,
        };

        Ok(Box::new(FaceAnalyzer::new(detector, recognizer, attributes)))
    }

    fn load_swapper(&self, plan: &LoadPlan) -> Result<Box<dyn SwapOperator>, BackendError> {
        let path = self.model_path(&self.models.swapper, plan)?;
        Ok(Box::new(InSwapper::load(&path, &plan.providers, self.intra_threads)?))
    }

    fn load_restorer(&self, plan: &LoadPlan) -> Result<Box<dyn RestorationOperator>, BackendError> {
        let path = self.model_path(&self.models.restorer, plan)?;
        let detector = self.detector(plan)?;
        let restorer = GfpganRestorer::load(&path, detector, &plan.providers, self.intra_threads)?;
        Ok(Box::new(restorer.with_background(self.upsampler(plan))))
    }
}

impl OnnxBackend {
    /// Background upsampler for accelerated plans. Optional: failures are
    /// logged and restoration continues without it.
    fn upsampler(&self, plan: &LoadPlan) -> Option<RealEsrganUpsampler> {
        if !plan.is_accelerated() {
            tracing::debug!(stage = ?plan.stage, "skipping background upsampler on CPU");
            return None;
        }
        let loaded = self
            .model_path(&self.models.upsampler, plan)
            .and_then(|path| RealEsrganUpsampler::load(&path, &plan.providers, self.intra_threads));
        match loaded {
            Ok(upsampler) => {
                tracing::info!("background upsampler loaded");
                Some(upsampler)
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not load background upsampler");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProfile;
    use crate::manager::{load_plans, LoadStage, ModelRole};

    #[test]
    fn test_nchw_roundtrip() {
        let mut img = ImageBuffer::filled(3, 2, [10, 20, 30]);
        img.put_pixel(2, 1, [255, 0, 128]);
        let t = to_nchw(&img, 1.0 / 255.0, 0.0);
        assert_eq!(t.shape(), &[1, 3, 2, 3]);
        assert!((t[[0, 0, 1, 2]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 2, 0, 0]] - 30.0 / 255.0).abs() < 1e-6);

        let flat: Vec<f32> = t.iter().copied().collect();
        assert_eq!(from_nchw(&flat, 3, 2, 255.0, 0.0).unwrap(), img);
    }

    #[test]
    fn test_from_nchw_short_buffer() {
        assert!(from_nchw(&[0.0; 5], 2, 2, 1.0, 0.0).is_none());
    }

    #[test]
    fn test_cpu_provider_always_dispatches() {
        assert!(dispatch(ExecutionProvider::Cpu).is_some());
    }

    #[test]
    fn test_local_file_stage_requires_existing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config {
            model_dir: tmp.path().to_path_buf(),
            cache_dir: Some(tmp.path().join("cache")),
            ..Config::default()
        };
        let backend = OnnxBackend::new(&config);
        let plans = load_plans(ModelRole::Swapper, &DeviceProfile::cpu());
        let local = plans
            .iter()
            .find(|p| p.stage == LoadStage::LocalFile)
            .unwrap();

        let err = backend.load_swapper(local).err().unwrap();
        assert!(err.to_string().contains("inswapper_128.onnx"), "{err}");
    }

    #[test]
    fn test_network_stage_without_url_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config {
            model_dir: tmp.path().to_path_buf(),
            cache_dir: Some(tmp.path().join("cache")),
            ..Config::default()
        };
        config.models.restorer.url = None;
        let backend = OnnxBackend::new(&config);
        let plans = load_plans(ModelRole::Restorer, &DeviceProfile::cpu());

        let err = backend.load_restorer(&plans[0]).err().unwrap();
        assert!(err.to_string().contains("no download URL"), "{err}");
    }

    #[test]
    fn test_upsampler_skipped_on_cpu_plans() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config {
            model_dir: tmp.path().to_path_buf(),
            cache_dir: Some(tmp.path().join("cache")),
            ..Config::default()
        };
        let backend = OnnxBackend::new(&config);
        for plan in load_plans(ModelRole::Restorer, &DeviceProfile::cpu()) {
            assert!(backend.upsampler(&plan).is_none());
        }
    }

    #[test]
    fn test_missing_upsampler_is_not_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config {
            model_dir: tmp.path().to_path_buf(),
            cache_dir: Some(tmp.path().join("cache")),
            ..Config::default()
        };
        config.models.upsampler.url = None;
        let backend = OnnxBackend::new(&config);
        let plan = LoadPlan {
            role: ModelRole::Restorer,
            stage: LoadStage::Preferred,
            providers: vec![ExecutionProvider::Cuda, ExecutionProvider::Cpu],
            acquisition: Acquisition::Network,
            modules: ModuleSet::Full,
        };
        assert!(plan.is_accelerated());
        assert!(backend.upsampler(&plan).is_none());
    }
}
