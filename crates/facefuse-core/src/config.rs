use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::device::DevicePreference;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Where one model file lives and, optionally, where to fetch it from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelSource {
    pub file: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl ModelSource {
    fn hosted(file: &str, url: &str) -> Self {
        Self {
            file: file.to_string(),
            url: Some(url.to_string()),
        }
    }
}

const INSIGHTFACE_BUFFALO_L: &str =
    "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l";
const FACEFUSION_ASSETS: &str =
    "https://github.com/facefusion/facefusion-assets/releases/download/models";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModelSources {
    pub detector: ModelSource,
    pub recognizer: ModelSource,
    /// Gender/age head; only loaded with the full analysis module set.
    pub attributes: ModelSource,
    pub swapper: ModelSource,
    pub restorer: ModelSource,
    /// RealESRGAN x2 background enhancer; only tried on accelerated devices.
    pub upsampler: ModelSource,
}

impl Default for ModelSources {
    fn default() -> Self {
        Self {
            detector: ModelSource::hosted(
                "det_10g.onnx",
                &format!("{INSIGHTFACE_BUFFALO_L}/det_10g.onnx"),
            ),
            recognizer: ModelSource::hosted(
                "w600k_r50.onnx",
                "https://github.com/neutrinographics/faceguard/releases/download/v0.1.0/w600k_r50.onnx",
            ),
            attributes: ModelSource::hosted(
                "genderage.onnx",
                &format!("{INSIGHTFACE_BUFFALO_L}/genderage.onnx"),
            ),
            swapper: ModelSource::hosted(
                "inswapper_128.onnx",
                &format!("{FACEFUSION_ASSETS}/inswapper_128.onnx"),
            ),
            restorer: ModelSource::hosted(
                "GFPGANv1.4.onnx",
                &format!("{FACEFUSION_ASSETS}/gfpgan_1.4.onnx"),
            ),
            upsampler: ModelSource::hosted(
                "RealESRGAN_x2plus.onnx",
                &format!("{FACEFUSION_ASSETS}/real_esrgan_x2plus.onnx"),
            ),
        }
    }
}

/// Inference configuration: defaults, then an optional TOML file, then
/// `FACEFUSE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding bundled model files; also the last-resort local path.
    pub model_dir: PathBuf,
    /// Download cache. `None` means the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    pub device: DevicePreference,
    /// Square detector input size.
    pub det_size: u32,
    pub det_threshold: f32,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    pub models: ModelSources,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            cache_dir: None,
            device: DevicePreference::Auto,
            det_size: 640,
            det_threshold: 0.5,
            intra_threads: 2,
            models: ModelSources::default(),
        }
    }
}

impl Config {
    /// Load from `path` (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `FACEFUSE_*` variables looked up through `var`.
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FACEFUSE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACEFUSE_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("FACEFUSE_DEVICE") {
            match v.parse() {
                Ok(device) => self.device = device,
                Err(e) => tracing::warn!(error = %e, "ignoring FACEFUSE_DEVICE"),
            }
        }
        parse_into(&var, "FACEFUSE_DET_SIZE", &mut self.det_size);
        parse_into(&var, "FACEFUSE_DET_THRESHOLD", &mut self.det_threshold);
        parse_into(&var, "FACEFUSE_INTRA_THREADS", &mut self.intra_threads);

        let models = &mut self.models;
        for (key, source) in [
            ("FACEFUSE_DETECTOR_URL", &mut models.detector),
            ("FACEFUSE_RECOGNIZER_URL", &mut models.recognizer),
            ("FACEFUSE_ATTRIBUTES_URL", &mut models.attributes),
            ("FACEFUSE_SWAPPER_URL", &mut models.swapper),
            ("FACEFUSE_RESTORER_URL", &mut models.restorer),
            ("FACEFUSE_UPSAMPLER_URL", &mut models.upsampler),
        ] {
            if let Some(url) = var(key) {
                source.url = Some(url);
            }
        }
    }

    /// Download cache directory, falling back to the platform cache.
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|d| d.join("facefuse").join("models")))
    }
}

fn parse_into<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = var(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.det_size, 640);
        assert_eq!(c.device, DevicePreference::Auto);
        assert_eq!(c.models.swapper.file, "inswapper_128.onnx");
        assert_eq!(c.models.upsampler.file, "RealESRGAN_x2plus.onnx");
        for source in [
            &c.models.detector,
            &c.models.recognizer,
            &c.models.attributes,
            &c.models.swapper,
            &c.models.restorer,
            &c.models.upsampler,
        ] {
            let url = source.url.as_deref().unwrap_or_default();
            assert!(url.starts_with("https://") && url.ends_with(".onnx"), "{url}");
        }
    }

    #[test]
    fn test_toml_partial_overrides() {
        let c: Config = toml::from_str(
            r#"
            device = "cpu"
            det_threshold = 0.6

            [models.swapper]
            file = "custom_swap.onnx"
            url = "https://models.invalid/custom_swap.onnx"
            "#,
        )
        .unwrap();
        assert_eq!(c.device, DevicePreference::Cpu);
        assert!((c.det_threshold - 0.6).abs() < 1e-6);
        assert_eq!(c.det_size, 640);
        assert_eq!(c.models.swapper.file, "custom_swap.onnx");
        assert_eq!(c.models.detector.file, "det_10g.onnx");
        assert!(c.models.detector.url.is_some());
    }

    #[test]
    fn test_toml_can_clear_a_url() {
        let c: Config = toml::from_str(
            r#"
            [models.restorer]
            file = "GFPGANv1.4.onnx"
            "#,
        )
        .unwrap();
        assert!(c.models.restorer.url.is_none());
        assert!(c.models.swapper.url.is_some());
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        c.apply_env(env(&[
            ("FACEFUSE_MODEL_DIR", "/opt/models"),
            ("FACEFUSE_DEVICE", "metal"),
            ("FACEFUSE_DET_SIZE", "320"),
            ("FACEFUSE_RESTORER_URL", "https://models.invalid/gfpgan.onnx"),
        ]));
        assert_eq!(c.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(c.device, DevicePreference::Metal);
        assert_eq!(c.det_size, 320);
        assert_eq!(
            c.models.restorer.url.as_deref(),
            Some("https://models.invalid/gfpgan.onnx")
        );
    }

    #[test]
    fn test_env_bad_values_ignored() {
        let mut c = Config::default();
        c.apply_env(env(&[
            ("FACEFUSE_DET_SIZE", "large"),
            ("FACEFUSE_DEVICE", "tpu"),
        ]));
        assert_eq!(c.det_size, 640);
        assert_eq!(c.device, DevicePreference::Auto);
    }

    #[test]
    fn test_from_file_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("missing.toml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::Read { .. })
        ));

        let bad = tmp.path().join("bad.toml");
        std::fs::write(&bad, "det_size = \"big\"").unwrap();
        assert!(matches!(Config::from_file(&bad), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_explicit_cache_dir_wins() {
        let c = Config {
            cache_dir: Some(PathBuf::from("/tmp/ff-cache")),
            ..Config::default()
        };
        assert_eq!(c.resolved_cache_dir(), Some(PathBuf::from("/tmp/ff-cache")));
    }
}
