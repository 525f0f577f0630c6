use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{Config, ModelSource};

#[derive(Error, Debug)]
pub enum ModelResolveError {
    #[error("failed to create cache directory: {0}")]
    CacheDir(#[source] std::io::Error),
    #[error("download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to write model to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not determine cache directory")]
    NoCacheDir,
    #[error("model {name} not found locally and no download URL is configured")]
    NotFound { name: String },
}

/// Locates model files: user cache, then the model directory, then a
/// download into the cache.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    cache_dir: Option<PathBuf>,
    model_dir: PathBuf,
}

impl ModelResolver {
    pub fn new(cache_dir: Option<PathBuf>, model_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            model_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.resolved_cache_dir(), config.model_dir.clone())
    }

    /// The known local path inside the model directory. Not checked for
    /// existence.
    pub fn local_path(&self, source: &ModelSource) -> PathBuf {
        self.model_dir.join(&source.file)
    }

    pub fn resolve(&self, source: &ModelSource) -> Result<PathBuf, ModelResolveError> {
        let name = source.file.as_str();

        if let Some(cache_dir) = &self.cache_dir {
            let cached = cache_dir.join(name);
            if cached.exists() {
                return Ok(cached);
            }
        }

        let bundled = self.local_path(source);
        if bundled.exists() {
            return Ok(bundled);
        }

        let Some(url) = source.url.as_deref() else {
            return Err(ModelResolveError::NotFound {
                name: name.to_string(),
            });
        };
        let cache_dir = self.cache_dir.as_ref().ok_or(ModelResolveError::NoCacheDir)?;
        fs::create_dir_all(cache_dir).map_err(ModelResolveError::CacheDir)?;

        let dest = cache_dir.join(name);
        tracing::info!(model = name, url, dest = %dest.display(), "downloading model");
        download(url, &dest)?;
        Ok(dest)
    }
}

fn download(url: &str, dest: &Path) -> Result<(), ModelResolveError> {
    let temp_path = dest.with_extension("part");
    let result = download_inner(url, dest, &temp_path);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn download_inner(url: &str, dest: &Path, temp_path: &Path) -> Result<(), ModelResolveError> {
    let write_err = |source| ModelResolveError::Write {
        path: temp_path.to_path_buf(),
        source,
    };

    let mut response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| ModelResolveError::Download {
            url: url.to_string(),
            source: e,
        })?;

    let total = response.content_length().unwrap_or(0);
    let mut file = fs::File::create(temp_path).map_err(write_err)?;

    let mut downloaded: u64 = 0;
    let mut last_decile = 0;
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = response.read(&mut buf).map_err(write_err)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).map_err(write_err)?;
        downloaded += n as u64;

        if total > 0 {
            let decile = downloaded * 10 / total;
            if decile > last_decile {
                last_decile = decile;
                tracing::debug!(downloaded, total, "download progress {}%", decile * 10);
            }
        }
    }

    file.flush().map_err(write_err)?;
    drop(file);

    fs::rename(temp_path, dest).map_err(|e| ModelResolveError::Write {
        path: dest.to_path_buf(),
        source: e,
    })?;
    tracing::info!(path = %dest.display(), bytes = downloaded, "model downloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source(file: &str, url: Option<&str>) -> ModelSource {
        ModelSource {
            file: file.to_string(),
            url: url.map(str::to_string),
        }
    }

    #[test]
    fn test_cache_wins_over_model_dir() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        let models = tmp.path().join("models");
        fs::create_dir_all(&cache).unwrap();
        fs::create_dir_all(&models).unwrap();
        fs::write(cache.join("m.onnx"), b"cached").unwrap();
        fs::write(models.join("m.onnx"), b"bundled").unwrap();

        let resolver = ModelResolver::new(Some(cache.clone()), models);
        assert_eq!(resolver.resolve(&source("m.onnx", None)).unwrap(), cache.join("m.onnx"));
    }

    #[test]
    fn test_model_dir_when_not_cached() {
        let tmp = TempDir::new().unwrap();
        let models = tmp.path().join("models");
        fs::create_dir_all(&models).unwrap();
        fs::write(models.join("m.onnx"), b"bundled").unwrap();

        let resolver = ModelResolver::new(Some(tmp.path().join("empty-cache")), models.clone());
        assert_eq!(resolver.resolve(&source("m.onnx", None)).unwrap(), models.join("m.onnx"));
    }

    #[test]
    fn test_missing_without_url() {
        let tmp = TempDir::new().unwrap();
        let resolver = ModelResolver::new(Some(tmp.path().join("c")), tmp.path().join("m"));
        assert!(matches!(
            resolver.resolve(&source("m.onnx", None)),
            Err(ModelResolveError::NotFound { name }) if name == "m.onnx"
        ));
    }

    #[test]
    fn test_missing_url_without_cache_dir() {
        let tmp = TempDir::new().unwrap();
        let resolver = ModelResolver::new(None, tmp.path().to_path_buf());
        assert!(matches!(
            resolver.resolve(&source("m.onnx", Some("http://127.0.0.1:9/m.onnx"))),
            Err(ModelResolveError::NoCacheDir)
        ));
    }

    #[test]
    fn test_failed_download_leaves_no_partial() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        let resolver = ModelResolver::new(Some(cache.clone()), tmp.path().join("models"));

        let result = resolver.resolve(&source("m.onnx", Some("http://127.0.0.1:9/m.onnx")));
        assert!(matches!(result, Err(ModelResolveError::Download { .. })));
        assert!(!cache.join("m.onnx").exists());
        assert!(!cache.join("m.part").exists());
    }

    #[test]
    fn test_local_path() {
        let resolver = ModelResolver::new(None, PathBuf::from("/srv/models"));
        assert_eq!(
            resolver.local_path(&source("x.onnx", None)),
            PathBuf::from("/srv/models/x.onnx")
        );
    }
}
