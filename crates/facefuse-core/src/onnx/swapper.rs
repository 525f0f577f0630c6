//! inswapper_128: identity swap on a 128x128 aligned crop.
//!
//! The source embedding is projected through the model's embedding map (the
//! last graph initializer, 512x512) before it is fed to the network.

use std::path::Path;
use std::sync::Mutex;

use ndarray::Array2;
use ort::session::Session;
use ort::value::TensorRef;

use super::initializer::{self, FloatInitializer};
use super::recognizer::ARCFACE_EMBEDDING_DIM;
use super::OnnxLoadError;
use crate::alignment::{self, arcface_template};
use crate::compositor;
use crate::device::ExecutionProvider;
use crate::image_buffer::ImageBuffer;
use crate::operators::{OperatorError, SwapOperator};
use crate::types::{DetectedFace, Embedding};

const CROP_SIZE: u32 = 128;

pub struct InSwapper {
    session: Mutex<Session>,
    /// Row-major `ARCFACE_EMBEDDING_DIM x ARCFACE_EMBEDDING_DIM`.
    emap: Vec<f32>,
}

impl InSwapper {
    pub fn load(
        path: &Path,
        providers: &[ExecutionProvider],
        intra_threads: usize,
    ) -> Result<Self, OnnxLoadError> {
        let bytes = std::fs::read(path).map_err(|source| OnnxLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let emap = emap_from(&bytes).map_err(|reason| OnnxLoadError::InvalidModel {
            path: path.to_path_buf(),
            reason,
        })?;
        let session = super::load_session_from_memory(path, &bytes, providers, intra_threads)?;

        Ok(Self {
            session: Mutex::new(session),
            emap,
        })
    }

    fn latent(&self, source: &Embedding) -> Result<Array2<f32>, OperatorError> {
        let values = project(&self.emap, source).ok_or_else(|| {
            OperatorError::InferenceFailed(format!(
                "source embedding has {} values, expected {ARCFACE_EMBEDDING_DIM}",
                source.values.len()
            ))
        })?;
        Array2::from_shape_vec((1, ARCFACE_EMBEDDING_DIM), values)
            .map_err(|e| OperatorError::InferenceFailed(e.to_string()))
    }
}

fn emap_from(model: &[u8]) -> Result<Vec<f32>, String> {
    let FloatInitializer { name, dims, values } =
        initializer::last_initializer(model).map_err(|e| e.to_string())?;
    let n = ARCFACE_EMBEDDING_DIM as i64;
    if dims != [n, n] {
        return Err(format!("embedding map {name} has shape {dims:?}, expected [{n}, {n}]"));
    }
    Ok(values)
}

/// `normalize(normalize(source) · emap)`; `None` on a dimension mismatch.
fn project(emap: &[f32], source: &Embedding) -> Option<Vec<f32>> {
    let n = ARCFACE_EMBEDDING_DIM;
    if source.values.len() != n || emap.len() != n * n {
        return None;
    }
    let src = source.normalized();
    let mut latent = vec![0.0f32; n];
    for (i, &s) in src.values.iter().enumerate() {
        let row = &emap[i * n..(i + 1) * n];
        for (acc, &w) in latent.iter_mut().zip(row) {
            *acc += s * w;
        }
    }
    Some(Embedding::new(latent).normalized().values)
}

impl SwapOperator for InSwapper {
    fn swap(
        &self,
        frame: &ImageBuffer,
        target: &DetectedFace,
        source: &DetectedFace,
    ) -> Result<ImageBuffer, OperatorError> {
        let landmarks = target.landmarks.as_ref().ok_or(OperatorError::MissingLandmarks)?;
        let (crop, frame_to_crop) =
            alignment::align_face(frame, landmarks, &arcface_template(CROP_SIZE as usize), CROP_SIZE);

        let blob = super::to_nchw(&crop, 1.0 / 255.0, 0.0);
        let latent = self.latent(&source.embedding)?;

        let swapped = {
            let mut session = self.session.lock().map_err(|_| OperatorError::Poisoned)?;
            let outputs = session.run(ort::inputs![
                TensorRef::from_array_view(blob.view())?,
                TensorRef::from_array_view(latent.view())?
            ])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| OperatorError::InferenceFailed(format!("swap output: {e}")))?;
            super::from_nchw(data, CROP_SIZE as usize, CROP_SIZE as usize, 255.0, 0.0)
                .ok_or_else(|| {
                    OperatorError::InferenceFailed(format!(
                        "swap output has {} values, expected 3x{CROP_SIZE}x{CROP_SIZE}",
                        data.len()
                    ))
                })?
        };

        let mut out = frame.clone();
        if !compositor::paste_back(&mut out, &swapped, &frame_to_crop) {
            tracing::debug!("swapped crop fell outside the frame");
        }
        Ok(out)
    }
}
