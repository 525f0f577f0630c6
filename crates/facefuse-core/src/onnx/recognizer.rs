//! ArcFace identity embeddings via ONNX Runtime.
//!
//! Faces are aligned to the canonical 112x112 ArcFace template and embedded
//! into a 512-dimensional vector. The raw vector is kept; consumers that need
//! a unit vector call [`Embedding::normalized`].

use std::path::Path;
use std::sync::Mutex;

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

use super::OnnxLoadError;
use crate::alignment::{self, ARCFACE_TEMPLATE_112};
use crate::device::ExecutionProvider;
use crate::image_buffer::ImageBuffer;
use crate::operators::AnalysisError;
use crate::types::Embedding;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0 like SCRFD
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

pub struct ArcFaceRecognizer {
    session: Mutex<Session>,
}

impl ArcFaceRecognizer {
    pub fn load(
        path: &Path,
        providers: &[ExecutionProvider],
        intra_threads: usize,
    ) -> Result<Self, OnnxLoadError> {
        let session = super::load_session(path, providers, intra_threads)?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Embed the face described by five-point `landmarks` in `frame`.
    pub fn embed(
        &self,
        frame: &ImageBuffer,
        landmarks: &[(f32, f32); 5],
    ) -> Result<Embedding, AnalysisError> {
        let (aligned, _) =
            alignment::align_face(frame, landmarks, &ARCFACE_TEMPLATE_112, ARCFACE_INPUT_SIZE);
        let input = preprocess(&aligned);

        let mut session = self.session.lock().map_err(|_| AnalysisError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalysisError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(AnalysisError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Embedding::new(raw.to_vec()))
    }
}

/// Aligned RGB crop → NCHW tensor normalized to roughly [-1, 1].
fn preprocess(aligned: &ImageBuffer) -> Array4<f32> {
    super::to_nchw(aligned, 1.0 / ARCFACE_STD, -ARCFACE_MEAN / ARCFACE_STD)
}
