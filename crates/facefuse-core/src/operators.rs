//! The three opaque model roles, as seen by the engines.
//!
//! Implementations own their inference sessions and must be callable from
//! several tasks at once; the ONNX implementations in [`crate::onnx`] guard
//! each session with a mutex held only for the duration of a run.

use thiserror::Error;

use crate::image_buffer::ImageBuffer;
use crate::types::DetectedFace;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("session lock poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks")]
    MissingLandmarks,
    #[error("face analysis failed: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("session lock poisoned")]
    Poisoned,
}

/// Face detection + identity embedding (+ optional attributes).
pub trait FaceAnalysis: Send + Sync {
    /// Faces in `image`, sorted by descending detection score.
    fn detect(&self, image: &ImageBuffer) -> Result<Vec<DetectedFace>, AnalysisError>;
}

/// Identity swap of a single face.
pub trait SwapOperator: Send + Sync {
    /// Return a copy of `frame` where `target` carries the identity of
    /// `source`, already pasted back into the full frame.
    fn swap(
        &self,
        frame: &ImageBuffer,
        target: &DetectedFace,
        source: &DetectedFace,
    ) -> Result<ImageBuffer, OperatorError>;
}

/// Whole-image face restoration.
pub trait RestorationOperator: Send + Sync {
    /// Restore every face in `image`, blending by `weight` in `[0, 1]`.
    ///
    /// `Ok(None)` means the operator produced nothing (e.g. no face found);
    /// callers keep the input unchanged.
    fn restore(&self, image: &ImageBuffer, weight: f32) -> Result<Option<ImageBuffer>, OperatorError>;
}
