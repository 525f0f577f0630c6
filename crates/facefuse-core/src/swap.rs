//! Face swap: detect, swap every target face with the source identity,
//! color-correct, then mix with the untouched target.

use thiserror::Error;

use crate::compositor::{self, CompositeError};
use crate::image_buffer::ImageBuffer;
use crate::manager::{ModelLoadError, ModelManager};
use crate::operators::{AnalysisError, OperatorError};
use crate::params::SwapParams;
use crate::types::{FaceBox, Side};

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("no face detected in {0} image")]
    NoFaceDetected(Side),
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error("face analysis failed on {side} image: {source}")]
    Detection {
        side: Side,
        #[source]
        source: AnalysisError,
    },
    #[error("swap failed on target face {face_index}: {source}")]
    Operator {
        face_index: usize,
        #[source]
        source: OperatorError,
    },
    #[error(transparent)]
    Composite(#[from] CompositeError),
}

pub struct FaceSwapEngine<'m> {
    models: &'m ModelManager,
}

impl<'m> FaceSwapEngine<'m> {
    pub fn new(models: &'m ModelManager) -> Self {
        Self { models }
    }

    /// Load the analyzer and the swapper.
    pub async fn initialize(&self) -> Result<(), SwapError> {
        self.models.analyzer().await?;
        self.models.swapper().await?;
        Ok(())
    }

    pub async fn swap(
        &self,
        source: &ImageBuffer,
        target: &ImageBuffer,
        params: &SwapParams,
    ) -> Result<ImageBuffer, SwapError> {
        let analyzer = self.models.analyzer().await?;
        let swapper = self.models.swapper().await?;

        let source_faces = analyzer.detect(source).map_err(|source| SwapError::Detection {
            side: Side::Source,
            source,
        })?;
        let target_faces = analyzer.detect(target).map_err(|source| SwapError::Detection {
            side: Side::Target,
            source,
        })?;

        let source_face = source_faces
            .first()
            .ok_or(SwapError::NoFaceDetected(Side::Source))?;
        if target_faces.is_empty() {
            return Err(SwapError::NoFaceDetected(Side::Target));
        }
        tracing::debug!(
            source_faces = source_faces.len(),
            target_faces = target_faces.len(),
            "faces detected"
        );

        let mut result = target.clone();
        for (face_index, face) in target_faces.iter().enumerate() {
            result = swapper
                .swap(&result, face, source_face)
                .map_err(|source| SwapError::Operator { face_index, source })?;
        }

        if params.color_correction {
            let boxes: Vec<FaceBox> = target_faces.iter().map(|f| f.bounding_box).collect();
            let corrected = compositor::color_correct_faces(&mut result, target, &boxes);
            tracing::debug!(corrected, faces = boxes.len(), "color correction applied");
        }

        Ok(compositor::mix(target, &result, params.blend_strength)?)
    }
}
