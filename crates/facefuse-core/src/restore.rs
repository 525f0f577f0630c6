//! Face restoration through the restoration model when one loaded, or a
//! classical denoise / contrast / sharpen chain otherwise.

use serde::Serialize;
use thiserror::Error;

use crate::compositor::{self, CompositeError};
use crate::filters;
use crate::image_buffer::ImageBuffer;
use crate::manager::ModelManager;
use crate::operators::OperatorError;
use crate::params::RestoreParams;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("restoration model failed: {0}")]
    Operator(#[from] OperatorError),
    #[error(transparent)]
    Composite(#[from] CompositeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestorePath {
    Model,
    Classical,
}

pub struct FaceRestorationEngine<'m> {
    models: &'m ModelManager,
}

impl<'m> FaceRestorationEngine<'m> {
    pub fn new(models: &'m ModelManager) -> Self {
        Self { models }
    }

    /// Load the restorer (or settle on the classical path) and report which
    /// path later calls will take.
    pub async fn initialize(&self) -> RestorePath {
        let path = self.path().await;
        tracing::info!(?path, "face restoration ready");
        path
    }

    pub async fn path(&self) -> RestorePath {
        match self.models.restorer().await {
            Some(_) => RestorePath::Model,
            None => RestorePath::Classical,
        }
    }

    pub async fn restore(
        &self,
        image: &ImageBuffer,
        params: &RestoreParams,
    ) -> Result<ImageBuffer, RestoreError> {
        let strength = params.strength.clamp(0.0, 1.0);
        let restorer = self.models.restorer().await;
        if strength <= 0.0 {
            return Ok(image.clone());
        }

        match restorer {
            Some(op) => {
                tracing::debug!(strength, "restoring with model");
                match op.restore(image, strength)? {
                    Some(restored) => Ok(restored),
                    None => {
                        tracing::debug!("restoration model produced no output, keeping input");
                        Ok(image.clone())
                    }
                }
            }
            None => {
                tracing::debug!(strength, "restoring with classical filters");
                classical_restore(image, params, strength)
            }
        }
    }
}

fn classical_restore(
    image: &ImageBuffer,
    params: &RestoreParams,
    strength: f32,
) -> Result<ImageBuffer, RestoreError> {
    let mut work = image.clone();

    if params.denoise_level > 0.0 && !filters::denoise(&mut work, params.denoise_level) {
        tracing::debug!(level = params.denoise_level, "denoise strength below 1, skipped");
    }
    if params.enhance_details {
        filters::enhance_details(&mut work);
    }
    if params.sharpen_amount > 0.0 {
        filters::unsharp_mask(&mut work, params.sharpen_amount);
    }

    if strength < 1.0 {
        Ok(compositor::mix(image, &work, strength)?)
    } else {
        Ok(work)
    }
}
