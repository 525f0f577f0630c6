//! GFPGAN restoration on 512x512 FFHQ-aligned crops, optionally pasted onto
//! a RealESRGAN-enhanced background.

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::TensorRef;

use super::detector::ScrfdDetector;
use super::upsampler::RealEsrganUpsampler;
use super::OnnxLoadError;
use crate::alignment::{self, FFHQ_TEMPLATE_512};
use crate::compositor;
use crate::device::ExecutionProvider;
use crate::image_buffer::ImageBuffer;
use crate::operators::{OperatorError, RestorationOperator};

const CROP_SIZE: u32 = 512;

pub struct GfpganRestorer {
    detector: ScrfdDetector,
    session: Mutex<Session>,
    upsampler: Option<RealEsrganUpsampler>,
}

impl GfpganRestorer {
    pub fn load(
        path: &Path,
        detector: ScrfdDetector,
        providers: &[ExecutionProvider],
        intra_threads: usize,
    ) -> Result<Self, OnnxLoadError> {
        let session = super::load_session(path, providers, intra_threads)?;
        Ok(Self {
            detector,
            session: Mutex::new(session),
            upsampler: None,
        })
    }

    pub fn with_background(mut self, upsampler: Option<RealEsrganUpsampler>) -> Self {
        self.upsampler = upsampler;
        self
    }

    /// Enhanced copy of `image`; the plain input when there is no upsampler
    /// or it fails.
    fn background(&self, image: &ImageBuffer) -> ImageBuffer {
        let Some(upsampler) = &self.upsampler else {
            return image.clone();
        };
        match upsampler.enhance(image) {
            Ok(enhanced) => enhanced,
            Err(e) => {
                tracing::warn!(error = %e, "background enhancement failed, using input");
                image.clone()
            }
        }
    }

    fn restore_crop(&self, crop: &ImageBuffer) -> Result<ImageBuffer, OperatorError> {
        // [0, 255] -> [-1, 1]
        let input = super::to_nchw(crop, 1.0 / 127.5, -1.0);

        let mut session = self.session.lock().map_err(|_| OperatorError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OperatorError::InferenceFailed(format!("restore output: {e}")))?;

        // [-1, 1] -> [0, 255]
        super::from_nchw(data, CROP_SIZE as usize, CROP_SIZE as usize, 127.5, 127.5).ok_or_else(
            || {
                OperatorError::InferenceFailed(format!(
                    "restore output has {} values, expected 3x{CROP_SIZE}x{CROP_SIZE}",
                    data.len()
                ))
            },
        )
    }
}

impl RestorationOperator for GfpganRestorer {
    fn restore(&self, image: &ImageBuffer, weight: f32) -> Result<Option<ImageBuffer>, OperatorError> {
        let faces = self.detector.detect(image)?;
        if faces.is_empty() {
            tracing::debug!("no face to restore");
            return Ok(None);
        }

        let mut out = self.background(image);
        let mut restored_faces = 0usize;
        for face in &faces {
            let Some(landmarks) = face.landmarks else {
                continue;
            };
            let (crop, frame_to_crop) =
                alignment::align_face(image, &landmarks, &FFHQ_TEMPLATE_512, CROP_SIZE);
            let restored = self.restore_crop(&crop)?;
            let blended = compositor::mix(&crop, &restored, weight)
                .map_err(|e| OperatorError::InferenceFailed(e.to_string()))?;

            if compositor::paste_back(&mut out, &blended, &frame_to_crop) {
                restored_faces += 1;
            }
        }

        tracing::debug!(faces = faces.len(), restored_faces, weight, "restoration complete");
        Ok((restored_faces > 0).then_some(out))
    }
}
