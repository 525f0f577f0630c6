//! Gender/age head (genderage.onnx).

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::TensorRef;

use super::OnnxLoadError;
use crate::alignment::{self, Affine};
use crate::device::ExecutionProvider;
use crate::image_buffer::ImageBuffer;
use crate::operators::AnalysisError;
use crate::types::{FaceAttributes, Gender};

const INPUT_SIZE: u32 = 96;
/// Crop side as a multiple of the longer bbox side.
const CROP_MARGIN: f32 = 1.5;

pub struct GenderAgeEstimator {
    session: Mutex<Session>,
}

impl GenderAgeEstimator {
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

    pub fn estimate(
        &self,
        frame: &ImageBuffer,
        bbox: &[f32; 4],
    ) -> Result<FaceAttributes, AnalysisError> {
        let m = crop_transform(bbox);
        let crop = alignment::warp_affine(frame, &m, INPUT_SIZE, INPUT_SIZE);
        // The model normalizes internally: raw 0..255 RGB in.
        let input = super::to_nchw(&crop, 1.0, 0.0);

        let mut session = self.session.lock().map_err(|_| AnalysisError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, pred) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalysisError::InferenceFailed(format!("gender/age: {e}")))?;

        decode(pred).ok_or_else(|| {
            AnalysisError::InferenceFailed(format!(
                "gender/age output has {} values, expected 3",
                pred.len()
            ))
        })
    }
}

/// Center the bbox in the 96x96 input with a 1.5x margin.
fn crop_transform(bbox: &[f32; 4]) -> Affine {
    let [x1, y1, x2, y2] = *bbox;
    let (w, h) = (x2 - x1, y2 - y1);
    let (cx, cy) = ((x1 + x2) / 2.0, (y1 + y2) / 2.0);
    let half = INPUT_SIZE as f32 / 2.0;
    let longest = w.max(h);
    let s = if longest > 0.0 {
        INPUT_SIZE as f32 / (longest * CROP_MARGIN)
    } else {
        1.0
    };
    [s, 0.0, half - cx * s, 0.0, s, half - cy * s]
}

/// `[female, male, age/100]` → attributes.
fn decode(pred: &[f32]) -> Option<FaceAttributes> {
    let &[female, male, age, ..] = pred else {
        return None;
    };
    let gender = if male > female {
        Gender::Male
    } else {
        Gender::Female
    };
    Some(FaceAttributes {
        gender,
        age: (age * 100.0).round().max(0.0) as u32,
    })
}
