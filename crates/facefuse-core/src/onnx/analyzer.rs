use super::attributes::GenderAgeEstimator;
use super::detector::{RawDetection, ScrfdDetector};
use super::recognizer::ArcFaceRecognizer;
use crate::image_buffer::ImageBuffer;
use crate::operators::{AnalysisError, FaceAnalysis};
use crate::types::{DetectedFace, FaceBox};

/// Detector + recognizer (+ gender/age head when loaded with the full
/// module set).
pub struct FaceAnalyzer {
    detector: ScrfdDetector,
    recognizer: ArcFaceRecognizer,
    attributes: Option<GenderAgeEstimator>,
}

impl FaceAnalyzer {
    pub fn new(
        detector: ScrfdDetector,
        recognizer: ArcFaceRecognizer,
        attributes: Option<GenderAgeEstimator>,
    ) -> Self {
        Self {
            detector,
            recognizer,
            attributes,
        }
    }
}

impl FaceAnalysis for FaceAnalyzer {
    fn detect(&self, image: &ImageBuffer) -> Result<Vec<DetectedFace>, AnalysisError> {
        let detections = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(detections.len());

        for RawDetection {
            bbox,
            score,
            landmarks,
        } in detections
        {
            // Every SCRFD export we load has a keypoint head; a face without
            // landmarks cannot be embedded.
            let Some(lms) = landmarks else {
                tracing::debug!(score, "detection without landmarks skipped");
                continue;
            };
            let embedding = self.recognizer.embed(image, &lms)?;
            let attributes = match &self.attributes {
                Some(head) => Some(head.estimate(image, &bbox)?),
                None => None,
            };

            faces.push(DetectedFace {
                bounding_box: FaceBox::from_f32(bbox[0], bbox[1], bbox[2], bbox[3]),
                score,
                embedding,
                landmarks: Some(lms),
                attributes,
            });
        }

        tracing::debug!(faces = faces.len(), "face analysis complete");
        Ok(faces)
    }
}
