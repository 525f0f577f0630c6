//! SCRFD face detector via ONNX Runtime.
//!
//! 3-stride anchor decoding with 2 anchors per cell, followed by NMS. Input
//! frames are resized keeping their aspect ratio and placed at the top-left
//! of the square detector input.

use std::path::Path;
use std::sync::Mutex;

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

use super::OnnxLoadError;
use crate::device::ExecutionProvider;
use crate::image_buffer::ImageBuffer;
use crate::operators::AnalysisError;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// One detection in frame coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    /// `[x1, y1, x2, y2]`
    pub bbox: [f32; 4],
    pub score: f32,
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

pub struct ScrfdDetector {
    session: Mutex<Session>,
    input_size: usize,
    threshold: f32,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    pub fn load(
        path: &Path,
        providers: &[ExecutionProvider],
        intra_threads: usize,
        input_size: usize,
        threshold: f32,
    ) -> Result<Self, OnnxLoadError> {
        let session = super::load_session(path, providers, intra_threads)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(OnnxLoadError::InvalidModel {
                path: path.to_path_buf(),
                reason: format!(
                    "SCRFD needs 9 outputs (3 strides x score/bbox/kps), got {}",
                    output_names.len()
                ),
            });
        }
        if input_size == 0 || input_size % SCRFD_STRIDES[2] != 0 {
            return Err(OnnxLoadError::InvalidModel {
                path: path.to_path_buf(),
                reason: format!("detection size {input_size} is not a multiple of 32"),
            });
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, input_size, threshold, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            input_size,
            threshold,
            stride_indices,
        })
    }

    /// Faces in `image`, sorted by descending score.
    pub fn detect(&self, image: &ImageBuffer) -> Result<Vec<RawDetection>, AnalysisError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, det_scale) = preprocess(image, self.input_size);

        let mut all_detections = Vec::new();
        {
            let mut session = self.session.lock().map_err(|_| AnalysisError::Poisoned)?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
                let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];
                let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                    AnalysisError::InferenceFailed(format!("scores stride {stride}: {e}"))
                })?;
                let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                    AnalysisError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
                })?;
                let (_, kps) = outputs[kps_idx].try_extract_tensor::<f32>().map_err(|e| {
                    AnalysisError::InferenceFailed(format!("kps stride {stride}: {e}"))
                })?;

                all_detections.extend(decode_stride(
                    scores,
                    bboxes,
                    kps,
                    stride,
                    self.input_size,
                    det_scale,
                    self.threshold,
                ));
            }
        }

        // nms keeps its input order, which is already by descending score.
        Ok(nms(all_detections, SCRFD_NMS_THRESHOLD))
    }
}

/// Resize into the top-left of a `size × size` tensor, zero-padded.
///
/// Returns the tensor and the factor from frame to tensor coordinates.
fn preprocess(image: &ImageBuffer, size: usize) -> (Array4<f32>, f32) {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let (new_w, new_h) = if height > width {
        (((size * width) / height).max(1), size)
    } else {
        (size, ((size * height) / width).max(1))
    };
    let det_scale = new_h as f32 / height as f32;

    let resized = resize_bilinear(image, new_w, new_h);
    let src = resized.data();
    let pad = (0.0 - SCRFD_MEAN) / SCRFD_STD;

    let tensor = Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
        if y < new_h && x < new_w {
            (src[(y * new_w + x) * 3 + c] as f32 - SCRFD_MEAN) / SCRFD_STD
        } else {
            pad
        }
    });
    (tensor, det_scale)
}

/// Bilinear resize with half-pixel centers.
fn resize_bilinear(image: &ImageBuffer, new_w: usize, new_h: usize) -> ImageBuffer {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let frame = image.data();
    let inv_x = width as f32 / new_w as f32;
    let inv_y = height as f32 / new_h as f32;

    let mut resized = ImageBuffer::filled(new_w as u32, new_h as u32, [0, 0, 0]);
    let out = resized.data_mut();
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            for c in 0..3 {
                let tl = frame[(y0 * width + x0) * 3 + c] as f32;
                let tr = frame[(y0 * width + x1) * 3 + c] as f32;
                let bl = frame[(y1 * width + x0) * 3 + c] as f32;
                let br = frame[(y1 * width + x1) * 3 + c] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;
                out[(y * new_w + x) * 3 + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    resized
}

/// Map SCRFD outputs to stride slots.
///
/// Named exports ("score_8", "bbox_16", "kps_32", ...) are matched by name;
/// anything else falls back to the positional layout
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };
    let lookup = |stride: usize| -> Option<StrideOutputIndices> {
        Some((
            find("score", stride)?,
            find("bbox", stride)?,
            find("kps", stride)?,
        ))
    };

    match (
        lookup(SCRFD_STRIDES[0]),
        lookup(SCRFD_STRIDES[1]),
        lookup(SCRFD_STRIDES[2]),
    ) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    det_scale: f32,
    threshold: f32,
) -> Vec<RawDetection> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score < threshold {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid) as f32 * s;
        let anchor_cy = (cell / grid) as f32 * s;

        let Some(d) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let bbox = [
            (anchor_cx - d[0] * s) / det_scale,
            (anchor_cy - d[1] * s) / det_scale,
            (anchor_cx + d[2] * s) / det_scale,
            (anchor_cy + d[3] * s) / det_scale,
        ];

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| {
                (
                    (anchor_cx + k[i * 2] * s) / det_scale,
                    (anchor_cy + k[i * 2 + 1] * s) / det_scale,
                )
            })
        });

        detections.push(RawDetection {
            bbox,
            score,
            landmarks,
        });
    }
    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<RawDetection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union with the +1 pixel area convention.
fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let [ax1, ay1, ax2, ay2] = a.bbox;
    let [bx1, by1, bx2, by2] = b.bbox;

    let inter_w = (ax2.min(bx2) - ax1.max(bx1) + 1.0).max(0.0);
    let inter_h = (ay2.min(by2) - ay1.max(by1) + 1.0).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (ax2 - ax1 + 1.0) * (ay2 - ay1 + 1.0);
    let area_b = (bx2 - bx1 + 1.0) * (by2 - by1 + 1.0);
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
