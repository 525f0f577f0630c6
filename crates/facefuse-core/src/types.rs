use serde::{Deserialize, Serialize};

/// Which input image of a swap a face (or a failure) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Target,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Target => f.write_str("target"),
        }
    }
}

/// Integer pixel box `(x1, y1, x2, y2)`, exclusive on the right/bottom edge.
///
/// Detector output is truncated toward zero, so a box may extend past the
/// image on any side; use [`FaceBox::clip`] before indexing pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl FaceBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Truncate a float box the way the detector reports it.
    pub fn from_f32(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32)
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// Clip to `[0, width) x [0, height)`. Returns `None` when nothing remains.
    pub fn clip(&self, width: u32, height: u32) -> Option<FaceBox> {
        let clipped = FaceBox {
            x1: self.x1.max(0),
            y1: self.y1.max(0),
            x2: self.x2.min(width as i32),
            y2: self.y2.min(height as i32),
        };
        if clipped.x2 <= clipped.x1 || clipped.y2 <= clipped.y1 {
            None
        } else {
            Some(clipped)
        }
    }
}

/// Face identity embedding (512-dimensional for ArcFace w600k_r50).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// L2-normalized copy. A zero vector is returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        if norm > 0.0 {
            Embedding::new(self.values.iter().map(|v| v / norm).collect())
        } else {
            self.clone()
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
}

/// Output of the auxiliary gender/age head; only present when the analyzer
/// was loaded with its full module set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceAttributes {
    pub gender: Gender,
    pub age: u32,
}

/// A face found by the analyzer in one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounding_box: FaceBox,
    pub score: f32,
    pub embedding: Embedding,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
    pub attributes: Option<FaceAttributes>,
}
