//! In-memory fakes for the model backend and the three operator roles.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::image_buffer::ImageBuffer;
use crate::manager::{BackendError, LoadPlan, LoadStage, ModelBackend, ModelRole};
use crate::operators::{
    AnalysisError, FaceAnalysis, OperatorError, RestorationOperator, SwapOperator,
};
use crate::types::{DetectedFace, Embedding, FaceBox};

/// Color the fake swapper paints over each target face box.
pub const SWAP_COLOR: [u8; 3] = [255, 0, 255];

/// A face whose box starts at `(x, y)` with side `size`.
pub fn face_at(x: i32, y: i32, size: i32, score: f32) -> DetectedFace {
    let (fx, fy, s) = (x as f32, y as f32, size as f32);
    DetectedFace {
        bounding_box: FaceBox::new(x, y, x + size, y + size),
        score,
        embedding: Embedding::new(vec![score; 8]),
        landmarks: Some([
            (fx + 0.3 * s, fy + 0.4 * s),
            (fx + 0.7 * s, fy + 0.4 * s),
            (fx + 0.5 * s, fy + 0.6 * s),
            (fx + 0.35 * s, fy + 0.8 * s),
            (fx + 0.65 * s, fy + 0.8 * s),
        ]),
        attributes: None,
    }
}

/// An image in which [`FakeAnalyzer`] finds `faces` faces.
pub fn image_with_faces(width: u32, height: u32, faces: u8, fill: [u8; 3]) -> ImageBuffer {
    let mut img = ImageBuffer::filled(width, height, fill);
    img.put_pixel(0, 0, [faces, fill[1], fill[2]]);
    img
}

/// Finds as many faces as the red value of the top-left pixel, laid out
/// left to right as 8×8 boxes in descending score order.
pub struct FakeAnalyzer;

impl FaceAnalysis for FakeAnalyzer {
    fn detect(&self, image: &ImageBuffer) -> Result<Vec<DetectedFace>, AnalysisError> {
        let count = image.pixel(0, 0)[0] as i32;
        Ok((0..count)
            .map(|i| face_at(2 + i * 10, 2, 8, 0.9 - 0.1 * i as f32))
            .collect())
    }
}

/// Paints [`SWAP_COLOR`] over the target box; optionally fails on the n-th call.
pub struct FakeSwapper {
    calls: Arc<AtomicUsize>,
    fail_on_call: Option<usize>,
}

impl SwapOperator for FakeSwapper {
    fn swap(
        &self,
        frame: &ImageBuffer,
        target: &DetectedFace,
        _source: &DetectedFace,
    ) -> Result<ImageBuffer, OperatorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_call == Some(call) {
            return Err(OperatorError::InferenceFailed(format!("fake failure on call {call}")));
        }
        let mut out = frame.clone();
        if let Some(b) = target.bounding_box.clip(frame.width(), frame.height()) {
            for y in b.y1..b.y2 {
                for x in b.x1..b.x2 {
                    out.put_pixel(x as u32, y as u32, SWAP_COLOR);
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RestoreBehavior {
    /// Return a uniformly colored image of the input's size.
    Fill([u8; 3]),
    /// Return `Ok(None)`.
    Nothing,
    Fail,
}

pub struct FakeRestorer {
    calls: Arc<AtomicUsize>,
    behavior: RestoreBehavior,
}

impl RestorationOperator for FakeRestorer {
    fn restore(&self, image: &ImageBuffer, _weight: f32) -> Result<Option<ImageBuffer>, OperatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            RestoreBehavior::Fill(rgb) => Ok(Some(ImageBuffer::filled(image.width(), image.height(), rgb))),
            RestoreBehavior::Nothing => Ok(None),
            RestoreBehavior::Fail => Err(OperatorError::InferenceFailed("fake restorer failure".into())),
        }
    }
}

/// Records every stage it is asked to run and fails the configured ones.
pub struct FakeBackend {
    failing: HashSet<(ModelRole, LoadStage)>,
    delay: Duration,
    role_delays: HashMap<ModelRole, Duration>,
    attempts: Mutex<Vec<(ModelRole, LoadStage)>>,
    loads: Mutex<HashMap<ModelRole, usize>>,
    pub swap_calls: Arc<AtomicUsize>,
    swap_fail_on_call: Option<usize>,
    pub restore_calls: Arc<AtomicUsize>,
    restore_behavior: RestoreBehavior,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            failing: HashSet::new(),
            delay: Duration::ZERO,
            role_delays: HashMap::new(),
            attempts: Mutex::new(Vec::new()),
            loads: Mutex::new(HashMap::new()),
            swap_calls: Arc::new(AtomicUsize::new(0)),
            swap_fail_on_call: None,
            restore_calls: Arc::new(AtomicUsize::new(0)),
            restore_behavior: RestoreBehavior::Fill([7, 7, 7]),
        }
    }

    pub fn failing(mut self, role: ModelRole, stage: LoadStage) -> Self {
        self.failing.insert((role, stage));
        self
    }

    pub fn failing_role(self, role: ModelRole) -> Self {
        self.failing(role, LoadStage::Preferred)
            .failing(role, LoadStage::CpuFallback)
            .failing(role, LoadStage::LocalFile)
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    /// Delay every load attempt of `role`; overrides [`Self::with_delay_ms`].
    pub fn delay_for(mut self, role: ModelRole, ms: u64) -> Self {
        self.role_delays.insert(role, Duration::from_millis(ms));
        self
    }

    pub fn swap_failing_on_call(mut self, call: usize) -> Self {
        self.swap_fail_on_call = Some(call);
        self
    }

    pub fn restoring(mut self, behavior: RestoreBehavior) -> Self {
        self.restore_behavior = behavior;
        self
    }

    pub fn attempts_for(&self, role: ModelRole) -> Vec<LoadStage> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, s)| *s)
            .collect()
    }

    /// Successful loads of `role`.
    pub fn load_count(&self, role: ModelRole) -> usize {
        self.loads.lock().unwrap().get(&role).copied().unwrap_or(0)
    }

    fn attempt(&self, plan: &LoadPlan) -> Result<(), BackendError> {
        self.attempts.lock().unwrap().push((plan.role, plan.stage));
        let delay = self.role_delays.get(&plan.role).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.failing.contains(&(plan.role, plan.stage)) {
            return Err(format!("{:?} stage disabled for {}", plan.stage, plan.role).into());
        }
        *self.loads.lock().unwrap().entry(plan.role).or_insert(0) += 1;
        Ok(())
    }
}

impl ModelBackend for FakeBackend {
    fn load_analyzer(&self, plan: &LoadPlan) -> Result<Box<dyn FaceAnalysis>, BackendError> {
        self.attempt(plan)?;
        Ok(Box::new(FakeAnalyzer))
    }

    fn load_swapper(&self, plan: &LoadPlan) -> Result<Box<dyn SwapOperator>, BackendError> {
        self.attempt(plan)?;
        Ok(Box::new(FakeSwapper {
            calls: Arc::clone(&self.swap_calls),
            fail_on_call: self.swap_fail_on_call,
        }))
    }

    fn load_restorer(&self, plan: &LoadPlan) -> Result<Box<dyn RestorationOperator>, BackendError> {
        self.attempt(plan)?;
        Ok(Box::new(FakeRestorer {
            calls: Arc::clone(&self.restore_calls),
            behavior: self.restore_behavior,
        }))
    }
}
