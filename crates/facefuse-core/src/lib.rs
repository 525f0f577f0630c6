//! facefuse-core: face swap and face restoration engine.
//!
//! SCRFD + ArcFace for analysis, inswapper_128 for identity swap and GFPGAN
//! for restoration, all running through ONNX Runtime. Models load lazily per
//! role through a device-aware fallback cascade; restoration degrades to a
//! classical filter chain when no model can be loaded.

pub mod alignment;
pub mod compositor;
pub mod config;
pub mod device;
pub mod filters;
pub mod image_buffer;
pub mod manager;
pub mod onnx;
pub mod operators;
pub mod params;
pub mod resolver;
pub mod restore;
pub mod swap;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use device::{Backend, DevicePreference, DeviceProfile};
pub use image_buffer::ImageBuffer;
pub use manager::{ManagerStatus, ModelLoadError, ModelManager, ModelRole};
pub use params::{RestoreParams, SwapParams};
pub use restore::{FaceRestorationEngine, RestoreError, RestorePath};
pub use swap::{FaceSwapEngine, SwapError};
pub use types::{DetectedFace, Embedding, FaceBox};
