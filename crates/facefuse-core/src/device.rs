//! Compute backend selection.
//!
//! The profile is resolved once, when the model manager is built, and never
//! changes afterwards. Policy: CUDA, then the platform's secondary
//! accelerator (CoreML / Metal), then CPU.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Gpu,
    GpuMetal,
    Cpu,
}

impl Backend {
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, Backend::Cpu)
    }
}

/// ONNX Runtime execution provider, in the order sessions should try them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    Cuda,
    CoreMl,
    Cpu,
}

impl ExecutionProvider {
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, ExecutionProvider::Cpu)
    }
}

/// Requested backend from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" | "mps" | "coreml" => Ok(Self::Metal),
            other => Err(format!("unknown device '{other}' (expected auto, cpu, cuda or metal)")),
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
        };
        f.write_str(s)
    }
}

/// What the host can run.
pub trait HostProbe {
    fn cuda_available(&self) -> bool;
    fn metal_available(&self) -> bool;
}

/// Asks ONNX Runtime which of the compiled-in providers are usable.
pub struct OrtProbe;

impl HostProbe for OrtProbe {
    fn cuda_available(&self) -> bool {
        #[cfg(feature = "cuda")]
        {
            use ort::execution_providers::ExecutionProvider as _;
            ort::execution_providers::CUDAExecutionProvider::default()
                .is_available()
                .unwrap_or(false)
        }
        #[cfg(not(feature = "cuda"))]
        {
            false
        }
    }

    fn metal_available(&self) -> bool {
        #[cfg(target_os = "macos")]
        {
            use ort::execution_providers::ExecutionProvider as _;
            ort::execution_providers::CoreMLExecutionProvider::default()
                .is_available()
                .unwrap_or(false)
        }
        #[cfg(not(target_os = "macos"))]
        {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    pub backend: Backend,
    /// Ordered provider list; accelerated backends end with CPU.
    pub execution_providers: Vec<ExecutionProvider>,
    /// `0` on accelerated backends, `-1` on CPU.
    pub context_id: i32,
}

impl DeviceProfile {
    pub fn for_backend(backend: Backend) -> Self {
        let (execution_providers, context_id) = match backend {
            Backend::Gpu => (vec![ExecutionProvider::Cuda, ExecutionProvider::Cpu], 0),
            Backend::GpuMetal => (vec![ExecutionProvider::CoreMl, ExecutionProvider::Cpu], 0),
            Backend::Cpu => (vec![ExecutionProvider::Cpu], -1),
        };
        Self {
            backend,
            execution_providers,
            context_id,
        }
    }

    pub fn cpu() -> Self {
        Self::for_backend(Backend::Cpu)
    }

    /// Pick a backend from what `probe` reports, honoring `preference` when
    /// that backend is available.
    pub fn resolve(probe: &dyn HostProbe, preference: DevicePreference) -> Self {
        let cuda = probe.cuda_available();
        let metal = probe.metal_available();

        let backend = match preference {
            DevicePreference::Cpu => Backend::Cpu,
            DevicePreference::Cuda if cuda => Backend::Gpu,
            DevicePreference::Metal if metal => Backend::GpuMetal,
            _ => {
                if preference != DevicePreference::Auto {
                    tracing::warn!(
                        requested = %preference,
                        "requested device unavailable, using automatic selection"
                    );
                }
                if cuda {
                    Backend::Gpu
                } else if metal {
                    Backend::GpuMetal
                } else {
                    Backend::Cpu
                }
            }
        };

        let profile = Self::for_backend(backend);
        tracing::info!(
            backend = ?profile.backend,
            providers = ?profile.execution_providers,
            context_id = profile.context_id,
            "device profile resolved"
        );
        profile
    }

    /// Resolve against the real host.
    pub fn detect(preference: DevicePreference) -> Self {
        Self::resolve(&OrtProbe, preference)
    }
}
