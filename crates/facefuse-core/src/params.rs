use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
    #[error("{name} must be a positive number, got {value}")]
    NotPositive { name: &'static str, value: f32 },
}

fn check(name: &'static str, value: f32, min: f32, max: f32) -> Result<(), ParamError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ParamError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapParams {
    /// Weight of the swapped result in the final mix.
    pub blend_strength: f32,
    pub color_correction: bool,
    /// Must be a finite positive number; there is no upper bound. Not used
    /// by the swap operator, which works at its native crop scale.
    pub face_scale: f32,
}

impl Default for SwapParams {
    fn default() -> Self {
        Self {
            blend_strength: 0.8,
            color_correction: true,
            face_scale: 1.0,
        }
    }
}

impl SwapParams {
    /// Reject out-of-range values. The engine itself clamps instead.
    pub fn validate(&self) -> Result<(), ParamError> {
        check("blend_strength", self.blend_strength, 0.0, 1.0)?;
        if self.face_scale.is_finite() && self.face_scale > 0.0 {
            Ok(())
        } else {
            Err(ParamError::NotPositive {
                name: "face_scale",
                value: self.face_scale,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreParams {
    /// Restoration weight on the model path, final mix weight on the
    /// classical path.
    pub strength: f32,
    pub denoise_level: f32,
    pub sharpen_amount: f32,
    pub enhance_details: bool,
}

impl Default for RestoreParams {
    fn default() -> Self {
        Self {
            strength: 0.5,
            denoise_level: 0.3,
            sharpen_amount: 0.2,
            enhance_details: true,
        }
    }
}

impl RestoreParams {
    pub fn validate(&self) -> Result<(), ParamError> {
        check("strength", self.strength, 0.0, 1.0)?;
        check("denoise_level", self.denoise_level, 0.0, 1.0)?;
        check("sharpen_amount", self.sharpen_amount, 0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SwapParams::default().validate().is_ok());
        assert!(RestoreParams::default().validate().is_ok());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let p = SwapParams {
            blend_strength: 1.5,
            ..SwapParams::default()
        };
        assert_eq!(
            p.validate(),
            Err(ParamError::OutOfRange {
                name: "blend_strength",
                value: 1.5,
                min: 0.0,
                max: 1.0
            })
        );

        let r = RestoreParams {
            sharpen_amount: -0.1,
            ..RestoreParams::default()
        };
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_sharpen_amount_is_a_unit_interval() {
        let at_max = RestoreParams {
            sharpen_amount: 1.0,
            ..RestoreParams::default()
        };
        assert!(at_max.validate().is_ok());

        let over = RestoreParams {
            sharpen_amount: 1.5,
            ..RestoreParams::default()
        };
        assert_eq!(
            over.validate(),
            Err(ParamError::OutOfRange {
                name: "sharpen_amount",
                value: 1.5,
                min: 0.0,
                max: 1.0
            })
        );
    }

    #[test]
    fn test_face_scale_only_needs_to_be_positive() {
        for ok in [0.05, 1.0, 8.0] {
            let p = SwapParams {
                face_scale: ok,
                ..SwapParams::default()
            };
            assert!(p.validate().is_ok(), "{ok}");
        }
        for bad in [0.0, -1.0, f32::INFINITY, f32::NAN] {
            let p = SwapParams {
                face_scale: bad,
                ..SwapParams::default()
            };
            assert!(
                matches!(p.validate(), Err(ParamError::NotPositive { name: "face_scale", .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_nan_rejected() {
        let r = RestoreParams {
            strength: f32::NAN,
            ..RestoreParams::default()
        };
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_boundaries_accepted() {
        let p = SwapParams {
            blend_strength: 0.0,
            ..SwapParams::default()
        };
        assert!(p.validate().is_ok());
        let p = SwapParams {
            blend_strength: 1.0,
            ..SwapParams::default()
        };
        assert!(p.validate().is_ok());
    }
}
