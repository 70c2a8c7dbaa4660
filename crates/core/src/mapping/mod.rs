//! Value mapping applied before a parameter is sent to the controller.

use serde::{Deserialize, Serialize};

/// Exclusive lower bound of the normalised tempo range.
pub const NORMALIZED_MIN: f32 = 20.0;
/// Exclusive upper bound of the normalised tempo range.
pub const NORMALIZED_MAX: f32 = 500.0;

/// Describes how a raw value is transformed for its destination parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueMapping {
    /// Send the value unchanged.
    #[default]
    Verbatim,
    /// Linear remap of `(20, 500)` onto `[0, 1)`, the tempo parameter range
    /// used by Resolume. Values outside the range are dropped, not clamped.
    Normalized,
}

impl ValueMapping {
    pub fn from_flag(normalize: bool) -> Self {
        if normalize {
            Self::Normalized
        } else {
            Self::Verbatim
        }
    }
}

/// Maps a tempo into the normalised range, or `None` when it falls outside
/// the open interval `(20, 500)`.
pub fn normalize_tempo(value: f32) -> Option<f32> {
    if value > NORMALIZED_MIN && value < NORMALIZED_MAX {
        Some((value - NORMALIZED_MIN) / (NORMALIZED_MAX - NORMALIZED_MIN))
    } else {
        None
    }
}
