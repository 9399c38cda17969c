//! Condition canonicalization for float-noise-proof aggregation.
//!
//! This module quantizes raw dose/time measurements into integer units and
//! builds immutable, hashable condition keys. Replicate wells produced with
//! floating-point jitter (e.g. `1.0000000001 µM` vs `0.9999999999 µM`) must
//! land in the same aggregation group, so all downstream bookkeeping is keyed
//! on [`CanonicalCondition`] rather than raw floats.
//!
//! # Quantization Rules
//!
//! 1. Doses are expressed in integer nanomolar (input is micromolar, ×1000)
//! 2. Times are expressed in integer minutes (input is hours, ×60)
//! 3. Rounding is half-to-even (banker's rounding), matching IEEE 754
//! 4. NaN, infinite, and negative inputs are rejected, never clamped
//!
//! Two raw values whose true difference is below one resolution unit
//! canonicalize to the same integer; values at least one unit apart
//! canonicalize to different integers.
//!
//! # Example
//!
//! ```
//! use labgate_core::canonical::{dose_to_nanomolar, make_condition, PositionClass};
//!
//! assert_eq!(dose_to_nanomolar(1.0).unwrap(), 1000);
//! assert_eq!(dose_to_nanomolar(0.0015).unwrap(), 2); // 1.5 nM rounds to even
//!
//! let a = make_condition("hela", "tunicamycin", 1.0, 24.0, "ldh", PositionClass::Center).unwrap();
//! let b = make_condition("hela", "tunicamycin", 1.0 + 1e-9, 24.0, "ldh", PositionClass::Center).unwrap();
//! assert_eq!(a, b);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Nanomolar per micromolar.
const NM_PER_UM: f64 = 1_000.0;

/// Minutes per hour.
const MIN_PER_HOUR: f64 = 60.0;

/// Largest quantized magnitude accepted.
///
/// 2^53 is the largest integer range `f64` represents exactly; anything
/// above it cannot round-trip through the quantizer without precision loss.
const MAX_QUANTIZED: f64 = 9_007_199_254_740_992.0;

/// Errors raised at the canonicalization boundary.
///
/// These are ordinary validation failures: malformed input is rejected
/// before it can reach the belief ledger. Contract breaks between
/// components use the invariant-violation types instead.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ValidationError {
    /// A numeric input was NaN or infinite.
    #[error("{field} must be finite, got {value}")]
    NonFinite {
        /// The input field being converted.
        field: &'static str,
        /// The offending value.
        value: f64,
    },

    /// A numeric input was negative.
    #[error("{field} must be non-negative, got {value}")]
    Negative {
        /// The input field being converted.
        field: &'static str,
        /// The offending value.
        value: f64,
    },

    /// A quantized value exceeded the exactly-representable integer range.
    #[error("{field} out of range after quantization: {value}")]
    OutOfRange {
        /// The input field being converted.
        field: &'static str,
        /// The offending value.
        value: f64,
    },

    /// A position tag did not name a known position class.
    #[error("unknown position class tag: '{tag}'")]
    UnknownPositionClass {
        /// The unrecognized tag.
        tag: String,
    },
}

/// Plate position class of a well.
///
/// Position classes partition wells by their susceptibility to edge
/// effects; calibration provenance is accumulated per class.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PositionClass {
    /// Interior wells, away from plate edges.
    Center,
    /// Wells along a plate edge.
    Edge,
    /// The four corner wells.
    Corner,
}

impl PositionClass {
    /// Returns all position classes.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Center, Self::Edge, Self::Corner]
    }

    /// Returns the stable string tag for this class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Center => "center",
            Self::Edge => "edge",
            Self::Corner => "corner",
        }
    }

    /// Parses a position tag.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::UnknownPositionClass`] for unrecognized
    /// tags.
    pub fn from_tag(tag: &str) -> Result<Self, ValidationError> {
        match tag {
            "center" => Ok(Self::Center),
            "edge" => Ok(Self::Edge),
            "corner" => Ok(Self::Corner),
            other => Err(ValidationError::UnknownPositionClass {
                tag: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for PositionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, quantized identity for an experimental condition.
///
/// Equality and hashing are structural, so two conditions built from
/// jittered floats compare equal once quantized. Instances are constructed
/// fresh per observation, never mutated, and used only as mapping keys.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields)]
pub struct CanonicalCondition {
    /// Cell line identifier.
    pub cell_line: String,
    /// Compound identifier.
    pub compound: String,
    /// Dose in integer nanomolar.
    pub dose_nm: u64,
    /// Exposure time in integer minutes.
    pub time_min: u64,
    /// Assay name.
    pub assay: String,
    /// Plate position class.
    pub position_class: PositionClass,
}

impl CanonicalCondition {
    /// Returns a stable pipe-joined key string for event records.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}nM|{}min|{}|{}",
            self.cell_line, self.compound, self.dose_nm, self.time_min, self.assay,
            self.position_class
        )
    }
}

impl fmt::Display for CanonicalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Quantizes a value into integer target units.
fn quantize(value: f64, scale: f64, field: &'static str) -> Result<u64, ValidationError> {
    if value.is_nan() || value.is_infinite() {
        return Err(ValidationError::NonFinite { field, value });
    }
    if value < 0.0 {
        return Err(ValidationError::Negative { field, value });
    }
    let scaled = (value * scale).round_ties_even();
    if scaled > MAX_QUANTIZED {
        return Err(ValidationError::OutOfRange { field, value });
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let quantized = scaled as u64;
    Ok(quantized)
}

/// Converts a dose in micromolar to integer nanomolar.
///
/// Rounds half-to-even at 1 nM resolution.
///
/// # Errors
///
/// Returns [`ValidationError`] on NaN, infinite, negative, or
/// out-of-range input. Malformed doses are never clamped.
pub fn dose_to_nanomolar(um: f64) -> Result<u64, ValidationError> {
    quantize(um, NM_PER_UM, "dose")
}

/// Converts an exposure time in hours to integer minutes.
///
/// Rounds half-to-even at 1 minute resolution.
///
/// # Errors
///
/// Returns [`ValidationError`] on NaN, infinite, negative, or
/// out-of-range input.
pub fn time_to_minutes(hours: f64) -> Result<u64, ValidationError> {
    quantize(hours, MIN_PER_HOUR, "time")
}

/// Builds a canonical condition from raw observation fields.
///
/// Pure and order-independent: building the same five fields in any call
/// order, or from a batch processed in any order, yields structurally
/// equal keys.
///
/// # Errors
///
/// Returns [`ValidationError`] if dose or time fail quantization.
pub fn make_condition(
    cell_line: &str,
    compound: &str,
    dose_um: f64,
    time_hours: f64,
    assay: &str,
    position_class: PositionClass,
) -> Result<CanonicalCondition, ValidationError> {
    Ok(CanonicalCondition {
        cell_line: cell_line.to_string(),
        compound: compound.to_string(),
        dose_nm: dose_to_nanomolar(dose_um)?,
        time_min: time_to_minutes(time_hours)?,
        assay: assay.to_string(),
        position_class,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_dose_basic_scaling() {
        assert_eq!(dose_to_nanomolar(1.0).unwrap(), 1000);
        assert_eq!(dose_to_nanomolar(1.001).unwrap(), 1001);
        assert_eq!(dose_to_nanomolar(0.0).unwrap(), 0);
    }

    #[test]
    fn test_dose_round_half_to_even() {
        assert_eq!(dose_to_nanomolar(0.0005).unwrap(), 0); // 0.5 -> 0
        assert_eq!(dose_to_nanomolar(0.0015).unwrap(), 2); // 1.5 -> 2
        assert_eq!(dose_to_nanomolar(0.0025).unwrap(), 2); // 2.5 -> 2
        assert_eq!(dose_to_nanomolar(0.0035).unwrap(), 4); // 3.5 -> 4
    }

    #[test]
    fn test_dose_jitter_collapses() {
        let base = dose_to_nanomolar(1.0).unwrap();
        for jitter in [1e-9, -1e-9, 1e-7, -1e-7, 9e-6] {
            let jittered = dose_to_nanomolar(1.0 + jitter).unwrap();
            assert_eq!(base, jittered, "jitter {jitter} split the group");
        }
    }

    #[test]
    fn test_dose_rejects_nan() {
        let err = dose_to_nanomolar(f64::NAN).unwrap_err();
        assert!(matches!(err, ValidationError::NonFinite { field: "dose", .. }));
    }

    #[test]
    fn test_dose_rejects_infinite() {
        assert!(matches!(
            dose_to_nanomolar(f64::INFINITY),
            Err(ValidationError::NonFinite { .. })
        ));
        assert!(matches!(
            dose_to_nanomolar(f64::NEG_INFINITY),
            Err(ValidationError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_dose_rejects_negative_never_clamps() {
        let err = dose_to_nanomolar(-0.5).unwrap_err();
        assert!(matches!(err, ValidationError::Negative { field: "dose", .. }));
    }

    #[test]
    fn test_dose_out_of_range() {
        assert!(matches!(
            dose_to_nanomolar(1e20),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_time_scaling_and_rounding() {
        assert_eq!(time_to_minutes(24.0).unwrap(), 1440);
        assert_eq!(time_to_minutes(0.5).unwrap(), 30);
        // 0.025 h = 1.5 min -> rounds to even 2
        assert_eq!(time_to_minutes(0.025).unwrap(), 2);
        assert!(matches!(
            time_to_minutes(-1.0),
            Err(ValidationError::Negative { field: "time", .. })
        ));
    }

    #[test]
    fn test_position_class_round_trip() {
        for &class in PositionClass::all() {
            assert_eq!(PositionClass::from_tag(class.as_str()).unwrap(), class);
        }
        assert!(matches!(
            PositionClass::from_tag("middle"),
            Err(ValidationError::UnknownPositionClass { .. })
        ));
    }

    #[test]
    fn test_make_condition_structural_equality() {
        let a = make_condition("hela", "tunicamycin", 1.0, 24.0, "ldh", PositionClass::Center)
            .unwrap();
        let b = make_condition(
            "hela",
            "tunicamycin",
            1.0 + 1e-9,
            24.0 - 1e-9,
            "ldh",
            PositionClass::Center,
        )
        .unwrap();
        assert_eq!(a, b);

        let c = make_condition("hela", "tunicamycin", 1.001, 24.0, "ldh", PositionClass::Center)
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_condition_usable_as_map_key() {
        let mut groups: HashMap<CanonicalCondition, u32> = HashMap::new();
        for jitter in [0.0, 1e-9, -1e-9, 2e-8] {
            let cond = make_condition(
                "hela",
                "tunicamycin",
                1.0 + jitter,
                24.0,
                "ldh",
                PositionClass::Center,
            )
            .unwrap();
            *groups.entry(cond).or_insert(0) += 1;
        }
        // All four jittered replicates collapse into one group.
        assert_eq!(groups.len(), 1);
        assert_eq!(groups.values().copied().sum::<u32>(), 4);
    }

    #[test]
    fn test_condition_key_is_stable() {
        let cond = make_condition("hela", "dmso", 0.01, 1.0, "noise", PositionClass::Edge)
            .unwrap();
        assert_eq!(cond.key(), "hela|dmso|10nM|60min|noise|edge");
    }

    proptest! {
        /// Doses within 1e-5 µM of each other quantize identically.
        #[test]
        fn prop_sub_resolution_jitter_is_invisible(
            um in 0.0f64..1_000.0,
            jitter in -1e-5f64..1e-5,
        ) {
            let a = dose_to_nanomolar(um);
            let b = dose_to_nanomolar((um + jitter).max(0.0));
            // Away from exact .5 boundaries the results must agree; at a
            // boundary they may differ by at most one unit.
            if let (Ok(a), Ok(b)) = (a, b) {
                prop_assert!(a.abs_diff(b) <= 1);
            }
        }

        /// Quantization is monotone: a larger dose never yields a smaller key.
        #[test]
        fn prop_quantization_monotone(a in 0.0f64..1e6, b in 0.0f64..1e6) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(dose_to_nanomolar(lo).unwrap() <= dose_to_nanomolar(hi).unwrap());
        }
    }
}
