//! Content-addressed design identity generation.
//!
//! A design identity binds a template name, a cycle number, and an arbitrary
//! specification structure into a single reproducible string of the shape
//! `{template}_c{cycle:04}_{hash}`. The hash suffix is computed over a
//! canonical encoding of the specification, so two processes that build the
//! same design always agree on its id, regardless of map iteration order or
//! set insertion order.
//!
//! # Canonical Encoding
//!
//! Specifications are modeled as [`SpecValue`], a tagged sum type:
//!
//! 1. Map keys are sorted lexicographically (byte order); duplicates are
//!    impossible by construction
//! 2. Set elements are sorted by their own canonical encoding
//! 3. Sequence order is preserved — sequence order is meaningful
//! 4. Floats use the shortest round-trip decimal form; NaN and infinities
//!    are rejected
//! 5. The encoding is tagged with [`SPEC_ENCODING_VERSION`] inside the hash
//!    input, so a change in serialization semantics is an explicit,
//!    reviewed event rather than a silent id drift
//!
//! # Template Alphabet
//!
//! Template names are restricted to lowercase ASCII letters and `_`. Digits
//! and mixed case are rejected so that versioning must go through an
//! explicit `template_version` field in the specification rather than ad
//! hoc string suffixes.
//!
//! # Example
//!
//! ```
//! use labgate_core::identity::{design_id, SpecValue};
//!
//! let spec = SpecValue::map([
//!     ("doses", SpecValue::seq([SpecValue::int(10), SpecValue::int(100)])),
//!     ("cell_line", SpecValue::str("hela")),
//! ]);
//! let id = design_id("dose_response", 3, &spec).unwrap();
//! assert!(id.starts_with("dose_response_c0003_"));
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

/// Version tag of the canonical specification encoding.
///
/// Participates in the hash input. Bump only with review: every bump
/// changes every design id.
pub const SPEC_ENCODING_VERSION: &str = "spec-enc-v1";

/// Domain separation prefix for design-id hashing.
const HASH_DOMAIN: &str = "labgate.design-id";

/// Hex digits emitted in a design id suffix.
pub const DESIGN_HASH_LEN: usize = 12;

/// Minimum accepted hash suffix length.
pub const MIN_HASH_LEN: usize = 8;

/// Errors raised while building a design identity.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum IdentityError {
    /// The template name contains characters outside `[a-z_]`.
    ///
    /// The restricted alphabet forces versioning through an explicit
    /// `template_version` spec field instead of name suffixes.
    #[error("invalid template name '{name}': {reason}")]
    InvalidTemplateName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The requested hash length is too short to be collision-resistant.
    ///
    /// This is a programmer error and is rejected immediately.
    #[error("hash length {requested} below minimum {min}")]
    HashTooShort {
        /// The requested length.
        requested: usize,
        /// The minimum allowed length.
        min: usize,
    },

    /// A float in the specification was NaN or infinite.
    #[error("non-finite number in specification: {value}")]
    NonFiniteNumber {
        /// The offending value.
        value: f64,
    },

    /// A JSON number could not be represented as `i64` or finite `f64`.
    #[error("unrepresentable number in specification: {repr}")]
    UnrepresentableNumber {
        /// Source representation of the number.
        repr: String,
    },
}

/// A tagged specification value with canonical hashing semantics.
///
/// `Map` and `Set` are unordered (reordering does not change the id);
/// `Seq` is ordered (reordering changes the id).
#[derive(Debug, Clone, PartialEq)]
pub enum SpecValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Finite float, encoded in shortest round-trip form.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered sequence — order is meaningful.
    Seq(Vec<SpecValue>),
    /// Unordered collection — sorted by canonical encoding before hashing.
    Set(Vec<SpecValue>),
    /// Unordered mapping — keys sorted before hashing.
    Map(BTreeMap<String, SpecValue>),
}

impl SpecValue {
    /// Builds an integer value.
    #[must_use]
    pub const fn int(v: i64) -> Self {
        Self::Int(v)
    }

    /// Builds a string value.
    #[must_use]
    pub fn str(v: impl Into<String>) -> Self {
        Self::Str(v.into())
    }

    /// Builds an ordered sequence.
    #[must_use]
    pub fn seq(items: impl IntoIterator<Item = Self>) -> Self {
        Self::Seq(items.into_iter().collect())
    }

    /// Builds an unordered set.
    #[must_use]
    pub fn set(items: impl IntoIterator<Item = Self>) -> Self {
        Self::Set(items.into_iter().collect())
    }

    /// Builds a mapping from `(key, value)` pairs.
    #[must_use]
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// Converts a JSON tree into a specification value.
    ///
    /// JSON arrays become ordered sequences; objects become maps. JSON has
    /// no set syntax, so callers that need set semantics build
    /// [`SpecValue::Set`] directly.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::UnrepresentableNumber`] for numbers outside
    /// `i64` that are not finite floats.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, IdentityError> {
        match value {
            serde_json::Value::Null => Ok(Self::Null),
            serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(f) = n.as_f64() {
                    if f.is_finite() {
                        Ok(Self::Float(f))
                    } else {
                        Err(IdentityError::NonFiniteNumber { value: f })
                    }
                } else {
                    Err(IdentityError::UnrepresentableNumber {
                        repr: n.to_string(),
                    })
                }
            },
            serde_json::Value::String(s) => Ok(Self::Str(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Self::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Seq),
            serde_json::Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), Self::from_json(v)?);
                }
                Ok(Self::Map(out))
            },
        }
    }

    /// Appends the canonical encoding of this value to `out`.
    fn encode_into(&self, out: &mut String) -> Result<(), IdentityError> {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            },
            Self::Float(f) => {
                if !f.is_finite() {
                    return Err(IdentityError::NonFiniteNumber { value: *f });
                }
                // Shortest round-trip decimal form; stable across platforms.
                let _ = write!(out, "{f:?}");
            },
            Self::Str(s) => encode_string(s, out),
            Self::Seq(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.encode_into(out)?;
                }
                out.push(']');
            },
            Self::Set(items) => {
                let mut encoded: Vec<String> = items
                    .iter()
                    .map(|item| {
                        let mut buf = String::new();
                        item.encode_into(&mut buf)?;
                        Ok(buf)
                    })
                    .collect::<Result<Vec<_>, IdentityError>>()?;
                encoded.sort_unstable();
                encoded.dedup();
                out.push('<');
                for (i, item) in encoded.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(item);
                }
                out.push('>');
            },
            Self::Map(map) => {
                out.push('{');
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    encode_string(k, out);
                    out.push(':');
                    v.encode_into(out)?;
                }
                out.push('}');
            },
        }
        Ok(())
    }

    /// Returns the canonical encoding of this value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value contains a non-finite float.
    pub fn canonical_encoding(&self) -> Result<String, IdentityError> {
        let mut out = String::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }
}

/// Appends a minimally escaped, double-quoted string.
fn encode_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            },
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Validates the restricted template-name alphabet.
fn validate_template(name: &str) -> Result<(), IdentityError> {
    if name.is_empty() {
        return Err(IdentityError::InvalidTemplateName {
            name: name.to_string(),
            reason: "name is empty",
        });
    }
    if !name.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        return Err(IdentityError::InvalidTemplateName {
            name: name.to_string(),
            reason: "must start with a lowercase letter",
        });
    }
    if let Some(bad) = name.chars().find(|c| !c.is_ascii_lowercase() && *c != '_') {
        let reason = if bad.is_ascii_digit() {
            "digits are not allowed; use a template_version spec field"
        } else if bad.is_ascii_uppercase() {
            "mixed case is not allowed"
        } else {
            "only lowercase letters and '_' are allowed"
        };
        return Err(IdentityError::InvalidTemplateName {
            name: name.to_string(),
            reason,
        });
    }
    Ok(())
}

/// Builds a design id with the default 12-hex-digit suffix.
///
/// Identical `(template, cycle, spec)` inputs always reproduce the
/// identical string, across processes. Reordering a map or set inside
/// `spec` does not change the id; reordering a sequence does.
///
/// # Errors
///
/// Returns [`IdentityError`] for a malformed template name or a
/// non-finite float in the specification.
pub fn design_id(template: &str, cycle: u32, spec: &SpecValue) -> Result<String, IdentityError> {
    design_id_with_len(template, cycle, spec, DESIGN_HASH_LEN)
}

/// Builds a design id with an explicit hash suffix length.
///
/// # Errors
///
/// Returns [`IdentityError::HashTooShort`] for `hash_len < MIN_HASH_LEN`
/// (programmer error, rejected immediately), plus the [`design_id`]
/// failure modes.
pub fn design_id_with_len(
    template: &str,
    cycle: u32,
    spec: &SpecValue,
    hash_len: usize,
) -> Result<String, IdentityError> {
    if hash_len < MIN_HASH_LEN {
        return Err(IdentityError::HashTooShort {
            requested: hash_len,
            min: MIN_HASH_LEN,
        });
    }
    validate_template(template)?;

    let encoded = spec.canonical_encoding()?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(HASH_DOMAIN.as_bytes());
    hasher.update(b"\n");
    hasher.update(SPEC_ENCODING_VERSION.as_bytes());
    hasher.update(b"\n");
    hasher.update(template.as_bytes());
    hasher.update(b"\n");
    hasher.update(cycle.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(encoded.as_bytes());
    let digest = hasher.finalize().to_hex();

    Ok(format!("{template}_c{cycle:04}_{}", &digest.as_str()[..hash_len]))
}
