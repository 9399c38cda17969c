//! Ground-truth perimeter: the information-flow boundary for agent output.
//!
//! Every structure that may ever reach the agent — observation summaries,
//! decision receipts, simulator results re-entering the core — passes
//! through [`PerimeterPolicy::assert_no_forbidden`], a recursive scan that
//! rejects any key containing a forbidden substring at any depth. The scan
//! operates on a generic tagged value tree (`serde_json::Value`), so no
//! agent-facing type can smuggle a privileged field past it by nesting.
//!
//! # Security Model
//!
//! - **Fail-closed**: a forbidden key anywhere in the tree is a fatal
//!   [`PerimeterViolation`], not a recoverable refusal.
//! - **Single escape hatch**: the `_debug_truth` subtree is exempt, and
//!   only when the policy was constructed with debug enabled. Without the
//!   flag, the subtree's mere presence is a violation.
//! - **Knowledge vs. memory**: agent-chosen action parameters (the dose the
//!   agent itself selected, its timing, its template kwargs) are agent
//!   memory, not leaked ground truth, and are never banned.
//! - **Modality overlays**: per-assay extra bans layer on top of the global
//!   set — a field allowed for one assay type may be forbidden for another.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// The sole exempt subtree name, honored only in debug mode.
pub const DEBUG_SUBTREE: &str = "_debug_truth";

/// Maximum recursion depth for the perimeter scan.
///
/// Prevents stack exhaustion from adversarially nested payloads.
pub const MAX_DEPTH: usize = 128;

/// Global forbidden key substrings.
///
/// These name simulator internals that must never reach agent-facing
/// output: ground-truth viability labels, death mode/cause labels, latent
/// stress state, internal dose-response parameters, and contamination
/// labels. Matching is substring containment on lowercased keys.
pub const GLOBAL_FORBIDDEN: &[&str] = &[
    "true_viability",
    "viability_truth",
    "death_mode",
    "death_cause",
    "latent_stress",
    "ec50",
    "hill_slope",
    "contamination",
    "contaminated",
];

/// Violations raised by the perimeter scan.
///
/// These are invariant-class failures: a forbidden key reaching the
/// perimeter means a contract between components is broken. They are
/// intentionally not caught by ordinary control flow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PerimeterViolation {
    /// A key matched a forbidden pattern.
    #[error("forbidden key '{key}' at '{path}' (matched pattern '{pattern}')")]
    ForbiddenKey {
        /// The offending key.
        key: String,
        /// Dotted path to the offending key.
        path: String,
        /// The forbidden substring that matched.
        pattern: String,
    },

    /// The debug subtree exists but debug mode was not enabled.
    #[error("debug subtree '{DEBUG_SUBTREE}' present at '{path}' without debug mode")]
    DebugSubtreePresent {
        /// Dotted path to the subtree.
        path: String,
    },

    /// The tree is nested deeper than [`MAX_DEPTH`].
    #[error("perimeter scan depth limit exceeded ({max_depth} levels)")]
    DepthExceeded {
        /// The exceeded limit.
        max_depth: usize,
    },
}

/// The perimeter policy: forbidden patterns plus the debug escape hatch.
#[derive(Debug, Clone)]
pub struct PerimeterPolicy {
    /// Global forbidden substrings, lowercased.
    forbidden: Vec<String>,
    /// Extra forbidden substrings per modality (assay name, lowercased).
    modality_forbidden: BTreeMap<String, Vec<String>>,
    /// Whether the `_debug_truth` subtree is honored.
    debug_enabled: bool,
}

impl Default for PerimeterPolicy {
    fn default() -> Self {
        let mut modality_forbidden = BTreeMap::new();
        // Internal imaging QC truths: visible to the scoring pipeline for
        // cell painting, never to the agent.
        modality_forbidden.insert(
            "cell_painting".to_string(),
            vec!["focus_truth".to_string(), "illumination_truth".to_string()],
        );
        // Sequencing internals that would reveal simulator latent state.
        modality_forbidden.insert(
            "scrna".to_string(),
            vec!["doublet_truth".to_string(), "ambient_fraction".to_string()],
        );
        Self {
            forbidden: GLOBAL_FORBIDDEN.iter().map(|s| (*s).to_string()).collect(),
            modality_forbidden,
            debug_enabled: false,
        }
    }
}

impl PerimeterPolicy {
    /// Creates the default policy (debug disabled).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables the `_debug_truth` escape hatch.
    ///
    /// The flag must be set at construction; there is no runtime toggle.
    #[must_use]
    pub fn with_debug(mut self) -> Self {
        self.debug_enabled = true;
        self
    }

    /// Adds a global forbidden substring.
    #[must_use]
    pub fn with_forbidden(mut self, pattern: impl Into<String>) -> Self {
        self.forbidden.push(pattern.into().to_lowercase());
        self
    }

    /// Adds a modality-specific forbidden substring.
    #[must_use]
    pub fn with_modality_ban(
        mut self,
        modality: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        self.modality_forbidden
            .entry(modality.into().to_lowercase())
            .or_default()
            .push(pattern.into().to_lowercase());
        self
    }

    /// Returns `true` if debug mode was enabled at construction.
    #[must_use]
    pub const fn debug_enabled(&self) -> bool {
        self.debug_enabled
    }

    /// Recursively checks every key at every depth of `tree`.
    ///
    /// `modality` selects an extra per-assay ban list on top of the global
    /// set.
    ///
    /// # Errors
    ///
    /// Returns [`PerimeterViolation`] on the first forbidden key, on the
    /// `_debug_truth` subtree when debug mode is off, or if the tree
    /// exceeds [`MAX_DEPTH`].
    pub fn assert_no_forbidden(
        &self,
        tree: &Value,
        modality: Option<&str>,
    ) -> Result<(), PerimeterViolation> {
        let extra: &[String] = modality
            .map(str::to_lowercase)
            .and_then(|m| self.modality_forbidden.get(&m))
            .map_or(&[], Vec::as_slice);
        self.visit(tree, extra, "$", 0)
    }

    fn visit(
        &self,
        value: &Value,
        extra: &[String],
        path: &str,
        depth: usize,
    ) -> Result<(), PerimeterViolation> {
        if depth > MAX_DEPTH {
            return Err(PerimeterViolation::DepthExceeded {
                max_depth: MAX_DEPTH,
            });
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_path = format!("{path}.{key}");
                    if key == DEBUG_SUBTREE {
                        if self.debug_enabled {
                            // The sole exemption: contents are not scanned.
                            continue;
                        }
                        return Err(PerimeterViolation::DebugSubtreePresent {
                            path: child_path,
                        });
                    }
                    self.check_key(key, extra, &child_path)?;
                    self.visit(child, extra, &child_path, depth + 1)?;
                }
                Ok(())
            },
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.visit(item, extra, &format!("{path}[{i}]"), depth + 1)?;
                }
                Ok(())
            },
            // Scalars carry no keys.
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => Ok(()),
        }
    }

    fn check_key(
        &self,
        key: &str,
        extra: &[String],
        path: &str,
    ) -> Result<(), PerimeterViolation> {
        let lowered = key.to_lowercase();
        for pattern in self.forbidden.iter().chain(extra.iter()) {
            if lowered.contains(pattern.as_str()) {
                return Err(PerimeterViolation::ForbiddenKey {
                    key: key.to_string(),
                    path: path.to_string(),
                    pattern: pattern.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Stateless scan with an explicit pattern list.
///
/// Convenience wrapper for callers that do not hold a policy; the debug
/// escape hatch is disabled.
///
/// # Errors
///
/// Returns [`PerimeterViolation`] on the first forbidden key.
pub fn assert_no_forbidden(
    tree: &Value,
    forbidden_patterns: &[&str],
) -> Result<(), PerimeterViolation> {
    let mut policy = PerimeterPolicy {
        forbidden: Vec::new(),
        modality_forbidden: BTreeMap::new(),
        debug_enabled: false,
    };
    for pattern in forbidden_patterns {
        policy = policy.with_forbidden(*pattern);
    }
    policy.assert_no_forbidden(tree, None)
}
