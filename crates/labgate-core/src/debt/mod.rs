//! Epistemic debt accounting: claimed vs. realized information gain.
//!
//! Every action the agent proposes carries a claimed information gain in
//! bits. After the action executes, the realized gain is reconciled
//! against the claim; any positive excess of claimed over realized
//! accrues as **debt**. Debt inflates the cost of future non-calibration
//! actions continuously, and past a hard threshold blocks them outright.
//!
//! Calibration-category actions remain eligible at any debt level — that
//! is the deliberate deadlock-escape property: an agent that overclaimed
//! its way into high debt can always recover by calibrating, never by
//! being permanently stuck. The category exemption is enforced by the
//! chooser; this module only reports the debt level and the inflation
//! factor.
//!
//! Debt is monotonically non-decreasing. No decay policy exists.
//!
//! # Example
//!
//! ```
//! use labgate_core::debt::{DebtAccount, DebtConfig};
//!
//! let mut debt = DebtAccount::new(DebtConfig::default());
//! debt.claim("dose_response_c0001_abcdef123456", 3.0).unwrap();
//! let contribution = debt.resolve("dose_response_c0001_abcdef123456", 0.5).unwrap();
//! assert_eq!(contribution, 2.5);
//! assert!(debt.is_hard_blocked());
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum simultaneously open (claimed, unresolved) actions.
pub const MAX_OPEN_CLAIMS: usize = 64;

/// Errors from debt accounting misuse.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum DebtError {
    /// A claim was made twice for the same action id.
    #[error("duplicate claim for action '{action_id}'")]
    DuplicateClaim {
        /// The action id.
        action_id: String,
    },

    /// A resolve arrived without a prior claim.
    ///
    /// `claim` must strictly precede `resolve` for the same action id.
    #[error("resolve without claim for action '{action_id}'")]
    ResolveWithoutClaim {
        /// The action id.
        action_id: String,
    },

    /// A gain value was NaN, infinite, or negative.
    #[error("invalid gain for action '{action_id}': {value}")]
    InvalidGain {
        /// The action id.
        action_id: String,
        /// The offending value.
        value: f64,
    },

    /// Too many unresolved claims are outstanding.
    #[error("open claim limit reached: {MAX_OPEN_CLAIMS}")]
    TooManyOpenClaims,
}

/// Debt controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DebtConfig {
    /// Debt at or above which every non-calibration action is blocked.
    pub hard_block_bits: f64,
    /// Slope of the linear cost-inflation multiplier.
    pub inflation_slope: f64,
}

impl Default for DebtConfig {
    fn default() -> Self {
        Self {
            hard_block_bits: 2.0,
            inflation_slope: 0.5,
        }
    }
}

impl DebtConfig {
    /// Creates a config with explicit knobs.
    #[must_use]
    pub const fn new(hard_block_bits: f64, inflation_slope: f64) -> Self {
        Self {
            hard_block_bits,
            inflation_slope,
        }
    }

    /// Inflates a base well-cost under the given debt level.
    ///
    /// Continuous and monotonically increasing in `debt_bits`:
    /// `base × (1 + slope × debt)`. Zero debt leaves the cost unchanged.
    #[must_use]
    pub fn inflate_cost(&self, base_cost_wells: f64, debt_bits: f64) -> f64 {
        base_cost_wells * self.inflation_slope.mul_add(debt_bits.max(0.0), 1.0)
    }
}

/// One settled claim/resolve pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebtEntry {
    /// The action id the pair refers to.
    pub action_id: String,
    /// Gain claimed before execution, in bits.
    pub claimed_bits: f64,
    /// Gain realized after execution, in bits.
    pub realized_bits: f64,
    /// `max(0, claimed − realized)`.
    pub contribution_bits: f64,
}

/// The debt account: settled entries, open claims, and the running total.
#[derive(Debug, Clone)]
pub struct DebtAccount {
    config: DebtConfig,
    entries: Vec<DebtEntry>,
    open_claims: BTreeMap<String, f64>,
    total_bits: f64,
}

impl DebtAccount {
    /// Creates an empty account.
    #[must_use]
    pub fn new(config: DebtConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            open_claims: BTreeMap::new(),
            total_bits: 0.0,
        }
    }

    /// Returns the configuration in force.
    #[must_use]
    pub const fn config(&self) -> &DebtConfig {
        &self.config
    }

    /// Records a claimed gain for an action, before it executes.
    ///
    /// # Errors
    ///
    /// Returns [`DebtError::DuplicateClaim`] if the action id already has
    /// an open claim, [`DebtError::InvalidGain`] for NaN/infinite/negative
    /// gains, or [`DebtError::TooManyOpenClaims`] at the bound.
    pub fn claim(&mut self, action_id: &str, expected_gain_bits: f64) -> Result<(), DebtError> {
        if !expected_gain_bits.is_finite() || expected_gain_bits < 0.0 {
            return Err(DebtError::InvalidGain {
                action_id: action_id.to_string(),
                value: expected_gain_bits,
            });
        }
        if self.open_claims.contains_key(action_id) {
            return Err(DebtError::DuplicateClaim {
                action_id: action_id.to_string(),
            });
        }
        if self.open_claims.len() >= MAX_OPEN_CLAIMS {
            return Err(DebtError::TooManyOpenClaims);
        }
        debug!(action_id, expected_gain_bits, "gain claimed");
        self.open_claims
            .insert(action_id.to_string(), expected_gain_bits);
        Ok(())
    }

    /// Resolves a claim with the realized gain, returning the debt
    /// contribution `max(0, claimed − realized)`.
    ///
    /// # Errors
    ///
    /// Returns [`DebtError::ResolveWithoutClaim`] if no claim is open for
    /// the action id, or [`DebtError::InvalidGain`] for NaN/infinite/
    /// negative gains.
    pub fn resolve(&mut self, action_id: &str, actual_gain_bits: f64) -> Result<f64, DebtError> {
        if !actual_gain_bits.is_finite() || actual_gain_bits < 0.0 {
            return Err(DebtError::InvalidGain {
                action_id: action_id.to_string(),
                value: actual_gain_bits,
            });
        }
        let claimed =
            self.open_claims
                .remove(action_id)
                .ok_or_else(|| DebtError::ResolveWithoutClaim {
                    action_id: action_id.to_string(),
                })?;
        let contribution = (claimed - actual_gain_bits).max(0.0);
        self.total_bits += contribution;
        if contribution > 0.0 {
            warn!(
                action_id,
                claimed,
                realized = actual_gain_bits,
                contribution,
                total = self.total_bits,
                "overclaim settled into debt"
            );
        }
        self.entries.push(DebtEntry {
            action_id: action_id.to_string(),
            claimed_bits: claimed,
            realized_bits: actual_gain_bits,
            contribution_bits: contribution,
        });
        Ok(contribution)
    }

    /// Returns the accumulated debt in bits.
    #[must_use]
    pub const fn total_debt(&self) -> f64 {
        self.total_bits
    }

    /// Returns `true` once debt reaches the hard-block threshold.
    ///
    /// At that point every non-calibration action is ineligible
    /// regardless of cost; calibration remains eligible at any debt.
    #[must_use]
    pub fn is_hard_blocked(&self) -> bool {
        self.total_bits >= self.config.hard_block_bits
    }

    /// Inflates a base well-cost under the current debt level.
    #[must_use]
    pub fn inflated_cost(&self, base_cost_wells: f64) -> f64 {
        self.config.inflate_cost(base_cost_wells, self.total_bits)
    }

    /// Returns the settled entries in claim order.
    #[must_use]
    pub fn entries(&self) -> &[DebtEntry] {
        &self.entries
    }

    /// Returns the claimed gain of an open (unresolved) action, if any.
    #[must_use]
    pub fn open_claim(&self, action_id: &str) -> Option<f64> {
        self.open_claims.get(action_id).copied()
    }
}
