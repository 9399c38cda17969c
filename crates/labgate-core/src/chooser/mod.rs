//! Gate/template chooser: the ordered admission policy.
//!
//! The chooser is the single place a cycle's decision is made and the
//! single place a [`DecisionReceipt`] is produced. It consumes the belief
//! ledger's gate states and the debt controller's level, and evaluates a
//! strict, ordered policy:
//!
//! 1. If the remaining budget cannot afford the cheapest outstanding
//!    required calibration, abort (forced) with a calibration plan.
//! 2. If the noise gate is not earned, force baseline calibration — even
//!    on the very first cycle. Calibration is the first experiment, not a
//!    setup step.
//! 3. If a required cheap instrument gate is not earned, force its
//!    calibration before any biology.
//! 4. If a proposal targets an expensive instrument whose calibration has
//!    not been explicitly authorized, refuse it — even with every cheap
//!    gate earned and arbitrarily good shadow evidence. Cheap truth gates
//!    expensive truth, and knowledge is not permission.
//! 5. Otherwise score eligible proposals (debt-inflated costs, debt hard
//!    block on non-calibration) and select the best.
//!
//! Every branch returns exactly one receipt inside its
//! [`CycleDecision`]; the cycle runner asserts that post-condition.
//! Refusals are first-class decisions, not errors: they carry a
//! [`RefusalRecord`] for the append-only refusal log and the agent may
//! re-propose next cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::debt::DebtAccount;
use crate::identity::{design_id, IdentityError, SpecValue};
use crate::ledger::{BeliefSnapshot, GateStatus};

/// The gate that must be earned before anything else.
pub const NOISE_GATE: &str = "noise";

/// Stable refusal/abort reasons.
pub const REASON_BUDGET_EXHAUSTED: &str = "budget_below_cheapest_calibration";
/// Stable reason for an unauthorized expensive-instrument proposal.
pub const REASON_EXPENSIVE_UNAUTHORIZED: &str = "expensive_instrument_unauthorized";
/// Stable reason for the debt hard block.
pub const REASON_DEBT_HARD_BLOCK: &str = "debt_above_hard_threshold";
/// Stable reason when no proposal survives eligibility filtering.
pub const REASON_NO_ELIGIBLE_ACTION: &str = "no_eligible_action";
/// Stable reason when every eligible proposal is unaffordable.
pub const REASON_UNAFFORDABLE: &str = "no_affordable_action";

/// What caused a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Trigger {
    /// Ordinary scored selection.
    Scoring,
    /// A calibration was forced ahead of the agent's intent.
    MustCalibrate,
    /// A policy boundary rejected the agent's proposal.
    PolicyBoundary,
    /// A forced abort (budget exhaustion).
    Abort,
}

impl Trigger {
    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scoring => "scoring",
            Self::MustCalibrate => "must_calibrate",
            Self::PolicyBoundary => "policy_boundary",
            Self::Abort => "abort",
        }
    }
}

/// Which layer of the policy produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum EnforcementLayer {
    /// Budget affordability pre-check.
    BudgetGate,
    /// The noise gate.
    NoiseGate,
    /// A cheap instrument gate.
    InstrumentGate,
    /// Expensive-instrument authorization.
    AuthorityGate,
    /// The debt controller's hard block.
    DebtController,
    /// Scored selection.
    Scoring,
}

/// Instruments the agent can target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Instrument {
    /// Low-cost viability assay.
    Ldh,
    /// High-content imaging.
    CellPainting,
    /// Single-cell RNA sequencing.
    Scrna,
}

/// Cost class of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentClass {
    /// Cheap: its gate is a prerequisite for biology.
    Cheap,
    /// Expensive: calibration requires explicit external authorization.
    Expensive,
}

impl Instrument {
    /// Returns the instrument's gate name in the belief ledger.
    #[must_use]
    pub const fn gate_name(self) -> &'static str {
        match self {
            Self::Ldh => "ldh",
            Self::CellPainting => "cell_painting",
            Self::Scrna => "scrna",
        }
    }

    /// Returns the cost class.
    #[must_use]
    pub const fn class(self) -> InstrumentClass {
        match self {
            Self::Ldh => InstrumentClass::Cheap,
            Self::CellPainting | Self::Scrna => InstrumentClass::Expensive,
        }
    }
}

/// Category of a proposed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    /// Calibration: eligible at any debt level, cost never inflated.
    Calibration,
    /// Biology: subject to debt inflation and the hard block.
    Biology,
}

/// An agent-proposed action for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionProposal {
    /// Template name (restricted alphabet, see the identity module).
    pub template: String,
    /// Template kwargs; becomes the design specification.
    pub template_kwargs: serde_json::Value,
    /// Instrument the action targets.
    pub instrument: Instrument,
    /// Calibration or biology.
    pub category: ActionCategory,
    /// Base cost in wells before inflation.
    pub base_cost_wells: u32,
    /// Claimed information gain in bits.
    pub expected_gain_bits: f64,
}

/// The shortfall quantification attached to budget aborts and forced
/// calibrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationPlan {
    /// Wells the cheapest outstanding calibration needs.
    pub wells_needed: u32,
    /// Wells actually available.
    pub wells_available: u32,
    /// Degrees of freedom still needed to earn the gate.
    pub df_needed: f64,
}

/// The mandatory audit record of a single cycle's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionReceipt {
    /// Chosen or refused template name.
    pub template: String,
    /// Trigger category.
    pub trigger: Trigger,
    /// Which policy layer produced the decision.
    pub enforcement_layer: EnforcementLayer,
    /// Relevant assay/gate, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assay: Option<String>,
    /// Gate-state snapshot at decision time.
    pub gate_state: BTreeMap<String, GateStatus>,
    /// Shortfall plan when refusing or forcing for budget reasons.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration_plan: Option<CalibrationPlan>,
    /// `true` when the policy overrode the agent's intent.
    pub forced: bool,
    /// Human-readable reason.
    pub reason: String,
}

impl DecisionReceipt {
    /// Returns deterministic canonical JSON bytes for audit export.
    ///
    /// Object keys are sorted recursively, so byte-identical receipts
    /// hash identically across processes.
    ///
    /// # Errors
    ///
    /// Returns [`ChooserError::Serialization`] if the receipt cannot be
    /// serialized.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ChooserError> {
        let value =
            serde_json::to_value(self).map_err(|error| ChooserError::Serialization {
                message: error.to_string(),
            })?;
        let mut out = String::new();
        emit_canonical(&value, &mut out);
        Ok(out.into_bytes())
    }

    /// Returns the blake3 hash of the canonical receipt bytes, in hex.
    ///
    /// # Errors
    ///
    /// Returns [`ChooserError::Serialization`] if serialization fails.
    pub fn receipt_hash(&self) -> Result<String, ChooserError> {
        Ok(blake3::hash(&self.canonical_bytes()?).to_hex().to_string())
    }
}

/// One append-only refusal log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefusalRecord {
    /// Cycle of the refusal.
    pub cycle: u32,
    /// Stable refusal reason.
    pub refusal_reason: String,
    /// Debt level at refusal time, in bits.
    pub debt_bits: f64,
    /// The refused template, if a specific proposal was refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_template: Option<String>,
    /// Whether the debt hard threshold caused the refusal.
    pub blocked_by_threshold: bool,
    /// Base cost of the refused proposal in wells.
    pub base_cost_wells: u32,
    /// Debt-inflated cost of the refused proposal in wells.
    pub inflated_cost_wells: f64,
    /// Budget remaining at refusal time.
    pub budget_remaining: u32,
}

/// Append-only refusal log.
#[derive(Debug, Default, Clone)]
pub struct RefusalLog {
    records: Vec<RefusalRecord>,
}

impl RefusalLog {
    /// Creates an empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Appends a record. Records are never edited or removed.
    pub fn push(&mut self, record: RefusalRecord) {
        self.records.push(record);
    }

    /// Returns all records in append order.
    #[must_use]
    pub fn records(&self) -> &[RefusalRecord] {
        &self.records
    }

    /// Returns the number of refusals logged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no refusal has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The chooser's result: a tagged variant consumed by exhaustive matching.
///
/// Refusals and aborts are decisions with receipts, not exceptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum CycleDecision {
    /// An action goes forward.
    Proceed {
        /// Chosen template.
        template: String,
        /// Template kwargs.
        template_kwargs: serde_json::Value,
        /// Content-addressed design id.
        design_id: String,
        /// The decision receipt.
        receipt: DecisionReceipt,
    },
    /// The agent's proposal was refused; it may re-propose next cycle.
    Refuse {
        /// The refusal log record.
        record: RefusalRecord,
        /// The decision receipt.
        receipt: DecisionReceipt,
    },
    /// A forced abort carrying the shortfall quantification.
    Abort {
        /// Stable abort reason.
        reason: String,
        /// The shortfall plan.
        calibration_plan: CalibrationPlan,
        /// The decision receipt.
        receipt: DecisionReceipt,
    },
}

impl CycleDecision {
    /// Returns the decision's receipt.
    #[must_use]
    pub const fn receipt(&self) -> &DecisionReceipt {
        match self {
            Self::Proceed { receipt, .. }
            | Self::Refuse { receipt, .. }
            | Self::Abort { receipt, .. } => receipt,
        }
    }

    /// Returns `true` for forced decisions (overrides and aborts).
    #[must_use]
    pub const fn forced(&self) -> bool {
        self.receipt().forced
    }
}

/// Gate phase of the decision state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePhase {
    /// No prerequisite gate earned; only calibration may run.
    PreGate,
    /// Noise and cheap gates earned; biology is permitted.
    InGate,
    /// An expensive instrument has been authorized or earned.
    ExpensiveGated,
}

/// Errors from chooser evaluation (programmer/input errors, not refusals).
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ChooserError {
    /// Design identity construction failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// A proposal carried malformed fields.
    #[error("invalid proposal '{template}': {reason}")]
    InvalidProposal {
        /// The proposal's template.
        template: String,
        /// Why it is invalid.
        reason: &'static str,
    },

    /// Receipt serialization failed.
    #[error("receipt serialization failed: {message}")]
    Serialization {
        /// Error message.
        message: String,
    },
}

/// Chooser configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChooserConfig {
    /// Template forced while the noise gate is unearned.
    pub baseline_template: String,
    /// Well cost of the baseline-noise calibration.
    pub baseline_cost_wells: u32,
    /// Cheap instruments whose gates must be earned before biology,
    /// in forcing order.
    pub required_cheap: Vec<Instrument>,
    /// Well cost of a cheap-instrument calibration.
    pub instrument_calibration_cost_wells: u32,
    /// Degrees of freedom a calibration plan targets.
    pub calibration_df_needed: f64,
}

impl Default for ChooserConfig {
    fn default() -> Self {
        Self {
            baseline_template: "baseline_noise".to_string(),
            baseline_cost_wells: 24,
            required_cheap: vec![Instrument::Ldh],
            instrument_calibration_cost_wells: 48,
            calibration_df_needed: 20.0,
        }
    }
}

/// The gate/template chooser.
#[derive(Debug, Clone)]
pub struct GateChooser {
    config: ChooserConfig,
    authorized_expensive: BTreeSet<Instrument>,
}

impl GateChooser {
    /// Creates a chooser with no expensive instrument authorized.
    #[must_use]
    pub const fn new(config: ChooserConfig) -> Self {
        Self {
            config,
            authorized_expensive: BTreeSet::new(),
        }
    }

    /// Returns the configuration in force.
    #[must_use]
    pub const fn config(&self) -> &ChooserConfig {
        &self.config
    }

    /// Grants explicit external authorization for an expensive
    /// instrument's calibration.
    pub fn authorize_expensive(&mut self, instrument: Instrument) {
        info!(instrument = instrument.gate_name(), "expensive instrument authorized");
        self.authorized_expensive.insert(instrument);
    }

    /// Returns `true` if the instrument's calibration is authorized.
    #[must_use]
    pub fn is_authorized(&self, instrument: Instrument) -> bool {
        self.authorized_expensive.contains(&instrument)
    }

    /// Returns the current phase of the gating state machine.
    #[must_use]
    pub fn current_phase(&self, beliefs: &BeliefSnapshot) -> GatePhase {
        if beliefs.gate_status(NOISE_GATE) != GateStatus::Earned
            || self
                .config
                .required_cheap
                .iter()
                .any(|i| beliefs.gate_status(i.gate_name()) != GateStatus::Earned)
        {
            return GatePhase::PreGate;
        }
        let expensive_open = !self.authorized_expensive.is_empty()
            || beliefs
                .gates
                .iter()
                .any(|(name, belief)| {
                    belief.status == GateStatus::Earned
                        && [Instrument::CellPainting, Instrument::Scrna]
                            .iter()
                            .any(|i| i.gate_name() == name)
                });
        if expensive_open {
            GatePhase::ExpensiveGated
        } else {
            GatePhase::InGate
        }
    }

    /// Evaluates the ordered policy for one cycle.
    ///
    /// Exactly one [`DecisionReceipt`] is embedded in the returned
    /// decision; the caller asserts that post-condition.
    ///
    /// # Errors
    ///
    /// Returns [`ChooserError`] for malformed proposals or identity
    /// failures — programmer/input errors, distinct from refusals.
    pub fn evaluate(
        &self,
        cycle: u32,
        beliefs: &BeliefSnapshot,
        debt: &DebtAccount,
        budget_wells: u32,
        proposals: &[ActionProposal],
    ) -> Result<CycleDecision, ChooserError> {
        for proposal in proposals {
            if proposal.base_cost_wells == 0 {
                return Err(ChooserError::InvalidProposal {
                    template: proposal.template.clone(),
                    reason: "base_cost_wells must be positive",
                });
            }
            if !proposal.expected_gain_bits.is_finite() || proposal.expected_gain_bits < 0.0 {
                return Err(ChooserError::InvalidProposal {
                    template: proposal.template.clone(),
                    reason: "expected_gain_bits must be finite and non-negative",
                });
            }
        }

        let gate_state = beliefs.gate_states();

        // 1. Budget must afford the cheapest outstanding required
        //    calibration, or the run is over.
        if let Some((template, assay, cost)) = self.cheapest_outstanding_calibration(beliefs) {
            if budget_wells < cost {
                let plan = CalibrationPlan {
                    wells_needed: cost,
                    wells_available: budget_wells,
                    df_needed: self.config.calibration_df_needed,
                };
                warn!(cycle, template, cost, budget_wells, "budget below cheapest calibration");
                return Ok(CycleDecision::Abort {
                    reason: REASON_BUDGET_EXHAUSTED.to_string(),
                    calibration_plan: plan.clone(),
                    receipt: DecisionReceipt {
                        template: template.clone(),
                        trigger: Trigger::Abort,
                        enforcement_layer: EnforcementLayer::BudgetGate,
                        assay: Some(assay),
                        gate_state,
                        calibration_plan: Some(plan),
                        forced: true,
                        reason: format!(
                            "remaining budget {budget_wells} wells cannot afford \
                             calibration '{template}' ({cost} wells)"
                        ),
                    },
                });
            }
        }

        // 2. The noise gate comes first, on every cycle including the
        //    first: calibration is the first experiment.
        if beliefs.gate_status(NOISE_GATE) != GateStatus::Earned {
            return self.force_calibration(
                cycle,
                &self.config.baseline_template,
                NOISE_GATE,
                self.config.baseline_cost_wells,
                budget_wells,
                EnforcementLayer::NoiseGate,
                gate_state,
            );
        }

        // 3. Cheap instrument gates before any biology.
        for instrument in &self.config.required_cheap {
            if beliefs.gate_status(instrument.gate_name()) != GateStatus::Earned {
                let template = format!("calibrate_{}", instrument.gate_name());
                return self.force_calibration(
                    cycle,
                    &template,
                    instrument.gate_name(),
                    self.config.instrument_calibration_cost_wells,
                    budget_wells,
                    EnforcementLayer::InstrumentGate,
                    gate_state,
                );
            }
        }

        // 4. Expensive instruments require explicit authorization, no
        //    matter how good the shadow evidence looks.
        for proposal in proposals {
            if proposal.instrument.class() == InstrumentClass::Expensive
                && !self.is_authorized(proposal.instrument)
            {
                let record = RefusalRecord {
                    cycle,
                    refusal_reason: REASON_EXPENSIVE_UNAUTHORIZED.to_string(),
                    debt_bits: debt.total_debt(),
                    proposed_template: Some(proposal.template.clone()),
                    blocked_by_threshold: false,
                    base_cost_wells: proposal.base_cost_wells,
                    inflated_cost_wells: debt.inflated_cost(f64::from(proposal.base_cost_wells)),
                    budget_remaining: budget_wells,
                };
                warn!(
                    cycle,
                    template = proposal.template,
                    instrument = proposal.instrument.gate_name(),
                    "unauthorized expensive instrument refused"
                );
                return Ok(CycleDecision::Refuse {
                    receipt: DecisionReceipt {
                        template: proposal.template.clone(),
                        trigger: Trigger::PolicyBoundary,
                        enforcement_layer: EnforcementLayer::AuthorityGate,
                        assay: Some(proposal.instrument.gate_name().to_string()),
                        gate_state,
                        calibration_plan: None,
                        forced: false,
                        reason: format!(
                            "instrument '{}' calibration lacks explicit authorization",
                            proposal.instrument.gate_name()
                        ),
                    },
                    record,
                });
            }
        }

        // 5. Scored selection under debt inflation.
        self.score_and_select(cycle, beliefs, debt, budget_wells, proposals, gate_state)
    }

    /// Returns the cheapest calibration still required, if any.
    fn cheapest_outstanding_calibration(
        &self,
        beliefs: &BeliefSnapshot,
    ) -> Option<(String, String, u32)> {
        let mut outstanding: Vec<(String, String, u32)> = Vec::new();
        if beliefs.gate_status(NOISE_GATE) != GateStatus::Earned {
            outstanding.push((
                self.config.baseline_template.clone(),
                NOISE_GATE.to_string(),
                self.config.baseline_cost_wells,
            ));
        }
        for instrument in &self.config.required_cheap {
            if beliefs.gate_status(instrument.gate_name()) != GateStatus::Earned {
                outstanding.push((
                    format!("calibrate_{}", instrument.gate_name()),
                    instrument.gate_name().to_string(),
                    self.config.instrument_calibration_cost_wells,
                ));
            }
        }
        outstanding.into_iter().min_by_key(|(_, _, cost)| *cost)
    }

    #[allow(clippy::too_many_arguments)]
    fn force_calibration(
        &self,
        cycle: u32,
        template: &str,
        gate: &str,
        cost_wells: u32,
        budget_wells: u32,
        layer: EnforcementLayer,
        gate_state: BTreeMap<String, GateStatus>,
    ) -> Result<CycleDecision, ChooserError> {
        let kwargs = serde_json::json!({ "wells": cost_wells, "gate": gate });
        let spec = SpecValue::from_json(&kwargs)?;
        let id = design_id(template, cycle, &spec)?;
        info!(cycle, template, gate, "calibration forced");
        Ok(CycleDecision::Proceed {
            template: template.to_string(),
            template_kwargs: kwargs,
            design_id: id,
            receipt: DecisionReceipt {
                template: template.to_string(),
                trigger: Trigger::MustCalibrate,
                enforcement_layer: layer,
                assay: Some(gate.to_string()),
                gate_state,
                calibration_plan: Some(CalibrationPlan {
                    wells_needed: cost_wells,
                    wells_available: budget_wells,
                    df_needed: self.config.calibration_df_needed,
                }),
                forced: true,
                reason: format!("gate '{gate}' is not earned; calibration precedes biology"),
            },
        })
    }

    fn score_and_select(
        &self,
        cycle: u32,
        beliefs: &BeliefSnapshot,
        debt: &DebtAccount,
        budget_wells: u32,
        proposals: &[ActionProposal],
        gate_state: BTreeMap<String, GateStatus>,
    ) -> Result<CycleDecision, ChooserError> {
        let debt_bits = debt.total_debt();
        let hard_blocked = debt.is_hard_blocked();
        let mut best: Option<(f64, &ActionProposal, f64)> = None;
        let mut first_debt_blocked: Option<&ActionProposal> = None;
        let mut first_unaffordable: Option<(&ActionProposal, f64)> = None;

        for proposal in proposals {
            let is_calibration = proposal.category == ActionCategory::Calibration;
            // Calibration is the deadlock escape: eligible at any debt
            // level and never inflated.
            let cost = if is_calibration {
                f64::from(proposal.base_cost_wells)
            } else {
                if hard_blocked {
                    first_debt_blocked.get_or_insert(proposal);
                    continue;
                }
                debt.inflated_cost(f64::from(proposal.base_cost_wells))
            };
            if cost > f64::from(budget_wells) {
                first_unaffordable.get_or_insert((proposal, cost));
                continue;
            }
            let score = proposal.expected_gain_bits / cost;
            let better = best.as_ref().map_or(true, |(s, _, _)| score > *s);
            if better {
                best = Some((score, proposal, cost));
            }
        }

        if let Some((score, proposal, cost)) = best {
            let spec = SpecValue::from_json(&proposal.template_kwargs)?;
            let id = design_id(&proposal.template, cycle, &spec)?;
            info!(
                cycle,
                template = proposal.template,
                score,
                inflated_cost = cost,
                "proposal selected by scoring"
            );
            return Ok(CycleDecision::Proceed {
                template: proposal.template.clone(),
                template_kwargs: proposal.template_kwargs.clone(),
                design_id: id,
                receipt: DecisionReceipt {
                    template: proposal.template.clone(),
                    trigger: Trigger::Scoring,
                    enforcement_layer: EnforcementLayer::Scoring,
                    assay: Some(proposal.instrument.gate_name().to_string()),
                    gate_state,
                    calibration_plan: None,
                    forced: false,
                    reason: format!(
                        "best-scoring eligible proposal (score {score:.4}, \
                         cost {cost:.1} wells)"
                    ),
                },
            });
        }

        // Nothing selectable: refuse with the most informative cause.
        let (reason, layer, blocked, subject) = if let Some(blocked) = first_debt_blocked {
            (
                REASON_DEBT_HARD_BLOCK,
                EnforcementLayer::DebtController,
                true,
                Some((blocked, debt.inflated_cost(f64::from(blocked.base_cost_wells)))),
            )
        } else if let Some((unaffordable, cost)) = first_unaffordable {
            (
                REASON_UNAFFORDABLE,
                EnforcementLayer::BudgetGate,
                false,
                Some((unaffordable, cost)),
            )
        } else {
            (REASON_NO_ELIGIBLE_ACTION, EnforcementLayer::Scoring, false, None)
        };

        let proposed_template = subject.map(|(p, _)| p.template.clone());
        let (template, base_cost, inflated) = subject.map_or_else(
            || (String::new(), 0, 0.0),
            |(p, cost)| (p.template.clone(), p.base_cost_wells, cost),
        );

        let mut reason_text = String::new();
        let _ = write!(reason_text, "{reason}");
        if blocked {
            let _ = write!(
                reason_text,
                ": debt {debt_bits:.2} bits >= hard threshold; only calibration is eligible"
            );
        }
        warn!(cycle, reason, debt_bits, "cycle refused");
        let phase = self.current_phase(beliefs);
        let record = RefusalRecord {
            cycle,
            refusal_reason: reason.to_string(),
            debt_bits,
            proposed_template,
            blocked_by_threshold: blocked,
            base_cost_wells: base_cost,
            inflated_cost_wells: inflated,
            budget_remaining: budget_wells,
        };
        Ok(CycleDecision::Refuse {
            receipt: DecisionReceipt {
                template,
                trigger: Trigger::PolicyBoundary,
                enforcement_layer: layer,
                assay: None,
                gate_state,
                calibration_plan: None,
                forced: false,
                reason: format!("{reason_text} (phase {phase:?})"),
            },
            record,
        })
    }
}

/// Emits a JSON value with recursively sorted object keys.
fn emit_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => {
            let _ = write!(out, "{n}");
        },
        serde_json::Value::String(s) => {
            let _ = write!(out, "{}", serde_json::Value::String(s.clone()));
        },
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_canonical(item, out);
            }
            out.push(']');
        },
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", serde_json::Value::String((*key).clone()));
                out.push(':');
                emit_canonical(&map[*key], out);
            }
            out.push('}');
        },
    }
}
