//! Per-cycle orchestration of the decision core.
//!
//! [`EpistemicCore`] is the explicit context object that owns the belief
//! ledger, the debt account, the chooser, the perimeter policy, and the
//! audit logs. One call to [`EpistemicCore::run_cycle`] executes the full
//! per-cycle data flow:
//!
//! ```text
//! observation batch
//!       |
//!       v
//! perimeter re-validation (simulator output is untrusted)
//!       |
//!       v
//! canonicalization -> belief ledger update (events emitted)
//!       |
//!       v
//! undocumented-mutation check (cycle boundary)
//!       |
//!       v
//! debt reconciliation (resolve realized gains)
//!       |
//!       v
//! chooser evaluation -> decision + receipt
//!       |
//!       v
//! receipt passes the perimeter, post-condition asserted
//! ```
//!
//! Execution is single-threaded and cycle-bracketed; there is no blocking
//! I/O and no retry for contract violations. Ordinary refusals come back
//! as first-class [`CycleDecision::Refuse`] values the agent may answer
//! with a different proposal next cycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::canonical::{make_condition, CanonicalCondition, PositionClass, ValidationError};
use crate::chooser::{
    ActionProposal, ChooserConfig, ChooserError, CycleDecision, DecisionReceipt, GateChooser,
    Instrument, RefusalLog,
};
use crate::debt::{DebtAccount, DebtConfig, DebtError};
use crate::ledger::{
    BeliefLedger, BeliefValue, GateConfig, LedgerError, LedgerEvent, LedgerInvariantError,
};
use crate::perimeter::{PerimeterPolicy, PerimeterViolation};

/// Fatal contract violations between components.
///
/// Intentionally not caught by ordinary control flow: a violation
/// terminates the cycle. There is no retry for any variant.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum InvariantViolation {
    /// The belief ledger detected an undocumented mutation.
    #[error(transparent)]
    Ledger(#[from] LedgerInvariantError),

    /// The ground-truth perimeter found a forbidden field.
    #[error(transparent)]
    Perimeter(#[from] PerimeterViolation),

    /// A cycle evaluation completed without producing a receipt.
    #[error("decision receipt missing after cycle {cycle} evaluation")]
    MissingReceipt {
        /// The offending cycle.
        cycle: u32,
    },
}

/// All failure modes of the decision core.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum CoreError {
    /// Malformed canonical input, failed fast at the boundary.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Ledger misuse (bracket violations, malformed evidence).
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Debt accounting misuse (resolve without claim, invalid gains).
    #[error(transparent)]
    Debt(#[from] DebtError),

    /// Chooser input errors (bad proposals, identity failures).
    #[error(transparent)]
    Chooser(#[from] ChooserError),

    /// A broken contract between components. Fatal; never retried.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    /// Observation serialization failed.
    #[error("observation serialization failed: {message}")]
    Serialization {
        /// Error message.
        message: String,
    },
}

impl From<LedgerInvariantError> for CoreError {
    fn from(error: LedgerInvariantError) -> Self {
        Self::Invariant(InvariantViolation::Ledger(error))
    }
}

impl From<PerimeterViolation> for CoreError {
    fn from(error: PerimeterViolation) -> Self {
        Self::Invariant(InvariantViolation::Perimeter(error))
    }
}

/// One condition summary from the observation batch.
///
/// This is the simulator's aggregated output for a single condition; it
/// re-enters the core as untrusted data and is perimeter-checked before
/// the ledger may ingest it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionSummary {
    /// Cell line identifier.
    pub cell_line: String,
    /// Compound identifier.
    pub compound: String,
    /// Dose in micromolar (raw; quantized on ingestion).
    pub dose_um: f64,
    /// Exposure time in hours (raw; quantized on ingestion).
    pub time_hours: f64,
    /// Assay name; doubles as the gate name.
    pub assay: String,
    /// Position tag (`center`, `edge`, `corner`).
    pub position_tag: String,
    /// Plate identifier, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate_id: Option<String>,
    /// Number of replicate wells aggregated.
    pub well_count: u32,
    /// Mean of the aggregated measurement.
    pub mean: f64,
    /// Standard deviation of the aggregated measurement.
    pub std_dev: f64,
    /// Coefficient of variation.
    pub cv: f64,
    /// Optional per-feature means (high-content assays).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_means: Option<BTreeMap<String, f64>>,
    /// Optional per-feature standard deviations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_stds: Option<BTreeMap<String, f64>>,
}

/// Realized information gain for a previously claimed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealizedGain {
    /// The action id the claim was made under.
    pub action_id: String,
    /// The gain actually realized, in bits.
    pub actual_gain_bits: f64,
}

/// Everything the core consumes for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CycleInput {
    /// The cycle number (monotonically increasing).
    pub cycle: u32,
    /// Remaining budget in wells.
    pub budget_wells: u32,
    /// Ordered observation batch from the last executed action.
    pub observations: Vec<ConditionSummary>,
    /// Realized gains to reconcile against open claims.
    pub realized: Vec<RealizedGain>,
    /// Agent proposals for this cycle.
    pub proposals: Vec<ActionProposal>,
}

/// The core's per-cycle result.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    /// The decision (proceed, refuse, or abort) with its receipt.
    pub decision: CycleDecision,
    /// The cycle's ordered ledger events.
    pub events: Vec<LedgerEvent>,
}

/// Aggregate configuration for the core.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Gate thresholds.
    pub gates: GateConfig,
    /// Debt knobs.
    pub debt: DebtConfig,
    /// Chooser policy knobs.
    pub chooser: ChooserConfig,
    /// Whether the perimeter honors `_debug_truth`.
    pub debug_perimeter: bool,
}

/// The decision core: an explicit context object, no process globals.
#[derive(Debug)]
pub struct EpistemicCore {
    ledger: BeliefLedger,
    debt: DebtAccount,
    chooser: GateChooser,
    perimeter: PerimeterPolicy,
    receipts: Vec<DecisionReceipt>,
    refusals: RefusalLog,
}

impl EpistemicCore {
    /// Creates a core with empty beliefs and zero debt.
    #[must_use]
    pub fn new(config: CoreConfig) -> Self {
        let perimeter = if config.debug_perimeter {
            PerimeterPolicy::new().with_debug()
        } else {
            PerimeterPolicy::new()
        };
        Self {
            ledger: BeliefLedger::new(config.gates),
            debt: DebtAccount::new(config.debt),
            chooser: GateChooser::new(config.chooser),
            perimeter,
            receipts: Vec::new(),
            refusals: RefusalLog::new(),
        }
    }

    /// Returns the belief ledger (read access).
    #[must_use]
    pub const fn ledger(&self) -> &BeliefLedger {
        &self.ledger
    }

    /// Returns the debt account (read access).
    #[must_use]
    pub const fn debt(&self) -> &DebtAccount {
        &self.debt
    }

    /// Returns the append-only refusal log.
    #[must_use]
    pub const fn refusals(&self) -> &RefusalLog {
        &self.refusals
    }

    /// Returns every receipt produced so far, one per decided cycle.
    #[must_use]
    pub fn receipts(&self) -> &[DecisionReceipt] {
        &self.receipts
    }

    /// Grants explicit external authorization for an expensive
    /// instrument's calibration.
    pub fn authorize_expensive(&mut self, instrument: Instrument) {
        self.chooser.authorize_expensive(instrument);
    }

    /// Runs one full decision cycle.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`]/[`CoreError::Ledger`]/
    /// [`CoreError::Debt`]/[`CoreError::Chooser`] for boundary failures,
    /// and [`CoreError::Invariant`] for fatal contract violations
    /// (forbidden fields, undocumented mutations, missing receipts).
    pub fn run_cycle(&mut self, input: &CycleInput) -> Result<CycleOutcome, CoreError> {
        // Simulator output is untrusted until it passes the perimeter.
        for summary in &input.observations {
            let tree = serde_json::to_value(summary).map_err(|error| {
                CoreError::Serialization {
                    message: error.to_string(),
                }
            })?;
            self.perimeter
                .assert_no_forbidden(&tree, Some(&summary.assay))?;
        }

        self.ledger.begin_cycle(input.cycle)?;
        let before = self.ledger.snapshot();
        self.ingest_observations(input)?;
        let events = self.ledger.end_cycle()?;
        let after = self.ledger.snapshot();
        BeliefLedger::assert_no_undocumented_mutation(&before, &after, &events, input.cycle)?;

        // Reconcile realized gains before deciding what runs next.
        for gain in &input.realized {
            self.debt.resolve(&gain.action_id, gain.actual_gain_bits)?;
        }

        let receipts_before = self.receipts.len();
        let decision = self.chooser.evaluate(
            input.cycle,
            &after,
            &self.debt,
            input.budget_wells,
            &input.proposals,
        )?;

        // The receipt leaves the subsystem: it passes the perimeter too.
        let receipt_tree = serde_json::to_value(decision.receipt()).map_err(|error| {
            CoreError::Serialization {
                message: error.to_string(),
            }
        })?;
        self.perimeter.assert_no_forbidden(&receipt_tree, None)?;

        match &decision {
            CycleDecision::Proceed {
                template,
                design_id,
                receipt,
                ..
            } => {
                // Forced calibrations claim nothing; scored selections
                // claim what the agent claimed.
                let expected = if receipt.forced {
                    0.0
                } else {
                    input
                        .proposals
                        .iter()
                        .find(|p| p.template == *template)
                        .map_or(0.0, |p| p.expected_gain_bits)
                };
                self.debt.claim(design_id, expected)?;
            },
            CycleDecision::Refuse { record, .. } => {
                self.refusals.push(record.clone());
            },
            CycleDecision::Abort { .. } => {},
        }

        self.receipts.push(decision.receipt().clone());
        if self.receipts.len() != receipts_before + 1 {
            return Err(CoreError::Invariant(InvariantViolation::MissingReceipt {
                cycle: input.cycle,
            }));
        }

        info!(
            cycle = input.cycle,
            forced = decision.forced(),
            debt_bits = self.debt.total_debt(),
            "cycle decided"
        );
        Ok(CycleOutcome { decision, events })
    }

    /// Folds the observation batch into the ledger.
    fn ingest_observations(&mut self, input: &CycleInput) -> Result<(), CoreError> {
        // Per-gate accumulation: degrees of freedom, widths, supports.
        let mut by_gate: BTreeMap<String, (f64, Vec<f64>, Vec<CanonicalCondition>)> =
            BTreeMap::new();

        for summary in &input.observations {
            let position = PositionClass::from_tag(&summary.position_tag)?;
            let condition = make_condition(
                &summary.cell_line,
                &summary.compound,
                summary.dose_um,
                summary.time_hours,
                &summary.assay,
                position,
            )?;

            // Calibration provenance: the ledger freezes this after
            // cycle 0, so unconditional folding is safe.
            let baselines = summary.feature_means.clone().unwrap_or_default();
            self.ledger.fold_calibration_wells(
                position,
                summary.plate_id.as_deref().unwrap_or("unlabeled"),
                summary.well_count,
                &baselines,
            )?;

            let entry = by_gate.entry(summary.assay.clone()).or_default();
            entry.0 += f64::from(summary.well_count.saturating_sub(1));
            entry.1.push(summary.cv);
            entry.2.push(condition);
        }

        for (gate, (df_delta, cvs, supports)) in by_gate {
            #[allow(clippy::cast_precision_loss)]
            let rel_width = cvs.iter().sum::<f64>() / cvs.len() as f64;
            self.ledger.fold_gate_evidence(
                &gate,
                df_delta,
                rel_width,
                serde_json::json!({
                    "summaries": cvs.len(),
                    "df_delta": df_delta,
                    "mean_cv": rel_width,
                }),
                &supports,
                "observation batch folded",
            )?;
            // Variance nuisance keeps updating in every cycle, unlike
            // calibration provenance.
            self.ledger.set_belief(
                &format!("cv_{gate}"),
                BeliefValue::Scalar(rel_width),
                serde_json::json!({ "summaries": cvs.len() }),
                &[],
                "running variance estimate",
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::chooser::{ActionCategory, Trigger, REASON_DEBT_HARD_BLOCK};
    use crate::ledger::GateStatus;

    fn noise_summary(wells: u32, cv: f64) -> ConditionSummary {
        ConditionSummary {
            cell_line: "hela".to_string(),
            compound: "dmso".to_string(),
            dose_um: 0.0,
            time_hours: 24.0,
            assay: "noise".to_string(),
            position_tag: "center".to_string(),
            plate_id: Some("plate_a".to_string()),
            well_count: wells,
            mean: 100.0,
            std_dev: 4.0,
            cv,
            feature_means: None,
            feature_stds: None,
        }
    }

    fn biology_proposal() -> ActionProposal {
        ActionProposal {
            template: "dose_response".to_string(),
            template_kwargs: json!({"doses": [10, 100], "compound": "tunicamycin"}),
            instrument: Instrument::Ldh,
            category: ActionCategory::Biology,
            base_cost_wells: 30,
            expected_gain_bits: 2.0,
        }
    }

    fn empty_cycle(cycle: u32, budget: u32) -> CycleInput {
        CycleInput {
            cycle,
            budget_wells: budget,
            observations: Vec::new(),
            realized: Vec::new(),
            proposals: Vec::new(),
        }
    }

    #[test]
    fn test_first_cycle_forces_baseline_calibration() {
        let mut core = EpistemicCore::new(CoreConfig::default());
        let mut input = empty_cycle(0, 500);
        input.proposals.push(biology_proposal());

        let outcome = core.run_cycle(&input).unwrap();
        let CycleDecision::Proceed { template, receipt, .. } = &outcome.decision else {
            panic!("expected forced calibration");
        };
        assert_eq!(template, "baseline_noise");
        assert_eq!(receipt.trigger, Trigger::MustCalibrate);
        assert_eq!(core.receipts().len(), 1);
    }

    #[test]
    fn test_observations_earn_the_noise_gate() {
        let mut core = EpistemicCore::new(CoreConfig::default());
        let input = CycleInput {
            cycle: 0,
            budget_wells: 500,
            observations: vec![noise_summary(24, 0.05), noise_summary(24, 0.04)],
            realized: Vec::new(),
            proposals: Vec::new(),
        };
        let outcome = core.run_cycle(&input).unwrap();

        let snap = core.ledger().snapshot();
        assert_eq!(snap.gate_status("noise"), GateStatus::Earned);
        assert_eq!(snap.provenance.total_wells, 48);
        // Gate fold + nuisance + provenance folds all appear as events.
        assert!(outcome.events.len() >= 3);
    }

    #[test]
    fn test_forbidden_observation_field_is_fatal() {
        let mut core = EpistemicCore::new(CoreConfig::default());
        let mut summary = noise_summary(24, 0.05);
        summary.feature_means = Some(BTreeMap::from([
            ("latent_stress_axis".to_string(), 0.7),
        ]));
        let input = CycleInput {
            cycle: 0,
            budget_wells: 500,
            observations: vec![summary],
            realized: Vec::new(),
            proposals: Vec::new(),
        };
        let err = core.run_cycle(&input).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Invariant(InvariantViolation::Perimeter(_))
        ));
        // The violation terminated the cycle before any receipt.
        assert!(core.receipts().is_empty());
    }

    #[test]
    fn test_provenance_inflation_attack_defeated() {
        let mut core = EpistemicCore::new(CoreConfig::default());

        // Cycle 0: 48 legitimate baseline wells.
        core.run_cycle(&CycleInput {
            cycle: 0,
            budget_wells: 500,
            observations: vec![noise_summary(24, 0.05), noise_summary(24, 0.04)],
            realized: Vec::new(),
            proposals: Vec::new(),
        })
        .unwrap();
        assert_eq!(core.ledger().snapshot().provenance.total_wells, 48);

        // Cycle 1: 24 more baseline-looking wells. Provenance is frozen;
        // the variance nuisance still updates.
        let mut late = noise_summary(24, 0.09);
        late.plate_id = Some("plate_b".to_string());
        core.run_cycle(&CycleInput {
            cycle: 1,
            budget_wells: 450,
            observations: vec![late],
            realized: Vec::new(),
            proposals: Vec::new(),
        })
        .unwrap();

        let snap = core.ledger().snapshot();
        assert_eq!(snap.provenance.total_wells, 48);
        assert!(!snap.provenance.plates_seen.contains("plate_b"));
        assert_eq!(snap.nuisance["cv_noise"], 0.09);
    }

    #[test]
    fn test_overclaim_blocks_biology_but_not_calibration() {
        let mut core = EpistemicCore::new(CoreConfig::default());

        // Cycle 0: earn the noise gate.
        core.run_cycle(&CycleInput {
            cycle: 0,
            budget_wells: 500,
            observations: vec![noise_summary(24, 0.05), noise_summary(24, 0.04)],
            realized: Vec::new(),
            proposals: Vec::new(),
        })
        .unwrap();

        // Cycle 1: ldh gate is forced; the decision claims 0 bits.
        let outcome = core
            .run_cycle(&CycleInput {
                cycle: 1,
                budget_wells: 450,
                observations: Vec::new(),
                realized: Vec::new(),
                proposals: vec![biology_proposal()],
            })
            .unwrap();
        let CycleDecision::Proceed { template, design_id, .. } = &outcome.decision else {
            panic!("expected forced ldh calibration");
        };
        assert_eq!(template, "calibrate_ldh");
        let forced_id = design_id.clone();

        // Cycle 2: earn ldh; an agent-proposed biology action is selected
        // and claims 2.5 bits it will not realize.
        let mut ldh = noise_summary(30, 0.05);
        ldh.assay = "ldh".to_string();
        let mut proposal = biology_proposal();
        proposal.expected_gain_bits = 2.5;
        let outcome = core
            .run_cycle(&CycleInput {
                cycle: 2,
                budget_wells: 400,
                observations: vec![ldh.clone(), {
                    let mut second = ldh.clone();
                    second.position_tag = "edge".to_string();
                    second
                }],
                realized: vec![RealizedGain {
                    action_id: forced_id,
                    actual_gain_bits: 0.0,
                }],
                proposals: vec![proposal],
            })
            .unwrap();
        let CycleDecision::Proceed { design_id, receipt, .. } = &outcome.decision else {
            panic!("expected scored selection, got {:?}", outcome.decision);
        };
        assert_eq!(receipt.trigger, Trigger::Scoring);
        let overclaimed_id = design_id.clone();

        // Cycle 3: the 2.5-bit gap lands as debt; the next biology
        // proposal is refused while calibration is still accepted.
        let outcome = core
            .run_cycle(&CycleInput {
                cycle: 3,
                budget_wells: 350,
                observations: Vec::new(),
                realized: vec![RealizedGain {
                    action_id: overclaimed_id,
                    actual_gain_bits: 0.0,
                }],
                proposals: vec![biology_proposal()],
            })
            .unwrap();
        let CycleDecision::Refuse { record, .. } = &outcome.decision else {
            panic!("expected debt refusal, got {:?}", outcome.decision);
        };
        assert_eq!(record.refusal_reason, REASON_DEBT_HARD_BLOCK);
        assert!(record.debt_bits > 2.0);
        assert_eq!(core.refusals().len(), 1);

        let calibration = ActionProposal {
            template: "recalibrate_ldh".to_string(),
            template_kwargs: json!({"wells": 24}),
            instrument: Instrument::Ldh,
            category: ActionCategory::Calibration,
            base_cost_wells: 24,
            expected_gain_bits: 0.5,
        };
        let outcome = core
            .run_cycle(&CycleInput {
                cycle: 4,
                budget_wells: 350,
                observations: Vec::new(),
                realized: Vec::new(),
                proposals: vec![calibration],
            })
            .unwrap();
        assert!(matches!(outcome.decision, CycleDecision::Proceed { .. }));
    }

    #[test]
    fn test_resolve_without_claim_is_an_error() {
        let mut core = EpistemicCore::new(CoreConfig::default());
        let mut input = empty_cycle(0, 500);
        input.realized.push(RealizedGain {
            action_id: "never_claimed".to_string(),
            actual_gain_bits: 1.0,
        });
        assert!(matches!(
            core.run_cycle(&input),
            Err(CoreError::Debt(DebtError::ResolveWithoutClaim { .. }))
        ));
    }

    #[test]
    fn test_budget_exhaustion_aborts_with_forced_receipt() {
        let mut core = EpistemicCore::new(CoreConfig::default());
        let outcome = core.run_cycle(&empty_cycle(0, 5)).unwrap();
        let CycleDecision::Abort { calibration_plan, receipt, .. } = &outcome.decision else {
            panic!("expected abort");
        };
        assert!(receipt.forced);
        assert_eq!(calibration_plan.wells_available, 5);
        assert_eq!(core.receipts().len(), 1);
    }

    #[test]
    fn test_unknown_position_tag_fails_fast() {
        let mut core = EpistemicCore::new(CoreConfig::default());
        let mut summary = noise_summary(24, 0.05);
        summary.position_tag = "somewhere".to_string();
        let input = CycleInput {
            cycle: 0,
            budget_wells: 500,
            observations: vec![summary],
            realized: Vec::new(),
            proposals: Vec::new(),
        };
        assert!(matches!(
            core.run_cycle(&input),
            Err(CoreError::Validation(ValidationError::UnknownPositionClass { .. }))
        ));
    }

    #[test]
    fn test_one_receipt_per_cycle() {
        let mut core = EpistemicCore::new(CoreConfig::default());
        for cycle in 0..4 {
            core.run_cycle(&empty_cycle(cycle, 500)).unwrap();
        }
        assert_eq!(core.receipts().len(), 4);
    }
}
