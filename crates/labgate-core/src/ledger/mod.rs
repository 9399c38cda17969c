//! Belief ledger: typed agent beliefs behind a single sanctioned mutation
//! path.
//!
//! The ledger holds everything the agent is allowed to believe about the
//! laboratory — instrument gates, calibration provenance, nuisance
//! estimates — and guarantees that no belief changes without an
//! append-only [`LedgerEvent`] recording the previous value, the new
//! value, and the evidence behind the change.
//!
//! # Invariants
//!
//! - All mutation flows through the controlled setters
//!   ([`BeliefLedger::set_belief`], [`BeliefLedger::fold_gate_evidence`],
//!   [`BeliefLedger::record_shadow`],
//!   [`BeliefLedger::fold_calibration_wells`]); each appends exactly one
//!   event.
//! - [`BeliefLedger::assert_no_undocumented_mutation`] compares two full
//!   snapshots against a cycle's event list and raises
//!   [`LedgerInvariantError`] — a distinct, fatal type — if any field
//!   changed with zero corresponding events. This is the load-bearing
//!   fail-loud check for code paths that bypass the setters.
//! - Gate transitions are driven purely by accumulated degrees-of-freedom
//!   and relative width against configured thresholds; a downgrade is
//!   itself a recorded event, never silent.
//! - Shadow-channel updates always carry `actionable = false` and never
//!   touch the real gate status, regardless of how favorable the proxy
//!   metric looks (knowledge is not permission).
//! - Calibration provenance accumulates only while the cycle counter is
//!   zero; later folds are a silent no-op for provenance specifically,
//!   which defeats provenance-inflation via late baseline wells. Ordinary
//!   nuisance estimates keep updating in every cycle.
//!
//! Mutation is only permitted inside a `begin_cycle`/`end_cycle` bracket;
//! the bracket is the ledger's critical section and the invariant checker
//! runs once per cycle boundary.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::canonical::{CanonicalCondition, PositionClass};

/// Maximum events accepted within one cycle bracket.
pub const MAX_EVENTS_PER_CYCLE: usize = 256;

/// Maximum supporting condition keys per event.
pub const MAX_SUPPORTING_CONDITIONS: usize = 96;

/// Ordinary ledger errors (recoverable misuse, malformed evidence).
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum LedgerError {
    /// A mutation was attempted outside a cycle bracket.
    #[error("no cycle is open; call begin_cycle first")]
    CycleNotOpen,

    /// `begin_cycle` was called while a bracket was open.
    #[error("cycle {open} is already open, cannot begin cycle {requested}")]
    CycleAlreadyOpen {
        /// The cycle currently open.
        open: u32,
        /// The cycle that was requested.
        requested: u32,
    },

    /// Cycle numbers must be strictly increasing.
    #[error("non-monotonic cycle: last closed {last}, requested {requested}")]
    NonMonotonicCycle {
        /// The last closed cycle.
        last: u32,
        /// The cycle that was requested.
        requested: u32,
    },

    /// The per-cycle event bound was reached.
    #[error("event limit reached: {MAX_EVENTS_PER_CYCLE} events in one cycle")]
    TooManyEvents,

    /// Supporting condition list exceeds the bound.
    #[error("too many supporting conditions: {count} > {MAX_SUPPORTING_CONDITIONS}")]
    TooManySupportingConditions {
        /// The offending count.
        count: usize,
    },

    /// A numeric evidence field was NaN or infinite.
    #[error("non-finite evidence for '{belief}': {value}")]
    NonFiniteEvidence {
        /// The belief being updated.
        belief: String,
        /// The offending value.
        value: f64,
    },

    /// Event payload serialization failed.
    #[error("ledger event serialization failed: {message}")]
    Serialization {
        /// Error message.
        message: String,
    },
}

/// Fatal ledger invariant violations.
///
/// Distinct from [`LedgerError`]: these signal a broken contract between
/// components, not user-correctable input. They terminate the cycle and
/// are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerInvariantError {
    /// A belief field changed with no corresponding event in the cycle.
    #[error("undocumented mutation of '{field}' in cycle {cycle}")]
    UndocumentedMutation {
        /// The field that changed without an event.
        field: String,
        /// The cycle in which the mutation was detected.
        cycle: u32,
    },
}

/// Tri-state capability status of an instrument gate.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// The instrument is not understood; acting on it is forbidden.
    #[default]
    Lost,
    /// Evidence is accumulating but thresholds are not yet met.
    Earning,
    /// The instrument is understood well enough to act on.
    Earned,
}

impl GateStatus {
    /// Returns the stable string form used in receipts and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lost => "lost",
            Self::Earning => "earning",
            Self::Earned => "earned",
        }
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds that drive gate transitions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Degrees of freedom required before a gate can be earned.
    pub min_df: f64,
    /// Relative width that must be undershot before a gate can be earned.
    pub max_rel_width: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_df: 20.0,
            max_rel_width: 0.25,
        }
    }
}

impl GateConfig {
    /// Creates a config with explicit thresholds.
    #[must_use]
    pub const fn new(min_df: f64, max_rel_width: f64) -> Self {
        Self {
            min_df,
            max_rel_width,
        }
    }
}

/// Proxy-derived evidence about an expensive instrument.
///
/// Informative but never actionable: it cannot flip the real gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShadowEvidence {
    /// The proxy metric value.
    pub metric: f64,
    /// The cheap instrument that produced the proxy.
    pub source: String,
    /// Cycle in which the shadow evidence was recorded.
    pub cycle: u32,
}

/// The full belief about one instrument gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateBelief {
    /// Tri-state status, derived from thresholds.
    pub status: GateStatus,
    /// Accumulated degrees of freedom.
    pub df: f64,
    /// Latest relative-width estimate (infinite until first evidence).
    pub rel_width: f64,
    /// Shadow channel, if any proxy evidence has been recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow: Option<ShadowEvidence>,
}

impl Default for GateBelief {
    fn default() -> Self {
        Self {
            status: GateStatus::Lost,
            df: 0.0,
            rel_width: f64::INFINITY,
            shadow: None,
        }
    }
}

/// The record of which wells contributed to calibration.
///
/// Locked after cycle 0: folds in later cycles do not change it.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationProvenance {
    /// Well counts per position class.
    pub wells_by_position: BTreeMap<PositionClass, u32>,
    /// Plate identifiers seen during calibration.
    pub plates_seen: BTreeSet<String>,
    /// Per-channel baseline estimates.
    pub channel_baselines: BTreeMap<String, f64>,
    /// Total wells folded into calibration.
    pub total_wells: u32,
    /// Cycle of the last accepted fold.
    pub last_update_cycle: u32,
}

/// An immutable full-state snapshot of the agent's beliefs.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeliefSnapshot {
    /// Gate beliefs by gate name (noise, ldh, cell_painting, scrna, ...).
    pub gates: BTreeMap<String, GateBelief>,
    /// Nuisance estimates (plate CV, drift terms, ...), updatable any cycle.
    pub nuisance: BTreeMap<String, f64>,
    /// Calibration provenance, frozen after cycle 0.
    pub provenance: CalibrationProvenance,
}

impl BeliefSnapshot {
    /// Returns the gate status, `Lost` for unknown gates.
    #[must_use]
    pub fn gate_status(&self, gate: &str) -> GateStatus {
        self.gates.get(gate).map_or(GateStatus::Lost, |g| g.status)
    }

    /// Returns the status of every known gate.
    #[must_use]
    pub fn gate_states(&self) -> BTreeMap<String, GateStatus> {
        self.gates
            .iter()
            .map(|(name, belief)| (name.clone(), belief.status))
            .collect()
    }
}

/// One append-only evidence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerEvent {
    /// Cycle in which the event was appended.
    pub cycle: u32,
    /// Belief name (`gate.noise`, `shadow.scrna`, `nuisance.plate_cv`,
    /// `calibration_provenance`).
    pub belief: String,
    /// Value before the mutation.
    pub previous: serde_json::Value,
    /// Value after the mutation.
    pub new: serde_json::Value,
    /// Evidence payload backing the mutation.
    pub evidence: serde_json::Value,
    /// Ordered supporting condition keys.
    pub supporting: Vec<String>,
    /// Human-readable note.
    pub note: String,
    /// `false` for shadow-channel events: informative, never permission.
    pub actionable: bool,
}

/// Scalar or structural belief value accepted by [`BeliefLedger::set_belief`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeliefValue {
    /// A nuisance estimate.
    Scalar(f64),
}

/// The belief ledger: snapshot state plus the per-cycle event log.
#[derive(Debug, Clone)]
pub struct BeliefLedger {
    state: BeliefSnapshot,
    config: GateConfig,
    open_cycle: Option<u32>,
    last_closed: Option<u32>,
    cycle_events: Vec<LedgerEvent>,
    history: Vec<LedgerEvent>,
}

impl BeliefLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        Self {
            state: BeliefSnapshot::default(),
            config,
            open_cycle: None,
            last_closed: None,
            cycle_events: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Returns the gate thresholds in force.
    #[must_use]
    pub const fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Returns the currently open cycle, if any.
    #[must_use]
    pub const fn open_cycle(&self) -> Option<u32> {
        self.open_cycle
    }

    /// Returns an immutable snapshot of the current belief state.
    #[must_use]
    pub fn snapshot(&self) -> BeliefSnapshot {
        self.state.clone()
    }

    /// Returns the full append-only event history.
    #[must_use]
    pub fn history(&self) -> &[LedgerEvent] {
        &self.history
    }

    /// Opens the cycle bracket.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CycleAlreadyOpen`] if a bracket is open, or
    /// [`LedgerError::NonMonotonicCycle`] if `n` does not advance the
    /// counter.
    pub fn begin_cycle(&mut self, n: u32) -> Result<(), LedgerError> {
        if let Some(open) = self.open_cycle {
            return Err(LedgerError::CycleAlreadyOpen { open, requested: n });
        }
        if let Some(last) = self.last_closed {
            if n <= last {
                return Err(LedgerError::NonMonotonicCycle { last, requested: n });
            }
        }
        self.open_cycle = Some(n);
        self.cycle_events.clear();
        debug!(cycle = n, "ledger cycle opened");
        Ok(())
    }

    /// Closes the cycle bracket and returns its ordered event list.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CycleNotOpen`] outside a bracket.
    pub fn end_cycle(&mut self) -> Result<Vec<LedgerEvent>, LedgerError> {
        let cycle = self.open_cycle.take().ok_or(LedgerError::CycleNotOpen)?;
        self.last_closed = Some(cycle);
        let events = std::mem::take(&mut self.cycle_events);
        self.history.extend(events.iter().cloned());
        debug!(cycle, events = events.len(), "ledger cycle closed");
        Ok(events)
    }

    /// Sets a named belief value, recording exactly one event.
    ///
    /// This is the sanctioned mutation path for nuisance estimates; gates
    /// and provenance have their own typed folds below, all of which
    /// funnel into the same append.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] outside a cycle bracket or on malformed
    /// evidence.
    pub fn set_belief(
        &mut self,
        name: &str,
        value: BeliefValue,
        evidence: serde_json::Value,
        supporting: &[CanonicalCondition],
        note: &str,
    ) -> Result<(), LedgerError> {
        let BeliefValue::Scalar(v) = value;
        if !v.is_finite() {
            return Err(LedgerError::NonFiniteEvidence {
                belief: name.to_string(),
                value: v,
            });
        }
        let previous = self
            .state
            .nuisance
            .get(name)
            .map_or(serde_json::Value::Null, |old| serde_json::json!(old));
        self.append_event(
            &format!("nuisance.{name}"),
            previous,
            serde_json::json!(v),
            evidence,
            supporting,
            note,
            true,
        )?;
        self.state.nuisance.insert(name.to_string(), v);
        Ok(())
    }

    /// Folds instrument-gate evidence, deriving the tri-state status.
    ///
    /// Status is computed purely from accumulated degrees of freedom and
    /// the latest relative width against [`GateConfig`]; both upgrades and
    /// downgrades are recorded events.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] outside a cycle bracket or on non-finite
    /// evidence.
    pub fn fold_gate_evidence(
        &mut self,
        gate: &str,
        df_delta: f64,
        rel_width: f64,
        evidence: serde_json::Value,
        supporting: &[CanonicalCondition],
        note: &str,
    ) -> Result<GateStatus, LedgerError> {
        if !df_delta.is_finite() || df_delta < 0.0 {
            return Err(LedgerError::NonFiniteEvidence {
                belief: format!("gate.{gate}"),
                value: df_delta,
            });
        }
        if !rel_width.is_finite() || rel_width < 0.0 {
            return Err(LedgerError::NonFiniteEvidence {
                belief: format!("gate.{gate}"),
                value: rel_width,
            });
        }

        let old = self.state.gates.get(gate).cloned().unwrap_or_default();
        let mut updated = old.clone();
        updated.df += df_delta;
        updated.rel_width = rel_width;
        updated.status = self.derive_status(updated.df, updated.rel_width);

        if updated.status < old.status {
            warn!(
                gate,
                from = %old.status,
                to = %updated.status,
                "gate downgraded"
            );
        }

        let previous = to_json(&old)?;
        let new = to_json(&updated)?;
        self.append_event(
            &format!("gate.{gate}"),
            previous,
            new,
            evidence,
            supporting,
            note,
            true,
        )?;
        let status = updated.status;
        self.state.gates.insert(gate.to_string(), updated);
        Ok(status)
    }

    /// Records proxy evidence for a gate on its shadow channel.
    ///
    /// The event always carries `actionable = false` and the real gate
    /// status is never touched, no matter how favorable `metric` is.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] outside a cycle bracket or on non-finite
    /// input.
    pub fn record_shadow(
        &mut self,
        gate: &str,
        metric: f64,
        source: &str,
        evidence: serde_json::Value,
        note: &str,
    ) -> Result<(), LedgerError> {
        if !metric.is_finite() {
            return Err(LedgerError::NonFiniteEvidence {
                belief: format!("shadow.{gate}"),
                value: metric,
            });
        }
        let cycle = self.open_cycle.ok_or(LedgerError::CycleNotOpen)?;
        let old = self.state.gates.get(gate).cloned().unwrap_or_default();
        let mut updated = old.clone();
        updated.shadow = Some(ShadowEvidence {
            metric,
            source: source.to_string(),
            cycle,
        });

        let previous = to_json(&old)?;
        let new = to_json(&updated)?;
        self.append_event(
            &format!("shadow.{gate}"),
            previous,
            new,
            evidence,
            &[],
            note,
            false,
        )?;
        self.state.gates.insert(gate.to_string(), updated);
        Ok(())
    }

    /// Folds baseline wells into calibration provenance.
    ///
    /// Provenance accumulates only while the open cycle is zero. In any
    /// later cycle the fold is a silent no-op for provenance specifically
    /// (returns `false`, appends nothing, changes nothing) — running
    /// baseline wells during the biology phase cannot manufacture the
    /// appearance of broad calibration coverage.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CycleNotOpen`] outside a cycle bracket.
    pub fn fold_calibration_wells(
        &mut self,
        position_class: PositionClass,
        plate_id: &str,
        wells: u32,
        channel_baselines: &BTreeMap<String, f64>,
    ) -> Result<bool, LedgerError> {
        let cycle = self.open_cycle.ok_or(LedgerError::CycleNotOpen)?;
        if cycle != 0 {
            debug!(cycle, plate_id, wells, "calibration fold ignored after cycle 0");
            return Ok(false);
        }

        let old = self.state.provenance.clone();
        let mut updated = old.clone();
        *updated.wells_by_position.entry(position_class).or_insert(0) += wells;
        updated.plates_seen.insert(plate_id.to_string());
        for (channel, baseline) in channel_baselines {
            updated.channel_baselines.insert(channel.clone(), *baseline);
        }
        updated.total_wells += wells;
        updated.last_update_cycle = cycle;

        let previous = to_json(&old)?;
        let new = to_json(&updated)?;
        self.append_event(
            "calibration_provenance",
            previous,
            new,
            serde_json::json!({
                "position_class": position_class.as_str(),
                "plate_id": plate_id,
                "wells": wells,
            }),
            &[],
            "baseline wells folded into calibration provenance",
            true,
        )?;
        self.state.provenance = updated;
        Ok(true)
    }

    /// Verifies that every state change between two snapshots is backed by
    /// at least one event.
    ///
    /// This is the fail-loud check that catches any code path bypassing
    /// the controlled setters: it diffs the snapshots field by field and
    /// demands a matching event name for each difference.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerInvariantError::UndocumentedMutation`] naming the
    /// first undocumented field.
    pub fn assert_no_undocumented_mutation(
        before: &BeliefSnapshot,
        after: &BeliefSnapshot,
        events: &[LedgerEvent],
        cycle: u32,
    ) -> Result<(), LedgerInvariantError> {
        let documented: BTreeSet<&str> = events.iter().map(|e| e.belief.as_str()).collect();

        for field in diff_snapshots(before, after) {
            if !documented.contains(field.as_str()) {
                return Err(LedgerInvariantError::UndocumentedMutation { field, cycle });
            }
        }
        Ok(())
    }

    fn derive_status(&self, df: f64, rel_width: f64) -> GateStatus {
        if df >= self.config.min_df && rel_width <= self.config.max_rel_width {
            GateStatus::Earned
        } else if df > 0.0 {
            GateStatus::Earning
        } else {
            GateStatus::Lost
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn append_event(
        &mut self,
        belief: &str,
        previous: serde_json::Value,
        new: serde_json::Value,
        evidence: serde_json::Value,
        supporting: &[CanonicalCondition],
        note: &str,
        actionable: bool,
    ) -> Result<(), LedgerError> {
        let cycle = self.open_cycle.ok_or(LedgerError::CycleNotOpen)?;
        if self.cycle_events.len() >= MAX_EVENTS_PER_CYCLE {
            return Err(LedgerError::TooManyEvents);
        }
        if supporting.len() > MAX_SUPPORTING_CONDITIONS {
            return Err(LedgerError::TooManySupportingConditions {
                count: supporting.len(),
            });
        }
        debug!(cycle, belief, actionable, "ledger event appended");
        self.cycle_events.push(LedgerEvent {
            cycle,
            belief: belief.to_string(),
            previous,
            new,
            evidence,
            supporting: supporting.iter().map(CanonicalCondition::key).collect(),
            note: note.to_string(),
            actionable,
        });
        Ok(())
    }
}

/// Serializes an event payload.
fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, LedgerError> {
    serde_json::to_value(value).map_err(|error| LedgerError::Serialization {
        message: error.to_string(),
    })
}

/// Lists the event names that must exist for the differences between two
/// snapshots.
fn diff_snapshots(before: &BeliefSnapshot, after: &BeliefSnapshot) -> Vec<String> {
    let mut changed = Vec::new();

    let gate_names: BTreeSet<&String> =
        before.gates.keys().chain(after.gates.keys()).collect();
    for name in gate_names {
        let old = before.gates.get(name.as_str());
        let new = after.gates.get(name.as_str());
        if old == new {
            continue;
        }
        let default = GateBelief::default();
        let old = old.unwrap_or(&default);
        let new = new.unwrap_or(&default);
        let core_changed = old.status != new.status
            || old.df != new.df
            || old.rel_width != new.rel_width;
        if core_changed {
            changed.push(format!("gate.{name}"));
        }
        if old.shadow != new.shadow {
            changed.push(format!("shadow.{name}"));
        }
    }

    let nuisance_keys: BTreeSet<&String> =
        before.nuisance.keys().chain(after.nuisance.keys()).collect();
    for key in nuisance_keys {
        if before.nuisance.get(key.as_str()) != after.nuisance.get(key.as_str()) {
            changed.push(format!("nuisance.{key}"));
        }
    }

    if before.provenance != after.provenance {
        changed.push("calibration_provenance".to_string());
    }

    changed
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::canonical::{make_condition, PositionClass};

    fn open_ledger(cycle: u32) -> BeliefLedger {
        let mut ledger = BeliefLedger::new(GateConfig::default());
        // Walk the cycle counter forward so cycle brackets stay monotonic.
        for n in 0..cycle {
            ledger.begin_cycle(n).unwrap();
            ledger.end_cycle().unwrap();
        }
        ledger.begin_cycle(cycle).unwrap();
        ledger
    }

    #[test]
    fn test_cycle_bracket_required() {
        let mut ledger = BeliefLedger::new(GateConfig::default());
        let err = ledger
            .set_belief("plate_cv", BeliefValue::Scalar(0.1), json!({}), &[], "n")
            .unwrap_err();
        assert_eq!(err, LedgerError::CycleNotOpen);
    }

    #[test]
    fn test_cycle_bracket_monotonic() {
        let mut ledger = open_ledger(3);
        ledger.end_cycle().unwrap();
        assert!(matches!(
            ledger.begin_cycle(3),
            Err(LedgerError::NonMonotonicCycle { last: 3, requested: 3 })
        ));
        assert!(ledger.begin_cycle(4).is_ok());
        assert!(matches!(
            ledger.begin_cycle(5),
            Err(LedgerError::CycleAlreadyOpen { open: 4, requested: 5 })
        ));
    }

    #[test]
    fn test_set_belief_emits_exactly_one_event() {
        let mut ledger = open_ledger(0);
        ledger
            .set_belief(
                "plate_cv",
                BeliefValue::Scalar(0.08),
                json!({"wells": 48}),
                &[],
                "baseline variance estimate",
            )
            .unwrap();
        let events = ledger.end_cycle().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].belief, "nuisance.plate_cv");
        assert_eq!(events[0].previous, serde_json::Value::Null);
        assert_eq!(events[0].new, json!(0.08));
        assert!(events[0].actionable);
    }

    #[test]
    fn test_set_belief_records_previous_value() {
        let mut ledger = open_ledger(0);
        ledger
            .set_belief("plate_cv", BeliefValue::Scalar(0.08), json!({}), &[], "a")
            .unwrap();
        ledger
            .set_belief("plate_cv", BeliefValue::Scalar(0.05), json!({}), &[], "b")
            .unwrap();
        let events = ledger.end_cycle().unwrap();
        assert_eq!(events[1].previous, json!(0.08));
        assert_eq!(events[1].new, json!(0.05));
    }

    #[test]
    fn test_set_belief_rejects_non_finite() {
        let mut ledger = open_ledger(0);
        assert!(matches!(
            ledger.set_belief("x", BeliefValue::Scalar(f64::NAN), json!({}), &[], ""),
            Err(LedgerError::NonFiniteEvidence { .. })
        ));
    }

    #[test]
    fn test_gate_earns_through_thresholds() {
        let mut ledger = open_ledger(0);
        let status = ledger
            .fold_gate_evidence("noise", 10.0, 0.4, json!({}), &[], "first batch")
            .unwrap();
        assert_eq!(status, GateStatus::Earning);

        // df crosses the threshold but width is still too wide.
        let status = ledger
            .fold_gate_evidence("noise", 15.0, 0.4, json!({}), &[], "second batch")
            .unwrap();
        assert_eq!(status, GateStatus::Earning);

        // Width shrinks below the bound: earned.
        let status = ledger
            .fold_gate_evidence("noise", 5.0, 0.2, json!({}), &[], "third batch")
            .unwrap();
        assert_eq!(status, GateStatus::Earned);
    }

    #[test]
    fn test_gate_downgrade_is_a_recorded_event() {
        let mut ledger = open_ledger(0);
        ledger
            .fold_gate_evidence("ldh", 30.0, 0.1, json!({}), &[], "earned")
            .unwrap();
        assert_eq!(ledger.snapshot().gate_status("ldh"), GateStatus::Earned);

        // Width blows out: the downgrade appears as an event.
        ledger
            .fold_gate_evidence("ldh", 0.0, 0.9, json!({}), &[], "drift detected")
            .unwrap();
        let events = ledger.end_cycle().unwrap();
        assert_eq!(ledger.snapshot().gate_status("ldh"), GateStatus::Earning);
        let downgrade = events.last().unwrap();
        assert_eq!(downgrade.belief, "gate.ldh");
        assert!(downgrade.previous["status"] == json!("earned"));
        assert!(downgrade.new["status"] == json!("earning"));
    }

    #[test]
    fn test_shadow_never_flips_real_gate() {
        let mut ledger = open_ledger(0);
        // Arbitrarily good proxy evidence for an expensive instrument.
        ledger
            .record_shadow(
                "scrna",
                0.99,
                "cell_painting",
                json!({"proxy_r2": 0.99}),
                "morphology predicts transcriptome shift",
            )
            .unwrap();
        let events = ledger.end_cycle().unwrap();

        assert_eq!(ledger.snapshot().gate_status("scrna"), GateStatus::Lost);
        assert_eq!(events.len(), 1);
        assert!(!events[0].actionable);
        assert_eq!(events[0].belief, "shadow.scrna");
        let shadow = ledger.snapshot().gates["scrna"].shadow.clone().unwrap();
        assert_eq!(shadow.source, "cell_painting");
    }

    #[test]
    fn test_provenance_accumulates_in_cycle_zero() {
        let mut ledger = open_ledger(0);
        let baselines = BTreeMap::from([("ch1".to_string(), 100.5)]);
        assert!(ledger
            .fold_calibration_wells(PositionClass::Center, "plate_a", 48, &baselines)
            .unwrap());
        let snap = ledger.snapshot();
        assert_eq!(snap.provenance.total_wells, 48);
        assert_eq!(snap.provenance.wells_by_position[&PositionClass::Center], 48);
        assert!(snap.provenance.plates_seen.contains("plate_a"));
    }

    #[test]
    fn test_provenance_frozen_after_cycle_zero() {
        let mut ledger = open_ledger(0);
        let baselines = BTreeMap::new();
        ledger
            .fold_calibration_wells(PositionClass::Center, "plate_a", 48, &baselines)
            .unwrap();
        ledger.end_cycle().unwrap();

        // Cycle 1: provenance fold is a silent no-op...
        ledger.begin_cycle(1).unwrap();
        let folded = ledger
            .fold_calibration_wells(PositionClass::Edge, "plate_b", 24, &baselines)
            .unwrap();
        assert!(!folded);

        // ...while ordinary nuisance beliefs still update.
        ledger
            .set_belief("noise_sigma", BeliefValue::Scalar(0.03), json!({}), &[], "")
            .unwrap();
        let events = ledger.end_cycle().unwrap();

        let snap = ledger.snapshot();
        assert_eq!(snap.provenance.total_wells, 48);
        assert!(!snap.provenance.plates_seen.contains("plate_b"));
        assert_eq!(snap.nuisance["noise_sigma"], 0.03);
        assert!(events.iter().all(|e| e.belief != "calibration_provenance"));
    }

    #[test]
    fn test_undocumented_mutation_detected() {
        let mut ledger = open_ledger(0);
        let before = ledger.snapshot();

        // Bypass the controlled setter (test-only access to internals).
        ledger.state.nuisance.insert("smuggled".to_string(), 1.0);

        let after = ledger.snapshot();
        let events = ledger.end_cycle().unwrap();
        let err =
            BeliefLedger::assert_no_undocumented_mutation(&before, &after, &events, 0)
                .unwrap_err();
        assert_eq!(
            err,
            LedgerInvariantError::UndocumentedMutation {
                field: "nuisance.smuggled".to_string(),
                cycle: 0,
            }
        );
    }

    #[test]
    fn test_documented_mutations_pass_the_checker() {
        let mut ledger = open_ledger(0);
        let before = ledger.snapshot();
        let cond =
            make_condition("hela", "dmso", 0.0, 24.0, "noise", PositionClass::Center).unwrap();
        ledger
            .fold_gate_evidence("noise", 24.0, 0.1, json!({"wells": 24}), &[cond], "baseline")
            .unwrap();
        ledger
            .set_belief("plate_cv", BeliefValue::Scalar(0.04), json!({}), &[], "")
            .unwrap();
        let after = ledger.snapshot();
        let events = ledger.end_cycle().unwrap();

        BeliefLedger::assert_no_undocumented_mutation(&before, &after, &events, 0).unwrap();
        assert_eq!(events[0].supporting.len(), 1);
        assert!(events[0].supporting[0].starts_with("hela|dmso|0nM|1440min|noise"));
    }

    #[test]
    fn test_shadow_mutation_requires_shadow_event() {
        let mut ledger = open_ledger(0);
        let before = ledger.snapshot();
        ledger
            .record_shadow("scrna", 0.5, "ldh", json!({}), "")
            .unwrap();
        let after = ledger.snapshot();
        let events = ledger.end_cycle().unwrap();
        BeliefLedger::assert_no_undocumented_mutation(&before, &after, &events, 0).unwrap();

        // The same diff with the event list withheld must fail.
        let err = BeliefLedger::assert_no_undocumented_mutation(&before, &after, &[], 0)
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerInvariantError::UndocumentedMutation { ref field, .. }
                if field == "shadow.scrna"
        ));
    }

    #[test]
    fn test_event_bound_enforced() {
        let mut ledger = open_ledger(0);
        for i in 0..MAX_EVENTS_PER_CYCLE {
            ledger
                .set_belief(&format!("n{i}"), BeliefValue::Scalar(0.0), json!({}), &[], "")
                .unwrap();
        }
        assert!(matches!(
            ledger.set_belief("overflow", BeliefValue::Scalar(0.0), json!({}), &[], ""),
            Err(LedgerError::TooManyEvents)
        ));
    }

    #[test]
    fn test_history_is_append_only_across_cycles() {
        let mut ledger = open_ledger(0);
        ledger
            .set_belief("a", BeliefValue::Scalar(1.0), json!({}), &[], "")
            .unwrap();
        ledger.end_cycle().unwrap();
        ledger.begin_cycle(1).unwrap();
        ledger
            .set_belief("b", BeliefValue::Scalar(2.0), json!({}), &[], "")
            .unwrap();
        ledger.end_cycle().unwrap();

        let history = ledger.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].cycle, 0);
        assert_eq!(history[1].cycle, 1);
    }
}
