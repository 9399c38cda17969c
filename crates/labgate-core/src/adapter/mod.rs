//! Collaborator interfaces.
//!
//! The decision core performs no I/O of its own: executing a chosen
//! action and persisting designs are the caller's job, behind these
//! traits. Implementations live outside this crate and carry no business
//! logic.
//!
//! # Re-entry Contract
//!
//! Whatever a [`LabSimulator`] returns is untrusted: it MUST pass the
//! ground-truth perimeter before the belief ledger is allowed to ingest
//! it. The core enforces this in `run_cycle`; implementations must not
//! assume their output is exempt.

use thiserror::Error;

/// Errors from a simulator invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SimulatorError {
    /// The template is unknown to the simulator.
    #[error("unknown template '{template}'")]
    UnknownTemplate {
        /// The rejected template.
        template: String,
    },

    /// Execution failed.
    #[error("simulation failed: {message}")]
    ExecutionFailed {
        /// Failure description.
        message: String,
    },
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The backing store rejected the operation.
    #[error("store operation failed: {message}")]
    Backend {
        /// Failure description.
        message: String,
    },
}

/// Executes chosen actions against the laboratory.
pub trait LabSimulator {
    /// Runs `{template, template_kwargs}` and returns raw per-well
    /// measurements as a generic tree.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError`] for unknown templates or failed runs.
    fn execute(
        &mut self,
        template: &str,
        template_kwargs: &serde_json::Value,
    ) -> Result<serde_json::Value, SimulatorError>;
}

/// Stores designs and results keyed by design id. Read/write only.
pub trait DesignStore {
    /// Persists a design under its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn put_design(
        &mut self,
        design_id: &str,
        design: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Loads a design by id, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn get_design(&self, design_id: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Persists a result under its design id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn put_result(
        &mut self,
        design_id: &str,
        result: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Loads a result by design id, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn get_result(&self, design_id: &str) -> Result<Option<serde_json::Value>, StoreError>;
}
