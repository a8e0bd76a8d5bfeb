//! Custom error types for the application.
//!
//! This module defines the primary error type, `AnalyzerError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures the analyzer can
//! hit, from configuration and file I/O problems to hardware faults and
//! remote console errors.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from the `config` crate, typically file
//!   parsing or format issues in the configuration files.
//! - **`Configuration`**: Semantic errors in the configuration, values that
//!   parse fine but are logically invalid (e.g. an empty results directory).
//! - **`Io`**: Wraps standard `std::io::Error`, covering all file I/O.
//! - **`Hardware`**: Sensor or light driver failures. These are fatal to the
//!   current capture run; the run is aborted and the light switched off.
//! - **`Record`**: A stored result file could not be parsed or written.
//! - **`Remote`**: A console call failed in a way that is neither a conflict
//!   nor plain unreachability (e.g. an unexpected status code).
//! - **`Unreachable`**: The console did not answer at all. Timeouts and
//!   connection failures land here so the sync engine can report "no
//!   network" instead of failing the record.
//! - **`DataIntegrity`**: A supposedly-unique lookup returned more than one
//!   match (multiple stored files for one id, multiple remote samples for
//!   one filter). Surfaced loudly, never auto-resolved, and the record in
//!   question is left untouched.
//! - **`Busy`**: A reconciliation attempt for a record that already has one
//!   in flight. Callers treat this like "try again later".
//!
//! Schedule overruns are deliberately absent: falling behind the capture
//! schedule is handled by the skip policy and never surfaced as an error.
//! Remote conflicts (duplicate sample id or barcode) are likewise not errors
//! but reconciliation outcomes, see [`crate::sync::SyncOutcome`].

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AnalyzerError>;

/// The application error type.
#[derive(Error, Debug)]
pub enum AnalyzerError {
    /// Configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but holds an invalid value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sensor or light driver failure. Fatal to the current capture run.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// A stored result record could not be parsed or written.
    #[error("Record error: {0}")]
    Record(String),

    /// Unexpected failure talking to the console (not a conflict, not
    /// unreachability).
    #[error("Remote error: {0}")]
    Remote(String),

    /// The console could not be reached at all (timeout or connection
    /// refused). Mapped to a no-network outcome, the record stays pending.
    #[error("Console unreachable: {0}")]
    Unreachable(String),

    /// A unique lookup returned more than one match.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// A reconciliation for this record is already in flight.
    #[error("Reconciliation already in flight for record {0}")]
    Busy(String),

    /// The operator aborted the capture run. The light is switched off and
    /// the sensor released before this propagates.
    #[error("Capture run aborted")]
    Aborted,
}
