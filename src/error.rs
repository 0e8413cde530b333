//! Typed error hierarchy for the deduplication engine.
//!
//! Each module that can fail exposes its own `thiserror`-derived enum;
//! `anyhow` is reserved for the binary entry points where we just want
//! a readable chain on exit.

use thiserror::Error;

/// Errors raised while resolving a dimension row through the
/// select-or-insert primitive (C1).
#[derive(Error, Debug)]
pub enum DimensionError {
    #[error("more than one {dimension} row matches identifying fields {fields}")]
    MultipleMatches { dimension: &'static str, fields: String },

    #[error("unique constraint still violated after retry for {dimension} ({fields})")]
    RetryExhausted { dimension: &'static str, fields: String },

    #[error("database error resolving {dimension}: {source}")]
    Database {
        dimension: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Errors raised merging a single visit (C5).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("dimension resolution failed: {0}")]
    Dimension(#[from] DimensionError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("invalid clinical units for loinc {code}: expected one of {expected:?}, got {actual:?}")]
    InvalidUnits { code: &'static str, expected: &'static [&'static str], actual: String },

    #[error("visit {visit_id} canceled: no admit_datetime observed in any message")]
    Canceled { visit_id: String },

    #[error("facility npi {npi} has no dim_facility row; bootstrap static data before processing visits")]
    UnknownFacility { npi: i64 },

    #[error("lab reconstruction failed: {0}")]
    LabStateMachine(#[from] LabStateMachineError),
}

/// Errors raised reconstructing labs from an OBR/OBX stream (C3, §4.3).
#[derive(Error, Debug)]
pub enum LabStateMachineError {
    #[error("obr {obr_id} obx {obx_id} carries no observation_id, alt_id, obr loinc_code, or obr alt_code")]
    NoCodeDefined { obr_id: i64, obx_id: i64 },
}

/// Errors raised running the manager (C6+C7).
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("failed to acquire single-instance lock file {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read/write date cursor file {path}: {source}")]
    Datefile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("--countdown was given but no date is available to advance (pass --date or seed {path})")]
    NoDateToCountdown { path: String },
}

/// Errors raised loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required configuration value: {0}")]
    MissingValue(&'static str),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Errors raised by the static-data import/export tool (C8).
#[derive(Error, Debug)]
pub enum StaticDataError {
    #[error(transparent)]
    Dimension(#[from] DimensionError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("failed to read static data file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse static data file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to serialize static data: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Errors raised by the minimal report generator (C10).
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("unknown reportable region: {0}")]
    UnknownRegion(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("feature disabled: {0}")]
    FeatureDisabled(&'static str),
}
