use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to the results store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("results query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The external text generator could not produce a response.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generator request failed: {0}")]
    Network(String),

    #[error("generator returned status {0}: {1}")]
    Api(u16, String),

    #[error("generator returned an empty response")]
    Empty,
}

/// Generated text did not match the plan schema.
#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("no JSON object found in generated text")]
    NoJson,

    #[error("generated JSON is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("generated plan is missing required key `{0}`")]
    MissingKey(&'static str),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("document has no content")]
    EmptyDocument,
}

#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("{0} has no weak skills to remediate")]
    NoWeakSkills(String),

    #[error("a remediation plan for {0} is already being generated")]
    AlreadyRunning(String),

    #[error("could not export the remediation plan: {0}")]
    Export(#[from] ExportError),
}
