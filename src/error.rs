//! Error taxonomy for the pipeline.
//!
//! Every variant is fatal to the run. The orchestrator retries the whole
//! pipeline on any of them; the variant only tells the operator which phase
//! broke.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Debug, Error)]
pub enum EtlError {
    /// A required setting is missing or malformed.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The store could not be reached or a connection could not be acquired.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// The source file or the raw table could not be read or written.
    #[error("extraction error: {message}")]
    Extraction { message: String },

    /// The raw data is structurally unusable (e.g. a required column is missing).
    #[error("transformation error: {message}")]
    Transformation { message: String },

    /// DDL, truncate or insert failure, constraint violations included.
    #[error("load error: {message}")]
    Load { message: String },
}

impl EtlError {
    pub fn config(setting: &str, problem: impl std::fmt::Display) -> Self {
        EtlError::Config {
            message: format!("{setting}: {problem}"),
        }
    }

    pub fn connection(context: &str, err: impl std::fmt::Display) -> Self {
        EtlError::Connection {
            message: format!("{context}: {err}"),
        }
    }

    pub fn extraction(context: &str, err: impl std::fmt::Display) -> Self {
        EtlError::Extraction {
            message: format!("{context}: {err}"),
        }
    }

    pub fn transformation(message: impl Into<String>) -> Self {
        EtlError::Transformation {
            message: message.into(),
        }
    }

    pub fn load(context: &str, err: impl std::fmt::Display) -> Self {
        EtlError::Load {
            message: format!("{context}: {err}"),
        }
    }

    /// Pipeline phase the error belongs to, used as a log field.
    pub fn phase(&self) -> &'static str {
        match self {
            EtlError::Config { .. } => "config",
            EtlError::Connection { .. } => "connection",
            EtlError::Extraction { .. } => "extract",
            EtlError::Transformation { .. } => "transform",
            EtlError::Load { .. } => "load",
        }
    }
}
