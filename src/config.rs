//! Runtime configuration for a pipeline run.

use std::path::PathBuf;

use crate::error::{EtlError, Result};

/// Default location of the delivery extract.
pub const DEFAULT_SOURCE_PATH: &str = "data/source/Deliveries.csv";

/// Rows per multi-row `INSERT`. Capped further by the bind-parameter limit.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Everything a pipeline run needs, passed explicitly to each component.
#[derive(Debug, Clone)]
pub struct EtlConfig {
    /// Postgres connection string. `None` only for in-memory dry runs.
    pub database_url: Option<String>,
    pub source_path: PathBuf,
    pub batch_size: usize,
}

impl EtlConfig {
    /// Reads `DATABASE_URL` and `ETL_BATCH_SIZE` from the environment.
    ///
    /// A missing `DATABASE_URL` is not an error here; [`EtlConfig::require_database_url`]
    /// checks it when a Postgres warehouse is actually opened.
    pub fn from_env(source_path: impl Into<PathBuf>) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());

        let batch_size = match std::env::var("ETL_BATCH_SIZE") {
            Ok(raw) => parse_batch_size(&raw)?,
            Err(_) => DEFAULT_BATCH_SIZE,
        };

        Ok(Self {
            database_url,
            source_path: source_path.into(),
            batch_size,
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| EtlError::config("DATABASE_URL", "not set"))
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            source_path: PathBuf::from(DEFAULT_SOURCE_PATH),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

fn parse_batch_size(raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(EtlError::config(
            "ETL_BATCH_SIZE",
            format!("expected a positive integer, got '{raw}'"),
        )),
    }
}
