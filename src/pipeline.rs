//! Orchestration: extract, transform and load run against one [`Warehouse`].
//!
//! Each stage re-runs the stages before it, so any of them can be invoked on
//! its own from a clean slate. [`run_with_retry`] wraps a whole run in a fixed
//! retry policy.

use std::fmt;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::clean::{Cleaned, clean};
use crate::config::EtlConfig;
use crate::dimensions::{DimensionCounts, populate_dimensions};
use crate::error::{EtlError, Result};
use crate::facts::populate_facts;
use crate::raw::{RawTable, fetch_raw, load_raw};
use crate::record::CleanedRecord;
use crate::report::RunSummary;
use crate::schema::{clear_star_schema, ensure_star_schema};
use crate::store::Warehouse;

pub const DEFAULT_RETRIES: u32 = 1;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(300);

/// How far a run goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of re-runs after a failed attempt and the pause before each.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Rows written by [`Pipeline::load`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadCounts {
    pub dimensions: DimensionCounts,
    pub facts: u64,
}

pub struct Pipeline<W> {
    config: EtlConfig,
    store: W,
}

impl<W: Warehouse> Pipeline<W> {
    pub fn new(config: EtlConfig, store: W) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub fn store(&self) -> &W {
        &self.store
    }

    pub fn into_store(self) -> W {
        self.store
    }

    /// Replaces the raw table with the source file and reads it back.
    #[tracing::instrument(skip(self), fields(source = %self.config.source_path.display()))]
    pub async fn extract(&self) -> Result<RawTable> {
        info!("EXTRACTION PHASE");
        let result = async {
            load_raw(&self.store, &self.config.source_path).await?;
            fetch_raw(&self.store).await
        }
        .await;
        log_phase_failure(&result);
        let raw = result?;
        info!(rows = raw.len(), "Extraction complete");
        Ok(raw)
    }

    /// Cleans `raw`, then makes sure the star schema exists and is empty.
    #[tracing::instrument(skip(self, raw), fields(rows = raw.len()))]
    pub async fn transform(&self, raw: &RawTable) -> Result<Cleaned> {
        info!("TRANSFORMATION PHASE");
        let result = async {
            let cleaned = clean(raw)?;
            ensure_star_schema(&self.store).await?;
            clear_star_schema(&self.store).await?;
            Ok::<_, EtlError>(cleaned)
        }
        .await;
        log_phase_failure(&result);
        let cleaned = result?;
        info!(rows = cleaned.records.len(), "Transformation complete");
        Ok(cleaned)
    }

    /// Populates the dimensions, then the fact table.
    #[tracing::instrument(skip(self, records), fields(records = records.len()))]
    pub async fn load(&self, records: &[CleanedRecord]) -> Result<LoadCounts> {
        info!("LOADING PHASE");
        let result = async {
            let dimensions = populate_dimensions(&self.store, records).await?;
            let facts = populate_facts(&self.store, records).await?;
            Ok::<_, EtlError>(LoadCounts { dimensions, facts })
        }
        .await;
        log_phase_failure(&result);
        let counts = result?;
        info!(facts = counts.facts, "Loading complete");
        Ok(counts)
    }

    /// Runs every stage up to and including `stage`.
    pub async fn run_through(&self, stage: Stage) -> Result<RunSummary> {
        let mut summary = RunSummary::start(stage.as_str());

        let raw = self.extract().await?;
        summary.raw_records = raw.len();
        if stage == Stage::Extract {
            return Ok(summary.finish());
        }

        let cleaned = self.transform(&raw).await?;
        summary = summary.with_cleaning(&cleaned.stats);
        if stage == Stage::Transform {
            return Ok(summary.finish());
        }

        let counts = self.load(&cleaned.records).await?;
        summary = summary.with_dimensions(&counts.dimensions);
        summary.facts = counts.facts;
        Ok(summary.finish())
    }

    /// The full pipeline.
    pub async fn run(&self) -> Result<RunSummary> {
        self.run_through(Stage::Load).await
    }
}

fn log_phase_failure<T>(result: &Result<T>) {
    if let Err(e) = result {
        error!(phase = e.phase(), error = %e, "Phase failed");
    }
}

/// Runs the pipeline through `stage`, re-running it from the start on failure
/// up to `policy.retries` more times.
///
/// Returns the last error once attempts are exhausted.
#[tracing::instrument(skip(pipeline, policy), fields(retries = policy.retries))]
pub async fn run_with_retry<W: Warehouse>(
    pipeline: &Pipeline<W>,
    stage: Stage,
    policy: &RetryPolicy,
) -> Result<RunSummary> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match pipeline.run_through(stage).await {
            Ok(mut summary) => {
                summary.attempts = attempt;
                return Ok(summary);
            }
            Err(e) if attempt <= policy.retries => {
                warn!(
                    attempt,
                    phase = e.phase(),
                    delay_secs = policy.delay.as_secs(),
                    "Retrying run"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => {
                error!(attempts = attempt, "Run failed, no retries left");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DateTimeRow, DeliveryPersonRow, DimensionTables, FactRow, LocationRow, VehicleRow,
    };
    use crate::store::MemoryWarehouse;
    use async_trait::async_trait;
    use std::env;
    use std::fs;
    use std::io;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory warehouse whose first `failures` raw loads fail as if the
    /// database were unreachable.
    struct FlakyWarehouse {
        inner: MemoryWarehouse,
        failures: AtomicU32,
        raw_loads: AtomicU32,
    }

    impl FlakyWarehouse {
        fn failing(failures: u32) -> Self {
            Self {
                inner: MemoryWarehouse::new(),
                failures: AtomicU32::new(failures),
                raw_loads: AtomicU32::new(0),
            }
        }

        fn raw_loads(&self) -> u32 {
            self.raw_loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Warehouse for FlakyWarehouse {
        async fn replace_raw(&self, table: &RawTable) -> Result<u64> {
            self.raw_loads.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EtlError::connection("replace raw table", "connection refused"));
            }
            self.inner.replace_raw(table).await
        }

        async fn fetch_raw(&self) -> Result<RawTable> {
            self.inner.fetch_raw().await
        }

        async fn ensure_schema(&self) -> Result<()> {
            self.inner.ensure_schema().await
        }

        async fn ensure_tables(&self) -> Result<()> {
            self.inner.ensure_tables().await
        }

        async fn clear_star_schema(&self) -> Result<()> {
            self.inner.clear_star_schema().await
        }

        async fn insert_delivery_persons(&self, rows: &[DeliveryPersonRow]) -> Result<u64> {
            self.inner.insert_delivery_persons(rows).await
        }

        async fn insert_locations(&self, rows: &[LocationRow]) -> Result<u64> {
            self.inner.insert_locations(rows).await
        }

        async fn insert_vehicles(&self, rows: &[VehicleRow]) -> Result<u64> {
            self.inner.insert_vehicles(rows).await
        }

        async fn insert_datetimes_skip_conflicts(&self, rows: &[DateTimeRow]) -> Result<u64> {
            self.inner.insert_datetimes_skip_conflicts(rows).await
        }

        async fn fetch_dimensions(&self) -> Result<DimensionTables> {
            self.inner.fetch_dimensions().await
        }

        async fn insert_facts(&self, rows: &[FactRow]) -> Result<u64> {
            self.inner.insert_facts(rows).await
        }
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn no_delay(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            delay: Duration::ZERO,
        }
    }

    const HEADER: &str = "ID,Delivery_person_ID,Delivery_person_Age,Delivery_person_Ratings,Restaurant_latitude,Restaurant_longitude,Delivery_location_latitude,Delivery_location_longitude,Order_Date,Time_Orderd,Time_Order_picked,Weather_conditions,Road_traffic_density,Vehicle_condition,Type_of_order,Type_of_vehicle,multiple_deliveries,Festival,City,Time_taken (min)";

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(name)
    }

    fn write_source(name: &str, rows: &[&str]) -> PathBuf {
        let path = temp_path(name);
        let mut content = String::from(HEADER);
        for row in rows {
            content.push('\n');
            content.push_str(row);
        }
        content.push('\n');
        fs::write(&path, content).unwrap();
        path
    }

    fn pipeline(source: PathBuf) -> Pipeline<MemoryWarehouse> {
        let config = EtlConfig {
            source_path: source,
            ..EtlConfig::default()
        };
        Pipeline::new(config, MemoryWarehouse::new())
    }

    const ROW_A: &str = "0x4607,INDORES13DEL02,37,4.9,22.745049,75.892471,22.765049,75.912471,19-03-2022,11:30,11:45,conditions Sunny,High ,2,Snack ,motorcycle ,0,No ,Urban ,24";
    const ROW_B: &str = "0xb379,BANGRES18DEL02,34,4.5,12.913041,77.683237,13.043041,77.813237,25-03-2022,19:45,19:50,conditions Stormy,Jam ,2,Snack ,scooter ,1,No ,Metropolitian ,33";

    #[tokio::test]
    async fn test_run_through_extract_stops_early() {
        let path = write_source("delivery_etl_pipeline_extract.csv", &[ROW_A, ROW_B]);
        let pipeline = pipeline(path.clone());

        let summary = pipeline.run_through(Stage::Extract).await.unwrap();
        assert_eq!(summary.raw_records, 2);
        assert_eq!(summary.cleaned_records, 0);
        assert!(pipeline.store().facts().await.is_empty());

        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_full_run_loads_facts() {
        let path = write_source("delivery_etl_pipeline_full.csv", &[ROW_A, ROW_B]);
        let pipeline = pipeline(path.clone());

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.raw_records, 2);
        assert_eq!(summary.cleaned_records, 2);
        assert_eq!(summary.facts, 2);
        assert_eq!(summary.retention_pct(), 100.0);
        assert!(summary.finished_at.is_some());

        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_missing_source_is_an_extraction_error() {
        let pipeline = pipeline(temp_path("delivery_etl_pipeline_does_not_exist.csv"));
        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, EtlError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_policy() {
        let path = write_source("delivery_etl_pipeline_retry_exhausted.csv", &[ROW_A]);
        let config = EtlConfig {
            source_path: path.clone(),
            ..EtlConfig::default()
        };
        let pipeline = Pipeline::new(config, FlakyWarehouse::failing(5));

        let err = run_with_retry(&pipeline, Stage::Load, &no_delay(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Connection { .. }));
        assert_eq!(pipeline.store().raw_loads(), 3);

        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let path = write_source("delivery_etl_pipeline_retry_recovers.csv", &[ROW_A, ROW_B]);
        let config = EtlConfig {
            source_path: path.clone(),
            ..EtlConfig::default()
        };
        let pipeline = Pipeline::new(config, FlakyWarehouse::failing(1));

        let summary = run_with_retry(&pipeline, Stage::Load, &no_delay(1))
            .await
            .unwrap();
        assert_eq!(summary.attempts, 2);
        assert_eq!(summary.facts, 2);
        assert_eq!(pipeline.store().raw_loads(), 2);

        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_no_retry_when_policy_has_none() {
        let path = write_source("delivery_etl_pipeline_retry_none.csv", &[ROW_A]);
        let config = EtlConfig {
            source_path: path.clone(),
            ..EtlConfig::default()
        };
        let pipeline = Pipeline::new(config, FlakyWarehouse::failing(1));

        assert!(run_with_retry(&pipeline, Stage::Load, &no_delay(0)).await.is_err());
        assert_eq!(pipeline.store().raw_loads(), 1);

        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_failure_detail_logged_once_per_attempt() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let pipeline = pipeline(temp_path("delivery_etl_pipeline_logged_missing.csv"));
        run_with_retry(&pipeline, Stage::Load, &no_delay(1))
            .await
            .unwrap_err();

        let output = logs.contents();
        assert_eq!(output.matches("extraction error:").count(), 2);
        assert_eq!(output.matches("Retrying run").count(), 1);
        assert_eq!(output.matches("Run failed, no retries left").count(), 1);
    }

    #[tokio::test]
    async fn test_retry_reports_single_attempt_on_success() {
        let path = write_source("delivery_etl_pipeline_retry_ok.csv", &[ROW_A]);
        let pipeline = pipeline(path.clone());

        let summary = run_with_retry(&pipeline, Stage::Load, &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(summary.attempts, 1);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 1);
        assert_eq!(policy.delay, Duration::from_secs(300));
    }
}
