//! Storage seam for the raw table and the star schema.
//!
//! [`Warehouse`] is the async trait every pipeline stage writes through.
//! [`PgWarehouse`] talks to PostgreSQL; [`MemoryWarehouse`] keeps the same
//! tables in process and enforces the same constraints, for dry runs and tests.

mod memory;
mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    DateTimeRow, DeliveryPersonRow, DimensionTables, FactRow, LocationRow, VehicleRow,
};
use crate::raw::RawTable;

/// Schema holding the untyped copy of the source file.
pub const RAW_SCHEMA: &str = "raw_data";
pub const RAW_TABLE: &str = "deliveries_raw";

/// Schema holding the dimensional model.
pub const STAR_SCHEMA: &str = "star_schema";

pub const DIM_DELIVERY_PERSON: &str = "dim_delivery_person";
pub const DIM_LOCATION: &str = "dim_location";
pub const DIM_DATETIME: &str = "dim_datetime";
pub const DIM_VEHICLE: &str = "dim_vehicle";
pub const FACT_DELIVERIES: &str = "fact_deliveries";

/// Truncation order: the fact table goes first so no foreign key dangles.
pub const CLEAR_ORDER: [&str; 5] = [
    FACT_DELIVERIES,
    DIM_DELIVERY_PERSON,
    DIM_LOCATION,
    DIM_DATETIME,
    DIM_VEHICLE,
];

/// Every write method is its own transaction: it either commits in full or
/// leaves the table as it was.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Atomically replaces the raw table with `table`. Returns rows written.
    async fn replace_raw(&self, table: &RawTable) -> Result<u64>;

    async fn fetch_raw(&self) -> Result<RawTable>;

    /// Creates the star schema namespace if absent.
    async fn ensure_schema(&self) -> Result<()>;

    /// Creates the five star-schema tables if absent.
    async fn ensure_tables(&self) -> Result<()>;

    /// Truncates every star-schema table in [`CLEAR_ORDER`] and restarts the
    /// surrogate key sequences.
    async fn clear_star_schema(&self) -> Result<()>;

    async fn insert_delivery_persons(&self, rows: &[DeliveryPersonRow]) -> Result<u64>;

    async fn insert_locations(&self, rows: &[LocationRow]) -> Result<u64>;

    async fn insert_vehicles(&self, rows: &[VehicleRow]) -> Result<u64>;

    /// Inserts row by row, silently skipping any row that violates a unique
    /// constraint. Returns rows actually inserted.
    async fn insert_datetimes_skip_conflicts(&self, rows: &[DateTimeRow]) -> Result<u64>;

    async fn fetch_dimensions(&self) -> Result<DimensionTables>;

    async fn insert_facts(&self, rows: &[FactRow]) -> Result<u64>;
}
