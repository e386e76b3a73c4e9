//! Raw delivery records as the source delivers them.
//!
//! The raw table is schema-on-write: the CSV header is kept verbatim and every
//! cell is an optional string. Typing happens in [`crate::clean`].

use std::fs::File;
use std::path::Path;

use csv::ReaderBuilder;
use tracing::{debug, info};

use crate::error::{EtlError, Result};
use crate::record::CleanedRecord;
use crate::store::Warehouse;

/// Source column names, in the order the delivery extract ships them.
pub mod columns {
    pub const ID: &str = "ID";
    pub const DELIVERY_PERSON_ID: &str = "Delivery_person_ID";
    pub const DELIVERY_PERSON_AGE: &str = "Delivery_person_Age";
    pub const DELIVERY_PERSON_RATINGS: &str = "Delivery_person_Ratings";
    pub const RESTAURANT_LATITUDE: &str = "Restaurant_latitude";
    pub const RESTAURANT_LONGITUDE: &str = "Restaurant_longitude";
    pub const DELIVERY_LATITUDE: &str = "Delivery_location_latitude";
    pub const DELIVERY_LONGITUDE: &str = "Delivery_location_longitude";
    pub const ORDER_DATE: &str = "Order_Date";
    pub const TIME_ORDERED: &str = "Time_Orderd";
    pub const TIME_PICKED: &str = "Time_Order_picked";
    pub const WEATHER: &str = "Weather_conditions";
    pub const TRAFFIC_DENSITY: &str = "Road_traffic_density";
    pub const VEHICLE_CONDITION: &str = "Vehicle_condition";
    pub const ORDER_TYPE: &str = "Type_of_order";
    pub const VEHICLE_TYPE: &str = "Type_of_vehicle";
    pub const MULTIPLE_DELIVERIES: &str = "multiple_deliveries";
    pub const FESTIVAL: &str = "Festival";
    pub const CITY: &str = "City";
    pub const TIME_TAKEN: &str = "Time_taken (min)";

    pub const ALL: [&str; 20] = [
        ID,
        DELIVERY_PERSON_ID,
        DELIVERY_PERSON_AGE,
        DELIVERY_PERSON_RATINGS,
        RESTAURANT_LATITUDE,
        RESTAURANT_LONGITUDE,
        DELIVERY_LATITUDE,
        DELIVERY_LONGITUDE,
        ORDER_DATE,
        TIME_ORDERED,
        TIME_PICKED,
        WEATHER,
        TRAFFIC_DENSITY,
        VEHICLE_CONDITION,
        ORDER_TYPE,
        VEHICLE_TYPE,
        MULTIPLE_DELIVERIES,
        FESTIVAL,
        CITY,
        TIME_TAKEN,
    ];
}

/// An untyped table: header names plus rows of nullable text cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Renders cleaned records back into the raw shape so they can be cleaned again.
    pub fn from_cleaned(records: &[CleanedRecord]) -> Self {
        let mut table = RawTable::new(columns::ALL.iter().map(|c| c.to_string()).collect());
        table.rows = records.iter().map(CleanedRecord::to_raw_row).collect();
        table
    }
}

/// Reads a delivery CSV into a [`RawTable`]. Empty cells become `None`.
#[tracing::instrument(fields(path = %path.display()))]
pub fn read_csv(path: &Path) -> Result<RawTable> {
    let file = File::open(path)
        .map_err(|e| EtlError::extraction(&format!("open {}", path.display()), e))?;

    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(file);

    let headers = rdr
        .headers()
        .map_err(|e| EtlError::extraction("read csv header", e))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut table = RawTable::new(headers);
    for result in rdr.records() {
        let record = result.map_err(|e| EtlError::extraction("read csv row", e))?;
        table.rows.push(
            record
                .iter()
                .map(|cell| {
                    if cell.is_empty() {
                        None
                    } else {
                        Some(cell.to_string())
                    }
                })
                .collect(),
        );
    }

    debug!(rows = table.len(), columns = table.headers.len(), "CSV read");
    Ok(table)
}

/// Replaces the raw table with the contents of the CSV at `source_path`.
pub async fn load_raw<W: Warehouse + ?Sized>(store: &W, source_path: &Path) -> Result<RawTable> {
    let table = read_csv(source_path)?;
    let written = store.replace_raw(&table).await?;
    info!(rows = written, "Raw table replaced");
    Ok(table)
}

/// Reads the full raw table back from the store.
pub async fn fetch_raw<W: Warehouse + ?Sized>(store: &W) -> Result<RawTable> {
    let table = store.fetch_raw().await?;
    info!(rows = table.len(), "Raw data extracted");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn temp_path(name: &str) -> std::path::PathBuf {
        env::temp_dir().join(name)
    }

    #[test]
    fn test_read_csv_maps_empty_cells_to_none() {
        let path = temp_path("delivery_etl_raw_empty_cells.csv");
        fs::write(&path, "ID,City,Festival\n0x1,Urban,\n0x2,,No\n").unwrap();

        let table = read_csv(&path).unwrap();

        assert_eq!(table.headers, vec!["ID", "City", "Festival"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0][2], None);
        assert_eq!(table.rows[1][1], None);
        assert_eq!(table.rows[1][2].as_deref(), Some("No"));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_read_csv_keeps_whitespace_cells() {
        let path = temp_path("delivery_etl_raw_whitespace.csv");
        fs::write(&path, "ID,City\n0x1, \n").unwrap();

        let table = read_csv(&path).unwrap();
        assert_eq!(table.rows[0][1].as_deref(), Some(" "));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_read_csv_ragged_row_is_extraction_error() {
        let path = temp_path("delivery_etl_raw_ragged.csv");
        fs::write(&path, "ID,City\n0x1,Urban,extra\n").unwrap();

        let err = read_csv(&path).unwrap_err();
        assert_eq!(err.phase(), "extract");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_read_csv_missing_file() {
        let err = read_csv(Path::new("/nonexistent/deliveries.csv")).unwrap_err();
        assert!(matches!(err, EtlError::Extraction { .. }));
    }

    #[test]
    fn test_column_index() {
        let table = RawTable::new(vec!["ID".into(), "City".into()]);
        assert_eq!(table.column_index("City"), Some(1));
        assert_eq!(table.column_index("Festival"), None);
    }
}
