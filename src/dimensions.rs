//! Derives dimension rows from cleaned records and writes them.
//!
//! Every derivation keeps the first occurrence of each natural key, in record
//! order, so a full refresh on identical input assigns identical keys.

use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::model::{DateTimeRow, DeliveryPersonRow, LocationRole, LocationRow, VehicleRow};
use crate::record::{CleanedRecord, float_key};
use crate::store::Warehouse;

/// Rows written per dimension by one population pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DimensionCounts {
    pub delivery_persons: u64,
    pub locations: u64,
    pub datetimes: u64,
    pub datetimes_skipped: u64,
    pub vehicles: u64,
}

/// One row per distinct delivery person id; the first-seen age and rating win.
pub fn delivery_person_rows(records: &[CleanedRecord]) -> Vec<DeliveryPersonRow> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| seen.insert(r.delivery_person_id.clone()))
        .map(|r| DeliveryPersonRow {
            delivery_person_id: r.delivery_person_id.clone(),
            age: r.delivery_person_age,
            ratings: r.delivery_person_rating,
        })
        .collect()
}

/// Expands each record into its restaurant and delivery locations, then drops
/// repeated (latitude, longitude, city, role) tuples.
pub fn location_rows(records: &[CleanedRecord]) -> Vec<LocationRow> {
    let mut seen = HashSet::new();
    records
        .iter()
        .flat_map(|r| {
            [
                LocationRow {
                    latitude: r.restaurant_latitude,
                    longitude: r.restaurant_longitude,
                    city: r.city.clone(),
                    location_type: LocationRole::Restaurant,
                },
                LocationRow {
                    latitude: r.delivery_latitude,
                    longitude: r.delivery_longitude,
                    city: r.city.clone(),
                    location_type: LocationRole::Delivery,
                },
            ]
        })
        .filter(|l| {
            seen.insert((
                float_key(l.latitude),
                float_key(l.longitude),
                l.city.clone(),
                l.location_type,
            ))
        })
        .collect()
}

/// One row per distinct (date, time ordered, time picked).
pub fn datetime_rows(records: &[CleanedRecord]) -> Vec<DateTimeRow> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| seen.insert((r.order_date, r.time_ordered, r.time_picked)))
        .map(|r| DateTimeRow::new(r.order_date, r.time_ordered, r.time_picked))
        .collect()
}

/// One row per distinct (condition, type).
pub fn vehicle_rows(records: &[CleanedRecord]) -> Vec<VehicleRow> {
    let mut seen = HashSet::new();
    records
        .iter()
        .map(|r| VehicleRow {
            vehicle_condition: r.vehicle_condition,
            vehicle_type: r.vehicle_type.clone(),
        })
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Populates all four dimensions from `records`.
///
/// The star schema must exist and be empty. Each dimension is written in its
/// own transaction; the first failure aborts the pass.
#[tracing::instrument(skip(store, records), fields(records = records.len()))]
pub async fn populate_dimensions<W: Warehouse + ?Sized>(
    store: &W,
    records: &[CleanedRecord],
) -> Result<DimensionCounts> {
    let mut counts = DimensionCounts::default();

    let people = delivery_person_rows(records);
    counts.delivery_persons = store.insert_delivery_persons(&people).await?;
    info!(rows = counts.delivery_persons, "Inserted records into dim_delivery_person");

    let locations = location_rows(records);
    counts.locations = store.insert_locations(&locations).await?;
    info!(rows = counts.locations, "Inserted records into dim_location");

    let datetimes = datetime_rows(records);
    counts.datetimes = store.insert_datetimes_skip_conflicts(&datetimes).await?;
    counts.datetimes_skipped = datetimes.len() as u64 - counts.datetimes;
    info!(
        unique = datetimes.len(),
        inserted = counts.datetimes,
        skipped = counts.datetimes_skipped,
        "Processed datetime combinations for dim_datetime"
    );

    let vehicles = vehicle_rows(records);
    counts.vehicles = store.insert_vehicles(&vehicles).await?;
    info!(rows = counts.vehicles, "Inserted vehicles into dim_vehicle");

    Ok(counts)
}
