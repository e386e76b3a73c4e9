//! Fact table population: dimension key resolution and the bulk insert.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{DimensionTables, FactRow, LocationRole, SurrogateKey};
use crate::record::{CleanedRecord, float_key};
use crate::store::Warehouse;

type LocationKey = (u64, u64, String, LocationRole);
type DateTimeKey = (NaiveDate, NaiveTime, NaiveTime);

/// In-memory index from each dimension's natural key to its surrogate key.
///
/// Matching follows SQL equality, so a vehicle with no type never resolves.
#[derive(Debug, Default)]
pub struct KeyLookup {
    delivery_persons: HashMap<String, SurrogateKey>,
    locations: HashMap<LocationKey, SurrogateKey>,
    vehicles: HashMap<(i32, String), SurrogateKey>,
    datetimes: HashMap<DateTimeKey, SurrogateKey>,
}

impl KeyLookup {
    /// Indexes dimension rows; where two rows share a natural key the first one is used.
    pub fn build(dims: &DimensionTables) -> Self {
        let mut lookup = KeyLookup::default();

        for p in &dims.delivery_persons {
            lookup
                .delivery_persons
                .entry(p.row.delivery_person_id.clone())
                .or_insert(p.key);
        }
        for l in &dims.locations {
            lookup
                .locations
                .entry(location_key(
                    l.row.latitude,
                    l.row.longitude,
                    &l.row.city,
                    l.row.location_type,
                ))
                .or_insert(l.key);
        }
        for v in &dims.vehicles {
            if let Some(vehicle_type) = &v.row.vehicle_type {
                lookup
                    .vehicles
                    .entry((v.row.vehicle_condition, vehicle_type.clone()))
                    .or_insert(v.key);
            }
        }
        for d in &dims.datetimes {
            lookup
                .datetimes
                .entry((d.row.order_date, d.row.time_ordered, d.row.time_picked))
                .or_insert(d.key);
        }

        lookup
    }

    pub fn delivery_person(&self, record: &CleanedRecord) -> Option<SurrogateKey> {
        self.delivery_persons.get(&record.delivery_person_id).copied()
    }

    pub fn restaurant_location(&self, record: &CleanedRecord) -> Option<SurrogateKey> {
        self.locations
            .get(&location_key(
                record.restaurant_latitude,
                record.restaurant_longitude,
                &record.city,
                LocationRole::Restaurant,
            ))
            .copied()
    }

    pub fn delivery_location(&self, record: &CleanedRecord) -> Option<SurrogateKey> {
        self.locations
            .get(&location_key(
                record.delivery_latitude,
                record.delivery_longitude,
                &record.city,
                LocationRole::Delivery,
            ))
            .copied()
    }

    pub fn vehicle(&self, record: &CleanedRecord) -> Option<SurrogateKey> {
        let vehicle_type = record.vehicle_type.as_ref()?;
        self.vehicles
            .get(&(record.vehicle_condition, vehicle_type.clone()))
            .copied()
    }

    pub fn datetime(&self, record: &CleanedRecord) -> Option<SurrogateKey> {
        self.datetimes
            .get(&(record.order_date, record.time_ordered, record.time_picked))
            .copied()
    }

    /// Builds the fact row for `record`, leaving unresolved keys empty.
    pub fn fact_row(&self, record: &CleanedRecord) -> FactRow {
        FactRow {
            delivery_id: record.id.clone(),
            delivery_person_key: self.delivery_person(record),
            restaurant_location_key: self.restaurant_location(record),
            delivery_location_key: self.delivery_location(record),
            vehicle_key: self.vehicle(record),
            datetime_key: self.datetime(record),
            order_type: record.order_type.clone(),
            weather_condition: record.weather.clone(),
            road_traffic_density: record.traffic_density.clone(),
            festival: record.festival.clone(),
            multiple_deliveries: record.multiple_deliveries,
            time_taken: record.time_taken_min,
        }
    }
}

fn location_key(latitude: f64, longitude: f64, city: &str, role: LocationRole) -> LocationKey {
    (float_key(latitude), float_key(longitude), city.to_string(), role)
}

/// Number of fact rows missing each dimension key.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Unresolved {
    pub delivery_person: usize,
    pub restaurant_location: usize,
    pub delivery_location: usize,
    pub vehicle: usize,
    pub datetime: usize,
}

impl Unresolved {
    pub fn count(rows: &[FactRow]) -> Self {
        let mut u = Unresolved::default();
        for row in rows {
            u.delivery_person += usize::from(row.delivery_person_key.is_none());
            u.restaurant_location += usize::from(row.restaurant_location_key.is_none());
            u.delivery_location += usize::from(row.delivery_location_key.is_none());
            u.vehicle += usize::from(row.vehicle_key.is_none());
            u.datetime += usize::from(row.datetime_key.is_none());
        }
        u
    }

    pub fn total(&self) -> usize {
        self.delivery_person
            + self.restaurant_location
            + self.delivery_location
            + self.vehicle
            + self.datetime
    }
}

/// Resolves dimension keys for every record and inserts one fact row each.
///
/// Reads the dimension tables back from `store`, so it must run after
/// [`crate::dimensions::populate_dimensions`]. A duplicate delivery id fails
/// the whole batch.
#[tracing::instrument(skip(store, records), fields(records = records.len()))]
pub async fn populate_facts<W: Warehouse + ?Sized>(
    store: &W,
    records: &[CleanedRecord],
) -> Result<u64> {
    let dims = store.fetch_dimensions().await?;
    let lookup = KeyLookup::build(&dims);

    let rows: Vec<FactRow> = records.iter().map(|r| lookup.fact_row(r)).collect();

    let unresolved = Unresolved::count(&rows);
    if unresolved.total() > 0 {
        warn!(
            delivery_person = unresolved.delivery_person,
            restaurant_location = unresolved.restaurant_location,
            delivery_location = unresolved.delivery_location,
            vehicle = unresolved.vehicle,
            datetime = unresolved.datetime,
            "Fact rows with unresolved dimension keys"
        );
    }

    let inserted = store.insert_facts(&rows).await?;
    info!(rows = inserted, "Inserted records into fact_deliveries");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::populate_dimensions;
    use crate::error::EtlError;
    use crate::record::fixtures::record;
    use crate::store::MemoryWarehouse;

    async fn ready() -> MemoryWarehouse {
        let store = MemoryWarehouse::new();
        store.ensure_schema().await.unwrap();
        store.ensure_tables().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_every_key_resolves_for_plain_records() {
        let store = ready().await;
        let mut b = record("0x2");
        b.delivery_person_id = "OTHER".to_string();
        b.restaurant_latitude = 23.0;
        let records = [record("0x1"), b];

        populate_dimensions(&store, &records).await.unwrap();
        populate_facts(&store, &records).await.unwrap();

        let facts = store.facts().await;
        assert_eq!(facts.len(), 2);
        let rows: Vec<FactRow> = facts.iter().map(|f| f.row.clone()).collect();
        assert_eq!(Unresolved::count(&rows).total(), 0);
        assert_ne!(facts[0].row.delivery_person_key, facts[1].row.delivery_person_key);
        assert_ne!(
            facts[0].row.restaurant_location_key,
            facts[1].row.restaurant_location_key
        );
        assert_eq!(
            facts[0].row.delivery_location_key,
            facts[1].row.delivery_location_key
        );
    }

    #[tokio::test]
    async fn test_skipped_datetime_leaves_key_empty() {
        let store = ready().await;
        let a = record("0x1");
        let mut b = record("0x2");
        b.time_ordered = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let records = [a, b];

        populate_dimensions(&store, &records).await.unwrap();
        populate_facts(&store, &records).await.unwrap();

        let facts = store.facts().await;
        assert_eq!(facts[0].row.datetime_key, Some(1));
        assert_eq!(facts[1].row.datetime_key, None);
    }

    #[tokio::test]
    async fn test_vehicle_without_type_resolves_nothing() {
        let store = ready().await;
        let mut r = record("0x1");
        r.vehicle_type = None;
        let records = [r];

        populate_dimensions(&store, &records).await.unwrap();
        populate_facts(&store, &records).await.unwrap();

        let facts = store.facts().await;
        assert_eq!(facts[0].row.vehicle_key, None);
        assert!(facts[0].row.delivery_person_key.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_id_is_fatal() {
        let store = ready().await;
        let a = record("0x1");
        let mut b = record("0x1");
        b.time_taken_min = 30.0;
        let records = [a, b];

        populate_dimensions(&store, &records).await.unwrap();
        let err = populate_facts(&store, &records).await.unwrap_err();

        assert!(matches!(err, EtlError::Load { .. }));
        assert!(store.facts().await.is_empty());
    }

    #[test]
    fn test_lookup_on_empty_dimensions() {
        let lookup = KeyLookup::build(&DimensionTables::default());
        let row = lookup.fact_row(&record("0x1"));

        assert_eq!(row.delivery_id, "0x1");
        assert_eq!(Unresolved::count(&[row]).total(), 5);
    }
}
