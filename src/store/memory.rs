use std::collections::HashSet;
use std::hash::Hash;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use tokio::sync::Mutex;

use super::{
    DIM_DATETIME, DIM_DELIVERY_PERSON, DIM_LOCATION, DIM_VEHICLE, FACT_DELIVERIES, RAW_SCHEMA,
    RAW_TABLE, STAR_SCHEMA, Warehouse,
};
use crate::error::{EtlError, Result};
use crate::model::{
    DateTimeRow, DeliveryPersonRow, DimensionTables, FactRow, Keyed, LocationRole, LocationRow,
    SurrogateKey, VehicleRow,
};
use crate::raw::RawTable;
use crate::record::float_key;

/// A table with a `SERIAL`-style key sequence.
#[derive(Debug, Clone)]
struct Table<T> {
    next_key: SurrogateKey,
    rows: Vec<Keyed<T>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            next_key: 1,
            rows: Vec::new(),
        }
    }
}

impl<T: Clone> Table<T> {
    fn push(&mut self, row: T) {
        let key = self.next_key;
        self.next_key += 1;
        self.rows.push(Keyed { key, row });
    }

    fn truncate(&mut self) {
        *self = Self::default();
    }

    /// A NULL reference is always satisfied.
    fn has_key_opt(&self, key: Option<SurrogateKey>) -> bool {
        key.is_none_or(|key| self.rows.iter().any(|k| k.key == key))
    }
}

#[derive(Debug, Default)]
struct Star {
    delivery_persons: Table<DeliveryPersonRow>,
    locations: Table<LocationRow>,
    datetimes: Table<DateTimeRow>,
    vehicles: Table<VehicleRow>,
    facts: Table<FactRow>,
}

#[derive(Debug, Default)]
struct State {
    raw: Option<RawTable>,
    schema_exists: bool,
    star: Option<Star>,
}

impl State {
    fn star_mut(&mut self, context: &str) -> Result<&mut Star> {
        self.star.as_mut().ok_or_else(|| {
            EtlError::load(context, format!("schema \"{STAR_SCHEMA}\" has no tables"))
        })
    }
}

/// [`Warehouse`] that keeps every table in memory.
///
/// Enforces the unique and foreign-key constraints declared by the Postgres
/// DDL, with NULLs never colliding in a unique constraint. A failing batch
/// leaves its table untouched.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the fact table, for inspection after a run.
    pub async fn facts(&self) -> Vec<Keyed<FactRow>> {
        let state = self.state.lock().await;
        state
            .star
            .as_ref()
            .map(|s| s.facts.rows.clone())
            .unwrap_or_default()
    }

    /// Row counts of every star-schema table, fact table first.
    pub async fn row_counts(&self) -> Vec<(&'static str, usize)> {
        let state = self.state.lock().await;
        match &state.star {
            Some(s) => vec![
                (FACT_DELIVERIES, s.facts.rows.len()),
                (DIM_DELIVERY_PERSON, s.delivery_persons.rows.len()),
                (DIM_LOCATION, s.locations.rows.len()),
                (DIM_DATETIME, s.datetimes.rows.len()),
                (DIM_VEHICLE, s.vehicles.rows.len()),
            ],
            None => Vec::new(),
        }
    }
}

/// Checks a batch against a unique constraint, counting existing rows too.
/// Keys that are `None` contain a NULL and never conflict.
fn check_unique<K, T, F>(context: &str, existing: &[Keyed<T>], batch: &[T], key_of: F) -> Result<()>
where
    K: Eq + Hash + std::fmt::Debug,
    F: Fn(&T) -> Option<K>,
{
    let mut seen: HashSet<K> = existing.iter().filter_map(|k| key_of(&k.row)).collect();
    for row in batch {
        if let Some(key) = key_of(row) {
            if seen.contains(&key) {
                return Err(EtlError::load(
                    context,
                    format!("duplicate key value violates unique constraint: {key:?}"),
                ));
            }
            seen.insert(key);
        }
    }
    Ok(())
}

type LocationKey = (u64, u64, String, LocationRole);

fn location_key(row: &LocationRow) -> Option<LocationKey> {
    Some((
        float_key(row.latitude),
        float_key(row.longitude),
        row.city.clone(),
        row.location_type,
    ))
}

fn datetime_key(row: &DateTimeRow) -> (NaiveDate, NaiveTime, NaiveTime) {
    (row.order_date, row.time_ordered, row.time_picked)
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn replace_raw(&self, table: &RawTable) -> Result<u64> {
        if table.headers.is_empty() {
            return Err(EtlError::extraction("replace raw table", "source has no columns"));
        }
        let mut state = self.state.lock().await;
        state.raw = Some(table.clone());
        Ok(table.len() as u64)
    }

    async fn fetch_raw(&self) -> Result<RawTable> {
        let state = self.state.lock().await;
        state.raw.clone().ok_or_else(|| {
            EtlError::extraction(
                "read raw table",
                format!("{RAW_SCHEMA}.{RAW_TABLE} does not exist"),
            )
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.state.lock().await.schema_exists = true;
        Ok(())
    }

    async fn ensure_tables(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.schema_exists {
            return Err(EtlError::load(
                "create tables",
                format!("schema \"{STAR_SCHEMA}\" does not exist"),
            ));
        }
        state.star.get_or_insert_with(Star::default);
        Ok(())
    }

    async fn clear_star_schema(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let star = state.star_mut("clear tables")?;
        star.facts.truncate();
        star.delivery_persons.truncate();
        star.locations.truncate();
        star.datetimes.truncate();
        star.vehicles.truncate();
        Ok(())
    }

    async fn insert_delivery_persons(&self, rows: &[DeliveryPersonRow]) -> Result<u64> {
        let context = "insert dim_delivery_person";
        let mut state = self.state.lock().await;
        let table = &mut state.star_mut(context)?.delivery_persons;

        check_unique(context, &table.rows, rows, |r| Some(r.delivery_person_id.clone()))?;
        for row in rows {
            table.push(row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_locations(&self, rows: &[LocationRow]) -> Result<u64> {
        let context = "insert dim_location";
        let mut state = self.state.lock().await;
        let table = &mut state.star_mut(context)?.locations;

        check_unique(context, &table.rows, rows, location_key)?;
        for row in rows {
            table.push(row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_vehicles(&self, rows: &[VehicleRow]) -> Result<u64> {
        let context = "insert dim_vehicle";
        let mut state = self.state.lock().await;
        let table = &mut state.star_mut(context)?.vehicles;

        check_unique(context, &table.rows, rows, |r| {
            r.vehicle_type
                .clone()
                .map(|vehicle_type| (r.vehicle_condition, vehicle_type))
        })?;
        for row in rows {
            table.push(row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_datetimes_skip_conflicts(&self, rows: &[DateTimeRow]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let table = &mut state.star_mut("insert dim_datetime")?.datetimes;

        let mut dates: HashSet<NaiveDate> = table.rows.iter().map(|k| k.row.order_date).collect();
        let mut tuples: HashSet<_> = table.rows.iter().map(|k| datetime_key(&k.row)).collect();

        let mut inserted = 0;
        for row in rows {
            if dates.contains(&row.order_date) || tuples.contains(&datetime_key(row)) {
                continue;
            }
            dates.insert(row.order_date);
            tuples.insert(datetime_key(row));
            table.push(row.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn fetch_dimensions(&self) -> Result<DimensionTables> {
        let mut state = self.state.lock().await;
        let star = state.star_mut("read dimensions")?;
        Ok(DimensionTables {
            delivery_persons: star.delivery_persons.rows.clone(),
            locations: star.locations.rows.clone(),
            datetimes: star.datetimes.rows.clone(),
            vehicles: star.vehicles.rows.clone(),
        })
    }

    async fn insert_facts(&self, rows: &[FactRow]) -> Result<u64> {
        let context = "insert fact_deliveries";
        let mut state = self.state.lock().await;
        let star = state.star_mut(context)?;

        check_unique(context, &star.facts.rows, rows, |r| Some(r.delivery_id.clone()))?;

        for row in rows {
            let references = [
                (
                    DIM_DELIVERY_PERSON,
                    row.delivery_person_key,
                    star.delivery_persons.has_key_opt(row.delivery_person_key),
                ),
                (
                    DIM_LOCATION,
                    row.restaurant_location_key,
                    star.locations.has_key_opt(row.restaurant_location_key),
                ),
                (
                    DIM_LOCATION,
                    row.delivery_location_key,
                    star.locations.has_key_opt(row.delivery_location_key),
                ),
                (
                    DIM_VEHICLE,
                    row.vehicle_key,
                    star.vehicles.has_key_opt(row.vehicle_key),
                ),
                (
                    DIM_DATETIME,
                    row.datetime_key,
                    star.datetimes.has_key_opt(row.datetime_key),
                ),
            ];

            if let Some((table, key, _)) = references.into_iter().find(|(_, _, ok)| !ok) {
                return Err(EtlError::load(
                    context,
                    format!(
                        "foreign key violation: delivery {} references missing {table} key {key:?}",
                        row.delivery_id
                    ),
                ));
            }
        }

        for row in rows {
            star.facts.push(row.clone());
        }
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 3, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn person(id: &str) -> DeliveryPersonRow {
        DeliveryPersonRow {
            delivery_person_id: id.to_string(),
            age: 30,
            ratings: 4.5,
        }
    }

    fn fact(id: &str) -> FactRow {
        FactRow {
            delivery_id: id.to_string(),
            delivery_person_key: None,
            restaurant_location_key: None,
            delivery_location_key: None,
            vehicle_key: None,
            datetime_key: None,
            order_type: "Snack".to_string(),
            weather_condition: None,
            road_traffic_density: None,
            festival: None,
            multiple_deliveries: 0,
            time_taken: 20.0,
        }
    }

    async fn ready() -> MemoryWarehouse {
        let store = MemoryWarehouse::new();
        store.ensure_schema().await.unwrap();
        store.ensure_tables().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_tables_require_schema() {
        let store = MemoryWarehouse::new();
        assert!(store.ensure_tables().await.is_err());
        assert!(store.insert_facts(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_raw_before_load_fails() {
        let err = MemoryWarehouse::new().fetch_raw().await.unwrap_err();
        assert!(matches!(err, EtlError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_batch_is_rejected_whole() {
        let store = ready().await;
        let err = store
            .insert_delivery_persons(&[person("A"), person("B"), person("A")])
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Load { .. }));

        let dims = store.fetch_dimensions().await.unwrap();
        assert!(dims.delivery_persons.is_empty());
    }

    #[tokio::test]
    async fn test_datetime_conflicts_are_skipped() {
        let store = ready().await;
        let rows = [
            DateTimeRow::new(date(19), time(11, 30), time(11, 45)),
            DateTimeRow::new(date(19), time(12, 0), time(12, 10)),
            DateTimeRow::new(date(20), time(9, 0), time(9, 15)),
        ];

        let inserted = store.insert_datetimes_skip_conflicts(&rows).await.unwrap();
        assert_eq!(inserted, 2);

        let dims = store.fetch_dimensions().await.unwrap();
        assert_eq!(dims.datetimes.len(), 2);
        assert_eq!(dims.datetimes[0].row.time_ordered, time(11, 30));
    }

    #[tokio::test]
    async fn test_null_vehicle_types_never_conflict() {
        let store = ready().await;
        let rows = [
            VehicleRow {
                vehicle_condition: 1,
                vehicle_type: None,
            },
            VehicleRow {
                vehicle_condition: 1,
                vehicle_type: None,
            },
        ];
        assert_eq!(store.insert_vehicles(&rows).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clear_restarts_keys() {
        let store = ready().await;
        store.insert_delivery_persons(&[person("A")]).await.unwrap();
        store.clear_star_schema().await.unwrap();
        store.insert_delivery_persons(&[person("B")]).await.unwrap();

        let dims = store.fetch_dimensions().await.unwrap();
        assert_eq!(dims.delivery_persons.len(), 1);
        assert_eq!(dims.delivery_persons[0].key, 1);
    }

    #[tokio::test]
    async fn test_fact_foreign_keys_checked() {
        let store = ready().await;
        store.insert_delivery_persons(&[person("A")]).await.unwrap();

        let mut ok = fact("0x1");
        ok.delivery_person_key = Some(1);
        assert_eq!(store.insert_facts(&[ok]).await.unwrap(), 1);

        let mut dangling = fact("0x2");
        dangling.vehicle_key = Some(7);
        let err = store.insert_facts(&[dangling]).await.unwrap_err();
        assert!(err.to_string().contains("dim_vehicle"));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_id_fails_fact_batch() {
        let store = ready().await;
        let err = store
            .insert_facts(&[fact("0x1"), fact("0x2"), fact("0x1")])
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Load { .. }));
        assert!(store.facts().await.is_empty());
    }

    #[tokio::test]
    async fn test_row_counts() {
        let store = ready().await;
        store.insert_facts(&[fact("0x1")]).await.unwrap();
        let counts = store.row_counts().await;
        assert_eq!(counts[0], (FACT_DELIVERIES, 1));
        assert_eq!(counts.len(), 5);
    }
}
