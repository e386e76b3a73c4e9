//! The cleaning engine: raw text rows in, typed and validated records out.
//!
//! Steps run in a fixed order because the missing-value check only sees
//! values after they were coerced and normalized:
//!
//! 1. order date (day-first, several formats)
//! 2. order and pickup times (`HH:MM`)
//! 3. age and rating
//! 4. coordinates and time taken
//! 5. multiple deliveries
//! 6. categorical text
//! 7. vehicle condition
//! 8. sentinel strings to missing, drop rows missing a critical field
//! 9. drop exact duplicates
//! 10. drop rows with out-of-range or zero coordinates
//!
//! Coercion failures never raise; they become missing or a default.

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{EtlError, Result};
use crate::raw::{RawTable, columns};
use crate::record::{CleanedRecord, TIME_FORMAT};

/// Strings treated as a missing value once normalization is done.
pub const MISSING_SENTINELS: [&str; 7] = ["", " ", "N/A", "n/a", "nan", "None", "none"];

/// Day-first formats are tried before year-first ones, and two-digit years
/// before four-digit ones (`%Y` would happily read `22` as the year 22).
const DATE_FORMATS: &[&str] = &[
    "%d-%m-%y", "%d-%m-%Y", "%d/%m/%y", "%d/%m/%Y", "%d.%m.%Y", "%Y-%m-%d", "%Y/%m/%d",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
];

/// Counters reported by a cleaning pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleaningStats {
    pub input_rows: usize,
    pub dropped_missing: usize,
    pub dropped_duplicate: usize,
    pub dropped_invalid_coords: usize,
    pub output_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cleaned {
    pub records: Vec<CleanedRecord>,
    pub stats: CleaningStats,
}

/// Positions of every source column in a raw table's header.
struct ColumnIndex {
    id: usize,
    delivery_person_id: usize,
    age: usize,
    rating: usize,
    restaurant_latitude: usize,
    restaurant_longitude: usize,
    delivery_latitude: usize,
    delivery_longitude: usize,
    order_date: usize,
    time_ordered: usize,
    time_picked: usize,
    weather: usize,
    traffic_density: usize,
    vehicle_condition: usize,
    order_type: usize,
    vehicle_type: usize,
    multiple_deliveries: usize,
    festival: usize,
    city: usize,
    time_taken: usize,
}

impl ColumnIndex {
    fn resolve(table: &RawTable) -> Result<Self> {
        let find = |name: &str| {
            table.column_index(name).ok_or_else(|| {
                EtlError::transformation(format!("raw table has no column '{name}'"))
            })
        };

        Ok(Self {
            id: find(columns::ID)?,
            delivery_person_id: find(columns::DELIVERY_PERSON_ID)?,
            age: find(columns::DELIVERY_PERSON_AGE)?,
            rating: find(columns::DELIVERY_PERSON_RATINGS)?,
            restaurant_latitude: find(columns::RESTAURANT_LATITUDE)?,
            restaurant_longitude: find(columns::RESTAURANT_LONGITUDE)?,
            delivery_latitude: find(columns::DELIVERY_LATITUDE)?,
            delivery_longitude: find(columns::DELIVERY_LONGITUDE)?,
            order_date: find(columns::ORDER_DATE)?,
            time_ordered: find(columns::TIME_ORDERED)?,
            time_picked: find(columns::TIME_PICKED)?,
            weather: find(columns::WEATHER)?,
            traffic_density: find(columns::TRAFFIC_DENSITY)?,
            vehicle_condition: find(columns::VEHICLE_CONDITION)?,
            order_type: find(columns::ORDER_TYPE)?,
            vehicle_type: find(columns::VEHICLE_TYPE)?,
            multiple_deliveries: find(columns::MULTIPLE_DELIVERIES)?,
            festival: find(columns::FESTIVAL)?,
            city: find(columns::CITY)?,
            time_taken: find(columns::TIME_TAKEN)?,
        })
    }
}

/// A row after type coercion but before the missing-value check.
#[derive(Debug)]
struct ParsedRow {
    id: Option<String>,
    delivery_person_id: Option<String>,
    age: i32,
    rating: f64,
    restaurant_latitude: Option<f64>,
    restaurant_longitude: Option<f64>,
    delivery_latitude: Option<f64>,
    delivery_longitude: Option<f64>,
    order_date: Option<NaiveDate>,
    time_ordered: Option<NaiveTime>,
    time_picked: Option<NaiveTime>,
    weather: Option<String>,
    traffic_density: Option<String>,
    vehicle_condition: i32,
    order_type: Option<String>,
    vehicle_type: Option<String>,
    multiple_deliveries: i32,
    festival: Option<String>,
    city: Option<String>,
    time_taken: Option<f64>,
}

impl ParsedRow {
    /// Applies the sentinel rule and keeps the row only if every critical
    /// field is present.
    fn into_cleaned(self) -> Option<CleanedRecord> {
        Some(CleanedRecord {
            id: present(self.id)?,
            delivery_person_id: present(self.delivery_person_id)?,
            delivery_person_age: self.age,
            delivery_person_rating: self.rating,
            restaurant_latitude: self.restaurant_latitude?,
            restaurant_longitude: self.restaurant_longitude?,
            delivery_latitude: self.delivery_latitude?,
            delivery_longitude: self.delivery_longitude?,
            order_date: self.order_date?,
            time_ordered: self.time_ordered?,
            time_picked: self.time_picked?,
            weather: present(self.weather),
            traffic_density: present(self.traffic_density),
            vehicle_condition: self.vehicle_condition,
            order_type: present(self.order_type)?,
            vehicle_type: present(self.vehicle_type),
            multiple_deliveries: self.multiple_deliveries,
            festival: present(self.festival),
            city: present(self.city)?,
            time_taken_min: self.time_taken?,
        })
    }
}

/// Counts of values that failed coercion, one per coercing step.
#[derive(Debug, Default)]
struct CoercionCounts {
    dates: usize,
    times: usize,
    age_rating: usize,
    numerics: usize,
    multiple_deliveries: usize,
    vehicle_condition: usize,
}

/// Runs the full cleaning pass over a raw table.
///
/// # Errors
///
/// Returns [`EtlError::Transformation`] if a source column is missing from
/// the header. Bad cell values are never an error.
#[tracing::instrument(skip(raw), fields(rows = raw.len()))]
pub fn clean(raw: &RawTable) -> Result<Cleaned> {
    info!("Starting data cleaning");
    let idx = ColumnIndex::resolve(raw)?;

    let mut counts = CoercionCounts::default();
    let parsed: Vec<ParsedRow> = raw
        .rows
        .iter()
        .map(|row| parse_row(row, &idx, &mut counts))
        .collect::<Result<_>>()?;

    info!(unparsed = counts.dates, "Order dates parsed");
    info!(unparsed = counts.times, "Order and pickup times parsed");
    info!(defaulted = counts.age_rating, "Age and rating coerced");
    info!(unparsed = counts.numerics, "Coordinates and time taken coerced");
    info!(defaulted = counts.multiple_deliveries, "Multiple deliveries coerced");
    info!("Categorical fields normalized");
    info!(defaulted = counts.vehicle_condition, "Vehicle condition coerced");

    let mut stats = CleaningStats {
        input_rows: raw.len(),
        ..Default::default()
    };

    let complete: Vec<CleanedRecord> = parsed
        .into_iter()
        .filter_map(ParsedRow::into_cleaned)
        .collect();
    stats.dropped_missing = stats.input_rows - complete.len();
    info!(dropped = stats.dropped_missing, "Rows with critical missing fields dropped");

    let before = complete.len();
    let unique = drop_duplicates(complete);
    stats.dropped_duplicate = before - unique.len();
    info!(dropped = stats.dropped_duplicate, "Duplicate rows dropped");

    let before = unique.len();
    let records: Vec<CleanedRecord> = unique.into_iter().filter(has_valid_coordinates).collect();
    stats.dropped_invalid_coords = before - records.len();
    info!(dropped = stats.dropped_invalid_coords, "Rows with invalid coordinates dropped");

    stats.output_rows = records.len();
    if stats.input_rows > 0 && stats.output_rows == 0 {
        warn!(input = stats.input_rows, "Cleaning removed every record");
    }
    info!(records = stats.output_rows, "Data cleaning completed");

    Ok(Cleaned { records, stats })
}

fn parse_row(
    row: &[Option<String>],
    idx: &ColumnIndex,
    counts: &mut CoercionCounts,
) -> Result<ParsedRow> {
    let cell = |i: usize| cell_at(row, i);

    let order_date = parse_date_cell(cell(idx.order_date)?);
    counts.dates += usize::from(order_date.is_none());

    let time_ordered = parse_time_cell(cell(idx.time_ordered)?);
    let time_picked = parse_time_cell(cell(idx.time_picked)?);
    counts.times += usize::from(time_ordered.is_none()) + usize::from(time_picked.is_none());

    let age = parse_number_cell(cell(idx.age)?);
    let rating = parse_number_cell(cell(idx.rating)?);
    counts.age_rating += usize::from(age.is_none()) + usize::from(rating.is_none());

    let restaurant_latitude = parse_number_cell(cell(idx.restaurant_latitude)?);
    let restaurant_longitude = parse_number_cell(cell(idx.restaurant_longitude)?);
    let delivery_latitude = parse_number_cell(cell(idx.delivery_latitude)?);
    let delivery_longitude = parse_number_cell(cell(idx.delivery_longitude)?);
    let time_taken = parse_number_cell(cell(idx.time_taken)?);
    counts.numerics += [
        restaurant_latitude,
        restaurant_longitude,
        delivery_latitude,
        delivery_longitude,
        time_taken,
    ]
    .iter()
    .filter(|v| v.is_none())
    .count();

    let multiple_deliveries = parse_number_cell(cell(idx.multiple_deliveries)?);
    counts.multiple_deliveries += usize::from(multiple_deliveries.is_none());

    let weather = cell(idx.weather)?.map(normalize_title);
    let traffic_density = cell(idx.traffic_density)?.map(normalize_title);
    let order_type = cell(idx.order_type)?.map(normalize_title);
    let festival = cell(idx.festival)?.map(normalize_title);
    let city = cell(idx.city)?.map(normalize_title);
    let vehicle_type = cell(idx.vehicle_type)?.map(normalize_snake);

    let vehicle_condition = parse_number_cell(cell(idx.vehicle_condition)?);
    counts.vehicle_condition += usize::from(vehicle_condition.is_none());

    Ok(ParsedRow {
        id: cell(idx.id)?.map(str::to_string),
        delivery_person_id: cell(idx.delivery_person_id)?.map(str::to_string),
        age: age.map_or(0, truncate_to_i32),
        rating: rating.unwrap_or(0.0),
        restaurant_latitude,
        restaurant_longitude,
        delivery_latitude,
        delivery_longitude,
        order_date,
        time_ordered,
        time_picked,
        weather,
        traffic_density,
        vehicle_condition: vehicle_condition.map_or(0, truncate_to_i32),
        order_type,
        vehicle_type,
        multiple_deliveries: multiple_deliveries.map_or(0, truncate_to_i32),
        festival,
        city,
        time_taken,
    })
}

fn cell_at(row: &[Option<String>], i: usize) -> Result<Option<&str>> {
    row.get(i)
        .map(|v| v.as_deref())
        .ok_or_else(|| EtlError::transformation(format!("raw row has no cell {i}")))
}

fn parse_date_cell(value: Option<&str>) -> Option<NaiveDate> {
    value.and_then(parse_order_date)
}

fn parse_time_cell(value: Option<&str>) -> Option<NaiveTime> {
    value.and_then(parse_time_of_day)
}

fn parse_number_cell(value: Option<&str>) -> Option<f64> {
    value.and_then(parse_number)
}

/// Parses an order date, day-first where the format is ambiguous.
pub fn parse_order_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
                .map(|dt| dt.date())
        })
}

/// Parses an `HH:MM` time of day.
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), TIME_FORMAT).ok()
}

/// Parses a finite number; `nan` and `inf` count as unparseable.
pub fn parse_number(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn truncate_to_i32(value: f64) -> i32 {
    // `as` saturates at the i32 bounds
    value.trunc() as i32
}

/// Upper-cases the first letter of every alphabetic run and lower-cases the rest.
pub fn title_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_alpha = false;
    for c in value.chars() {
        if prev_alpha {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        prev_alpha = c.is_alphabetic();
    }
    out
}

fn normalize_title(value: &str) -> String {
    title_case(value.trim())
}

fn normalize_snake(value: &str) -> String {
    value.trim().to_lowercase().replace(' ', "_")
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !MISSING_SENTINELS.contains(&v.as_str()))
}

fn drop_duplicates(records: Vec<CleanedRecord>) -> Vec<CleanedRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.row_key()))
        .collect()
}

fn has_valid_coordinates(record: &CleanedRecord) -> bool {
    let lat_ok = |v: f64| (-90.0..=90.0).contains(&v) && v != 0.0;
    let long_ok = |v: f64| (-180.0..=180.0).contains(&v) && v != 0.0;

    lat_ok(record.restaurant_latitude)
        && long_ok(record.restaurant_longitude)
        && lat_ok(record.delivery_latitude)
        && long_ok(record.delivery_longitude)
}
