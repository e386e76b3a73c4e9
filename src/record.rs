//! Typed delivery records produced by the cleaning engine.

use chrono::{NaiveDate, NaiveTime};

/// Date format used when a cleaned record is rendered back to text.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Time-of-day format of the source's order/pickup columns.
pub const TIME_FORMAT: &str = "%H:%M";

/// A delivery event that survived cleaning.
///
/// Critical fields are non-optional; the remaining categoricals may still be
/// missing.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedRecord {
    pub id: String,
    pub delivery_person_id: String,
    pub delivery_person_age: i32,
    pub delivery_person_rating: f64,
    pub restaurant_latitude: f64,
    pub restaurant_longitude: f64,
    pub delivery_latitude: f64,
    pub delivery_longitude: f64,
    pub order_date: NaiveDate,
    pub time_ordered: NaiveTime,
    pub time_picked: NaiveTime,
    pub weather: Option<String>,
    pub traffic_density: Option<String>,
    pub vehicle_condition: i32,
    pub order_type: String,
    pub vehicle_type: Option<String>,
    pub multiple_deliveries: i32,
    pub festival: Option<String>,
    pub city: String,
    pub time_taken_min: f64,
}

impl CleanedRecord {
    /// Renders the record as a raw row, in [`crate::raw::columns::ALL`] order.
    pub fn to_raw_row(&self) -> Vec<Option<String>> {
        vec![
            Some(self.id.clone()),
            Some(self.delivery_person_id.clone()),
            Some(self.delivery_person_age.to_string()),
            Some(self.delivery_person_rating.to_string()),
            Some(self.restaurant_latitude.to_string()),
            Some(self.restaurant_longitude.to_string()),
            Some(self.delivery_latitude.to_string()),
            Some(self.delivery_longitude.to_string()),
            Some(self.order_date.format(DATE_FORMAT).to_string()),
            Some(self.time_ordered.format(TIME_FORMAT).to_string()),
            Some(self.time_picked.format(TIME_FORMAT).to_string()),
            self.weather.clone(),
            self.traffic_density.clone(),
            Some(self.vehicle_condition.to_string()),
            Some(self.order_type.clone()),
            self.vehicle_type.clone(),
            Some(self.multiple_deliveries.to_string()),
            self.festival.clone(),
            Some(self.city.clone()),
            Some(self.time_taken_min.to_string()),
        ]
    }

    /// Hashable identity of the whole row, used for exact-duplicate removal.
    pub fn row_key(&self) -> RowKey {
        RowKey {
            text: [
                self.id.clone(),
                self.delivery_person_id.clone(),
                self.order_type.clone(),
                self.city.clone(),
            ],
            optional: [
                self.weather.clone(),
                self.traffic_density.clone(),
                self.vehicle_type.clone(),
                self.festival.clone(),
            ],
            ints: [
                self.delivery_person_age,
                self.vehicle_condition,
                self.multiple_deliveries,
            ],
            floats: [
                float_key(self.delivery_person_rating),
                float_key(self.restaurant_latitude),
                float_key(self.restaurant_longitude),
                float_key(self.delivery_latitude),
                float_key(self.delivery_longitude),
                float_key(self.time_taken_min),
            ],
            date: self.order_date,
            times: [self.time_ordered, self.time_picked],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    text: [String; 4],
    optional: [Option<String>; 4],
    ints: [i32; 3],
    floats: [u64; 6],
    date: NaiveDate,
    times: [NaiveTime; 2],
}

/// Bit pattern of a finite float for use in hash keys; `-0.0` and `0.0` collide
/// as they compare equal.
pub fn float_key(value: f64) -> u64 {
    if value == 0.0 { 0 } else { value.to_bits() }
}
