//! Rows of the star schema.

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::Serialize;

/// Surrogate key type of every star-schema table (`SERIAL`).
pub type SurrogateKey = i32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryPersonRow {
    pub delivery_person_id: String,
    pub age: i32,
    pub ratings: f64,
}

/// Which end of a delivery a location row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationRole {
    Restaurant,
    Delivery,
}

impl LocationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationRole::Restaurant => "restaurant",
            LocationRole::Delivery => "delivery",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "restaurant" => Some(LocationRole::Restaurant),
            "delivery" => Some(LocationRole::Delivery),
            _ => None,
        }
    }
}

impl fmt::Display for LocationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationRow {
    pub latitude: f64,
    pub longitude: f64,
    pub city: String,
    pub location_type: LocationRole,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateTimeRow {
    pub order_date: NaiveDate,
    pub time_ordered: NaiveTime,
    pub time_picked: NaiveTime,
    pub day: i32,
    pub month: i32,
    pub year: i32,
}

impl DateTimeRow {
    pub fn new(order_date: NaiveDate, time_ordered: NaiveTime, time_picked: NaiveTime) -> Self {
        Self {
            order_date,
            time_ordered,
            time_picked,
            day: order_date.day() as i32,
            month: order_date.month() as i32,
            year: order_date.year(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VehicleRow {
    pub vehicle_condition: i32,
    pub vehicle_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactRow {
    pub delivery_id: String,
    pub delivery_person_key: Option<SurrogateKey>,
    pub restaurant_location_key: Option<SurrogateKey>,
    pub delivery_location_key: Option<SurrogateKey>,
    pub vehicle_key: Option<SurrogateKey>,
    pub datetime_key: Option<SurrogateKey>,
    pub order_type: String,
    pub weather_condition: Option<String>,
    pub road_traffic_density: Option<String>,
    pub festival: Option<String>,
    pub multiple_deliveries: i32,
    pub time_taken: f64,
}

/// A stored row together with its surrogate key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Keyed<T> {
    pub key: SurrogateKey,
    pub row: T,
}

/// Dimension tables as read back from the store, used for key resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DimensionTables {
    pub delivery_persons: Vec<Keyed<DeliveryPersonRow>>,
    pub locations: Vec<Keyed<LocationRow>>,
    pub datetimes: Vec<Keyed<DateTimeRow>>,
    pub vehicles: Vec<Keyed<VehicleRow>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_role_round_trip_str() {
        for role in [LocationRole::Restaurant, LocationRole::Delivery] {
            assert_eq!(LocationRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(LocationRole::parse("warehouse"), None);
    }

    #[test]
    fn test_datetime_row_components() {
        let row = DateTimeRow::new(
            NaiveDate::from_ymd_opt(2022, 4, 5).unwrap(),
            NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(18, 10, 0).unwrap(),
        );
        assert_eq!((row.day, row.month, row.year), (5, 4, 2022));
    }
}
