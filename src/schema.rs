//! Star schema DDL and the idempotent schema builder.

use tracing::info;

use crate::error::Result;
use crate::store::Warehouse;

pub const CREATE_STAR_SCHEMA: &str = "CREATE SCHEMA IF NOT EXISTS star_schema";

/// Table DDL in dependency order: dimensions before the fact table.
pub const CREATE_TABLES: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS star_schema.dim_delivery_person (
        delivery_person_key SERIAL PRIMARY KEY,
        delivery_person_id  TEXT NOT NULL UNIQUE,
        age                 INTEGER NOT NULL,
        ratings             DOUBLE PRECISION NOT NULL
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS star_schema.dim_location (
        location_key  SERIAL PRIMARY KEY,
        latitude      DOUBLE PRECISION NOT NULL,
        longitude     DOUBLE PRECISION NOT NULL,
        city          TEXT NOT NULL,
        location_type TEXT NOT NULL
            CHECK (location_type IN ('restaurant', 'delivery')),
        UNIQUE (latitude, longitude, city, location_type)
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS star_schema.dim_datetime (
        datetime_key SERIAL PRIMARY KEY,
        order_date   DATE NOT NULL UNIQUE,
        time_ordered TIME NOT NULL,
        time_picked  TIME NOT NULL,
        day          INTEGER NOT NULL,
        month        INTEGER NOT NULL,
        year         INTEGER NOT NULL,
        UNIQUE (order_date, time_ordered, time_picked)
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS star_schema.dim_vehicle (
        vehicle_key       SERIAL PRIMARY KEY,
        vehicle_condition INTEGER NOT NULL,
        vehicle_type      TEXT,
        UNIQUE (vehicle_condition, vehicle_type)
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS star_schema.fact_deliveries (
        delivery_key            SERIAL PRIMARY KEY,
        delivery_id             TEXT NOT NULL UNIQUE,
        delivery_person_key     INTEGER REFERENCES star_schema.dim_delivery_person (delivery_person_key),
        restaurant_location_key INTEGER REFERENCES star_schema.dim_location (location_key),
        delivery_location_key   INTEGER REFERENCES star_schema.dim_location (location_key),
        vehicle_key             INTEGER REFERENCES star_schema.dim_vehicle (vehicle_key),
        datetime_key            INTEGER REFERENCES star_schema.dim_datetime (datetime_key),
        order_type              TEXT NOT NULL,
        weather_condition       TEXT,
        road_traffic_density    TEXT,
        festival                TEXT,
        multiple_deliveries     INTEGER NOT NULL,
        time_taken              DOUBLE PRECISION NOT NULL
    )"#,
];

/// Creates the star schema and its tables if they do not exist yet.
///
/// Safe to call on every run. Must complete before any populator runs.
#[tracing::instrument(skip(store))]
pub async fn ensure_star_schema<W: Warehouse + ?Sized>(store: &W) -> Result<()> {
    store.ensure_schema().await?;
    info!("Schema 'star_schema' checked/created");

    store.ensure_tables().await?;
    info!(tables = CREATE_TABLES.len(), "Star schema tables checked/created");
    Ok(())
}

/// Empties the star schema ahead of a full refresh.
#[tracing::instrument(skip(store))]
pub async fn clear_star_schema<W: Warehouse + ?Sized>(store: &W) -> Result<()> {
    store.clear_star_schema().await?;
    info!("All star schema tables cleared");
    Ok(())
}
