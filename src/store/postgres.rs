use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use super::{
    CLEAR_ORDER, DIM_DATETIME, DIM_DELIVERY_PERSON, DIM_LOCATION, DIM_VEHICLE, FACT_DELIVERIES,
    RAW_SCHEMA, RAW_TABLE, STAR_SCHEMA, Warehouse,
};
use crate::config::EtlConfig;
use crate::error::{EtlError, Result};
use crate::model::{
    DateTimeRow, DeliveryPersonRow, DimensionTables, FactRow, Keyed, LocationRole, LocationRow,
    VehicleRow,
};
use crate::raw::RawTable;
use crate::schema::{CREATE_STAR_SCHEMA, CREATE_TABLES};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

const RAW_STAGING_TABLE: &str = "deliveries_raw_staging";

/// [`Warehouse`] backed by PostgreSQL.
///
/// The pool holds a single connection; every operation acquires it for the
/// length of one transaction and hands it back on every exit path.
pub struct PgWarehouse {
    pool: PgPool,
    batch_size: usize,
}

impl PgWarehouse {
    /// Builds the pool without opening a connection.
    ///
    /// Connections are made on first use, so an unreachable server surfaces as
    /// a [`EtlError::Connection`] from the first operation and can be retried.
    #[tracing::instrument(skip(config))]
    pub fn connect_lazy(config: &EtlConfig) -> Result<Self> {
        let url = config.require_database_url()?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(url)
            .map_err(|e| EtlError::connection("configure database pool", e))?;

        info!(batch_size = config.batch_size, "Database pool configured");
        Ok(Self {
            pool,
            batch_size: config.batch_size,
        })
    }

    /// Closes the pool, waiting for the connection to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connections closed");
    }

    fn rows_per_statement(&self, columns: usize) -> usize {
        (MAX_BIND_PARAMS / columns.max(1)).min(self.batch_size).max(1)
    }

    /// Multi-row `INSERT` of `rows` in one transaction, split into statements
    /// that stay under the bind-parameter limit.
    async fn bulk_insert<'r, T, F>(
        &self,
        context: &str,
        insert_into: &str,
        columns: usize,
        rows: &'r [T],
        mut push_row: F,
    ) -> Result<u64>
    where
        T: Sync,
        F: FnMut(Separated<'_, 'r, Postgres, &'static str>, &'r T) + Send,
    {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(db_error(context))?;
        let mut written = 0;
        for chunk in rows.chunks(self.rows_per_statement(columns)) {
            let mut qb: QueryBuilder<'r, Postgres> = QueryBuilder::new(insert_into);
            qb.push_values(chunk, &mut push_row);
            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(db_error(context))?;
            written += result.rows_affected();
        }
        tx.commit().await.map_err(db_error(context))?;

        debug!(context, rows = written, "Bulk insert committed");
        Ok(written)
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    #[tracing::instrument(skip(self, table), fields(rows = table.len()))]
    async fn replace_raw(&self, table: &RawTable) -> Result<u64> {
        if table.headers.is_empty() {
            return Err(EtlError::extraction("replace raw table", "source has no columns"));
        }

        let column_list = table
            .headers
            .iter()
            .map(|h| quote_ident(h))
            .collect::<Vec<_>>()
            .join(", ");
        let column_defs = table
            .headers
            .iter()
            .map(|h| format!("{} TEXT", quote_ident(h)))
            .collect::<Vec<_>>()
            .join(", ");
        let staging = format!("{RAW_SCHEMA}.{RAW_STAGING_TABLE}");

        let mut tx = self.pool.begin().await.map_err(extraction_error("begin raw load"))?;

        for statement in [
            format!("CREATE SCHEMA IF NOT EXISTS {RAW_SCHEMA}"),
            format!("DROP TABLE IF EXISTS {staging}"),
            format!("CREATE TABLE {staging} ({column_defs})"),
        ] {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(extraction_error("prepare raw staging table"))?;
        }

        let mut written = 0;
        let insert_into = format!("INSERT INTO {staging} ({column_list}) ");
        for chunk in table.rows.chunks(self.rows_per_statement(table.headers.len())) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(&insert_into);
            qb.push_values(chunk, |mut b, row| {
                for cell in row {
                    b.push_bind(cell.as_deref());
                }
            });
            written += qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(extraction_error("insert raw rows"))?
                .rows_affected();
        }

        for statement in [
            format!("DROP TABLE IF EXISTS {RAW_SCHEMA}.{RAW_TABLE}"),
            format!("ALTER TABLE {staging} RENAME TO {RAW_TABLE}"),
        ] {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(extraction_error("swap raw table"))?;
        }

        tx.commit().await.map_err(extraction_error("commit raw load"))?;
        Ok(written)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_raw(&self) -> Result<RawTable> {
        let headers: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(RAW_SCHEMA)
        .bind(RAW_TABLE)
        .fetch_all(&self.pool)
        .await
        .map_err(extraction_error("read raw table columns"))?;

        if headers.is_empty() {
            return Err(EtlError::extraction(
                "read raw table",
                format!("{RAW_SCHEMA}.{RAW_TABLE} does not exist"),
            ));
        }

        let select = format!(
            "SELECT {} FROM {RAW_SCHEMA}.{RAW_TABLE}",
            headers.iter().map(|h| quote_ident(h)).collect::<Vec<_>>().join(", ")
        );
        let rows = sqlx::query(&select)
            .fetch_all(&self.pool)
            .await
            .map_err(extraction_error("read raw table"))?;

        let mut table = RawTable::new(headers);
        for row in rows {
            let cells = (0..table.headers.len())
                .map(|i| row.try_get::<Option<String>, _>(i))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(extraction_error("decode raw row"))?;
            table.rows.push(cells);
        }
        Ok(table)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_STAR_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_error("create star schema"))?;
        Ok(())
    }

    async fn ensure_tables(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error("create tables"))?;
        for ddl in CREATE_TABLES {
            sqlx::query(ddl)
                .execute(&mut *tx)
                .await
                .map_err(db_error("create tables"))?;
        }
        tx.commit().await.map_err(db_error("create tables"))?;
        Ok(())
    }

    async fn clear_star_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error("clear tables"))?;
        for table in CLEAR_ORDER {
            sqlx::query(&format!(
                "TRUNCATE TABLE {STAR_SCHEMA}.{table} RESTART IDENTITY CASCADE"
            ))
            .execute(&mut *tx)
            .await
            .map_err(db_error("clear tables"))?;
            debug!(table, "Cleared table");
        }
        tx.commit().await.map_err(db_error("clear tables"))?;
        Ok(())
    }

    async fn insert_delivery_persons(&self, rows: &[DeliveryPersonRow]) -> Result<u64> {
        self.bulk_insert(
            "insert dim_delivery_person",
            &format!(
                "INSERT INTO {STAR_SCHEMA}.{DIM_DELIVERY_PERSON} (delivery_person_id, age, ratings) "
            ),
            3,
            rows,
            |mut b, row| {
                b.push_bind(row.delivery_person_id.as_str())
                    .push_bind(row.age)
                    .push_bind(row.ratings);
            },
        )
        .await
    }

    async fn insert_locations(&self, rows: &[LocationRow]) -> Result<u64> {
        self.bulk_insert(
            "insert dim_location",
            &format!(
                "INSERT INTO {STAR_SCHEMA}.{DIM_LOCATION} (latitude, longitude, city, location_type) "
            ),
            4,
            rows,
            |mut b, row| {
                b.push_bind(row.latitude)
                    .push_bind(row.longitude)
                    .push_bind(row.city.as_str())
                    .push_bind(row.location_type.as_str());
            },
        )
        .await
    }

    async fn insert_vehicles(&self, rows: &[VehicleRow]) -> Result<u64> {
        self.bulk_insert(
            "insert dim_vehicle",
            &format!("INSERT INTO {STAR_SCHEMA}.{DIM_VEHICLE} (vehicle_condition, vehicle_type) "),
            2,
            rows,
            |mut b, row| {
                b.push_bind(row.vehicle_condition)
                    .push_bind(row.vehicle_type.as_deref());
            },
        )
        .await
    }

    async fn insert_datetimes_skip_conflicts(&self, rows: &[DateTimeRow]) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {STAR_SCHEMA}.{DIM_DATETIME} \
             (order_date, time_ordered, time_picked, day, month, year) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT DO NOTHING"
        );

        let mut tx = self.pool.begin().await.map_err(db_error("insert dim_datetime"))?;
        let mut inserted = 0;
        for row in rows {
            inserted += sqlx::query(&sql)
                .bind(row.order_date)
                .bind(row.time_ordered)
                .bind(row.time_picked)
                .bind(row.day)
                .bind(row.month)
                .bind(row.year)
                .execute(&mut *tx)
                .await
                .map_err(db_error("insert dim_datetime"))?
                .rows_affected();
        }
        tx.commit().await.map_err(db_error("insert dim_datetime"))?;
        Ok(inserted)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_dimensions(&self) -> Result<DimensionTables> {
        let delivery_persons = sqlx::query_as::<_, (i32, String, i32, f64)>(&format!(
            "SELECT delivery_person_key, delivery_person_id, age, ratings \
             FROM {STAR_SCHEMA}.{DIM_DELIVERY_PERSON} ORDER BY delivery_person_key"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("read dim_delivery_person"))?
        .into_iter()
        .map(|(key, delivery_person_id, age, ratings)| Keyed {
            key,
            row: DeliveryPersonRow {
                delivery_person_id,
                age,
                ratings,
            },
        })
        .collect();

        let locations = sqlx::query_as::<_, (i32, f64, f64, String, String)>(&format!(
            "SELECT location_key, latitude, longitude, city, location_type \
             FROM {STAR_SCHEMA}.{DIM_LOCATION} ORDER BY location_key"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("read dim_location"))?
        .into_iter()
        .map(|(key, latitude, longitude, city, location_type)| {
            let location_type = LocationRole::parse(&location_type).ok_or_else(|| {
                EtlError::load("read dim_location", format!("unknown role '{location_type}'"))
            })?;
            Ok(Keyed {
                key,
                row: LocationRow {
                    latitude,
                    longitude,
                    city,
                    location_type,
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let datetimes = sqlx::query_as::<_, (i32, chrono::NaiveDate, chrono::NaiveTime, chrono::NaiveTime, i32, i32, i32)>(
            &format!(
                "SELECT datetime_key, order_date, time_ordered, time_picked, day, month, year \
                 FROM {STAR_SCHEMA}.{DIM_DATETIME} ORDER BY datetime_key"
            ),
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("read dim_datetime"))?
        .into_iter()
        .map(
            |(key, order_date, time_ordered, time_picked, day, month, year)| Keyed {
                key,
                row: DateTimeRow {
                    order_date,
                    time_ordered,
                    time_picked,
                    day,
                    month,
                    year,
                },
            },
        )
        .collect();

        let vehicles = sqlx::query_as::<_, (i32, i32, Option<String>)>(&format!(
            "SELECT vehicle_key, vehicle_condition, vehicle_type \
             FROM {STAR_SCHEMA}.{DIM_VEHICLE} ORDER BY vehicle_key"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("read dim_vehicle"))?
        .into_iter()
        .map(|(key, vehicle_condition, vehicle_type)| Keyed {
            key,
            row: VehicleRow {
                vehicle_condition,
                vehicle_type,
            },
        })
        .collect();

        Ok(DimensionTables {
            delivery_persons,
            locations,
            datetimes,
            vehicles,
        })
    }

    async fn insert_facts(&self, rows: &[FactRow]) -> Result<u64> {
        self.bulk_insert(
            "insert fact_deliveries",
            &format!(
                "INSERT INTO {STAR_SCHEMA}.{FACT_DELIVERIES} (delivery_id, delivery_person_key, \
                 restaurant_location_key, delivery_location_key, vehicle_key, datetime_key, \
                 order_type, weather_condition, road_traffic_density, festival, \
                 multiple_deliveries, time_taken) "
            ),
            12,
            rows,
            |mut b, row| {
                b.push_bind(row.delivery_id.as_str())
                    .push_bind(row.delivery_person_key)
                    .push_bind(row.restaurant_location_key)
                    .push_bind(row.delivery_location_key)
                    .push_bind(row.vehicle_key)
                    .push_bind(row.datetime_key)
                    .push_bind(row.order_type.as_str())
                    .push_bind(row.weather_condition.as_deref())
                    .push_bind(row.road_traffic_density.as_deref())
                    .push_bind(row.festival.as_deref())
                    .push_bind(row.multiple_deliveries)
                    .push_bind(row.time_taken);
            },
        )
        .await
    }
}

/// Double-quotes an identifier so source headers like `Time_taken (min)` are
/// usable as column names.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_connection_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> EtlError + '_ {
    move |err| {
        if is_connection_failure(&err) {
            EtlError::connection(context, err)
        } else {
            EtlError::load(context, err)
        }
    }
}

fn extraction_error(context: &str) -> impl Fn(sqlx::Error) -> EtlError + '_ {
    move |err| {
        if is_connection_failure(&err) {
            EtlError::connection(context, err)
        } else {
            EtlError::extraction(context, err)
        }
    }
}
