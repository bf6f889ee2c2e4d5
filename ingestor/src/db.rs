use crate::config::Config;
use crate::errors::Result;
use crate::metrics::{BATCH_SIZE, DB_FAILURES_TOTAL, WRITE_LATENCY_SECONDS};
use crate::model::{Measurement, UniquenessKey};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::{FromRow, QueryBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, error, info};

pub const TABLE: &str = "temperatures";

// Raised by concurrent CREATE TABLE IF NOT EXISTS from another process.
const DUPLICATE_TABLE: &str = "42P07";
const UNIQUE_VIOLATION: &str = "23505";

pub async fn make_pool(config: &Config) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.db_acquire_timeout)
        .connect_with(config.database.connect_options()?)
        .await?;

    info!("Database connection established");
    Ok(pool)
}

/// Storage client for measurements.
///
/// Owns the pool handed to it by `main`. The table is provisioned lazily on
/// first use and remembered for the life of the process; a failed
/// provisioning attempt is retried by the next caller.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
    key: UniquenessKey,
    schema_ready: Arc<OnceCell<()>>,
}

/// Read-back filter; `limit`/`offset` are already clamped by the caller.
#[derive(Debug, Clone, Default)]
pub struct MeasurementFilter {
    pub device_id: Option<String>,
    pub location_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, FromRow)]
struct MeasurementRow {
    timestamp: NaiveDateTime,
    device_id: String,
    location_id: Option<String>,
    humidity: Option<f64>,
    temperature: f64,
}

impl From<MeasurementRow> for Measurement {
    fn from(row: MeasurementRow) -> Self {
        Self {
            device_id: row.device_id,
            location_id: row.location_id,
            timestamp: row.timestamp.and_utc(),
            temperature: row.temperature,
            humidity: row.humidity,
        }
    }
}

impl Store {
    pub fn new(pool: PgPool, key: UniquenessKey) -> Self {
        Self {
            pool,
            key,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| create_table(&self.pool, self.key))
            .await?;
        Ok(())
    }

    /// Writes all records in one transaction, replacing rows that collide on
    /// the uniqueness key. Returns the number of records submitted.
    pub async fn upsert(&self, records: &[Measurement]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        BATCH_SIZE.set(records.len() as f64);
        let start = Instant::now();

        if let Err(e) = self.upsert_inner(records).await {
            DB_FAILURES_TOTAL.inc();
            error!("Failed to write batch of {} records: {}", records.len(), e);
            return Err(e);
        }

        let elapsed = start.elapsed().as_secs_f64();
        WRITE_LATENCY_SECONDS.observe(elapsed);
        debug!("Wrote {} records in {:.3}s", records.len(), elapsed);
        Ok(records.len())
    }

    async fn upsert_inner(&self, records: &[Measurement]) -> Result<()> {
        self.ensure_schema().await?;

        let rows = collapse_duplicates(records, self.key);
        if rows.len() < records.len() {
            debug!(
                "Collapsed {} in-batch duplicates",
                records.len() - rows.len()
            );
        }

        let timestamps: Vec<NaiveDateTime> =
            rows.iter().map(|m| stored_instant(&m.timestamp)).collect();
        let device_ids: Vec<&str> = rows.iter().map(|m| m.device_id.as_str()).collect();
        let location_ids: Vec<Option<String>> =
            rows.iter().map(|m| m.location_id.clone()).collect();
        let humidities: Vec<Option<f64>> = rows.iter().map(|m| m.humidity).collect();
        let temperatures: Vec<f64> = rows.iter().map(|m| m.temperature).collect();

        let query = upsert_statement(self.key);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&query)
            .bind(&timestamps)
            .bind(&device_ids)
            .bind(&location_ids)
            .bind(&humidities)
            .bind(&temperatures)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Newest first.
    pub async fn query(&self, filter: &MeasurementFilter) -> Result<Vec<Measurement>> {
        self.ensure_schema().await?;

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            r#"SELECT "timestamp", device_id, location_id, humidity, temperature FROM {} WHERE TRUE"#,
            TABLE
        ));

        if let Some(device_id) = &filter.device_id {
            builder.push(" AND device_id = ").push_bind(device_id.clone());
        }
        if let Some(location_id) = &filter.location_id {
            builder.push(" AND location_id = ").push_bind(location_id.clone());
        }
        if let Some(start) = &filter.start {
            builder.push(r#" AND "timestamp" >= "#).push_bind(start.naive_utc());
        }
        if let Some(end) = &filter.end {
            builder.push(r#" AND "timestamp" <= "#).push_bind(end.naive_utc());
        }

        builder
            .push(r#" ORDER BY "timestamp" DESC, device_id LIMIT "#)
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows = builder
            .build_query_as::<MeasurementRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Measurement::from).collect())
    }

    pub async fn close(&self) {
        info!("Closing database pool");
        self.pool.close().await;
    }
}

async fn create_table(pool: &PgPool, key: UniquenessKey) -> Result<()> {
    info!("Ensuring table {} exists", TABLE);

    match sqlx::query(&create_table_statement(key)).execute(pool).await {
        Ok(_) => Ok(()),
        Err(e) if is_creation_race(&e) => {
            debug!("Table {} was created concurrently: {}", TABLE, e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn is_creation_race(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| code == DUPLICATE_TABLE || code == UNIQUE_VIOLATION),
        _ => false,
    }
}

fn create_table_statement(key: UniquenessKey) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            "timestamp" TIMESTAMP        NOT NULL,
            device_id   VARCHAR(45)      NOT NULL,
            location_id VARCHAR(45),
            humidity    DOUBLE PRECISION,
            temperature DOUBLE PRECISION NOT NULL,
            PRIMARY KEY ({})
        )
        "#,
        TABLE,
        key.columns()
    )
}

fn upsert_statement(key: UniquenessKey) -> String {
    let updates = match key {
        UniquenessKey::TimestampDevice => {
            "location_id = EXCLUDED.location_id, \
             humidity = EXCLUDED.humidity, \
             temperature = EXCLUDED.temperature"
        }
        UniquenessKey::Timestamp => {
            "device_id = EXCLUDED.device_id, \
             location_id = EXCLUDED.location_id, \
             humidity = EXCLUDED.humidity, \
             temperature = EXCLUDED.temperature"
        }
    };

    format!(
        r#"
        INSERT INTO {} ("timestamp", device_id, location_id, humidity, temperature)
        SELECT * FROM UNNEST($1::timestamp[], $2::text[], $3::text[], $4::float8[], $5::float8[])
        ON CONFLICT ({}) DO UPDATE SET {}
        "#,
        TABLE,
        key.columns(),
        updates
    )
}

/// The instant Postgres will hold: whole microseconds.
fn stored_instant(timestamp: &DateTime<Utc>) -> NaiveDateTime {
    timestamp.trunc_subsecs(6).naive_utc()
}

/// Keeps the last record for each key, in first-seen order. Postgres refuses
/// to update the same row twice within one INSERT ... ON CONFLICT.
fn collapse_duplicates(records: &[Measurement], key: UniquenessKey) -> Vec<&Measurement> {
    let mut slots: HashMap<(NaiveDateTime, Option<&str>), usize> =
        HashMap::with_capacity(records.len());
    let mut rows: Vec<&Measurement> = Vec::with_capacity(records.len());

    for record in records {
        let instant = stored_instant(&record.timestamp);
        let id = match key {
            UniquenessKey::TimestampDevice => (instant, Some(record.device_id.as_str())),
            UniquenessKey::Timestamp => (instant, None),
        };

        match slots.get(&id) {
            Some(&index) => rows[index] = record,
            None => {
                slots.insert(id, rows.len());
                rows.push(record);
            }
        }
    }

    rows
}
