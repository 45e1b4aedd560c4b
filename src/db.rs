use std::future::Future;
use std::path::Path;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::DatabaseArgs;
use crate::error::{Result, SamplerError};
use crate::models::{EntryCode, OpenSlot, Reservation, ReservationStatus, SlotCurve};
use crate::store::{CurveStore, EntryCodeStore, ReservationLedger};

pub async fn connect(args: &DatabaseArgs) -> anyhow::Result<PgPool> {
    use anyhow::Context;

    let database_url = args
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(args.db_max_pool_size)
        .acquire_timeout(args.timeout())
        .idle_timeout(StdDuration::from_secs(args.db_idle_conn_timeout))
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed curve history, reservation ledger and entry codes.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: StdDuration,
}

impl PgStore {
    pub fn new(pool: PgPool, timeout: StdDuration) -> Self {
        Self { pool, timeout }
    }

    /// Runs a query under the configured timeout.
    async fn bounded<T, F>(&self, query: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(result) => result.map_err(SamplerError::from),
            Err(_) => Err(SamplerError::StorageTimeout(self.timeout)),
        }
    }
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation> {
    let status: String = row.get("status");
    Ok(Reservation {
        id: row.get("id"),
        participant_id: row.get("participant_id"),
        reserved_at: row.get("reserved_at"),
        status: status
            .parse::<ReservationStatus>()
            .map_err(|err| SamplerError::Storage(sqlx::Error::Decode(err.into())))?,
    })
}

#[async_trait]
impl CurveStore for PgStore {
    async fn load_latest_slot_curve(&self, instance_id: &str) -> Result<Option<SlotCurve>> {
        let row = self
            .bounded(
                sqlx::query(
                    r#"
                    SELECT interval_start, open_slots
                    FROM enrollment_sampler.slot_curves
                    WHERE instance_id = $1
                    ORDER BY interval_start DESC, created_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(instance_id)
                .fetch_optional(&self.pool),
            )
            .await?;

        Ok(row.map(|row| {
            let Json(open_slots): Json<Vec<OpenSlot>> = row.get("open_slots");
            SlotCurve {
                interval_start: row.get("interval_start"),
                open_slots,
            }
        }))
    }

    async fn save_new_slot_curve(&self, instance_id: &str, curve: &SlotCurve) -> Result<()> {
        self.bounded(
            sqlx::query(
                r#"
                INSERT INTO enrollment_sampler.slot_curves
                (id, instance_id, interval_start, open_slots)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(instance_id)
            .bind(curve.interval_start)
            .bind(Json(&curve.open_slots))
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ReservationLedger for PgStore {
    async fn count_active_since(&self, instance_id: &str, since: DateTime<Utc>) -> Result<i64> {
        let row = self
            .bounded(
                sqlx::query(
                    r#"
                    SELECT COUNT(*) AS used
                    FROM enrollment_sampler.reservations
                    WHERE instance_id = $1 AND reserved_at >= $2
                    "#,
                )
                .bind(instance_id)
                .bind(since)
                .fetch_one(&self.pool),
            )
            .await?;
        Ok(row.get("used"))
    }

    async fn reserve(
        &self,
        instance_id: &str,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let row = self
            .bounded(
                sqlx::query(
                    r#"
                    INSERT INTO enrollment_sampler.reservations
                    (id, instance_id, participant_id, status, reserved_at)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING id, participant_id, status, reserved_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(instance_id)
                .bind(participant_id)
                .bind(ReservationStatus::Reserved.as_str())
                .bind(now)
                .fetch_one(&self.pool),
            )
            .await?;
        reservation_from_row(&row)
    }

    async fn confirm(&self, instance_id: &str, participant_id: &str) -> Result<Reservation> {
        let row = self
            .bounded(
                sqlx::query(
                    r#"
                    UPDATE enrollment_sampler.reservations
                    SET status = 'confirmed'
                    WHERE id = (
                        SELECT id FROM enrollment_sampler.reservations
                        WHERE instance_id = $1 AND participant_id = $2 AND status = 'reserved'
                        ORDER BY reserved_at DESC
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    RETURNING id, participant_id, status, reserved_at
                    "#,
                )
                .bind(instance_id)
                .bind(participant_id)
                .fetch_optional(&self.pool),
            )
            .await?;

        match row {
            Some(row) => reservation_from_row(&row),
            None => Err(SamplerError::not_found("reserved slot", participant_id)),
        }
    }

    async fn cancel(&self, instance_id: &str, participant_id: &str) -> Result<Reservation> {
        let row = self
            .bounded(
                sqlx::query(
                    r#"
                    DELETE FROM enrollment_sampler.reservations
                    WHERE id = (
                        SELECT id FROM enrollment_sampler.reservations
                        WHERE instance_id = $1 AND participant_id = $2 AND status = 'reserved'
                        ORDER BY reserved_at DESC
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    RETURNING id, participant_id, status, reserved_at
                    "#,
                )
                .bind(instance_id)
                .bind(participant_id)
                .fetch_optional(&self.pool),
            )
            .await?;

        match row {
            Some(row) => reservation_from_row(&row),
            None => Err(SamplerError::not_found("reserved slot", participant_id)),
        }
    }

    async fn expire_older_than(
        &self,
        instance_id: &str,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = self
            .bounded(
                sqlx::query(
                    r#"
                    DELETE FROM enrollment_sampler.reservations
                    WHERE instance_id = $1 AND status = 'reserved' AND reserved_at < $2
                    "#,
                )
                .bind(instance_id)
                .bind(now - retention)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EntryCodeStore for PgStore {
    async fn add_entry_code(&self, instance_id: &str, code: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = self
            .bounded(
                sqlx::query(
                    r#"
                    INSERT INTO enrollment_sampler.entry_codes (instance_id, code, uploaded_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (instance_id, code) DO NOTHING
                    "#,
                )
                .bind(instance_id)
                .bind(code)
                .bind(now)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_entry_code(&self, instance_id: &str, code: &str) -> Result<Option<EntryCode>> {
        let row = self
            .bounded(
                sqlx::query(
                    r#"
                    SELECT code, uploaded_at, used_at, used_by
                    FROM enrollment_sampler.entry_codes
                    WHERE instance_id = $1 AND code = $2
                    "#,
                )
                .bind(instance_id)
                .bind(code)
                .fetch_optional(&self.pool),
            )
            .await?;

        Ok(row.map(|row| EntryCode {
            code: row.get("code"),
            uploaded_at: row.get("uploaded_at"),
            used_at: row.get("used_at"),
            used_by: row.get("used_by"),
        }))
    }

    async fn mark_entry_code_used(
        &self,
        instance_id: &str,
        code: &str,
        used_by: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = self
            .bounded(
                sqlx::query(
                    r#"
                    UPDATE enrollment_sampler.entry_codes
                    SET used_at = $3, used_by = $4
                    WHERE instance_id = $1 AND code = $2 AND used_at IS NULL
                    "#,
                )
                .bind(instance_id)
                .bind(code)
                .bind(now)
                .bind(used_by)
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(SamplerError::not_found("unused entry code", code));
        }
        Ok(())
    }
}

/// Imports entry codes from a CSV with a `code` column. Codes are normalised
/// the same way participant input is.
pub async fn import_codes_csv(
    store: &dyn EntryCodeStore,
    instance_id: &str,
    csv_path: &Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        code: String,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let code = crate::entry_codes::normalize_code(&row.code);
        if code.is_empty() {
            continue;
        }
        if store.add_entry_code(instance_id, &code, Utc::now()).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}
