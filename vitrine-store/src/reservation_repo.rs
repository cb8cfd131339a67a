use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;
use vitrine_core::{CasOutcome, ReservationStore, StoreError};
use vitrine_shared::{Masked, ProductReservation, ReservationStatus};

/// Postgres-backed store. One row per product; conditional writes compare
/// `(id, revision)` in the `WHERE` clause so the database arbitrates races.
pub struct PgReservationStore {
    pool: PgPool,
}

impl PgReservationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Short acquire timeout: a saturated pool reports `Unavailable`.
    pub async fn connect(connection_string: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Reservation schema is up to date");
        Ok(())
    }

    async fn fetch(&self, product_id: &str) -> Result<Option<ProductReservation>, StoreError> {
        let row = sqlx::query_as::<_, ReservationRow>(
            r#"
            SELECT product_id, id, revision, holder_user_id, holder_name, holder_email,
                   reserved_at, expires_at, status
            FROM product_reservations
            WHERE product_id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.map(ReservationRow::into_record).transpose()
    }

    async fn conflict(&self, product_id: &str) -> Result<CasOutcome, StoreError> {
        Ok(CasOutcome::Conflict {
            current: self.fetch(product_id).await?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReservationRow {
    product_id: String,
    id: Uuid,
    revision: i64,
    holder_user_id: String,
    holder_name: String,
    holder_email: String,
    reserved_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    status: String,
}

impl ReservationRow {
    fn into_record(self) -> Result<ProductReservation, StoreError> {
        let status = ReservationStatus::parse(&self.status).ok_or_else(|| StoreError::Corrupt {
            product_id: self.product_id.clone(),
            reason: format!("unknown status {:?}", self.status),
        })?;
        let revision = u64::try_from(self.revision).map_err(|_| StoreError::Corrupt {
            product_id: self.product_id.clone(),
            reason: format!("negative revision {}", self.revision),
        })?;

        Ok(ProductReservation {
            id: self.id,
            product_id: self.product_id,
            holder_user_id: self.holder_user_id,
            holder_name: self.holder_name,
            holder_email: Masked::new(self.holder_email),
            reserved_at: self.reserved_at,
            expires_at: self.expires_at,
            status,
            revision,
        })
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn db_revision(record: &ProductReservation) -> Result<i64, StoreError> {
    i64::try_from(record.revision).map_err(|_| StoreError::Corrupt {
        product_id: record.product_id.clone(),
        reason: format!("revision {} out of range", record.revision),
    })
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    async fn get(&self, product_id: &str) -> Result<Option<ProductReservation>, StoreError> {
        self.fetch(product_id).await
    }

    async fn conditional_put(
        &self,
        product_id: &str,
        record: &ProductReservation,
        expected: Option<&ProductReservation>,
    ) -> Result<CasOutcome, StoreError> {
        let revision = db_revision(record)?;

        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO product_reservations
                        (product_id, id, revision, holder_user_id, holder_name, holder_email,
                         reserved_at, expires_at, status)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (product_id) DO NOTHING
                    "#,
                )
                .bind(product_id)
                .bind(record.id)
                .bind(revision)
                .bind(&record.holder_user_id)
                .bind(&record.holder_name)
                .bind(record.holder_email.expose())
                .bind(record.reserved_at)
                .bind(record.expires_at)
                .bind(record.status.as_str())
                .execute(&self.pool)
                .await
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE product_reservations
                    SET id = $2, revision = $3, holder_user_id = $4, holder_name = $5,
                        holder_email = $6, reserved_at = $7, expires_at = $8, status = $9
                    WHERE product_id = $1 AND id = $10 AND revision = $11
                    "#,
                )
                .bind(product_id)
                .bind(record.id)
                .bind(revision)
                .bind(&record.holder_user_id)
                .bind(&record.holder_name)
                .bind(record.holder_email.expose())
                .bind(record.reserved_at)
                .bind(record.expires_at)
                .bind(record.status.as_str())
                .bind(expected.id)
                .bind(db_revision(expected)?)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(unavailable)?;

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Applied)
        } else {
            self.conflict(product_id).await
        }
    }

    async fn conditional_delete(
        &self,
        product_id: &str,
        expected: &ProductReservation,
    ) -> Result<CasOutcome, StoreError> {
        let result = sqlx::query(
            "DELETE FROM product_reservations WHERE product_id = $1 AND id = $2 AND revision = $3",
        )
        .bind(product_id)
        .bind(expected.id)
        .bind(db_revision(expected)?)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Applied)
        } else {
            self.conflict(product_id).await
        }
    }

    async fn list_active(&self) -> Result<Vec<ProductReservation>, StoreError> {
        let rows = sqlx::query_as::<_, ReservationRow>(
            r#"
            SELECT product_id, id, revision, holder_user_id, holder_name, holder_email,
                   reserved_at, expires_at, status
            FROM product_reservations
            WHERE status = 'active'
            ORDER BY expires_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.into_iter().map(ReservationRow::into_record).collect()
    }
}
