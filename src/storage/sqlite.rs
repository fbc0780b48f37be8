use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::core::error::{ComplianceError, ComplianceResult};
use crate::models::{FailureKind, Invoice, InvoiceStatus, Operation, QueueEntry, QueueStatus};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS invoices (
        uuid          TEXT PRIMARY KEY,
        chain_id      TEXT NOT NULL,
        icv           INTEGER NOT NULL,
        content_hash  TEXT NOT NULL,
        status        TEXT NOT NULL,
        cleared_xml   TEXT,
        body          TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        UNIQUE (chain_id, icv)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS offline_queue (
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        id               TEXT NOT NULL UNIQUE,
        invoice_uuid     TEXT NOT NULL,
        operation        TEXT NOT NULL,
        status           TEXT NOT NULL,
        attempts         INTEGER NOT NULL,
        next_retry_at    TEXT NOT NULL,
        last_error       TEXT,
        failure          TEXT,
        reference        TEXT,
        enqueued_at      TEXT NOT NULL,
        last_attempt_at  TEXT,
        completed_at     TEXT,
        invoice          TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_offline_queue_status ON offline_queue (status, seq)",
];

/// Durable store for issued invoices and the offline queue.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> ComplianceResult<Self> {
        info!("Opening invoice store");

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Single-connection in-memory store; every connection to
    /// `sqlite::memory:` would otherwise be a separate database.
    pub async fn in_memory() -> ComplianceResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> ComplianceResult<Self> {
        let store = Store { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> ComplianceResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    // ---------------------------------------------------------------------
    // Invoices
    // ---------------------------------------------------------------------

    #[instrument(skip(self, invoice), fields(uuid = %invoice.uuid(), icv = invoice.icv))]
    pub async fn insert_invoice(&self, chain_id: &str, invoice: &Invoice) -> ComplianceResult<()> {
        let body = serde_json::to_string(invoice)?;

        sqlx::query(
            r#"
            INSERT INTO invoices (uuid, chain_id, icv, content_hash, status, body, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(invoice.uuid().to_string())
        .bind(chain_id)
        .bind(icv_to_db(invoice.icv)?)
        .bind(invoice.content_hash.to_hex())
        .bind(invoice.status.to_string())
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => ComplianceError::ChainIntegrity(
                format!("invoice {} or ICV {} is already recorded", invoice.uuid(), invoice.icv),
            ),
            other => other.into(),
        })?;

        debug!("Invoice stored");
        Ok(())
    }

    pub async fn update_invoice_status(&self, uuid: Uuid, status: InvoiceStatus) -> ComplianceResult<()> {
        sqlx::query("UPDATE invoices SET status = ?1 WHERE uuid = ?2")
            .bind(status.to_string())
            .bind(uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Keeps the authority-stamped document of a cleared invoice.
    pub async fn set_cleared_xml(&self, uuid: Uuid, cleared_xml: &str) -> ComplianceResult<()> {
        sqlx::query("UPDATE invoices SET cleared_xml = ?1 WHERE uuid = ?2")
            .bind(cleared_xml)
            .bind(uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_invoice(&self, uuid: Uuid) -> ComplianceResult<Option<Invoice>> {
        let row = sqlx::query("SELECT status, cleared_xml, body FROM invoices WHERE uuid = ?1")
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(invoice_from_row).transpose()
    }

    /// Every invoice of a chain, ordered by ICV.
    pub async fn chain_invoices(&self, chain_id: &str) -> ComplianceResult<Vec<Invoice>> {
        let rows = sqlx::query("SELECT status, cleared_xml, body FROM invoices WHERE chain_id = ?1 ORDER BY icv ASC")
            .bind(chain_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(invoice_from_row).collect()
    }

    /// Invoices still `signed` with no queue entry, i.e. issued but never
    /// handed to the authority or the queue.
    pub async fn unsubmitted_invoices(&self, chain_id: &str) -> ComplianceResult<Vec<Invoice>> {
        let rows = sqlx::query(
            r#"
            SELECT i.status, i.cleared_xml, i.body
            FROM invoices i
            LEFT JOIN offline_queue q ON q.invoice_uuid = i.uuid
            WHERE i.chain_id = ?1 AND i.status = ?2 AND q.id IS NULL
            ORDER BY i.icv ASC
            "#,
        )
        .bind(chain_id)
        .bind(InvoiceStatus::Signed.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(invoice_from_row).collect()
    }

    // ---------------------------------------------------------------------
    // Offline queue
    // ---------------------------------------------------------------------

    /// Persists a new entry and assigns its `seq`.
    #[instrument(skip(self, entry), fields(entry_id = %entry.id, uuid = %entry.invoice.uuid()))]
    pub async fn insert_entry(&self, entry: &mut QueueEntry) -> ComplianceResult<()> {
        let invoice = serde_json::to_string(&entry.invoice)?;

        let result = sqlx::query(
            r#"
            INSERT INTO offline_queue
                (id, invoice_uuid, operation, status, attempts, next_retry_at, last_error,
                 failure, reference, enqueued_at, last_attempt_at, completed_at, invoice)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.invoice.uuid().to_string())
        .bind(entry.operation.as_str())
        .bind(entry.status.as_str())
        .bind(i64::from(entry.attempts))
        .bind(entry.next_retry_at)
        .bind(&entry.last_error)
        .bind(entry.failure.map(|f| f.as_str()))
        .bind(&entry.reference)
        .bind(entry.enqueued_at)
        .bind(entry.last_attempt_at)
        .bind(entry.completed_at)
        .bind(invoice)
        .execute(&self.pool)
        .await?;

        entry.seq = result.last_insert_rowid();
        Ok(())
    }

    /// Writes back the entry, including its invoice snapshot.
    pub async fn update_entry(&self, entry: &QueueEntry) -> ComplianceResult<()> {
        let invoice = serde_json::to_string(&entry.invoice)?;

        let result = sqlx::query(
            r#"
            UPDATE offline_queue
            SET status = ?1, attempts = ?2, next_retry_at = ?3, last_error = ?4, failure = ?5,
                reference = ?6, last_attempt_at = ?7, completed_at = ?8, invoice = ?9
            WHERE id = ?10
            "#,
        )
        .bind(entry.status.as_str())
        .bind(i64::from(entry.attempts))
        .bind(entry.next_retry_at)
        .bind(&entry.last_error)
        .bind(entry.failure.map(|f| f.as_str()))
        .bind(&entry.reference)
        .bind(entry.last_attempt_at)
        .bind(entry.completed_at)
        .bind(invoice)
        .bind(entry.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ComplianceError::QueueEntry {
                id: entry.id,
                message: "entry no longer exists".to_string(),
            });
        }
        Ok(())
    }

    pub async fn get_entry(&self, id: Uuid) -> ComplianceResult<Option<QueueEntry>> {
        let row = sqlx::query("SELECT * FROM offline_queue WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// Pending and processing entries in enqueue order.
    pub async fn active_entries(&self) -> ComplianceResult<Vec<QueueEntry>> {
        let rows = sqlx::query("SELECT * FROM offline_queue WHERE status IN (?1, ?2) ORDER BY seq ASC")
            .bind(QueueStatus::Pending.as_str())
            .bind(QueueStatus::Processing.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn all_entries(&self) -> ComplianceResult<Vec<QueueEntry>> {
        let rows = sqlx::query("SELECT * FROM offline_queue ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn delete_entry(&self, id: Uuid) -> ComplianceResult<bool> {
        let result = sqlx::query("DELETE FROM offline_queue WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns entries a crash left `processing` to `pending`.
    pub async fn reset_in_flight(&self) -> ComplianceResult<u64> {
        let result = sqlx::query("UPDATE offline_queue SET status = ?1 WHERE status = ?2")
            .bind(QueueStatus::Pending.as_str())
            .bind(QueueStatus::Processing.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> ComplianceResult<u64> {
        let result = sqlx::query("DELETE FROM offline_queue WHERE status = ?1 AND completed_at < ?2")
            .bind(QueueStatus::Completed.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn icv_to_db(icv: u64) -> ComplianceResult<i64> {
    i64::try_from(icv).map_err(|_| ComplianceError::Storage(format!("ICV {} does not fit the store", icv)))
}

fn parse_column<T: FromStr<Err = String>>(value: &str) -> ComplianceResult<T> {
    value.parse().map_err(ComplianceError::Storage)
}

fn parse_status(value: &str) -> ComplianceResult<InvoiceStatus> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| ComplianceError::Storage(format!("unknown invoice status `{}`", value)))
}

fn invoice_from_row(row: &SqliteRow) -> ComplianceResult<Invoice> {
    let status: String = row.try_get("status")?;
    let cleared_xml: Option<String> = row.try_get("cleared_xml")?;
    let body: String = row.try_get("body")?;

    let mut invoice: Invoice = serde_json::from_str(&body)?;
    invoice.status = parse_status(&status)?;
    invoice.cleared_xml = cleared_xml;
    Ok(invoice)
}

fn entry_from_row(row: &SqliteRow) -> ComplianceResult<QueueEntry> {
    let id: String = row.try_get("id")?;
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    let failure: Option<String> = row.try_get("failure")?;
    let invoice: String = row.try_get("invoice")?;

    Ok(QueueEntry {
        id: Uuid::parse_str(&id).map_err(|e| ComplianceError::Storage(e.to_string()))?,
        seq: row.try_get("seq")?,
        invoice: serde_json::from_str(&invoice)?,
        operation: parse_column::<Operation>(&operation)?,
        status: parse_column::<QueueStatus>(&status)?,
        attempts: u32::try_from(attempts).map_err(|e| ComplianceError::Storage(e.to_string()))?,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        failure: failure.as_deref().map(parse_column::<FailureKind>).transpose()?,
        reference: row.try_get("reference")?,
        enqueued_at: row.try_get("enqueued_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
