//! SQLite-backed progress store.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{CustomerTotals, ProgressSelection, ProgressStats, ProgressStore};
use crate::error::{MigrationError, Result};
use crate::failure::FailureHistogram;
use crate::types::{
    CustomerAssignment, CustomerCounters, CustomerProgress, ProgressStatus, SpaceProgress,
};

const SPACE_COLUMNS: &str = "customer, space, status, total_uploads, completed_uploads, \
     last_processed_upload, instance_id, worker_id, error, created_at, updated_at";

const CUSTOMER_COLUMNS: &str = "customer, status, total_spaces, completed_spaces, total_uploads, \
     completed_uploads, instance_id, filter, error, counters, assigned_at, updated_at, completed_at";

/// Progress store on a single SQLite database.
///
/// Thread-safe via an internal mutex on the connection.
pub struct SqliteProgressStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProgressStore {
    /// Open (or create) the store at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| MigrationError::Io {
                    message: format!("Failed to create progress directory: {}", e),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(|e| MigrationError::Database {
            message: format!("Failed to open progress database: {}", e),
            source: Some(e),
        })?;

        // WAL so the status command can read while a run writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| MigrationError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        Self::from_connection(conn)
    }

    /// In-memory store, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS customer_progress (
                customer TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                total_spaces INTEGER NOT NULL DEFAULT 0,
                completed_spaces INTEGER NOT NULL DEFAULT 0,
                total_uploads INTEGER NOT NULL DEFAULT 0,
                completed_uploads INTEGER NOT NULL DEFAULT 0,
                instance_id INTEGER NOT NULL,
                -- Cleared when a later plan no longer includes the customer
                assigned INTEGER NOT NULL DEFAULT 1,
                filter TEXT,
                error TEXT,
                counters TEXT,
                assigned_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_customer_instance
                ON customer_progress(assigned, instance_id);

            CREATE INDEX IF NOT EXISTS idx_customer_status
                ON customer_progress(status, updated_at);

            -- Spaces each customer owned when it was assigned
            CREATE TABLE IF NOT EXISTS customer_spaces (
                customer TEXT NOT NULL,
                space TEXT NOT NULL,
                PRIMARY KEY (customer, space)
            );

            CREATE TABLE IF NOT EXISTS space_progress (
                customer TEXT NOT NULL,
                space TEXT NOT NULL,
                status TEXT NOT NULL,
                total_uploads INTEGER NOT NULL DEFAULT 0,
                completed_uploads INTEGER NOT NULL DEFAULT 0,
                last_processed_upload TEXT,
                instance_id INTEGER,
                worker_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (customer, space)
            );

            CREATE INDEX IF NOT EXISTS idx_space_status
                ON space_progress(status, updated_at);
            "#,
        )
        .map_err(|e| MigrationError::Database {
            message: format!("Failed to initialize progress schema: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| MigrationError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })
    }

    fn select_spaces(
        conn: &Connection,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<SpaceProgress>> {
        let sql = format!(
            "SELECT {} FROM space_progress {} ORDER BY customer, space",
            SPACE_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, space_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn select_customers(
        conn: &Connection,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<CustomerProgress>> {
        let sql = format!(
            "SELECT {} FROM customer_progress {} ORDER BY customer",
            CUSTOMER_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, customer_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Upsert one customer's row and replace its space list. Status and
    /// counters of an existing row are kept.
    fn upsert_assignment(
        tx: &Transaction<'_>,
        assignment: &CustomerAssignment,
        filter: Option<&str>,
        now: &str,
    ) -> Result<()> {
        tx.execute(
            r#"
            INSERT INTO customer_progress
            (customer, status, total_spaces, total_uploads, instance_id, assigned, filter,
             counters, assigned_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?8)
            ON CONFLICT(customer) DO UPDATE SET
                instance_id = ?5,
                assigned = 1,
                total_spaces = ?3,
                total_uploads = ?4,
                filter = ?6,
                assigned_at = ?8,
                updated_at = ?8
            "#,
            params![
                assignment.customer,
                ProgressStatus::Pending.as_str(),
                assignment.spaces.len() as i64,
                assignment.upload_count as i64,
                i64::from(assignment.instance_id),
                filter,
                serde_json::to_string(&CustomerCounters::default())?,
                now
            ],
        )?;

        tx.execute(
            "DELETE FROM customer_spaces WHERE customer = ?1",
            params![assignment.customer],
        )?;
        let mut stmt =
            tx.prepare("INSERT OR IGNORE INTO customer_spaces (customer, space) VALUES (?1, ?2)")?;
        for space in &assignment.spaces {
            stmt.execute(params![assignment.customer, space])?;
        }
        Ok(())
    }

    fn finish_customer(
        &self,
        customer: &str,
        status: ProgressStatus,
        totals: &CustomerTotals,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = timestamp(Utc::now());
        let counters = serde_json::to_string(&totals.counters)?;
        let updated = conn.execute(
            r#"
            UPDATE customer_progress SET
                status = ?2,
                total_spaces = ?3,
                completed_spaces = ?4,
                total_uploads = ?5,
                completed_uploads = ?6,
                counters = ?7,
                error = ?8,
                updated_at = ?9,
                completed_at = ?10
            WHERE customer = ?1
            "#,
            params![
                customer,
                status.as_str(),
                totals.total_spaces as i64,
                totals.completed_spaces as i64,
                totals.total_uploads as i64,
                totals.completed_uploads as i64,
                counters,
                error,
                now,
                (status == ProgressStatus::Completed).then_some(&now)
            ],
        )?;
        if updated == 0 {
            return Err(MigrationError::NotFound {
                kind: "customer progress",
                id: customer.to_string(),
            });
        }
        debug!("Customer {} marked {}", customer, status);
        Ok(())
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed width so rows compare correctly as text
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn parse_status(text: &str) -> rusqlite::Result<ProgressStatus> {
    text.parse().map_err(|e: MigrationError| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    })
}

fn space_from_row(row: &Row<'_>) -> rusqlite::Result<SpaceProgress> {
    let status: String = row.get(2)?;
    let instance_id: Option<i64> = row.get(6)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(SpaceProgress {
        customer: row.get(0)?,
        space: row.get(1)?,
        status: parse_status(&status)?,
        total_uploads: row.get::<_, i64>(3)? as u64,
        completed_uploads: row.get::<_, i64>(4)? as u64,
        last_processed_upload: row.get(5)?,
        instance_id: instance_id.map(|id| id as u32),
        worker_id: row.get(7)?,
        error: row.get(8)?,
        created_at: parse_time(&created_at),
        updated_at: parse_time(&updated_at),
    })
}

fn customer_from_row(row: &Row<'_>) -> rusqlite::Result<CustomerProgress> {
    let status: String = row.get(1)?;
    let counters: Option<String> = row.get(9)?;
    let assigned_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    let completed_at: Option<String> = row.get(12)?;
    Ok(CustomerProgress {
        customer: row.get(0)?,
        status: parse_status(&status)?,
        total_spaces: row.get::<_, i64>(2)? as u64,
        completed_spaces: row.get::<_, i64>(3)? as u64,
        total_uploads: row.get::<_, i64>(4)? as u64,
        completed_uploads: row.get::<_, i64>(5)? as u64,
        instance_id: row.get::<_, i64>(6)? as u32,
        filter: row.get(7)?,
        error: row.get(8)?,
        counters: counters
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default(),
        assigned_at: parse_time(&assigned_at),
        updated_at: parse_time(&updated_at),
        completed_at: completed_at.as_deref().map(parse_time),
    })
}

impl ProgressStore for SqliteProgressStore {
    fn get_space_progress(&self, customer: &str, space: &str) -> Result<Option<SpaceProgress>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM space_progress WHERE customer = ?1 AND space = ?2",
            SPACE_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![customer, space], space_from_row)
            .optional()?;
        Ok(row)
    }

    fn create_space_progress(
        &self,
        customer: &str,
        space: &str,
        instance_id: Option<u32>,
        worker_id: &str,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let now = timestamp(Utc::now());
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO space_progress
            (customer, space, status, instance_id, worker_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![
                customer,
                space,
                ProgressStatus::Pending.as_str(),
                instance_id.map(i64::from),
                worker_id,
                now
            ],
        )?;
        Ok(inserted > 0)
    }

    fn mark_space_in_progress(
        &self,
        customer: &str,
        space: &str,
        instance_id: Option<u32>,
        worker_id: &str,
        restart: bool,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = timestamp(Utc::now());
        let sql = if restart {
            r#"
            UPDATE space_progress SET
                status = ?3, instance_id = ?4, worker_id = ?5, updated_at = ?6,
                completed_uploads = 0, total_uploads = 0,
                last_processed_upload = NULL, error = NULL
            WHERE customer = ?1 AND space = ?2
            "#
        } else {
            r#"
            UPDATE space_progress SET
                status = ?3, instance_id = ?4, worker_id = ?5, updated_at = ?6
            WHERE customer = ?1 AND space = ?2
            "#
        };
        conn.execute(
            sql,
            params![
                customer,
                space,
                ProgressStatus::InProgress.as_str(),
                instance_id.map(i64::from),
                worker_id,
                now
            ],
        )?;
        Ok(())
    }

    fn update_space_progress(
        &self,
        customer: &str,
        space: &str,
        completed_uploads: u64,
        last_processed_upload: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = timestamp(Utc::now());
        conn.execute(
            r#"
            UPDATE space_progress SET
                completed_uploads = MAX(completed_uploads, ?3),
                last_processed_upload = COALESCE(?4, last_processed_upload),
                updated_at = ?5
            WHERE customer = ?1 AND space = ?2
            "#,
            params![
                customer,
                space,
                completed_uploads as i64,
                last_processed_upload,
                now
            ],
        )?;
        debug!(
            "Checkpointed {}/{}: {} uploads",
            customer, space, completed_uploads
        );
        Ok(())
    }

    fn save_space_failures(&self, customer: &str, space: &str, histogram: &str) -> Result<()> {
        let conn = self.conn()?;
        let now = timestamp(Utc::now());
        conn.execute(
            "UPDATE space_progress SET error = ?3, updated_at = ?4 WHERE customer = ?1 AND space = ?2",
            params![customer, space, histogram, now],
        )?;
        Ok(())
    }

    fn mark_space_completed(&self, customer: &str, space: &str, total_uploads: u64) -> Result<()> {
        let conn = self.conn()?;
        let now = timestamp(Utc::now());
        conn.execute(
            r#"
            UPDATE space_progress SET
                status = ?3,
                total_uploads = ?4,
                completed_uploads = ?4,
                error = NULL,
                updated_at = ?5
            WHERE customer = ?1 AND space = ?2
            "#,
            params![
                customer,
                space,
                ProgressStatus::Completed.as_str(),
                total_uploads as i64,
                now
            ],
        )?;
        Ok(())
    }

    fn mark_space_failed(
        &self,
        customer: &str,
        space: &str,
        total_uploads: u64,
        completed_uploads: u64,
        error: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = timestamp(Utc::now());
        conn.execute(
            r#"
            UPDATE space_progress SET
                status = ?3,
                total_uploads = ?4,
                completed_uploads = MIN(MAX(completed_uploads, ?5), ?4),
                error = ?6,
                updated_at = ?7
            WHERE customer = ?1 AND space = ?2
            "#,
            params![
                customer,
                space,
                ProgressStatus::Failed.as_str(),
                total_uploads as i64,
                completed_uploads as i64,
                error,
                now
            ],
        )?;
        Ok(())
    }

    fn list_space_progress(&self, customer: &str) -> Result<Vec<SpaceProgress>> {
        let conn = self.conn()?;
        Self::select_spaces(&conn, "WHERE customer = ?1", &[&customer])
    }

    fn get_customer_progress(&self, customer: &str) -> Result<Option<CustomerProgress>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM customer_progress WHERE customer = ?1",
            CUSTOMER_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![customer], customer_from_row)
            .optional()?;
        Ok(row)
    }

    fn mark_customer_in_progress(&self, customer: &str) -> Result<()> {
        let conn = self.conn()?;
        let now = timestamp(Utc::now());
        conn.execute(
            "UPDATE customer_progress SET status = ?2, updated_at = ?3 WHERE customer = ?1",
            params![customer, ProgressStatus::InProgress.as_str(), now],
        )?;
        Ok(())
    }

    fn mark_customer_completed(&self, customer: &str, totals: &CustomerTotals) -> Result<()> {
        self.finish_customer(customer, ProgressStatus::Completed, totals, None)
    }

    fn mark_customer_failed(
        &self,
        customer: &str,
        totals: &CustomerTotals,
        error: &str,
    ) -> Result<()> {
        self.finish_customer(customer, ProgressStatus::Failed, totals, Some(error))
    }

    fn save_assignment(&self, assignment: &CustomerAssignment, filter: Option<&str>) -> Result<()> {
        let mut conn = self.conn()?;
        let now = timestamp(Utc::now());
        let tx = conn.transaction()?;
        Self::upsert_assignment(&tx, assignment, filter, &now)?;
        tx.commit()?;
        Ok(())
    }

    fn replace_assignments(
        &self,
        assignments: &[CustomerAssignment],
        filter: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let now = timestamp(Utc::now());
        let tx = conn.transaction()?;

        // Rows keep their status and counters; only index membership goes
        let superseded = tx.execute(
            "UPDATE customer_progress SET assigned = 0 WHERE assigned = 1",
            [],
        )?;
        tx.execute("DELETE FROM customer_spaces", [])?;
        for assignment in assignments {
            Self::upsert_assignment(&tx, assignment, filter, &now)?;
        }
        tx.commit()?;

        debug!(
            "Assignment index replaced: {} customers ({} previously assigned)",
            assignments.len(),
            superseded
        );
        Ok(())
    }

    fn assignments_for_instance(&self, instance_id: u32) -> Result<Vec<CustomerAssignment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT c.customer, c.total_uploads, s.space
            FROM customer_progress c
            LEFT JOIN customer_spaces s ON s.customer = c.customer
            WHERE c.instance_id = ?1 AND c.assigned = 1
            ORDER BY c.customer, s.space
            "#,
        )?;
        let rows = stmt
            .query_map(params![i64::from(instance_id)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut assignments: Vec<CustomerAssignment> = Vec::new();
        for (customer, uploads, space) in rows {
            if assignments.last().map(|a| a.customer.as_str()) != Some(customer.as_str()) {
                assignments.push(CustomerAssignment {
                    customer,
                    instance_id,
                    spaces: Vec::new(),
                    upload_count: uploads as u64,
                });
            }
            if let (Some(space), Some(current)) = (space, assignments.last_mut()) {
                current.spaces.push(space);
            }
        }
        Ok(assignments)
    }

    fn instance_of(&self, customer: &str) -> Result<Option<u32>> {
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT instance_id FROM customer_progress WHERE customer = ?1 AND assigned = 1",
                params![customer],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|id| id as u32))
    }

    fn get_failed_migrations(&self) -> Result<ProgressSelection> {
        let conn = self.conn()?;
        let failed = ProgressStatus::Failed.as_str();
        Ok(ProgressSelection {
            customers: Self::select_customers(&conn, "WHERE status = ?1", &[&failed])?,
            spaces: Self::select_spaces(&conn, "WHERE status = ?1", &[&failed])?,
        })
    }

    fn get_stuck_migrations(&self, staleness: Duration) -> Result<ProgressSelection> {
        let conn = self.conn()?;
        let cutoff = Utc::now() - chrono::Duration::from_std(staleness).unwrap_or_default();
        let cutoff = timestamp(cutoff);
        let in_progress = ProgressStatus::InProgress.as_str();
        let filter = "WHERE status = ?1 AND updated_at < ?2";
        Ok(ProgressSelection {
            customers: Self::select_customers(&conn, filter, &[&in_progress, &cutoff])?,
            spaces: Self::select_spaces(&conn, filter, &[&in_progress, &cutoff])?,
        })
    }

    fn scan_all_progress(&self) -> Result<ProgressStats> {
        let conn = self.conn()?;
        let mut stats = ProgressStats::default();

        for customer in Self::select_customers(&conn, "", &[])? {
            *stats
                .customers_by_status
                .entry(customer.status.to_string())
                .or_insert(0) += 1;
            stats.counters.absorb(&customer.counters);
        }

        for space in Self::select_spaces(&conn, "", &[])? {
            *stats
                .spaces_by_status
                .entry(space.status.to_string())
                .or_insert(0) += 1;
            stats.total_uploads += space.total_uploads;
            stats.completed_uploads += space.completed_uploads;
            if space.status == ProgressStatus::Failed {
                if let Some(hist) = space.error.as_deref().and_then(FailureHistogram::from_json) {
                    stats.failure_reasons.merge(&hist);
                }
            }
        }

        Ok(stats)
    }
}
