//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Format used for every stored timestamp. Lexicographic order equals time order.
pub(crate) const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const SERVICE_COLUMNS: &str = "id, name, address, probe_type, port, method, post_data, expected, \
     expected_status, check_interval, timeout, public, order_id, enabled, notify, created_at, group_id";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
///
/// A single connection behind a mutex: writers are serialized, which keeps
/// the autoincrement id a faithful insertion-order tie-break for events.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Service CRUD ---

    /// Add a new service and return its ID.
    pub fn add_service(&self, service: &mut Service) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO services (name, address, probe_type, port, method, post_data, expected, \
             expected_status, check_interval, timeout, public, order_id, enabled, notify, created_at, group_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                service.name,
                service.address,
                service.probe_type.as_str(),
                service.port,
                service.method,
                service.post_data,
                service.expected,
                service.expected_status,
                service.check_interval,
                service.timeout,
                service.public,
                service.order_id,
                service.enabled,
                service.notify,
                format_db_time(service.created_at),
                service.group_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        service.id = id;
        Ok(id)
    }

    /// Update an existing service.
    pub fn update_service(&self, service: &Service) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE services SET name=?1, address=?2, probe_type=?3, port=?4, method=?5, post_data=?6, \
             expected=?7, expected_status=?8, check_interval=?9, timeout=?10, public=?11, order_id=?12, \
             enabled=?13, notify=?14, group_id=?15 WHERE id=?16",
            params![
                service.name,
                service.address,
                service.probe_type.as_str(),
                service.port,
                service.method,
                service.post_data,
                service.expected,
                service.expected_status,
                service.check_interval,
                service.timeout,
                service.public,
                service.order_id,
                service.enabled,
                service.notify,
                service.group_id,
                service.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all services in display order.
    pub fn get_services(&self) -> Result<Vec<Service>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services ORDER BY order_id ASC, id ASC",
            SERVICE_COLUMNS
        ))?;

        let services = stmt
            .query_map([], service_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(services)
    }

    /// Get a service by ID.
    pub fn get_service(&self, id: i64) -> Result<Service, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM services WHERE id = ?1", SERVICE_COLUMNS),
            params![id],
            service_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a service and its recorded events.
    pub fn delete_service(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM hits WHERE service_id = ?1", params![id])?;
        tx.execute("DELETE FROM failures WHERE service_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM services WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(DbError::NotFound);
        }
        tx.commit()?;
        Ok(())
    }

    /// Reassign display order for several services at once.
    ///
    /// Either every listed service is updated or none is.
    pub fn reorder_services(&self, orders: &[(i64, i64)]) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare("UPDATE services SET order_id = ?1 WHERE id = ?2")?;
            for (service_id, order) in orders {
                if stmt.execute(params![order, service_id])? == 0 {
                    return Err(DbError::NotFound);
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    // --- Notifiers ---

    /// Get all stored notifier configurations, ordered by priority.
    pub fn get_notifiers(&self) -> Result<Vec<NotifierConfig>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT method, enabled, priority, fields, updated_at FROM notifiers \
             ORDER BY priority ASC, method ASC",
        )?;

        let notifiers = stmt
            .query_map([], notifier_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(notifiers)
    }

    /// Get the stored configuration for one notifier method.
    pub fn get_notifier(&self, method: &str) -> Result<Option<NotifierConfig>, DbError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT method, enabled, priority, fields, updated_at FROM notifiers WHERE method = ?1",
                params![method],
                notifier_from_row,
            )
            .optional()?)
    }

    /// Insert or replace a notifier configuration.
    pub fn save_notifier(&self, notifier: &NotifierConfig) -> Result<(), DbError> {
        let fields = serde_json::to_string(&notifier.fields)
            .map_err(|e| DbError::Migration(format!("cannot encode notifier fields: {}", e)))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notifiers (method, enabled, priority, fields, updated_at) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(method) DO UPDATE SET enabled=excluded.enabled, priority=excluded.priority, \
             fields=excluded.fields, updated_at=excluded.updated_at",
            params![
                notifier.method,
                notifier.enabled,
                notifier.priority,
                fields,
                format_db_time(notifier.updated_at),
            ],
        )?;
        Ok(())
    }
}

fn service_from_row(row: &Row<'_>) -> SqlResult<Service> {
    let probe_type: String = row.get(3)?;
    let created_at: String = row.get(15)?;
    Ok(Service {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        probe_type: probe_type.parse().unwrap_or(ProbeType::Http),
        port: row.get(4)?,
        method: row.get(5)?,
        post_data: row.get(6)?,
        expected: row.get(7)?,
        expected_status: row.get(8)?,
        check_interval: row.get(9)?,
        timeout: row.get(10)?,
        public: row.get(11)?,
        order_id: row.get(12)?,
        enabled: row.get(13)?,
        notify: row.get(14)?,
        created_at: parse_db_time(&created_at).unwrap_or_else(Utc::now),
        group_id: row.get(16)?,
    })
}

fn notifier_from_row(row: &Row<'_>) -> SqlResult<NotifierConfig> {
    let fields: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(NotifierConfig {
        method: row.get(0)?,
        enabled: row.get(1)?,
        priority: row.get(2)?,
        fields: serde_json::from_str::<BTreeMap<String, String>>(&fields).unwrap_or_default(),
        updated_at: parse_db_time(&updated_at).unwrap_or_else(Utc::now),
    })
}

pub(crate) fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
