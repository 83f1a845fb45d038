//! Append-only hit and failure log.
//!
//! Reads are ordered by `(time, id)`; the autoincrement id breaks ties in
//! insertion order.

use chrono::{DateTime, Utc};
use rusqlite::{params, Result as SqlResult, Row};

use super::models::*;
use super::store::{format_db_time, parse_db_time, DbError, Store};

impl Store {
    /// Append a hit and return its row id.
    pub fn record_hit(&self, hit: &Hit) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO hits (service_id, time, latency_ns, ping_ns) VALUES (?1, ?2, ?3, ?4)",
            params![hit.service_id, format_db_time(hit.time), hit.latency_ns, hit.ping_ns],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a failure and return its row id.
    pub fn record_failure(&self, failure: &Failure) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO failures (service_id, time, kind, issue, status_code, snippet) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                failure.service_id,
                format_db_time(failure.time),
                failure.kind.as_str(),
                failure.issue,
                failure.status_code,
                failure.snippet,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Failures for a service, most recent first.
    ///
    /// `limit` of `None` returns everything past `offset`.
    pub fn get_failures(
        &self,
        service_id: i64,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Failure>, DbError> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, service_id, time, kind, issue, status_code, snippet FROM failures \
             WHERE service_id = ?1 ORDER BY time DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;

        let failures = stmt
            .query_map(params![service_id, limit, offset as i64], failure_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(failures)
    }

    /// Failures for a service within `[start, end)`, oldest first.
    pub fn get_failures_in_range(
        &self,
        service_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Failure>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, service_id, time, kind, issue, status_code, snippet FROM failures \
             WHERE service_id = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC, id ASC",
        )?;

        let failures = stmt
            .query_map(
                params![service_id, format_db_time(start), format_db_time(end)],
                failure_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(failures)
    }

    /// Hits for a service within `[start, end)`, oldest first.
    pub fn get_hits_in_range(
        &self,
        service_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Hit>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, service_id, time, latency_ns, ping_ns FROM hits \
             WHERE service_id = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC, id ASC",
        )?;

        let hits = stmt
            .query_map(
                params![service_id, format_db_time(start), format_db_time(end)],
                hit_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(hits)
    }

    /// Number of failures ever recorded for a service.
    pub fn count_failures(&self, service_id: i64) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM failures WHERE service_id = ?1",
            params![service_id],
            |r| r.get(0),
        )?)
    }

    /// Hit and failure counts for a service within `[start, end)`.
    pub fn count_events_in_range(
        &self,
        service_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<EventStats, DbError> {
        let (start, end) = (format_db_time(start), format_db_time(end));
        let conn = self.conn()?;
        let hits = conn.query_row(
            "SELECT COUNT(*) FROM hits WHERE service_id = ?1 AND time >= ?2 AND time < ?3",
            params![service_id, start, end],
            |r| r.get(0),
        )?;
        let failures = conn.query_row(
            "SELECT COUNT(*) FROM failures WHERE service_id = ?1 AND time >= ?2 AND time < ?3",
            params![service_id, start, end],
            |r| r.get(0),
        )?;
        Ok(EventStats { hits, failures })
    }

    /// Purge every failure of one service. Returns the number removed.
    pub fn delete_failures(&self, service_id: i64) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM failures WHERE service_id = ?1", params![service_id])?)
    }

    /// Purge hits and failures of all services older than `cutoff`.
    pub fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<EventStats, DbError> {
        let cutoff = format_db_time(cutoff);
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let hits = tx.execute("DELETE FROM hits WHERE time < ?1", params![cutoff])?;
        let failures = tx.execute("DELETE FROM failures WHERE time < ?1", params![cutoff])?;
        tx.commit()?;
        Ok(EventStats {
            hits: hits as i64,
            failures: failures as i64,
        })
    }

    /// Total rows in the event log.
    pub fn get_event_stats(&self) -> Result<EventStats, DbError> {
        let conn = self.conn()?;
        let hits = conn.query_row("SELECT COUNT(*) FROM hits", [], |r| r.get(0))?;
        let failures = conn.query_row("SELECT COUNT(*) FROM failures", [], |r| r.get(0))?;
        Ok(EventStats { hits, failures })
    }
}

fn hit_from_row(row: &Row<'_>) -> SqlResult<Hit> {
    let time: String = row.get(2)?;
    Ok(Hit {
        id: row.get(0)?,
        service_id: row.get(1)?,
        time: parse_db_time(&time).unwrap_or_else(Utc::now),
        latency_ns: row.get(3)?,
        ping_ns: row.get(4)?,
    })
}

fn failure_from_row(row: &Row<'_>) -> SqlResult<Failure> {
    let time: String = row.get(2)?;
    let kind: String = row.get(3)?;
    Ok(Failure {
        id: row.get(0)?,
        service_id: row.get(1)?,
        time: parse_db_time(&time).unwrap_or_else(Utc::now),
        kind: FailureKind::parse(&kind),
        issue: row.get(4)?,
        status_code: row.get(5)?,
        snippet: row.get(6)?,
    })
}
