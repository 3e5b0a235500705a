//! The fixed statement vocabulary issued against the `data` table.
//!
//! Every statement goes through rusqlite's prepared-statement cache, so each one
//! is compiled once per connection and reused afterwards. All point operations
//! look rows up by `id`; sweeps and LRU ordering go through the `expires_at` and
//! `last_used` indexes.

use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, Connection, OptionalExtension};

use super::value::{Entry, Value};
use crate::Error;

/// Unconditional upsert. `last_used` never moves backwards.
const SETTER: &str = "INSERT INTO data (id, value, expires_at, last_used) VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(id) DO UPDATE SET
        value = excluded.value,
        expires_at = excluded.expires_at,
        last_used = max(data.last_used, excluded.last_used)";

/// Upsert that only applies when the existing row is already expired.
const INSERTER: &str = "INSERT INTO data (id, value, expires_at, last_used) VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(id) DO UPDATE SET
        value = excluded.value,
        expires_at = excluded.expires_at,
        last_used = max(data.last_used, excluded.last_used)
    WHERE data.expires_at <= ?4";

const GETTER: &str = "SELECT id, value, expires_at, last_used FROM data WHERE id = ?1 AND expires_at > ?2";

const DELETER: &str = "DELETE FROM data WHERE id = ?1 RETURNING expires_at";

/// Increment by delta. An expired row restarts from the delta.
const COUNTER: &str = "INSERT INTO data (id, value, expires_at, last_used) VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(id) DO UPDATE SET
        value = CASE
            WHEN data.expires_at <= excluded.last_used THEN excluded.value
            ELSE CAST(data.value AS INTEGER) + excluded.value
        END,
        expires_at = excluded.expires_at,
        last_used = max(data.last_used, excluded.last_used)
    RETURNING value";

const COUNT: &str = "SELECT count(*) FROM data";

const SIZE: &str = "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()";

const EXPIRED_PRUNER: &str = "DELETE FROM data WHERE expires_at <= ?1";

const LRU_PRUNER: &str = "DELETE FROM data WHERE id IN (SELECT id FROM data ORDER BY last_used ASC LIMIT ?1)";

const TOUCHER: &str = "UPDATE data SET last_used = ?2 WHERE id = ?1 AND last_used < ?2";

const CLEARER: &str = "DELETE FROM data";

/// Current time as unix epoch seconds with microsecond precision.
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub fn set(conn: &Connection, key: &str, value: &Value, expires_at: f64, now: f64) -> Result<(), Error> {
    conn.prepare_cached(SETTER)?.execute(params![key, value, expires_at, now])?;
    Ok(())
}

/// Returns whether the row was written.
pub fn insert(conn: &Connection, key: &str, value: &Value, expires_at: f64, now: f64) -> Result<bool, Error> {
    let changed = conn.prepare_cached(INSERTER)?.execute(params![key, value, expires_at, now])?;
    Ok(changed > 0)
}

/// Live row for `key`, if any.
pub fn get(conn: &Connection, key: &str, now: f64) -> Result<Option<Entry>, Error> {
    let entry = conn.prepare_cached(GETTER)?.query_row(params![key, now], Entry::from_row).optional()?;
    Ok(entry)
}

/// Removes the row; returns whether a live row was removed.
pub fn delete(conn: &Connection, key: &str, now: f64) -> Result<bool, Error> {
    let expires_at: Option<f64> =
        conn.prepare_cached(DELETER)?.query_row(params![key], |row| row.get(0)).optional()?;
    Ok(expires_at.is_some_and(|at| at > now))
}

/// Adds `amount` to the integer stored at `key`, creating it when absent or expired.
///
/// Must run inside a transaction so the numeric check and the write agree.
pub fn increment(conn: &Connection, key: &str, amount: i64, expires_at: f64, now: f64) -> Result<i64, Error> {
    let current = get(conn, key, now)?;
    if current.is_some_and(|entry| entry.value.as_i64().is_none()) {
        return Err(Error::NotNumeric(key.to_string()));
    }

    let value: Value = conn
        .prepare_cached(COUNTER)?
        .query_row(params![key, amount, expires_at, now], |row| row.get(0))?;
    value.as_i64().ok_or_else(|| Error::NotNumeric(key.to_string()))
}

/// Number of rows, expired-but-unswept included.
pub fn count(conn: &Connection) -> Result<u64, Error> {
    let count: i64 = conn.prepare_cached(COUNT)?.query_row([], |row| row.get(0))?;
    Ok(count as u64)
}

/// Physical size of the main database in bytes.
pub fn size(conn: &Connection) -> Result<u64, Error> {
    let size: i64 = conn.prepare_cached(SIZE)?.query_row([], |row| row.get(0))?;
    Ok(size as u64)
}

/// Deletes every row whose expiry is at or before `now`.
pub fn prune_expired(conn: &Connection, now: f64) -> Result<u64, Error> {
    let deleted = conn.prepare_cached(EXPIRED_PRUNER)?.execute(params![now])?;
    Ok(deleted as u64)
}

/// Deletes the `limit` least recently used rows.
pub fn prune_oldest(conn: &Connection, limit: u64) -> Result<u64, Error> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let deleted = conn.prepare_cached(LRU_PRUNER)?.execute(params![limit])?;
    Ok(deleted as u64)
}

/// Deletes `fraction` of all rows, least recently used first.
///
/// Rounds to the nearest row but removes at least one while any rows exist.
pub fn prune_fraction(conn: &Connection, fraction: f64) -> Result<u64, Error> {
    let total = count(conn)?;
    if total == 0 || fraction <= 0.0 {
        return Ok(0);
    }
    let limit = ((total as f64 * fraction).round() as u64).clamp(1, total);
    prune_oldest(conn, limit)
}

/// Raises `last_used` for `key` to `at`; a missing key is a no-op.
pub fn touch(conn: &Connection, key: &str, at: f64) -> Result<bool, Error> {
    let changed = conn.prepare_cached(TOUCHER)?.execute(params![key, at])?;
    Ok(changed > 0)
}

pub fn clear(conn: &Connection) -> Result<u64, Error> {
    let deleted = conn.prepare_cached(CLEARER)?.execute([])?;
    Ok(deleted as u64)
}

/// Returns free pages to the filesystem.
pub fn compact(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch("PRAGMA incremental_vacuum;")?;
    Ok(())
}

/// Begin an immediate transaction, taking the write lock up front.
pub fn immediate(conn: &mut Connection) -> Result<rusqlite::Transaction<'_>, Error> {
    Ok(conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?)
}
