//! SQLite database for durable registry state
//!
//! Sites and their audit events live in a single SQLite file opened in WAL
//! mode. Every mutation runs inside `BEGIN IMMEDIATE`, which takes the
//! database write lock before anything is read, so concurrent processes
//! sharing the file serialise their read-compute-write sections.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::site::{Site, SiteAction, SiteEvent, SiteState};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const SITE_COLUMNS: &str = "domain, port, state, created_at, activated_at, removed_at";

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory database")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&tx)?;
            }

            if current_version < 2 {
                migrate_v2(&tx)?;
            }
        }

        tx.commit().context("Failed to commit migrations")?;
        Ok(())
    }

    /// Run `f` inside an immediate write transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`; any error (or a
    /// crash before commit) leaves the database untouched.
    pub fn write<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run a read-only closure against the connection
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

/// Migration v1: sites
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying migration v1: sites");

    conn.execute_batch(r#"
        -- One row per registration; removed rows are kept as history
        CREATE TABLE IF NOT EXISTS sites (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain TEXT NOT NULL,
            port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
            state TEXT NOT NULL DEFAULT 'pending'
                CHECK (state IN ('pending', 'active', 'removed')),
            created_at TEXT NOT NULL,
            activated_at TEXT,
            removed_at TEXT
        );

        -- At most one live site per domain, and per port
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sites_live_domain
            ON sites(domain) WHERE state != 'removed';
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sites_live_port
            ON sites(port) WHERE state != 'removed';

        CREATE INDEX IF NOT EXISTS idx_sites_domain ON sites(domain, id);

        INSERT INTO schema_migrations (version) VALUES (1);
    "#)?;

    Ok(())
}

/// Migration v2: audit events
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Applying migration v2: site events");

    conn.execute_batch(r#"
        CREATE TABLE IF NOT EXISTS site_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain TEXT NOT NULL,
            action TEXT NOT NULL,
            port INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_site_events_domain ON site_events(domain, id);

        INSERT INTO schema_migrations (version) VALUES (2);
    "#)?;

    Ok(())
}

// ==================== Column Types ====================

impl ToSql for SiteState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SiteState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for SiteAction {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SiteAction {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

// ==================== Site Queries ====================

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        domain: row.get(0)?,
        port: row.get(1)?,
        state: row.get(2)?,
        created_at: row.get(3)?,
        activated_at: row.get(4)?,
        removed_at: row.get(5)?,
    })
}

/// The pending or active site for a domain
pub fn live_site(conn: &Connection, domain: &str) -> rusqlite::Result<Option<Site>> {
    conn.query_row(
        &format!("SELECT {SITE_COLUMNS} FROM sites WHERE domain = ?1 AND state != 'removed'"),
        params![domain],
        site_from_row,
    )
    .optional()
}

/// The most recent row for a domain, whatever its state
pub fn latest_site(conn: &Connection, domain: &str) -> rusqlite::Result<Option<Site>> {
    conn.query_row(
        &format!("SELECT {SITE_COLUMNS} FROM sites WHERE domain = ?1 ORDER BY id DESC LIMIT 1"),
        params![domain],
        site_from_row,
    )
    .optional()
}

/// Ports held by live sites within `[floor, ceiling]`, ascending
pub fn held_ports(conn: &Connection, floor: u16, ceiling: u16) -> rusqlite::Result<Vec<u16>> {
    let mut stmt = conn.prepare(
        "SELECT port FROM sites
         WHERE state != 'removed' AND port BETWEEN ?1 AND ?2
         ORDER BY port",
    )?;

    let ports = stmt
        .query_map(params![floor, ceiling], |row| row.get(0))?
        .collect::<Result<Vec<u16>, _>>()?;

    Ok(ports)
}

/// Insert a new pending site
pub fn insert_site(conn: &Connection, domain: &str, port: u16, created_at: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sites (domain, port, state, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![domain, port, SiteState::Pending, created_at],
    )?;
    Ok(())
}

/// Move the pending site of a domain to active; returns whether a row changed
pub fn mark_active(conn: &Connection, domain: &str, at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let rows = conn.execute(
        "UPDATE sites SET state = 'active', activated_at = ?1
         WHERE domain = ?2 AND state = 'pending'",
        params![at, domain],
    )?;
    Ok(rows > 0)
}

/// Move the live site of a domain to removed; returns whether a row changed
pub fn mark_removed(conn: &Connection, domain: &str, at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let rows = conn.execute(
        "UPDATE sites SET state = 'removed', removed_at = ?1
         WHERE domain = ?2 AND state != 'removed'",
        params![at, domain],
    )?;
    Ok(rows > 0)
}

/// Sites in any of the given states, ordered by domain
pub fn sites_in_states(conn: &Connection, states: &[SiteState]) -> rusqlite::Result<Vec<Site>> {
    let placeholders: Vec<String> = (1..=states.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT {SITE_COLUMNS} FROM sites WHERE state IN ({}) ORDER BY domain, id",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let sites = stmt
        .query_map(rusqlite::params_from_iter(states.iter()), site_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(sites)
}

// ==================== Audit Events ====================

/// Append an audit event
pub fn insert_event(
    conn: &Connection,
    domain: &str,
    action: SiteAction,
    port: u16,
    at: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO site_events (domain, action, port, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![domain, action, port, at],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Audit events for a domain, oldest first
pub fn events_for(conn: &Connection, domain: &str) -> rusqlite::Result<Vec<SiteEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, domain, action, port, created_at
         FROM site_events WHERE domain = ?1 ORDER BY id",
    )?;

    let events = stmt
        .query_map(params![domain], |row| {
            Ok(SiteEvent {
                id: row.get(0)?,
                domain: row.get(1)?,
                action: row.get(2)?,
                port: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get_site() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.write(|tx| insert_site(tx, "a.com", 5000, now)).unwrap();

        let site = db.read(|conn| live_site(conn, "a.com")).unwrap().unwrap();
        assert_eq!(site.domain, "a.com");
        assert_eq!(site.port, 5000);
        assert_eq!(site.state, SiteState::Pending);
        assert!(site.activated_at.is_none());
    }

    #[test]
    fn test_live_port_unique_index() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.write(|tx| insert_site(tx, "a.com", 5000, now)).unwrap();
        let dup = db.write(|tx| insert_site(tx, "b.com", 5000, now));
        assert!(dup.is_err());

        // A removed row no longer holds the port
        db.write(|tx| mark_removed(tx, "a.com", now)).unwrap();
        db.write(|tx| insert_site(tx, "b.com", 5000, now)).unwrap();
    }

    #[test]
    fn test_live_domain_unique_index() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.write(|tx| insert_site(tx, "a.com", 5000, now)).unwrap();
        assert!(db.write(|tx| insert_site(tx, "a.com", 5001, now)).is_err());
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let result: Result<(), rusqlite::Error> = db.write(|tx| {
            insert_site(tx, "a.com", 5000, now)?;
            Err(rusqlite::Error::InvalidQuery)
        });
        assert!(result.is_err());

        assert!(db.read(|conn| latest_site(conn, "a.com")).unwrap().is_none());
    }

    #[test]
    fn test_held_ports_in_range() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.write(|tx| {
            insert_site(tx, "c.com", 5002, now)?;
            insert_site(tx, "a.com", 5000, now)?;
            insert_site(tx, "z.com", 4000, now)?;
            insert_site(tx, "r.com", 5001, now)?;
            mark_removed(tx, "r.com", now)
        })
        .unwrap();

        let ports = db.read(|conn| held_ports(conn, 5000, 6000)).unwrap();
        assert_eq!(ports, vec![5000, 5002]);
    }

    #[test]
    fn test_state_transitions() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.write(|tx| insert_site(tx, "a.com", 5000, now)).unwrap();
        assert!(db.write(|tx| mark_active(tx, "a.com", now)).unwrap());
        assert!(!db.write(|tx| mark_active(tx, "a.com", now)).unwrap());

        let active = db.read(|conn| sites_in_states(conn, &[SiteState::Active])).unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].activated_at.is_some());

        assert!(db.write(|tx| mark_removed(tx, "a.com", now)).unwrap());
        assert!(!db.write(|tx| mark_removed(tx, "a.com", now)).unwrap());

        let latest = db.read(|conn| latest_site(conn, "a.com")).unwrap().unwrap();
        assert_eq!(latest.state, SiteState::Removed);
        assert!(latest.removed_at.is_some());
    }

    #[test]
    fn test_events() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.write(|tx| {
            insert_event(tx, "a.com", SiteAction::Registered, 5000, now)?;
            insert_event(tx, "b.com", SiteAction::Registered, 5001, now)?;
            insert_event(tx, "a.com", SiteAction::Released, 5000, now)
        })
        .unwrap();

        let events = db.read(|conn| events_for(conn, "a.com")).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, SiteAction::Registered);
        assert_eq!(events[1].action, SiteAction::Released);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("registry.db");

        {
            let db = Database::open(&path, Duration::from_secs(1)).unwrap();
            db.write(|tx| insert_site(tx, "a.com", 5000, Utc::now())).unwrap();
        }

        let db = Database::open(&path, Duration::from_secs(1)).unwrap();
        let site = db.read(|conn| live_site(conn, "a.com")).unwrap().unwrap();
        assert_eq!(site.port, 5000);
    }
}
