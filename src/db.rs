use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite store shared by the history log, the channel tracker and the
/// config store. Channel workers append concurrently, so the connection
/// sits behind a mutex.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // Enable WAL mode for crash safety
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read a value from the key/value run_state table.
    pub fn get_state(&self, key: &str) -> anyhow::Result<Option<String>> {
        let result = self.conn().query_row(
            "SELECT value FROM run_state WHERE key = ?1",
            [key],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_state(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT INTO run_state (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA)?;

        // Databases created before fee tracking lack the policy columns.
        let existing: Vec<String> = {
            let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('channel_samples')")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            names
        };
        for column in SAMPLE_FEE_COLUMNS {
            if !existing.iter().any(|c| c == column) {
                conn.execute_batch(&format!(
                    "ALTER TABLE channel_samples ADD COLUMN {} INTEGER",
                    column
                ))?;
            }
        }
        Ok(())
    }
}

/// Nullable policy columns on `channel_samples`: ours, then the peer's.
const SAMPLE_FEE_COLUMNS: [&str; 6] = [
    "base_fee_msat",
    "fee_rate",
    "time_lock_delta",
    "peer_base_fee_msat",
    "peer_fee_rate",
    "peer_time_lock_delta",
];

const SCHEMA: &str = r#"
-- Applied fee updates (append-only)
CREATE TABLE IF NOT EXISTS fee_updates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    old_base_fee_msat INTEGER NOT NULL,
    new_base_fee_msat INTEGER NOT NULL,
    old_fee_rate INTEGER NOT NULL,
    new_fee_rate INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fee_updates_channel
    ON fee_updates(channel_id, updated_at);

-- Balance and policy samples taken at the start of each pass.
-- Policy columns are NULL when the node did not report that side.
CREATE TABLE IF NOT EXISTS channel_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id TEXT NOT NULL,
    sampled_at INTEGER NOT NULL,
    capacity_sat INTEGER NOT NULL,
    local_balance_sat INTEGER NOT NULL,
    remote_balance_sat INTEGER NOT NULL,
    base_fee_msat INTEGER,
    fee_rate INTEGER,
    time_lock_delta INTEGER,
    peer_base_fee_msat INTEGER,
    peer_fee_rate INTEGER,
    peer_time_lock_delta INTEGER
);
CREATE INDEX IF NOT EXISTS idx_channel_samples_channel
    ON channel_samples(channel_id, id);

-- General run state (persisted automation config, ...)
CREATE TABLE IF NOT EXISTS run_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.conn().is_autocommit());
    }

    #[test]
    fn test_schema_tables_exist() {
        let db = Database::open_in_memory().unwrap();
        let tables: Vec<String> = {
            let conn = db.conn();
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            let names = stmt
                .query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect();
            names
        };

        for table in &["channel_samples", "fee_updates", "run_state"] {
            assert!(
                tables.contains(&table.to_string()),
                "Missing table: {}. Found: {:?}",
                table,
                tables
            );
        }
    }

    #[test]
    fn test_migrate_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
    }

    #[test]
    fn test_migrate_adds_fee_columns_to_old_samples_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE channel_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                sampled_at INTEGER NOT NULL,
                capacity_sat INTEGER NOT NULL,
                local_balance_sat INTEGER NOT NULL,
                remote_balance_sat INTEGER NOT NULL
            );
            INSERT INTO channel_samples
                (channel_id, sampled_at, capacity_sat, local_balance_sat, remote_balance_sat)
                VALUES ('ch1', 1, 100, 50, 50);",
        )
        .unwrap();
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.migrate().unwrap();

        let (rows, peer_rate): (i64, Option<i64>) = db
            .conn()
            .query_row(
                "SELECT COUNT(*), MAX(peer_fee_rate) FROM channel_samples",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(peer_rate, None);
    }

    #[test]
    fn test_state_upsert() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_state("k").unwrap(), None);
        db.put_state("k", "one").unwrap();
        db.put_state("k", "two").unwrap();
        assert_eq!(db.get_state("k").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeboss.db");
        {
            let db = Database::open(&path).unwrap();
            db.put_state("persisted", "yes").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.get_state("persisted").unwrap().as_deref(), Some("yes"));
    }
}
