use crate::db::Database;
use serde::Serialize;
use std::sync::Arc;

/// One applied fee change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeUpdateRecord {
    pub timestamp: i64,
    pub channel_id: String,
    pub old_base_fee_msat: u64,
    pub new_base_fee_msat: u64,
    pub old_fee_rate: u32,
    pub new_fee_rate: u32,
}

/// Append-only log of applied fee updates.
#[derive(Clone)]
pub struct HistoryLog {
    db: Arc<Database>,
}

impl HistoryLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn append(&self, record: &FeeUpdateRecord) -> anyhow::Result<()> {
        self.db.conn().execute(
            "INSERT INTO fee_updates \
             (channel_id, updated_at, old_base_fee_msat, new_base_fee_msat, old_fee_rate, new_fee_rate) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.channel_id,
                record.timestamp,
                record.old_base_fee_msat as i64,
                record.new_base_fee_msat as i64,
                record.old_fee_rate,
                record.new_fee_rate,
            ],
        )?;
        Ok(())
    }

    /// Most recent records first.
    pub fn recent(&self, limit: usize) -> anyhow::Result<Vec<FeeUpdateRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT updated_at, channel_id, old_base_fee_msat, new_base_fee_msat, \
             old_fee_rate, new_fee_rate \
             FROM fee_updates ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(FeeUpdateRecord {
                timestamp: row.get(0)?,
                channel_id: row.get(1)?,
                old_base_fee_msat: row.get::<_, i64>(2)? as u64,
                new_base_fee_msat: row.get::<_, i64>(3)? as u64,
                old_fee_rate: row.get(4)?,
                new_fee_rate: row.get(5)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn count(&self) -> anyhow::Result<u64> {
        let n: i64 = self
            .db
            .conn()
            .query_row("SELECT COUNT(*) FROM fee_updates", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(channel_id: &str, timestamp: i64, new_rate: u32) -> FeeUpdateRecord {
        FeeUpdateRecord {
            timestamp,
            channel_id: channel_id.to_string(),
            old_base_fee_msat: 1000,
            new_base_fee_msat: 2000,
            old_fee_rate: 1,
            new_fee_rate: new_rate,
        }
    }

    #[test]
    fn test_append_and_read_back_newest_first() {
        let log = HistoryLog::new(Arc::new(Database::open_in_memory().unwrap()));
        log.append(&record("a", 100, 10)).unwrap();
        log.append(&record("b", 200, 20)).unwrap();
        log.append(&record("c", 300, 30)).unwrap();

        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], record("c", 300, 30));
        assert_eq!(recent[1].channel_id, "b");
        assert_eq!(log.count().unwrap(), 3);
    }

    #[test]
    fn test_empty_log() {
        let log = HistoryLog::new(Arc::new(Database::open_in_memory().unwrap()));
        assert!(log.recent(10).unwrap().is_empty());
        assert_eq!(log.count().unwrap(), 0);
    }
}
