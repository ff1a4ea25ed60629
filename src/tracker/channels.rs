use crate::db::Database;
use crate::fees::FeeParameters;
use crate::state::Channel;
use log::debug;
use serde::Serialize;

/// Samples kept per channel: 30 days of hourly passes.
pub const MAX_SAMPLES_PER_CHANNEL: i64 = 24 * 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSample {
    pub sampled_at: i64,
    pub capacity_sat: u64,
    pub local_balance_sat: u64,
    pub remote_balance_sat: u64,
    /// Our policy at sampling time
    pub fees: Option<FeeParameters>,
    /// The peer's policy at sampling time
    pub peer_fees: Option<FeeParameters>,
}

impl ChannelSample {
    pub fn balance_ratio(&self) -> f64 {
        if self.capacity_sat == 0 {
            return 0.5;
        }
        self.local_balance_sat as f64 / self.capacity_sat as f64
    }
}

fn fee_columns(fees: Option<&FeeParameters>) -> [Option<i64>; 3] {
    match fees {
        Some(f) => [
            Some(f.base_fee_msat as i64),
            Some(f.fee_rate as i64),
            Some(f.time_lock_delta as i64),
        ],
        None => [None; 3],
    }
}

fn fees_from_columns(
    row: &rusqlite::Row<'_>,
    first: usize,
) -> rusqlite::Result<Option<FeeParameters>> {
    let base: Option<i64> = row.get(first)?;
    let rate: Option<i64> = row.get(first + 1)?;
    let delta: Option<i64> = row.get(first + 2)?;
    Ok(match (base, rate, delta) {
        (Some(base), Some(rate), Some(delta)) => Some(FeeParameters {
            base_fee_msat: base as u64,
            fee_rate: rate as u32,
            time_lock_delta: delta as u32,
        }),
        _ => None,
    })
}

/// Record one balance and policy sample per channel and prune old ones.
pub fn update(db: &Database, channels: &[Channel], sampled_at: i64) -> anyhow::Result<()> {
    let mut conn = db.conn();
    let tx = conn.transaction()?;

    for ch in channels {
        let [base, rate, delta] = fee_columns(ch.fees.as_ref());
        let [peer_base, peer_rate, peer_delta] = fee_columns(ch.peer_fees.as_ref());
        tx.execute(
            "INSERT INTO channel_samples \
             (channel_id, sampled_at, capacity_sat, local_balance_sat, remote_balance_sat, \
              base_fee_msat, fee_rate, time_lock_delta, \
              peer_base_fee_msat, peer_fee_rate, peer_time_lock_delta) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                ch.channel_id,
                sampled_at,
                ch.capacity_sat as i64,
                ch.local_balance_sat as i64,
                ch.remote_balance_sat as i64,
                base,
                rate,
                delta,
                peer_base,
                peer_rate,
                peer_delta,
            ],
        )?;
        tx.execute(
            "DELETE FROM channel_samples WHERE channel_id = ?1 AND id NOT IN \
             (SELECT id FROM channel_samples WHERE channel_id = ?1 ORDER BY id DESC LIMIT ?2)",
            rusqlite::params![ch.channel_id, MAX_SAMPLES_PER_CHANNEL],
        )?;
    }

    tx.commit()?;
    debug!("Channel tracker: sampled {} channels", channels.len());
    Ok(())
}

/// Most recent samples for a channel, newest first.
pub fn recent_samples(
    db: &Database,
    channel_id: &str,
    limit: usize,
) -> anyhow::Result<Vec<ChannelSample>> {
    let conn = db.conn();
    let mut stmt = conn.prepare(
        "SELECT sampled_at, capacity_sat, local_balance_sat, remote_balance_sat, \
                base_fee_msat, fee_rate, time_lock_delta, \
                peer_base_fee_msat, peer_fee_rate, peer_time_lock_delta \
         FROM channel_samples WHERE channel_id = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![channel_id, limit as i64], |row| {
        Ok(ChannelSample {
            sampled_at: row.get(0)?,
            capacity_sat: row.get::<_, i64>(1)? as u64,
            local_balance_sat: row.get::<_, i64>(2)? as u64,
            remote_balance_sat: row.get::<_, i64>(3)? as u64,
            fees: fees_from_columns(row, 4)?,
            peer_fees: fees_from_columns(row, 7)?,
        })
    })?;

    let mut samples = Vec::new();
    for row in rows {
        samples.push(row?);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_channel;

    fn sample_count(db: &Database, channel_id: &str) -> i64 {
        db.conn()
            .query_row(
                "SELECT COUNT(*) FROM channel_samples WHERE channel_id = ?1",
                [channel_id],
                |r| r.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_samples_recorded() {
        let db = Database::open_in_memory().unwrap();
        let channels = vec![
            test_channel("ch1", 1_000_000, 600_000),
            test_channel("ch2", 500_000, 100_000),
        ];

        update(&db, &channels, 1_000).unwrap();

        assert_eq!(sample_count(&db, "ch1"), 1);
        assert_eq!(sample_count(&db, "ch2"), 1);
        let samples = recent_samples(&db, "ch1", 10).unwrap();
        assert_eq!(samples[0].local_balance_sat, 600_000);
        assert!((samples[0].balance_ratio() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_policies_recorded_with_sample() {
        let db = Database::open_in_memory().unwrap();
        let mut ch = test_channel("ch1", 1_000_000, 500_000);
        ch.peer_fees = Some(FeeParameters {
            base_fee_msat: 2000,
            fee_rate: 350,
            time_lock_delta: 144,
        });
        let mut silent = test_channel("ch2", 1_000_000, 500_000);
        silent.fees = None;

        update(&db, &[ch.clone(), silent], 1_000).unwrap();

        let sample = &recent_samples(&db, "ch1", 1).unwrap()[0];
        assert_eq!(sample.fees, ch.fees);
        assert_eq!(sample.peer_fees, ch.peer_fees);

        let sample = &recent_samples(&db, "ch2", 1).unwrap()[0];
        assert_eq!(sample.fees, None);
        assert_eq!(sample.peer_fees, None);
    }

    #[test]
    fn test_newest_first() {
        let db = Database::open_in_memory().unwrap();
        update(&db, &[test_channel("ch1", 1_000_000, 100_000)], 1_000).unwrap();
        update(&db, &[test_channel("ch1", 1_000_000, 700_000)], 2_000).unwrap();

        let samples = recent_samples(&db, "ch1", 10).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].sampled_at, 2_000);
        assert_eq!(samples[0].local_balance_sat, 700_000);
    }

    #[test]
    fn test_pruned_to_retention_limit() {
        let db = Database::open_in_memory().unwrap();
        let channels = vec![test_channel("ch1", 1_000_000, 500_000)];
        for i in 0..(MAX_SAMPLES_PER_CHANNEL + 5) {
            update(&db, &channels, i).unwrap();
        }

        assert_eq!(sample_count(&db, "ch1"), MAX_SAMPLES_PER_CHANNEL);
        // Oldest were dropped
        let oldest: i64 = db
            .conn()
            .query_row(
                "SELECT MIN(sampled_at) FROM channel_samples WHERE channel_id = 'ch1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(oldest, 5);
    }

    #[test]
    fn test_unknown_channel_has_no_samples() {
        let db = Database::open_in_memory().unwrap();
        assert!(recent_samples(&db, "nope", 10).unwrap().is_empty());
    }

    #[test]
    fn test_empty_channel_list() {
        let db = Database::open_in_memory().unwrap();
        update(&db, &[], 1_000).unwrap();
        let total: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM channel_samples", [], |r| r.get(0))
            .unwrap();
        assert_eq!(total, 0);
    }
}
