use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};

use chrono::{DateTime, Utc};

use crate::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub download_count: u64,
    pub total_bytes: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub platforms: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct UserStats {
    records: Mutex<HashMap<UserId, UsageRecord>>,
}

impl UserStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, user_id: UserId, platform: &str, bytes: u64, now: DateTime<Utc>) {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = records.entry(user_id).or_insert_with(|| UsageRecord {
            download_count: 0,
            total_bytes: 0,
            first_seen: now,
            last_seen: now,
            platforms: BTreeSet::new(),
        });

        record.download_count = record.download_count.saturating_add(1);
        record.total_bytes = record.total_bytes.saturating_add(bytes);
        record.last_seen = record.last_seen.max(now);
        record.platforms.insert(platform.to_string());
    }

    pub fn snapshot(&self, user_id: UserId) -> Option<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&user_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn accumulates_counts_bytes_and_platforms() {
        let stats = UserStats::new();

        stats.record(1, "YouTube", 100, at(0));
        stats.record(1, "TikTok", 50, at(10));
        stats.record(1, "YouTube", 25, at(20));

        let record = stats.snapshot(1).unwrap();
        assert_eq!(record.download_count, 3);
        assert_eq!(record.total_bytes, 175);
        assert_eq!(record.first_seen, at(0));
        assert_eq!(record.last_seen, at(20));
        assert_eq!(record.platforms.len(), 2);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let stats = UserStats::new();
        stats.record(1, "Vimeo", 10, at(0));

        let mut copy = stats.snapshot(1).unwrap();
        copy.download_count = 99;
        copy.platforms.clear();

        let fresh = stats.snapshot(1).unwrap();
        assert_eq!(fresh.download_count, 1);
        assert!(fresh.platforms.contains("Vimeo"));
    }

    #[test]
    fn unknown_user_has_no_record() {
        assert!(UserStats::new().snapshot(42).is_none());
    }
}
