//! Daily and weekly active-account tracking.
//!
//! Every successful token issuance marks the account in the current day and
//! ISO-week buckets. Buckets are plain marker keys in the KV backend, so the
//! cohort counts are distinct-account counts by construction. Retention is
//! enforced on write: buckets older than the configured horizon are evicted
//! before the new mark lands.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::kv::Kv;

const DAILY_PREFIX: &str = "actives:daily:";
const WEEKLY_PREFIX: &str = "actives:weekly:";

pub struct ActivesTracker {
    kv: Arc<dyn Kv>,
    time_zone: Tz,
    daily_retention: usize,
    weekly_retention: usize,
}

impl ActivesTracker {
    #[must_use]
    pub fn new(
        kv: Arc<dyn Kv>,
        time_zone: Tz,
        daily_retention: usize,
        weekly_retention: usize,
    ) -> Self {
        Self {
            kv,
            time_zone,
            daily_retention,
            weekly_retention,
        }
    }

    /// Record that an account was seen at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error when a backend operation fails.
    pub async fn track(&self, account_id: i64, now: DateTime<Utc>) -> Result<()> {
        let local = now.with_timezone(&self.time_zone);
        let day = local.format("%Y-%m-%d").to_string();
        let iso = local.iso_week();
        let week = format!("{:04}-W{:02}", iso.year(), iso.week());

        self.kv
            .set(&format!("{DAILY_PREFIX}{day}:{account_id}"), "1", None)
            .await
            .context("failed to mark daily active")?;
        self.kv
            .set(&format!("{WEEKLY_PREFIX}{week}:{account_id}"), "1", None)
            .await
            .context("failed to mark weekly active")?;

        self.evict(DAILY_PREFIX, self.daily_retention).await?;
        self.evict(WEEKLY_PREFIX, self.weekly_retention).await?;
        Ok(())
    }

    /// Distinct active accounts per day, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend read fails.
    pub async fn daily(&self) -> Result<BTreeMap<String, u64>> {
        self.aggregate(DAILY_PREFIX).await
    }

    /// Distinct active accounts per ISO week, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend read fails.
    pub async fn weekly(&self) -> Result<BTreeMap<String, u64>> {
        self.aggregate(WEEKLY_PREFIX).await
    }

    async fn aggregate(&self, prefix: &str) -> Result<BTreeMap<String, u64>> {
        let keys = self.kv.keys_with_prefix(prefix).await?;
        let mut counts = BTreeMap::new();
        for key in keys {
            if let Some(bucket) = bucket_of(&key, prefix) {
                *counts.entry(bucket.to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn evict(&self, prefix: &str, retention: usize) -> Result<()> {
        let keys = self.kv.keys_with_prefix(prefix).await?;
        // Bucket labels (YYYY-MM-DD, YYYY-Www) sort chronologically as
        // strings, so the horizon is just the newest `retention` labels.
        let mut buckets: Vec<&str> = keys
            .iter()
            .filter_map(|key| bucket_of(key, prefix))
            .collect();
        buckets.sort_unstable();
        buckets.dedup();
        if buckets.len() <= retention {
            return Ok(());
        }
        let survivors: Vec<String> = buckets
            .split_off(buckets.len() - retention.max(1))
            .into_iter()
            .map(str::to_string)
            .collect();
        for key in &keys {
            let keep = bucket_of(key, prefix)
                .is_some_and(|bucket| survivors.iter().any(|survivor| survivor == bucket));
            if !keep {
                self.kv.del(key).await?;
            }
        }
        Ok(())
    }
}

fn bucket_of<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)?.rsplit_once(':').map(|(b, _)| b)
}
