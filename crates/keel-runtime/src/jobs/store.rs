//! Retention for succeeded jobs.
//!
//! Succeeded records are only kept for status queries, so they live in a
//! bounded TTL cache instead of growing without limit.

use moka::future::Cache;
use std::time::Duration;

use super::types::{JobId, JobRecord};

pub struct CompletedJobs {
    cache: Cache<JobId, JobRecord>,
}

impl CompletedJobs {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub async fn get(&self, job_id: &JobId) -> Option<JobRecord> {
        self.cache.get(job_id).await
    }

    pub async fn insert(&self, record: JobRecord) {
        self.cache.insert(record.job_id, record).await;
    }

    /// Number of retained records, after applying pending evictions.
    pub async fn count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

impl Default for CompletedJobs {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_fetch() {
        let store = CompletedJobs::default();
        let record = JobRecord::new("export".into(), 3, None);
        let id = record.job_id;

        assert!(store.get(&id).await.is_none());
        store.insert(record.clone()).await;

        assert_eq!(store.get(&id).await, Some(record));
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_records_expire() {
        let store = CompletedJobs::new(100, Duration::from_millis(20));
        let record = JobRecord::new("export".into(), 0, None);
        let id = record.job_id;
        store.insert(record).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_bounds_retention() {
        let store = CompletedJobs::new(2, Duration::from_secs(3600));
        for n in 0..10 {
            store.insert(JobRecord::new(format!("job-{}", n), 0, None)).await;
        }
        assert!(store.count().await <= 2);
    }
}
