//!
//! # 进度模块
//! Per-download progress records, polled by clients while an archive streams.
//!

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Preparing,
    Processing,
    Ready,
    Error,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Ready | ProgressStatus::Error)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProgressRecord {
    pub id: Uuid,
    pub status: ProgressStatus,
    pub total_count: usize,
    pub processed_count: usize,
    pub percentage: u8,
    pub filename: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields to merge into a record, `None` leaves the field alone
#[derive(Default, Debug, Clone)]
pub struct ProgressUpdate {
    pub status: Option<ProgressStatus>,
    pub processed_count: Option<usize>,
    pub error: Option<String>,
}

impl ProgressUpdate {
    pub fn status(status: ProgressStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn processed(processed_count: usize) -> Self {
        Self {
            processed_count: Some(processed_count),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(ProgressStatus::Error),
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

fn percentage(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }

    let pct = (processed as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Shared between every running download, owned by whoever builds the server.
#[derive(Default)]
pub struct ProgressStore {
    records: RwLock<HashMap<Uuid, ProgressRecord>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, filename: impl Into<String>, total_count: usize) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let record = ProgressRecord {
            id,
            status: ProgressStatus::Preparing,
            total_count,
            processed_count: 0,
            percentage: 0,
            filename: filename.into(),
            error: None,
            created_at: now,
            updated_at: now,
        };

        self.records.write().insert(id, record);
        id
    }

    /// Returns false when the record was already removed
    pub fn update(&self, id: &Uuid, update: ProgressUpdate) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(id) else {
            return false;
        };

        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(processed) = update.processed_count {
            record.processed_count = processed.min(record.total_count);
        }
        if update.error.is_some() {
            record.error = update.error;
        }
        record.percentage = percentage(record.processed_count, record.total_count);
        record.updated_at = Utc::now();

        true
    }

    pub fn get(&self, id: &Uuid) -> Option<ProgressRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn delete(&self, id: &Uuid) -> Option<ProgressRecord> {
        self.records.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Drop every record not touched since `now - retention`, whatever its status
    pub fn sweep(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| record.updated_at >= cutoff);

        before - records.len()
    }

    /// Remove the record once `delay` has passed
    pub fn schedule_delete(self: &Arc<Self>, id: Uuid, delay: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if store.delete(&id).is_some() {
                debug!("Progress record removed: {}", id);
            }
        })
    }

    /// Background sweep until `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        retention: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep(Utc::now(), retention);
                        if removed > 0 {
                            info!("Swept {} stale progress records", removed);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_recompute_percentage() {
        let store = ProgressStore::new();
        let id = store.create("gallery.zip", 3);

        store.update(&id, ProgressUpdate::processed(1));
        assert_eq!(store.get(&id).unwrap().percentage, 33);

        store.update(&id, ProgressUpdate::processed(2));
        assert_eq!(store.get(&id).unwrap().percentage, 67);

        // clamped to total
        store.update(&id, ProgressUpdate::processed(10));
        let record = store.get(&id).unwrap();
        assert_eq!(record.processed_count, 3);
        assert_eq!(record.percentage, 100);
    }

    #[test]
    fn should_merge_partial_updates() {
        let store = ProgressStore::new();
        let id = store.create("gallery.zip", 4);

        store.update(&id, ProgressUpdate::processed(2));
        store.update(&id, ProgressUpdate::failed("client went away"));

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, ProgressStatus::Error);
        assert_eq!(record.processed_count, 2);
        assert_eq!(record.error.as_deref(), Some("client went away"));
        assert!(record.updated_at >= record.created_at);
    }

    #[test]
    fn should_report_zero_percent_for_empty_totals() {
        let store = ProgressStore::new();
        let id = store.create("empty.zip", 0);
        store.update(&id, ProgressUpdate::status(ProgressStatus::Ready));
        assert_eq!(store.get(&id).unwrap().percentage, 0);
    }

    #[test]
    fn should_ignore_updates_for_unknown_ids() {
        let store = ProgressStore::new();
        assert!(!store.update(&Uuid::new_v4(), ProgressUpdate::processed(1)));
    }

    #[test]
    fn should_sweep_stale_records_regardless_of_status() {
        let store = ProgressStore::new();
        let a = store.create("a.zip", 1);
        let b = store.create("b.zip", 1);
        store.update(&b, ProgressUpdate::status(ProgressStatus::Processing));

        // nothing is stale yet
        assert_eq!(store.sweep(Utc::now(), Duration::from_secs(60)), 0);

        let later = Utc::now() + chrono::Duration::minutes(31);
        assert_eq!(store.sweep(later, Duration::from_secs(30 * 60)), 2);
        assert!(store.get(&a).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_delete_after_delay() {
        let store = Arc::new(ProgressStore::new());
        let id = store.create("a.zip", 1);

        let handle = store.schedule_delete(id, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(store.get(&id).is_some());

        handle.await.unwrap();
        assert!(store.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn should_sweep_stale_records_in_background() {
        let store = Arc::new(ProgressStore::new());
        let stale = store.create("stale.zip", 1);
        let fresh = store.create("fresh.zip", 1);
        if let Some(record) = store.records.write().get_mut(&stale) {
            record.updated_at = Utc::now() - chrono::Duration::hours(1);
        }

        let shutdown = CancellationToken::new();
        let handle = store.spawn_sweeper(
            Duration::from_secs(300),
            Duration::from_secs(1800),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(store.get(&stale).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get(&stale).is_none());
        assert!(store.get(&fresh).is_some());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_sweeper_on_shutdown() {
        let store = Arc::new(ProgressStore::new());
        let shutdown = CancellationToken::new();
        let handle = store.spawn_sweeper(
            Duration::from_secs(300),
            Duration::from_secs(1800),
            shutdown.clone(),
        );

        store.create("a.zip", 1);
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(store.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
