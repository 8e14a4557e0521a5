use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::store::InMemoryStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the store's WAL once `threshold` appends have accumulated since the
/// last compaction. Returns whether a compaction ran.
pub async fn compact_if_due(store: &InMemoryStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends}/{threshold} appends, skipping");
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(store: Arc<InMemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::store::Repository;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("pitstop_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = InMemoryStore::open(&path).unwrap();
        let id = Uuid::new_v4();
        for i in 0..5 {
            store
                .upsert_employee(Employee {
                    id,
                    name: format!("Kuba {i}"),
                })
                .await
                .unwrap();
        }

        assert!(!compact_if_due(&store, 10).await);
        assert_eq!(store.appends_since_compact().await, 5);

        assert!(compact_if_due(&store, 5).await);
        assert_eq!(store.appends_since_compact().await, 0);
        let employee = store.find_employee(id).await.unwrap().unwrap();
        assert_eq!(employee.name, "Kuba 4");
    }
}
