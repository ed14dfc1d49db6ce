use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task: compact the tenant's WAL once enough appends have piled up,
/// and drop change-feed channels nobody listens to anymore.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        engine.notify.prune();
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            error!("compaction failed: {e}");
        }
    }
}

/// Compact when appends since the last compaction reach `threshold`.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, crate::engine::EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends, threshold {threshold}");
        return Ok(false);
    }
    info!("compacting WAL after {appends} appends");
    engine.compact_wal().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("milkrun_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn customer(id: Ulid) -> Customer {
        Customer {
            id,
            name: Some("Asha".into()),
            status: CustomerStatus::Active,
            area: None,
            delivery_boy_id: None,
            staff_id: None,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let id = Ulid::new();
        engine.upsert_customer(customer(id)).await.unwrap();
        for _ in 0..5 {
            engine.set_customer_status(id, CustomerStatus::Paused).await.unwrap();
            engine.set_customer_status(id, CustomerStatus::Active).await.unwrap();
        }
        assert!(!compact_if_needed(&engine, 100).await.unwrap());
        assert_eq!(Wal::replay(&path).unwrap().len(), 11);

        assert!(compact_if_needed(&engine, 10).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }
}
