use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::model::Ms;
use crate::observability::SUBSCRIPTIONS_EXPIRED_TOTAL;
use crate::store::{Store, now_ms};

/// Periodically move lapsed subscriptions to `expired`.
pub async fn run_expiry_sweeper(store: Arc<Store>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_expired(&store, now_ms()).await;
    }
}

/// One sweep. Returns how many subscriptions were expired.
pub async fn sweep_expired(store: &Store, now: Ms) -> usize {
    let mut expired = 0;
    for id in store.collect_lapsed_subscriptions(now).await {
        match store.expire_subscription(id).await {
            Ok(_) => {
                expired += 1;
                metrics::counter!(SUBSCRIPTIONS_EXPIRED_TOTAL).increment(1);
                info!("expired subscription {id}");
            }
            Err(e) => debug!("sweeper skip {id}: {e}"),
        }
    }
    expired
}

/// Periodically compact the WAL once enough records piled up since the last
/// compaction.
pub async fn run_compactor(store: Arc<Store>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

pub async fn compact_if_due(store: &Store, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("WAL compaction after {appends} appends failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewSubscription, StoreOptions};
    use crate::model::SubscriptionStatus;
    use std::path::PathBuf;

    const DAY: i64 = 86_400_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fitslot_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn window(user_id: i64, valid_until: i64) -> NewSubscription {
        NewSubscription {
            user_id,
            gym_id: None,
            visits_limit: None,
            price: 0,
            valid_from: valid_until - 30 * DAY,
            valid_until,
        }
    }

    #[tokio::test]
    async fn sweeper_expires_only_lapsed() {
        let store = Store::open(test_wal_path("sweep.wal"), StoreOptions::default())
            .await
            .unwrap();
        let now = now_ms();
        let lapsed = store.create_subscription(window(1, now - 1)).await.unwrap();
        let live = store.create_subscription(window(1, now + DAY)).await.unwrap();

        assert_eq!(sweep_expired(&store, now).await, 1);
        assert_eq!(
            store.get_subscription(lapsed.id).await.unwrap().status,
            SubscriptionStatus::Expired
        );
        assert_eq!(
            store.get_subscription(live.id).await.unwrap().status,
            SubscriptionStatus::Active
        );
        assert_eq!(sweep_expired(&store, now).await, 0);
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let store = Store::open(test_wal_path("compactor.wal"), StoreOptions::default())
            .await
            .unwrap();
        for _ in 0..5 {
            store.top_up(1, 10).await.unwrap();
        }
        assert!(!compact_if_due(&store, 10).await);
        assert_eq!(store.wal_appends_since_compact().await, 5);

        assert!(compact_if_due(&store, 5).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);
        assert_eq!(store.get_wallet(1).await.unwrap().balance, 50);
    }
}
