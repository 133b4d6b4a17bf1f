//! Selection behaviour across snapshot changes

use channel_index::{
    reload, CacheRefresher, Channel, ChannelIndex, ChannelSelector, ChannelStatus, ChannelStore,
    MemoryChannelStore, ProviderType,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn channel(id: i64, priority: u32) -> Channel {
    Channel::new(id, ProviderType::OpenAi, format!("ch-{}", id))
        .with_groups(["default", "vip"])
        .with_models(["gpt-4o", "gpt-4o-mini"])
        .with_priority(priority)
}

#[test]
fn test_retry_walk_exhausts_candidates_without_repeats() {
    let index = Arc::new(ChannelIndex::new((1..=5).map(|id| channel(id, id as u32)).collect()));
    let selector = ChannelSelector::new(index);
    let mut rng = StdRng::seed_from_u64(42);

    let mut tried = Vec::new();
    while let Ok(chosen) = selector.select_with_rng("vip", "gpt-4o", &tried, &mut rng) {
        assert!(!tried.contains(&chosen.id));
        tried.push(chosen.id);
    }

    let unique: HashSet<_> = tried.iter().copied().collect();
    assert_eq!(unique.len(), 5);
    assert_eq!(tried.len(), 5);
}

#[tokio::test]
async fn test_auto_ban_then_reload_keeps_disabled() {
    let store = Arc::new(MemoryChannelStore::new(vec![channel(1, 1), channel(2, 1)]));
    let index = Arc::new(ChannelIndex::default());
    reload(&index, store.as_ref()).await.unwrap();

    index.disable(1, ChannelStatus::AutoDisabled).unwrap();
    store
        .update_status(1, ChannelStatus::AutoDisabled, "status code 401")
        .await
        .unwrap();

    let refresher = CacheRefresher::spawn(index.clone(), store.clone(), Duration::from_secs(3600));
    refresher.invalidate().await.unwrap();

    let selector = ChannelSelector::new(index.clone());
    for _ in 0..50 {
        assert_eq!(selector.select("default", "gpt-4o", &[]).unwrap().id, 2);
    }
    refresher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_selection_during_concurrent_publishes() {
    let index = Arc::new(ChannelIndex::new(vec![channel(1, 1), channel(2, 1)]));
    let selector = ChannelSelector::new(index.clone());

    let writer = {
        let index = index.clone();
        tokio::spawn(async move {
            for round in 0..200 {
                let status = if round % 2 == 0 {
                    ChannelStatus::AutoDisabled
                } else {
                    ChannelStatus::Enabled
                };
                index.set_status(1, status).unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    for _ in 0..200 {
        // channel 2 never changes, so selection always succeeds
        let chosen = selector.select("default", "gpt-4o-mini", &[]).unwrap();
        assert!(chosen.id == 1 || chosen.id == 2);
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
    assert_eq!(index.version(), 201);
}
