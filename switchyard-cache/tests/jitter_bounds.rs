//! TTL distribution of a bulk load through the jittered cache.

use std::collections::HashSet;
use std::time::Duration;
use switchyard_cache::{JitterConfig, JitteredCache};

#[tokio::test]
async fn test_bulk_writes_spread_ttls_within_bounds() {
    let cache = JitteredCache::in_memory(
        JitterConfig::default()
            .jitter_range(0.0, 0.15)
            .without_early_recompute(),
    )
    .unwrap();
    let base_ttl = Duration::from_secs(100);

    let mut distinct = HashSet::new();
    for i in 0..10_000 {
        let key = format!("item:{}", i);
        cache.set(&key, &i, base_ttl, &[]).await.unwrap();

        let entry = cache.entry::<u32>(&key).await.unwrap().unwrap();
        assert!(entry.ttl >= Duration::from_secs(100), "{:?} below base", entry.ttl);
        assert!(entry.ttl <= Duration::from_secs(115), "{:?} above bound", entry.ttl);
        distinct.insert(entry.ttl);
    }

    assert!(distinct.len() > 1, "all TTLs were identical");
}

#[tokio::test]
async fn test_zero_jitter_keeps_base_ttl() {
    let cache = JitteredCache::in_memory(
        JitterConfig::default()
            .jitter_range(0.0, 0.0)
            .without_early_recompute(),
    )
    .unwrap();

    let ttl = cache
        .set("fixed", &"v", Duration::from_secs(100), &[])
        .await
        .unwrap();
    let entry = cache.entry::<String>("fixed").await.unwrap().unwrap();

    assert_eq!(ttl, Duration::from_secs(100));
    assert!(!entry.jittered);
}

#[test]
fn test_negative_jitter_is_rejected() {
    let result = JitteredCache::in_memory(JitterConfig::default().jitter_range(-0.5, 0.1));
    assert!(result.is_err());
}
