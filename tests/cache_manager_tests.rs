use lakepipe::cache::{CacheKey, CacheManager, CachePolicy, DiskTier, ManualClock};
use lakepipe::config::CacheConfig;
use lakepipe::error::{CacheError, ConfigError};
use lakepipe::core::{Batch, Column, Split, Table};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(60);

fn cap(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

fn batch(sequence: u64) -> Batch {
    let values = vec![sequence as i64; sequence as usize];
    Batch::new(
        format!("warehouse/day={sequence}"),
        sequence,
        Table::new().with_column("v", Column::Int64(values)),
    )
}

fn key(name: &str) -> CacheKey {
    CacheKey::derive(name, "mem|seq(project#a,b)")
}

fn disk_config(dir: &std::path::Path) -> CacheConfig {
    CacheConfig {
        dir: Some(dir.to_path_buf()),
        memory_capacity: 4,
        max_disk_size: 1 << 20,
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn test_put_then_get_roundtrip() {
    let cache = CacheManager::in_memory(cap(8), TTL);
    let k = key("a");
    cache.put(&k, &batch(3), TTL).await;

    assert_eq!(cache.get(&k).await, Some(batch(3)));
    assert_eq!(cache.stats().hits, 1);
}

#[tokio::test]
async fn test_miss_on_unknown_key() {
    let cache = CacheManager::in_memory(cap(8), TTL);
    assert_eq!(cache.get(&key("missing")).await, None);
    assert_eq!(cache.stats().misses, 1);
}

#[tokio::test]
async fn test_entry_expires_with_simulated_clock() {
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = CacheManager::in_memory(cap(8), TTL).with_clock(clock.clone());
    let k = key("a");
    cache.put(&k, &batch(1), Duration::from_secs(10)).await;

    clock.advance(Duration::from_secs(5));
    assert!(cache.get(&k).await.is_some());

    clock.advance(Duration::from_secs(6));
    assert_eq!(cache.get(&k).await, None);
    assert!(!cache.memory().contains(&k));
}

#[tokio::test]
async fn test_cleanup_removes_expired_from_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let cache = CacheManager::open(&disk_config(dir.path()))
        .await
        .unwrap()
        .with_clock(clock.clone());

    cache.put(&key("short"), &batch(1), Duration::from_secs(1)).await;
    cache.put(&key("long"), &batch(2), Duration::from_secs(100)).await;
    clock.advance(Duration::from_secs(2));

    // one entry in each tier
    assert_eq!(cache.cleanup().await, 2);
    let stats = cache.stats();
    assert_eq!(stats.memory_entries, 1);
    assert_eq!(stats.disk_entries, 1);
    assert!(cache.get(&key("long")).await.is_some());
    assert!(!dir.path().join(format!("{}.entry", key("short"))).exists());
}

#[tokio::test]
async fn test_single_slot_memory_tier_falls_back_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let disk = DiskTier::open(dir.path(), 1 << 20).await.unwrap();
    let cache = CacheManager::with_disk(cap(1), disk, TTL);
    let (a, b) = (key("a"), key("b"));

    cache.put(&a, &batch(1), TTL).await;
    cache.put(&b, &batch(2), TTL).await;

    assert!(!cache.memory().contains(&a));
    assert!(cache.memory().contains(&b));

    // served by tier 2, then promoted
    assert_eq!(cache.get(&a).await, Some(batch(1)));
    assert!(cache.memory().contains(&a));
    assert!(!cache.memory().contains(&b));
}

#[tokio::test]
async fn test_single_slot_memory_only_misses_evicted() {
    let cache = CacheManager::in_memory(cap(1), TTL);
    cache.put(&key("a"), &batch(1), TTL).await;
    cache.put(&key("b"), &batch(2), TTL).await;

    assert_eq!(cache.get(&key("a")).await, None);
    assert_eq!(cache.get(&key("b")).await, Some(batch(2)));
}

#[tokio::test]
async fn test_oversized_put_never_resurrects_older_value() {
    let dir = tempfile::tempdir().unwrap();
    let disk = DiskTier::open(dir.path(), 400).await.unwrap();
    let cache = CacheManager::with_disk(cap(1), disk, TTL);
    let k = key("grows");
    let wide = Batch::new(
        "warehouse/day=9",
        9,
        Table::new().with_column("v", Column::Int64((0..500).collect())),
    );

    cache.put(&k, &batch(1), TTL).await;
    cache.put(&k, &wide, TTL).await;
    assert_eq!(cache.get(&k).await, Some(wide.clone()));

    // push the wide value out of the single memory slot
    cache.put(&key("other"), &batch(2), TTL).await;

    assert_eq!(cache.get(&k).await, None);
    assert!(!cache.disk().unwrap().contains(&k));
}

#[tokio::test]
async fn test_disk_tier_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(dir.path());
    let k = key("persisted");
    {
        let cache = CacheManager::open(&config).await.unwrap();
        cache.put(&k, &batch(4), TTL).await;
        cache.close().await;
    }

    let reopened = CacheManager::open(&config).await.unwrap();
    assert_eq!(reopened.stats().disk_entries, 1);
    assert_eq!(reopened.get(&k).await, Some(batch(4)));
}

#[tokio::test]
async fn test_corrupt_entry_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(dir.path());
    let k = key("corrupt");
    {
        let cache = CacheManager::open(&config).await.unwrap();
        cache.put(&k, &batch(2), TTL).await;
    }
    std::fs::write(
        dir.path().join(format!("{k}.entry")),
        b"LAKEPIPE but definitely not a valid header or payload",
    )
    .unwrap();

    let cache = CacheManager::open(&config).await.unwrap();
    assert_eq!(cache.get(&k).await, None);
    let stats = cache.stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.disk_entries, 0);
}

#[tokio::test]
async fn test_unreadable_index_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.json"), b"{not json").unwrap();

    let cache = CacheManager::open(&disk_config(dir.path())).await.unwrap();
    assert_eq!(cache.stats().disk_entries, 0);
    cache.put(&key("a"), &batch(1), TTL).await;
    assert_eq!(cache.stats().disk_entries, 1);
}

#[tokio::test]
async fn test_fingerprint_isolates_entries() {
    let cache = CacheManager::in_memory(cap(8), TTL);
    let v1 = CacheKey::derive("warehouse/day=1", "mem|seq(scale#factor=2)");
    let v2 = CacheKey::derive("warehouse/day=1", "mem|seq(scale#factor=3)");
    cache.put(&v1, &batch(1), TTL).await;

    assert_eq!(cache.get(&v2).await, None);
    assert!(cache.get(&v1).await.is_some());
}

#[tokio::test]
async fn test_put_replaces_existing_value() {
    let cache = CacheManager::in_memory(cap(8), TTL);
    let k = key("a");
    cache.put(&k, &batch(1), TTL).await;
    cache.put(&k, &batch(2), TTL).await;

    assert_eq!(cache.get(&k).await, Some(batch(2)));
}

#[tokio::test]
async fn test_invalidate_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheManager::open(&disk_config(dir.path())).await.unwrap();
    cache.put(&key("a"), &batch(1), TTL).await;
    cache.put(&key("b"), &batch(2), TTL).await;

    assert!(cache.invalidate(&key("a")).await);
    assert!(!cache.invalidate(&key("a")).await);
    assert_eq!(cache.get(&key("a")).await, None);

    cache.clear().await;
    let stats = cache.stats();
    assert_eq!(stats.memory_entries, 0);
    assert_eq!(stats.disk_entries, 0);
    assert_eq!(stats.disk_bytes, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_see_whole_values() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(CacheManager::open(&disk_config(dir.path())).await.unwrap());
    let shared = key("hot");

    let mut handles = Vec::new();
    for task in 0..8u64 {
        let cache = cache.clone();
        let shared = shared.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..25u64 {
                let sequence = 1 + (task * 25 + round) % 16;
                cache.put(&shared, &batch(sequence), TTL).await;
                if let Some(found) = cache.get(&shared).await {
                    // a reader gets one writer's batch in full
                    assert_eq!(found, batch(found.sequence()));
                }
                let own = key(&format!("task-{task}-{round}"));
                cache.put(&own, &batch(sequence), TTL).await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(cache.get(&shared).await.is_some());
    assert_eq!(cache.stats().errors, 0);
}

#[test]
fn test_policy_from_config() {
    let config = CacheConfig {
        immutable_only: false,
        exclude_patterns: vec!["live/**".to_string()],
        ..CacheConfig::default()
    };
    let policy = CachePolicy::from_config(&config).unwrap();

    assert!(policy.should_cache(&Split::new("hist/day=1", 1).immutable()));
    assert!(policy.should_cache(&Split::new("hist/day=2", 2).cacheable()));
    assert!(!policy.should_cache(&Split::new("hist/day=3", 3)));
    assert!(!policy.should_cache(&Split::new("live/now", 4).cacheable()));
}

#[tokio::test]
async fn test_open_validates_config_first() {
    let dir = tempfile::tempdir().unwrap();

    let zero = CacheConfig {
        memory_capacity: 0,
        ..disk_config(dir.path())
    };
    let err = CacheManager::open(&zero).await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::Config(ConfigError::Invalid { field: "cache.memory_capacity", .. })
    ));

    let bad_glob = CacheConfig {
        include_patterns: vec!["a[".to_string()],
        ..disk_config(dir.path())
    };
    let err = CacheManager::open(&bad_glob).await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::Config(ConfigError::Invalid { field: "cache.include_patterns", .. })
    ));
}
