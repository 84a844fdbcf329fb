//! Concurrency behaviour of the topology cache.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::rstest;
use tokio::task::JoinSet;
use topogen::test_support::CountingDiscoverer;
use topogen::{CacheError, TopologyCache};

const CALLERS: usize = 16;

fn slow_cache() -> Arc<TopologyCache<CountingDiscoverer>> {
    Arc::new(TopologyCache::new(
        CountingDiscoverer::new().with_delay(Duration::from_millis(50)),
    ))
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lookups_share_one_discovery() {
    let cache = slow_cache();
    let mut tasks = JoinSet::new();
    for _ in 0..CALLERS {
        let shared = Arc::clone(&cache);
        tasks.spawn(async move { shared.get(Utf8Path::new("/project/topology.json")).await });
    }

    let mut topologies = Vec::with_capacity(CALLERS);
    while let Some(joined) = tasks.join_next().await {
        let topology = joined
            .unwrap_or_else(|err| panic!("lookup task panicked: {err}"))
            .unwrap_or_else(|err| panic!("lookup should succeed: {err}"));
        topologies.push(topology);
    }

    assert_eq!(cache.discoverer().discover_calls(), 1);
    assert_eq!(topologies.len(), CALLERS);
    assert!(
        topologies
            .windows(2)
            .all(|pair| matches!(pair, [left, right] if Arc::ptr_eq(left, right)))
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_source_does_not_block_other_sources() {
    let cache = slow_cache();
    cache.discoverer().fail_for("/broken/topology.json");
    let broken = Utf8PathBuf::from("/broken/topology.json");
    let healthy = Utf8PathBuf::from("/healthy/topology.json");

    let (broken_first, healthy_first) = tokio::join!(cache.get(&broken), cache.get(&healthy));
    let broken_again = cache.get(&broken).await;

    assert!(healthy_first.is_ok(), "healthy source should resolve");
    let Err(CacheError::Discovery(first)) = broken_first else {
        panic!("broken source should fail discovery");
    };
    assert_eq!(broken_again, Err(CacheError::Discovery(first)));
    assert_eq!(cache.discoverer().discover_calls(), 2);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_probes_share_one_probe() {
    let cache = slow_cache();
    let source = Utf8Path::new("/project/topology.json");

    let (first, second, third) = tokio::join!(
        cache.is_source(source),
        cache.is_source(source),
        cache.is_source(source)
    );

    assert_eq!((first, second, third), (Ok(true), Ok(true), Ok(true)));
    assert_eq!(cache.discoverer().probe_calls(), 1);
    assert_eq!(cache.discoverer().discover_calls(), 0);
}
