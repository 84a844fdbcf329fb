//! Per-process memoisation of topology discovery.
//!
//! Both caches use per-key single-flight acquisition: at most one discovery
//! runs for a given source path, concurrent callers for that path await the
//! in-flight result, and distinct paths proceed in parallel. Outcomes,
//! including failures, are kept for the lifetime of the cache so a failing
//! source is not rediscovered within one invocation. Entries are never
//! invalidated; a new process starts with an empty cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::discovery::{Discoverer, DiscoveryError};
use crate::topology::Topology;

/// Errors returned by cache lookups.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CacheError {
    /// The discovery collaborator failed; the failure is cached.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    /// The invocation was cancelled while the lookup was in flight.
    #[error("topology discovery for {path} was cancelled")]
    Cancelled {
        /// Source path being discovered.
        path: Utf8PathBuf,
    },
}

type Slot<V> = Arc<OnceCell<Result<V, DiscoveryError>>>;

/// Map from key to an in-progress or completed computation.
#[derive(Debug)]
struct SingleFlight<V> {
    label: &'static str,
    slots: Mutex<HashMap<Utf8PathBuf, Slot<V>>>,
}

impl<V: Clone> SingleFlight<V> {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &Utf8Path) -> Slot<V> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.to_path_buf()).or_default())
    }

    async fn get_or_run<F, Fut>(
        &self,
        key: &Utf8Path,
        cancel: &CancellationToken,
        run: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, DiscoveryError>>,
    {
        let slot = self.slot(key);
        if let Some(outcome) = slot.get() {
            debug!(cache = self.label, path = %key, "cache hit");
            return outcome.clone().map_err(CacheError::from);
        }

        let outcome = slot
            .get_or_try_init(|| async {
                debug!(cache = self.label, path = %key, "cache miss");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(CacheError::Cancelled {
                        path: key.to_path_buf(),
                    }),
                    result = run() => Ok(result),
                }
            })
            .await?;
        outcome.clone().map_err(CacheError::from)
    }
}

/// Memoises topology discovery and the companion source probe.
#[derive(Debug)]
pub struct TopologyCache<D> {
    discoverer: D,
    topologies: SingleFlight<Arc<Topology>>,
    probes: SingleFlight<bool>,
    cancel: CancellationToken,
}

impl<D: Discoverer> TopologyCache<D> {
    /// Creates an empty cache over `discoverer`.
    #[must_use]
    pub fn new(discoverer: D) -> Self {
        Self {
            discoverer,
            topologies: SingleFlight::new("topology"),
            probes: SingleFlight::new("probe"),
            cancel: CancellationToken::new(),
        }
    }

    /// Ties in-flight lookups to the invocation's cancellation signal. When
    /// the token fires, the running discovery is dropped and every waiter
    /// receives [`CacheError::Cancelled`].
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the topology for `source`, discovering it on first use.
    ///
    /// `source` should be absolute so equivalent paths share an entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Discovery`] when discovery fails (now or on an
    /// earlier call) and [`CacheError::Cancelled`] when cancelled.
    pub async fn get(&self, source: &Utf8Path) -> Result<Arc<Topology>, CacheError> {
        self.topologies
            .get_or_run(source, &self.cancel, || async {
                self.discoverer.discover(source).await.map(Arc::new)
            })
            .await
    }

    /// Returns whether `source` is a synthesizable topology source, probing
    /// it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Discovery`] when the probe fails and
    /// [`CacheError::Cancelled`] when cancelled.
    pub async fn is_source(&self, source: &Utf8Path) -> Result<bool, CacheError> {
        self.probes
            .get_or_run(source, &self.cancel, || self.discoverer.probe(source))
            .await
    }

    /// The wrapped discovery collaborator.
    #[must_use]
    pub const fn discoverer(&self) -> &D {
        &self.discoverer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CountingDiscoverer;

    fn path(value: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(value)
    }

    #[tokio::test]
    async fn get_discovers_once_per_path() {
        let cache = TopologyCache::new(CountingDiscoverer::new());

        let first = cache
            .get(&path("/app/topology.json"))
            .await
            .unwrap_or_else(|err| panic!("first get: {err}"));
        let second = cache
            .get(&path("/app/topology.json"))
            .await
            .unwrap_or_else(|err| panic!("second get: {err}"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.discoverer().discover_calls(), 1);
    }

    #[tokio::test]
    async fn get_caches_failures() {
        let discoverer = CountingDiscoverer::new();
        discoverer.fail_for("/broken/topology.json");
        let cache = TopologyCache::new(discoverer);

        for _ in 0..3 {
            let err = cache
                .get(&path("/broken/topology.json"))
                .await
                .expect_err("broken source should fail");
            assert!(matches!(err, CacheError::Discovery(_)), "{err}");
        }
        assert_eq!(cache.discoverer().discover_calls(), 1);
    }

    #[tokio::test]
    async fn probe_cache_is_independent_of_topology_cache() {
        let cache = TopologyCache::new(CountingDiscoverer::new());

        let is_source = cache
            .is_source(&path("/app/topology.json"))
            .await
            .unwrap_or_else(|err| panic!("probe: {err}"));
        cache
            .is_source(&path("/app/topology.json"))
            .await
            .unwrap_or_else(|err| panic!("probe: {err}"));

        assert!(is_source);
        assert_eq!(cache.discoverer().probe_calls(), 1);
        assert_eq!(cache.discoverer().discover_calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_lookup_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let cache = TopologyCache::new(CountingDiscoverer::new()).with_cancellation(cancel);

        let err = cache
            .get(&path("/app/topology.json"))
            .await
            .expect_err("cancelled lookup should fail");

        assert!(matches!(err, CacheError::Cancelled { .. }), "{err}");
        assert_eq!(cache.discoverer().discover_calls(), 0);
    }
}
