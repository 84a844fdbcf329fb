//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::console::{ConflictDecision, Console, ConsoleError};
use crate::discovery::{Discoverer, DiscoveryError, DiscoveryFuture};
use crate::exposure::{DecisionStore, PersistedDecisions, StoreError};
use crate::manifest::parse_manifest;
use crate::topology::Topology;

/// Manifest describing two web services, a worker and their dependencies.
///
/// `web` and `api` are servable; `worker` has no bindings; `orders`,
/// `messaging` and `telemetry` are dependencies.
pub const SAMPLE_MANIFEST: &str = r#"{
  "resources": {
    "web": {
      "type": "project",
      "path": "src/Web/Web.csproj",
      "env": {
        "services__api__http__0": "{api.bindings.http.url}"
      },
      "bindings": {
        "http": { "scheme": "http", "transport": "http", "targetPort": 8080 }
      }
    },
    "api": {
      "type": "project",
      "path": "src/Api/Api.csproj",
      "env": {
        "ConnectionStrings__orders": "{orders.connectionString}",
        "Messaging__Endpoint": "{messaging.endpoint}"
      },
      "bindings": {
        "http": { "scheme": "http", "transport": "http", "targetPort": 8081 }
      }
    },
    "worker": {
      "type": "project",
      "path": "src/Worker/Worker.csproj",
      "env": {
        "ConnectionStrings__orders": "{orders.connectionString}"
      }
    },
    "orders": { "type": "postgres" },
    "messaging": { "type": "service-bus", "queues": ["jobs", "emails"] },
    "telemetry": { "type": "app-insights" }
  }
}"#;

/// Parses [`SAMPLE_MANIFEST`].
///
/// # Panics
///
/// Panics if the sample manifest stops parsing.
#[must_use]
pub fn sample_topology() -> Topology {
    parse_manifest(SAMPLE_MANIFEST)
        .unwrap_or_else(|err| panic!("sample manifest should parse: {err}"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Discoverer double that counts invocations and can be told to fail.
#[derive(Debug, Default)]
pub struct CountingDiscoverer {
    topology: Option<Topology>,
    delay: Duration,
    failing: Mutex<BTreeSet<Utf8PathBuf>>,
    discover_calls: AtomicUsize,
    probe_calls: AtomicUsize,
}

impl CountingDiscoverer {
    /// Creates a discoverer returning [`sample_topology`] for every path.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `topology` instead of the sample.
    #[must_use]
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Makes every discovery and probe take at least `delay`.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes discovery and probing of `path` fail.
    pub fn fail_for(&self, path: &str) {
        lock(&self.failing).insert(Utf8PathBuf::from(path));
    }

    /// Number of discoveries started so far.
    #[must_use]
    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    /// Number of probes started so far.
    #[must_use]
    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    async fn settle(&self, source: &Utf8Path) -> Result<(), DiscoveryError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if lock(&self.failing).contains(source) {
            return Err(DiscoveryError::Failed {
                path: source.to_path_buf(),
                message: String::from("scripted discovery failure"),
            });
        }
        Ok(())
    }
}

impl Discoverer for CountingDiscoverer {
    fn discover<'a>(&'a self, source: &'a Utf8Path) -> DiscoveryFuture<'a, Topology> {
        Box::pin(async move {
            self.discover_calls.fetch_add(1, Ordering::SeqCst);
            self.settle(source).await?;
            Ok(self.topology.clone().unwrap_or_else(sample_topology))
        })
    }

    fn probe<'a>(&'a self, source: &'a Utf8Path) -> DiscoveryFuture<'a, bool> {
        Box::pin(async move {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            self.settle(source).await?;
            Ok(true)
        })
    }
}

/// Console double answering prompts from pre-seeded queues.
///
/// When a queue runs dry the console behaves like a non-interactive one and
/// returns [`ConsoleError::NonInteractive`].
#[derive(Debug, Default)]
pub struct ScriptedConsole {
    selections: Mutex<VecDeque<Result<Vec<String>, ConsoleError>>>,
    conflict_answers: Mutex<VecDeque<ConflictDecision>>,
    selection_prompts: Mutex<Vec<Vec<String>>>,
    conflict_prompts: Mutex<Vec<Vec<Utf8PathBuf>>>,
}

impl ScriptedConsole {
    /// Creates a console with no queued answers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the answer to the next multi-select prompt.
    pub fn push_selection<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.selections).push_back(Ok(names.into_iter().map(Into::into).collect()));
    }

    /// Queues a failure for the next multi-select prompt.
    pub fn push_selection_error(&self, error: ConsoleError) {
        lock(&self.selections).push_back(Err(error));
    }

    /// Queues a decision applied to every path of the next conflict prompt.
    pub fn push_conflict_decision(&self, decision: ConflictDecision) {
        lock(&self.conflict_answers).push_back(decision);
    }

    /// Options offered by each multi-select prompt so far.
    #[must_use]
    pub fn selection_prompts(&self) -> Vec<Vec<String>> {
        lock(&self.selection_prompts).clone()
    }

    /// Paths offered by each conflict prompt so far.
    #[must_use]
    pub fn conflict_prompts(&self) -> Vec<Vec<Utf8PathBuf>> {
        lock(&self.conflict_prompts).clone()
    }
}

fn unanswered(prompt: &str) -> ConsoleError {
    ConsoleError::NonInteractive {
        prompt: prompt.to_owned(),
        hint: String::from("no scripted answer queued"),
    }
}

impl Console for ScriptedConsole {
    fn multi_select(&self, message: &str, options: &[String]) -> Result<Vec<String>, ConsoleError> {
        lock(&self.selection_prompts).push(options.to_vec());
        lock(&self.selections)
            .pop_front()
            .unwrap_or_else(|| Err(unanswered(message)))
    }

    fn resolve_conflicts(
        &self,
        conflicts: &[Utf8PathBuf],
    ) -> Result<BTreeMap<Utf8PathBuf, ConflictDecision>, ConsoleError> {
        lock(&self.conflict_prompts).push(conflicts.to_vec());
        let decision = lock(&self.conflict_answers)
            .pop_front()
            .ok_or_else(|| unanswered("resolve conflicts"))?;
        Ok(conflicts
            .iter()
            .map(|path| (path.clone(), decision))
            .collect())
    }
}

/// In-memory decision store.
#[derive(Debug)]
pub struct MemoryDecisionStore {
    decisions: Mutex<PersistedDecisions>,
    saved: Mutex<Option<BTreeSet<String>>>,
    save_calls: AtomicUsize,
    fail_saves: AtomicBool,
}

impl Default for MemoryDecisionStore {
    fn default() -> Self {
        Self::with_decisions(PersistedDecisions::Absent)
    }
}

impl MemoryDecisionStore {
    /// Creates a store with nothing recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that returns `decisions` until the first save.
    #[must_use]
    pub const fn with_decisions(decisions: PersistedDecisions) -> Self {
        Self {
            decisions: Mutex::new(decisions),
            saved: Mutex::new(None),
            save_calls: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Makes every later save fail.
    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }

    /// The most recently saved decision set.
    #[must_use]
    pub fn saved(&self) -> Option<BTreeSet<String>> {
        lock(&self.saved).clone()
    }

    /// Number of save attempts so far.
    #[must_use]
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }
}

impl DecisionStore for MemoryDecisionStore {
    fn load(&self, _service: &str) -> Result<PersistedDecisions, StoreError> {
        Ok(lock(&self.decisions).clone())
    }

    fn save(&self, _service: &str, exposed: &BTreeSet<String>) -> Result<(), StoreError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: Utf8PathBuf::from("memory"),
                message: String::from("scripted save failure"),
            });
        }
        *lock(&self.decisions) = PersistedDecisions::from_names(exposed.iter().cloned());
        *lock(&self.saved) = Some(exposed.clone());
        Ok(())
    }
}
