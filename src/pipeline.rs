//! Sequences discovery, exposure, synthesis and merge.
//!
//! The orchestrator owns one topology cache for the invocation. Topologies
//! handed out by the cache are shared, so each run clones its own copy
//! before exposure decisions are written into it; synthesis only starts once
//! the selector has finished with that copy.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use crate::cache::{CacheError, TopologyCache};
use crate::console::Console;
use crate::discovery::Discoverer;
use crate::exposure::{DecisionStore, ExposureError, ExposureOutcome, ExposureSelector};
use crate::merge::{MergeError, MergePlan, MergeReport, StagedMerge};
use crate::synth::{DeploymentScope, SynthesisError, Synthesizer};
use crate::topology::{Resource, Topology};
use crate::vfs::VirtualFileTree;

/// Directory holding the shared infrastructure artifacts.
pub const INFRA_DIR: &str = "infra";

/// Errors surfaced by the synthesis pipeline.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PipelineError {
    /// Raised when the probe says the source cannot be synthesized.
    #[error("{path} is not a topology manifest")]
    NotASource {
        /// Probed source.
        path: Utf8PathBuf,
    },
    /// Raised when discovery fails or is cancelled.
    #[error(transparent)]
    Discovery(#[from] CacheError),
    /// Raised when exposure cannot be decided.
    #[error(transparent)]
    Exposure(#[from] ExposureError),
    /// Raised when templates cannot be synthesized.
    #[error("template synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),
    /// Raised when generated files cannot be merged.
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Result of a full `init` run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitSummary {
    /// Exposure decision applied before synthesis.
    pub exposure: ExposureOutcome,
    /// What the merge did to the working tree.
    pub merge: MergeReport,
}

/// One service of a topology, as listed by [`SynthesisOrchestrator::services`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceSummary {
    /// Resource name.
    pub name: String,
    /// Kind label.
    pub kind: &'static str,
    /// Project path relative to the manifest, if declared.
    pub path: Option<Utf8PathBuf>,
    /// Name and port of the binding that would carry ingress.
    pub binding: Option<(String, u16)>,
    /// Whether the service is reachable from outside the environment.
    pub exposed: bool,
}

/// Runs the synthesis pipeline for one deployment scope.
#[derive(Debug)]
pub struct SynthesisOrchestrator<D, S, C> {
    cache: TopologyCache<D>,
    store: S,
    console: C,
    synthesizer: Synthesizer,
    scope: DeploymentScope,
    service: String,
    staging_parent: Option<Utf8PathBuf>,
}

impl<D, S, C> SynthesisOrchestrator<D, S, C>
where
    D: Discoverer,
    S: DecisionStore,
    C: Console,
{
    /// Creates an orchestrator persisting exposure decisions under
    /// `service`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Synthesis`] when the embedded templates fail
    /// to load.
    pub fn new(
        cache: TopologyCache<D>,
        store: S,
        console: C,
        scope: DeploymentScope,
        service: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            cache,
            store,
            console,
            synthesizer: Synthesizer::new()?,
            scope,
            service: service.into(),
            staging_parent: None,
        })
    }

    /// Stages merges under `parent` instead of the system temporary
    /// directory.
    #[must_use]
    pub fn with_staging_parent(mut self, parent: impl Into<Utf8PathBuf>) -> Self {
        self.staging_parent = Some(parent.into());
        self
    }

    /// The console used for prompts.
    #[must_use]
    pub const fn console(&self) -> &C {
        &self.console
    }

    /// The decision store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Decides exposure, synthesizes every artifact and merges them into
    /// `root`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] from whichever stage failed. Nothing is
    /// written to `root` unless synthesis succeeded.
    pub async fn init(&self, source: &Utf8Path, root: &Utf8Path) -> Result<InitSummary, PipelineError> {
        let mut topology = self.load(source).await?;
        let exposure = self.selector().apply(&mut topology)?;
        let tree = self.synthesizer.synthesize(&topology, &self.scope)?;
        let merge = self.merger().apply(&tree, root)?;
        info!(
            written = merge.written.len(),
            kept = merge.kept.len(),
            unchanged = merge.unchanged.len(),
            "merged generated files"
        );
        Ok(InitSummary { exposure, merge })
    }

    /// Classifies every generated path against `root` without prompting or
    /// writing.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] from whichever stage failed.
    pub async fn preview(&self, source: &Utf8Path, root: &Utf8Path) -> Result<MergePlan, PipelineError> {
        let tree = self.synthesize_recorded(source).await?;
        Ok(self.merger().preview(&tree, root)?)
    }

    /// Writes the shared infrastructure artifacts into `out`, which must
    /// not already hold different files at those paths.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] from whichever stage failed.
    pub async fn render(&self, source: &Utf8Path, out: &Utf8Path) -> Result<MergeReport, PipelineError> {
        let tree = self
            .synthesize_recorded(source)
            .await?
            .filtered(|path| path.starts_with(INFRA_DIR));
        let report = self.merger().export(&tree, out)?;
        info!(out = %out, written = report.written.len(), "rendered infrastructure");
        Ok(report)
    }

    /// Lists the services of the topology at `source`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when discovery fails or recorded decisions
    /// cannot be read.
    pub async fn services(&self, source: &Utf8Path) -> Result<Vec<ServiceSummary>, PipelineError> {
        let mut topology = self.load(source).await?;
        self.selector().apply_recorded(&mut topology)?;
        Ok(topology.services().map(summarize).collect())
    }

    async fn load(&self, source: &Utf8Path) -> Result<Topology, PipelineError> {
        if !self.cache.is_source(source).await? {
            return Err(PipelineError::NotASource {
                path: source.to_path_buf(),
            });
        }
        let shared = self.cache.get(source).await?;
        Ok(Topology::clone(&shared))
    }

    async fn synthesize_recorded(&self, source: &Utf8Path) -> Result<VirtualFileTree, PipelineError> {
        let mut topology = self.load(source).await?;
        self.selector().apply_recorded(&mut topology)?;
        Ok(self.synthesizer.synthesize(&topology, &self.scope)?)
    }

    fn selector(&self) -> ExposureSelector<'_, S, C> {
        ExposureSelector::new(&self.store, &self.console, &self.service)
    }

    fn merger(&self) -> StagedMerge<'_, C> {
        self.staging_parent.as_ref().map_or_else(
            || StagedMerge::new(&self.console),
            |parent| StagedMerge::new(&self.console).with_staging_parent(parent.clone()),
        )
    }
}

fn summarize(resource: &Resource) -> ServiceSummary {
    ServiceSummary {
        name: resource.name().to_owned(),
        kind: resource.kind().label(),
        path: resource.path().map(Utf8Path::to_path_buf),
        binding: resource
            .primary_binding()
            .and_then(|binding| Some((binding.name.clone(), binding.target_port?))),
        exposed: resource.is_exposed(),
    }
}

/// Names of the services listed as exposed.
#[must_use]
pub fn exposed_services(summaries: &[ServiceSummary]) -> BTreeSet<&str> {
    summaries
        .iter()
        .filter(|summary| summary.exposed)
        .map(|summary| summary.name.as_str())
        .collect()
}
