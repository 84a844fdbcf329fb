//! Core library for the topogen infrastructure generator.
//!
//! The crate turns an application topology (services, their bindings and
//! the backing resources they reference) into deployable infrastructure
//! templates. A run discovers the topology through a memoising cache,
//! settles which services are reachable from outside the environment,
//! synthesizes every artifact in memory and merges the result into the
//! working tree through a staging directory.

pub mod cache;
pub mod config;
pub mod console;
pub mod discovery;
pub mod exposure;
pub mod ident;
pub mod manifest;
pub mod merge;
pub mod pipeline;
pub mod synth;
pub mod test_support;
pub mod topology;
pub mod vfs;

pub use cache::{CacheError, TopologyCache};
pub use config::{ConfigError, TopogenConfig};
pub use console::{ConflictDecision, Console, ConsoleError, TerminalConsole};
pub use discovery::{Discoverer, DiscoveryError, ManifestDiscoverer};
pub use exposure::{
    DecisionSource, DecisionStore, EnvironmentStore, ExposureError, ExposureOutcome,
    ExposureSelector, StoreError,
};
pub use manifest::{ManifestError, parse_manifest};
pub use merge::{FileStatus, MergeError, MergePlan, MergeReport, StagedMerge};
pub use pipeline::{InitSummary, PipelineError, ServiceSummary, SynthesisOrchestrator};
pub use synth::{DeploymentScope, SynthesisError, Synthesizer};
pub use topology::{Binding, DependencyKind, Resource, ResourceKind, Topology, TopologyError};
pub use vfs::{VirtualFile, VirtualFileTree};
