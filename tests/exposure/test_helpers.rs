//! Shared fixtures for exposure BDD scenarios.

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::fixture;
use tempfile::TempDir;
use topogen::test_support::SAMPLE_MANIFEST;
use topogen::{EnvironmentStore, InitSummary};

pub const ENVIRONMENT: &str = "dev";
pub const SERVICE: &str = "app";
pub const MANIFEST: &str = "topology.json";

#[derive(Clone, Debug)]
pub enum InitOutcome {
    Succeeded(InitSummary),
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct InitRun {
    pub prompts: Vec<Vec<String>>,
    pub outcome: InitOutcome,
}

#[derive(Clone, Debug)]
pub struct ExposureContext {
    pub root: Utf8PathBuf,
    pub answers: Vec<Vec<String>>,
    pub runs: Vec<InitRun>,
    _project: Arc<TempDir>,
}

impl ExposureContext {
    pub fn store(&self) -> EnvironmentStore {
        EnvironmentStore::new(&self.root.join(".topogen"), ENVIRONMENT)
    }

    pub fn manifest(&self) -> Utf8PathBuf {
        self.root.join(MANIFEST)
    }
}

#[fixture]
pub fn exposure_context() -> ExposureContext {
    let project = TempDir::new().unwrap_or_else(|err| panic!("create project dir: {err}"));
    let root = Utf8PathBuf::from_path_buf(project.path().to_path_buf())
        .unwrap_or_else(|path| panic!("project dir is not UTF-8: {}", path.display()));
    ExposureContext {
        root,
        answers: Vec::new(),
        runs: Vec::new(),
        _project: Arc::new(project),
    }
}

pub fn write_sample_manifest(context: &ExposureContext) {
    fs::write(context.manifest(), SAMPLE_MANIFEST)
        .unwrap_or_else(|err| panic!("write sample manifest: {err}"));
}

/// Splits a comma-separated step argument into names.
pub fn names(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}
