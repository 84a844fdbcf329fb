//! Staged merge of a generated file tree into a working directory.
//!
//! The tree is first written into a private staging directory. Each staged
//! file is then compared with the destination: missing files are copied,
//! byte-identical ones are skipped and differing ones are collected as
//! conflicts. All conflicts go to the console in a single batch and only
//! the accepted subset is copied out. The staging directory is removed when
//! the merge returns, whether it succeeds, fails or unwinds.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use crate::console::{ConflictDecision, Console, ConsoleError};
use crate::vfs::VirtualFileTree;

const STAGING_PREFIX: &str = "topogen-staging-";

/// Errors raised while staging or merging generated files.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MergeError {
    /// Raised when a filesystem operation fails.
    #[error("failed to {action} {path}: {message}")]
    Io {
        /// Operation that failed.
        action: &'static str,
        /// Path involved.
        path: Utf8PathBuf,
        /// Underlying error text.
        message: String,
    },
    /// Raised when exporting into a directory that already holds different
    /// files at generated paths.
    #[error("output directory already contains different files: {}", join(.paths))]
    Occupied {
        /// Generated paths that would be overwritten.
        paths: Vec<Utf8PathBuf>,
    },
    /// Raised when the conflict prompt fails or is dismissed.
    #[error(transparent)]
    Console(#[from] ConsoleError),
}

fn join(paths: &[Utf8PathBuf]) -> String {
    paths
        .iter()
        .map(Utf8PathBuf::as_path)
        .map(Utf8Path::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// How a generated file relates to the destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileStatus {
    /// No file exists at the destination path.
    New,
    /// The destination holds identical bytes.
    Unchanged,
    /// The destination holds different bytes.
    Conflict,
}

impl FileStatus {
    /// Short label used in listings.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Unchanged => "unchanged",
            Self::Conflict => "conflict",
        }
    }
}

/// Classification of every generated path against a destination.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergePlan {
    entries: BTreeMap<Utf8PathBuf, FileStatus>,
}

impl MergePlan {
    /// Iterates over paths and their status in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&Utf8Path, FileStatus)> {
        self.entries
            .iter()
            .map(|(path, status)| (path.as_path(), *status))
    }

    /// Paths whose destination differs from the generated content.
    #[must_use]
    pub fn conflicts(&self) -> Vec<Utf8PathBuf> {
        self.with_status(FileStatus::Conflict)
    }

    /// Paths with the given status.
    #[must_use]
    pub fn with_status(&self, status: FileStatus) -> Vec<Utf8PathBuf> {
        self.entries
            .iter()
            .filter(|(_, current)| **current == status)
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Number of classified paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing was classified.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a merge did to each generated path.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergeReport {
    /// Paths copied into the destination.
    pub written: Vec<Utf8PathBuf>,
    /// Conflicting paths left as they were.
    pub kept: Vec<Utf8PathBuf>,
    /// Paths skipped because the destination already matched.
    pub unchanged: Vec<Utf8PathBuf>,
}

/// Applies generated trees to a destination through a staging directory.
#[derive(Debug)]
pub struct StagedMerge<'a, C: ?Sized> {
    console: &'a C,
    staging_parent: Option<Utf8PathBuf>,
}

impl<'a, C> StagedMerge<'a, C>
where
    C: Console + ?Sized,
{
    /// Creates a merge that resolves conflicts through `console` and stages
    /// under the system temporary directory.
    #[must_use]
    pub const fn new(console: &'a C) -> Self {
        Self {
            console,
            staging_parent: None,
        }
    }

    /// Stages under `parent` instead of the system temporary directory.
    #[must_use]
    pub fn with_staging_parent(mut self, parent: impl Into<Utf8PathBuf>) -> Self {
        self.staging_parent = Some(parent.into());
        self
    }

    /// Classifies every generated path against `root` without writing to
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Io`] when staging or reading the destination
    /// fails.
    pub fn preview(&self, tree: &VirtualFileTree, root: &Utf8Path) -> Result<MergePlan, MergeError> {
        let staging = Staging::create(self.staging_parent.as_deref())?;
        staging.write_tree(tree)?;
        let plan = staging.classify(tree, root)?;
        staging.close()?;
        Ok(plan)
    }

    /// Merges `tree` into `root`.
    ///
    /// New files are copied, identical files are skipped and conflicting
    /// files are decided in one console prompt. `root` is created when
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Console`] when conflicts cannot be resolved and
    /// [`MergeError::Io`] when staging, comparing or copying fails. Files
    /// already copied before a failure stay in place.
    pub fn apply(&self, tree: &VirtualFileTree, root: &Utf8Path) -> Result<MergeReport, MergeError> {
        let staging = Staging::create(self.staging_parent.as_deref())?;
        staging.write_tree(tree)?;
        let plan = staging.classify(tree, root)?;

        let conflicts = plan.conflicts();
        let decisions = if conflicts.is_empty() {
            BTreeMap::new()
        } else {
            info!(
                count = conflicts.len(),
                "generated files differ from the working tree"
            );
            self.console.resolve_conflicts(&conflicts)?
        };

        let target = create_dir(root)?;
        let mut report = MergeReport::default();
        for (path, status) in plan.iter() {
            let accepted = match status {
                FileStatus::New => true,
                FileStatus::Unchanged => {
                    sync_mode(tree, path, &target, root)?;
                    debug!(path = %path, "skipping identical file");
                    report.unchanged.push(path.to_owned());
                    continue;
                }
                FileStatus::Conflict => {
                    matches!(decisions.get(path), Some(ConflictDecision::Overwrite))
                }
            };
            if accepted {
                staging.copy_out(tree, path, &target, root)?;
                debug!(path = %path, "wrote generated file");
                report.written.push(path.to_owned());
            } else {
                info!(path = %path, "kept existing file");
                report.kept.push(path.to_owned());
            }
        }

        staging.close()?;
        Ok(report)
    }

    /// Writes `tree` into `root`, which must not already hold different
    /// files at generated paths.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Occupied`] listing the clashing paths, or
    /// [`MergeError::Io`] when staging or copying fails.
    pub fn export(&self, tree: &VirtualFileTree, root: &Utf8Path) -> Result<MergeReport, MergeError> {
        let staging = Staging::create(self.staging_parent.as_deref())?;
        staging.write_tree(tree)?;
        let plan = staging.classify(tree, root)?;

        let occupied = plan.conflicts();
        if !occupied.is_empty() {
            return Err(MergeError::Occupied { paths: occupied });
        }

        let target = create_dir(root)?;
        let mut report = MergeReport::default();
        for path in plan.with_status(FileStatus::New) {
            staging.copy_out(tree, &path, &target, root)?;
            report.written.push(path);
        }
        for path in plan.with_status(FileStatus::Unchanged) {
            sync_mode(tree, &path, &target, root)?;
            report.unchanged.push(path);
        }
        staging.close()?;
        Ok(report)
    }
}

/// A scoped staging directory, removed on drop.
struct Staging {
    dir: Dir,
    root: Utf8PathBuf,
    guard: TempDir,
}

impl Staging {
    fn create(parent: Option<&Utf8Path>) -> Result<Self, MergeError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX);
        let created = parent.map_or_else(|| builder.tempdir(), |path| builder.tempdir_in(path));
        let guard = created.map_err(|err| {
            io_error(
                "create staging directory in",
                parent.map_or_else(|| Utf8PathBuf::from("<temp>"), Utf8Path::to_path_buf),
                &err,
            )
        })?;
        let root = Utf8PathBuf::from_path_buf(guard.path().to_path_buf()).map_err(|path| {
            MergeError::Io {
                action: "use staging directory",
                path: Utf8PathBuf::from(path.to_string_lossy().into_owned()),
                message: String::from("path is not valid UTF-8"),
            }
        })?;
        let dir = Dir::open_ambient_dir(&root, ambient_authority())
            .map_err(|err| io_error("open staging directory", root.clone(), &err))?;
        debug!(path = %root, "created staging directory");
        Ok(Self { dir, root, guard })
    }

    fn write_tree(&self, tree: &VirtualFileTree) -> Result<(), MergeError> {
        for (path, file) in tree.iter() {
            write_file(&self.dir, &self.root, path, &file.contents, file.mode)?;
        }
        Ok(())
    }

    fn classify(&self, tree: &VirtualFileTree, root: &Utf8Path) -> Result<MergePlan, MergeError> {
        let target = open_existing(root)?;
        let mut entries = BTreeMap::new();
        for path in tree.paths() {
            let staged = self
                .dir
                .read(path)
                .map_err(|err| io_error("read staged file", self.root.join(path), &err))?;
            let status = match target.as_ref().map(|dir| dir.read(path)) {
                None => FileStatus::New,
                Some(Ok(existing)) if existing == staged => FileStatus::Unchanged,
                Some(Ok(_)) => FileStatus::Conflict,
                Some(Err(err)) if err.kind() == io::ErrorKind::NotFound => FileStatus::New,
                Some(Err(err)) => return Err(io_error("read", root.join(path), &err)),
            };
            entries.insert(path.to_owned(), status);
        }
        Ok(MergePlan { entries })
    }

    fn copy_out(
        &self,
        tree: &VirtualFileTree,
        path: &Utf8Path,
        target: &Dir,
        root: &Utf8Path,
    ) -> Result<(), MergeError> {
        let contents = self
            .dir
            .read(path)
            .map_err(|err| io_error("read staged file", self.root.join(path), &err))?;
        write_file(target, root, path, &contents, file_mode(tree, path))
    }

    fn close(self) -> Result<(), MergeError> {
        let Self { dir, root, guard } = self;
        drop(dir);
        guard
            .close()
            .map_err(|err| io_error("remove staging directory", root.clone(), &err))?;
        debug!(path = %root, "removed staging directory");
        Ok(())
    }
}

fn file_mode(tree: &VirtualFileTree, path: &Utf8Path) -> u32 {
    tree.get(path)
        .map_or(crate::vfs::DEFAULT_FILE_MODE, |file| file.mode)
}

/// Re-applies the generated mode to a file whose contents already match.
fn sync_mode(
    tree: &VirtualFileTree,
    path: &Utf8Path,
    target: &Dir,
    root: &Utf8Path,
) -> Result<(), MergeError> {
    set_mode(target, path, file_mode(tree, path))
        .map_err(|err| io_error("set permissions on", root.join(path), &err))
}

fn open_existing(root: &Utf8Path) -> Result<Option<Dir>, MergeError> {
    match Dir::open_ambient_dir(root, ambient_authority()) {
        Ok(dir) => Ok(Some(dir)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error("open", root.to_path_buf(), &err)),
    }
}

fn create_dir(root: &Utf8Path) -> Result<Dir, MergeError> {
    Dir::create_ambient_dir_all(root, ambient_authority())
        .map_err(|err| io_error("create", root.to_path_buf(), &err))?;
    Dir::open_ambient_dir(root, ambient_authority())
        .map_err(|err| io_error("open", root.to_path_buf(), &err))
}

fn write_file(
    dir: &Dir,
    root: &Utf8Path,
    path: &Utf8Path,
    contents: &[u8],
    mode: u32,
) -> Result<(), MergeError> {
    if let Some(parent) = path.parent()
        && !parent.as_str().is_empty()
    {
        dir.create_dir_all(parent)
            .map_err(|err| io_error("create", root.join(parent), &err))?;
    }
    dir.write(path, contents)
        .map_err(|err| io_error("write", root.join(path), &err))?;
    set_mode(dir, path, mode).map_err(|err| io_error("set permissions on", root.join(path), &err))
}

#[cfg(unix)]
fn set_mode(dir: &Dir, path: &Utf8Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let permissions = cap_std::fs::Permissions::from_std(std::fs::Permissions::from_mode(mode));
    dir.set_permissions(path, permissions)
}

#[cfg(not(unix))]
const fn set_mode(_dir: &Dir, _path: &Utf8Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn io_error(action: &'static str, path: Utf8PathBuf, err: &io::Error) -> MergeError {
    MergeError::Io {
        action,
        path,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::test_support::ScriptedConsole;

    struct Workspace {
        _dir: TempDir,
        root: Utf8PathBuf,
        staging: Utf8PathBuf,
    }

    impl Workspace {
        fn read(&self, path: &str) -> String {
            fs::read_to_string(self.root.join(path))
                .unwrap_or_else(|err| panic!("read {path}: {err}"))
        }

        fn write(&self, path: &str, contents: &str) {
            let target = self.root.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).unwrap_or_else(|err| panic!("mkdir {parent}: {err}"));
            }
            fs::write(&target, contents).unwrap_or_else(|err| panic!("write {target}: {err}"));
        }

        fn staging_is_empty(&self) -> bool {
            fs::read_dir(&self.staging)
                .unwrap_or_else(|err| panic!("list staging parent: {err}"))
                .next()
                .is_none()
        }
    }

    #[fixture]
    fn workspace() -> Workspace {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non UTF-8 temp dir: {}", path.display()));
        let root = base.join("project");
        let staging = base.join("staging");
        fs::create_dir_all(&staging).unwrap_or_else(|err| panic!("mkdir staging: {err}"));
        Workspace {
            _dir: dir,
            root,
            staging,
        }
    }

    fn tree() -> VirtualFileTree {
        let mut tree = VirtualFileTree::new();
        tree.insert("infra/main.bicep", "targetScope = 'subscription'\n")
            .unwrap_or_else(|err| panic!("insert: {err}"));
        tree.insert("src/Web/manifests/containerApp.tmpl.yaml", "name: web\n")
            .unwrap_or_else(|err| panic!("insert: {err}"));
        tree
    }

    fn merge<'a>(console: &'a ScriptedConsole, workspace: &Workspace) -> StagedMerge<'a, ScriptedConsole> {
        StagedMerge::new(console).with_staging_parent(workspace.staging.clone())
    }

    #[rstest]
    fn apply_copies_new_files_without_prompting(workspace: Workspace) {
        let console = ScriptedConsole::new();

        let report = merge(&console, &workspace)
            .apply(&tree(), &workspace.root)
            .unwrap_or_else(|err| panic!("apply: {err}"));

        assert_eq!(report.written.len(), 2);
        assert_eq!(workspace.read("src/Web/manifests/containerApp.tmpl.yaml"), "name: web\n");
        assert!(console.conflict_prompts().is_empty());
        assert!(workspace.staging_is_empty());
    }

    #[rstest]
    fn second_apply_is_idempotent(workspace: Workspace) {
        let console = ScriptedConsole::new();
        let merger = merge(&console, &workspace);
        merger
            .apply(&tree(), &workspace.root)
            .unwrap_or_else(|err| panic!("first apply: {err}"));

        let report = merger
            .apply(&tree(), &workspace.root)
            .unwrap_or_else(|err| panic!("second apply: {err}"));

        assert!(report.written.is_empty());
        assert!(report.kept.is_empty());
        assert_eq!(report.unchanged.len(), 2);
        assert!(console.conflict_prompts().is_empty());
    }

    #[rstest]
    #[case::overwrite(ConflictDecision::Overwrite, "targetScope = 'subscription'\n")]
    #[case::keep(ConflictDecision::Keep, "// edited by hand\n")]
    fn conflicts_follow_the_console_decision(
        workspace: Workspace,
        #[case] decision: ConflictDecision,
        #[case] expected: &str,
    ) {
        workspace.write("infra/main.bicep", "// edited by hand\n");
        let console = ScriptedConsole::new();
        console.push_conflict_decision(decision);

        let report = merge(&console, &workspace)
            .apply(&tree(), &workspace.root)
            .unwrap_or_else(|err| panic!("apply: {err}"));

        assert_eq!(workspace.read("infra/main.bicep"), expected);
        assert_eq!(
            console.conflict_prompts(),
            vec![vec![Utf8PathBuf::from("infra/main.bicep")]]
        );
        let touched = report.written.len() + report.kept.len();
        assert_eq!(touched, 2);
    }

    #[rstest]
    fn all_conflicts_are_surfaced_in_one_prompt(workspace: Workspace) {
        workspace.write("infra/main.bicep", "old\n");
        workspace.write("src/Web/manifests/containerApp.tmpl.yaml", "old\n");
        let console = ScriptedConsole::new();
        console.push_conflict_decision(ConflictDecision::Keep);

        merge(&console, &workspace)
            .apply(&tree(), &workspace.root)
            .unwrap_or_else(|err| panic!("apply: {err}"));

        let prompts = console.conflict_prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts.first().map(Vec::len), Some(2));
    }

    #[rstest]
    fn failed_prompt_leaves_destination_and_removes_staging(workspace: Workspace) {
        workspace.write("infra/main.bicep", "old\n");
        let console = ScriptedConsole::new();

        let err = merge(&console, &workspace)
            .apply(&tree(), &workspace.root)
            .expect_err("unanswered prompt should fail");

        assert!(matches!(err, MergeError::Console(_)), "{err}");
        assert_eq!(workspace.read("infra/main.bicep"), "old\n");
        assert!(!workspace.root.join("src").exists());
        assert!(workspace.staging_is_empty());
    }

    #[rstest]
    fn preview_classifies_without_writing(workspace: Workspace) {
        workspace.write("infra/main.bicep", "targetScope = 'subscription'\n");
        let console = ScriptedConsole::new();

        let plan = merge(&console, &workspace)
            .preview(&tree(), &workspace.root)
            .unwrap_or_else(|err| panic!("preview: {err}"));

        let statuses: Vec<_> = plan.iter().map(|(_, status)| status).collect();
        assert_eq!(statuses, vec![FileStatus::Unchanged, FileStatus::New]);
        assert!(!workspace.root.join("src").exists());
    }

    #[rstest]
    fn export_refuses_occupied_paths(workspace: Workspace) {
        workspace.write("infra/main.bicep", "other\n");
        let console = ScriptedConsole::new();

        let err = merge(&console, &workspace)
            .export(&tree(), &workspace.root)
            .expect_err("occupied output should fail");

        assert_eq!(
            err,
            MergeError::Occupied {
                paths: vec![Utf8PathBuf::from("infra/main.bicep")],
            }
        );
    }

    #[cfg(unix)]
    #[rstest]
    fn file_modes_are_preserved(workspace: Workspace) {
        use std::os::unix::fs::PermissionsExt;

        let mut tree = VirtualFileTree::new();
        tree.insert_with_mode("scripts/deploy.sh", "#!/bin/sh\n", 0o755)
            .unwrap_or_else(|err| panic!("insert: {err}"));
        let console = ScriptedConsole::new();

        merge(&console, &workspace)
            .apply(&tree, &workspace.root)
            .unwrap_or_else(|err| panic!("apply: {err}"));

        let mode = fs::metadata(workspace.root.join("scripts/deploy.sh"))
            .unwrap_or_else(|err| panic!("metadata: {err}"))
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[rstest]
    #[case::apply(false)]
    #[case::export(true)]
    fn identical_files_regain_the_generated_mode(workspace: Workspace, #[case] export: bool) {
        use std::os::unix::fs::PermissionsExt;

        let mut tree = VirtualFileTree::new();
        tree.insert_with_mode("scripts/deploy.sh", "#!/bin/sh\n", 0o755)
            .unwrap_or_else(|err| panic!("insert: {err}"));
        workspace.write("scripts/deploy.sh", "#!/bin/sh\n");
        let script = workspace.root.join("scripts/deploy.sh");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o600))
            .unwrap_or_else(|err| panic!("chmod: {err}"));
        let console = ScriptedConsole::new();
        let merger = merge(&console, &workspace);

        let report = if export {
            merger.export(&tree, &workspace.root)
        } else {
            merger.apply(&tree, &workspace.root)
        }
        .unwrap_or_else(|err| panic!("merge: {err}"));

        assert_eq!(report.unchanged, vec![Utf8PathBuf::from("scripts/deploy.sh")]);
        assert!(report.written.is_empty());
        assert!(console.conflict_prompts().is_empty());
        let mode = fs::metadata(&script)
            .unwrap_or_else(|err| panic!("metadata: {err}"))
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
