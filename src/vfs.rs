//! In-memory file tree produced by synthesis.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Default permission bits for generated files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Errors raised when inserting into a [`VirtualFileTree`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VfsError {
    /// Raised when a path is absolute or escapes the tree root.
    #[error("generated path {path} must be relative and stay inside the output root")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Raised when two artifacts claim the same path.
    #[error("generated path {path} was produced twice")]
    DuplicatePath {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

/// A generated file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VirtualFile {
    /// File contents.
    pub contents: Vec<u8>,
    /// Unix permission bits.
    pub mode: u32,
}

/// Relative paths mapped to generated files, iterated in path order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VirtualFileTree {
    files: BTreeMap<Utf8PathBuf, VirtualFile>,
}

impl VirtualFileTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with [`DEFAULT_FILE_MODE`].
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::InvalidPath`] for absolute or escaping paths and
    /// [`VfsError::DuplicatePath`] when the path is already present.
    pub fn insert(
        &mut self,
        path: impl Into<Utf8PathBuf>,
        contents: impl Into<Vec<u8>>,
    ) -> Result<(), VfsError> {
        self.insert_with_mode(path, contents, DEFAULT_FILE_MODE)
    }

    /// Adds a file with explicit permission bits.
    ///
    /// # Errors
    ///
    /// See [`Self::insert`].
    pub fn insert_with_mode(
        &mut self,
        path: impl Into<Utf8PathBuf>,
        contents: impl Into<Vec<u8>>,
        mode: u32,
    ) -> Result<(), VfsError> {
        let target = path.into();
        if !is_contained(&target) {
            return Err(VfsError::InvalidPath { path: target });
        }
        match self.files.entry(target) {
            Entry::Occupied(entry) => Err(VfsError::DuplicatePath {
                path: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(VirtualFile {
                    contents: contents.into(),
                    mode,
                });
                Ok(())
            }
        }
    }

    /// Looks up a file.
    #[must_use]
    pub fn get(&self, path: &Utf8Path) -> Option<&VirtualFile> {
        self.files.get(path)
    }

    /// Looks up a file's contents as text.
    #[must_use]
    pub fn text(&self, path: &Utf8Path) -> Option<&str> {
        self.get(path)
            .and_then(|file| std::str::from_utf8(&file.contents).ok())
    }

    /// Iterates over files in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&Utf8Path, &VirtualFile)> {
        self.files.iter().map(|(path, file)| (path.as_path(), file))
    }

    /// Iterates over paths in order.
    pub fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.files.keys().map(Utf8PathBuf::as_path)
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` when the tree holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Keeps only files whose path satisfies `keep`.
    #[must_use]
    pub fn filtered(mut self, keep: impl Fn(&Utf8Path) -> bool) -> Self {
        self.files.retain(|path, _| keep(path));
        self
    }
}

fn is_contained(path: &Utf8Path) -> bool {
    let mut has_normal = false;
    for component in path.components() {
        match component {
            Utf8Component::Normal(_) => has_normal = true,
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir | Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                return false;
            }
        }
    }
    has_normal
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn insert_keeps_paths_sorted() {
        let mut tree = VirtualFileTree::new();
        tree.insert("infra/resources.bicep", "b")
            .unwrap_or_else(|err| panic!("insert: {err}"));
        tree.insert("infra/main.bicep", "a")
            .unwrap_or_else(|err| panic!("insert: {err}"));

        let paths: Vec<&str> = tree.paths().map(Utf8Path::as_str).collect();
        assert_eq!(paths, vec!["infra/main.bicep", "infra/resources.bicep"]);
        assert_eq!(
            tree.get(Utf8Path::new("infra/main.bicep")).map(|f| f.mode),
            Some(DEFAULT_FILE_MODE)
        );
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut tree = VirtualFileTree::new();
        tree.insert("infra/main.bicep", "a")
            .unwrap_or_else(|err| panic!("insert: {err}"));

        let err = tree
            .insert("infra/main.bicep", "b")
            .expect_err("duplicate should fail");
        assert!(matches!(err, VfsError::DuplicatePath { .. }));
        assert_eq!(tree.text(Utf8Path::new("infra/main.bicep")), Some("a"));
    }

    #[rstest]
    #[case("/etc/passwd")]
    #[case("../outside.txt")]
    #[case("infra/../../outside.txt")]
    #[case("")]
    fn insert_rejects_escaping_paths(#[case] path: &str) {
        let mut tree = VirtualFileTree::new();
        let err = tree.insert(path, "x").expect_err("path should be rejected");
        assert!(matches!(err, VfsError::InvalidPath { .. }), "{path}: {err}");
    }
}
