//! Topology discovery collaborators.
//!
//! Discovery turns a source location into a [`Topology`]. It is expensive in
//! general (a host framework may have to build and run a project to emit its
//! manifest), so callers go through [`crate::cache::TopologyCache`]. The
//! [`ManifestDiscoverer`] implementation consumes a manifest that already
//! exists on disk.

use std::future::Future;
use std::io;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, info};

use crate::manifest::{ManifestError, parse_manifest};
use crate::topology::Topology;

/// Errors raised by discovery collaborators. Cloneable so a cached failure
/// can be handed to every caller.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DiscoveryError {
    /// Raised when the source cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the manifest content is invalid.
    #[error("invalid topology manifest {path}: {source}")]
    Manifest {
        /// Manifest path.
        path: Utf8PathBuf,
        /// Decoding failure.
        #[source]
        source: ManifestError,
    },
    /// Raised by collaborators for failures outside this crate's control.
    #[error("topology discovery failed for {path}: {message}")]
    Failed {
        /// Source path.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Future returned by discovery operations.
pub type DiscoveryFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, DiscoveryError>> + Send + 'a>>;

/// Source of topologies.
pub trait Discoverer: Send + Sync {
    /// Produces the topology described at `source`.
    fn discover<'a>(&'a self, source: &'a Utf8Path) -> DiscoveryFuture<'a, Topology>;

    /// Cheaply checks whether `source` can produce a topology at all.
    fn probe<'a>(&'a self, source: &'a Utf8Path) -> DiscoveryFuture<'a, bool>;
}

/// Reads topology manifests from the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestDiscoverer;

impl ManifestDiscoverer {
    /// Creates a discoverer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Discoverer for ManifestDiscoverer {
    fn discover<'a>(&'a self, source: &'a Utf8Path) -> DiscoveryFuture<'a, Topology> {
        Box::pin(async move {
            info!(path = %source, "reading topology manifest");
            let Some(text) = read_manifest(source)? else {
                return Err(DiscoveryError::Io {
                    path: source.to_path_buf(),
                    message: String::from("manifest does not exist"),
                });
            };
            let topology = parse_manifest(&text).map_err(|err| DiscoveryError::Manifest {
                path: source.to_path_buf(),
                source: err,
            })?;
            info!(path = %source, resources = topology.len(), "topology discovered");
            Ok(topology)
        })
    }

    fn probe<'a>(&'a self, source: &'a Utf8Path) -> DiscoveryFuture<'a, bool> {
        Box::pin(async move {
            let Some(text) = read_manifest(source)? else {
                debug!(path = %source, "no manifest present");
                return Ok(false);
            };
            let looks_like_manifest = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|value| value.get("resources").map(serde_json::Value::is_object))
                .unwrap_or(false);
            Ok(looks_like_manifest)
        })
    }
}

fn read_manifest(path: &Utf8Path) -> Result<Option<String>, DiscoveryError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| DiscoveryError::Io {
        path: path.to_path_buf(),
        message: String::from("manifest path is missing a filename"),
    })?;

    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(DiscoveryError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            });
        }
    };

    match dir.read_to_string(file_name) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(DiscoveryError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}
