//! Errors raised by template synthesis.

use thiserror::Error;

use crate::topology::TopologyError;
use crate::vfs::VfsError;

/// Errors raised while synthesizing templates. Every variant names the
/// resources involved so the report is actionable without a debugger.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SynthesisError {
    /// Raised when a placeholder targets a resource outside the topology.
    #[error("resource {resource} env {key} references unknown resource {missing}")]
    DanglingReference {
        /// Resource declaring the placeholder.
        resource: String,
        /// Environment key carrying the placeholder.
        key: String,
        /// Missing target.
        missing: String,
    },
    /// Raised when a placeholder asks for a property its target cannot
    /// provide.
    #[error(
        "resource {resource} env {key} references {target}.{property}, which a {kind} resource does not provide"
    )]
    UnsupportedProperty {
        /// Resource declaring the placeholder.
        resource: String,
        /// Environment key carrying the placeholder.
        key: String,
        /// Referenced resource.
        target: String,
        /// Requested property.
        property: String,
        /// Kind label of the referenced resource.
        kind: String,
    },
    /// Raised when two distinct names derive the same generated identifier.
    #[error("{first} and {second} both map to the generated identifier {identifier}; rename one of them")]
    IdentifierCollision {
        /// The shared derived identifier.
        identifier: String,
        /// First name, in sorted order.
        first: String,
        /// Second name, in sorted order.
        second: String,
    },
    /// Raised when a resource lacks a value that synthesis requires.
    #[error("resource {resource} is incomplete: {message}")]
    IncompleteResource {
        /// Offending resource.
        resource: String,
        /// What is missing.
        message: String,
    },
    /// Raised when a binding is external but cannot carry ingress.
    #[error("resource {resource} binding {binding} is marked external but does not serve traffic")]
    InvalidExposure {
        /// Offending resource.
        resource: String,
        /// Offending binding.
        binding: String,
    },
    /// Raised when the topology itself is inconsistent.
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// Raised when a template fails to load or render.
    #[error("template {name} failed: {message}")]
    Template {
        /// Template name.
        name: String,
        /// Renderer diagnostic.
        message: String,
    },
    /// Raised when serializing a parameter document fails.
    #[error("failed to encode {path}: {message}")]
    Encode {
        /// Output path being encoded.
        path: String,
        /// Encoder diagnostic.
        message: String,
    },
    /// Raised when generated paths are invalid or clash.
    #[error(transparent)]
    Output(#[from] VfsError),
}
