//! Error types for topology construction and mutation.

use thiserror::Error;

/// Errors raised while building or mutating a [`super::Topology`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TopologyError {
    /// Raised when two resources share a name.
    #[error("duplicate resource name: {name}")]
    DuplicateResource {
        /// Name declared more than once.
        name: String,
    },
    /// Raised when a resource declares two bindings with the same name.
    #[error("resource {resource} declares binding {binding} more than once")]
    DuplicateBinding {
        /// Resource declaring the bindings.
        resource: String,
        /// Binding name declared more than once.
        binding: String,
    },
    /// Raised when an environment placeholder names a resource that is not
    /// part of the topology.
    #[error("resource {resource} references missing resource {missing} (env {key})")]
    DanglingReference {
        /// Resource declaring the reference.
        resource: String,
        /// Environment key carrying the placeholder.
        key: String,
        /// Name that could not be resolved.
        missing: String,
    },
    /// Raised when an environment value contains an unparsable placeholder.
    #[error("resource {resource} has a malformed placeholder in env {key}: {message}")]
    MalformedReference {
        /// Resource declaring the value.
        resource: String,
        /// Environment key carrying the value.
        key: String,
        /// Parser diagnostic.
        message: String,
    },
    /// Raised when a resource name is empty or whitespace.
    #[error("resource names must not be empty")]
    EmptyName,
    /// Raised when a mutation names a resource that does not exist.
    #[error("unknown resource: {name}")]
    UnknownResource {
        /// Requested resource name.
        name: String,
    },
    /// Raised when a mutation addresses a binding index out of range.
    #[error("resource {resource} has no binding at index {index}")]
    UnknownBinding {
        /// Resource being mutated.
        resource: String,
        /// Requested binding index.
        index: usize,
    },
    /// Raised when exposure is requested for a binding that does not serve
    /// traffic.
    #[error("binding {binding} of resource {resource} is not servable and cannot be exposed")]
    NotServable {
        /// Resource being mutated.
        resource: String,
        /// Binding name.
        binding: String,
    },
}
