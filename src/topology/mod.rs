//! In-memory application topology.
//!
//! A [`Topology`] is a validated set of [`Resource`]s keyed by name. It is a
//! plain value: construction checks that names are unique and that every
//! environment placeholder resolves to a resource in the same topology, and
//! the only mutation afterwards is [`Topology::set_exposure`], used by the
//! exposure selector before synthesis starts.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

mod error;
pub mod reference;

pub use error::TopologyError;
pub use reference::{Reference, Segment};

/// Managed datastore engines understood by the synthesizer.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreEngine {
    /// `PostgreSQL` flexible server.
    Postgres,
    /// Managed Redis cache.
    Redis,
    /// Document database.
    Cosmos,
}

impl DatastoreEngine {
    /// Stable lowercase label used in rendered output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Redis => "redis",
            Self::Cosmos => "cosmos",
        }
    }
}

/// Kind of a topology resource together with kind-specific declarations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    /// A buildable project that runs as a service.
    Project,
    /// A prebuilt external container image that runs as a service.
    Container,
    /// A managed datastore.
    Datastore {
        /// Engine backing the datastore.
        engine: DatastoreEngine,
    },
    /// A message-queue namespace with declared queues and topics.
    QueueNamespace {
        /// Queue names declared under the namespace.
        queues: BTreeSet<String>,
        /// Topic names declared under the namespace.
        topics: BTreeSet<String>,
    },
    /// Blob-style storage with declared containers.
    Storage {
        /// Blob container names.
        containers: BTreeSet<String>,
    },
    /// A user-assigned identity.
    Identity,
    /// A secret store.
    KeyVault,
    /// A telemetry sink.
    TelemetrySink,
}

/// Dependency kinds rendered as independent blocks in the shared template.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum DependencyKind {
    /// Managed datastores.
    Datastore,
    /// Message-queue namespaces.
    QueueNamespace,
    /// Telemetry sinks.
    TelemetrySink,
    /// Blob storage accounts.
    Storage,
    /// Secret stores.
    KeyVault,
    /// Declared identities.
    Identity,
}

impl DependencyKind {
    /// Every dependency kind in rendering order.
    pub const ALL: [Self; 6] = [
        Self::Datastore,
        Self::QueueNamespace,
        Self::TelemetrySink,
        Self::Storage,
        Self::KeyVault,
        Self::Identity,
    ];
}

impl ResourceKind {
    /// Returns `true` for kinds that run as services in the execution
    /// environment.
    #[must_use]
    pub const fn is_service(&self) -> bool {
        matches!(self, Self::Project | Self::Container)
    }

    /// Returns the dependency block this kind renders into, if any.
    #[must_use]
    pub const fn dependency_kind(&self) -> Option<DependencyKind> {
        match self {
            Self::Project | Self::Container => None,
            Self::Datastore { .. } => Some(DependencyKind::Datastore),
            Self::QueueNamespace { .. } => Some(DependencyKind::QueueNamespace),
            Self::Storage { .. } => Some(DependencyKind::Storage),
            Self::Identity => Some(DependencyKind::Identity),
            Self::KeyVault => Some(DependencyKind::KeyVault),
            Self::TelemetrySink => Some(DependencyKind::TelemetrySink),
        }
    }

    /// Short label for diagnostics and listings.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Container => "container",
            Self::Datastore { engine } => engine.label(),
            Self::QueueNamespace { .. } => "service-bus",
            Self::Storage { .. } => "storage",
            Self::Identity => "identity",
            Self::KeyVault => "key-vault",
            Self::TelemetrySink => "app-insights",
        }
    }
}

/// Application-level transport spoken on a binding.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// HTTP/1.1.
    #[default]
    Http,
    /// HTTP/2.
    Http2,
    /// Raw TCP.
    Tcp,
}

impl Transport {
    /// Lowercase name used in rendered descriptors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Http2 => "http2",
            Self::Tcp => "tcp",
        }
    }
}

/// Network endpoint declared on a resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Binding {
    /// Binding name, unique within its resource.
    pub name: String,
    /// URL scheme (`http`, `https`, `tcp`).
    pub scheme: String,
    /// Transport mode.
    pub transport: Transport,
    /// Port the process listens on, when it serves traffic.
    pub target_port: Option<u16>,
    /// Whether the binding is reachable from outside the environment.
    pub external: bool,
    /// Whether plain HTTP is accepted on an external binding.
    pub allow_insecure: bool,
}

impl Binding {
    /// Creates an internal HTTP binding listening on `target_port`.
    #[must_use]
    pub fn http(name: impl Into<String>, target_port: u16) -> Self {
        Self {
            name: name.into(),
            scheme: String::from("http"),
            transport: Transport::Http,
            target_port: Some(target_port),
            external: false,
            allow_insecure: false,
        }
    }

    const fn is_http(&self) -> bool {
        matches!(self.transport, Transport::Http | Transport::Http2)
    }
}

/// A named node in the topology.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resource {
    name: String,
    kind: ResourceKind,
    bindings: Vec<Binding>,
    env: BTreeMap<String, String>,
    image: Option<String>,
    build_context: Option<String>,
    path: Option<Utf8PathBuf>,
}

impl Resource {
    /// Creates a resource with no bindings or environment entries.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            bindings: Vec::new(),
            env: BTreeMap::new(),
            image: None,
            build_context: None,
            path: None,
        }
    }

    /// Adds a binding. Bindings are kept sorted by name so iteration order
    /// never depends on declaration order.
    #[must_use]
    pub fn with_binding(mut self, binding: Binding) -> Self {
        let position = self
            .bindings
            .partition_point(|existing| existing.name < binding.name);
        self.bindings.insert(position, binding);
        self
    }

    /// Adds an environment entry.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the container image reference.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Sets the build context directory.
    #[must_use]
    pub fn with_build_context(mut self, context: impl Into<String>) -> Self {
        self.build_context = Some(context.into());
        self
    }

    /// Sets the project path relative to the topology root.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource kind.
    #[must_use]
    pub const fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Bindings sorted by name.
    #[must_use]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Environment entries sorted by key.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Container image reference, if declared.
    #[must_use]
    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    /// Build context, if declared.
    #[must_use]
    pub fn build_context(&self) -> Option<&str> {
        self.build_context.as_deref()
    }

    /// Project path, if declared.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Returns `true` when the resource runs as a service and at least one
    /// binding listens on a port.
    #[must_use]
    pub fn is_servable(&self) -> bool {
        self.kind.is_service() && self.bindings.iter().any(|b| b.target_port.is_some())
    }

    /// Index of the binding that carries ingress: the first HTTP binding
    /// with a port, falling back to the first binding with a port.
    #[must_use]
    pub fn primary_binding_index(&self) -> Option<usize> {
        if !self.kind.is_service() {
            return None;
        }
        self.bindings
            .iter()
            .position(|b| b.target_port.is_some() && b.is_http())
            .or_else(|| self.bindings.iter().position(|b| b.target_port.is_some()))
    }

    /// The binding returned by [`Self::primary_binding_index`].
    #[must_use]
    pub fn primary_binding(&self) -> Option<&Binding> {
        self.primary_binding_index()
            .and_then(|index| self.bindings.get(index))
    }

    /// Returns `true` when any binding is marked external.
    #[must_use]
    pub fn is_exposed(&self) -> bool {
        self.bindings.iter().any(|b| b.external)
    }
}

/// Validated set of resources keyed by name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topology {
    resources: BTreeMap<String, Resource>,
    references: Vec<Reference>,
}

impl Topology {
    /// Builds a topology from resources in any order.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateResource`] when two resources share
    /// a name, [`TopologyError::DuplicateBinding`] when one resource declares
    /// two bindings with the same name, [`TopologyError::MalformedReference`] when a placeholder cannot
    /// be parsed, and [`TopologyError::DanglingReference`] when a placeholder
    /// names a resource outside the topology.
    pub fn new(resources: impl IntoIterator<Item = Resource>) -> Result<Self, TopologyError> {
        let mut by_name = BTreeMap::new();
        for resource in resources {
            if resource.name.trim().is_empty() {
                return Err(TopologyError::EmptyName);
            }
            if let Some(binding) = duplicate_binding(&resource) {
                return Err(TopologyError::DuplicateBinding {
                    resource: resource.name,
                    binding,
                });
            }
            if by_name.contains_key(&resource.name) {
                return Err(TopologyError::DuplicateResource {
                    name: resource.name,
                });
            }
            by_name.insert(resource.name.clone(), resource);
        }

        let references = collect_references(&by_name)?;
        Ok(Self {
            resources: by_name,
            references,
        })
    }

    /// Iterates over resources sorted by name.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Looks up a resource by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    /// Iterates over service-kind resources sorted by name.
    pub fn services(&self) -> impl Iterator<Item = &Resource> {
        self.resources().filter(|r| r.kind.is_service())
    }

    /// Iterates over servable resources sorted by name.
    pub fn servable(&self) -> impl Iterator<Item = &Resource> {
        self.resources().filter(|r| r.is_servable())
    }

    /// Resources rendered into the given dependency block.
    pub fn of_dependency_kind(&self, kind: DependencyKind) -> impl Iterator<Item = &Resource> {
        self.resources()
            .filter(move |r| r.kind.dependency_kind() == Some(kind))
    }

    /// Every dependency edge, sorted by declaring resource and key.
    #[must_use]
    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// Dependency edges declared by `name`.
    pub fn references_from<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Reference> {
        self.references.iter().filter(move |r| r.from == name)
    }

    /// Names of resources that `name` depends on.
    #[must_use]
    pub fn dependencies_of<'a>(&'a self, name: &'a str) -> BTreeSet<&'a str> {
        self.references_from(name)
            .map(|r| r.target.as_str())
            .collect()
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns `true` when the topology has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Marks a binding as external or internal.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::UnknownResource`] or
    /// [`TopologyError::UnknownBinding`] when the target does not exist and
    /// [`TopologyError::NotServable`] when exposing a binding that does not
    /// listen on a port of a service resource.
    pub fn set_exposure(
        &mut self,
        resource_name: &str,
        binding_index: usize,
        external: bool,
    ) -> Result<(), TopologyError> {
        let resource =
            self.resources
                .get_mut(resource_name)
                .ok_or_else(|| TopologyError::UnknownResource {
                    name: resource_name.to_owned(),
                })?;
        let is_service = resource.kind.is_service();
        let binding = resource.bindings.get_mut(binding_index).ok_or_else(|| {
            TopologyError::UnknownBinding {
                resource: resource_name.to_owned(),
                index: binding_index,
            }
        })?;

        if external && (!is_service || binding.target_port.is_none()) {
            return Err(TopologyError::NotServable {
                resource: resource_name.to_owned(),
                binding: binding.name.clone(),
            });
        }
        binding.external = external;
        Ok(())
    }
}

fn duplicate_binding(resource: &Resource) -> Option<String> {
    resource.bindings.windows(2).find_map(|pair| match pair {
        [first, second] if first.name == second.name => Some(second.name.clone()),
        _ => None,
    })
}

fn collect_references(
    resources: &BTreeMap<String, Resource>,
) -> Result<Vec<Reference>, TopologyError> {
    let mut references = Vec::new();
    for resource in resources.values() {
        for (key, value) in &resource.env {
            let segments = reference::parse_segments(value).map_err(|message| {
                TopologyError::MalformedReference {
                    resource: resource.name.clone(),
                    key: key.clone(),
                    message,
                }
            })?;
            for segment in segments {
                let Segment::Placeholder { target, property } = segment else {
                    continue;
                };
                if !resources.contains_key(target) {
                    return Err(TopologyError::DanglingReference {
                        resource: resource.name.clone(),
                        key: key.clone(),
                        missing: target.to_owned(),
                    });
                }
                references.push(Reference {
                    from: resource.name.clone(),
                    key: key.clone(),
                    target: target.to_owned(),
                    property: property.to_owned(),
                });
            }
        }
    }
    Ok(references)
}
