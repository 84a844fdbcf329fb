//! Decoding of the JSON topology manifest produced by a host framework.
//!
//! The manifest is a JSON object with a `resources` map from resource name to
//! a `type`-tagged description. Decoding keeps duplicate keys so the topology
//! can reject them instead of silently keeping the last occurrence.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Deserialize;
use serde::de::{MapAccess, Visitor};
use thiserror::Error;

use crate::topology::{
    Binding, DatastoreEngine, Resource, ResourceKind, Topology, TopologyError, Transport,
};

/// Errors raised while decoding a manifest.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ManifestError {
    /// Raised when the document is not valid manifest JSON.
    #[error("failed to parse topology manifest: {0}")]
    Parse(String),
    /// Raised when a binding declaration is invalid.
    #[error("resource {resource} binding {binding}: {message}")]
    InvalidBinding {
        /// Resource declaring the binding.
        resource: String,
        /// Binding name.
        binding: String,
        /// Description of the problem.
        message: String,
    },
    /// Raised when the decoded resources do not form a valid topology.
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    resources: RawResources,
}

#[derive(Debug, Default)]
struct RawResources(Vec<(String, RawResource)>);

impl<'de> Deserialize<'de> for RawResources {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(RawResourcesVisitor)
    }
}

struct RawResourcesVisitor;

impl<'de> Visitor<'de> for RawResourcesVisitor {
    type Value = RawResources;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a map of resource names to resource declarations")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = Vec::new();
        while let Some((name, resource)) = map.next_entry::<String, RawResource>()? {
            entries.push((name, resource));
        }
        Ok(RawResources(entries))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum RawResource {
    Project {
        path: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        bindings: BTreeMap<String, RawBinding>,
        context: Option<String>,
    },
    Container {
        image: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        bindings: BTreeMap<String, RawBinding>,
        context: Option<String>,
    },
    Postgres {},
    Redis {},
    Cosmos {},
    ServiceBus {
        #[serde(default)]
        queues: Vec<String>,
        #[serde(default)]
        topics: Vec<String>,
    },
    Storage {
        #[serde(default)]
        containers: Vec<String>,
    },
    Identity {},
    KeyVault {},
    AppInsights {},
}

#[derive(Debug)]
struct RawService {
    env: BTreeMap<String, String>,
    bindings: BTreeMap<String, RawBinding>,
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBinding {
    scheme: Option<String>,
    transport: Option<String>,
    target_port: Option<u16>,
    #[serde(default)]
    external: bool,
    #[serde(default)]
    allow_insecure: bool,
}

/// Parses manifest JSON into a validated [`Topology`].
///
/// # Errors
///
/// Returns [`ManifestError::Parse`] for malformed JSON or unknown resource
/// types, [`ManifestError::InvalidBinding`] for unsupported transports, and
/// [`ManifestError::Topology`] when the resources violate topology
/// invariants.
pub fn parse_manifest(text: &str) -> Result<Topology, ManifestError> {
    let raw: RawManifest =
        serde_json::from_str(text).map_err(|err| ManifestError::Parse(err.to_string()))?;

    let mut resources = Vec::with_capacity(raw.resources.0.len());
    for (name, declaration) in raw.resources.0 {
        resources.push(convert_resource(name, declaration)?);
    }
    Ok(Topology::new(resources)?)
}

fn convert_resource(name: String, raw: RawResource) -> Result<Resource, ManifestError> {
    let resource = match raw {
        RawResource::Project {
            path,
            env,
            bindings,
            context,
        } => {
            let service = RawService {
                env,
                bindings,
                context,
            };
            let base = Resource::new(name, ResourceKind::Project);
            let with_path = match path {
                Some(value) => base.with_path(value),
                None => base,
            };
            apply_service(with_path, service)?
        }
        RawResource::Container {
            image,
            env,
            bindings,
            context,
        } => apply_service(
            Resource::new(name, ResourceKind::Container).with_image(image),
            RawService {
                env,
                bindings,
                context,
            },
        )?,
        RawResource::Postgres {} => datastore(name, DatastoreEngine::Postgres),
        RawResource::Redis {} => datastore(name, DatastoreEngine::Redis),
        RawResource::Cosmos {} => datastore(name, DatastoreEngine::Cosmos),
        RawResource::ServiceBus { queues, topics } => Resource::new(
            name,
            ResourceKind::QueueNamespace {
                queues: queues.into_iter().collect(),
                topics: topics.into_iter().collect(),
            },
        ),
        RawResource::Storage { containers } => Resource::new(
            name,
            ResourceKind::Storage {
                containers: containers.into_iter().collect::<BTreeSet<_>>(),
            },
        ),
        RawResource::Identity {} => Resource::new(name, ResourceKind::Identity),
        RawResource::KeyVault {} => Resource::new(name, ResourceKind::KeyVault),
        RawResource::AppInsights {} => Resource::new(name, ResourceKind::TelemetrySink),
    };
    Ok(resource)
}

fn datastore(name: String, engine: DatastoreEngine) -> Resource {
    Resource::new(name, ResourceKind::Datastore { engine })
}

fn apply_service(resource: Resource, service: RawService) -> Result<Resource, ManifestError> {
    let mut current = match service.context {
        Some(context) => resource.with_build_context(context),
        None => resource,
    };
    for (key, value) in service.env {
        current = current.with_env(key, value);
    }
    for (binding_name, raw) in service.bindings {
        let binding = convert_binding(current.name(), binding_name, raw)?;
        current = current.with_binding(binding);
    }
    Ok(current)
}

fn convert_binding(
    resource: &str,
    name: String,
    raw: RawBinding,
) -> Result<Binding, ManifestError> {
    let transport = match raw.transport.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("http") => Transport::Http,
        Some("http2") => Transport::Http2,
        Some("tcp") => Transport::Tcp,
        Some(other) => {
            return Err(ManifestError::InvalidBinding {
                resource: resource.to_owned(),
                binding: name,
                message: format!("unsupported transport {other:?}"),
            });
        }
    };
    if raw.target_port == Some(0) {
        return Err(ManifestError::InvalidBinding {
            resource: resource.to_owned(),
            binding: name,
            message: String::from("targetPort must be greater than zero"),
        });
    }
    Ok(Binding {
        scheme: raw.scheme.unwrap_or_else(|| String::from("http")),
        name,
        transport,
        target_port: raw.target_port,
        external: raw.external,
        allow_insecure: raw.allow_insecure,
    })
}
