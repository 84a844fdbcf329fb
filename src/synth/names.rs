//! Derived identifiers for every resource, checked for collisions up front.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::ident::{platform_name, screaming_snake_case};
use crate::topology::{DatastoreEngine, Resource, ResourceKind, Topology};

use super::SynthesisError;

/// Identifiers derived from one resource name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ResourceIds {
    /// Platform-legal name, also the container app name for services.
    pub platform: String,
    /// Upper-case token used in deploy-time variable names.
    pub snake: String,
    /// Template-language symbol.
    pub symbol: String,
}

/// Identifier table for a topology.
#[derive(Debug, Default)]
pub(crate) struct Identifiers {
    by_name: BTreeMap<String, ResourceIds>,
}

impl Identifiers {
    /// Derives identifiers for every resource and rejects collisions.
    ///
    /// Resources are visited in name order, so the reported pair is the
    /// same whatever order the topology was built in.
    pub fn derive(topology: &Topology) -> Result<Self, SynthesisError> {
        let mut platform = Claims::default();
        let mut snake = Claims::default();
        let mut by_name = BTreeMap::new();

        for resource in topology.resources() {
            let name = resource.name();
            let ids = ResourceIds {
                platform: platform_name(name),
                snake: screaming_snake_case(name),
                symbol: format!(
                    "{}_{}",
                    symbol_prefix(resource.kind()),
                    screaming_snake_case(name).to_ascii_lowercase()
                ),
            };
            platform.claim(&ids.platform, name)?;
            snake.claim(&ids.snake, name)?;
            check_children(resource)?;
            by_name.insert(name.to_owned(), ids);
        }
        Ok(Self { by_name })
    }

    /// Identifiers for `name`.
    pub fn get(&self, name: &str) -> Result<&ResourceIds, SynthesisError> {
        self.by_name
            .get(name)
            .ok_or_else(|| SynthesisError::IncompleteResource {
                resource: name.to_owned(),
                message: String::from("no identifiers were derived for this resource"),
            })
    }
}

/// Records which name claimed each derived identifier.
#[derive(Debug, Default)]
pub(crate) struct Claims {
    owners: BTreeMap<String, String>,
}

impl Claims {
    /// Claims `identifier` for `owner`, failing when another owner holds it.
    pub fn claim(&mut self, identifier: &str, owner: &str) -> Result<(), SynthesisError> {
        match self.owners.entry(identifier.to_owned()) {
            Entry::Vacant(entry) => {
                entry.insert(owner.to_owned());
                Ok(())
            }
            Entry::Occupied(entry) if entry.get() == owner => Ok(()),
            Entry::Occupied(entry) => {
                let (first, second) = ordered(entry.get(), owner);
                Err(SynthesisError::IdentifierCollision {
                    identifier: identifier.to_owned(),
                    first,
                    second,
                })
            }
        }
    }
}

fn ordered(left: &str, right: &str) -> (String, String) {
    if left <= right {
        (left.to_owned(), right.to_owned())
    } else {
        (right.to_owned(), left.to_owned())
    }
}

fn check_children(resource: &Resource) -> Result<(), SynthesisError> {
    let mut children = Claims::default();
    let names: Vec<&String> = match resource.kind() {
        ResourceKind::QueueNamespace { queues, topics } => queues.iter().chain(topics).collect(),
        ResourceKind::Storage { containers } => containers.iter().collect(),
        _ => return Ok(()),
    };
    for child in names {
        children.claim(
            &platform_name(child),
            &format!("{}/{child}", resource.name()),
        )?;
    }
    Ok(())
}

const fn symbol_prefix(kind: &ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Project => "app",
        ResourceKind::Container => "ctr",
        ResourceKind::Datastore { engine } => match engine {
            DatastoreEngine::Postgres => "pg",
            DatastoreEngine::Redis => "redis",
            DatastoreEngine::Cosmos => "cosmos",
        },
        ResourceKind::QueueNamespace { .. } => "sb",
        ResourceKind::Storage { .. } => "st",
        ResourceKind::Identity => "id",
        ResourceKind::KeyVault => "kv",
        ResourceKind::TelemetrySink => "ai",
    }
}
