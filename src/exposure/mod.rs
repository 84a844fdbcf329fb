//! Choosing which services are reachable from outside the environment.
//!
//! The decision is made once per environment and service: persisted
//! decisions are applied silently on later runs, and the console is only
//! consulted when nothing usable has been recorded. A fresh decision is
//! persisted before synthesis continues so an interrupted run never has to
//! ask again.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{info, warn};

use crate::console::{Console, ConsoleError};
use crate::topology::{Resource, Topology, TopologyError};

pub mod store;

pub use store::{
    DECISIONS_VERSION, DecisionStore, EnvironmentStore, PersistedDecisions, PersistedEntry,
    StoreError,
};

const SELECTION_PROMPT: &str = "Select which services to expose to the Internet";

/// Errors raised while establishing exposure decisions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExposureError {
    /// Raised when decisions cannot be read or persisted.
    #[error("exposure decision store failed: {0}")]
    Store(#[from] StoreError),
    /// Raised when the selection prompt fails.
    #[error(transparent)]
    Console(#[from] ConsoleError),
    /// Raised when applying a decision to the topology fails.
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Where the applied decision came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecisionSource {
    /// Every persisted entry was valid; nothing was asked.
    Persisted,
    /// Nothing usable was persisted; the user chose from scratch.
    Prompted,
    /// Some persisted entries were skipped; the user was asked about the
    /// services they left undecided.
    Repaired,
}

/// The decision applied to a topology.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExposureOutcome {
    /// Services whose primary binding is external.
    pub exposed: BTreeSet<String>,
    /// How the decision was obtained.
    pub source: DecisionSource,
}

/// Applies persisted or freshly prompted exposure decisions.
#[derive(Debug)]
pub struct ExposureSelector<'a, S, C> {
    store: &'a S,
    console: &'a C,
    service: &'a str,
}

impl<'a, S, C> ExposureSelector<'a, S, C>
where
    S: DecisionStore,
    C: Console,
{
    /// Creates a selector persisting decisions for `service`.
    #[must_use]
    pub const fn new(store: &'a S, console: &'a C, service: &'a str) -> Self {
        Self {
            store,
            console,
            service,
        }
    }

    /// Decides exposure and marks the primary binding of every servable
    /// resource external or internal accordingly.
    ///
    /// # Errors
    ///
    /// Returns [`ExposureError::Store`] when decisions cannot be loaded or
    /// a fresh decision cannot be persisted, and
    /// [`ExposureError::Console`] when a needed prompt fails.
    pub fn apply(&self, topology: &mut Topology) -> Result<ExposureOutcome, ExposureError> {
        let servable: BTreeSet<String> = topology
            .servable()
            .map(|resource| resource.name().to_owned())
            .collect();

        let outcome = match self.store.load(self.service)? {
            PersistedDecisions::Absent => self.prompt_fresh(&servable)?,
            PersistedDecisions::Unreadable { reason } => {
                warn!(service = self.service, %reason, "ignoring persisted exposure decisions");
                self.prompt_fresh(&servable)?
            }
            PersistedDecisions::Entries(entries) => self.restore(&servable, entries)?,
        };

        mark_exposure(topology, &outcome.exposed)?;
        info!(
            service = self.service,
            exposed = ?outcome.exposed,
            source = ?outcome.source,
            "exposure decided"
        );
        Ok(outcome)
    }

    /// Valid persisted decisions for `topology`, without prompting or
    /// writing. Returns `None` when nothing usable is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ExposureError::Store`] when the store cannot be read.
    pub fn recorded(&self, topology: &Topology) -> Result<Option<BTreeSet<String>>, ExposureError> {
        let PersistedDecisions::Entries(entries) = self.store.load(self.service)? else {
            return Ok(None);
        };
        Ok(Some(
            entries
                .into_iter()
                .filter_map(|entry| match entry {
                    PersistedEntry::Name(name) => Some(name),
                    PersistedEntry::Malformed { .. } => None,
                })
                .filter(|name| topology.resource(name).is_some_and(Resource::is_servable))
                .collect(),
        ))
    }

    /// Marks exposure from [`Self::recorded`] decisions when there are any,
    /// leaving the manifest's own flags in place otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ExposureError::Store`] when the store cannot be read.
    pub fn apply_recorded(
        &self,
        topology: &mut Topology,
    ) -> Result<Option<BTreeSet<String>>, ExposureError> {
        let recorded = self.recorded(topology)?;
        if let Some(exposed) = &recorded {
            mark_exposure(topology, exposed)?;
        }
        Ok(recorded)
    }

    fn prompt_fresh(&self, servable: &BTreeSet<String>) -> Result<ExposureOutcome, ExposureError> {
        let exposed = self.ask(servable)?;
        self.persist(&exposed)?;
        Ok(ExposureOutcome {
            exposed,
            source: DecisionSource::Prompted,
        })
    }

    fn restore(
        &self,
        servable: &BTreeSet<String>,
        entries: Vec<PersistedEntry>,
    ) -> Result<ExposureOutcome, ExposureError> {
        let mut exposed = BTreeSet::new();
        let mut skipped = false;
        for entry in entries {
            match entry {
                PersistedEntry::Name(name) if servable.contains(&name) => {
                    exposed.insert(name);
                }
                PersistedEntry::Name(name) => {
                    warn!(
                        service = self.service,
                        entry = %name,
                        "skipping persisted exposure for unknown or non-servable resource"
                    );
                    skipped = true;
                }
                PersistedEntry::Malformed { index, found } => {
                    warn!(
                        service = self.service,
                        index,
                        %found,
                        "skipping malformed persisted exposure entry"
                    );
                    skipped = true;
                }
            }
        }

        if !skipped {
            return Ok(ExposureOutcome {
                exposed,
                source: DecisionSource::Persisted,
            });
        }

        let undecided: BTreeSet<String> = servable.difference(&exposed).cloned().collect();
        let chosen = self.ask(&undecided)?;
        exposed.extend(chosen);
        self.persist(&exposed)?;
        Ok(ExposureOutcome {
            exposed,
            source: DecisionSource::Repaired,
        })
    }

    fn persist(&self, exposed: &BTreeSet<String>) -> Result<(), ExposureError> {
        self.store.save(self.service, exposed)?;
        info!(service = self.service, count = exposed.len(), "persisted exposure decisions");
        Ok(())
    }

    fn ask(&self, candidates: &BTreeSet<String>) -> Result<BTreeSet<String>, ExposureError> {
        if candidates.is_empty() {
            return Ok(BTreeSet::new());
        }
        let options: Vec<String> = candidates.iter().cloned().collect();
        let picked = self.console.multi_select(SELECTION_PROMPT, &options)?;
        Ok(picked
            .into_iter()
            .filter(|name| candidates.contains(name))
            .collect())
    }
}

fn mark_exposure(topology: &mut Topology, exposed: &BTreeSet<String>) -> Result<(), TopologyError> {
    let plan: Vec<(String, usize, Option<usize>)> = topology
        .services()
        .map(|resource| {
            (
                resource.name().to_owned(),
                resource.bindings().len(),
                resource.primary_binding_index(),
            )
        })
        .collect();

    for (name, binding_count, primary) in plan {
        for index in 0..binding_count {
            topology.set_exposure(&name, index, false)?;
        }
        if let Some(index) = primary
            && exposed.contains(&name)
        {
            topology.set_exposure(&name, index, true)?;
        }
    }
    Ok(())
}

/// Names of the resources that are currently exposed.
#[must_use]
pub fn exposed_names(topology: &Topology) -> BTreeSet<&str> {
    topology
        .resources()
        .filter(|resource| resource.is_exposed())
        .map(Resource::name)
        .collect()
}
