//! Template synthesis: a pure function from a topology and deployment scope
//! to an in-memory file tree.
//!
//! Output depends only on the topology's content. Resources are visited in
//! name order and every generated collection is sorted, so two runs over the
//! same topology yield byte-identical trees however the resources were
//! declared. Synthesis never touches the filesystem; the staged merge does.

use minijinja::{AutoEscape, Environment};
use serde::Serialize;
use tracing::debug;

use crate::ident::{platform_name, resource_token, screaming_snake_case};
use crate::topology::{Reference, Topology};
use crate::vfs::VirtualFileTree;

mod blocks;
mod error;
mod names;
mod service;

pub use error::SynthesisError;
pub use service::DESCRIPTOR_PATH;

use blocks::SharedView;
use names::Identifiers;
use service::ServiceView;

/// Path of the shared entry-point template.
pub const MAIN_TEMPLATE_PATH: &str = "infra/main.bicep";
/// Path of the shared parameter document.
pub const MAIN_PARAMETERS_PATH: &str = "infra/main.parameters.json";
/// Path of the shared resource template.
pub const RESOURCES_TEMPLATE_PATH: &str = "infra/resources.bicep";

const TEMPLATES: [(&str, &str); 10] = [
    ("main.bicep", include_str!("templates/main.bicep.j2")),
    ("resources.bicep", include_str!("templates/resources.bicep.j2")),
    ("roles_outputs.bicep", include_str!("templates/roles_outputs.bicep.j2")),
    (
        "blocks/datastore.bicep",
        include_str!("templates/blocks/datastore.bicep.j2"),
    ),
    (
        "blocks/queue_namespace.bicep",
        include_str!("templates/blocks/queue_namespace.bicep.j2"),
    ),
    (
        "blocks/telemetry.bicep",
        include_str!("templates/blocks/telemetry.bicep.j2"),
    ),
    (
        "blocks/storage.bicep",
        include_str!("templates/blocks/storage.bicep.j2"),
    ),
    (
        "blocks/key_vault.bicep",
        include_str!("templates/blocks/key_vault.bicep.j2"),
    ),
    (
        "blocks/identity.bicep",
        include_str!("templates/blocks/identity.bicep.j2"),
    ),
    (
        "containerApp.tmpl.yaml",
        include_str!("templates/container_app.yaml.j2"),
    ),
];

/// Where and for whom templates are generated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentScope {
    /// Environment name.
    pub environment: String,
    /// Deployment region.
    pub location: String,
    /// Subscription identifier, when known.
    pub subscription_id: Option<String>,
}

impl DeploymentScope {
    /// Creates a scope without a subscription.
    #[must_use]
    pub fn new(environment: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            location: location.into(),
            subscription_id: None,
        }
    }

    /// Sets the subscription identifier.
    #[must_use]
    pub fn with_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    /// Token that makes generated names unique to this scope.
    #[must_use]
    pub fn resource_token(&self) -> String {
        resource_token(&[
            self.subscription_id.as_deref().unwrap_or_default(),
            self.environment.as_str(),
            self.location.as_str(),
        ])
    }
}

/// Template environment with the identifier helpers registered as filters.
#[derive(Debug)]
pub(crate) struct Templates {
    env: Environment<'static>,
}

impl Templates {
    fn load() -> Result<Self, SynthesisError> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_keep_trailing_newline(true);
        env.add_filter("platform_name", platform_name);
        env.add_filter("screaming_snake", screaming_snake_case);
        env.add_filter("yaml_quote", yaml_quote);
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .map_err(|err| template_error(name, &err))?;
        }
        Ok(Self { env })
    }

    /// Renders the named template against `context`.
    pub fn render(&self, name: &str, context: &impl Serialize) -> Result<String, SynthesisError> {
        self.env
            .get_template(name)
            .and_then(|template| template.render(context))
            .map_err(|err| template_error(name, &err))
    }
}

fn template_error(name: &str, err: &minijinja::Error) -> SynthesisError {
    SynthesisError::Template {
        name: name.to_owned(),
        message: err.to_string(),
    }
}

fn yaml_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Turns topologies into infrastructure templates.
#[derive(Debug)]
pub struct Synthesizer {
    templates: Templates,
}

impl Synthesizer {
    /// Loads the embedded templates.
    ///
    /// # Errors
    ///
    /// Returns [`SynthesisError::Template`] if an embedded template fails to
    /// parse.
    pub fn new() -> Result<Self, SynthesisError> {
        Ok(Self {
            templates: Templates::load()?,
        })
    }

    /// Generates the shared infrastructure artifacts and the artifacts of
    /// every service.
    ///
    /// # Errors
    ///
    /// Returns [`SynthesisError`] naming the offending resources when a
    /// reference dangles or asks for an unsupported property, two names
    /// derive the same identifier, a binding is exposed without serving
    /// traffic, or a service lacks a required value.
    pub fn synthesize(
        &self,
        topology: &Topology,
        scope: &DeploymentScope,
    ) -> Result<VirtualFileTree, SynthesisError> {
        validate(topology)?;
        let ids = Identifiers::derive(topology)?;
        let token = scope.resource_token();

        let shared = SharedView::build(topology, &ids, &token)?;
        let mut tree = VirtualFileTree::new();
        tree.insert(MAIN_TEMPLATE_PATH, shared.render_main(&self.templates)?)?;
        tree.insert(
            MAIN_PARAMETERS_PATH,
            encode_json(MAIN_PARAMETERS_PATH, &shared.main_parameters())?,
        )?;
        tree.insert(
            RESOURCES_TEMPLATE_PATH,
            shared.render_resources(&self.templates)?,
        )?;

        let services = topology
            .services()
            .map(|resource| ServiceView::build(topology, &ids, resource))
            .collect::<Result<Vec<_>, _>>()?;
        service::check_directories(&services)?;
        for view in &services {
            let parameters_path = view.parameters_path();
            let parameters = encode_json(parameters_path.as_str(), &view.parameters())?;
            tree.insert(parameters_path, parameters)?;
            tree.insert(
                view.descriptor_path(),
                view.render_descriptor(&self.templates)?,
            )?;
        }

        debug!(
            files = tree.len(),
            services = services.len(),
            exposed = ?service::exposed(&services),
            token = %token,
            "synthesized templates"
        );
        Ok(tree)
    }
}

fn validate(topology: &Topology) -> Result<(), SynthesisError> {
    for Reference {
        from, key, target, ..
    } in topology.references()
    {
        if topology.resource(target).is_none() {
            return Err(SynthesisError::DanglingReference {
                resource: from.clone(),
                key: key.clone(),
                missing: target.clone(),
            });
        }
    }

    for resource in topology.resources() {
        for binding in resource.bindings() {
            if binding.external && (!resource.kind().is_service() || binding.target_port.is_none())
            {
                return Err(SynthesisError::InvalidExposure {
                    resource: resource.name().to_owned(),
                    binding: binding.name.clone(),
                });
            }
        }
        if resource.kind().is_service()
            && !resource.bindings().is_empty()
            && !resource.is_servable()
        {
            return Err(SynthesisError::IncompleteResource {
                resource: resource.name().to_owned(),
                message: String::from("declares bindings but none has a target port"),
            });
        }
    }
    Ok(())
}

fn encode_json(path: &str, value: &serde_json::Value) -> Result<String, SynthesisError> {
    serde_json::to_string_pretty(value)
        .map(|mut text| {
            text.push('\n');
            text
        })
        .map_err(|err| SynthesisError::Encode {
            path: path.to_owned(),
            message: err.to_string(),
        })
}
