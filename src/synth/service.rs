//! Per-service artifacts: the deployment parameter document under
//! `infra/services/` and the runtime descriptor next to the service's
//! project.
//!
//! Environment placeholders resolve to deploy-time variables exported by the
//! shared template. Values that embed a secret output are moved into the
//! descriptor's `secrets` section and referenced from the environment by
//! name, so a connection string never appears as a plain environment value.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Value, json};

use crate::ident::platform_name;
use crate::topology::{Binding, Resource, ResourceKind, Segment, Topology, Transport, reference};

use super::blocks::{DEPLOYMENT_PARAMETERS_SCHEMA, dependency_output, outputs};
use super::names::{Claims, Identifiers};
use super::{SynthesisError, Templates};

/// File name of the runtime descriptor inside a service directory.
pub const DESCRIPTOR_PATH: &str = "manifests/containerApp.tmpl.yaml";

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
struct IngressView {
    external: bool,
    target_port: u16,
    transport: &'static str,
    allow_insecure: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
struct EnvView {
    name: String,
    value: Option<String>,
    secret_ref: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
struct SecretView {
    name: String,
    value: String,
}

/// Everything a service's artifacts render from.
#[derive(Debug, Serialize)]
pub(crate) struct ServiceView {
    name: String,
    id: String,
    image: String,
    ingress: Option<IngressView>,
    env: Vec<EnvView>,
    secrets: Vec<SecretView>,
    depends_on: Vec<String>,
    #[serde(skip)]
    directory: Utf8PathBuf,
}

/// A resolved environment value.
struct Resolved {
    text: String,
    secret: bool,
}

impl ServiceView {
    /// Builds the view for service resource `resource`.
    pub fn build(
        topology: &Topology,
        ids: &Identifiers,
        resource: &Resource,
    ) -> Result<Self, SynthesisError> {
        let name = resource.name();
        let resource_ids = ids.get(name)?;
        let ingress = resource.primary_binding().and_then(ingress_view);

        let mut values: BTreeMap<String, Resolved> = BTreeMap::new();
        values.insert(
            String::from("AZURE_CLIENT_ID"),
            Resolved::plain(deploy_var(outputs::IDENTITY_CLIENT_ID)),
        );
        if let Some(port) = ingress.as_ref().map(|view| view.target_port) {
            values.insert(String::from("PORT"), Resolved::plain(port.to_string()));
        }
        if let Some(sink) = topology
            .resources()
            .find(|candidate| matches!(candidate.kind(), ResourceKind::TelemetrySink))
        {
            let snake = &ids.get(sink.name())?.snake;
            values.insert(
                String::from("APPLICATIONINSIGHTS_CONNECTION_STRING"),
                Resolved::plain(deploy_var(&format!("{snake}_CONNECTION_STRING"))),
            );
        }
        for (key, raw) in resource.env() {
            values.insert(key.clone(), resolve_value(topology, ids, resource, key, raw)?);
        }

        let mut secret_names = Claims::default();
        let mut env = Vec::with_capacity(values.len());
        let mut secrets = Vec::new();
        for (key, resolved) in values {
            if resolved.secret {
                let secret_name = platform_name(&key);
                secret_names.claim(&secret_name, &format!("{name}.{key}"))?;
                secrets.push(SecretView {
                    name: secret_name.clone(),
                    value: resolved.text,
                });
                env.push(EnvView {
                    name: key,
                    value: None,
                    secret_ref: Some(secret_name),
                });
            } else {
                env.push(EnvView {
                    name: key,
                    value: Some(resolved.text),
                    secret_ref: None,
                });
            }
        }
        secrets.sort_by(|left, right| left.name.cmp(&right.name));

        Ok(Self {
            name: name.to_owned(),
            id: resource_ids.platform.clone(),
            image: image_reference(resource, &resource_ids.snake)?,
            ingress,
            env,
            secrets,
            depends_on: topology
                .dependencies_of(name)
                .into_iter()
                .map(str::to_owned)
                .collect(),
            directory: service_directory(resource, &resource_ids.platform),
        })
    }

    /// Raw resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the runtime descriptor is written.
    pub fn descriptor_path(&self) -> Utf8PathBuf {
        self.directory.join(DESCRIPTOR_PATH)
    }

    /// Where the deployment parameters are written.
    pub fn parameters_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("infra/services/{}.parameters.json", self.id))
    }

    /// Renders the runtime descriptor.
    pub fn render_descriptor(&self, templates: &Templates) -> Result<String, SynthesisError> {
        templates.render("containerApp.tmpl.yaml", self)
    }

    /// Encodes the deployment parameter document.
    pub fn parameters(&self) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|entry| match (&entry.value, &entry.secret_ref) {
                (_, Some(secret)) => json!({ "name": entry.name, "secretRef": secret }),
                (value, None) => json!({ "name": entry.name, "value": value }),
            })
            .collect();
        let secrets: Vec<Value> = self
            .secrets
            .iter()
            .map(|secret| json!({ "name": secret.name, "value": secret.value }))
            .collect();
        let ingress = self.ingress.as_ref().map_or(Value::Null, |view| {
            json!({
                "external": view.external,
                "targetPort": view.target_port,
                "transport": view.transport,
                "allowInsecure": view.allow_insecure,
            })
        });

        json!({
            "$schema": DEPLOYMENT_PARAMETERS_SCHEMA,
            "contentVersion": "1.0.0.0",
            "parameters": {
                "containerAppEnvironmentId": { "value": deploy_var(outputs::ENVIRONMENT_ID) },
                "containerRegistryEndpoint": { "value": deploy_var(outputs::REGISTRY_ENDPOINT) },
                "identityId": { "value": deploy_var(outputs::IDENTITY_ID) },
                "name": { "value": self.id },
                "image": { "value": self.image },
                "ingress": { "value": ingress },
                "env": { "value": env },
                "secrets": { "value": secrets },
                "dependsOn": { "value": self.depends_on },
            },
        })
    }
}

impl Resolved {
    const fn plain(text: String) -> Self {
        Self {
            text,
            secret: false,
        }
    }
}

fn deploy_var(name: &str) -> String {
    format!("${{{name}}}")
}

fn ingress_view(binding: &Binding) -> Option<IngressView> {
    binding.target_port.map(|target_port| IngressView {
        external: binding.external,
        target_port,
        transport: binding.transport.as_str(),
        allow_insecure: binding.allow_insecure,
    })
}

fn image_reference(resource: &Resource, snake: &str) -> Result<String, SynthesisError> {
    match resource.kind() {
        ResourceKind::Container => resource
            .image()
            .filter(|image| !image.trim().is_empty())
            .map(str::to_owned)
            .ok_or_else(|| SynthesisError::IncompleteResource {
                resource: resource.name().to_owned(),
                message: String::from("container resources need an image reference"),
            }),
        _ => Ok(deploy_var(&format!("SERVICE_{snake}_IMAGE_NAME"))),
    }
}

/// Directory that receives the service's runtime descriptor: the project
/// file's directory, the project directory itself, or a directory named
/// after the service when no path is declared.
fn service_directory(resource: &Resource, platform: &str) -> Utf8PathBuf {
    let Some(path) = resource.path() else {
        return Utf8PathBuf::from(platform);
    };
    let directory = if path.extension().is_some() {
        path.parent().unwrap_or_else(|| Utf8Path::new(""))
    } else {
        path
    };
    directory
        .components()
        .filter(|component| !matches!(component, Utf8Component::CurDir))
        .collect()
}

fn resolve_value(
    topology: &Topology,
    ids: &Identifiers,
    resource: &Resource,
    key: &str,
    raw: &str,
) -> Result<Resolved, SynthesisError> {
    let segments = reference::parse_segments(raw).map_err(|message| {
        SynthesisError::Topology(crate::topology::TopologyError::MalformedReference {
            resource: resource.name().to_owned(),
            key: key.to_owned(),
            message,
        })
    })?;

    let mut text = String::with_capacity(raw.len());
    let mut secret = false;
    for segment in segments {
        match segment {
            Segment::Literal(literal) => text.push_str(literal),
            Segment::Placeholder { target, property } => {
                let resolved = resolve_placeholder(topology, ids, resource, key, target, property)?;
                secret |= resolved.secret;
                text.push_str(&resolved.text);
            }
        }
    }
    Ok(Resolved { text, secret })
}

fn resolve_placeholder(
    topology: &Topology,
    ids: &Identifiers,
    resource: &Resource,
    key: &str,
    target_name: &str,
    property: &str,
) -> Result<Resolved, SynthesisError> {
    let target = topology
        .resource(target_name)
        .ok_or_else(|| SynthesisError::DanglingReference {
            resource: resource.name().to_owned(),
            key: key.to_owned(),
            missing: target_name.to_owned(),
        })?;
    let unsupported = || SynthesisError::UnsupportedProperty {
        resource: resource.name().to_owned(),
        key: key.to_owned(),
        target: target_name.to_owned(),
        property: property.to_owned(),
        kind: target.kind().label().to_owned(),
    };
    let target_ids = ids.get(target_name)?;

    if target.kind().is_service() {
        let (binding_name, field) = property
            .strip_prefix("bindings.")
            .and_then(|rest| rest.rsplit_once('.'))
            .ok_or_else(unsupported)?;
        let binding = target
            .bindings()
            .iter()
            .find(|candidate| candidate.name == binding_name)
            .ok_or_else(unsupported)?;
        let port = binding
            .target_port
            .ok_or_else(|| SynthesisError::IncompleteResource {
                resource: target_name.to_owned(),
                message: format!("binding {binding_name} is referenced but has no target port"),
            })?;
        let host = binding_host(&target_ids.platform, binding);
        let text = match field {
            "url" => binding_url(binding, &host, port),
            "host" => host,
            "port" | "targetPort" => port.to_string(),
            "scheme" => binding_scheme(binding).to_owned(),
            _ => return Err(unsupported()),
        };
        return Ok(Resolved::plain(text));
    }

    match dependency_output(target.kind(), &target_ids.snake) {
        Some((expected, output)) if expected == property => Ok(Resolved {
            text: deploy_var(&output.name),
            secret: output.secret,
        }),
        _ => Err(unsupported()),
    }
}

fn binding_host(platform: &str, binding: &Binding) -> String {
    let domain = deploy_var(outputs::ENVIRONMENT_DOMAIN);
    if binding.external {
        format!("{platform}.{domain}")
    } else {
        format!("{platform}.internal.{domain}")
    }
}

fn binding_scheme(binding: &Binding) -> &str {
    if binding.external && binding.transport != Transport::Tcp {
        "https"
    } else {
        &binding.scheme
    }
}

fn binding_url(binding: &Binding, host: &str, port: u16) -> String {
    let scheme = binding_scheme(binding);
    if binding.transport == Transport::Tcp {
        format!("{scheme}://{host}:{port}")
    } else {
        format!("{scheme}://{host}")
    }
}

/// Names of service resources whose artifacts would land in the same
/// directory; returned as an error naming both.
pub(crate) fn check_directories(views: &[ServiceView]) -> Result<(), SynthesisError> {
    let mut claims = Claims::default();
    for view in views {
        claims.claim(view.directory.as_str(), &view.name)?;
    }
    Ok(())
}

/// Services whose primary binding is external.
pub(crate) fn exposed(views: &[ServiceView]) -> BTreeSet<&str> {
    views
        .iter()
        .filter(|view| view.ingress.as_ref().is_some_and(|ingress| ingress.external))
        .map(ServiceView::name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_topology;

    fn view_for(topology: &Topology, name: &str) -> ServiceView {
        let ids = Identifiers::derive(topology).unwrap_or_else(|err| panic!("ids: {err}"));
        let resource = topology
            .resource(name)
            .unwrap_or_else(|| panic!("{name} should exist"));
        ServiceView::build(topology, &ids, resource).unwrap_or_else(|err| panic!("view: {err}"))
    }

    fn env_entry<'a>(view: &'a ServiceView, key: &str) -> &'a EnvView {
        view.env
            .iter()
            .find(|entry| entry.name == key)
            .unwrap_or_else(|| panic!("{key} should be set"))
    }

    #[test]
    fn connection_strings_become_secret_references() {
        let view = view_for(&sample_topology(), "api");

        let entry = env_entry(&view, "ConnectionStrings__orders");
        assert_eq!(entry.value, None);
        assert_eq!(
            entry.secret_ref.as_deref(),
            Some("connectionstrings-orders")
        );
        assert!(view.secrets.iter().any(|secret| {
            secret.name == "connectionstrings-orders"
                && secret.value == "${ORDERS_CONNECTION_STRING}"
        }));
    }

    #[test]
    fn keyless_endpoints_stay_plain_values() {
        let view = view_for(&sample_topology(), "api");

        let entry = env_entry(&view, "Messaging__Endpoint");
        assert_eq!(entry.value.as_deref(), Some("${MESSAGING_ENDPOINT}"));
        assert_eq!(entry.secret_ref, None);
        assert!(view.secrets.iter().all(|secret| !secret.value.contains("MESSAGING")));
    }

    #[test]
    fn service_urls_use_internal_host_names() {
        let view = view_for(&sample_topology(), "web");

        let entry = env_entry(&view, "services__api__http__0");
        assert_eq!(
            entry.value.as_deref(),
            Some("http://api.internal.${AZURE_CONTAINER_APPS_ENVIRONMENT_DEFAULT_DOMAIN}")
        );
        assert!(view.secrets.is_empty());
    }

    #[test]
    fn implicit_entries_are_injected() {
        let view = view_for(&sample_topology(), "web");

        assert_eq!(env_entry(&view, "PORT").value.as_deref(), Some("8080"));
        assert_eq!(
            env_entry(&view, "AZURE_CLIENT_ID").value.as_deref(),
            Some("${AZURE_MANAGED_IDENTITY_CLIENT_ID}")
        );
        assert_eq!(
            env_entry(&view, "APPLICATIONINSIGHTS_CONNECTION_STRING")
                .value
                .as_deref(),
            Some("${TELEMETRY_CONNECTION_STRING}")
        );
    }

    #[test]
    fn workers_have_no_ingress_and_fall_back_to_project_directory() {
        let view = view_for(&sample_topology(), "worker");

        assert!(view.ingress.is_none());
        assert_eq!(
            view.descriptor_path(),
            Utf8PathBuf::from("src/Worker/manifests/containerApp.tmpl.yaml")
        );
        assert_eq!(view.image, "${SERVICE_WORKER_IMAGE_NAME}");
    }

    #[test]
    fn unsupported_properties_are_rejected() {
        let topology = Topology::new([
            Resource::new("web", ResourceKind::Project).with_env("X", "{cache.vaultUri}"),
            Resource::new("cache", ResourceKind::Datastore {
                engine: crate::topology::DatastoreEngine::Redis,
            }),
        ])
        .unwrap_or_else(|err| panic!("topology: {err}"));
        let ids = Identifiers::derive(&topology).unwrap_or_else(|err| panic!("ids: {err}"));
        let web = topology
            .resource("web")
            .unwrap_or_else(|| panic!("web should exist"));

        let err = ServiceView::build(&topology, &ids, web).expect_err("vaultUri on redis");
        assert!(
            matches!(err, SynthesisError::UnsupportedProperty { ref property, .. } if property == "vaultUri"),
            "{err}"
        );
    }
}
