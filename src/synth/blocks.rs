//! Shared infrastructure: the cross-cutting resources every deployment
//! needs, one block per dependency kind present, role assignments for the
//! shared identity and the outputs services consume.

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::ident::{platform_name, scoped_name, screaming_snake_case};
use crate::topology::{DatastoreEngine, DependencyKind, Resource, ResourceKind, Topology};

use super::names::{Claims, Identifiers};
use super::{SynthesisError, Templates};

const CORE_OWNER: &str = "shared infrastructure";
const POSTGRES_ADMIN_LOGIN: &str = "topogen";
const ACR_PULL_ROLE: &str = "7f951dda-4ed3-4680-a7ca-43fe172d538d";
const ACR_PUSH_ROLE: &str = "8311e382-0749-4cb8-b61a-304f252e45ec";
pub(crate) const DEPLOYMENT_PARAMETERS_SCHEMA: &str =
    "https://schema.management.azure.com/schemas/2019-04-01/deploymentParameters.json#";

/// Output names exported by the shared template for every deployment.
pub(crate) mod outputs {
    pub const REGISTRY_ENDPOINT: &str = "AZURE_CONTAINER_REGISTRY_ENDPOINT";
    pub const ENVIRONMENT_ID: &str = "AZURE_CONTAINER_APPS_ENVIRONMENT_ID";
    pub const ENVIRONMENT_DOMAIN: &str = "AZURE_CONTAINER_APPS_ENVIRONMENT_DEFAULT_DOMAIN";
    pub const IDENTITY_ID: &str = "AZURE_MANAGED_IDENTITY_ID";
    pub const IDENTITY_CLIENT_ID: &str = "AZURE_MANAGED_IDENTITY_CLIENT_ID";
    pub const LOG_WORKSPACE_ID: &str = "AZURE_LOG_ANALYTICS_WORKSPACE_ID";
}

/// Template per dependency kind, in rendering order.
const BLOCKS: [(DependencyKind, &str); 6] = [
    (DependencyKind::Datastore, "blocks/datastore.bicep"),
    (DependencyKind::QueueNamespace, "blocks/queue_namespace.bicep"),
    (DependencyKind::TelemetrySink, "blocks/telemetry.bicep"),
    (DependencyKind::Storage, "blocks/storage.bicep"),
    (DependencyKind::KeyVault, "blocks/key_vault.bicep"),
    (DependencyKind::Identity, "blocks/identity.bicep"),
];

/// Deploy-time output a dependency exports for services to consume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DependencyOutput {
    /// Output and deploy-time variable name.
    pub name: String,
    /// Whether the value must only reach services as a secret.
    pub secret: bool,
}

/// Output exported for a dependency, keyed by the property services
/// reference it through.
pub(crate) fn dependency_output(kind: &ResourceKind, snake: &str) -> Option<(&'static str, DependencyOutput)> {
    let (property, suffix, secret) = match kind {
        ResourceKind::Datastore { .. } => ("connectionString", "CONNECTION_STRING", true),
        ResourceKind::QueueNamespace { .. } | ResourceKind::Storage { .. } => {
            ("endpoint", "ENDPOINT", false)
        }
        ResourceKind::TelemetrySink => ("connectionString", "CONNECTION_STRING", false),
        ResourceKind::KeyVault => ("vaultUri", "VAULT_URI", false),
        ResourceKind::Identity => ("clientId", "CLIENT_ID", false),
        ResourceKind::Project | ResourceKind::Container => return None,
    };
    Some((
        property,
        DependencyOutput {
            name: format!("{snake}_{suffix}"),
            secret,
        },
    ))
}

#[derive(Debug, Serialize)]
struct CoreNames {
    identity: String,
    registry: String,
    log_workspace: String,
    environment: String,
    acr_pull_role: &'static str,
    acr_push_role: &'static str,
}

#[derive(Debug, Serialize)]
struct ChildView {
    symbol: String,
    resource_name: String,
}

#[derive(Debug, Serialize)]
struct DependencyView {
    name: String,
    symbol: String,
    resource_name: String,
    engine: Option<&'static str>,
    admin_login: Option<&'static str>,
    password_param: Option<String>,
    queues: Vec<ChildView>,
    topics: Vec<ChildView>,
    containers: Vec<ChildView>,
}

#[derive(Debug, Serialize)]
struct RoleView {
    symbol: String,
    scope: String,
    role_id: &'static str,
}

#[derive(Debug, Serialize)]
struct OutputView {
    name: String,
    value: String,
    secure: bool,
}

#[derive(Debug, Serialize)]
struct SecureParam {
    name: String,
    variable: String,
}

/// Everything the shared templates render from.
#[derive(Debug, Serialize)]
pub(crate) struct SharedView {
    core: CoreNames,
    datastores: Vec<DependencyView>,
    queue_namespaces: Vec<DependencyView>,
    telemetry: Vec<DependencyView>,
    storage: Vec<DependencyView>,
    key_vaults: Vec<DependencyView>,
    identities: Vec<DependencyView>,
    roles: Vec<RoleView>,
    outputs: Vec<OutputView>,
    secure_params: Vec<SecureParam>,
}

impl SharedView {
    /// Builds the view for `topology`, rejecting clashing generated names.
    pub fn build(
        topology: &Topology,
        ids: &Identifiers,
        token: &str,
    ) -> Result<Self, SynthesisError> {
        let mut planner = Planner {
            ids,
            token,
            symbols: Claims::default(),
            resource_names: Claims::default(),
            output_names: Claims::default(),
        };
        let mut view = Self {
            core: planner.core()?,
            datastores: Vec::new(),
            queue_namespaces: Vec::new(),
            telemetry: Vec::new(),
            storage: Vec::new(),
            key_vaults: Vec::new(),
            identities: Vec::new(),
            roles: Vec::new(),
            outputs: planner.core_outputs()?,
            secure_params: Vec::new(),
        };

        for kind in DependencyKind::ALL {
            for resource in topology.of_dependency_kind(kind) {
                let dependency = planner.dependency(resource)?;
                view.roles.extend(planner.roles(resource, &dependency.symbol)?);
                if let Some(output) = planner.output(resource, &dependency.symbol)? {
                    view.outputs.push(output);
                }
                if let Some(param) = &dependency.password_param {
                    view.secure_params.push(SecureParam {
                        name: param.clone(),
                        variable: format!("{}_PASSWORD", ids.get(resource.name())?.snake),
                    });
                }
                view.blocks_mut(kind).push(dependency);
            }
        }
        Ok(view)
    }

    fn blocks_mut(&mut self, kind: DependencyKind) -> &mut Vec<DependencyView> {
        match kind {
            DependencyKind::Datastore => &mut self.datastores,
            DependencyKind::QueueNamespace => &mut self.queue_namespaces,
            DependencyKind::TelemetrySink => &mut self.telemetry,
            DependencyKind::Storage => &mut self.storage,
            DependencyKind::KeyVault => &mut self.key_vaults,
            DependencyKind::Identity => &mut self.identities,
        }
    }

    fn has(&self, kind: DependencyKind) -> bool {
        match kind {
            DependencyKind::Datastore => !self.datastores.is_empty(),
            DependencyKind::QueueNamespace => !self.queue_namespaces.is_empty(),
            DependencyKind::TelemetrySink => !self.telemetry.is_empty(),
            DependencyKind::Storage => !self.storage.is_empty(),
            DependencyKind::KeyVault => !self.key_vaults.is_empty(),
            DependencyKind::Identity => !self.identities.is_empty(),
        }
    }

    /// Renders `infra/resources.bicep`.
    pub fn render_resources(&self, templates: &Templates) -> Result<String, SynthesisError> {
        let mut rendered = templates.render("resources.bicep", self)?;
        for (kind, template) in BLOCKS {
            if self.has(kind) {
                rendered.push_str(&templates.render(template, self)?);
            }
        }
        rendered.push_str(&templates.render("roles_outputs.bicep", self)?);
        Ok(rendered)
    }

    /// Renders `infra/main.bicep`.
    pub fn render_main(&self, templates: &Templates) -> Result<String, SynthesisError> {
        templates.render("main.bicep", self)
    }

    /// Encodes `infra/main.parameters.json`.
    pub fn main_parameters(&self) -> Value {
        let mut parameters = Map::new();
        parameters.insert(
            String::from("environmentName"),
            json!({ "value": "${AZURE_ENV_NAME}" }),
        );
        parameters.insert(
            String::from("location"),
            json!({ "value": "${AZURE_LOCATION}" }),
        );
        parameters.insert(
            String::from("principalId"),
            json!({ "value": "${AZURE_PRINCIPAL_ID}" }),
        );
        for param in &self.secure_params {
            parameters.insert(
                param.name.clone(),
                json!({ "value": format!("${{{}}}", param.variable) }),
            );
        }
        json!({
            "$schema": DEPLOYMENT_PARAMETERS_SCHEMA,
            "contentVersion": "1.0.0.0",
            "parameters": parameters,
        })
    }
}

struct Planner<'a> {
    ids: &'a Identifiers,
    token: &'a str,
    symbols: Claims,
    resource_names: Claims,
    output_names: Claims,
}

impl Planner<'_> {
    fn core(&mut self) -> Result<CoreNames, SynthesisError> {
        for symbol in [
            "managedIdentity",
            "containerRegistry",
            "registryPull",
            "registryPush",
            "logAnalyticsWorkspace",
            "containerAppEnvironment",
        ] {
            self.symbols.claim(symbol, CORE_OWNER)?;
        }
        Ok(CoreNames {
            identity: scoped_name("mi", self.token, 128, true),
            registry: scoped_name("acr", self.token, 50, false),
            log_workspace: scoped_name("law", self.token, 63, true),
            environment: scoped_name("cae", self.token, 32, true),
            acr_pull_role: ACR_PULL_ROLE,
            acr_push_role: ACR_PUSH_ROLE,
        })
    }

    fn core_outputs(&mut self) -> Result<Vec<OutputView>, SynthesisError> {
        let core = [
            (outputs::REGISTRY_ENDPOINT, "containerRegistry.properties.loginServer"),
            (outputs::ENVIRONMENT_ID, "containerAppEnvironment.id"),
            (
                outputs::ENVIRONMENT_DOMAIN,
                "containerAppEnvironment.properties.defaultDomain",
            ),
            (outputs::IDENTITY_ID, "managedIdentity.id"),
            (
                outputs::IDENTITY_CLIENT_ID,
                "managedIdentity.properties.clientId",
            ),
            (outputs::LOG_WORKSPACE_ID, "logAnalyticsWorkspace.id"),
        ];
        core.into_iter()
            .map(|(name, value)| -> Result<OutputView, SynthesisError> {
                self.output_names.claim(name, CORE_OWNER)?;
                Ok(OutputView {
                    name: name.to_owned(),
                    value: value.to_owned(),
                    secure: false,
                })
            })
            .collect()
    }

    fn dependency(&mut self, resource: &Resource) -> Result<DependencyView, SynthesisError> {
        let name = resource.name();
        let ids = self.ids.get(name)?;
        let (max_len, hyphens) = name_limits(resource.kind());
        let resource_name = scoped_name(&ids.platform, self.token, max_len, hyphens);
        self.resource_names.claim(&resource_name, name)?;
        self.symbols.claim(&ids.symbol, name)?;

        let mut view = DependencyView {
            name: name.to_owned(),
            symbol: ids.symbol.clone(),
            resource_name,
            engine: None,
            admin_login: None,
            password_param: None,
            queues: Vec::new(),
            topics: Vec::new(),
            containers: Vec::new(),
        };

        match resource.kind() {
            ResourceKind::Datastore { engine } => {
                view.engine = Some(engine.label());
                if *engine == DatastoreEngine::Postgres {
                    self.symbols
                        .claim(&format!("{}_firewall", ids.symbol), name)?;
                    let param = format!("{}_password", ids.symbol);
                    self.symbols.claim(&param, name)?;
                    view.admin_login = Some(POSTGRES_ADMIN_LOGIN);
                    view.password_param = Some(param);
                }
            }
            ResourceKind::QueueNamespace { queues, topics } => {
                view.queues = self.children(name, &ids.symbol, "q", queues)?;
                view.topics = self.children(name, &ids.symbol, "t", topics)?;
            }
            ResourceKind::Storage { containers } => {
                if !containers.is_empty() {
                    self.symbols.claim(&format!("{}_blobs", ids.symbol), name)?;
                }
                view.containers = self.children(name, &ids.symbol, "c", containers)?;
            }
            _ => {}
        }
        Ok(view)
    }

    fn children<'n>(
        &mut self,
        owner: &str,
        parent_symbol: &str,
        marker: &str,
        names: impl IntoIterator<Item = &'n String>,
    ) -> Result<Vec<ChildView>, SynthesisError> {
        names
            .into_iter()
            .map(|child| -> Result<ChildView, SynthesisError> {
                let symbol = format!(
                    "{parent_symbol}_{marker}_{}",
                    screaming_snake_case(child).to_ascii_lowercase()
                );
                self.symbols.claim(&symbol, &format!("{owner}/{child}"))?;
                Ok(ChildView {
                    symbol,
                    resource_name: platform_name(child),
                })
            })
            .collect()
    }

    fn roles(&mut self, resource: &Resource, scope: &str) -> Result<Vec<RoleView>, SynthesisError> {
        role_definitions(resource.kind())
            .iter()
            .map(|&(suffix, role_id)| -> Result<RoleView, SynthesisError> {
                let symbol = format!("{scope}_{suffix}");
                self.symbols.claim(&symbol, resource.name())?;
                Ok(RoleView {
                    symbol,
                    scope: scope.to_owned(),
                    role_id,
                })
            })
            .collect()
    }

    fn output(
        &mut self,
        resource: &Resource,
        symbol: &str,
    ) -> Result<Option<OutputView>, SynthesisError> {
        let snake = &self.ids.get(resource.name())?.snake;
        let Some((_, output)) = dependency_output(resource.kind(), snake) else {
            return Ok(None);
        };
        self.output_names.claim(&output.name, resource.name())?;
        Ok(Some(OutputView {
            name: output.name,
            value: output_expression(resource.kind(), symbol),
            secure: output.secret,
        }))
    }
}

const fn name_limits(kind: &ResourceKind) -> (usize, bool) {
    match kind {
        ResourceKind::Datastore {
            engine: DatastoreEngine::Cosmos,
        } => (44, true),
        ResourceKind::QueueNamespace { .. } => (50, true),
        ResourceKind::Storage { .. } => (24, false),
        ResourceKind::KeyVault => (24, true),
        _ => (63, true),
    }
}

const fn role_definitions(kind: &ResourceKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        ResourceKind::QueueNamespace { .. } => &[
            ("sender", "69a216fc-b8fb-44d8-bc22-1f3c2cd27a39"),
            ("receiver", "4f6d3b9b-027b-4f4c-9142-0e5a2a2247e0"),
        ],
        ResourceKind::Storage { .. } => &[("blob_contributor", "ba92f5b4-2d11-453d-a403-e96b0029c9fe")],
        ResourceKind::KeyVault => &[("secrets_user", "4633458b-17de-408a-b874-0445c86b69e6")],
        ResourceKind::TelemetrySink => &[("metrics_publisher", "3913510d-42f4-4e42-8a64-420c390055eb")],
        _ => &[],
    }
}

fn output_expression(kind: &ResourceKind, symbol: &str) -> String {
    match kind {
        ResourceKind::Datastore {
            engine: DatastoreEngine::Postgres,
        } => format!(
            "format('Host={{0}};Database=postgres;Username={POSTGRES_ADMIN_LOGIN};Password={{1}}', {symbol}.properties.fullyQualifiedDomainName, {symbol}_password)"
        ),
        ResourceKind::Datastore {
            engine: DatastoreEngine::Redis,
        } => format!(
            "format('{{0}}:6380,ssl=true,password={{1}}', {symbol}.properties.hostName, {symbol}.listKeys().primaryKey)"
        ),
        ResourceKind::Datastore {
            engine: DatastoreEngine::Cosmos,
        } => format!("{symbol}.listConnectionStrings().connectionStrings[0].connectionString"),
        ResourceKind::QueueNamespace { .. } => format!("{symbol}.properties.serviceBusEndpoint"),
        ResourceKind::Storage { .. } => format!("{symbol}.properties.primaryEndpoints.blob"),
        ResourceKind::TelemetrySink => format!("{symbol}.properties.ConnectionString"),
        ResourceKind::KeyVault => format!("{symbol}.properties.vaultUri"),
        ResourceKind::Identity => format!("{symbol}.properties.clientId"),
        ResourceKind::Project | ResourceKind::Container => String::new(),
    }
}
