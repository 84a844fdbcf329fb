//! Configuration loading via `ortho-config`.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::synth::DeploymentScope;

/// Settings layered from defaults, `topogen.toml`, `TOPOGEN_*` environment
/// variables and command-line flags, in increasing order of precedence.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TOPOGEN",
    discovery(
        app_name = "topogen",
        env_var = "TOPOGEN_CONFIG_PATH",
        config_file_name = "topogen.toml",
        dotfile_name = ".topogen.toml",
        project_file_name = "topogen.toml"
    )
)]
pub struct TopogenConfig {
    /// Deployment environment name. Required for synthesis.
    #[ortho_config(default = String::new())]
    pub environment: String,
    /// Deployment region. Defaults to `eastus`.
    #[ortho_config(default = "eastus".to_owned())]
    pub location: String,
    /// Subscription identifier; part of the resource token seed when set.
    pub subscription_id: Option<String>,
    /// Topology manifest, relative to the project root.
    #[ortho_config(default = "topology.json".to_owned())]
    pub manifest: String,
    /// Service whose configuration records exposure decisions.
    #[ortho_config(default = "app".to_owned())]
    pub service_name: String,
    /// Directory holding per-environment state, relative to the project
    /// root.
    #[ortho_config(default = ".topogen".to_owned())]
    pub state_dir: String,
    /// Fail instead of prompting when input is needed.
    #[ortho_config(default = false)]
    pub no_prompt: bool,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    flag: Option<&'static str>,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            flag: None,
        }
    }

    const fn with_flag(mut self, flag: &'static str) -> Self {
        self.flag = Some(flag);
        self
    }

    fn sources(&self) -> String {
        self.flag.map_or_else(
            || format!("set {} or add {} to topogen.toml", self.env_var, self.toml_key),
            |flag| {
                format!(
                    "set {}, pass {flag} or add {} to topogen.toml",
                    self.env_var, self.toml_key
                )
            },
        )
    }
}

impl TopogenConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.sources()
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("topogen")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages name
    /// the environment variable and TOML key that supply each value, plus the
    /// command-line flag for fields that have one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.environment,
            &FieldMetadata::new("environment name", "TOPOGEN_ENVIRONMENT", "environment")
                .with_flag("--environment"),
        )?;
        Self::require_field(
            &self.location,
            &FieldMetadata::new("deployment location", "TOPOGEN_LOCATION", "location")
                .with_flag("--location"),
        )?;
        Self::require_field(
            &self.manifest,
            &FieldMetadata::new("topology manifest path", "TOPOGEN_MANIFEST", "manifest"),
        )?;
        Self::require_field(
            &self.service_name,
            &FieldMetadata::new("owning service name", "TOPOGEN_SERVICE_NAME", "service_name"),
        )?;
        Self::require_field(
            &self.state_dir,
            &FieldMetadata::new("state directory", "TOPOGEN_STATE_DIR", "state_dir"),
        )?;
        Ok(())
    }

    /// Deployment scope described by this configuration.
    #[must_use]
    pub fn scope(&self) -> DeploymentScope {
        let mut scope = DeploymentScope::new(&self.environment, &self.location);
        scope.subscription_id = self
            .subscription_id
            .as_deref()
            .map(str::trim)
            .filter(|subscription| !subscription.is_empty())
            .map(str::to_owned);
        scope
    }

    /// Manifest location under `root`.
    #[must_use]
    pub fn manifest_path(&self, root: &Utf8Path) -> Utf8PathBuf {
        root.join(&self.manifest)
    }

    /// State directory under `root`.
    #[must_use]
    pub fn state_path(&self, root: &Utf8Path) -> Utf8PathBuf {
        root.join(&self.state_dir)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
