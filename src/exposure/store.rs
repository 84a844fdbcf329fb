//! Persisted exposure decisions.
//!
//! Decisions live in the per-environment configuration file
//! `<state_dir>/<environment>/config.toml` under
//! `services.<service>.config.exposedServices`, next to a root `version`
//! marker. Writes preserve every other key in the file.
//!
//! Decoding is tolerant: a value of the wrong shape is reported as
//! [`PersistedDecisions::Unreadable`] and individual malformed entries as
//! [`PersistedEntry::Malformed`], leaving the caller to decide how to
//! recover. I/O failures, unparseable TOML and files written under a newer
//! schema version are errors; a newer file is never read or rewritten.

use std::collections::BTreeSet;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use thiserror::Error;

/// Schema version written to the environment file.
pub const DECISIONS_VERSION: i64 = 1;

const CONFIG_FILE_NAME: &str = "config.toml";
const VERSION_KEY: &str = "version";
const SERVICES_SECTION: &str = "services";
const CONFIG_SECTION: &str = "config";
const EXPOSED_KEY: &str = "exposedServices";

/// Errors raised while reading or writing persisted decisions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the file is not valid TOML.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the file declares a schema version newer than
    /// [`DECISIONS_VERSION`].
    #[error(
        "{path} uses schema version {found}, newer than supported version {supported}",
        supported = DECISIONS_VERSION
    )]
    UnsupportedVersion {
        /// Path declaring the version.
        path: Utf8PathBuf,
        /// Version found in the file.
        found: i64,
    },
    /// Raised when a table the decisions live under has another type, so
    /// writing would discard user content.
    #[error("invalid environment configuration in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// One decoded entry of the persisted decision list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PersistedEntry {
    /// A service name.
    Name(String),
    /// An entry that is not a string.
    Malformed {
        /// Position in the persisted list.
        index: usize,
        /// Rendering of the offending value.
        found: String,
    },
}

/// Outcome of reading persisted decisions for one service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PersistedDecisions {
    /// Nothing has been recorded.
    Absent,
    /// Something is recorded but cannot be interpreted as a decision list.
    Unreadable {
        /// Why the value was rejected.
        reason: String,
    },
    /// The recorded list, entry by entry.
    Entries(Vec<PersistedEntry>),
}

impl PersistedDecisions {
    /// Builds a well-formed entry list from names.
    #[must_use]
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Entries(
            names
                .into_iter()
                .map(|name| PersistedEntry::Name(name.into()))
                .collect(),
        )
    }
}

/// Storage for exposure decisions keyed by service.
pub trait DecisionStore: Send + Sync {
    /// Reads the decisions recorded for `service`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backing file cannot be read or
    /// parsed.
    fn load(&self, service: &str) -> Result<PersistedDecisions, StoreError>;

    /// Replaces the decisions recorded for `service` with `exposed`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backing file cannot be updated.
    fn save(&self, service: &str, exposed: &BTreeSet<String>) -> Result<(), StoreError>;
}

/// Decision store backed by the environment's `config.toml`.
#[derive(Clone, Debug)]
pub struct EnvironmentStore {
    path: Utf8PathBuf,
}

impl EnvironmentStore {
    /// Creates a store for `environment` under `state_dir`.
    #[must_use]
    pub fn new(state_dir: &Utf8Path, environment: &str) -> Self {
        Self {
            path: state_dir.join(environment).join(CONFIG_FILE_NAME),
        }
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl DecisionStore for EnvironmentStore {
    fn load(&self, service: &str) -> Result<PersistedDecisions, StoreError> {
        let Some(contents) = read_config(&self.path)? else {
            return Ok(PersistedDecisions::Absent);
        };
        let value = parse_toml(&self.path, &contents)?;
        check_version(&self.path, &value)?;
        Ok(decode_decisions(&value, service))
    }

    fn save(&self, service: &str, exposed: &BTreeSet<String>) -> Result<(), StoreError> {
        let contents = read_config(&self.path)?.unwrap_or_default();
        let mut value = parse_toml(&self.path, &contents)?;
        check_version(&self.path, &value)?;
        write_decisions_value(&self.path, &mut value, service, exposed)?;
        write_config(&self.path, &value)
    }
}

fn read_config(path: &Utf8Path) -> Result<Option<String>, StoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = file_name(path)?;

    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(StoreError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            });
        }
    };

    match dir.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn parse_toml(path: &Utf8Path, contents: &str) -> Result<toml::Value, StoreError> {
    if contents.trim().is_empty() {
        return Ok(toml::Value::Table(toml::value::Table::new()));
    }

    toml::from_str(contents).map_err(|err| StoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn check_version(path: &Utf8Path, value: &toml::Value) -> Result<(), StoreError> {
    match value.get(VERSION_KEY).and_then(toml::Value::as_integer) {
        Some(found) if found > DECISIONS_VERSION => Err(StoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            found,
        }),
        _ => Ok(()),
    }
}

fn decode_decisions(value: &toml::Value, service: &str) -> PersistedDecisions {
    let Some(root) = value.as_table() else {
        return PersistedDecisions::Unreadable {
            reason: String::from("configuration root is not a table"),
        };
    };

    if let Some(version) = root.get(VERSION_KEY) {
        if version.as_integer().is_none() {
            return PersistedDecisions::Unreadable {
                reason: format!("{VERSION_KEY} must be an integer, found {version}"),
            };
        }
    }

    let raw = root
        .get(SERVICES_SECTION)
        .and_then(|services| services.get(service))
        .and_then(|section| section.get(CONFIG_SECTION))
        .and_then(|config| config.get(EXPOSED_KEY));
    let Some(raw) = raw else {
        return PersistedDecisions::Absent;
    };

    let Some(items) = raw.as_array() else {
        return PersistedDecisions::Unreadable {
            reason: format!("{} must be an array, found {raw}", exposed_key_path(service)),
        };
    };

    PersistedDecisions::Entries(
        items
            .iter()
            .enumerate()
            .map(|(index, item)| match item.as_str() {
                Some(name) => PersistedEntry::Name(name.trim().to_owned()),
                None => PersistedEntry::Malformed {
                    index,
                    found: item.to_string(),
                },
            })
            .collect(),
    )
}

fn write_decisions_value(
    path: &Utf8Path,
    value: &mut toml::Value,
    service: &str,
    exposed: &BTreeSet<String>,
) -> Result<(), StoreError> {
    let root = value
        .as_table_mut()
        .ok_or_else(|| invalid(path, String::from("configuration root is not a table")))?;
    root.insert(
        String::from(VERSION_KEY),
        toml::Value::Integer(DECISIONS_VERSION),
    );

    let services = child_table(path, root, SERVICES_SECTION, SERVICES_SECTION)?;
    let section = child_table(
        path,
        services,
        service,
        &format!("{SERVICES_SECTION}.{service}"),
    )?;
    let config = child_table(
        path,
        section,
        CONFIG_SECTION,
        &format!("{SERVICES_SECTION}.{service}.{CONFIG_SECTION}"),
    )?;

    config.insert(
        String::from(EXPOSED_KEY),
        toml::Value::Array(exposed.iter().cloned().map(toml::Value::String).collect()),
    );
    Ok(())
}

fn child_table<'a>(
    path: &Utf8Path,
    parent: &'a mut toml::value::Table,
    key: &str,
    label: &str,
) -> Result<&'a mut toml::value::Table, StoreError> {
    parent
        .entry(key.to_owned())
        .or_insert_with(|| toml::Value::Table(toml::value::Table::new()))
        .as_table_mut()
        .ok_or_else(|| invalid(path, format!("[{label}] must be a table")))
}

fn write_config(path: &Utf8Path, value: &toml::Value) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| StoreError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;

    let file_name = file_name(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| StoreError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;

    let rendered = toml::to_string_pretty(value).map_err(|err| StoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    dir.write(file_name, rendered).map_err(|err| StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn file_name(path: &Utf8Path) -> Result<&str, StoreError> {
    path.file_name().ok_or_else(|| {
        invalid(
            path,
            String::from("configuration file path is missing a filename"),
        )
    })
}

fn invalid(path: &Utf8Path, message: String) -> StoreError {
    StoreError::InvalidStructure {
        path: path.to_path_buf(),
        message,
    }
}

fn exposed_key_path(service: &str) -> String {
    format!("{SERVICES_SECTION}.{service}.{CONFIG_SECTION}.{EXPOSED_KEY}")
}
