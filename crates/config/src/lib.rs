//! Construction options for a docmgt document manager.
//!
//! Options are layered with `figment`: built-in defaults, then an optional
//! configuration file (TOML, YAML or JSON, picked by extension), then
//! `DOCMGT_`-prefixed environment variables.
//!
//! ```toml
//! directory = "/srv/documents"
//! table = "documents"
//! columns = "path, name, ext, size integer, author text"
//! authority = "directory"
//!
//! [extensions]
//! report = "pdf"
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Prefix for environment variable overrides (`DOCMGT_TABLE=documents`).
pub const ENV_PREFIX: &str = "DOCMGT_";
/// Filename of the index database when no location is configured.
pub const DEFAULT_INDEX_FILE: &str = "docmgt";
/// Filename looked for in the platform configuration directory.
pub const CONFIG_FILE: &str = "docmgt.toml";
pub use docmgt_storage::DEFAULT_COLUMNS;

/// Which side wins when the directory and the index disagree on open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    /// The index is rebuilt from a directory scan when the manager opens.
    #[default]
    Directory,
    /// Existing index rows are trusted as-is.
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// The managed directory.
    pub directory: PathBuf,
    /// Operate on the filesystem only, without an index database.
    pub no_index: bool,
    /// Location of the index database. Relative paths resolve against the
    /// working directory, not the managed directory.
    pub index_location: Option<PathBuf>,
    pub table: String,
    /// Column definitions (`name [type], ...`) used when creating the table.
    pub columns: String,
    /// Columns returned by searches. Defaults to every column of the table.
    pub projection: Option<Vec<String>>,
    pub authority: Authority,
    /// Document role to filename extension.
    pub extensions: BTreeMap<String, String>,
    /// Scan subdirectories of the managed directory.
    pub recursive: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            no_index: false,
            index_location: None,
            table: "files".to_string(),
            columns: DEFAULT_COLUMNS.to_string(),
            projection: None,
            authority: Authority::Directory,
            extensions: BTreeMap::new(),
            recursive: false,
        }
    }
}

impl Options {
    /// Default options for the given managed directory.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into(), ..Self::default() }
    }

    /// Load options from defaults, an optional file and the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::extract(Self::figment(file)?.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Load options using `docmgt.toml` from the platform configuration
    /// directory, if there is one.
    pub fn discover() -> Result<Self> {
        let file = ProjectDirs::from("", "", "docmgt")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .filter(|path| path.is_file());
        match &file {
            Some(path) => tracing::debug!(path = %path.display(), "Using configuration file"),
            None => tracing::debug!("No configuration file found"),
        }
        Self::load(file.as_deref())
    }

    /// Defaults plus the configuration file, without environment overrides.
    fn figment(file: Option<&Path>) -> Result<Figment> {
        let figment = Figment::from(Serialized::defaults(Self::default()));
        let Some(file) = file else {
            return Ok(figment);
        };
        if !file.is_file() {
            exn::bail!(ErrorKind::Invalid(format!("configuration file {} does not exist", file.display())));
        }
        let extension = file.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
        Ok(match extension.as_deref() {
            Some("toml") => figment.merge(Toml::file(file)),
            Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
            Some("json") => figment.merge(Json::file(file)),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(file.to_path_buf())),
        })
    }

    fn extract(figment: Figment) -> Result<Self> {
        let options: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Invalid("directory must not be empty".to_string()));
        }
        if self.table.trim().is_empty() {
            exn::bail!(ErrorKind::Invalid("table name must not be empty".to_string()));
        }
        if self.columns.trim().is_empty() {
            exn::bail!(ErrorKind::Invalid("column definitions must not be empty".to_string()));
        }
        if self.projection.as_ref().is_some_and(Vec::is_empty) {
            exn::bail!(ErrorKind::Invalid("explicit projection must name at least one column".to_string()));
        }
        for (role, extension) in &self.extensions {
            let extension = extension.trim_start_matches('.');
            if extension.is_empty() || extension.contains(['/', '\\']) {
                exn::bail!(ErrorKind::Invalid(format!("unusable extension for role {role:?}")));
            }
        }
        if self.no_index && self.index_location.is_some() {
            tracing::warn!("index_location is ignored when no_index is set");
        }
        Ok(())
    }

    /// Where the index database lives.
    pub fn index_location(&self) -> PathBuf {
        self.index_location.clone().unwrap_or_else(|| self.directory.join(DEFAULT_INDEX_FILE))
    }

    /// Extension (without the leading dot) configured for a document role.
    pub fn extension_for(&self, role: &str) -> Option<&str> {
        self.extensions.get(role).map(|ext| ext.trim_start_matches('.'))
    }
}
