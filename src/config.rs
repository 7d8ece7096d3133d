use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{DialectError, Result};

pub const DEFAULT_GROUP: &str = "default";

static PASSWORD_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"password=('(?:[^'\\]|\\.)*'|\S*)").expect("valid regex"));

/// Whether a node accepts writes or only serves reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Master,
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

/// One database node of a connection group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigNode {
    /// Full connection string; when set, the discrete fields are ignored.
    #[serde(default)]
    pub link: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing)]
    pub pass: String,
    /// Database name; doubles as the default schema.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub ssl: bool,
    /// Skip certificate verification. Only honoured when `ssl` is set.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_pool_size")]
    pub max_pool_size: usize,
}

fn default_host() -> String {
    String::from("localhost")
}

fn default_port() -> u16 {
    5432
}

fn default_pool_size() -> usize {
    16
}

impl Default for ConfigNode {
    fn default() -> Self {
        Self {
            link: String::new(),
            host: default_host(),
            port: default_port(),
            user: String::new(),
            pass: String::new(),
            name: String::new(),
            timezone: String::new(),
            role: Role::default(),
            ssl: false,
            accept_invalid_certs: false,
            max_pool_size: default_pool_size(),
        }
    }
}

impl ConfigNode {
    /// Connection string handed to the wire driver. Contains the password.
    pub fn source(&self) -> String {
        if !self.link.is_empty() {
            return self.link.clone();
        }
        let mut source = format!(
            "user={} password={} host={} port={} dbname={}",
            quote_conn_value(&self.user),
            quote_conn_value(&self.pass),
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.name),
        );
        if !self.timezone.is_empty() {
            source.push_str(&format!(
                " options={}",
                quote_conn_value(&format!("-c TimeZone={}", self.timezone))
            ));
        }
        source
    }

    /// [`ConfigNode::source`] with the password masked, for logs and errors.
    pub fn filtered_source(&self) -> String {
        filter_link(&self.source())
    }
}

/// Cache behaviour of the table metadata layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Remember failed fetches until the key is cleared instead of retrying.
    #[serde(default)]
    pub cache_failures: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<ConfigNode>>,
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("taossql")
            .join("config.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DialectError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DialectError::Config(e.to_string()))
    }

    pub fn group(&self, name: &str) -> Result<&[ConfigNode]> {
        match self.groups.get(name) {
            Some(nodes) if !nodes.is_empty() => Ok(nodes),
            _ => Err(DialectError::Config(format!(
                "no nodes configured for group {:?}",
                name
            ))),
        }
    }
}

/// Mask the password of a key=value connection string.
pub fn filter_link(link: &str) -> String {
    PASSWORD_PAIR.replace_all(link, "password=xxx").into_owned()
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
