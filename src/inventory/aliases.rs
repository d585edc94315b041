// Tool alias table: short names, global defaults and per-invocation overlay (~/.dssh.yaml)

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use super::address::{parse_tags, Address};
use crate::output::errors::{DsshError, FormatError};

/// One named entry of the alias table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    /// Network address, `user@host:port` shorthand allowed
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_tags",
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl AliasEntry {
    pub fn new(addr: impl Into<String>) -> Self {
        AliasEntry {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// The stored address with the entry's own user/port folded in
    pub fn address(&self) -> Result<Address, FormatError> {
        let addr: Address = self.addr.parse()?;
        addr.with_explicit(self.user.as_deref(), self.port, &self.addr)
    }
}

/// Values supplied for this invocation only; they beat every stored source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    #[serde(rename = "overlayUser", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "overlayPort", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(rename = "overlayJump", default, skip_serializing_if = "Option::is_none")]
    pub jump: Option<String>,
    #[serde(rename = "overlayHost", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip)]
    pub identity_files: Vec<PathBuf>,
    #[serde(skip)]
    pub timeout: Option<u64>,
}

impl Overlay {
    pub fn is_empty(&self) -> bool {
        *self == Overlay::default()
    }

    /// Combine with a lower-priority overlay, `self` winning field by field
    pub fn over(self, base: &Overlay) -> Overlay {
        Overlay {
            user: self.user.or_else(|| base.user.clone()),
            port: self.port.filter(|p| *p != 0).or(base.port),
            jump: self.jump.or_else(|| base.jump.clone()),
            address: self.address.or_else(|| base.address.clone()),
            identity_files: if self.identity_files.is_empty() {
                base.identity_files.clone()
            } else {
                self.identity_files
            },
            timeout: self.timeout.or(base.timeout),
        }
    }

    /// What a jump host inherits: only the caller's keys
    pub fn for_jump(&self) -> Overlay {
        Overlay {
            identity_files: self.identity_files.clone(),
            ..Default::default()
        }
    }
}

/// The whole tool configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_auth_sock: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_jump: Option<String>,
    #[serde(default)]
    pub hosts: BTreeMap<String, AliasEntry>,
    #[serde(default, skip_serializing_if = "Overlay::is_empty")]
    pub overlay: Overlay,
}

impl AliasTable {
    /// Default location, `~/.dssh.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".dssh.yaml"))
    }

    /// Load the table. A missing file is an empty table unless `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self, DsshError> {
        if !path.exists() {
            if required {
                return Err(DsshError::Config {
                    message: "config file not found".to_string(),
                    path: Some(path.to_path_buf()),
                    suggestion: Some("Create it or drop --config to use ~/.dssh.yaml".to_string()),
                });
            }
            debug!(path = %path.display(), "no alias table, using built-in defaults");
            return Ok(AliasTable::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| DsshError::io(format!("Failed to read config file: {}", e), path))?;

        Self::parse(&content).map_err(|e| match e {
            DsshError::Config {
                message,
                suggestion,
                ..
            } => DsshError::Config {
                message,
                path: Some(path.to_path_buf()),
                suggestion,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, DsshError> {
        if content.trim().is_empty() {
            return Ok(AliasTable::default());
        }

        let table: AliasTable = serde_yaml::from_str(content).map_err(|e| DsshError::Config {
            message: format!("Invalid config YAML: {}", e),
            path: None,
            suggestion: Some("Check the config file syntax".to_string()),
        })?;

        for (name, entry) in &table.hosts {
            entry.address().map_err(|e| DsshError::Config {
                message: format!("host '{}': {}", name, e),
                path: None,
                suggestion: None,
            })?;
        }

        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<(), DsshError> {
        let yaml = serde_yaml::to_string(self).map_err(|e| DsshError::Config {
            message: format!("Failed to serialize config: {}", e),
            path: Some(path.to_path_buf()),
            suggestion: None,
        })?;
        std::fs::write(path, yaml)
            .map_err(|e| DsshError::io(format!("Failed to write config file: {}", e), path))
    }

    pub fn get(&self, name: &str) -> Option<&AliasEntry> {
        self.hosts.get(name)
    }

    /// Alias names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    /// Directory holding `<module>.sh` files; relative to the working directory when unset
    pub fn modules_dir(&self) -> PathBuf {
        self.modules_dir.clone().unwrap_or_default()
    }

    /// Agent socket: configured, else `$SSH_AUTH_SOCK`, else `~/.ssh/ssh_auth_sock`
    pub fn ssh_auth_sock(&self) -> Option<PathBuf> {
        self.ssh_auth_sock
            .clone()
            .or_else(|| std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from))
            .or_else(|| dirs::home_dir().map(|h| h.join(".ssh").join("ssh_auth_sock")))
    }

    pub fn add(&mut self, name: &str, entry: AliasEntry) -> Result<(), DsshError> {
        if self.hosts.contains_key(name) {
            return Err(DsshError::Config {
                message: format!("host '{}' already exists", name),
                path: None,
                suggestion: Some("Use `dssh host update` to change it".to_string()),
            });
        }
        entry.address()?;
        self.hosts.insert(name.to_string(), entry);
        Ok(())
    }

    /// Apply `update` to an existing entry, validating the result before storing it
    pub fn update<F>(&mut self, name: &str, update: F) -> Result<(), DsshError>
    where
        F: FnOnce(&mut AliasEntry),
    {
        let mut entry = self.hosts.get(name).cloned().ok_or_else(|| DsshError::Config {
            message: format!("host '{}' not found", name),
            path: None,
            suggestion: Some("Use `dssh host add` to create it".to_string()),
        })?;
        update(&mut entry);
        entry.address()?;
        self.hosts.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<AliasEntry, DsshError> {
        self.hosts.remove(name).ok_or_else(|| DsshError::Config {
            message: format!("host '{}' not found", name),
            path: None,
            suggestion: None,
        })
    }

    /// Entries for listing, filtered by exact name, user and any-of tags
    pub fn filter(
        &self,
        name: Option<&str>,
        user: Option<&str>,
        tags: Option<&BTreeSet<String>>,
    ) -> Vec<(&str, &AliasEntry)> {
        self.hosts
            .iter()
            .filter(|(n, _)| name.map_or(true, |want| want == n.as_str()))
            .filter(|(_, e)| {
                user.map_or(true, |want| {
                    let stored = e
                        .address()
                        .ok()
                        .and_then(|a| a.user)
                        .or_else(|| self.default_user.clone());
                    stored.as_deref() == Some(want)
                })
            })
            .filter(|(_, e)| {
                tags.map_or(true, |want| {
                    want.iter().any(|t| t == "all" || e.tags.contains(t))
                })
            })
            .map(|(n, e)| (n.as_str(), e))
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TagsRepr {
    List(Vec<String>),
    Csv(String),
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let joined = match TagsRepr::deserialize(deserializer)? {
        TagsRepr::List(list) => list.join(","),
        TagsRepr::Csv(csv) => csv,
    };
    if joined.is_empty() {
        return Ok(BTreeSet::new());
    }
    parse_tags(&joined).map_err(serde::de::Error::custom)
}
