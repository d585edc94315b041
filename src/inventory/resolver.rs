// Host resolution: merge overlay, alias table, system SSH config and defaults,
// then resolve the one-level jump chain.
//
// Precedence, highest first:
// 1. overlay (this invocation)
// 2. alias table entry
// 3. system SSH client config for the literal address
// 4. alias-table global defaults, then built-in defaults

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::address::{parse_port, validate_tags, Address};
use super::aliases::{AliasEntry, AliasTable, Overlay};
use super::ssh_config::{expand_home, SshConfig};
use super::{Host, DEFAULT_PORT};
use crate::output::errors::{DsshError, FormatError};

/// Resolves identifiers into fully defaulted host records.
///
/// Holds only shared references to read-only sources, so one resolver can
/// serve every target of a run.
#[derive(Debug, Clone)]
pub struct Resolver<'a> {
    aliases: &'a AliasTable,
    ssh_config: &'a SshConfig,
    os_user: Option<String>,
    home: Option<PathBuf>,
}

impl<'a> Resolver<'a> {
    pub fn new(aliases: &'a AliasTable, ssh_config: &'a SshConfig) -> Self {
        Resolver {
            aliases,
            ssh_config,
            os_user: std::env::var("USER").ok().filter(|u| !u.is_empty()),
            home: dirs::home_dir(),
        }
    }

    /// Override the login name used when no source supplies one
    pub fn with_os_user(mut self, user: Option<String>) -> Self {
        self.os_user = user;
        self
    }

    /// Override the home directory holding the default identity file
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// Resolve one identifier, including its jump chain
    pub fn resolve(&self, identifier: &str, overlay: &Overlay) -> Result<Host, DsshError> {
        let host = self.resolve_record(identifier, overlay, false)?;
        self.resolve_jump_chain(host, overlay)
    }

    /// Resolve every comma-separated identifier in order, stopping at the first failure
    ///
    /// An overlay address only applies when a single target results.
    pub fn resolve_all<S: AsRef<str>>(
        &self,
        targets: &[S],
        overlay: &Overlay,
    ) -> Result<Vec<Host>, DsshError> {
        let mut hosts = self.resolve_named(targets, &without_address(overlay))?;
        apply_address(&mut hosts, overlay);
        Ok(hosts)
    }

    /// Hosts carrying any of `tags`, each with its own jump chain
    pub fn select_by_tags<S: AsRef<str>>(
        &self,
        tags: &[S],
        overlay: &Overlay,
    ) -> Result<Vec<Host>, DsshError> {
        let mut hosts = self.tagged(tags, &without_address(overlay))?;
        apply_address(&mut hosts, overlay);
        Ok(hosts)
    }

    /// Named targets in order, then tag matches not already named
    pub fn select<S: AsRef<str>, T: AsRef<str>>(
        &self,
        names: &[S],
        tags: &[T],
        overlay: &Overlay,
    ) -> Result<Vec<Host>, DsshError> {
        let shared = without_address(overlay);
        let mut hosts = self.resolve_named(names, &shared)?;
        if !tags.is_empty() {
            for host in self.tagged(tags, &shared)? {
                if !hosts.iter().any(|h| h.name() == host.name()) {
                    hosts.push(host);
                }
            }
        }
        apply_address(&mut hosts, overlay);
        Ok(hosts)
    }

    fn resolve_named<S: AsRef<str>>(
        &self,
        targets: &[S],
        overlay: &Overlay,
    ) -> Result<Vec<Host>, DsshError> {
        targets
            .iter()
            .flat_map(|t| t.as_ref().split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| self.resolve(t, overlay))
            .collect()
    }

    fn tagged<S: AsRef<str>>(&self, tags: &[S], overlay: &Overlay) -> Result<Vec<Host>, DsshError> {
        let wanted = validate_tags(tags)?;
        if wanted.is_empty() {
            return Err(FormatError::InvalidTags(String::new()).into());
        }

        let mut selected = Vec::new();
        for name in self.candidate_names() {
            let host = self.resolve_record(&name, overlay, false)?;
            if host.matches_tags(&wanted) {
                selected.push(self.resolve_jump_chain(host, overlay)?);
            }
        }
        debug!(count = selected.len(), tags = ?wanted, "selected hosts by tag");
        Ok(selected)
    }

    /// Alias names, then concrete SSH config hosts not already listed
    pub fn candidate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.aliases.names().map(str::to_string).collect();
        for name in self.ssh_config.host_names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    fn resolve_record(
        &self,
        identifier: &str,
        overlay: &Overlay,
        as_jump: bool,
    ) -> Result<Host, DsshError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(FormatError::Empty.into());
        }

        let alias = self.aliases.get(identifier);
        let addr = match alias {
            Some(entry) => entry.address()?,
            None => self
                .parse_literal(identifier)?
                .with_explicit(overlay.user.as_deref(), overlay.port, identifier)?,
        };

        let key = addr.host.as_str();
        let ssh = self.ssh_config;

        let mut patterns = Vec::new();
        if alias.is_some() {
            patterns.push(identifier.to_string());
        }
        for pattern in ssh.patterns(key) {
            if !patterns.contains(&pattern) {
                patterns.push(pattern);
            }
        }

        let port = overlay
            .port
            .filter(|p| *p != 0)
            .or(addr.port)
            .or_else(|| ssh.get(key, "Port").and_then(|p| parse_port(&p).ok()))
            .or(self.aliases.default_port.filter(|p| *p != 0))
            .unwrap_or(DEFAULT_PORT);

        let user = overlay
            .user
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| addr.user.clone())
            .or_else(|| ssh.get(key, "User"))
            .or_else(|| self.aliases.default_user.clone())
            .or_else(|| self.os_user.clone())
            .unwrap_or_else(|| "root".to_string());

        let identity_files = self.identity_files(key, &overlay.identity_files);

        let proxy_jump = self.jump_spec(alias, key, overlay, as_jump);

        let mut tags: BTreeSet<String> = alias.map(|a| a.tags.clone()).unwrap_or_default();
        tags.extend(ssh.tags(key));

        let timeout = overlay
            .timeout
            .or_else(|| alias.and_then(|a| a.timeout))
            .or_else(|| ssh.get(key, "ConnectTimeout").and_then(|t| t.parse().ok()))
            .or(self.aliases.default_timeout)
            .unwrap_or(0);

        let mut address = ssh
            .get(key, "HostName")
            .map(|h| h.replace("%h", key))
            .unwrap_or_else(|| key.to_string());
        if !as_jump {
            if let Some(over) = overlay.address.as_deref().filter(|a| !a.is_empty()) {
                address = over.to_string();
            }
        }

        let host = Host {
            patterns,
            address,
            port,
            user,
            identity_files,
            proxy_jump,
            tags,
            timeout,
            ..Host::new("")
        };
        debug!(identifier, host = %host.summary(), jump = %host.proxy_jump, "resolved host");
        Ok(host)
    }

    fn resolve_jump_chain(&self, host: Host, overlay: &Overlay) -> Result<Host, DsshError> {
        if !host.wants_jump() {
            return Ok(host);
        }

        let hop_overlay = overlay.for_jump();
        let mut chain = Vec::new();
        for hop_id in host
            .proxy_jump
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
        {
            let hop = self.resolve_record(hop_id, &hop_overlay, true)?;
            if hop.wants_jump() {
                return Err(DsshError::NestedJump {
                    target: host.summary(),
                    hop: hop.summary(),
                    jump: hop.proxy_jump.clone(),
                });
            }
            chain.push(hop);
        }

        host.with_jump_chain(chain)
    }

    fn parse_literal(&self, identifier: &str) -> Result<Address, DsshError> {
        let addr: Address = identifier.parse().map_err(|e| match e {
            FormatError::Malformed(_) => unknown_target(identifier),
            other => other.into(),
        })?;
        if !is_valid_host(&addr.host) {
            return Err(unknown_target(identifier));
        }
        Ok(addr)
    }

    fn jump_spec(
        &self,
        alias: Option<&AliasEntry>,
        key: &str,
        overlay: &Overlay,
        as_jump: bool,
    ) -> String {
        let stored = alias
            .and_then(|a| a.jump.clone())
            .or_else(|| self.ssh_config.get(key, "ProxyJump"));

        let spec = if as_jump {
            stored
        } else {
            overlay
                .jump
                .clone()
                .filter(|j| !j.is_empty())
                .or(stored)
                .or_else(|| self.aliases.default_jump.clone())
        };
        spec.unwrap_or_default()
    }

    /// Caller keys that exist, else SSH config keys that exist, else ~/.ssh/id_rsa if present
    fn identity_files(&self, key: &str, requested: &[PathBuf]) -> Vec<PathBuf> {
        let files = existing(requested.iter().cloned());
        if !files.is_empty() {
            return files;
        }
        if !requested.is_empty() {
            warn!(files = ?requested, "none of the given identity files exist, falling back");
        }

        let files = existing(
            self.ssh_config
                .get_all(key, "IdentityFile")
                .iter()
                .map(|f| expand_home(f)),
        );
        if !files.is_empty() {
            return files;
        }

        existing(
            self.home
                .as_deref()
                .map(|home| home.join(".ssh").join("id_rsa")),
        )
    }
}

fn existing(paths: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    paths
        .into_iter()
        .filter(|p| {
            let ok = Path::new(p).is_file();
            if !ok {
                debug!(path = %p.display(), "skipping missing identity file");
            }
            ok
        })
        .collect()
}

fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':' | '%'))
}

fn unknown_target(identifier: &str) -> DsshError {
    DsshError::Resolution {
        target: identifier.to_string(),
        message: "unknown host alias and not a valid address".to_string(),
        suggestion: Some("List known aliases with `dssh host`".to_string()),
    }
}

fn without_address(overlay: &Overlay) -> Overlay {
    Overlay {
        address: None,
        ..overlay.clone()
    }
}

/// Put the overlay address on a lone target; several targets keep their own
fn apply_address(hosts: &mut [Host], overlay: &Overlay) {
    let Some(address) = overlay.address.as_deref().filter(|a| !a.is_empty()) else {
        return;
    };
    match hosts {
        [host] => host.address = address.to_string(),
        [] => {}
        _ => warn!(
            address,
            count = hosts.len(),
            "address override ignored for more than one target"
        ),
    }
}
