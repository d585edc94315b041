// Inventory module: host records and the sources they are resolved from

pub mod address;
pub mod aliases;
pub mod resolver;
pub mod ssh_config;

pub use address::{parse_port, parse_tags, summary, validate_tags, Address};
pub use aliases::{AliasEntry, AliasTable, Overlay};
pub use resolver::Resolver;
pub use ssh_config::SshConfig;

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::output::errors::DsshError;

/// Port used when no source supplies one
pub const DEFAULT_PORT: u16 = 22;

/// Jump value meaning "no jump at all"
pub const NO_JUMP: &str = "none";

/// One resolved endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Aliases this record may be referenced by
    pub patterns: Vec<String>,
    pub address: String,
    /// 0 means unset until defaults are filled
    pub port: u16,
    pub user: String,
    pub identity_files: Vec<PathBuf>,
    /// Raw, unresolved jump list
    pub proxy_jump: String,
    pub tags: BTreeSet<String>,
    /// TCP dial timeout in seconds, 0 for none
    pub timeout: u64,
    jump_chain: Vec<Host>,
}

impl Host {
    pub fn new(address: impl Into<String>) -> Self {
        Host {
            patterns: Vec::new(),
            address: address.into(),
            port: 0,
            user: String::new(),
            identity_files: Vec::new(),
            proxy_jump: String::new(),
            tags: BTreeSet::new(),
            timeout: 0,
            jump_chain: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_proxy_jump(mut self, jump: impl Into<String>) -> Self {
        self.proxy_jump = jump.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Attach resolved jump hosts, outermost first.
    ///
    /// Every hop must be a leaf: a hop carrying its own chain is rejected.
    pub fn with_jump_chain(mut self, chain: Vec<Host>) -> Result<Self, DsshError> {
        if let Some(nested) = chain.iter().find(|hop| !hop.jump_chain.is_empty()) {
            return Err(DsshError::NestedJump {
                target: self.summary(),
                hop: nested.summary(),
                jump: nested.jump_string(),
            });
        }
        self.jump_chain = chain;
        Ok(self)
    }

    pub fn jump_chain(&self) -> &[Host] {
        &self.jump_chain
    }

    /// Whether the raw jump list asks for any hop
    pub fn wants_jump(&self) -> bool {
        wants_jump(&self.proxy_jump)
    }

    /// The name the operator knows this host by
    pub fn name(&self) -> &str {
        self.patterns
            .first()
            .map(String::as_str)
            .unwrap_or(&self.address)
    }

    /// `host[:port]`
    pub fn endpoint(&self) -> String {
        summary("", &self.address, self.port)
    }

    /// `user@host[:port]`
    pub fn summary(&self) -> String {
        summary(&self.user, &self.address, self.port)
    }

    /// Resolved hops rendered as `user@host:port,user@host:port`
    pub fn jump_string(&self) -> String {
        if self.jump_chain.is_empty() {
            return self.proxy_jump.clone();
        }
        self.jump_chain
            .iter()
            .map(Host::summary)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Any requested tag present, `all` matching every host
    pub fn matches_tags(&self, wanted: &BTreeSet<String>) -> bool {
        wanted
            .iter()
            .any(|tag| tag == "all" || self.tags.contains(tag))
    }

    /// Every connection this host needs, outermost hop first and itself last
    pub fn connection_path(&self) -> impl Iterator<Item = &Host> {
        self.jump_chain.iter().chain(std::iter::once(self))
    }
}

/// `""` and `"none"` both mean "connect directly"
pub fn wants_jump(spec: &str) -> bool {
    let spec = spec.trim();
    !spec.is_empty() && !spec.eq_ignore_ascii_case(NO_JUMP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_summary() {
        let host = Host::new("10.0.0.5").with_user("admin").with_port(2222);
        assert_eq!(host.summary(), "admin@10.0.0.5:2222");
        assert_eq!(host.endpoint(), "10.0.0.5:2222");
        assert_eq!(host.name(), "10.0.0.5");

        let bare = Host::new("10.0.0.5");
        assert_eq!(bare.summary(), "10.0.0.5");
    }

    #[test]
    fn test_jump_chain_must_be_flat() {
        let bastion = Host::new("bastion").with_user("ops").with_port(22);
        let gateway = Host::new("gateway").with_user("ops").with_port(22);
        let nested = bastion.clone().with_jump_chain(vec![gateway]).unwrap();

        let err = Host::new("web")
            .with_jump_chain(vec![nested])
            .unwrap_err();
        assert!(matches!(err, DsshError::NestedJump { .. }));

        let ok = Host::new("web").with_jump_chain(vec![bastion]).unwrap();
        assert_eq!(ok.jump_string(), "ops@bastion:22");
        let path: Vec<_> = ok.connection_path().map(|h| h.address.as_str()).collect();
        assert_eq!(path, vec!["bastion", "web"]);
    }

    #[test]
    fn test_wants_jump() {
        assert!(!wants_jump(""));
        assert!(!wants_jump("none"));
        assert!(!wants_jump("  "));
        assert!(wants_jump("bastion"));
    }

    #[test]
    fn test_tag_matching() {
        let host = Host::new("db1").with_tags(["db", "prod"]);

        let wanted: BTreeSet<String> = ["web".to_string()].into();
        assert!(!host.matches_tags(&wanted));

        let wanted: BTreeSet<String> = ["web".to_string(), "prod".to_string()].into();
        assert!(host.matches_tags(&wanted));

        let wanted: BTreeSet<String> = ["all".to_string()].into();
        assert!(host.matches_tags(&wanted));
    }
}
