// System SSH client configuration (~/.ssh/config) as a read-only host source

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::address::parse_port;
use crate::output::errors::DsshError;

static EOL_TAGS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"tags:([0-9A-Za-z_\-,]*)").expect("static tag pattern"));

/// One `Host` block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostBlock {
    pub patterns: Vec<String>,
    /// Lowercased keyword with its raw value, in file order
    pub options: Vec<(String, String)>,
    pub tags: BTreeSet<String>,
}

impl HostBlock {
    fn global() -> Self {
        HostBlock {
            patterns: vec!["*".to_string()],
            ..Default::default()
        }
    }

    /// OpenSSH semantics: a negated match vetoes, otherwise any positive match wins
    pub fn matches(&self, host: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if glob_match(negated, host) {
                    return false;
                }
            } else if glob_match(pattern, host) {
                matched = true;
            }
        }
        matched
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.options
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Patterns without any wildcard or negation
    pub fn concrete_patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns
            .iter()
            .map(String::as_str)
            .filter(|p| !p.contains(['*', '?', '!']))
    }
}

/// Parsed system SSH client configuration
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

impl SshConfig {
    pub fn empty() -> Self {
        SshConfig::default()
    }

    /// Default location, `~/.ssh/config`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ssh").join("config"))
    }

    /// Load from a file; a missing file is an empty configuration
    pub fn load(path: &Path) -> Result<Self, DsshError> {
        if !path.exists() {
            debug!(path = %path.display(), "no ssh client config");
            return Ok(SshConfig::empty());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            DsshError::io(format!("Failed to read SSH config: {}", e), path)
        })?;

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
        let mut blocks = Vec::new();
        let mut current = HostBlock::global();
        let mut skipping_match = false;

        for (line_no, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (keyword, rest) = split_keyword(line);
            let keyword = keyword.to_ascii_lowercase();

            match keyword.as_str() {
                "host" => {
                    blocks.push(std::mem::take(&mut current));
                    skipping_match = false;

                    let (patterns, comment) = match rest.split_once('#') {
                        Some((patterns, comment)) => (patterns, Some(comment)),
                        None => (rest, None),
                    };

                    current.patterns = split_values(patterns);
                    if current.patterns.is_empty() {
                        return Err(DsshError::Config {
                            message: format!("line {}: Host without a pattern", line_no + 1),
                            path: None,
                            suggestion: None,
                        });
                    }
                    if let Some(caps) = comment.and_then(|c| EOL_TAGS_RE.captures(c)) {
                        current.tags = caps[1]
                            .split(',')
                            .filter(|t| !t.is_empty())
                            .map(str::to_string)
                            .collect();
                    }
                }
                "match" => {
                    debug!(line = line_no + 1, "skipping Match block");
                    blocks.push(std::mem::take(&mut current));
                    skipping_match = true;
                }
                _ if skipping_match => {}
                _ => {
                    let value = unquote(strip_comment(rest));
                    if value.is_empty() {
                        continue;
                    }
                    if keyword == "port" {
                        parse_port(&value).map_err(|e| DsshError::Config {
                            message: format!("line {}: {}", line_no + 1, e),
                            path: None,
                            suggestion: None,
                        })?;
                    }
                    current.options.push((keyword, value));
                }
            }
        }
        blocks.push(current);

        blocks.retain(|b| !b.patterns.is_empty() && (!b.options.is_empty() || !b.tags.is_empty()));
        Ok(SshConfig { blocks })
    }

    pub fn blocks(&self) -> &[HostBlock] {
        &self.blocks
    }

    /// Blocks applying to `host`: pattern matches, plus concrete blocks whose HostName is `host`
    pub fn matching_blocks<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a HostBlock> {
        self.blocks.iter().filter(move |block| {
            block.matches(host)
                || (block.patterns.iter().all(|p| !p.contains(['*', '?', '!']))
                    && block.get("hostname") == Some(host))
        })
    }

    /// First value for `key` among the blocks applying to `host`
    pub fn get(&self, host: &str, key: &str) -> Option<String> {
        self.matching_blocks(host)
            .find_map(|b| b.get(key))
            .map(str::to_string)
    }

    /// Every value for `key` among the blocks applying to `host`, in file order
    pub fn get_all(&self, host: &str, key: &str) -> Vec<String> {
        let key = key.to_ascii_lowercase();
        self.matching_blocks(host)
            .flat_map(|b| {
                b.options
                    .iter()
                    .filter(|(k, _)| *k == key)
                    .map(|(_, v)| v.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Tags attached to the blocks applying to `host`
    pub fn tags(&self, host: &str) -> BTreeSet<String> {
        self.matching_blocks(host)
            .flat_map(|b| b.tags.iter().cloned())
            .collect()
    }

    /// Concrete patterns applying to `host`
    pub fn patterns(&self, host: &str) -> Vec<String> {
        self.matching_blocks(host)
            .flat_map(|b| b.concrete_patterns().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    /// Concrete host names of blocks that carry a HostName, for selection and completion
    pub fn host_names(&self) -> Vec<String> {
        self.blocks
            .iter()
            .filter(|b| b.get("hostname").is_some())
            .flat_map(|b| b.concrete_patterns().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

fn split_keyword(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let (keyword, rest) = line.split_at(end);
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    (keyword, rest)
}

fn strip_comment(value: &str) -> &str {
    if value.starts_with('"') {
        return value;
    }
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end(),
        None => value,
    }
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

fn split_values(s: &str) -> Vec<String> {
    s.split_whitespace().map(unquote).collect()
}

/// Glob matching with `*` and `?`, case-insensitive like OpenSSH host patterns
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.to_ascii_lowercase().chars().collect();
    let t: Vec<char> = text.to_ascii_lowercase().chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
User fallback

Host bastion # tags:infra,jump
    HostName bastion.example.com
    User ops
    Port 2200
    IdentityFile ~/.ssh/ops_key

Host web-* !web-legacy
    ProxyJump bastion
    IdentityFile ~/.ssh/web_key

Host db1 db-primary #tags:db,prod
    HostName 10.0.1.10
    User=postgres

Match host *.internal
    User ignored

Host *
    IdentityFile ~/.ssh/id_ed25519
    Port 22
"#;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("web-*", "web-01"));
        assert!(glob_match("web-??", "web-01"));
        assert!(!glob_match("web-??", "web-001"));
        assert!(glob_match("*.EXAMPLE.com", "a.example.com"));
        assert!(!glob_match("db", "db1"));
    }

    #[test]
    fn test_first_value_wins() {
        let cfg = SshConfig::parse(SAMPLE).unwrap();

        assert_eq!(cfg.get("bastion", "HostName").as_deref(), Some("bastion.example.com"));
        assert_eq!(cfg.get("bastion", "port").as_deref(), Some("2200"));
        // The global User line comes before every Host block
        assert_eq!(cfg.get("bastion", "User").as_deref(), Some("fallback"));
        assert_eq!(cfg.get("web-01", "ProxyJump").as_deref(), Some("bastion"));
        assert_eq!(cfg.get("web-legacy", "ProxyJump"), None);
        assert_eq!(cfg.get("nowhere", "Port").as_deref(), Some("22"));
    }

    #[test]
    fn test_identity_files_accumulate() {
        let cfg = SshConfig::parse(SAMPLE).unwrap();
        assert_eq!(
            cfg.get_all("web-01", "IdentityFile"),
            vec!["~/.ssh/web_key", "~/.ssh/id_ed25519"]
        );
    }

    #[test]
    fn test_eol_tags_and_names() {
        let cfg = SshConfig::parse(SAMPLE).unwrap();

        let tags: Vec<_> = cfg.tags("db-primary").into_iter().collect();
        assert_eq!(tags, vec!["db", "prod"]);
        assert_eq!(
            cfg.tags("bastion").into_iter().collect::<Vec<_>>(),
            vec!["infra", "jump"]
        );
        assert_eq!(cfg.host_names(), vec!["bastion", "db1", "db-primary"]);
    }

    #[test]
    fn test_lookup_by_hostname_of_concrete_block() {
        let cfg = SshConfig::parse(SAMPLE).unwrap();
        // Typing the address of a configured host picks up that block too
        assert_eq!(cfg.patterns("10.0.1.10"), vec!["db1", "db-primary"]);
        assert!(cfg.get_all("10.0.1.10", "user").contains(&"postgres".to_string()));
    }

    #[test]
    fn test_match_blocks_are_skipped() {
        let cfg = SshConfig::parse(SAMPLE).unwrap();
        assert!(!cfg
            .get_all("a.internal", "user")
            .contains(&"ignored".to_string()));
    }

    #[test]
    fn test_invalid_port_rejected() {
        let err = SshConfig::parse("Host x\n  Port 99999\n").unwrap_err();
        assert!(matches!(err, DsshError::Config { .. }));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = SshConfig::load(&dir.path().join("config")).unwrap();
        assert!(cfg.blocks().is_empty());
    }
}
