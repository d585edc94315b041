// `user@host:port` shorthand and tag-list parsing

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::output::errors::FormatError;

static TAGS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_,\-]+$").expect("static tag pattern"));

/// A decomposed address as typed by the operator or stored in an alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl Address {
    pub fn new(host: impl Into<String>) -> Self {
        Address {
            user: None,
            host: host.into(),
            port: None,
        }
    }

    /// Fold an explicit user/port into the shorthand, rejecting values given twice
    pub fn with_explicit(
        mut self,
        user: Option<&str>,
        port: Option<u16>,
        raw: &str,
    ) -> Result<Self, FormatError> {
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            if self.user.is_some() {
                return Err(FormatError::UserAlreadySet(raw.to_string()));
            }
            self.user = Some(user.to_string());
        }

        if let Some(port) = port.filter(|p| *p != 0) {
            if self.port.is_some() {
                return Err(FormatError::PortAlreadySet(raw.to_string()));
            }
            self.port = Some(port);
        }

        Ok(self)
    }
}

impl FromStr for Address {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(FormatError::Empty);
        }

        let (user, rest) = match raw.split_once('@') {
            Some((user, rest)) => {
                if user.is_empty() || rest.contains('@') {
                    return Err(FormatError::Malformed(raw.to_string()));
                }
                (Some(user.to_string()), rest)
            }
            None => (None, raw),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            // [v6-literal] or [v6-literal]:port
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| FormatError::Malformed(raw.to_string()))?;
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(parse_port(port)?)),
                    None => return Err(FormatError::Malformed(raw.to_string())),
                },
            }
        } else {
            match rest.split_once(':') {
                Some((host, port)) => {
                    if port.contains(':') {
                        return Err(FormatError::Malformed(raw.to_string()));
                    }
                    (host, Some(parse_port(port)?))
                }
                None => (rest, None),
            }
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(FormatError::Malformed(raw.to_string()));
        }

        Ok(Address {
            user,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&summary(
            self.user.as_deref().unwrap_or(""),
            &self.host,
            self.port.unwrap_or(0),
        ))
    }
}

/// Parse a port number, accepting 1..=65535
pub fn parse_port(s: &str) -> Result<u16, FormatError> {
    match s.trim().parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(FormatError::InvalidPort(s.to_string())),
    }
}

/// Render `user@host[:port]`, leaving out an empty user and a zero port
pub fn summary(user: &str, host: &str, port: u16) -> String {
    let host = if host.contains(':') && port != 0 {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    let endpoint = if port == 0 {
        host
    } else {
        format!("{}:{}", host, port)
    };

    if user.is_empty() {
        endpoint
    } else {
        format!("{}@{}", user, endpoint)
    }
}

/// Validate a comma-separated tag string and split it into a canonical set
pub fn parse_tags(tags: &str) -> Result<BTreeSet<String>, FormatError> {
    if !TAGS_RE.is_match(tags) {
        return Err(FormatError::InvalidTags(tags.to_string()));
    }

    Ok(tags
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect())
}

/// Validate every tag string of a selection before any filtering happens
///
/// Empty pieces, as left by `web,` once split, are skipped.
pub fn validate_tags<S: AsRef<str>>(tags: &[S]) -> Result<BTreeSet<String>, FormatError> {
    let mut all = BTreeSet::new();
    for tag in tags.iter().map(AsRef::<str>::as_ref).filter(|t| !t.is_empty()) {
        all.extend(parse_tags(tag)?);
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_shorthand() {
        let addr: Address = "deploy@10.0.0.9:2222".parse().unwrap();
        assert_eq!(addr.user.as_deref(), Some("deploy"));
        assert_eq!(addr.host, "10.0.0.9");
        assert_eq!(addr.port, Some(2222));
    }

    #[test]
    fn test_summary_round_trip() {
        for input in [
            "deploy@10.0.0.9:2222",
            "root@bastion.example.com:22",
            "a_b-c@h:1",
            "ops@[fe80::1]:2200",
        ] {
            let addr: Address = input.parse().unwrap();
            assert_eq!(addr.to_string(), input);
        }
    }

    #[test]
    fn test_partial_shorthand() {
        let addr: Address = "web01".parse().unwrap();
        assert_eq!(addr, Address::new("web01"));

        let addr: Address = "web01:2200".parse().unwrap();
        assert_eq!(addr.user, None);
        assert_eq!(addr.port, Some(2200));

        let addr: Address = "[::1]".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, None);
    }

    #[test]
    fn test_malformed_shorthand() {
        assert_eq!("".parse::<Address>(), Err(FormatError::Empty));
        assert!(matches!(
            "a@b@c".parse::<Address>(),
            Err(FormatError::Malformed(_))
        ));
        assert!(matches!(
            "@host".parse::<Address>(),
            Err(FormatError::Malformed(_))
        ));
        assert!(matches!(
            "host:1:2".parse::<Address>(),
            Err(FormatError::Malformed(_))
        ));
        assert!(matches!(
            "host:0".parse::<Address>(),
            Err(FormatError::InvalidPort(_))
        ));
        assert!(matches!(
            "host:65536".parse::<Address>(),
            Err(FormatError::InvalidPort(_))
        ));
        assert!(matches!(
            "host:ssh".parse::<Address>(),
            Err(FormatError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_explicit_values_conflict_with_shorthand() {
        let addr: Address = "deploy@web01".parse().unwrap();
        assert_eq!(
            addr.clone().with_explicit(Some("root"), None, "deploy@web01"),
            Err(FormatError::UserAlreadySet("deploy@web01".to_string()))
        );

        // Port 0 means "unset" and never conflicts
        let merged = addr.with_explicit(None, Some(0), "deploy@web01").unwrap();
        assert_eq!(merged.port, None);

        let addr: Address = "web01:2200".parse().unwrap();
        assert_eq!(
            addr.with_explicit(None, Some(22), "web01:2200"),
            Err(FormatError::PortAlreadySet("web01:2200".to_string()))
        );
    }

    #[test]
    fn test_tags() {
        let tags = parse_tags("web,db,,prod-1").unwrap();
        assert_eq!(
            tags.into_iter().collect::<Vec<_>>(),
            vec!["db", "prod-1", "web"]
        );

        for bad in ["web db", "web;db", "é", "", "web/1"] {
            assert!(parse_tags(bad).is_err(), "{bad:?} should be rejected");
        }

        assert!(validate_tags(&["web", "bad tag"]).is_err());
    }

    #[test]
    fn test_validate_tags_skips_empty_pieces() {
        let expected: BTreeSet<String> = ["web".to_string()].into();
        assert_eq!(validate_tags(&["web", ""]).unwrap(), expected);
        assert_eq!(validate_tags(&["", "web"]).unwrap(), expected);
        assert_eq!(validate_tags(&["web,"]).unwrap(), expected);
        assert!(validate_tags(&["", ""]).unwrap().is_empty());
    }
}
