// SSH agent socket discovery and repair

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info};

use crate::output::errors::DsshError;

/// Where forwarded agent sockets appear: `<tmp>/ssh-*/agent*`
pub const FORWARDED_SOCKET_ROOT: &str = "/tmp";

/// Point `SSH_AUTH_SOCK` at `sock` unless the environment already names one
pub fn export_auth_sock(sock: &Path) -> bool {
    if std::env::var_os("SSH_AUTH_SOCK").is_some() || !sock.exists() {
        return false;
    }
    debug!(sock = %sock.display(), "exporting SSH_AUTH_SOCK");
    std::env::set_var("SSH_AUTH_SOCK", sock);
    true
}

/// Newest `ssh-*/agent*` entry under `root`
pub fn newest_forwarded_socket(root: &Path) -> Option<PathBuf> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    let dirs = std::fs::read_dir(root).ok()?;
    for dir in dirs.flatten() {
        if !dir.file_name().to_string_lossy().starts_with("ssh-") {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(dir.path()) else {
            continue;
        };
        for entry in entries.flatten() {
            if !entry.file_name().to_string_lossy().starts_with("agent") {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, entry.path()));
            }
        }
    }

    newest.map(|(_, path)| path)
}

/// Re-point the `link` symlink at the newest forwarded agent socket
///
/// Returns the socket linked to, or `None` when no forwarded agent exists.
pub fn fix_agent(link: &Path, root: &Path) -> Result<Option<PathBuf>, DsshError> {
    let Some(socket) = newest_forwarded_socket(root) else {
        return Ok(None);
    };

    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(link).map_err(|e| {
            DsshError::io(format!("Failed to remove old agent link: {}", e), link)
        })?;
    }
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DsshError::io(format!("Failed to create directory: {}", e), parent)
        })?;
    }

    std::os::unix::fs::symlink(&socket, link)
        .map_err(|e| DsshError::io(format!("Failed to link agent socket: {}", e), link))?;

    info!(socket = %socket.display(), link = %link.display(), "agent socket relinked");
    Ok(Some(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fix_agent_links_newest_socket() {
        let root = TempDir::new().unwrap();
        let old_dir = root.path().join("ssh-aaaa");
        let new_dir = root.path().join("ssh-bbbb");
        std::fs::create_dir_all(&old_dir).unwrap();
        std::fs::create_dir_all(&new_dir).unwrap();
        std::fs::create_dir_all(root.path().join("other")).unwrap();
        std::fs::write(root.path().join("other").join("agent.1"), "").unwrap();

        let old = old_dir.join("agent.100");
        std::fs::write(&old, "").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let new = new_dir.join("agent.200");
        std::fs::write(&new, "").unwrap();

        let link = root.path().join("home").join("ssh_auth_sock");
        assert_eq!(fix_agent(&link, root.path()).unwrap(), Some(new.clone()));
        assert_eq!(std::fs::read_link(&link).unwrap(), new);

        // An existing link is replaced
        std::fs::remove_file(&new).unwrap();
        assert_eq!(fix_agent(&link, root.path()).unwrap(), Some(old.clone()));
        assert_eq!(std::fs::read_link(&link).unwrap(), old);
    }

    #[test]
    fn test_fix_agent_without_sockets() {
        let root = TempDir::new().unwrap();
        let link = root.path().join("ssh_auth_sock");
        assert_eq!(fix_agent(&link, root.path()).unwrap(), None);
        assert!(link.symlink_metadata().is_err());
    }
}
