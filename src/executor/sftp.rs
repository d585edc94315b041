// SFTP upload/download with recursive directories, modes and mtimes

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ssh2::{FileStat, Sftp};
use tracing::debug;

use super::ssh::SessionChain;
use crate::output::errors::DsshError;
use crate::output::TerminalOutput;

const MODE_BITS: u32 = 0o7777;

struct Transfer<'a> {
    sftp: Sftp,
    host: &'a str,
    output: &'a TerminalOutput,
}

impl Transfer<'_> {
    fn err(&self, message: String, path: &Path) -> DsshError {
        DsshError::Transfer {
            host: self.host.to_string(),
            message,
            path: Some(path.display().to_string()),
        }
    }
}

fn open(chain: &SessionChain) -> Result<Sftp, DsshError> {
    chain.session().sftp().map_err(|e| DsshError::Transfer {
        host: chain.target().to_string(),
        message: format!("Failed to open SFTP: {}", e),
        path: None,
    })
}

/// Copy a local file or directory tree to `remote`
pub fn upload(
    chain: &SessionChain,
    local: &Path,
    remote: &str,
    output: &TerminalOutput,
) -> Result<(), DsshError> {
    let meta = fs::metadata(local)
        .map_err(|e| DsshError::io(format!("Failed to read local path: {}", e), local))?;

    let t = Transfer {
        sftp: open(chain)?,
        host: chain.target(),
        output,
    };

    if meta.is_dir() {
        upload_dir(&t, local, Path::new(remote))
    } else {
        upload_file(&t, local, Path::new(remote), &meta)
    }
}

fn upload_dir(t: &Transfer, local: &Path, remote: &Path) -> Result<(), DsshError> {
    let meta = fs::metadata(local)
        .map_err(|e| DsshError::io(format!("Failed to read local path: {}", e), local))?;
    let mode = meta.permissions().mode() & MODE_BITS;

    if t.sftp.stat(remote).is_err() {
        t.sftp
            .mkdir(remote, mode as i32)
            .map_err(|e| t.err(format!("Failed to create remote directory: {}", e), remote))?;
    }
    t.sftp
        .setstat(remote, stat_with(Some(mode), None))
        .map_err(|e| t.err(format!("Failed to set remote mode: {}", e), remote))?;

    let entries = fs::read_dir(local)
        .map_err(|e| DsshError::io(format!("Failed to list directory: {}", e), local))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| DsshError::io(format!("Failed to list directory: {}", e), local))?;
        let path = entry.path();
        let target = remote.join(entry.file_name());
        let meta = fs::metadata(&path)
            .map_err(|e| DsshError::io(format!("Failed to read local path: {}", e), &path))?;

        if meta.is_dir() {
            upload_dir(t, &path, &target)?;
        } else if meta.is_file() {
            upload_file(t, &path, &target, &meta)?;
        } else {
            debug!(path = %path.display(), "skipping special file");
        }
    }
    Ok(())
}

fn upload_file(t: &Transfer, local: &Path, remote: &Path, meta: &fs::Metadata) -> Result<(), DsshError> {
    // mkdir on an existing parent fails harmlessly
    for dir in parent_dirs(remote) {
        let _ = t.sftp.mkdir(&dir, 0o755);
    }

    let mut src = File::open(local)
        .map_err(|e| DsshError::io(format!("Failed to read local file: {}", e), local))?;
    let mut dst = t
        .sftp
        .create(remote)
        .map_err(|e| t.err(format!("Failed to create remote file: {}", e), remote))?;

    t.output
        .print_transfer(&local.display().to_string(), &remote.display().to_string());
    let pb = t.output.transfer_bar(meta.len(), &file_name(local));
    io::copy(&mut pb.wrap_read(&mut src), &mut dst)
        .map_err(|e| t.err(format!("Failed to write remote file: {}", e), remote))?;
    pb.finish();
    drop(dst);

    let mode = meta.permissions().mode() & MODE_BITS;
    let mtime = meta.modified().ok().map(unix_secs);
    t.sftp
        .setstat(remote, stat_with(Some(mode), mtime))
        .map_err(|e| t.err(format!("Failed to set remote attributes: {}", e), remote))
}

/// Copy a remote file or directory tree to `local`
pub fn download(
    chain: &SessionChain,
    remote: &str,
    local: &Path,
    output: &TerminalOutput,
) -> Result<(), DsshError> {
    let t = Transfer {
        sftp: open(chain)?,
        host: chain.target(),
        output,
    };
    let remote = Path::new(remote);
    let stat = t
        .sftp
        .stat(remote)
        .map_err(|e| t.err(format!("Failed to stat remote path: {}", e), remote))?;

    if stat.is_dir() {
        download_dir(&t, remote, local, &stat)
    } else {
        download_file(&t, remote, local, &stat)
    }
}

fn download_dir(t: &Transfer, remote: &Path, local: &Path, stat: &FileStat) -> Result<(), DsshError> {
    fs::create_dir_all(local)
        .map_err(|e| DsshError::io(format!("Failed to create directory: {}", e), local))?;
    if let Some(perm) = stat.perm {
        fs::set_permissions(local, fs::Permissions::from_mode(perm & MODE_BITS))
            .map_err(|e| DsshError::io(format!("Failed to set mode: {}", e), local))?;
    }

    let entries = t
        .sftp
        .readdir(remote)
        .map_err(|e| t.err(format!("Failed to list remote directory: {}", e), remote))?;
    for (path, stat) in entries {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = local.join(name);

        if stat.is_dir() {
            download_dir(t, &path, &target, &stat)?;
        } else if stat.is_file() {
            download_file(t, &path, &target, &stat)?;
        } else {
            debug!(path = %path.display(), "skipping special file");
        }
    }
    Ok(())
}

fn download_file(t: &Transfer, remote: &Path, local: &Path, stat: &FileStat) -> Result<(), DsshError> {
    let mut src = t
        .sftp
        .open(remote)
        .map_err(|e| t.err(format!("Failed to open remote file: {}", e), remote))?;
    let mut dst = File::create(local)
        .map_err(|e| DsshError::io(format!("Failed to create local file: {}", e), local))?;

    t.output
        .print_transfer(&remote.display().to_string(), &local.display().to_string());
    let pb = t.output.transfer_bar(stat.size.unwrap_or(0), &file_name(remote));
    io::copy(&mut pb.wrap_read(&mut src), &mut dst)
        .map_err(|e| t.err(format!("Failed to read remote file: {}", e), remote))?;
    pb.finish();

    if let Some(perm) = stat.perm {
        dst.set_permissions(fs::Permissions::from_mode(perm & MODE_BITS))
            .map_err(|e| DsshError::io(format!("Failed to set mode: {}", e), local))?;
    }
    if let Some(mtime) = stat.mtime {
        dst.set_modified(UNIX_EPOCH + Duration::from_secs(mtime))
            .map_err(|e| DsshError::io(format!("Failed to set mtime: {}", e), local))?;
    }
    Ok(())
}

/// Every ancestor directory of `path`, outermost first, excluding the root
fn parent_dirs(path: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = path
        .ancestors()
        .skip(1)
        .filter(|p| !p.as_os_str().is_empty() && p.parent().is_some())
        .map(Path::to_path_buf)
        .collect();
    dirs.reverse();
    dirs
}

fn stat_with(perm: Option<u32>, mtime: Option<u64>) -> FileStat {
    FileStat {
        size: None,
        uid: None,
        gid: None,
        perm,
        atime: mtime.map(|_| unix_secs(SystemTime::now())),
        mtime,
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
