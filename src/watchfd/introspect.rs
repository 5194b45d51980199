//! Per-process descriptor introspection.
//!
//! Everything the tracker knows about another process's descriptor table
//! comes through the [`FdIntrospection`] trait: an existence probe, fd
//! enumeration, fd target resolution, and a byte-position query. The procfs
//! backing below is the production implementation; tests substitute their
//! own backing through the same trait.

use std::fs;
use std::io;
use std::path::PathBuf;

use nix::sys::signal::kill;
use nix::sys::stat::{lstat, stat};
use nix::unistd::Pid;
use tracing::debug;

use super::FdError;

/// The (device, inode, mode) triple used to detect silent fd reuse. The mode
/// is that of the fd link itself, which also encodes the open mode, so a
/// reopen of the same file with different access counts as a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdIdentity {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
}

/// A resolved descriptor target: where it points and what it is.
#[derive(Debug, Clone)]
pub struct FdTarget {
    pub path: PathBuf,
    pub identity: FdIdentity,
    /// `st_mode` of the resolved target, for file-type classification.
    pub target_mode: u32,
    /// `st_size` of the resolved target.
    pub size: u64,
}

impl FdTarget {
    pub fn is_regular_file(&self) -> bool {
        self.target_mode & libc::S_IFMT as u32 == libc::S_IFREG as u32
    }

    pub fn is_block_device(&self) -> bool {
        self.target_mode & libc::S_IFMT as u32 == libc::S_IFBLK as u32
    }

    /// Whether the descriptor was opened with write access, judged from the
    /// owner-write bit on the fd link.
    pub fn opened_writable(&self) -> bool {
        self.identity.mode & libc::S_IWUSR as u32 != 0
    }
}

pub trait FdIntrospection {
    /// Lightweight probe for whether the process still exists.
    fn process_exists(&self, pid: i32) -> bool;

    /// List the descriptor numbers currently open in the process.
    fn list_fds(&self, pid: i32) -> io::Result<Vec<i32>>;

    /// Resolve one descriptor's target path, identity, and metadata.
    fn resolve(&self, pid: i32, fd: i32) -> Result<FdTarget, FdError>;

    /// Current byte offset of the descriptor, if the platform exposes it.
    fn position(&self, pid: i32, fd: i32) -> Option<u64>;
}

/// `/proc`-backed introspection: directory enumeration of `/proc/<pid>/fd`,
/// `readlink` plus `stat`/`lstat` for identity, and `pos:` from
/// `/proc/<pid>/fdinfo/<fd>` for the byte offset.
pub struct ProcfsIntrospection;

impl FdIntrospection for ProcfsIntrospection {
    fn process_exists(&self, pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    fn list_fds(&self, pid: i32) -> io::Result<Vec<i32>> {
        let mut fds = Vec::new();
        for entry in fs::read_dir(format!("/proc/{pid}/fd"))? {
            let entry = entry?;
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() {
                if fd >= 0 {
                    fds.push(fd);
                }
            }
        }
        Ok(fds)
    }

    fn resolve(&self, pid: i32, fd: i32) -> Result<FdTarget, FdError> {
        if !self.process_exists(pid) {
            return Err(FdError::NotFound);
        }

        let link = format!("/proc/{pid}/fd/{fd}");
        let path = fs::read_link(&link).map_err(|err| {
            debug!("readlink {link} failed: {err}");
            FdError::Unreadable
        })?;

        let target = stat(link.as_str()).map_err(|_| FdError::MetadataFailed)?;
        let link_meta = lstat(link.as_str()).map_err(|_| FdError::MetadataFailed)?;

        Ok(FdTarget {
            path,
            identity: FdIdentity {
                dev: target.st_dev as u64,
                ino: target.st_ino as u64,
                mode: link_meta.st_mode as u32,
            },
            target_mode: target.st_mode as u32,
            size: target.st_size.max(0) as u64,
        })
    }

    fn position(&self, pid: i32, fd: i32) -> Option<u64> {
        let text = fs::read_to_string(format!("/proc/{pid}/fdinfo/{fd}")).ok()?;
        parse_fdinfo_position(&text)
    }
}

/// Extract the `pos:` field from an fdinfo file.
pub(crate) fn parse_fdinfo_position(text: &str) -> Option<u64> {
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("pos:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fdinfo_position() {
        let text = "pos:\t1048576\nflags:\t0100002\nmnt_id:\t29\n";
        assert_eq!(parse_fdinfo_position(text), Some(1_048_576));
    }

    #[test]
    fn missing_or_mangled_position_is_none() {
        assert_eq!(parse_fdinfo_position("flags:\t0100002\n"), None);
        assert_eq!(parse_fdinfo_position("pos:\tnot-a-number\n"), None);
        assert_eq!(parse_fdinfo_position(""), None);
    }

    #[test]
    fn identity_inequality_covers_each_field() {
        let base = FdIdentity { dev: 1, ino: 2, mode: 0o100644 };
        assert_eq!(base, base);
        assert_ne!(base, FdIdentity { dev: 9, ..base });
        assert_ne!(base, FdIdentity { ino: 9, ..base });
        assert_ne!(base, FdIdentity { mode: 0o100600, ..base });
    }
}
