//! Tracking file descriptors open in a watched external process.
//!
//! The descriptor table of the watched process can mutate at any instant, so
//! each [`FdTracker::scan`] is a discrete snapshot: slots whose fd vanished
//! or silently changed identity are retired back to FREE, and newly open fds
//! are discovered into recycled slots or appended. Indices are never
//! invalidated; handles carry a generation so a retired slot's handle cannot
//! alias its successor.

mod introspect;

pub use introspect::{FdIdentity, FdIntrospection, FdTarget, ProcfsIntrospection};

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

/// Per-descriptor resolution failures, with the stable caller-visible codes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FdError {
    #[error("process does not exist")]
    NotFound,

    #[error("descriptor link unreadable")]
    Unreadable,

    #[error("metadata query failed")]
    MetadataFailed,

    #[error("not a regular file or block device")]
    UnsupportedType,
}

impl FdError {
    pub fn code(&self) -> u8 {
        match self {
            FdError::NotFound => 1,
            FdError::Unreadable => 2,
            FdError::MetadataFailed => 3,
            FdError::UnsupportedType => 4,
        }
    }
}

/// Scan-level failures. These are terminal for the watch operation; the
/// caller's control loop decides whether to stop.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("process {0} no longer exists")]
    ProcessGone(i32),

    #[error("cannot list descriptors of process {pid}: {source}")]
    Enumerate {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("pid {pid}: fd {fd}: {source}")]
    Fd {
        pid: i32,
        fd: i32,
        #[source]
        source: FdError,
    },
}

/// One watched descriptor's last-known state. `pid == 0` marks the slot FREE
/// for reuse by a later discovery.
#[derive(Debug, Clone)]
pub struct FdSlot {
    pid: i32,
    pub fd: i32,
    pub path: PathBuf,
    pub identity: FdIdentity,
    /// Only meaningful for immutable regular files and block devices.
    pub cached_size: Option<u64>,
    pub initial_offset: u64,
    pub started: DateTime<Utc>,
    pub displayable: bool,
    generation: u32,
}

impl FdSlot {
    pub fn is_free(&self) -> bool {
        self.pid == 0
    }
}

/// Generation-checked handle to a slot. Stable across table growth; stale
/// after the slot is retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId {
    index: usize,
    generation: u32,
}

/// The grow-only slot table plus the fd-number index. Invariant: every
/// tracked open fd maps to exactly one active slot, and no mapping points at
/// a FREE slot.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: Vec<FdSlot>,
    by_fd: HashMap<i32, usize>,
}

impl SlotTable {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: SlotId) -> Option<&FdSlot> {
        let slot = self.slots.get(id.index)?;
        if slot.generation != id.generation || slot.is_free() {
            return None;
        }
        Some(slot)
    }

    /// Handles for all active slots, in table order.
    pub fn active_ids(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.is_free())
            .map(|(index, slot)| SlotId {
                index,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn id_for_fd(&self, fd: i32) -> Option<SlotId> {
        let index = *self.by_fd.get(&fd)?;
        let slot = &self.slots[index];
        Some(SlotId {
            index,
            generation: slot.generation,
        })
    }

    /// Retire a slot back to FREE, bumping its generation so outstanding
    /// handles go stale.
    fn retire(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        self.by_fd.remove(&slot.fd);
        slot.pid = 0;
        slot.generation = slot.generation.wrapping_add(1);
    }

    /// Index of a FREE slot to reuse, or a freshly grown one.
    fn claim(&mut self) -> usize {
        if let Some(index) = self.slots.iter().position(FdSlot::is_free) {
            return index;
        }
        self.slots.push(FdSlot {
            pid: 0,
            fd: -1,
            path: PathBuf::new(),
            identity: FdIdentity {
                dev: 0,
                ino: 0,
                mode: 0,
            },
            cached_size: None,
            initial_offset: 0,
            started: Utc::now(),
            displayable: false,
            generation: 0,
        });
        self.slots.len() - 1
    }
}

/// Watches the descriptor table of one external process.
pub struct FdTracker {
    pid: i32,
    /// A descriptor explicitly named by the caller; its resolution failures
    /// are reported instead of silently dropped.
    explicit_fd: Option<i32>,
    cwd: PathBuf,
    introspect: Box<dyn FdIntrospection>,
    table: SlotTable,
}

impl FdTracker {
    pub fn new(pid: i32, explicit_fd: Option<i32>) -> Self {
        Self::with_introspection(
            pid,
            explicit_fd,
            Box::new(ProcfsIntrospection),
            env::current_dir().unwrap_or_default(),
        )
    }

    pub fn with_introspection(
        pid: i32,
        explicit_fd: Option<i32>,
        introspect: Box<dyn FdIntrospection>,
        cwd: PathBuf,
    ) -> Self {
        Self {
            pid,
            explicit_fd,
            cwd,
            introspect,
            table: SlotTable::default(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn table(&self) -> &SlotTable {
        &self.table
    }

    pub fn slot(&self, id: SlotId) -> Option<&FdSlot> {
        self.table.get(id)
    }

    pub fn active_ids(&self) -> Vec<SlotId> {
        self.table.active_ids()
    }

    /// Take a fresh snapshot of the watched process's descriptor table.
    ///
    /// Retires slots whose fd is no longer open or whose identity changed,
    /// then discovers fds not yet tracked. A retired fd number that is still
    /// open on a new target is rediscovered as a fresh slot within the same
    /// scan. Resolution failures on auto-discovered fds drop the fd
    /// silently; failures on the explicitly named fd are returned (after the
    /// rest of the scan completes) as `WatchError::Fd`. An explicitly named
    /// fd that is not open in the process at all is reported the same way.
    pub fn scan(&mut self) -> Result<(), WatchError> {
        if !self.introspect.process_exists(self.pid) {
            return Err(WatchError::ProcessGone(self.pid));
        }

        let open_fds = self
            .introspect
            .list_fds(self.pid)
            .map_err(|source| WatchError::Enumerate {
                pid: self.pid,
                source,
            })?;
        let open: HashSet<i32> = open_fds.iter().copied().collect();

        // Retire pass: closed fds and silently repointed fds go back to FREE.
        let tracked: Vec<(i32, usize)> =
            self.table.by_fd.iter().map(|(fd, idx)| (*fd, *idx)).collect();
        for (fd, index) in tracked {
            if !open.contains(&fd) || self.identity_changed_at(index) {
                debug!("fd {fd}: retiring slot {index}");
                self.table.retire(index);
            }
        }

        // Discovery pass.
        let mut explicit_failure: Option<WatchError> = None;
        for fd in open_fds {
            if self.table.by_fd.contains_key(&fd) {
                continue;
            }
            if let Err(err) = self.discover(fd) {
                if self.explicit_fd == Some(fd) {
                    explicit_failure = Some(WatchError::Fd {
                        pid: self.pid,
                        fd,
                        source: err,
                    });
                } else {
                    debug!("fd {fd}: dropped, {err} (code {})", err.code());
                }
            }
        }

        // The explicitly named fd may not be enumerated at all; resolve it
        // anyway so the failure surfaces with its code.
        if explicit_failure.is_none() {
            if let Some(fd) = self.explicit_fd {
                if !open.contains(&fd) {
                    let source = match self.introspect.resolve(self.pid, fd) {
                        Ok(_) => FdError::Unreadable,
                        Err(err) => err,
                    };
                    explicit_failure = Some(WatchError::Fd {
                        pid: self.pid,
                        fd,
                        source,
                    });
                }
            }
        }

        match explicit_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve and record one newly seen fd. Unsupported target types still
    /// occupy a slot (marked non-displayable) so the fd is not reprobed
    /// every cycle, and are reported as an error for the explicit fd only.
    fn discover(&mut self, fd: i32) -> Result<(), FdError> {
        let target = self.introspect.resolve(self.pid, fd)?;

        let (cached_size, displayable) = classify(&target);
        let initial_offset = self.introspect.position(self.pid, fd).unwrap_or(0);

        let index = self.table.claim();
        let slot = &mut self.table.slots[index];
        slot.pid = self.pid;
        slot.fd = fd;
        slot.path = target.path;
        slot.identity = target.identity;
        slot.cached_size = cached_size;
        slot.initial_offset = initial_offset;
        slot.started = Utc::now();
        slot.displayable = displayable;
        self.table.by_fd.insert(fd, index);

        debug!("fd {fd}: tracked in slot {index}, displayable={displayable}");

        if displayable {
            Ok(())
        } else {
            Err(FdError::UnsupportedType)
        }
    }

    /// Whether the descriptor's identity no longer matches what was captured
    /// at discovery. Failure to re-resolve counts as changed.
    pub fn changed(&self, id: SlotId) -> bool {
        let Some(slot) = self.table.get(id) else {
            return true;
        };
        match self.introspect.resolve(self.pid, slot.fd) {
            Ok(target) => target.identity != slot.identity,
            Err(_) => true,
        }
    }

    fn identity_changed_at(&self, index: usize) -> bool {
        let slot = &self.table.slots[index];
        match self.introspect.resolve(self.pid, slot.fd) {
            Ok(target) => target.identity != slot.identity,
            Err(_) => true,
        }
    }

    /// The descriptor's current byte offset, or `None` when the slot can no
    /// longer be trusted (identity changed) or the platform yields nothing.
    pub fn current_offset(&self, id: SlotId) -> Option<u64> {
        if self.changed(id) {
            return None;
        }
        let slot = self.table.get(id)?;
        self.introspect.position(self.pid, slot.fd)
    }

    /// Bounded display name for the slot: fd number prefix, cwd-relative
    /// path, middle elision when the path does not fit half the terminal.
    pub fn display_name(&self, id: SlotId, terminal_width: u16) -> Option<String> {
        let slot = self.table.get(id)?;
        Some(display_name_for(slot.fd, &slot.path, &self.cwd, terminal_width))
    }
}

/// Classify a resolved target: `(cached size, displayable)`.
///
/// A regular file not opened writable gets a fixed cached size; a block
/// device is sized by seeking to its end; a writable regular file is
/// displayable with unknown size; anything else is hidden.
fn classify(target: &FdTarget) -> (Option<u64>, bool) {
    if target.is_regular_file() {
        if target.opened_writable() {
            (None, true)
        } else {
            (Some(target.size), true)
        }
    } else if target.is_block_device() {
        (block_device_size(&target.path), true)
    } else {
        (None, false)
    }
}

fn block_device_size(path: &Path) -> Option<u64> {
    let mut file = File::open(path).ok()?;
    file.seek(SeekFrom::End(0)).ok()
}

/// Build the bounded display name: `%4d:` label plus at most
/// `width / 2 - 6` characters of path, middle-elided with a short prefix and
/// a tail long enough to keep the filename.
fn display_name_for(fd: i32, path: &Path, cwd: &Path, terminal_width: u16) -> String {
    let shown = path.strip_prefix(cwd).unwrap_or(path);
    let text: Vec<char> = shown.to_string_lossy().chars().collect();

    let budget = (terminal_width as usize / 2).saturating_sub(6);
    if text.len() <= budget {
        let s: String = text.into_iter().collect();
        return format!("{fd:4}:{s}");
    }

    let prefix_len = budget / 4;
    let suffix_len = budget.saturating_sub(prefix_len + 3);
    let prefix: String = text[..prefix_len].iter().collect();
    let suffix: String = text[text.len() - suffix_len..].iter().collect();
    format!("{fd:4}:{prefix}...{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(FdError::NotFound.code(), 1);
        assert_eq!(FdError::Unreadable.code(), 2);
        assert_eq!(FdError::MetadataFailed.code(), 3);
        assert_eq!(FdError::UnsupportedType.code(), 4);
    }

    #[test]
    fn display_name_fits_budget_for_any_path_length() {
        let cwd = Path::new("/nowhere");
        for len in [1usize, 10, 50, 200, 1000] {
            let path = PathBuf::from(format!("/data/{}/file.log", "x".repeat(len)));
            for width in [20u16, 40, 80, 132] {
                let name = display_name_for(5, &path, cwd, width);
                let budget = 5 + (width as usize / 2).saturating_sub(6);
                assert!(
                    name.chars().count() <= budget.max(5 + 3),
                    "len {len} width {width}: {name:?}"
                );
                assert!(name.starts_with("   5:"), "{name:?}");
            }
        }
    }

    #[test]
    fn display_name_elides_middle_keeping_filename_tail() {
        let path = PathBuf::from(format!("/var/{}/output.log", "d".repeat(100)));
        let name = display_name_for(12, &path, Path::new("/nowhere"), 80);
        assert!(name.contains("..."), "{name}");
        assert!(name.ends_with("output.log"), "{name}");
        assert!(name.starts_with("  12:"), "{name}");
    }

    #[test]
    fn display_name_strips_cwd_prefix() {
        let name = display_name_for(3, Path::new("/home/me/work/a.log"), Path::new("/home/me/work"), 80);
        assert_eq!(name, "   3:a.log");
    }

    #[test]
    fn claim_reuses_free_slots_before_growing() {
        let mut table = SlotTable::default();
        let first = table.claim();
        table.slots[first].pid = 100;
        table.slots[first].fd = 7;
        table.by_fd.insert(7, first);
        let second = table.claim();
        table.slots[second].pid = 100;
        table.slots[second].fd = 8;
        table.by_fd.insert(8, second);
        assert_eq!(table.len(), 2);

        table.retire(first);
        assert_eq!(table.claim(), first);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn retired_handles_go_stale() {
        let mut table = SlotTable::default();
        let index = table.claim();
        table.slots[index].pid = 100;
        table.slots[index].fd = 7;
        table.by_fd.insert(7, index);

        let id = table.id_for_fd(7).unwrap();
        assert!(table.get(id).is_some());

        table.retire(index);
        assert!(table.get(id).is_none(), "stale handle must not resolve");
    }
}
