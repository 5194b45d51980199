//! Cursor positioning shared across independent instances on one terminal.
//!
//! A System V shared memory segment, keyed on the controlling terminal's
//! device path, holds a single integer: the screen row claimed by the first
//! instance to join. Each joining instance takes the segment's attach count
//! as its rank and draws on `top_row + rank - 1`. Every mutation of the
//! shared row and every positioned write happens under an exclusive record
//! lock on the terminal device, degrading to a per-user per-terminal lock
//! file on platforms that refuse to lock a terminal.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
use nix::unistd::geteuid;
use thiserror::Error;
use tracing::{debug, warn};

use crate::terminal::{self, write_retry};

/// Project salt mixed into the segment key so instances on different
/// terminals never collide with each other or with other ftok users.
const SEGMENT_SALT: libc::c_int = b'F' as libc::c_int;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cannot resolve the controlling terminal")]
    TerminalUnresolved,

    #[error("failed to open terminal {path}: {source}")]
    TerminalOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("terminal lock unavailable: {0}")]
    LockUnavailable(Errno),

    #[error("cursor position query failed")]
    HardwareQueryFailed,

    #[error("shared memory segment unavailable: {0}")]
    SegmentUnavailable(Errno),
}

/// Derive the shared segment key for a terminal device path.
pub fn segment_key(tty_path: &Path) -> Option<libc::key_t> {
    let c_path = CString::new(tty_path.as_os_str().as_bytes()).ok()?;
    let key = unsafe { libc::ftok(c_path.as_ptr(), SEGMENT_SALT) };
    if key == -1 {
        None
    } else {
        Some(key)
    }
}

/// Per-user per-terminal lock file path, used when the terminal device
/// itself cannot be locked.
pub fn lock_file_path(tty_path: &Path, euid: u32) -> PathBuf {
    let tmpdir = std::env::var_os("TMPDIR")
        .or_else(|| std::env::var_os("TMP"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let base = tty_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tty".to_string());
    tmpdir.join(format!("pipeflow-{base}-{euid}.lock"))
}

/// Offset assigned to an instance joining with the given observed attach
/// count (itself included).
pub fn join_offset(observed_count: u32) -> u32 {
    observed_count.saturating_sub(1)
}

/// Rows the screen must scroll so that `max_count` instances starting at
/// `top_row` all fit on a terminal of `height` rows.
pub fn scroll_overflow(top_row: i32, max_count: u32, height: u16) -> u16 {
    let overflow = top_row as i64 + max_count as i64 - height as i64;
    overflow.clamp(0, u16::MAX as i64) as u16
}

/// This instance's target row, defensively clamped to the screen.
pub fn target_row(top_row: i32, offset: i32, height: u16) -> u16 {
    (top_row + offset).clamp(1, height.max(1) as i32) as u16
}

/// The resting row for `fini`: below every row the instance group ever
/// claimed, clamped to the screen and to the absolute positioning bound.
pub fn final_row(top_row: i32, max_count: u32, height: u16) -> u32 {
    let mut y = top_row as i64 + max_count as i64 - 1;
    y = y.min(height as i64);
    if !(1..=999_999).contains(&y) {
        y = 1;
    }
    y as u32
}

/// Parse a cursor-position-report answerback, `ESC [ <row> ; <col> R`,
/// returning the row.
pub fn parse_answerback(buf: &[u8]) -> Option<u16> {
    let start = buf.iter().position(|&b| b == b'[')? + 1;
    let mut row: u32 = 0;
    let mut saw_digit = false;
    for &b in &buf[start..] {
        match b {
            b'0'..=b'9' => {
                row = row * 10 + u32::from(b - b'0');
                saw_digit = true;
                if row > 999_999 {
                    return None;
                }
            }
            b';' | b'R' => break,
            _ => return None,
        }
    }
    if saw_digit && row >= 1 {
        u16::try_from(row).ok()
    } else {
        None
    }
}

/// RAII-ish wrapper over the shared segment. Detaches on drop; explicit
/// teardown removes the segment when this was the last attached instance.
struct ShmSegment {
    id: libc::c_int,
    top: *mut libc::c_int,
    detached: bool,
}

impl ShmSegment {
    fn attach(tty_path: &Path) -> Result<Self, CursorError> {
        let key = segment_key(tty_path)
            .ok_or_else(|| CursorError::SegmentUnavailable(Errno::last()))?;

        let id = unsafe {
            libc::shmget(
                key,
                std::mem::size_of::<libc::c_int>(),
                0o600 | libc::IPC_CREAT,
            )
        };
        if id < 0 {
            return Err(CursorError::SegmentUnavailable(Errno::last()));
        }

        let top = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if top as isize == -1 {
            return Err(CursorError::SegmentUnavailable(Errno::last()));
        }

        Ok(Self {
            id,
            top: top.cast(),
            detached: false,
        })
    }

    /// Number of processes currently attached, ourselves included.
    fn attach_count(&self) -> u32 {
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(self.id, libc::IPC_STAT, &mut ds) } != 0 {
            return 1;
        }
        ds.shm_nattch as u32
    }

    fn top_row(&self) -> i32 {
        unsafe { std::ptr::read_volatile(self.top) as i32 }
    }

    fn set_top_row(&self, row: i32) {
        unsafe { std::ptr::write_volatile(self.top, row as libc::c_int) }
    }

    /// Detach, removing the segment when no other instance remains.
    fn teardown(&mut self) {
        if self.detached {
            return;
        }
        let remaining = self.attach_count();
        unsafe {
            libc::shmdt(self.top.cast());
            if remaining < 2 {
                libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
            }
        }
        self.detached = true;
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if !self.detached {
            unsafe {
                libc::shmdt(self.top.cast());
            }
            self.detached = true;
        }
    }
}

/// The per-instance coordination state. Present only while coordination is
/// active; the public `CursorCoordinator` wraps it in an `Option`.
struct Coord {
    tty: File,
    tty_path: PathBuf,
    /// Created on demand when the terminal itself refuses record locks.
    lock_file: Option<(File, PathBuf)>,
    tried_lock_file: bool,
    /// `None` means no-IPC single-instance mode.
    shm: Option<ShmSegment>,
    top_row: i32,
    last_read: i32,
    offset: i32,
    max_count_seen: u32,
    reinit_pending: u8,
    height: u16,
    finished: bool,
}

/// Handle owned by the display loop. All state is explicit here; there are
/// no process-wide singletons.
pub struct CursorCoordinator {
    inner: Option<Coord>,
}

impl CursorCoordinator {
    /// A coordinator that does nothing; the caller redraws with `\r`.
    pub fn inactive() -> Self {
        Self { inner: None }
    }

    pub fn active(&self) -> bool {
        self.inner.is_some()
    }

    /// Current offset (join rank minus one), for diagnostics and tests.
    pub fn offset(&self) -> Option<i32> {
        self.inner.as_ref().map(|c| c.offset)
    }

    /// Join the terminal-sharing group.
    ///
    /// When `required` is false every failure degrades to an inactive
    /// coordinator; when true (coordination explicitly requested) failures
    /// propagate.
    pub fn init(required: bool) -> Result<Self, CursorError> {
        let Some(tty_path) = terminal::controlling_tty() else {
            if required {
                return Err(CursorError::TerminalUnresolved);
            }
            debug!("no controlling terminal, cursor coordination disabled");
            return Ok(Self::inactive());
        };

        let tty = match OpenOptions::new().read(true).write(true).open(&tty_path) {
            Ok(file) => file,
            Err(source) => {
                if required {
                    return Err(CursorError::TerminalOpen {
                        path: tty_path,
                        source,
                    });
                }
                debug!("cannot open {}: cursor coordination disabled", tty_path.display());
                return Ok(Self::inactive());
            }
        };

        let (_, height) = crossterm::terminal::size().unwrap_or((80, 24));
        let mut coord = Coord {
            tty,
            tty_path,
            lock_file: None,
            tried_lock_file: false,
            shm: None,
            top_row: 1,
            last_read: 1,
            offset: 0,
            max_count_seen: 1,
            reinit_pending: 0,
            height,
            finished: false,
        };

        let result = match coord.ipc_init() {
            Err(CursorError::SegmentUnavailable(err)) => {
                // No IPC available: fall back to single-instance behavior,
                // still measuring the origin under the lock.
                debug!("shared segment unavailable ({err}), no-IPC mode");
                coord.no_ipc_init()
            }
            other => other,
        };

        match result {
            Ok(()) => Ok(Self { inner: Some(coord) }),
            Err(err) if required => Err(err),
            Err(err) => {
                debug!("cursor coordination disabled: {err}");
                Ok(Self::inactive())
            }
        }
    }

    /// Redraw this instance's status line at its coordinated row.
    pub fn update(&mut self, line: &str, height: u16) {
        let keep = match &mut self.inner {
            Some(coord) => coord.update(line, height),
            None => return,
        };
        if !keep {
            warn!("terminal lock lost, cursor coordination disabled");
            self.inner = None;
        }
    }

    /// Note that the process regained the foreground; the next updates will
    /// re-measure the cursor origin once the debounce runs out.
    pub fn mark_needs_reinit(&mut self) {
        if let Some(coord) = &mut self.inner {
            coord.reinit_pending = (coord.reinit_pending + 2).min(3);
        }
    }

    /// Park the cursor below the group's rows and release every shared
    /// resource. Idempotent; also invoked on drop.
    pub fn fini(&mut self) {
        if let Some(coord) = &mut self.inner {
            coord.fini();
        }
        self.inner = None;
    }
}

impl Drop for CursorCoordinator {
    fn drop(&mut self) {
        self.fini();
    }
}

impl Coord {
    /// Attach to the shared segment and establish this instance's origin and
    /// rank. The whole join runs under the terminal lock: attach-then-check
    /// would otherwise race a second instance into the same rank.
    fn ipc_init(&mut self) -> Result<(), CursorError> {
        self.lock()?;

        let segment = match ShmSegment::attach(&self.tty_path) {
            Ok(segment) => segment,
            Err(err) => {
                self.unlock();
                return Err(err);
            }
        };

        let count = segment.attach_count().max(1);
        self.max_count_seen = count;
        self.offset = join_offset(count) as i32;

        if count < 2 {
            // First to join: measure the real cursor and publish it, then
            // advance a line so the next joiner observes a different origin.
            let row = match self.query_cursor_row() {
                Ok(row) => row,
                Err(err) => {
                    self.unlock();
                    return Err(err);
                }
            };
            self.top_row = row as i32;
            segment.set_top_row(self.top_row);
            write_retry(&mut io::stderr(), b"\n");
            debug!("first to attach, published top row {row}");
        } else {
            self.top_row = segment.top_row();
            debug!(
                "joined as instance {count}, top row {} from segment",
                self.top_row
            );
        }
        self.last_read = self.top_row;
        self.shm = Some(segment);

        self.unlock();
        Ok(())
    }

    /// Single-instance fallback when shared memory is unavailable.
    fn no_ipc_init(&mut self) -> Result<(), CursorError> {
        self.lock()?;
        let row = match self.query_cursor_row() {
            Ok(row) => row,
            Err(err) => {
                self.unlock();
                return Err(err);
            }
        };
        self.top_row = row as i32;
        self.last_read = self.top_row;
        self.offset = 0;
        write_retry(&mut io::stderr(), b"\n");
        self.unlock();
        Ok(())
    }

    /// Returns false when locking has become impossible and the coordinator
    /// should shut itself off.
    fn update(&mut self, line: &str, height: u16) -> bool {
        self.height = height;

        if self.reinit_pending > 0 {
            self.reinit();
            if self.reinit_pending > 0 {
                return true;
            }
        }

        let segment_view = self.shm.as_ref().map(|s| (s.attach_count(), s.top_row()));
        if let Some((count, shared_top)) = segment_view {
            if count > self.max_count_seen {
                self.max_count_seen = count;
            }

            if shared_top != self.last_read {
                self.top_row = shared_top;
                self.last_read = shared_top;
            }

            let overflow = scroll_overflow(self.top_row, self.max_count_seen, height);
            if overflow > 0 {
                self.top_row = (self.top_row - overflow as i32).max(1);
                // Only the topmost instance emits the scroll and publishes
                // the shifted origin; everyone else picks it up on their
                // next update.
                if self.offset == 0 {
                    if self.lock().is_err() {
                        return false;
                    }
                    let mut out = io::stderr();
                    write_retry(&mut out, format!("\x1b[{height};1H").as_bytes());
                    for _ in 0..overflow {
                        write_retry(&mut out, b"\n");
                    }
                    if let Some(segment) = &self.shm {
                        segment.set_top_row(self.top_row);
                    }
                    self.last_read = self.top_row;
                    self.unlock();
                    debug!("scrolled {overflow} rows, new top {}", self.top_row);
                }
            }
        }

        let row = target_row(self.top_row, if self.shm.is_some() { self.offset } else { 0 }, height);

        if self.lock().is_err() {
            return false;
        }
        let mut out = io::stderr();
        write_retry(&mut out, format!("\x1b[{row};1H").as_bytes());
        write_retry(&mut out, line.as_bytes());
        self.unlock();
        true
    }

    /// Re-measure the cursor origin after a foreground regain, debounced
    /// because intervening shell output settles over a couple of ticks. Only
    /// the topmost instance re-measures and republishes.
    fn reinit(&mut self) {
        if self.lock().is_err() {
            return;
        }

        self.reinit_pending = self.reinit_pending.saturating_sub(1);
        if self.reinit_pending > 0 || self.offset > 0 {
            self.unlock();
            return;
        }

        if let Ok(row) = self.query_cursor_row() {
            self.top_row = row as i32;
            self.last_read = self.top_row;
            if let Some(segment) = &self.shm {
                segment.set_top_row(self.top_row);
            }
            debug!("reinit republished top row {row}");
        }
        self.unlock();
    }

    fn fini(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let max = if self.shm.is_some() {
            self.max_count_seen
        } else {
            1
        };
        let row = final_row(self.top_row, max, self.height);

        let locked = self.lock().is_ok();
        write_retry(&mut io::stderr(), format!("\x1b[{row};1H\n").as_bytes());

        if let Some(mut segment) = self.shm.take() {
            segment.teardown();
        }
        if locked {
            self.unlock();
        }

        if let Some((file, path)) = self.lock_file.take() {
            drop(file);
            let _ = std::fs::remove_file(&path);
        }
    }

    /// Acquire the exclusive lock, blocking. EINTR is retried transparently;
    /// a terminal that refuses record locks degrades to the lock file.
    fn lock(&mut self) -> Result<(), CursorError> {
        loop {
            let flock = record_lock(libc::F_WRLCK);
            let result = match &self.lock_file {
                Some((file, _)) => fcntl(file.as_fd(), FcntlArg::F_SETLKW(&flock)),
                None => fcntl(self.tty.as_fd(), FcntlArg::F_SETLKW(&flock)),
            };
            match result {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    if self.lock_file.is_none() && !self.tried_lock_file {
                        self.tried_lock_file = true;
                        match self.open_lock_file() {
                            Ok(lock_file) => {
                                debug!("terminal lock refused ({err}), using lock file");
                                self.lock_file = Some(lock_file);
                                continue;
                            }
                            Err(open_err) => {
                                warn!("failed to open lock file: {open_err}");
                                return Err(CursorError::LockUnavailable(err));
                            }
                        }
                    }
                    return Err(CursorError::LockUnavailable(err));
                }
            }
        }
    }

    fn unlock(&mut self) {
        let flock = record_lock(libc::F_UNLCK);
        let _ = match &self.lock_file {
            Some((file, _)) => fcntl(file.as_fd(), FcntlArg::F_SETLK(&flock)),
            None => fcntl(self.tty.as_fd(), FcntlArg::F_SETLK(&flock)),
        };
    }

    fn open_lock_file(&self) -> io::Result<(File, PathBuf)> {
        let path = lock_file_path(&self.tty_path, geteuid().as_raw());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&path)?;
        Ok((file, path))
    }

    /// Query the hardware cursor row: raw-ish mode, `ESC[6n`, single-line
    /// answerback read byte by byte, then restore the terminal.
    fn query_cursor_row(&self) -> Result<u16, CursorError> {
        let saved = tcgetattr(&self.tty).map_err(|_| CursorError::HardwareQueryFailed)?;
        let mut raw = saved.clone();
        raw.local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO);
        tcsetattr(&self.tty, SetArg::TCSAFLUSH, &raw)
            .map_err(|_| CursorError::HardwareQueryFailed)?;

        write_retry(&mut &self.tty, b"\x1b[6n");

        let mut buf = [0u8; 32];
        let mut len = 0;
        while len < buf.len() {
            let mut byte = [0u8; 1];
            match (&self.tty).read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    buf[len] = byte[0];
                    len += 1;
                    if byte[0] == b'R' {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }

        let _ = tcsetattr(&self.tty, SetArg::TCSAFLUSH, &saved);

        let row = parse_answerback(&buf[..len]).ok_or(CursorError::HardwareQueryFailed)?;
        debug!("hardware cursor row {row}");
        Ok(row)
    }
}

fn record_lock(kind: libc::c_int) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 1;
    fl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_offsets_follow_attach_rank() {
        assert_eq!(join_offset(1), 0);
        assert_eq!(join_offset(2), 1);
        assert_eq!(join_offset(5), 4);
        assert_eq!(join_offset(0), 0);
    }

    #[test]
    fn answerback_parsing() {
        assert_eq!(parse_answerback(b"\x1b[10;1R"), Some(10));
        assert_eq!(parse_answerback(b"\x1b[3;42R"), Some(3));
        assert_eq!(parse_answerback(b"\x1b[999R"), Some(999));
        assert_eq!(parse_answerback(b""), None);
        assert_eq!(parse_answerback(b"\x1b[;5R"), None);
        assert_eq!(parse_answerback(b"garbage"), None);
        assert_eq!(parse_answerback(b"\x1b[0;1R"), None);
    }

    #[test]
    fn scroll_overflow_only_past_screen_end() {
        assert_eq!(scroll_overflow(10, 3, 24), 0);
        assert_eq!(scroll_overflow(22, 2, 24), 0);
        assert_eq!(scroll_overflow(23, 2, 24), 1);
        assert_eq!(scroll_overflow(24, 4, 24), 4);
    }

    #[test]
    fn target_rows_stay_on_screen() {
        assert_eq!(target_row(10, 0, 24), 10);
        assert_eq!(target_row(10, 1, 24), 11);
        assert_eq!(target_row(30, 5, 24), 24);
        assert_eq!(target_row(-4, 0, 24), 1);
    }

    #[test]
    fn final_row_clamps() {
        assert_eq!(final_row(10, 2, 24), 11);
        assert_eq!(final_row(23, 5, 24), 24);
        assert_eq!(final_row(-10, 1, 24), 1);
    }
}
