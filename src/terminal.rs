//! Controlling-terminal helpers shared by the display loops.

use std::io::{self, Write};
use std::os::fd::AsFd;
use std::path::PathBuf;

use nix::unistd::ttyname;
use tracing::debug;

use crate::config::Config;

/// Resolve the device path of the controlling terminal via stderr.
///
/// Returns `None` when stderr is not attached to a terminal (e.g. redirected
/// to a file), in which case cursor coordination cannot work.
pub fn controlling_tty() -> Option<PathBuf> {
    match ttyname(io::stderr().as_fd()) {
        Ok(path) => Some(path),
        Err(err) => {
            debug!("ttyname failed: {err}");
            None
        }
    }
}

/// Current terminal dimensions as `(width, height)`, honoring any overrides
/// from the config file. Falls back to 80x24 when the size cannot be queried.
pub fn dimensions(config: &Config) -> (u16, u16) {
    let (mut width, mut height) = crossterm::terminal::size().unwrap_or((80, 24));
    if let Some(w) = config.width {
        width = w;
    }
    if let Some(h) = config.height {
        height = h;
    }
    (width.max(1), height.max(1))
}

/// Write the whole buffer, retrying across partial writes and EINTR.
/// Other write errors are swallowed; there is nowhere useful to report a
/// failed status-line write.
pub fn write_retry<W: Write>(writer: &mut W, mut buf: &[u8]) {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => break,
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    let _ = writer.flush();
}
