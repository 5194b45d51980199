//! The watch loop: poll another process's descriptors and display progress.

use std::io;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::cursor::CursorCoordinator;
use crate::display::{render, StatusLine};
use crate::watchfd::{FdError, FdTracker, WatchError};
use crate::{signals, terminal};

pub struct WatchOptions {
    pub interval: f64,
    pub quiet: bool,
}

/// Watch `pid`'s descriptors until the process goes away.
///
/// Scan failures are terminal: the loop stops cleanly when a process it had
/// been watching exits, and errors out when the watch never got started or
/// when the explicitly named fd cannot be resolved.
pub fn run(
    pid: i32,
    explicit_fd: Option<i32>,
    opts: &WatchOptions,
    config: &Config,
    coordinator: &mut CursorCoordinator,
) -> Result<()> {
    let mut tracker = FdTracker::new(pid, explicit_fd);
    let interval = Duration::from_secs_f64(opts.interval.max(0.05));
    let mut ever_scanned = false;
    let mut reported_unsupported = false;
    let mut drawn_lines: u16 = 0;

    loop {
        if signals::take_continued() {
            coordinator.mark_needs_reinit();
        }
        let _ = signals::take_resized();

        match tracker.scan() {
            Ok(()) => {}
            Err(WatchError::Fd { pid, fd, source })
                if source == FdError::UnsupportedType =>
            {
                // The slot stays tracked but hidden; say so once.
                if !reported_unsupported {
                    warn!("pid {pid}: fd {fd}: {source} (code {})", source.code());
                    reported_unsupported = true;
                }
            }
            Err(WatchError::ProcessGone(pid)) if ever_scanned => {
                debug!("process {pid} ended, stopping watch");
                break;
            }
            Err(err) => return Err(err.into()),
        }
        ever_scanned = true;

        if !opts.quiet {
            drawn_lines = draw(&tracker, explicit_fd, config, coordinator, drawn_lines);
        }

        thread::sleep(interval);
    }

    Ok(())
}

/// Render one status line per displayable slot. A frame of exactly one line
/// goes through the coordinator when one is active; multi-line frames redraw
/// in place with relative cursor movement and do not use the coordinated
/// row. Returns how many lines the frame occupies so the next frame can
/// rewind over it.
fn draw(
    tracker: &FdTracker,
    explicit_fd: Option<i32>,
    config: &Config,
    coordinator: &mut CursorCoordinator,
    previously_drawn: u16,
) -> u16 {
    let (width, height) = terminal::dimensions(config);

    let mut lines = Vec::new();
    for id in tracker.active_ids() {
        let Some(slot) = tracker.slot(id) else {
            continue;
        };
        if !slot.displayable {
            continue;
        }
        if let Some(only) = explicit_fd {
            if slot.fd != only {
                continue;
            }
        }
        let Some(name) = tracker.display_name(id, width) else {
            continue;
        };
        // An unavailable offset means the slot will be retired on the next
        // scan; skip it for this frame.
        let Some(position) = tracker.current_offset(id) else {
            continue;
        };

        let elapsed = (Utc::now() - slot.started).num_milliseconds().max(0) as f64 / 1000.0;
        let moved = position.saturating_sub(slot.initial_offset);
        let rate = if elapsed > 0.0 { moved as f64 / elapsed } else { 0.0 };

        let status = StatusLine {
            name: Some(name),
            transferred: position,
            elapsed_secs: elapsed,
            rate,
            size: slot.cached_size,
        };
        lines.push(render(&status, width));
    }

    if coordinator.active() && lines.len() == 1 {
        coordinator.update(&lines[0], height);
        return 1;
    }

    // Multi-line frame: rewind over the previous one, redraw in place.
    let mut frame = String::new();
    if previously_drawn > 0 {
        frame.push_str(&format!("\x1b[{previously_drawn}A"));
    }
    for line in &lines {
        frame.push('\r');
        frame.push_str(line);
        frame.push_str("\x1b[K\n");
    }
    let mut err = io::stderr();
    terminal::write_retry(&mut err, frame.as_bytes());
    lines.len() as u16
}
