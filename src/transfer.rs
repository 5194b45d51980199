//! The byte-copy transfer loop.
//!
//! Plain read/write plumbing around the status display: data flows from the
//! named files (or standard input) to standard output, and once per interval
//! a status line goes to the terminal, through the coordinator when one is
//! active.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::Config;
use crate::cursor::CursorCoordinator;
use crate::display::{render, StatusLine};
use crate::{signals, terminal};

pub struct TransferOptions {
    pub interval: f64,
    /// Bytes per second; unlimited when `None`.
    pub rate_limit: Option<u64>,
    pub buffer_size: usize,
    /// Expected total; derived from input file sizes when not given.
    pub size: Option<u64>,
    pub name: Option<String>,
    pub quiet: bool,
}

/// Copy all inputs to stdout, reporting progress. Returns the byte total.
pub fn run(
    inputs: &[PathBuf],
    opts: &TransferOptions,
    config: &Config,
    coordinator: &mut CursorCoordinator,
) -> Result<u64> {
    let size = opts.size.or_else(|| total_input_size(inputs));

    let mut readers: Vec<(Box<dyn Read>, Option<String>)> = Vec::new();
    if inputs.is_empty() {
        readers.push((Box::new(io::stdin().lock()), None));
    } else {
        for path in inputs {
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let label = path.file_name().map(|n| n.to_string_lossy().into_owned());
            readers.push((Box::new(file), label));
        }
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; opts.buffer_size.max(1)];
    let interval = Duration::from_secs_f64(opts.interval.max(0.05));

    let start = Instant::now();
    let mut total: u64 = 0;
    let mut last_emit = Instant::now();
    let mut last_total: u64 = 0;

    for (reader, label) in &mut readers {
        let name = opts.name.clone().or_else(|| label.clone());
        loop {
            if let Some(limit) = opts.rate_limit {
                throttle(total, limit, start);
            }

            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    out.write_all(&buf[..n]).context("write failed")?;
                    total += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("read failed"),
            }

            if signals::take_continued() {
                coordinator.mark_needs_reinit();
            }
            // Dimensions are re-queried on every emit, so a resize needs no
            // extra bookkeeping here.
            let _ = signals::take_resized();

            if !opts.quiet && last_emit.elapsed() >= interval {
                let window = last_emit.elapsed().as_secs_f64().max(1e-6);
                let status = StatusLine {
                    name: name.clone(),
                    transferred: total,
                    elapsed_secs: start.elapsed().as_secs_f64(),
                    rate: (total - last_total) as f64 / window,
                    size,
                };
                emit_status(coordinator, config, &status);
                last_emit = Instant::now();
                last_total = total;
            }
        }
    }

    out.flush().context("flush failed")?;
    debug!("transfer complete, {total} bytes");

    if !opts.quiet {
        let elapsed = start.elapsed().as_secs_f64();
        let status = StatusLine {
            name: opts.name.clone(),
            transferred: total,
            elapsed_secs: elapsed,
            rate: total as f64 / elapsed.max(1e-6),
            size,
        };
        emit_status(coordinator, config, &status);
    }

    Ok(total)
}

fn emit_status(coordinator: &mut CursorCoordinator, config: &Config, status: &StatusLine) {
    let (width, height) = terminal::dimensions(config);
    let line = render(status, width);
    if coordinator.active() {
        coordinator.update(&line, height);
    } else {
        let mut err = io::stderr();
        terminal::write_retry(&mut err, format!("\r{line}\x1b[K").as_bytes());
    }
}

/// Sum of the input file sizes, when every input is a statable file.
fn total_input_size(inputs: &[PathBuf]) -> Option<u64> {
    if inputs.is_empty() {
        return None;
    }
    let mut total = 0u64;
    for path in inputs {
        let meta = fs::metadata(path).ok()?;
        if !meta.is_file() {
            return None;
        }
        total += meta.len();
    }
    Some(total)
}

/// Sleep just long enough to keep the transfer under `limit` bytes/sec.
fn throttle(total: u64, limit: u64, start: Instant) {
    if limit == 0 {
        return;
    }
    let allowed = start.elapsed().as_secs_f64() * limit as f64;
    if total as f64 > allowed {
        let secs = ((total as f64 - allowed) / limit as f64).min(1.0);
        thread::sleep(Duration::from_secs_f64(secs));
    }
}
