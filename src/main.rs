use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pipeflow::config::Config;
use pipeflow::cursor::CursorCoordinator;
use pipeflow::numeric;
use pipeflow::signals;
use pipeflow::transfer::{self, TransferOptions};
use pipeflow::watch::{self, WatchOptions};

#[derive(Parser, Debug)]
#[command(name = "pipeflow")]
#[command(about = "Monitor the throughput of a pipe, or of another process's file descriptors", long_about = None)]
struct Args {
    /// Files to read in sequence (standard input if none given)
    files: Vec<PathBuf>,

    /// Watch the open file descriptors of PID (or one descriptor, PID:FD)
    #[arg(short = 'p', long, value_name = "PID[:FD]", conflicts_with = "files")]
    watch_pid: Option<String>,

    /// Coordinate the status line with other instances sharing this terminal
    #[arg(short, long)]
    cursor: bool,

    /// Seconds between display updates
    #[arg(short, long)]
    interval: Option<f64>,

    /// Expected total size, with optional K/M/G/T suffix
    #[arg(short, long, value_parser = numeric::parse_size)]
    size: Option<u64>,

    /// Limit throughput to this many bytes per second (suffixes accepted)
    #[arg(short = 'L', long, value_parser = numeric::parse_size)]
    rate_limit: Option<u64>,

    /// Transfer buffer size in bytes
    #[arg(short = 'B', long, default_value_t = 65536)]
    buffer_size: usize,

    /// Name prefix for the status line
    #[arg(short = 'N', long)]
    name: Option<String>,

    /// Copy without any status output
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var_os("PIPEFLOW_LOG").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_env("PIPEFLOW_LOG"))
            .with_writer(io::stderr)
            .init();
    }

    let config = Config::load();
    signals::install().context("failed to install signal handlers")?;

    let interval = args.interval.unwrap_or(config.interval);

    let watch_target = match &args.watch_pid {
        Some(text) => Some(parse_watch_target(text)?),
        None => None,
    };

    // -c makes coordination mandatory; a single-descriptor watch tries it
    // opportunistically. A whole-process watch draws multi-line frames,
    // which cannot share one coordinated row.
    let mut coordinator = if args.quiet {
        CursorCoordinator::inactive()
    } else if args.cursor {
        CursorCoordinator::init(true).context("cursor coordination unavailable")?
    } else if single_line_watch(&watch_target) {
        CursorCoordinator::init(false)?
    } else {
        CursorCoordinator::inactive()
    };

    let result = if let Some((pid, fd)) = watch_target {
        watch::run(
            pid,
            fd,
            &WatchOptions {
                interval,
                quiet: args.quiet,
            },
            &config,
            &mut coordinator,
        )
    } else {
        transfer::run(
            &args.files,
            &TransferOptions {
                interval,
                rate_limit: args.rate_limit,
                buffer_size: args.buffer_size,
                size: args.size,
                name: args.name.clone(),
                quiet: args.quiet,
            },
            &config,
            &mut coordinator,
        )
        .map(|_| ())
    };

    coordinator.fini();
    result
}

/// A watch of one named descriptor emits exactly one status line, so it can
/// share a coordinated terminal row; a whole-process watch cannot.
fn single_line_watch(target: &Option<(i32, Option<i32>)>) -> bool {
    matches!(target, Some((_, Some(_))))
}

/// Parse the `PID` or `PID:FD` argument of `--watch-pid`.
fn parse_watch_target(target: &str) -> Result<(i32, Option<i32>)> {
    let (pid_part, fd_part) = match target.split_once(':') {
        Some((pid, fd)) => (pid, Some(fd)),
        None => (target, None),
    };

    let pid: i32 = pid_part
        .parse()
        .with_context(|| format!("invalid pid in {target:?}"))?;
    if pid <= 0 {
        bail!("invalid pid in {target:?}");
    }

    let fd = match fd_part {
        Some(text) => {
            let fd: i32 = text
                .parse()
                .with_context(|| format!("invalid fd in {target:?}"))?;
            if fd < 0 {
                bail!("invalid fd in {target:?}");
            }
            Some(fd)
        }
        None => None,
    };

    Ok((pid, fd))
}
