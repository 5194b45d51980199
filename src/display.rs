//! Status line rendering.

use crate::numeric::{format_bytes, format_duration};

/// One display tick's worth of progress, ready to be formatted.
#[derive(Debug, Clone)]
pub struct StatusLine {
    /// Prefix label, e.g. a file name or `--name` value.
    pub name: Option<String>,
    pub transferred: u64,
    pub elapsed_secs: f64,
    /// Bytes per second over the recent window.
    pub rate: f64,
    /// Expected total, when known. Enables the progress bar and ETA.
    pub size: Option<u64>,
}

/// Render a status line no wider than `width` terminal columns.
pub fn render(status: &StatusLine, width: u16) -> String {
    let mut line = String::new();

    if let Some(name) = &status.name {
        line.push_str(name);
        line.push_str(": ");
    }

    line.push_str(&format!(
        "{:>9} {} [{:>9}/s]",
        format_bytes(status.transferred),
        format_duration(status.elapsed_secs as u64),
        format_bytes(status.rate.max(0.0) as u64),
    ));

    if let Some(size) = status.size {
        let percent = if size > 0 {
            ((status.transferred as f64 / size as f64) * 100.0).min(100.0) as u64
        } else {
            100
        };

        let mut tail = format!(" {percent:>3}%");
        if status.rate > 0.0 && status.transferred < size {
            let eta = ((size - status.transferred) as f64 / status.rate) as u64;
            tail.push_str(&format!(" ETA {}", format_duration(eta)));
        }

        // Whatever width is left after the counters and the tail becomes
        // the progress bar.
        let used = line.chars().count() + tail.chars().count();
        let bar_width = (width as usize).saturating_sub(used + 3);
        if bar_width >= 5 {
            let filled = bar_width * percent as usize / 100;
            let mut bar = String::with_capacity(bar_width + 2);
            bar.push('[');
            for i in 0..bar_width {
                if i < filled.saturating_sub(1) {
                    bar.push('=');
                } else if i < filled {
                    bar.push('>');
                } else {
                    bar.push(' ');
                }
            }
            bar.push(']');
            line.push(' ');
            line.push_str(&bar);
        }
        line.push_str(&tail);
    }

    if line.chars().count() > width as usize {
        line = line.chars().take(width as usize).collect();
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(transferred: u64, size: Option<u64>) -> StatusLine {
        StatusLine {
            name: Some("test".to_string()),
            transferred,
            elapsed_secs: 5.0,
            rate: 100.0,
            size,
        }
    }

    #[test]
    fn never_exceeds_width() {
        for width in [10u16, 20, 40, 80, 200] {
            let line = render(&status(500, Some(1000)), width);
            assert!(
                line.chars().count() <= width as usize,
                "width {width}: {line:?}"
            );
        }
    }

    #[test]
    fn includes_percentage_and_eta_when_size_known() {
        let line = render(&status(500, Some(1000)), 80);
        assert!(line.contains("50%"), "{line}");
        assert!(line.contains("ETA"), "{line}");
        assert!(line.contains('['), "{line}");
    }

    #[test]
    fn omits_bar_without_size() {
        let line = render(&status(500, None), 80);
        assert!(!line.contains('%'), "{line}");
        assert!(!line.contains("ETA"), "{line}");
    }

    #[test]
    fn no_eta_once_complete() {
        let line = render(&status(1000, Some(1000)), 80);
        assert!(line.contains("100%"), "{line}");
        assert!(!line.contains("ETA"), "{line}");
    }

    #[test]
    fn name_prefix_is_kept() {
        let line = render(&status(10, None), 80);
        assert!(line.starts_with("test: "), "{line}");
    }
}
