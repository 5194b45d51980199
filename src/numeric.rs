//! Parsing and formatting of byte counts, rates, and durations.

/// Parse a size string with an optional binary unit suffix, e.g. `1024`,
/// `100K`, `2.5M`, `1G`, `3T`. A trailing `B` or `iB` after the unit is
/// accepted (`10MiB`).
///
/// Returns an error message suitable for clap's `value_parser`.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty size".to_string());
    }

    let digits_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_part, suffix) = s.split_at(digits_end);

    let value: f64 = num_part
        .parse()
        .map_err(|_| format!("invalid number: {input}"))?;
    if value < 0.0 {
        return Err(format!("negative size: {input}"));
    }

    let suffix = suffix.trim().trim_end_matches("iB").trim_end_matches('B');
    let multiplier: u64 = match suffix {
        "" => 1,
        "k" | "K" => 1 << 10,
        "m" | "M" => 1 << 20,
        "g" | "G" => 1 << 30,
        "t" | "T" => 1u64 << 40,
        other => return Err(format!("unknown unit suffix: {other}")),
    };

    let bytes = value * multiplier as f64;
    if bytes > u64::MAX as f64 {
        return Err(format!("size too large: {input}"));
    }
    Ok(bytes as u64)
}

/// Format a byte count with a binary unit, e.g. `999B`, `1.25KiB`, `3.02GiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{bytes}B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if value >= 100.0 {
        format!("{value:.0}{}", UNITS[unit])
    } else if value >= 10.0 {
        format!("{value:.1}{}", UNITS[unit])
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

/// Format an elapsed or remaining time as `h:mm:ss`, with a day count
/// prepended once the duration exceeds a day.
pub fn format_duration(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    if days > 0 {
        format!("{days}d{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours}:{minutes:02}:{seconds:02}")
    }
}
