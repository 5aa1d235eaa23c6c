//! Byte-size and duration conversions
//!
//! Size strings are for argument ergonomics only; the engine itself always
//! works on resolved byte counts. All size suffixes are powers of 1024,
//! so "512MB" and "512MiB" name the same amount.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

const SIZE_UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Format bytes into human-readable size with appropriate units
///
/// # Examples
/// ```
/// use diskpak::util::units::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 KiB");
/// assert_eq!(format_bytes(1048576), "1.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    format_bytes_f64(bytes as f64)
}

fn format_bytes_f64(bytes: f64) -> String {
    if bytes <= 0.0 {
        return "0 B".to_string();
    }

    let mut size = bytes;
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index < SIZE_UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size.round() as u64, SIZE_UNITS[0])
    } else {
        format!("{:.1} {}", size, SIZE_UNITS[unit_index])
    }
}

/// Format a bytes-per-second rate, e.g. "12.5 MiB/s"
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes_f64(bytes_per_sec))
}

/// Parse human-readable size string into bytes
///
/// Accepts `B`, `K`/`KB`/`KiB`, `M`/`MB`/`MiB`, `G`/`GB`/`GiB`,
/// `T`/`TB`/`TiB`, case-insensitive, with or without a space.
///
/// # Examples
/// ```
/// use diskpak::util::units::parse_bytes;
///
/// assert_eq!(parse_bytes("4KB").unwrap(), 4096);
/// assert_eq!(parse_bytes("1.5 MiB").unwrap(), 1572864);
/// assert_eq!(parse_bytes("512mb").unwrap(), 512 * 1024 * 1024);
/// ```
pub fn parse_bytes(input: &str) -> Result<u64, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("Empty size".to_string());
    }

    let split_pos = input
        .find(|c: char| c.is_alphabetic())
        .unwrap_or(input.len());
    let number_part = input[..split_pos].trim();
    let unit_part = input[split_pos..].trim();

    let number: f64 = number_part
        .parse()
        .map_err(|_| format!("Invalid number: {}", number_part))?;

    if number < 0.0 {
        return Err("Size cannot be negative".to_string());
    }

    let multiplier = match unit_part.to_uppercase().as_str() {
        "" | "B" => 1u64,
        "K" | "KB" | "KIB" => 1u64 << 10,
        "M" | "MB" | "MIB" => 1u64 << 20,
        "G" | "GB" | "GIB" => 1u64 << 30,
        "T" | "TB" | "TIB" => 1u64 << 40,
        _ => return Err(format!("Unknown unit: {}", unit_part)),
    };

    Ok((number * multiplier as f64).round() as u64)
}

/// Deserialize a size that may be written as a number or a string like "4MB"
pub fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(u64),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_bytes(&s).map_err(serde::de::Error::custom),
    }
}

/// Format duration into human-readable string
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use diskpak::util::units::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if total_secs >= 3600 {
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if total_secs >= 60 {
        format!("{}m {}s", total_secs / 60, total_secs % 60)
    } else if total_secs > 0 {
        if millis > 0 {
            format!("{}.{:02}s", total_secs, millis / 10)
        } else {
            format!("{}s", total_secs)
        }
    } else {
        format!("{}ms", millis)
    }
}

/// Parse duration string into Duration
///
/// Bare numbers are seconds ("2.5"); anything else goes through humantime
/// ("30s", "1m30s", "1h 30m", "500ms").
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("Empty duration".to_string());
    }
    if let Ok(secs) = input.parse::<f64>() {
        if secs < 0.0 || !secs.is_finite() {
            return Err(format!("Invalid duration: {}", input));
        }
        return Ok(Duration::from_secs_f64(secs));
    }
    humantime::parse_duration(input).map_err(|e| format!("Invalid duration '{}': {}", input, e))
}

/// Calculate throughput in MiB/s from bytes and duration
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use diskpak::util::units::calculate_throughput_mbps;
///
/// let throughput = calculate_throughput_mbps(1048576, Duration::from_secs(1));
/// assert!((throughput - 1.0).abs() < 0.01);
/// ```
pub fn calculate_throughput_mbps(bytes: u64, duration: Duration) -> f64 {
    if duration.is_zero() {
        return 0.0;
    }
    bytes as f64 / 1_048_576.0 / duration.as_secs_f64()
}

/// Format throughput value with appropriate units
pub fn format_throughput(mbps: f64) -> String {
    if mbps >= 1024.0 {
        format!("{:.1} GiB/s", mbps / 1024.0)
    } else if mbps >= 1.0 {
        format!("{:.1} MiB/s", mbps)
    } else if mbps >= 0.001 {
        format!("{:.1} KiB/s", mbps * 1024.0)
    } else {
        format!("{:.3} MiB/s", mbps)
    }
}
