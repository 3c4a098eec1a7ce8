//! Provides parsing and formatting helpers for durations, byte sizes and ratios.
//!
//! These are mostly used to read the settings of a node (e.g. **store.max_memory: 3g** or
//! **eviction.interval: 60s**) and to render human readable log messages.
use std::fmt::Write;
use std::time::Duration;

const SIZE_UNITS: [&str; 6] = ["Bytes", "KiB", "MiB", "GiB", "TiB", "PiB"];

const DURATION_UNITS: [(u128, &str); 5] = [
    (1000 * 60 * 60 * 24, "d"),
    (1000 * 60 * 60, "h"),
    (1000 * 60, "m"),
    (1000, "s"),
    (1, "ms"),
];

/// Formats a given size in bytes.
///
/// This function determines the ideal unit (ranging from bytes to petabytes) to provide
/// a concise representation.
///
/// # Examples
///
/// ```
/// assert_eq!(datastore::fmt::format_size(0), "0 bytes");
/// assert_eq!(datastore::fmt::format_size(1), "1 byte");
/// assert_eq!(datastore::fmt::format_size(100), "100 bytes");
/// assert_eq!(datastore::fmt::format_size(8_734), "8.53 KiB");
/// assert_eq!(datastore::fmt::format_size(87_340), "85.3 KiB");
/// assert_eq!(datastore::fmt::format_size(873_400), "853 KiB");
/// assert_eq!(datastore::fmt::format_size(11 * 1024 * 1024), "11.0 MiB");
/// assert_eq!(datastore::fmt::format_size(3 * 1024 * 1024 * 1024), "3.00 GiB");
/// assert_eq!(datastore::fmt::format_size(8_734_000_000_000), "7.94 TiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    if size_in_bytes == 1 {
        return "1 byte".to_owned();
    } else if size_in_bytes < 1024 {
        return format!("{} bytes", size_in_bytes);
    }

    let mut magnitude = 0;
    let mut size = size_in_bytes as f64;
    while size > 1024. && magnitude < SIZE_UNITS.len() - 1 {
        size /= 1024.;
        magnitude += 1;
    }

    if size <= 10. {
        format!("{:.2} {}", size, SIZE_UNITS[magnitude])
    } else if size <= 100. {
        format!("{:.1} {}", size, SIZE_UNITS[magnitude])
    } else {
        format!("{:.0} {}", size, SIZE_UNITS[magnitude])
    }
}

/// Parses a byte size from a given string.
///
/// This string can have the following suffixes:
/// * **k** or **K**: treats the value as KiB
/// * **m** or **M**: treats the value as MiB
/// * **g** or **G**: treats the value as GiB
/// * **t** or **T**: treats the value as TiB
///
/// Returns an **Err** if either a non-integer value is given or if an unknown suffix was provided.
///
/// # Examples
///
/// ```
/// assert_eq!(datastore::fmt::parse_size("100").unwrap(), 100);
/// assert_eq!(datastore::fmt::parse_size("100b").unwrap(), 100);
/// assert_eq!(datastore::fmt::parse_size("8k").unwrap(), 8192);
/// assert_eq!(datastore::fmt::parse_size("11m").unwrap(), 11 * 1024 * 1024);
/// assert_eq!(datastore::fmt::parse_size("3 G").unwrap(), 3 * 1024 * 1024 * 1024);
///
/// assert_eq!(datastore::fmt::parse_size("3 Y").is_err(), true);
/// assert_eq!(datastore::fmt::parse_size("1.2g").is_err(), true);
/// assert_eq!(datastore::fmt::parse_size("-1").is_err(), true);
/// ```
pub fn parse_size(str: impl AsRef<str>) -> anyhow::Result<usize> {
    lazy_static::lazy_static! {
        static ref SIZE: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *([bBkKmMgGtT]?) *$").unwrap();
    }

    let captures = SIZE.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a size. \
             Expected a positive number and optionally 'b', 'k', 'm', 'g' or 't' as suffix.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<usize>()?;
    let factor: usize = match &captures[2] {
        "k" | "K" => 1 << 10,
        "m" | "M" => 1 << 20,
        "g" | "G" => 1 << 30,
        "t" | "T" => 1 << 40,
        _ => 1,
    };

    number
        .checked_mul(factor)
        .ok_or_else(|| anyhow::anyhow!("The size '{}' is too large.", str.as_ref()))
}

/// Parses a duration from a given string.
///
/// This string can have the following suffixes:
/// * **ms**: treats the value as milliseconds (also used if no suffix is given)
/// * **s**: treats the value as seconds
/// * **m**: treats the value as minutes
/// * **h**: treats the value as hours
/// * **d**: treats the value as days
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(datastore::fmt::parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(datastore::fmt::parse_duration("250").unwrap(), Duration::from_millis(250));
/// assert_eq!(datastore::fmt::parse_duration("60s").unwrap(), Duration::from_secs(60));
/// assert_eq!(datastore::fmt::parse_duration("3 M").unwrap(), Duration::from_secs(3 * 60));
/// assert_eq!(datastore::fmt::parse_duration("2h").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(datastore::fmt::parse_duration("1d").unwrap(), Duration::from_secs(24 * 60 * 60));
///
/// assert_eq!(datastore::fmt::parse_duration("3 Y").is_err(), true);
/// assert_eq!(datastore::fmt::parse_duration("1.2s").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref DURATION: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *(ms|s|m|h|d|MS|S|M|H|D)? *$").unwrap();
    }

    let captures = DURATION.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as suffix.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<u64>()?;
    let unit = captures
        .get(2)
        .map(|unit| unit.as_str().to_lowercase())
        .unwrap_or_default();

    Ok(match unit.as_str() {
        "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number * 60),
        "h" => Duration::from_secs(number * 60 * 60),
        "d" => Duration::from_secs(number * 60 * 60 * 24),
        _ => Duration::from_millis(number),
    })
}

/// Parses a ratio which is either given as fraction (**0.9**) or as percentage (**90%**).
///
/// # Examples
///
/// ```
/// assert_eq!(datastore::fmt::parse_ratio("0.9").unwrap(), 0.9);
/// assert_eq!(datastore::fmt::parse_ratio("90%").unwrap(), 0.9);
/// assert_eq!(datastore::fmt::parse_ratio(" 10 % ").unwrap(), 0.1);
///
/// // Ratios have to be within 0..1...
/// assert_eq!(datastore::fmt::parse_ratio("1.5").is_err(), true);
/// assert_eq!(datastore::fmt::parse_ratio("-10%").is_err(), true);
/// ```
pub fn parse_ratio(str: impl AsRef<str>) -> anyhow::Result<f64> {
    let value = str.as_ref().trim();
    let ratio = match value.strip_suffix('%') {
        Some(percent) => percent.trim().parse::<f64>()? / 100.,
        None => value.parse::<f64>()?,
    };

    if (0. ..=1.).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(anyhow::anyhow!(
            "The ratio '{}' is not within 0 and 1 (or 0% and 100%).",
            value
        ))
    }
}

/// Formats a duration into a string like "5d 3h 17m 2s 12ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(datastore::fmt::format_duration(Duration::from_millis(0)), "0ms");
/// assert_eq!(datastore::fmt::format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(datastore::fmt::format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(datastore::fmt::format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(datastore::fmt::format_duration(Duration::from_secs(24 * 60 * 60 + 59)), "1d 59s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut result = String::new();
    let mut value = duration.as_millis();

    for (millis, unit) in DURATION_UNITS {
        let amount = value / millis;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            value %= millis;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}
