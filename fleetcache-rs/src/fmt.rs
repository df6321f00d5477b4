//! Provides formatting and parsing helpers for durations and byte sizes.
//!
//! The parsers are used to read the limits of a [Group](crate::group::Group) from the config,
//! the formatters are used by the diagnostic commands.
use std::fmt::Write;
use std::time::Duration;

use anyhow::anyhow;
use regex::Regex;

/// Formats a duration given in microseconds.
///
/// This picks the unit (microseconds, milliseconds or seconds) and the precision so that the
/// result remains concise. See [format_short_duration](format_short_duration) for examples.
pub fn format_micros(micros: u64, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    match micros {
        0..=999 => write!(f, "{} us", micros),
        1_000..=9_999 => write!(f, "{:.2} ms", micros as f64 / 1e3),
        10_000..=99_999 => write!(f, "{:.1} ms", micros as f64 / 1e3),
        100_000..=999_999 => write!(f, "{} ms", micros / 1_000),
        1_000_000..=9_999_999 => write!(f, "{:.2} s", micros as f64 / 1e6),
        10_000_000..=99_999_999 => write!(f, "{:.1} s", micros as f64 / 1e6),
        _ => write!(f, "{} s", micros / 1_000_000),
    }
}

/// Formats a duration given in microseconds and returns a String representation.
///
/// # Examples
///
/// ```
/// # use fleetcache::fmt::format_short_duration;
/// assert_eq!(format_short_duration(100), "100 us");
/// assert_eq!(format_short_duration(8_192), "8.19 ms");
/// assert_eq!(format_short_duration(32_768), "32.8 ms");
/// assert_eq!(format_short_duration(128_123), "128 ms");
/// assert_eq!(format_short_duration(1_128_123), "1.13 s");
/// assert_eq!(format_short_duration(101_000_000), "101 s");
/// ```
pub fn format_short_duration(micros: u64) -> String {
    let mut result = String::new();
    let _ = format_micros(micros, &mut result);
    result
}

/// Formats a given size in bytes using binary units.
///
/// # Examples
///
/// ```
/// # use fleetcache::fmt::format_size;
/// assert_eq!(format_size(0), "0 bytes");
/// assert_eq!(format_size(1), "1 byte");
/// assert_eq!(format_size(100), "100 bytes");
/// assert_eq!(format_size(8_734), "8.53 KiB");
/// assert_eq!(format_size(87_340), "85.3 KiB");
/// assert_eq!(format_size(873_400), "853 KiB");
/// assert_eq!(format_size(64 * 1024 * 1024), "64.0 MiB");
/// assert_eq!(format_size(8_734_000_000), "8.13 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

    match size_in_bytes {
        1 => "1 byte".to_owned(),
        0..=1023 => format!("{} bytes", size_in_bytes),
        _ => {
            let mut size = size_in_bytes as f64 / 1024.;
            let mut unit = 0;
            while size > 1024. && unit < UNITS.len() - 1 {
                size /= 1024.;
                unit += 1;
            }

            if size <= 10. {
                format!("{:.2} {}", size, UNITS[unit])
            } else if size <= 100. {
                format!("{:.1} {}", size, UNITS[unit])
            } else {
                format!("{:.0} {}", size, UNITS[unit])
            }
        }
    }
}

/// Parses a size in bytes like "64m" from the given string.
///
/// The suffixes **b**, **k**, **m**, **g** and **t** (in either case) are supported and scale
/// the value by powers of 1024.
///
/// # Examples
///
/// ```
/// # use fleetcache::fmt::parse_size;
/// assert_eq!(parse_size("0").unwrap(), 0);
/// assert_eq!(parse_size("100b").unwrap(), 100);
/// assert_eq!(parse_size("8k").unwrap(), 8192);
/// assert_eq!(parse_size("64 M").unwrap(), 64 * 1024 * 1024);
/// assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
///
/// assert_eq!(parse_size("3 Y").is_err(), true);
/// assert_eq!(parse_size("1.2g").is_err(), true);
/// assert_eq!(parse_size("-1").is_err(), true);
/// ```
pub fn parse_size(value: impl AsRef<str>) -> anyhow::Result<usize> {
    lazy_static::lazy_static! {
        static ref SIZE: Regex = Regex::new(r"^\s*(\d+)\s*([bBkKmMgGtT]?)\s*$").unwrap();
    }

    let value = value.as_ref();
    let captures = SIZE.captures(value).ok_or_else(|| {
        anyhow!(
            "Cannot parse '{}' as size. Expected a positive number with an optional suffix \
             (b, k, m, g, t).",
            value
        )
    })?;

    let number = captures[1].parse::<usize>()?;
    let exponent = match captures[2].to_ascii_lowercase().as_str() {
        "k" => 1,
        "m" => 2,
        "g" => 3,
        "t" => 4,
        _ => 0,
    };

    number
        .checked_mul(1024usize.pow(exponent))
        .ok_or_else(|| anyhow!("The size '{}' is too large.", value))
}

/// Parses a duration like "5s" or "250ms" from the given string.
///
/// A value without suffix is treated as milliseconds. Otherwise **ms**, **s**, **m**, **h**
/// and **d** (in either case) are supported.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use fleetcache::fmt::parse_duration;
/// assert_eq!(parse_duration("100").unwrap(), Duration::from_millis(100));
/// assert_eq!(parse_duration("250 ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
/// assert_eq!(parse_duration("3 M").unwrap(), Duration::from_secs(3 * 60));
/// assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(24 * 60 * 60));
///
/// assert_eq!(parse_duration("3 Y").is_err(), true);
/// assert_eq!(parse_duration("1.5s").is_err(), true);
/// assert_eq!(parse_duration("999999999999999999d").is_err(), true);
/// ```
pub fn parse_duration(value: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref DURATION: Regex =
            Regex::new(r"^\s*(\d+)\s*(ms|MS|[sSmMhHdD]?)\s*$").unwrap();
    }

    let value = value.as_ref();
    let captures = DURATION.captures(value).ok_or_else(|| {
        anyhow!(
            "Cannot parse '{}' as duration. Expected a positive number with an optional \
             suffix (ms, s, m, h, d).",
            value
        )
    })?;

    let number = captures[1].parse::<u64>()?;
    let seconds = match captures[2].to_ascii_lowercase().as_str() {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Ok(Duration::from_millis(number)),
    };

    number
        .checked_mul(seconds)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow!("The duration '{}' is too large.", value))
}

/// Formats a duration into a string like "1d 3h 17m 2s 12ms".
///
/// Units which are zero are omitted.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use fleetcache::fmt::format_duration;
/// assert_eq!(format_duration(Duration::ZERO), "0ms");
/// assert_eq!(format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(format_duration(Duration::from_secs(24 * 60 * 60 + 59)), "1d 59s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u128, &str); 5] = [
        (24 * 60 * 60 * 1000, "d"),
        (60 * 60 * 1000, "h"),
        (60 * 1000, "m"),
        (1000, "s"),
        (1, "ms"),
    ];

    let mut millis = duration.as_millis();
    if millis == 0 {
        return "0ms".to_owned();
    }

    let mut result = String::new();
    for (unit_millis, unit) in UNITS {
        let amount = millis / unit_millis;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            millis %= unit_millis;
        }
    }

    result
}
