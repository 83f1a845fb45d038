//! Bucket width selection.

use super::AggregateError;

/// Widths tried, smallest first, when the caller gives no group.
pub const DEFAULT_LADDER: [i64; 11] = [
    60,      // 1m
    300,     // 5m
    900,     // 15m
    1800,    // 30m
    3600,    // 1h
    7200,    // 2h
    10800,   // 3h
    21600,   // 6h
    43200,   // 12h
    86400,   // 24h
    604800,  // 7d
];

/// Most buckets the default policy will produce for a window.
pub const MAX_DEFAULT_BUCKETS: i64 = 200;

/// Largest width a caller may request.
const MAX_GROUP_SECONDS: i64 = 366 * 86400;

/// Parse a symbolic group such as `15m`, `1h`, `24h` or `day` into seconds.
pub fn parse_group(group: &str) -> Result<i64, AggregateError> {
    let token = group.trim().to_ascii_lowercase();
    let invalid = || AggregateError::InvalidGroup(group.to_string());

    let named = match token.as_str() {
        "minute" => Some(60),
        "hour" => Some(3600),
        "day" => Some(86400),
        "week" => Some(604800),
        _ => None,
    };
    if let Some(secs) = named {
        return Ok(secs);
    }

    let split = token
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (digits, unit) = token.split_at(split);
    let n: i64 = digits.parse().map_err(|_| invalid())?;

    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 604800,
        _ => return Err(invalid()),
    };

    match n.checked_mul(unit_secs) {
        Some(secs) if secs > 0 && secs <= MAX_GROUP_SECONDS => Ok(secs),
        _ => Err(invalid()),
    }
}

/// Pick a width for a window when the caller gave none.
///
/// Smallest ladder entry that keeps the aligned series within
/// [`MAX_DEFAULT_BUCKETS`]; alignment can add one bucket, hence the `- 1`.
pub fn default_width(window_seconds: i64) -> i64 {
    let window_seconds = window_seconds.max(0);
    DEFAULT_LADDER
        .iter()
        .copied()
        .find(|width| window_seconds <= width * (MAX_DEFAULT_BUCKETS - 1))
        .unwrap_or(DEFAULT_LADDER[DEFAULT_LADDER.len() - 1])
}
