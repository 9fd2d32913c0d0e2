//! Human readable wall-clock budgets ("2h", "30 min", "1.5 days").

use crate::{Error, Result};

const MINUTES_PER_DAY: f64 = 1440.0;
const MINUTES_PER_HOUR: f64 = 60.0;
const SECONDS_PER_MINUTE: f64 = 60.0;

/// Parses a duration string into whole minutes, truncating toward zero.
///
/// The text must start with a decimal numeral (`[0-9]*.?[0-9]+`), optionally
/// followed by spaces and a unit. A missing unit means minutes. Signs are not
/// part of the grammar, so negative budgets are rejected as invalid.
pub fn parse_duration(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let (amount, rest) = split_numeral(trimmed).ok_or_else(|| Error::InvalidDuration {
        text: text.to_string(),
    })?;
    let unit = rest.trim().to_lowercase();
    let minutes = match unit.as_str() {
        "d" | "day" | "days" => amount * MINUTES_PER_DAY,
        "h" | "hour" | "hours" => amount * MINUTES_PER_HOUR,
        "" | "m" | "min" | "mins" | "minute" | "minutes" => amount,
        "s" | "sec" | "secs" | "second" | "seconds" => amount / SECONDS_PER_MINUTE,
        _ => return Err(Error::UnknownUnit { unit }),
    };
    Ok(minutes.trunc() as u64)
}

/// Splits a leading `[0-9]*.?[0-9]+` numeral off `s`.
fn split_numeral(s: &str) -> Option<(f64, &str)> {
    let bytes = s.as_bytes();
    let mut end = 0;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        if frac_end > frac_start {
            end = frac_end;
        }
    }
    if end == 0 {
        return None;
    }
    let amount = s[..end].parse::<f64>().ok()?;
    Some((amount, &s[end..]))
}
