//! ISO-8601 duration parsing.
//!
//! Supports the subset used by provider options: `PnDTnHnMnS` with
//! fractional seconds, e.g. `PT30S`, `PT0.05S`, `P1DT2H`. Years and months
//! are rejected since they have no fixed length.

use std::time::Duration;

use crate::error::{Error, Result};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Parses an ISO-8601 duration string into a [`Duration`].
pub fn parse_iso8601(input: &str) -> Result<Duration> {
    let bad = || Error::BadDuration(input.to_string());

    let rest = input.strip_prefix('P').ok_or_else(bad)?;
    if rest.is_empty() {
        return Err(bad());
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    if time_part == Some("") {
        return Err(bad());
    }

    let mut secs: u64 = 0;
    let mut nanos: u64 = 0;

    for (unit, value) in designators(date_part)? {
        let whole: u64 = value.parse().map_err(|_| bad())?;
        match unit {
            'D' => secs += whole * 86_400,
            'W' => secs += whole * 7 * 86_400,
            _ => return Err(bad()),
        }
    }

    if let Some(time) = time_part {
        for (unit, value) in designators(time)? {
            match unit {
                'H' => secs += value.parse::<u64>().map_err(|_| bad())? * 3600,
                'M' => secs += value.parse::<u64>().map_err(|_| bad())? * 60,
                'S' => {
                    let (s, n) = parse_seconds(value).ok_or_else(bad)?;
                    secs += s;
                    nanos += n;
                }
                _ => return Err(bad()),
            }
        }
    }

    secs += nanos / NANOS_PER_SEC;
    nanos %= NANOS_PER_SEC;
    Ok(Duration::new(secs, nanos as u32))
}

/// Formats a [`Duration`] as an ISO-8601 duration (always `PT...S`).
pub fn format_iso8601(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("PT{}S", d.as_secs())
    } else {
        let frac = format!("{:.9}", d.as_secs_f64());
        format!("PT{}S", frac.trim_end_matches('0'))
    }
}

/// Splits `5H30M2S` into `[('H', "5"), ('M', "30"), ('S', "2")]`.
fn designators(part: &str) -> Result<Vec<(char, &str)>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in part.char_indices() {
        if c.is_ascii_alphabetic() {
            if i == start {
                return Err(Error::BadDuration(part.to_string()));
            }
            out.push((c, &part[start..i]));
            start = i + c.len_utf8();
        }
    }
    if start != part.len() {
        // trailing digits with no designator
        return Err(Error::BadDuration(part.to_string()));
    }
    Ok(out)
}

fn parse_seconds(value: &str) -> Option<(u64, u64)> {
    match value.split_once('.') {
        None => Some((value.parse().ok()?, 0)),
        Some((whole, frac)) => {
            if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let mut nanos: u64 = frac.parse().ok()?;
            nanos *= 10u64.pow(9 - frac.len() as u32);
            Some((whole.parse().ok()?, nanos))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("PT30S", 30_000; "plain seconds")]
    #[test_case("PT0.05S", 50; "fractional seconds")]
    #[test_case("PT1M30S", 90_000; "minutes and seconds")]
    #[test_case("PT2H", 7_200_000; "hours")]
    #[test_case("P1DT2H", 93_600_000; "days and hours")]
    #[test_case("P2W", 1_209_600_000; "weeks")]
    fn parses(input: &str, millis: u64) {
        assert_eq!(parse_iso8601(input).unwrap(), Duration::from_millis(millis));
    }

    #[test_case(""; "empty")]
    #[test_case("30S"; "missing P")]
    #[test_case("PT"; "empty time part")]
    #[test_case("P1Y"; "years rejected")]
    #[test_case("PT5"; "no designator")]
    #[test_case("PTS"; "no digits")]
    fn rejects(input: &str) {
        assert!(parse_iso8601(input).is_err());
    }

    #[test]
    fn round_trip() {
        for s in ["PT30S", "PT90S", "PT0.5S"] {
            let d = parse_iso8601(s).unwrap();
            assert_eq!(parse_iso8601(&format_iso8601(d)).unwrap(), d);
        }
    }
}
