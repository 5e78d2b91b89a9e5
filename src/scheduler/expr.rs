//! 5-field `MIN HOUR DOM MON DOW` cron expression support, plus the
//! `@hourly`/`@daily`/`@weekly`/`@monthly`/`@yearly` shortcuts (§4.10).
//!
//! The `cron` crate parses 6/7-field expressions (`SEC MIN HOUR DOM
//! MON DOW [YEAR]`) with named months/weekdays, ranges, steps, and
//! lists already built in, so normalization only needs to prepend a
//! `"0 "` seconds field — the same trick `tools/cron.rs` uses for
//! input validation.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

/// Normalizes `expr` to the 6-field form the `cron` crate parses,
/// validating it in the process. Accepts a literal 5-field expression
/// or one of the named shortcuts.
pub fn normalize(expr: &str) -> Result<String, String> {
    let normalized = match expr.trim() {
        "@hourly" => "0 0 * * * *".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@weekly" => "0 0 0 * * SUN".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        other => {
            let fields: Vec<&str> = other.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(format!(
                    "cron expression must have 5 fields (MIN HOUR DOM MON DOW), got {}",
                    fields.len()
                ));
            }
            format!("0 {other}")
        }
    };
    Schedule::from_str(&normalized)
        .map(|_| ())
        .map_err(|e| format!("invalid cron expression: {e}"))?;
    Ok(normalized)
}

/// The least fire time ≥ `now_ms` satisfying every field, or `None`
/// if the expression is malformed or can never fire again.
///
/// `Schedule::after` is exclusive, so querying at `now_ms - 1`
/// recovers the `≥ now` semantics the invariant requires without
/// ever returning a time in the past (expressions are second-grained,
/// so no fire instant can fall strictly between `now_ms - 1` and
/// `now_ms`).
pub fn next_fire_after(expr: &str, now_ms: i64) -> Option<i64> {
    let normalized = normalize(expr).ok()?;
    let schedule = Schedule::from_str(&normalized).ok()?;
    let anchor: DateTime<Utc> = DateTime::from_timestamp_millis(now_ms - 1)?;
    schedule.after(&anchor).next().map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_five_field_expression() {
        assert!(normalize("0 9 * * MON").is_ok());
    }

    #[test]
    fn accepts_named_shortcuts() {
        for shortcut in ["@hourly", "@daily", "@weekly", "@monthly", "@yearly"] {
            assert!(normalize(shortcut).is_ok(), "{shortcut} should parse");
        }
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(normalize("* * *").is_err());
        assert!(normalize("0 9 * * MON *").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(normalize("not a cron expr at all").is_err());
    }

    #[test]
    fn next_fire_is_never_before_now() {
        // "every minute" — next fire must land on a whole-minute boundary ≥ now.
        let now_ms = 1_700_000_030_000; // 30s past some minute
        let next = next_fire_after("* * * * *", now_ms).expect("parses");
        assert!(next >= now_ms);
        assert_eq!(next % 60_000, 0);
    }

    #[test]
    fn next_fire_can_equal_now_at_exact_boundary() {
        let now_ms = 1_700_000_000_000; // assume this lands on a minute boundary
        if now_ms % 60_000 == 0 {
            let next = next_fire_after("* * * * *", now_ms).expect("parses");
            assert_eq!(next, now_ms);
        }
    }

    #[test]
    fn supports_steps_ranges_and_lists() {
        assert!(normalize("*/15 9-17 * * mon,wed,fri").is_ok());
    }
}
