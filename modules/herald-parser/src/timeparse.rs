use std::sync::LazyLock;

use chrono::Duration;
use regex::Regex;

static AGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(\d+)\s*(m|min|mins|minute|minutes|h|hr|hrs|hour|hours|d|day|days)\b\.?(?:\s*ago)?\s*$")
        .expect("valid regex")
});

/// Parse a relative age cell like `"3h ago"`, `"45m"` or `"2 days ago"`.
/// Units are minutes, hours or days; anything else is not an age.
pub fn parse_relative_age(token: &str) -> Option<Duration> {
    let caps = AGE_RE.captures(token)?;
    let magnitude: i64 = caps[1].parse().ok()?;
    let unit = caps[2].to_lowercase();
    let duration = match unit.as_str() {
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::minutes(magnitude),
        "h" | "hr" | "hrs" | "hour" | "hours" => Duration::hours(magnitude),
        "d" | "day" | "days" => Duration::days(magnitude),
        _ => return None,
    };
    Some(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_units() {
        assert_eq!(parse_relative_age("3h ago"), Some(Duration::hours(3)));
        assert_eq!(parse_relative_age("45m"), Some(Duration::minutes(45)));
        assert_eq!(parse_relative_age("2d ago"), Some(Duration::days(2)));
    }

    #[test]
    fn parses_long_units() {
        assert_eq!(parse_relative_age("1 hour ago"), Some(Duration::hours(1)));
        assert_eq!(parse_relative_age("10 minutes ago"), Some(Duration::minutes(10)));
    }

    #[test]
    fn rejects_non_ages() {
        assert_eq!(parse_relative_age("Caer Benowyc was captured"), None);
        assert_eq!(parse_relative_age("3w ago"), None);
        assert_eq!(parse_relative_age(""), None);
    }
}
