use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};

/// Parses a CRM date value or a human-entered filter date into a UTC instant.
///
/// Supported formats:
/// - Relative: "-7d", "+2w", "-24h", "-30m"
/// - Keywords: "now", "today", "yesterday", "tomorrow"
/// - ISO dates: "2025-06-01", "2025-06-01T14:30:00Z"
/// - Date formats: "YYYY-MM-DD", "YYYY/MM/DD", "MM/DD/YYYY", "MM-DD-YYYY"
/// - Unix timestamp: seconds (if < 10^11) or milliseconds
///
/// Calendar dates resolve to UTC midnight.
pub fn parse_date_input(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim().to_lowercase();
    if input.is_empty() {
        return None;
    }

    let now_utc = Utc::now();

    // Relative: -7d, +2w, -24h, -30m
    if let Some((sign, stripped)) = input
        .strip_prefix('-')
        .map(|s| (-1, s))
        .or_else(|| input.strip_prefix('+').map(|s| (1, s)))
    {
        let val_str: String = stripped.chars().take_while(|c| c.is_numeric()).collect();
        if let Ok(val) = val_str.parse::<i64>() {
            let unit = stripped.trim_start_matches(&val_str).trim();
            let val = val * sign;
            // Out-of-range offsets are unparseable, not a panic.
            let duration = match unit {
                "d" | "day" | "days" => TimeDelta::try_days(val),
                "h" | "hr" | "hrs" | "hour" | "hours" => TimeDelta::try_hours(val),
                "m" | "min" | "mins" | "minute" | "minutes" => TimeDelta::try_minutes(val),
                "w" | "wk" | "wks" | "week" | "weeks" => TimeDelta::try_weeks(val),
                _ => return None,
            };
            return now_utc.checked_add_signed(duration?);
        }
    }

    // Keywords
    let today = now_utc.date_naive();
    match input.as_str() {
        "now" => return Some(now_utc),
        "today" => return utc_midnight(today),
        "yesterday" => return utc_midnight(today.pred_opt()?),
        "tomorrow" => return utc_midnight(today.succ_opt()?),
        _ => {}
    }

    // ISO date formats (RFC3339)
    if let Ok(dt) = DateTime::parse_from_rfc3339(&input) {
        return Some(dt.with_timezone(&Utc));
    }

    // YYYY-MM-DD or YYYY/MM/DD
    if let Ok(date) = NaiveDate::parse_from_str(&input, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&input, "%Y/%m/%d"))
    {
        return utc_midnight(date);
    }

    // US Formats: MM/DD/YYYY or MM-DD-YYYY
    if let Ok(date) = NaiveDate::parse_from_str(&input, "%m/%d/%Y")
        .or_else(|_| NaiveDate::parse_from_str(&input, "%m-%d-%Y"))
    {
        return utc_midnight(date);
    }

    // Numeric fallback (ms or seconds)
    if let Ok(n) = input.parse::<i64>() {
        return from_epoch(n);
    }

    None
}

/// Interprets an epoch number as seconds below 10^11, milliseconds otherwise.
pub fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    // Heuristic: timestamps < 10^11 (year 5138) are likely seconds.
    if n.abs() < 100_000_000_000 {
        return DateTime::from_timestamp(n, 0);
    }
    DateTime::from_timestamp_millis(n)
}

fn utc_midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    let dt = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_calendar_date(input: &str) -> Option<NaiveDate> {
        parse_date_input(input).map(|dt| dt.date_naive())
    }

    #[test]
    fn test_relative_time() {
        let now = Utc::now().timestamp_millis();
        let tolerance = 60 * 1000; // 1 minute

        let t1 = parse_date_input("-1h").unwrap().timestamp_millis();
        assert!(((now - t1) - 3600 * 1000).abs() < tolerance);

        let t2 = parse_date_input("+1d").unwrap().timestamp_millis();
        assert!(((t2 - now) - 86400 * 1000).abs() < tolerance);

        assert!(parse_date_input("-3x").is_none());
    }

    #[test]
    fn test_keywords() {
        assert!(parse_date_input("now").is_some());
        let today = parse_date_input("today").unwrap();
        let yesterday = parse_date_input("yesterday").unwrap();
        let tomorrow = parse_date_input("Tomorrow").unwrap();
        assert_eq!((today - yesterday).num_days(), 1);
        assert_eq!((tomorrow - today).num_days(), 1);
    }

    #[test]
    fn test_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert_eq!(parse_calendar_date("2025-06-01"), Some(expected));
        assert_eq!(parse_calendar_date("2025/06/01"), Some(expected));
        assert_eq!(parse_calendar_date("06/01/2025"), Some(expected));
        assert_eq!(parse_calendar_date("06-01-2025"), Some(expected));
        assert_eq!(
            parse_calendar_date("2025-06-01T23:59:59Z"),
            Some(expected),
            "time of day is dropped"
        );
    }

    #[test]
    fn test_numeric() {
        let secs = parse_date_input("1700000000").unwrap();
        let ms = parse_date_input("1700000000000").unwrap();
        assert_eq!(secs, ms);
        assert_eq!(ms.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_out_of_range_offsets_are_none() {
        assert!(parse_date_input("+999999999d").is_none());
        assert!(parse_date_input("-999999999999w").is_none());
        assert!(parse_date_input("+9223372036854775807m").is_none());
        assert!(parse_date_input("+36500d").is_some());
    }

    #[test]
    fn test_garbage_is_none() {
        assert!(parse_date_input("").is_none());
        assert!(parse_date_input("next spring").is_none());
    }
}
