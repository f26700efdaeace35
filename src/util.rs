//! Small text and calendar helpers shared across the pipeline.

use chrono::{Datelike, Duration, NaiveDate};

/// Truncate a string to `max` characters, appending "…" if truncated.
/// Handles multi-byte (CJK) correctly via char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}…")
    }
}

/// Rebuild a string as valid UTF-8 content suitable for the raw log:
/// drops control characters (except newline/tab) and collapses runs of
/// ASCII spaces. Input is already `&str` so byte-level corruption cannot
/// occur here; this guards against pasted control garbage.
pub fn sanitize_text(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }

    let mut cleaned = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_control() && c != '\n' && c != '\t' {
            continue;
        }
        cleaned.push(c);
    }

    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return String::new();
    }

    let mut out = String::with_capacity(cleaned.len());
    let mut prev_space = false;
    for c in cleaned.chars() {
        if c == ' ' {
            if prev_space {
                continue;
            }
            prev_space = true;
        } else {
            prev_space = false;
        }
        out.push(c);
    }
    out
}

/// Monday..Sunday range containing `d`.
pub fn week_range(d: NaiveDate) -> (NaiveDate, NaiveDate) {
    let offset = d.weekday().num_days_from_monday() as i64;
    let start = d - Duration::days(offset);
    (start, start + Duration::days(6))
}

/// First..last day of the month containing `d`.
pub fn month_range(d: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = NaiveDate::from_ymd_opt(d.year(), d.month(), 1).unwrap_or(d);
    let next = if d.month() == 12 {
        NaiveDate::from_ymd_opt(d.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(d.year(), d.month() + 1, 1)
    };
    let end = next.map(|n| n - Duration::days(1)).unwrap_or(start);
    (start, end)
}

/// ISO week key for a date: `YYYY-Www` (zero padded).
pub fn iso_week_key(d: NaiveDate) -> String {
    let iso = d.iso_week();
    format!("{:04}-W{:02}", iso.year(), iso.week())
}

/// Parse a `YYYY-Www` key back to (iso_year, iso_week).
pub fn parse_week_key(key: &str) -> Option<(i32, u32)> {
    let (y, w) = key.split_once("-W")?;
    Some((y.parse().ok()?, w.parse().ok()?))
}

/// First date belonging to the given ISO (year, week). Walks from Jan 4,
/// which by definition always falls in week 1.
pub fn iso_week_start(year: i32, week: u32) -> Option<NaiveDate> {
    let mut d = NaiveDate::from_ymd_opt(year, 1, 4)?;
    for _ in 0..400 {
        let iso = d.iso_week();
        if iso.year() == year && iso.week() == week {
            return Some(week_range(d).0);
        }
        d += Duration::days(1);
    }
    None
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Parse a `YYYY-MM` month key.
pub fn parse_month_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{}-01", key.trim()), "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_handles_cjk() {
        assert_eq!(truncate_chars("你好世界", 2), "你好…");
        assert_eq!(truncate_chars("ab", 5), "ab");
    }

    #[test]
    fn sanitize_strips_controls_and_collapses_spaces() {
        assert_eq!(sanitize_text("a\u{0}b   c"), "ab c");
        assert_eq!(sanitize_text("  line1\n line2 "), "line1\n line2");
        assert_eq!(sanitize_text("\u{1b}[31m"), "[31m");
    }

    #[test]
    fn week_range_is_monday_to_sunday() {
        // 2026-01-07 is a Wednesday
        let d = NaiveDate::from_ymd_opt(2026, 1, 7).unwrap();
        let (start, end) = week_range(d);
        assert_eq!(start, NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2026, 1, 11).unwrap());
    }

    #[test]
    fn month_range_handles_december() {
        let d = NaiveDate::from_ymd_opt(2025, 12, 15).unwrap();
        let (start, end) = month_range(d);
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 12, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2025, 12, 31).unwrap());
    }

    #[test]
    fn week_key_round_trip() {
        let d = NaiveDate::from_ymd_opt(2026, 1, 7).unwrap();
        let key = iso_week_key(d);
        assert_eq!(key, "2026-W02");
        let (y, w) = parse_week_key(&key).unwrap();
        let start = iso_week_start(y, w).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());
    }

    #[test]
    fn week_key_year_boundary() {
        // 2024-12-30 belongs to ISO 2025-W01
        let d = NaiveDate::from_ymd_opt(2024, 12, 30).unwrap();
        assert_eq!(iso_week_key(d), "2025-W01");
    }
}
