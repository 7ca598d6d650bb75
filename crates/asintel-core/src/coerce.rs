//! Lenient text → value coercion for scraped and legacy fields.
//!
//! Every function returns `None` instead of failing: a value that cannot be
//! read is a missing observation, never a fatal error.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

const HIDDEN_PRICE_MARKERS: &[&str] = &["price hidden", "see price", "click to see price"];

/// A price is hidden when the page showed nothing or a placeholder instead of an amount.
pub fn price_is_hidden(raw: Option<&str>) -> bool {
    let text = raw.unwrap_or_default().trim().to_ascii_lowercase();
    text.is_empty() || HIDDEN_PRICE_MARKERS.iter().any(|m| text.contains(m))
}

/// Strips currency symbols and thousands separators. A lone comma followed by
/// exactly two digits is read as a decimal comma (`"12,99 €"`).
pub fn parse_price(raw: &str) -> Option<f64> {
    if price_is_hidden(Some(raw)) {
        return None;
    }
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    let normalized = match (kept.matches(',').count(), kept.contains('.')) {
        (1, false) if kept.split(',').nth(1).is_some_and(|frac| frac.len() == 2) => {
            kept.replace(',', ".")
        }
        _ => kept.replace(',', ""),
    };
    let value = normalized.parse::<f64>().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// First decimal number in free text: `"4.5 out of 5 stars"` → `4.5`.
pub fn first_number(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == ',' && !current.is_empty() {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    current.trim_end_matches('.').parse::<f64>().ok()
}

/// Integer counts such as `"1,234 global ratings"` or `"#52 in Kitchen"`.
/// A text that opens with the word "one" (`"One person found this helpful"`)
/// counts as 1.
pub fn parse_count(text: &str) -> Option<u64> {
    let lead = text.split_whitespace().next().unwrap_or_default();
    if lead.eq_ignore_ascii_case("one") {
        return Some(1);
    }
    let n = first_number(text)?;
    (n >= 0.0 && n.fract() == 0.0).then_some(n as u64)
}

/// Product star rating in `[0, 5]`.
pub fn parse_star_rating(text: &str) -> Option<f64> {
    first_number(text).filter(|r| (0.0..=5.0).contains(r))
}

/// Review star rating: an integral value in `1..=5`.
pub fn review_stars(value: f64) -> Option<u8> {
    (value.fract() == 0.0 && (1.0..=5.0).contains(&value)).then_some(value as u8)
}

/// Accepts ISO dates, timestamps and review headers such as
/// `"Reviewed in the United States on January 3, 2025"`.
pub fn parse_review_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(ts) = parse_timestamp(text) {
        return Some(ts.date_naive());
    }
    let tail = text.rsplit_once(" on ").map(|(_, t)| t).unwrap_or(text).trim();
    for fmt in ["%Y-%m-%d", "%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%d.%m.%Y", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(tail, fmt) {
            return Some(date);
        }
    }
    None
}

/// RFC 3339, or a naive `YYYY-MM-DD[T ]HH:MM:SS` taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y%m%d_%H%M%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_prices_are_hidden_and_missing() {
        assert!(price_is_hidden(Some("Click to see price")));
        assert!(price_is_hidden(Some("  ")));
        assert!(price_is_hidden(None));
        assert_eq!(parse_price("Click to see price"), None);
        assert_eq!(parse_price("See price in cart"), None);
    }

    #[test]
    fn prices_are_sanitized() {
        assert_eq!(parse_price("$1,299.00"), Some(1299.0));
        assert_eq!(parse_price("12,99 €"), Some(12.99));
        assert_eq!(parse_price("US$38"), Some(38.0));
        assert_eq!(parse_price("currently unavailable"), None);
        assert!(!price_is_hidden(Some("$38.00")));
    }

    #[test]
    fn counts_and_ratings_come_from_site_text() {
        assert_eq!(parse_count("1,234 global ratings"), Some(1234));
        assert_eq!(parse_count("#52 in Kitchen & Dining"), Some(52));
        assert_eq!(parse_count("One person found this helpful"), Some(1));
        assert_eq!(parse_count("one person found this helpful"), Some(1));
        assert_eq!(parse_count("Someone found this helpful"), None);
        assert_eq!(parse_star_rating("4.5 out of 5 stars"), Some(4.5));
        assert_eq!(parse_star_rating("12 stars"), None);
        assert_eq!(review_stars(4.0), Some(4));
        assert_eq!(review_stars(4.5), None);
        assert_eq!(review_stars(0.0), None);
    }

    #[test]
    fn review_dates_accept_site_headers() {
        let expected = NaiveDate::from_ymd_opt(2025, 1, 3);
        assert_eq!(
            parse_review_date("Reviewed in the United States on January 3, 2025"),
            expected
        );
        assert_eq!(parse_review_date("2025-01-03"), expected);
        assert_eq!(parse_review_date("2025-01-03T10:00:00Z"), expected);
        assert_eq!(parse_review_date("yesterday"), None);
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let ts = parse_timestamp("2025-10-13T12:00:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-10-13T12:00:00+00:00");
        assert!(parse_timestamp("20251013_120000").is_some());
    }
}
