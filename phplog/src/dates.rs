/// Timestamps found in web server and PHP error logs.
///
/// There is no single format here.  Apache, nginx and PHP-FPM all write their own, and some of them
/// change the format between versions, so the parser is permissive: the text is whitespace-normalized
/// and tried against a short list of known layouts.  Anything that does not parse is "unknown", and
/// the caller decides what that means (for the time window, it means "in the window").
///
/// Times without a zone are local time, as that is what the servers write.
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

pub type Timestamp = DateTime<Utc>;

/// The time right now.

pub fn now() -> Timestamp {
    Utc::now()
}

// Layouts for naive (zone-less) timestamps, most common first.  `%.f` accepts an empty fraction,
// so the Apache 2.4 and the Apache 2.2 layouts are the same pattern.
const NAIVE_FORMATS: [&str; 5] = [
    "%a %b %d %H:%M:%S%.f %Y", // Apache: Tue Oct 19 10:00:00.123456 2010
    "%d-%b-%Y %H:%M:%S",       // PHP: 19-Oct-2010 10:00:00
    "%Y-%m-%d %H:%M:%S%.f",    // ISO-ish: 2010-10-19 10:00:00
    "%Y-%m-%dT%H:%M:%S%.f",    // ISO without zone
    "%Y/%m/%d %H:%M:%S",       // nginx: 2010/10/19 10:00:00
];

/// Parse a timestamp in any of the formats we know about, returning None if it can't be parsed.

pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    let s = s.split_whitespace().collect::<Vec<&str>>().join(" ");
    if s.is_empty() {
        return None;
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(&s) {
        return Some(t.with_timezone(&Utc));
    }

    // PHP appends the name of its configured zone.  Only UTC is unambiguous; for anything else
    // assume the zone is the local one.
    let (text, utc) = match s.rsplit_once(' ') {
        Some((head, zone)) if zone.chars().all(|c| c.is_ascii_alphabetic() || c == '/' || c == '_')
            && zone.chars().any(|c| c == '/' || c.is_ascii_uppercase())
            && !is_day_or_month_name(zone) =>
        {
            (head.to_string(), zone == "UTC" || zone == "GMT")
        }
        _ => (s, false),
    };

    for fmt in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(&text, fmt) {
            return if utc {
                Some(Utc.from_utc_datetime(&t))
            } else {
                Local
                    .from_local_datetime(&t)
                    .earliest()
                    .map(|lt| lt.with_timezone(&Utc))
            };
        }
    }
    None
}

// Zone names are all letters, but so are the month and day names in some layouts; a zone
// never is one of those.
fn is_day_or_month_name(s: &str) -> bool {
    const NAMES: [&str; 19] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec", "Mon",
        "Tue", "Wed", "Thu", "Fri", "Sat", "Sun",
    ];
    NAMES.contains(&s)
}

/// Format a timestamp as local time, for humans.

pub fn format_local(t: Timestamp) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
use chrono::{Datelike, Timelike};

#[cfg(test)]
fn local_parts(t: Timestamp) -> (i32, u32, u32, u32, u32, u32) {
    let l = t.with_timezone(&Local);
    (l.year(), l.month(), l.day(), l.hour(), l.minute(), l.second())
}

#[test]
fn test_parse_apache() {
    let t = parse_timestamp("Tue Oct 19 10:11:12 2010").unwrap();
    assert_eq!(local_parts(t), (2010, 10, 19, 10, 11, 12));
    let t = parse_timestamp("Tue Oct 19 10:11:12.345678 2010").unwrap();
    assert_eq!(local_parts(t), (2010, 10, 19, 10, 11, 12));
    // Single-digit day with the double space Apache uses for padding
    let t = parse_timestamp("Sat Oct  9 10:11:12 2010").unwrap();
    assert_eq!(local_parts(t), (2010, 10, 9, 10, 11, 12));
}

#[test]
fn test_parse_php() {
    let t = parse_timestamp("19-Oct-2010 10:11:12").unwrap();
    assert_eq!(local_parts(t), (2010, 10, 19, 10, 11, 12));
    let t = parse_timestamp("19-Oct-2010 10:11:12 Europe/Oslo").unwrap();
    assert_eq!(local_parts(t), (2010, 10, 19, 10, 11, 12));
    let t = parse_timestamp("19-Oct-2010 10:11:12 UTC").unwrap();
    assert_eq!(t, Utc.with_ymd_and_hms(2010, 10, 19, 10, 11, 12).unwrap());
}

#[test]
fn test_parse_iso() {
    let t = parse_timestamp("2010-10-19T10:11:12+02:00").unwrap();
    assert_eq!(t, Utc.with_ymd_and_hms(2010, 10, 19, 8, 11, 12).unwrap());
    let t = parse_timestamp("2010-10-19 10:11:12").unwrap();
    assert_eq!(local_parts(t), (2010, 10, 19, 10, 11, 12));
    let t = parse_timestamp("2010/10/19 10:11:12").unwrap();
    assert_eq!(local_parts(t), (2010, 10, 19, 10, 11, 12));
}

#[test]
fn test_parse_garbage() {
    assert!(parse_timestamp("").is_none());
    assert!(parse_timestamp("error").is_none());
    assert!(parse_timestamp("php7:notice").is_none());
    assert!(parse_timestamp("Tue Oct 99 10:11:12 2010").is_none());
}
