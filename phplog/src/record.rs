/// Parser for `phptop` samples embedded in error log lines.
///
/// The instrumentation hook writes one line per request through the host's ordinary error logging,
/// so the sample arrives wrapped in whatever the web server or PHP-FPM puts around it:
///
///   [Tue Oct 19 10:00:00.123 2010] [php:notice] [pid 42] [client 1.2.3.4:5] phptop http://h/x time:0.5 user:0.4 sys:0.1 mem:1048576, referer: http://h/
///
/// We look for the marker word followed by the request identifier and a sequence of `key:value`
/// pairs.  A leading bracketed timestamp is picked up if present.
///
/// Lines without the marker are the common case (ordinary error log noise) and are skipped without
/// comment.  Lines with the marker that don't look right are "bogus" and are reported as such; the
/// caller decides what happens to any state already accumulated for that identifier.
use crate::dates::{parse_timestamp, Timestamp};

use anyhow::Result;
use regex::Regex;
use std::str::FromStr;
use ustr::Ustr;

pub const DEFAULT_MARKER: &str = "phptop";

/// Fewer pairs than this means the line was cut short somewhere.
pub const MIN_PAIRS: usize = 4;

/// The metrics a sample can carry.  Each is optional; a sample that lacks one simply doesn't
/// contribute to it.

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Metrics {
    /// Wall time, seconds
    pub time: Option<f64>,

    /// User CPU time, seconds
    pub user: Option<f64>,

    /// System CPU time, seconds
    pub sys: Option<f64>,

    /// Peak memory, bytes
    pub mem: Option<f64>,
}

/// One validated sample.  Not retained past aggregation.

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub ident: Ustr,
    pub timestamp: Option<Timestamp>,
    pub metrics: Metrics,
}

/// Why a marked line was rejected.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bogosity {
    /// Fewer than MIN_PAIRS pairs.
    Truncated,

    /// A pair without a key or with a non-numeric value.
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// Not a sample line at all.
    Skip,

    /// A sample line that failed validation.
    Bogus {
        ident: Ustr,
        timestamp: Option<Timestamp>,
        why: Bogosity,
    },

    Record(MetricRecord),
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// The word that introduces a sample.
    pub marker: String,

    /// Keep the query string as part of the identifier.
    pub full_query: bool,

    /// Remove scheme and host from the identifier, leaving the path.
    pub path_only: bool,
}

impl Default for ParseOptions {
    fn default() -> ParseOptions {
        ParseOptions {
            marker: DEFAULT_MARKER.to_string(),
            full_query: false,
            path_only: false,
        }
    }
}

pub struct RecordParser {
    opts: ParseOptions,
    marker_re: Regex,
}

impl RecordParser {
    pub fn new(opts: ParseOptions) -> Result<RecordParser> {
        let marker_re = Regex::new(&format!(r"\b{}\s+(\S+)(.*)$", regex::escape(&opts.marker)))?;
        Ok(RecordParser { opts, marker_re })
    }

    pub fn parse(&self, line: &str) -> Parsed {
        let Some(caps) = self.marker_re.captures(line) else {
            return Parsed::Skip;
        };
        // Both groups always participate when the regex matches.
        let raw_ident = caps
            .get(1)
            .map(|m| m.as_str().trim_end_matches('"'))
            .unwrap_or("");
        let mut rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");

        let ident = Ustr::from(&normalize_identifier(raw_ident, &self.opts));
        let timestamp = leading_timestamp(line);

        // Apache appends the referer, nginx the client and request, and both nginx and PHP-FPM
        // quote what the script wrote to stderr.
        for stop in ["\"", ", referer", ", client:"] {
            if let Some(p) = rest.find(stop) {
                rest = &rest[..p];
            }
        }

        // Some locales print the decimal separator as a comma.
        let rest = rest.replace(',', ".");

        let pairs = rest.split_whitespace().collect::<Vec<&str>>();
        if pairs.len() < MIN_PAIRS {
            return Parsed::Bogus {
                ident,
                timestamp,
                why: Bogosity::Truncated,
            };
        }

        let mut metrics = Metrics::default();
        for pair in pairs {
            let value = match pair.split_once(':') {
                Some((key, val)) if !key.is_empty() && is_number(val) => {
                    match f64::from_str(val) {
                        Ok(v) => Some((key, v)),
                        Err(_) => None,
                    }
                }
                _ => None,
            };
            match value {
                Some(("time", v)) => add(&mut metrics.time, v),
                Some(("user", v)) => add(&mut metrics.user, v),
                Some(("sys", v)) => add(&mut metrics.sys, v),
                Some(("mem", v)) => add(&mut metrics.mem, v),
                Some((key, _)) => {
                    tracing::trace!(key, "ignoring unknown metric");
                }
                None => {
                    return Parsed::Bogus {
                        ident,
                        timestamp,
                        why: Bogosity::Malformed,
                    };
                }
            }
        }

        Parsed::Record(MetricRecord {
            ident,
            timestamp,
            metrics,
        })
    }
}

fn add(slot: &mut Option<f64>, v: f64) {
    *slot = Some(slot.unwrap_or(0.0) + v);
}

// Digits with at most one decimal point, and at least one digit.
fn is_number(s: &str) -> bool {
    let mut digits = 0;
    let mut points = 0;
    for c in s.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => points += 1,
            _ => return false,
        }
    }
    digits > 0 && points <= 1
}

/// The timestamp at the start of the line, if any and if it parses.  Apache and PHP put it in
/// brackets; nginx writes it bare, as the first two words.

pub fn leading_timestamp(line: &str) -> Option<Timestamp> {
    if let Some(inner) = line.strip_prefix('[') {
        let end = inner.find(']')?;
        return parse_timestamp(&inner[..end]);
    }
    if !line.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let mut words = line.split_whitespace();
    let first = words.next()?;
    match words.next() {
        Some(second) => {
            parse_timestamp(&format!("{first} {second}")).or_else(|| parse_timestamp(first))
        }
        None => parse_timestamp(first),
    }
}

/// Normalize a request identifier so that equivalent requests aggregate together:
///
/// - unless `full_query`, drop the query string
/// - if `path_only`, drop `scheme://host`
/// - `.../index.xyz` becomes `.../`
/// - a run of trailing slashes becomes a single slash

pub fn normalize_identifier(ident: &str, opts: &ParseOptions) -> String {
    let (mut path, query) = match ident.find('?') {
        Some(q) if opts.full_query => (&ident[..q], &ident[q..]),
        Some(q) => (&ident[..q], ""),
        None => (ident, ""),
    };

    if opts.path_only {
        if let Some(p) = path.find("://") {
            let after = &path[p + 3..];
            path = match after.find('/') {
                Some(slash) => &after[slash..],
                None => "/",
            };
        }
    }

    let mut path = path.to_string();
    if let Some(slash) = path.rfind('/') {
        let last = &path[slash + 1..];
        if last.starts_with("index.") && last.len() > "index.".len() {
            path.truncate(slash + 1);
        }
    }
    if path.ends_with("//") {
        let trimmed = path.trim_end_matches('/').len();
        path.truncate(trimmed + 1);
    }

    path + query
}

#[cfg(test)]
fn parser() -> RecordParser {
    RecordParser::new(ParseOptions::default()).unwrap()
}

#[cfg(test)]
fn path_opts(full_query: bool, path_only: bool) -> ParseOptions {
    ParseOptions {
        full_query,
        path_only,
        ..ParseOptions::default()
    }
}

#[test]
fn test_parse_plain_record() {
    let p = parser();
    match p.parse("phptop /a time:1.0 user:0.5 sys:0.1 mem:1048576") {
        Parsed::Record(r) => {
            assert_eq!(r.ident.as_str(), "/a");
            assert!(r.timestamp.is_none());
            assert_eq!(r.metrics.time, Some(1.0));
            assert_eq!(r.metrics.user, Some(0.5));
            assert_eq!(r.metrics.sys, Some(0.1));
            assert_eq!(r.metrics.mem, Some(1048576.0));
        }
        x => panic!("Unexpected {:?}", x),
    }
}

#[test]
fn test_parse_apache_line() {
    let p = parser();
    let line = "[Tue Oct 19 10:11:12.345678 2010] [php7:notice] [pid 42] [client 10.0.0.1:5555] phptop http://www.example.com/x.php time:0,250 user:0,200 sys:0,010 mem:2097152, referer: http://www.example.com/";
    match p.parse(line) {
        Parsed::Record(r) => {
            assert_eq!(r.ident.as_str(), "http://www.example.com/x.php");
            assert!(r.timestamp.is_some());
            assert_eq!(r.metrics.time, Some(0.25));
            assert_eq!(r.metrics.user, Some(0.2));
            assert_eq!(r.metrics.sys, Some(0.01));
            assert_eq!(r.metrics.mem, Some(2097152.0));
        }
        x => panic!("Unexpected {:?}", x),
    }
}

#[test]
fn test_parse_nginx_line() {
    let p = parser();
    let line = "2010/10/19 10:11:12 [error] 811#811: *7 FastCGI sent in stderr: \"PHP message: phptop /a time:1.5 user:1 sys:0.5 mem:1048576\" while reading response header from upstream, client: 10.0.0.6, server: h, request: \"GET /a HTTP/1.1\"";
    match p.parse(line) {
        Parsed::Record(r) => {
            assert_eq!(r.ident.as_str(), "/a");
            assert_eq!(r.timestamp, parse_timestamp("2010/10/19 10:11:12"));
            assert!(r.timestamp.is_some());
            assert_eq!(r.metrics.time, Some(1.5));
            assert_eq!(r.metrics.mem, Some(1048576.0));
        }
        x => panic!("Unexpected {:?}", x),
    }
    // Without the quote the client part still does not count as pairs
    match p.parse("2010/10/19 10:11:12 [error] phptop /a time:1 user:1 sys:1, client: 10.0.0.6") {
        Parsed::Bogus { why, timestamp, .. } => {
            assert_eq!(why, Bogosity::Truncated);
            assert!(timestamp.is_some());
        }
        x => panic!("Unexpected {:?}", x),
    }
}

#[test]
fn test_parse_fpm_worker_line() {
    let p = parser();
    let line = "[01-Mar-2024 11:55:00] WARNING: [pool www] child 12 said into stderr: \"phptop /a time:1 user:1 sys:1 mem:1\"";
    match p.parse(line) {
        Parsed::Record(r) => {
            assert_eq!(r.ident.as_str(), "/a");
            assert_eq!(r.timestamp, parse_timestamp("01-Mar-2024 11:55:00"));
            assert_eq!(r.metrics.mem, Some(1.0));
        }
        x => panic!("Unexpected {:?}", x),
    }
}

#[test]
fn test_leading_timestamp() {
    assert!(leading_timestamp("2024/03/01 11:55:00 [error] x").is_some());
    assert!(leading_timestamp("2024-03-01T11:55:00+00:00 phptop /a").is_some());
    assert!(leading_timestamp("[01-Mar-2024 11:55:00] x").is_some());
    assert!(leading_timestamp("phptop /a time:1").is_none());
    assert!(leading_timestamp("42 is not a date").is_none());
}

#[test]
fn test_parse_unparsable_timestamp_is_unknown() {
    let p = parser();
    match p.parse("[not a date] phptop /a time:1 user:1 sys:1 mem:1") {
        Parsed::Record(r) => assert!(r.timestamp.is_none()),
        x => panic!("Unexpected {:?}", x),
    }
}

#[test]
fn test_parse_skips_noise() {
    let p = parser();
    assert_eq!(p.parse(""), Parsed::Skip);
    assert_eq!(
        p.parse("[Tue Oct 19 10:11:12 2010] [error] File does not exist: /var/www/favicon.ico"),
        Parsed::Skip
    );
    // The marker must be a word of its own
    assert_eq!(p.parse("notphptop /a time:1 user:1 sys:1 mem:1"), Parsed::Skip);
    assert_eq!(p.parse("phptop"), Parsed::Skip);
}

#[test]
fn test_parse_truncated() {
    let p = parser();
    match p.parse("phptop /a time:1.0 user:0.5 sys:0.1") {
        Parsed::Bogus { ident, why, .. } => {
            assert_eq!(ident.as_str(), "/a");
            assert_eq!(why, Bogosity::Truncated);
        }
        x => panic!("Unexpected {:?}", x),
    }
    // The referer is not a pair
    match p.parse("phptop /a time:1.0 user:0.5 sys:0.1, referer: http://x/ y:1") {
        Parsed::Bogus { why, .. } => assert_eq!(why, Bogosity::Truncated),
        x => panic!("Unexpected {:?}", x),
    }
}

#[test]
fn test_parse_malformed() {
    let p = parser();
    for line in [
        "phptop /a time:1.0 user:0.5 sys:0.1 mem:abc",
        "phptop /a time:1.0 user:0.5 sys:0.1 :12",
        "phptop /a time:1.0.0 user:0.5 sys:0.1 mem:12",
        "phptop /a time:1.0 user:0.5 sys:0.1 mem",
        "phptop /a time:-1.0 user:0.5 sys:0.1 mem:12",
        "phptop /a time:. user:0.5 sys:0.1 mem:12",
    ] {
        match p.parse(line) {
            Parsed::Bogus { ident, why, .. } => {
                assert_eq!(ident.as_str(), "/a");
                assert_eq!(why, Bogosity::Malformed, "{line}");
            }
            x => panic!("Unexpected {:?} for {line}", x),
        }
    }
}

#[test]
fn test_parse_unknown_keys() {
    let p = parser();
    match p.parse("phptop /a time:1 user:2 sys:3 cpu:4") {
        Parsed::Record(r) => {
            assert_eq!(r.metrics.mem, None);
            assert_eq!(r.metrics.time, Some(1.0));
        }
        x => panic!("Unexpected {:?}", x),
    }
    // Unknown keys must still be well-formed
    match p.parse("phptop /a time:1 user:2 sys:3 cpu:x") {
        Parsed::Bogus { why, .. } => assert_eq!(why, Bogosity::Malformed),
        x => panic!("Unexpected {:?}", x),
    }
}

#[test]
fn test_parse_custom_marker() {
    let p = RecordParser::new(ParseOptions {
        marker: "req.top".to_string(),
        ..ParseOptions::default()
    })
    .unwrap();
    assert!(matches!(
        p.parse("req.top /a time:1 user:1 sys:1 mem:1"),
        Parsed::Record(_)
    ));
    // The dot is literal
    assert_eq!(p.parse("reqxtop /a time:1 user:1 sys:1 mem:1"), Parsed::Skip);
}

#[test]
fn test_normalize_identifier() {
    let plain = ParseOptions::default();
    assert_eq!(normalize_identifier("/foo/index.php", &plain), "/foo/");
    assert_eq!(normalize_identifier("/foo/index.php?x=1", &plain), "/foo/");
    assert_eq!(normalize_identifier("/foo/indexes.php", &plain), "/foo/indexes.php");
    assert_eq!(normalize_identifier("/foo///", &plain), "/foo/");
    assert_eq!(normalize_identifier("/foo/", &plain), "/foo/");
    assert_eq!(normalize_identifier("/foo", &plain), "/foo");
    assert_eq!(
        normalize_identifier("http://h.example/a/b.php?q=1", &plain),
        "http://h.example/a/b.php"
    );

    let full = path_opts(true, false);
    assert_eq!(normalize_identifier("/a.php?q=1&r=2", &full), "/a.php?q=1&r=2");
    assert_eq!(normalize_identifier("/a/index.php?q=1", &full), "/a/?q=1");

    let path = path_opts(false, true);
    assert_eq!(normalize_identifier("https://h.example/a/b.php?q=1", &path), "/a/b.php");
    assert_eq!(normalize_identifier("http://h.example", &path), "/");
    assert_eq!(normalize_identifier("http://h.example/index.php", &path), "/");
    assert_eq!(normalize_identifier("/already/a/path", &path), "/already/a/path");
}

#[test]
fn test_parse_applies_normalization() {
    let p = RecordParser::new(path_opts(false, true)).unwrap();
    match p.parse("phptop http://h.example/shop/index.php?id=3 time:1 user:1 sys:1 mem:1") {
        Parsed::Record(r) => assert_eq!(r.ident.as_str(), "/shop/"),
        x => panic!("Unexpected {:?}", x),
    }
}
