/// Drive the line sources, the parser, the window filter and the aggregator over a set of files.
///
/// Files are read one after another in the order given.  A file that can't be opened is reported
/// and skipped; a read error part way through a file is reported and the samples read up to that
/// point are kept.  Only if no file at all could be opened is that an error.
use crate::aggregate::Aggregator;
use crate::linesource::{open_logfile, LineSource, ScanOrder};
use crate::record::{Bogosity, Parsed, RecordParser};
use crate::window::{EarlyStop, Placement, Window};

use anyhow::{bail, Result};
use std::io;
use std::path::{Path, PathBuf};

/// What happened while reading one file.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileStats {
    /// Lines read, of any kind
    pub lines: usize,

    /// Valid samples in the window
    pub records: usize,

    /// Bogus samples in the window
    pub bogus: usize,

    /// Samples (valid or not) outside the window
    pub outside: usize,

    /// True if a backward scan gave up before reaching the start of the file
    pub stopped_early: bool,
}

/// What happened while reading a set of files.

#[derive(Debug, Default)]
pub struct Ingested {
    pub opened: usize,
    pub failed: usize,
    pub files: Vec<(PathBuf, FileStats)>,
}

/// Feed lines into the aggregator.  Backward scans stop once they are clearly past the start of the
/// window; forward scans read everything.  Returns the statistics and, if reading failed part way,
/// the error.

pub fn ingest_lines<I>(
    lines: I,
    order: ScanOrder,
    parser: &RecordParser,
    window: &Window,
    agg: &mut Aggregator,
) -> (FileStats, Option<io::Error>)
where
    I: Iterator<Item = io::Result<String>>,
{
    let mut stats = FileStats::default();
    let mut early_stop = EarlyStop::new();

    for line in lines {
        let line = match line {
            Ok(l) => l,
            Err(e) => return (stats, Some(e)),
        };
        stats.lines += 1;

        let parsed = parser.parse(&line);
        let timestamp = match parsed {
            Parsed::Skip => continue,
            Parsed::Bogus { timestamp, .. } => timestamp,
            Parsed::Record(ref r) => r.timestamp,
        };
        let placement = window.place(timestamp);
        if order == ScanOrder::Backward && early_stop.observe(placement) {
            stats.stopped_early = true;
            break;
        }
        if placement != Placement::Inside {
            stats.outside += 1;
            continue;
        }

        match parsed {
            Parsed::Skip => {}
            Parsed::Bogus { ident, why, .. } => {
                stats.bogus += 1;
                match why {
                    Bogosity::Truncated => agg.reject(),
                    Bogosity::Malformed => agg.invalidate(ident),
                }
            }
            Parsed::Record(r) => {
                stats.records += 1;
                agg.merge(&r);
            }
        }
    }

    (stats, None)
}

/// Read one file into the aggregator.  Fails only if the file can't be opened.

pub fn ingest_logfile(
    path: &Path,
    parser: &RecordParser,
    window: &Window,
    agg: &mut Aggregator,
) -> Result<FileStats> {
    let source: LineSource = open_logfile(path)?;
    let order = source.order();
    let (stats, err) = ingest_lines(source, order, parser, window, agg);
    if let Some(e) = err {
        tracing::warn!("Error reading {}: {e}", path.display());
    }
    tracing::info!(
        "{}: {} lines, {} samples, {} bogus, {} outside window{}",
        path.display(),
        stats.lines,
        stats.records,
        stats.bogus,
        stats.outside,
        if stats.stopped_early {
            ", stopped early"
        } else {
            ""
        }
    );
    Ok(stats)
}

/// Read all the files into the aggregator, in order.

pub fn ingest_logfiles(
    paths: &[PathBuf],
    parser: &RecordParser,
    window: &Window,
    agg: &mut Aggregator,
) -> Result<Ingested> {
    if paths.is_empty() {
        bail!("No log files to read");
    }
    let mut result = Ingested::default();
    for path in paths {
        match ingest_logfile(path, parser, window, agg) {
            Ok(stats) => {
                result.opened += 1;
                result.files.push((path.clone(), stats));
            }
            Err(e) => {
                tracing::warn!("{e:#}");
                result.failed += 1;
            }
        }
    }
    if result.opened == 0 {
        bail!("None of the log files could be opened");
    }
    Ok(result)
}

#[cfg(test)]
use crate::aggregate::InvalidationPolicy;
#[cfg(test)]
use crate::dates::Timestamp;
#[cfg(test)]
use crate::linesource::open_forward;
#[cfg(test)]
use crate::record::ParseOptions;
#[cfg(test)]
use chrono::{Duration, TimeZone, Utc};

#[cfg(test)]
fn test_end() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

#[cfg(test)]
fn sample(ident: &str, secs_before_end: i64) -> String {
    let t = test_end() - Duration::seconds(secs_before_end);
    format!(
        "[{}] [php:notice] phptop {ident} time:1.0 user:0.5 sys:0.1 mem:1048576",
        t.to_rfc3339()
    )
}

#[cfg(test)]
fn run(lines: &[String], order: ScanOrder, agg: &mut Aggregator) -> FileStats {
    let parser = RecordParser::new(ParseOptions::default()).unwrap();
    let window = Window::ending_at(test_end(), 300);
    let input: Vec<io::Result<String>> = match order {
        ScanOrder::Forward => lines.iter().cloned().map(Ok).collect(),
        ScanOrder::Backward => lines.iter().rev().cloned().map(Ok).collect(),
    };
    let (stats, err) = ingest_lines(input.into_iter(), order, &parser, &window, agg);
    assert!(err.is_none());
    stats
}

#[test]
fn test_window_filtering() {
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    let lines = vec![
        sample("/old", 301),
        sample("/new", 299),
        "[Fri Mar 01 11:59:00 2024] [error] something unrelated".to_string(),
    ];
    let stats = run(&lines, ScanOrder::Forward, &mut agg);
    assert_eq!(stats.lines, 3);
    assert_eq!(stats.records, 1);
    assert_eq!(stats.outside, 1);
    assert!(agg.get("/old").is_none());
    assert_eq!(agg.get("/new").unwrap().hit, 1);
}

// Oldest first: one in-window sample logged late, then `n` samples from long ago, then a recent
// sample.
#[cfg(test)]
fn out_of_order_log(n: usize) -> Vec<String> {
    let mut lines = vec![sample("/early", 100)];
    for _ in 0..n {
        lines.push(sample("/ancient", 1000));
    }
    lines.push(sample("/recent", 10));
    lines
}

#[test]
fn test_backward_early_stop() {
    // Ten old samples in a row are tolerated.
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    let stats = run(&out_of_order_log(10), ScanOrder::Backward, &mut agg);
    assert!(!stats.stopped_early);
    assert_eq!(agg.get("/early").unwrap().hit, 1);
    assert_eq!(agg.get("/recent").unwrap().hit, 1);

    // Eleven are not.
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    let stats = run(&out_of_order_log(11), ScanOrder::Backward, &mut agg);
    assert!(stats.stopped_early);
    assert!(agg.get("/early").is_none());
    assert_eq!(agg.get("/recent").unwrap().hit, 1);
    assert_eq!(stats.outside, 10);
}

#[test]
fn test_forward_never_stops() {
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    let stats = run(&out_of_order_log(50), ScanOrder::Forward, &mut agg);
    assert!(!stats.stopped_early);
    assert_eq!(stats.outside, 50);
    assert_eq!(agg.get("/early").unwrap().hit, 1);
    assert_eq!(agg.get("/recent").unwrap().hit, 1);
}

#[test]
fn test_too_new_samples_do_not_stop_scan() {
    // With an explicit end, samples after it are skipped but a backward scan keeps going.
    let mut lines = vec![sample("/inside", 5)];
    for _ in 0..20 {
        lines.push(sample("/future", -60));
    }
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    let stats = run(&lines, ScanOrder::Backward, &mut agg);
    assert!(!stats.stopped_early);
    assert_eq!(stats.outside, 20);
    assert_eq!(agg.get("/inside").unwrap().hit, 1);
    assert!(agg.get("/future").is_none());
}

#[test]
fn test_bogus_handling() {
    let t = (test_end() - Duration::seconds(10)).to_rfc3339();
    let lines = vec![
        sample("/a", 30),
        sample("/a", 20),
        sample("/b", 20),
        // Truncated: counted, /b untouched
        format!("[{t}] phptop /b time:1.0 user:0.5 sys:0.1"),
        // Malformed after good pairs: /a is dropped entirely
        format!("[{t}] phptop /a time:1.0 user:0.5 sys:0.1 mem:oops"),
        // Malformed but outside the window: ignored
        format!("[2020-01-01T00:00:00+00:00] phptop /b time:x user:0.5 sys:0.1 mem:1"),
    ];
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    let stats = run(&lines, ScanOrder::Forward, &mut agg);
    assert_eq!(stats.records, 3);
    assert_eq!(stats.bogus, 2);
    assert_eq!(stats.outside, 1);
    assert_eq!(agg.bogus(), 2);
    assert!(agg.get("/a").is_none());
    assert_eq!(agg.get("/b").unwrap().hit, 1);
    assert_eq!(agg.hits(), 3);
}

#[test]
fn test_ingest_end_to_end() {
    let lines = vec![
        "phptop /a time:1.0 user:0.5 sys:0.1 mem:1048576".to_string(),
        "phptop /a time:2.0 user:1.0 sys:0.2 mem:2097152".to_string(),
    ];
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    run(&lines, ScanOrder::Backward, &mut agg);
    let summary = agg.finalize();
    assert_eq!(summary.hits, 2);
    let a = &summary.entries[0];
    assert_eq!(a.ident.as_str(), "/a");
    assert_eq!(a.hit, 2);
    assert_eq!(a.time, Some(3.0));
    assert_eq!(a.user, Some(1.5));
    assert!((a.sys.unwrap() - 0.3).abs() < 1e-9);
    assert_eq!(a.mem, Some(1.5));
    assert_eq!(a.mem_max, Some(2.0));
}

#[test]
fn test_ingest_fixture_files() {
    let parser = RecordParser::new(ParseOptions {
        path_only: true,
        ..ParseOptions::default()
    })
    .unwrap();
    // The fixtures carry local times without a zone, like the servers write them.
    let end = crate::dates::parse_timestamp("Fri Mar 01 12:00:00 2024").unwrap();
    let window = Window::ending_at(end, 300);
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    let paths = vec![
        PathBuf::from("../tests/phplog/php-fpm.log"),
        PathBuf::from("../tests/phplog/no-such-file.log"),
        PathBuf::from("../tests/phplog/apache-error.log"),
    ];
    let ingested = ingest_logfiles(&paths, &parser, &window, &mut agg).unwrap();
    assert_eq!(ingested.opened, 2);
    assert_eq!(ingested.failed, 1);
    assert_eq!(agg.get("/shop/cart.php").unwrap().hit, 3);
    assert_eq!(agg.get("/").unwrap().hit, 2);
    assert!(agg.get("/old.php").is_none());
    assert!(agg.get("/broken.php").is_none());
    assert_eq!(agg.bogus(), 2);
    assert_eq!(agg.hits(), 6);
}

#[test]
fn test_ingest_no_files() {
    let parser = RecordParser::new(ParseOptions::default()).unwrap();
    let window = Window::trailing(Utc::now(), 300);
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    assert!(ingest_logfiles(&[], &parser, &window, &mut agg).is_err());
    let paths = vec![PathBuf::from("/nonexistent/a.log"), PathBuf::from("/nonexistent/b.log.gz")];
    assert!(ingest_logfiles(&paths, &parser, &window, &mut agg).is_err());
}

#[test]
fn test_ingest_forward_file() {
    use std::io::Write;
    let mut f = tempfile::NamedTempFile::new().unwrap();
    for l in out_of_order_log(20) {
        writeln!(f, "{l}").unwrap();
    }
    f.flush().unwrap();
    let parser = RecordParser::new(ParseOptions::default()).unwrap();
    let window = Window::ending_at(test_end(), 300);
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    let source = open_forward(f.path()).unwrap();
    let (stats, err) = ingest_lines(source, ScanOrder::Forward, &parser, &window, &mut agg);
    assert!(err.is_none());
    assert_eq!(stats.records, 2);
}

#[test]
fn test_ingest_nginx_and_fpm_fixtures() {
    let parser = RecordParser::new(ParseOptions {
        path_only: true,
        ..ParseOptions::default()
    })
    .unwrap();
    let end = crate::dates::parse_timestamp("Fri Mar 01 12:00:00 2024").unwrap();
    let window = Window::ending_at(end, 300);
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    let paths = vec![
        PathBuf::from("../tests/phplog/nginx-error.log"),
        PathBuf::from("../tests/phplog/fpm-master.log"),
    ];
    let ingested = ingest_logfiles(&paths, &parser, &window, &mut agg).unwrap();
    assert_eq!(ingested.opened, 2);
    let nginx = &ingested.files[0].1;
    assert_eq!(nginx.records, 1);
    assert_eq!(nginx.outside, 1);
    assert_eq!(agg.get("/shop/cart.php").unwrap().hit, 1);
    assert_eq!(agg.get("/search.php").unwrap().hit, 2);
    assert!(agg.get("/old.php").is_none());
    assert_eq!(agg.bogus(), 0);
    assert_eq!(agg.hits(), 3);
}

#[test]
fn test_ingest_gzip_never_stops_early() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("error.log.1.gz");
    let mut enc = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
    // Oldest first, as the file was written: many old samples before a recent one
    for l in out_of_order_log(20) {
        writeln!(enc, "{l}").unwrap();
    }
    enc.finish().unwrap();

    let parser = RecordParser::new(ParseOptions::default()).unwrap();
    let window = Window::ending_at(test_end(), 300);
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    let ingested = ingest_logfiles(&[path], &parser, &window, &mut agg).unwrap();
    let stats = &ingested.files[0].1;
    assert!(!stats.stopped_early);
    assert_eq!(stats.outside, 20);
    assert_eq!(stats.records, 2);
    assert_eq!(agg.get("/early").unwrap().hit, 1);
    assert_eq!(agg.get("/recent").unwrap().hit, 1);
}
