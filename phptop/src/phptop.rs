/// `phptop` -- Show which PHP requests used the most resources recently
///
/// The PHP application writes one sample per request into the web server's error log (see the
/// `phplog` library for the format).  This program reads the samples for the last few minutes from
/// those logs, sums them up per URL, and prints the top URLs sorted by one or more of the measured
/// quantities, as text for a terminal or as an html, csv or json document.
///
/// Quirks
///
/// Plain log files are read from the end, and a file is abandoned once the scan has gone back past
/// the window for a while.  Compressed (rotated) logs can't be read backward and are always read
/// in their entirety.
///
/// A malformed sample throws away everything counted so far for its URL, and since plain files are
/// read newest first, "so far" means the samples that are *newer* than the bad one.  Use
/// --salvage to only reject the bad sample.
///
/// With an explicit --end, samples newer than the end are ignored but do not make a backward scan
/// stop; the scan keeps going until it has gone past the start of the window.
mod config;
mod format;
mod logging;
mod report;

use anyhow::{bail, Result};
use chrono::{Duration, TimeZone, Utc};
use clap::Parser;
use phplog::{Aggregator, RecordParser, Timestamp};
use std::env;
use std::io;
use std::process;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Length of the time window, in seconds
    #[arg(long, short, default_value_t = 300)]
    span: u64,

    /// End of the time window [default: now].  A log timestamp, @<epoch-seconds>, or -Ns, -Nm, -Nh,
    /// -Nd for that long ago
    #[arg(long, short, allow_hyphen_values = true, value_parser = parse_end_time)]
    end: Option<Timestamp>,

    /// Log file or glob pattern, repeatable [default: $PHPTOP_LOG (comma-separated), or the usual
    /// Apache, nginx and PHP-FPM error logs]
    #[arg(long, short)]
    log: Vec<String>,

    /// Output format: text, html (alias markup), csv, json
    #[arg(long, short, default_value = "text")]
    output: String,

    /// Number of URLs to show per report, 0 for all
    #[arg(long, short, default_value_t = 10)]
    count: usize,

    /// Sort keys, comma-separated, one report per key: hit, time, user, sys, mem, mem_max
    #[arg(long = "sort", short = 'k', default_value = "time")]
    sort: String,

    /// Keep the query string in URLs
    #[arg(long, short, default_value_t = false)]
    full: bool,

    /// Strip the scheme and host from URLs
    #[arg(long, short, default_value_t = false)]
    path: bool,

    /// Show times as a percentage of the span and hits as a percentage of all hits
    #[arg(long, short, default_value_t = false)]
    relative: bool,

    /// Show times per hit
    #[arg(long, short, default_value_t = false)]
    average: bool,

    /// On a malformed sample, reject only that sample and keep the URL's other samples
    #[arg(long, default_value_t = false)]
    salvage: bool,

    /// The word that introduces a sample in the log
    #[arg(long, default_value = phplog::DEFAULT_MARKER)]
    marker: String,

    /// Print information about the files read and the samples found
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

// The command arg parsers don't need to include the string being parsed because the error generated
// by clap includes that.

fn parse_end_time(s: &str) -> Result<Timestamp> {
    if let Some(rel) = s.strip_prefix('-') {
        for (suffix, unit) in [('s', 1i64), ('m', 60), ('h', 3600), ('d', 86400)] {
            if let Some(n) = rel.strip_suffix(suffix) {
                let Ok(k) = u32::from_str(n) else {
                    bail!("Invalid relative time")
                };
                let Some(t) = phplog::now().checked_sub_signed(Duration::seconds(k as i64 * unit))
                else {
                    bail!("Relative time out of range")
                };
                return Ok(t);
            }
        }
        bail!("Invalid relative time, the unit must be s, m, h or d")
    } else if let Some(n) = s.strip_prefix('@') {
        let Ok(k) = i64::from_str(n) else {
            bail!("Invalid epoch time")
        };
        match Utc.timestamp_opt(k, 0).single() {
            Some(t) => Ok(t),
            None => bail!("Epoch time out of range"),
        }
    } else {
        match phplog::parse_timestamp(s) {
            Some(t) => Ok(t),
            None => bail!("Invalid end time"),
        }
    }
}

fn main() {
    match phptop() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {:#}", msg);
            process::exit(1);
        }
    }
}

fn phptop() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let settings = config::Settings::from_cli(&cli, phplog::now(), env::var("PHPTOP_LOG").ok())?;
    let window = &settings.window;
    tracing::info!(
        "Window: {} to {} ({}s)",
        phplog::format_local(window.start()),
        phplog::format_local(window.end()),
        window.span_secs()
    );
    tracing::info!("Log files: {:?}", settings.logfiles);

    let parser = RecordParser::new(settings.parse.clone())?;
    let mut agg = Aggregator::new(settings.invalidation);
    let ingested = phplog::ingest_logfiles(&settings.logfiles, &parser, window, &mut agg)?;
    tracing::info!(
        "{} of {} log files read",
        ingested.opened,
        ingested.opened + ingested.failed
    );

    let summary = agg.finalize();
    tracing::info!(
        "{} samples, {} bogus, {} URLs",
        summary.hits,
        summary.bogus,
        summary.entries.len()
    );
    if summary.too_many_bogus() {
        tracing::warn!(
            "{} bogus samples for {} valid ones, more than 5%",
            summary.bogus,
            summary.hits
        );
    }
    if summary.entries.is_empty() {
        tracing::warn!("No records found in the last {}s", window.span_secs());
        return Ok(());
    }

    let ctx = report::ReportContext {
        count: settings.count,
        policy: settings.policy,
        span_secs: window.span_secs(),
        hits: summary.hits,
    };
    let reports = settings
        .sort_keys
        .iter()
        .map(|key| report::build_report(&summary, *key, &ctx))
        .collect::<Vec<report::Report>>();

    let presentation = format::Presentation {
        mode: settings.mode,
        width: config::terminal_width(settings.mode),
        title: format!(
            "phptop: {}s ending {}",
            window.span_secs(),
            phplog::format_local(window.end())
        ),
        footer: footer(),
    };
    format::format_reports(&mut io::stdout().lock(), &reports, &presentation)
}

fn footer() -> String {
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown host".to_string());
    let args = env::args().collect::<Vec<String>>().join(" ");
    format!(
        "Generated by phptop on {host}, {}, with: {args}",
        phplog::format_local(phplog::now())
    )
}

#[test]
fn test_parse_relative_end() {
    let now = phplog::now();
    for (s, secs) in [("-30s", 30), ("-5m", 300), ("-2h", 7200), ("-1d", 86400)] {
        let t = parse_end_time(s).unwrap();
        let d = (now - t).num_seconds();
        assert!(d >= secs - 2 && d <= secs + 2, "{s}: {d}");
    }
    assert!(parse_end_time("-5").is_err());
    assert!(parse_end_time("-5w").is_err());
    assert!(parse_end_time("-xm").is_err());
    assert!(parse_end_time("-99999999d").is_err());
}

#[test]
fn test_parse_absolute_end() {
    assert_eq!(
        parse_end_time("@1709294400").unwrap(),
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    );
    assert_eq!(
        parse_end_time("2024-03-01T12:00:00Z").unwrap(),
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    );
    assert_eq!(
        parse_end_time("01-Mar-2024 12:00:00 UTC").unwrap(),
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    );
    assert!(parse_end_time("yesterday").is_err());
    assert!(parse_end_time("@soon").is_err());
}

#[test]
fn test_cli() {
    let cli = Cli::parse_from(["phptop", "-e", "-10m", "-k", "hit,time", "-v"]);
    assert!(cli.end.is_some());
    assert_eq!(cli.sort, "hit,time");
    assert!(cli.verbose);
    assert_eq!(cli.span, 300);
    assert_eq!(cli.marker, "phptop");
    assert!(Cli::try_parse_from(["phptop", "-e", "tomorrow"]).is_err());
    assert!(Cli::try_parse_from(["phptop", "-s", "-5"]).is_err());
}
