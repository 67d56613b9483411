/// Resolve the command line and the environment into the settings for one run.
///
/// Everything that can be wrong with the configuration is discovered here, before any file is
/// read: bad sort keys, unknown output mode, a span that is zero or too large, bad log file patterns.
use crate::format::OutputMode;
use crate::report::RenderPolicy;
use crate::Cli;

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use phplog::{InvalidationPolicy, Metric, ParseOptions, Timestamp, Window};
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::str::FromStr;

/// Where the samples usually end up when nothing else is specified.  Only patterns here, so that a
/// server without one of these simply has no matches.
pub const DEFAULT_LOGS: [&str; 5] = [
    "/var/log/apache2/*error.log",
    "/var/log/httpd/*error_log",
    "/var/log/nginx/*error.log",
    "/var/log/php*-fpm.log",
    "/var/log/php-fpm/*error.log",
];

pub const DEFAULT_WIDTH: usize = 80;

#[derive(Debug)]
pub struct Settings {
    pub window: Window,
    pub logfiles: Vec<PathBuf>,
    pub mode: OutputMode,
    pub sort_keys: Vec<Metric>,
    pub count: usize,
    pub parse: ParseOptions,
    pub policy: RenderPolicy,
    pub invalidation: InvalidationPolicy,
}

impl Settings {
    /// `env_logs` is the value of PHPTOP_LOG, if set.
    pub fn from_cli(cli: &Cli, now: Timestamp, env_logs: Option<String>) -> Result<Settings> {
        if cli.span == 0 {
            bail!("The span must be positive");
        }
        let end = cli.end.unwrap_or(now);
        let Some(span_secs) = i64::try_from(cli.span)
            .ok()
            .filter(|secs| {
                chrono::Duration::try_seconds(*secs)
                    .and_then(|span| end.checked_sub_signed(span))
                    .is_some()
            })
        else {
            bail!("The span {}s reaches back before any representable time", cli.span)
        };
        let window = match cli.end {
            Some(end) => Window::ending_at(end, span_secs),
            None => Window::trailing(now, span_secs),
        };

        let patterns = if !cli.log.is_empty() {
            cli.log.clone()
        } else if let Some(s) = env_logs.filter(|s| !s.trim().is_empty()) {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_string())
                .collect::<Vec<String>>()
        } else {
            DEFAULT_LOGS.iter().map(|x| x.to_string()).collect()
        };
        let logfiles = expand_patterns(&patterns)?;

        if cli.marker.trim().is_empty() || cli.marker.contains(char::is_whitespace) {
            bail!("The marker must be a single nonempty word");
        }

        Ok(Settings {
            window,
            logfiles,
            mode: OutputMode::from_str(&cli.output)?,
            sort_keys: parse_sort_keys(&cli.sort)?,
            count: cli.count,
            parse: ParseOptions {
                marker: cli.marker.clone(),
                full_query: cli.full,
                path_only: cli.path,
            },
            policy: RenderPolicy::new(cli.relative, cli.average),
            invalidation: if cli.salvage {
                InvalidationPolicy::Salvage
            } else {
                InvalidationPolicy::DropBucket
            },
        })
    }
}

/// Comma-separated sort keys, in order, without duplicates.

pub fn parse_sort_keys(s: &str) -> Result<Vec<Metric>> {
    let keys = s
        .split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(Metric::from_str)
        .collect::<Result<Vec<Metric>>>()?
        .into_iter()
        .unique()
        .collect::<Vec<Metric>>();
    if keys.is_empty() {
        bail!("No sort keys");
    }
    Ok(keys)
}

fn is_pattern(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Expand glob patterns into file names, sorted within each pattern.  A name that is not a pattern
/// is kept whether it exists or not, so that failing to open it is reported later.  The result
/// has no duplicates and keeps the order of first appearance.

pub fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    for p in patterns {
        if is_pattern(p) {
            let mut matches = glob::glob(p)
                .with_context(|| format!("Bad log file pattern '{p}'"))?
                .filter_map(|entry| match entry {
                    Ok(path) => Some(path),
                    Err(e) => {
                        tracing::warn!("{e}");
                        None
                    }
                })
                .collect::<Vec<PathBuf>>();
            if matches.is_empty() {
                tracing::debug!("No files match {p}");
            }
            matches.sort();
            files.extend(matches);
        } else {
            files.push(PathBuf::from(p));
        }
    }
    Ok(files.into_iter().unique().collect())
}

/// The width available for text output: None when stdout is not a terminal, otherwise COLUMNS if
/// it is a number, otherwise whatever the terminal says, otherwise a default.

pub fn terminal_width(mode: OutputMode) -> Option<usize> {
    if mode != OutputMode::Text {
        return None;
    }
    let detected = crossterm::terminal::size().ok().map(|(w, _)| w);
    resolve_width(
        io::stdout().is_terminal(),
        std::env::var("COLUMNS").ok(),
        detected,
    )
}

fn resolve_width(is_tty: bool, columns: Option<String>, detected: Option<u16>) -> Option<usize> {
    if !is_tty {
        return None;
    }
    if let Some(w) = columns.and_then(|s| usize::from_str(s.trim()).ok()) {
        if w > 0 {
            return Some(w);
        }
    }
    match detected {
        Some(w) if w > 0 => Some(w as usize),
        _ => Some(DEFAULT_WIDTH),
    }
}

#[cfg(test)]
use clap::Parser;

#[cfg(test)]
fn settings(args: &[&str]) -> Result<Settings> {
    let mut argv = vec!["phptop"];
    argv.extend_from_slice(args);
    Settings::from_cli(&Cli::parse_from(argv), phplog::now(), None)
}

#[test]
fn test_defaults() {
    let s = settings(&["-l", "a.log"]).unwrap();
    assert_eq!(s.window.span_secs(), 300);
    assert_eq!(s.mode, OutputMode::Text);
    assert_eq!(s.sort_keys, vec![Metric::Time]);
    assert_eq!(s.count, 10);
    assert_eq!(s.policy, RenderPolicy::Absolute);
    assert_eq!(s.invalidation, InvalidationPolicy::DropBucket);
    assert_eq!(s.parse.marker, "phptop");
    assert!(!s.parse.full_query);
    assert!(!s.parse.path_only);
    assert_eq!(s.logfiles, vec![PathBuf::from("a.log")]);
}

#[test]
fn test_flags() {
    let s = settings(&[
        "-s", "60", "-o", "markup", "-c", "0", "-k", "hit,mem_max", "-f", "-p", "-r", "-a",
        "--salvage", "--marker", "phpstat", "-l", "a.log", "-l", "b.log",
    ])
    .unwrap();
    assert_eq!(s.window.span_secs(), 60);
    assert_eq!(s.mode, OutputMode::Html);
    assert_eq!(s.sort_keys, vec![Metric::Hit, Metric::MemMax]);
    assert_eq!(s.count, 0);
    assert_eq!(s.policy, RenderPolicy::RelativeAverage);
    assert_eq!(s.invalidation, InvalidationPolicy::Salvage);
    assert_eq!(s.parse.marker, "phpstat");
    assert!(s.parse.full_query);
    assert!(s.parse.path_only);
    assert_eq!(
        s.logfiles,
        vec![PathBuf::from("a.log"), PathBuf::from("b.log")]
    );
}

#[test]
fn test_bad_config() {
    assert!(settings(&["-l", "a.log", "-s", "0"]).is_err());
    assert!(settings(&["-l", "a.log", "-o", "xml"]).is_err());
    assert!(settings(&["-l", "a.log", "-k", "time,cpu"]).is_err());
    assert!(settings(&["-l", "a.log", "-k", ","]).is_err());
    assert!(settings(&["-l", "a.log", "--marker", "two words"]).is_err());
    assert!(settings(&["-l", "[bad"]).is_err());
    // Spans too large for a time difference, or reaching before the earliest time
    assert!(settings(&["-l", "a.log", "-s", "20000000000000000"]).is_err());
    assert!(settings(&["-l", "a.log", "-s", "18446744073709551615"]).is_err());
    assert!(settings(&["-l", "a.log", "-s", "9000000000000000"]).is_err());
    // A century is fine
    let s = settings(&["-l", "a.log", "-s", "3153600000"]).unwrap();
    assert!(s.window.contains(Some(phplog::now())));
}

#[test]
fn test_sort_keys() {
    assert_eq!(
        parse_sort_keys("time, hit,time,mem").unwrap(),
        vec![Metric::Time, Metric::Hit, Metric::Mem]
    );
}

#[test]
fn test_env_logs() {
    let cli = Cli::parse_from(["phptop"]);
    let s = Settings::from_cli(&cli, phplog::now(), Some("x.log, y.log,,x.log".to_string())).unwrap();
    assert_eq!(
        s.logfiles,
        vec![PathBuf::from("x.log"), PathBuf::from("y.log")]
    );

    // The command line wins over the environment
    let cli = Cli::parse_from(["phptop", "-l", "z.log"]);
    let s = Settings::from_cli(&cli, phplog::now(), Some("x.log".to_string())).unwrap();
    assert_eq!(s.logfiles, vec![PathBuf::from("z.log")]);
}

#[test]
fn test_explicit_end() {
    let cli = Cli::parse_from(["phptop", "-l", "a.log", "-e", "2024-03-01 12:00:00", "-s", "60"]);
    let s = Settings::from_cli(&cli, phplog::now(), None).unwrap();
    let end = phplog::parse_timestamp("2024-03-01 12:00:00").unwrap();
    assert_eq!(s.window.end(), end);
    assert_eq!(s.window.start(), end - chrono::Duration::seconds(60));
}

#[test]
fn test_expand_patterns() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["b-error.log", "a-error.log", "access.log"] {
        std::fs::write(dir.path().join(name), "").unwrap();
    }
    let base = dir.path().to_string_lossy().to_string();
    let patterns = vec![
        format!("{base}/*-error.log"),
        format!("{base}/a-error.log"),
        format!("{base}/nothing-*.log"),
        format!("{base}/missing.log"),
    ];
    let files = expand_patterns(&patterns).unwrap();
    assert_eq!(
        files,
        vec![
            dir.path().join("a-error.log"),
            dir.path().join("b-error.log"),
            dir.path().join("missing.log"),
        ]
    );
}

#[test]
fn test_resolve_width() {
    assert_eq!(resolve_width(false, Some("120".to_string()), Some(100)), None);
    assert_eq!(resolve_width(true, Some("120".to_string()), Some(100)), Some(120));
    assert_eq!(resolve_width(true, Some("wide".to_string()), Some(100)), Some(100));
    assert_eq!(resolve_width(true, None, Some(100)), Some(100));
    assert_eq!(resolve_width(true, None, None), Some(80));
    assert_eq!(resolve_width(true, Some("0".to_string()), Some(0)), Some(80));
    assert_eq!(terminal_width(OutputMode::Html), None);
}
