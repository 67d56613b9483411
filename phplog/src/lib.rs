/// A `phptop` log is not a log of its own.  An instrumentation hook inside the PHP application
/// measures each request (wall time, user and system CPU time, peak memory) and writes one *sample*
/// per request through the host's ordinary error logging, so samples end up scattered among other
/// messages in web server and PHP-FPM error logs, possibly rotated and compressed.
///
/// This library has as its task to find the samples for a recent time window in a set of such log
/// files and summarize them per request identifier (normally the URL).  This breaks down into:
///
/// - Read the lines of a log file, newest first where possible so that a scan for the last few
///   minutes can stop early, or oldest first for compressed files.
///
/// - Recognize and validate samples, normalizing the identifiers so that equivalent requests are
///   counted together.
///
/// - Filter samples by the time window.
///
/// - Accumulate totals per identifier, and turn them into per-hit and peak values at the end.
///
/// Nothing is kept between runs; the log files are the only source of truth.
mod aggregate;
mod dates;
mod ingest;
mod linesource;
mod record;
mod stats;
mod window;

// Types and utilities for manipulating timestamps.

pub use dates::Timestamp;

// The time right now.

pub use dates::now;

// Parse a log timestamp in any of the formats we know about.

pub use dates::parse_timestamp;

// Local-time rendering of a Timestamp.

pub use dates::format_local;

// Line sources: a lazy stream of lines from a file, forward or backward.

pub use linesource::is_compressed;
pub use linesource::open_backward;
pub use linesource::open_forward;
pub use linesource::open_logfile;
pub use linesource::LineSource;
pub use linesource::ScanOrder;

// Recognize and validate samples in log lines.

pub use record::normalize_identifier;
pub use record::Bogosity;
pub use record::MetricRecord;
pub use record::Metrics;
pub use record::ParseOptions;
pub use record::Parsed;
pub use record::RecordParser;
pub use record::DEFAULT_MARKER;

// The time window and the early-stop rule for backward scans.

pub use window::EarlyStop;
pub use window::Placement;
pub use window::Window;
pub use window::OUT_OF_WINDOW_LIMIT;

// Accumulate samples per identifier.

pub use aggregate::AggregateEntry;
pub use aggregate::Aggregator;
pub use aggregate::InvalidationPolicy;

// Finalized statistics.

pub use stats::FinalizedEntry;
pub use stats::Metric;
pub use stats::Summary;
pub use stats::MEGABYTE;

// Read a set of log files into an aggregator.

pub use ingest::ingest_lines;
pub use ingest::ingest_logfile;
pub use ingest::ingest_logfiles;
pub use ingest::FileStats;
pub use ingest::Ingested;
