/// The time window a report covers, and the early-stop heuristic for backward scans.
///
/// The window is [end-span, end].  By default `end` is the time the program started, and records
/// are in the window if they are no older than `span`; with an explicit end time, records newer
/// than `end` are also outside.
///
/// A record whose timestamp is unknown is always in the window.  Error logs from some setups don't
/// carry timestamps at all, and those should still be usable (the whole file is then the window).
use crate::dates::Timestamp;

use chrono::{DateTime, Duration, Utc};

/// A backward scan stops once more than this many consecutive records fall before the window.
/// Timestamps near the window boundary are not strictly ordered (requests are logged when they
/// finish, not when they start), so a single old record is not proof that we're done.

pub const OUT_OF_WINDOW_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Older than the window.
    Before,
    Inside,
    /// Newer than an explicit end time.
    After,
}

#[derive(Debug, Clone, Copy)]
pub struct Window {
    end: Timestamp,
    span_secs: i64,
    explicit_end: bool,
}

impl Window {
    /// The window of `span_secs` seconds leading up to `now`.
    pub fn trailing(now: Timestamp, span_secs: i64) -> Window {
        Window {
            end: now,
            span_secs,
            explicit_end: false,
        }
    }

    /// The window of `span_secs` seconds leading up to an explicit `end`.
    pub fn ending_at(end: Timestamp, span_secs: i64) -> Window {
        Window {
            end,
            span_secs,
            explicit_end: true,
        }
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn span_secs(&self) -> i64 {
        self.span_secs
    }

    /// The start of the window, or the earliest representable time if the span reaches past it.
    pub fn start(&self) -> Timestamp {
        Duration::try_seconds(self.span_secs)
            .and_then(|span| self.end.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn place(&self, t: Option<Timestamp>) -> Placement {
        match t {
            None => Placement::Inside,
            Some(t) => {
                if self.explicit_end && t > self.end {
                    Placement::After
                } else {
                    match Duration::try_seconds(self.span_secs) {
                        Some(span) if self.end - t > span => Placement::Before,
                        _ => Placement::Inside,
                    }
                }
            }
        }
    }

    pub fn contains(&self, t: Option<Timestamp>) -> bool {
        self.place(t) == Placement::Inside
    }
}

/// Counts consecutive records before the window during a backward scan.

#[derive(Debug, Default)]
pub struct EarlyStop {
    consecutive: usize,
}

impl EarlyStop {
    pub fn new() -> EarlyStop {
        EarlyStop { consecutive: 0 }
    }

    /// Account for one record, returning true if the scan should stop.  Records newer than the
    /// window neither count nor reset the count; in a backward scan they come before the window
    /// and say nothing about where it ends.
    pub fn observe(&mut self, placement: Placement) -> bool {
        match placement {
            Placement::Before => {
                self.consecutive += 1;
                self.consecutive > OUT_OF_WINDOW_LIMIT
            }
            Placement::Inside => {
                self.consecutive = 0;
                false
            }
            Placement::After => false,
        }
    }
}

#[cfg(test)]
use chrono::TimeZone;

#[cfg(test)]
fn noon() -> Timestamp {
    chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

#[test]
fn test_window_edges() {
    let now = noon();
    let w = Window::trailing(now, 300);
    assert!(w.contains(Some(now - Duration::seconds(299))));
    assert!(w.contains(Some(now - Duration::seconds(300))));
    assert!(!w.contains(Some(now - Duration::seconds(301))));
    assert_eq!(w.place(Some(now - Duration::seconds(301))), Placement::Before);
    assert_eq!(w.start(), now - Duration::seconds(300));
    // Unknown time is in the window
    assert!(w.contains(None));
    // Slightly-in-the-future records are fine when there is no explicit end
    assert!(w.contains(Some(now + Duration::seconds(5))));
}

#[test]
fn test_window_explicit_end() {
    let end = noon();
    let w = Window::ending_at(end, 60);
    assert!(w.contains(Some(end)));
    assert!(w.contains(Some(end - Duration::seconds(60))));
    assert_eq!(w.place(Some(end + Duration::seconds(1))), Placement::After);
    assert_eq!(w.place(Some(end - Duration::seconds(61))), Placement::Before);
    assert!(w.contains(None));
}

#[test]
fn test_window_huge_span() {
    let now = noon();
    let w = Window::trailing(now, i64::MAX);
    assert!(w.contains(Some(now - Duration::days(365 * 1000))));
    assert_eq!(w.start(), DateTime::<Utc>::MIN_UTC);
}

#[test]
fn test_early_stop() {
    let mut stop = EarlyStop::new();
    for _ in 0..OUT_OF_WINDOW_LIMIT {
        assert!(!stop.observe(Placement::Before));
    }
    // An in-window record resets the count
    assert!(!stop.observe(Placement::Inside));
    for _ in 0..OUT_OF_WINDOW_LIMIT {
        assert!(!stop.observe(Placement::Before));
    }
    // Too-new records are neutral
    assert!(!stop.observe(Placement::After));
    assert!(stop.observe(Placement::Before));
}
