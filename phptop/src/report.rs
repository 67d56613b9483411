/// Build ranked reports from the finalized summary.
///
/// A report is computed per sort key: the entries sorted descending by that key (ties broken by
/// identifier, so the output is stable), the first `count` of them, and a total row summed over
/// *all* entries, not just the ones shown.  Every cell is rendered to a string here so that all the
/// output formats show the same numbers.
use phplog::{FinalizedEntry, Metric, Summary};

use std::cmp::Ordering;

/// How numbers are shown.  This is resolved once from the command line flags so that all cells of
/// all reports agree.
///
/// - Absolute: totals; times in seconds, memory in MB.
/// - Relative: times as a percentage of the window span, hits as a percentage of all hits.
/// - Average: times divided by the identifier's hits, with more decimals.
/// - RelativeAverage: per-hit times as a percentage of the span, hits as a percentage.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPolicy {
    Absolute,
    Relative,
    Average,
    RelativeAverage,
}

impl RenderPolicy {
    pub fn new(relative: bool, average: bool) -> RenderPolicy {
        match (relative, average) {
            (false, false) => RenderPolicy::Absolute,
            (true, false) => RenderPolicy::Relative,
            (false, true) => RenderPolicy::Average,
            (true, true) => RenderPolicy::RelativeAverage,
        }
    }

    fn per_hit(self) -> bool {
        matches!(self, RenderPolicy::Average | RenderPolicy::RelativeAverage)
    }

    fn relative(self) -> bool {
        matches!(self, RenderPolicy::Relative | RenderPolicy::RelativeAverage)
    }

    fn decimals(self) -> usize {
        if self.per_hit() {
            3
        } else {
            1
        }
    }
}

pub struct ReportContext {
    /// Max number of rows, 0 for all
    pub count: usize,
    pub policy: RenderPolicy,
    pub span_secs: i64,
    /// Valid hits across all identifiers
    pub hits: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub ident: String,
    /// Raw values, in the order of `Report::columns`
    pub values: Vec<Option<f64>>,
    /// Rendered values, ditto; absent values are empty strings
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub sort_key: Metric,
    pub columns: Vec<Metric>,
    pub rows: Vec<Row>,
    pub total: Row,
}

pub fn build_report(summary: &Summary, sort_key: Metric, ctx: &ReportContext) -> Report {
    let mut entries = summary.entries.iter().collect::<Vec<&FinalizedEntry>>();
    entries.sort_by(|a, b| {
        let va = a.value(sort_key).unwrap_or(0.0);
        let vb = b.value(sort_key).unwrap_or(0.0);
        vb.partial_cmp(&va)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.ident.as_str().cmp(b.ident.as_str()))
    });
    if ctx.count > 0 {
        entries.truncate(ctx.count);
    }

    let columns = Metric::ALL.to_vec();
    let rows = entries
        .iter()
        .map(|e| {
            let values = columns.iter().map(|m| e.value(*m)).collect::<Vec<Option<f64>>>();
            make_row(e.ident.to_string(), e.hit, values, &columns, ctx)
        })
        .collect::<Vec<Row>>();

    let mut hit = 0u64;
    let mut time = None;
    let mut user = None;
    let mut sys = None;
    for e in &summary.entries {
        hit += e.hit;
        sum_into(&mut time, e.time);
        sum_into(&mut user, e.user);
        sum_into(&mut sys, e.sys);
    }
    let total_values = columns
        .iter()
        .map(|m| match m {
            Metric::Hit => Some(hit as f64),
            Metric::Time => time,
            Metric::User => user,
            Metric::Sys => sys,
            Metric::Mem | Metric::MemMax => None,
        })
        .collect::<Vec<Option<f64>>>();
    let total = make_row(
        format!("Total ({}s)", ctx.span_secs),
        hit,
        total_values,
        &columns,
        ctx,
    );

    Report {
        sort_key,
        columns,
        rows,
        total,
    }
}

fn sum_into(slot: &mut Option<f64>, v: Option<f64>) {
    if let Some(v) = v {
        *slot = Some(slot.unwrap_or(0.0) + v);
    }
}

fn make_row(
    ident: String,
    hit: u64,
    values: Vec<Option<f64>>,
    columns: &[Metric],
    ctx: &ReportContext,
) -> Row {
    let cells = columns
        .iter()
        .zip(values.iter())
        .map(|(m, v)| render_cell(*m, *v, hit, ctx))
        .collect::<Vec<String>>();
    Row {
        ident,
        values,
        cells,
    }
}

/// Render one value.  `hit` is the hit count of the row the value belongs to.

pub fn render_cell(metric: Metric, value: Option<f64>, hit: u64, ctx: &ReportContext) -> String {
    let Some(mut v) = value else {
        return String::new();
    };
    match metric {
        Metric::Hit => {
            if ctx.policy.relative() && ctx.hits > 0 {
                format!("{:.1}%", v * 100.0 / ctx.hits as f64)
            } else {
                format!("{}", v as u64)
            }
        }
        Metric::Time | Metric::User | Metric::Sys => {
            if ctx.policy.per_hit() && hit > 0 {
                v /= hit as f64;
            }
            let decimals = ctx.policy.decimals();
            if ctx.policy.relative() && ctx.span_secs > 0 {
                format!("{:.decimals$}%", v * 100.0 / ctx.span_secs as f64)
            } else {
                format!("{v:.decimals$}")
            }
        }
        Metric::Mem | Metric::MemMax => {
            let decimals = ctx.policy.decimals();
            format!("{v:.decimals$}")
        }
    }
}

#[cfg(test)]
use ustr::Ustr;

#[cfg(test)]
fn entry(ident: &str, hit: u64, time: f64, mem: f64) -> FinalizedEntry {
    FinalizedEntry {
        ident: Ustr::from(ident),
        hit,
        time: Some(time),
        user: Some(time / 2.0),
        sys: Some(time / 4.0),
        mem: Some(mem),
        mem_max: Some(mem * 2.0),
    }
}

#[cfg(test)]
fn summary() -> Summary {
    Summary {
        entries: vec![
            entry("/b", 5, 2.0, 1.0),
            entry("/a", 80, 8.0, 3.0),
            entry("/c", 5, 2.0, 9.0),
            entry("/d", 10, 1.0, 0.5),
        ],
        hits: 100,
        bogus: 0,
    }
}

#[cfg(test)]
fn context(count: usize, policy: RenderPolicy) -> ReportContext {
    ReportContext {
        count,
        policy,
        span_secs: 300,
        hits: 100,
    }
}

#[test]
fn test_policy_from_flags() {
    assert_eq!(RenderPolicy::new(false, false), RenderPolicy::Absolute);
    assert_eq!(RenderPolicy::new(true, false), RenderPolicy::Relative);
    assert_eq!(RenderPolicy::new(false, true), RenderPolicy::Average);
    assert_eq!(RenderPolicy::new(true, true), RenderPolicy::RelativeAverage);
}

#[test]
fn test_sort_and_tie_break() {
    let s = summary();
    let r = build_report(&s, Metric::Time, &context(0, RenderPolicy::Absolute));
    let idents = r.rows.iter().map(|r| r.ident.as_str()).collect::<Vec<&str>>();
    // /b and /c tie on time and are ordered by name
    assert_eq!(idents, vec!["/a", "/b", "/c", "/d"]);

    let r = build_report(&s, Metric::Mem, &context(0, RenderPolicy::Absolute));
    let idents = r.rows.iter().map(|r| r.ident.as_str()).collect::<Vec<&str>>();
    assert_eq!(idents, vec!["/c", "/a", "/b", "/d"]);

    // Non-increasing in the sort key
    for key in Metric::ALL {
        let r = build_report(&s, key, &context(0, RenderPolicy::Absolute));
        let col = r.columns.iter().position(|m| *m == key).unwrap();
        for w in r.rows.windows(2) {
            assert!(w[0].values[col].unwrap_or(0.0) >= w[1].values[col].unwrap_or(0.0));
        }
    }
}

#[test]
fn test_top_n_and_total() {
    let s = summary();
    let r = build_report(&s, Metric::Hit, &context(2, RenderPolicy::Absolute));
    assert_eq!(r.rows.len(), 2);
    assert_eq!(r.rows[0].ident, "/a");
    assert_eq!(r.rows[1].ident, "/d");
    // The total covers all entries, not just the two shown
    assert_eq!(r.total.ident, "Total (300s)");
    assert_eq!(r.total.cells[0], "100");
    assert_eq!(r.total.values[1], Some(13.0));
    assert_eq!(r.total.cells[1], "13.0");
    assert_eq!(r.total.cells[2], "6.5");
    assert_eq!(r.total.cells[4], "");
    assert_eq!(r.total.cells[5], "");
}

#[test]
fn test_absolute_cells() {
    let ctx = context(0, RenderPolicy::Absolute);
    assert_eq!(render_cell(Metric::Hit, Some(5.0), 5, &ctx), "5");
    assert_eq!(render_cell(Metric::Time, Some(3.0), 2, &ctx), "3.0");
    assert_eq!(render_cell(Metric::Mem, Some(1.5), 2, &ctx), "1.5");
    assert_eq!(render_cell(Metric::MemMax, Some(2.0), 2, &ctx), "2.0");
    assert_eq!(render_cell(Metric::Sys, None, 2, &ctx), "");
}

#[test]
fn test_relative_cells() {
    let ctx = context(0, RenderPolicy::Relative);
    assert_eq!(render_cell(Metric::Hit, Some(5.0), 5, &ctx), "5.0%");
    assert_eq!(render_cell(Metric::Time, Some(30.0), 5, &ctx), "10.0%");
    // Memory ignores relative mode
    assert_eq!(render_cell(Metric::Mem, Some(1.5), 5, &ctx), "1.5");
}

#[test]
fn test_average_cells() {
    let ctx = context(0, RenderPolicy::Average);
    assert_eq!(render_cell(Metric::Time, Some(3.0), 2, &ctx), "1.500");
    assert_eq!(render_cell(Metric::User, Some(1.0), 4, &ctx), "0.250");
    assert_eq!(render_cell(Metric::Hit, Some(4.0), 4, &ctx), "4");
    assert_eq!(render_cell(Metric::Mem, Some(1.5), 2, &ctx), "1.500");

    let ctx = context(0, RenderPolicy::RelativeAverage);
    assert_eq!(render_cell(Metric::Time, Some(6.0), 2, &ctx), "1.000%");
    assert_eq!(render_cell(Metric::Hit, Some(5.0), 5, &ctx), "5.0%");
}

#[test]
fn test_average_total_row() {
    let s = summary();
    let r = build_report(&s, Metric::Time, &context(1, RenderPolicy::Average));
    // 13 seconds over 100 hits
    assert_eq!(r.total.cells[1], "0.130");
    assert_eq!(r.rows[0].cells[1], "0.100");
}
