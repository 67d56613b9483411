/// Present a set of reports as fixed-width text, as an html document, as csv, or as json.
///
/// The cells have already been rendered by the report builder, so all the formatters agree on the
/// numbers; what differs is layout.  Text is laid out for a terminal: numeric columns first at a
/// fixed width, then the identifier, cut to whatever is left of the terminal width.  When the
/// output is not a terminal there is no width and nothing is cut.
use crate::report::{Report, Row};

use anyhow::{bail, Result};
use phplog::Metric;
use std::io::{self, Write};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Html,
    Csv,
    Json,
}

impl FromStr for OutputMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<OutputMode> {
        match s {
            "text" => Ok(OutputMode::Text),
            "html" | "markup" => Ok(OutputMode::Html),
            "csv" => Ok(OutputMode::Csv),
            "json" => Ok(OutputMode::Json),
            _ => bail!("Unknown output mode '{s}'"),
        }
    }
}

pub const NUM_WIDTH: usize = 9;
pub const MIN_IDENT_WIDTH: usize = 10;

const TEMPLATE: &str = include_str!("report.html");

/// Everything the formatters need besides the reports.  `width` is the terminal width for text
/// output, None if unlimited.  `footer` is plain text, it is escaped as necessary.

pub struct Presentation {
    pub mode: OutputMode,
    pub width: Option<usize>,
    pub title: String,
    pub footer: String,
}

pub fn format_reports(
    output: &mut dyn io::Write,
    reports: &[Report],
    p: &Presentation,
) -> Result<()> {
    match p.mode {
        OutputMode::Text => format_text(output, reports, p.width),
        OutputMode::Html => format_html(output, reports, &p.title, &p.footer),
        OutputMode::Csv => format_csv(output, reports),
        OutputMode::Json => format_json(output, reports),
    }
}

fn header_label(m: Metric) -> &'static str {
    match m {
        Metric::Hit => "Hit",
        Metric::Time => "Time",
        Metric::User => "User",
        Metric::Sys => "Sys",
        Metric::Mem => "Mem/hit",
        Metric::MemMax => "Mem_max",
    }
}

fn format_text(output: &mut dyn io::Write, reports: &[Report], width: Option<usize>) -> Result<()> {
    let ident_width = match width {
        Some(w) => {
            let numeric = Metric::ALL.len() * (NUM_WIDTH + 1);
            if w < numeric + MIN_IDENT_WIDTH {
                bail!(
                    "Terminal too narrow: {w} columns, need at least {}",
                    numeric + MIN_IDENT_WIDTH
                );
            }
            Some(w - numeric)
        }
        None => None,
    };

    for (i, report) in reports.iter().enumerate() {
        if i > 0 {
            output.write_all(b"\n")?;
        }
        let mut s = "".to_string();
        for m in &report.columns {
            let label = if *m == report.sort_key {
                header_label(*m).to_uppercase()
            } else {
                header_label(*m).to_string()
            };
            s += format!("{:>NUM_WIDTH$} ", label).as_str();
        }
        s += "URL";
        writeln!(output, "{}", s.trim_end())?;

        for row in report.rows.iter().chain(std::iter::once(&report.total)) {
            let mut s = "".to_string();
            for cell in &row.cells {
                s += format!("{:>NUM_WIDTH$} ", cell).as_str();
            }
            s += &cut(&row.ident, ident_width);
            writeln!(output, "{}", s.trim_end())?;
        }
    }
    Ok(())
}

fn cut(s: &str, width: Option<usize>) -> String {
    match width {
        Some(w) if s.chars().count() > w => {
            let mut t = s.chars().take(w - 3).collect::<String>();
            t += "...";
            t
        }
        _ => s.to_string(),
    }
}

fn format_html(
    output: &mut dyn io::Write,
    reports: &[Report],
    title: &str,
    footer: &str,
) -> Result<()> {
    let mut tables = "".to_string();
    for report in reports {
        tables += "<table class=\"report\">\n";
        tables += &format!("<caption>Sorted by {}</caption>\n", report.sort_key);
        tables += "<tr>";
        for m in &report.columns {
            tables += &format!(
                "<th class=\"{}\">{}</th>",
                cell_class("num", *m == report.sort_key),
                escape_html(header_label(*m))
            );
        }
        tables += "<th class=\"url\">URL</th></tr>\n";
        for row in &report.rows {
            tables += &html_row(report, row, "<tr>");
        }
        tables += &html_row(report, &report.total, "<tr class=\"sum\">");
        tables += "</table>\n";
    }

    let text = fill_template(
        TEMPLATE,
        &[
            ("title", escape_html(title)),
            ("tables", tables),
            ("footer", escape_html(footer)),
        ],
    );
    output.write_all(text.as_bytes())?;
    Ok(())
}

fn cell_class(base: &str, sorted: bool) -> String {
    if sorted {
        format!("{base} sort")
    } else {
        base.to_string()
    }
}

fn html_row(report: &Report, row: &Row, open: &str) -> String {
    let mut s = open.to_string();
    for (m, cell) in report.columns.iter().zip(row.cells.iter()) {
        s += &format!(
            "<td class=\"{}\">{}</td>",
            cell_class("num", *m == report.sort_key),
            escape_html(cell)
        );
    }
    s += &format!("<td class=\"url\">{}</td></tr>\n", escape_html(&row.ident));
    s
}

fn escape_html(s: &str) -> String {
    let mut t = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => t += "&amp;",
            '<' => t += "&lt;",
            '>' => t += "&gt;",
            '"' => t += "&quot;",
            '\'' => t += "&#39;",
            _ => t.push(c),
        }
    }
    t
}

/// Replace `{{name}}` in the template by the value for name.  Substituted text is not rescanned,
/// and unknown placeholders are left alone.

fn fill_template(template: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out += &rest[..start];
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = &after[..end];
                match values.iter().find(|(k, _)| *k == name) {
                    Some((_, v)) => out += v,
                    None => {
                        out += "{{";
                        out += name;
                        out += "}}";
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out += &rest[start..];
                rest = "";
            }
        }
    }
    out += rest;
    out
}

fn format_csv(output: &mut dyn io::Write, reports: &[Report]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(output);

    for report in reports {
        let mut header = vec!["sort".to_string()];
        for m in &report.columns {
            header.push(m.name().to_string());
        }
        header.push("url".to_string());
        writer.write_record(&header)?;

        for row in report.rows.iter().chain(std::iter::once(&report.total)) {
            let mut fields = vec![report.sort_key.name().to_string()];
            fields.extend(row.cells.iter().cloned());
            fields.push(row.ident.clone());
            writer.write_record(&fields)?;
        }
    }

    writer.flush()?;
    Ok(())
}

fn json_row(report: &Report, row: &Row) -> json::JsonValue {
    let mut obj = json::JsonValue::new_object();
    for (m, cell) in report.columns.iter().zip(row.cells.iter()) {
        obj[m.name()] = cell.clone().into();
    }
    obj["url"] = row.ident.clone().into();
    obj
}

fn format_json(output: &mut dyn io::Write, reports: &[Report]) -> Result<()> {
    let mut objects = vec![];
    for report in reports {
        let mut obj = json::JsonValue::new_object();
        obj["sort"] = report.sort_key.name().into();
        obj["rows"] = report
            .rows
            .iter()
            .map(|row| json_row(report, row))
            .collect::<Vec<json::JsonValue>>()
            .into();
        obj["total"] = json_row(report, &report.total);
        objects.push(obj);
    }
    output.write_all(json::stringify(objects).as_bytes())?;
    output.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
use crate::report::{build_report, RenderPolicy, ReportContext};

#[cfg(test)]
fn sample_reports(keys: &[Metric]) -> Vec<Report> {
    use phplog::{FinalizedEntry, Summary};
    use ustr::Ustr;

    let summary = Summary {
        entries: vec![
            FinalizedEntry {
                ident: Ustr::from("/shop/cart.php"),
                hit: 3,
                time: Some(1.5),
                user: Some(0.7),
                sys: Some(0.2),
                mem: Some(2.0),
                mem_max: Some(4.0),
            },
            FinalizedEntry {
                ident: Ustr::from("/search.php?q=<b>&x=1"),
                hit: 1,
                time: Some(2.0),
                user: None,
                sys: None,
                mem: Some(1.0),
                mem_max: Some(1.0),
            },
        ],
        hits: 4,
        bogus: 0,
    };
    let ctx = ReportContext {
        count: 10,
        policy: RenderPolicy::Absolute,
        span_secs: 300,
        hits: 4,
    };
    keys.iter().map(|k| build_report(&summary, *k, &ctx)).collect()
}

#[cfg(test)]
fn render(reports: &[Report], mode: OutputMode, width: Option<usize>) -> Result<String> {
    let p = Presentation {
        mode,
        width,
        title: "phptop <test>".to_string(),
        footer: "host & date".to_string(),
    };
    let mut out = vec![];
    format_reports(&mut out, reports, &p)?;
    Ok(String::from_utf8(out).unwrap())
}

#[test]
fn test_output_modes() {
    assert_eq!(OutputMode::from_str("text").unwrap(), OutputMode::Text);
    assert_eq!(OutputMode::from_str("markup").unwrap(), OutputMode::Html);
    assert_eq!(OutputMode::from_str("html").unwrap(), OutputMode::Html);
    assert_eq!(OutputMode::from_str("csv").unwrap(), OutputMode::Csv);
    assert_eq!(OutputMode::from_str("json").unwrap(), OutputMode::Json);
    assert!(OutputMode::from_str("xml").is_err());
}

#[test]
fn test_text() {
    let reports = sample_reports(&[Metric::Time, Metric::Hit]);
    let s = render(&reports, OutputMode::Text, None).unwrap();
    let lines = s.lines().collect::<Vec<&str>>();
    assert_eq!(
        lines[0],
        "      Hit      TIME      User       Sys   Mem/hit   Mem_max URL"
    );
    assert_eq!(
        lines[1],
        format!(
            "{:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {}",
            "1", "2.0", "", "", "1.0", "1.0", "/search.php?q=<b>&x=1"
        )
    );
    assert_eq!(
        lines[2],
        format!(
            "{:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {}",
            "3", "1.5", "0.7", "0.2", "2.0", "4.0", "/shop/cart.php"
        )
    );
    assert_eq!(
        lines[3],
        format!(
            "{:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {}",
            "4", "3.5", "0.7", "0.2", "", "", "Total (300s)"
        )
    );
    // Blank line, then the second report with its own highlighted header
    assert_eq!(lines[4], "");
    assert!(lines[5].starts_with("      HIT      Time"));
    assert!(lines[6].ends_with("/shop/cart.php"));
    assert_eq!(lines.len(), 9);
}

#[test]
fn test_text_width() {
    let reports = sample_reports(&[Metric::Time]);
    let s = render(&reports, OutputMode::Text, Some(72)).unwrap();
    let lines = s.lines().collect::<Vec<&str>>();
    assert!(lines[1].ends_with(" /search.p..."));
    assert!(lines[2].ends_with(" /shop/car..."));
    assert!(lines.iter().all(|l| l.chars().count() <= 72));

    let s = render(&reports, OutputMode::Text, Some(200)).unwrap();
    assert!(s.contains("/search.php?q=<b>&x=1"));

    let e = render(&reports, OutputMode::Text, Some(69));
    assert!(e.is_err());
    assert!(render(&reports, OutputMode::Text, Some(70)).is_ok());
}

#[test]
fn test_html() {
    let reports = sample_reports(&[Metric::Time, Metric::Mem]);
    let s = render(&reports, OutputMode::Html, None).unwrap();
    assert!(s.starts_with("<!DOCTYPE html>"));
    assert!(!s.contains("{{"));
    assert!(s.contains("<title>phptop &lt;test&gt;</title>"));
    assert!(s.contains("host &amp; date"));
    assert_eq!(s.matches("<table class=\"report\">").count(), 2);
    assert!(s.contains("<caption>Sorted by mem</caption>"));
    assert!(s.contains("<th class=\"num sort\">Time</th>"));
    assert!(s.contains("<td class=\"url\">/search.php?q=&lt;b&gt;&amp;x=1</td>"));
    assert!(s.contains("<tr class=\"sum\"><td class=\"num\">4</td><td class=\"num sort\">3.5</td>"));
}

#[test]
fn test_fill_template() {
    let t = "a{{x}}b{{y}}c{{z}}d{{";
    let s = fill_template(t, &[("x", "{{y}}".to_string()), ("y", "2".to_string())]);
    assert_eq!(s, "a{{y}}b2c{{z}}d{{");
}

#[test]
fn test_csv() {
    let reports = sample_reports(&[Metric::Hit]);
    let s = render(&reports, OutputMode::Csv, None).unwrap();
    let lines = s.lines().collect::<Vec<&str>>();
    assert_eq!(lines[0], "sort,hit,time,user,sys,mem,mem_max,url");
    assert_eq!(lines[1], "hit,3,1.5,0.7,0.2,2.0,4.0,/shop/cart.php");
    assert_eq!(lines[2], "hit,1,2.0,,,1.0,1.0,/search.php?q=<b>&x=1");
    assert_eq!(lines[3], "hit,4,3.5,0.7,0.2,,,Total (300s)");
}

#[test]
fn test_json() {
    let reports = sample_reports(&[Metric::Time]);
    let s = render(&reports, OutputMode::Json, None).unwrap();
    let v = json::parse(&s).unwrap();
    assert_eq!(v.len(), 1);
    assert_eq!(v[0]["sort"], "time");
    assert_eq!(v[0]["rows"].len(), 2);
    assert_eq!(v[0]["rows"][0]["url"], "/search.php?q=<b>&x=1");
    assert_eq!(v[0]["rows"][0]["user"], "");
    assert_eq!(v[0]["rows"][1]["hit"], "3");
    assert_eq!(v[0]["total"]["time"], "3.5");
    assert_eq!(v[0]["total"]["url"], "Total (300s)");
}
