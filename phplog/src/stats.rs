/// Finalized per-identifier statistics, ready for reporting.
use anyhow::{bail, Result};
use std::fmt;
use std::str::FromStr;
use ustr::Ustr;

pub const MEGABYTE: f64 = 1048576.0;

/// The quantities a report can show and sort by.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Hit,
    Time,
    User,
    Sys,
    Mem,
    MemMax,
}

impl Metric {
    /// All metrics in display order.
    pub const ALL: [Metric; 6] = [
        Metric::Hit,
        Metric::Time,
        Metric::User,
        Metric::Sys,
        Metric::Mem,
        Metric::MemMax,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Hit => "hit",
            Metric::Time => "time",
            Metric::User => "user",
            Metric::Sys => "sys",
            Metric::Mem => "mem",
            Metric::MemMax => "mem_max",
        }
    }

    /// Wall and CPU times, which can be averaged per hit and shown relative to the window span.
    pub fn is_time_domain(self) -> bool {
        matches!(self, Metric::Time | Metric::User | Metric::Sys)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Metric> {
        match s {
            "hit" => Ok(Metric::Hit),
            "time" => Ok(Metric::Time),
            "user" => Ok(Metric::User),
            "sys" => Ok(Metric::Sys),
            "mem" => Ok(Metric::Mem),
            "mem_max" => Ok(Metric::MemMax),
            _ => bail!("Unknown sort key '{s}'"),
        }
    }
}

/// Statistics for one identifier after finalization.  `mem` is the average peak memory per hit in
/// MB and `mem_max` the largest peak in MB; times are totals in seconds.

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedEntry {
    pub ident: Ustr,
    pub hit: u64,
    pub time: Option<f64>,
    pub user: Option<f64>,
    pub sys: Option<f64>,
    pub mem: Option<f64>,
    pub mem_max: Option<f64>,
}

impl FinalizedEntry {
    pub fn value(&self, m: Metric) -> Option<f64> {
        match m {
            Metric::Hit => Some(self.hit as f64),
            Metric::Time => self.time,
            Metric::User => self.user,
            Metric::Sys => self.sys,
            Metric::Mem => self.mem,
            Metric::MemMax => self.mem_max,
        }
    }
}

/// Everything ingestion produced: the finalized entries in no particular order, the number of
/// valid samples, and the number of bogus ones.

#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub entries: Vec<FinalizedEntry>,
    pub hits: u64,
    pub bogus: u64,
}

impl Summary {
    /// True if the bogus samples are at least 5% of the valid ones.
    pub fn too_many_bogus(&self) -> bool {
        self.bogus > 0 && self.bogus * 100 >= self.hits * 5
    }
}

#[test]
fn test_metric_names() {
    for m in Metric::ALL {
        assert_eq!(Metric::from_str(m.name()).unwrap(), m);
    }
    assert!(Metric::from_str("cpu").is_err());
    assert!(Metric::from_str("Time").is_err());
    assert!(Metric::Sys.is_time_domain());
    assert!(!Metric::Hit.is_time_domain());
    assert!(!Metric::MemMax.is_time_domain());
}

#[test]
fn test_bogus_ratio() {
    let mut s = Summary {
        entries: vec![],
        hits: 100,
        bogus: 4,
    };
    assert!(!s.too_many_bogus());
    s.bogus = 5;
    assert!(s.too_many_bogus());
    s.hits = 0;
    assert!(s.too_many_bogus());
    s.bogus = 0;
    assert!(!s.too_many_bogus());
}
