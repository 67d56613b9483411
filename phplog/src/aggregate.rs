/// Accumulate samples per request identifier.
///
/// The aggregator owns the map from identifier to running totals and the global hit and bogus
/// counters.  It is filled during ingestion and then consumed by `finalize`, which turns it into the
/// read-only `Summary` used for reporting.
///
/// A malformed sample for an identifier normally throws away everything accumulated for that
/// identifier so far: a bucket with one corrupted sample in it is worse than no bucket.  The
/// `Salvage` policy keeps the bucket and rejects only the bad sample.
use crate::record::{Metrics, MetricRecord};
use crate::stats::{FinalizedEntry, Summary, MEGABYTE};

use std::collections::HashMap;
use ustr::Ustr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationPolicy {
    #[default]
    DropBucket,
    Salvage,
}

/// Running totals for one identifier.  `mem` is the sum of the per-sample peaks, in bytes;
/// `mem_max` is the largest of them.

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AggregateEntry {
    pub hit: u64,
    pub time: Option<f64>,
    pub user: Option<f64>,
    pub sys: Option<f64>,
    pub mem: Option<f64>,
    pub mem_max: Option<f64>,
}

impl AggregateEntry {
    fn add(&mut self, m: &Metrics) {
        sum_into(&mut self.time, m.time);
        sum_into(&mut self.user, m.user);
        sum_into(&mut self.sys, m.sys);
        sum_into(&mut self.mem, m.mem);
        if let Some(mem) = m.mem {
            self.mem_max = Some(match self.mem_max {
                Some(max) => f64::max(max, mem),
                None => mem,
            });
        }
        self.hit += 1;
    }
}

fn sum_into(slot: &mut Option<f64>, v: Option<f64>) {
    if let Some(v) = v {
        *slot = Some(slot.unwrap_or(0.0) + v);
    }
}

#[derive(Debug, Default)]
pub struct Aggregator {
    entries: HashMap<Ustr, AggregateEntry>,
    hits: u64,
    bogus: u64,
    policy: InvalidationPolicy,
}

impl Aggregator {
    pub fn new(policy: InvalidationPolicy) -> Aggregator {
        Aggregator {
            entries: HashMap::new(),
            hits: 0,
            bogus: 0,
            policy,
        }
    }

    /// Add one validated sample.
    pub fn merge(&mut self, record: &MetricRecord) {
        self.entries
            .entry(record.ident)
            .or_default()
            .add(&record.metrics);
        self.hits += 1;
    }

    /// A malformed sample was seen for `ident`: drop its bucket (subject to the policy) and count
    /// the sample as bogus.  Hits already counted for the bucket stay in the global total.
    pub fn invalidate(&mut self, ident: Ustr) {
        if self.policy == InvalidationPolicy::DropBucket && self.entries.remove(&ident).is_some() {
            tracing::debug!(ident = ident.as_str(), "discarding samples after malformed record");
        }
        self.bogus += 1;
    }

    /// A truncated sample was seen; it is counted but affects no bucket.
    pub fn reject(&mut self) {
        self.bogus += 1;
    }

    pub fn get(&self, ident: &str) -> Option<&AggregateEntry> {
        self.entries.get(&Ustr::from(ident))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn bogus(&self) -> u64 {
        self.bogus
    }

    /// Turn the totals into per-hit and peak values in megabytes.  This consumes the aggregator, so
    /// it can only be done once and nothing can be merged afterwards.
    pub fn finalize(self) -> Summary {
        let entries = self
            .entries
            .into_iter()
            .map(|(ident, e)| FinalizedEntry {
                ident,
                hit: e.hit,
                time: e.time,
                user: e.user,
                sys: e.sys,
                mem: e.mem.map(|m| m / (e.hit as f64 * MEGABYTE)),
                mem_max: e.mem_max.map(|m| m / MEGABYTE),
            })
            .collect::<Vec<FinalizedEntry>>();
        Summary {
            entries,
            hits: self.hits,
            bogus: self.bogus,
        }
    }
}

#[cfg(test)]
fn record(ident: &str, time: f64, mem: f64) -> MetricRecord {
    MetricRecord {
        ident: Ustr::from(ident),
        timestamp: None,
        metrics: Metrics {
            time: Some(time),
            user: Some(time / 2.0),
            sys: Some(time / 10.0),
            mem: Some(mem),
        },
    }
}

#[test]
fn test_merge() {
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    agg.merge(&record("/a", 1.0, 1048576.0));
    agg.merge(&record("/a", 2.0, 2097152.0));
    agg.merge(&record("/b", 4.0, 10.0));
    assert_eq!(agg.len(), 2);
    assert_eq!(agg.hits(), 3);
    assert_eq!(agg.bogus(), 0);
    let a = agg.get("/a").unwrap();
    assert_eq!(a.hit, 2);
    assert_eq!(a.time, Some(3.0));
    assert_eq!(a.user, Some(1.5));
    assert_eq!(a.mem, Some(3145728.0));
    assert_eq!(a.mem_max, Some(2097152.0));
}

#[test]
fn test_absent_metrics_stay_absent() {
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    agg.merge(&MetricRecord {
        ident: Ustr::from("/x"),
        timestamp: None,
        metrics: Metrics {
            time: Some(1.0),
            ..Metrics::default()
        },
    });
    let x = agg.get("/x").unwrap();
    assert_eq!(x.hit, 1);
    assert_eq!(x.time, Some(1.0));
    assert_eq!(x.mem, None);
    assert_eq!(x.mem_max, None);
}

#[test]
fn test_invalidate() {
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    for _ in 0..5 {
        agg.merge(&record("/a", 1.0, 1.0));
    }
    agg.merge(&record("/b", 1.0, 1.0));
    agg.invalidate(Ustr::from("/a"));
    assert!(agg.get("/a").is_none());
    assert_eq!(agg.get("/b").unwrap().hit, 1);
    assert_eq!(agg.bogus(), 1);

    // A new bucket starts from scratch
    agg.merge(&record("/a", 1.0, 1.0));
    assert_eq!(agg.get("/a").unwrap().hit, 1);

    // Invalidating an identifier that has no bucket still counts
    agg.invalidate(Ustr::from("/nowhere"));
    assert_eq!(agg.bogus(), 2);

    agg.reject();
    assert_eq!(agg.bogus(), 3);
    assert_eq!(agg.get("/a").unwrap().hit, 1);
}

#[test]
fn test_salvage() {
    let mut agg = Aggregator::new(InvalidationPolicy::Salvage);
    agg.merge(&record("/a", 1.0, 1.0));
    agg.invalidate(Ustr::from("/a"));
    assert_eq!(agg.get("/a").unwrap().hit, 1);
    assert_eq!(agg.bogus(), 1);
}

#[test]
fn test_finalize() {
    let mut agg = Aggregator::new(InvalidationPolicy::DropBucket);
    agg.merge(&record("/a", 1.0, 1048576.0));
    agg.merge(&record("/a", 2.0, 2097152.0));
    agg.reject();
    let summary = agg.finalize();
    assert_eq!(summary.hits, 2);
    assert_eq!(summary.bogus, 1);
    assert_eq!(summary.entries.len(), 1);
    let a = &summary.entries[0];
    assert_eq!(a.hit, 2);
    assert_eq!(a.mem, Some(1.5));
    assert_eq!(a.mem_max, Some(2.0));
    assert_eq!(a.time, Some(3.0));
}
