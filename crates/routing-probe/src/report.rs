//! Per-region summary of stored measurements.

use crate::persistence::{Node, StoreSnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;
use uuid::Uuid;

/// Which records enter the report.
#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    /// Skip records taken with a smaller routing table (warming-up nodes).
    pub min_rt_size: usize,
    pub instance_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ReportFilter {
    fn accepts(&self, node: &Node, rt_size: usize, created_at: DateTime<Utc>) -> bool {
        rt_size >= self.min_rt_size
            && self
                .instance_type
                .as_ref()
                .is_none_or(|t| *t == node.instance_type)
            && self.since.is_none_or(|since| created_at >= since)
            && self.until.is_none_or(|until| created_at < until)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionStats {
    pub region: String,
    pub count: usize,
    pub errors: usize,
    pub error_rate: f64,
    #[serde(with = "humantime_serde")]
    pub p50: Duration,
    #[serde(with = "humantime_serde")]
    pub p90: Duration,
    #[serde(with = "humantime_serde")]
    pub p99: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub provides: Vec<RegionStats>,
    pub retrievals: Vec<RegionStats>,
}

impl Report {
    pub fn build(snapshot: &StoreSnapshot, filter: &ReportFilter) -> Self {
        let nodes: BTreeMap<Uuid, &Node> = snapshot.nodes.iter().map(|n| (n.id, n)).collect();

        let provides = group(
            &nodes,
            filter,
            snapshot.provides.iter().map(|p| {
                (
                    p.node_id,
                    p.routing_table_size,
                    p.created_at,
                    p.duration,
                    p.error.is_some(),
                )
            }),
        );
        let retrievals = group(
            &nodes,
            filter,
            snapshot.retrievals.iter().map(|r| {
                (
                    r.node_id,
                    r.routing_table_size,
                    r.created_at,
                    r.duration,
                    r.error.is_some(),
                )
            }),
        );

        Self {
            provides,
            retrievals,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.provides.is_empty() && self.retrievals.is_empty()
    }

    /// Plain text tables.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (title, rows) in [("Provides", &self.provides), ("Retrievals", &self.retrievals)] {
            let _ = writeln!(out, "{}", title);
            let _ = writeln!(
                out,
                "  {:<16} {:>8} {:>8} {:>10} {:>10} {:>10}",
                "region", "count", "err rate", "p50", "p90", "p99"
            );
            if rows.is_empty() {
                let _ = writeln!(out, "  (no records)");
            }
            for row in rows {
                let _ = writeln!(
                    out,
                    "  {:<16} {:>8} {:>7.1}% {:>10.3} {:>10.3} {:>10.3}",
                    row.region,
                    row.count,
                    row.error_rate * 100.0,
                    row.p50.as_secs_f64(),
                    row.p90.as_secs_f64(),
                    row.p99.as_secs_f64(),
                );
            }
            out.push('\n');
        }
        out
    }
}

type Sample = (Uuid, usize, DateTime<Utc>, Duration, bool);

fn group(
    nodes: &BTreeMap<Uuid, &Node>,
    filter: &ReportFilter,
    samples: impl Iterator<Item = Sample>,
) -> Vec<RegionStats> {
    let mut by_region: BTreeMap<&str, (Vec<Duration>, usize)> = BTreeMap::new();
    for (node_id, rt_size, created_at, duration, failed) in samples {
        let Some(node) = nodes.get(&node_id) else {
            continue;
        };
        if !filter.accepts(node, rt_size, created_at) {
            continue;
        }
        let entry = by_region.entry(node.region.as_str()).or_default();
        entry.0.push(duration);
        entry.1 += usize::from(failed);
    }

    by_region
        .into_iter()
        .map(|(region, (mut durations, errors))| {
            durations.sort_unstable();
            RegionStats {
                region: region.to_string(),
                count: durations.len(),
                errors,
                error_rate: errors as f64 / durations.len() as f64,
                p50: percentile(&durations, 0.50),
                p90: percentile(&durations, 0.90),
                p99: percentile(&durations, 0.99),
            }
        })
        .collect()
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[Duration], q: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (q.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
