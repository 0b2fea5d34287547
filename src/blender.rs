//! Priority blend of per-source report lists into one deduplicated,
//! deterministically ordered region set.
//!
//! The blend is pure: identical inputs produce identical output. Winner
//! selection within a hex group follows a total order (priority, then
//! freshness, then message count, then source id), so no input ordering
//! can change the result.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::geo::{distance_miles, BoundingBox, Position};
use crate::model::{is_valid_hex, Aircraft, SourcePriority, SOURCE_BLENDED};

/// One source's contribution to a blend cycle.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    /// Provenance tag: `dump1090`, `opensky`, or `pi_station:<id>`.
    pub source_id: String,
    pub priority: SourcePriority,
    pub reports: Vec<Aircraft>,
}

/// Side-channel counters produced alongside the blended list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlendStats {
    /// Reports across all input batches.
    pub input_reports: usize,
    /// Dropped: malformed hex or unusable position.
    pub dropped_invalid: usize,
    /// Dropped: outside the region's (widened) bounding box.
    pub dropped_outside: usize,
    /// Hex groups fused from two or more distinct sources.
    pub blended_groups: usize,
    /// Surviving reports per contributing source.
    pub contributions: BTreeMap<String, usize>,
}

/// Blend result: the deduplicated region set plus its counters.
#[derive(Debug, Clone)]
pub struct BlendOutcome {
    pub aircraft: Vec<Aircraft>,
    pub stats: BlendStats,
}

struct Candidate {
    source_id: String,
    priority: SourcePriority,
    report: Aircraft,
}

fn seen_rank(seen: Option<f64>) -> f64 {
    seen.unwrap_or(f64::INFINITY)
}

/// Total order on candidates within one hex group; `Greater` wins.
fn candidate_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.priority
        .cmp(&b.priority)
        // Smaller `seen` is fresher and wins.
        .then_with(|| seen_rank(b.report.seen).total_cmp(&seen_rank(a.report.seen)))
        .then_with(|| {
            a.report
                .messages
                .unwrap_or(0)
                .cmp(&b.report.messages.unwrap_or(0))
        })
        // Lexicographically smaller source id wins.
        .then_with(|| b.source_id.cmp(&a.source_id))
}

/// Merge per-source batches into one record per hex.
pub fn blend(batches: &[SourceBatch], bbox: BoundingBox, center: Position) -> BlendOutcome {
    let mut stats = BlendStats::default();
    let mut groups: HashMap<String, Vec<Candidate>> = HashMap::new();

    for batch in batches {
        for report in &batch.reports {
            stats.input_reports += 1;

            let (Some(lat), Some(lon)) = (report.lat, report.lon) else {
                stats.dropped_invalid += 1;
                continue;
            };
            if !is_valid_hex(&report.hex) {
                stats.dropped_invalid += 1;
                continue;
            }
            let position = Position::new(lat, lon);
            if !bbox.contains(position) {
                stats.dropped_outside += 1;
                continue;
            }

            let mut report = report.clone();
            report.distance_miles =
                Some((distance_miles(position, center) * 100.0).round() / 100.0);

            *stats.contributions.entry(batch.source_id.clone()).or_default() += 1;
            groups.entry(report.hex.clone()).or_default().push(Candidate {
                source_id: batch.source_id.clone(),
                priority: batch.priority,
                report,
            });
        }
    }

    let mut aircraft = Vec::with_capacity(groups.len());
    for (_, candidates) in groups {
        let distinct_sources: HashSet<&str> = candidates
            .iter()
            .map(|c| c.source_id.as_str())
            .collect();

        let winner = candidates
            .iter()
            .max_by(|a, b| candidate_order(a, b))
            .expect("group is never empty");

        let mut record = winner.report.clone();
        if distinct_sources.len() >= 2 {
            record.data_source = SOURCE_BLENDED.to_string();
            stats.blended_groups += 1;
        }
        aircraft.push(record);
    }

    aircraft.sort_by(|a, b| {
        a.distance_miles
            .unwrap_or(f64::INFINITY)
            .total_cmp(&b.distance_miles.unwrap_or(f64::INFINITY))
            .then_with(|| a.hex.cmp(&b.hex))
    });

    BlendOutcome { aircraft, stats }
}
