//! Per-region counters and gauges.
//!
//! In-process totals use relaxed atomics; every cycle the scheduler also
//! publishes monotonic counters and last-cycle gauges to the cache under
//! `stats:{region}:*`. All published values are advisory and may be reset.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cache::{keys, CachePipeline};

/// Cycle-duration histogram bucket upper bounds, milliseconds.
const DURATION_BUCKETS_MS: [u64; 5] = [100, 500, 1000, 5000, 15000];

/// Measurements from one completed cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub duration: Duration,
    pub input_reports: usize,
    pub output_records: usize,
    pub helicopters: usize,
    pub timeouts: usize,
    pub source_errors: usize,
    pub enrichment_hits: usize,
    pub blended_groups: usize,
    /// Surviving reports per contributing source.
    pub contributions: BTreeMap<String, usize>,
}

impl CycleReport {
    /// Share of input reports removed by deduplication, in percent.
    pub fn dedup_ratio_pct(&self) -> u64 {
        if self.input_reports == 0 || self.output_records >= self.input_reports {
            return 0;
        }
        ((self.input_reports - self.output_records) * 100 / self.input_reports) as u64
    }

    /// Share of output records that found a registry entry, in percent.
    pub fn enrichment_hit_pct(&self) -> u64 {
        if self.output_records == 0 {
            return 0;
        }
        (self.enrichment_hits * 100 / self.output_records) as u64
    }
}

/// Histogram bucket name for a cycle duration.
fn duration_bucket(duration: Duration) -> String {
    let ms = duration.as_millis() as u64;
    for bound in DURATION_BUCKETS_MS {
        if ms <= bound {
            return format!("cycle_ms_le_{bound}");
        }
    }
    "cycle_ms_overflow".to_string()
}

/// In-process totals for one region.
#[derive(Debug, Default)]
pub struct RegionStats {
    pub cycles: AtomicU64,
    pub aircraft_observed: AtomicU64,
    pub helicopters_observed: AtomicU64,
    pub timeouts: AtomicU64,
    pub source_errors: AtomicU64,
    pub last_cycle_ms: AtomicU64,
}

/// Point-in-time copy of the totals.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub aircraft_observed: u64,
    pub helicopters_observed: u64,
    pub timeouts: u64,
    pub source_errors: u64,
    pub last_cycle_ms: u64,
}

impl RegionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one cycle into the in-process totals.
    pub fn record(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.aircraft_observed
            .fetch_add(report.output_records as u64, Ordering::Relaxed);
        self.helicopters_observed
            .fetch_add(report.helicopters as u64, Ordering::Relaxed);
        self.timeouts
            .fetch_add(report.timeouts as u64, Ordering::Relaxed);
        self.source_errors
            .fetch_add(report.source_errors as u64, Ordering::Relaxed);
        self.last_cycle_ms
            .store(report.duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            aircraft_observed: self.aircraft_observed.load(Ordering::Relaxed),
            helicopters_observed: self.helicopters_observed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_ms.load(Ordering::Relaxed),
        }
    }
}

/// Queue the cycle's counter increments and gauges onto a pipeline.
pub fn publish(region: &str, report: &CycleReport, pipe: &mut CachePipeline) {
    pipe.incr_by(&keys::stat(region, "cycles"), 1);
    pipe.incr_by(
        &keys::stat(region, "aircraft_observed"),
        report.output_records as u64,
    );
    pipe.incr_by(
        &keys::stat(region, "helicopters_observed"),
        report.helicopters as u64,
    );
    if report.timeouts > 0 {
        pipe.incr_by(&keys::stat(region, "timeouts"), report.timeouts as u64);
    }
    if report.source_errors > 0 {
        pipe.incr_by(
            &keys::stat(region, "source_errors"),
            report.source_errors as u64,
        );
    }
    if report.blended_groups > 0 {
        pipe.incr_by(
            &keys::stat(region, "blended_records"),
            report.blended_groups as u64,
        );
    }
    for (source, count) in &report.contributions {
        pipe.incr_by(
            &keys::stat(region, &format!("observed:{source}")),
            *count as u64,
        );
    }

    pipe.set_i64(
        &keys::stat(region, "last_cycle_ms"),
        report.duration.as_millis() as i64,
    );
    pipe.set_i64(
        &keys::stat(region, "last_dedup_ratio_pct"),
        report.dedup_ratio_pct() as i64,
    );
    pipe.set_i64(
        &keys::stat(region, "last_enrichment_hit_pct"),
        report.enrichment_hit_pct() as i64,
    );
    pipe.incr_by(&keys::stat(region, &duration_bucket(report.duration)), 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_buckets() {
        assert_eq!(duration_bucket(Duration::from_millis(50)), "cycle_ms_le_100");
        assert_eq!(duration_bucket(Duration::from_millis(100)), "cycle_ms_le_100");
        assert_eq!(duration_bucket(Duration::from_millis(101)), "cycle_ms_le_500");
        assert_eq!(duration_bucket(Duration::from_millis(4000)), "cycle_ms_le_5000");
        assert_eq!(duration_bucket(Duration::from_secs(60)), "cycle_ms_overflow");
    }

    #[test]
    fn test_dedup_ratio() {
        let report = CycleReport {
            input_reports: 10,
            output_records: 7,
            ..Default::default()
        };
        assert_eq!(report.dedup_ratio_pct(), 30);

        let empty = CycleReport::default();
        assert_eq!(empty.dedup_ratio_pct(), 0);
    }

    #[test]
    fn test_enrichment_hit_pct() {
        let report = CycleReport {
            output_records: 8,
            enrichment_hits: 6,
            ..Default::default()
        };
        assert_eq!(report.enrichment_hit_pct(), 75);
    }

    #[test]
    fn test_totals_accumulate() {
        let stats = RegionStats::new();
        let report = CycleReport {
            duration: Duration::from_millis(120),
            output_records: 5,
            helicopters: 1,
            timeouts: 1,
            ..Default::default()
        };
        stats.record(&report);
        stats.record(&report);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cycles, 2);
        assert_eq!(snapshot.aircraft_observed, 10);
        assert_eq!(snapshot.helicopters_observed, 2);
        assert_eq!(snapshot.timeouts, 2);
        assert_eq!(snapshot.last_cycle_ms, 120);
    }
}
