//! Per-region collection cycle driver.
//!
//! One scheduler task per enabled region. Each tick fans out to the
//! configured sources concurrently under a wave deadline, blends and
//! enriches the results, and publishes the cycle's keys through a single
//! pipelined write. Regions do not coordinate; they share only the cache
//! client and the registry store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::blender::{blend, SourceBatch};
use crate::cache::{keys, CacheClient, CacheError};
use crate::config::{RegionConfig, SchedulerConfig, SourceConfig};
use crate::dump1090::{Dump1090Error, Dump1090Source};
use crate::enrich::{apply_enrichment, helicopter_subset};
use crate::geo::{BoundingBox, Position};
use crate::ingress::PushBuffer;
use crate::model::{pi_station_tag, Aircraft, SourcePriority, SOURCE_DUMP1090, SOURCE_OPENSKY};
use crate::opensky::{OpenSkyError, OpenSkySource};
use crate::registry::RegistryStore;
use crate::stats::{self, CycleReport, RegionStats};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("local receiver source: {0}")]
    Dump1090(#[from] Dump1090Error),
    #[error("wide-area source: {0}")]
    OpenSky(#[from] OpenSkyError),
}

/// Cycle phase, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Idle,
    Fetching,
    Blending,
    Writing,
    /// Cache writes failing; ticks keep running, writes are suppressed
    /// until the cache answers a ping again.
    Degraded,
}

/// Everything one fan-out wave produced.
#[derive(Default)]
struct FetchWave {
    batches: Vec<SourceBatch>,
    timeouts: usize,
    errors: usize,
}

impl FetchWave {
    fn add(&mut self, source_id: String, priority: SourcePriority, reports: Vec<Aircraft>) {
        self.batches.push(SourceBatch {
            source_id,
            priority,
            reports,
        });
    }
}

/// Wave deadline: one second short of the tick, never below one second.
fn wave_deadline(tick_interval: Duration) -> Duration {
    tick_interval
        .saturating_sub(Duration::from_secs(1))
        .max(Duration::from_secs(1))
}

/// Drop push buffers whose snapshot is older than the freshness window.
fn fresh_buffers(buffers: Vec<PushBuffer>, now_unix: i64, window: Duration) -> Vec<PushBuffer> {
    buffers
        .into_iter()
        .filter(|buffer| now_unix - buffer.received_at <= window.as_secs() as i64)
        .collect()
}

/// Assemble a JSON array from records that were each encoded once.
fn json_array<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::from("[");
    for (index, item) in items.enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(item);
    }
    out.push(']');
    out
}

/// Driver for one region.
pub struct RegionScheduler {
    region_id: String,
    region_name: String,
    bbox: BoundingBox,
    center: Position,
    tick_interval: Duration,
    dump1090: Option<Dump1090Source>,
    opensky: Option<OpenSkySource>,
    /// Freshness window for station push buffers; `None` when the region
    /// has no push source.
    push_window: Option<Duration>,
    cache: CacheClient,
    registry: Arc<RegistryStore>,
    stats: Arc<RegionStats>,
    phase: Mutex<RegionState>,
    degraded: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl RegionScheduler {
    pub fn from_config(
        region: &RegionConfig,
        scheduler: &SchedulerConfig,
        cache: CacheClient,
        registry: Arc<RegistryStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, SchedulerError> {
        let center = region.center_position();
        let bbox = region.bounding_box();

        let dump1090 = match region.local_receiver() {
            Some((url, poll_interval)) => Some(Dump1090Source::new(url, poll_interval)?),
            None => None,
        };

        let opensky = match region.wide_area() {
            Some(SourceConfig::WideArea {
                url,
                anonymous,
                username,
                password,
                poll_interval_seconds,
            }) => {
                let credentials = if *anonymous {
                    None
                } else {
                    username.clone().zip(password.clone())
                };
                Some(OpenSkySource::new(
                    url,
                    credentials,
                    Duration::from_secs(*poll_interval_seconds),
                    bbox,
                    cache.clone(),
                )?)
            }
            _ => None,
        };

        Ok(Self {
            region_id: region.id.clone(),
            region_name: region.name.clone(),
            bbox,
            center,
            tick_interval: scheduler.tick_interval(),
            dump1090,
            opensky,
            push_window: region.push_source(),
            cache,
            registry,
            stats: Arc::new(RegionStats::new()),
            phase: Mutex::new(RegionState::Idle),
            degraded: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn stats(&self) -> Arc<RegionStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> RegionState {
        if self.degraded.load(Ordering::Relaxed) {
            RegionState::Degraded
        } else {
            *self.phase.lock()
        }
    }

    fn set_phase(&self, state: RegionState) {
        *self.phase.lock() = state;
    }

    /// Run cycles until shutdown. A new tick never overlaps the previous
    /// one; an overrunning tick rolls straight into the next with no
    /// catch-up of missed ticks.
    pub async fn run(self) {
        tracing::info!(
            "Region {} ({}): scheduler started, {}s cadence",
            self.region_id,
            self.region_name,
            self.tick_interval.as_secs()
        );

        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();

            // Fan-out is abandoned on shutdown; once it completes, the
            // blend and the pipelined write run to completion so no
            // partial state is published.
            self.set_phase(RegionState::Fetching);
            let wave = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                wave = self.fetch_wave() => wave,
            };

            self.finish_cycle(wave, started).await;
            self.set_phase(RegionState::Idle);

            let elapsed = started.elapsed();
            if elapsed < self.tick_interval {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.tick_interval - elapsed) => {}
                }
            }
        }

        tracing::info!("Region {}: scheduler stopped", self.region_id);
    }

    /// Concurrent read of every configured source under the wave deadline.
    /// Slow sources are abandoned and counted as timeouts; failed sources
    /// contribute an empty list.
    async fn fetch_wave(&self) -> FetchWave {
        let deadline = wave_deadline(self.tick_interval);

        let local_read = async {
            match &self.dump1090 {
                Some(source) => Some(tokio::time::timeout(deadline, source.fetch()).await),
                None => None,
            }
        };
        let wide_read = async {
            match &self.opensky {
                Some(source) => Some(tokio::time::timeout(deadline, source.fetch()).await),
                None => None,
            }
        };
        let push_read = async {
            match self.push_window {
                Some(window) => {
                    Some(tokio::time::timeout(deadline, self.read_push_buffers(window)).await)
                }
                None => None,
            }
        };

        let (local, wide, push) = tokio::join!(local_read, wide_read, push_read);

        let mut wave = FetchWave::default();
        match local {
            None => {}
            Some(Err(_)) => {
                wave.timeouts += 1;
                tracing::warn!("Region {}: local receiver missed the wave deadline", self.region_id);
            }
            Some(Ok(Err(err))) => {
                wave.errors += 1;
                tracing::warn!("Region {}: local receiver fetch failed: {err}", self.region_id);
            }
            Some(Ok(Ok(reports))) => {
                wave.add(
                    SOURCE_DUMP1090.to_string(),
                    SourcePriority::LocalReceiver,
                    reports,
                );
            }
        }
        match wide {
            None => {}
            Some(Err(_)) => {
                wave.timeouts += 1;
                tracing::warn!("Region {}: wide-area source missed the wave deadline", self.region_id);
            }
            Some(Ok(Err(OpenSkyError::RateLimited))) => {
                wave.errors += 1;
            }
            Some(Ok(Err(err))) => {
                wave.errors += 1;
                tracing::warn!("Region {}: wide-area fetch failed: {err}", self.region_id);
            }
            Some(Ok(Ok(reports))) => {
                wave.add(SOURCE_OPENSKY.to_string(), SourcePriority::WideArea, reports);
            }
        }
        match push {
            None => {}
            Some(Err(_)) => {
                wave.timeouts += 1;
                tracing::warn!("Region {}: push buffer read missed the wave deadline", self.region_id);
            }
            Some(Ok(Err(err))) => {
                wave.errors += 1;
                tracing::warn!("Region {}: push buffer read failed: {err}", self.region_id);
            }
            Some(Ok(Ok(buffers))) => {
                for buffer in buffers {
                    wave.add(
                        pi_station_tag(&buffer.station_id),
                        SourcePriority::PiStation,
                        buffer.aircraft,
                    );
                }
            }
        }

        wave
    }

    /// Read every station buffer for this region: one key scan plus one
    /// pipelined value fetch, no network to the stations.
    async fn read_push_buffers(&self, window: Duration) -> Result<Vec<PushBuffer>, CacheError> {
        let buffer_keys = self.cache.keys(&keys::push_pattern(&self.region_id)).await?;
        let raw_values = self.cache.get_many_raw(&buffer_keys).await?;

        let buffers: Vec<PushBuffer> = raw_values
            .into_iter()
            .flatten()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        Ok(fresh_buffers(buffers, Utc::now().timestamp(), window))
    }

    /// Blend, enrich, classify, and publish one completed wave.
    async fn finish_cycle(&self, wave: FetchWave, started: Instant) {
        self.set_phase(RegionState::Blending);
        let outcome = blend(&wave.batches, self.bbox, self.center);

        let mut aircraft = outcome.aircraft;
        let hexes: Vec<String> = aircraft.iter().map(|report| report.hex.clone()).collect();
        let entries = match self.registry.batch_lookup(&hexes).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!("Region {}: registry lookup failed: {err}", self.region_id);
                HashMap::new()
            }
        };
        let enrichment_hits = apply_enrichment(&mut aircraft, &entries);
        let helicopters = helicopter_subset(&aircraft);

        let report = CycleReport {
            duration: started.elapsed(),
            input_reports: outcome.stats.input_reports,
            output_records: aircraft.len(),
            helicopters: helicopters.len(),
            timeouts: wave.timeouts,
            source_errors: wave.errors,
            enrichment_hits,
            blended_groups: outcome.stats.blended_groups,
            contributions: outcome.stats.contributions.clone(),
        };

        let contributions = report
            .contributions
            .iter()
            .map(|(source, count)| format!("{source}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(
            "Region {}: {} records ({} fused, {} helicopters) from [{}] in {:?}",
            self.region_id,
            aircraft.len(),
            report.blended_groups,
            helicopters.len(),
            contributions,
            report.duration
        );

        self.set_phase(RegionState::Writing);
        self.publish_cycle(&aircraft, &helicopters, &wave, &report)
            .await;
        self.stats.record(&report);
    }

    /// Publish the cycle, honoring degraded mode: while the cache is
    /// unreachable writes are suppressed and each tick probes for recovery.
    async fn publish_cycle(
        &self,
        aircraft: &[Aircraft],
        helicopters: &[Aircraft],
        wave: &FetchWave,
        report: &CycleReport,
    ) {
        if self.degraded.load(Ordering::Relaxed) {
            if self.cache.ping().await.is_err() {
                tracing::debug!(
                    "Region {}: cache still unreachable, skipping writes",
                    self.region_id
                );
                return;
            }
            tracing::info!("Region {}: cache reachable again, resuming writes", self.region_id);
            self.degraded.store(false, Ordering::Relaxed);
        }

        match self.write_cycle(aircraft, helicopters, wave, report).await {
            Ok(()) => {
                if let Some(closest) = aircraft.first() {
                    tracing::info!(
                        "Region {}: closest aircraft {} ({}) {} at {:.1} mi, {} ft",
                        self.region_id,
                        if closest.flight.is_empty() { &closest.hex } else { &closest.flight },
                        closest.registration.as_deref().unwrap_or("unregistered"),
                        closest.model.as_deref().unwrap_or("unknown type"),
                        closest.distance_miles.unwrap_or_default(),
                        closest
                            .alt_baro
                            .map(|alt| alt.to_string())
                            .unwrap_or_else(|| "?".into()),
                    );
                }
            }
            Err(err) => {
                tracing::error!(
                    "Region {}: cycle write failed, entering degraded mode: {err}",
                    self.region_id
                );
                self.degraded.store(true, Ordering::Relaxed);
            }
        }
    }

    /// One pipelined write for the whole cycle: region set, helicopter
    /// subset, per-aircraft point lookups, raw per-source snapshots, and
    /// stats. Every record is JSON-encoded exactly once.
    async fn write_cycle(
        &self,
        aircraft: &[Aircraft],
        helicopters: &[Aircraft],
        wave: &FetchWave,
        report: &CycleReport,
    ) -> Result<(), CacheError> {
        let ttl = self.cache.default_ttl();

        let mut encoded = Vec::with_capacity(aircraft.len());
        for record in aircraft {
            encoded.push((record.hex.as_str(), serde_json::to_string(record)?));
        }
        let chopper_hexes: HashSet<&str> =
            helicopters.iter().map(|record| record.hex.as_str()).collect();

        let flights_json = json_array(encoded.iter().map(|(_, json)| json.as_str()));
        let choppers_json = json_array(
            encoded
                .iter()
                .filter(|(hex, _)| chopper_hexes.contains(hex))
                .map(|(_, json)| json.as_str()),
        );

        let mut pipe = self.cache.pipeline();
        pipe.set_with_ttl(&keys::flights(&self.region_id), &flights_json, ttl);
        pipe.set_with_ttl(&keys::choppers(&self.region_id), &choppers_json, ttl);
        for (hex, json) in &encoded {
            pipe.set_with_ttl(&keys::aircraft_live(hex), json, ttl);
        }
        for batch in &wave.batches {
            if batch.reports.is_empty() {
                continue;
            }
            let raw_json = serde_json::to_string(&batch.reports)?;
            pipe.set_with_ttl(&keys::raw(&self.region_id, &batch.source_id), &raw_json, ttl);
        }
        stats::publish(&self.region_id, report, &mut pipe);

        pipe.execute().await
    }
}
