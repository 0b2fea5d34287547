//! Wide-area network poller (OpenSky states API) with the credit/backoff
//! controller.
//!
//! The upstream is globally rate-limited, so the backoff deadline and the
//! last-seen credit gauge live in the cache under `stats:opensky:*` where
//! every region's poller consults them before calling out. Last writer wins
//! on the deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::cache::{keys, CacheClient, CacheError};
use crate::geo::BoundingBox;
use crate::model::{normalize_hex, Aircraft, SOURCE_OPENSKY};

const METERS_TO_FEET: f64 = 3.28084;
const MPS_TO_KNOTS: f64 = 1.94384;
const MPS_TO_FPM: f64 = 196.85;

/// Backoff armed after an upstream 429.
const BACKOFF_SECS: i64 = 300;

/// Minimum age before a fresh network call replaces the last response.
const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Per-call HTTP deadline.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Advisory daily credit budgets.
const DAILY_CREDITS_ANONYMOUS: i64 = 400;
const DAILY_CREDITS_AUTHENTICATED: i64 = 4000;

/// Remaining-credits response header.
const CREDITS_HEADER: &str = "x-rate-limit-remaining";

#[derive(Debug, Error)]
pub enum OpenSkyError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("wide-area API returned status {status}")]
    Status { status: StatusCode },
    #[error("wide-area API rate limited")]
    RateLimited,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Approximate credit cost of one states query, sized by box area.
pub fn credit_cost(area_sq_deg: f64) -> u32 {
    if area_sq_deg <= 25.0 {
        1
    } else if area_sq_deg <= 100.0 {
        2
    } else if area_sq_deg <= 400.0 {
        3
    } else {
        4
    }
}

/// Whether the projected spend to midnight UTC exceeds the remaining
/// budget. When it does the poller skips every other tick.
pub fn should_throttle(
    credits_remaining: i64,
    cost_per_call: u32,
    secs_until_midnight: i64,
    poll_interval: Duration,
) -> bool {
    let calls_remaining = secs_until_midnight.max(0) as u64 / poll_interval.as_secs().max(1);
    let projected_spend = calls_remaining.saturating_mul(cost_per_call as u64);
    (credits_remaining.max(0) as u64) < projected_spend
}

/// Seconds from `now` to the next UTC midnight.
pub fn seconds_until_midnight_utc(now: DateTime<Utc>) -> i64 {
    let today = now.date_naive();
    let Some(tomorrow) = today.succ_opt() else {
        return 0;
    };
    let midnight = tomorrow.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc();
    (midnight - now).num_seconds()
}

#[derive(Debug, Deserialize)]
struct StatesResponse {
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    states: Option<Vec<Vec<serde_json::Value>>>,
}

/// Map one positional vector onto the normalized record. This is the only
/// place the index layout appears.
///
/// Indices: 0 hex, 1 callsign, 4 last_contact, 5 lon, 6 lat, 7 baro alt m,
/// 8 on_ground, 9 velocity m/s, 10 true track, 11 vertical rate m/s,
/// 13 geo alt m, 14 squawk.
fn state_to_aircraft(state: &[serde_json::Value], response_time: i64) -> Option<Aircraft> {
    let field_f64 = |i: usize| state.get(i).and_then(|v| v.as_f64());
    let field_str = |i: usize| state.get(i).and_then(|v| v.as_str());

    let hex = normalize_hex(field_str(0)?)?;

    let mut report = Aircraft::new(hex, SOURCE_OPENSKY);
    report.flight = field_str(1).unwrap_or_default().trim().to_string();
    report.lon = field_f64(5);
    report.lat = field_f64(6);
    report.alt_baro = field_f64(7).map(|m| (m * METERS_TO_FEET).round() as i32);
    report.on_ground = state.get(8).and_then(|v| v.as_bool()).unwrap_or(false);
    report.gs = field_f64(9).map(|mps| (mps * MPS_TO_KNOTS * 10.0).round() / 10.0);
    report.track = field_f64(10).map(|deg| (deg * 10.0).round() / 10.0);
    report.baro_rate = field_f64(11).map(|mps| (mps * MPS_TO_FPM).round() as i32);
    report.alt_geom = field_f64(13).map(|m| (m * METERS_TO_FEET).round() as i32);
    report.squawk = field_str(14).map(str::to_string);
    report.seen = field_f64(4).map(|last_contact| (response_time as f64 - last_contact).max(0.0));

    Some(report)
}

struct Snapshot {
    fetched_at: Instant,
    aircraft: Vec<Aircraft>,
}

/// Wide-area poller for one region's bounding box.
pub struct OpenSkySource {
    http: Client,
    url: String,
    credentials: Option<(String, String)>,
    daily_budget: i64,
    poll_interval: Duration,
    bbox: BoundingBox,
    cache: CacheClient,
    snapshot: Mutex<Option<Snapshot>>,
    ticks: AtomicU64,
}

impl OpenSkySource {
    pub fn new(
        url: &str,
        credentials: Option<(String, String)>,
        poll_interval: Duration,
        bbox: BoundingBox,
        cache: CacheClient,
    ) -> Result<Self, OpenSkyError> {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let daily_budget = if credentials.is_some() {
            DAILY_CREDITS_AUTHENTICATED
        } else {
            DAILY_CREDITS_ANONYMOUS
        };
        Ok(Self {
            http,
            url: url.to_string(),
            credentials,
            daily_budget,
            poll_interval,
            bbox,
            cache,
            snapshot: Mutex::new(None),
            ticks: AtomicU64::new(0),
        })
    }

    /// Fetch the current positional vectors for the region, honoring the
    /// shared backoff deadline, the response cache, and the credit budget.
    pub async fn fetch(&self) -> Result<Vec<Aircraft>, OpenSkyError> {
        if let Some(cached) = self.fresh_snapshot() {
            return Ok(cached);
        }

        let now = Utc::now();
        if let Some(deadline) = self.cache.get_i64(keys::OPENSKY_BACKOFF_UNTIL).await? {
            if now.timestamp() < deadline {
                tracing::debug!("opensky: backing off until {deadline}, no call made");
                return Ok(Vec::new());
            }
        }

        let cost = credit_cost(self.bbox.area_sq_deg());
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        let remaining = self
            .cache
            .get_i64(keys::OPENSKY_CREDITS)
            .await?
            .unwrap_or(self.daily_budget);
        if tick % 2 == 1
            && should_throttle(
                remaining,
                cost,
                seconds_until_midnight_utc(now),
                self.poll_interval,
            )
        {
            tracing::debug!(
                "opensky: {remaining} credits left, throttling (cost {cost}/call)"
            );
            return Ok(self.last_snapshot());
        }

        let started = Instant::now();
        let mut request = self.http.get(&self.url).query(&[
            ("lamin", self.bbox.south),
            ("lomin", self.bbox.west),
            ("lamax", self.bbox.north),
            ("lomax", self.bbox.east),
        ]);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let deadline = now.timestamp() + BACKOFF_SECS;
            self.cache
                .set_i64(keys::OPENSKY_BACKOFF_UNTIL, deadline)
                .await?;
            tracing::warn!("opensky: rate limited, backing off until {deadline}");
            return Err(OpenSkyError::RateLimited);
        }
        if !status.is_success() {
            return Err(OpenSkyError::Status { status });
        }

        if let Some(credits) = response
            .headers()
            .get(CREDITS_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
        {
            self.cache.set_i64(keys::OPENSKY_CREDITS, credits).await?;
        }

        let body: StatesResponse = response.json().await?;
        let response_time = body.time.unwrap_or_else(|| now.timestamp());
        let states = body.states.unwrap_or_default();
        let total = states.len();
        let aircraft: Vec<Aircraft> = states
            .iter()
            .filter_map(|state| state_to_aircraft(state, response_time))
            .collect();

        tracing::debug!(
            "opensky: {} of {} vectors usable in {:?}",
            aircraft.len(),
            total,
            started.elapsed()
        );

        *self.snapshot.lock() = Some(Snapshot {
            fetched_at: Instant::now(),
            aircraft: aircraft.clone(),
        });
        Ok(aircraft)
    }

    fn fresh_snapshot(&self) -> Option<Vec<Aircraft>> {
        let gate = self.poll_interval.max(RESPONSE_CACHE_TTL);
        let snapshot = self.snapshot.lock();
        snapshot
            .as_ref()
            .filter(|s| s.fetched_at.elapsed() < gate)
            .map(|s| s.aircraft.clone())
    }

    /// The last snapshot regardless of age, for throttled ticks.
    fn last_snapshot(&self) -> Vec<Aircraft> {
        self.snapshot
            .lock()
            .as_ref()
            .map(|s| s.aircraft.clone())
            .unwrap_or_default()
    }
}
