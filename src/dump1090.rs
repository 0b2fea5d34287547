//! Local ADS-B receiver poller (dump1090/tar1090 JSON feed).

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::model::{Aircraft, SOURCE_DUMP1090};

/// Reports older than this at the receiver are dropped.
const STALENESS_SECS: f64 = 60.0;

/// Per-call HTTP deadline.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum Dump1090Error {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("receiver returned status {status}")]
    Status { status: StatusCode },
}

/// Append the standard tar1090 data path when the operator configured a
/// bare host URL.
fn receiver_data_url(url: &str) -> String {
    if url.ends_with("/data/aircraft.json") {
        return url.to_string();
    }
    let mut url = url.to_string();
    if !url.ends_with('/') {
        url.push('/');
    }
    url.push_str("data/aircraft.json");
    url
}

#[derive(Debug, serde::Deserialize)]
struct ReceiverFeed {
    #[serde(default)]
    aircraft: Vec<serde_json::Value>,
}

struct Snapshot {
    fetched_at: Instant,
    aircraft: Vec<Aircraft>,
}

/// Polls one local receiver. One call per scheduler tick, no in-tick
/// retries; when the scheduler ticks faster than the configured poll
/// interval the previous snapshot is reused.
pub struct Dump1090Source {
    http: Client,
    url: String,
    poll_interval: Duration,
    snapshot: Mutex<Option<Snapshot>>,
}

impl Dump1090Source {
    pub fn new(url: &str, poll_interval: Duration) -> Result<Self, Dump1090Error> {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: receiver_data_url(url),
            poll_interval,
            snapshot: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch and normalize the current receiver snapshot.
    pub async fn fetch(&self) -> Result<Vec<Aircraft>, Dump1090Error> {
        if let Some(cached) = self.fresh_snapshot() {
            return Ok(cached);
        }

        let started = Instant::now();
        let response = self.http.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Dump1090Error::Status { status });
        }

        let feed: ReceiverFeed = response.json().await?;
        let total = feed.aircraft.len();
        let aircraft = normalize_feed(feed);

        tracing::debug!(
            "dump1090: {} of {} aircraft usable in {:?}",
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
        let snapshot = self.snapshot.lock();
        snapshot
            .as_ref()
            .filter(|s| s.fetched_at.elapsed() < self.poll_interval)
            .map(|s| s.aircraft.clone())
    }
}

/// Drop malformed and stale entries, keep the rest in feed order.
fn normalize_feed(feed: ReceiverFeed) -> Vec<Aircraft> {
    feed.aircraft
        .iter()
        .filter_map(|value| Aircraft::from_receiver_json(value, SOURCE_DUMP1090).ok())
        .filter(|report| report.seen.map_or(true, |seen| seen <= STALENESS_SECS))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_data_url_normalization() {
        assert_eq!(
            receiver_data_url("http://receiver.local"),
            "http://receiver.local/data/aircraft.json"
        );
        assert_eq!(
            receiver_data_url("http://receiver.local/"),
            "http://receiver.local/data/aircraft.json"
        );
        assert_eq!(
            receiver_data_url("http://receiver.local/data/aircraft.json"),
            "http://receiver.local/data/aircraft.json"
        );
    }

    #[test]
    fn test_normalize_feed_drops_stale_and_malformed() {
        let feed: ReceiverFeed = serde_json::from_value(serde_json::json!({
            "aircraft": [
                { "hex": "a1b2c3", "flight": "UAL123", "lat": 32.4, "lon": -95.3, "seen": 0.5 },
                { "hex": "b2c3d4", "seen": 120.0 },
                { "flight": "NOHEX1" },
                { "hex": "c3d4e5" }
            ]
        }))
        .unwrap();

        let aircraft = normalize_feed(feed);
        let hexes: Vec<&str> = aircraft.iter().map(|a| a.hex.as_str()).collect();
        assert_eq!(hexes, vec!["a1b2c3", "c3d4e5"]);
        assert!(aircraft.iter().all(|a| a.data_source == SOURCE_DUMP1090));
    }
}
