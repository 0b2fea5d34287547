//! Aircraft-registry store.
//!
//! Bulk-loads the static registry CSV (~1M rows keyed by `icao24`) into the
//! cache at startup, then serves batch lookups for the enricher. Lookups hit
//! a bounded process-local cache first and fall through to one pipelined
//! round-trip regardless of batch size.
//!
//! A missing CSV is not fatal: the store logs one warning and runs in
//! no-enrichment mode for the lifetime of the process. A malformed header
//! is a configuration defect and aborts startup.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

use crate::cache::{keys, CacheClient, CacheError};
use crate::config::RegistryConfig;
use crate::model::{normalize_hex, RegistryEntry};

/// Rows per pipelined import batch.
const IMPORT_BATCH_SIZE: usize = 1000;

/// Registry keys above this count mean a prior import is already resident.
const IMPORT_PRESENT_THRESHOLD: usize = 1000;

/// Upper bound on the process-local lookup cache.
const LOOKUP_CACHE_CAP: usize = 1000;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("malformed registry header: missing '{0}' column")]
    Header(&'static str),
    #[error("registry fallback fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// One CSV row, mapped by header name. Unknown columns are ignored.
#[derive(Debug, Deserialize)]
struct RegistryRow {
    #[serde(default)]
    icao24: String,
    #[serde(default)]
    registration: String,
    #[serde(default, alias = "manufacturername")]
    manufacturer: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    typecode: String,
    #[serde(default)]
    operator: String,
    #[serde(default)]
    owner: String,
    #[serde(default, rename = "icaoaircrafttype")]
    icao_aircraft_class: String,
}

/// Convert a parsed row into its cache key and entry. Rows with a malformed
/// hex are rejected.
fn row_to_entry(row: RegistryRow) -> Option<(String, RegistryEntry)> {
    let hex = normalize_hex(&row.icao24)?;
    let entry = RegistryEntry {
        registration: row.registration.trim().to_string(),
        manufacturer: row.manufacturer.trim().to_string(),
        model: row.model.trim().to_string(),
        typecode: row.typecode.trim().to_string(),
        operator: row.operator.trim().to_string(),
        owner: row.owner.trim().to_string(),
        icao_aircraft_class: row.icao_aircraft_class.trim().to_string(),
    };
    Some((hex, entry))
}

/// Bounded map of recent lookups. Caches misses too, so a hot unknown hex
/// does not re-query the cache every cycle. Evicts in insertion order.
struct BoundedLookupCache {
    entries: HashMap<String, Option<RegistryEntry>>,
    order: VecDeque<String>,
    cap: usize,
}

impl BoundedLookupCache {
    fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn get(&self, hex: &str) -> Option<Option<RegistryEntry>> {
        self.entries.get(hex).cloned()
    }

    fn insert(&mut self, hex: String, entry: Option<RegistryEntry>) {
        if self.entries.insert(hex.clone(), entry).is_none() {
            self.order.push_back(hex);
        }
        while self.entries.len() > self.cap {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome of a registry load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Rows imported into the cache.
    Imported { rows: u64, skipped: u64 },
    /// A prior import is already resident; nothing to do.
    AlreadyResident { keys: usize },
    /// No CSV could be resolved; enrichment disabled.
    Unavailable,
}

/// Registry store shared by every region scheduler.
pub struct RegistryStore {
    cache: CacheClient,
    lookup_cache: Mutex<BoundedLookupCache>,
    enrichment_enabled: bool,
}

impl RegistryStore {
    /// Resolve, optionally fetch, and import the registry, returning the
    /// store. Only header-level CSV defects and cache failures propagate.
    pub async fn load(
        config: &RegistryConfig,
        cache: CacheClient,
    ) -> Result<(Self, LoadOutcome), RegistryError> {
        Self::load_inner(config, cache, false).await
    }

    /// Re-import unconditionally, overwriting any resident registry data.
    pub async fn reload(
        config: &RegistryConfig,
        cache: CacheClient,
    ) -> Result<(Self, LoadOutcome), RegistryError> {
        Self::load_inner(config, cache, true).await
    }

    async fn load_inner(
        config: &RegistryConfig,
        cache: CacheClient,
        force: bool,
    ) -> Result<(Self, LoadOutcome), RegistryError> {
        if !force {
            let resident = cache.keys(&keys::aircraft_db_pattern()).await?.len();
            if resident > IMPORT_PRESENT_THRESHOLD {
                tracing::info!("Aircraft registry already resident ({resident} records)");
                return Ok((
                    Self::with_enrichment(cache, true),
                    LoadOutcome::AlreadyResident { keys: resident },
                ));
            }
        }

        let csv_path = match resolve_csv_path(&config.csv_paths) {
            Some(path) => Some(path),
            None => match &config.fallback_url {
                Some(url) if !url.is_empty() => {
                    fetch_fallback(url, config.csv_paths.first()).await?
                }
                _ => None,
            },
        };

        let Some(csv_path) = csv_path else {
            tracing::warn!(
                "Aircraft registry CSV not found; running without enrichment for this process"
            );
            return Ok((Self::with_enrichment(cache, false), LoadOutcome::Unavailable));
        };

        tracing::info!("Loading aircraft registry from {}", csv_path.display());
        let file = std::fs::File::open(&csv_path)?;
        let (rows, skipped) = import_csv(file, &cache).await?;
        tracing::info!("Imported {rows} registry records ({skipped} malformed rows skipped)");

        Ok((
            Self::with_enrichment(cache, true),
            LoadOutcome::Imported { rows, skipped },
        ))
    }

    fn with_enrichment(cache: CacheClient, enabled: bool) -> Self {
        Self {
            cache,
            lookup_cache: Mutex::new(BoundedLookupCache::new(LOOKUP_CACHE_CAP)),
            enrichment_enabled: enabled,
        }
    }

    /// Whether the store can serve enrichment data.
    pub fn enrichment_enabled(&self) -> bool {
        self.enrichment_enabled
    }

    /// Look up many hexes at once. Cache misses are resolved in a single
    /// pipelined round-trip; unknown hexes are simply absent from the
    /// result.
    pub async fn batch_lookup(
        &self,
        hexes: &[String],
    ) -> Result<HashMap<String, RegistryEntry>, RegistryError> {
        if !self.enrichment_enabled || hexes.is_empty() {
            return Ok(HashMap::new());
        }

        let mut found = HashMap::new();
        let mut misses = Vec::new();
        {
            let lookup_cache = self.lookup_cache.lock();
            for hex in hexes {
                match lookup_cache.get(hex) {
                    Some(Some(entry)) => {
                        found.insert(hex.clone(), entry);
                    }
                    Some(None) => {} // known-absent
                    None => misses.push(hex.clone()),
                }
            }
        }

        if misses.is_empty() {
            return Ok(found);
        }

        let miss_keys: Vec<String> = misses.iter().map(|hex| keys::aircraft_db(hex)).collect();
        let hashes = self.cache.hgetall_many(&miss_keys).await?;

        let mut lookup_cache = self.lookup_cache.lock();
        for (hex, fields) in misses.into_iter().zip(hashes) {
            if fields.is_empty() {
                lookup_cache.insert(hex, None);
            } else {
                let entry = RegistryEntry::from_fields(&fields);
                lookup_cache.insert(hex.clone(), Some(entry.clone()));
                found.insert(hex, entry);
            }
        }

        Ok(found)
    }
}

/// First existing candidate path, if any.
fn resolve_csv_path(candidates: &[String]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// One-shot fetch of the registry CSV to the first configured path.
async fn fetch_fallback(
    url: &str,
    target: Option<&String>,
) -> Result<Option<PathBuf>, RegistryError> {
    let Some(target) = target else {
        tracing::warn!("Registry fallback URL configured but no csv_paths target to save to");
        return Ok(None);
    };
    let target = PathBuf::from(target);

    tracing::info!("Fetching aircraft registry from {url}");
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        tracing::warn!("Registry fallback fetch returned {}", response.status());
        return Ok(None);
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = response.bytes().await?;
    std::fs::write(&target, &body)?;
    Ok(Some(target))
}

/// Stream-parse the CSV and upsert rows in pipelined batches. The file is
/// never materialized; memory is bounded by the batch size.
async fn import_csv<R: Read>(reader: R, cache: &CacheClient) -> Result<(u64, u64), RegistryError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    if !headers.iter().any(|h| h.eq_ignore_ascii_case("icao24")) {
        return Err(RegistryError::Header("icao24"));
    }

    let mut imported = 0u64;
    let mut skipped = 0u64;
    let mut batch: Vec<(String, RegistryEntry)> = Vec::with_capacity(IMPORT_BATCH_SIZE);

    for result in csv_reader.deserialize::<RegistryRow>() {
        let row = match result {
            Ok(row) => row,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        match row_to_entry(row) {
            Some(pair) => batch.push(pair),
            None => {
                skipped += 1;
                continue;
            }
        }

        if batch.len() >= IMPORT_BATCH_SIZE {
            imported += flush_batch(&mut batch, cache).await?;
        }
    }
    imported += flush_batch(&mut batch, cache).await?;

    Ok((imported, skipped))
}

async fn flush_batch(
    batch: &mut Vec<(String, RegistryEntry)>,
    cache: &CacheClient,
) -> Result<u64, RegistryError> {
    if batch.is_empty() {
        return Ok(0);
    }
    let mut pipe = cache.pipeline();
    for (hex, entry) in batch.iter() {
        pipe.hset_fields(&keys::aircraft_db(hex), &entry.as_fields());
    }
    let count = batch.len() as u64;
    pipe.execute().await?;
    batch.clear();
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_entry_normalizes_hex() {
        let row = RegistryRow {
            icao24: "A1B2C3".into(),
            registration: " N12345 ".into(),
            manufacturer: "Bell".into(),
            model: "407".into(),
            typecode: "B407".into(),
            operator: String::new(),
            owner: String::new(),
            icao_aircraft_class: "H1T".into(),
        };
        let (hex, entry) = row_to_entry(row).unwrap();
        assert_eq!(hex, "a1b2c3");
        assert_eq!(entry.registration, "N12345");
        assert_eq!(entry.icao_aircraft_class, "H1T");
    }

    #[test]
    fn test_row_to_entry_rejects_malformed_hex() {
        let row = RegistryRow {
            icao24: "not-hex".into(),
            registration: String::new(),
            manufacturer: String::new(),
            model: String::new(),
            typecode: String::new(),
            operator: String::new(),
            owner: String::new(),
            icao_aircraft_class: String::new(),
        };
        assert!(row_to_entry(row).is_none());
    }

    #[test]
    fn test_csv_rows_parse_by_header() {
        let csv = "icao24,registration,manufacturername,model,typecode,operator,owner,icaoaircrafttype\n\
                   a1b2c3,N12345,Bell,407,B407,Air Evac,Air Evac EMS,H1T\n\
                   zzzzzz,BAD,,,,,,\n\
                   00aa11,N200,Cessna,172,C172,,,L1P\n";
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(csv.as_bytes());

        let mut entries = Vec::new();
        let mut skipped = 0;
        for row in reader.deserialize::<RegistryRow>() {
            match row.ok().and_then(row_to_entry) {
                Some(pair) => entries.push(pair),
                None => skipped += 1,
            }
        }

        assert_eq!(entries.len(), 2);
        assert_eq!(skipped, 1);
        assert_eq!(entries[0].0, "a1b2c3");
        assert_eq!(entries[0].1.manufacturer, "Bell");
        assert_eq!(entries[1].1.icao_aircraft_class, "L1P");
    }

    #[test]
    fn test_lookup_cache_bounded_eviction() {
        let mut cache = BoundedLookupCache::new(3);
        for i in 0..5 {
            cache.insert(format!("hex{i}"), None);
        }
        assert_eq!(cache.len(), 3);
        // Oldest two evicted.
        assert!(cache.get("hex0").is_none());
        assert!(cache.get("hex1").is_none());
        assert!(cache.get("hex4").is_some());
    }

    #[test]
    fn test_lookup_cache_distinguishes_absent_from_unknown() {
        let mut cache = BoundedLookupCache::new(10);
        cache.insert("a1b2c3".into(), None);
        // Known-absent entry: present in the cache, holds no registry data.
        assert_eq!(cache.get("a1b2c3"), Some(None));
        // Never-seen hex.
        assert_eq!(cache.get("ffffff"), None);
    }

    #[test]
    fn test_resolve_csv_path_picks_first_existing() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("registry.csv");
        std::fs::write(&present, "icao24\n").unwrap();

        let candidates = vec![
            dir.path().join("missing.csv").display().to_string(),
            present.display().to_string(),
        ];
        assert_eq!(resolve_csv_path(&candidates), Some(present));
        assert_eq!(resolve_csv_path(&["nope.csv".to_string()]), None);
    }
}
