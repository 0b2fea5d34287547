//! Core data types for aircraft reports and registry entries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Source tag for a report that the local ADS-B receiver produced.
pub const SOURCE_DUMP1090: &str = "dump1090";
/// Source tag for a report that the wide-area network API produced.
pub const SOURCE_OPENSKY: &str = "opensky";
/// Source tag for a record fused from two or more sources in one cycle.
pub const SOURCE_BLENDED: &str = "blended";
/// Prefix for reports pushed by a remote pi-station.
pub const SOURCE_PI_STATION_PREFIX: &str = "pi_station:";

/// Build the source tag for a pi-station push feed.
pub fn pi_station_tag(station_id: &str) -> String {
    format!("{SOURCE_PI_STATION_PREFIX}{station_id}")
}

/// Merge priority of a source. Higher wins a hex group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SourcePriority {
    WideArea = 1,
    LocalReceiver = 2,
    PiStation = 3,
}

/// Validate a lowercase 24-bit ICAO hex identifier (six hex digits).
pub fn is_valid_hex(hex: &str) -> bool {
    hex.len() == 6 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Normalize a raw transponder identifier to the canonical lowercase form.
///
/// Strips the `~` prefix some receivers use for non-ICAO addresses and
/// surrounding whitespace. Returns `None` when the result is not a valid
/// six-digit hex string.
pub fn normalize_hex(raw: &str) -> Option<String> {
    let hex = raw.trim().trim_start_matches('~').to_ascii_lowercase();
    is_valid_hex(&hex).then_some(hex)
}

/// A normalized positional report for one aircraft.
///
/// Produced by the sources, reconciled by the blender, enriched from the
/// registry, and published to the cache. Serialized once per record per
/// cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aircraft {
    /// Lowercase 24-bit ICAO hex identifier.
    pub hex: String,
    /// Callsign, trimmed. May be empty.
    #[serde(default)]
    pub flight: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Barometric altitude in feet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_baro: Option<i32>,
    /// Geometric altitude in feet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_geom: Option<i32>,
    /// Ground speed in knots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gs: Option<f64>,
    /// True track in degrees, 0-360.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<f64>,
    /// Barometric vertical rate in feet per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baro_rate: Option<i32>,
    /// 4-digit octal transponder code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squawk: Option<String>,
    #[serde(default)]
    pub on_ground: bool,
    /// Seconds since the source last heard this aircraft.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen: Option<f64>,
    /// Signal strength in dBFS. Local receivers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    /// Message count at the source. Local receivers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<u64>,
    /// Distance to the region center, recomputed every cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_miles: Option<f64>,
    /// Provenance tag: `pi_station:<id>`, `dump1090`, `opensky`, `blended`.
    pub data_source: String,

    // Registry enrichment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typecode: Option<String>,
    /// Combined "manufacturer model" description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aircraft_type: Option<String>,
    /// ICAO aircraft class code, e.g. `L2J`, `H2T`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icao_aircraft_class: Option<String>,

    #[serde(default)]
    pub is_helicopter: bool,
}

impl Aircraft {
    /// An empty report carrying only identity and provenance.
    pub fn new(hex: impl Into<String>, data_source: impl Into<String>) -> Self {
        Self {
            hex: hex.into(),
            flight: String::new(),
            lat: None,
            lon: None,
            alt_baro: None,
            alt_geom: None,
            gs: None,
            track: None,
            baro_rate: None,
            squawk: None,
            on_ground: false,
            seen: None,
            rssi: None,
            messages: None,
            distance_miles: None,
            data_source: data_source.into(),
            registration: None,
            model: None,
            manufacturer: None,
            operator: None,
            owner: None,
            typecode: None,
            aircraft_type: None,
            icao_aircraft_class: None,
            is_helicopter: false,
        }
    }

    /// Whether the report carries a full position.
    pub fn has_position(&self) -> bool {
        self.lat.is_some() && self.lon.is_some()
    }

    /// Normalize one local-receiver JSON record (the dump1090 / pi-station
    /// wire shape: named fields, native feet/knots/ft-per-min units).
    ///
    /// Unknown fields are ignored and non-numeric values read as absent;
    /// only a missing or malformed `hex` rejects the record.
    pub fn from_receiver_json(
        value: &serde_json::Value,
        data_source: &str,
    ) -> Result<Self, RecordError> {
        let raw_hex = value
            .get("hex")
            .and_then(|v| v.as_str())
            .ok_or(RecordError::MissingHex)?;
        let hex =
            normalize_hex(raw_hex).ok_or_else(|| RecordError::InvalidHex(raw_hex.to_string()))?;

        let f64_field = |name: &str| value.get(name).and_then(|v| v.as_f64());
        let i32_field = |name: &str| f64_field(name).map(|f| f.round() as i32);

        let mut report = Aircraft::new(hex, data_source);
        report.flight = value
            .get("flight")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();
        report.lat = f64_field("lat");
        report.lon = f64_field("lon");
        // Receivers report "ground" instead of a barometric altitude for
        // taxiing aircraft.
        match value.get("alt_baro") {
            Some(v) if v.as_str() == Some("ground") => report.on_ground = true,
            Some(v) => report.alt_baro = v.as_f64().map(|f| f.round() as i32),
            None => {}
        }
        report.alt_geom = i32_field("alt_geom");
        report.gs = f64_field("gs");
        report.track = f64_field("track");
        report.baro_rate = i32_field("baro_rate");
        report.squawk = value
            .get("squawk")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(on_ground) = value.get("on_ground").and_then(|v| v.as_bool()) {
            report.on_ground |= on_ground;
        }
        report.seen = f64_field("seen");
        report.rssi = f64_field("rssi");
        report.messages = value.get("messages").and_then(|v| v.as_u64());

        Ok(report)
    }
}

/// Why a raw record was rejected at a normalization boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record is missing 'hex'")]
    MissingHex,
    #[error("invalid hex identifier '{0}'")]
    InvalidHex(String),
}

/// Static registry record for one airframe, keyed by ICAO hex.
///
/// Immutable after load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(default)]
    pub registration: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub typecode: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub icao_aircraft_class: String,
}

impl RegistryEntry {
    /// Field pairs in cache-hash order.
    pub fn as_fields(&self) -> [(&'static str, &str); 7] {
        [
            ("registration", &self.registration),
            ("manufacturer", &self.manufacturer),
            ("model", &self.model),
            ("typecode", &self.typecode),
            ("operator", &self.operator),
            ("owner", &self.owner),
            ("icao_aircraft_class", &self.icao_aircraft_class),
        ]
    }

    pub fn from_fields(fields: &std::collections::HashMap<String, String>) -> Self {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        Self {
            registration: get("registration"),
            manufacturer: get("manufacturer"),
            model: get("model"),
            typecode: get("typecode"),
            operator: get("operator"),
            owner: get("owner"),
            icao_aircraft_class: get("icao_aircraft_class"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_validation() {
        assert!(is_valid_hex("a1b2c3"));
        assert!(is_valid_hex("000000"));
        assert!(is_valid_hex("ffffff"));
        assert!(!is_valid_hex("A1B2C3")); // uppercase rejected
        assert!(!is_valid_hex("a1b2c"));
        assert!(!is_valid_hex("a1b2c3d"));
        assert!(!is_valid_hex("g1b2c3"));
        assert!(!is_valid_hex(""));
    }

    #[test]
    fn test_normalize_hex() {
        assert_eq!(normalize_hex("A1B2C3"), Some("a1b2c3".to_string()));
        assert_eq!(normalize_hex(" a1b2c3 "), Some("a1b2c3".to_string()));
        assert_eq!(normalize_hex("~a1b2c3"), Some("a1b2c3".to_string()));
        assert_eq!(normalize_hex("xyz"), None);
        assert_eq!(normalize_hex(""), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(SourcePriority::PiStation > SourcePriority::LocalReceiver);
        assert!(SourcePriority::LocalReceiver > SourcePriority::WideArea);
    }

    #[test]
    fn test_pi_station_tag() {
        assert_eq!(pi_station_tag("ETEX01"), "pi_station:ETEX01");
    }

    #[test]
    fn test_aircraft_serde_skips_absent_fields() {
        let a = Aircraft::new("a1b2c3", SOURCE_DUMP1090);
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains("\"hex\":\"a1b2c3\""));
        assert!(!json.contains("lat"));
        assert!(!json.contains("registration"));

        let back: Aircraft = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_from_receiver_json_full_record() {
        let value = serde_json::json!({
            "hex": "A1B2C3",
            "flight": "UAL123  ",
            "lat": 32.4,
            "lon": -95.3,
            "alt_baro": 35000,
            "alt_geom": 35500,
            "gs": 450.0,
            "track": 270.0,
            "baro_rate": -512,
            "squawk": "1200",
            "seen": 0.5,
            "rssi": -12.3,
            "messages": 4821
        });
        let report = Aircraft::from_receiver_json(&value, SOURCE_DUMP1090).unwrap();
        assert_eq!(report.hex, "a1b2c3");
        assert_eq!(report.flight, "UAL123");
        assert_eq!(report.alt_baro, Some(35000));
        assert_eq!(report.baro_rate, Some(-512));
        assert_eq!(report.squawk.as_deref(), Some("1200"));
        assert_eq!(report.messages, Some(4821));
        assert_eq!(report.data_source, SOURCE_DUMP1090);
        assert!(!report.on_ground);
    }

    #[test]
    fn test_from_receiver_json_ground_altitude() {
        let value = serde_json::json!({ "hex": "a1b2c3", "alt_baro": "ground" });
        let report = Aircraft::from_receiver_json(&value, SOURCE_DUMP1090).unwrap();
        assert!(report.on_ground);
        assert_eq!(report.alt_baro, None);
    }

    #[test]
    fn test_from_receiver_json_rejects_bad_hex() {
        let missing = serde_json::json!({ "flight": "UAL123" });
        assert_eq!(
            Aircraft::from_receiver_json(&missing, SOURCE_DUMP1090),
            Err(RecordError::MissingHex)
        );

        let invalid = serde_json::json!({ "hex": "wat" });
        assert_eq!(
            Aircraft::from_receiver_json(&invalid, SOURCE_DUMP1090),
            Err(RecordError::InvalidHex("wat".into()))
        );
    }

    #[test]
    fn test_from_receiver_json_tolerates_non_numeric_fields() {
        let value = serde_json::json!({ "hex": "a1b2c3", "gs": "fast", "lat": null });
        let report = Aircraft::from_receiver_json(&value, SOURCE_DUMP1090).unwrap();
        assert_eq!(report.gs, None);
        assert_eq!(report.lat, None);
    }

    #[test]
    fn test_registry_entry_field_round_trip() {
        let entry = RegistryEntry {
            registration: "N12345".into(),
            manufacturer: "Bell".into(),
            model: "407".into(),
            typecode: "B407".into(),
            operator: "Air Evac".into(),
            owner: "Air Evac EMS".into(),
            icao_aircraft_class: "H1T".into(),
        };

        let map: std::collections::HashMap<String, String> = entry
            .as_fields()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(RegistryEntry::from_fields(&map), entry);
    }
}
