//! Cross-module coverage of the blend → enrich → classify pipeline.

use std::collections::HashMap;

use skyfuse::blender::{blend, SourceBatch};
use skyfuse::enrich::{apply_enrichment, helicopter_subset};
use skyfuse::geo::{BoundingBox, Position};
use skyfuse::model::{
    pi_station_tag, Aircraft, RegistryEntry, SourcePriority, SOURCE_BLENDED, SOURCE_DUMP1090,
    SOURCE_OPENSKY,
};

const CENTER: Position = Position::new(32.3513, -95.3011);

fn region_bbox() -> BoundingBox {
    BoundingBox::around(CENTER, 150.0)
}

fn report(hex: &str, lat: f64, lon: f64, source: &str) -> Aircraft {
    let mut record = Aircraft::new(hex, source);
    record.lat = Some(lat);
    record.lon = Some(lon);
    record
}

fn registry_entry(class: &str, registration: &str) -> RegistryEntry {
    RegistryEntry {
        registration: registration.to_string(),
        icao_aircraft_class: class.to_string(),
        ..Default::default()
    }
}

#[test]
fn full_cycle_blends_enriches_and_classifies() {
    // Three sources: one pi-station push, the local receiver, the wide-area
    // API. Hex a1b2c3 appears in all three; b2c3d4 only from the station;
    // c3d4e5 only from the wide-area API.
    let mut station_a = report("a1b2c3", 32.40, -95.30, "pi_station:ETEX01");
    station_a.seen = Some(0.4);
    station_a.alt_baro = Some(3500);
    let station_b = report("b2c3d4", 32.37, -95.31, "pi_station:ETEX01");

    let mut local_a = report("a1b2c3", 32.41, -95.29, SOURCE_DUMP1090);
    local_a.seen = Some(0.2);
    let wide_a = report("a1b2c3", 32.42, -95.28, SOURCE_OPENSKY);
    let wide_c = report("c3d4e5", 33.0, -95.5, SOURCE_OPENSKY);

    let batches = vec![
        SourceBatch {
            source_id: pi_station_tag("ETEX01"),
            priority: SourcePriority::PiStation,
            reports: vec![station_a, station_b],
        },
        SourceBatch {
            source_id: SOURCE_DUMP1090.to_string(),
            priority: SourcePriority::LocalReceiver,
            reports: vec![local_a],
        },
        SourceBatch {
            source_id: SOURCE_OPENSKY.to_string(),
            priority: SourcePriority::WideArea,
            reports: vec![wide_a, wide_c],
        },
    ];

    let outcome = blend(&batches, region_bbox(), CENTER);

    // One record per distinct hex survives.
    assert_eq!(outcome.aircraft.len(), 3);
    let by_hex: HashMap<&str, &Aircraft> = outcome
        .aircraft
        .iter()
        .map(|record| (record.hex.as_str(), record))
        .collect();

    // The three-source group fuses; the station's report wins on priority.
    let fused = by_hex["a1b2c3"];
    assert_eq!(fused.data_source, SOURCE_BLENDED);
    assert_eq!(fused.alt_baro, Some(3500));

    // Single-source groups keep their provenance verbatim.
    assert_eq!(by_hex["b2c3d4"].data_source, "pi_station:ETEX01");
    assert_eq!(by_hex["c3d4e5"].data_source, SOURCE_OPENSKY);

    // Sorted by distance, then hex.
    let distances: Vec<f64> = outcome
        .aircraft
        .iter()
        .map(|record| record.distance_miles.unwrap())
        .collect();
    let mut sorted = distances.clone();
    sorted.sort_by(f64::total_cmp);
    assert_eq!(distances, sorted);

    // Enrichment: the station-only aircraft is a helicopter.
    let mut aircraft = outcome.aircraft;
    let mut entries = HashMap::new();
    entries.insert("b2c3d4".to_string(), registry_entry("H2T", "N911XX"));
    entries.insert("a1b2c3".to_string(), registry_entry("L2J", "N12345"));
    let hits = apply_enrichment(&mut aircraft, &entries);
    assert_eq!(hits, 2);

    let choppers = helicopter_subset(&aircraft);
    assert_eq!(choppers.len(), 1);
    assert_eq!(choppers[0].hex, "b2c3d4");
    assert_eq!(choppers[0].registration.as_deref(), Some("N911XX"));

    // Helicopter subset preserves blended ordering and is a subset.
    assert!(aircraft.iter().any(|record| record.hex == "b2c3d4"));
    // Unenriched records never classify.
    let wide_only = aircraft
        .iter()
        .find(|record| record.hex == "c3d4e5")
        .unwrap();
    assert!(!wide_only.is_helicopter);
}

#[test]
fn records_survive_serialization_between_cycles() {
    // A published record read back from the cache (e.g. a push buffer)
    // normalizes to the same value.
    let mut record = report("a1b2c3", 32.4, -95.3, pi_station_tag("ETEX01").as_str());
    record.flight = "UAL123".into();
    record.gs = Some(450.0);
    record.distance_miles = Some(3.37);

    let json = serde_json::to_string(&record).unwrap();
    let back: Aircraft = serde_json::from_str(&json).unwrap();
    assert_eq!(back, record);
}
