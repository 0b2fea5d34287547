//! Registry enrichment and helicopter classification.
//!
//! One batch lookup per cycle; records without a registry entry stay bare
//! and can never classify as helicopters.

use std::collections::HashMap;

use crate::model::{Aircraft, RegistryEntry};

/// The classification rule: ICAO aircraft class beginning with `H`,
/// case-insensitive. Nothing else qualifies.
pub fn is_helicopter(icao_aircraft_class: Option<&str>) -> bool {
    icao_aircraft_class
        .and_then(|class| class.chars().next())
        .is_some_and(|first| first.eq_ignore_ascii_case(&'H'))
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Merge registry fields into the reports and classify. Returns the hit
/// count.
pub fn apply_enrichment(
    aircraft: &mut [Aircraft],
    entries: &HashMap<String, RegistryEntry>,
) -> usize {
    let mut hits = 0;
    for report in aircraft.iter_mut() {
        if let Some(entry) = entries.get(&report.hex) {
            hits += 1;
            report.registration = non_empty(&entry.registration);
            report.manufacturer = non_empty(&entry.manufacturer);
            report.model = non_empty(&entry.model);
            report.typecode = non_empty(&entry.typecode);
            report.operator = non_empty(&entry.operator);
            report.owner = non_empty(&entry.owner);
            report.icao_aircraft_class = non_empty(&entry.icao_aircraft_class);
            report.aircraft_type = match (&report.manufacturer, &report.model) {
                (Some(manufacturer), Some(model)) => Some(format!("{manufacturer} {model}")),
                (None, Some(model)) => Some(model.clone()),
                _ => report.icao_aircraft_class.clone(),
            };
        }
        report.is_helicopter = is_helicopter(report.icao_aircraft_class.as_deref());
    }
    hits
}

/// The helicopter subset, preserving input order.
pub fn helicopter_subset(aircraft: &[Aircraft]) -> Vec<Aircraft> {
    aircraft
        .iter()
        .filter(|report| report.is_helicopter)
        .cloned()
        .collect()
}
