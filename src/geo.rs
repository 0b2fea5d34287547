//! Great-circle distance and bounding-box derivation.

/// Mean earth radius in statute miles.
const EARTH_RADIUS_MILES: f64 = 3958.7613;

/// Statute miles per degree of latitude.
const MILES_PER_DEGREE: f64 = 69.0;

/// Safety margin applied to derived bounding boxes.
const BBOX_WIDEN_FACTOR: f64 = 1.02;

/// A point on the earth's surface in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Geographic bounding box for region clipping and wide-area queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Bounding box covering the entire globe.
    pub const GLOBAL: Self = Self {
        south: -90.0,
        north: 90.0,
        west: -180.0,
        east: 180.0,
    };

    /// Derive the box around `center` that contains a circle of
    /// `radius_miles`, widened by a 2% safety margin.
    ///
    /// Degenerate inputs (centers at the poles, radii spanning a quarter of
    /// the globe or more) clamp to [`BoundingBox::GLOBAL`].
    pub fn around(center: Position, radius_miles: f64) -> Self {
        if radius_miles >= 90.0 * MILES_PER_DEGREE {
            return Self::GLOBAL;
        }

        let cos_lat = center.lat.to_radians().cos();
        if cos_lat <= f64::EPSILON {
            return Self::GLOBAL;
        }

        let dlat = radius_miles / MILES_PER_DEGREE * BBOX_WIDEN_FACTOR;
        let dlon = radius_miles / (MILES_PER_DEGREE * cos_lat) * BBOX_WIDEN_FACTOR;

        let south = (center.lat - dlat).max(-90.0);
        let north = (center.lat + dlat).min(90.0);
        let west = (center.lon - dlon).max(-180.0);
        let east = (center.lon + dlon).min(180.0);

        Self {
            south,
            north,
            west,
            east,
        }
    }

    /// Whether a point lies inside the box. Edges are inclusive.
    pub fn contains(&self, pos: Position) -> bool {
        pos.lat >= self.south && pos.lat <= self.north && pos.lon >= self.west && pos.lon <= self.east
    }

    /// Box area in square degrees, used for wide-area credit costing.
    pub fn area_sq_deg(&self) -> f64 {
        (self.north - self.south) * (self.east - self.west)
    }
}

/// Great-circle distance between two points via the haversine formula.
pub fn distance_miles(a: Position, b: Position) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_MILES * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_zero() {
        let p = Position::new(32.3513, -95.3011);
        assert!(distance_miles(p, p) < 1e-9);
    }

    #[test]
    fn test_distance_nearby_aircraft() {
        // Tyler, TX region center to an aircraft a few miles north.
        let center = Position::new(32.3513, -95.3011);
        let aircraft = Position::new(32.4, -95.3);
        let d = distance_miles(center, aircraft);
        assert!(d > 3.3 && d < 3.45, "unexpected distance: {d}");
    }

    #[test]
    fn test_distance_symmetric_and_deterministic() {
        let a = Position::new(40.6413, -73.7781); // JFK
        let b = Position::new(33.9416, -118.4085); // LAX
        let d1 = distance_miles(a, b);
        let d2 = distance_miles(b, a);
        assert!((d1 - d2).abs() < 1e-6);
        // Known distance is roughly 2475 mi.
        assert!(d1 > 2440.0 && d1 < 2500.0, "unexpected distance: {d1}");
    }

    #[test]
    fn test_bbox_around_widened() {
        let center = Position::new(32.3513, -95.3011);
        let bbox = BoundingBox::around(center, 150.0);

        let expected_dlat = 150.0 / 69.0 * 1.02;
        assert!((bbox.north - center.lat - expected_dlat).abs() < 1e-9);
        assert!((center.lat - bbox.south - expected_dlat).abs() < 1e-9);
        // Longitude span is wider than latitude span away from the equator.
        assert!(bbox.east - bbox.west > bbox.north - bbox.south);
    }

    #[test]
    fn test_bbox_edge_inclusive() {
        let bbox = BoundingBox::around(Position::new(32.3513, -95.3011), 150.0);
        assert!(bbox.contains(Position::new(bbox.north, bbox.west)));
        assert!(!bbox.contains(Position::new(bbox.north + 1e-6, bbox.west)));
    }

    #[test]
    fn test_bbox_degenerate_radius_clamps_to_globe() {
        let bbox = BoundingBox::around(Position::new(0.0, 0.0), 90.0 * 69.0);
        assert_eq!(bbox, BoundingBox::GLOBAL);
    }

    #[test]
    fn test_bbox_pole_clamps_to_globe() {
        let bbox = BoundingBox::around(Position::new(90.0, 0.0), 100.0);
        assert_eq!(bbox, BoundingBox::GLOBAL);
    }

    #[test]
    fn test_bbox_area() {
        let bbox = BoundingBox {
            south: 30.0,
            north: 35.0,
            west: -100.0,
            east: -95.0,
        };
        assert!((bbox.area_sq_deg() - 25.0).abs() < 1e-9);
    }
}
