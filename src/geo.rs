//! Geographic helpers and the grid index over segment centers

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in meters.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    /// Point displaced by the given offsets in meters (north, east).
    pub fn offset_m(&self, north_m: f64, east_m: f64) -> GeoPoint {
        let lat = self.lat + (north_m / EARTH_RADIUS_M).to_degrees();
        let lon = self.lon + (east_m / (EARTH_RADIUS_M * self.lat.to_radians().cos())).to_degrees();
        GeoPoint { lat, lon }
    }
}

/// Planar position in meters relative to a projection origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalPoint {
    pub x: f64,
    pub y: f64,
}

/// Equirectangular projection around a fixed origin. Accurate to well under a
/// meter over the few tens of kilometers a single network spans.
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    origin: GeoPoint,
    cos_lat: f64,
}

impl LocalProjection {
    pub fn new(origin: GeoPoint) -> Self {
        Self {
            origin,
            cos_lat: origin.lat.to_radians().cos(),
        }
    }

    pub fn project(&self, point: &GeoPoint) -> LocalPoint {
        LocalPoint {
            x: EARTH_RADIUS_M * (point.lon - self.origin.lon).to_radians() * self.cos_lat,
            y: EARTH_RADIUS_M * (point.lat - self.origin.lat).to_radians(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CellPos {
    x: i64,
    y: i64,
}

/// Uniform grid bucketing of points, built once and queried by radius.
pub struct GridIndex<T> {
    projection: LocalProjection,
    cell_size_m: f64,
    cells: HashMap<CellPos, Vec<usize>>,
    entries: Vec<(T, GeoPoint)>,
}

impl<T> GridIndex<T> {
    pub fn build(cell_size_m: f64, points: impl IntoIterator<Item = (T, GeoPoint)>) -> Self {
        let entries: Vec<(T, GeoPoint)> = points.into_iter().collect();
        let origin = entries
            .first()
            .map(|(_, point)| *point)
            .unwrap_or(GeoPoint::new(0.0, 0.0));
        let cell_size_m = if cell_size_m > 0.0 { cell_size_m } else { 250.0 };
        let mut index = Self {
            projection: LocalProjection::new(origin),
            cell_size_m,
            cells: HashMap::new(),
            entries: Vec::new(),
        };
        for (slot, (_, point)) in entries.iter().enumerate() {
            let cell = index.cell_of(point);
            index.cells.entry(cell).or_default().push(slot);
        }
        index.entries = entries;
        index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    fn cell_of(&self, point: &GeoPoint) -> CellPos {
        let local = self.projection.project(point);
        CellPos {
            x: (local.x / self.cell_size_m).floor() as i64,
            y: (local.y / self.cell_size_m).floor() as i64,
        }
    }

    /// Entries whose point lies within `radius_m` of `center`, nearest first.
    pub fn within(&self, center: &GeoPoint, radius_m: f64) -> Vec<(&T, f64)> {
        if radius_m < 0.0 || !center.is_valid() {
            return Vec::new();
        }
        let home = self.cell_of(center);
        let reach = (radius_m / self.cell_size_m).ceil() as i64;
        let mut hits = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let cell = CellPos {
                    x: home.x + dx,
                    y: home.y + dy,
                };
                let Some(slots) = self.cells.get(&cell) else {
                    continue;
                };
                for &slot in slots {
                    let (item, point) = &self.entries[slot];
                    let distance = center.distance_m(point);
                    if distance <= radius_m {
                        hits.push((slot, item, distance));
                    }
                }
            }
        }
        hits.sort_by(|a, b| a.2.total_cmp(&b.2).then(a.0.cmp(&b.0)));
        hits.into_iter()
            .map(|(_, item, distance)| (item, distance))
            .collect()
    }

    /// Single nearest entry within `radius_m`.
    pub fn nearest(&self, center: &GeoPoint, radius_m: f64) -> Option<(&T, f64)> {
        self.within(center, radius_m).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WOLFSBURG: GeoPoint = GeoPoint {
        lat: 52.42,
        lon: 10.78,
    };

    #[test]
    fn test_distance_matches_offsets() {
        let north = WOLFSBURG.offset_m(100.0, 0.0);
        let east = WOLFSBURG.offset_m(0.0, 250.0);
        assert!((WOLFSBURG.distance_m(&north) - 100.0).abs() < 0.5);
        assert!((WOLFSBURG.distance_m(&east) - 250.0).abs() < 0.5);
        assert_eq!(WOLFSBURG.distance_m(&WOLFSBURG), 0.0);
    }

    #[test]
    fn test_projection_is_metric_near_origin() {
        let projection = LocalProjection::new(WOLFSBURG);
        let local = projection.project(&WOLFSBURG.offset_m(300.0, -400.0));
        assert!((local.y - 300.0).abs() < 0.5);
        assert!((local.x + 400.0).abs() < 0.5);
    }

    #[test]
    fn test_grid_query_crosses_cells() {
        let points = vec![
            ("a", WOLFSBURG),
            ("b", WOLFSBURG.offset_m(90.0, 0.0)),
            ("c", WOLFSBURG.offset_m(0.0, 180.0)),
            ("d", WOLFSBURG.offset_m(5_000.0, 5_000.0)),
        ];
        let index = GridIndex::build(50.0, points);
        assert_eq!(index.len(), 4);
        assert!(index.cell_count() >= 3);

        let hits: Vec<&str> = index
            .within(&WOLFSBURG.offset_m(10.0, 0.0), 200.0)
            .into_iter()
            .map(|(name, _)| *name)
            .collect();
        assert_eq!(hits, vec!["a", "b", "c"]);

        let nearest = index.nearest(&WOLFSBURG.offset_m(80.0, 0.0), 50.0);
        assert_eq!(nearest.map(|(name, _)| *name), Some("b"));
        assert!(index.nearest(&WOLFSBURG.offset_m(-2_000.0, 0.0), 100.0).is_none());
    }
}
