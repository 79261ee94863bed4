//! Weather code to road-surface friction lookup.
//!
//! Codes follow the WMO interpretation used by Open-Meteo. Every code resolves to
//! a coefficient; codes outside the table fail closed to [`UNKNOWN_FRICTION`].

use serde::{Deserialize, Serialize};

pub type WeatherCode = i32;

/// Coefficient applied when the classification code is not in the table.
pub const UNKNOWN_FRICTION: f64 = 0.45;

pub const CLEAR_FRICTION: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherClass {
    Clear,
    Cloudy,
    Fog,
    Drizzle,
    Rain,
    Snow,
    Extreme,
    Unknown,
}

impl WeatherClass {
    /// Inclusive coefficient range documented for the class.
    pub fn range(self) -> (f64, f64) {
        match self {
            WeatherClass::Clear => (1.0, 1.0),
            WeatherClass::Cloudy => (0.85, 0.95),
            WeatherClass::Fog => (0.65, 0.8),
            WeatherClass::Drizzle => (0.65, 0.75),
            WeatherClass::Rain => (0.5, 0.7),
            WeatherClass::Snow => (0.3, 0.55),
            WeatherClass::Extreme => (0.25, 0.45),
            WeatherClass::Unknown => (UNKNOWN_FRICTION, UNKNOWN_FRICTION),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrictionEntry {
    pub code: WeatherCode,
    pub label: &'static str,
    pub class: WeatherClass,
    pub coefficient: f64,
}

const fn entry(
    code: WeatherCode,
    label: &'static str,
    class: WeatherClass,
    coefficient: f64,
) -> FrictionEntry {
    FrictionEntry {
        code,
        label,
        class,
        coefficient,
    }
}

pub const FRICTION_TABLE: &[FrictionEntry] = &[
    entry(0, "Clear sky", WeatherClass::Clear, 1.0),
    entry(1, "Mainly clear", WeatherClass::Cloudy, 0.95),
    entry(2, "Partly cloudy", WeatherClass::Cloudy, 0.9),
    entry(3, "Overcast", WeatherClass::Cloudy, 0.85),
    entry(45, "Fog", WeatherClass::Fog, 0.8),
    entry(48, "Dense fog", WeatherClass::Fog, 0.65),
    entry(51, "Light drizzle", WeatherClass::Drizzle, 0.75),
    entry(53, "Moderate drizzle", WeatherClass::Drizzle, 0.7),
    entry(55, "Dense drizzle", WeatherClass::Drizzle, 0.65),
    entry(61, "Light rain", WeatherClass::Rain, 0.7),
    entry(63, "Moderate rain", WeatherClass::Rain, 0.6),
    entry(65, "Heavy rain", WeatherClass::Rain, 0.5),
    entry(71, "Light snow", WeatherClass::Snow, 0.55),
    entry(73, "Moderate snow", WeatherClass::Snow, 0.45),
    entry(75, "Heavy snow", WeatherClass::Snow, 0.35),
    entry(77, "Snow grains", WeatherClass::Snow, 0.5),
    entry(80, "Light rain showers", WeatherClass::Rain, 0.65),
    entry(81, "Moderate rain showers", WeatherClass::Rain, 0.55),
    entry(82, "Violent rain showers", WeatherClass::Extreme, 0.4),
    entry(85, "Light snow showers", WeatherClass::Snow, 0.5),
    entry(86, "Heavy snow showers", WeatherClass::Snow, 0.3),
    entry(95, "Thunderstorm", WeatherClass::Extreme, 0.45),
    entry(96, "Thunderstorm with hail", WeatherClass::Extreme, 0.35),
    entry(99, "Thunderstorm with heavy hail", WeatherClass::Extreme, 0.25),
];

const UNKNOWN_ENTRY: FrictionEntry = entry(-1, "Unknown", WeatherClass::Unknown, UNKNOWN_FRICTION);

/// Looks up the full table entry for `code`. Never fails.
pub fn lookup(code: WeatherCode) -> FrictionEntry {
    FRICTION_TABLE
        .iter()
        .find(|entry| entry.code == code)
        .copied()
        .unwrap_or(FrictionEntry {
            code,
            ..UNKNOWN_ENTRY
        })
}

pub fn friction_for(code: WeatherCode) -> f64 {
    lookup(code).coefficient
}

pub fn classify(code: WeatherCode) -> WeatherClass {
    lookup(code).class
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_code_stays_inside_its_class_range() {
        for entry in FRICTION_TABLE {
            let (low, high) = entry.class.range();
            assert!(
                entry.coefficient >= low && entry.coefficient <= high,
                "code {} ({}) maps to {} outside {:?}",
                entry.code,
                entry.label,
                entry.coefficient,
                entry.class
            );
            assert!((0.0..=1.0).contains(&entry.coefficient));
        }
    }

    #[test]
    fn clear_sky_is_full_grip() {
        assert_eq!(friction_for(0), CLEAR_FRICTION);
        assert_eq!(classify(0), WeatherClass::Clear);
    }

    #[test]
    fn unknown_codes_fail_closed() {
        for code in [-7, 4, 50, 100, 1_000] {
            assert_eq!(friction_for(code), UNKNOWN_FRICTION);
            assert_eq!(classify(code), WeatherClass::Unknown);
        }
        assert!(UNKNOWN_FRICTION < CLEAR_FRICTION);
        assert_eq!(lookup(4).code, 4);
    }

    #[test]
    fn heavy_hail_is_the_floor() {
        let floor = FRICTION_TABLE
            .iter()
            .map(|entry| entry.coefficient)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(floor, friction_for(99));
        assert_eq!(floor, 0.25);
    }
}
