//! Current road state per segment: friction from the weather feed, routing
//! penalty and severity from the incident feed.
//!
//! The resolver is the only writer. Weather and incidents touch disjoint
//! fields, so the resulting state does not depend on the order the two are
//! applied in.

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::{
    friction::CLEAR_FRICTION,
    geo::GridIndex,
    incident::{IncidentRecord, Severity},
    network::{Network, SegmentId},
    scenario::PenaltyConfig,
    weather::WeatherObservation,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoadSegmentState {
    pub segment_id: SegmentId,
    pub friction: f64,
    pub penalty_weight: f64,
    pub severity: Option<Severity>,
}

impl RoadSegmentState {
    fn new(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            friction: CLEAR_FRICTION,
            penalty_weight: 0.0,
            severity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }

    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }
}

/// What a batch of incidents did to the network.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IncidentImpact {
    /// Incidents that touched at least one segment.
    pub matched: usize,
    /// Incidents too far from every segment center.
    pub unmatched: usize,
    pub segments: SeverityCounts,
}

struct IndexedSegment {
    id: SegmentId,
    length_m: f64,
}

pub struct RoadStateResolver {
    states: BTreeMap<SegmentId, RoadSegmentState>,
    centers: GridIndex<IndexedSegment>,
    penalties: PenaltyConfig,
    weather: Option<WeatherObservation>,
}

impl RoadStateResolver {
    /// Builds default state for every segment and indexes segment centers once.
    pub fn new(network: &Network, penalties: PenaltyConfig) -> Self {
        let states = network
            .segments()
            .iter()
            .map(|segment| (segment.id.clone(), RoadSegmentState::new(segment.id.clone())))
            .collect();
        let centers = GridIndex::build(
            penalties.index_cell_size_m,
            network.segments().iter().map(|segment| {
                (
                    IndexedSegment {
                        id: segment.id.clone(),
                        length_m: segment.length_m,
                    },
                    segment.center,
                )
            }),
        );
        Self {
            states,
            centers,
            penalties,
            weather: None,
        }
    }

    pub fn apply_weather(&mut self, observation: &WeatherObservation) {
        for state in self.states.values_mut() {
            state.friction = observation.coefficient;
        }
        self.weather = Some(observation.clone());
    }

    /// Replaces every incident-derived field. Segments not near any record go
    /// back to zero penalty and no severity.
    pub fn apply_incidents(&mut self, records: &[IncidentRecord]) -> IncidentImpact {
        let mut touched: BTreeMap<SegmentId, Severity> = BTreeMap::new();
        let mut impact = IncidentImpact::default();

        for record in records {
            let base = self.match_radius(record.severity);
            let reach = base + self.penalties.max_length_bonus_m.max(0.0);
            let mut matched = false;
            for (segment, distance) in self.centers.within(&record.position, reach) {
                let bonus = (segment.length_m * self.penalties.length_fraction)
                    .clamp(0.0, self.penalties.max_length_bonus_m.max(0.0));
                if distance > base + bonus {
                    continue;
                }
                matched = true;
                touched
                    .entry(segment.id.clone())
                    .and_modify(|current| *current = (*current).max(record.severity))
                    .or_insert(record.severity);
            }
            if matched {
                impact.matched += 1;
            } else {
                impact.unmatched += 1;
                debug!(
                    "incident {} ({}) is not near any segment",
                    record.id, record.severity
                );
            }
        }

        for state in self.states.values_mut() {
            match touched.get(&state.segment_id) {
                Some(&severity) => {
                    state.severity = Some(severity);
                    state.penalty_weight = penalty_for(&self.penalties, severity);
                    impact.segments.add(severity);
                }
                None => {
                    state.severity = None;
                    state.penalty_weight = 0.0;
                }
            }
        }
        impact
    }

    fn match_radius(&self, severity: Severity) -> f64 {
        match severity {
            Severity::High => self.penalties.high_radius_m,
            Severity::Medium => self.penalties.medium_radius_m,
            Severity::Low => self.penalties.low_radius_m,
        }
    }

    pub fn segment(&self, id: &str) -> Option<&RoadSegmentState> {
        self.states.get(id)
    }

    pub fn states(&self) -> impl Iterator<Item = &RoadSegmentState> {
        self.states.values()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Friction currently applied network-wide.
    pub fn friction(&self) -> f64 {
        self.weather
            .as_ref()
            .map(|observation| observation.coefficient)
            .unwrap_or(CLEAR_FRICTION)
    }

    /// Penalized segments and their penalty, in segment order.
    pub fn edge_weight_overrides(&self) -> Vec<(SegmentId, f64)> {
        self.states
            .values()
            .filter(|state| state.penalty_weight > 0.0)
            .map(|state| (state.segment_id.clone(), state.penalty_weight))
            .collect()
    }

    pub fn severity_counts(&self) -> SeverityCounts {
        let mut counts = SeverityCounts::default();
        for severity in self.states.values().filter_map(|state| state.severity) {
            counts.add(severity);
        }
        counts
    }

    pub fn snapshot(&self) -> BTreeMap<SegmentId, RoadSegmentState> {
        self.states.clone()
    }
}

pub fn penalty_for(penalties: &PenaltyConfig, severity: Severity) -> f64 {
    match severity {
        Severity::High => penalties.high,
        Severity::Medium => penalties.medium,
        Severity::Low => penalties.low,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        incident::{Corridor, IncidentKind},
        network::fixtures::{corridor_network, ORIGIN},
    };

    fn incident(id: &str, north_m: f64, east_m: f64, severity: Severity) -> IncidentRecord {
        IncidentRecord {
            id: id.to_string(),
            corridor: Corridor::A2,
            position: ORIGIN.offset_m(north_m, east_m),
            severity,
            kind: IncidentKind::Warning,
            title: String::new(),
            reported_at: None,
        }
    }

    fn resolver() -> RoadStateResolver {
        RoadStateResolver::new(&corridor_network(), PenaltyConfig::default())
    }

    #[test]
    fn defaults_are_dry_and_unpenalized() {
        let resolver = resolver();
        assert_eq!(resolver.len(), 5);
        for state in resolver.states() {
            assert_eq!(state.friction, 1.0);
            assert_eq!(state.penalty_weight, 0.0);
            assert_eq!(state.severity, None);
        }
        assert!(resolver.edge_weight_overrides().is_empty());
    }

    #[test]
    fn weather_is_uniform() {
        let mut resolver = resolver();
        resolver.apply_weather(&WeatherObservation::from_code(75, Utc::now()));
        assert!(resolver.states().all(|state| state.friction == 0.35));
        assert_eq!(resolver.friction(), 0.35);
    }

    #[test]
    fn order_of_weather_and_incidents_does_not_matter() {
        let weather = WeatherObservation::from_code(65, Utc::now());
        let incidents = vec![
            incident("closure", 10.0, 500.0, Severity::High),
            incident("works", 0.0, 1_480.0, Severity::Medium),
        ];

        let mut first = resolver();
        first.apply_weather(&weather);
        first.apply_incidents(&incidents);

        let mut second = resolver();
        second.apply_incidents(&incidents);
        second.apply_weather(&weather);

        assert_eq!(first.snapshot(), second.snapshot());
        assert_eq!(first.edge_weight_overrides().len(), 2);
    }

    #[test]
    fn high_closure_outweighs_medium_construction() {
        let mut resolver = resolver();
        let impact = resolver.apply_incidents(&[
            incident("closure", 30.0, 500.0, Severity::High),
            incident("works", 0.0, 1_520.0, Severity::Medium),
        ]);
        assert_eq!(impact.matched, 2);
        let closed = resolver.segment("b").unwrap();
        let works = resolver.segment("d").unwrap();
        assert_eq!(closed.severity, Some(Severity::High));
        assert_eq!(works.severity, Some(Severity::Medium));
        assert!(closed.penalty_weight > works.penalty_weight);
        assert_eq!(resolver.segment("a").unwrap().penalty_weight, 0.0);
    }

    #[test]
    fn cleared_incidents_revert_to_zero() {
        let mut resolver = resolver();
        resolver.apply_incidents(&[incident("closure", 0.0, 1_000.0, Severity::High)]);
        assert_eq!(resolver.severity_counts().high, 1);

        let impact = resolver.apply_incidents(&[]);
        assert_eq!(impact, IncidentImpact::default());
        assert!(resolver.edge_weight_overrides().is_empty());
        assert_eq!(resolver.severity_counts().total(), 0);
    }

    #[test]
    fn radius_depends_on_severity() {
        let mut resolver = resolver();
        // 170 m from segment c: inside the closure radius, outside the warning one.
        let impact = resolver.apply_incidents(&[incident("warn", 170.0, 1_000.0, Severity::Low)]);
        assert_eq!(impact.unmatched, 1);
        assert!(resolver.segment("c").unwrap().severity.is_none());

        resolver.apply_incidents(&[incident("closed", 170.0, 1_000.0, Severity::High)]);
        assert_eq!(resolver.segment("c").unwrap().severity, Some(Severity::High));
    }

    #[test]
    fn overlapping_incidents_keep_the_worst() {
        let mut resolver = resolver();
        resolver.apply_incidents(&[
            incident("low", 0.0, 500.0, Severity::Low),
            incident("high", 20.0, 500.0, Severity::High),
            incident("medium", -20.0, 500.0, Severity::Medium),
        ]);
        let state = resolver.segment("b").unwrap();
        assert_eq!(state.severity, Some(Severity::High));
        assert_eq!(state.penalty_weight, PenaltyConfig::default().high);
    }
}
