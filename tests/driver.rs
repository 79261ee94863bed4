mod common;

use std::sync::atomic::Ordering;

use common::{center_of, feed, incident, load_scenario, GraphRouter, ScriptedSource};
use roadstate::{
    engine::{DriverBuilder, DriverSettings},
    incident::{Corridor, IncidentFeed},
    report::StopReason,
    routing::{RouteMode, RouteTier, TierOutcome},
    weather::TEST_FRICTION,
};

#[test]
fn test_mode_hour_polls_incidents_four_times_at_fixed_friction() {
    let (config, network, trips) = load_scenario();
    let source = ScriptedSource::new(Vec::new());
    let fetches = source.fetches.clone();
    let incidents = IncidentFeed::new(
        Box::new(source),
        config.incidents.services.clone(),
        config.incidents.severity_rules.clone(),
        config.incidents.dedup_radius_m,
    );
    let driver = DriverBuilder::new(DriverSettings::from_config(&config), network.clone(), trips)
        .with_incidents(incidents)
        .with_router(GraphRouter::new(&network))
        .build()
        .unwrap();

    let mut ticks = 0;
    let mut polls = Vec::new();
    let mut frictions_fixed = true;
    let report = driver
        .run_with_hook(|summary| {
            ticks += 1;
            frictions_fixed &= summary.friction == TEST_FRICTION;
            if summary.incident_poll {
                polls.push(summary.tick);
            }
        })
        .unwrap();

    assert_eq!(ticks, 3_600);
    assert!(frictions_fixed);
    assert_eq!(polls, vec![900, 1_800, 2_700, 3_600]);
    // Two corridors, three services per poll.
    assert_eq!(fetches.load(Ordering::SeqCst), 4 * 2 * 3);
    assert_eq!(report.stop_reason, StopReason::DurationReached);
    assert_eq!(report.summary.reroutes, 0);
    assert!(report.steps.iter().all(|step| step.friction == TEST_FRICTION));
}

#[test]
fn reroutes_only_when_the_incident_set_changes() {
    let (config, network, trips) = load_scenario();
    let closure = incident("A39 Vollsperrung", center_of(&network, "a39_3"));
    let second = incident("A2 gesperrt", center_of(&network, "a2_1"));
    let source = ScriptedSource::new(vec![
        vec![closure.clone()],
        vec![closure.clone()],
        vec![closure.clone(), second.clone()],
        vec![closure, second],
    ]);
    let router = GraphRouter::new(&network);
    let requests = router.requests.clone();

    let mut settings = DriverSettings::from_config(&config);
    settings.corridors = vec![Corridor::A39];
    let driver = DriverBuilder::new(settings, network, trips)
        .with_incidents(feed(source, "warning"))
        .with_router(router)
        .build()
        .unwrap();

    let mut polls = Vec::new();
    driver
        .run_with_hook(|summary| {
            if summary.incident_poll {
                polls.push((summary.tick, summary.reroute_tier));
            }
        })
        .unwrap();

    assert_eq!(
        polls,
        vec![
            (900, Some(RouteTier::Reweighted)),
            (1_800, None),
            (2_700, Some(RouteTier::Reweighted)),
            (3_600, None),
        ]
    );
    let requests = requests.lock().unwrap();
    let shape: Vec<(RouteMode, usize)> = requests
        .iter()
        .map(|(mode, overrides)| (*mode, overrides.len()))
        .collect();
    assert_eq!(
        shape,
        vec![
            (RouteMode::Fresh, 0),
            (RouteMode::Reweighted, 1),
            (RouteMode::Reweighted, 2),
        ]
    );
}

#[test]
fn closures_are_penalized_above_construction() {
    let (config, network, trips) = load_scenario();
    let source = ScriptedSource::new(vec![vec![
        incident("Vollsperrung nach Unfall", center_of(&network, "a39_3")),
        incident("Baustelle, Fahrstreifen verengt", center_of(&network, "a2_1")),
    ]]);
    let router = GraphRouter::new(&network);
    let requests = router.requests.clone();

    let mut settings = DriverSettings::from_config(&config);
    settings.duration_ticks = 900;
    settings.corridors = vec![Corridor::A39];
    let report = DriverBuilder::new(settings, network, trips)
        .with_incidents(feed(source, "warning"))
        .with_router(router)
        .build()
        .unwrap()
        .run()
        .unwrap();

    let cycle = &report.incident_cycles[0];
    assert_eq!(cycle.penalized.high, 1);
    assert_eq!(cycle.penalized.medium, 1);

    let requests = requests.lock().unwrap();
    let (_, overrides) = requests.last().unwrap();
    let weight = |id: &str| {
        overrides
            .iter()
            .find(|(segment, _)| segment.as_str() == id)
            .map(|(_, weight)| *weight)
            .unwrap()
    };
    assert!(weight("a39_3") > weight("a2_1"));
}

#[test]
fn failing_router_tiers_fall_back_without_stopping_the_run() {
    let (config, network, trips) = load_scenario();
    let source = ScriptedSource::new(vec![vec![incident(
        "Vollsperrung",
        center_of(&network, "a39_3"),
    )]]);
    let router =
        GraphRouter::new(&network).failing(&[RouteMode::Reweighted, RouteMode::Repair]);

    let mut settings = DriverSettings::from_config(&config);
    settings.duration_ticks = 1_000;
    settings.corridors = vec![Corridor::A39];
    let report = DriverBuilder::new(settings, network, trips)
        .with_incidents(feed(source, "warning"))
        .with_router(router)
        .build()
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(report.ticks_completed, 1_000);
    assert_eq!(report.incident_cycles[0].reroute_tier, Some(RouteTier::Fresh));
    let rebuild = report
        .route_attempts
        .iter()
        .find(|log| log.tick == 900)
        .unwrap();
    let outcomes: Vec<(RouteTier, bool)> = rebuild
        .attempts
        .iter()
        .map(|attempt| {
            (
                attempt.tier,
                matches!(attempt.outcome, TierOutcome::Succeeded { .. }),
            )
        })
        .collect();
    assert_eq!(
        outcomes,
        vec![
            (RouteTier::Reweighted, false),
            (RouteTier::Repair, false),
            (RouteTier::Fresh, true),
        ]
    );
}

#[test]
fn router_outage_runs_on_minimal_routes() {
    let (config, network, trips) = load_scenario();
    let router = GraphRouter::new(&network).failing(&[
        RouteMode::Reweighted,
        RouteMode::Repair,
        RouteMode::Fresh,
    ]);

    let mut settings = DriverSettings::from_config(&config);
    settings.duration_ticks = 300;
    let report = DriverBuilder::new(settings, network, trips)
        .with_incidents(feed(ScriptedSource::new(Vec::new()), "warning"))
        .with_router(router)
        .build()
        .unwrap()
        .run()
        .unwrap();

    let initial = &report.route_attempts[0];
    assert_eq!(initial.tick, 0);
    assert_eq!(initial.attempts.last().unwrap().tier, RouteTier::Minimal);
    assert_eq!(report.ticks_completed, 300);
    assert!(report.steps.iter().any(|step| step.average_speed_kmh > 0.0));
}
