//! Route preprocessor backed by an external `duarouter`-style binary.
//!
//! Inputs and outputs are exchanged through XML files in a scratch directory.

use std::{
    collections::HashMap,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use log::debug;
use quick_xml::{
    escape::escape,
    events::{BytesStart, Event},
    Reader,
};

use super::{RouteError, RouteMode, RoutePreprocessor, RouteRequest, RouteSet, TripDemand, VehicleRoute};
use crate::network::SegmentId;

const TRIPS_FILE: &str = "trips.xml";
const EXISTING_ROUTES_FILE: &str = "routes_in.xml";
const WEIGHTS_FILE: &str = "edge_weights.xml";
const OUTPUT_FILE: &str = "routes_out.xml";

pub struct RouterProcess {
    binary: PathBuf,
    network_file: PathBuf,
    work_dir: PathBuf,
    horizon_ticks: u64,
}

impl RouterProcess {
    pub fn new(
        binary: impl Into<PathBuf>,
        network_file: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        horizon_ticks: u64,
    ) -> Self {
        Self {
            binary: binary.into(),
            network_file: network_file.into(),
            work_dir: work_dir.into(),
            horizon_ticks,
        }
    }

    fn arguments(&self, request: &RouteRequest<'_>) -> Result<Vec<String>, RouteError> {
        let input = match request.mode {
            RouteMode::Fresh => {
                let path = self.work_dir.join(TRIPS_FILE);
                fs::write(&path, write_trip_xml(request.trips))?;
                path
            }
            RouteMode::Reweighted | RouteMode::Repair => {
                let path = self.work_dir.join(EXISTING_ROUTES_FILE);
                fs::write(&path, write_route_xml(request.existing))?;
                path
            }
        };

        let mut args = vec![
            "-n".to_string(),
            self.network_file.display().to_string(),
            "-r".to_string(),
            input.display().to_string(),
            "-o".to_string(),
            self.work_dir.join(OUTPUT_FILE).display().to_string(),
        ];
        if request.mode != RouteMode::Repair && !request.overrides.is_empty() {
            let weights = self.work_dir.join(WEIGHTS_FILE);
            fs::write(&weights, write_weight_xml(request.overrides, self.horizon_ticks))?;
            args.push("--weight-files".to_string());
            args.push(weights.display().to_string());
        }
        args.push("--ignore-errors".to_string());
        if request.mode != RouteMode::Fresh {
            args.push("--repair".to_string());
        }
        Ok(args)
    }
}

impl RoutePreprocessor for RouterProcess {
    fn route(&mut self, request: &RouteRequest<'_>) -> Result<RouteSet, RouteError> {
        fs::create_dir_all(&self.work_dir)?;
        let output = self.work_dir.join(OUTPUT_FILE);
        if output.exists() {
            fs::remove_file(&output)?;
        }

        let args = self.arguments(request)?;
        debug!("running {} {}", self.binary.display(), args.join(" "));
        let result = Command::new(&self.binary).args(&args).output().map_err(|err| {
            RouteError::Unavailable(format!("{}: {err}", self.binary.display()))
        })?;
        if !result.status.success() {
            return Err(RouteError::Process {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        read_route_file(&output)
    }
}

fn read_route_file(path: &Path) -> Result<RouteSet, RouteError> {
    let text = fs::read_to_string(path)
        .map_err(|err| RouteError::Parse(format!("{}: {err}", path.display())))?;
    read_route_xml(&text)
}

pub fn write_trip_xml(trips: &TripDemand) -> String {
    let mut xml = String::from("<routes>\n");
    for trip in &trips.trips {
        let _ = writeln!(
            xml,
            "    <trip id=\"{}\" depart=\"{}\" from=\"{}\" to=\"{}\"/>",
            escape(trip.id.as_str()),
            trip.depart,
            escape(trip.from.as_str()),
            escape(trip.to.as_str())
        );
    }
    xml.push_str("</routes>\n");
    xml
}

pub fn write_route_xml(routes: &RouteSet) -> String {
    let mut xml = String::from("<routes>\n");
    for route in &routes.routes {
        let edges: Vec<&str> = route.edges.iter().map(SegmentId::as_str).collect();
        let _ = writeln!(
            xml,
            "    <vehicle id=\"{}\" depart=\"{}\">\n        <route edges=\"{}\"/>\n    </vehicle>",
            escape(route.vehicle.as_str()),
            route.depart,
            escape(edges.join(" ").as_str())
        );
    }
    xml.push_str("</routes>\n");
    xml
}

/// Edge weights in meandata form, one interval covering the whole run.
pub fn write_weight_xml(overrides: &[(SegmentId, f64)], horizon_ticks: u64) -> String {
    let mut xml = String::from("<meandata>\n");
    let _ = writeln!(xml, "    <interval begin=\"0\" end=\"{horizon_ticks}\">");
    for (segment, weight) in overrides {
        let _ = writeln!(
            xml,
            "        <edge id=\"{}\" traveltime=\"{}\"/>",
            escape(segment.as_str()),
            weight
        );
    }
    xml.push_str("    </interval>\n</meandata>\n");
    xml
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, RouteError> {
    let attr = element
        .try_get_attribute(name)
        .map_err(|err| RouteError::Parse(err.to_string()))?;
    match attr {
        Some(attr) => attr
            .unescape_value()
            .map(|value| Some(value.into_owned()))
            .map_err(|err| RouteError::Parse(err.to_string())),
        None => Ok(None),
    }
}

fn split_edges(edges: &str) -> Vec<SegmentId> {
    edges.split_whitespace().map(SegmentId::from).collect()
}

fn parse_depart(value: Option<String>) -> u64 {
    // The router writes departures as floats ("5.00"); "triggered" and
    // similar keywords map to zero.
    value
        .and_then(|depart| depart.parse::<f64>().ok())
        .filter(|depart| depart.is_finite() && *depart >= 0.0)
        .map(|depart| depart.floor() as u64)
        .unwrap_or(0)
}

struct PendingVehicle {
    id: String,
    depart: u64,
    edges: Option<Vec<SegmentId>>,
}

/// Reads a route file: vehicles with an embedded `<route edges=..>` or a
/// `route=` reference to a named top-level route.
pub fn read_route_xml(xml: &str) -> Result<RouteSet, RouteError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut named: HashMap<String, Vec<SegmentId>> = HashMap::new();
    let mut routes = Vec::new();
    let mut pending: Option<PendingVehicle> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| RouteError::Parse(err.to_string()))?;
        let is_empty = matches!(event, Event::Empty(_));
        match event {
            Event::Start(element) | Event::Empty(element) => {
                match element.name().as_ref() {
                    b"vehicle" => {
                        let id = attribute(&element, "id")?
                            .ok_or_else(|| RouteError::Parse("vehicle without id".into()))?;
                        let depart = parse_depart(attribute(&element, "depart")?);
                        let edges = match attribute(&element, "route")? {
                            Some(route_id) => Some(named.get(&route_id).cloned().ok_or_else(
                                || RouteError::Parse(format!("unknown route reference {route_id}")),
                            )?),
                            None => None,
                        };
                        let vehicle = PendingVehicle { id, depart, edges };
                        if is_empty {
                            finish_vehicle(vehicle, &mut routes)?;
                        } else {
                            pending = Some(vehicle);
                        }
                    }
                    b"route" => {
                        let edges = split_edges(&attribute(&element, "edges")?.unwrap_or_default());
                        match pending.as_mut() {
                            Some(vehicle) => vehicle.edges = Some(edges),
                            None => {
                                if let Some(id) = attribute(&element, "id")? {
                                    named.insert(id, edges);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(element) if element.name().as_ref() == b"vehicle" => {
                if let Some(vehicle) = pending.take() {
                    finish_vehicle(vehicle, &mut routes)?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(RouteSet::new(routes))
}

fn finish_vehicle(vehicle: PendingVehicle, routes: &mut Vec<VehicleRoute>) -> Result<(), RouteError> {
    let edges = vehicle
        .edges
        .ok_or_else(|| RouteError::Parse(format!("vehicle {} has no route", vehicle.id)))?;
    routes.push(VehicleRoute {
        vehicle: vehicle.id,
        depart: vehicle.depart,
        edges,
    });
    Ok(())
}
