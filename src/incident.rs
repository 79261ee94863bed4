//! Incident feed: polls corridor incident services, normalizes the records,
//! classifies severity and removes near-coincident duplicates.

use std::{
    collections::BTreeMap,
    convert::Infallible,
    fmt,
    str::FromStr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{feed::FeedError, geo::GeoPoint, scenario::IncidentConfig};

/// Distance under which two reports on the same corridor are one incident.
pub const DUPLICATE_RADIUS_M: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Corridor {
    A2,
    A39,
    Other(String),
}

impl Corridor {
    pub fn as_str(&self) -> &str {
        match self {
            Corridor::A2 => "A2",
            Corridor::A39 => "A39",
            Corridor::Other(name) => name,
        }
    }
}

impl FromStr for Corridor {
    type Err = Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_uppercase();
        Ok(match value.as_str() {
            "A2" => Corridor::A2,
            "A39" => Corridor::A39,
            _ => Corridor::Other(value),
        })
    }
}

impl TryFrom<String> for Corridor {
    type Error = Infallible;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Corridor> for String {
    fn from(value: Corridor) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Corridor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    Closure,
    Construction,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    pub corridor: Corridor,
    pub position: GeoPoint,
    pub severity: Severity,
    pub kind: IncidentKind,
    pub title: String,
    pub reported_at: Option<DateTime<Utc>>,
}

/// An incident as delivered by the source, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct RawIncident {
    pub identifier: Option<String>,
    pub title: String,
    pub description: Vec<String>,
    pub position: GeoPoint,
    pub start_timestamp: Option<String>,
    pub blocked: bool,
}

fn default_high_keywords() -> Vec<String> {
    ["gesperrt", "vollsperrung", "sperrung", "blocked", "closed", "closure"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_medium_keywords() -> Vec<String> {
    [
        "baustelle",
        "construction",
        "roadwork",
        "lane",
        "fahrstreifen",
        "verengung",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_high_services() -> Vec<String> {
    vec!["closure".to_string()]
}

fn default_medium_services() -> Vec<String> {
    vec!["roadworks".to_string()]
}

/// Keyword and category rules mapping free-text incidents to a severity.
/// Matching is case-insensitive over the title and description lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityRules {
    #[serde(default = "default_high_keywords")]
    pub high_keywords: Vec<String>,
    #[serde(default = "default_medium_keywords")]
    pub medium_keywords: Vec<String>,
    #[serde(default = "default_high_services")]
    pub high_services: Vec<String>,
    #[serde(default = "default_medium_services")]
    pub medium_services: Vec<String>,
}

impl Default for SeverityRules {
    fn default() -> Self {
        Self {
            high_keywords: default_high_keywords(),
            medium_keywords: default_medium_keywords(),
            high_services: default_high_services(),
            medium_services: default_medium_services(),
        }
    }
}

impl SeverityRules {
    pub fn classify(&self, service: &str, raw: &RawIncident) -> (Severity, IncidentKind) {
        let mut text = raw.title.to_lowercase();
        for line in &raw.description {
            text.push('\n');
            text.push_str(&line.to_lowercase());
        }
        let mentions =
            |keywords: &[String]| keywords.iter().any(|word| text.contains(&word.to_lowercase()));
        let in_services =
            |services: &[String]| services.iter().any(|name| name.eq_ignore_ascii_case(service));

        if raw.blocked || in_services(&self.high_services) || mentions(&self.high_keywords) {
            (Severity::High, IncidentKind::Closure)
        } else if in_services(&self.medium_services) || mentions(&self.medium_keywords) {
            (Severity::Medium, IncidentKind::Construction)
        } else {
            (Severity::Low, IncidentKind::Warning)
        }
    }
}

fn coordinate(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn text_lines(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(text)) => vec![text.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => text.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Parses an Autobahn-style service payload: `{ "<service>": [ {...}, ... ] }`.
/// Entries without a usable coordinate are skipped; a missing list is a shape
/// error.
pub fn parse_service_payload(service: &str, body: &str) -> Result<Vec<RawIncident>, FeedError> {
    let root: Value = serde_json::from_str(body).map_err(|err| FeedError::Shape(err.to_string()))?;
    let items = root
        .get(service)
        .and_then(Value::as_array)
        .ok_or_else(|| FeedError::Shape(format!("payload has no '{service}' list")))?;

    let mut incidents = Vec::with_capacity(items.len());
    for item in items {
        let coord = item.get("coordinate");
        let lat = coordinate(coord.and_then(|c| c.get("lat")));
        let lon = coordinate(coord.and_then(|c| c.get("long").or_else(|| c.get("lon"))));
        let (Some(lat), Some(lon)) = (lat, lon) else {
            continue;
        };
        let position = GeoPoint::new(lat, lon);
        if !position.is_valid() {
            continue;
        }
        incidents.push(RawIncident {
            identifier: item
                .get("identifier")
                .and_then(Value::as_str)
                .filter(|id| !id.trim().is_empty())
                .map(str::to_string),
            title: item
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
            description: text_lines(item.get("description")),
            position,
            start_timestamp: item
                .get("startTimestamp")
                .and_then(Value::as_str)
                .map(str::to_string),
            blocked: truthy(item.get("isBlocked")),
        });
    }
    Ok(incidents)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|stamp| stamp.with_timezone(&Utc))
        .ok()
}

/// Source of raw incidents for one corridor and service.
pub trait IncidentSource {
    fn fetch(&mut self, corridor: &Corridor, service: &str) -> Result<Vec<RawIncident>, FeedError>;
}

/// `{base_url}/{corridor}/services/{service}` over one shared HTTP client.
pub struct AutobahnSource {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl AutobahnSource {
    pub fn new(config: &IncidentConfig) -> Result<Self, FeedError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_secs))
            .build()
            .map_err(|err| FeedError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl IncidentSource for AutobahnSource {
    fn fetch(&mut self, corridor: &Corridor, service: &str) -> Result<Vec<RawIncident>, FeedError> {
        let url = format!("{}/{}/services/{}", self.base_url, corridor, service);
        let response = self.client.get(&url).send().map_err(FeedError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        let body = response.text().map_err(FeedError::from_reqwest)?;
        parse_service_payload(service, &body)
    }
}

/// Keeps one record per corridor within `radius_m`. The higher severity wins;
/// on a tie the earlier record is kept. Survivors stay in discovery order.
pub fn deduplicate(records: Vec<IncidentRecord>, radius_m: f64) -> Vec<IncidentRecord> {
    let mut kept: Vec<IncidentRecord> = Vec::with_capacity(records.len());
    for record in records {
        let duplicate = kept.iter().position(|existing| {
            existing.corridor == record.corridor
                && existing.position.distance_m(&record.position) < radius_m
        });
        match duplicate {
            Some(index) if record.severity > kept[index].severity => kept[index] = record,
            Some(_) => {}
            None => kept.push(record),
        }
    }
    kept
}

pub struct IncidentFeed {
    source: Box<dyn IncidentSource + Send>,
    services: Vec<String>,
    rules: SeverityRules,
    dedup_radius_m: f64,
    failed_requests: u64,
}

impl IncidentFeed {
    pub fn new(
        source: Box<dyn IncidentSource + Send>,
        services: Vec<String>,
        rules: SeverityRules,
        dedup_radius_m: f64,
    ) -> Self {
        Self {
            source,
            services,
            rules,
            dedup_radius_m,
            failed_requests: 0,
        }
    }

    pub fn from_config(config: &IncidentConfig) -> Result<Self, FeedError> {
        let source = AutobahnSource::new(config)?;
        Ok(Self::new(
            Box::new(source),
            config.services.clone(),
            config.severity_rules.clone(),
            config.dedup_radius_m,
        ))
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests
    }

    /// Current incidents on `corridors`. A failed request contributes no
    /// records for that corridor and service and never aborts the cycle.
    pub fn poll(&mut self, corridors: &[Corridor]) -> Vec<IncidentRecord> {
        let mut records = Vec::new();
        for corridor in corridors {
            for service in &self.services {
                let raw = match self.source.fetch(corridor, service) {
                    Ok(raw) => raw,
                    Err(err) => {
                        self.failed_requests += 1;
                        warn!("incident feed {corridor}/{service} failed ({err}); using no records for this cycle");
                        continue;
                    }
                };
                for incident in raw {
                    records.push(self.normalize(corridor, service, incident));
                }
            }
        }
        let found = records.len();
        let records = deduplicate(records, self.dedup_radius_m);
        debug!(
            "incident poll: {found} reports, {} after removing duplicates",
            records.len()
        );
        records
    }

    fn normalize(&self, corridor: &Corridor, service: &str, raw: RawIncident) -> IncidentRecord {
        let (severity, kind) = self.rules.classify(service, &raw);
        let id = raw.identifier.clone().unwrap_or_else(|| {
            format!(
                "{corridor}:{service}:{:.5},{:.5}",
                raw.position.lat, raw.position.lon
            )
        });
        IncidentRecord {
            id,
            corridor: corridor.clone(),
            position: raw.position,
            severity,
            kind,
            reported_at: raw.start_timestamp.as_deref().and_then(parse_timestamp),
            title: raw.title,
        }
    }
}

/// Identity and severity of every active incident.
pub fn fingerprint(records: &[IncidentRecord]) -> BTreeMap<String, Severity> {
    records
        .iter()
        .map(|record| (record.id.clone(), record.severity))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IncidentDelta {
    pub added: usize,
    pub removed: usize,
    pub severity_changed: usize,
}

impl IncidentDelta {
    pub fn between(previous: &[IncidentRecord], current: &[IncidentRecord]) -> Self {
        let before = fingerprint(previous);
        let after = fingerprint(current);
        let mut delta = IncidentDelta::default();
        for (id, severity) in &after {
            match before.get(id) {
                None => delta.added += 1,
                Some(old) if old != severity => delta.severity_changed += 1,
                Some(_) => {}
            }
        }
        delta.removed = before.keys().filter(|id| !after.contains_key(*id)).count();
        delta
    }

    pub fn is_material(&self) -> bool {
        self.added + self.removed + self.severity_changed > 0
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::HashMap;

    use super::*;

    /// Serves fixed raw incidents per (corridor, service); unknown keys are
    /// empty, keys listed in `failing` return a transport error.
    #[derive(Default)]
    pub struct ScriptedIncidents {
        pub responses: HashMap<(String, String), Vec<RawIncident>>,
        pub failing: Vec<(String, String)>,
        pub calls: usize,
    }

    impl ScriptedIncidents {
        pub fn with(mut self, corridor: &str, service: &str, raw: Vec<RawIncident>) -> Self {
            self.responses
                .insert((corridor.to_string(), service.to_string()), raw);
            self
        }

        pub fn failing(mut self, corridor: &str, service: &str) -> Self {
            self.failing.push((corridor.to_string(), service.to_string()));
            self
        }
    }

    impl IncidentSource for ScriptedIncidents {
        fn fetch(
            &mut self,
            corridor: &Corridor,
            service: &str,
        ) -> Result<Vec<RawIncident>, FeedError> {
            self.calls += 1;
            let key = (corridor.to_string(), service.to_string());
            if self.failing.contains(&key) {
                return Err(FeedError::Transport("connection refused".into()));
            }
            Ok(self.responses.get(&key).cloned().unwrap_or_default())
        }
    }

    pub fn raw(title: &str, position: GeoPoint) -> RawIncident {
        RawIncident {
            identifier: None,
            title: title.to_string(),
            description: Vec::new(),
            position,
            start_timestamp: None,
            blocked: false,
        }
    }
}
