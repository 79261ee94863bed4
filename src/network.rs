//! The fixed road network the run operates on: segment ids, centers, lengths
//! and connectivity. Loaded once at startup; never mutated afterwards.

use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use pathfinding::directed::bfs::bfs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::GeoPoint;

/// Identifier of a network edge, opaque to everything but the network itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SegmentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SegmentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn default_length_m() -> f64 {
    100.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    /// Junction the segment leaves from.
    pub from: String,
    /// Junction the segment leads to.
    pub to: String,
    #[serde(default = "default_length_m")]
    pub length_m: f64,
    pub center: GeoPoint,
}

#[derive(Debug, Deserialize)]
struct NetworkFile {
    #[serde(default)]
    name: Option<String>,
    segments: Vec<Segment>,
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network file {path} not found")]
    Missing { path: PathBuf },
    #[error("failed to read network file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse network description: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("network validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone)]
pub struct Network {
    name: String,
    segments: Vec<Segment>,
    by_id: HashMap<SegmentId, usize>,
    successors: Vec<Vec<usize>>,
}

impl Network {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NetworkError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(NetworkError::Missing {
                path: path.to_path_buf(),
            });
        }
        let text = fs::read_to_string(path).map_err(|source| NetworkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, NetworkError> {
        let file: NetworkFile = serde_yaml::from_str(text)?;
        Self::new(file.name.unwrap_or_else(|| "network".to_string()), file.segments)
    }

    pub fn new(name: impl Into<String>, segments: Vec<Segment>) -> Result<Self, NetworkError> {
        if segments.is_empty() {
            return Err(NetworkError::Validation(
                "network must define at least one segment".into(),
            ));
        }

        let mut by_id = HashMap::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            if !segment.center.is_valid() {
                return Err(NetworkError::Validation(format!(
                    "segment {} has an invalid center",
                    segment.id
                )));
            }
            if segment.length_m < 0.0 || !segment.length_m.is_finite() {
                return Err(NetworkError::Validation(format!(
                    "segment {} has an invalid length",
                    segment.id
                )));
            }
            if by_id.insert(segment.id.clone(), index).is_some() {
                return Err(NetworkError::Validation(format!(
                    "segment id {} defined more than once",
                    segment.id
                )));
            }
        }

        let mut leaving: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, segment) in segments.iter().enumerate() {
            leaving.entry(segment.from.as_str()).or_default().push(index);
        }
        let successors = segments
            .iter()
            .map(|segment| {
                leaving
                    .get(segment.to.as_str())
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();

        Ok(Self {
            name: name.into(),
            segments,
            by_id,
            successors,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn segment(&self, id: &str) -> Option<&Segment> {
        self.by_id.get(id).map(|&index| &self.segments[index])
    }

    pub fn successors(&self, id: &str) -> Vec<&SegmentId> {
        self.by_id
            .get(id)
            .map(|&index| {
                self.successors[index]
                    .iter()
                    .map(|&next| &self.segments[next].id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fewest-segments path from `from` to `to`, both inclusive.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<SegmentId>> {
        let start = *self.by_id.get(from)?;
        let goal = *self.by_id.get(to)?;
        let path = bfs(
            &start,
            |&index| self.successors[index].iter().copied(),
            |&index| index == goal,
        )?;
        Some(
            path.into_iter()
                .map(|index| self.segments[index].id.clone())
                .collect(),
        )
    }
}
