//! # Rubbish Geo
//!
//! Street-segment assignment and blockface statistics for rubbish pickup runs.
//!
//! This library provides:
//! - Iterative greedy matching of GPS-noisy pickups onto street segments, subject to a
//!   coverage constraint
//! - Side-of-street (curb) inference backed by a Shapiro-Wilk normality test
//! - Running per-blockface rubbish density statistics, updated atomically per run
//! - Read-side queries by radius, sector, nearest coordinate and run id
//!
//! ## Features
//!
//! - **`parallel`** - Process independent runs on the rayon thread pool
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::Utc;
//! use rubbish_geo::{
//!     EngineConfig, MemoryStore, RawPickup, query,
//!     pipeline::write_run,
//!     zones::{update_zone, SegmentRecord, ZoneImport},
//! };
//!
//! let store = MemoryStore::new();
//! update_zone(&store, ZoneImport {
//!     source_name: "Polk Street, San Francisco".to_string(),
//!     name: None,
//!     segments: vec![
//!         SegmentRecord::from_wkt("Polk St", "LINESTRING(-122.4200 37.7900, -122.4200 37.7910)").unwrap(),
//!     ],
//! }).unwrap();
//!
//! let now = Utc::now();
//! let pickups: Vec<RawPickup> = [37.7901, 37.7909]
//!     .iter()
//!     .enumerate()
//!     .map(|(i, lat)| RawPickup::new(
//!         format!("pickup-{i}"),
//!         "run-1",
//!         "plastic",
//!         now.timestamp() - 60,
//!         Some("left"),
//!         format!("POINT(-122.42001 {lat})"),
//!     ))
//!     .collect();
//!
//! let report = write_run(&store, "run-1", &pickups, &EngineConfig::default(), now).unwrap();
//! assert_eq!(report.pickups_written, 2);
//!
//! let results = query::run_get(&store, "run-1").unwrap();
//! assert!(results[0].statistics.left.is_some());
//! assert!(results[0].statistics.right.is_none());
//! ```

use chrono::{DateTime, Utc};
use geo::{LineString, MultiPolygon, Point, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod error;
pub use error::{Error, PickupError, Result};

// Geometric primitives (projection, side-of-line, lengths)
pub mod geo_utils;

// Segment repository and storage
pub mod store;
pub use store::{MemoryStore, Repository, SegmentMatch, WriteBatch};

pub mod zones;

pub mod ingest;
pub use ingest::{IngestConfig, RawPickup, ValidatedPickup};

pub mod assign;
pub use assign::{AssignConfig, Assignment, SegmentGroup};

pub mod normality;

pub mod curb;
pub use curb::{CurbConfig, CurbPolicy, CurbResolution};

pub mod stats;

pub mod query;
pub use query::{CoordinateMode, QueryConfig, QueryOptions, SegmentStatistics};

pub mod pipeline;
pub use pipeline::RunReport;

#[cfg(test)]
pub(crate) mod test_support;

// ============================================================================
// Core Types
// ============================================================================

pub type ZoneId = u32;
pub type SegmentId = u64;
pub type PickupId = u64;

/// Side of the street relative to the canonical segment direction
/// (south-to-north, west-to-east on ties).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
    Middle,
}

impl Side {
    pub const ALL: [Side; 3] = [Side::Left, Side::Right, Side::Middle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
            Side::Middle => "middle",
        }
    }

    /// Parse a caller-supplied curb value. Case-sensitive, like the wire format.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "left" => Some(Side::Left),
            "right" => Some(Side::Right),
            "middle" => Some(Side::Middle),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of rubbish categories a pickup can be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RubbishType {
    Tobacco,
    Paper,
    Plastic,
    Other,
    Food,
    Glass,
}

impl RubbishType {
    pub const ALL: [RubbishType; 6] = [
        RubbishType::Tobacco,
        RubbishType::Paper,
        RubbishType::Plastic,
        RubbishType::Other,
        RubbishType::Food,
        RubbishType::Glass,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RubbishType::Tobacco => "tobacco",
            RubbishType::Paper => "paper",
            RubbishType::Plastic => "plastic",
            RubbishType::Other => "other",
            RubbishType::Food => "food",
            RubbishType::Glass => "glass",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for RubbishType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named geographic region imported as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub id: ZoneId,
    /// Display name
    pub name: String,
    /// Name the street network was imported under (unique per zone)
    pub source_name: String,
    /// Bounding box of the zone's most recent segment set
    pub bounding_box: Option<Rect<f64>>,
}

/// One versioned snapshot of a zone's segment set.
///
/// Exactly one generation per zone is open (`closed_at == None`) at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneGeneration {
    pub zone_id: ZoneId,
    pub generation: u32,
    pub closed_at: Option<DateTime<Utc>>,
}

/// An immutable directed street centerline.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: SegmentId,
    pub zone_id: ZoneId,
    pub name: String,
    pub geometry: LineString<f64>,
    /// Haversine length in meters
    pub length_meters: f64,
    /// First zone generation this segment is valid in
    pub first_generation: u32,
    /// Last zone generation this segment is valid in; `None` while current
    pub last_generation: Option<u32>,
}

impl Segment {
    pub fn is_current(&self) -> bool {
        self.last_generation.is_none()
    }
}

/// A named polygonal area registered for sector queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Sector {
    pub id: u32,
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}

/// A persisted, fully-resolved pickup. Pickups are insert-only.
#[derive(Debug, Clone, PartialEq)]
pub struct Pickup {
    pub id: PickupId,
    /// Identifier assigned by the upstream system
    pub external_id: String,
    pub run_id: String,
    pub segment_id: SegmentId,
    pub rubbish_type: RubbishType,
    pub timestamp: DateTime<Utc>,
    /// Point as reported by the client
    pub geometry: Point<f64>,
    /// Point snapped onto the matched segment
    pub snapped_geometry: Point<f64>,
    /// Normalized position along the segment, in `[0, 1]`
    pub linear_reference: f64,
    pub curb: Side,
}

/// A (segment, side) pair; the unit statistics are aggregated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Blockface {
    pub segment_id: SegmentId,
    pub side: Side,
}

impl Blockface {
    pub fn new(segment_id: SegmentId, side: Side) -> Self {
        Self { segment_id, side }
    }
}

/// Running rubbish density for one blockface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockfaceStatistic {
    pub segment_id: SegmentId,
    /// Inferred pickups per meter, averaged over runs
    pub density: f64,
    pub num_runs: u32,
    pub curb: Side,
}

impl BlockfaceStatistic {
    pub fn blockface(&self) -> Blockface {
        Blockface::new(self.segment_id, self.curb)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level engine configuration.
///
/// Every field has a default; a JSON document only needs the keys it overrides.
///
/// ```
/// use rubbish_geo::EngineConfig;
///
/// let config = EngineConfig::from_json_str(r#"{"assign": {"coverage_threshold": 0.6}}"#).unwrap();
/// assert_eq!(config.assign.coverage_threshold, 0.6);
/// assert_eq!(config.assign.max_rank, 100);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub assign: AssignConfig,
    pub curb: CurbConfig,
    pub ingest: IngestConfig,
    pub query: QueryConfig,

    /// How many times a run's transaction is rebuilt after losing a statistics race.
    /// Default: 10
    pub max_commit_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assign: AssignConfig::default(),
            curb: CurbConfig::default(),
            ingest: IngestConfig::default(),
            query: QueryConfig::default(),
            max_commit_attempts: 10,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
