//! Raw pickup parsing and validation.
//!
//! Runs arrive as a JSON object keyed by run id, each value an array of pickups:
//!
//! ```json
//! {
//!   "run-42": [
//!     {"id": "p1", "run_id": "run-42", "type": "tobacco", "timestamp": 1700000000,
//!      "curb": "left", "geometry": "POINT(-122.42 37.79)"}
//!   ]
//! }
//! ```
//!
//! Unknown fields are ignored. Validation is all-or-nothing per run: the first bad
//! pickup rejects the whole run with [`Error::Validation`].

use crate::error::{Error, PickupError, Result};
use crate::{RubbishType, Side};
use chrono::{DateTime, NaiveDateTime, Utc};
use geo::{Geometry, Point};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use wkt::TryFromWkt;

/// Validation knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// How far ahead of the server clock a pickup timestamp may be, in seconds.
    /// Default: 300
    pub max_clock_skew_secs: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 300,
        }
    }
}

/// Timestamp as sent by clients: epoch seconds or a date-time string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Seconds(i64),
    FractionalSeconds(f64),
    Text(String),
}

/// One pickup exactly as submitted.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct RawPickup {
    #[serde(default, alias = "firebase_id", deserialize_with = "text_or_number")]
    pub id: Option<String>,
    #[serde(default, alias = "firebase_run_id", deserialize_with = "text_or_number")]
    pub run_id: Option<String>,
    #[serde(default, rename = "type")]
    pub rubbish_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<RawTimestamp>,
    #[serde(default)]
    pub curb: Option<String>,
    /// `POINT` WKT
    #[serde(default)]
    pub geometry: Option<String>,
}

impl RawPickup {
    pub fn new(
        id: impl Into<String>,
        run_id: impl Into<String>,
        rubbish_type: impl Into<String>,
        timestamp: i64,
        curb: Option<&str>,
        geometry: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            run_id: Some(run_id.into()),
            rubbish_type: Some(rubbish_type.into()),
            timestamp: Some(RawTimestamp::Seconds(timestamp)),
            curb: curb.map(str::to_string),
            geometry: Some(geometry.into()),
        }
    }
}

fn text_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TextOrNumber {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(Option::<TextOrNumber>::deserialize(deserializer)?.map(|v| match v {
        TextOrNumber::Text(s) => s,
        TextOrNumber::Integer(n) => n.to_string(),
        TextOrNumber::Float(f) => f.to_string(),
    }))
}

/// A pickup that passed validation, not yet matched to a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPickup {
    /// Position within the submitted run
    pub index: usize,
    pub id: String,
    pub run_id: String,
    pub rubbish_type: RubbishType,
    pub timestamp: DateTime<Utc>,
    pub point: Point<f64>,
    /// Curb as reported by the client, if any
    pub curb: Option<Side>,
}

/// Parse a `{run_id: [pickup, ...]}` document.
pub fn parse_runs_json(json: &str) -> Result<BTreeMap<String, Vec<RawPickup>>> {
    Ok(serde_json::from_str(json)?)
}

/// Validate every pickup of a run, failing on the first invalid one.
pub fn validate_run(
    run_id: &str,
    raws: &[RawPickup],
    now: DateTime<Utc>,
    config: &IngestConfig,
) -> Result<Vec<ValidatedPickup>> {
    raws.iter()
        .enumerate()
        .map(|(index, raw)| {
            validate_pickup(index, raw, run_id, now, config).map_err(|source| Error::Validation {
                index,
                pickup_id: raw.id.clone().unwrap_or_else(|| "<missing id>".to_string()),
                source,
            })
        })
        .collect()
}

/// Validate one pickup submitted under `run_id`.
pub fn validate_pickup(
    index: usize,
    raw: &RawPickup,
    run_id: &str,
    now: DateTime<Utc>,
    config: &IngestConfig,
) -> std::result::Result<ValidatedPickup, PickupError> {
    let id = raw.id.clone().ok_or(PickupError::MissingField("id"))?;
    let found_run = raw.run_id.as_deref().ok_or(PickupError::MissingField("run_id"))?;
    if found_run != run_id {
        return Err(PickupError::RunMismatch {
            expected: run_id.to_string(),
            found: found_run.to_string(),
        });
    }

    let type_text = raw
        .rubbish_type
        .as_deref()
        .ok_or(PickupError::MissingField("type"))?;
    let rubbish_type = RubbishType::parse(type_text)
        .ok_or_else(|| PickupError::InvalidType(type_text.to_string()))?;

    let timestamp = parse_timestamp(
        raw.timestamp
            .as_ref()
            .ok_or(PickupError::MissingField("timestamp"))?,
    )?;
    if timestamp > now + chrono::Duration::seconds(config.max_clock_skew_secs) {
        return Err(PickupError::FutureTimestamp(timestamp.to_rfc3339()));
    }

    let curb = match raw.curb.as_deref() {
        None => None,
        Some(text) => {
            Some(Side::parse(text).ok_or_else(|| PickupError::InvalidCurb(text.to_string()))?)
        }
    };

    let point = parse_point(
        raw.geometry
            .as_deref()
            .ok_or(PickupError::MissingField("geometry"))?,
    )?;

    Ok(ValidatedPickup {
        index,
        id,
        run_id: run_id.to_string(),
        rubbish_type,
        timestamp,
        point,
        curb,
    })
}

/// Parse epoch seconds or an RFC 3339 / ISO-like date-time (naive values are UTC).
pub fn parse_timestamp(raw: &RawTimestamp) -> std::result::Result<DateTime<Utc>, PickupError> {
    let unparsable = || PickupError::UnparsableTimestamp(format!("{:?}", raw));

    match raw {
        RawTimestamp::Seconds(secs) => DateTime::from_timestamp(*secs, 0).ok_or_else(unparsable),
        RawTimestamp::FractionalSeconds(secs) => from_fractional(*secs).ok_or_else(unparsable),
        RawTimestamp::Text(text) => {
            let text = text.trim();
            if let Ok(secs) = text.parse::<i64>() {
                return DateTime::from_timestamp(secs, 0).ok_or_else(unparsable);
            }
            if let Ok(secs) = text.parse::<f64>() {
                return from_fractional(secs).ok_or_else(unparsable);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                return Ok(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|naive| naive.and_utc())
                .ok_or_else(unparsable)
        }
    }
}

fn from_fractional(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

fn parse_point(wkt: &str) -> std::result::Result<Point<f64>, PickupError> {
    let geometry = Geometry::<f64>::try_from_wkt_str(wkt)
        .map_err(|e| PickupError::MalformedGeometry(e.to_string()))?;

    let point = match geometry {
        Geometry::Point(p) => p,
        other => return Err(PickupError::WrongGeometryType(geometry_kind(&other))),
    };
    if !point.x().is_finite() || !point.y().is_finite() {
        return Err(PickupError::MalformedGeometry(
            "non-finite coordinate".to_string(),
        ));
    }
    Ok(point)
}

fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "POINT",
        Geometry::Line(_) => "LINE",
        Geometry::LineString(_) => "LINESTRING",
        Geometry::Polygon(_) => "POLYGON",
        Geometry::MultiPoint(_) => "MULTIPOINT",
        Geometry::MultiLineString(_) => "MULTILINESTRING",
        Geometry::MultiPolygon(_) => "MULTIPOLYGON",
        Geometry::GeometryCollection(_) => "GEOMETRYCOLLECTION",
        Geometry::Rect(_) => "RECT",
        Geometry::Triangle(_) => "TRIANGLE",
    }
}
