//! # Queries
//!
//! Read-side lookups returning segments with their blockface statistics.
//!
//! | Function | Selects |
//! |----------|---------|
//! | [`radial_get`] | Current segments within a planar distance of a point |
//! | [`sector_get`] | Current segments inside a named sector |
//! | [`coord_get`] | The nearest current segment to a point |
//! | [`run_get`] | Segments a run's pickups were assigned to |
//!
//! Results serialize to camelCase JSON:
//!
//! ```json
//! {"segment": {"id": 3, "geometry": "LINESTRING(0 0,0.001 0)", "lengthMeters": 111.2, "name": "Main St"},
//!  "statistics": {"left": {"segmentId": 3, "density": 0.025, "numRuns": 1, "curb": "left"},
//!                 "right": null, "middle": null}}
//! ```

use crate::error::{Error, Result};
use crate::store::Repository;
use crate::{BlockfaceStatistic, Segment, SegmentId, Side};
use geo::{LineString, Point};
use log::{debug, warn};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use wkt::ToWkt;

/// Query knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Nearest-neighbor ranks tried by [`CoordinateMode::WithStatistics`].
    /// Default: 10
    pub max_coordinate_attempts: usize,

    /// Maximum results returned per radial or sector page.
    /// Default: 1000
    pub page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_coordinate_attempts: 10,
            page_size: 1000,
        }
    }
}

/// Options for radial and sector queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Also return segments with no statistics yet
    pub include_unseen: bool,
    /// Results to skip, for paging
    pub offset: usize,
}

/// How [`coord_get`] treats segments without statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateMode {
    /// Return the nearest segment, statistics or not
    IncludeUnseen,
    /// Return the nearest segment that has statistics
    WithStatistics,
}

/// Segment fields exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSummary {
    pub id: SegmentId,
    #[serde(serialize_with = "serialize_wkt")]
    pub geometry: LineString<f64>,
    pub length_meters: f64,
    pub name: String,
}

impl From<&Segment> for SegmentSummary {
    fn from(segment: &Segment) -> Self {
        Self {
            id: segment.id,
            geometry: segment.geometry.clone(),
            length_meters: segment.length_meters,
            name: segment.name.clone(),
        }
    }
}

fn serialize_wkt<S: Serializer>(geometry: &LineString<f64>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&geometry.wkt_string())
}

/// Statistics for each side of a segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CurbStatistics {
    pub left: Option<BlockfaceStatistic>,
    pub right: Option<BlockfaceStatistic>,
    pub middle: Option<BlockfaceStatistic>,
}

impl CurbStatistics {
    fn from_rows(rows: impl IntoIterator<Item = BlockfaceStatistic>) -> Self {
        let mut out = Self::default();
        for row in rows {
            let slot = match row.curb {
                Side::Left => &mut out.left,
                Side::Right => &mut out.right,
                Side::Middle => &mut out.middle,
            };
            *slot = Some(row);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_none() && self.right.is_none() && self.middle.is_none()
    }

    pub fn get(&self, side: Side) -> Option<&BlockfaceStatistic> {
        match side {
            Side::Left => self.left.as_ref(),
            Side::Right => self.right.as_ref(),
            Side::Middle => self.middle.as_ref(),
        }
    }
}

/// One query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentStatistics {
    pub segment: SegmentSummary,
    pub statistics: CurbStatistics,
}

impl SegmentStatistics {
    fn load<R: Repository + ?Sized>(repo: &R, segment: &Segment) -> Self {
        Self {
            segment: SegmentSummary::from(segment),
            statistics: CurbStatistics::from_rows(repo.statistics_for_segment(segment.id)),
        }
    }
}

/// Serialize results to a JSON array.
pub fn to_json(results: &[SegmentStatistics]) -> Result<String> {
    Ok(serde_json::to_string(results)?)
}

fn page<R: Repository + ?Sized>(
    repo: &R,
    mut segments: Vec<Arc<Segment>>,
    options: QueryOptions,
    config: &QueryConfig,
) -> Vec<SegmentStatistics> {
    segments.sort_by_key(|s| s.id);
    segments
        .iter()
        .map(|s| SegmentStatistics::load(repo, s))
        .filter(|r| options.include_unseen || !r.statistics.is_empty())
        .skip(options.offset)
        .take(config.page_size)
        .collect()
}

/// Current segments within `distance` degrees of `point`, ordered by id.
///
/// A negative or non-finite `distance` returns no segments.
pub fn radial_get<R: Repository + ?Sized>(
    repo: &R,
    point: &Point<f64>,
    distance: f64,
    options: QueryOptions,
    config: &QueryConfig,
) -> Vec<SegmentStatistics> {
    if !distance.is_finite() || distance < 0.0 {
        warn!("[Query] radial: ignoring invalid distance {}", distance);
        return Vec::new();
    }
    let candidates = repo.segments_within(point, distance);
    debug!(
        "[Query] radial: {} segments within {} of ({}, {})",
        candidates.len(),
        distance,
        point.x(),
        point.y()
    );
    page(repo, candidates, options, config)
}

/// Current segments inside the named sector, ordered by id.
pub fn sector_get<R: Repository + ?Sized>(
    repo: &R,
    sector_name: &str,
    options: QueryOptions,
    config: &QueryConfig,
) -> Result<Vec<SegmentStatistics>> {
    let sector = repo
        .sector(sector_name)
        .ok_or_else(|| Error::NotFound(format!("sector `{}`", sector_name)))?;
    let candidates = repo.segments_covered_by(&sector.geometry);
    debug!(
        "[Query] sector `{}`: {} segments covered",
        sector_name,
        candidates.len()
    );
    Ok(page(repo, candidates, options, config))
}

/// The nearest current segment to `point`, with its statistics.
///
/// # Arguments
///
/// * `point` - Query location
/// * `mode` - [`CoordinateMode::IncludeUnseen`] returns the nearest segment even if
///   it has no statistics; [`CoordinateMode::WithStatistics`] walks outward to the
///   first of the nearest `max_coordinate_attempts` segments that has any
///
/// # Errors
///
/// * [`Error::NotFound`] when the repository has no current segments
/// * [`Error::NoDataFound`] when no segment within the attempt budget has statistics
pub fn coord_get<R: Repository + ?Sized>(
    repo: &R,
    point: &Point<f64>,
    mode: CoordinateMode,
    config: &QueryConfig,
) -> Result<SegmentStatistics> {
    match mode {
        CoordinateMode::IncludeUnseen => {
            let nearest = repo.nearest_segment(point, 0)?;
            Ok(SegmentStatistics::load(repo, &nearest.segment))
        }
        CoordinateMode::WithStatistics => {
            for rank in 0..config.max_coordinate_attempts {
                let candidate = match repo.nearest_segment(point, rank) {
                    Ok(candidate) => candidate,
                    Err(Error::NotFound(_)) if rank > 0 => break,
                    Err(e) => return Err(e),
                };
                let result = SegmentStatistics::load(repo, &candidate.segment);
                if !result.statistics.is_empty() {
                    return Ok(result);
                }
            }
            Err(Error::NoDataFound(format!(
                "none of the {} nearest segments to ({}, {}) have statistics",
                config.max_coordinate_attempts,
                point.x(),
                point.y()
            )))
        }
    }
}

/// Statistics for the blockfaces a run touched, grouped by segment and ordered by
/// segment id.
///
/// Only sides the run's pickups were resolved to are included, so a run that
/// walked the left curb never reports the right curb's statistic. Segments where
/// none of the touched sides has a statistic yet (for example a side with a single
/// pickup) are left out.
///
/// # Errors
///
/// [`Error::NoDataFound`] when no pickups were stored for `run_id`.
pub fn run_get<R: Repository + ?Sized>(repo: &R, run_id: &str) -> Result<Vec<SegmentStatistics>> {
    let pickups = repo.pickups_for_run(run_id);
    if pickups.is_empty() {
        return Err(Error::NoDataFound(format!("no pickups for run `{}`", run_id)));
    }

    let mut touched: BTreeMap<SegmentId, BTreeSet<Side>> = BTreeMap::new();
    for pickup in &pickups {
        touched.entry(pickup.segment_id).or_default().insert(pickup.curb);
    }

    let mut results = Vec::with_capacity(touched.len());
    for (segment_id, sides) in touched {
        let segment = repo
            .segment(segment_id)
            .ok_or_else(|| Error::NotFound(format!("segment {}", segment_id)))?;
        let statistics = CurbStatistics::from_rows(
            repo.statistics_for_segment(segment_id)
                .into_iter()
                .filter(|s| sides.contains(&s.curb)),
        );
        if statistics.is_empty() {
            continue;
        }
        results.push(SegmentStatistics {
            segment: SegmentSummary::from(segment.as_ref()),
            statistics,
        });
    }
    Ok(results)
}
