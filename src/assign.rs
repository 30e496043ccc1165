//! # Pickup Assignment
//!
//! Matches every pickup of a run to a street segment.
//!
//! Snapping each point to its nearest street fails at intersections: a pickup a
//! metre past a corner lands on the cross street, leaving a one-point group that
//! says nothing about that street. Assignment therefore iterates:
//!
//! 1. Match each unresolved point to its `k`-th nearest segment (`k` starts at 0).
//! 2. Merge matches into per-segment groups and recompute each group's coverage:
//!    the spread between its smallest and largest linear reference.
//! 3. Groups below the coverage threshold are dissolved; their points become
//!    unresolved again. Groups at or above it are kept for the rest of the run.
//! 4. Increase `k` and repeat until no points are unresolved.
//!
//! Each pass only moves points away from segments they could not cover, so the loop
//! ends after at most `max_rank` passes.

use crate::error::{Error, Result};
use crate::geo_utils::linear_reference;
use crate::store::Repository;
use crate::{Segment, SegmentId};
use geo::Point;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Slack for floating-point error in projected linear references.
pub const COVERAGE_TOLERANCE: f64 = 1e-9;

/// Assignment knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssignConfig {
    /// Minimum share of a segment a group must span to be kept. Coverage within
    /// [`COVERAGE_TOLERANCE`] below the threshold still counts as reaching it.
    /// Default: 0.5
    pub coverage_threshold: f64,

    /// Highest nearest-neighbor rank tried before unresolved points are dropped.
    /// Default: 100
    pub max_rank: usize,

    /// Candidates farther than this (degrees) are accepted with a warning.
    /// Default: 0.0009
    pub questionable_distance: f64,

    /// Candidates farther than this (degrees) are rejected and the point dropped.
    /// Default: 0.001
    pub reject_distance: f64,

    /// Apply the two distance bands above.
    /// Default: true
    pub check_distance: bool,
}

impl Default for AssignConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: 0.5,
            max_rank: crate::store::MAX_SEGMENT_RANK,
            questionable_distance: 0.0009,
            reject_distance: 0.001,
            check_distance: true,
        }
    }
}

/// Points matched to one segment.
#[derive(Debug, Clone)]
pub struct SegmentGroup {
    pub segment: Arc<Segment>,
    /// Indices into the input points
    pub members: Vec<usize>,
    pub min_linear_reference: f64,
    pub max_linear_reference: f64,
}

impl SegmentGroup {
    fn new(segment: Arc<Segment>, lr: f64) -> Self {
        Self {
            segment,
            members: Vec::new(),
            min_linear_reference: lr,
            max_linear_reference: lr,
        }
    }

    fn push(&mut self, index: usize, lr: f64) {
        self.members.push(index);
        self.min_linear_reference = self.min_linear_reference.min(lr);
        self.max_linear_reference = self.max_linear_reference.max(lr);
    }

    /// Share of the segment spanned by the group's points, in `[0, 1]`.
    pub fn coverage(&self) -> f64 {
        self.max_linear_reference - self.min_linear_reference
    }

    fn reaches(&self, threshold: f64) -> bool {
        self.coverage() >= threshold - COVERAGE_TOLERANCE
    }
}

/// Result of assigning a run.
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    /// Accepted groups keyed by segment id
    pub groups: BTreeMap<SegmentId, SegmentGroup>,
    /// Indices of points that could not be placed
    pub discarded: Vec<usize>,
    /// Number of passes performed
    pub passes: usize,
}

enum DistanceBand {
    Accepted,
    Questionable,
    TooFar,
}

impl AssignConfig {
    fn band(&self, distance: f64) -> DistanceBand {
        if !self.check_distance {
            DistanceBand::Accepted
        } else if distance > self.reject_distance {
            DistanceBand::TooFar
        } else if distance > self.questionable_distance {
            DistanceBand::Questionable
        } else {
            DistanceBand::Accepted
        }
    }
}

/// Assign a run's `points` to street segments. See the module docs for the algorithm.
///
/// # Arguments
///
/// * `repo` - Repository holding the current street segments
/// * `points` - Every pickup location of one run, in submission order
/// * `config` - Coverage threshold, rank limit and distance bands
///
/// # Returns
///
/// The accepted segment groups (members are indices into `points`), the indices of
/// points that were dropped, and the number of passes taken.
///
/// # Errors
///
/// [`Error::InvalidRun`] when the first pass leaves no segment at or above the
/// coverage threshold; [`Error::NotFound`] when the repository has no segments.
///
/// # Example
///
/// ```rust
/// use geo::point;
/// use rubbish_geo::assign::{assign, AssignConfig};
/// use rubbish_geo::zones::{update_zone, SegmentRecord, ZoneImport};
/// use rubbish_geo::MemoryStore;
///
/// let store = MemoryStore::new();
/// update_zone(&store, ZoneImport {
///     source_name: "Polk Street, San Francisco".to_string(),
///     name: None,
///     segments: vec![
///         SegmentRecord::from_wkt("Polk St", "LINESTRING(-122.4200 37.7900, -122.4200 37.7910)").unwrap(),
///     ],
/// }).unwrap();
///
/// let points = [point!(x: -122.42001, y: 37.7901), point!(x: -122.42001, y: 37.7909)];
/// let assignment = assign(&store, &points, &AssignConfig::default()).unwrap();
/// assert_eq!(assignment.groups.len(), 1);
/// assert_eq!(assignment.passes, 1);
/// ```
pub fn assign<R: Repository + ?Sized>(
    repo: &R,
    points: &[Point<f64>],
    config: &AssignConfig,
) -> Result<Assignment> {
    let mut assignment = Assignment::default();
    let mut unresolved: Vec<usize> = (0..points.len()).collect();
    let mut rank = 0;

    while !unresolved.is_empty() {
        if rank > config.max_rank {
            warn!(
                "[PickupAssigner] {} points still unresolved after rank {}, dropping them",
                unresolved.len(),
                config.max_rank
            );
            assignment.discarded.append(&mut unresolved);
            break;
        }

        for idx in std::mem::take(&mut unresolved) {
            let point = &points[idx];
            let candidate = match repo.nearest_segment(point, rank) {
                Ok(candidate) => candidate,
                Err(Error::NotFound(reason)) if rank > 0 => {
                    warn!(
                        "[PickupAssigner] No segment at rank {} for point {} ({}), dropping it",
                        rank, idx, reason
                    );
                    assignment.discarded.push(idx);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match config.band(candidate.distance) {
                DistanceBand::TooFar => {
                    warn!(
                        "[PickupAssigner] Point {} is {:.6} from segment {} (rank {}), too far to match, dropping it",
                        idx, candidate.distance, candidate.segment.id, rank
                    );
                    assignment.discarded.push(idx);
                    continue;
                }
                DistanceBand::Questionable => warn!(
                    "[PickupAssigner] Point {} is {:.6} from segment {} (rank {}), match is questionable",
                    idx, candidate.distance, candidate.segment.id, rank
                ),
                DistanceBand::Accepted => {}
            }

            let lr = linear_reference(&candidate.segment.geometry, point);
            assignment
                .groups
                .entry(candidate.segment.id)
                .or_insert_with(|| SegmentGroup::new(Arc::clone(&candidate.segment), lr))
                .push(idx, lr);
        }

        let rejected: Vec<SegmentId> = assignment
            .groups
            .iter()
            .filter(|(_, g)| !g.reaches(config.coverage_threshold))
            .map(|(id, _)| *id)
            .collect();
        for id in &rejected {
            if let Some(group) = assignment.groups.remove(id) {
                unresolved.extend(group.members);
            }
        }
        unresolved.sort_unstable();

        assignment.passes += 1;
        debug!(
            "[PickupAssigner] Pass {} (rank {}): {} groups kept, {} dissolved, {} points unresolved",
            assignment.passes,
            rank,
            assignment.groups.len(),
            rejected.len(),
            unresolved.len()
        );

        if rank == 0 && assignment.groups.is_empty() {
            return Err(Error::InvalidRun(
                "run must cover at least one street segment".to_string(),
            ));
        }

        rank += 1;
    }

    assignment.discarded.sort_unstable();
    Ok(assignment)
}
