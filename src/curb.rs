//! # Curb Inference
//!
//! Fills in missing curb sides for the pickups matched to one segment.
//!
//! | Situation | Policy |
//! |-----------|--------|
//! | Every pickup has a curb | Kept as submitted |
//! | Fewer than `min_test_points` pickups, one has a curb | That curb for all |
//! | Fewer than `min_test_points` pickups, none has a curb | Geometric side of the first pickup for all (flagged) |
//! | Distances from the centerline look normal | Majority geometric side for all |
//! | Distances look multi-modal | Submitted curb, else the pickup's own geometric side |
//!
//! The normality check runs on unsigned perpendicular distances. One tight band of
//! distances suggests the runner worked a single side of the street; a spread-out or
//! clustered distribution suggests both sides were covered.

use crate::geo_utils::{planar_distance, side_of};
use crate::normality::{shapiro_wilk, NormalityError};
use crate::{Segment, Side};
use geo::Point;
use log::{debug, warn};
use serde::Deserialize;

/// Curb inference knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CurbConfig {
    /// Smallest group the normality test is run on.
    /// Default: 3
    pub min_test_points: usize,

    /// p-values above this are treated as "one side of the street".
    /// Default: 0.05
    pub normality_alpha: f64,

    /// Half-width of the tangent used for side-of-line tests, as a fraction of
    /// segment length.
    /// Default: 0.01
    pub tangent_offset: f64,
}

impl Default for CurbConfig {
    fn default() -> Self {
        Self {
            min_test_points: 3,
            normality_alpha: 0.05,
            tangent_offset: 0.01,
        }
    }
}

/// Which rule produced a group's sides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CurbPolicy {
    /// Every pickup already carried a curb
    Submitted,
    /// Small group; the first submitted curb was applied to all
    FirstSubmitted(Side),
    /// Small group with no submitted curb; geometry of the first pickup decided
    GeometricFallback(Side),
    /// Distances look unimodal; everyone gets the majority side
    SingleSide { side: Side, p_value: f64 },
    /// Distances look multi-modal; each pickup keeps or infers its own side
    BothSides { p_value: f64 },
}

/// Resolved sides, aligned with the input order.
#[derive(Debug, Clone, PartialEq)]
pub struct CurbResolution {
    pub sides: Vec<Side>,
    pub policy: CurbPolicy,
}

impl CurbResolution {
    /// True when no submitted curb backed the result.
    pub fn is_fallback(&self) -> bool {
        matches!(self.policy, CurbPolicy::GeometricFallback(_))
    }
}

/// Resolve a side for every `(point, submitted curb)` matched to `segment`.
///
/// # Arguments
///
/// * `segment` - The street the points were assigned to
/// * `points` - Each pickup location with its submitted curb, if any
/// * `config` - Group size and significance level for the normality test
///
/// # Returns
///
/// One side per input point, in input order, and the policy that chose them.
///
/// # Example
///
/// ```rust
/// use geo::{line_string, point};
/// use rubbish_geo::curb::{resolve_curbs, CurbConfig, CurbPolicy};
/// use rubbish_geo::{Segment, Side};
///
/// let segment = Segment {
///     id: 1,
///     zone_id: 1,
///     name: "Polk St".to_string(),
///     geometry: line_string![(x: -122.42, y: 37.790), (x: -122.42, y: 37.791)],
///     length_meters: 111.0,
///     first_generation: 0,
///     last_generation: None,
/// };
///
/// // Three unlabeled pickups in a tight band west of a northbound street
/// let points = [
///     (point!(x: -122.42009, y: 37.7902), None),
///     (point!(x: -122.42010, y: 37.7905), None),
///     (point!(x: -122.42011, y: 37.7908), None),
/// ];
/// let resolution = resolve_curbs(&segment, &points, &CurbConfig::default());
/// assert_eq!(resolution.sides, vec![Side::Left; 3]);
/// assert!(matches!(resolution.policy, CurbPolicy::SingleSide { side: Side::Left, .. }));
/// ```
pub fn resolve_curbs(
    segment: &Segment,
    points: &[(Point<f64>, Option<Side>)],
    config: &CurbConfig,
) -> CurbResolution {
    if points.iter().all(|(_, curb)| curb.is_some()) {
        return CurbResolution {
            sides: points.iter().filter_map(|(_, curb)| *curb).collect(),
            policy: CurbPolicy::Submitted,
        };
    }

    let geometric = |p: &Point<f64>| side_of(p, &segment.geometry, config.tangent_offset);

    if points.len() < config.min_test_points.max(3) {
        let (side, policy) = match points.iter().find_map(|(_, curb)| *curb) {
            Some(side) => (side, CurbPolicy::FirstSubmitted(side)),
            None => {
                let side = geometric(&points[0].0);
                warn!(
                    "[CurbInference] Segment {} has {} pickups and no submitted curb, using geometric side {}",
                    segment.id,
                    points.len(),
                    side
                );
                (side, CurbPolicy::GeometricFallback(side))
            }
        };
        return CurbResolution {
            sides: vec![side; points.len()],
            policy,
        };
    }

    let geometric_sides: Vec<Side> = points.iter().map(|(p, _)| geometric(p)).collect();
    let distances: Vec<f64> = points
        .iter()
        .map(|(p, _)| planar_distance(p, &segment.geometry))
        .collect();

    let p_value = match shapiro_wilk(&distances) {
        Ok(result) => result.p_value,
        // Identical distances are a single band
        Err(NormalityError::ZeroRange) => 1.0,
        Err(e) => {
            warn!(
                "[CurbInference] Normality test failed on segment {}: {}",
                segment.id, e
            );
            0.0
        }
    };

    if p_value > config.normality_alpha {
        let side = majority_side(&geometric_sides);
        debug!(
            "[CurbInference] Segment {}: p={:.4}, assigning all {} pickups to {}",
            segment.id,
            p_value,
            points.len(),
            side
        );
        CurbResolution {
            sides: vec![side; points.len()],
            policy: CurbPolicy::SingleSide { side, p_value },
        }
    } else {
        debug!(
            "[CurbInference] Segment {}: p={:.4}, resolving pickups individually",
            segment.id, p_value
        );
        CurbResolution {
            sides: points
                .iter()
                .zip(&geometric_sides)
                .map(|((_, curb), geo_side)| curb.unwrap_or(*geo_side))
                .collect(),
            policy: CurbPolicy::BothSides { p_value },
        }
    }
}

/// Most common side; ties go to `Left`.
fn majority_side(sides: &[Side]) -> Side {
    let left = sides.iter().filter(|s| **s == Side::Left).count();
    let right = sides.iter().filter(|s| **s == Side::Right).count();
    if right > left {
        Side::Right
    } else {
        Side::Left
    }
}
