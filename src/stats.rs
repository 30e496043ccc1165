//! # Blockface Statistics
//!
//! Per-run rubbish density on each side of a street, folded into a running mean.
//!
//! For one run and one blockface with `n` pickups spanning linear references
//! `[lr_min, lr_max]`:
//!
//! ```text
//! coverage  = lr_max - lr_min
//! inferred  = n / coverage          // pickups the whole blockface would have yielded
//! density   = inferred / length_m   // pickups per meter
//! ```
//!
//! A new blockface starts at `num_runs = 1`; later runs update
//! `density = (density * num_runs + new) / (num_runs + 1)`.

use crate::error::Result;
use crate::store::{commit_with_retry, Repository, StatisticWrite, WriteBatch};
use crate::{Blockface, BlockfaceStatistic, Segment, SegmentId, Side};
use geo::Point;
use log::{debug, info};
use std::collections::BTreeMap;

/// A pickup with its segment, projection and final curb side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPoint {
    /// Position within the submitted run
    pub index: usize,
    pub segment_id: SegmentId,
    pub point: Point<f64>,
    pub snapped: Point<f64>,
    pub linear_reference: f64,
    pub side: Side,
}

/// One run's contribution to a blockface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockfaceObservation {
    pub blockface: Blockface,
    pub density: f64,
    pub pickups: usize,
}

/// Density observed by one run on one blockface, or `None` when the pickups span
/// no length of the segment (a single pickup, or all at one spot).
pub fn observed_density(segment: &Segment, linear_references: &[f64]) -> Option<f64> {
    if linear_references.len() < 2 || segment.length_meters <= 0.0 {
        return None;
    }
    let (min, max) = linear_references
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &lr| {
            (lo.min(lr), hi.max(lr))
        });
    let coverage = max - min;
    if coverage <= 0.0 {
        return None;
    }

    let inferred = linear_references.len() as f64 / coverage;
    Some(inferred / segment.length_meters)
}

/// Fold a run's density into the prior statistic, if any.
pub fn merge(
    prior: Option<&BlockfaceStatistic>,
    blockface: Blockface,
    density: f64,
) -> BlockfaceStatistic {
    match prior {
        None => BlockfaceStatistic {
            segment_id: blockface.segment_id,
            density,
            num_runs: 1,
            curb: blockface.side,
        },
        Some(prior) => {
            let n = f64::from(prior.num_runs);
            BlockfaceStatistic {
                density: (prior.density * n + density) / (n + 1.0),
                num_runs: prior.num_runs + 1,
                ..*prior
            }
        }
    }
}

/// Observations for every side of `segment` the run touched.
///
/// Sides whose pickups span no length are skipped.
pub fn observe(segment: &Segment, curb_groups: &BTreeMap<Side, Vec<ResolvedPoint>>) -> Vec<BlockfaceObservation> {
    curb_groups
        .iter()
        .filter_map(|(&side, points)| {
            let lrs: Vec<f64> = points.iter().map(|p| p.linear_reference).collect();
            match observed_density(segment, &lrs) {
                Some(density) => Some(BlockfaceObservation {
                    blockface: Blockface::new(segment.id, side),
                    density,
                    pickups: points.len(),
                }),
                None => {
                    debug!(
                        "[BlockfaceStats] Segment {} {}: {} pickups span no length, skipping",
                        segment.id,
                        side,
                        points.len()
                    );
                    None
                }
            }
        })
        .collect()
}

/// Read the current statistics and stage their updated values into `batch`.
///
/// Each write carries the version it was read at, so a concurrent update makes the
/// commit fail instead of silently losing a run.
pub fn stage_updates<R: Repository + ?Sized>(
    repo: &R,
    observations: &[BlockfaceObservation],
    batch: &mut WriteBatch,
) -> Vec<BlockfaceStatistic> {
    observations
        .iter()
        .map(|obs| {
            let prior = repo.statistic(obs.blockface);
            let updated = merge(
                prior.as_ref().map(|p| &p.statistic),
                obs.blockface,
                obs.density,
            );
            batch.statistics.push(StatisticWrite {
                statistic: updated,
                expected_version: prior.map(|p| p.version),
            });
            updated
        })
        .collect()
}

/// Update one segment's statistics from a run's curb groups in its own transaction.
pub fn update_statistics<R: Repository + ?Sized>(
    repo: &R,
    segment: &Segment,
    curb_groups: &BTreeMap<Side, Vec<ResolvedPoint>>,
    max_attempts: u32,
) -> Result<Vec<BlockfaceStatistic>> {
    let observations = observe(segment, curb_groups);
    if observations.is_empty() {
        return Ok(Vec::new());
    }

    let updated = commit_with_retry(repo, max_attempts, |repo, batch| {
        Ok(stage_updates(repo, &observations, batch))
    })?;
    info!(
        "[BlockfaceStats] Updated {} blockfaces on segment {}",
        updated.len(),
        segment.id
    );
    Ok(updated)
}
