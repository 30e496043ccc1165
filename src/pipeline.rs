//! # Run Writer
//!
//! End-to-end processing of submitted runs:
//!
//! 1. Validate every pickup ([`crate::ingest`]); one bad pickup rejects the run.
//! 2. Assign pickups to segments ([`crate::assign`]).
//! 3. Resolve missing curbs per segment ([`crate::curb`]).
//! 4. Snap pickups, compute per-blockface densities and fold them into the stored
//!    statistics ([`crate::stats`]).
//! 5. Commit pickups and statistics as one batch, rebuilding it if another run
//!    updated the same blockfaces first.
//!
//! Runs are independent: [`write_runs`] processes them one after another, and with
//! the `parallel` feature [`write_runs_parallel`] spreads them over the rayon pool.

use crate::assign::assign;
use crate::curb::resolve_curbs;
use crate::error::Result;
use crate::geo_utils::project;
use crate::ingest::{parse_runs_json, validate_run, RawPickup};
use crate::stats::{observe, stage_updates, BlockfaceObservation, ResolvedPoint};
use crate::store::{commit_with_retry, NewPickup, Repository};
use crate::{BlockfaceStatistic, EngineConfig, SegmentId, Side};
use chrono::{DateTime, Utc};
use geo::Point;
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;

/// Summary of one written run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub pickups_written: usize,
    /// Segments the run was assigned to, ascending
    pub segments: Vec<SegmentId>,
    /// Statistics as stored after the commit
    pub statistics: Vec<BlockfaceStatistic>,
    /// Ids of pickups that could not be matched to any segment
    pub discarded: Vec<String>,
    /// Segments whose curbs were guessed from geometry with no submitted curb
    pub curb_fallbacks: Vec<SegmentId>,
    /// Assignment passes performed
    pub passes: usize,
    /// Commit attempts needed
    pub commit_attempts: u32,
}

/// Validate, assign and persist one run.
///
/// Pickups and statistic updates are committed together; on any error nothing
/// from the run is stored. The crate-level example shows a complete call.
///
/// # Arguments
///
/// * `repo` - Repository to read segments from and commit into
/// * `run_id` - Submission key; every pickup's own run id must match it
/// * `raws` - The run's pickups as submitted
/// * `config` - Engine configuration
/// * `now` - Server time used for the clock-skew check
///
/// # Returns
///
/// A [`RunReport`] with the statistics as stored after the commit.
///
/// # Errors
///
/// * [`crate::Error::Validation`] for the first malformed pickup
/// * [`crate::Error::InvalidRun`] when no segment is sufficiently covered
/// * [`crate::Error::ConcurrencyConflict`] when every commit attempt lost a race
pub fn write_run<R: Repository + ?Sized>(
    repo: &R,
    run_id: &str,
    raws: &[RawPickup],
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<RunReport> {
    let pickups = validate_run(run_id, raws, now, &config.ingest)?;
    if pickups.is_empty() {
        info!("[RunWriter] Run {} has no pickups, nothing to write", run_id);
        return Ok(RunReport {
            run_id: run_id.to_string(),
            ..RunReport::default()
        });
    }

    let points: Vec<Point<f64>> = pickups.iter().map(|p| p.point).collect();
    let assignment = assign(repo, &points, &config.assign).inspect_err(|e| {
        warn!("[RunWriter] Run {} could not be assigned: {}", run_id, e);
    })?;

    let mut resolved: Vec<ResolvedPoint> = Vec::with_capacity(pickups.len());
    let mut observations: Vec<BlockfaceObservation> = Vec::new();
    let mut curb_fallbacks = Vec::new();

    for (&segment_id, group) in &assignment.groups {
        let inputs: Vec<(Point<f64>, Option<Side>)> = group
            .members
            .iter()
            .map(|&i| (pickups[i].point, pickups[i].curb))
            .collect();
        let resolution = resolve_curbs(&group.segment, &inputs, &config.curb);
        if resolution.is_fallback() {
            curb_fallbacks.push(segment_id);
        }

        let mut by_side: BTreeMap<Side, Vec<ResolvedPoint>> = BTreeMap::new();
        for (&i, &side) in group.members.iter().zip(&resolution.sides) {
            let projection = project(&group.segment.geometry, &pickups[i].point);
            by_side.entry(side).or_default().push(ResolvedPoint {
                index: i,
                segment_id,
                point: pickups[i].point,
                snapped: projection.snapped,
                linear_reference: projection.linear_reference,
                side,
            });
        }

        observations.extend(observe(&group.segment, &by_side));
        resolved.extend(by_side.into_values().flatten());
    }
    resolved.sort_by_key(|r| r.index);

    let new_pickups: Vec<NewPickup> = resolved
        .iter()
        .map(|r| {
            let source = &pickups[r.index];
            NewPickup {
                external_id: source.id.clone(),
                run_id: run_id.to_string(),
                segment_id: r.segment_id,
                rubbish_type: source.rubbish_type,
                timestamp: source.timestamp,
                geometry: r.point,
                snapped_geometry: r.snapped,
                linear_reference: r.linear_reference,
                curb: r.side,
            }
        })
        .collect();

    let mut commit_attempts = 0;
    let statistics = commit_with_retry(repo, config.max_commit_attempts, |repo, batch| {
        commit_attempts += 1;
        batch.pickups.extend(new_pickups.iter().cloned());
        Ok(stage_updates(repo, &observations, batch))
    })
    .inspect_err(|e| {
        warn!("[RunWriter] Run {} failed to commit: {}", run_id, e);
    })?;

    let report = RunReport {
        run_id: run_id.to_string(),
        pickups_written: new_pickups.len(),
        segments: assignment.groups.keys().copied().collect(),
        statistics,
        discarded: assignment
            .discarded
            .iter()
            .map(|&i| pickups[i].id.clone())
            .collect(),
        curb_fallbacks,
        passes: assignment.passes,
        commit_attempts,
    };

    info!(
        "[RunWriter] Run {}: {} pickups on {} segments, {} blockfaces updated, {} discarded",
        run_id,
        report.pickups_written,
        report.segments.len(),
        report.statistics.len(),
        report.discarded.len()
    );
    Ok(report)
}

/// Write several runs one after another. A failing run does not stop the others.
pub fn write_runs<R: Repository + ?Sized>(
    repo: &R,
    runs: &BTreeMap<String, Vec<RawPickup>>,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Vec<(String, Result<RunReport>)> {
    runs.iter()
        .map(|(run_id, raws)| (run_id.clone(), write_run(repo, run_id, raws, config, now)))
        .collect()
}

/// Parse a `{run_id: [pickup, ...]}` document and write every run in it.
pub fn write_runs_json<R: Repository + ?Sized>(
    repo: &R,
    json: &str,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<Vec<(String, Result<RunReport>)>> {
    let runs = parse_runs_json(json)?;
    Ok(write_runs(repo, &runs, config, now))
}

/// [`write_runs`] on the rayon thread pool.
#[cfg(feature = "parallel")]
pub fn write_runs_parallel<R: Repository + ?Sized>(
    repo: &R,
    runs: &BTreeMap<String, Vec<RawPickup>>,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Vec<(String, Result<RunReport>)> {
    use rayon::prelude::*;

    runs.par_iter()
        .map(|(run_id, raws)| (run_id.clone(), write_run(repo, run_id, raws, config, now)))
        .collect()
}
