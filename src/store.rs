//! # Segment Repository
//!
//! Storage seam for zones, segments, pickups, sectors and blockface statistics.
//!
//! Every operation in the engine takes a [`Repository`] explicitly, so tests and
//! embedders can supply their own backing store. [`MemoryStore`] is the bundled
//! implementation: an arena of tables behind a `parking_lot::RwLock`, with an
//! R-tree over the current segments for nearest-neighbor and radius lookups.
//!
//! ## Writes
//!
//! A run's pickups and statistic updates travel together in a [`WriteBatch`].
//! [`Repository::commit`] applies the whole batch or nothing. Each statistic write
//! carries the version it was computed from; if any stored version moved in the
//! meantime the commit fails with [`Error::ConcurrencyConflict`] and the caller
//! rebuilds the batch (see [`commit_with_retry`]).

use crate::error::{Error, Result};
use crate::geo_utils::{compute_bounds, covered_by, planar_distance};
use crate::{
    Blockface, BlockfaceStatistic, Pickup, PickupId, RubbishType, Sector, Segment, SegmentId,
    Side, Zone, ZoneGeneration, ZoneId,
};
use chrono::{DateTime, Utc};
use geo::{BoundingRect, LineString, MultiPolygon, Point};
use log::{debug, info, warn};
use parking_lot::RwLock;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use std::collections::HashMap;
use std::sync::Arc;

/// Highest nearest-neighbor rank a repository will answer.
pub const MAX_SEGMENT_RANK: usize = 100;

// ============================================================================
// Repository Seam
// ============================================================================

/// A candidate segment for a point, with its planar distance in degrees.
#[derive(Debug, Clone)]
pub struct SegmentMatch {
    pub segment: Arc<Segment>,
    pub distance: f64,
}

/// A statistic together with the version it was read at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionedStatistic {
    pub statistic: BlockfaceStatistic,
    pub version: u64,
}

/// A pickup ready to be persisted; the repository assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPickup {
    pub external_id: String,
    pub run_id: String,
    pub segment_id: SegmentId,
    pub rubbish_type: RubbishType,
    pub timestamp: DateTime<Utc>,
    pub geometry: Point<f64>,
    pub snapped_geometry: Point<f64>,
    pub linear_reference: f64,
    pub curb: Side,
}

impl NewPickup {
    fn into_pickup(self, id: PickupId) -> Pickup {
        Pickup {
            id,
            external_id: self.external_id,
            run_id: self.run_id,
            segment_id: self.segment_id,
            rubbish_type: self.rubbish_type,
            timestamp: self.timestamp,
            geometry: self.geometry,
            snapped_geometry: self.snapped_geometry,
            linear_reference: self.linear_reference,
            curb: self.curb,
        }
    }
}

/// Upsert of one blockface statistic, guarded by the version it was derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticWrite {
    pub statistic: BlockfaceStatistic,
    /// `None` when the statistic did not exist at read time
    pub expected_version: Option<u64>,
}

/// Everything one run writes, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub pickups: Vec<NewPickup>,
    pub statistics: Vec<StatisticWrite>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.pickups.is_empty() && self.statistics.is_empty()
    }
}

/// A street segment as imported, before the repository assigns it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSegment {
    pub name: String,
    pub geometry: LineString<f64>,
    pub length_meters: f64,
}

/// A complete replacement of a zone's segment set.
#[derive(Debug, Clone)]
pub struct ZoneUpdate {
    pub source_name: String,
    pub name: String,
    pub segments: Vec<NewSegment>,
    /// Timestamp stamped on the generation being closed
    pub closed_at: DateTime<Utc>,
}

/// Listing entry for a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneSummary {
    pub zone: Zone,
    pub generations: Vec<ZoneGeneration>,
    pub current_segments: usize,
    pub total_segments: usize,
}

/// Storage operations the engine needs. Implementations must be safe to share
/// between threads processing different runs.
pub trait Repository: Send + Sync {
    /// The `rank`-th nearest current segment to `point` (0 = nearest).
    ///
    /// Fails with [`Error::NotFound`] when there are no current segments, when
    /// `rank` exceeds [`MAX_SEGMENT_RANK`], or when fewer than `rank + 1` exist.
    fn nearest_segment(&self, point: &Point<f64>, rank: usize) -> Result<SegmentMatch>;

    /// Any segment by id, current or retired.
    fn segment(&self, id: SegmentId) -> Option<Arc<Segment>>;

    /// Current segments within `distance` degrees of `point`. Negative or
    /// non-finite distances match nothing.
    fn segments_within(&self, point: &Point<f64>, distance: f64) -> Vec<Arc<Segment>>;

    /// Current segments lying inside or on the boundary of `area`.
    fn segments_covered_by(&self, area: &MultiPolygon<f64>) -> Vec<Arc<Segment>>;

    fn statistic(&self, blockface: Blockface) -> Option<VersionedStatistic>;

    /// All statistics recorded for a segment, ordered left, right, middle.
    fn statistics_for_segment(&self, id: SegmentId) -> Vec<BlockfaceStatistic>;

    fn pickups_for_run(&self, run_id: &str) -> Vec<Pickup>;

    /// Apply a batch atomically. See the module docs for conflict semantics.
    fn commit(&self, batch: WriteBatch) -> Result<Vec<PickupId>>;

    /// Retire the zone's current segments and install a new generation.
    fn apply_zone_update(&self, update: ZoneUpdate) -> Result<ZoneGeneration>;

    fn zones(&self) -> Vec<ZoneSummary>;

    fn insert_sector(&self, name: &str, geometry: MultiPolygon<f64>) -> Result<Sector>;

    fn delete_sector(&self, name: &str) -> Result<()>;

    fn sector(&self, name: &str) -> Option<Sector>;

    fn sectors(&self) -> Vec<Sector>;

    /// Drop every table.
    fn reset(&self);
}

/// Build and commit a batch, rebuilding it after each concurrency conflict.
///
/// `build` is called once per attempt with an empty batch and must re-read any
/// state it depends on. Non-conflict errors are returned immediately.
pub fn commit_with_retry<R, T, F>(repo: &R, max_attempts: u32, mut build: F) -> Result<T>
where
    R: Repository + ?Sized,
    F: FnMut(&R, &mut WriteBatch) -> Result<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let mut batch = WriteBatch::default();
        let staged = build(repo, &mut batch)?;
        match repo.commit(batch) {
            Ok(_) => return Ok(staged),
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                warn!(
                    "[RunWriter] Commit attempt {}/{} lost a race ({}), retrying",
                    attempt, max_attempts, e
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Spatial Index
// ============================================================================

/// R-tree entry for a current segment.
#[derive(Debug, Clone)]
struct SegmentEntry {
    segment: Arc<Segment>,
    envelope: AABB<[f64; 2]>,
}

impl SegmentEntry {
    fn new(segment: Arc<Segment>) -> Option<Self> {
        let rect = segment.geometry.bounding_rect()?;
        let envelope = AABB::from_corners(
            [rect.min().x, rect.min().y],
            [rect.max().x, rect.max().y],
        );
        Some(Self { segment, envelope })
    }
}

impl RTreeObject for SegmentEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

impl PointDistance for SegmentEntry {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let d = planar_distance(&Point::new(point[0], point[1]), &self.segment.geometry);
        d * d
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct StatisticRow {
    statistic: BlockfaceStatistic,
    version: u64,
}

#[derive(Default)]
struct Tables {
    zones: Vec<Zone>,
    generations: Vec<ZoneGeneration>,
    /// Segment id `n` lives at index `n - 1`
    segments: Vec<Arc<Segment>>,
    pickups: Vec<Pickup>,
    pickups_by_run: HashMap<String, Vec<usize>>,
    statistics: HashMap<Blockface, StatisticRow>,
    sectors: Vec<Sector>,
    next_sector_id: u32,
    index: RTree<SegmentEntry>,
}

impl Tables {
    fn segment(&self, id: SegmentId) -> Option<&Arc<Segment>> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.segments.get(idx)
    }

    fn rebuild_index(&mut self) {
        let entries: Vec<SegmentEntry> = self
            .segments
            .iter()
            .filter(|s| s.is_current())
            .filter_map(|s| SegmentEntry::new(Arc::clone(s)))
            .collect();
        self.index = RTree::bulk_load(entries);
    }
}

/// Thread-safe in-memory [`Repository`].
pub struct MemoryStore {
    tables: RwLock<Tables>,
    max_rank: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_rank(MAX_SEGMENT_RANK)
    }

    /// Store that refuses nearest-neighbor ranks above `max_rank`.
    pub fn with_max_rank(max_rank: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            max_rank,
        }
    }

    /// Number of current segments in the spatial index.
    pub fn current_segment_count(&self) -> usize {
        self.tables.read().index.size()
    }

    pub fn pickup_count(&self) -> usize {
        self.tables.read().pickups.len()
    }
}

impl Repository for MemoryStore {
    fn nearest_segment(&self, point: &Point<f64>, rank: usize) -> Result<SegmentMatch> {
        let tables = self.tables.read();
        let size = tables.index.size();

        if size == 0 {
            return Err(Error::NotFound(
                "no current segments in the repository".to_string(),
            ));
        }
        if rank > self.max_rank {
            return Err(Error::NotFound(format!(
                "rank {} exceeds the maximum rank {}",
                rank, self.max_rank
            )));
        }

        let query = [point.x(), point.y()];
        let entry = tables
            .index
            .nearest_neighbor_iter(&query)
            .nth(rank)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "cannot return rank {} with only {} current segments",
                    rank, size
                ))
            })?;

        Ok(SegmentMatch {
            segment: Arc::clone(&entry.segment),
            distance: entry.distance_2(&query).sqrt(),
        })
    }

    fn segment(&self, id: SegmentId) -> Option<Arc<Segment>> {
        self.tables.read().segment(id).cloned()
    }

    fn segments_within(&self, point: &Point<f64>, distance: f64) -> Vec<Arc<Segment>> {
        if !distance.is_finite() || distance < 0.0 {
            return Vec::new();
        }
        let tables = self.tables.read();
        tables
            .index
            .locate_within_distance([point.x(), point.y()], distance * distance)
            .map(|e| Arc::clone(&e.segment))
            .collect()
    }

    fn segments_covered_by(&self, area: &MultiPolygon<f64>) -> Vec<Arc<Segment>> {
        let Some(rect) = area.bounding_rect() else {
            return Vec::new();
        };
        let bounds = AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);

        let tables = self.tables.read();
        tables
            .index
            .locate_in_envelope(&bounds)
            .filter(|e| covered_by(&e.segment.geometry, area))
            .map(|e| Arc::clone(&e.segment))
            .collect()
    }

    fn statistic(&self, blockface: Blockface) -> Option<VersionedStatistic> {
        self.tables
            .read()
            .statistics
            .get(&blockface)
            .map(|row| VersionedStatistic {
                statistic: row.statistic,
                version: row.version,
            })
    }

    fn statistics_for_segment(&self, id: SegmentId) -> Vec<BlockfaceStatistic> {
        let tables = self.tables.read();
        Side::ALL
            .iter()
            .filter_map(|&side| tables.statistics.get(&Blockface::new(id, side)))
            .map(|row| row.statistic)
            .collect()
    }

    fn pickups_for_run(&self, run_id: &str) -> Vec<Pickup> {
        let tables = self.tables.read();
        tables
            .pickups_by_run
            .get(run_id)
            .map(|idxs| idxs.iter().map(|&i| tables.pickups[i].clone()).collect())
            .unwrap_or_default()
    }

    fn commit(&self, batch: WriteBatch) -> Result<Vec<PickupId>> {
        let mut tables = self.tables.write();

        // Validate everything before touching any table
        for write in &batch.statistics {
            let blockface = write.statistic.blockface();
            let current = tables.statistics.get(&blockface).map(|row| row.version);
            if current != write.expected_version {
                return Err(Error::ConcurrencyConflict {
                    segment_id: blockface.segment_id,
                    side: blockface.side,
                });
            }
        }
        for pickup in &batch.pickups {
            if tables.segment(pickup.segment_id).is_none() {
                return Err(Error::NotFound(format!(
                    "segment {} for pickup {}",
                    pickup.segment_id, pickup.external_id
                )));
            }
        }

        let mut ids = Vec::with_capacity(batch.pickups.len());
        for pickup in batch.pickups {
            let idx = tables.pickups.len();
            let id = idx as PickupId + 1;
            tables
                .pickups_by_run
                .entry(pickup.run_id.clone())
                .or_default()
                .push(idx);
            tables.pickups.push(pickup.into_pickup(id));
            ids.push(id);
        }

        let n_stats = batch.statistics.len();
        for write in batch.statistics {
            let version = write.expected_version.map_or(1, |v| v + 1);
            tables.statistics.insert(
                write.statistic.blockface(),
                StatisticRow {
                    statistic: write.statistic,
                    version,
                },
            );
        }

        debug!(
            "[MemoryStore] Committed {} pickups and {} statistics",
            ids.len(),
            n_stats
        );
        Ok(ids)
    }

    fn apply_zone_update(&self, update: ZoneUpdate) -> Result<ZoneGeneration> {
        let mut tables = self.tables.write();
        let bounding_box = compute_bounds(update.segments.iter().map(|s| &s.geometry));

        let existing = tables
            .zones
            .iter()
            .position(|z| z.source_name == update.source_name);
        let zone_id = match existing {
            Some(idx) => {
                let zone = &mut tables.zones[idx];
                zone.name = update.name.clone();
                zone.bounding_box = bounding_box;
                zone.id
            }
            None => {
                let id = tables.zones.len() as ZoneId + 1;
                tables.zones.push(Zone {
                    id,
                    name: update.name.clone(),
                    source_name: update.source_name.clone(),
                    bounding_box,
                });
                id
            }
        };

        let next_generation = tables
            .generations
            .iter()
            .filter(|g| g.zone_id == zone_id)
            .map(|g| g.generation + 1)
            .max()
            .unwrap_or(0);

        if next_generation > 0 {
            for generation in tables
                .generations
                .iter_mut()
                .filter(|g| g.zone_id == zone_id && g.closed_at.is_none())
            {
                generation.closed_at = Some(update.closed_at);
            }

            let mut retired = 0;
            for segment in tables.segments.iter_mut() {
                if segment.zone_id == zone_id && segment.is_current() {
                    Arc::make_mut(segment).last_generation = Some(next_generation - 1);
                    retired += 1;
                }
            }
            info!(
                "[MemoryStore] Retired {} segments of zone {} at generation {}",
                retired,
                zone_id,
                next_generation - 1
            );
        }

        let n_new = update.segments.len();
        for new in update.segments {
            let id = tables.segments.len() as SegmentId + 1;
            tables.segments.push(Arc::new(Segment {
                id,
                zone_id,
                name: new.name,
                geometry: new.geometry,
                length_meters: new.length_meters,
                first_generation: next_generation,
                last_generation: None,
            }));
        }

        let generation = ZoneGeneration {
            zone_id,
            generation: next_generation,
            closed_at: None,
        };
        tables.generations.push(generation.clone());
        tables.rebuild_index();

        info!(
            "[MemoryStore] Zone {} generation {} installed with {} segments ({} current overall)",
            zone_id,
            next_generation,
            n_new,
            tables.index.size()
        );
        Ok(generation)
    }

    fn zones(&self) -> Vec<ZoneSummary> {
        let tables = self.tables.read();
        tables
            .zones
            .iter()
            .map(|zone| {
                let of_zone = tables.segments.iter().filter(|s| s.zone_id == zone.id);
                ZoneSummary {
                    zone: zone.clone(),
                    generations: tables
                        .generations
                        .iter()
                        .filter(|g| g.zone_id == zone.id)
                        .cloned()
                        .collect(),
                    current_segments: of_zone.clone().filter(|s| s.is_current()).count(),
                    total_segments: of_zone.count(),
                }
            })
            .collect()
    }

    fn insert_sector(&self, name: &str, geometry: MultiPolygon<f64>) -> Result<Sector> {
        let mut tables = self.tables.write();
        if tables.sectors.iter().any(|s| s.name == name) {
            return Err(Error::AlreadyExists(format!("sector `{}`", name)));
        }

        tables.next_sector_id += 1;
        let sector = Sector {
            id: tables.next_sector_id,
            name: name.to_string(),
            geometry,
        };
        tables.sectors.push(sector.clone());
        Ok(sector)
    }

    fn delete_sector(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let before = tables.sectors.len();
        tables.sectors.retain(|s| s.name != name);
        if tables.sectors.len() == before {
            return Err(Error::NotFound(format!("sector `{}`", name)));
        }
        Ok(())
    }

    fn sector(&self, name: &str) -> Option<Sector> {
        self.tables
            .read()
            .sectors
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    fn sectors(&self) -> Vec<Sector> {
        self.tables.read().sectors.clone()
    }

    fn reset(&self) {
        *self.tables.write() = Tables::default();
        info!("[MemoryStore] Reset all tables");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{grid_store, grid_point, SCALE};
    use geo::{line_string, polygon};

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn stat(segment_id: SegmentId, side: Side, density: f64, num_runs: u32) -> BlockfaceStatistic {
        BlockfaceStatistic {
            segment_id,
            density,
            num_runs,
            curb: side,
        }
    }

    #[test]
    fn test_nearest_segment_empty_store() {
        let store = MemoryStore::new();
        let err = store.nearest_segment(&Point::new(0.0, 0.0), 0).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_nearest_segment_ranks_by_distance() {
        let store = grid_store();
        let p = grid_point(0.5, 0.1);

        let first = store.nearest_segment(&p, 0).unwrap();
        assert_eq!(first.segment.name, "0_0_1_0 Street");
        assert!(approx_eq(first.distance, 0.1 * SCALE, 1e-12));

        let second = store.nearest_segment(&p, 1).unwrap();
        assert!(second.distance >= first.distance);
        assert_ne!(second.segment.id, first.segment.id);
    }

    #[test]
    fn test_nearest_segment_rank_limits() {
        let store = grid_store();
        let p = grid_point(0.5, 0.1);

        assert!(store.nearest_segment(&p, 11).is_ok());
        assert!(matches!(store.nearest_segment(&p, 12), Err(Error::NotFound(_))));
        assert!(matches!(store.nearest_segment(&p, 101), Err(Error::NotFound(_))));

        let capped = MemoryStore::with_max_rank(2);
        crate::test_support::load_grid(&capped);
        assert!(matches!(capped.nearest_segment(&p, 3), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_segments_within_radius() {
        let store = grid_store();
        assert_eq!(store.segments_within(&grid_point(0.0, 0.0), 0.5 * SCALE).len(), 2);
        assert_eq!(store.segments_within(&grid_point(0.0, 0.0), 1000.0).len(), 12);
        assert!(store.segments_within(&grid_point(10.0, 10.0), 0.5 * SCALE).is_empty());
        assert!(store.segments_within(&grid_point(0.0, 0.0), -1.0).is_empty());
        assert!(store.segments_within(&grid_point(0.0, 0.0), f64::NAN).is_empty());
    }

    #[test]
    fn test_segments_covered_by_square() {
        let store = grid_store();
        let square = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 0.0, y: SCALE),
            (x: SCALE, y: SCALE),
            (x: SCALE, y: 0.0),
            (x: 0.0, y: 0.0),
        ]]);
        let mut names: Vec<String> = store
            .segments_covered_by(&square)
            .iter()
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["0_0_0_1 Street", "0_0_1_0 Street", "0_1_1_1 Street", "1_0_1_1 Street"]
        );
    }

    #[test]
    fn test_commit_versions_and_conflict() {
        let store = grid_store();
        let blockface = Blockface::new(1, Side::Left);

        let mut batch = WriteBatch::default();
        batch.statistics.push(StatisticWrite {
            statistic: stat(1, Side::Left, 0.02, 1),
            expected_version: None,
        });
        store.commit(batch).unwrap();
        assert_eq!(store.statistic(blockface).unwrap().version, 1);

        // Stale writer that also read "no statistic"
        let mut stale = WriteBatch::default();
        stale.statistics.push(StatisticWrite {
            statistic: stat(1, Side::Left, 0.05, 1),
            expected_version: None,
        });
        let err = store.commit(stale).unwrap_err();
        assert!(err.is_conflict());
        assert!(approx_eq(store.statistic(blockface).unwrap().statistic.density, 0.02, 1e-12));

        let mut fresh = WriteBatch::default();
        fresh.statistics.push(StatisticWrite {
            statistic: stat(1, Side::Left, 0.03, 2),
            expected_version: Some(1),
        });
        store.commit(fresh).unwrap();
        let current = store.statistic(blockface).unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.statistic.num_runs, 2);
    }

    #[test]
    fn test_commit_is_all_or_nothing() {
        let store = grid_store();
        let mut batch = WriteBatch::default();
        batch.pickups.push(NewPickup {
            external_id: "a".into(),
            run_id: "run".into(),
            segment_id: 1,
            rubbish_type: RubbishType::Paper,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            geometry: grid_point(0.0, 0.5),
            snapped_geometry: grid_point(0.0, 0.5),
            linear_reference: 0.5,
            curb: Side::Left,
        });
        batch.statistics.push(StatisticWrite {
            statistic: stat(1, Side::Left, 0.02, 2),
            expected_version: Some(7),
        });

        assert!(store.commit(batch).is_err());
        assert_eq!(store.pickup_count(), 0);
        assert!(store.pickups_for_run("run").is_empty());
    }

    #[test]
    fn test_zone_update_retires_previous_generation() {
        let store = grid_store();
        assert_eq!(store.current_segment_count(), 12);

        let closed_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let generation = store
            .apply_zone_update(ZoneUpdate {
                source_name: crate::test_support::GRID_ZONE.to_string(),
                name: "Grid".to_string(),
                segments: vec![NewSegment {
                    name: "Only Street".to_string(),
                    geometry: line_string![(x: 0.0, y: 0.0), (x: 0.0, y: SCALE)],
                    length_meters: 111.0,
                }],
                closed_at,
            })
            .unwrap();

        assert_eq!(generation.generation, 1);
        assert_eq!(store.current_segment_count(), 1);

        let retired = store.segment(1).unwrap();
        assert_eq!(retired.last_generation, Some(0));
        assert_eq!(store.segment(13).unwrap().first_generation, 1);

        let zones = store.zones();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].generations.len(), 2);
        assert_eq!(zones[0].generations[0].closed_at, Some(closed_at));
        assert_eq!(zones[0].generations[1].closed_at, None);
        assert_eq!(zones[0].current_segments, 1);
        assert_eq!(zones[0].total_segments, 13);
    }

    #[test]
    fn test_sector_lifecycle() {
        let store = MemoryStore::new();
        let area = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 0.0, y: 1.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)
        ]]);

        store.insert_sector("Downtown", area.clone()).unwrap();
        assert!(matches!(
            store.insert_sector("Downtown", area),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(store.sectors().len(), 1);
        assert!(store.sector("Downtown").is_some());

        store.delete_sector("Downtown").unwrap();
        assert!(store.sector("Downtown").is_none());
        assert!(matches!(store.delete_sector("Downtown"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_reset_clears_everything() {
        let store = grid_store();
        store.reset();
        assert_eq!(store.current_segment_count(), 0);
        assert!(store.zones().is_empty());
        assert!(store.segment(1).is_none());
    }

    #[test]
    fn test_commit_with_retry_rebuilds_batch() {
        let store = grid_store();
        let blockface = Blockface::new(2, Side::Right);
        let mut calls = 0;

        let result = commit_with_retry(&store, 3, |repo, batch| {
            calls += 1;
            let prior = repo.statistic(blockface);
            if calls == 1 {
                // Simulate a competing writer landing between read and commit
                let mut rival = WriteBatch::default();
                rival.statistics.push(StatisticWrite {
                    statistic: stat(2, Side::Right, 0.01, 1),
                    expected_version: None,
                });
                repo.commit(rival)?;
            }
            batch.statistics.push(StatisticWrite {
                statistic: stat(2, Side::Right, 0.02, 1),
                expected_version: prior.map(|p| p.version),
            });
            Ok(calls)
        });

        assert_eq!(result.unwrap(), 2);
        assert_eq!(store.statistic(blockface).unwrap().version, 2);
    }

    #[test]
    fn test_commit_with_retry_gives_up() {
        let store = grid_store();
        let result: Result<()> = commit_with_retry(&store, 2, |_, batch| {
            batch.statistics.push(StatisticWrite {
                statistic: stat(3, Side::Left, 0.01, 1),
                expected_version: Some(99),
            });
            Ok(())
        });
        assert!(matches!(result, Err(Error::ConcurrencyConflict { .. })));
    }
}
