//! Shared fixtures: a 3x3-node street grid and pickup builders.
//!
//! Grid nodes sit at integer coordinates `(0..=2, 0..=2)` scaled by [`SCALE`]
//! degrees, so one block is roughly 111 m. Each of the 12 segments is named
//! after its endpoints, e.g. `"0_0_1_0 Street"`.

use crate::store::Repository;
use crate::zones::{update_zone, SegmentRecord, ZoneImport};
use crate::{MemoryStore, RawPickup};
use chrono::{DateTime, Utc};
use geo::{LineString, Point};

pub const SCALE: f64 = 0.001;
pub const GRID_ZONE: &str = "Grid City, California";

const GRID_EDGES: [((u8, u8), (u8, u8)); 12] = [
    ((0, 0), (0, 1)),
    ((0, 1), (0, 2)),
    ((0, 0), (1, 0)),
    ((1, 0), (2, 0)),
    ((2, 0), (2, 1)),
    ((2, 1), (2, 2)),
    ((2, 2), (1, 2)),
    ((1, 2), (0, 2)),
    ((1, 0), (1, 1)),
    ((0, 1), (1, 1)),
    ((1, 2), (1, 1)),
    ((2, 1), (1, 1)),
];

pub fn grid_point(x: f64, y: f64) -> Point<f64> {
    Point::new(x * SCALE, y * SCALE)
}

pub fn load_grid<R: Repository + ?Sized>(repo: &R) {
    let segments = GRID_EDGES
        .iter()
        .map(|&((x0, y0), (x1, y1))| {
            SegmentRecord::new(
                format!("{}_{}_{}_{} Street", x0, y0, x1, y1),
                LineString::from(vec![
                    (f64::from(x0) * SCALE, f64::from(y0) * SCALE),
                    (f64::from(x1) * SCALE, f64::from(y1) * SCALE),
                ]),
            )
        })
        .collect();

    update_zone(
        repo,
        ZoneImport {
            source_name: GRID_ZONE.to_string(),
            name: None,
            segments,
        },
    )
    .unwrap();
}

pub fn grid_store() -> MemoryStore {
    let store = MemoryStore::new();
    load_grid(&store);
    store
}

/// Id of the grid segment with the given name.
pub fn segment_id<R: Repository + ?Sized>(repo: &R, name: &str) -> u64 {
    (1..=12)
        .find(|&id| repo.segment(id).map_or(false, |s| s.name == name))
        .unwrap()
}

/// Fixed "current time" for tests.
pub fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// A valid raw pickup at grid coordinates, timestamped a minute before [`now`].
pub fn raw_pickup(id: &str, run_id: &str, x: f64, y: f64, curb: Option<&str>) -> RawPickup {
    let p = grid_point(x, y);
    RawPickup::new(
        id,
        run_id,
        "plastic",
        now().timestamp() - 60,
        curb,
        format!("POINT({} {})", p.x(), p.y()),
    )
}

/// One raw pickup per `(x, y)` grid coordinate, all with the same curb.
pub fn raw_run(run_id: &str, coords: &[(f64, f64)], curb: Option<&str>) -> Vec<RawPickup> {
    coords
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| raw_pickup(&format!("{}-{}", run_id, i), run_id, x, y, curb))
        .collect()
}
