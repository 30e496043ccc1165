//! Zone imports and sector management.
//!
//! A zone is replaced wholesale: importing a street network under an existing
//! source name retires every current segment of that zone and installs the new set
//! as the next generation. Pickups and statistics that reference retired segments
//! stay valid; queries simply stop returning those segments.

use crate::error::{Error, Result};
use crate::geo_utils::polyline_length;
use crate::store::{NewSegment, Repository, ZoneSummary, ZoneUpdate};
use crate::{Sector, ZoneGeneration};
use chrono::{DateTime, Utc};
use geo::{Geometry, LineString, MultiPolygon};
use log::info;
use wkt::TryFromWkt;

/// Segment name used when the import carries none.
pub const UNKNOWN_SEGMENT_NAME: &str = "Unknown";

/// One street segment of an import.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRecord {
    pub name: String,
    pub geometry: LineString<f64>,
}

impl SegmentRecord {
    pub fn new(name: impl Into<String>, geometry: LineString<f64>) -> Self {
        Self {
            name: name.into(),
            geometry,
        }
    }

    /// Parse a `LINESTRING` WKT.
    pub fn from_wkt(name: impl Into<String>, wkt: &str) -> Result<Self> {
        let geometry = LineString::<f64>::try_from_wkt_str(wkt)
            .map_err(|e| Error::InvalidGeometry(format!("segment WKT: {}", e)))?;
        Ok(Self::new(name, geometry))
    }
}

/// A full street network for one zone.
#[derive(Debug, Clone)]
pub struct ZoneImport {
    /// Name the network was fetched under; identifies the zone across imports
    pub source_name: String,
    /// Display name, defaults to `source_name`
    pub name: Option<String>,
    pub segments: Vec<SegmentRecord>,
}

/// Install `import` as the zone's next generation, closing the current one now.
pub fn update_zone<R: Repository + ?Sized>(repo: &R, import: ZoneImport) -> Result<ZoneGeneration> {
    update_zone_at(repo, import, Utc::now())
}

/// [`update_zone`] with an explicit closing timestamp for the retired generation.
pub fn update_zone_at<R: Repository + ?Sized>(
    repo: &R,
    import: ZoneImport,
    now: DateTime<Utc>,
) -> Result<ZoneGeneration> {
    if import.segments.is_empty() {
        return Err(Error::InvalidGeometry(format!(
            "zone `{}` import contains no segments",
            import.source_name
        )));
    }

    let mut segments = Vec::with_capacity(import.segments.len());
    for (i, record) in import.segments.into_iter().enumerate() {
        validate_line(&record.geometry)
            .map_err(|reason| Error::InvalidGeometry(format!("segment {}: {}", i, reason)))?;

        let name = if record.name.trim().is_empty() {
            UNKNOWN_SEGMENT_NAME.to_string()
        } else {
            record.name
        };
        segments.push(NewSegment {
            name,
            length_meters: polyline_length(&record.geometry),
            geometry: record.geometry,
        });
    }

    let n = segments.len();
    let generation = repo.apply_zone_update(ZoneUpdate {
        name: import.name.unwrap_or_else(|| import.source_name.clone()),
        source_name: import.source_name,
        segments,
        closed_at: now,
    })?;

    info!(
        "[Zones] Imported {} segments into zone {} as generation {}",
        n, generation.zone_id, generation.generation
    );
    Ok(generation)
}

fn validate_line(line: &LineString<f64>) -> std::result::Result<(), &'static str> {
    if line.0.len() < 2 {
        return Err("a segment needs at least two vertices");
    }
    if line.coords().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err("non-finite coordinate");
    }
    Ok(())
}

pub fn show_zones<R: Repository + ?Sized>(repo: &R) -> Vec<ZoneSummary> {
    repo.zones()
}

// ============================================================================
// Sectors
// ============================================================================

/// Parse a sector boundary. `POLYGON` input is promoted to a one-member `MULTIPOLYGON`.
pub fn parse_sector_wkt(wkt: &str) -> Result<MultiPolygon<f64>> {
    let geometry = Geometry::<f64>::try_from_wkt_str(wkt)
        .map_err(|e| Error::InvalidGeometry(format!("sector WKT: {}", e)))?;

    match geometry {
        Geometry::Polygon(polygon) => Ok(MultiPolygon::new(vec![polygon])),
        Geometry::MultiPolygon(multi) if !multi.0.is_empty() => Ok(multi),
        Geometry::MultiPolygon(_) => Err(Error::InvalidGeometry(
            "sector MULTIPOLYGON is empty".to_string(),
        )),
        _ => Err(Error::InvalidGeometry(
            "sector must be a POLYGON or MULTIPOLYGON".to_string(),
        )),
    }
}

pub fn insert_sector<R: Repository + ?Sized>(repo: &R, name: &str, wkt: &str) -> Result<Sector> {
    let geometry = parse_sector_wkt(wkt)?;
    let sector = repo.insert_sector(name, geometry)?;
    info!("[Zones] Inserted sector `{}`", name);
    Ok(sector)
}

pub fn delete_sector<R: Repository + ?Sized>(repo: &R, name: &str) -> Result<()> {
    repo.delete_sector(name)?;
    info!("[Zones] Deleted sector `{}`", name);
    Ok(())
}

pub fn show_sectors<R: Repository + ?Sized>(repo: &R) -> Vec<Sector> {
    repo.sectors()
}

/// Drop all zones, segments, pickups, statistics and sectors.
pub fn reset<R: Repository + ?Sized>(repo: &R) {
    repo.reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{grid_store, GRID_ZONE, SCALE};
    use crate::MemoryStore;
    use geo::line_string;

    #[test]
    fn test_segment_record_from_wkt() {
        let record = SegmentRecord::from_wkt("Main St", "LINESTRING(0 0, 0 0.001)").unwrap();
        assert_eq!(record.geometry.0.len(), 2);

        assert!(matches!(
            SegmentRecord::from_wkt("Main St", "LINESTRING(0 0,"),
            Err(Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_update_zone_computes_lengths_and_names() {
        let store = MemoryStore::new();
        update_zone(
            &store,
            ZoneImport {
                source_name: "Tiny Town".to_string(),
                name: None,
                segments: vec![SegmentRecord::new(
                    "  ",
                    line_string![(x: 0.0, y: 0.0), (x: 0.0, y: SCALE)],
                )],
            },
        )
        .unwrap();

        let segment = store.segment(1).unwrap();
        assert_eq!(segment.name, UNKNOWN_SEGMENT_NAME);
        assert!((segment.length_meters - 111.2).abs() < 0.5);

        let zones = show_zones(&store);
        assert_eq!(zones[0].zone.name, "Tiny Town");
        assert!(zones[0].zone.bounding_box.is_some());
    }

    #[test]
    fn test_update_zone_rejects_degenerate_segments() {
        let store = MemoryStore::new();
        let err = update_zone(
            &store,
            ZoneImport {
                source_name: "Broken".to_string(),
                name: None,
                segments: vec![SegmentRecord::new("Dot", line_string![(x: 0.0, y: 0.0)])],
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidGeometry(_)));
        assert!(store.zones().is_empty());

        let empty = ZoneImport {
            source_name: "Empty".to_string(),
            name: None,
            segments: vec![],
        };
        assert!(update_zone(&store, empty).is_err());
    }

    #[test]
    fn test_reimport_bumps_generation() {
        let store = grid_store();
        let generation = update_zone(
            &store,
            ZoneImport {
                source_name: GRID_ZONE.to_string(),
                name: Some("Grid".to_string()),
                segments: vec![SegmentRecord::new(
                    "New Street",
                    line_string![(x: 0.0, y: 0.0), (x: SCALE, y: SCALE)],
                )],
            },
        )
        .unwrap();
        assert_eq!(generation.generation, 1);
        assert_eq!(store.zones()[0].zone.name, "Grid");
    }

    #[test]
    fn test_parse_sector_wkt_promotes_polygon() {
        let multi = parse_sector_wkt("POLYGON((0 0, 0 1, 1 1, 1 0, 0 0))").unwrap();
        assert_eq!(multi.0.len(), 1);

        let two = parse_sector_wkt(
            "MULTIPOLYGON(((0 0, 0 1, 1 1, 0 0)), ((2 2, 2 3, 3 3, 2 2)))",
        )
        .unwrap();
        assert_eq!(two.0.len(), 2);

        assert!(parse_sector_wkt("LINESTRING(0 0, 1 1)").is_err());
        assert!(parse_sector_wkt("POLYGON((").is_err());
    }

    #[test]
    fn test_sector_helpers() {
        let store = MemoryStore::new();
        insert_sector(&store, "Mission", "POLYGON((0 0, 0 1, 1 1, 1 0, 0 0))").unwrap();
        assert!(insert_sector(&store, "Mission", "POLYGON((0 0, 0 1, 1 1, 1 0, 0 0))").is_err());
        assert_eq!(show_sectors(&store).len(), 1);

        delete_sector(&store, "Mission").unwrap();
        assert!(show_sectors(&store).is_empty());

        reset(&store);
        assert!(store.zones().is_empty());
    }
}
