//! Geometry values, the empty-geometry policy and explicit repair.
//!
//! Geometries arrive from the source as WKT rendered by PostGIS. The text is
//! kept verbatim for output, and parsed once with `geozero` into a
//! `geo_types` geometry for the validity predicate and repair.

use std::fmt;
use std::str::FromStr;

use geo::{BooleanOps, Geometry, GeometryCollection, MultiPolygon, Validation};
use geozero::wkt::Wkt;
use geozero::{ToGeo, ToWkt};
use tracing::{debug, info};

use crate::types::SpatialRowSet;

/// Geometry type tag used for the empty-geometry sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeometryKind {
    /// `POINT`
    Point,
    /// `LINESTRING`
    LineString,
    /// `POLYGON`
    Polygon,
    /// `MULTIPOINT`
    MultiPoint,
    /// `MULTILINESTRING`
    MultiLineString,
    /// `MULTIPOLYGON`
    #[default]
    MultiPolygon,
    /// `GEOMETRYCOLLECTION`
    GeometryCollection,
}

impl GeometryKind {
    /// Upper-case WKT tag.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Point => "POINT",
            Self::LineString => "LINESTRING",
            Self::Polygon => "POLYGON",
            Self::MultiPoint => "MULTIPOINT",
            Self::MultiLineString => "MULTILINESTRING",
            Self::MultiPolygon => "MULTIPOLYGON",
            Self::GeometryCollection => "GEOMETRYCOLLECTION",
        }
    }
}

impl FromStr for GeometryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_uppercase().as_str() {
            "POINT" => Self::Point,
            "LINESTRING" => Self::LineString,
            "POLYGON" => Self::Polygon,
            "MULTIPOINT" => Self::MultiPoint,
            "MULTILINESTRING" => Self::MultiLineString,
            "MULTIPOLYGON" => Self::MultiPolygon,
            "GEOMETRYCOLLECTION" => Self::GeometryCollection,
            other => return Err(format!("unknown geometry type '{other}'")),
        };
        Ok(kind)
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text written in place of a null geometry.
///
/// XY data uses `"{KIND} EMPTY"`, XYZ data uses `"{KIND} Z EMPTY"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmptyGeometryPolicy {
    /// Geometry type of the column
    pub kind: GeometryKind,
    /// Whether the column carries a Z ordinate
    pub has_z: bool,
}

impl EmptyGeometryPolicy {
    /// Creates a policy for the given type and dimensionality.
    #[must_use]
    pub const fn new(kind: GeometryKind, has_z: bool) -> Self {
        Self { kind, has_z }
    }

    /// The sentinel string.
    #[must_use]
    pub fn sentinel(&self) -> String {
        if self.has_z {
            format!("{} Z EMPTY", self.kind)
        } else {
            format!("{} EMPTY", self.kind)
        }
    }
}

/// A parsed geometry together with its WKT text.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryValue {
    geometry: Geometry<f64>,
    wkt: String,
    has_z: bool,
}

impl GeometryValue {
    /// Parses WKT. The text is kept as given (trimmed) for output.
    ///
    /// Empty geometries (`POINT EMPTY`, `GEOMETRYCOLLECTION EMPTY`, ...)
    /// keep their text and parse to an empty geometry collection, which is
    /// valid.
    ///
    /// # Errors
    ///
    /// Returns the parser message when the text is not valid WKT.
    pub fn from_wkt(wkt: &str) -> Result<Self, String> {
        let text = wkt.trim();
        let geometry = if wkt_is_empty(text) {
            Geometry::GeometryCollection(GeometryCollection::default())
        } else {
            Wkt(text).to_geo().map_err(|e| e.to_string())?
        };
        Ok(Self {
            geometry,
            wkt: text.to_string(),
            has_z: wkt_has_z(text),
        })
    }

    /// Wraps a geometry built in memory, rendering its WKT.
    ///
    /// # Errors
    ///
    /// Returns the writer message when the geometry cannot be rendered.
    pub fn from_geometry(geometry: Geometry<f64>) -> Result<Self, String> {
        let wkt = geometry.to_wkt().map_err(|e| e.to_string())?;
        Ok(Self {
            geometry,
            wkt,
            has_z: false,
        })
    }

    /// Validity predicate (self-intersections, degenerate rings, ...).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.geometry.is_valid()
    }

    /// Well-known text of this geometry.
    #[must_use]
    pub fn wkt(&self) -> &str {
        &self.wkt
    }

    /// The parsed geometry (XY only).
    #[must_use]
    pub fn geometry(&self) -> &Geometry<f64> {
        &self.geometry
    }

    /// Whether the source text carried a Z ordinate.
    #[must_use]
    pub fn has_z(&self) -> bool {
        self.has_z
    }

    /// Repaired copy of a polygonal geometry.
    ///
    /// Polygons and multipolygons are rebuilt by a union against the empty
    /// set, which resolves self-intersections the same way a zero-distance
    /// buffer does. Returns `None` for valid or non-polygonal geometries,
    /// and for geometries with a Z ordinate since the rebuilt rings are XY
    /// only.
    #[must_use]
    pub fn repaired(&self) -> Option<Self> {
        if self.has_z || self.is_valid() {
            return None;
        }
        let empty = MultiPolygon::<f64>::new(Vec::new());
        let fixed = match &self.geometry {
            Geometry::Polygon(p) => MultiPolygon::new(vec![p.clone()]).union(&empty),
            Geometry::MultiPolygon(mp) => mp.union(&empty),
            _ => return None,
        };
        Self::from_geometry(Geometry::MultiPolygon(fixed)).ok()
    }
}

/// Replaces invalid polygonal geometries with repaired ones.
///
/// Returns how many geometries were replaced. Geometries that cannot be
/// repaired stay untouched and are still reported by the validator.
pub fn repair_invalid(rows: &mut SpatialRowSet) -> usize {
    let mut repaired = 0;
    for (index, geometry) in rows.geometries_mut().enumerate() {
        let Some(value) = geometry.as_ref() else {
            continue;
        };
        if let Some(fixed) = value.repaired() {
            debug!(row = index, "repaired invalid geometry");
            *geometry = Some(fixed);
            repaired += 1;
        }
    }
    if repaired > 0 {
        info!(repaired, "repaired invalid geometries");
    }
    repaired
}

fn wkt_is_empty(wkt: &str) -> bool {
    let head = wkt.split('(').next().unwrap_or_default();
    head.split_whitespace()
        .last()
        .is_some_and(|token| token.eq_ignore_ascii_case("EMPTY"))
}

fn wkt_has_z(wkt: &str) -> bool {
    let head = wkt.split('(').next().unwrap_or_default();
    head.split_whitespace()
        .skip(1)
        .any(|token| token.eq_ignore_ascii_case("Z") || token.eq_ignore_ascii_case("ZM"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOWTIE: &str = "POLYGON((0 0, 2 2, 2 0, 0 2, 0 0))";

    #[test]
    fn test_sentinels() {
        assert_eq!(EmptyGeometryPolicy::default().sentinel(), "MULTIPOLYGON EMPTY");
        assert_eq!(
            EmptyGeometryPolicy::new(GeometryKind::MultiPolygon, true).sentinel(),
            "MULTIPOLYGON Z EMPTY"
        );
        assert_eq!(
            EmptyGeometryPolicy::new(GeometryKind::Point, false).sentinel(),
            "POINT EMPTY"
        );
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("multipolygon".parse::<GeometryKind>(), Ok(GeometryKind::MultiPolygon));
        assert_eq!(" Point ".parse::<GeometryKind>(), Ok(GeometryKind::Point));
        assert!("circle".parse::<GeometryKind>().is_err());
    }

    #[test]
    fn test_from_wkt_keeps_text() {
        let value = GeometryValue::from_wkt(" POINT(1 2) ").unwrap();
        assert_eq!(value.wkt(), "POINT(1 2)");
        assert!(value.is_valid());
        assert!(!value.has_z());
        assert!(matches!(value.geometry(), Geometry::Point(_)));
    }

    #[test]
    fn test_z_detection() {
        assert!(wkt_has_z("POINT Z (1 2 3)"));
        assert!(wkt_has_z("MULTIPOLYGON Z EMPTY"));
        assert!(!wkt_has_z("POINT(1 2)"));
        assert!(!wkt_has_z("MULTIPOLYGON EMPTY"));
    }

    #[test]
    fn test_empty_wkt_is_valid() {
        for text in ["POINT EMPTY", "GEOMETRYCOLLECTION EMPTY", "point z empty"] {
            let value = GeometryValue::from_wkt(text).unwrap();
            assert_eq!(value.wkt(), text);
            assert!(value.is_valid());
            assert!(value.repaired().is_none());
        }
        assert!(GeometryValue::from_wkt("POINT Z EMPTY").unwrap().has_z());
    }

    #[test]
    fn test_z_geometry_is_not_repaired() {
        let value = GeometryValue::from_wkt("POLYGON Z ((0 0 1, 2 2 1, 2 0 1, 0 2 1, 0 0 1))").unwrap();
        assert!(value.has_z());
        assert!(value.repaired().is_none());
    }

    #[test]
    fn test_invalid_wkt() {
        assert!(GeometryValue::from_wkt("NOT WKT").is_err());
    }

    #[test]
    fn test_bowtie_is_invalid_and_repairs() {
        let value = GeometryValue::from_wkt(BOWTIE).unwrap();
        assert!(!value.is_valid());

        let fixed = value.repaired().expect("polygon should be repairable");
        assert!(fixed.is_valid());
        assert!(fixed.wkt().starts_with("MULTIPOLYGON"));
    }

    #[test]
    fn test_valid_geometry_is_not_repaired() {
        let value = GeometryValue::from_wkt("POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))").unwrap();
        assert!(value.repaired().is_none());
    }
}
