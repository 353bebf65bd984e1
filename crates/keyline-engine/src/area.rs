//! Area-of-interest validation and normalisation.
//!
//! Every area entering the engine goes through [`normalize`], which:
//! - parses a GeoJSON geometry (Polygon / MultiPolygon, optionally wrapped in a
//!   Feature or single-feature FeatureCollection) or a bounding box,
//! - reprojects it to the canonical LV95 system when it was given in WGS84,
//! - rounds coordinates to centimetres and puts rings into a canonical
//!   orientation and starting vertex,
//! - rejects empty, degenerate, self-intersecting and out-of-territory input.
//!
//! This module performs no I/O.

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{Area as _, Contains, Coord, Intersects, Line, LineString, MultiPolygon, Rect};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::AreaViolation;
use crate::swiss::Lv95Transform;
use crate::{EngineError, Result};

/// Number of decimals kept for canonical coordinates (centimetres in LV95).
pub const COORDINATE_DECIMALS: i32 = 2;

/// Supported LV95 extent (xmin, ymin, xmax, ymax).
pub const LV95_BOUNDS: BBox = BBox {
    xmin: 2_485_000.0,
    ymin: 1_075_000.0,
    xmax: 2_834_000.0,
    ymax: 1_296_000.0,
};

/// A single coordinate pair.
pub type Position = [f64; 2];

/// Supported coordinate reference systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Crs {
    /// Swiss LV95 / CH1903+ (EPSG:2056), the canonical working system.
    #[default]
    #[serde(rename = "EPSG:2056")]
    Lv95,
    /// WGS 84 longitude/latitude (EPSG:4326).
    #[serde(rename = "EPSG:4326")]
    Wgs84,
}

impl Crs {
    /// Integer EPSG code.
    pub const fn epsg_code(&self) -> u32 {
        match self {
            Crs::Lv95 => 2056,
            Crs::Wgs84 => 4326,
        }
    }

    /// Parse from a CLI-style name (`lv95`, `wgs84`, `EPSG:2056`, ...).
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lv95" | "epsg:2056" | "2056" => Ok(Crs::Lv95),
            "wgs84" | "epsg:4326" | "4326" => Ok(Crs::Wgs84),
            other => Err(EngineError::InvalidParameters(format!(
                "unknown CRS '{}', expected 'lv95' or 'wgs84'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EPSG:{}", self.epsg_code())
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    /// Minimum x (easting or longitude).
    pub xmin: f64,
    /// Minimum y (northing or latitude).
    pub ymin: f64,
    /// Maximum x.
    pub xmax: f64,
    /// Maximum y.
    pub ymax: f64,
}

impl BBox {
    /// Create a box, rejecting zero or negative extent.
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Result<Self> {
        if ![xmin, ymin, xmax, ymax].iter().all(|v| v.is_finite()) {
            return Err(EngineError::InvalidArea(AreaViolation::NonFiniteCoordinate));
        }
        if xmin >= xmax || ymin >= ymax {
            return Err(EngineError::InvalidArea(AreaViolation::DegenerateBox {
                width: xmax - xmin,
                height: ymax - ymin,
            }));
        }
        Ok(Self { xmin, ymin, xmax, ymax })
    }

    /// Envelope of a set of positions. Returns `None` for an empty iterator.
    pub fn enclosing<'a>(positions: impl IntoIterator<Item = &'a Position>) -> Option<Self> {
        let mut iter = positions.into_iter();
        let first = iter.next()?;
        let mut bbox = BBox {
            xmin: first[0],
            ymin: first[1],
            xmax: first[0],
            ymax: first[1],
        };
        for p in iter {
            bbox.xmin = bbox.xmin.min(p[0]);
            bbox.ymin = bbox.ymin.min(p[1]);
            bbox.xmax = bbox.xmax.max(p[0]);
            bbox.ymax = bbox.ymax.max(p[1]);
        }
        Some(bbox)
    }

    /// (xmin, ymin, xmax, ymax)
    pub fn as_tuple(&self) -> (f64, f64, f64, f64) {
        (self.xmin, self.ymin, self.xmax, self.ymax)
    }

    /// Width times height, in squared CRS units.
    pub fn area(&self) -> f64 {
        (self.xmax - self.xmin) * (self.ymax - self.ymin)
    }

    /// Whether `other` lies completely inside this box (edges included).
    pub fn contains(&self, other: &BBox) -> bool {
        self.to_rect().contains(&other.to_rect())
    }

    /// The box as a `geo` rectangle.
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.xmin,
                y: self.ymin,
            },
            Coord {
                x: self.xmax,
                y: self.ymax,
            },
        )
    }

    /// Whether the boxes share any interior.
    pub fn overlaps(&self, other: &BBox) -> bool {
        self.xmin < other.xmax && other.xmin < self.xmax && self.ymin < other.ymax && other.ymin < self.ymax
    }

    /// Closed exterior ring, counter-clockwise.
    pub fn ring(&self) -> Vec<Position> {
        vec![
            [self.xmin, self.ymin],
            [self.xmax, self.ymin],
            [self.xmax, self.ymax],
            [self.xmin, self.ymax],
            [self.xmin, self.ymin],
        ]
    }
}

/// A polygon: exterior ring followed by zero or more holes, each closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    /// Rings; index 0 is the exterior.
    pub rings: Vec<Vec<Position>>,
}

impl Polygon {
    /// Exterior ring.
    pub fn exterior(&self) -> &[Position] {
        self.rings.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Enclosed area (exterior minus holes).
    pub fn area(&self) -> f64 {
        self.to_geo().unsigned_area()
    }

    /// Whether a point lies in the polygon's interior.
    pub fn contains_point(&self, p: Position) -> bool {
        self.to_geo().contains(&Coord { x: p[0], y: p[1] })
    }

    /// The polygon as a `geo` polygon.
    pub fn to_geo(&self) -> geo::Polygon<f64> {
        let mut rings = self.rings.iter().map(|r| line_string(r));
        let exterior = rings.next().unwrap_or_else(|| LineString::new(Vec::new()));
        geo::Polygon::new(exterior, rings.collect())
    }
}

/// The user's area of interest, validated and expressed in LV95.
///
/// Constructed once per run by [`normalize`] and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Area {
    polygons: Vec<Polygon>,
    bbox: BBox,
    source_crs: Crs,
}

impl Area {
    /// Polygons in canonical order.
    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    /// LV95 bounding box.
    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    /// CRS the area was supplied in.
    pub fn source_crs(&self) -> Crs {
        self.source_crs
    }

    /// Always [`Crs::Lv95`].
    pub fn crs(&self) -> Crs {
        Crs::Lv95
    }

    /// Enclosed area in square metres.
    pub fn area_m2(&self) -> f64 {
        self.polygons.iter().map(Polygon::area).sum()
    }

    /// Whether a point lies inside any polygon of the area.
    pub fn contains_point(&self, p: Position) -> bool {
        self.polygons.iter().any(|poly| poly.contains_point(p))
    }

    /// The area as a `geo` multi-polygon.
    pub fn to_multi_polygon(&self) -> MultiPolygon<f64> {
        MultiPolygon::new(self.polygons.iter().map(Polygon::to_geo).collect())
    }

    /// GeoJSON geometry object in LV95 coordinates.
    pub fn to_geojson(&self) -> Value {
        if self.polygons.len() == 1 {
            json!({ "type": "Polygon", "coordinates": self.polygons[0].rings })
        } else {
            let coords: Vec<&Vec<Vec<Position>>> = self.polygons.iter().map(|p| &p.rings).collect();
            json!({ "type": "MultiPolygon", "coordinates": coords })
        }
    }

    /// Deterministic hash of the canonical geometry (16 hex chars).
    ///
    /// Coordinates are already rounded to centimetres and rings are in
    /// canonical orientation, so equal areas hash equally regardless of how
    /// the input was written.
    pub fn canonical_hash(&self) -> String {
        let text = serde_json::to_string(&self.to_geojson()).unwrap_or_default();
        let digest = Sha256::digest(text.as_bytes());
        hex::encode(digest)[..16].to_string()
    }

    /// Bounding box in WGS84 degrees, enclosing the whole LV95 box.
    ///
    /// The box edges are densified before transforming because the
    /// projection bends straight LV95 edges in geographic space.
    pub fn wgs84_bbox(&self) -> Result<BBox> {
        const STEPS: usize = 8;
        let transform = Lv95Transform::new()?;
        let b = self.bbox;
        let mut points = Vec::with_capacity(4 * (STEPS + 1));
        for i in 0..=STEPS {
            let t = i as f64 / STEPS as f64;
            let x = b.xmin + (b.xmax - b.xmin) * t;
            let y = b.ymin + (b.ymax - b.ymin) * t;
            for (e, n) in [(x, b.ymin), (x, b.ymax), (b.xmin, y), (b.xmax, y)] {
                let (lon, lat) = transform.to_wgs84(e, n)?;
                points.push([lon, lat]);
            }
        }
        // Non-empty by construction.
        Ok(BBox::enclosing(&points).unwrap_or(b))
    }
}

/// User input describing an area of interest.
#[derive(Debug, Clone, PartialEq)]
pub enum AreaInput {
    /// A GeoJSON geometry, Feature or single-feature FeatureCollection.
    GeoJson(Value),
    /// A box as (xmin, ymin, xmax, ymax).
    BBox([f64; 4]),
}

impl AreaInput {
    /// Build input from optional CLI-style arguments, requiring exactly one.
    pub fn from_options(geojson: Option<Value>, bbox: Option<[f64; 4]>) -> Result<Self> {
        match (geojson, bbox) {
            (Some(g), None) => Ok(AreaInput::GeoJson(g)),
            (None, Some(b)) => Ok(AreaInput::BBox(b)),
            _ => Err(EngineError::InvalidArea(AreaViolation::AmbiguousInput)),
        }
    }
}

/// Validate an area and reproject it into the canonical LV95 system.
pub fn normalize(input: &AreaInput, input_crs: Crs) -> Result<Area> {
    let polygons = match input {
        AreaInput::BBox([xmin, ymin, xmax, ymax]) => {
            let bbox = BBox::new(*xmin, *ymin, *xmax, *ymax)?;
            vec![Polygon { rings: vec![bbox.ring()] }]
        }
        AreaInput::GeoJson(value) => parse_geojson(value)?,
    };

    check_structure(&polygons)?;

    let polygons = match input_crs {
        Crs::Lv95 => polygons,
        Crs::Wgs84 => reproject_polygons(&polygons)?,
    };
    let polygons = canonicalize_polygons(polygons);

    // Rounding can collapse tiny rings, so shape checks run on the final form.
    check_structure(&polygons)?;
    check_self_intersection(&polygons)?;
    for poly in &polygons {
        if poly.area() <= f64::EPSILON {
            return Err(EngineError::InvalidArea(AreaViolation::ZeroArea));
        }
    }

    let bbox = BBox::enclosing(polygons.iter().flat_map(|p| p.rings.iter().flatten()))
        .ok_or(EngineError::InvalidArea(AreaViolation::EmptyGeometry))?;
    if !LV95_BOUNDS.contains(&bbox) {
        return Err(EngineError::InvalidArea(AreaViolation::OutOfBounds {
            bbox: bbox.as_tuple(),
        }));
    }

    Ok(Area {
        polygons,
        bbox,
        source_crs: input_crs,
    })
}

fn parse_geojson(value: &Value) -> Result<Vec<Polygon>> {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
    match kind {
        "Feature" => {
            let geometry = value
                .get("geometry")
                .filter(|g| !g.is_null())
                .ok_or(EngineError::InvalidArea(AreaViolation::EmptyGeometry))?;
            parse_geojson(geometry)
        }
        "FeatureCollection" => {
            let features = value
                .get("features")
                .and_then(Value::as_array)
                .ok_or(EngineError::InvalidArea(AreaViolation::EmptyGeometry))?;
            match features.as_slice() {
                [single] => parse_geojson(single),
                [] => Err(EngineError::InvalidArea(AreaViolation::EmptyGeometry)),
                _ => Err(EngineError::InvalidArea(AreaViolation::UnsupportedGeometryType(
                    "FeatureCollection with multiple features".to_string(),
                ))),
            }
        }
        "Polygon" => {
            let coords = value
                .get("coordinates")
                .ok_or(EngineError::InvalidArea(AreaViolation::EmptyGeometry))?;
            Ok(vec![parse_polygon(coords)?])
        }
        "MultiPolygon" => {
            let coords = value
                .get("coordinates")
                .and_then(Value::as_array)
                .ok_or(EngineError::InvalidArea(AreaViolation::EmptyGeometry))?;
            coords.iter().map(parse_polygon).collect()
        }
        other => Err(EngineError::InvalidArea(AreaViolation::UnsupportedGeometryType(
            other.to_string(),
        ))),
    }
}

fn parse_polygon(value: &Value) -> Result<Polygon> {
    let rings = value
        .as_array()
        .ok_or(EngineError::InvalidArea(AreaViolation::EmptyGeometry))?;
    let rings = rings
        .iter()
        .map(|ring| {
            ring.as_array()
                .ok_or(EngineError::InvalidArea(AreaViolation::EmptyGeometry))?
                .iter()
                .map(parse_position)
                .collect::<Result<Vec<Position>>>()
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Polygon { rings })
}

fn parse_position(value: &Value) -> Result<Position> {
    let arr = value
        .as_array()
        .filter(|a| a.len() >= 2)
        .ok_or(EngineError::InvalidArea(AreaViolation::EmptyGeometry))?;
    let x = arr[0].as_f64();
    let y = arr[1].as_f64();
    match (x, y) {
        (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Ok([x, y]),
        _ => Err(EngineError::InvalidArea(AreaViolation::NonFiniteCoordinate)),
    }
}

fn check_structure(polygons: &[Polygon]) -> Result<()> {
    if polygons.is_empty() || polygons.iter().all(|p| p.rings.is_empty()) {
        return Err(EngineError::InvalidArea(AreaViolation::EmptyGeometry));
    }
    for (pi, poly) in polygons.iter().enumerate() {
        if poly.rings.is_empty() {
            return Err(EngineError::InvalidArea(AreaViolation::EmptyGeometry));
        }
        for (ri, ring) in poly.rings.iter().enumerate() {
            if ring.len() < 4 || ring.first() != ring.last() {
                return Err(EngineError::InvalidArea(AreaViolation::MalformedRing {
                    polygon: pi,
                    ring: ri,
                }));
            }
        }
    }
    Ok(())
}

fn reproject_polygons(polygons: &[Polygon]) -> Result<Vec<Polygon>> {
    let transform = Lv95Transform::new()?;
    polygons
        .iter()
        .map(|poly| {
            let rings = poly
                .rings
                .iter()
                .map(|ring| {
                    ring.iter()
                        .map(|p| transform.to_lv95_checked(p[0], p[1]).map(|(e, n)| [e, n]))
                        .collect::<Result<Vec<Position>>>()
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Polygon { rings })
        })
        .collect()
}

/// Round a value to the canonical coordinate precision.
pub fn round_coord(v: f64) -> f64 {
    let factor = 10f64.powi(COORDINATE_DECIMALS);
    let r = (v * factor).round() / factor;
    // Normalise negative zero so it serialises identically.
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

/// Round coordinates, drop repeated vertices, orient rings (exterior CCW,
/// holes CW), start each ring at its smallest vertex, and sort holes and
/// polygons.
fn canonicalize_polygons(polygons: Vec<Polygon>) -> Vec<Polygon> {
    let mut out: Vec<Polygon> = polygons
        .into_iter()
        .map(|poly| {
            let mut rings: Vec<Vec<Position>> = poly
                .rings
                .into_iter()
                .enumerate()
                .map(|(i, ring)| canonical_ring(ring, i == 0))
                .collect();
            if rings.len() > 2 {
                rings[1..].sort_by(|a, b| compare_rings(a, b));
            }
            Polygon { rings }
        })
        .collect();
    out.sort_by(|a, b| compare_rings(a.exterior(), b.exterior()));
    out
}

fn canonical_ring(ring: Vec<Position>, exterior: bool) -> Vec<Position> {
    let mut open: Vec<Position> = Vec::with_capacity(ring.len());
    for p in ring {
        let p = [round_coord(p[0]), round_coord(p[1])];
        if open.last() != Some(&p) {
            open.push(p);
        }
    }
    while open.len() > 1 && open.first() == open.last() {
        open.pop();
    }
    if open.is_empty() {
        return open;
    }

    let ccw = signed_area(&open) > 0.0;
    if ccw != exterior {
        open.reverse();
    }

    let start = open
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])))
        .map(|(i, _)| i)
        .unwrap_or(0);
    open.rotate_left(start);
    let first = open[0];
    open.push(first);
    open
}

fn compare_rings(a: &[Position], b: &[Position]) -> std::cmp::Ordering {
    for (p, q) in a.iter().zip(b.iter()) {
        let ord = p[0].total_cmp(&q[0]).then(p[1].total_cmp(&q[1]));
        if ord.is_ne() {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn line_string(ring: &[Position]) -> LineString<f64> {
    ring.iter().map(|p| Coord { x: p[0], y: p[1] }).collect()
}

/// Signed area of a ring, open or closed; positive when counter-clockwise.
pub fn signed_area(ring: &[Position]) -> f64 {
    geo::Polygon::new(line_string(ring), Vec::new()).signed_area()
}

struct Segment {
    line: Line<f64>,
    polygon: usize,
    ring: usize,
    index: usize,
    ring_len: usize,
}

/// Reject rings that cross themselves or each other. Consecutive edges of a
/// ring share a vertex and are not compared.
fn check_self_intersection(polygons: &[Polygon]) -> Result<()> {
    let mut segments = Vec::new();
    for (pi, poly) in polygons.iter().enumerate() {
        for (ri, ring) in poly.rings.iter().enumerate() {
            let ring_len = ring.len() - 1;
            for (si, line) in line_string(ring).lines().enumerate() {
                segments.push(Segment {
                    line,
                    polygon: pi,
                    ring: ri,
                    index: si,
                    ring_len,
                });
            }
        }
    }

    for i in 0..segments.len() {
        for j in (i + 1)..segments.len() {
            let (s, t) = (&segments[i], &segments[j]);
            if s.polygon == t.polygon && s.ring == t.ring {
                let adjacent = t.index == s.index + 1 || (s.index == 0 && t.index + 1 == s.ring_len);
                if adjacent {
                    continue;
                }
            }
            if !s.line.intersects(&t.line) {
                continue;
            }
            let at = match line_intersection(s.line, t.line) {
                Some(LineIntersection::SinglePoint { intersection, .. }) => intersection,
                Some(LineIntersection::Collinear { intersection }) => intersection.start,
                None => s.line.start,
            };
            return Err(EngineError::InvalidArea(AreaViolation::SelfIntersection { x: at.x, y: at.y }));
        }
    }
    Ok(())
}
