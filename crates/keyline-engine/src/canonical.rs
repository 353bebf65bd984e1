//! Canonical ordering, rounding and serialization of contour features.
//!
//! Two computations of the same logical contour set must serialize to the
//! same bytes even when the contour tool emits features in a different
//! order, starts a ring elsewhere or walks a line backwards.
//! [`canonicalize`] gets there by:
//!
//! 1. rounding elevations and coordinates to centimetres,
//! 2. dropping repeated vertices,
//! 3. orienting closed rings counter-clockwise and rotating them to start at
//!    their smallest vertex; orienting open lines to start at the smaller
//!    endpoint,
//! 4. optionally simplifying with Douglas-Peucker, anchored at that start,
//! 5. dropping degenerate lines,
//! 6. sorting by (elevation, min x, min y), ties broken on the vertices.
//!
//! [`to_geojson_string`] then writes a FeatureCollection with a fixed member
//! order.

use std::cmp::Ordering;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::area::{round_coord, signed_area, BBox, Crs, Position};
use crate::stage::StageKind;
use crate::{EngineError, Result};

/// One isoline.
#[derive(Debug, Clone, PartialEq)]
pub struct ContourFeature {
    /// Elevation in metres.
    pub elevation: f64,
    /// Ordered vertices in LV95.
    pub coordinates: Vec<Position>,
    /// Extent of `coordinates`.
    pub bbox: BBox,
}

impl ContourFeature {
    /// Build a feature, computing its extent. Returns `None` without vertices.
    pub fn new(elevation: f64, coordinates: Vec<Position>) -> Option<Self> {
        let bbox = BBox::enclosing(&coordinates)?;
        Some(Self {
            elevation,
            coordinates,
            bbox,
        })
    }

    fn is_closed(&self) -> bool {
        self.coordinates.len() > 2 && self.coordinates.first() == self.coordinates.last()
    }

    fn cmp_canonical(&self, other: &Self) -> Ordering {
        self.elevation
            .total_cmp(&other.elevation)
            .then(self.bbox.xmin.total_cmp(&other.bbox.xmin))
            .then(self.bbox.ymin.total_cmp(&other.bbox.ymin))
            .then_with(|| {
                for (a, b) in self.coordinates.iter().zip(&other.coordinates) {
                    let ord = a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1]));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                self.coordinates.len().cmp(&other.coordinates.len())
            })
    }
}

/// Apply the rounding and ordering invariants to a feature set.
pub fn canonicalize(features: Vec<ContourFeature>, simplify_tolerance: f64) -> Vec<ContourFeature> {
    let mut out: Vec<ContourFeature> = features
        .into_iter()
        .filter_map(|f| canonical_feature(f, simplify_tolerance))
        .collect();
    out.sort_by(ContourFeature::cmp_canonical);
    out
}

fn canonical_feature(feature: ContourFeature, simplify_tolerance: f64) -> Option<ContourFeature> {
    if !feature.elevation.is_finite() {
        return None;
    }
    let mut coords: Vec<Position> = feature
        .coordinates
        .iter()
        .filter(|p| p[0].is_finite() && p[1].is_finite())
        .map(|p| [round_coord(p[0]), round_coord(p[1])])
        .collect();
    coords.dedup();

    let closed = coords.len() > 2 && coords.first() == coords.last();
    if closed {
        coords.pop();
        orient_ring(&mut coords);
        coords.push(coords[0]);
    } else if coords.last().map(|l| cmp_position(l, &coords[0]).is_lt()) == Some(true) {
        coords.reverse();
    }

    if simplify_tolerance > 0.0 {
        coords = douglas_peucker(&coords, simplify_tolerance);
    }

    let distinct = if closed { coords.len() - 1 } else { coords.len() };
    // A ring needs three distinct vertices to enclose anything.
    if distinct < 2 || (closed && distinct < 3) {
        return None;
    }

    ContourFeature::new(round_coord(feature.elevation), coords)
}

fn cmp_position(a: &Position, b: &Position) -> Ordering {
    a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1]))
}

/// Make an open ring counter-clockwise and start it at its smallest vertex.
fn orient_ring(open: &mut Vec<Position>) {
    let start = open
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| cmp_position(a, b))
        .map(|(i, _)| i)
        .unwrap_or(0);
    open.rotate_left(start);

    let area = signed_area(open);
    // Zero-area rings have no winding; walk towards the smaller neighbour.
    let reverse = if area == 0.0 {
        match (open.get(1), open.last()) {
            (Some(next), Some(prev)) => cmp_position(prev, next).is_lt(),
            _ => false,
        }
    } else {
        area < 0.0
    };
    if reverse {
        open[1..].reverse();
    }
}

/// Douglas-Peucker line simplification; endpoints are always kept.
pub fn douglas_peucker(points: &[Position], tolerance: f64) -> Vec<Position> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    let mut stack = vec![(0, points.len() - 1)];
    while let Some((first, last)) = stack.pop() {
        if last <= first + 1 {
            continue;
        }
        let mut max_dist = 0.0;
        let mut index = first;
        for i in first + 1..last {
            let d = perpendicular_distance(points[i], points[first], points[last]);
            if d > max_dist {
                max_dist = d;
                index = i;
            }
        }
        if max_dist > tolerance {
            keep[index] = true;
            stack.push((first, index));
            stack.push((index, last));
        }
    }

    points
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(*p))
        .collect()
}

fn perpendicular_distance(p: Position, a: Position, b: Position) -> f64 {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    let len = dx.hypot(dy);
    if len == 0.0 {
        return (p[0] - a[0]).hypot(p[1] - a[1]);
    }
    ((p[0] - a[0]) * dy - (p[1] - a[1]) * dx).abs() / len
}

/// Lowest and highest elevation of a feature set.
pub fn elevation_range(features: &[ContourFeature]) -> Option<(f64, f64)> {
    features.iter().fold(None, |acc, f| match acc {
        None => Some((f.elevation, f.elevation)),
        Some((lo, hi)) => Some((lo.min(f.elevation), hi.max(f.elevation))),
    })
}

// ============================================================================
// GeoJSON
// ============================================================================

fn malformed(reason: String) -> EngineError {
    EngineError::ExternalTool {
        stage: StageKind::Contours,
        status: Some(0),
        diagnostics: format!("malformed contour output: {}", reason),
        timed_out: false,
    }
}

/// Read contour features from the contour tool's GeoJSON output.
///
/// LineString and MultiLineString geometries are accepted; each part of a
/// MultiLineString becomes its own feature. Z values are ignored.
pub fn parse_geojson_features(value: &Value, attribute_name: &str) -> Result<Vec<ContourFeature>> {
    let features = value
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing 'features' array".to_string()))?;

    let mut out = Vec::new();
    for (index, feature) in features.iter().enumerate() {
        let elevation = feature
            .get("properties")
            .and_then(|p| p.get(attribute_name))
            .and_then(Value::as_f64)
            .ok_or_else(|| malformed(format!("feature {} has no numeric '{}' property", index, attribute_name)))?;
        let Some(geometry) = feature.get("geometry").filter(|g| !g.is_null()) else {
            continue;
        };
        let kind = geometry.get("type").and_then(Value::as_str).unwrap_or("");
        let coords = geometry.get("coordinates");
        let lines: Vec<&Value> = match (kind, coords) {
            ("LineString", Some(c)) => vec![c],
            ("MultiLineString", Some(Value::Array(parts))) => parts.iter().collect(),
            _ => return Err(malformed(format!("feature {} has unsupported geometry '{}'", index, kind))),
        };
        for line in lines {
            let positions = parse_line(line).ok_or_else(|| malformed(format!("feature {} has invalid coordinates", index)))?;
            if let Some(f) = ContourFeature::new(elevation, positions) {
                out.push(f);
            }
        }
    }
    Ok(out)
}

fn parse_line(value: &Value) -> Option<Vec<Position>> {
    value
        .as_array()?
        .iter()
        .map(|p| {
            let p = p.as_array()?;
            Some([p.first()?.as_f64()?, p.get(1)?.as_f64()?])
        })
        .collect()
}

#[derive(Serialize)]
struct CrsName {
    name: String,
}

#[derive(Serialize)]
struct NamedCrs {
    #[serde(rename = "type")]
    kind: &'static str,
    properties: CrsName,
}

#[derive(Serialize)]
struct LineGeometry<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    coordinates: &'a [Position],
}

#[derive(Serialize)]
struct FeatureOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    properties: Map<String, Value>,
    bbox: [f64; 4],
    geometry: LineGeometry<'a>,
}

#[derive(Serialize)]
struct FeatureCollectionOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    crs: NamedCrs,
    features: Vec<FeatureOut<'a>>,
}

/// Serialize canonical features as a GeoJSON FeatureCollection in LV95.
///
/// Members are written in a fixed order and the output ends with a newline.
pub fn to_geojson_string(features: &[ContourFeature], attribute_name: &str) -> Result<String> {
    let collection = FeatureCollectionOut {
        kind: "FeatureCollection",
        crs: NamedCrs {
            kind: "name",
            properties: CrsName {
                name: format!("urn:ogc:def:crs:EPSG::{}", Crs::Lv95.epsg_code()),
            },
        },
        features: features
            .iter()
            .map(|f| {
                let mut properties = Map::new();
                properties.insert(attribute_name.to_string(), Value::from(f.elevation));
                FeatureOut {
                    kind: "Feature",
                    properties,
                    bbox: [f.bbox.xmin, f.bbox.ymin, f.bbox.xmax, f.bbox.ymax],
                    geometry: LineGeometry {
                        kind: "LineString",
                        coordinates: &f.coordinates,
                    },
                }
            })
            .collect(),
    };
    let mut text = serde_json::to_string(&collection)?;
    text.push('\n');
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(elevation: f64, coords: &[[f64; 2]]) -> ContourFeature {
        ContourFeature::new(elevation, coords.to_vec()).unwrap()
    }

    #[test]
    fn test_sorted_by_elevation_then_extent() {
        let features = vec![
            line(502.0, &[[10.0, 0.0], [11.0, 1.0]]),
            line(500.0, &[[5.0, 5.0], [6.0, 6.0]]),
            line(500.0, &[[1.0, 9.0], [2.0, 9.0]]),
            line(500.0, &[[1.0, 3.0], [2.0, 3.0]]),
        ];
        let out = canonicalize(features, 0.0);
        let keys: Vec<(f64, f64, f64)> = out.iter().map(|f| (f.elevation, f.bbox.xmin, f.bbox.ymin)).collect();
        assert_eq!(
            keys,
            vec![(500.0, 1.0, 3.0), (500.0, 1.0, 9.0), (500.0, 5.0, 5.0), (502.0, 10.0, 0.0)]
        );
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let a = vec![
            line(500.0, &[[1.0, 1.0], [3.0, 1.0]]),
            line(500.0, &[[1.0, 1.0], [2.0, 5.0]]),
            line(498.0, &[[7.0, 7.0], [8.0, 8.0]]),
        ];
        let mut b = a.clone();
        b.reverse();
        let sa = to_geojson_string(&canonicalize(a, 0.0), "elevation").unwrap();
        let sb = to_geojson_string(&canonicalize(b, 0.0), "elevation").unwrap();
        assert_eq!(sa, sb);
    }

    #[test]
    fn test_rounds_to_centimetres_and_normalizes_negative_zero() {
        let out = canonicalize(vec![line(-0.001, &[[2600000.123456, 1200000.987654], [2600001.0, 1200001.0]])], 0.0);
        assert_eq!(out[0].coordinates[0], [2600000.12, 1200000.99]);
        assert_eq!(out[0].elevation.to_bits(), 0.0f64.to_bits());
    }

    #[test]
    fn test_drops_degenerate_features() {
        let out = canonicalize(
            vec![
                line(1.0, &[[0.0, 0.0], [0.001, 0.001]]),
                line(1.0, &[[0.0, 0.0]]),
                line(1.0, &[[0.0, 0.0], [1.0, 0.0], [0.0, 0.0]]),
                line(1.0, &[[0.0, 0.0], [1.0, 0.0]]),
            ],
            0.0,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_closed_ring_starts_at_smallest_vertex() {
        let ring = line(10.0, &[[2.0, 2.0], [0.0, 2.0], [0.0, 0.0], [2.0, 0.0], [2.0, 2.0]]);
        let out = canonicalize(vec![ring], 0.0);
        assert_eq!(
            out[0].coordinates,
            vec![[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0], [0.0, 0.0]]
        );
    }

    fn wobbly_square() -> Vec<[f64; 2]> {
        vec![
            [2600000.0, 1200000.0],
            [2600050.0, 1200000.3],
            [2600100.0, 1200000.0],
            [2600100.0, 1200100.0],
            [2600050.0, 1200100.2],
            [2600000.0, 1200100.0],
        ]
    }

    fn closed(open: &[[f64; 2]]) -> Vec<[f64; 2]> {
        let mut ring = open.to_vec();
        ring.push(open[0]);
        ring
    }

    #[test]
    fn test_simplified_ring_ignores_start_vertex() {
        let open = wobbly_square();
        let mut shifted = open.clone();
        shifted.rotate_left(1);
        let a = canonicalize(vec![line(500.0, &closed(&open))], 1.0);
        let b = canonicalize(vec![line(500.0, &closed(&shifted))], 1.0);
        assert_eq!(a, b);
        assert_eq!(
            a[0].coordinates,
            vec![
                [2600000.0, 1200000.0],
                [2600100.0, 1200000.0],
                [2600100.0, 1200100.0],
                [2600000.0, 1200100.0],
                [2600000.0, 1200000.0]
            ]
        );
    }

    #[test]
    fn test_ring_direction_is_normalized() {
        let open = wobbly_square();
        let mut reversed = open.clone();
        reversed.reverse();
        for tolerance in [0.0, 1.0] {
            let fwd = canonicalize(vec![line(500.0, &closed(&open))], tolerance);
            let rev = canonicalize(vec![line(500.0, &closed(&reversed))], tolerance);
            assert_eq!(fwd, rev, "tolerance {tolerance}");
            assert!(signed_area(&fwd[0].coordinates) > 0.0);
        }
    }

    #[test]
    fn test_open_line_starts_at_smaller_endpoint() {
        let pts = vec![[2600100.0, 1200000.0], [2600050.0, 1200000.4], [2600000.0, 1200000.0]];
        let mut backwards = pts.clone();
        backwards.reverse();
        for tolerance in [0.0, 1.0] {
            let a = canonicalize(vec![line(500.0, &pts)], tolerance);
            let b = canonicalize(vec![line(500.0, &backwards)], tolerance);
            assert_eq!(a, b);
            assert_eq!(a[0].coordinates[0], [2600000.0, 1200000.0]);
        }
    }

    #[test]
    fn test_flat_ring_direction_is_normalized() {
        let flat = [[0.0, 0.0], [2.0, 0.0], [1.0, 0.0]];
        let mut reversed = flat.to_vec();
        reversed.reverse();
        let a = canonicalize(vec![line(1.0, &closed(&flat))], 0.0);
        let b = canonicalize(vec![line(1.0, &closed(&reversed))], 0.0);
        assert_eq!(a, b);
        assert_eq!(a[0].coordinates, vec![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [0.0, 0.0]]);
    }

    #[test]
    fn test_douglas_peucker_removes_near_collinear_points() {
        let pts = vec![[0.0, 0.0], [1.0, 0.01], [2.0, -0.01], [3.0, 0.0], [3.0, 5.0]];
        assert_eq!(douglas_peucker(&pts, 0.1), vec![[0.0, 0.0], [3.0, 0.0], [3.0, 5.0]]);
        assert_eq!(douglas_peucker(&pts, 0.0), pts);
    }

    #[test]
    fn test_parse_gdal_output() {
        let raw = json!({
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "properties": { "ID": 0, "elevation": 512.0 },
                  "geometry": { "type": "LineString", "coordinates": [[1.0, 2.0, 512.0], [3.0, 4.0, 512.0]] } },
                { "type": "Feature", "properties": { "ID": 1, "elevation": 514.0 },
                  "geometry": { "type": "MultiLineString", "coordinates": [[[0.0, 0.0], [1.0, 1.0]], [[5.0, 5.0], [6.0, 6.0]]] } }
            ]
        });
        let features = parse_geojson_features(&raw, "elevation").unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[0].coordinates, vec![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(elevation_range(&features), Some((512.0, 514.0)));
    }

    #[test]
    fn test_missing_elevation_is_rejected() {
        let raw = json!({ "features": [{ "properties": {}, "geometry": null }] });
        assert!(matches!(
            parse_geojson_features(&raw, "elevation"),
            Err(EngineError::ExternalTool { .. })
        ));
    }

    #[test]
    fn test_serialization_member_order() {
        let out = canonicalize(vec![line(500.0, &[[1.0, 2.0], [3.0, 4.5]])], 0.0);
        let text = to_geojson_string(&out, "hoehe").unwrap();
        assert_eq!(
            text,
            concat!(
                r#"{"type":"FeatureCollection","crs":{"type":"name","properties":{"name":"urn:ogc:def:crs:EPSG::2056"}},"#,
                r#""features":[{"type":"Feature","properties":{"hoehe":500.0},"bbox":[1.0,2.0,3.0,4.5],"#,
                r#""geometry":{"type":"LineString","coordinates":[[1.0,2.0],[3.0,4.5]]}}]}"#,
                "\n"
            )
        );
    }

    #[test]
    fn test_empty_collection_serializes() {
        let text = to_geojson_string(&[], "elevation").unwrap();
        assert!(text.contains(r#""features":[]"#));
        assert_eq!(elevation_range(&[]), None);
    }
}
