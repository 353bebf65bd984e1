//! Tile discovery against the swisstopo STAC catalog.
//!
//! The catalog is queried with a WGS84 bounding box (the catalog's required
//! CRS); tile footprints come back in LV95 so that coverage can be checked in
//! the canonical system. The WGS84 detour stays inside this module.
//!
//! ## Coverage
//!
//! [`TileCatalogClient::discover`] only returns when the union of tile
//! footprints covers the requested area: the footprints are unioned, the union
//! is subtracted from the area polygons, and any remainder above
//! [`COVERAGE_TOLERANCE_M2`] fails the call with
//! [`EngineError::IncompleteCoverage`].

use std::collections::BTreeMap;
use std::time::Duration;

use geo::{Area as _, BooleanOps, MultiPolygon};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::area::{Area, BBox, Position, LV95_BOUNDS};
use crate::params::Resolution;
use crate::swiss::Lv95Transform;
use crate::{EngineError, Result};

/// Swiss federal STAC API endpoint.
pub const STAC_API_URL: &str = "https://data.geo.admin.ch/api/stac/v0.9";

/// swissALTI3D collection identifier.
pub const SWISSALTI3D_COLLECTION: &str = "ch.swisstopo.swissalti3d";

/// Largest uncovered area (m²) still treated as full coverage.
pub const COVERAGE_TOLERANCE_M2: f64 = 0.01;

/// Maximum number of result pages read for one search.
pub const MAX_PAGES: usize = 50;

/// Identity of one source raster tile.
///
/// Ordering is by (collection, item, file), which is the order tiles are
/// returned in and recorded in manifests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileIdentity {
    /// Catalog collection identifier.
    pub collection_id: String,
    /// Catalog item identifier.
    pub item_id: String,
    /// Asset file name within the item.
    pub file_id: String,
    /// Expected SHA-256 hex digest (lowercase), when the catalog publishes one.
    pub checksum: Option<String>,
    /// Upstream update timestamp; changes when the tile is superseded.
    pub freshness: Option<String>,
}

impl TileIdentity {
    /// Normalise a catalog checksum into a plain SHA-256 hex digest.
    ///
    /// Accepts plain 64-character hex and SHA-256 multihash (`1220` prefix).
    /// Unknown formats yield `None`, and the download is then recorded with
    /// its computed digest instead of being verified.
    pub fn normalize_checksum(raw: &str) -> Option<String> {
        let raw = raw.trim().to_ascii_lowercase();
        if !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match raw.len() {
            64 => Some(raw),
            68 if raw.starts_with("1220") => Some(raw[4..].to_string()),
            _ => None,
        }
    }

    /// Short `collection/item/file` label for logs.
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.collection_id, self.item_id, self.file_id)
    }
}

/// A tile returned by the catalog: identity plus where to get it and what it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredTile {
    /// Tile identity (raw-cache key).
    pub identity: TileIdentity,
    /// Download URL.
    pub href: String,
    /// Footprint in LV95.
    pub footprint: BBox,
}

/// Raw catalog search, in the catalog's own CRS.
///
/// Implementations perform one query and report network trouble as
/// [`EngineError::CatalogUnavailable`]; they never retry.
pub trait CatalogSource: Send + Sync {
    /// Return all tiles whose footprint intersects `wgs84_bbox` at the given resolution.
    fn search(&self, wgs84_bbox: &BBox, resolution: Resolution) -> Result<Vec<DiscoveredTile>>;
}

/// Resolves the set of tiles needed to cover an area.
pub struct TileCatalogClient<S> {
    source: S,
}

impl<S: CatalogSource> TileCatalogClient<S> {
    /// Wrap a catalog source.
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Access the underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Discover the ordered, de-duplicated set of tiles covering `area`.
    ///
    /// Tiles whose footprint does not touch the area's bounding box are
    /// dropped. Fails with [`EngineError::IncompleteCoverage`] if the rest do
    /// not cover the area.
    pub fn discover(&self, area: &Area, resolution: Resolution) -> Result<Vec<DiscoveredTile>> {
        let query_bbox = area.wgs84_bbox()?;
        debug!(bbox = ?query_bbox.as_tuple(), gsd = resolution.gsd(), "Querying tile catalog");

        let found = self.source.search(&query_bbox, resolution)?;

        let area_bbox = area.bbox();
        let mut unique: BTreeMap<TileIdentity, DiscoveredTile> = BTreeMap::new();
        for tile in found {
            if tile.footprint.overlaps(&area_bbox) {
                unique.entry(tile.identity.clone()).or_insert(tile);
            }
        }
        let tiles: Vec<DiscoveredTile> = unique.into_values().collect();

        let footprints: Vec<BBox> = tiles.iter().map(|t| t.footprint).collect();
        let uncovered = uncovered_area(area, &footprints);
        if uncovered > COVERAGE_TOLERANCE_M2 {
            return Err(EngineError::IncompleteCoverage {
                tiles: tiles.len(),
                uncovered_m2: uncovered,
            });
        }

        info!(tiles = tiles.len(), "Discovered tiles covering the area");
        Ok(tiles)
    }
}

/// Area (m²) of `area` not inside any of `footprints`.
pub fn uncovered_area(area: &Area, footprints: &[BBox]) -> f64 {
    let covered = footprints.iter().fold(MultiPolygon::new(Vec::new()), |union, f| {
        union.union(&MultiPolygon::new(vec![f.to_rect().to_polygon()]))
    });
    area.to_multi_polygon().difference(&covered).unsigned_area()
}

// ============================================================================
// STAC client
// ============================================================================

/// HTTP client for the swisstopo STAC API.
#[derive(Debug)]
pub struct StacCatalog {
    base_url: String,
    collection: String,
    client: reqwest::blocking::Client,
}

impl StacCatalog {
    /// Create a client for `base_url` / `collection` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("keyline-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::CatalogUnavailable {
                reason: format!("cannot build HTTP client: {}", e),
                timed_out: false,
            })?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client,
        })
    }

    fn get_page(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .map_err(|e| EngineError::CatalogUnavailable {
                reason: format!("request to {} failed: {}", url, e),
                timed_out: e.is_timeout(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::CatalogUnavailable {
                reason: format!("HTTP {} from {}", status, url),
                timed_out: false,
            });
        }

        response.json::<Value>().map_err(|e| EngineError::CatalogUnavailable {
            reason: format!("malformed catalog response: {}", e),
            timed_out: e.is_timeout(),
        })
    }
}

impl CatalogSource for StacCatalog {
    fn search(&self, wgs84_bbox: &BBox, resolution: Resolution) -> Result<Vec<DiscoveredTile>> {
        let url = format!("{}/search", self.base_url);
        let bbox = format!(
            "{},{},{},{}",
            wgs84_bbox.xmin, wgs84_bbox.ymin, wgs84_bbox.xmax, wgs84_bbox.ymax
        );
        let query = [
            ("collections", self.collection.clone()),
            ("bbox", bbox),
            ("limit", "100".to_string()),
        ];
        let first = self.get_page(&url, &query)?;
        collect_pages(first, &self.collection, resolution, |next| self.get_page(next, &[]))
    }
}

/// Parse `first` and every page reachable through `next` links, up to
/// [`MAX_PAGES`] pages in total. `fetch` loads a page by URL.
pub fn collect_pages<F>(
    first: Value,
    collection: &str,
    resolution: Resolution,
    mut fetch: F,
) -> Result<Vec<DiscoveredTile>>
where
    F: FnMut(&str) -> Result<Value>,
{
    let mut page = first;
    let mut tiles = Vec::new();
    for parsed in 1..=MAX_PAGES {
        tiles.extend(parse_feature_collection(&page, collection, resolution)?);
        let next = match next_link(&page) {
            Some(next) => next,
            None => return Ok(tiles),
        };
        if parsed == MAX_PAGES {
            break;
        }
        debug!(url = %next, page = parsed + 1, "Following catalog pagination");
        page = fetch(&next)?;
    }
    warn!(pages = MAX_PAGES, "Stopped following catalog pagination");
    Ok(tiles)
}

fn next_link(page: &Value) -> Option<String> {
    page.get("links")?
        .as_array()?
        .iter()
        .find(|l| l.get("rel").and_then(Value::as_str) == Some("next"))?
        .get("href")?
        .as_str()
        .map(str::to_string)
}

/// Parse a STAC ItemCollection into tiles matching `resolution`.
///
/// Items without a GeoTIFF asset at the requested resolution are skipped.
pub fn parse_feature_collection(
    page: &Value,
    default_collection: &str,
    resolution: Resolution,
) -> Result<Vec<DiscoveredTile>> {
    let features = page
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::CatalogUnavailable {
            reason: "malformed catalog response: missing 'features' array".to_string(),
            timed_out: false,
        })?;
    Ok(features
        .iter()
        .filter_map(|item| parse_item(item, default_collection, resolution))
        .collect())
}

fn parse_item(item: &Value, default_collection: &str, resolution: Resolution) -> Option<DiscoveredTile> {
    let item_id = item.get("id")?.as_str()?.to_string();
    let collection_id = item
        .get("collection")
        .and_then(Value::as_str)
        .unwrap_or(default_collection)
        .to_string();
    let properties = item.get("properties");
    let freshness = properties
        .and_then(|p| p.get("updated").or_else(|| p.get("datetime")))
        .and_then(Value::as_str)
        .map(str::to_string);

    // serde_json::Map iterates keys in sorted order, so the pick is stable.
    let assets = item.get("assets")?.as_object()?;
    for (key, asset) in assets {
        if !is_geotiff(key, asset) || !matches_gsd(key, asset, resolution) {
            continue;
        }
        let href = asset.get("href")?.as_str()?.to_string();
        let checksum = match asset.get("file:checksum").and_then(Value::as_str) {
            Some(raw) => {
                let normalized = TileIdentity::normalize_checksum(raw);
                if normalized.is_none() {
                    warn!(item = %item_id, checksum = raw, "Unrecognised checksum format; tile will not be verified");
                }
                normalized
            }
            None => None,
        };
        let file_id = href
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(key)
            .to_string();
        let footprint = footprint_of(item, &item_id)?;
        return Some(DiscoveredTile {
            identity: TileIdentity {
                collection_id,
                item_id,
                file_id,
                checksum,
                freshness,
            },
            href,
            footprint,
        });
    }
    None
}

fn is_geotiff(key: &str, asset: &Value) -> bool {
    let media = asset.get("type").and_then(Value::as_str).unwrap_or("");
    media.to_ascii_lowercase().contains("tiff") || key.ends_with(".tif")
}

fn matches_gsd(key: &str, asset: &Value, resolution: Resolution) -> bool {
    let declared = asset
        .get("gsd")
        .or_else(|| asset.get("eo:gsd"))
        .and_then(Value::as_f64);
    match declared {
        Some(gsd) => (gsd - resolution.gsd()).abs() < 1e-9,
        // swissALTI3D asset names embed the GSD: ..._2_2056_5728.tif / ..._0.5_2056_5728.tif
        None => {
            let tag = if resolution == Resolution::High { "_0.5_" } else { "_2_" };
            key.contains(tag)
        }
    }
}

/// LV95 footprint of an item: `proj:bbox`, else the kilometre grid encoded in
/// the id, else the envelope of the projected WGS84 bbox.
fn footprint_of(item: &Value, item_id: &str) -> Option<BBox> {
    let proj_bbox = item
        .get("properties")
        .and_then(|p| p.get("proj:bbox"))
        .and_then(Value::as_array)
        .and_then(|a| {
            let v: Vec<f64> = a.iter().filter_map(Value::as_f64).collect();
            (v.len() == 4).then(|| BBox::new(v[0], v[1], v[2], v[3]).ok()).flatten()
        });
    if proj_bbox.is_some() {
        return proj_bbox;
    }
    if let Some(grid) = footprint_from_item_id(item_id) {
        return Some(grid);
    }

    let wgs: Vec<f64> = item.get("bbox")?.as_array()?.iter().filter_map(Value::as_f64).collect();
    if wgs.len() != 4 {
        return None;
    }
    let transform = match Lv95Transform::new() {
        Ok(t) => t,
        Err(e) => {
            warn!(item = %item_id, error = %e, "Cannot project item bbox");
            return None;
        }
    };
    let corners: Vec<Position> = [(wgs[0], wgs[1]), (wgs[2], wgs[1]), (wgs[2], wgs[3]), (wgs[0], wgs[3])]
        .iter()
        .filter_map(|&(lon, lat)| transform.to_lv95(lon, lat).ok().map(|(e, n)| [e, n]))
        .collect();
    if corners.len() != 4 {
        return None;
    }
    BBox::enclosing(&corners)
}

/// Parse `..._EEEE-NNNN` (kilometre grid) from an item id.
pub fn footprint_from_item_id(item_id: &str) -> Option<BBox> {
    let suffix = item_id.rsplit('_').next()?;
    let (e, n) = suffix.split_once('-')?;
    if e.len() != 4 || n.len() != 4 {
        return None;
    }
    let e: f64 = e.parse::<u32>().ok()? as f64 * 1000.0;
    let n: f64 = n.parse::<u32>().ok()? as f64 * 1000.0;
    let bbox = BBox::new(e, n, e + 1000.0, n + 1000.0).ok()?;
    LV95_BOUNDS.overlaps(&bbox).then_some(bbox)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::{normalize, AreaInput, Crs};
    use serde_json::json;

    fn km_tile(e: u32, n: u32) -> DiscoveredTile {
        let item_id = format!("swissalti3d_2019_{}-{}", e, n);
        DiscoveredTile {
            identity: TileIdentity {
                collection_id: SWISSALTI3D_COLLECTION.to_string(),
                item_id: item_id.clone(),
                file_id: format!("{}_2_2056_5728.tif", item_id),
                checksum: None,
                freshness: Some("2020-01-01T00:00:00Z".to_string()),
            },
            href: format!("https://example.invalid/{}.tif", item_id),
            footprint: footprint_from_item_id(&item_id).unwrap(),
        }
    }

    struct StaticSource(Vec<DiscoveredTile>);

    impl CatalogSource for StaticSource {
        fn search(&self, _: &BBox, _: Resolution) -> Result<Vec<DiscoveredTile>> {
            Ok(self.0.clone())
        }
    }

    fn area(bbox: [f64; 4]) -> Area {
        normalize(&AreaInput::BBox(bbox), Crs::Lv95).unwrap()
    }

    #[test]
    fn test_checksum_normalisation() {
        let hex = "ab".repeat(32);
        assert_eq!(TileIdentity::normalize_checksum(&hex), Some(hex.clone()));
        assert_eq!(TileIdentity::normalize_checksum(&format!("1220{}", hex.to_uppercase())), Some(hex));
        assert_eq!(TileIdentity::normalize_checksum("md5:abc"), None);
        assert_eq!(TileIdentity::normalize_checksum("1234"), None);
    }

    #[test]
    fn test_footprint_from_item_id() {
        let b = footprint_from_item_id("swissalti3d_2019_2600-1200").unwrap();
        assert_eq!(b.as_tuple(), (2_600_000.0, 1_200_000.0, 2_601_000.0, 1_201_000.0));
        assert!(footprint_from_item_id("swissalti3d_2019").is_none());
        assert!(footprint_from_item_id("x_0001-0001").is_none());
    }

    #[test]
    fn test_single_tile_covers_matching_box() {
        let client = TileCatalogClient::new(StaticSource(vec![km_tile(2600, 1200)]));
        let tiles = client
            .discover(&area([2600000.0, 1200000.0, 2601000.0, 1201000.0]), Resolution::Standard)
            .unwrap();
        assert_eq!(tiles.len(), 1);
    }

    #[test]
    fn test_four_tiles_cover_straddling_box_and_are_sorted() {
        let client = TileCatalogClient::new(StaticSource(vec![
            km_tile(2601, 1201),
            km_tile(2600, 1200),
            km_tile(2601, 1200),
            km_tile(2600, 1201),
            km_tile(2600, 1200),
            km_tile(2650, 1250),
        ]));
        let tiles = client
            .discover(&area([2600500.0, 1200500.0, 2601500.0, 1201500.0]), Resolution::Standard)
            .unwrap();
        let ids: Vec<&str> = tiles.iter().map(|t| t.identity.item_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "swissalti3d_2019_2600-1200",
                "swissalti3d_2019_2600-1201",
                "swissalti3d_2019_2601-1200",
                "swissalti3d_2019_2601-1201",
            ]
        );
    }

    #[test]
    fn test_missing_tile_is_incomplete_coverage() {
        let client = TileCatalogClient::new(StaticSource(vec![
            km_tile(2600, 1200),
            km_tile(2601, 1200),
            km_tile(2600, 1201),
        ]));
        let err = client
            .discover(&area([2600500.0, 1200500.0, 2601500.0, 1201500.0]), Resolution::Standard)
            .unwrap_err();
        match err {
            EngineError::IncompleteCoverage { tiles, uncovered_m2 } => {
                assert_eq!(tiles, 3);
                approx::assert_abs_diff_eq!(uncovered_m2, 250_000.0, epsilon = COVERAGE_TOLERANCE_M2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_catalog_is_incomplete_coverage() {
        let client = TileCatalogClient::new(StaticSource(vec![]));
        let err = client
            .discover(&area([2600000.0, 1200000.0, 2601000.0, 1201000.0]), Resolution::Standard)
            .unwrap_err();
        assert!(matches!(err, EngineError::IncompleteCoverage { tiles: 0, .. }));
    }

    #[test]
    fn test_gap_outside_polygon_is_not_counted() {
        // Triangle in the lower-left half of the box; the upper-right tile is absent
        // and the triangle does not reach into it.
        let triangle = json!({
            "type": "Polygon",
            "coordinates": [[
                [2600500.0, 1200500.0],
                [2601400.0, 1200500.0],
                [2600500.0, 1201400.0],
                [2600500.0, 1200500.0]
            ]]
        });
        let area = normalize(&AreaInput::GeoJson(triangle), Crs::Lv95).unwrap();
        let footprints = vec![
            km_tile(2600, 1200).footprint,
            km_tile(2601, 1200).footprint,
            km_tile(2600, 1201).footprint,
        ];
        approx::assert_abs_diff_eq!(uncovered_area(&area, &footprints), 0.0, epsilon = COVERAGE_TOLERANCE_M2);
    }

    #[test]
    fn test_gap_inside_hole_is_not_counted() {
        // The upper-right tile is absent; part of its quarter is a hole in the area.
        let with_hole = json!({
            "type": "Polygon",
            "coordinates": [
                [[2600500.0, 1200500.0], [2601500.0, 1200500.0], [2601500.0, 1201500.0], [2600500.0, 1201500.0], [2600500.0, 1200500.0]],
                [[2601100.0, 1201100.0], [2601400.0, 1201100.0], [2601400.0, 1201400.0], [2601100.0, 1201400.0], [2601100.0, 1201100.0]]
            ]
        });
        let area = normalize(&AreaInput::GeoJson(with_hole), Crs::Lv95).unwrap();
        let footprints = vec![
            km_tile(2600, 1200).footprint,
            km_tile(2601, 1200).footprint,
            km_tile(2600, 1201).footprint,
        ];
        approx::assert_abs_diff_eq!(
            uncovered_area(&area, &footprints),
            250_000.0 - 90_000.0,
            epsilon = COVERAGE_TOLERANCE_M2
        );
    }

    fn stac_item(id: &str, extra_properties: Value) -> Value {
        let mut properties = json!({ "updated": "2021-03-02T10:00:00Z" });
        if let (Some(p), Some(extra)) = (properties.as_object_mut(), extra_properties.as_object()) {
            p.extend(extra.clone());
        }
        json!({
            "id": id,
            "bbox": [7.4386, 46.9510, 7.4518, 46.9601],
            "properties": properties,
            "assets": {
                format!("{}_2_2056_5728.tif", id): {
                    "href": format!("https://data.geo.admin.ch/a/{}_2_2056_5728.tif", id),
                    "type": "image/tiff; application=geotiff"
                }
            }
        })
    }

    #[test]
    fn test_pages_are_followed_through_next_links() {
        let first = json!({
            "features": [
                stac_item("swissalti3d_2019_2600-1200", json!({})),
                { "id": "no-assets", "properties": {} }
            ],
            "links": [
                { "rel": "self", "href": "https://stac.invalid/search" },
                { "rel": "next", "href": "https://stac.invalid/search?page=2" }
            ]
        });
        let second = json!({
            "features": [
                stac_item("swissalti3d_2019_2601-1200", json!({ "proj:bbox": [2601000.0, 1200000.0, 2602000.0, 1201000.0] })),
                stac_item("swissalti3d_2019_special", json!({}))
            ],
            "links": []
        });

        let mut requested = Vec::new();
        let tiles = collect_pages(first, SWISSALTI3D_COLLECTION, Resolution::Standard, |url| {
            requested.push(url.to_string());
            Ok(second.clone())
        })
        .unwrap();

        assert_eq!(requested, vec!["https://stac.invalid/search?page=2".to_string()]);
        let ids: Vec<&str> = tiles.iter().map(|t| t.identity.item_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["swissalti3d_2019_2600-1200", "swissalti3d_2019_2601-1200", "swissalti3d_2019_special"]
        );
        assert_eq!(tiles[0].identity.collection_id, SWISSALTI3D_COLLECTION);
        assert_eq!(tiles[1].footprint.as_tuple(), (2_601_000.0, 1_200_000.0, 2_602_000.0, 1_201_000.0));

        // No grid in the id and no proj:bbox: the WGS84 bbox is projected.
        let projected = tiles[2].footprint;
        assert!((projected.xmin - 2_600_000.0).abs() < 30.0, "{:?}", projected);
        assert!((projected.ymin - 1_200_000.0).abs() < 30.0, "{:?}", projected);
        assert!((projected.xmax - 2_601_000.0).abs() < 30.0, "{:?}", projected);
    }

    #[test]
    fn test_pagination_stops_at_page_limit() {
        let page = |n: usize| {
            json!({
                "features": [stac_item(&format!("swissalti3d_2019_{}-1200", 2600 + n), json!({}))],
                "links": [{ "rel": "next", "href": format!("https://stac.invalid/search?page={}", n + 1) }]
            })
        };
        let mut fetches = 0;
        let tiles = collect_pages(page(0), SWISSALTI3D_COLLECTION, Resolution::Standard, |_| {
            fetches += 1;
            Ok(page(fetches))
        })
        .unwrap();
        assert_eq!(fetches, MAX_PAGES - 1);
        assert_eq!(tiles.len(), MAX_PAGES);
    }

    #[test]
    fn test_failed_next_page_fails_the_search() {
        let first = json!({
            "features": [stac_item("swissalti3d_2019_2600-1200", json!({}))],
            "links": [{ "rel": "next", "href": "https://stac.invalid/search?page=2" }]
        });
        let err = collect_pages(first, SWISSALTI3D_COLLECTION, Resolution::Standard, |url| {
            Err(EngineError::CatalogUnavailable {
                reason: format!("HTTP 503 from {}", url),
                timed_out: false,
            })
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::CatalogUnavailable { .. }));
    }

    #[test]
    fn test_parse_stac_items() {
        let checksum = format!("1220{}", "cd".repeat(32));
        let page = json!({
            "type": "FeatureCollection",
            "features": [{
                "id": "swissalti3d_2019_2600-1200",
                "collection": "ch.swisstopo.swissalti3d",
                "bbox": [7.4386, 46.9510, 7.4518, 46.9601],
                "properties": { "datetime": "2019-01-01T00:00:00Z", "updated": "2021-03-02T10:00:00Z" },
                "assets": {
                    "swissalti3d_2019_2600-1200_0.5_2056_5728.tif": {
                        "href": "https://data.geo.admin.ch/a/swissalti3d_2019_2600-1200_0.5_2056_5728.tif",
                        "type": "image/tiff; application=geotiff",
                        "eo:gsd": 0.5
                    },
                    "swissalti3d_2019_2600-1200_2_2056_5728.tif": {
                        "href": "https://data.geo.admin.ch/a/swissalti3d_2019_2600-1200_2_2056_5728.tif",
                        "type": "image/tiff; application=geotiff",
                        "eo:gsd": 2.0,
                        "file:checksum": checksum
                    }
                }
            }],
            "links": []
        });
        let tiles = parse_feature_collection(&page, SWISSALTI3D_COLLECTION, Resolution::Standard).unwrap();
        assert_eq!(tiles.len(), 1);
        let t = &tiles[0];
        assert_eq!(t.identity.file_id, "swissalti3d_2019_2600-1200_2_2056_5728.tif");
        assert_eq!(t.identity.checksum.as_deref(), Some("cd".repeat(32).as_str()));
        assert_eq!(t.identity.freshness.as_deref(), Some("2021-03-02T10:00:00Z"));
        assert_eq!(t.footprint.as_tuple(), (2_600_000.0, 1_200_000.0, 2_601_000.0, 1_201_000.0));

        let high = parse_feature_collection(&page, SWISSALTI3D_COLLECTION, Resolution::High).unwrap();
        assert_eq!(high[0].identity.checksum, None);
        assert!(high[0].identity.file_id.contains("_0.5_"));
    }

    #[test]
    fn test_malformed_page_is_catalog_unavailable() {
        let err = parse_feature_collection(&json!({"type": "oops"}), SWISSALTI3D_COLLECTION, Resolution::Standard)
            .unwrap_err();
        assert!(matches!(err, EngineError::CatalogUnavailable { .. }));
    }
}
