//! Derived-artifact cache keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::area::Area;
use crate::catalog::TileIdentity;
use crate::params::ContourParams;
use crate::Result;

/// Bumped whenever the derived artifact layout or the key material changes.
const KEY_SCHEMA_VERSION: u32 = 1;

/// SHA-256 over the canonical area geometry, the processing parameters and
/// the sorted contributing tile checksums.
///
/// The material is serialized as JSON with sorted object keys, so argument
/// order and incidental formatting do not affect the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Compute the key for one pipeline request.
    pub fn derive(area: &Area, params: &ContourParams, tiles: &[TileIdentity]) -> Result<Self> {
        let mut tile_material: Vec<String> = tiles.iter().map(tile_material).collect();
        tile_material.sort();
        tile_material.dedup();

        let material = serde_json::json!({
            "area": area.to_geojson(),
            "params": params.canonical_json(),
            "tiles": tile_material,
            "version": KEY_SCHEMA_VERSION,
        });
        let text = serde_json::to_string(&material)?;
        Ok(CacheKey(hex::encode(Sha256::digest(text.as_bytes()))))
    }

    /// Wrap an existing key string (e.g. a cache directory name).
    ///
    /// Returns `None` unless the string is 64 lowercase hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
        valid.then(|| CacheKey(s.to_string()))
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tiles without a published checksum fall back to identity and freshness.
fn tile_material(tile: &TileIdentity) -> String {
    match &tile.checksum {
        Some(sha) => sha.clone(),
        None => format!("{}@{}", tile.label(), tile.freshness.as_deref().unwrap_or("")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::{normalize, AreaInput, Crs};
    use serde_json::json;

    fn tile(item: &str, checksum: &str) -> TileIdentity {
        TileIdentity {
            collection_id: "c".into(),
            item_id: item.into(),
            file_id: format!("{item}.tif"),
            checksum: Some(checksum.into()),
            freshness: Some("2021-01-01T00:00:00Z".into()),
        }
    }

    fn square() -> Area {
        normalize(&AreaInput::BBox([2600000.0, 1200000.0, 2601000.0, 1201000.0]), Crs::Lv95).unwrap()
    }

    #[test]
    fn test_key_ignores_tile_order() {
        let params = ContourParams::with_interval(2.0);
        let a = CacheKey::derive(&square(), &params, &[tile("a", "11"), tile("b", "22")]).unwrap();
        let b = CacheKey::derive(&square(), &params, &[tile("b", "22"), tile("a", "11")]).unwrap();
        assert_eq!(a, b);
        assert!(CacheKey::parse(a.as_str()).is_some());
    }

    #[test]
    fn test_key_ignores_input_formatting() {
        // Same square written as GeoJSON, clockwise, starting at another corner.
        let geojson = json!({
            "type": "Polygon",
            "coordinates": [[
                [2601000.0, 1201000.0], [2601000.0, 1200000.0], [2600000.0, 1200000.0],
                [2600000.0, 1201000.0], [2601000.0, 1201000.0]
            ]]
        });
        let other = normalize(&AreaInput::GeoJson(geojson), Crs::Lv95).unwrap();
        let params = ContourParams::with_interval(2.0);
        let tiles = [tile("a", "11")];
        assert_eq!(
            CacheKey::derive(&square(), &params, &tiles).unwrap(),
            CacheKey::derive(&other, &params, &tiles).unwrap()
        );
    }

    #[test]
    fn test_key_changes_with_params_and_checksums() {
        let tiles = [tile("a", "11")];
        let base = CacheKey::derive(&square(), &ContourParams::with_interval(2.0), &tiles).unwrap();
        let interval = CacheKey::derive(&square(), &ContourParams::with_interval(1.0), &tiles).unwrap();
        let checksum = CacheKey::derive(&square(), &ContourParams::with_interval(2.0), &[tile("a", "12")]).unwrap();
        assert_ne!(base, interval);
        assert_ne!(base, checksum);
    }

    #[test]
    fn test_parse_rejects_non_keys() {
        assert!(CacheKey::parse(".tmp-abc").is_none());
        assert!(CacheKey::parse(&"A".repeat(64)).is_none());
    }
}
