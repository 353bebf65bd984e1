//! WGS84 ⇄ Swiss LV95 (EPSG:2056) coordinate transforms.
//!
//! Transforms go through [`proj4rs`] with the EPSG:2056 definition: Swiss
//! oblique Mercator (`somerc`) on the Bessel 1841 ellipsoid with the published
//! three-parameter shift to WGS84. The NTv2 / REFRAME grid is not applied, so
//! results match PROJ with the same definition and differ from the rigorous
//! swisstopo grid transform by up to a few decimetres in places.
//!
//! [`Lv95Transform::to_lv95_checked`] transforms a point forward and back and
//! rejects it when the round trip lands further than
//! [`REPROJECTION_TOLERANCE_M`] from the input.

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::{EngineError, Result};

/// Maximum accepted forward/inverse round-trip distance, in metres.
pub const REPROJECTION_TOLERANCE_M: f64 = 0.01;

/// LV95 false easting.
pub const FALSE_EASTING: f64 = 2_600_000.0;

/// LV95 false northing.
pub const FALSE_NORTHING: f64 = 1_200_000.0;

/// EPSG:2056 (CH1903+ / LV95).
pub const LV95_PROJ: &str = "+proj=somerc +lat_0=46.9524055555556 +lon_0=7.43958333333333 +k_0=1 \
     +x_0=2600000 +y_0=1200000 +ellps=bessel +towgs84=674.374,15.056,405.346,0,0,0,0 +units=m +no_defs";

/// EPSG:4326 (WGS84 geographic).
pub const WGS84_PROJ: &str = "+proj=longlat +ellps=WGS84 +datum=WGS84 +no_defs";

// Mean Earth radius, used only to express angular residuals in metres.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A pair of initialised projections for WGS84 ⇄ LV95.
pub struct Lv95Transform {
    wgs84: Proj,
    lv95: Proj,
}

impl Lv95Transform {
    /// Parse both projection definitions.
    pub fn new() -> Result<Self> {
        let parse = |definition: &str| {
            Proj::from_proj_string(definition)
                .map_err(|e| EngineError::Config(format!("invalid projection '{}': {}", definition, e)))
        };
        Ok(Self {
            wgs84: parse(WGS84_PROJ)?,
            lv95: parse(LV95_PROJ)?,
        })
    }

    /// WGS84 longitude/latitude (degrees) on the ellipsoid to LV95 easting/northing.
    pub fn to_lv95(&self, lon: f64, lat: f64) -> Result<(f64, f64)> {
        self.to_lv95_at(lon, lat, 0.0)
    }

    /// As [`Self::to_lv95`] for a point at ellipsoidal height `h` metres.
    pub fn to_lv95_at(&self, lon: f64, lat: f64, h: f64) -> Result<(f64, f64)> {
        if !lon.is_finite() || !lat.is_finite() || lat.abs() >= 90.0 {
            return Err(EngineError::Reprojection {
                x: lon,
                y: lat,
                reason: "not a valid WGS84 position".to_string(),
            });
        }
        let mut point = (lon.to_radians(), lat.to_radians(), h);
        transform(&self.wgs84, &self.lv95, &mut point).map_err(|e| EngineError::Reprojection {
            x: lon,
            y: lat,
            reason: e.to_string(),
        })?;
        Ok((point.0, point.1))
    }

    /// LV95 easting/northing to WGS84 longitude/latitude (degrees).
    pub fn to_wgs84(&self, east: f64, north: f64) -> Result<(f64, f64)> {
        let mut point = (east, north, 0.0);
        transform(&self.lv95, &self.wgs84, &mut point).map_err(|e| EngineError::Reprojection {
            x: east,
            y: north,
            reason: e.to_string(),
        })?;
        Ok((point.0.to_degrees(), point.1.to_degrees()))
    }

    /// Transform to LV95 and verify that the inverse lands back on the input.
    ///
    /// The residual is the ground distance between `(lon, lat)` and the
    /// inverse of the returned point. This catches points where the transform
    /// does not converge; it says nothing about the accuracy of the datum.
    pub fn to_lv95_checked(&self, lon: f64, lat: f64) -> Result<(f64, f64)> {
        let (east, north) = self.to_lv95(lon, lat)?;
        let (back_lon, back_lat) = self.to_wgs84(east, north)?;
        let residual = ground_distance(lon, lat, back_lon, back_lat);
        if !residual.is_finite() || residual > REPROJECTION_TOLERANCE_M {
            return Err(EngineError::Reprojection {
                x: lon,
                y: lat,
                reason: format!(
                    "round-trip residual {:.4} m exceeds tolerance {} m",
                    residual, REPROJECTION_TOLERANCE_M
                ),
            });
        }
        Ok((east, north))
    }
}

/// Equirectangular distance in metres; exact enough at centimetre scale.
fn ground_distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let mean_lat = ((lat1 + lat2) / 2.0).to_radians();
    let dx = (lon2 - lon1).to_radians() * mean_lat.cos() * EARTH_RADIUS_M;
    let dy = (lat2 - lat1).to_radians() * EARTH_RADIUS_M;
    dx.hypot(dy)
}
