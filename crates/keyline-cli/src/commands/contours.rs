//! The `contours` command.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use keyline_engine::{
    AreaInput, CancellationToken, ContentAddressedCache, ContourParams, Crs, EngineConfig, GdalToolchain,
    HttpTileFetcher, Orchestrator, OrchestratorOptions, PipelineRequest, Resolution, StacCatalog,
};
use tracing::info;

use crate::error::CliError;

/// Arguments of `keyline contours`.
#[derive(Debug, Args)]
pub struct ContoursArgs {
    /// Area as a box: xmin,ymin,xmax,ymax
    #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true, conflicts_with = "geojson")]
    pub bbox: Option<[f64; 4]>,

    /// Area as a GeoJSON file (Polygon, MultiPolygon, Feature or FeatureCollection)
    #[arg(long, value_name = "FILE")]
    pub geojson: Option<PathBuf>,

    /// CRS of the area: lv95 or wgs84
    #[arg(long, default_value = "lv95", value_parser = parse_crs)]
    pub crs: Crs,

    /// Contour interval in metres
    #[arg(long, default_value_t = 1.0)]
    pub interval: f64,

    /// Source resolution: standard (2 m) or high (0.5 m)
    #[arg(long, default_value = "standard", value_parser = parse_resolution)]
    pub resolution: Resolution,

    /// Douglas-Peucker tolerance in metres (0 keeps every vertex)
    #[arg(long, default_value_t = 0.0)]
    pub simplify: f64,

    /// Name of the elevation property on each feature
    #[arg(long, default_value = "elevation")]
    pub attribute: String,

    /// Directory for contours.geojson and manifest.json; stdout when omitted
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Network timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

fn parse_bbox(s: &str) -> Result<[f64; 4], String> {
    let values: Vec<f64> = s
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("'{}': {}", v.trim(), e)))
        .collect::<Result<_, _>>()?;
    <[f64; 4]>::try_from(values).map_err(|v| format!("expected 4 comma-separated numbers, got {}", v.len()))
}

fn parse_crs(s: &str) -> Result<Crs, String> {
    Crs::parse(s).map_err(|e| e.to_string())
}

fn parse_resolution(s: &str) -> Result<Resolution, String> {
    Resolution::parse(s).map_err(|e| e.to_string())
}

impl ContoursArgs {
    fn area(&self) -> Result<AreaInput, CliError> {
        let geojson = match &self.geojson {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| CliError::Input {
                    path: path.clone(),
                    source,
                })?;
                let value = serde_json::from_str(&text)
                    .map_err(|e| CliError::Usage(format!("{} is not valid JSON: {}", path.display(), e)))?;
                Some(value)
            }
            None => None,
        };
        Ok(AreaInput::from_options(geojson, self.bbox)?)
    }

    fn params(&self) -> ContourParams {
        ContourParams {
            interval: self.interval,
            attribute_name: self.attribute.clone(),
            simplify_tolerance: self.simplify,
            resolution: self.resolution,
        }
    }
}

/// Run the pipeline once.
pub fn run(args: ContoursArgs, mut config: EngineConfig, cancel: CancellationToken) -> Result<(), CliError> {
    if let Some(secs) = args.timeout {
        config.download_timeout_secs = secs;
    }
    config.validate()?;

    let request = PipelineRequest {
        area: args.area()?,
        crs: args.crs,
        params: args.params(),
        output_dir: args.output.clone(),
    };

    let cache = Arc::new(ContentAddressedCache::open(&config.cache_root)?);
    info!(cache = %cache.root().display(), "Using cache");
    let orchestrator = Orchestrator::new(
        StacCatalog::new(&config.catalog_url, &config.collection, config.download_timeout())?,
        HttpTileFetcher::new(config.download_timeout())?,
        GdalToolchain::new(config.gdal.clone(), config.tool_timeout()),
        cache,
        OrchestratorOptions::from(&config),
    )?;

    let output = orchestrator.run(&request, &cancel)?;
    let manifest = &output.result.manifest;

    match &output.files {
        Some(files) => {
            eprintln!("Wrote {}", files.contours.display());
            eprintln!("Wrote {}", files.manifest.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(output.result.geojson.as_bytes())
                .map_err(|source| CliError::Input {
                    path: PathBuf::from("<stdout>"),
                    source,
                })?;
        }
    }
    eprintln!(
        "{} contour(s) from {} tile(s), interval {} m{}",
        manifest.contour_count,
        manifest.tiles.len(),
        manifest.parameters.interval,
        if output.cache_hit { " (cached)" } else { "" }
    );
    eprintln!("{}", manifest.attribution);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bbox() {
        assert_eq!(
            parse_bbox("2600000, 1200000,2601000,1201000").unwrap(),
            [2600000.0, 1200000.0, 2601000.0, 1201000.0]
        );
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("1,2,3,x").is_err());
    }

    #[test]
    fn test_geojson_file_is_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("area.geojson");
        fs::write(
            &path,
            r#"{"type":"Polygon","coordinates":[[[2600000,1200000],[2601000,1200000],[2601000,1201000],[2600000,1200000]]]}"#,
        )
        .unwrap();
        let args = ContoursArgs {
            bbox: None,
            geojson: Some(path),
            crs: Crs::Lv95,
            interval: 2.0,
            resolution: Resolution::Standard,
            simplify: 0.0,
            attribute: "elevation".into(),
            output: None,
            timeout: None,
        };
        assert!(matches!(args.area().unwrap(), AreaInput::GeoJson(_)));
        assert_eq!(args.params().interval, 2.0);
    }
}
