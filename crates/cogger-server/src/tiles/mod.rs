//! Slippy-map tile rendering over stored artifacts
//!
//! Serves 256x256 RGBA PNG tiles straight out of cloud-optimized artifacts.
//! Parsed headers are cached with a TTL; per request only the blocks a tile
//! actually touches are fetched with ranged reads, decoded once, and sampled
//! nearest-neighbour through the UTM projection.

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cog::geo::{self, UtmZone};
use crate::cog::reader::{decode_tile, CogHeader};
use crate::cog::{CogError, HEADER_PREFIX_LEN};
use crate::storage::{ObjectStore, StorageError};

/// Output tile edge length in pixels
pub const TILE_PIXELS: u32 = 256;

/// Below this zoom a whole scene covers a handful of pixels; serve an empty
/// tile instead of opening the artifact
pub const MIN_TILE_ZOOM: u32 = 4;

/// Default number of cached artifact headers
pub const DEFAULT_HEADER_CACHE_CAPACITY: usize = 128;

/// Default lifetime of a cached header
pub const DEFAULT_HEADER_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum TileError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("tile coordinates out of range")]
    BadCoordinates,

    #[error("artifact cannot be served: {0}")]
    Unsupported(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl From<StorageError> for TileError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => TileError::NotFound(key),
            StorageError::Backend(msg) => TileError::Backend(msg),
        }
    }
}

impl From<CogError> for TileError {
    fn from(err: CogError) -> Self {
        TileError::Unsupported(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct TileServiceConfig {
    pub header_cache_capacity: usize,
    pub header_cache_ttl: Duration,
}

impl Default for TileServiceConfig {
    fn default() -> Self {
        Self {
            header_cache_capacity: DEFAULT_HEADER_CACHE_CAPACITY,
            header_cache_ttl: DEFAULT_HEADER_CACHE_TTL,
        }
    }
}

struct CachedHeader {
    header: Arc<CogHeader>,
    fetched_at: Instant,
}

/// Renders map tiles from artifacts in object storage
pub struct TileService {
    objects: Arc<dyn ObjectStore>,
    headers: Mutex<HashMap<String, CachedHeader>>,
    config: TileServiceConfig,
}

impl TileService {
    pub fn new(objects: Arc<dyn ObjectStore>, config: TileServiceConfig) -> Self {
        Self {
            objects,
            headers: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Fetch and parse an artifact header, consulting the TTL cache first
    pub async fn header(&self, bucket: &str, key: &str) -> Result<Arc<CogHeader>, TileError> {
        let cache_key = format!("{bucket}/{key}");

        {
            let cache = self.headers.lock().await;
            if let Some(cached) = cache.get(&cache_key) {
                if cached.fetched_at.elapsed() < self.config.header_cache_ttl {
                    return Ok(Arc::clone(&cached.header));
                }
            }
        }

        let prefix = self
            .objects
            .read_range(bucket, key, 0, HEADER_PREFIX_LEN)
            .await?;
        let header = Arc::new(crate::cog::reader::parse_header(&prefix)?);

        let mut cache = self.headers.lock().await;
        if cache.len() >= self.config.header_cache_capacity {
            // Drop the stalest entry rather than growing without bound
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, v)| v.fetched_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            cache_key,
            CachedHeader {
                header: Arc::clone(&header),
                fetched_at: Instant::now(),
            },
        );

        Ok(header)
    }

    /// Render one slippy-map tile as PNG bytes
    pub async fn render(
        &self,
        bucket: &str,
        key: &str,
        z: u32,
        x: u32,
        y: u32,
    ) -> Result<Vec<u8>, TileError> {
        if z > 24 || x >= (1u32 << z.min(24)) || y >= (1u32 << z.min(24)) {
            return Err(TileError::BadCoordinates);
        }
        if z < MIN_TILE_ZOOM {
            return empty_tile();
        }

        let header = self.header(bucket, key).await?;
        let zone = UtmZone::from_epsg(header.georef.epsg)
            .ok_or_else(|| TileError::Unsupported(format!("EPSG:{}", header.georef.epsg)))?;

        let (west, south, east, north) = geo::tile_bounds(z, x, y);
        let (fw, fs, fe, fn_) = header
            .georef
            .geographic_bounds(header.full().width, header.full().height)
            .map_err(TileError::from)?;
        if east < fw || west > fe || north < fs || south > fn_ {
            return empty_tile();
        }

        // Ground size of one output pixel decides the pyramid level
        let (we, wn) = zone.from_wgs84(west, north);
        let (ee, sn) = zone.from_wgs84(east, south);
        let span = ((ee - we).abs()).max((wn - sn).abs());
        let level = header.level_for_resolution(span / f64::from(TILE_PIXELS));
        let ifd = &header.ifds[level];
        let resolution = header.level_resolution(level);

        debug!(bucket, key, z, x, y, level, "rendering tile");

        // Latitude is non-linear across the tile; precompute per-row values
        let n = f64::from(1u32 << z);
        let row_lats: Vec<f64> = (0..TILE_PIXELS)
            .map(|py| {
                let frac = (f64::from(y) + (f64::from(py) + 0.5) / f64::from(TILE_PIXELS)) / n;
                (std::f64::consts::PI * (1.0 - 2.0 * frac)).sinh().atan().to_degrees()
            })
            .collect();
        let col_lons: Vec<f64> = (0..TILE_PIXELS)
            .map(|px| {
                west + (east - west) * (f64::from(px) + 0.5) / f64::from(TILE_PIXELS)
            })
            .collect();

        let mut blocks: HashMap<(u32, u32), Vec<u8>> = HashMap::new();
        let mut out = vec![0u8; (TILE_PIXELS * TILE_PIXELS * 4) as usize];

        for (py, &lat) in row_lats.iter().enumerate() {
            for (px, &lon) in col_lons.iter().enumerate() {
                let (easting, northing) = zone.from_wgs84(lon, lat);
                let col = (easting - header.georef.origin_x) / resolution;
                let row = (header.georef.origin_y - northing) / resolution;
                if col < 0.0 || row < 0.0 {
                    continue;
                }
                let (col, row) = (col as u32, row as u32);
                if col >= ifd.width || row >= ifd.height {
                    continue;
                }

                let (bx, by) = (col / ifd.tile_width, row / ifd.tile_height);
                let block = match blocks.entry((bx, by)) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        let (off, len) = ifd
                            .tile_range(bx, by)
                            .ok_or(TileError::BadCoordinates)?;
                        let compressed =
                            self.objects.read_range(bucket, key, off, len).await?;
                        e.insert(decode_tile(
                            &compressed,
                            ifd.tile_width,
                            ifd.tile_height,
                            ifd.samples_per_pixel,
                            ifd.predictor,
                        )?)
                    },
                };

                let in_block = ((row % ifd.tile_height) * ifd.tile_width
                    + (col % ifd.tile_width)) as usize
                    * 3;
                let (r, g, b) = (block[in_block], block[in_block + 1], block[in_block + 2]);
                let at = (py * TILE_PIXELS as usize + px) * 4;
                out[at] = r;
                out[at + 1] = g;
                out[at + 2] = b;
                // All-zero pixels are nodata and stay transparent
                out[at + 3] = if r == 0 && g == 0 && b == 0 { 0 } else { 255 };
            }
        }

        encode_png(&out)
    }
}

/// Fully transparent tile for out-of-footprint and low-zoom requests
pub fn empty_tile() -> Result<Vec<u8>, TileError> {
    encode_png(&vec![0u8; (TILE_PIXELS * TILE_PIXELS * 4) as usize])
}

fn encode_png(rgba: &[u8]) -> Result<Vec<u8>, TileError> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(rgba, TILE_PIXELS, TILE_PIXELS, ExtendedColorType::Rgba8)
        .map_err(|e| TileError::Backend(format!("png encoding failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cog::writer::write_cog;
    use crate::cog::Georeference;
    use crate::storage::fs::FsStorage;

    fn service_over(dir: &std::path::Path) -> TileService {
        let store = Arc::new(FsStorage::new(dir, "cogs"));
        TileService::new(store, TileServiceConfig::default())
    }

    async fn write_artifact(root: &std::path::Path, value: u8) {
        let width = 640u32;
        let height = 640u32;
        let pixels = vec![value; (width * height * 3) as usize];
        let georef = Georeference {
            origin_x: 499_000.0,
            origin_y: 5_210_000.0,
            pixel_size: 10.0,
            epsg: 32632,
        };
        let dir = root.join("cogs");
        std::fs::create_dir_all(&dir).unwrap();
        write_cog(&dir.join("scene_rgb.tif"), &pixels, width, height, &georef).unwrap();
    }

    #[tokio::test]
    async fn test_low_zoom_is_empty_without_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_over(dir.path());
        // No artifact exists, yet low zooms still render
        let png = service.render("cogs", "missing.tif", 2, 1, 1).await.unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[tokio::test]
    async fn test_out_of_range_coordinates_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_over(dir.path());
        let err = service.render("cogs", "a.tif", 5, 32, 0).await.unwrap_err();
        assert!(matches!(err, TileError::BadCoordinates));
    }

    #[tokio::test]
    async fn test_missing_artifact_surfaces_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_over(dir.path());
        let err = service.render("cogs", "nope.tif", 10, 536, 357).await.unwrap_err();
        assert!(matches!(err, TileError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_tile_over_footprint_has_opaque_pixels() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), 180).await;
        let service = service_over(dir.path());

        // Footprint centre: origin + half the 6.4 km extent
        let zone = UtmZone::from_epsg(32632).unwrap();
        let (lon, lat) = zone.to_wgs84(499_000.0 + 3_200.0, 5_210_000.0 - 3_200.0);
        let (x, y) = geo::tile_for(13, lon, lat);
        let png = service.render("cogs", "scene_rgb.tif", 13, x, y).await.unwrap();

        let img = image::load_from_memory(&png).unwrap().to_rgba8();
        let centre = img.get_pixel(TILE_PIXELS / 2, TILE_PIXELS / 2);
        assert_eq!(centre.0, [180, 180, 180, 255]);
    }

    #[tokio::test]
    async fn test_tile_outside_footprint_is_transparent() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), 180).await;
        let service = service_over(dir.path());

        // Far away from the scene (different continent)
        let (x, y) = geo::tile_for(8, -100.0, 40.0);
        let png = service.render("cogs", "scene_rgb.tif", 8, x, y).await.unwrap();
        let img = image::load_from_memory(&png).unwrap().to_rgba8();
        assert!(img.pixels().all(|p| p.0[3] == 0));
    }

    #[tokio::test]
    async fn test_header_cache_hits_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), 90).await;
        let service = service_over(dir.path());

        let first = service.header("cogs", "scene_rgb.tif").await.unwrap();
        let second = service.header("cogs", "scene_rgb.tif").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
