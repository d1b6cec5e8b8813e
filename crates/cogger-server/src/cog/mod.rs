//! Cloud-optimized GeoTIFF: writing, header parsing, and geodesy
//!
//! The artifact layout is fixed: classic little-endian TIFF, 512x512 tiles,
//! deflate with a horizontal predictor, four decimated overviews, and all
//! metadata packed ahead of the tile data so a single small ranged read is
//! enough to open an artifact.

use thiserror::Error;

pub mod geo;
pub mod reader;
pub mod writer;

/// Tile edge length in pixels, both axes
pub const TILE_SIZE: u32 = 512;

/// Decimated overview levels below full resolution
pub const OVERVIEW_LEVELS: u32 = 4;

/// Pixel value reserved for missing data
pub const NODATA: u8 = 0;

/// Bytes of file prefix guaranteed to contain every IFD and tag value.
/// Readers fetch exactly this much to open an artifact.
pub const HEADER_PREFIX_LEN: u64 = 64 * 1024;

/// TIFF compression code for deflate
pub const COMPRESSION_DEFLATE: u16 = 8;

/// TIFF predictor code for horizontal differencing
pub const PREDICTOR_HORIZONTAL: u16 = 2;

#[derive(Debug, Error)]
pub enum CogError {
    #[error("malformed artifact: {0}")]
    Malformed(String),

    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Affine placement of a north-up raster in a projected CRS
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Georeference {
    /// Projected x of the raster's upper-left corner
    pub origin_x: f64,
    /// Projected y of the raster's upper-left corner
    pub origin_y: f64,
    /// Ground size of one pixel in CRS units; pixels are square
    pub pixel_size: f64,
    /// EPSG code of the projected CRS
    pub epsg: u32,
}

impl Georeference {
    /// Projected bounds as (min_x, min_y, max_x, max_y)
    pub fn bounds(&self, width: u32, height: u32) -> (f64, f64, f64, f64) {
        let max_x = self.origin_x + self.pixel_size * width as f64;
        let min_y = self.origin_y - self.pixel_size * height as f64;
        (self.origin_x, min_y, max_x, self.origin_y)
    }

    /// Geographic bounds as (west, south, east, north) in degrees, taken
    /// over the four projected corners
    pub fn geographic_bounds(&self, width: u32, height: u32) -> Result<(f64, f64, f64, f64), CogError> {
        let zone = geo::UtmZone::from_epsg(self.epsg).ok_or_else(|| {
            CogError::UnsupportedLayout(format!("not a UTM CRS: EPSG:{}", self.epsg))
        })?;

        let (min_x, min_y, max_x, max_y) = self.bounds(width, height);
        let corners = [
            zone.to_wgs84(min_x, min_y),
            zone.to_wgs84(min_x, max_y),
            zone.to_wgs84(max_x, min_y),
            zone.to_wgs84(max_x, max_y),
        ];

        let mut west = f64::INFINITY;
        let mut south = f64::INFINITY;
        let mut east = f64::NEG_INFINITY;
        let mut north = f64::NEG_INFINITY;
        for (lon, lat) in corners {
            west = west.min(lon);
            east = east.max(lon);
            south = south.min(lat);
            north = north.max(lat);
        }
        Ok((west, south, east, north))
    }
}
