//! Band composition and tone mapping
//!
//! Turns the three fetched 10 m band rasters into one 8-bit RGB
//! cloud-optimized artifact. Source samples are 12-bit reflectance stored in
//! 16-bit GeoTIFFs; each band is stretched independently between its 0.1 and
//! 99.9 percentiles and mapped into 1..=255, keeping 0 as nodata on both
//! sides of the mapping.

use async_trait::async_trait;
use std::io::Read;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tracing::{debug, info};

use crate::cog::reader::parse_header;
use crate::cog::writer::write_cog;
use crate::cog::{CogError, Georeference, HEADER_PREFIX_LEN, TILE_SIZE};
use crate::fetch::SceneHandle;
use crate::pipeline::{CogConverter, CogHandle, StageError};

/// Lower stretch percentile
const STRETCH_LOW: f64 = 0.1;
/// Upper stretch percentile
const STRETCH_HIGH: f64 = 99.9;
/// Histogram resolution; source data is 12-bit
const HISTOGRAM_BINS: usize = 4096;

/// Band order in the output composite: B04 red, B03 green, B02 blue
const COMPOSITE_BANDS: [&str; 3] = ["B04", "B03", "B02"];

/// One decoded source band
struct Band {
    data: Vec<u16>,
    width: u32,
    height: u32,
    georef: Option<Georeference>,
}

pub struct Converter;

#[async_trait]
impl CogConverter for Converter {
    async fn convert(&self, source_id: &str, scene: SceneHandle) -> Result<CogHandle, StageError> {
        let id = source_id.to_string();
        tokio::task::spawn_blocking(move || convert_scene(&id, &scene))
            .await
            .map_err(|e| StageError::DataCorruption(format!("conversion task failed: {e}")))?
    }
}

fn convert_scene(source_id: &str, scene: &SceneHandle) -> Result<CogHandle, StageError> {
    let mut bands = Vec::with_capacity(3);
    for name in COMPOSITE_BANDS {
        let path = scene.band(name).ok_or_else(|| {
            StageError::DataCorruption(format!("scene is missing band {name}"))
        })?;
        bands.push(read_band(path)?);
    }

    let (width, height) = (bands[0].width, bands[0].height);
    if bands.iter().any(|b| b.width != width || b.height != height) {
        return Err(StageError::DataCorruption(format!(
            "band dimensions disagree: {:?}",
            bands
                .iter()
                .map(|b| (b.width, b.height))
                .collect::<Vec<_>>()
        )));
    }

    let georef = bands
        .iter()
        .find_map(|b| b.georef)
        .ok_or_else(|| StageError::DataCorruption("no band carries georeferencing".to_string()))?;

    // Per-band percentile stretch, then interleave
    let mut pixels = vec![0u8; width as usize * height as usize * 3];
    for (channel, band) in bands.iter().enumerate() {
        let (low, high) = stretch_range(&band.data);
        debug!(source_id, channel, low, high, "band stretch range");
        for (i, &v) in band.data.iter().enumerate() {
            pixels[i * 3 + channel] = stretch_sample(v, low, high);
        }
    }
    drop(bands);

    let scratch = tempfile::tempdir().map_err(StageError::from_io)?;
    let out_path = scratch.path().join(format!("{source_id}_rgb.tif"));
    write_cog(&out_path, &pixels, width, height, &georef).map_err(cog_to_stage)?;
    drop(pixels);

    validate_cog(&out_path)?;
    info!(source_id, width, height, "scene converted");

    Ok(CogHandle::new(scratch, out_path))
}

fn cog_to_stage(err: CogError) -> StageError {
    match err {
        CogError::Io(io) => StageError::from_io(io),
        other => StageError::DataCorruption(other.to_string()),
    }
}

fn read_band(path: &Path) -> Result<Band, StageError> {
    let file = std::fs::File::open(path).map_err(StageError::from_io)?;
    let mut decoder = Decoder::new(file)
        .map_err(|e| StageError::DataCorruption(format!("unreadable band raster: {e}")))?;

    // Full scenes are 10980x10980 u16, well past the default limits
    let mut limits = Limits::default();
    limits.decoding_buffer_size = 1024 * 1024 * 1024;
    limits.intermediate_buffer_size = 1024 * 1024 * 1024;
    limits.ifd_value_size = 64 * 1024 * 1024;
    decoder = decoder.with_limits(limits);

    let (width, height) = decoder
        .dimensions()
        .map_err(|e| StageError::DataCorruption(format!("band has no dimensions: {e}")))?;

    let georef = read_georef(&mut decoder);

    let data = match decoder
        .read_image()
        .map_err(|e| StageError::DataCorruption(format!("band decode failed: {e}")))?
    {
        DecodingResult::U16(data) => data,
        DecodingResult::U8(data) => data.into_iter().map(u16::from).collect(),
        _ => {
            return Err(StageError::DataCorruption(
                "band sample format is not unsigned 8 or 16 bit".to_string(),
            ))
        },
    };

    if data.len() != width as usize * height as usize {
        return Err(StageError::DataCorruption(format!(
            "band decoded to {} samples, expected {}",
            data.len(),
            width as usize * height as usize
        )));
    }

    Ok(Band {
        data,
        width,
        height,
        georef,
    })
}

fn read_georef<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Option<Georeference> {
    // The decoder maps these GeoTIFF tag numbers to its named variants, so a
    // `Tag::Unknown` lookup never matches.
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok()?;
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok()?;
    let keys = decoder.get_tag_u32_vec(Tag::GeoKeyDirectoryTag).ok()?;

    if tiepoint.len() < 6 || scale.len() < 2 {
        return None;
    }

    let mut epsg = None;
    for quad in keys.get(4..).unwrap_or(&[]).chunks_exact(4) {
        if quad[0] == 3072 && quad[1] == 0 {
            epsg = Some(quad[3]);
        }
    }

    Some(Georeference {
        origin_x: tiepoint[3],
        origin_y: tiepoint[4],
        pixel_size: scale[0],
        epsg: epsg?,
    })
}

/// Percentile bounds of the nonzero sample distribution
fn stretch_range(data: &[u16]) -> (u16, u16) {
    let mut histogram = vec![0u64; HISTOGRAM_BINS];
    let mut total = 0u64;
    for &v in data {
        if v != 0 {
            histogram[(v as usize).min(HISTOGRAM_BINS - 1)] += 1;
            total += 1;
        }
    }
    if total == 0 {
        return (0, 1);
    }

    let low_target = (total as f64 * STRETCH_LOW / 100.0) as u64;
    let high_target = (total as f64 * STRETCH_HIGH / 100.0) as u64;

    let mut low = 0u16;
    let mut high = (HISTOGRAM_BINS - 1) as u16;
    let mut seen = 0u64;
    let mut low_set = false;
    for (bin, &count) in histogram.iter().enumerate() {
        if count == 0 {
            continue;
        }
        seen += count;
        if !low_set && seen > low_target {
            low = bin as u16;
            low_set = true;
        }
        if seen >= high_target {
            high = bin as u16;
            break;
        }
    }

    if high <= low {
        high = low.saturating_add(1);
    }
    (low, high)
}

/// Map one sample into 1..=255, keeping 0 as nodata
fn stretch_sample(v: u16, low: u16, high: u16) -> u8 {
    if v == 0 {
        return 0;
    }
    let span = f64::from(high) - f64::from(low);
    let scaled = (f64::from(v) - f64::from(low)) / span;
    (scaled.clamp(0.0, 1.0) * 254.0).round() as u8 + 1
}

/// Re-open a finished artifact and confirm it has the serving layout:
/// tiled at the expected size, compressed, with at least one overview
pub fn validate_cog(path: &Path) -> Result<(), StageError> {
    // Header-only read; never pull the whole artifact into memory
    let file = std::fs::File::open(path).map_err(StageError::from_io)?;
    let mut prefix = Vec::with_capacity(HEADER_PREFIX_LEN as usize);
    file.take(HEADER_PREFIX_LEN)
        .read_to_end(&mut prefix)
        .map_err(StageError::from_io)?;

    let header = parse_header(&prefix).map_err(cog_to_stage)?;
    let full = header.full();
    if full.tile_width != TILE_SIZE || full.tile_height != TILE_SIZE {
        return Err(StageError::DataCorruption(format!(
            "artifact tiles are {}x{}, expected {TILE_SIZE}",
            full.tile_width, full.tile_height
        )));
    }
    if full.samples_per_pixel != 3 {
        return Err(StageError::DataCorruption(
            "artifact is not three-banded".to_string(),
        ));
    }
    if header.ifds.len() < 2 {
        return Err(StageError::DataCorruption(
            "artifact carries no overviews".to_string(),
        ));
    }
    Ok(())
}
