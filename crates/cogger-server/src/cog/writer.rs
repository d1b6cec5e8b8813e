//! Tiled GeoTIFF writer
//!
//! Produces a classic little-endian TIFF with the full-resolution image in
//! IFD0 and four nearest-neighbour overviews in reduced-resolution IFDs.
//! Tile data is deflate-compressed behind a horizontal predictor. All IFDs
//! and tag values are packed at the front of the file, ahead of any tile
//! data, so the whole directory structure fits in [`HEADER_PREFIX_LEN`]
//! bytes. The output file appears atomically via a rename.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use super::{
    CogError, Georeference, COMPRESSION_DEFLATE, HEADER_PREFIX_LEN, OVERVIEW_LEVELS,
    PREDICTOR_HORIZONTAL, TILE_SIZE,
};

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_DOUBLE: u16 = 12;

const TAG_NEW_SUBFILE_TYPE: u16 = 254;
const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_PLANAR_CONFIG: u16 = 284;
const TAG_PREDICTOR: u16 = 317;
const TAG_TILE_WIDTH: u16 = 322;
const TAG_TILE_LENGTH: u16 = 323;
const TAG_TILE_OFFSETS: u16 = 324;
const TAG_TILE_BYTE_COUNTS: u16 = 325;
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

/// Pixel dimensions of every pyramid level, full resolution first
pub fn pyramid_dims(width: u32, height: u32) -> Vec<(u32, u32)> {
    let mut dims = vec![(width, height)];
    let (mut w, mut h) = (width, height);
    for _ in 0..OVERVIEW_LEVELS {
        w = w.div_ceil(2).max(1);
        h = h.div_ceil(2).max(1);
        dims.push((w, h));
    }
    dims
}

fn tile_grid(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(TILE_SIZE), height.div_ceil(TILE_SIZE))
}

/// Write an interleaved RGB raster as a cloud-optimized GeoTIFF at `path`.
/// `pixels` is row-major, three bytes per pixel.
pub fn write_cog(
    path: &Path,
    pixels: &[u8],
    width: u32,
    height: u32,
    georef: &Georeference,
) -> Result<(), CogError> {
    let expected = width as usize * height as usize * 3;
    if pixels.len() != expected {
        return Err(CogError::Malformed(format!(
            "pixel buffer is {} bytes, expected {} for {}x{} RGB",
            pixels.len(),
            expected,
            width,
            height
        )));
    }
    if width == 0 || height == 0 {
        return Err(CogError::Malformed("raster has zero extent".to_string()));
    }

    let dims = pyramid_dims(width, height);

    // Pass 1: compress every tile of every level into a scratch file,
    // recording per-tile byte counts so the directory can be sized.
    let mut tile_data = tempfile::tempfile()?;
    let mut level_counts: Vec<Vec<u32>> = Vec::with_capacity(dims.len());

    let mut overviews: Vec<Vec<u8>> = Vec::with_capacity(OVERVIEW_LEVELS as usize);
    for i in 1..dims.len() {
        let prev: &[u8] = if i == 1 { pixels } else { &overviews[i - 2] };
        let (pw, ph) = dims[i - 1];
        let (lw, lh) = dims[i];
        overviews.push(decimate(prev, pw, ph, lw, lh));
    }

    for (i, &(lw, lh)) in dims.iter().enumerate() {
        let level_pixels: &[u8] = if i == 0 { pixels } else { &overviews[i - 1] };
        let (cols, rows) = tile_grid(lw, lh);
        let mut counts = Vec::with_capacity((cols * rows) as usize);
        for ty in 0..rows {
            for tx in 0..cols {
                let compressed = compress_tile(level_pixels, lw, lh, tx, ty)?;
                tile_data.write_all(&compressed)?;
                counts.push(compressed.len() as u32);
            }
        }
        level_counts.push(counts);
    }

    // Pass 2: size the directory with placeholder offsets, then rebuild it
    // with real ones once the data start is known.
    let placeholder = build_metadata(&dims, &level_counts, georef, 0);
    let data_start = (placeholder.len() as u64).div_ceil(16) * 16;
    if data_start > HEADER_PREFIX_LEN {
        return Err(CogError::UnsupportedLayout(format!(
            "directory is {data_start} bytes, exceeds {HEADER_PREFIX_LEN} byte prefix"
        )));
    }
    let metadata = build_metadata(&dims, &level_counts, georef, data_start);

    let tmp_path = path.with_extension("partial");
    let mut out = std::fs::File::create(&tmp_path)?;
    out.write_all(&metadata)?;
    out.write_all(&vec![0u8; (data_start - metadata.len() as u64) as usize])?;

    tile_data.seek(SeekFrom::Start(0))?;
    std::io::copy(&mut tile_data, &mut out)?;
    out.sync_all()?;
    drop(out);
    std::fs::rename(&tmp_path, path)?;

    Ok(())
}

/// Nearest-neighbour 2x decimation of an interleaved RGB buffer
fn decimate(src: &[u8], sw: u32, sh: u32, dw: u32, dh: u32) -> Vec<u8> {
    let mut dst = vec![0u8; dw as usize * dh as usize * 3];
    for y in 0..dh {
        let sy = (y * 2).min(sh - 1) as usize;
        for x in 0..dw {
            let sx = (x * 2).min(sw - 1) as usize;
            let s = (sy * sw as usize + sx) * 3;
            let d = (y as usize * dw as usize + x as usize) * 3;
            dst[d..d + 3].copy_from_slice(&src[s..s + 3]);
        }
    }
    dst
}

/// Extract one padded tile, apply the horizontal predictor, and deflate it
fn compress_tile(
    level: &[u8],
    lw: u32,
    lh: u32,
    tx: u32,
    ty: u32,
) -> std::io::Result<Vec<u8>> {
    let tile_px = TILE_SIZE as usize;
    let row_bytes = tile_px * 3;
    let mut tile = vec![0u8; tile_px * row_bytes];

    let x0 = (tx * TILE_SIZE) as usize;
    let y0 = (ty * TILE_SIZE) as usize;
    let cols = tile_px.min(lw as usize - x0);
    let rows = tile_px.min(lh as usize - y0);

    for row in 0..rows {
        let src = ((y0 + row) * lw as usize + x0) * 3;
        let dst = row * row_bytes;
        tile[dst..dst + cols * 3].copy_from_slice(&level[src..src + cols * 3]);
    }

    for row in tile.chunks_exact_mut(row_bytes) {
        for i in (3..row_bytes).rev() {
            row[i] = row[i].wrapping_sub(row[i - 3]);
        }
    }

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(row_bytes), Compression::default());
    encoder.write_all(&tile)?;
    encoder.finish()
}

/// One directory entry; values longer than four bytes spill into the
/// external area after the entry table
struct Entry {
    tag: u16,
    kind: u16,
    count: u32,
    payload: Vec<u8>,
}

fn short(tag: u16, value: u16) -> Entry {
    Entry {
        tag,
        kind: TYPE_SHORT,
        count: 1,
        payload: value.to_le_bytes().to_vec(),
    }
}

fn long(tag: u16, value: u32) -> Entry {
    Entry {
        tag,
        kind: TYPE_LONG,
        count: 1,
        payload: value.to_le_bytes().to_vec(),
    }
}

fn shorts(tag: u16, values: &[u16]) -> Entry {
    Entry {
        tag,
        kind: TYPE_SHORT,
        count: values.len() as u32,
        payload: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}

fn longs(tag: u16, values: &[u32]) -> Entry {
    Entry {
        tag,
        kind: TYPE_LONG,
        count: values.len() as u32,
        payload: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}

fn doubles(tag: u16, values: &[f64]) -> Entry {
    Entry {
        tag,
        kind: TYPE_DOUBLE,
        count: values.len() as u32,
        payload: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}

fn ascii(tag: u16, value: &str) -> Entry {
    let mut payload = value.as_bytes().to_vec();
    payload.push(0);
    Entry {
        tag,
        kind: TYPE_ASCII,
        count: payload.len() as u32,
        payload,
    }
}

/// Serialize the full directory chain. `data_start` positions the tile
/// offsets; passing zero yields a correctly-sized placeholder.
fn build_metadata(
    dims: &[(u32, u32)],
    level_counts: &[Vec<u32>],
    georef: &Georeference,
    data_start: u64,
) -> Vec<u8> {
    // Tile data is laid out level by level in compression order
    let mut next_tile = data_start;
    let mut level_offsets: Vec<Vec<u32>> = Vec::with_capacity(level_counts.len());
    for counts in level_counts {
        let mut offsets = Vec::with_capacity(counts.len());
        for &len in counts {
            offsets.push(next_tile as u32);
            next_tile += u64::from(len);
        }
        level_offsets.push(offsets);
    }

    let mut out = Vec::with_capacity(4096);
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());

    for (level, &(lw, lh)) in dims.iter().enumerate() {
        let mut entries = vec![
            long(TAG_NEW_SUBFILE_TYPE, if level == 0 { 0 } else { 1 }),
            long(TAG_IMAGE_WIDTH, lw),
            long(TAG_IMAGE_LENGTH, lh),
            shorts(TAG_BITS_PER_SAMPLE, &[8, 8, 8]),
            short(TAG_COMPRESSION, COMPRESSION_DEFLATE),
            short(TAG_PHOTOMETRIC, 2),
            short(TAG_SAMPLES_PER_PIXEL, 3),
            short(TAG_PLANAR_CONFIG, 1),
            short(TAG_PREDICTOR, PREDICTOR_HORIZONTAL),
            short(TAG_TILE_WIDTH, TILE_SIZE as u16),
            short(TAG_TILE_LENGTH, TILE_SIZE as u16),
            longs(TAG_TILE_OFFSETS, &level_offsets[level]),
            longs(TAG_TILE_BYTE_COUNTS, &level_counts[level]),
        ];

        if level == 0 {
            let ps = georef.pixel_size;
            entries.push(doubles(TAG_MODEL_PIXEL_SCALE, &[ps, ps, 0.0]));
            entries.push(doubles(
                TAG_MODEL_TIEPOINT,
                &[0.0, 0.0, 0.0, georef.origin_x, georef.origin_y, 0.0],
            ));
            entries.push(shorts(
                TAG_GEO_KEY_DIRECTORY,
                &[
                    1, 1, 0, 3, // version, revision, minor, key count
                    1024, 0, 1, 1, // GTModelType = projected
                    1025, 0, 1, 1, // GTRasterType = pixel-is-area
                    3072, 0, 1, georef.epsg as u16, // ProjectedCSType
                ],
            ));
            entries.push(ascii(TAG_GDAL_NODATA, "0"));
        }

        let last = level == dims.len() - 1;
        write_ifd(&mut out, &entries, last);
    }

    out
}

fn write_ifd(out: &mut Vec<u8>, entries: &[Entry], last: bool) {
    let ifd_offset = out.len();
    let entry_table = 2 + entries.len() * 12 + 4;
    let mut external_offset = ifd_offset + entry_table;

    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());

    let mut external = Vec::new();
    for entry in entries {
        out.extend_from_slice(&entry.tag.to_le_bytes());
        out.extend_from_slice(&entry.kind.to_le_bytes());
        out.extend_from_slice(&entry.count.to_le_bytes());

        if entry.payload.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..entry.payload.len()].copy_from_slice(&entry.payload);
            out.extend_from_slice(&inline);
        } else {
            out.extend_from_slice(&(external_offset as u32).to_le_bytes());
            external.extend_from_slice(&entry.payload);
            if entry.payload.len() % 2 == 1 {
                external.push(0);
            }
            external_offset += entry.payload.len() + entry.payload.len() % 2;
        }
    }

    // Offset of the next IFD, written before its external area is appended
    let next_ifd = if last { 0u32 } else { external_offset as u32 };
    out.extend_from_slice(&next_ifd.to_le_bytes());
    out.extend_from_slice(&external);
}
