//! Header-only GeoTIFF reader
//!
//! Parses the directory chain out of an artifact's leading bytes without
//! touching tile data, which is how the metadata and tile endpoints open
//! multi-hundred-megabyte objects with one small ranged read. Only the
//! layout produced by [`super::writer`] is accepted: little-endian, tiled,
//! deflate, interleaved RGB.

use std::io::Read;

use super::{CogError, Georeference, COMPRESSION_DEFLATE, PREDICTOR_HORIZONTAL};

const TYPE_BYTE: u16 = 1;
const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_DOUBLE: u16 = 12;

/// One parsed image directory
#[derive(Debug, Clone)]
pub struct IfdInfo {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub compression: u16,
    pub predictor: u16,
    pub samples_per_pixel: u16,
    pub reduced_resolution: bool,
    pub tile_offsets: Vec<u64>,
    pub tile_byte_counts: Vec<u64>,
}

impl IfdInfo {
    /// Tiles per row
    pub fn tiles_across(&self) -> u32 {
        self.width.div_ceil(self.tile_width)
    }

    pub fn tiles_down(&self) -> u32 {
        self.height.div_ceil(self.tile_height)
    }

    /// Byte range of one tile within the artifact
    pub fn tile_range(&self, tx: u32, ty: u32) -> Option<(u64, u64)> {
        if tx >= self.tiles_across() || ty >= self.tiles_down() {
            return None;
        }
        let idx = (ty * self.tiles_across() + tx) as usize;
        Some((self.tile_offsets[idx], self.tile_byte_counts[idx]))
    }
}

/// Parsed artifact header: the full pyramid plus georeferencing
#[derive(Debug, Clone)]
pub struct CogHeader {
    /// Full resolution first, coarsest overview last
    pub ifds: Vec<IfdInfo>,
    pub georef: Georeference,
}

impl CogHeader {
    pub fn full(&self) -> &IfdInfo {
        &self.ifds[0]
    }

    /// Ground resolution of a pyramid level in CRS units per pixel
    pub fn level_resolution(&self, level: usize) -> f64 {
        self.georef.pixel_size * (self.full().width as f64 / self.ifds[level].width as f64)
    }

    /// Coarsest level whose resolution still meets `target` units per
    /// pixel; falls back to full resolution when nothing is coarse enough
    pub fn level_for_resolution(&self, target: f64) -> usize {
        for level in (0..self.ifds.len()).rev() {
            if self.level_resolution(level) <= target {
                return level;
            }
        }
        0
    }
}

/// Parse the directory chain from an artifact's leading bytes
pub fn parse_header(prefix: &[u8]) -> Result<CogHeader, CogError> {
    if prefix.len() < 8 {
        return Err(CogError::Malformed("header prefix too short".to_string()));
    }
    if &prefix[0..2] != b"II" || read_u16(prefix, 2)? != 42 {
        return Err(CogError::UnsupportedLayout(
            "not a little-endian TIFF".to_string(),
        ));
    }

    let mut ifds = Vec::new();
    let mut georef = None;
    let mut next = read_u32(prefix, 4)? as usize;

    while next != 0 {
        let (ifd, raw, following) = parse_ifd(prefix, next)?;
        if ifds.is_empty() {
            georef = Some(parse_georef(prefix, &raw)?);
        }
        ifds.push(ifd);
        if ifds.len() > 16 {
            return Err(CogError::Malformed("directory chain too long".to_string()));
        }
        next = following;
    }

    if ifds.is_empty() {
        return Err(CogError::Malformed("no image directories".to_string()));
    }

    let georef = georef.ok_or_else(|| CogError::Malformed("missing georeferencing".to_string()))?;
    Ok(CogHeader { ifds, georef })
}

/// A raw entry before interpretation
struct RawEntry {
    tag: u16,
    kind: u16,
    count: u32,
    /// Inline value field or external offset
    value: u32,
}

fn parse_ifd(prefix: &[u8], offset: usize) -> Result<(IfdInfo, Vec<RawEntry>, usize), CogError> {
    let count = read_u16(prefix, offset)? as usize;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = offset + 2 + i * 12;
        entries.push(RawEntry {
            tag: read_u16(prefix, at)?,
            kind: read_u16(prefix, at + 2)?,
            count: read_u32(prefix, at + 4)?,
            value: read_u32(prefix, at + 8)?,
        });
    }
    let next = read_u32(prefix, offset + 2 + count * 12)? as usize;

    let find = |tag: u16| entries.iter().find(|e| e.tag == tag);
    let require_one = |tag: u16, name: &str| -> Result<u64, CogError> {
        let entry =
            find(tag).ok_or_else(|| CogError::Malformed(format!("missing {name} tag")))?;
        let values = integer_values(prefix, entry)?;
        values
            .first()
            .copied()
            .ok_or_else(|| CogError::Malformed(format!("empty {name} tag")))
    };

    let compression = require_one(259, "compression")? as u16;
    let predictor = find(317)
        .map(|e| integer_values(prefix, e).map(|v| v.first().copied().unwrap_or(1) as u16))
        .transpose()?
        .unwrap_or(1);
    if compression != COMPRESSION_DEFLATE {
        return Err(CogError::UnsupportedLayout(format!(
            "compression {compression} not supported"
        )));
    }

    let tile_width = require_one(322, "tile width")? as u32;
    let tile_height = require_one(323, "tile length")? as u32;
    let offsets_entry =
        find(324).ok_or_else(|| CogError::Malformed("missing tile offsets".to_string()))?;
    let counts_entry =
        find(325).ok_or_else(|| CogError::Malformed("missing tile byte counts".to_string()))?;

    let ifd = IfdInfo {
        width: require_one(256, "image width")? as u32,
        height: require_one(257, "image length")? as u32,
        tile_width,
        tile_height,
        compression,
        predictor,
        samples_per_pixel: require_one(277, "samples per pixel")? as u16,
        reduced_resolution: find(254)
            .map(|e| {
                integer_values(prefix, e).map(|v| v.first().copied().unwrap_or(0) & 1 == 1)
            })
            .transpose()?
            .unwrap_or(false),
        tile_offsets: integer_values(prefix, offsets_entry)?,
        tile_byte_counts: integer_values(prefix, counts_entry)?,
    };

    let expected = (ifd.tiles_across() * ifd.tiles_down()) as usize;
    if ifd.tile_offsets.len() != expected || ifd.tile_byte_counts.len() != expected {
        return Err(CogError::Malformed(format!(
            "tile index has {} entries, expected {}",
            ifd.tile_offsets.len(),
            expected
        )));
    }

    Ok((ifd, entries, next))
}

fn parse_georef(prefix: &[u8], entries: &[RawEntry]) -> Result<Georeference, CogError> {
    let find = |tag: u16, name: &str| {
        entries
            .iter()
            .find(|e| e.tag == tag)
            .ok_or_else(|| CogError::Malformed(format!("missing {name} tag")))
    };

    let scale = double_values(prefix, find(33550, "pixel scale")?)?;
    let tiepoint = double_values(prefix, find(33922, "tiepoint")?)?;
    let keys = integer_values(prefix, find(34735, "geo key directory")?)?;

    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(CogError::Malformed("georeferencing tags too short".to_string()));
    }

    // Key directory is a 4-value header followed by (id, location, count,
    // value) quadruples; the projected CRS lives under key 3072
    let mut epsg = None;
    for quad in keys.get(4..).unwrap_or(&[]).chunks_exact(4) {
        if quad[0] == 3072 && quad[1] == 0 {
            epsg = Some(quad[3] as u32);
        }
    }
    let epsg =
        epsg.ok_or_else(|| CogError::Malformed("no projected CRS in geo keys".to_string()))?;

    Ok(Georeference {
        origin_x: tiepoint[3],
        origin_y: tiepoint[4],
        pixel_size: scale[0],
        epsg,
    })
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, CogError> {
    buf.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| CogError::Malformed("truncated header prefix".to_string()))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, CogError> {
    buf.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| CogError::Malformed("truncated header prefix".to_string()))
}

/// Read an entry's values as integers, SHORT or LONG, inline or external
fn integer_values(prefix: &[u8], entry: &RawEntry) -> Result<Vec<u64>, CogError> {
    let size = match entry.kind {
        TYPE_BYTE | TYPE_ASCII => 1,
        TYPE_SHORT => 2,
        TYPE_LONG => 4,
        other => {
            return Err(CogError::Malformed(format!(
                "unexpected type {other} for tag {}",
                entry.tag
            )))
        },
    };
    let total = size * entry.count as usize;
    let bytes = entry_bytes(prefix, entry, total)?;

    let mut values = Vec::with_capacity(entry.count as usize);
    for chunk in bytes.chunks_exact(size) {
        values.push(match size {
            1 => u64::from(chunk[0]),
            2 => u64::from(u16::from_le_bytes([chunk[0], chunk[1]])),
            _ => u64::from(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        });
    }
    Ok(values)
}

fn double_values(prefix: &[u8], entry: &RawEntry) -> Result<Vec<f64>, CogError> {
    if entry.kind != TYPE_DOUBLE {
        return Err(CogError::Malformed(format!(
            "tag {} is not DOUBLE typed",
            entry.tag
        )));
    }
    let total = 8 * entry.count as usize;
    let bytes = entry_bytes(prefix, entry, total)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

/// Resolve an entry's value bytes, inline or via its external offset. Values
/// beyond the fetched prefix mean the artifact was not written
/// metadata-first and cannot be served.
fn entry_bytes(prefix: &[u8], entry: &RawEntry, total: usize) -> Result<Vec<u8>, CogError> {
    if total <= 4 {
        Ok(entry.value.to_le_bytes()[..total].to_vec())
    } else {
        let at = entry.value as usize;
        prefix.get(at..at + total).map(<[u8]>::to_vec).ok_or_else(|| {
            CogError::UnsupportedLayout(
                "tag value lies outside the header prefix".to_string(),
            )
        })
    }
}

/// Inflate one tile and undo the horizontal predictor, returning raw
/// interleaved samples
pub fn decode_tile(
    compressed: &[u8],
    tile_width: u32,
    tile_height: u32,
    samples: u16,
    predictor: u16,
) -> Result<Vec<u8>, CogError> {
    let expected = tile_width as usize * tile_height as usize * samples as usize;
    let mut raw = Vec::with_capacity(expected);
    flate2::read::ZlibDecoder::new(compressed)
        .read_to_end(&mut raw)
        .map_err(|e| CogError::Malformed(format!("tile inflate failed: {e}")))?;

    if raw.len() != expected {
        return Err(CogError::Malformed(format!(
            "tile decoded to {} bytes, expected {expected}",
            raw.len()
        )));
    }

    if predictor == PREDICTOR_HORIZONTAL {
        let stride = samples as usize;
        let row_bytes = tile_width as usize * stride;
        for row in raw.chunks_exact_mut(row_bytes) {
            for i in stride..row_bytes {
                row[i] = row[i].wrapping_add(row[i - stride]);
            }
        }
    }

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cog::writer::write_cog;
    use crate::cog::{Georeference, HEADER_PREFIX_LEN, TILE_SIZE};
    use std::path::Path;

    fn sample_georef() -> Georeference {
        Georeference {
            origin_x: 399_960.0,
            origin_y: 5_300_040.0,
            pixel_size: 10.0,
            epsg: 32632,
        }
    }

    fn sample_pixel(x: usize, y: usize) -> [u8; 3] {
        [(x % 251) as u8, (y % 251) as u8, ((x + y) % 251) as u8]
    }

    fn write_sample(path: &Path, width: u32, height: u32) {
        let mut pixels = vec![0u8; width as usize * height as usize * 3];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let at = (y * width as usize + x) * 3;
                pixels[at..at + 3].copy_from_slice(&sample_pixel(x, y));
            }
        }
        write_cog(path, &pixels, width, height, &sample_georef()).unwrap();
    }

    fn header_prefix(path: &Path) -> Vec<u8> {
        let mut data = std::fs::read(path).unwrap();
        data.truncate(HEADER_PREFIX_LEN as usize);
        data
    }

    #[test]
    fn test_written_artifact_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene_rgb.tif");
        write_sample(&path, 600, 400);

        let header = parse_header(&header_prefix(&path)).unwrap();
        assert_eq!(header.ifds.len(), 5);

        let full = header.full();
        assert_eq!((full.width, full.height), (600, 400));
        assert_eq!(full.tile_width, TILE_SIZE);
        assert_eq!(full.samples_per_pixel, 3);
        assert!(!full.reduced_resolution);
        assert!(header.ifds[1..].iter().all(|i| i.reduced_resolution));

        assert_eq!(header.georef, sample_georef());
    }

    #[test]
    fn test_metadata_precedes_all_tile_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene_rgb.tif");
        write_sample(&path, 1100, 700);

        let header = parse_header(&header_prefix(&path)).unwrap();
        let min_offset = header
            .ifds
            .iter()
            .flat_map(|i| i.tile_offsets.iter())
            .copied()
            .min()
            .unwrap();
        assert!(min_offset <= HEADER_PREFIX_LEN);

        // Every tile sits past every directory, so header reads never race
        // into tile data
        for ifd in &header.ifds {
            for (&off, &len) in ifd.tile_offsets.iter().zip(&ifd.tile_byte_counts) {
                assert!(off >= min_offset);
                assert!(len > 0);
            }
        }
    }

    #[test]
    fn test_decoded_tile_matches_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene_rgb.tif");
        write_sample(&path, 600, 400);

        let data = std::fs::read(&path).unwrap();
        let header = parse_header(&header_prefix(&path)).unwrap();
        let full = header.full();

        let (off, len) = full.tile_range(0, 0).unwrap();
        let tile = decode_tile(
            &data[off as usize..(off + len) as usize],
            full.tile_width,
            full.tile_height,
            full.samples_per_pixel,
            full.predictor,
        )
        .unwrap();

        for &(x, y) in &[(0usize, 0usize), (17, 3), (511, 399), (240, 111)] {
            let at = (y * TILE_SIZE as usize + x) * 3;
            assert_eq!(&tile[at..at + 3], &sample_pixel(x, y), "pixel ({x},{y})");
        }
        // Padding beyond the image edge stays nodata
        let pad = (401 * TILE_SIZE as usize) * 3;
        assert_eq!(&tile[pad..pad + 3], &[0, 0, 0]);
    }

    #[test]
    fn test_pyramid_resolution_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene_rgb.tif");
        write_sample(&path, 1600, 1600);

        let header = parse_header(&header_prefix(&path)).unwrap();
        assert_eq!(header.level_resolution(0), 10.0);
        assert_eq!(header.level_resolution(1), 20.0);

        assert_eq!(header.level_for_resolution(10.0), 0);
        assert_eq!(header.level_for_resolution(25.0), 1);
        assert_eq!(header.level_for_resolution(1000.0), 4);
        // Finer than native data falls back to full resolution
        assert_eq!(header.level_for_resolution(2.0), 0);
    }

    #[test]
    fn test_out_of_grid_tile_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene_rgb.tif");
        write_sample(&path, 600, 400);

        let header = parse_header(&header_prefix(&path)).unwrap();
        assert!(header.full().tile_range(2, 0).is_none());
        assert!(header.full().tile_range(0, 1).is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_header(b"MM\x00\x2a garbage").is_err());
        assert!(parse_header(&[0u8; 4]).is_err());
    }
}
