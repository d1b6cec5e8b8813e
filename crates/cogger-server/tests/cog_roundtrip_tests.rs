//! Full conversion path: band rasters in, parseable artifact out

use std::collections::HashMap;
use std::path::Path;
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use cogger_server::cog::reader::{decode_tile, parse_header};
use cogger_server::cog::HEADER_PREFIX_LEN;
use cogger_server::convert::{validate_cog, Converter};
use cogger_server::fetch::SceneHandle;
use cogger_server::pipeline::{CogConverter, StageError};

const WIDTH: u32 = 600;
const HEIGHT: u32 = 400;

/// Band sample used everywhere below: nodata in the left strip, a dark and
/// a bright region splitting the rest
fn band_value(x: u32, _y: u32) -> u16 {
    if x < 50 {
        0
    } else if x < 325 {
        1000
    } else {
        3000
    }
}

fn write_band(path: &Path, with_georef: bool) {
    let data: Vec<u16> = (0..HEIGHT)
        .flat_map(|y| (0..WIDTH).map(move |x| band_value(x, y)))
        .collect();

    let mut file = std::fs::File::create(path).unwrap();
    let mut tiff = TiffEncoder::new(&mut file).unwrap();
    let mut image = tiff.new_image::<colortype::Gray16>(WIDTH, HEIGHT).unwrap();

    if with_georef {
        image
            .encoder()
            .write_tag(Tag::Unknown(33550), &[10.0f64, 10.0, 0.0][..])
            .unwrap();
        image
            .encoder()
            .write_tag(
                Tag::Unknown(33922),
                &[0.0f64, 0.0, 0.0, 399_960.0, 5_300_040.0, 0.0][..],
            )
            .unwrap();
        image
            .encoder()
            .write_tag(
                Tag::Unknown(34735),
                &[1u16, 1, 0, 3, 1024, 0, 1, 1, 1025, 0, 1, 1, 3072, 0, 1, 32632][..],
            )
            .unwrap();
    }

    image.write_data(&data).unwrap();
}

fn make_scene(with_georef: bool) -> SceneHandle {
    let scratch = tempfile::tempdir().unwrap();
    let mut bands = HashMap::new();
    for band in ["B02", "B03", "B04"] {
        let path = scratch.path().join(format!("{band}.tif"));
        write_band(&path, with_georef);
        bands.insert(band.to_string(), path);
    }
    SceneHandle::new(scratch, bands)
}

#[tokio::test]
async fn test_convert_produces_valid_artifact() {
    let scene = make_scene(true);
    let cog = Converter.convert("scene-rt", scene).await.unwrap();

    assert!(cog.path().exists());
    validate_cog(cog.path()).unwrap();

    let mut prefix = std::fs::read(cog.path()).unwrap();
    prefix.truncate(HEADER_PREFIX_LEN as usize);
    let header = parse_header(&prefix).unwrap();

    assert_eq!(header.ifds.len(), 5);
    assert_eq!((header.full().width, header.full().height), (WIDTH, HEIGHT));
    assert_eq!(header.georef.epsg, 32632);
    assert_eq!(header.georef.pixel_size, 10.0);
    assert_eq!(header.georef.origin_x, 399_960.0);

    let (west, south, east, north) = header
        .georef
        .geographic_bounds(WIDTH, HEIGHT)
        .unwrap();
    assert!(west < east && south < north);
}

#[tokio::test]
async fn test_stretch_maps_extremes_and_keeps_nodata() {
    let scene = make_scene(true);
    let cog = Converter.convert("scene-st", scene).await.unwrap();

    let data = std::fs::read(cog.path()).unwrap();
    let header = parse_header(&data[..HEADER_PREFIX_LEN.min(data.len() as u64) as usize]).unwrap();
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

    let pixel = |x: u32, y: u32| {
        let at = ((y * full.tile_width + x) * 3) as usize;
        [tile[at], tile[at + 1], tile[at + 2]]
    };

    // Nodata strip stays 0 in every channel
    assert_eq!(pixel(10, 100), [0, 0, 0]);
    // The dark region sits at the bottom of the stretch, the bright region
    // at the top, in all three channels
    assert_eq!(pixel(100, 100), [1, 1, 1]);
    assert_eq!(pixel(400, 100), [255, 255, 255]);
}

#[tokio::test]
async fn test_bands_without_georef_are_rejected() {
    let scene = make_scene(false);
    let err = Converter.convert("scene-ng", scene).await.unwrap_err();
    assert!(matches!(err, StageError::DataCorruption(_)), "got {err}");
}

#[tokio::test]
async fn test_scene_with_missing_band_is_rejected() {
    let scratch = tempfile::tempdir().unwrap();
    let path = scratch.path().join("B02.tif");
    write_band(&path, true);
    let scene = SceneHandle::new(
        scratch,
        HashMap::from([("B02".to_string(), path)]),
    );

    let err = Converter.convert("scene-mb", scene).await.unwrap_err();
    assert!(matches!(err, StageError::DataCorruption(_)), "got {err}");
}
