//! UTM and slippy-map geodesy on the WGS84 ellipsoid
//!
//! Transverse Mercator conversions use the Krüger series to third order in
//! the flattening, accurate to well under a metre inside a zone, which is far
//! below the 10 m ground sampling of the rasters this serves.

/// WGS84 semi-major axis in metres
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening
const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// Transverse Mercator scale factor at the central meridian
const UTM_K0: f64 = 0.9996;
/// False easting applied to every zone
const UTM_FALSE_EASTING: f64 = 500_000.0;
/// False northing applied in the southern hemisphere
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// A UTM zone with hemisphere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtmZone {
    pub zone: u8,
    pub north: bool,
}

impl UtmZone {
    /// Decode EPSG 326xx (north) / 327xx (south) codes
    pub fn from_epsg(epsg: u32) -> Option<Self> {
        let (base, north) = match epsg {
            32601..=32660 => (32600, true),
            32701..=32760 => (32700, false),
            _ => return None,
        };
        Some(Self {
            zone: (epsg - base) as u8,
            north,
        })
    }

    pub fn to_epsg(&self) -> u32 {
        let base = if self.north { 32600 } else { 32700 };
        base + self.zone as u32
    }

    /// Central meridian in degrees
    fn central_meridian(&self) -> f64 {
        f64::from(self.zone) * 6.0 - 183.0
    }

    /// Projected easting/northing to (longitude, latitude) in degrees
    pub fn to_wgs84(&self, easting: f64, northing: f64) -> (f64, f64) {
        let k = Kruger::wgs84();

        let false_northing = if self.north { 0.0 } else { UTM_FALSE_NORTHING_SOUTH };
        let xi = (northing - false_northing) / (UTM_K0 * k.big_a);
        let eta = (easting - UTM_FALSE_EASTING) / (UTM_K0 * k.big_a);

        let mut xi_p = xi;
        let mut eta_p = eta;
        for (j, beta) in k.beta.iter().enumerate() {
            let two_j = 2.0 * (j as f64 + 1.0);
            xi_p -= beta * (two_j * xi).sin() * (two_j * eta).cosh();
            eta_p -= beta * (two_j * xi).cos() * (two_j * eta).sinh();
        }

        let chi = (xi_p.sin() / eta_p.cosh()).asin();
        let mut lat = chi;
        for (j, delta) in k.delta.iter().enumerate() {
            let two_j = 2.0 * (j as f64 + 1.0);
            lat += delta * (two_j * chi).sin();
        }

        let lon = self.central_meridian().to_radians() + eta_p.sinh().atan2(xi_p.cos());
        (lon.to_degrees(), lat.to_degrees())
    }

    /// (longitude, latitude) in degrees to projected easting/northing
    pub fn from_wgs84(&self, lon: f64, lat: f64) -> (f64, f64) {
        let k = Kruger::wgs84();

        let phi = lat.to_radians();
        let dlon = (lon - self.central_meridian()).to_radians();

        let conformal = {
            let s = (2.0 * k.n.sqrt()) / (1.0 + k.n);
            (phi.sin().atanh() - s * (s * phi.sin()).atanh()).sinh()
        };

        let xi_p = conformal.atan2(dlon.cos());
        let eta_p = (dlon.sin() / (1.0 + conformal * conformal).sqrt()).atanh();

        let mut xi = xi_p;
        let mut eta = eta_p;
        for (j, alpha) in k.alpha.iter().enumerate() {
            let two_j = 2.0 * (j as f64 + 1.0);
            xi += alpha * (two_j * xi_p).sin() * (two_j * eta_p).cosh();
            eta += alpha * (two_j * xi_p).cos() * (two_j * eta_p).sinh();
        }

        let false_northing = if self.north { 0.0 } else { UTM_FALSE_NORTHING_SOUTH };
        let easting = UTM_FALSE_EASTING + UTM_K0 * k.big_a * eta;
        let northing = false_northing + UTM_K0 * k.big_a * xi;
        (easting, northing)
    }
}

/// Krüger series coefficients for an ellipsoid
struct Kruger {
    n: f64,
    big_a: f64,
    alpha: [f64; 3],
    beta: [f64; 3],
    delta: [f64; 3],
}

impl Kruger {
    fn wgs84() -> Self {
        let n = WGS84_F / (2.0 - WGS84_F);
        let n2 = n * n;
        let n3 = n2 * n;

        Self {
            n,
            big_a: WGS84_A / (1.0 + n) * (1.0 + n2 / 4.0 + n2 * n2 / 64.0),
            alpha: [
                n / 2.0 - 2.0 * n2 / 3.0 + 5.0 * n3 / 16.0,
                13.0 * n2 / 48.0 - 3.0 * n3 / 5.0,
                61.0 * n3 / 240.0,
            ],
            beta: [
                n / 2.0 - 2.0 * n2 / 3.0 + 37.0 * n3 / 96.0,
                n2 / 48.0 + n3 / 15.0,
                17.0 * n3 / 480.0,
            ],
            delta: [
                2.0 * n - 2.0 * n2 / 3.0 - 2.0 * n3,
                7.0 * n2 / 3.0 - 8.0 * n3 / 5.0,
                56.0 * n3 / 15.0,
            ],
        }
    }
}

/// Geographic bounds of a slippy-map tile as (west, south, east, north)
/// in degrees
pub fn tile_bounds(z: u32, x: u32, y: u32) -> (f64, f64, f64, f64) {
    let n = f64::from(1u32 << z);
    let west = f64::from(x) / n * 360.0 - 180.0;
    let east = f64::from(x + 1) / n * 360.0 - 180.0;
    let north = tile_edge_lat(f64::from(y) / n);
    let south = tile_edge_lat(f64::from(y + 1) / n);
    (west, south, east, north)
}

fn tile_edge_lat(frac: f64) -> f64 {
    (std::f64::consts::PI * (1.0 - 2.0 * frac)).sinh().atan().to_degrees()
}

/// Slippy-map tile containing a geographic point
pub fn tile_for(z: u32, lon: f64, lat: f64) -> (u32, u32) {
    let n = f64::from(1u32 << z);
    let x = ((lon + 180.0) / 360.0 * n).floor();
    let lat_rad = lat.to_radians();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n)
        .floor();
    let max = (1u32 << z) - 1;
    (
        (x.max(0.0) as u32).min(max),
        (y.max(0.0) as u32).min(max),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epsg_round_trip() {
        let zone = UtmZone::from_epsg(32632).unwrap();
        assert_eq!(zone, UtmZone { zone: 32, north: true });
        assert_eq!(zone.to_epsg(), 32632);

        let south = UtmZone::from_epsg(32723).unwrap();
        assert!(!south.north);
        assert_eq!(south.zone, 23);

        assert!(UtmZone::from_epsg(4326).is_none());
        assert!(UtmZone::from_epsg(32661).is_none());
    }

    #[test]
    fn test_central_meridian_maps_to_false_easting() {
        // On the central meridian the easting is exactly the false easting
        let zone = UtmZone::from_epsg(32632).unwrap();
        let (easting, _) = zone.from_wgs84(9.0, 47.0);
        assert!((easting - 500_000.0).abs() < 0.01, "easting = {easting}");
    }

    #[test]
    fn test_known_point_forward() {
        // Munich, EPSG:32632; reference values from proj
        let zone = UtmZone::from_epsg(32632).unwrap();
        let (easting, northing) = zone.from_wgs84(11.574, 48.1375);
        assert!((easting - 691_491.1).abs() < 1.0, "easting = {easting}");
        assert!((northing - 5_334_787.4).abs() < 1.0, "northing = {northing}");
    }

    #[test]
    fn test_projection_round_trip() {
        let zone = UtmZone::from_epsg(32632).unwrap();
        for &(lon, lat) in &[(9.0, 47.0), (6.2, 46.1), (11.9, 54.5), (8.5, 50.0)] {
            let (e, n) = zone.from_wgs84(lon, lat);
            let (lon2, lat2) = zone.to_wgs84(e, n);
            assert!((lon - lon2).abs() < 1e-7, "lon {lon} -> {lon2}");
            assert!((lat - lat2).abs() < 1e-7, "lat {lat} -> {lat2}");
        }
    }

    #[test]
    fn test_southern_hemisphere_round_trip() {
        let zone = UtmZone::from_epsg(32723).unwrap();
        let (e, n) = zone.from_wgs84(-43.2, -22.9);
        assert!(n > 0.0 && n < 10_000_000.0);
        let (lon, lat) = zone.to_wgs84(e, n);
        assert!((lon + 43.2).abs() < 1e-7);
        assert!((lat + 22.9).abs() < 1e-7);
    }

    #[test]
    fn test_tile_bounds_zoom_zero() {
        let (west, south, east, north) = tile_bounds(0, 0, 0);
        assert_eq!(west, -180.0);
        assert_eq!(east, 180.0);
        assert!((north - 85.0511).abs() < 0.001);
        assert!((south + 85.0511).abs() < 0.001);
    }

    #[test]
    fn test_tile_lookup_matches_bounds() {
        let (x, y) = tile_for(10, 9.0, 47.0);
        let (west, south, east, north) = tile_bounds(10, x, y);
        assert!(west <= 9.0 && 9.0 < east);
        assert!(south <= 47.0 && 47.0 < north);
    }
}
