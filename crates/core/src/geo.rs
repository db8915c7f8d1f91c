//! Geodesy helpers: inverse UTM projection and stable spatial cell ids.
//!
//! The inverse projection is the standard WGS84 transverse-Mercator series
//! expansion (Karney/Snyder coefficients), evaluated in f64. Cell ids are a
//! level-tagged Morton interleave over normalized lat/lon; they only need to
//! be deterministic and stable so chunk tables have a durable address — the
//! polygon covering itself is computed by an external geometry library.

use crate::error::ModelError;

/// Scale factor of the central meridian.
const K0: f64 = 0.9996;
/// WGS84 first eccentricity squared.
const E: f64 = 0.00669438;
/// WGS84 equatorial radius in meters.
const R: f64 = 6378137.0;

/// Convert UTM easting/northing (meters) to (latitude, longitude) degrees.
///
/// # Errors
/// Returns [`ModelError::CoordinateOutOfRange`] when the easting, northing or
/// zone number is outside the valid UTM domain.
pub fn utm_to_latlon(
    easting: f64,
    northing: f64,
    zone_number: u8,
    northern: bool,
) -> Result<(f64, f64), ModelError> {
    if !(100_000.0..1_000_000.0).contains(&easting) {
        return Err(ModelError::CoordinateOutOfRange(format!(
            "easting {easting} must be in [100000, 1000000)"
        )));
    }
    if !(0.0..=10_000_000.0).contains(&northing) {
        return Err(ModelError::CoordinateOutOfRange(format!(
            "northing {northing} must be in [0, 10000000]"
        )));
    }
    if !(1..=60).contains(&zone_number) {
        return Err(ModelError::CoordinateOutOfRange(format!(
            "zone number {zone_number} must be in [1, 60]"
        )));
    }

    let e2 = E * E;
    let e3 = e2 * E;
    let e_p2 = E / (1.0 - E);

    let sqrt_e = (1.0 - E).sqrt();
    let es = (1.0 - sqrt_e) / (1.0 + sqrt_e);
    let es2 = es * es;
    let es3 = es2 * es;
    let es4 = es3 * es;
    let es5 = es4 * es;

    let m1 = 1.0 - E / 4.0 - 3.0 * e2 / 64.0 - 5.0 * e3 / 256.0;

    let p2 = 3.0 / 2.0 * es - 27.0 / 32.0 * es3 + 269.0 / 512.0 * es5;
    let p3 = 21.0 / 16.0 * es2 - 55.0 / 32.0 * es4;
    let p4 = 151.0 / 96.0 * es3 - 417.0 / 128.0 * es5;
    let p5 = 1097.0 / 512.0 * es4;

    let x = easting - 500_000.0;
    let y = if northern { northing } else { northing - 10_000_000.0 };

    let m = y / K0;
    let mu = m / (R * m1);

    let p_rad = mu
        + p2 * (2.0 * mu).sin()
        + p3 * (4.0 * mu).sin()
        + p4 * (6.0 * mu).sin()
        + p5 * (8.0 * mu).sin();

    let p_sin = p_rad.sin();
    let p_sin2 = p_sin * p_sin;
    let p_cos = p_rad.cos();

    let p_tan = p_sin / p_cos;
    let p_tan2 = p_tan * p_tan;
    let p_tan4 = p_tan2 * p_tan2;

    let ep_sin = 1.0 - E * p_sin2;
    let ep_sin_sqrt = ep_sin.sqrt();

    let n = R / ep_sin_sqrt;
    let r = (1.0 - E) / ep_sin;

    let c = e_p2 * p_cos * p_cos;
    let c2 = c * c;

    let d = x / (n * K0);
    let d2 = d * d;
    let d3 = d2 * d;
    let d4 = d3 * d;
    let d5 = d4 * d;
    let d6 = d5 * d;

    let latitude = p_rad
        - (p_tan / r) * (d2 / 2.0 - d4 / 24.0 * (5.0 + 3.0 * p_tan2 + 10.0 * c - 4.0 * c2 - 9.0 * e_p2))
        + d6 / 720.0 * (61.0 + 90.0 * p_tan2 + 298.0 * c + 45.0 * p_tan4 - 252.0 * e_p2 - 3.0 * c2);

    let longitude = (d - d3 / 6.0 * (1.0 + 2.0 * p_tan2 + c)
        + d5 / 120.0 * (5.0 - 2.0 * c + 28.0 * p_tan2 - 3.0 * c2 + 8.0 * e_p2 + 24.0 * p_tan4))
        / p_cos;

    let central = f64::from(i32::from(zone_number) - 1) * 6.0 - 180.0 + 3.0;
    let longitude = mod_angle(longitude + central.to_radians());

    Ok((latitude.to_degrees(), longitude.to_degrees()))
}

/// Wrap an angle in radians into (-pi, pi].
fn mod_angle(value: f64) -> f64 {
    (value + std::f64::consts::PI).rem_euclid(2.0 * std::f64::consts::PI) - std::f64::consts::PI
}

/// Cell level for a downsampling factor.
///
/// Coarser models get coarser (larger) cells so that chunk byte size stays
/// roughly constant across resolutions: factor 1 maps to level 17, factor 2
/// to 16, factor 32 to 12.
pub fn cell_level_for_factor(factor: usize) -> u8 {
    debug_assert!(factor >= 1 && factor.is_power_of_two());
    (17 - factor.ilog2().min(17)) as u8
}

/// Deterministic spatial cell id for a point at a given level.
///
/// The id interleaves the binary expansions of normalized longitude and
/// latitude (`level` bits each) and tags the level in the top bits, so ids
/// from different levels never collide.
pub fn cell_id(lat: f64, lon: f64, level: u8) -> u64 {
    debug_assert!(level <= 28);
    let cells = f64::from(1u32 << level);
    let xi = (((lon + 180.0) / 360.0 * cells) as u64).min((1 << level) - 1);
    let yi = (((lat + 90.0) / 180.0 * cells) as u64).min((1 << level) - 1);
    (u64::from(level) << 58) | interleave(xi, yi, level)
}

fn interleave(x: u64, y: u64, level: u8) -> u64 {
    let mut out = 0u64;
    for bit in 0..u64::from(level) {
        out |= ((x >> bit) & 1) << (2 * bit);
        out |= ((y >> bit) & 1) << (2 * bit + 1);
    }
    out
}
