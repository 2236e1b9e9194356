use crate::types::{CoordinateOrdering, GeodeticPoint, SicdError, SicdResult};
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array1, Array2};

/// WGS-84 semi-major axis (m)
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS-84 flattening
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS-84 semi-minor axis (m)
pub const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);
/// First eccentricity squared
pub const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);
/// Second eccentricity squared
pub const WGS84_EP2: f64 = WGS84_E2 / (1.0 - WGS84_E2);
/// Earth rotation rate (rad/s)
pub const EARTH_ROTATION_RATE: f64 = 7.292_115_146_7e-5;
/// Speed of light (m/s)
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// ECF points closer than this to the geocenter are rejected
const MIN_GEODETIC_RADIUS: f64 = 1.0e6;
const MAX_LATITUDE_ITERATIONS: usize = 10;

/// Inertial or earth-fixed velocity convention for the RIC frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RicFrame {
    Ecf,
    Eci,
}

/// Convert geodetic coordinates to ECF (WGS-84)
pub fn geodetic_to_ecf(point: &GeodeticPoint) -> Vector3<f64> {
    let lat = point.lat.to_radians();
    let lon = point.lon.to_radians();
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();

    // Prime vertical radius of curvature
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    Vector3::new(
        (n + point.hae) * cos_lat * cos_lon,
        (n + point.hae) * cos_lat * sin_lon,
        (n * (1.0 - WGS84_E2) + point.hae) * sin_lat,
    )
}

/// Convert an ECF point to geodetic coordinates.
///
/// Starts from Bowring's closed form and refines latitude by fixed point
/// iteration; the height is computed with a formula that stays well
/// conditioned near the poles.
pub fn ecf_to_geodetic(ecf: &Vector3<f64>) -> SicdResult<GeodeticPoint> {
    if !ecf.iter().all(|v| v.is_finite()) {
        return Err(SicdError::OutOfDomain(format!(
            "ECF coordinates must be finite, got ({}, {}, {})",
            ecf.x, ecf.y, ecf.z
        )));
    }
    if ecf.norm() < MIN_GEODETIC_RADIUS {
        return Err(SicdError::OutOfDomain(format!(
            "ECF point ({}, {}, {}) is within {} m of the geocenter",
            ecf.x, ecf.y, ecf.z, MIN_GEODETIC_RADIUS
        )));
    }

    let (x, y, z) = (ecf.x, ecf.y, ecf.z);
    let p = x.hypot(y);
    let lon = y.atan2(x);

    let theta = (z * WGS84_A).atan2(p * WGS84_B);
    let (sin_t, cos_t) = theta.sin_cos();
    let mut lat = (z + WGS84_EP2 * WGS84_B * sin_t.powi(3))
        .atan2(p - WGS84_E2 * WGS84_A * cos_t.powi(3));

    for _ in 0..MAX_LATITUDE_ITERATIONS {
        let sin_lat = lat.sin();
        let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
        let next = (z + WGS84_E2 * n * sin_lat).atan2(p);
        let change = (next - lat).abs();
        lat = next;
        if change < 1e-15 {
            break;
        }
    }

    let (sin_lat, cos_lat) = lat.sin_cos();
    let hae = p * cos_lat + z * sin_lat - WGS84_A * (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    GeodeticPoint::new(lat.to_degrees().clamp(-90.0, 90.0), lon.to_degrees(), hae)
}

/// Height above the ellipsoid of an ECF point
pub fn ecf_hae(ecf: &Vector3<f64>) -> SicdResult<f64> {
    Ok(ecf_to_geodetic(ecf)?.hae)
}

/// Batch geodetic to ECF over an `N x 3` array.
/// Rows holding non-finite values map to NaN rows.
pub fn geodetic_to_ecf_array(
    points: &Array2<f64>,
    ordering: CoordinateOrdering,
) -> SicdResult<Array2<f64>> {
    check_columns(points, "geodetic")?;
    let mut out = Array2::from_elem((points.nrows(), 3), f64::NAN);
    for (row, mut dst) in points.outer_iter().zip(out.outer_iter_mut()) {
        if !row.iter().all(|v| v.is_finite()) {
            continue;
        }
        let point = GeodeticPoint::from_array([row[0], row[1], row[2]], ordering)?;
        let ecf = geodetic_to_ecf(&point);
        dst.assign(&Array1::from(vec![ecf.x, ecf.y, ecf.z]));
    }
    Ok(out)
}

/// Batch ECF to geodetic over an `N x 3` array.
/// Rows holding non-finite values map to NaN rows; finite points inside the
/// geocenter exclusion radius are an error.
pub fn ecf_to_geodetic_array(
    points: &Array2<f64>,
    ordering: CoordinateOrdering,
) -> SicdResult<Array2<f64>> {
    check_columns(points, "ECF")?;
    let mut out = Array2::from_elem((points.nrows(), 3), f64::NAN);
    for (row, mut dst) in points.outer_iter().zip(out.outer_iter_mut()) {
        if !row.iter().all(|v| v.is_finite()) {
            continue;
        }
        let geo = ecf_to_geodetic(&Vector3::new(row[0], row[1], row[2]))?;
        dst.assign(&Array1::from(geo.to_array(ordering).to_vec()));
    }
    Ok(out)
}

/// Unit outward normal of the WGS-84 ellipsoid through an ECF point
pub fn wgs84_norm(ecf: &Vector3<f64>) -> Vector3<f64> {
    let a2 = WGS84_A * WGS84_A;
    let b2 = WGS84_B * WGS84_B;
    Vector3::new(ecf.x / a2, ecf.y / a2, ecf.z / b2).normalize()
}

/// Rotation whose columns are the radial, in-track and cross-track unit
/// vectors in ECF. Maps RIC components to ECF.
pub fn ric_ecf_matrix(
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    frame: RicFrame,
) -> Matrix3<f64> {
    let vi = match frame {
        RicFrame::Ecf => *velocity,
        RicFrame::Eci => {
            let omega = Vector3::new(0.0, 0.0, EARTH_ROTATION_RATE);
            velocity + omega.cross(position)
        }
    };
    let r = position.normalize();
    let c = r.cross(&vi).normalize();
    let i = c.cross(&r);
    Matrix3::from_columns(&[r, i, c])
}

pub fn ecf_to_ric(
    vector: &Vector3<f64>,
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    frame: RicFrame,
) -> Vector3<f64> {
    ric_ecf_matrix(position, velocity, frame).transpose() * vector
}

pub fn ric_to_ecf(
    vector: &Vector3<f64>,
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    frame: RicFrame,
) -> Vector3<f64> {
    ric_ecf_matrix(position, velocity, frame) * vector
}

fn check_columns(points: &Array2<f64>, what: &str) -> SicdResult<()> {
    if points.ncols() != 3 {
        return Err(SicdError::InvalidArgument(format!(
            "{} points must be an N x 3 array, got {} columns",
            what,
            points.ncols()
        )));
    }
    Ok(())
}
