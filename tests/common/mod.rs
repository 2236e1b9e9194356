//! Synthetic SICD products shared by the integration tests.
//!
//! The scene center point sits on the equator at longitude 0 and the
//! aperture flies north at 7.5 km/s, 800 km slant range to the east, so
//! the scene is seen from the left.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use nalgebra::Vector3;
use sicdproj::core::geocoords::WGS84_A;
use sicdproj::core::polynomial::{Poly1D, Poly2D, XyzPoly};
use sicdproj::metadata::{
    CollectionInfo, DirParam, GeoData, GeoScp, Grid, ImageData, ImageFormation, Inca, Pfa,
    Position, RadarCollection, RadarMode, RgAzComp, Rma, ScpCoa, Sicd, Timeline, TxFrequency,
};
use sicdproj::types::{GeodeticPoint, GridType, ImageFormAlgo, RadarModeType, RowCol, SideOfTrack};

pub const SPEED: f64 = 7500.0;
pub const SLANT_RANGE: f64 = 800_000.0;
pub const ALTITUDE: f64 = 500_000.0;
pub const NUM_ROWS: u64 = 2000;
pub const NUM_COLS: u64 = 2000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn scp() -> Vector3<f64> {
    Vector3::new(WGS84_A, 0.0, 0.0)
}

pub fn arp0() -> Vector3<f64> {
    let ground = (SLANT_RANGE * SLANT_RANGE - ALTITUDE * ALTITUDE).sqrt();
    Vector3::new(WGS84_A + ALTITUDE, ground, 0.0)
}

pub fn velocity() -> Vector3<f64> {
    Vector3::new(0.0, 0.0, SPEED)
}

pub fn arp_poly() -> XyzPoly {
    let p = arp0();
    XyzPoly::new(
        Poly1D::from_slice(&[p.x]),
        Poly1D::from_slice(&[p.y]),
        Poly1D::from_slice(&[p.z, SPEED]),
    )
}

pub fn line_of_sight() -> Vector3<f64> {
    (scp() - arp0()).normalize()
}

fn dir(uvect: Vector3<f64>, ss: f64) -> DirParam {
    DirParam {
        uvect_ecf: Some(uvect),
        ss: Some(ss),
        imp_resp_wid: Some(1.2),
        imp_resp_bw: Some(0.9),
        ..Default::default()
    }
}

fn collection(mode: RadarModeType) -> CollectionInfo {
    CollectionInfo {
        collector_name: Some("SYNTHETIC".to_string()),
        core_name: Some("SYNTH_0001".to_string()),
        radar_mode: Some(RadarMode {
            mode_type: Some(mode),
            mode_id: None,
        }),
        ..Default::default()
    }
}

/// Blocks common to every product; no grid and no algorithm
pub fn base_sicd(mode: RadarModeType) -> Sicd {
    let mut sicd = Sicd::default();
    sicd.collection_info = Some(collection(mode));
    sicd.image_data = Some(ImageData {
        num_rows: Some(NUM_ROWS),
        num_cols: Some(NUM_COLS),
        first_row: Some(0),
        first_col: Some(0),
        scp_pixel: Some(RowCol::new(1000, 1000)),
        valid_data: None,
    });
    sicd.geo_data = Some(GeoData {
        scp: Some(GeoScp {
            ecf: Some(scp()),
            llh: Some(GeodeticPoint::new(0.0, 0.0, 0.0).unwrap()),
        }),
        ..Default::default()
    });
    sicd.timeline = Some(Timeline {
        collect_start: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single(),
        collect_duration: Some(4.0),
    });
    sicd.position = Some(Position {
        arp_poly: Some(arp_poly()),
    });
    sicd.radar_collection = Some(RadarCollection {
        tx_frequency: Some(TxFrequency {
            min: Some(9.5e9),
            max: Some(10.5e9),
        }),
        ..Default::default()
    });
    sicd.scpcoa = Some(ScpCoa {
        scp_time: Some(0.0),
        arp_pos: Some(arp0()),
        arp_vel: Some(velocity()),
        side_of_track: Some(SideOfTrack::Left),
        ..Default::default()
    });
    sicd
}

/// Slant plane grid with rows along the line of sight and columns against
/// the flight direction
fn slant_grid() -> Grid {
    Grid {
        grid_type: Some(GridType::RgAzim),
        time_coa_poly: Some(Poly2D::constant(0.0)),
        row: Some(dir(line_of_sight(), 1.0)),
        col: Some(dir(Vector3::new(0.0, 0.0, -1.0), 1.0)),
        ..Default::default()
    }
}

pub fn rgazcomp_sicd() -> Sicd {
    let mut sicd = base_sicd(RadarModeType::Spotlight);
    sicd.grid = Some(slant_grid());
    sicd.image_formation = Some(ImageFormation {
        image_form_algo: Some(ImageFormAlgo::RgAzComp),
        ..Default::default()
    });
    sicd.rg_az_comp = Some(RgAzComp {
        az_sf: Some(-1.0 / SLANT_RANGE),
        kaz_poly: None,
    });
    sicd
}

pub fn pfa_sicd() -> Sicd {
    let mut sicd = base_sicd(RadarModeType::Spotlight);
    sicd.grid = Some(slant_grid());
    sicd.image_formation = Some(ImageFormation {
        image_form_algo: Some(ImageFormAlgo::Pfa),
        ..Default::default()
    });
    sicd.pfa = Some(Pfa {
        polar_ang_ref_time: Some(0.0),
        polar_ang_poly: Some(Poly1D::from_slice(&[0.0, SPEED / SLANT_RANGE])),
        spatial_freq_sf_poly: Some(Poly1D::from_slice(&[1.0])),
        ..Default::default()
    });
    sicd
}

/// Zero Doppler stripmap product: COA time equals closest approach time
pub fn rma_sicd() -> Sicd {
    let mut sicd = base_sicd(RadarModeType::Stripmap);
    sicd.grid = Some(Grid {
        grid_type: Some(GridType::RgZero),
        time_coa_poly: Some(Poly2D::from_rows(&[vec![0.0, 1.0 / SPEED]]).unwrap()),
        row: Some(dir(line_of_sight(), 1.0)),
        col: Some(dir(Vector3::new(0.0, 0.0, 1.0), 1.0)),
        ..Default::default()
    });
    sicd.image_formation = Some(ImageFormation {
        image_form_algo: Some(ImageFormAlgo::Rma),
        ..Default::default()
    });
    sicd.rma = Some(Rma {
        rm_algo_type: Some("OMEGA_K".to_string()),
        image_type: Some("INCA".to_string()),
        inca: Some(Inca {
            time_ca_poly: Some(Poly1D::from_slice(&[0.0, 1.0 / SPEED])),
            r_ca_scp: Some(SLANT_RANGE),
            freq_zero: Some(10e9),
            drate_sf_poly: Some(Poly2D::constant(1.0)),
            dop_centroid_poly: None,
            dop_centroid_coa: None,
        }),
    });
    sicd
}

/// Ground plane grid: rows run away from the sensor, columns north
pub fn plane_sicd() -> Sicd {
    let mut sicd = base_sicd(RadarModeType::Spotlight);
    sicd.grid = Some(Grid {
        grid_type: Some(GridType::XrgYcr),
        time_coa_poly: Some(Poly2D::constant(0.0)),
        row: Some(dir(Vector3::new(0.0, -1.0, 0.0), 1.0)),
        col: Some(dir(Vector3::new(0.0, 0.0, 1.0), 1.0)),
        ..Default::default()
    });
    sicd.image_formation = Some(ImageFormation {
        image_form_algo: Some(ImageFormAlgo::Other),
        ..Default::default()
    });
    sicd
}

pub fn all_products() -> Vec<(&'static str, Sicd)> {
    vec![
        ("RGAZCOMP", rgazcomp_sicd()),
        ("PFA", pfa_sicd()),
        ("RMA", rma_sicd()),
        ("PLANE", plane_sicd()),
    ]
}
