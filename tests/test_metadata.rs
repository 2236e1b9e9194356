mod common;

use approx::assert_abs_diff_eq;
use sicdproj::core::derivation::{DerivationStep, DERIVATION_SEQUENCE};
use sicdproj::core::polynomial::Poly2D;
use sicdproj::core::projection::{AdjustableParameters, ProjectionConfig};
use sicdproj::core::validation::{ImageFormationAlgorithm, Severity};
use sicdproj::metadata::{
    DirParam, Grid, ImageFormation, NoiseLevel, Radiometric, RgAzComp, ScpCoa, Sicd, TxFrequency,
};
use sicdproj::types::{GridType, ImageFormAlgo, SicdError, SideOfTrack};
use std::sync::Arc;

/// RgAzComp product stripped to what an image formation processor knows
fn sparse_rgazcomp() -> Sicd {
    let mut sicd = common::rgazcomp_sicd();
    sicd.grid = Some(Grid {
        row: Some(DirParam {
            ss: Some(1.0),
            ..Default::default()
        }),
        col: Some(DirParam {
            ss: Some(1.0),
            ..Default::default()
        }),
        ..Default::default()
    });
    sicd.image_formation = Some(ImageFormation::default());
    sicd.rg_az_comp = Some(RgAzComp::default());
    sicd.scpcoa = Some(ScpCoa {
        scp_time: Some(0.0),
        ..Default::default()
    });
    if let Some(scp) = sicd.geo_data.as_mut().and_then(|g| g.scp.as_mut()) {
        scp.llh = None;
    }
    sicd
}

#[test]
fn test_fixtures_validate() {
    common::init_logging();
    for (name, sicd) in common::all_products() {
        let report = sicd.validate();
        assert!(report.is_valid(), "{}: {:?}", name, report.diagnostics);
        assert_eq!(
            report.find("projection").map(|d| d.severity),
            Some(Severity::Info),
            "{}",
            name
        );
    }
}

#[test]
fn test_derivation_completes_sparse_product() {
    common::init_logging();
    let mut sicd = sparse_rgazcomp();
    assert!(!sicd.can_project());

    println!("🔧 First derivation pass");
    let report = sicd.derive();
    assert_eq!(report.steps, DERIVATION_SEQUENCE.to_vec());
    // Corners need the grid type, which the image formation step sets later
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.field == "GeoData.ImageCorners" && d.severity == Severity::Warning));
    assert!(sicd.can_project());

    assert_eq!(
        sicd.image_formation.as_ref().unwrap().image_form_algo,
        Some(ImageFormAlgo::RgAzComp)
    );
    assert_eq!(sicd.image_form_type().unwrap(), ImageFormationAlgorithm::RgAzComp);
    let grid = sicd.grid.as_ref().unwrap();
    assert_eq!(grid.grid_type, Some(GridType::RgAzim));
    assert!(grid.time_coa_poly.as_ref().unwrap().is_constant());

    let coa = sicd.scpcoa.as_ref().unwrap();
    assert_eq!(coa.side_of_track, Some(SideOfTrack::Left));
    assert_abs_diff_eq!(coa.slant_range.unwrap(), common::SLANT_RANGE, epsilon = 1e-6);
    assert_abs_diff_eq!(coa.doppler_cone_ang.unwrap(), 90.0, epsilon = 1e-9);
    let graze = (common::ALTITUDE / common::SLANT_RANGE).asin().to_degrees();
    assert_abs_diff_eq!(coa.graze_ang.unwrap(), graze, epsilon = 1e-9);

    let llh = sicd.geo_data.as_ref().unwrap().scp.as_ref().unwrap().llh.unwrap();
    assert_abs_diff_eq!(llh.lat, 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(llh.hae, 0.0, epsilon = 1e-6);

    println!("🔧 Second derivation pass");
    sicd.derive();
    let corners = sicd
        .geo_data
        .as_ref()
        .unwrap()
        .image_corners
        .clone()
        .expect("corners after the second pass");
    assert_eq!(corners.len(), 4);
    for corner in &corners {
        assert!(corner.lat.abs() < 0.02 && corner.lon.abs() < 0.02);
        assert_abs_diff_eq!(corner.hae, 0.0, epsilon = 1e-6);
    }
}

#[test]
fn test_derived_product_matches_reference_projection() {
    let mut sicd = sparse_rgazcomp();
    sicd.derive();
    let reference = common::rgazcomp_sicd();

    let config = ProjectionConfig::default();
    let pixels = ndarray::array![[10.0, 20.0], [1500.0, 1800.0]];
    let derived = sicd.project_image_to_ground(&pixels, &config, None).unwrap();
    let expected = reference.project_image_to_ground(&pixels, &config, None).unwrap();
    for (a, b) in derived.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }
}

#[test]
fn test_rma_time_coa_fit() {
    common::init_logging();
    let mut sicd = common::rma_sicd();
    if let Some(grid) = sicd.grid.as_mut() {
        grid.time_coa_poly = None;
    }
    if let Some(inca) = sicd.rma.as_mut().and_then(|r| r.inca.as_mut()) {
        inca.dop_centroid_poly = Some(Poly2D::constant(0.0));
        inca.dop_centroid_coa = Some(true);
    }

    let report = sicd.derive();
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.field == "Grid.TimeCOAPoly" && d.severity == Severity::Info));

    // Zero Doppler centroid: COA time is the closest approach time
    let poly = sicd.grid.as_ref().unwrap().time_coa_poly.clone().unwrap();
    for (x, y) in [(0.0, 0.0), (-900.0, 750.0), (400.0, -999.0)] {
        assert_abs_diff_eq!(poly.eval(x, y), y / common::SPEED, epsilon = 1e-9);
    }
}

#[test]
fn test_projection_cache_lifecycle() {
    let mut sicd = common::rgazcomp_sicd();
    assert!(!sicd.has_coa_projection());

    let first = sicd.coa_projection().unwrap();
    assert!(sicd.has_coa_projection());
    assert!(Arc::ptr_eq(&first, &sicd.coa_projection().unwrap()));
    assert_eq!(first.params().range_bias, 0.0);

    let biased = AdjustableParameters {
        range_bias: 5.0,
        ..Default::default()
    };
    let kept = sicd.define_coa_projection(&biased, false).unwrap();
    assert!(Arc::ptr_eq(&first, &kept));

    let replaced = sicd.define_coa_projection(&biased, true).unwrap();
    assert_eq!(replaced.params().range_bias, 5.0);
    assert!(!Arc::ptr_eq(&first, &replaced));

    // Derivation does not touch the cache
    sicd.derive();
    assert!(Arc::ptr_eq(&replaced, &sicd.coa_projection().unwrap()));

    sicd.invalidate_projection();
    assert!(!sicd.has_coa_projection());
    assert_eq!(sicd.coa_projection().unwrap().params().range_bias, 0.0);
}

#[test]
fn test_unprojectable_product() {
    let mut sicd = common::rgazcomp_sicd();
    sicd.position = None;
    assert!(!sicd.can_project());
    match sicd.check_projection() {
        Err(SicdError::MissingField(field)) => assert_eq!(field, "Position"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(sicd.coa_projection().is_err());
    assert!(!sicd.has_coa_projection());

    let mut pfa_declared = common::rgazcomp_sicd();
    pfa_declared
        .image_formation
        .as_mut()
        .unwrap()
        .image_form_algo = Some(ImageFormAlgo::Pfa);
    assert!(matches!(
        pfa_declared.check_projection(),
        Err(SicdError::UnsupportedConfiguration(_))
    ));
}

#[test]
fn test_missing_scp_blocks_projection() {
    let mut sicd = common::rgazcomp_sicd();
    sicd.geo_data.as_mut().unwrap().scp = None;
    assert!(!sicd.can_project());
    match sicd.check_projection() {
        Err(SicdError::MissingField(field)) => assert_eq!(field, "GeoData.SCP"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_pfa_without_polar_angle_poly() {
    let mut sicd = common::pfa_sicd();
    sicd.pfa.as_mut().unwrap().polar_ang_poly = None;
    assert!(!sicd.can_project());
    match sicd.check_projection() {
        Err(SicdError::MissingField(field)) => assert_eq!(field, "PFA.PolarAngPoly"),
        other => panic!("unexpected {:?}", other),
    }
    let report = sicd.validate();
    let finding = report.find("projection").unwrap();
    assert_eq!(finding.severity, Severity::Warning);
    assert!(finding.message.contains("PFA.PolarAngPoly"));
}

#[test]
fn test_time_coa_fallback_warning() {
    let mut sicd = common::rgazcomp_sicd();
    sicd.grid.as_mut().unwrap().time_coa_poly = None;
    let warnings = sicd.check_projection().unwrap();
    assert!(warnings
        .iter()
        .any(|d| d.field == "Grid.TimeCOAPoly" && d.severity == Severity::Warning));

    sicd.scpcoa.as_mut().unwrap().scp_time = None;
    sicd.timeline = None;
    match sicd.check_projection() {
        Err(SicdError::MissingField(field)) => assert_eq!(field, "Grid.TimeCOAPoly"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_populate_rniirs() {
    common::init_logging();
    let mut sicd = common::rgazcomp_sicd();
    sicd.image_formation.as_mut().unwrap().tx_rcv_polarization_proc = Some("V:V".to_string());
    sicd.radiometric = Some(Radiometric {
        noise_level: Some(NoiseLevel {
            noise_level_type: Some("ABSOLUTE".to_string()),
            noise_poly: Some(Poly2D::constant(-10.0)),
        }),
        sigma_zero_sf_poly: Some(Poly2D::constant(2.0)),
        ..Default::default()
    });
    sicd.derive();
    let radiometric = sicd.radiometric.as_ref().unwrap();
    assert!(radiometric.beta_zero_sf_poly.is_some());
    assert!(radiometric.gamma_zero_sf_poly.is_some());
    assert!(radiometric.rcs_sf_poly.is_some());

    sicd.populate_rniirs(None, None, false).unwrap();
    let params = &sicd.collection_info.as_ref().unwrap().parameters;
    assert_eq!(params.get("PREDICTED_RNIIRS").map(String::as_str), Some("4.0"));
    assert_eq!(params.get("INFORMATION_DENSITY").map(String::as_str), Some("1.6"));

    // Present values are kept unless overwriting
    sicd.populate_rniirs(Some(100.0), Some(0.01), false).unwrap();
    let params = &sicd.collection_info.as_ref().unwrap().parameters;
    assert_eq!(params.get("PREDICTED_RNIIRS").map(String::as_str), Some("4.0"));
    sicd.populate_rniirs(Some(100.0), Some(0.01), true).unwrap();
    let params = &sicd.collection_info.as_ref().unwrap().parameters;
    assert_ne!(params.get("PREDICTED_RNIIRS").map(String::as_str), Some("4.0"));
}

#[test]
fn test_json_round_trip_and_file() {
    let sicd = common::pfa_sicd();
    let json = sicd.to_json_string().unwrap();
    let path = std::env::temp_dir().join(format!("sicdproj_meta_{}.json", std::process::id()));
    std::fs::write(&path, &json).unwrap();
    let loaded = Sicd::from_json_file(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.pfa, sicd.pfa);
    assert_eq!(loaded.grid, sicd.grid);
    assert_eq!(loaded.timeline, sicd.timeline);
    assert!(!loaded.has_coa_projection());
    assert!(loaded.can_project());

    assert!(matches!(
        Sicd::from_json_file("/nonexistent/sicd.json"),
        Err(SicdError::Io(_))
    ));
}

#[test]
fn test_scp_coa_datetime() {
    let sicd = common::rgazcomp_sicd();
    let start = sicd.timeline.as_ref().unwrap().collect_start.unwrap();
    assert_eq!(sicd.scp_coa_datetime(), Some(start));
    let later = sicd.collect_time(1.5).unwrap();
    assert_eq!((later - start).num_milliseconds(), 1500);
    assert_eq!(DERIVATION_SEQUENCE[2], DerivationStep::ArpPoly);
}

#[test]
fn test_derivation_fills_frequency_support() {
    let mut sicd = common::pfa_sicd();
    sicd.derive();

    let proc = sicd
        .image_formation
        .as_ref()
        .unwrap()
        .tx_frequency_proc
        .clone()
        .unwrap();
    assert_eq!(proc.min_proc, Some(9.5e9));
    assert_eq!(proc.max_proc, Some(10.5e9));

    // ImpRespBW 0.9 cycles/m around a zero DeltaKCOAPoly
    let grid = sicd.grid.as_ref().unwrap();
    for dir in [grid.row.as_ref().unwrap(), grid.col.as_ref().unwrap()] {
        assert_eq!(dir.delta_kcoa_poly, Some(Poly2D::constant(0.0)));
        assert_abs_diff_eq!(dir.delta_k1.unwrap(), -0.45, epsilon = 1e-12);
        assert_abs_diff_eq!(dir.delta_k2.unwrap(), 0.45, epsilon = 1e-12);
    }
    assert!(sicd.validate().find("ImageFormation.TxFrequencyProc").is_none());
}

#[test]
fn test_apply_reference_frequency() {
    common::init_logging();
    let mut sicd = common::rma_sicd();
    if let Some(collection) = sicd.radar_collection.as_mut() {
        collection.tx_frequency = Some(TxFrequency {
            min: Some(-5.0e8),
            max: Some(5.0e8),
        });
        collection.ref_freq_index = Some(1);
    }
    if let Some(inca) = sicd.rma.as_mut().and_then(|r| r.inca.as_mut()) {
        inca.freq_zero = Some(0.0);
    }
    let before = sicd.coa_projection().unwrap();

    sicd.apply_reference_frequency(10e9).unwrap();
    assert!(!sicd.has_coa_projection());
    let band = sicd
        .radar_collection
        .as_ref()
        .unwrap()
        .tx_frequency
        .clone()
        .unwrap();
    assert_eq!(band.min, Some(9.5e9));
    assert_eq!(band.max, Some(10.5e9));
    let inca = sicd.rma.as_ref().unwrap().inca.as_ref().unwrap();
    assert_eq!(inca.freq_zero, Some(10e9));
    assert!(!Arc::ptr_eq(&before, &sicd.coa_projection().unwrap()));

    assert!(matches!(
        sicd.apply_reference_frequency(10e9),
        Err(SicdError::InvalidArgument(_))
    ));
}
