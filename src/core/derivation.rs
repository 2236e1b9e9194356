//! Derivation of dependent SICD fields
//!
//! Steps run in the fixed order of `DERIVATION_SEQUENCE`; each step only
//! reads values that earlier steps (or the input) populate, and never
//! overwrites a populated field. Problems are returned as diagnostics.

use crate::core::geocoords::{
    ecf_to_geodetic, geodetic_to_ecf, wgs84_norm, SPEED_OF_LIGHT,
};
use crate::core::polynomial::{two_dim_poly_fit, Poly2D, XyzPoly};
use crate::core::projection::{AdjustableParameters, ProjectionContext, ProjectionSurface};
use crate::core::radiometric;
use crate::core::validation::{populated_algorithm_blocks, Diagnostic};
use crate::metadata::{DirParam, Grid, Pfa, RgAzComp, Sicd};
use crate::types::{
    CoordinateOrdering, GeodeticPoint, GridType, ImageFormAlgo, SicdError, SicdResult,
    SideOfTrack,
};
use nalgebra::Vector3;
use ndarray::{Array1, Array2};
use std::fmt;

/// One derivation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationStep {
    /// SCPCOA.SCPTime from the TimeCOAPoly constant term
    ScpTime,
    /// Constant TimeCOAPoly for spotlight collections
    TimeCoaPoly,
    /// SCPCOA aperture state from ARPPoly, or ARPPoly from that state
    ArpPoly,
    /// Both ECF and geodetic forms of the scene center point
    ScpGeodetic,
    /// Grid DeltaKCOAPoly and the DeltaK1/DeltaK2 frequency support bounds
    DirectionParams,
    /// ImageFormation.TxFrequencyProc from the collected band
    TxFrequencyProc,
    /// Geodetic image corners and valid data polygon
    GeoCorners,
    /// Algorithm reconciliation, SCP COA geometry and algorithm parameters
    ImageFormation,
    /// Radiometric scale factor polynomials
    Radiometric,
}

impl fmt::Display for DerivationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Execution order of the derivation steps
pub const DERIVATION_SEQUENCE: [DerivationStep; 9] = [
    DerivationStep::ScpTime,
    DerivationStep::TimeCoaPoly,
    DerivationStep::ArpPoly,
    DerivationStep::ScpGeodetic,
    DerivationStep::DirectionParams,
    DerivationStep::TxFrequencyProc,
    DerivationStep::GeoCorners,
    DerivationStep::ImageFormation,
    DerivationStep::Radiometric,
];

/// Steps executed and the findings they produced
#[derive(Debug, Clone, Default)]
pub struct DerivationReport {
    pub steps: Vec<DerivationStep>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Run every derivation step in order
pub fn derive(sicd: &mut Sicd) -> DerivationReport {
    let mut report = DerivationReport::default();
    for step in DERIVATION_SEQUENCE {
        let diagnostics = run_step(sicd, step);
        report.steps.push(step);
        report.diagnostics.extend(diagnostics);
    }
    report
}

/// Run a single step
pub fn run_step(sicd: &mut Sicd, step: DerivationStep) -> Vec<Diagnostic> {
    match step {
        DerivationStep::ScpTime => derive_scp_time(sicd),
        DerivationStep::TimeCoaPoly => derive_time_coa_poly(sicd),
        DerivationStep::ArpPoly => derive_arp_state(sicd),
        DerivationStep::ScpGeodetic => derive_scp_geodetic(sicd),
        DerivationStep::DirectionParams => derive_direction_params(sicd),
        DerivationStep::TxFrequencyProc => derive_tx_frequency_proc(sicd),
        DerivationStep::GeoCorners => derive_geo_corners(sicd),
        DerivationStep::ImageFormation => derive_image_formation(sicd),
        DerivationStep::Radiometric => radiometric::derive_scale_factors(sicd),
    }
}

fn derive_scp_time(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let Some(t) = sicd
        .grid
        .as_ref()
        .and_then(|g| g.time_coa_poly.as_ref())
        .map(|p| p.eval(0.0, 0.0))
    else {
        return Vec::new();
    };
    let scpcoa = sicd.scpcoa.get_or_insert_with(Default::default);
    if scpcoa.scp_time.is_none() {
        scpcoa.scp_time = Some(t);
    }
    Vec::new()
}

fn derive_time_coa_poly(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let spotlight = sicd
        .collection_info
        .as_ref()
        .map_or(false, |c| c.is_spotlight());
    let scp_time = sicd.scpcoa.as_ref().and_then(|s| s.scp_time);
    match (spotlight, scp_time, sicd.grid.as_mut()) {
        (true, Some(t), Some(grid)) if grid.time_coa_poly.is_none() => {
            grid.time_coa_poly = Some(Poly2D::constant(t));
            vec![Diagnostic::info(
                "Grid.TimeCOAPoly",
                format!("set to the constant SCP COA time {} for a spotlight collection", t),
            )]
        }
        _ => Vec::new(),
    }
}

fn derive_arp_state(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let Some(scp_time) = sicd.scpcoa.as_ref().and_then(|s| s.scp_time) else {
        return Vec::new();
    };
    let arp_poly = sicd.position.as_ref().and_then(|p| p.arp_poly.clone());

    match arp_poly {
        Some(poly) => {
            if let Some(coa) = sicd.scpcoa.as_mut() {
                coa.arp_pos.get_or_insert_with(|| poly.eval(scp_time));
                coa.arp_vel
                    .get_or_insert_with(|| poly.derivative_eval(scp_time, 1));
                coa.arp_acc
                    .get_or_insert_with(|| poly.derivative_eval(scp_time, 2));
            }
            Vec::new()
        }
        None => {
            let state = sicd
                .scpcoa
                .as_ref()
                .and_then(|c| {
                    Some((
                        c.arp_pos?,
                        c.arp_vel?,
                        c.arp_acc.unwrap_or_else(Vector3::zeros),
                    ))
                });
            let Some((pos, vel, acc)) = state else {
                return Vec::new();
            };
            match XyzPoly::from_state(pos, vel, acc, scp_time) {
                Ok(poly) => {
                    sicd.position.get_or_insert_with(Default::default).arp_poly = Some(poly);
                    vec![Diagnostic::info(
                        "Position.ARPPoly",
                        "built from the SCPCOA aperture position, velocity and acceleration",
                    )]
                }
                Err(e) => vec![Diagnostic::warning("Position.ARPPoly", e.to_string())],
            }
        }
    }
}

fn derive_scp_geodetic(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let Some(scp) = sicd.geo_data.as_mut().and_then(|g| g.scp.as_mut()) else {
        return Vec::new();
    };
    match (scp.ecf, scp.llh) {
        (Some(ecf), None) => match ecf_to_geodetic(&ecf) {
            Ok(llh) => scp.llh = Some(llh),
            Err(e) => return vec![Diagnostic::error("GeoData.SCP.LLH", e.to_string())],
        },
        (None, Some(llh)) => scp.ecf = Some(geodetic_to_ecf(&llh)),
        _ => {}
    }
    Vec::new()
}

/// Physical (x, y) sample positions spanning the image, corners included
fn image_sample_points(sicd: &Sicd, samples: usize) -> Option<Vec<(f64, f64)>> {
    let image = sicd.image_data.as_ref()?;
    let num_rows = image.num_rows? as f64;
    let num_cols = image.num_cols? as f64;
    let scp_pixel = image.scp_pixel?;
    let first_row = image.first_row.unwrap_or(0) as f64;
    let first_col = image.first_col.unwrap_or(0) as f64;
    let grid = sicd.grid.as_ref()?;
    let row_ss = grid.row.as_ref()?.ss?;
    let col_ss = grid.col.as_ref()?.ss?;

    let step = |end: f64, k: usize| end * k as f64 / (samples - 1).max(1) as f64;
    let mut points = Vec::with_capacity(samples * samples);
    for i in 0..samples {
        for j in 0..samples {
            let row = step(num_rows - 1.0, i) + first_row - scp_pixel.row as f64;
            let col = step(num_cols - 1.0, j) + first_col - scp_pixel.col as f64;
            points.push((row * row_ss, col * col_ss));
        }
    }
    Some(points)
}

/// Column DeltaKCOAPoly of an INCA product whose Doppler centroid marks COA
fn inca_col_delta_kcoa(sicd: &Sicd) -> Option<Poly2D> {
    let inca = sicd.rma.as_ref()?.inca.as_ref()?;
    if inca.dop_centroid_coa != Some(true) {
        return None;
    }
    let dt_dy = *inca.time_ca_poly.as_ref()?.coefs().get(1)?;
    Some(inca.dop_centroid_poly.as_ref()?.scaled(dt_dy))
}

fn derive_direction_params(sicd: &mut Sicd) -> Vec<Diagnostic> {
    const SAMPLES: usize = 5;
    if sicd.grid.is_none() {
        return Vec::new();
    }
    let inca_col = inca_col_delta_kcoa(sicd);
    let samples = image_sample_points(sicd, SAMPLES);

    let mut diagnostics = Vec::new();
    let Some(grid) = sicd.grid.as_mut() else {
        return diagnostics;
    };
    for (name, dir, default_poly) in [
        ("Grid.Row", grid.row.as_mut(), None),
        ("Grid.Col", grid.col.as_mut(), inca_col),
    ] {
        let Some(dir) = dir else {
            continue;
        };
        let poly = dir
            .delta_kcoa_poly
            .get_or_insert_with(|| default_poly.unwrap_or_else(|| Poly2D::constant(0.0)))
            .clone();
        if dir.delta_k1.is_some() || dir.delta_k2.is_some() {
            continue;
        }
        let (Some(bw), Some(ss), Some(points)) = (dir.imp_resp_bw, dir.ss, samples.as_ref()) else {
            diagnostics.push(Diagnostic::warning(
                format!("{}.DeltaK1", name),
                "ImpRespBW, SS and the image extent are required",
            ));
            continue;
        };

        let (lo, hi) = points
            .iter()
            .map(|&(x, y)| poly.eval(x, y))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        let mut k1 = lo - 0.5 * bw;
        let mut k2 = hi + 0.5 * bw;
        // Support wider than the sampling band wraps onto the full band
        let half_band = 0.5 / ss.abs();
        if k1 < -half_band || k2 > half_band {
            k1 = -half_band;
            k2 = half_band;
        }
        dir.delta_k1 = Some(k1);
        dir.delta_k2 = Some(k2);
    }
    diagnostics
}

fn derive_tx_frequency_proc(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let Some(band) = sicd
        .radar_collection
        .as_ref()
        .and_then(|r| r.tx_frequency.clone())
        .filter(|b| b.min.is_some() || b.max.is_some())
    else {
        return Vec::new();
    };
    let Some(formation) = sicd.image_formation.as_mut() else {
        return Vec::new();
    };
    let proc = formation.tx_frequency_proc.get_or_insert_with(Default::default);
    if proc.min_proc.is_none() {
        proc.min_proc = band.min;
    }
    if proc.max_proc.is_none() {
        proc.max_proc = band.max;
    }
    Vec::new()
}

/// Add `reference_frequency` (Hz) to every frequency stored as an offset
/// from it, then clear `RadarCollection.RefFreqIndex`.
pub fn apply_reference_frequency(sicd: &mut Sicd, reference_frequency: f64) -> SicdResult<()> {
    if !reference_frequency.is_finite() || reference_frequency <= 0.0 {
        return Err(SicdError::InvalidArgument(format!(
            "reference frequency must be positive, got {}",
            reference_frequency
        )));
    }
    let collection = sicd
        .radar_collection
        .as_mut()
        .ok_or_else(|| SicdError::MissingField("RadarCollection".to_string()))?;
    if collection.ref_freq_index.unwrap_or(0) == 0 {
        return Err(SicdError::InvalidArgument(
            "RadarCollection.RefFreqIndex is not set; frequencies are already absolute"
                .to_string(),
        ));
    }

    let shift = |value: &mut Option<f64>| {
        if let Some(v) = value.as_mut() {
            *v += reference_frequency;
        }
    };
    if let Some(band) = collection.tx_frequency.as_mut() {
        shift(&mut band.min);
        shift(&mut band.max);
    }
    collection.ref_freq_index = None;
    if let Some(proc) = sicd
        .image_formation
        .as_mut()
        .and_then(|f| f.tx_frequency_proc.as_mut())
    {
        shift(&mut proc.min_proc);
        shift(&mut proc.max_proc);
    }
    if let Some(inca) = sicd.rma.as_mut().and_then(|r| r.inca.as_mut()) {
        shift(&mut inca.freq_zero);
    }
    Ok(())
}

fn derive_geo_corners(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let Some(geo) = sicd.geo_data.as_ref() else {
        return Vec::new();
    };
    let need_corners = geo.image_corners.is_none();
    let valid_pixels = sicd
        .image_data
        .as_ref()
        .and_then(|d| d.valid_data.clone())
        .filter(|v| !v.is_empty() && geo.valid_data.is_none());
    if !need_corners && valid_pixels.is_none() {
        return Vec::new();
    }

    let context = match ProjectionContext::from_sicd(sicd, &AdjustableParameters::default()) {
        Ok(context) => context,
        Err(e) => {
            return vec![Diagnostic::warning(
                "GeoData.ImageCorners",
                format!("not derived, the product is not projectable yet: {}", e),
            )]
        }
    };

    let mut diagnostics = Vec::new();
    if need_corners {
        let vertices = sicd.image_data.as_ref().and_then(|d| d.corner_vertices());
        match vertices {
            Some(vertices) => {
                let pixels: Vec<(f64, f64)> = vertices.to_vec();
                match project_vertices(&context, &pixels) {
                    Some(corners) => {
                        if let Some(geo) = sicd.geo_data.as_mut() {
                            geo.image_corners = Some(corners);
                        }
                    }
                    None => diagnostics.push(Diagnostic::warning(
                        "GeoData.ImageCorners",
                        "image corners do not intersect the SCP height surface",
                    )),
                }
            }
            None => diagnostics.push(Diagnostic::warning(
                "GeoData.ImageCorners",
                "ImageData.NumRows and NumCols are required",
            )),
        }
    }

    if let Some(valid) = valid_pixels {
        let pixels: Vec<(f64, f64)> = valid
            .iter()
            .map(|p| (p.row as f64, p.col as f64))
            .collect();
        match project_vertices(&context, &pixels) {
            Some(points) => {
                if let Some(geo) = sicd.geo_data.as_mut() {
                    geo.valid_data = Some(points);
                }
            }
            None => diagnostics.push(Diagnostic::warning(
                "GeoData.ValidData",
                "valid data vertices do not intersect the SCP height surface",
            )),
        }
    }
    diagnostics
}

/// Project image vertices onto the SCP height; `None` if any vertex fails
fn project_vertices(
    context: &ProjectionContext,
    pixels: &[(f64, f64)],
) -> Option<Vec<GeodeticPoint>> {
    let mut image = Array2::zeros((pixels.len(), 2));
    for (i, &(row, col)) in pixels.iter().enumerate() {
        image[[i, 0]] = row;
        image[[i, 1]] = col;
    }
    let geo = context
        .image_to_ground_geo(&image, &ProjectionSurface::scp_hae(), CoordinateOrdering::LatLon)
        .ok()?;
    geo.outer_iter()
        .map(|row| GeodeticPoint::new(row[0], row[1], row[2]).ok())
        .collect()
}

fn derive_image_formation(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let mut diagnostics = reconcile_algorithm(sicd);
    diagnostics.extend(derive_scpcoa_geometry(sicd));

    let algo = sicd
        .image_formation
        .as_ref()
        .and_then(|f| f.image_form_algo.clone());
    match algo {
        Some(ImageFormAlgo::RgAzComp) => diagnostics.extend(derive_rgazcomp(sicd)),
        Some(ImageFormAlgo::Pfa) => diagnostics.extend(derive_pfa(sicd)),
        Some(ImageFormAlgo::Rma) => diagnostics.extend(derive_rma(sicd)),
        _ => {}
    }
    diagnostics
}

fn reconcile_algorithm(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let blocks = populated_algorithm_blocks(sicd);
    let Some(formation) = sicd.image_formation.as_mut() else {
        return Vec::new();
    };
    if formation.image_form_algo.is_some() {
        return Vec::new();
    }
    match blocks.as_slice() {
        [] => {
            formation.image_form_algo = Some(ImageFormAlgo::Other);
            vec![Diagnostic::info(
                "ImageFormation.ImageFormAlgo",
                "no algorithm block populated, set to OTHER",
            )]
        }
        [block] => {
            formation.image_form_algo = Some(block.as_form_algo());
            vec![Diagnostic::info(
                "ImageFormation.ImageFormAlgo",
                format!("set to {} from the populated block", block.block_name()),
            )]
        }
        _ => vec![Diagnostic::error(
            "ImageFormation.ImageFormAlgo",
            "cannot be set because several algorithm blocks are populated",
        )],
    }
}

/// Geometry of the scene center point at its COA time. Angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScpCoaGeometry {
    pub side_of_track: SideOfTrack,
    pub slant_range: f64,
    pub ground_range: f64,
    pub doppler_cone_ang: f64,
    pub graze_ang: f64,
    pub incidence_ang: f64,
    pub twist_ang: f64,
    pub slope_ang: f64,
    pub azim_ang: f64,
    pub layover_ang: f64,
}

fn clamp_unit(v: f64) -> f64 {
    v.clamp(-1.0, 1.0)
}

/// SCP COA geometry from the scene point and the aperture state
pub fn scp_coa_geometry(
    scp: &Vector3<f64>,
    arp: &Vector3<f64>,
    varp: &Vector3<f64>,
) -> ScpCoaGeometry {
    let los = scp - arp;
    let slant_range = los.norm();
    let ulos = los / slant_range;

    let left = arp.normalize().cross(&varp.normalize());
    let look = if left.dot(&ulos) < 0.0 { -1.0 } else { 1.0 };
    let side_of_track = if look > 0.0 {
        SideOfTrack::Left
    } else {
        SideOfTrack::Right
    };

    let ground_range = scp.norm() * clamp_unit(scp.dot(arp) / (scp.norm() * arp.norm())).acos();
    let doppler_cone_ang = clamp_unit(varp.normalize().dot(&ulos)).acos().to_degrees();

    // Ground plane normal and slant plane normal
    let etp = wgs84_norm(scp);
    let uspz = (varp.cross(&ulos) * look).normalize();

    let to_sensor = -ulos;
    let graze_ang = clamp_unit(etp.dot(&to_sensor)).asin().to_degrees();
    let ugpx = (to_sensor - etp * etp.dot(&to_sensor)).normalize();
    let ugpy = etp.cross(&ugpx);
    let twist_ang = -clamp_unit(ugpy.dot(&uspz)).asin().to_degrees();
    let slope_ang = clamp_unit(etp.dot(&uspz)).acos().to_degrees();

    let unorth = (Vector3::z() - etp * etp.z).normalize();
    let ueast = unorth.cross(&etp);
    let azim_ang = ugpx
        .dot(&ueast)
        .atan2(ugpx.dot(&unorth))
        .to_degrees()
        .rem_euclid(360.0);
    let layover = etp - uspz / etp.dot(&uspz);
    let layover_ang = layover
        .dot(&ueast)
        .atan2(layover.dot(&unorth))
        .to_degrees()
        .rem_euclid(360.0);

    ScpCoaGeometry {
        side_of_track,
        slant_range,
        ground_range,
        doppler_cone_ang,
        graze_ang,
        incidence_ang: 90.0 - graze_ang,
        twist_ang,
        slope_ang,
        azim_ang,
        layover_ang,
    }
}

fn derive_scpcoa_geometry(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let Some(scp) = sicd.scp_ecf() else {
        return Vec::new();
    };
    let Some(coa) = sicd.scpcoa.as_mut() else {
        return Vec::new();
    };
    let (Some(arp), Some(varp)) = (coa.arp_pos, coa.arp_vel) else {
        return vec![Diagnostic::warning(
            "SCPCOA",
            "ARPPos and ARPVel are required to derive the SCP COA geometry",
        )];
    };
    let g = scp_coa_geometry(&scp, &arp, &varp);

    let mut diagnostics = Vec::new();
    match coa.side_of_track {
        None => coa.side_of_track = Some(g.side_of_track),
        Some(side) if side != g.side_of_track => diagnostics.push(Diagnostic::warning(
            "SCPCOA.SideOfTrack",
            format!("populated as {} but the geometry indicates {}", side, g.side_of_track),
        )),
        _ => {}
    }
    coa.slant_range.get_or_insert(g.slant_range);
    coa.ground_range.get_or_insert(g.ground_range);
    coa.doppler_cone_ang.get_or_insert(g.doppler_cone_ang);
    coa.graze_ang.get_or_insert(g.graze_ang);
    coa.incidence_ang.get_or_insert(g.incidence_ang);
    coa.twist_ang.get_or_insert(g.twist_ang);
    coa.slope_ang.get_or_insert(g.slope_ang);
    coa.azim_ang.get_or_insert(g.azim_ang);
    coa.layover_ang.get_or_insert(g.layover_ang);
    diagnostics
}

/// State needed by the algorithm specific steps
struct CoaState {
    scp: Vector3<f64>,
    arp: Vector3<f64>,
    varp: Vector3<f64>,
    look: f64,
}

fn coa_state(sicd: &Sicd) -> Option<CoaState> {
    let scp = sicd.scp_ecf()?;
    let coa = sicd.scpcoa.as_ref()?;
    Some(CoaState {
        scp,
        arp: coa.arp_pos?,
        varp: coa.arp_vel?,
        look: coa.side_of_track?.look(),
    })
}

fn grid_dirs(grid: &mut Grid) -> (&mut DirParam, &mut DirParam) {
    let row = grid.row.get_or_insert_with(Default::default);
    let col = grid.col.get_or_insert_with(Default::default);
    (row, col)
}

fn derive_rgazcomp(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let Some(state) = coa_state(sicd) else {
        return vec![Diagnostic::warning(
            "RgAzComp",
            "SCP, SCPCOA aperture state and side of track are required",
        )];
    };
    let los = state.scp - state.arp;
    let ulos = los.normalize();
    let uspn = (ulos.cross(&state.varp) * -state.look).normalize();

    let grid = sicd.grid.get_or_insert_with(Default::default);
    grid.grid_type.get_or_insert(GridType::RgAzim);
    let (row, col) = grid_dirs(grid);
    row.uvect_ecf.get_or_insert(ulos);
    col.uvect_ecf.get_or_insert(uspn.cross(&ulos));

    let dca = sicd
        .scpcoa
        .as_ref()
        .and_then(|c| c.doppler_cone_ang)
        .map(f64::to_radians)
        .unwrap_or_else(|| clamp_unit(state.varp.normalize().dot(&ulos)).acos());
    let rgazcomp = sicd.rg_az_comp.get_or_insert_with(RgAzComp::default);
    rgazcomp
        .az_sf
        .get_or_insert(-state.look * dca.sin() / los.norm());
    Vec::new()
}

fn derive_pfa(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let Some(state) = coa_state(sicd) else {
        return vec![Diagnostic::warning(
            "PFA",
            "SCP, SCPCOA aperture state and side of track are required",
        )];
    };
    let scp_time = sicd.scpcoa.as_ref().and_then(|c| c.scp_time);
    let arp_poly = sicd.position.as_ref().and_then(|p| p.arp_poly.clone());

    let pfa = sicd.pfa.get_or_insert_with(Pfa::default);
    if pfa.polar_ang_ref_time.is_none() {
        pfa.polar_ang_ref_time = scp_time;
    }
    let fpn = *pfa.fpn.get_or_insert_with(|| wgs84_norm(&state.scp));
    let ipn = *pfa.ipn.get_or_insert_with(|| {
        ((state.arp - state.scp).cross(&state.varp) * state.look).normalize()
    });
    let ref_time = pfa.polar_ang_ref_time;

    let arp_ref = match (arp_poly, ref_time) {
        (Some(poly), Some(t)) => poly.eval(t),
        _ => state.arp,
    };
    let denom = fpn.dot(&ipn);
    if denom == 0.0 {
        return vec![Diagnostic::warning(
            "PFA.FPN",
            "focus plane normal is parallel to the image plane",
        )];
    }
    let distance = (state.scp - arp_ref).dot(&ipn) / denom;
    let arp_proj = arp_ref + fpn * distance;
    let urow = (state.scp - arp_proj).normalize();
    let ucol = ipn.cross(&urow);

    let grid = sicd.grid.get_or_insert_with(Default::default);
    grid.grid_type.get_or_insert(GridType::RgAzim);
    let (row, col) = grid_dirs(grid);
    row.uvect_ecf.get_or_insert(urow);
    col.uvect_ecf.get_or_insert(ucol);
    Vec::new()
}

fn derive_rma(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let Some(scp) = sicd.scp_ecf() else {
        return diagnostics;
    };
    let arp_poly = sicd.position.as_ref().and_then(|p| p.arp_poly.clone());
    let Some(inca) = sicd.rma.as_mut().and_then(|r| r.inca.as_mut()) else {
        return diagnostics;
    };
    let (Some(arp_poly), Some(time_ca_poly)) = (arp_poly, inca.time_ca_poly.clone()) else {
        diagnostics.push(Diagnostic::warning(
            "RMA.INCA",
            "Position.ARPPoly and INCA.TimeCAPoly are required",
        ));
        return diagnostics;
    };
    let varp_poly = arp_poly.derivative(1);

    let t_ca = time_ca_poly.eval(0.0);
    let arp_ca = arp_poly.eval(t_ca);
    let varp_ca = varp_poly.eval(t_ca);
    inca.r_ca_scp.get_or_insert((arp_ca - scp).norm());

    let urow = (scp - arp_ca).normalize();
    let vperp = varp_ca - urow * varp_ca.dot(&urow);
    let ucol = vperp.normalize();

    let grid = sicd.grid.get_or_insert_with(Default::default);
    grid.grid_type.get_or_insert(GridType::RgZero);
    let (row, col) = grid_dirs(grid);
    row.uvect_ecf.get_or_insert(urow);
    col.uvect_ecf.get_or_insert(ucol);

    let wants_fit = grid.time_coa_poly.is_none()
        && sicd
            .rma
            .as_ref()
            .and_then(|r| r.inca.as_ref())
            .map_or(false, |i| i.dop_centroid_coa == Some(true));
    if wants_fit {
        match fit_time_coa_poly(sicd, &varp_poly) {
            Ok((poly, fit_diag)) => {
                if let Some(grid) = sicd.grid.as_mut() {
                    grid.time_coa_poly = Some(poly);
                }
                diagnostics.push(fit_diag);
            }
            Err(diag) => diagnostics.push(diag),
        }
    }
    diagnostics
}

/// Fit TimeCOAPoly over the image from the INCA Doppler centroid and rate
fn fit_time_coa_poly(sicd: &Sicd, varp_poly: &XyzPoly) -> Result<(Poly2D, Diagnostic), Diagnostic> {
    const ORDER: usize = 2;
    let field = "Grid.TimeCOAPoly";
    let fail = |what: &str| {
        Diagnostic::warning(
            field,
            format!("cannot fit from INCA: {} is not populated", what),
        )
    };

    let inca = sicd
        .rma
        .as_ref()
        .and_then(|r| r.inca.as_ref())
        .ok_or_else(|| fail("RMA.INCA"))?;
    let dop_centroid = inca.dop_centroid_poly.as_ref().ok_or_else(|| fail("DopCentroidPoly"))?;
    let drate_sf = inca.drate_sf_poly.as_ref().ok_or_else(|| fail("DRateSFPoly"))?;
    let time_ca = inca.time_ca_poly.as_ref().ok_or_else(|| fail("TimeCAPoly"))?;
    let freq_zero = inca.freq_zero.ok_or_else(|| fail("FreqZero"))?;
    let r_ca_scp = inca.r_ca_scp.ok_or_else(|| fail("R_CA_SCP"))?;

    let image = sicd.image_data.as_ref().ok_or_else(|| fail("ImageData"))?;
    let num_rows = image.num_rows.ok_or_else(|| fail("ImageData.NumRows"))? as f64;
    let num_cols = image.num_cols.ok_or_else(|| fail("ImageData.NumCols"))? as f64;
    let scp_pixel = image.scp_pixel.ok_or_else(|| fail("ImageData.SCPPixel"))?;
    let first_row = image.first_row.unwrap_or(0) as f64;
    let first_col = image.first_col.unwrap_or(0) as f64;
    let grid = sicd.grid.as_ref().ok_or_else(|| fail("Grid"))?;
    let row_ss = grid.row.as_ref().and_then(|r| r.ss).ok_or_else(|| fail("Grid.Row.SS"))?;
    let col_ss = grid.col.as_ref().and_then(|c| c.ss).ok_or_else(|| fail("Grid.Col.SS"))?;

    let samples = ORDER + 3;
    let linspace = |end: f64| -> Vec<f64> {
        (0..samples)
            .map(|k| end * k as f64 / (samples - 1) as f64)
            .collect()
    };
    let xs: Vec<f64> = linspace(num_rows - 1.0)
        .into_iter()
        .map(|r| (r + first_row - scp_pixel.row as f64) * row_ss)
        .collect();
    let ys: Vec<f64> = linspace(num_cols - 1.0)
        .into_iter()
        .map(|c| (c + first_col - scp_pixel.col as f64) * col_ss)
        .collect();

    let mut x_flat = Vec::with_capacity(samples * samples);
    let mut y_flat = Vec::with_capacity(samples * samples);
    let mut t_flat = Vec::with_capacity(samples * samples);
    for &x in &xs {
        for &y in &ys {
            let t_ca = time_ca.eval(y);
            let v_ca_sq = varp_poly.eval(t_ca).norm_squared();
            let dop_rate = -2.0 * freq_zero / SPEED_OF_LIGHT * drate_sf.eval(x, y) * v_ca_sq
                / (r_ca_scp + x);
            x_flat.push(x);
            y_flat.push(y);
            t_flat.push(t_ca + dop_centroid.eval(x, y) / dop_rate);
        }
    }
    if t_flat.iter().any(|t| !t.is_finite()) {
        return Err(Diagnostic::warning(field, "Doppler rate vanishes inside the image"));
    }

    let fit = two_dim_poly_fit(
        &Array1::from(x_flat),
        &Array1::from(y_flat),
        &Array1::from(t_flat),
        ORDER,
        ORDER,
        1e-3,
        1e-3,
    )
    .map_err(|e| Diagnostic::warning(field, e.to_string()))?;

    let diag = Diagnostic::info(
        field,
        format!(
            "fit from INCA Doppler centroid: rms residual {:.3e} s, rank {}",
            fit.rms_residual, fit.rank
        ),
    );
    Ok((fit.poly, diag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geocoords::WGS84_A;
    use crate::core::polynomial::Poly1D;
    use crate::metadata::{
        CollectionInfo, GeoData, GeoScp, ImageData, ImageFormation, Inca, Position,
        RadarCollection, RadarMode, Rma, ScpCoa, TxFrequency,
    };
    use crate::types::{RadarModeType, RowCol};
    use approx::assert_relative_eq;

    fn scp() -> Vector3<f64> {
        Vector3::new(WGS84_A, 0.0, 0.0)
    }

    fn arp0() -> Vector3<f64> {
        Vector3::new(WGS84_A + 500_000.0, (800_000.0f64.powi(2) - 500_000.0f64.powi(2)).sqrt(), 0.0)
    }

    fn velocity() -> Vector3<f64> {
        Vector3::new(0.0, 0.0, 7500.0)
    }

    #[test]
    fn test_sequence_order() {
        let mut sicd = Sicd::default();
        let report = derive(&mut sicd);
        assert_eq!(report.steps, DERIVATION_SEQUENCE.to_vec());
        assert_eq!(DERIVATION_SEQUENCE[0], DerivationStep::ScpTime);
        assert_eq!(DERIVATION_SEQUENCE.last(), Some(&DerivationStep::Radiometric));
    }

    #[test]
    fn test_spotlight_time_coa_poly() {
        let mut sicd = Sicd::default();
        sicd.collection_info = Some(CollectionInfo {
            radar_mode: Some(RadarMode {
                mode_type: Some(RadarModeType::Spotlight),
                mode_id: None,
            }),
            ..Default::default()
        });
        sicd.grid = Some(Grid::default());
        sicd.scpcoa = Some(ScpCoa {
            scp_time: Some(2.25),
            ..Default::default()
        });
        derive(&mut sicd);
        let poly = sicd.grid.unwrap().time_coa_poly.unwrap();
        assert!(poly.is_constant());
        assert_eq!(poly.eval(100.0, -50.0), 2.25);
    }

    #[test]
    fn test_scp_time_from_time_coa_poly() {
        let mut sicd = Sicd::default();
        sicd.grid = Some(Grid {
            time_coa_poly: Some(Poly2D::from_rows(&[vec![1.75, 1e-4], vec![2e-5, 0.0]]).unwrap()),
            ..Default::default()
        });
        run_step(&mut sicd, DerivationStep::ScpTime);
        assert_eq!(sicd.scpcoa.unwrap().scp_time, Some(1.75));
    }

    #[test]
    fn test_arp_poly_from_scpcoa_state() {
        let mut sicd = Sicd::default();
        let acc = Vector3::new(-7.0, 0.0, 0.1);
        sicd.scpcoa = Some(ScpCoa {
            scp_time: Some(3.0),
            arp_pos: Some(arp0()),
            arp_vel: Some(velocity()),
            arp_acc: Some(acc),
            ..Default::default()
        });
        let diagnostics = run_step(&mut sicd, DerivationStep::ArpPoly);
        assert_eq!(diagnostics.len(), 1);

        let poly = sicd.position.unwrap().arp_poly.unwrap();
        assert_relative_eq!(poly.eval(3.0), arp0(), max_relative = 1e-12);
        assert_relative_eq!(poly.derivative_eval(3.0, 1), velocity(), max_relative = 1e-9);
        assert_relative_eq!(poly.derivative_eval(0.0, 2), acc, max_relative = 1e-9);
    }

    #[test]
    fn test_scpcoa_state_from_arp_poly() {
        let mut sicd = Sicd::default();
        let p0 = arp0();
        sicd.position = Some(Position {
            arp_poly: Some(XyzPoly::new(
                Poly1D::from_slice(&[p0.x]),
                Poly1D::from_slice(&[p0.y]),
                Poly1D::from_slice(&[0.0, 7500.0]),
            )),
        });
        sicd.scpcoa = Some(ScpCoa {
            scp_time: Some(2.0),
            ..Default::default()
        });
        run_step(&mut sicd, DerivationStep::ArpPoly);
        let coa = sicd.scpcoa.unwrap();
        assert_relative_eq!(coa.arp_pos.unwrap().z, 15_000.0);
        assert_relative_eq!(coa.arp_vel.unwrap(), velocity());
        assert_relative_eq!(coa.arp_acc.unwrap(), Vector3::zeros());
    }

    #[test]
    fn test_scp_geodetic_completion() {
        let mut sicd = Sicd::default();
        sicd.geo_data = Some(GeoData {
            scp: Some(GeoScp {
                ecf: None,
                llh: Some(GeodeticPoint::new(0.0, 0.0, 0.0).unwrap()),
            }),
            ..Default::default()
        });
        run_step(&mut sicd, DerivationStep::ScpGeodetic);
        let ecf = sicd.scp_ecf().unwrap();
        assert!((ecf - scp()).norm() < 1e-6);
    }

    #[test]
    fn test_scp_coa_geometry_left_looking() {
        let g = scp_coa_geometry(&scp(), &arp0(), &velocity());
        assert_eq!(g.side_of_track, SideOfTrack::Left);
        assert_relative_eq!(g.slant_range, 800_000.0, max_relative = 1e-12);
        assert_relative_eq!(g.doppler_cone_ang, 90.0, epsilon = 1e-9);
        let graze = (500_000.0f64 / 800_000.0).asin().to_degrees();
        assert_relative_eq!(g.graze_ang, graze, epsilon = 1e-9);
        assert_relative_eq!(g.incidence_ang, 90.0 - graze, epsilon = 1e-9);
        assert_relative_eq!(g.slope_ang, graze, epsilon = 1e-9);
        assert!(g.twist_ang.abs() < 1e-9);
        assert_relative_eq!(g.azim_ang, 90.0, epsilon = 1e-9);
        assert_relative_eq!(g.layover_ang, 90.0, epsilon = 1e-9);

        let right = scp_coa_geometry(&scp(), &arp0(), &(-velocity()));
        assert_eq!(right.side_of_track, SideOfTrack::Right);
    }

    #[test]
    fn test_rgazcomp_parameters() {
        let mut sicd = Sicd::default();
        sicd.geo_data = Some(GeoData {
            scp: Some(GeoScp {
                ecf: Some(scp()),
                llh: None,
            }),
            ..Default::default()
        });
        sicd.image_formation = Some(ImageFormation {
            image_form_algo: Some(ImageFormAlgo::RgAzComp),
            ..Default::default()
        });
        sicd.scpcoa = Some(ScpCoa {
            scp_time: Some(0.0),
            arp_pos: Some(arp0()),
            arp_vel: Some(velocity()),
            ..Default::default()
        });
        run_step(&mut sicd, DerivationStep::ImageFormation);

        let grid = sicd.grid.as_ref().unwrap();
        assert_eq!(grid.grid_type, Some(GridType::RgAzim));
        let urow = grid.row.as_ref().unwrap().uvect_ecf.unwrap();
        let ucol = grid.col.as_ref().unwrap().uvect_ecf.unwrap();
        assert!(urow.dot(&ucol).abs() < 1e-12);
        assert_relative_eq!(urow, (scp() - arp0()).normalize(), epsilon = 1e-12);
        // Left looking: columns run against the platform velocity
        assert_relative_eq!(ucol, Vector3::new(0.0, 0.0, -1.0), epsilon = 1e-12);

        let az_sf = sicd.rg_az_comp.unwrap().az_sf.unwrap();
        assert_relative_eq!(az_sf, -1.0 / 800_000.0, max_relative = 1e-9);
    }

    fn direction_sicd() -> Sicd {
        let mut sicd = Sicd::default();
        sicd.image_data = Some(ImageData {
            num_rows: Some(101),
            num_cols: Some(201),
            first_row: Some(0),
            first_col: Some(0),
            scp_pixel: Some(RowCol::new(50, 100)),
            valid_data: None,
        });
        sicd.grid = Some(Grid {
            row: Some(DirParam {
                ss: Some(0.5),
                imp_resp_bw: Some(1.5),
                ..Default::default()
            }),
            col: Some(DirParam {
                ss: Some(0.25),
                imp_resp_bw: Some(4.5),
                ..Default::default()
            }),
            ..Default::default()
        });
        sicd
    }

    #[test]
    fn test_direction_params_defaults() {
        let mut sicd = direction_sicd();
        let diagnostics = run_step(&mut sicd, DerivationStep::DirectionParams);
        assert!(diagnostics.is_empty());

        let grid = sicd.grid.as_ref().unwrap();
        let row = grid.row.as_ref().unwrap();
        assert_eq!(row.delta_kcoa_poly, Some(Poly2D::constant(0.0)));
        assert_relative_eq!(row.delta_k1.unwrap(), -0.75);
        assert_relative_eq!(row.delta_k2.unwrap(), 0.75);

        // 4.5 cycles/m exceeds the 4 cycles/m sampled band and wraps
        let col = grid.col.as_ref().unwrap();
        assert_relative_eq!(col.delta_k1.unwrap(), -2.0);
        assert_relative_eq!(col.delta_k2.unwrap(), 2.0);
    }

    #[test]
    fn test_direction_params_keep_populated_bounds() {
        let mut sicd = direction_sicd();
        if let Some(row) = sicd.grid.as_mut().and_then(|g| g.row.as_mut()) {
            row.delta_k1 = Some(-0.1);
            row.delta_k2 = Some(0.2);
            row.delta_kcoa_poly = Some(Poly2D::constant(0.05));
        }
        if let Some(col) = sicd.grid.as_mut().and_then(|g| g.col.as_mut()) {
            col.imp_resp_bw = None;
        }
        let diagnostics = run_step(&mut sicd, DerivationStep::DirectionParams);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].field, "Grid.Col.DeltaK1");

        let row = sicd.grid.as_ref().unwrap().row.clone().unwrap();
        assert_eq!(row.delta_k1, Some(-0.1));
        assert_eq!(row.delta_k2, Some(0.2));
        assert_eq!(row.delta_kcoa_poly, Some(Poly2D::constant(0.05)));
    }

    #[test]
    fn test_inca_col_delta_kcoa_from_doppler_centroid() {
        let mut sicd = direction_sicd();
        if let Some(col) = sicd.grid.as_mut().and_then(|g| g.col.as_mut()) {
            col.imp_resp_bw = Some(1.0);
        }
        sicd.rma = Some(Rma {
            inca: Some(Inca {
                time_ca_poly: Some(Poly1D::from_slice(&[0.0, 1.0 / 7500.0])),
                dop_centroid_poly: Some(Poly2D::from_rows(&[vec![10.0, 0.01]]).unwrap()),
                dop_centroid_coa: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        });
        run_step(&mut sicd, DerivationStep::DirectionParams);

        let col = sicd.grid.as_ref().unwrap().col.clone().unwrap();
        let poly = col.delta_kcoa_poly.unwrap();
        assert_relative_eq!(poly.eval(0.0, 0.0), 10.0 / 7500.0, max_relative = 1e-12);
        // Columns span y in [-25, 25] m
        assert_relative_eq!(col.delta_k1.unwrap(), 9.75 / 7500.0 - 0.5, max_relative = 1e-12);
        assert_relative_eq!(col.delta_k2.unwrap(), 10.25 / 7500.0 + 0.5, max_relative = 1e-12);
    }

    #[test]
    fn test_tx_frequency_proc_and_reference_frequency() {
        let mut sicd = Sicd::default();
        sicd.radar_collection = Some(RadarCollection {
            tx_frequency: Some(TxFrequency {
                min: Some(1.0e8),
                max: Some(2.0e8),
            }),
            ref_freq_index: Some(1),
            ..Default::default()
        });
        sicd.image_formation = Some(ImageFormation::default());
        sicd.rma = Some(Rma {
            inca: Some(Inca {
                freq_zero: Some(1.5e8),
                ..Default::default()
            }),
            ..Default::default()
        });

        run_step(&mut sicd, DerivationStep::TxFrequencyProc);
        let proc = sicd
            .image_formation
            .as_ref()
            .unwrap()
            .tx_frequency_proc
            .clone()
            .unwrap();
        assert_eq!(proc.min_proc, Some(1.0e8));
        assert_eq!(proc.max_proc, Some(2.0e8));

        apply_reference_frequency(&mut sicd, 9.5e9).unwrap();
        let collection = sicd.radar_collection.as_ref().unwrap();
        assert_eq!(collection.ref_freq_index, None);
        assert_relative_eq!(collection.tx_frequency.as_ref().unwrap().min.unwrap(), 9.6e9);
        let proc = sicd
            .image_formation
            .as_ref()
            .unwrap()
            .tx_frequency_proc
            .as_ref()
            .unwrap();
        assert_relative_eq!(proc.max_proc.unwrap(), 9.7e9);
        let inca = sicd.rma.as_ref().unwrap().inca.as_ref().unwrap();
        assert_relative_eq!(inca.freq_zero.unwrap(), 9.65e9);

        // Already absolute
        assert!(matches!(
            apply_reference_frequency(&mut sicd, 9.5e9),
            Err(SicdError::InvalidArgument(_))
        ));
        assert!(matches!(
            apply_reference_frequency(&mut Sicd::default(), 9.5e9),
            Err(SicdError::MissingField(_))
        ));
    }
}
