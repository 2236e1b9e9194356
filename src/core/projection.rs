//! Center-Of-Aperture projection engine
//!
//! Maps image pixel coordinates to the COA time, aperture position/velocity
//! and range/range-rate of the imaged point, then intersects that
//! range-Doppler contour with a ground surface (plane, constant height or a
//! DEM). The inverse direction (`ground_to_image`) iterates over ground
//! plane corrections until the projected point reproduces the scene point.

use crate::core::geocoords::{
    ecf_to_geodetic, ecf_to_geodetic_array, geodetic_to_ecf, geodetic_to_ecf_array,
    ric_ecf_matrix, wgs84_norm, RicFrame,
};
use crate::core::polynomial::{Poly1D, Poly2D, XyzPoly};
use crate::core::validation::{resolve_image_formation, Diagnostic, ImageFormationAlgorithm};
use crate::io::dem::DemSurface;
use crate::metadata::{DirParam, Sicd};
use crate::types::{
    AdjustFrame, CoordinateOrdering, GeodeticPoint, GridType, ProjectionType, SicdError,
    SicdResult,
};
use nalgebra::{Matrix2, Vector2, Vector3};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Offsets applied to the aperture state and range at COA
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustableParameters {
    /// ARP position offset (m), expressed in `frame`
    pub delta_arp: Vector3<f64>,
    /// ARP velocity offset (m/s), expressed in `frame`
    pub delta_varp: Vector3<f64>,
    /// Range bias (m)
    pub range_bias: f64,
    pub frame: AdjustFrame,
}

impl Default for AdjustableParameters {
    fn default() -> Self {
        Self {
            delta_arp: Vector3::zeros(),
            delta_varp: Vector3::zeros(),
            range_bias: 0.0,
            frame: AdjustFrame::Ecf,
        }
    }
}

/// Projection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    pub delta_arp: [f64; 3],
    pub delta_varp: [f64; 3],
    pub range_bias: f64,
    pub adj_params_frame: AdjustFrame,
    /// Surface used by image to ground projection
    pub projection_type: ProjectionType,
    /// Use the context cached on the metadata instead of building one
    /// from the adjustable parameters above
    pub use_sicd_coa: bool,
    /// Ground to image convergence tolerance (m)
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Height convergence tolerance for HAE/DEM projection (m)
    pub hae_tolerance: f64,
    pub hae_max_iterations: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            delta_arp: [0.0; 3],
            delta_varp: [0.0; 3],
            range_bias: 0.0,
            adj_params_frame: AdjustFrame::Ecf,
            projection_type: ProjectionType::Hae,
            use_sicd_coa: true,
            // 1 mm ground residual
            tolerance: 1e-3,
            max_iterations: 10,
            // 1 m height residual
            hae_tolerance: 1.0,
            hae_max_iterations: 10,
        }
    }
}

impl ProjectionConfig {
    /// Parse from JSON. Enumerated values are checked strictly, so an
    /// unknown frame or surface is `UnsupportedConfiguration` rather than a
    /// generic JSON error.
    pub fn from_json_str(json: &str) -> SicdResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        for key in ["adj_params_frame", "projection_type"] {
            if let Some(raw) = value.get(key) {
                let Some(text) = raw.as_str() else {
                    return Err(SicdError::UnsupportedConfiguration(format!(
                        "{} must be a string, got {}",
                        key, raw
                    )));
                };
                match key {
                    "adj_params_frame" => {
                        text.parse::<AdjustFrame>()?;
                    }
                    _ => {
                        text.parse::<ProjectionType>()?;
                    }
                }
            }
        }
        let config: ProjectionConfig = serde_json::from_value(value)?;
        config.check()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SicdResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn adjustable_parameters(&self) -> AdjustableParameters {
        AdjustableParameters {
            delta_arp: Vector3::from(self.delta_arp),
            delta_varp: Vector3::from(self.delta_varp),
            range_bias: self.range_bias,
            frame: self.adj_params_frame,
        }
    }

    fn check(&self) -> SicdResult<()> {
        if !(self.tolerance >= 0.0) || !(self.hae_tolerance >= 0.0) {
            return Err(SicdError::InvalidArgument(
                "projection tolerances must be non-negative".to_string(),
            ));
        }
        if self.max_iterations == 0 || self.hae_max_iterations == 0 {
            return Err(SicdError::InvalidArgument(
                "projection iteration limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Aperture state and range geometry of one image point at its COA time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoaPoint {
    pub time: f64,
    pub arp: Vector3<f64>,
    pub varp: Vector3<f64>,
    pub range: f64,
    pub range_rate: f64,
}

/// Surface intersected by image to ground projection
#[derive(Clone, Copy)]
pub enum ProjectionSurface<'a> {
    /// Plane through `reference` with normal `normal`; `None` selects the
    /// SCP and the image plane normal
    Plane {
        reference: Option<Vector3<f64>>,
        normal: Option<Vector3<f64>>,
    },
    /// Constant height above the ellipsoid; `None` selects the SCP height
    Hae {
        hae: Option<f64>,
        tolerance: f64,
        max_iterations: usize,
    },
    /// Height from a DEM callback, refined by fixed point iteration
    Dem {
        dem: &'a dyn DemSurface,
        tolerance: f64,
        max_iterations: usize,
    },
}

impl<'a> ProjectionSurface<'a> {
    pub fn scp_plane() -> Self {
        ProjectionSurface::Plane {
            reference: None,
            normal: None,
        }
    }

    pub fn scp_hae() -> Self {
        ProjectionSurface::Hae {
            hae: None,
            tolerance: 1.0,
            max_iterations: 10,
        }
    }

    pub fn hae(hae: f64) -> Self {
        ProjectionSurface::Hae {
            hae: Some(hae),
            tolerance: 1.0,
            max_iterations: 10,
        }
    }

    pub fn dem(dem: &'a dyn DemSurface) -> Self {
        ProjectionSurface::Dem {
            dem,
            tolerance: 1.0,
            max_iterations: 10,
        }
    }

    /// Surface selected by a configuration. `Dem` needs the callback.
    pub fn from_config(
        config: &ProjectionConfig,
        dem: Option<&'a dyn DemSurface>,
    ) -> SicdResult<Self> {
        match config.projection_type {
            ProjectionType::Plane => Ok(Self::scp_plane()),
            ProjectionType::Hae => Ok(ProjectionSurface::Hae {
                hae: None,
                tolerance: config.hae_tolerance,
                max_iterations: config.hae_max_iterations,
            }),
            ProjectionType::Dem => {
                let dem = dem.ok_or_else(|| {
                    SicdError::InvalidArgument(
                        "DEM projection requested without a DEM surface".to_string(),
                    )
                })?;
                Ok(ProjectionSurface::Dem {
                    dem,
                    tolerance: config.hae_tolerance,
                    max_iterations: config.hae_max_iterations,
                })
            }
        }
    }
}

/// Output of ground to image projection
#[derive(Debug, Clone)]
pub struct GroundToImageResult {
    /// `N x 2` (row, col); the upper left pixel of the image is (0, 0)
    pub image_points: Array2<f64>,
    /// Final ground plane residual per point (m)
    pub residuals: Array1<f64>,
    /// Iterations performed, maximum over the batch
    pub iterations: usize,
}

/// Single point result of ground to image projection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImagePoint {
    pub row: f64,
    pub col: f64,
    pub residual: f64,
    pub iterations: usize,
}

/// Range/range-rate model selected by grid type and image formation
#[derive(Debug, Clone)]
enum CoaBranch {
    Pfa {
        polar_ang_poly: Poly1D,
        polar_ang_rate_poly: Poly1D,
        spatial_freq_sf_poly: Poly1D,
        spatial_freq_sf_rate_poly: Poly1D,
    },
    RgAzComp {
        az_sf: f64,
    },
    Inca {
        r_ca_scp: f64,
        time_ca_poly: Poly1D,
        drate_sf_poly: Poly2D,
    },
    Plane {
        row_uvect: Vector3<f64>,
        col_uvect: Vector3<f64>,
    },
}

/// Immutable snapshot of everything the projection needs
#[derive(Debug, Clone)]
pub struct ProjectionContext {
    params: AdjustableParameters,
    delta_arp: Vector3<f64>,
    delta_varp: Vector3<f64>,
    range_bias: f64,
    arp_poly: XyzPoly,
    varp_poly: XyzPoly,
    time_coa_poly: Poly2D,
    row_ss: f64,
    col_ss: f64,
    first_row: f64,
    first_col: f64,
    scp_row: f64,
    scp_col: f64,
    scp: Vector3<f64>,
    scp_hae: f64,
    scp_arp: Vector3<f64>,
    scp_varp: Vector3<f64>,
    row_uvect: Option<Vector3<f64>>,
    col_uvect: Option<Vector3<f64>>,
    look: f64,
    grid_type: GridType,
    branch: CoaBranch,
    diagnostics: Vec<Diagnostic>,
}

fn missing(field: &str) -> SicdError {
    SicdError::MissingField(field.to_string())
}

/// COA time polynomial, or a constant fallback with a warning
fn time_coa_poly(sicd: &Sicd) -> SicdResult<(Poly2D, Option<Diagnostic>)> {
    if let Some(poly) = sicd.grid.as_ref().and_then(|g| g.time_coa_poly.as_ref()) {
        return Ok((poly.clone(), None));
    }
    if let Some(scp_time) = sicd.scpcoa.as_ref().and_then(|s| s.scp_time) {
        return Ok((
            Poly2D::constant(scp_time),
            Some(Diagnostic::warning(
                "Grid.TimeCOAPoly",
                format!(
                    "not populated; using the constant SCPCOA.SCPTime {} as COA time",
                    scp_time
                ),
            )),
        ));
    }
    if let Some(duration) = sicd.timeline.as_ref().and_then(|t| t.collect_duration) {
        return Ok((
            Poly2D::constant(0.5 * duration),
            Some(Diagnostic::warning(
                "Grid.TimeCOAPoly",
                format!(
                    "not populated; using half the collect duration {} as COA time",
                    0.5 * duration
                ),
            )),
        ));
    }
    Err(missing("Grid.TimeCOAPoly"))
}

/// COA time of the scene center point, when it can be determined
pub(crate) fn scp_coa_time(sicd: &Sicd) -> Option<f64> {
    sicd.scpcoa
        .as_ref()
        .and_then(|s| s.scp_time)
        .or_else(|| time_coa_poly(sicd).ok().map(|(p, _)| p.eval(0.0, 0.0)))
}

fn unit_vector(dir: &DirParam) -> Option<Vector3<f64>> {
    dir.uvect_ecf
        .filter(|v| v.norm() > 0.0)
        .map(|v| v.normalize())
}

fn branch_parameters(sicd: &Sicd, grid_type: &GridType) -> SicdResult<CoaBranch> {
    let grid = sicd.grid.as_ref().ok_or_else(|| missing("Grid"))?;
    match grid_type {
        GridType::RgAzim => {
            let declared = sicd
                .image_formation
                .as_ref()
                .and_then(|f| f.image_form_algo.as_ref());
            match resolve_image_formation(sicd)? {
                ImageFormationAlgorithm::Pfa => {
                    let pfa = sicd.pfa.as_ref().ok_or_else(|| missing("PFA"))?;
                    let polar = pfa
                        .polar_ang_poly
                        .as_ref()
                        .ok_or_else(|| missing("PFA.PolarAngPoly"))?;
                    let ksf = pfa
                        .spatial_freq_sf_poly
                        .as_ref()
                        .ok_or_else(|| missing("PFA.SpatialFreqSFPoly"))?;
                    Ok(CoaBranch::Pfa {
                        polar_ang_poly: polar.clone(),
                        polar_ang_rate_poly: polar.derivative(1),
                        spatial_freq_sf_poly: ksf.clone(),
                        spatial_freq_sf_rate_poly: ksf.derivative(1),
                    })
                }
                ImageFormationAlgorithm::RgAzComp => {
                    let rgazcomp = sicd
                        .rg_az_comp
                        .as_ref()
                        .ok_or_else(|| missing("RgAzComp"))?;
                    let az_sf = rgazcomp.az_sf.ok_or_else(|| missing("RgAzComp.AzSF"))?;
                    Ok(CoaBranch::RgAzComp { az_sf })
                }
                ImageFormationAlgorithm::Other if declared.is_none() => {
                    Err(missing("ImageFormation.ImageFormAlgo"))
                }
                other => Err(SicdError::UnsupportedConfiguration(format!(
                    "RGAZIM grid with {} image formation cannot be projected",
                    other.block_name()
                ))),
            }
        }
        GridType::RgZero => {
            let rma = sicd.rma.as_ref().ok_or_else(|| missing("RMA"))?;
            let inca = rma.inca.as_ref().ok_or_else(|| missing("RMA.INCA"))?;
            let r_ca_scp = inca.r_ca_scp.ok_or_else(|| missing("RMA.INCA.R_CA_SCP"))?;
            let time_ca_poly = inca
                .time_ca_poly
                .as_ref()
                .ok_or_else(|| missing("RMA.INCA.TimeCAPoly"))?;
            let drate_sf_poly = inca
                .drate_sf_poly
                .as_ref()
                .ok_or_else(|| missing("RMA.INCA.DRateSFPoly"))?;
            Ok(CoaBranch::Inca {
                r_ca_scp,
                time_ca_poly: time_ca_poly.clone(),
                drate_sf_poly: drate_sf_poly.clone(),
            })
        }
        t if t.is_plane_type() => {
            let row_uvect = grid
                .row
                .as_ref()
                .and_then(unit_vector)
                .ok_or_else(|| missing("Grid.Row.UVectECF"))?;
            let col_uvect = grid
                .col
                .as_ref()
                .and_then(unit_vector)
                .ok_or_else(|| missing("Grid.Col.UVectECF"))?;
            Ok(CoaBranch::Plane {
                row_uvect,
                col_uvect,
            })
        }
        other => Err(SicdError::UnsupportedConfiguration(format!(
            "unhandled Grid.Type {}",
            other
        ))),
    }
}

/// Check that every field the COA projection needs is populated.
///
/// Returns the non-fatal findings (e.g. a constant COA time fallback) or
/// `MissingField` naming the first absent field.
pub fn check_projection(sicd: &Sicd) -> SicdResult<Vec<Diagnostic>> {
    let mut warnings = Vec::new();

    let geo = sicd.geo_data.as_ref().ok_or_else(|| missing("GeoData"))?;
    let scp = geo.scp.as_ref().ok_or_else(|| missing("GeoData.SCP"))?;
    scp.ecf.ok_or_else(|| missing("GeoData.SCP.ECF"))?;

    let image = sicd.image_data.as_ref().ok_or_else(|| missing("ImageData"))?;
    image.first_row.ok_or_else(|| missing("ImageData.FirstRow"))?;
    image.first_col.ok_or_else(|| missing("ImageData.FirstCol"))?;
    image.scp_pixel.ok_or_else(|| missing("ImageData.SCPPixel"))?;

    let position = sicd.position.as_ref().ok_or_else(|| missing("Position"))?;
    position
        .arp_poly
        .as_ref()
        .ok_or_else(|| missing("Position.ARPPoly"))?;

    let grid = sicd.grid.as_ref().ok_or_else(|| missing("Grid"))?;
    let (_, time_warning) = time_coa_poly(sicd)?;
    warnings.extend(time_warning);

    let row = grid.row.as_ref().ok_or_else(|| missing("Grid.Row"))?;
    row.ss.ok_or_else(|| missing("Grid.Row.SS"))?;
    let col = grid.col.as_ref().ok_or_else(|| missing("Grid.Col"))?;
    col.ss.ok_or_else(|| missing("Grid.Col.SS"))?;
    let grid_type = grid.grid_type.as_ref().ok_or_else(|| missing("Grid.Type"))?;

    branch_parameters(sicd, grid_type)?;
    Ok(warnings)
}

impl ProjectionContext {
    /// Build a projection context from populated metadata
    pub fn from_sicd(sicd: &Sicd, params: &AdjustableParameters) -> SicdResult<Self> {
        let mut diagnostics = check_projection(sicd)?;

        let geo = sicd.geo_data.as_ref().ok_or_else(|| missing("GeoData"))?;
        let scp_block = geo.scp.as_ref().ok_or_else(|| missing("GeoData.SCP"))?;
        let scp = scp_block.ecf.ok_or_else(|| missing("GeoData.SCP.ECF"))?;
        let scp_hae = match scp_block.llh {
            Some(llh) => llh.hae,
            None => ecf_to_geodetic(&scp)?.hae,
        };

        let image = sicd.image_data.as_ref().ok_or_else(|| missing("ImageData"))?;
        let first_row = image.first_row.ok_or_else(|| missing("ImageData.FirstRow"))? as f64;
        let first_col = image.first_col.ok_or_else(|| missing("ImageData.FirstCol"))? as f64;
        let scp_pixel = image.scp_pixel.ok_or_else(|| missing("ImageData.SCPPixel"))?;

        let arp_poly = sicd
            .position
            .as_ref()
            .and_then(|p| p.arp_poly.clone())
            .ok_or_else(|| missing("Position.ARPPoly"))?;
        let varp_poly = arp_poly.derivative(1);

        let grid = sicd.grid.as_ref().ok_or_else(|| missing("Grid"))?;
        let (coa_poly, _) = time_coa_poly(sicd)?;
        let row = grid.row.as_ref().ok_or_else(|| missing("Grid.Row"))?;
        let col = grid.col.as_ref().ok_or_else(|| missing("Grid.Col"))?;
        let row_ss = row.ss.ok_or_else(|| missing("Grid.Row.SS"))?;
        let col_ss = col.ss.ok_or_else(|| missing("Grid.Col.SS"))?;
        let grid_type = grid
            .grid_type
            .clone()
            .ok_or_else(|| missing("Grid.Type"))?;
        let branch = branch_parameters(sicd, &grid_type)?;

        let t_scp = scp_coa_time(sicd).unwrap_or_else(|| coa_poly.eval(0.0, 0.0));
        let (scp_arp, scp_varp) = match sicd.scpcoa.as_ref() {
            Some(coa) if coa.arp_pos.is_some() && coa.arp_vel.is_some() => (
                coa.arp_pos.unwrap_or_else(|| arp_poly.eval(t_scp)),
                coa.arp_vel.unwrap_or_else(|| varp_poly.eval(t_scp)),
            ),
            _ => (arp_poly.eval(t_scp), varp_poly.eval(t_scp)),
        };

        let look = match sicd.scpcoa.as_ref().and_then(|s| s.side_of_track) {
            Some(side) => side.look(),
            None => {
                let ugpn = wgs84_norm(&scp);
                let left = ugpn.dot(&scp_varp.cross(&(scp - scp_arp)));
                diagnostics.push(Diagnostic::info(
                    "SCPCOA.SideOfTrack",
                    "not populated; side of track taken from the SCP COA geometry",
                ));
                if left >= 0.0 {
                    1.0
                } else {
                    -1.0
                }
            }
        };

        let (delta_arp, delta_varp) = match params.frame {
            AdjustFrame::Ecf => (params.delta_arp, params.delta_varp),
            AdjustFrame::RicEcf | AdjustFrame::RicEci => {
                let frame = if params.frame == AdjustFrame::RicEcf {
                    RicFrame::Ecf
                } else {
                    RicFrame::Eci
                };
                let rotation = ric_ecf_matrix(&scp_arp, &scp_varp, frame);
                (rotation * params.delta_arp, rotation * params.delta_varp)
            }
        };

        Ok(Self {
            params: *params,
            delta_arp,
            delta_varp,
            range_bias: params.range_bias,
            arp_poly,
            varp_poly,
            time_coa_poly: coa_poly,
            row_ss,
            col_ss,
            first_row,
            first_col,
            scp_row: scp_pixel.row as f64,
            scp_col: scp_pixel.col as f64,
            scp,
            scp_hae,
            scp_arp,
            scp_varp,
            row_uvect: unit_vector(row),
            col_uvect: unit_vector(col),
            look,
            grid_type,
            branch,
            diagnostics,
        })
    }

    /// Adjustable parameters as supplied, before frame conversion
    pub fn params(&self) -> &AdjustableParameters {
        &self.params
    }

    /// ARP position and velocity offsets converted to ECF
    pub fn ecf_offsets(&self) -> (Vector3<f64>, Vector3<f64>) {
        (self.delta_arp, self.delta_varp)
    }

    pub fn scp(&self) -> Vector3<f64> {
        self.scp
    }

    pub fn scp_hae(&self) -> f64 {
        self.scp_hae
    }

    /// Unit slant plane normal at the SCP COA time, `look * VARP x (SCP - ARP)`
    pub fn slant_plane_normal(&self) -> Option<Vector3<f64>> {
        let spn = self.scp_varp.cross(&(self.scp - self.scp_arp)) * self.look;
        let norm = spn.norm();
        if norm > 0.0 && norm.is_finite() {
            Some(spn / norm)
        } else {
            None
        }
    }

    /// +1 for left looking, -1 for right looking
    pub fn look(&self) -> f64 {
        self.look
    }

    pub fn grid_type(&self) -> &GridType {
        &self.grid_type
    }

    /// Non-fatal findings gathered while building the context
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Image plane normal `uRow x uCol`, oriented away from the Earth
    pub fn image_plane_normal(&self) -> Option<Vector3<f64>> {
        let (row, col) = (self.row_uvect?, self.col_uvect?);
        let normal = row.cross(&col);
        if normal.norm() == 0.0 {
            return None;
        }
        let normal = normal.normalize();
        Some(if normal.dot(&self.scp) < 0.0 {
            -normal
        } else {
            normal
        })
    }

    /// Physical image coordinates (m) relative to the SCP
    pub fn image_to_physical(&self, row: f64, col: f64) -> (f64, f64) {
        (
            (row + self.first_row - self.scp_row) * self.row_ss,
            (col + self.first_col - self.scp_col) * self.col_ss,
        )
    }

    /// COA geometry of one image point
    pub fn projection(&self, row: f64, col: f64) -> CoaPoint {
        let (x, y) = self.image_to_physical(row, col);
        let time = self.time_coa_poly.eval(x, y);
        let arp = self.arp_poly.eval(time);
        let varp = self.varp_poly.eval(time);
        let (range, range_rate) = self.range_and_rate(x, y, time, &arp, &varp);
        CoaPoint {
            time,
            arp: arp + self.delta_arp,
            varp: varp + self.delta_varp,
            range: range + self.range_bias,
            range_rate,
        }
    }

    /// COA geometry of an `N x 2` array of (row, col) image points
    pub fn projection_array(&self, image_points: &Array2<f64>) -> SicdResult<Vec<CoaPoint>> {
        check_columns(image_points, 2, "image")?;
        Ok(map_points(image_points.nrows(), |i| {
            self.projection(image_points[[i, 0]], image_points[[i, 1]])
        }))
    }

    fn range_and_rate(
        &self,
        x: f64,
        y: f64,
        time: f64,
        arp: &Vector3<f64>,
        varp: &Vector3<f64>,
    ) -> (f64, f64) {
        match &self.branch {
            CoaBranch::Pfa {
                polar_ang_poly,
                polar_ang_rate_poly,
                spatial_freq_sf_poly,
                spatial_freq_sf_rate_poly,
            } => {
                let (r_scp, rdot_scp) = self.scp_range_and_rate(arp, varp);
                let theta = polar_ang_poly.eval(time);
                let dtheta = polar_ang_rate_poly.eval(time);
                let ksf = spatial_freq_sf_poly.eval(theta);
                let dksf = spatial_freq_sf_rate_poly.eval(theta);
                let (sin_t, cos_t) = theta.sin_cos();
                let dphi_dka = x * cos_t + y * sin_t;
                let dphi_dkc = -x * sin_t + y * cos_t;
                (
                    r_scp + ksf * dphi_dka,
                    rdot_scp + (dksf * dphi_dka + ksf * dphi_dkc) * dtheta,
                )
            }
            CoaBranch::RgAzComp { az_sf } => {
                let (r_scp, rdot_scp) = self.scp_range_and_rate(arp, varp);
                (r_scp + x, rdot_scp - varp.norm() * az_sf * y)
            }
            CoaBranch::Inca {
                r_ca_scp,
                time_ca_poly,
                drate_sf_poly,
            } => {
                let r_ca = r_ca_scp + x;
                let t_ca = time_ca_poly.eval(y);
                let v_ca_sq = self.varp_poly.eval(t_ca).norm_squared();
                let drsf = drate_sf_poly.eval(x, y);
                let dt = time - t_ca;
                let range = (r_ca * r_ca + drsf * v_ca_sq * dt * dt).sqrt();
                (range, drsf * v_ca_sq * dt / range)
            }
            CoaBranch::Plane {
                row_uvect,
                col_uvect,
            } => {
                let target = self.scp + row_uvect * x + col_uvect * y;
                let los = arp - target;
                let range = los.norm();
                (range, varp.dot(&los) / range)
            }
        }
    }

    fn scp_range_and_rate(&self, arp: &Vector3<f64>, varp: &Vector3<f64>) -> (f64, f64) {
        let los = arp - self.scp;
        let range = los.norm();
        (range, varp.dot(&los) / range)
    }

    /// Project `N x 2` image points to ECF on the given surface.
    /// Points without an intersection come back as NaN rows.
    pub fn image_to_ground(
        &self,
        image_points: &Array2<f64>,
        surface: &ProjectionSurface<'_>,
    ) -> SicdResult<Array2<f64>> {
        check_columns(image_points, 2, "image")?;
        let n = image_points.nrows();

        let ground: Vec<Vector3<f64>> = match *surface {
            ProjectionSurface::Plane { reference, normal } => {
                let gref = reference.unwrap_or(self.scp);
                let normal = match normal {
                    Some(n) if n.norm() > 0.0 => n.normalize(),
                    Some(_) => {
                        return Err(SicdError::InvalidArgument(
                            "projection plane normal must be non-zero".to_string(),
                        ))
                    }
                    None => self
                        .image_plane_normal()
                        .unwrap_or_else(|| wgs84_norm(&gref)),
                };
                map_points(n, |i| {
                    let coa = self.projection(image_points[[i, 0]], image_points[[i, 1]]);
                    plane_intersection(&coa, &gref, &normal, self.look)
                })
            }
            ProjectionSurface::Hae {
                hae,
                tolerance,
                max_iterations,
            } => {
                let hae0 = hae.unwrap_or(self.scp_hae);
                map_points(n, |i| {
                    let coa = self.projection(image_points[[i, 0]], image_points[[i, 1]]);
                    self.hae_intersection(&coa, hae0, tolerance, max_iterations)
                })
            }
            ProjectionSurface::Dem {
                dem,
                tolerance,
                max_iterations,
            } => map_points(n, |i| {
                let coa = self.projection(image_points[[i, 0]], image_points[[i, 1]]);
                self.dem_intersection(&coa, dem, tolerance, max_iterations)
            }),
        };

        let mut out = Array2::zeros((n, 3));
        for (i, p) in ground.iter().enumerate() {
            out[[i, 0]] = p.x;
            out[[i, 1]] = p.y;
            out[[i, 2]] = p.z;
        }
        Ok(out)
    }

    /// Image to ground with geodetic output in the requested ordering
    pub fn image_to_ground_geo(
        &self,
        image_points: &Array2<f64>,
        surface: &ProjectionSurface<'_>,
        ordering: CoordinateOrdering,
    ) -> SicdResult<Array2<f64>> {
        let ecf = self.image_to_ground(image_points, surface)?;
        ecf_to_geodetic_array(&ecf, ordering)
    }

    /// Intersect one COA contour with a constant height surface
    fn hae_intersection(
        &self,
        coa: &CoaPoint,
        hae0: f64,
        tolerance: f64,
        max_iterations: usize,
    ) -> Vector3<f64> {
        let nan = Vector3::repeat(f64::NAN);
        let mut ugpn = wgs84_norm(&self.scp);
        let mut gpp_ref = self.scp - ugpn * (self.scp_hae - hae0);
        let mut gpp = nan;
        let mut delta = 0.0;

        for _ in 0..max_iterations.max(1) {
            gpp = plane_intersection(coa, &gpp_ref, &ugpn, self.look);
            let Some(hae) = finite_hae(&gpp) else {
                return nan;
            };
            delta = hae - hae0;
            if delta.abs() <= tolerance {
                break;
            }
            ugpn = wgs84_norm(&gpp);
            gpp_ref = gpp - ugpn * delta;
        }

        // Move along the slant plane normal to remove the residual height
        let spn = coa.varp.cross(&(gpp - coa.arp)) * self.look;
        if spn.norm() == 0.0 {
            return nan;
        }
        let uspn = spn.normalize();
        let sf = ugpn.dot(&uspn);
        if sf == 0.0 {
            return nan;
        }
        let slant = gpp - uspn * (delta / sf);

        match ecf_to_geodetic(&slant).and_then(|g| GeodeticPoint::new(g.lat, g.lon, hae0)) {
            Ok(geo) => geodetic_to_ecf(&geo),
            Err(_) => nan,
        }
    }

    /// Fixed point iteration of the constant height solution on DEM height
    fn dem_intersection(
        &self,
        coa: &CoaPoint,
        dem: &dyn DemSurface,
        tolerance: f64,
        max_iterations: usize,
    ) -> Vector3<f64> {
        let nan = Vector3::repeat(f64::NAN);
        let mut height = self.scp_hae;
        let mut point = nan;

        for _ in 0..max_iterations.max(1) {
            point = self.hae_intersection(coa, height, tolerance, max_iterations);
            let Ok(geo) = ecf_to_geodetic(&point) else {
                return nan;
            };
            let Some(next) = dem.height(geo.lat, geo.lon) else {
                return nan;
            };
            if (next - height).abs() <= tolerance {
                return point;
            }
            height = next;
        }
        point
    }

    /// Project `N x 3` ECF points into the image
    pub fn ground_to_image(
        &self,
        coords: &Array2<f64>,
        tolerance: f64,
        max_iterations: usize,
    ) -> SicdResult<GroundToImageResult> {
        check_columns(coords, 3, "ECF")?;
        let solver = GroundToImageSolver::new(self)?;
        let n = coords.nrows();
        let points = map_points(n, |i| {
            let g = Vector3::new(coords[[i, 0]], coords[[i, 1]], coords[[i, 2]]);
            solver.solve(&g, tolerance, max_iterations)
        });

        let mut image_points = Array2::zeros((n, 2));
        let mut residuals = Array1::zeros(n);
        let mut iterations = 0;
        for (i, p) in points.iter().enumerate() {
            image_points[[i, 0]] = p.row;
            image_points[[i, 1]] = p.col;
            residuals[i] = p.residual;
            iterations = iterations.max(p.iterations);
        }
        Ok(GroundToImageResult {
            image_points,
            residuals,
            iterations,
        })
    }

    pub fn ground_to_image_point(
        &self,
        coords: &Vector3<f64>,
        tolerance: f64,
        max_iterations: usize,
    ) -> SicdResult<ImagePoint> {
        let solver = GroundToImageSolver::new(self)?;
        Ok(solver.solve(coords, tolerance, max_iterations))
    }

    /// Ground to image with geodetic input in the given ordering
    pub fn ground_to_image_geo(
        &self,
        coords: &Array2<f64>,
        ordering: CoordinateOrdering,
        tolerance: f64,
        max_iterations: usize,
    ) -> SicdResult<GroundToImageResult> {
        let ecf = geodetic_to_ecf_array(coords, ordering)?;
        self.ground_to_image(&ecf, tolerance, max_iterations)
    }
}

/// Precomputed image plane frame for ground to image iterations
struct GroundToImageSolver<'a> {
    context: &'a ProjectionContext,
    ugpn: Vector3<f64>,
    uproj: Vector3<f64>,
    uipn: Vector3<f64>,
    sf: f64,
    row_uvect: Vector3<f64>,
    col_uvect: Vector3<f64>,
    transform: Matrix2<f64>,
    ref_pixel: Vector2<f64>,
}

impl<'a> GroundToImageSolver<'a> {
    fn new(context: &'a ProjectionContext) -> SicdResult<Self> {
        let row_uvect = context
            .row_uvect
            .ok_or_else(|| missing("Grid.Row.UVectECF"))?;
        let col_uvect = context
            .col_uvect
            .ok_or_else(|| missing("Grid.Col.UVectECF"))?;

        let ugpn = wgs84_norm(&context.scp);
        let ipn = row_uvect.cross(&col_uvect);
        if ipn.norm() == 0.0 {
            return Err(SicdError::InvalidArgument(
                "grid row and column unit vectors are parallel".to_string(),
            ));
        }
        let uipn = ipn.normalize();

        // Points move onto the image plane along the slant plane normal
        let (uproj, sf) = match context.slant_plane_normal() {
            Some(uspn) if uspn.dot(&uipn).abs() > 1e-6 => (uspn, uspn.dot(&uipn)),
            _ => (ugpn, ugpn.dot(&uipn)),
        };
        if sf == 0.0 {
            return Err(SicdError::InvalidArgument(
                "image plane contains the projection direction".to_string(),
            ));
        }

        // Non-orthogonal basis: solve the 2x2 Gram system, then scale to pixels
        let c = row_uvect.dot(&col_uvect);
        let det = 1.0 - c * c;
        let gram_inv = Matrix2::new(1.0, -c, -c, 1.0) / det;
        let spacing = Matrix2::new(1.0 / context.row_ss, 0.0, 0.0, 1.0 / context.col_ss);

        Ok(Self {
            context,
            ugpn,
            uproj,
            uipn,
            sf,
            row_uvect,
            col_uvect,
            transform: spacing * gram_inv,
            ref_pixel: Vector2::new(
                context.scp_row - context.first_row,
                context.scp_col - context.first_col,
            ),
        })
    }

    fn solve(&self, coords: &Vector3<f64>, tolerance: f64, max_iterations: usize) -> ImagePoint {
        let mut best = ImagePoint {
            row: f64::NAN,
            col: f64::NAN,
            residual: f64::NAN,
            iterations: 0,
        };
        if !coords.iter().all(|v| v.is_finite()) {
            return best;
        }

        let mut g = *coords;
        for iteration in 1..=max_iterations.max(1) {
            let dist = (self.context.scp - g).dot(&self.uipn) / self.sf;
            let image_plane_point = g + self.uproj * dist;
            let delta = image_plane_point - self.context.scp;
            let pixel = self.transform
                * Vector2::new(delta.dot(&self.row_uvect), delta.dot(&self.col_uvect))
                + self.ref_pixel;

            let coa = self.context.projection(pixel.x, pixel.y);
            let p = plane_intersection(&coa, coords, &self.ugpn, self.context.look);
            let diff = coords - p;
            let residual = diff.norm();
            if !residual.is_finite() || !pixel.iter().all(|v| v.is_finite()) {
                break;
            }

            best = ImagePoint {
                row: pixel.x,
                col: pixel.y,
                residual,
                iterations: iteration,
            };
            if residual <= tolerance {
                break;
            }
            g += diff;
        }
        best
    }
}

/// Intersect the range/Doppler contour of `coa` with the plane through
/// `gref` with unit normal `uz`. NaN when no intersection exists.
pub(crate) fn plane_intersection(
    coa: &CoaPoint,
    gref: &Vector3<f64>,
    uz: &Vector3<f64>,
    look: f64,
) -> Vector3<f64> {
    let nan = Vector3::repeat(f64::NAN);
    let r = coa.range;
    let arp_z = (coa.arp - gref).dot(uz);
    if !(arp_z.abs() <= r) {
        return nan;
    }

    let agpn = coa.arp - uz * arp_z;
    let ground_dist = (r * r - arp_z * arp_z).sqrt();
    let cos_graz = ground_dist / r;
    let sin_graz = arp_z / r;

    let vz = coa.varp.dot(uz);
    let vx_sq = coa.varp.norm_squared() - vz * vz;
    if !(vx_sq > 0.0) {
        return nan;
    }
    let vx = vx_sq.sqrt();
    let ux = (coa.varp - uz * vz) / vx;
    let uy = uz.cross(&ux);

    let cos_az = (-coa.range_rate + vz * sin_graz) / (vx * cos_graz);
    if !cos_az.is_finite() || cos_az.abs() > 1.0 {
        return nan;
    }
    let sin_az = look * (1.0 - cos_az * cos_az).sqrt();

    agpn + ux * (ground_dist * cos_az) + uy * (ground_dist * sin_az)
}

fn finite_hae(point: &Vector3<f64>) -> Option<f64> {
    if !point.iter().all(|v| v.is_finite()) {
        return None;
    }
    ecf_to_geodetic(point).ok().map(|g| g.hae)
}

fn check_columns(points: &Array2<f64>, columns: usize, what: &str) -> SicdResult<()> {
    if points.ncols() != columns {
        return Err(SicdError::InvalidArgument(format!(
            "{} points must be an N x {} array, got {} columns",
            what,
            columns,
            points.ncols()
        )));
    }
    Ok(())
}

#[cfg(feature = "parallel")]
fn map_points<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    use rayon::prelude::*;
    (0..n).into_par_iter().map(f).collect()
}

#[cfg(not(feature = "parallel"))]
fn map_points<T, F>(n: usize, f: F) -> Vec<T>
where
    F: Fn(usize) -> T,
{
    (0..n).map(f).collect()
}
