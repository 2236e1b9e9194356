//! SICD metadata model
//!
//! Only the parameter blocks consumed by validation, derivation and the COA
//! projection are modelled. Every field is optional so that partially
//! populated products can be checked and completed; `serde` lets an outer
//! reader hand the model over (JSON in the tests and Python bindings).

use crate::core::derivation::{self, DerivationReport};
use crate::core::polynomial::{Poly1D, Poly2D, XyzPoly};
use crate::core::projection::{
    check_projection, AdjustableParameters, GroundToImageResult, ProjectionConfig,
    ProjectionContext, ProjectionSurface,
};
use crate::core::radiometric;
use crate::core::validation::{
    self, resolve_image_formation, Diagnostic, ImageFormationAlgorithm, ValidationReport,
};
use crate::io::dem::DemSurface;
use crate::types::{
    CoordinateOrdering, GeodeticPoint, GridType, ImageFormAlgo, RadarModeType, RowCol,
    SideOfTrack, SicdResult,
};
use chrono::{DateTime, Duration, Utc};
use nalgebra::Vector3;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadarMode {
    pub mode_type: Option<RadarModeType>,
    pub mode_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionInfo {
    pub collector_name: Option<String>,
    pub core_name: Option<String>,
    pub radar_mode: Option<RadarMode>,
    /// Free form name/value parameters
    pub parameters: BTreeMap<String, String>,
}

impl CollectionInfo {
    pub fn is_spotlight(&self) -> bool {
        self.radar_mode
            .as_ref()
            .and_then(|m| m.mode_type)
            .map_or(false, |t| t == RadarModeType::Spotlight)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageData {
    pub num_rows: Option<u64>,
    pub num_cols: Option<u64>,
    /// Offset of this product within the full image
    pub first_row: Option<i64>,
    pub first_col: Option<i64>,
    /// Scene center point in full image coordinates
    pub scp_pixel: Option<RowCol>,
    pub valid_data: Option<Vec<RowCol>>,
}

impl ImageData {
    /// Image corner vertices in clockwise order starting at the first pixel
    pub fn corner_vertices(&self) -> Option<[(f64, f64); 4]> {
        let rows = self.num_rows? as f64;
        let cols = self.num_cols? as f64;
        Some([
            (0.0, 0.0),
            (0.0, cols - 1.0),
            (rows - 1.0, cols - 1.0),
            (rows - 1.0, 0.0),
        ])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoScp {
    pub ecf: Option<Vector3<f64>>,
    pub llh: Option<GeodeticPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoData {
    pub scp: Option<GeoScp>,
    pub image_corners: Option<Vec<GeodeticPoint>>,
    pub valid_data: Option<Vec<GeodeticPoint>>,
}

/// Grid.Row / Grid.Col direction parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirParam {
    pub uvect_ecf: Option<Vector3<f64>>,
    /// Sample spacing (m)
    pub ss: Option<f64>,
    pub imp_resp_wid: Option<f64>,
    /// Impulse response bandwidth (cycles/m)
    pub imp_resp_bw: Option<f64>,
    pub sgn: Option<i32>,
    pub kctr: Option<f64>,
    /// Spatial frequency support bounds (cycles/m)
    pub delta_k1: Option<f64>,
    pub delta_k2: Option<f64>,
    /// Offset of the COA spatial frequency from `kctr` over the image
    pub delta_kcoa_poly: Option<Poly2D>,
    /// Sampled aperture weighting function
    pub wgt_funct: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Grid {
    pub image_plane: Option<String>,
    #[serde(rename = "type")]
    pub grid_type: Option<GridType>,
    pub time_coa_poly: Option<Poly2D>,
    pub row: Option<DirParam>,
    pub col: Option<DirParam>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeline {
    pub collect_start: Option<DateTime<Utc>>,
    /// Seconds
    pub collect_duration: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub arp_poly: Option<XyzPoly>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxFrequency {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadarCollection {
    pub tx_frequency: Option<TxFrequency>,
    /// Non-zero when the frequencies are offsets from a reference frequency
    pub ref_freq_index: Option<i32>,
    /// Identifiers from RadarCollection.Area.Plane.SegmentList
    pub segment_list: Option<Vec<String>>,
}

/// Processed transmit band (Hz)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxFrequencyProc {
    pub min_proc: Option<f64>,
    pub max_proc: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageFormation {
    pub image_form_algo: Option<ImageFormAlgo>,
    pub segment_identifier: Option<String>,
    /// e.g. `V:V`
    pub tx_rcv_polarization_proc: Option<String>,
    pub t_start_proc: Option<f64>,
    pub t_end_proc: Option<f64>,
    pub tx_frequency_proc: Option<TxFrequencyProc>,
}

/// Geometry at the scene center point COA time. Angles are in degrees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScpCoa {
    pub scp_time: Option<f64>,
    pub arp_pos: Option<Vector3<f64>>,
    pub arp_vel: Option<Vector3<f64>>,
    pub arp_acc: Option<Vector3<f64>>,
    pub side_of_track: Option<SideOfTrack>,
    pub slant_range: Option<f64>,
    pub ground_range: Option<f64>,
    pub doppler_cone_ang: Option<f64>,
    pub graze_ang: Option<f64>,
    pub incidence_ang: Option<f64>,
    pub twist_ang: Option<f64>,
    pub slope_ang: Option<f64>,
    pub azim_ang: Option<f64>,
    pub layover_ang: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseLevel {
    /// `ABSOLUTE` or `RELATIVE`
    pub noise_level_type: Option<String>,
    /// Noise power in dB
    pub noise_poly: Option<Poly2D>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Radiometric {
    pub noise_level: Option<NoiseLevel>,
    pub rcs_sf_poly: Option<Poly2D>,
    pub sigma_zero_sf_poly: Option<Poly2D>,
    pub beta_zero_sf_poly: Option<Poly2D>,
    pub gamma_zero_sf_poly: Option<Poly2D>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RgAzComp {
    pub az_sf: Option<f64>,
    pub kaz_poly: Option<Poly1D>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pfa {
    /// Focus plane normal
    pub fpn: Option<Vector3<f64>>,
    /// Image formation plane normal
    pub ipn: Option<Vector3<f64>>,
    pub polar_ang_ref_time: Option<f64>,
    pub polar_ang_poly: Option<Poly1D>,
    pub spatial_freq_sf_poly: Option<Poly1D>,
    pub krg1: Option<f64>,
    pub krg2: Option<f64>,
    pub kaz1: Option<f64>,
    pub kaz2: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inca {
    pub time_ca_poly: Option<Poly1D>,
    pub r_ca_scp: Option<f64>,
    pub freq_zero: Option<f64>,
    pub drate_sf_poly: Option<Poly2D>,
    pub dop_centroid_poly: Option<Poly2D>,
    pub dop_centroid_coa: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rma {
    pub rm_algo_type: Option<String>,
    pub image_type: Option<String>,
    pub inca: Option<Inca>,
}

/// SICD product metadata with a lazily built projection context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sicd {
    pub collection_info: Option<CollectionInfo>,
    pub image_data: Option<ImageData>,
    pub geo_data: Option<GeoData>,
    pub grid: Option<Grid>,
    pub timeline: Option<Timeline>,
    pub position: Option<Position>,
    pub radar_collection: Option<RadarCollection>,
    pub image_formation: Option<ImageFormation>,
    pub scpcoa: Option<ScpCoa>,
    pub radiometric: Option<Radiometric>,
    pub rg_az_comp: Option<RgAzComp>,
    pub pfa: Option<Pfa>,
    pub rma: Option<Rma>,
    #[serde(skip)]
    coa_projection: OnceLock<Arc<ProjectionContext>>,
}

impl Sicd {
    pub fn from_json_str(json: &str) -> SicdResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SicdResult<Self> {
        log::info!("Reading SICD metadata from: {}", path.as_ref().display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> SicdResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Image formation algorithm resolved from the parameter blocks
    pub fn image_form_type(&self) -> SicdResult<ImageFormationAlgorithm> {
        resolve_image_formation(self)
    }

    /// Run the structural checks and log every finding
    pub fn validate(&self) -> ValidationReport {
        log::debug!("Validating SICD metadata");
        let report = validation::validate(self);
        for diagnostic in &report.diagnostics {
            diagnostic.emit();
        }
        if report.is_valid() {
            log::info!("✅ SICD metadata passed validation");
        } else {
            log::warn!(
                "SICD metadata failed validation with {} error(s)",
                report.errors().count()
            );
        }
        report
    }

    pub fn is_valid(&self) -> bool {
        validation::validate(self).is_valid()
    }

    /// Populate derived fields in dependency order. The cached projection
    /// context is left untouched.
    pub fn derive(&mut self) -> DerivationReport {
        log::info!("🔧 Deriving SICD metadata fields");
        let report = derivation::derive(self);
        for diagnostic in &report.diagnostics {
            diagnostic.emit();
        }
        log::debug!("Derivation steps completed: {:?}", report.steps);
        report
    }

    /// Convert frequencies stored relative to a reference frequency (Hz)
    /// into absolute values. Fails unless `RadarCollection.RefFreqIndex`
    /// is set.
    pub fn apply_reference_frequency(&mut self, reference_frequency: f64) -> SicdResult<()> {
        log::info!("Applying reference frequency {:.6e} Hz", reference_frequency);
        derivation::apply_reference_frequency(self, reference_frequency)?;
        self.invalidate_projection();
        Ok(())
    }

    /// Feasibility pre-check for COA projection
    pub fn check_projection(&self) -> SicdResult<Vec<Diagnostic>> {
        check_projection(self)
    }

    /// Whether the COA projection can be formulated, logging the reason if not
    pub fn can_project(&self) -> bool {
        match check_projection(self) {
            Ok(warnings) => {
                for warning in &warnings {
                    warning.emit();
                }
                true
            }
            Err(e) => {
                log::error!("{}", e);
                false
            }
        }
    }

    /// The cached projection context, built with zero adjustable
    /// parameters on first use
    pub fn coa_projection(&self) -> SicdResult<Arc<ProjectionContext>> {
        if let Some(context) = self.coa_projection.get() {
            return Ok(Arc::clone(context));
        }
        log::debug!("Building COA projection context");
        let built = Arc::new(ProjectionContext::from_sicd(
            self,
            &AdjustableParameters::default(),
        )?);
        for diagnostic in built.diagnostics() {
            diagnostic.emit();
        }
        Ok(Arc::clone(self.coa_projection.get_or_init(|| built)))
    }

    pub fn has_coa_projection(&self) -> bool {
        self.coa_projection.get().is_some()
    }

    /// Build and cache a projection context with the given parameters.
    /// An existing context is kept unless `overwrite` is set.
    pub fn define_coa_projection(
        &mut self,
        params: &AdjustableParameters,
        overwrite: bool,
    ) -> SicdResult<Arc<ProjectionContext>> {
        if !overwrite {
            if let Some(context) = self.coa_projection.get() {
                return Ok(Arc::clone(context));
            }
        }
        let context = Arc::new(ProjectionContext::from_sicd(self, params)?);
        for diagnostic in context.diagnostics() {
            diagnostic.emit();
        }
        self.coa_projection = OnceLock::new();
        Ok(Arc::clone(self.coa_projection.get_or_init(|| context)))
    }

    /// Drop the cached projection context; the next request rebuilds it
    pub fn invalidate_projection(&mut self) {
        if self.coa_projection.take().is_some() {
            log::debug!("COA projection context invalidated");
        }
    }

    /// Context selected by a projection configuration: the cached one, or
    /// an ad hoc context built from the configured adjustable parameters
    pub fn projection_context(
        &self,
        config: &ProjectionConfig,
    ) -> SicdResult<Arc<ProjectionContext>> {
        if config.use_sicd_coa {
            self.coa_projection()
        } else {
            let context = ProjectionContext::from_sicd(self, &config.adjustable_parameters())?;
            Ok(Arc::new(context))
        }
    }

    /// Project `N x 3` ECF points into the image
    pub fn project_ground_to_image(
        &self,
        coords: &Array2<f64>,
        config: &ProjectionConfig,
    ) -> SicdResult<GroundToImageResult> {
        let context = self.projection_context(config)?;
        let result = context.ground_to_image(coords, config.tolerance, config.max_iterations)?;
        log_ground_to_image(&result, config);
        Ok(result)
    }

    /// Project `N x 3` geodetic points into the image
    pub fn project_ground_to_image_geo(
        &self,
        coords: &Array2<f64>,
        ordering: CoordinateOrdering,
        config: &ProjectionConfig,
    ) -> SicdResult<GroundToImageResult> {
        let context = self.projection_context(config)?;
        let result =
            context.ground_to_image_geo(coords, ordering, config.tolerance, config.max_iterations)?;
        log_ground_to_image(&result, config);
        Ok(result)
    }

    /// Project `N x 2` image points to ECF on the configured surface
    pub fn project_image_to_ground(
        &self,
        image_points: &Array2<f64>,
        config: &ProjectionConfig,
        dem: Option<&dyn DemSurface>,
    ) -> SicdResult<Array2<f64>> {
        let context = self.projection_context(config)?;
        let surface = ProjectionSurface::from_config(config, dem)?;
        let ground = context.image_to_ground(image_points, &surface)?;
        log_image_to_ground(&ground);
        Ok(ground)
    }

    pub fn project_image_to_ground_geo(
        &self,
        image_points: &Array2<f64>,
        ordering: CoordinateOrdering,
        config: &ProjectionConfig,
        dem: Option<&dyn DemSurface>,
    ) -> SicdResult<Array2<f64>> {
        let context = self.projection_context(config)?;
        let surface = ProjectionSurface::from_config(config, dem)?;
        let ground = context.image_to_ground_geo(image_points, &surface, ordering)?;
        log_image_to_ground(&ground);
        Ok(ground)
    }

    /// Estimate INFORMATION_DENSITY and PREDICTED_RNIIRS and store them in
    /// CollectionInfo.Parameters
    pub fn populate_rniirs(
        &mut self,
        signal: Option<f64>,
        noise: Option<f64>,
        overwrite: bool,
    ) -> SicdResult<()> {
        let outcome = radiometric::populate_rniirs(self, signal, noise, overwrite)?;
        match outcome {
            Some((density, rniirs)) => log::info!(
                "Calculated INFORMATION_DENSITY = {:.5}, PREDICTED_RNIIRS = {:.5}",
                density,
                rniirs
            ),
            None => log::info!("PREDICTED_RNIIRS already populated, nothing to be done"),
        }
        Ok(())
    }

    /// Absolute time of a collection relative time in seconds
    pub fn collect_time(&self, seconds: f64) -> Option<DateTime<Utc>> {
        let start = self.timeline.as_ref()?.collect_start?;
        if !seconds.is_finite() {
            return None;
        }
        let offset = Duration::nanoseconds((seconds * 1e9).round() as i64);
        start.checked_add_signed(offset)
    }

    /// Absolute COA time of the scene center point
    pub fn scp_coa_datetime(&self) -> Option<DateTime<Utc>> {
        let scp_time = self.scpcoa.as_ref()?.scp_time?;
        self.collect_time(scp_time)
    }

    pub fn grid_type(&self) -> Option<&GridType> {
        self.grid.as_ref().and_then(|g| g.grid_type.as_ref())
    }

    pub fn scp_ecf(&self) -> Option<Vector3<f64>> {
        self.geo_data.as_ref()?.scp.as_ref()?.ecf
    }
}

/// Seconds from `reference` to `time` at microsecond resolution
pub fn seconds_between(time: &DateTime<Utc>, reference: &DateTime<Utc>) -> f64 {
    let delta = time.signed_duration_since(*reference);
    match delta.num_microseconds() {
        Some(us) => us as f64 * 1e-6,
        None => delta.num_milliseconds() as f64 * 1e-3,
    }
}

fn log_ground_to_image(result: &GroundToImageResult, config: &ProjectionConfig) {
    let worst = result
        .residuals
        .iter()
        .cloned()
        .filter(|r| r.is_finite())
        .fold(0.0, f64::max);
    if result.iterations >= config.max_iterations && worst > config.tolerance {
        log::warn!(
            "Ground to image did not converge within {} iterations (worst residual {:.3e} m)",
            config.max_iterations,
            worst
        );
    } else {
        log::debug!(
            "Ground to image converged in {} iterations (worst residual {:.3e} m)",
            result.iterations,
            worst
        );
    }
}

fn log_image_to_ground(ground: &Array2<f64>) {
    let failed = ground
        .outer_iter()
        .filter(|row| row.iter().any(|v| v.is_nan()))
        .count();
    if failed > 0 {
        log::warn!(
            "{} of {} image points have no ground intersection",
            failed,
            ground.nrows()
        );
    }
}
