//! Structural validation of SICD metadata
//!
//! Validation never logs and never fails: it returns a `ValidationReport`
//! holding field level diagnostics, and the `Sicd` façade decides what to
//! emit through `log`.

use crate::core::projection::check_projection;
use crate::metadata::Sicd;
use crate::types::{ImageFormAlgo, RadarModeType, SicdError, SicdResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a single diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One finding about one metadata field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted SICD path of the field concerned, e.g. `Grid.TimeCOAPoly`
    pub field: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(severity: Severity, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn info(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, field, message)
    }

    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, field, message)
    }

    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, field, message)
    }

    /// Forward this diagnostic to the `log` facade at the matching level
    pub fn emit(&self) {
        match self.severity {
            Severity::Info => log::info!("{}", self),
            Severity::Warning => log::warn!("{}", self),
            Severity::Error => log::error!("{}", self),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Collected diagnostics from a validation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationReport {
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// True when no diagnostic has `Error` severity
    pub fn is_valid(&self) -> bool {
        !self
            .diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.by_severity(Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.by_severity(Severity::Warning)
    }

    /// First diagnostic concerning the given field, if any
    pub fn find(&self, field: &str) -> Option<&Diagnostic> {
        self.diagnostics.iter().find(|d| d.field == field)
    }

    fn by_severity(&self, severity: Severity) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(move |d| d.severity == severity)
    }
}

/// Image formation algorithm resolved from the parameter blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormationAlgorithm {
    RgAzComp,
    Pfa,
    Rma,
    Other,
}

impl ImageFormationAlgorithm {
    /// SICD block name holding the algorithm parameters
    pub fn block_name(&self) -> &'static str {
        match self {
            ImageFormationAlgorithm::RgAzComp => "RgAzComp",
            ImageFormationAlgorithm::Pfa => "PFA",
            ImageFormationAlgorithm::Rma => "RMA",
            ImageFormationAlgorithm::Other => "OTHER",
        }
    }

    pub fn as_form_algo(&self) -> ImageFormAlgo {
        match self {
            ImageFormationAlgorithm::RgAzComp => ImageFormAlgo::RgAzComp,
            ImageFormationAlgorithm::Pfa => ImageFormAlgo::Pfa,
            ImageFormationAlgorithm::Rma => ImageFormAlgo::Rma,
            ImageFormationAlgorithm::Other => ImageFormAlgo::Other,
        }
    }
}

/// Algorithm blocks present on the metadata, in RgAzComp, PFA, RMA order
pub(crate) fn populated_algorithm_blocks(sicd: &Sicd) -> Vec<ImageFormationAlgorithm> {
    let mut blocks = Vec::new();
    if sicd.rg_az_comp.is_some() {
        blocks.push(ImageFormationAlgorithm::RgAzComp);
    }
    if sicd.pfa.is_some() {
        blocks.push(ImageFormationAlgorithm::Pfa);
    }
    if sicd.rma.is_some() {
        blocks.push(ImageFormationAlgorithm::Rma);
    }
    blocks
}

/// Resolve the image formation algorithm from the parameter blocks and
/// `ImageFormation.ImageFormAlgo`.
///
/// More than one populated block, or a declared algorithm that names a
/// different block, is `UnsupportedConfiguration`. A declared algorithm
/// whose block is absent is `MissingField`.
pub fn resolve_image_formation(sicd: &Sicd) -> SicdResult<ImageFormationAlgorithm> {
    let declared = sicd
        .image_formation
        .as_ref()
        .and_then(|f| f.image_form_algo.clone());
    let blocks = populated_algorithm_blocks(sicd);

    if blocks.len() > 1 {
        let names: Vec<&str> = blocks.iter().map(|b| b.block_name()).collect();
        return Err(SicdError::UnsupportedConfiguration(format!(
            "multiple image formation blocks are populated: {}",
            names.join(", ")
        )));
    }

    match (blocks.first(), declared) {
        (Some(block), None) => Ok(*block),
        (Some(block), Some(algo)) => {
            if block.as_form_algo() == algo {
                Ok(*block)
            } else {
                Err(SicdError::UnsupportedConfiguration(format!(
                    "ImageFormAlgo is {} but the {} block is populated",
                    algo,
                    block.block_name()
                )))
            }
        }
        (None, None) | (None, Some(ImageFormAlgo::Other)) => Ok(ImageFormationAlgorithm::Other),
        (None, Some(ImageFormAlgo::Pfa)) => Err(SicdError::MissingField("PFA".to_string())),
        (None, Some(ImageFormAlgo::Rma)) => Err(SicdError::MissingField("RMA".to_string())),
        (None, Some(ImageFormAlgo::RgAzComp)) => {
            Err(SicdError::MissingField("RgAzComp".to_string()))
        }
        (None, Some(ImageFormAlgo::Unrecognized(name))) => Err(
            SicdError::UnsupportedConfiguration(format!("unrecognized ImageFormAlgo {}", name)),
        ),
    }
}

/// Run every structural check and collect the findings
pub fn validate(sicd: &Sicd) -> ValidationReport {
    let mut report = ValidationReport::default();
    check_required_blocks(sicd, &mut report);
    check_image_formation(sicd, &mut report);
    check_segments(sicd, &mut report);
    check_processed_band(sicd, &mut report);
    check_spotlight_mode(sicd, &mut report);
    check_recommended_fields(sicd, &mut report);
    check_projection_feasibility(sicd, &mut report);
    report
}

fn check_required_blocks(sicd: &Sicd, report: &mut ValidationReport) {
    let required = [
        ("CollectionInfo", sicd.collection_info.is_some()),
        ("ImageData", sicd.image_data.is_some()),
        ("GeoData", sicd.geo_data.is_some()),
        ("Grid", sicd.grid.is_some()),
        ("Timeline", sicd.timeline.is_some()),
        ("Position", sicd.position.is_some()),
        ("RadarCollection", sicd.radar_collection.is_some()),
        ("ImageFormation", sicd.image_formation.is_some()),
        ("SCPCOA", sicd.scpcoa.is_some()),
    ];
    for (name, present) in required {
        if !present {
            report.push(Diagnostic::error(name, "required block is not populated"));
        }
    }
}

fn check_image_formation(sicd: &Sicd, report: &mut ValidationReport) {
    let blocks = populated_algorithm_blocks(sicd);
    let declared = sicd
        .image_formation
        .as_ref()
        .and_then(|f| f.image_form_algo.clone());

    if blocks.len() > 1 {
        let names: Vec<&str> = blocks.iter().map(|b| b.block_name()).collect();
        report.push(Diagnostic::error(
            "ImageFormation",
            format!(
                "only one image formation block may be populated, found {}",
                names.join(", ")
            ),
        ));
        return;
    }

    match (blocks.first(), declared) {
        (None, None) => {
            if sicd.image_formation.is_some() {
                report.push(Diagnostic::warning(
                    "ImageFormation.ImageFormAlgo",
                    "not populated and no algorithm block present; derive sets OTHER",
                ));
            }
        }
        (None, Some(ImageFormAlgo::Other)) => {
            report.push(Diagnostic::info(
                "ImageFormation.ImageFormAlgo",
                "OTHER image formation; projection is limited to plane grid types",
            ));
        }
        (None, Some(algo)) => {
            report.push(Diagnostic::error(
                "ImageFormation.ImageFormAlgo",
                format!("{} is declared but its parameter block is not populated", algo),
            ));
        }
        (Some(block), None) => {
            report.push(Diagnostic::warning(
                "ImageFormation.ImageFormAlgo",
                format!(
                    "not populated although the {} block is present; derive sets it",
                    block.block_name()
                ),
            ));
        }
        (Some(block), Some(algo)) => {
            if block.as_form_algo() != algo {
                report.push(Diagnostic::error(
                    "ImageFormation.ImageFormAlgo",
                    format!(
                        "declared as {} but the {} block is populated",
                        algo,
                        block.block_name()
                    ),
                ));
            }
        }
    }
}

fn check_segments(sicd: &Sicd, report: &mut ValidationReport) {
    let identifier = sicd
        .image_formation
        .as_ref()
        .and_then(|f| f.segment_identifier.as_ref());
    let segments = sicd
        .radar_collection
        .as_ref()
        .and_then(|r| r.segment_list.as_ref());

    match (identifier, segments) {
        (Some(id), None) => report.push(Diagnostic::error(
            "ImageFormation.SegmentIdentifier",
            format!(
                "is {} but RadarCollection.Area.Plane.SegmentList is not populated",
                id
            ),
        )),
        (Some(id), Some(list)) => {
            if !list.iter().any(|s| s == id) {
                report.push(Diagnostic::error(
                    "ImageFormation.SegmentIdentifier",
                    format!(
                        "{} is not among the segment identifiers {:?}",
                        id, list
                    ),
                ));
            }
        }
        (None, Some(list)) if !list.is_empty() => report.push(Diagnostic::warning(
            "ImageFormation.SegmentIdentifier",
            "a segment list is populated but no segment is identified",
        )),
        _ => {}
    }
}

/// The processed band must be ordered and lie inside the collected band
fn check_processed_band(sicd: &Sicd, report: &mut ValidationReport) {
    let Some(proc) = sicd
        .image_formation
        .as_ref()
        .and_then(|f| f.tx_frequency_proc.as_ref())
    else {
        return;
    };
    let field = "ImageFormation.TxFrequencyProc";
    if let (Some(min), Some(max)) = (proc.min_proc, proc.max_proc) {
        if min > max {
            report.push(Diagnostic::error(
                field,
                format!("MinProc {} exceeds MaxProc {}", min, max),
            ));
            return;
        }
    }

    let Some(band) = sicd
        .radar_collection
        .as_ref()
        .and_then(|r| r.tx_frequency.as_ref())
    else {
        return;
    };
    // Relative slack for band edges rounded on output
    const SLACK: f64 = 1e-9;
    if let (Some(min_proc), Some(min)) = (proc.min_proc, band.min) {
        if min_proc < min - SLACK * min.abs() {
            report.push(Diagnostic::warning(
                field,
                format!("MinProc {} is below RadarCollection.TxFrequency.Min {}", min_proc, min),
            ));
        }
    }
    if let (Some(max_proc), Some(max)) = (proc.max_proc, band.max) {
        if max_proc > max + SLACK * max.abs() {
            report.push(Diagnostic::warning(
                field,
                format!("MaxProc {} is above RadarCollection.TxFrequency.Max {}", max_proc, max),
            ));
        }
    }
}

fn check_spotlight_mode(sicd: &Sicd, report: &mut ValidationReport) {
    let mode = sicd
        .collection_info
        .as_ref()
        .and_then(|c| c.radar_mode.as_ref())
        .and_then(|m| m.mode_type);
    let time_coa = sicd.grid.as_ref().and_then(|g| g.time_coa_poly.as_ref());

    let (Some(mode), Some(poly)) = (mode, time_coa) else {
        return;
    };
    let constant = is_effectively_constant(poly.coefs());
    match (mode, constant) {
        (RadarModeType::Spotlight, false) => report.push(Diagnostic::error(
            "Grid.TimeCOAPoly",
            "spotlight collection with a non-constant TimeCOAPoly",
        )),
        (RadarModeType::Stripmap | RadarModeType::DynamicStripmap, true) => {
            report.push(Diagnostic::warning(
                "Grid.TimeCOAPoly",
                "TimeCOAPoly is constant but the collection is not spotlight",
            ))
        }
        _ => {}
    }
}

fn is_effectively_constant(coefs: &ndarray::Array2<f64>) -> bool {
    coefs
        .indexed_iter()
        .all(|((i, j), &c)| (i == 0 && j == 0) || c == 0.0)
}

fn check_recommended_fields(sicd: &Sicd, report: &mut ValidationReport) {
    if sicd.grid.is_some() && sicd.grid.as_ref().and_then(|g| g.time_coa_poly.as_ref()).is_none() {
        report.push(Diagnostic::warning(
            "Grid.TimeCOAPoly",
            "not populated; projection falls back to a constant COA time",
        ));
    }
    if sicd.scpcoa.is_some() && sicd.scpcoa.as_ref().and_then(|s| s.scp_time).is_none() {
        report.push(Diagnostic::warning("SCPCOA.SCPTime", "not populated"));
    }
    if sicd.timeline.is_some()
        && sicd
            .timeline
            .as_ref()
            .and_then(|t| t.collect_start)
            .is_none()
    {
        report.push(Diagnostic::warning("Timeline.CollectStart", "not populated"));
    }
}

fn check_projection_feasibility(sicd: &Sicd, report: &mut ValidationReport) {
    match check_projection(sicd) {
        Ok(warnings) => {
            report.push(Diagnostic::info("projection", "COA projection is feasible"));
            for warning in warnings {
                if report.find(&warning.field).is_none() {
                    report.push(warning);
                }
            }
        }
        Err(e) => report.push(Diagnostic::warning("projection", e.to_string())),
    }
}
