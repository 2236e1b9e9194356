//! Radiometric scale factor derivation and RNIIRS estimation

use crate::core::validation::Diagnostic;
use crate::metadata::{Grid, Sicd};
use crate::types::{SicdError, SicdResult};

/// Empirical fit `rniirs = a0 + a1 * log2(information_density)`
const RNIIRS_FIT: [f64; 2] = [3.7555, 0.3960];

/// Broadening of the impulse response caused by an aperture weighting,
/// `1 + var(w) / mean(w)^2`. Uniform or absent weighting gives 1.
pub fn weighting_factor(weights: &[f64]) -> f64 {
    if weights.is_empty() {
        return 1.0;
    }
    let n = weights.len() as f64;
    let mean = weights.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return 1.0;
    }
    let var = weights.iter().map(|w| (w - mean) * (w - mean)).sum::<f64>() / n;
    1.0 + var / (mean * mean)
}

/// Slant plane area of one resolution cell (m^2), weighting aware
pub fn slant_plane_area(grid: &Grid) -> Option<f64> {
    let row = grid.row.as_ref()?;
    let col = grid.col.as_ref()?;
    let row_bw = row.imp_resp_bw?;
    let col_bw = col.imp_resp_bw?;
    if row_bw == 0.0 || col_bw == 0.0 {
        return None;
    }
    let range_wf = row.wgt_funct.as_deref().map_or(1.0, weighting_factor);
    let azimuth_wf = col.wgt_funct.as_deref().map_or(1.0, weighting_factor);
    Some(range_wf * azimuth_wf / (row_bw * col_bw))
}

/// Fill the missing scale factor polynomials from whichever one is present.
///
/// BetaZero is derived first (from RCS, then SigmaZero, then GammaZero) and
/// every other polynomial follows from it.
pub fn derive_scale_factors(sicd: &mut Sicd) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let area = sicd.grid.as_ref().and_then(slant_plane_area);
    let slope = sicd
        .scpcoa
        .as_ref()
        .and_then(|s| s.slope_ang)
        .map(f64::to_radians);
    let graze = sicd
        .scpcoa
        .as_ref()
        .and_then(|s| s.graze_ang)
        .map(f64::to_radians);

    let Some(radiometric) = sicd.radiometric.as_mut() else {
        return diagnostics;
    };

    if radiometric.beta_zero_sf_poly.is_none() {
        if let Some(rcs) = radiometric.rcs_sf_poly.as_ref() {
            match area {
                Some(area) => radiometric.beta_zero_sf_poly = Some(rcs.scaled(1.0 / area)),
                None => diagnostics.push(Diagnostic::warning(
                    "Radiometric.BetaZeroSFPoly",
                    "cannot derive from RCSSFPoly without Grid impulse response bandwidths",
                )),
            }
        } else if let Some(sigma) = radiometric.sigma_zero_sf_poly.as_ref() {
            match slope {
                Some(slope) => {
                    radiometric.beta_zero_sf_poly = Some(sigma.scaled(1.0 / slope.cos()))
                }
                None => diagnostics.push(Diagnostic::warning(
                    "Radiometric.BetaZeroSFPoly",
                    "cannot derive from SigmaZeroSFPoly without SCPCOA.SlopeAng",
                )),
            }
        } else if let Some(gamma) = radiometric.gamma_zero_sf_poly.as_ref() {
            match (slope, graze) {
                (Some(slope), Some(graze)) => {
                    radiometric.beta_zero_sf_poly =
                        Some(gamma.scaled(graze.sin() / slope.cos()))
                }
                _ => diagnostics.push(Diagnostic::warning(
                    "Radiometric.BetaZeroSFPoly",
                    "cannot derive from GammaZeroSFPoly without SCPCOA.SlopeAng and GrazeAng",
                )),
            }
        }
    }

    let Some(beta) = radiometric.beta_zero_sf_poly.clone() else {
        return diagnostics;
    };
    if radiometric.rcs_sf_poly.is_none() {
        if let Some(area) = area {
            radiometric.rcs_sf_poly = Some(beta.scaled(area));
        }
    }
    if let Some(slope) = slope {
        if radiometric.sigma_zero_sf_poly.is_none() {
            radiometric.sigma_zero_sf_poly = Some(beta.scaled(slope.cos()));
        }
        if radiometric.gamma_zero_sf_poly.is_none() {
            if let Some(graze) = graze {
                radiometric.gamma_zero_sf_poly = Some(beta.scaled(slope.cos() / graze.sin()));
            }
        }
    }
    diagnostics
}

/// Information density and RNIIRS estimate from bandwidth area and
/// single pixel signal/noise levels.
///
/// Below the point where the tangent of the log curve passes through the
/// origin the estimate is continued linearly along that tangent, which keeps
/// it non-negative.
pub fn snr_to_rniirs(bandwidth_area: f64, signal: f64, noise: f64) -> (f64, f64) {
    let information_density = bandwidth_area * (1.0 + signal / noise).log2();
    let [a0, a1] = RNIIRS_FIT;
    let ln2 = std::f64::consts::LN_2;
    let iim_transition = (1.0 - ln2 * a0 / a1).exp();
    let slope = a1 / (iim_transition * ln2);

    let rniirs = if information_density > iim_transition {
        a0 + a1 * information_density.log2()
    } else {
        slope * information_density
    };
    (information_density, rniirs)
}

/// Compute and store INFORMATION_DENSITY and PREDICTED_RNIIRS.
///
/// Returns `None` when a prediction is already present and `overwrite` is
/// not set. Missing noise defaults to the absolute noise level in SigmaZero
/// units; missing signal defaults to 1.0 for co-polar and 0.25 for
/// cross-polar processing.
pub fn populate_rniirs(
    sicd: &mut Sicd,
    signal: Option<f64>,
    noise: Option<f64>,
    overwrite: bool,
) -> SicdResult<Option<(f64, f64)>> {
    let already = sicd
        .collection_info
        .as_ref()
        .ok_or_else(|| SicdError::MissingField("CollectionInfo".to_string()))?
        .parameters
        .contains_key("PREDICTED_RNIIRS");
    if already && !overwrite {
        return Ok(None);
    }

    let noise = match noise {
        Some(n) => n,
        None => estimate_noise(sicd)?,
    };
    let signal = signal.unwrap_or_else(|| default_signal(sicd));

    let row_bw = sicd
        .grid
        .as_ref()
        .and_then(|g| g.row.as_ref())
        .and_then(|r| r.imp_resp_bw)
        .ok_or_else(|| SicdError::MissingField("Grid.Row.ImpRespBW".to_string()))?;
    let col_bw = sicd
        .grid
        .as_ref()
        .and_then(|g| g.col.as_ref())
        .and_then(|c| c.imp_resp_bw)
        .ok_or_else(|| SicdError::MissingField("Grid.Col.ImpRespBW".to_string()))?;
    let slope = sicd
        .scpcoa
        .as_ref()
        .and_then(|s| s.slope_ang)
        .ok_or_else(|| SicdError::MissingField("SCPCOA.SlopeAng".to_string()))?;
    let bandwidth_area = (row_bw * col_bw * slope.to_radians().cos()).abs();

    let (density, rniirs) = snr_to_rniirs(bandwidth_area, signal, noise);
    if let Some(info) = sicd.collection_info.as_mut() {
        info.parameters.insert(
            "INFORMATION_DENSITY".to_string(),
            format_general(density, 2),
        );
        info.parameters
            .insert("PREDICTED_RNIIRS".to_string(), format!("{:.1}", rniirs));
    }
    Ok(Some((density, rniirs)))
}

fn estimate_noise(sicd: &Sicd) -> SicdResult<f64> {
    let radiometric = sicd
        .radiometric
        .as_ref()
        .ok_or_else(|| SicdError::MissingField("Radiometric".to_string()))?;
    let level = radiometric
        .noise_level
        .as_ref()
        .ok_or_else(|| SicdError::MissingField("Radiometric.NoiseLevel".to_string()))?;
    let absolute = level
        .noise_level_type
        .as_deref()
        .map_or(false, |t| t.eq_ignore_ascii_case("ABSOLUTE"));
    if !absolute {
        return Err(SicdError::InvalidArgument(
            "Radiometric.NoiseLevel.NoiseLevelType must be ABSOLUTE to estimate noise; \
             provide a noise estimate"
                .to_string(),
        ));
    }
    let noise_db = level
        .noise_poly
        .as_ref()
        .ok_or_else(|| SicdError::MissingField("Radiometric.NoiseLevel.NoisePoly".to_string()))?
        .eval(0.0, 0.0);
    let sigma_sf = radiometric
        .sigma_zero_sf_poly
        .as_ref()
        .ok_or_else(|| SicdError::MissingField("Radiometric.SigmaZeroSFPoly".to_string()))?
        .eval(0.0, 0.0);
    Ok(10f64.powf(noise_db / 10.0) * sigma_sf)
}

fn default_signal(sicd: &Sicd) -> f64 {
    let pol = sicd
        .image_formation
        .as_ref()
        .and_then(|f| f.tx_rcv_polarization_proc.as_deref());
    match pol.and_then(|p| p.split_once(':')) {
        Some((tx, rcv)) if tx == rcv => 1.0,
        _ => 0.25,
    }
}

/// `%G` style formatting with `precision` significant digits
fn format_general(value: f64, precision: usize) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{}", value);
    }
    let precision = precision.max(1);
    let sci = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => return sci,
    };
    if exponent < -4 || exponent >= precision as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}E{}{:02}",
            trim_fraction(&mantissa),
            sign,
            exponent.abs()
        )
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value))
    }
}

fn trim_fraction(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::polynomial::Poly2D;
    use crate::metadata::{
        CollectionInfo, DirParam, ImageFormation, NoiseLevel, Radiometric, ScpCoa,
    };
    use approx::assert_relative_eq;

    fn radiometric_sicd() -> Sicd {
        let mut sicd = Sicd::default();
        sicd.grid = Some(Grid {
            row: Some(DirParam {
                imp_resp_bw: Some(2.0),
                ..Default::default()
            }),
            col: Some(DirParam {
                imp_resp_bw: Some(1.5),
                wgt_funct: Some(vec![1.0; 16]),
                ..Default::default()
            }),
            ..Default::default()
        });
        sicd.scpcoa = Some(ScpCoa {
            slope_ang: Some(35.0),
            graze_ang: Some(30.0),
            ..Default::default()
        });
        sicd
    }

    #[test]
    fn test_weighting_factor() {
        assert_eq!(weighting_factor(&[]), 1.0);
        assert_relative_eq!(weighting_factor(&[2.0, 2.0, 2.0]), 1.0);
        // mean 1, variance 0.625
        assert_relative_eq!(weighting_factor(&[0.5, 1.5, 0.0, 2.0]), 1.625);
    }

    #[test]
    fn test_scale_factors_from_sigma_zero() {
        let mut sicd = radiometric_sicd();
        sicd.radiometric = Some(Radiometric {
            sigma_zero_sf_poly: Some(Poly2D::constant(4.0)),
            ..Default::default()
        });
        let diagnostics = derive_scale_factors(&mut sicd);
        assert!(diagnostics.is_empty());

        let rad = sicd.radiometric.as_ref().unwrap();
        let slope = 35f64.to_radians();
        let graze = 30f64.to_radians();
        let beta = rad.beta_zero_sf_poly.as_ref().unwrap().eval(0.0, 0.0);
        assert_relative_eq!(beta, 4.0 / slope.cos(), max_relative = 1e-12);
        assert_relative_eq!(
            rad.rcs_sf_poly.as_ref().unwrap().eval(0.0, 0.0),
            beta / 3.0,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            rad.gamma_zero_sf_poly.as_ref().unwrap().eval(0.0, 0.0),
            beta * slope.cos() / graze.sin(),
            max_relative = 1e-12
        );
        assert_relative_eq!(
            rad.sigma_zero_sf_poly.as_ref().unwrap().eval(0.0, 0.0),
            4.0,
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_scale_factors_from_rcs_without_bandwidth() {
        let mut sicd = radiometric_sicd();
        sicd.grid = None;
        sicd.radiometric = Some(Radiometric {
            rcs_sf_poly: Some(Poly2D::constant(1.0)),
            ..Default::default()
        });
        let diagnostics = derive_scale_factors(&mut sicd);
        assert_eq!(diagnostics.len(), 1);
        assert!(sicd.radiometric.unwrap().beta_zero_sf_poly.is_none());
    }

    #[test]
    fn test_rniirs_transition_is_continuous() {
        let [a0, a1] = RNIIRS_FIT;
        let iim = (1.0 - std::f64::consts::LN_2 * a0 / a1).exp();
        // signal/noise chosen so that information density equals the transition
        let below = snr_to_rniirs(iim * (1.0 - 1e-9), 1.0, 1.0).1;
        let above = snr_to_rniirs(iim * (1.0 + 1e-9), 1.0, 1.0).1;
        assert!((below - above).abs() < 1e-6);
        assert!(snr_to_rniirs(1e-6, 1.0, 1.0).1 >= 0.0);

        let (density, rniirs) = snr_to_rniirs(2.0, 3.0, 1.0);
        assert_relative_eq!(density, 4.0);
        assert_relative_eq!(rniirs, a0 + 2.0 * a1);
    }

    #[test]
    fn test_populate_rniirs() {
        let mut sicd = radiometric_sicd();
        sicd.collection_info = Some(CollectionInfo::default());
        sicd.image_formation = Some(ImageFormation {
            tx_rcv_polarization_proc: Some("V:V".to_string()),
            ..Default::default()
        });
        sicd.radiometric = Some(Radiometric {
            noise_level: Some(NoiseLevel {
                noise_level_type: Some("ABSOLUTE".to_string()),
                noise_poly: Some(Poly2D::constant(-10.0)),
            }),
            sigma_zero_sf_poly: Some(Poly2D::constant(2.0)),
            ..Default::default()
        });

        let (density, rniirs) = populate_rniirs(&mut sicd, None, None, false)
            .unwrap()
            .unwrap();
        let bw_area = 3.0 * 35f64.to_radians().cos();
        assert_relative_eq!(density, bw_area * (1.0f64 + 1.0 / 0.2).log2(), max_relative = 1e-12);

        let params = &sicd.collection_info.as_ref().unwrap().parameters;
        assert_eq!(params["PREDICTED_RNIIRS"], format!("{:.1}", rniirs));
        assert!(params.contains_key("INFORMATION_DENSITY"));

        assert!(populate_rniirs(&mut sicd, Some(1.0), Some(1.0), false)
            .unwrap()
            .is_none());
        assert!(populate_rniirs(&mut sicd, Some(1.0), Some(1.0), true)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_format_general() {
        assert_eq!(format_general(6.3456, 2), "6.3");
        assert_eq!(format_general(12.7, 2), "13");
        assert_eq!(format_general(123456.0, 2), "1.2E+05");
        assert_eq!(format_general(0.5, 2), "0.5");
        assert_eq!(format_general(1.2e-5, 2), "1.2E-05");
    }
}
