//! Polynomial model for SICD metadata
//!
//! One- and two-variable power-series polynomials plus the vector valued
//! `XyzPoly` used for platform trajectories. All transforms return new
//! polynomials; coefficient arrays are never modified in place.

use crate::types::{SicdError, SicdResult};
use nalgebra::{DMatrix, DVector, Vector3};
use ndarray::{Array1, Array2, ArrayViewMut1, Axis};
use serde::{Deserialize, Serialize};

/// Single variable polynomial, `coefs[k]` multiplies `x^k`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poly1D {
    coefs: Array1<f64>,
}

impl Poly1D {
    pub fn new(coefs: Array1<f64>) -> Self {
        Self { coefs }
    }

    pub fn from_slice(coefs: &[f64]) -> Self {
        Self::new(Array1::from(coefs.to_vec()))
    }

    pub fn constant(value: f64) -> Self {
        Self::from_slice(&[value])
    }

    pub fn coefs(&self) -> &Array1<f64> {
        &self.coefs
    }

    /// Largest exponent present in the coefficient array
    pub fn order(&self) -> usize {
        self.coefs.len().saturating_sub(1)
    }

    /// Horner evaluation; an empty coefficient array evaluates to zero
    pub fn eval(&self, x: f64) -> f64 {
        self.coefs.iter().rev().fold(0.0, |acc, &c| acc * x + c)
    }

    pub fn eval_array(&self, x: &Array1<f64>) -> Array1<f64> {
        x.mapv(|v| self.eval(v))
    }

    /// The `order`-th derivative. Order zero returns a copy.
    pub fn derivative(&self, order: usize) -> Poly1D {
        let mut coefs = self.coefs.to_vec();
        for _ in 0..order {
            if coefs.len() <= 1 {
                coefs = vec![0.0];
                break;
            }
            coefs = coefs
                .iter()
                .enumerate()
                .skip(1)
                .map(|(k, &c)| k as f64 * c)
                .collect();
        }
        Poly1D::new(Array1::from(coefs))
    }

    /// Derivative entry point for callers holding a signed order
    pub fn derivative_checked(&self, order: i64) -> SicdResult<Poly1D> {
        if order < 0 {
            return Err(SicdError::InvalidArgument(format!(
                "derivative order must be non-negative, got {}",
                order
            )));
        }
        Ok(self.derivative(order as usize))
    }

    pub fn derivative_eval(&self, x: f64, order: usize) -> f64 {
        self.derivative(order).eval(x)
    }

    /// Polynomial `Q` with `P(x) = Q(scale * (x - center))`.
    ///
    /// Equivalently `Q(u) = P(u / scale + center)`. Composition follows
    /// `shift(shift(P, t1, a1), t2, a2) == shift(P, t1 + t2 / a1, a1 * a2)`.
    pub fn shift(&self, center: f64, scale: f64) -> SicdResult<Poly1D> {
        validate_shift(center, scale)?;
        let mut out = self.coefs.clone();
        shift_lane(out.view_mut(), center, scale);
        Ok(Poly1D::new(out))
    }
}

impl From<Vec<f64>> for Poly1D {
    fn from(coefs: Vec<f64>) -> Self {
        Poly1D::new(Array1::from(coefs))
    }
}

/// Two variable polynomial, `coefs[[i, j]]` multiplies `x^i * y^j`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poly2D {
    coefs: Array2<f64>,
}

impl Poly2D {
    pub fn new(coefs: Array2<f64>) -> Self {
        Self { coefs }
    }

    pub fn constant(value: f64) -> Self {
        Self::new(Array2::from_elem((1, 1), value))
    }

    /// Build from row-major nested coefficients; rows must share one length
    pub fn from_rows(rows: &[Vec<f64>]) -> SicdResult<Self> {
        let n1 = rows.len();
        let n2 = rows.first().map(|r| r.len()).unwrap_or(0);
        if n1 == 0 || n2 == 0 {
            return Err(SicdError::InvalidArgument(
                "Poly2D coefficients must be a non-empty two-dimensional array".to_string(),
            ));
        }
        if rows.iter().any(|r| r.len() != n2) {
            return Err(SicdError::InvalidArgument(
                "Poly2D coefficient rows must all have the same length".to_string(),
            ));
        }
        let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        let coefs = Array2::from_shape_vec((n1, n2), flat)
            .map_err(|e| SicdError::InvalidArgument(format!("Poly2D shape error: {}", e)))?;
        Ok(Self::new(coefs))
    }

    pub fn coefs(&self) -> &Array2<f64> {
        &self.coefs
    }

    pub fn order1(&self) -> usize {
        self.coefs.nrows().saturating_sub(1)
    }

    pub fn order2(&self) -> usize {
        self.coefs.ncols().saturating_sub(1)
    }

    pub fn is_constant(&self) -> bool {
        self.coefs.dim() == (1, 1)
    }

    pub fn eval(&self, x: f64, y: f64) -> f64 {
        self.coefs
            .outer_iter()
            .rev()
            .fold(0.0, |acc, row| {
                let inner = row.iter().rev().fold(0.0, |a, &c| a * y + c);
                acc * x + inner
            })
    }

    pub fn eval_arrays(&self, x: &Array1<f64>, y: &Array1<f64>) -> SicdResult<Array1<f64>> {
        if x.len() != y.len() {
            return Err(SicdError::InvalidArgument(format!(
                "Poly2D evaluation needs paired inputs, got {} and {} points",
                x.len(),
                y.len()
            )));
        }
        Ok(Array1::from_iter(
            x.iter().zip(y.iter()).map(|(&xv, &yv)| self.eval(xv, yv)),
        ))
    }

    /// Partial derivative of order `der1` in x and `der2` in y
    pub fn derivative(&self, der1: usize, der2: usize) -> Poly2D {
        let mut out = self.coefs.clone();
        for _ in 0..der1 {
            out = differentiate_axis(&out, Axis(0));
        }
        for _ in 0..der2 {
            out = differentiate_axis(&out, Axis(1));
        }
        Poly2D::new(out)
    }

    /// Coefficient grid multiplied by a constant
    pub fn scaled(&self, factor: f64) -> Poly2D {
        Poly2D::new(&self.coefs * factor)
    }

    /// Polynomial `Q` with
    /// `P(x, y) = Q(t1_scale * (x - t1_shift), t2_scale * (y - t2_shift))`.
    /// The axes are transformed independently, so the order is irrelevant.
    pub fn shift(
        &self,
        t1_shift: f64,
        t1_scale: f64,
        t2_shift: f64,
        t2_scale: f64,
    ) -> SicdResult<Poly2D> {
        validate_shift(t1_shift, t1_scale)?;
        validate_shift(t2_shift, t2_scale)?;
        let mut out = self.coefs.clone();
        for lane in out.lanes_mut(Axis(0)) {
            shift_lane(lane, t1_shift, t1_scale);
        }
        for lane in out.lanes_mut(Axis(1)) {
            shift_lane(lane, t2_shift, t2_scale);
        }
        Ok(Poly2D::new(out))
    }

    /// Shift only the first variable
    pub fn shift_axis1(&self, shift: f64, scale: f64) -> SicdResult<Poly2D> {
        self.shift(shift, scale, 0.0, 1.0)
    }

    /// Shift only the second variable
    pub fn shift_axis2(&self, shift: f64, scale: f64) -> SicdResult<Poly2D> {
        self.shift(0.0, 1.0, shift, scale)
    }
}

/// Vector valued polynomial giving an ECF position as a function of time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XyzPoly {
    pub x: Poly1D,
    pub y: Poly1D,
    pub z: Poly1D,
}

impl XyzPoly {
    pub fn new(x: Poly1D, y: Poly1D, z: Poly1D) -> Self {
        Self { x, y, z }
    }

    /// Quadratic trajectory through `position` at `t0` with the given
    /// velocity and acceleration, expressed in absolute time.
    pub fn from_state(
        position: Vector3<f64>,
        velocity: Vector3<f64>,
        acceleration: Vector3<f64>,
        t0: f64,
    ) -> SicdResult<Self> {
        let axis = |i: usize| {
            Poly1D::from_slice(&[position[i], velocity[i], 0.5 * acceleration[i]]).shift(-t0, 1.0)
        };
        Ok(Self::new(axis(0)?, axis(1)?, axis(2)?))
    }

    pub fn eval(&self, t: f64) -> Vector3<f64> {
        Vector3::new(self.x.eval(t), self.y.eval(t), self.z.eval(t))
    }

    /// Evaluate at many times, stacked as an `N x 3` array
    pub fn eval_array(&self, t: &Array1<f64>) -> Array2<f64> {
        let mut out = Array2::zeros((t.len(), 3));
        for (mut row, &tv) in out.outer_iter_mut().zip(t.iter()) {
            let v = self.eval(tv);
            row[0] = v.x;
            row[1] = v.y;
            row[2] = v.z;
        }
        out
    }

    pub fn derivative(&self, order: usize) -> XyzPoly {
        XyzPoly::new(
            self.x.derivative(order),
            self.y.derivative(order),
            self.z.derivative(order),
        )
    }

    pub fn derivative_eval(&self, t: f64, order: usize) -> Vector3<f64> {
        self.derivative(order).eval(t)
    }

    pub fn shift(&self, center: f64, scale: f64) -> SicdResult<XyzPoly> {
        Ok(XyzPoly::new(
            self.x.shift(center, scale)?,
            self.y.shift(center, scale)?,
            self.z.shift(center, scale)?,
        ))
    }
}

/// Result of a two dimensional least squares polynomial fit
#[derive(Debug, Clone)]
pub struct PolyFit {
    pub poly: Poly2D,
    /// Root mean square residual of the fit, in units of `z`
    pub rms_residual: f64,
    pub rank: usize,
    pub singular_values: Vec<f64>,
}

/// Least squares fit of `z ~ P(x, y)` with `P` of the given orders.
///
/// The independent variables are multiplied by `x_scale`/`y_scale` before
/// fitting to improve conditioning; the returned coefficients are expressed
/// in the original variables.
pub fn two_dim_poly_fit(
    x: &Array1<f64>,
    y: &Array1<f64>,
    z: &Array1<f64>,
    x_order: usize,
    y_order: usize,
    x_scale: f64,
    y_scale: f64,
) -> SicdResult<PolyFit> {
    if x.len() != z.len() || y.len() != z.len() {
        return Err(SicdError::InvalidArgument(format!(
            "x, y, z must have the same size, got {}, {}, {}",
            x.len(),
            y.len(),
            z.len()
        )));
    }
    if z.is_empty() {
        return Err(SicdError::InvalidArgument(
            "cannot fit a polynomial to zero samples".to_string(),
        ));
    }

    let n = z.len();
    let n_terms = (x_order + 1) * (y_order + 1);
    let mut a_mat = DMatrix::<f64>::zeros(n, n_terms);
    for k in 0..n {
        let xs = x[k] * x_scale;
        let ys = y[k] * y_scale;
        for i in 0..=x_order {
            for j in 0..=y_order {
                a_mat[(k, i * (y_order + 1) + j)] = xs.powi(i as i32) * ys.powi(j as i32);
            }
        }
    }
    let b_vec = DVector::from_iterator(n, z.iter().copied());

    let svd = a_mat.clone().svd(true, true);
    let singular_values: Vec<f64> = svd.singular_values.iter().copied().collect();
    let max_sv = singular_values.iter().cloned().fold(0.0, f64::max);
    let eps = max_sv * f64::EPSILON * (n.max(n_terms) as f64);
    let rank = singular_values.iter().filter(|&&s| s > eps).count();

    let solution = svd
        .solve(&b_vec, eps)
        .map_err(|e| SicdError::InvalidArgument(format!("polynomial fit failed: {}", e)))?;

    let fitted = &a_mat * &solution;
    let sum_sq: f64 = fitted
        .iter()
        .zip(b_vec.iter())
        .map(|(f, b)| (f - b) * (f - b))
        .sum();
    let rms_residual = (sum_sq / n as f64).sqrt();

    let mut coefs = Array2::<f64>::zeros((x_order + 1, y_order + 1));
    for i in 0..=x_order {
        for j in 0..=y_order {
            coefs[[i, j]] =
                solution[i * (y_order + 1) + j] * x_scale.powi(i as i32) * y_scale.powi(j as i32);
        }
    }

    Ok(PolyFit {
        poly: Poly2D::new(coefs),
        rms_residual,
        rank,
        singular_values,
    })
}

fn validate_shift(center: f64, scale: f64) -> SicdResult<()> {
    if !center.is_finite() || !scale.is_finite() {
        return Err(SicdError::InvalidArgument(format!(
            "polynomial shift parameters must be finite, got center={} scale={}",
            center, scale
        )));
    }
    if scale == 0.0 {
        return Err(SicdError::InvalidArgument(
            "polynomial shift scale must be non-zero".to_string(),
        ));
    }
    Ok(())
}

/// In-place Taylor shift by `center` followed by rescale by `1/scale`.
/// Both steps are skipped when they are the identity.
fn shift_lane(mut lane: ArrayViewMut1<f64>, center: f64, scale: f64) {
    let n = lane.len();
    if n < 2 {
        return;
    }
    if center != 0.0 {
        // Horner style: fold the highest coefficient down once per degree
        for k in 0..n - 1 {
            for j in (k..n - 1).rev() {
                let upper = lane[j + 1];
                lane[j] += center * upper;
            }
        }
    }
    if scale != 1.0 {
        let inv = 1.0 / scale;
        let mut factor = 1.0;
        for c in lane.iter_mut() {
            *c *= factor;
            factor *= inv;
        }
    }
}

fn differentiate_axis(coefs: &Array2<f64>, axis: Axis) -> Array2<f64> {
    let len = coefs.len_of(axis);
    if len <= 1 {
        let mut shape = coefs.raw_dim();
        shape[axis.index()] = 1;
        return Array2::zeros(shape);
    }
    let mut shape = coefs.raw_dim();
    shape[axis.index()] = len - 1;
    let mut out = Array2::zeros(shape);
    for k in 1..len {
        let src = coefs.index_axis(axis, k);
        let mut dst = out.index_axis_mut(axis, k - 1);
        dst.assign(&(&src * k as f64));
    }
    out
}
