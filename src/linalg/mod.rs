// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dense complex linear algebra used by compression and projection.
//!
//! Everything here takes and returns `ndarray` arrays; the decompositions
//! themselves are done by `nalgebra`. Every decomposition is bounded: an SVD
//! that fails to converge is retried exactly once after a small diagonal
//! regularisation, and then gives up with an error.

mod error;
#[cfg(test)]
mod tests;

pub use error::LinalgError;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use num_traits::{One, Zero};
use ndarray::prelude::*;
use rayon::prelude::*;

use crate::{
    c64,
    constants::{
        PINV_QR_RANK_TOL, SVD_ITERATIONS_PER_DIM, SVD_MIN_ITERATIONS, SVD_REGULARISATION,
    },
};

/// A thin SVD with singular values in descending order.
#[derive(Debug, Clone)]
pub struct Svd {
    /// Left singular vectors as columns, `[m, k]`.
    pub u: Array2<c64>,

    /// Singular values, `[k]`.
    pub s: Array1<f64>,

    /// Conjugate-transposed right singular vectors, `[k, n]`.
    pub vh: Array2<c64>,
}

pub(crate) fn to_nalgebra(a: ArrayView2<c64>) -> DMatrix<c64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[(i, j)])
}

pub(crate) fn from_nalgebra(m: &DMatrix<c64>) -> Array2<c64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// The conjugate transpose of `a`, in standard (row-major) layout.
pub fn adjoint(a: ArrayView2<c64>) -> Array2<c64> {
    Array2::from_shape_fn((a.ncols(), a.nrows()), |(i, j)| a[(j, i)].conj())
}

fn all_finite<'a, I: IntoIterator<Item = &'a c64>>(values: I) -> bool {
    values
        .into_iter()
        .all(|z| z.re.is_finite() && z.im.is_finite())
}

fn max_iterations(dim: usize) -> usize {
    (SVD_ITERATIONS_PER_DIM * dim).max(SVD_MIN_ITERATIONS)
}

fn try_thin_svd(m: DMatrix<c64>) -> Option<Svd> {
    let (rows, cols) = m.shape();
    let k = rows.min(cols);
    if k == 0 {
        return Some(Svd {
            u: Array2::zeros((rows, 0)),
            s: Array1::zeros(0),
            vh: Array2::zeros((0, cols)),
        });
    }
    if !all_finite(m.iter()) {
        return None;
    }

    let svd = m.try_svd(true, true, f64::EPSILON, max_iterations(k))?;
    let u = svd.u?;
    let v_t = svd.v_t?;
    let s = svd.singular_values;
    if s.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| s[b].total_cmp(&s[a]));
    Some(Svd {
        u: Array2::from_shape_fn((rows, k), |(i, j)| u[(i, order[j])]),
        s: Array1::from_shape_fn(k, |j| s[order[j]]),
        vh: Array2::from_shape_fn((k, cols), |(j, c)| v_t[(order[j], c)]),
    })
}

/// Estimate the largest singular value without an SVD (power iteration on
/// `A^H A`). Used only to scale the regularisation of a failed SVD.
fn top_singular_value(m: &DMatrix<c64>) -> f64 {
    let n = m.ncols();
    if n == 0 || m.nrows() == 0 {
        return 0.0;
    }
    let mut x = DVector::from_element(n, c64::new(1.0 / (n as f64).sqrt(), 0.0));
    let mut lambda = 0.0;
    for _ in 0..100 {
        let y = m * &x;
        let z = m.adjoint() * y;
        let norm = z.norm();
        if !norm.is_finite() || norm == 0.0 {
            break;
        }
        lambda = norm;
        x = z * c64::new(1.0 / norm, 0.0);
    }
    if lambda.is_finite() && lambda > 0.0 {
        lambda.sqrt()
    } else {
        m.iter()
            .filter(|z| z.re.is_finite() && z.im.is_finite())
            .map(|z| z.norm_sqr())
            .sum::<f64>()
            .sqrt()
    }
}

/// Thin SVD of `a`. If the decomposition does not converge, it is retried once
/// with `SVD_REGULARISATION * s0` added to the diagonal (where `s0` is the
/// largest singular value), and the failure is reported as a warning. Only if
/// the retry also fails is an error returned.
pub fn svd_gen(a: ArrayView2<c64>, what: &'static str) -> Result<Svd, LinalgError> {
    let m = to_nalgebra(a);
    if let Some(svd) = try_thin_svd(m.clone()) {
        return Ok(svd);
    }

    let (rows, cols) = m.shape();
    let s0 = top_singular_value(&m);
    warn!("{what}: SVD of a {rows}x{cols} matrix did not converge; retrying with regularisation {:e}", s0 * SVD_REGULARISATION);
    let regularised =
        m + DMatrix::<c64>::identity(rows, cols) * c64::new(s0 * SVD_REGULARISATION, 0.0);
    match try_thin_svd(regularised) {
        Some(svd) => {
            warn!("{what}: regularised SVD succeeded");
            Ok(svd)
        }
        None => Err(LinalgError::NonConvergence { what, rows, cols }),
    }
}

/// An orthonormal basis (as columns) for the image of `a`, keeping the left
/// singular vectors whose singular values are strictly greater than
/// `rtol * s0`. The full singular-value spectrum is returned alongside.
///
/// With `rtol = 0`, only strictly-positive singular values are kept.
pub fn matrix_image(
    a: ArrayView2<c64>,
    rtol: f64,
    what: &'static str,
) -> Result<(Array2<c64>, Array1<f64>), LinalgError> {
    let Svd { u, s, .. } = svd_gen(a, what)?;
    let s0 = s.first().copied().unwrap_or(0.0);
    let cut = s.iter().filter(|&&v| v > s0 * rtol).count();
    Ok((u.slice(s![.., ..cut]).to_owned(), s))
}

/// An orthonormal basis (as columns) for the left null space of `a`, i.e. the
/// directions `x` with `x^H a = 0` to within `rtol`.
///
/// A singular value counts as "in the range" only if it is strictly positive
/// and at least `rtol * s0`. An identically-zero (or empty) matrix therefore
/// has the whole space as its null space.
pub fn matrix_nullspace(
    a: ArrayView2<c64>,
    rtol: f64,
    what: &'static str,
) -> Result<(Array2<c64>, Array1<f64>), LinalgError> {
    let (rows, cols) = a.dim();
    if rows == 0 || cols == 0 {
        return Ok((
            Array2::from_diag_elem(rows, c64::one()),
            Array1::zeros(0),
        ));
    }

    // Pad with zero columns so that the thin SVD yields every left singular
    // vector.
    let Svd { u, s, .. } = if cols < rows {
        let mut padded = Array2::zeros((rows, rows));
        padded.slice_mut(s![.., ..cols]).assign(&a);
        svd_gen(padded.view(), what)?
    } else {
        svd_gen(a, what)?
    };
    let s0 = s.first().copied().unwrap_or(0.0);
    let cut = s.iter().filter(|&&v| v > 0.0 && v >= s0 * rtol).count();
    let spectrum = s.slice(s![..rows.min(cols)]).to_owned();
    Ok((u.slice(s![.., cut..]).to_owned(), spectrum))
}

/// QR-based least-squares pseudo-inverse. `None` if the matrix is numerically
/// rank deficient.
fn pinv_qr(a: ArrayView2<c64>) -> Option<Array2<c64>> {
    let (rows, cols) = a.dim();
    // Factorise whichever of A and A^H is tall.
    let wide = rows < cols;
    let m = if wide {
        to_nalgebra(a).adjoint()
    } else {
        to_nalgebra(a)
    };
    let qr = m.qr();
    let (q, r) = (qr.q(), qr.r());

    let diag_max = (0..r.nrows())
        .map(|i| r[(i, i)].norm())
        .fold(0.0, f64::max);
    if !diag_max.is_finite() || diag_max <= 0.0 {
        return None;
    }
    if (0..r.nrows()).any(|i| r[(i, i)].norm() <= diag_max * PINV_QR_RANK_TOL) {
        return None;
    }

    // R^{-1} Q^H is the pseudo-inverse of the tall factorisation.
    let x = r.solve_upper_triangular(&q.adjoint())?;
    let x = if wide { x.adjoint() } else { x };
    if !all_finite(x.iter()) {
        return None;
    }
    Some(from_nalgebra(&x))
}

/// SVD-based pseudo-inverse, discarding singular values at or below
/// `rcond * s0`.
pub fn pinv_rcond(
    a: ArrayView2<c64>,
    rcond: f64,
    what: &'static str,
) -> Result<Array2<c64>, LinalgError> {
    let Svd { u, s, vh } = svd_gen(a, what)?;
    let s0 = s.first().copied().unwrap_or(0.0);
    let inv_s = s.mapv(|v| {
        if v > rcond * s0 {
            c64::new(1.0 / v, 0.0)
        } else {
            c64::zero()
        }
    });
    // A^+ = V S^+ U^H
    let v = adjoint(vh.view()) * &inv_s;
    Ok(v.dot(&adjoint(u.view())))
}

/// Moore-Penrose pseudo-inverse.
///
/// The primary solver is a QR-based least-squares solve. If that fails (the
/// matrix is numerically rank deficient), the more robust SVD-based
/// pseudo-inverse is used instead, and the returned flag is `true`.
pub fn pinv(a: ArrayView2<c64>) -> Result<(Array2<c64>, bool), LinalgError> {
    let (rows, cols) = a.dim();
    if rows == 0 || cols == 0 {
        return Ok((Array2::zeros((cols, rows)), false));
    }
    if let Some(p) = pinv_qr(a) {
        return Ok((p, false));
    }

    debug!("Least-squares pseudo-inverse of a {rows}x{cols} matrix failed; using the SVD");
    let rcond = f64::EPSILON * rows.max(cols) as f64;
    pinv_rcond(a, rcond, "pinv")
        .map(|p| (p, true))
        .map_err(|_| LinalgError::PseudoInverse { rows, cols })
}

/// The pseudo-inverse of every matrix along the first axis of `a`
/// (`[nblocks, m, n] -> [nblocks, n, m]`).
pub fn pinv_blocks(a: ArrayView3<c64>, rcond: f64) -> Result<Array3<c64>, LinalgError> {
    let (_, rows, cols) = a.dim();
    let blocks = a
        .outer_iter()
        .into_par_iter()
        .map(|block| pinv_rcond(block, rcond, "block pinv"))
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Array3::zeros((blocks.len(), cols, rows));
    for (mut out, block) in out.outer_iter_mut().zip(blocks) {
        out.assign(&block);
    }
    Ok(out)
}

/// The inverse of a square matrix, or its pseudo-inverse if it is singular.
pub fn inv_or_pinv(a: ArrayView2<c64>, what: &'static str) -> Result<Array2<c64>, LinalgError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(LinalgError::NotSquare { what, rows, cols });
    }
    match to_nalgebra(a).try_inverse() {
        Some(inv) if all_finite(inv.iter()) => Ok(from_nalgebra(&inv)),
        _ => {
            warn!("{what}: matrix inversion failed; using the pseudo-inverse");
            pinv(a).map(|(p, _)| p)
        }
    }
}

fn hermitian_part(m: DMatrix<c64>) -> DMatrix<c64> {
    let h = m.adjoint();
    (m + h) * c64::new(0.5, 0.0)
}

/// Eigendecomposition of a Hermitian matrix. Eigenvalues are returned in
/// ascending order, with the corresponding eigenvectors as columns.
pub fn eigh(a: ArrayView2<c64>, what: &'static str) -> Result<(Array1<f64>, Array2<c64>), LinalgError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(LinalgError::NotSquare { what, rows, cols });
    }
    if rows == 0 {
        return Ok((Array1::zeros(0), Array2::zeros((0, 0))));
    }

    let m = hermitian_part(to_nalgebra(a));
    let eig = SymmetricEigen::try_new(m, f64::EPSILON, max_iterations(rows))
        .ok_or(LinalgError::EigenNonConvergence { what, dim: rows })?;
    let mut order: Vec<usize> = (0..rows).collect();
    order.sort_by(|&i, &j| eig.eigenvalues[i].total_cmp(&eig.eigenvalues[j]));
    let evals = Array1::from_shape_fn(rows, |k| eig.eigenvalues[order[k]]);
    let evecs = Array2::from_shape_fn((rows, rows), |(i, k)| eig.eigenvectors[(i, order[k])]);
    Ok((evals, evecs))
}

/// Solve the generalised Hermitian eigenproblem `A x = w B x` with `B`
/// positive definite. Eigenvalues ascend; the eigenvectors (columns) are
/// normalised such that `X^H B X = I`.
pub fn eigh_generalised(
    a: ArrayView2<c64>,
    b: ArrayView2<c64>,
    what: &'static str,
) -> Result<(Array1<f64>, Array2<c64>), LinalgError> {
    let (rows, cols) = a.dim();
    if rows != cols || b.dim() != (rows, cols) {
        return Err(LinalgError::NotSquare { what, rows, cols });
    }
    if rows == 0 {
        return Ok((Array1::zeros(0), Array2::zeros((0, 0))));
    }

    let a = hermitian_part(to_nalgebra(a));
    let l = hermitian_part(to_nalgebra(b))
        .cholesky()
        .ok_or(LinalgError::NotPositiveDefinite { what })?
        .l();
    // A complex Cholesky "succeeds" on indefinite matrices with imaginary
    // pivots; only real, positive pivots make B positive definite.
    let positive = l.diagonal().iter().all(|p| {
        p.re.is_finite() && p.re > 0.0 && p.im.abs() <= f64::EPSILON * rows as f64 * p.re
    });
    if !positive {
        return Err(LinalgError::NotPositiveDefinite { what });
    }
    // C = L^-1 A L^-H. As A is Hermitian, (L^-1 A)^H = A L^-H.
    let t = l
        .solve_lower_triangular(&a)
        .ok_or(LinalgError::NotPositiveDefinite { what })?;
    let c = l
        .solve_lower_triangular(&t.adjoint())
        .ok_or(LinalgError::NotPositiveDefinite { what })?;
    let (evals, y) = eigh(from_nalgebra(&c).view(), what)?;
    // X = L^-H Y
    let x = l
        .adjoint()
        .solve_upper_triangular(&to_nalgebra(y.view()))
        .ok_or(LinalgError::NotPositiveDefinite { what })?;
    Ok((evals, from_nalgebra(&x)))
}
