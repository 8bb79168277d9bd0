// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use ndarray::Zip;

use super::*;
use crate::tests::{max_abs_diff, orthonormality_error, random_matrix};

fn real_diag(rows: usize, cols: usize, values: &[f64]) -> Array2<c64> {
    let mut a = Array2::zeros((rows, cols));
    for (i, &v) in values.iter().enumerate() {
        a[(i, i)] = c64::new(v, 0.0);
    }
    a
}

fn reconstruct(svd: &Svd) -> Array2<c64> {
    let s = svd.s.mapv(|v| c64::new(v, 0.0));
    (&svd.u * &s).dot(&svd.vh)
}

#[test]
fn test_svd_gen_reconstructs_and_sorts() {
    for (rows, cols) in [(6, 4), (4, 6), (5, 5)] {
        let a = random_matrix(rows, cols, 1);
        let svd = svd_gen(a.view(), "test").unwrap();
        assert_eq!(svd.u.dim(), (rows, rows.min(cols)));
        assert_eq!(svd.vh.dim(), (rows.min(cols), cols));
        assert!(svd.s.windows(2).into_iter().all(|w| w[0] >= w[1]));
        assert_abs_diff_eq!(max_abs_diff(&reconstruct(&svd), &a), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(orthonormality_error(svd.u.view()), 0.0, epsilon = 1e-12);
    }
}

#[test]
fn test_svd_gen_empty() {
    let a = Array2::<c64>::zeros((3, 0));
    let svd = svd_gen(a.view(), "test").unwrap();
    assert_eq!(svd.u.dim(), (3, 0));
    assert!(svd.s.is_empty());
}

#[test]
fn test_matrix_image_rank_one() {
    let x = random_matrix(4, 1, 2);
    let y = random_matrix(1, 3, 3);
    let a = x.dot(&y);
    let (image, s) = matrix_image(a.view(), 1e-10, "test").unwrap();
    assert_eq!(image.dim(), (4, 1));
    assert_eq!(s.len(), 3);

    // The single basis vector is parallel to x.
    let x_norm = x.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt();
    let overlap = adjoint(image.view()).dot(&x)[(0, 0)].norm();
    assert_abs_diff_eq!(overlap, x_norm, epsilon = 1e-10);
}

#[test]
fn test_matrix_image_zero_rtol_drops_zero_values() {
    let a = real_diag(3, 3, &[2.0, 1.0, 0.0]);
    let (image, s) = matrix_image(a.view(), 0.0, "test").unwrap();
    assert_eq!(image.ncols(), 2);
    assert_abs_diff_eq!(s[0], 2.0, epsilon = 1e-12);
    assert_abs_diff_eq!(s[2], 0.0, epsilon = 1e-12);
}

#[test]
fn test_matrix_nullspace_is_orthogonal_complement() {
    let a = random_matrix(5, 2, 4);
    let (null, s) = matrix_nullspace(a.view(), 1e-10, "test").unwrap();
    assert_eq!(null.dim(), (5, 3));
    assert_eq!(s.len(), 2);
    assert_abs_diff_eq!(orthonormality_error(null.view()), 0.0, epsilon = 1e-12);
    let proj = adjoint(null.view()).dot(&a);
    assert_abs_diff_eq!(max_abs_diff(&proj, &Array2::zeros((3, 2))), 0.0, epsilon = 1e-12);
}

#[test]
fn test_matrix_nullspace_of_zero_block_is_everything() {
    let a = Array2::<c64>::zeros((4, 3));
    let (null, _) = matrix_nullspace(a.view(), 1e-4, "test").unwrap();
    assert_eq!(null.dim(), (4, 4));
    assert_abs_diff_eq!(orthonormality_error(null.view()), 0.0, epsilon = 1e-12);

    let a = Array2::<c64>::zeros((4, 0));
    let (null, _) = matrix_nullspace(a.view(), 1e-4, "test").unwrap();
    assert_eq!(null.dim(), (4, 4));
}

#[test]
fn test_matrix_nullspace_respects_rtol() {
    let a = real_diag(3, 2, &[1.0, 1e-6]);
    let (null, _) = matrix_nullspace(a.view(), 1e-4, "test").unwrap();
    assert_eq!(null.ncols(), 2);
    let (null, _) = matrix_nullspace(a.view(), 1e-8, "test").unwrap();
    assert_eq!(null.ncols(), 1);
}

#[test]
fn test_pinv_full_rank_uses_least_squares() {
    let a = random_matrix(3, 5, 5);
    let (p, fallback) = pinv(a.view()).unwrap();
    assert!(!fallback);
    assert_eq!(p.dim(), (5, 3));
    let eye = Array2::from_diag_elem(3, c64::new(1.0, 0.0));
    assert_abs_diff_eq!(max_abs_diff(&a.dot(&p), &eye), 0.0, epsilon = 1e-10);

    let a = random_matrix(6, 2, 6);
    let (p, fallback) = pinv(a.view()).unwrap();
    assert!(!fallback);
    let eye = Array2::from_diag_elem(2, c64::new(1.0, 0.0));
    assert_abs_diff_eq!(max_abs_diff(&p.dot(&a), &eye), 0.0, epsilon = 1e-10);
}

#[test]
fn test_pinv_rank_deficient_falls_back_to_svd() {
    let mut a = random_matrix(4, 3, 7);
    let sum = &a.column(0) + &a.column(1);
    a.column_mut(2).assign(&sum);

    let (p, fallback) = pinv(a.view()).unwrap();
    assert!(fallback);
    // Penrose conditions.
    assert_abs_diff_eq!(max_abs_diff(&a.dot(&p).dot(&a), &a), 0.0, epsilon = 1e-10);
    assert_abs_diff_eq!(max_abs_diff(&p.dot(&a).dot(&p), &p), 0.0, epsilon = 1e-10);
}

#[test]
fn test_pinv_rcond_discards_small_values() {
    let a = real_diag(2, 2, &[1.0, 1e-8]);
    let p = pinv_rcond(a.view(), 1e-6, "test").unwrap();
    assert_abs_diff_eq!(p[(0, 0)].re, 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(p[(1, 1)].norm(), 0.0);
}

#[test]
fn test_pinv_blocks() {
    let mut a = Array3::zeros((3, 4, 2));
    for (i, mut block) in a.outer_iter_mut().enumerate() {
        block.assign(&random_matrix(4, 2, 10 + i as u64));
    }
    let p = pinv_blocks(a.view(), 1e-6).unwrap();
    assert_eq!(p.dim(), (3, 2, 4));
    let eye = Array2::from_diag_elem(2, c64::new(1.0, 0.0));
    for (p, a) in p.outer_iter().zip(a.outer_iter()) {
        assert_abs_diff_eq!(max_abs_diff(&p.dot(&a), &eye), 0.0, epsilon = 1e-10);
    }
}

#[test]
fn test_inv_or_pinv_singular() {
    let a = Array2::from_elem((2, 2), c64::new(1.0, 0.0));
    let inv = inv_or_pinv(a.view(), "test").unwrap();
    let expected = Array2::from_elem((2, 2), c64::new(0.25, 0.0));
    assert_abs_diff_eq!(max_abs_diff(&inv, &expected), 0.0, epsilon = 1e-12);

    assert!(matches!(
        inv_or_pinv(Array2::zeros((2, 3)).view(), "test"),
        Err(LinalgError::NotSquare { rows: 2, cols: 3, .. })
    ));
}

#[test]
fn test_eigh_ascending_and_reconstructs() {
    let m = random_matrix(5, 5, 8);
    let a = m.dot(&adjoint(m.view()));
    let (w, v) = eigh(a.view(), "test").unwrap();
    assert!(w.windows(2).into_iter().all(|w| w[0] <= w[1]));
    assert!(w.iter().all(|&w| w > -1e-12));
    let wc = w.mapv(|w| c64::new(w, 0.0));
    let recon = (&v * &wc).dot(&adjoint(v.view()));
    assert_abs_diff_eq!(max_abs_diff(&recon, &a), 0.0, epsilon = 1e-10);
    assert_abs_diff_eq!(orthonormality_error(v.view()), 0.0, epsilon = 1e-10);
}

#[test]
fn test_eigh_generalised() {
    let m = random_matrix(4, 4, 9);
    let n = random_matrix(4, 4, 10);
    let a = m.dot(&adjoint(m.view()));
    let mut b = n.dot(&adjoint(n.view()));
    b.diag_mut().mapv_inplace(|d| d + c64::new(1.0, 0.0));

    let (w, x) = eigh_generalised(a.view(), b.view(), "test").unwrap();
    assert!(w.windows(2).into_iter().all(|w| w[0] <= w[1]));

    // A X = B X diag(w)
    let wc = w.mapv(|w| c64::new(w, 0.0));
    let lhs = a.dot(&x);
    let rhs = b.dot(&x) * &wc;
    assert_abs_diff_eq!(max_abs_diff(&lhs, &rhs), 0.0, epsilon = 1e-9);

    // X^H B X = I
    let gram = adjoint(x.view()).dot(&b).dot(&x);
    let eye = Array2::from_diag_elem(4, c64::new(1.0, 0.0));
    assert_abs_diff_eq!(max_abs_diff(&gram, &eye), 0.0, epsilon = 1e-9);
}

#[test]
fn test_eigh_generalised_rejects_indefinite_metric() {
    let a = Array2::from_diag_elem(2, c64::new(1.0, 0.0));
    let b = real_diag(2, 2, &[1.0, -1.0]);
    assert!(matches!(
        eigh_generalised(a.view(), b.view(), "test"),
        Err(LinalgError::NotPositiveDefinite { .. })
    ));

    // Positive diagonal, but eigenvalues -1 and 3.
    let b = array![
        [c64::new(1.0, 0.0), c64::new(0.0, 2.0)],
        [c64::new(0.0, -2.0), c64::new(1.0, 0.0)]
    ];
    assert!(matches!(
        eigh_generalised(a.view(), b.view(), "test"),
        Err(LinalgError::NotPositiveDefinite { .. })
    ));

    // Singular is not positive definite either.
    let b = real_diag(2, 2, &[1.0, 0.0]);
    assert!(eigh_generalised(a.view(), b.view(), "test").is_err());
}

#[test]
fn test_adjoint() {
    let a = random_matrix(2, 3, 11);
    let ah = adjoint(a.view());
    assert_eq!(ah.dim(), (3, 2));
    Zip::from(a.t()).and(&ah).for_each(|x, y| {
        assert_eq!(x.conj(), *y);
    });
}

#[test]
fn test_results_are_row_major() {
    // Results are reshaped without copying, which needs standard layout.
    let a = random_matrix(5, 3, 12);
    assert!(adjoint(a.view()).is_standard_layout());
    let p = pinv_rcond(a.view(), 1e-6, "test").unwrap();
    assert!(p.is_standard_layout());
    assert!(p.into_shape_with_order((3, 5, 1)).is_ok());
    let (p, _) = pinv(adjoint(a.view()).view()).unwrap();
    assert!(p.is_standard_layout());
    assert!(p.into_shape_with_order(15).is_ok());
}
