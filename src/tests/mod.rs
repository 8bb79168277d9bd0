// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helpful functions for tests.

use ndarray::{prelude::*, Data};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::c64;

/// The largest element-wise modulus of `a - b`.
pub(crate) fn max_abs_diff<S1, S2, D>(a: &ArrayBase<S1, D>, b: &ArrayBase<S2, D>) -> f64
where
    S1: Data<Elem = c64>,
    S2: Data<Elem = c64>,
    D: Dimension,
{
    assert_eq!(a.shape(), b.shape());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).norm())
        .fold(0.0, f64::max)
}

/// A reproducible dense complex matrix with entries in the unit square.
pub(crate) fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<c64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((rows, cols), |_| {
        c64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
    })
}

/// `a^H a - I`, as a maximum modulus. Zero for orthonormal columns.
pub(crate) fn orthonormality_error(a: ArrayView2<c64>) -> f64 {
    let gram = crate::linalg::adjoint(a).dot(&a);
    let eye = Array2::from_diag_elem(a.ncols(), c64::new(1.0, 0.0));
    max_abs_diff(&gram, &eye)
}
