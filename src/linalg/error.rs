// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from dense linear-algebra kernels.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinalgError {
    #[error("{what}: SVD of a {rows}x{cols} matrix did not converge, even after regularisation")]
    NonConvergence {
        what: &'static str,
        rows: usize,
        cols: usize,
    },

    #[error("{what}: eigendecomposition of a {dim}x{dim} matrix did not converge")]
    EigenNonConvergence { what: &'static str, dim: usize },

    #[error("{what}: matrix is not positive definite")]
    NotPositiveDefinite { what: &'static str },

    #[error("{what}: expected a square matrix, got {rows}x{cols}")]
    NotSquare {
        what: &'static str,
        rows: usize,
        cols: usize,
    },

    #[error("Pseudo-inverse of a {rows}x{cols} matrix failed with both the least-squares and SVD solvers")]
    PseudoInverse { rows: usize, cols: usize },
}
