// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All thresholds are relative to the largest singular (or eigen) value of
whatever is being decomposed.
 */

/// Default main significance cutoff. SVD modes with singular values below
/// `SVCUT * max(sv)` are not "live".
pub const DEFAULT_SVCUT: f64 = 1e-6;

/// Default polarisation null-space cutoff (SVD-2).
pub const DEFAULT_POLSVCUT: f64 = 1e-4;

/// Relative tolerance of the coarse image decomposition (SVD-1).
pub const IMAGE_RTOL: f64 = 1e-10;

/// When a decomposition fails to converge, it is retried once after adding
/// this multiple of the top singular value to the diagonal.
pub const SVD_REGULARISATION: f64 = 1e-10;

/// The SVD iteration cap is this many sweeps per row/column of the smaller
/// matrix dimension (but never fewer than [`SVD_MIN_ITERATIONS`]).
pub const SVD_ITERATIONS_PER_DIM: usize = 75;

/// See [`SVD_ITERATIONS_PER_DIM`].
pub const SVD_MIN_ITERATIONS: usize = 1000;

/// Diagonal elements of a QR factor smaller than this (relative to the largest)
/// make the least-squares pseudo-inverse fall back to the SVD-based one.
pub const PINV_QR_RANK_TOL: f64 = 1e-13;

/// `rcond` used for the per-frequency pseudo-inverse of the raw beam.
pub const INVBEAM_RCOND: f64 = 1e-6;

/// Dirty-map normalisations below this are zeroed rather than inverted.
pub const DIRTY_NORM_THRESHOLD: f64 = 1e-6;

/// Regulariser added to the unperturbed covariance in the KL flavour of the
/// perturbation filter, as a fraction of its largest diagonal element.
pub const DEFAULT_KL_REGULARISER: f64 = 1e-14;

/// Default thresholds of the external frequency filter. Nothing is filtered
/// unless the user lowers these.
pub const DEFAULT_EXTERNAL_SVTHRESHOLD: f64 = 1000.0;

/// Default per-worker memory ceiling used to chunk the raw redistribution
/// [GiB].
pub const DEFAULT_MEM_CEILING_GIB: f64 = 3.0;

/// Bytes of a double-precision complex number.
pub const C64_BYTES: f64 = 16.0;

/// Default number of artifacts kept in the store's read cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1;
