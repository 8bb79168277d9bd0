// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-mode dimensionality derived from the telescope descriptor.

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::telescope::TelescopeDescriptor;

/// The static sizes of a beam transfer problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Number of frequencies (F).
    pub nfreq: usize,

    /// Maximum angular mode (M). There are `M + 1` mode indices.
    pub mmax: usize,

    /// Maximum multipole (L).
    pub lmax: usize,

    /// Number of unique baseline pairs (P).
    pub npairs: usize,

    /// Number of sky polarisations.
    pub npol: usize,
}

impl Dimensions {
    pub fn from_descriptor(d: &TelescopeDescriptor) -> Dimensions {
        Dimensions {
            nfreq: d.nfreq,
            mmax: d.mmax,
            lmax: d.lmax,
            npairs: d.npairs,
            npol: d.num_pol_sky,
        }
    }

    pub fn nfreq(&self) -> usize {
        self.nfreq
    }

    /// The number of angular mode indices, `M + 1`.
    pub fn num_modes(&self) -> usize {
        self.mmax + 1
    }

    /// The number of multipoles, `L + 1`.
    pub fn lside(&self) -> usize {
        self.lmax + 1
    }

    /// Telescope degrees of freedom per frequency: both signs of every
    /// baseline pair.
    pub fn ntel(&self) -> usize {
        2 * self.npairs
    }

    /// Sky degrees of freedom per frequency.
    pub fn nsky(&self) -> usize {
        self.npol * self.lside()
    }

    /// The per-frequency bound on compressed degrees of freedom.
    pub fn svd_len(&self) -> usize {
        self.lside().min(self.ntel())
    }

    /// The per-frequency bound when every polarisation is kept.
    pub fn svd_len_all_pols(&self) -> usize {
        self.nsky().min(self.ntel())
    }

    /// Upper bound on the total compressed degrees of freedom for a mode.
    pub fn ndofmax(&self, svd_len: usize) -> usize {
        svd_len * self.nfreq
    }

    /// The raw-operator shape of a single mode, `[F, 2, P, Npol, L+1]`.
    pub fn beam_m_shape(&self) -> [usize; 5] {
        [self.nfreq, 2, self.npairs, self.npol, self.lside()]
    }

    /// The bytes needed to hold one (frequency, baseline) transfer tensor for
    /// every angular mode, `Npol (L+1) (2M+1)` complex numbers.
    pub fn fb_bytes(&self) -> f64 {
        (self.npol * self.lside() * (2 * self.mmax + 1)) as f64 * crate::constants::C64_BYTES
    }
}

/// The number of live SVD modes at each frequency of one angular mode, and
/// the cumulative offsets of each frequency's block in a flattened vector of
/// live modes (`bounds[fi]..bounds[fi + 1]`).
///
/// A mode is live when its singular value exceeds `svcut` times the largest
/// singular value across every frequency of the angular mode.
pub fn svd_num_per_frequency(sv: ArrayView2<f64>, svcut: f64) -> (Vec<usize>, Vec<usize>) {
    let threshold = sv.fold(0.0, |acc: f64, &v| acc.max(v)) * svcut;
    let num: Vec<usize> = sv
        .outer_iter()
        .map(|row| row.iter().filter(|&&v| v > threshold).count())
        .collect();
    let mut bounds = Vec::with_capacity(num.len() + 1);
    bounds.push(0);
    for n in &num {
        bounds.push(bounds[bounds.len() - 1] + n);
    }
    (num, bounds)
}

/// The number of live SVD modes when one spectrum spans every frequency.
pub fn svd_num_global(sv: ArrayView1<f64>, svcut: f64) -> usize {
    let threshold = sv.fold(0.0, |acc: f64, &v| acc.max(v)) * svcut;
    sv.iter().filter(|&&v| v > threshold).count()
}
