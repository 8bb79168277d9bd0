// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Code to abstract telescope responses.
//!
//! [`TelescopeModel`] is a trait detailing how a telescope turns a
//! spherical-harmonic sky into visibilities, one (baseline, frequency) pair at
//! a time. [`SyntheticTelescope`] is a deterministic toy implementation, good
//! enough to exercise every part of the compression and projection machinery.
//!
//! [`PerturbationModel`] supplies what the perturbation filter needs: a
//! perturbed beam and the sky covariance to project through it.

mod error;
mod synthetic;

pub use error::TelescopeError;
pub use synthetic::{SyntheticParams, SyntheticPerturbation, SyntheticTelescope};

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::c64;

/// The static description of a telescope. This is persisted alongside the
/// generated operators, so a directory can be opened (and projected with)
/// without a live [`TelescopeModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelescopeDescriptor {
    /// Number of frequencies.
    pub nfreq: usize,

    /// Maximum angular mode.
    pub mmax: usize,

    /// Maximum multipole.
    pub lmax: usize,

    /// Number of unique baseline pairs.
    pub npairs: usize,

    /// Number of sky polarisations. The first is always temperature.
    pub num_pol_sky: usize,

    /// The frequencies [MHz].
    pub frequencies: Vec<f64>,

    /// The (east, north) separation of each unique baseline pair [metres].
    pub baselines: Vec<[f64; 2]>,

    /// Noise power per frequency, per baseline pair (`[F][P]`).
    pub noise_power: Vec<Vec<f64>>,
}

impl TelescopeDescriptor {
    /// Check that the listed quantities agree with the declared dimensions.
    pub fn validate(&self) -> Result<(), TelescopeError> {
        if self.nfreq == 0 {
            return Err(TelescopeError::Empty("frequency"));
        }
        if self.npairs == 0 {
            return Err(TelescopeError::Empty("baseline pair"));
        }
        if self.num_pol_sky == 0 {
            return Err(TelescopeError::Empty("sky polarisation"));
        }
        for (what, expected, got) in [
            ("frequencies", self.nfreq, self.frequencies.len()),
            ("baselines", self.npairs, self.baselines.len()),
            ("noise power rows", self.nfreq, self.noise_power.len()),
        ] {
            if expected != got {
                return Err(TelescopeError::DescriptorLength {
                    what,
                    expected,
                    got,
                });
            }
        }
        for (fi, row) in self.noise_power.iter().enumerate() {
            if row.len() != self.npairs {
                return Err(TelescopeError::DescriptorLength {
                    what: "noise powers in a row",
                    expected: self.npairs,
                    got: row.len(),
                });
            }
            if let Some((bi, &value)) = row.iter().enumerate().find(|&(_, &v)| v.is_nan() || v <= 0.0) {
                return Err(TelescopeError::NonPositiveNoise { fi, bi, value });
            }
        }
        Ok(())
    }

    /// The noise power of the given baseline pairs at a frequency.
    ///
    /// # Panics
    ///
    /// Panics if an index is out of range; the descriptor is validated before
    /// it is used.
    pub fn noisepower(&self, bl_indices: &[usize], fi: usize) -> Array1<f64> {
        bl_indices
            .iter()
            .map(|&bi| self.noise_power[fi][bi])
            .collect()
    }

    /// The prewhitening weights of the telescope basis at a frequency:
    /// `noisepower^-1/2` for every baseline pair, repeated for both signs.
    pub fn noise_weights(&self, fi: usize) -> Array1<f64> {
        let w = self.noise_power[fi].iter().map(|&n| n.powf(-0.5));
        w.clone().chain(w).collect()
    }

    /// The noise power of the telescope basis at a frequency (both signs).
    pub fn noise_power_tel(&self, fi: usize) -> Array1<f64> {
        let n = self.noise_power[fi].iter().copied();
        n.clone().chain(n).collect()
    }
}

/// A trait abstracting telescope response calculations.
pub trait TelescopeModel: Sync + Send {
    /// Get the static description of this telescope.
    fn descriptor(&self) -> &TelescopeDescriptor;

    /// Calculate the transfer tensors for paired baseline and frequency
    /// indices. The result has shape `[n, Npol, L+1, 2M+1]`; mode `m >= 0` is
    /// at index `m` and mode `-m` at index `2M+1-m`.
    fn transfer_matrices(
        &self,
        bl_indices: &[usize],
        f_indices: &[usize],
    ) -> Result<Array4<c64>, TelescopeError>;

    /// The noise power of the given baseline pairs at a frequency.
    fn noisepower(&self, bl_indices: &[usize], fi: usize) -> Array1<f64> {
        self.descriptor().noisepower(bl_indices, fi)
    }
}

/// A trait providing the inputs of the perturbation filter.
pub trait PerturbationModel: Sync + Send {
    /// The raw transfer operator of a perturbed telescope for a mode,
    /// `[F, 2, P, Npol, L+1]`.
    fn perturbed_beam_m(&self, mi: usize) -> Result<Array5<c64>, TelescopeError>;

    /// The total (signal + foreground) sky covariance for a mode,
    /// `[Npol, Npol, L+1, F, F]`.
    fn sky_covariance(&self, mi: usize) -> Result<Array5<c64>, TelescopeError>;
}

/// Write the two signs of mode `mi` from a transfer tensor
/// `t` (`[Npol, L+1, 2M+1]`) into `out` (`[2, Npol, L+1]`).
///
/// Sign 0 is `t[.., m]`. For `m > 0` sign 1 is `(-1)^m conj(t[.., -m])`; for
/// `m = 0` it is left as zero.
pub fn fill_signs(t: ArrayView3<c64>, mi: usize, mmax: usize, mut out: ArrayViewMut3<c64>) {
    out.index_axis_mut(Axis(0), 0)
        .assign(&t.index_axis(Axis(2), mi));
    let mut neg = out.index_axis_mut(Axis(0), 1);
    if mi == 0 {
        neg.fill(c64::new(0.0, 0.0));
        return;
    }
    let sign = if mi % 2 == 0 { 1.0 } else { -1.0 };
    let src = t.index_axis(Axis(2), 2 * mmax + 1 - mi);
    neg.zip_mut_with(&src, |n, s| *n = s.conj() * sign);
}

/// Assemble the raw transfer operator of mode `mi` (`[F, 2, P, Npol, L+1]`)
/// from a telescope model, computing every (baseline, frequency) pair.
pub fn beam_m_from_model(
    telescope: &dyn TelescopeModel,
    mi: usize,
) -> Result<Array5<c64>, TelescopeError> {
    let d = telescope.descriptor();
    if mi > d.mmax {
        return Err(TelescopeError::BadModeIndex {
            got: mi,
            max: d.mmax,
        });
    }
    let (f_indices, bl_indices): (Vec<usize>, Vec<usize>) = (0..d.nfreq)
        .flat_map(|fi| (0..d.npairs).map(move |bi| (fi, bi)))
        .unzip();
    let t = telescope.transfer_matrices(&bl_indices, &f_indices)?;

    let mut beam = Array5::zeros((d.nfreq, 2, d.npairs, d.num_pol_sky, d.lmax + 1));
    for (t, (&fi, &bi)) in t.outer_iter().zip(f_indices.iter().zip(bl_indices.iter())) {
        let out = beam.slice_mut(s![fi, .., bi, .., ..]);
        fill_signs(t, mi, d.mmax, out);
    }
    Ok(beam)
}
