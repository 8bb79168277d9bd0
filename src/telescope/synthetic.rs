// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A deterministic toy telescope.
//!
//! Every (baseline, frequency) transfer tensor is drawn from its own seeded
//! generator, so the result does not depend on how pairs are grouped into
//! calls (or distributed over workers).

use ndarray::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{beam_m_from_model, PerturbationModel, TelescopeDescriptor, TelescopeError, TelescopeModel};
use crate::c64;

/// Parameters of a [`SyntheticTelescope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticParams {
    pub nfreq: usize,
    pub mmax: usize,
    pub lmax: usize,
    pub npairs: usize,
    pub num_pol_sky: usize,

    /// Seed of every transfer tensor.
    pub seed: u64,

    /// Make every non-temperature polarisation response identically zero.
    pub zero_polarised: bool,

    /// Lowest frequency [MHz].
    pub freq_start: f64,

    /// Frequency spacing [MHz].
    pub freq_width: f64,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        SyntheticParams {
            nfreq: 4,
            mmax: 3,
            lmax: 5,
            npairs: 4,
            num_pol_sky: 1,
            seed: 1,
            zero_polarised: false,
            freq_start: 400.0,
            freq_width: 10.0,
        }
    }
}

/// The relative amplitude of the polarised response.
const POLARISED_LEAKAGE: f64 = 0.3;

fn pair_seed(seed: u64, bi: usize, fi: usize) -> u64 {
    seed ^ (bi as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (fi as u64 + 1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F).rotate_left(17)
}

/// A toy telescope with random (but reproducible) transfer tensors.
///
/// A multipole `l` only responds to modes with `|m| <= l`, as a real sky
/// would.
#[derive(Debug, Clone)]
pub struct SyntheticTelescope {
    params: SyntheticParams,
    descriptor: TelescopeDescriptor,
}

impl SyntheticTelescope {
    pub fn new(params: SyntheticParams) -> Result<SyntheticTelescope, TelescopeError> {
        let frequencies = (0..params.nfreq)
            .map(|fi| params.freq_start + fi as f64 * params.freq_width)
            .collect();
        let baselines = (0..params.npairs)
            .map(|bi| [10.0 * (bi + 1) as f64, 3.0 * ((bi * 7) % 5) as f64])
            .collect();
        let noise_power = (0..params.nfreq)
            .map(|fi| {
                (0..params.npairs)
                    .map(|bi| 1.0 + 0.5 * ((fi + 2 * bi) % 3) as f64)
                    .collect()
            })
            .collect();
        let descriptor = TelescopeDescriptor {
            nfreq: params.nfreq,
            mmax: params.mmax,
            lmax: params.lmax,
            npairs: params.npairs,
            num_pol_sky: params.num_pol_sky,
            frequencies,
            baselines,
            noise_power,
        };
        descriptor.validate()?;

        Ok(SyntheticTelescope { params, descriptor })
    }

    pub fn params(&self) -> &SyntheticParams {
        &self.params
    }

    /// Fill the transfer tensor (`[Npol, L+1, 2M+1]`) of one pair.
    fn fill(&self, bi: usize, fi: usize, mut t: ArrayViewMut3<c64>) {
        let mut rng = StdRng::seed_from_u64(pair_seed(self.params.seed, bi, fi));
        let nm = 2 * self.params.mmax + 1;
        for ((pol, l, mi), t) in t.indexed_iter_mut() {
            // Always draw, so that the stream doesn't depend on the masks.
            let z = c64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
            let m_abs = if mi <= self.params.mmax { mi } else { nm - mi };
            let amplitude = match pol {
                0 => 1.0,
                _ if self.params.zero_polarised => 0.0,
                _ => POLARISED_LEAKAGE,
            };
            *t = if l >= m_abs { z * amplitude } else { c64::new(0.0, 0.0) };
        }
    }
}

impl TelescopeModel for SyntheticTelescope {
    fn descriptor(&self) -> &TelescopeDescriptor {
        &self.descriptor
    }

    fn transfer_matrices(
        &self,
        bl_indices: &[usize],
        f_indices: &[usize],
    ) -> Result<Array4<c64>, TelescopeError> {
        if bl_indices.len() != f_indices.len() {
            return Err(TelescopeError::UnpairedIndices {
                baselines: bl_indices.len(),
                freqs: f_indices.len(),
            });
        }
        let d = &self.descriptor;
        if let Some(&got) = bl_indices.iter().find(|&&bi| bi >= d.npairs) {
            return Err(TelescopeError::BadBaselineIndex {
                got,
                max: d.npairs - 1,
            });
        }
        if let Some(&got) = f_indices.iter().find(|&&fi| fi >= d.nfreq) {
            return Err(TelescopeError::BadFrequencyIndex {
                got,
                max: d.nfreq - 1,
            });
        }

        let mut out = Array4::zeros((
            bl_indices.len(),
            d.num_pol_sky,
            d.lmax + 1,
            2 * d.mmax + 1,
        ));
        out.outer_iter_mut()
            .into_par_iter()
            .zip(bl_indices.par_iter().zip(f_indices.par_iter()))
            .for_each(|(t, (&bi, &fi))| self.fill(bi, fi, t));
        Ok(out)
    }
}

/// A toy [`PerturbationModel`]: the perturbed beam is a [`SyntheticTelescope`]
/// plus a small multiple of a second, independently seeded one, and the sky
/// is a smooth power-law foreground plus a weak white signal.
pub struct SyntheticPerturbation {
    base: SyntheticTelescope,
    perturbation: SyntheticTelescope,
    amplitude: f64,
}

impl SyntheticPerturbation {
    pub fn new(params: SyntheticParams, amplitude: f64) -> Result<Self, TelescopeError> {
        let perturbation = SyntheticTelescope::new(SyntheticParams {
            seed: params.seed.wrapping_add(1),
            ..params.clone()
        })?;
        Ok(SyntheticPerturbation {
            base: SyntheticTelescope::new(params)?,
            perturbation,
            amplitude,
        })
    }
}

impl PerturbationModel for SyntheticPerturbation {
    fn perturbed_beam_m(&self, mi: usize) -> Result<Array5<c64>, TelescopeError> {
        let mut beam = beam_m_from_model(&self.base, mi)?;
        let delta = beam_m_from_model(&self.perturbation, mi)?;
        beam.scaled_add(c64::new(self.amplitude, 0.0), &delta);
        Ok(beam)
    }

    fn sky_covariance(&self, mi: usize) -> Result<Array5<c64>, TelescopeError> {
        let d = self.base.descriptor();
        if mi > d.mmax {
            return Err(TelescopeError::BadModeIndex {
                got: mi,
                max: d.mmax,
            });
        }
        let spectral: Vec<f64> = d
            .frequencies
            .iter()
            .map(|&nu| (nu / d.frequencies[0]).powf(-2.7))
            .collect();
        let npol = d.num_pol_sky;
        let mut cov = Array5::zeros((npol, npol, d.lmax + 1, d.nfreq, d.nfreq));
        for l in 0..=d.lmax {
            let fg = 1.0 / ((l + 1) * (l + 1)) as f64;
            for fi in 0..d.nfreq {
                for fj in 0..d.nfreq {
                    // Grouped so that the matrix is exactly Hermitian.
                    let mut c = fg * (spectral[fi] * spectral[fj]);
                    if fi == fj {
                        c += 1e-3;
                    }
                    cov[(0, 0, l, fi, fj)] = c64::new(c, 0.0);
                    for pol in 1..npol {
                        if fi == fj {
                            cov[(pol, pol, l, fi, fj)] = c64::new(1e-2 * fg, 0.0);
                        }
                    }
                }
            }
        }
        Ok(cov)
    }
}
