// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Policies that compress each frequency independently.

use log::trace;
use ndarray::prelude::*;
use rayon::prelude::*;

use super::{
    frequency_block, invert, pol_columns, three_stage, CompressError, CompressParams,
    CompressionPolicy, FrequencyProducts, ModeProducts, Reduction, StageTrace, SvdVariant,
};
use crate::{
    c64,
    dimensions::Dimensions,
    linalg::{adjoint, svd_gen, LinalgError, Svd},
    telescope::TelescopeDescriptor,
};

/// Run `reduce` on the whitened block of every frequency of a mode, and
/// assemble the per-frequency products.
fn compress_diagonal<P, F>(
    policy: &P,
    mi: usize,
    beam: ArrayView5<c64>,
    descriptor: &TelescopeDescriptor,
    params: &CompressParams,
    reduce: F,
) -> Result<ModeProducts, CompressError>
where
    P: CompressionPolicy + ?Sized,
    F: Fn(ArrayView2<c64>) -> Result<Reduction, LinalgError> + Sync,
{
    let dims = Dimensions::from_descriptor(descriptor);
    let svd_len = policy.svd_len(&dims);
    let (npol, lside, ntel) = (dims.npol, dims.lside(), dims.ntel());

    let products = (0..dims.nfreq)
        .into_par_iter()
        .map(|fi| {
            let stage_err = |err| CompressError::Stage {
                mi,
                fi: Some(fi),
                err,
            };

            let block = frequency_block(beam, fi)?;
            let (block, aux) = policy.preprocess(mi, block)?;
            let weights = descriptor.noise_weights(fi);
            let whitened = policy.prewhiten(block, weights.view());
            let Reduction {
                ut,
                singular_values,
                trace,
            } = reduce(whitened.view()).map_err(stage_err)?;
            let k = ut.nrows();
            if k > svd_len {
                return Err(CompressError::TooManyModes {
                    mi,
                    got: k,
                    max: svd_len,
                });
            }
            trace!("m index {mi} f index {fi}: {trace:?}");

            let beam_live = ut.dot(&whitened);
            let ut = ut * &weights.mapv(c64::from).insert_axis(Axis(0));
            let ut = policy.apply_preprocessing_to_operator(mi, ut, aux.as_ref())?;
            let inverse = invert(beam_live.view(), params).map_err(stage_err)?;

            let mut beam_svd = Array3::zeros((svd_len, npol, lside));
            beam_svd
                .slice_mut(s![..k, .., ..])
                .assign(&beam_live.to_shape((k, npol, lside))?);
            let mut beam_ut = Array2::zeros((svd_len, ntel));
            beam_ut.slice_mut(s![..k, ..]).assign(&ut);
            let mut sv = Array1::zeros(svd_len);
            sv.slice_mut(s![..k]).assign(&singular_values);
            let (invbeam_svd, used_fallback_pinv) = match inverse {
                Some((inv, fallback)) => {
                    let mut invbeam = Array3::zeros((npol, lside, svd_len));
                    invbeam
                        .slice_mut(s![.., .., ..k])
                        .assign(&inv.to_shape((npol, lside, k))?);
                    (Some(invbeam), fallback)
                }
                None => (None, false),
            };

            Ok(FrequencyProducts {
                beam_svd,
                invbeam_svd,
                beam_ut,
                singular_values: sv,
                nmodes: k,
                used_fallback_pinv,
                trace,
            })
        })
        .collect::<Result<Vec<_>, CompressError>>()?;
    Ok(ModeProducts::FrequencyDiagonal(products))
}

/// The default policy: the polarisation-aware three-stage SVD at each
/// frequency.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreeStage;

impl CompressionPolicy for ThreeStage {
    fn variant(&self) -> SvdVariant {
        SvdVariant::ThreeStage
    }

    fn compress_mode(
        &self,
        mi: usize,
        beam: ArrayView5<c64>,
        descriptor: &TelescopeDescriptor,
        params: &CompressParams,
    ) -> Result<ModeProducts, CompressError> {
        let npol = descriptor.num_pol_sky;
        let lside = descriptor.lmax + 1;
        compress_diagonal(self, mi, beam, descriptor, params, |whitened| {
            three_stage(whitened, 1, npol, lside, params.polsvcut)
        })
    }
}

fn thin_svd_reduction(a: ArrayView2<c64>, what: &'static str) -> Result<Reduction, LinalgError> {
    let Svd { u, s, .. } = svd_gen(a, what)?;
    let k = s.len();
    Ok(Reduction {
        ut: adjoint(u.view()),
        singular_values: s,
        trace: StageTrace {
            retained: k,
            ..Default::default()
        },
    })
}

/// A single SVD of the temperature columns at each frequency. Every one of
/// the `svd_len` modes is stored, even those with zero singular values.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemperatureOnly;

impl CompressionPolicy for TemperatureOnly {
    fn variant(&self) -> SvdVariant {
        SvdVariant::TemperatureOnly
    }

    fn compress_mode(
        &self,
        mi: usize,
        beam: ArrayView5<c64>,
        descriptor: &TelescopeDescriptor,
        params: &CompressParams,
    ) -> Result<ModeProducts, CompressError> {
        let npol = descriptor.num_pol_sky;
        let lside = descriptor.lmax + 1;
        compress_diagonal(self, mi, beam, descriptor, params, |whitened| {
            let t = pol_columns(whitened, 1, npol, lside, 0..1);
            thin_svd_reduction(t.view(), "temperature SVD")
        })
    }
}

/// A single SVD of every sky column at each frequency.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullPolarisation;

impl CompressionPolicy for FullPolarisation {
    fn variant(&self) -> SvdVariant {
        SvdVariant::FullPolarisation
    }

    fn svd_len(&self, dims: &Dimensions) -> usize {
        dims.svd_len_all_pols()
    }

    fn compress_mode(
        &self,
        mi: usize,
        beam: ArrayView5<c64>,
        descriptor: &TelescopeDescriptor,
        params: &CompressParams,
    ) -> Result<ModeProducts, CompressError> {
        compress_diagonal(self, mi, beam, descriptor, params, |whitened| {
            thin_svd_reduction(whitened, "full-polarisation SVD")
        })
    }
}

/// No compression at all: the telescope basis is the "SVD" basis, and nothing
/// is written.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl CompressionPolicy for Identity {
    fn variant(&self) -> SvdVariant {
        SvdVariant::Identity
    }

    fn svd_len(&self, dims: &Dimensions) -> usize {
        dims.ntel()
    }

    fn effective_svcut(&self, _svcut: f64) -> f64 {
        0.0
    }

    fn compress_mode(
        &self,
        _mi: usize,
        _beam: ArrayView5<c64>,
        _descriptor: &TelescopeDescriptor,
        _params: &CompressParams,
    ) -> Result<ModeProducts, CompressError> {
        Ok(ModeProducts::Empty)
    }
}
