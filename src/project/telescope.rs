// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Projections through the raw transfer operator (sky <-> telescope).

use ndarray::prelude::*;
use rayon::prelude::*;

use super::{check_shape, BeamTransfer, ProjectionError};
use crate::{
    c64,
    constants::{DIRTY_NORM_THRESHOLD, INVBEAM_RCOND},
    linalg::{adjoint, pinv_rcond},
    store::Layout,
};

/// The raw block of one frequency, `[ntel, nsky]`.
fn tel_block(beam: ArrayView5<c64>, fi: usize) -> Result<Array2<c64>, ProjectionError> {
    let b = beam.index_axis(Axis(0), fi);
    let (nsign, npairs, npol, lside) = b.dim();
    Ok(b.to_shape((nsign * npairs, npol * lside))?.into_owned())
}

/// The sandwich `B C B^H` of a sky covariance `mat` (`[Npol, Npol, L+1, F,
/// F]`) through a raw operator `beam` (`[F, 2, P, Npol, L+1]`), keeping the
/// first `npol_used` polarisations. The result is `[F, ntel, F, ntel]`.
fn sandwich(
    mat: ArrayView5<c64>,
    beam: ArrayView5<c64>,
    npol_used: usize,
) -> Result<Array4<c64>, ProjectionError> {
    let (nfreq, nsign, npairs, npol, lside) = beam.dim();
    check_shape("sky matrix", &[npol, npol, lside, nfreq, nfreq], mat.shape())?;
    let ntel = nsign * npairs;
    let beam = beam.to_shape((nfreq, ntel, npol, lside))?;
    let npol_used = npol_used.min(npol);

    let mut out = Array4::zeros((nfreq, ntel, nfreq, ntel));
    out.outer_iter_mut()
        .into_par_iter()
        .enumerate()
        .for_each(|(fi, mut row)| {
            for pi in 0..npol_used {
                let bi = beam.slice(s![fi, .., pi, ..]);
                for pj in 0..npol_used {
                    for fj in 0..nfreq {
                        let bj = beam.slice(s![fj, .., pj, ..]);
                        let cl = mat.slice(s![pi, pj, .., fi, fj]);
                        let block = (&bi * &cl.insert_axis(Axis(0))).dot(&adjoint(bj));
                        let mut target = row.slice_mut(s![.., fj, ..]);
                        target += &block;
                    }
                }
            }
        });
    Ok(out)
}

/// Project a sky covariance (`[Npol, Npol, L+1, F, F]`) into the telescope
/// basis of an arbitrary raw operator (`[F, 2, P, Npol, L+1]`), summing over
/// every polarisation pair. The result is `[F, ntel, F, ntel]`.
pub fn project_matrix_sky_to_custom_telescope(
    mat: ArrayView5<c64>,
    beam: ArrayView5<c64>,
) -> Result<Array4<c64>, ProjectionError> {
    let npol = beam.len_of(Axis(3));
    sandwich(mat, beam, npol)
}

impl BeamTransfer {
    pub(super) fn check_sky_vector(&self, vec: &ArrayView3<c64>) -> Result<(), ProjectionError> {
        let d = &self.dims;
        check_shape("sky vector", &[d.nfreq, d.npol, d.lside()], vec.shape())
    }

    pub(super) fn check_tel_vector(&self, vec: &ArrayView2<c64>) -> Result<(), ProjectionError> {
        check_shape("telescope vector", &[self.nfreq(), self.ntel()], vec.shape())
    }

    /// Project a sky vector into the telescope basis.
    pub fn project_vector_sky_to_telescope(
        &self,
        mi: usize,
        vec: ArrayView3<c64>,
    ) -> Result<Array2<c64>, ProjectionError> {
        self.check_mode(mi)?;
        self.check_sky_vector(&vec)?;
        let beam = self.store.beam_m(mi)?;
        let mut out = Array2::zeros((self.nfreq(), self.ntel()));
        for (fi, mut row) in out.outer_iter_mut().enumerate() {
            let b = tel_block(beam.view(), fi)?;
            let v = vec.index_axis(Axis(0), fi);
            let v = v.to_shape(self.nsky())?;
            row.assign(&b.dot(&v));
        }
        Ok(out)
    }

    /// The pseudo-inverse of the raw operator of `mi` at every frequency,
    /// `[F, Npol, L+1, ntel]`.
    ///
    /// The inverse is of the noise-weighted operator (with the weighting
    /// folded back in), except for the identity variant.
    pub fn invbeam_m(&self, mi: usize) -> Result<Array4<c64>, ProjectionError> {
        self.check_mode(mi)?;
        let beam = self.store.beam_m(mi)?;
        let d = &self.dims;
        let noise_weighted = self.layout() != Layout::Identity;

        let blocks = (0..d.nfreq)
            .into_par_iter()
            .map(|fi| -> Result<Array2<c64>, ProjectionError> {
                let block = tel_block(beam.view(), fi)?;
                let weights = if noise_weighted {
                    self.descriptor.noise_weights(fi).mapv(c64::from)
                } else {
                    Array1::ones(d.ntel())
                };
                let weighted = &block * &weights.view().insert_axis(Axis(1));
                let inv = pinv_rcond(weighted.view(), INVBEAM_RCOND, "invbeam_m")?;
                Ok(inv * &weights.view().insert_axis(Axis(0)))
            })
            .collect::<Result<Vec<Array2<c64>>, ProjectionError>>()?;

        let mut out = Array4::zeros((d.nfreq, d.npol, d.lside(), d.ntel()));
        for (mut out, inv) in out.outer_iter_mut().zip(blocks) {
            out.assign(&inv.to_shape((d.npol, d.lside(), d.ntel()))?);
        }
        Ok(out)
    }

    /// Map a telescope vector onto the sky (map making), through
    /// [`invbeam_m`](Self::invbeam_m).
    pub fn project_vector_telescope_to_sky(
        &self,
        mi: usize,
        vec: ArrayView2<c64>,
    ) -> Result<Array3<c64>, ProjectionError> {
        self.check_tel_vector(&vec)?;
        let ibeam = self.invbeam_m(mi)?;
        let d = &self.dims;
        let mut out = Array3::zeros((d.nfreq, d.npol, d.lside()));
        for (fi, mut sky) in out.outer_iter_mut().enumerate() {
            let ib = ibeam.index_axis(Axis(0), fi);
            let ib = ib.to_shape((d.nsky(), d.ntel()))?;
            let s = ib.dot(&vec.row(fi));
            sky.assign(&s.to_shape((d.npol, d.lside()))?);
        }
        Ok(out)
    }

    /// The "dirty" backward projection: the adjoint of the raw operator,
    /// after dividing each telescope degree of freedom by its total response.
    /// Degrees of freedom with (almost) no response are zeroed.
    pub fn project_vector_backward_dirty(
        &self,
        mi: usize,
        vec: ArrayView2<c64>,
    ) -> Result<Array3<c64>, ProjectionError> {
        self.check_mode(mi)?;
        self.check_tel_vector(&vec)?;
        let beam = self.store.beam_m(mi)?;
        let d = &self.dims;
        let mut out = Array3::zeros((d.nfreq, d.npol, d.lside()));
        for (fi, mut sky) in out.outer_iter_mut().enumerate() {
            let b = tel_block(beam.view(), fi)?;
            let normalised: Array1<c64> = b
                .outer_iter()
                .zip(vec.row(fi))
                .map(|(row, &v)| {
                    let norm: f64 = row.iter().map(|z| z.norm_sqr()).sum();
                    if norm < DIRTY_NORM_THRESHOLD {
                        c64::new(0.0, 0.0)
                    } else {
                        v / norm
                    }
                })
                .collect();
            let s = adjoint(b.view()).dot(&normalised);
            sky.assign(&s.to_shape((d.npol, d.lside()))?);
        }
        Ok(out)
    }

    /// Project a sky covariance into the telescope basis, `[F, ntel, F,
    /// ntel]`. With `temponly`, only the temperature block of `mat` is used.
    pub fn project_matrix_sky_to_telescope(
        &self,
        mi: usize,
        mat: ArrayView5<c64>,
        temponly: bool,
    ) -> Result<Array4<c64>, ProjectionError> {
        self.check_mode(mi)?;
        let beam = self.store.beam_m(mi)?;
        let npol_used = if temponly { 1 } else { self.dims.npol };
        sandwich(mat, beam.view(), npol_used)
    }

    /// Project a sky covariance through a caller-supplied raw operator
    /// (`[F, 2, P, Npol, L+1]`) with this telescope's dimensions.
    pub fn project_matrix_sky_to_custom_telescope(
        &self,
        mat: ArrayView5<c64>,
        beam: ArrayView5<c64>,
    ) -> Result<Array4<c64>, ProjectionError> {
        check_shape("custom beam", &self.dims.beam_m_shape(), beam.shape())?;
        project_matrix_sky_to_custom_telescope(mat, beam)
    }
}
