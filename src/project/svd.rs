// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Projections into and out of the SVD basis.
//!
//! Every operator dispatches on the live modes of the angular mode, which
//! also encodes the layout: per-frequency modes for frequency-diagonal
//! directories, a global count for full-frequency directories, and every
//! telescope degree of freedom when nothing was compressed.

use ndarray::prelude::*;

use super::{check_shape, BeamTransfer, LiveModes, ProjectionError};
use crate::{c64, linalg::adjoint};

impl BeamTransfer {
    fn npol_used(&self, temponly: bool) -> usize {
        if temponly {
            1
        } else {
            self.dims.npol
        }
    }

    /// `[F, svd_len, ntel]`
    fn diagonal_ut(&self, mi: usize) -> Result<Array3<c64>, ProjectionError> {
        Ok(self
            .store
            .beam_ut(mi)?
            .into_dimensionality::<Ix3>()?
            .into_owned())
    }

    /// `[F svd_len, F ntel]`
    fn full_ut(&self, mi: usize) -> Result<Array2<c64>, ProjectionError> {
        Ok(self
            .store
            .beam_ut(mi)?
            .into_dimensionality::<Ix2>()?
            .into_owned())
    }

    /// Project a sky vector (`[F, Npol, L+1]`) into the SVD basis. With
    /// `temponly`, only the temperature part of the sky contributes.
    pub fn project_vector_sky_to_svd(
        &self,
        mi: usize,
        vec: ArrayView3<c64>,
        temponly: bool,
    ) -> Result<Array1<c64>, ProjectionError> {
        self.check_sky_vector(&vec)?;
        let npol = self.npol_used(temponly);
        let lside = self.dims.lside();
        let live = self.svd_num(mi)?;
        let mut out = Array1::zeros(live.ndof());

        match live {
            LiveModes::All(_) => {
                let mut masked = vec.to_owned();
                masked.slice_mut(s![.., npol.., ..]).fill(c64::new(0.0, 0.0));
                let tel = self.project_vector_sky_to_telescope(mi, masked.view())?;
                out.iter_mut()
                    .zip(tel.iter())
                    .for_each(|(o, &t)| *o = t);
            }

            LiveModes::PerFrequency { num, bounds } => {
                for fi in (0..self.nfreq()).filter(|&fi| num[fi] > 0) {
                    let bsvd = self.store.beam_svd_freq(mi, fi)?;
                    let fbeam = bsvd.slice(s![..num[fi], ..npol, ..]);
                    let fbeam = fbeam.to_shape((num[fi], npol * lside))?;
                    let fvec = vec.slice(s![fi, ..npol, ..]);
                    let fvec = fvec.to_shape(npol * lside)?;
                    out.slice_mut(s![bounds[fi]..bounds[fi + 1]])
                        .assign(&fbeam.dot(&fvec));
                }
            }

            LiveModes::Global(n) => {
                if n > 0 {
                    let bsvd = self.store.beam_svd(mi)?;
                    for fi in 0..self.nfreq() {
                        let fbeam = bsvd.slice(s![..n, fi, ..npol, ..]);
                        let fbeam = fbeam.to_shape((n, npol * lside))?;
                        let fvec = vec.slice(s![fi, ..npol, ..]);
                        let fvec = fvec.to_shape(npol * lside)?;
                        out += &fbeam.dot(&fvec);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Project an SVD vector back onto the sky, `[F, Npol, L+1]`.
    ///
    /// By default the pseudo-inverse (`invbeam_svd`) is used, which makes
    /// sky -> SVD -> sky a projection. With `conj`, the adjoint of `beam_svd`
    /// is used instead. With `temponly`, only the temperature part of the
    /// result is filled.
    pub fn project_vector_svd_to_sky(
        &self,
        mi: usize,
        vec: ArrayView1<c64>,
        temponly: bool,
        conj: bool,
    ) -> Result<Array3<c64>, ProjectionError> {
        let live = self.svd_num(mi)?;
        check_shape("SVD vector", &[live.ndof()], vec.shape())?;
        let npol = self.npol_used(temponly);
        let d = self.dims;
        let lside = d.lside();

        let mut out = Array3::zeros((d.nfreq, d.npol, lside));
        match live {
            LiveModes::All(_) => {
                let tel = vec.to_shape((d.nfreq, d.ntel()))?;
                out = self.project_vector_telescope_to_sky(mi, tel.view())?;
                out.slice_mut(s![.., npol.., ..]).fill(c64::new(0.0, 0.0));
            }

            LiveModes::PerFrequency { num, bounds } => {
                for fi in (0..d.nfreq).filter(|&fi| num[fi] > 0) {
                    let fvec = vec.slice(s![bounds[fi]..bounds[fi + 1]]);
                    let sky = if conj {
                        let bsvd = self.store.beam_svd_freq(mi, fi)?;
                        let fbeam = bsvd.slice(s![..num[fi], ..npol, ..]);
                        let fbeam = fbeam.to_shape((num[fi], npol * lside))?;
                        adjoint(fbeam.view()).dot(&fvec)
                    } else {
                        let ibeam = self.store.invbeam_svd_freq(mi, fi)?;
                        let fibeam = ibeam.slice(s![..npol, .., ..num[fi]]);
                        let fibeam = fibeam.to_shape((npol * lside, num[fi]))?;
                        fibeam.dot(&fvec)
                    };
                    out.slice_mut(s![fi, ..npol, ..])
                        .assign(&sky.to_shape((npol, lside))?);
                }
            }

            LiveModes::Global(n) => {
                if n > 0 {
                    let fvec = vec.slice(s![..n]);
                    for fi in 0..d.nfreq {
                        let sky = if conj {
                            let bsvd = self.store.beam_svd(mi)?;
                            let fbeam = bsvd.slice(s![..n, fi, ..npol, ..]);
                            let fbeam = fbeam.to_shape((n, npol * lside))?;
                            adjoint(fbeam.view()).dot(&fvec)
                        } else {
                            let ibeam = self.store.invbeam_svd(mi)?;
                            let fibeam = ibeam.slice(s![fi, ..npol, .., ..n]);
                            let fibeam = fibeam.to_shape((npol * lside, n))?;
                            fibeam.dot(&fvec)
                        };
                        out.slice_mut(s![fi, ..npol, ..])
                            .assign(&sky.to_shape((npol, lside))?);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Project a telescope vector (`[F, ntel]`) into the SVD basis.
    pub fn project_vector_telescope_to_svd(
        &self,
        mi: usize,
        vec: ArrayView2<c64>,
    ) -> Result<Array1<c64>, ProjectionError> {
        self.check_tel_vector(&vec)?;
        let live = self.svd_num(mi)?;
        match live {
            LiveModes::All(_) => Ok(vec.iter().copied().collect()),

            LiveModes::PerFrequency { num, bounds } => {
                let ut = self.diagonal_ut(mi)?;
                let mut out = Array1::zeros(live_ndof(&bounds));
                for fi in (0..self.nfreq()).filter(|&fi| num[fi] > 0) {
                    let fut = ut.slice(s![fi, ..num[fi], ..]);
                    out.slice_mut(s![bounds[fi]..bounds[fi + 1]])
                        .assign(&fut.dot(&vec.row(fi)));
                }
                Ok(out)
            }

            LiveModes::Global(n) => {
                let ut = self.full_ut(mi)?;
                let flat = vec.to_shape(self.nfreq() * self.ntel())?;
                Ok(ut.slice(s![..n, ..]).dot(&flat))
            }
        }
    }

    /// Map an SVD vector back into the telescope basis, `[F, ntel]`. The
    /// result is the adjoint of `beam_ut` applied to `svec`, scaled by the
    /// noise power.
    pub fn project_vector_svd_to_telescope(
        &self,
        mi: usize,
        svec: ArrayView1<c64>,
    ) -> Result<Array2<c64>, ProjectionError> {
        let live = self.svd_num(mi)?;
        check_shape("SVD vector", &[live.ndof()], svec.shape())?;
        let (nfreq, ntel) = (self.nfreq(), self.ntel());

        let mut out = match live {
            LiveModes::All(_) => return Ok(svec.to_shape((nfreq, ntel))?.into_owned()),

            LiveModes::PerFrequency { num, bounds } => {
                let ut = self.diagonal_ut(mi)?;
                let mut out = Array2::zeros((nfreq, ntel));
                for fi in (0..nfreq).filter(|&fi| num[fi] > 0) {
                    let fut = ut.slice(s![fi, ..num[fi], ..]);
                    let fvec = svec.slice(s![bounds[fi]..bounds[fi + 1]]);
                    out.row_mut(fi).assign(&adjoint(fut).dot(&fvec));
                }
                out
            }

            LiveModes::Global(n) => {
                let ut = self.full_ut(mi)?;
                adjoint(ut.slice(s![..n, ..]))
                    .dot(&svec)
                    .to_shape((nfreq, ntel))?
                    .into_owned()
            }
        };

        for (fi, mut row) in out.outer_iter_mut().enumerate() {
            let noise = self.descriptor.noise_power_tel(fi).mapv(c64::from);
            row *= &noise;
        }
        Ok(out)
    }

    /// Project a sky covariance (`[Npol, Npol, L+1, F, F]`) into the SVD
    /// basis, `[ndof, ndof]`. With `temponly`, only the temperature block
    /// of `mat` is used.
    pub fn project_matrix_sky_to_svd(
        &self,
        mi: usize,
        mat: ArrayView5<c64>,
        temponly: bool,
    ) -> Result<Array2<c64>, ProjectionError> {
        let d = self.dims;
        check_shape(
            "sky matrix",
            &[d.npol, d.npol, d.lside(), d.nfreq, d.nfreq],
            mat.shape(),
        )?;
        let npol = self.npol_used(temponly);
        let live = self.svd_num(mi)?;
        let ndof = live.ndof();

        match live {
            LiveModes::All(_) => {
                let tel = self.project_matrix_sky_to_telescope(mi, mat, temponly)?;
                Ok(tel.to_shape((ndof, ndof))?.into_owned())
            }

            LiveModes::PerFrequency { num, bounds } => {
                let blocks = (0..d.nfreq)
                    .map(|fi| -> Result<Array3<c64>, ProjectionError> {
                        let bsvd = self.store.beam_svd_freq(mi, fi)?;
                        Ok(bsvd.slice(s![..num[fi], ..npol, ..]).to_owned())
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let mut out = Array2::zeros((ndof, ndof));
                for fi in (0..d.nfreq).filter(|&fi| num[fi] > 0) {
                    for fj in (0..d.nfreq).filter(|&fj| num[fj] > 0) {
                        let mut block =
                            out.slice_mut(s![bounds[fi]..bounds[fi + 1], bounds[fj]..bounds[fj + 1]]);
                        for pi in 0..npol {
                            let bi = blocks[fi].slice(s![.., pi, ..]);
                            for pj in 0..npol {
                                let bj = blocks[fj].slice(s![.., pj, ..]);
                                let cl = mat.slice(s![pi, pj, .., fi, fj]);
                                block += &(&bi * &cl.insert_axis(Axis(0))).dot(&adjoint(bj));
                            }
                        }
                    }
                }
                Ok(out)
            }

            LiveModes::Global(n) => {
                let mut out = Array2::zeros((n, n));
                if n == 0 {
                    return Ok(out);
                }
                let bsvd = self.store.beam_svd(mi)?;
                let b = bsvd.slice(s![..n, .., ..npol, ..]);
                for fi in 0..d.nfreq {
                    for fj in 0..d.nfreq {
                        for pi in 0..npol {
                            let bi = b.slice(s![.., fi, pi, ..]);
                            for pj in 0..npol {
                                let bj = b.slice(s![.., fj, pj, ..]);
                                let cl = mat.slice(s![pi, pj, .., fi, fj]);
                                out += &(&bi * &cl.insert_axis(Axis(0))).dot(&adjoint(bj));
                            }
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// Project a telescope covariance that is diagonal within and between
    /// frequencies (given by its diagonal, `[F, ntel]`) into the SVD basis.
    pub fn project_matrix_diagonal_telescope_to_svd(
        &self,
        mi: usize,
        dmat: ArrayView2<c64>,
    ) -> Result<Array2<c64>, ProjectionError> {
        check_shape(
            "diagonal telescope matrix",
            &[self.nfreq(), self.ntel()],
            dmat.shape(),
        )?;
        let live = self.svd_num(mi)?;
        match live {
            LiveModes::All(_) => {
                let flat: Array1<c64> = dmat.iter().copied().collect();
                Ok(Array2::from_diag(&flat))
            }

            LiveModes::PerFrequency { num, bounds } => {
                let ut = self.diagonal_ut(mi)?;
                let ndof = live_ndof(&bounds);
                let mut out = Array2::zeros((ndof, ndof));
                for fi in (0..self.nfreq()).filter(|&fi| num[fi] > 0) {
                    let fut = ut.slice(s![fi, ..num[fi], ..]);
                    let weighted = &fut * &dmat.row(fi).insert_axis(Axis(0));
                    out.slice_mut(s![bounds[fi]..bounds[fi + 1], bounds[fi]..bounds[fi + 1]])
                        .assign(&weighted.dot(&adjoint(fut)));
                }
                Ok(out)
            }

            LiveModes::Global(n) => {
                let ut = self.full_ut(mi)?;
                let u = ut.slice(s![..n, ..]);
                let flat = dmat.to_shape(self.nfreq() * self.ntel())?;
                let weighted = &u * &flat.view().insert_axis(Axis(0));
                Ok(weighted.dot(&adjoint(u)))
            }
        }
    }

    /// Project a telescope covariance (`[F, ntel, F, ntel]`) into the SVD
    /// basis.
    pub fn project_matrix_telescope_to_svd(
        &self,
        mi: usize,
        mat: ArrayView4<c64>,
    ) -> Result<Array2<c64>, ProjectionError> {
        let (nfreq, ntel) = (self.nfreq(), self.ntel());
        check_shape("telescope matrix", &[nfreq, ntel, nfreq, ntel], mat.shape())?;
        let live = self.svd_num(mi)?;
        match live {
            LiveModes::All(n) => Ok(mat.to_shape((n, n))?.into_owned()),

            LiveModes::PerFrequency { num, bounds } => {
                let ut = self.diagonal_ut(mi)?;
                let ndof = live_ndof(&bounds);
                let mut out = Array2::zeros((ndof, ndof));
                for fi in (0..nfreq).filter(|&fi| num[fi] > 0) {
                    let ui = ut.slice(s![fi, ..num[fi], ..]);
                    for fj in (0..nfreq).filter(|&fj| num[fj] > 0) {
                        let uj = ut.slice(s![fj, ..num[fj], ..]);
                        let block = ui.dot(&mat.slice(s![fi, .., fj, ..])).dot(&adjoint(uj));
                        out.slice_mut(s![bounds[fi]..bounds[fi + 1], bounds[fj]..bounds[fj + 1]])
                            .assign(&block);
                    }
                }
                Ok(out)
            }

            LiveModes::Global(n) => {
                let ut = self.full_ut(mi)?;
                let u = ut.slice(s![..n, ..]);
                let m = mat.to_shape((nfreq * ntel, nfreq * ntel))?;
                Ok(u.dot(&m).dot(&adjoint(u)))
            }
        }
    }
}

fn live_ndof(bounds: &[usize]) -> usize {
    bounds.last().copied().unwrap_or(0)
}
