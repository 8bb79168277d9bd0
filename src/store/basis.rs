// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-mode filter bases used by the full-frequency filter variants.

use std::path::{Path, PathBuf};

use ndarray::prelude::*;

use super::{
    fits::*, mode_dirname, read_complex_image, read_real_image, write_complex_image,
    write_real_image, LockedFile, StoreError,
};
use crate::c64;

/// The filter-basis file of a mode, `<basis_dir>/m<mi>.fits`.
pub fn basis_path(basis_dir: &Path, mi: usize, mmax: usize) -> PathBuf {
    basis_dir.join(format!("m{}.fits", mode_dirname(mi, mmax)))
}

fn check_exists(path: &Path) -> Result<(), StoreError> {
    if path.exists() {
        Ok(())
    } else {
        Err(StoreError::Missing {
            path: path.to_path_buf(),
        })
    }
}

fn into_2d<T>(path: &Path, what: &'static str, a: ArrayD<T>) -> Result<Array2<T>, StoreError> {
    let got = a.shape().to_vec();
    a.into_dimensionality().map_err(|_| StoreError::Shape {
        path: path.to_path_buf(),
        what,
        expected: vec![2],
        got,
    })
}

fn into_1d<T>(path: &Path, what: &'static str, a: ArrayD<T>) -> Result<Array1<T>, StoreError> {
    let got = a.shape().to_vec();
    a.into_dimensionality().map_err(|_| StoreError::Shape {
        path: path.to_path_buf(),
        what,
        expected: vec![1],
        got,
    })
}

/// An externally computed frequency basis: the right singular vectors `vh`
/// (`[k, F]`) and descending singular values `sig` (`[k]`) of some
/// frequency-frequency operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalBasis {
    pub vh: Array2<c64>,
    pub sig: Array1<f64>,
}

impl ExternalBasis {
    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        let lock = LockedFile::acquire(path, true)?;
        {
            let _session = fits_session();
            let mut fptr = fits_create(lock.path())?;
            write_complex_image(&mut fptr, "VH", self.vh.view())?;
            write_real_image(&mut fptr, "SIG", self.sig.view())?;
        }
        lock.commit()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<ExternalBasis, StoreError> {
        check_exists(path)?;
        let _session = fits_session();
        let mut fptr = fits_open(path)?;
        let vh = into_2d(path, "VH", read_complex_image(&mut fptr, path, "VH")?)?;
        let sig = into_1d(path, "SIG", read_real_image(&mut fptr, path, "SIG")?)?;
        Ok(ExternalBasis { vh, sig })
    }
}

/// The regulariser added to the unperturbed covariance of the KL flavour:
/// `mult * diag * I`, where `diag` is the largest diagonal element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KlRegulariser {
    pub mult: f64,
    pub diag: f64,
}

/// The eigenbasis of a perturbation covariance for one mode.
///
/// `evals` ascend; the columns of `evecs` (`[F ntel, F ntel]`) are the
/// corresponding eigenvectors.
#[derive(Debug, Clone, PartialEq)]
pub struct PerturbationBasis {
    pub evals: Array1<f64>,
    pub evecs: Array2<c64>,

    /// The eigenbasis of the unperturbed projection, if it was asked for.
    pub unperturbed: Option<(Array1<f64>, Array2<c64>)>,

    /// Present for the KL flavour.
    pub regulariser: Option<KlRegulariser>,
}

impl PerturbationBasis {
    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        let lock = LockedFile::acquire(path, true)?;
        {
            let _session = fits_session();
            let mut fptr = fits_create(lock.path())?;
            let hdu = fits_open_hdu(&mut fptr, 0)?;
            fits_write_key(
                &mut fptr,
                &hdu,
                "UNPERT",
                i64::from(self.unperturbed.is_some()),
            )?;
            if let Some(reg) = self.regulariser {
                fits_write_key(&mut fptr, &hdu, "REGMULT", reg.mult)?;
                fits_write_key(&mut fptr, &hdu, "REGDIAG", reg.diag)?;
            }
            write_real_image(&mut fptr, "EVALS", self.evals.view())?;
            write_complex_image(&mut fptr, "EVECS", self.evecs.view())?;
            if let Some((evals, evecs)) = &self.unperturbed {
                write_real_image(&mut fptr, "EVALS_UNPERT", evals.view())?;
                write_complex_image(&mut fptr, "EVECS_UNPERT", evecs.view())?;
            }
        }
        lock.commit()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<PerturbationBasis, StoreError> {
        check_exists(path)?;
        let _session = fits_session();
        let mut fptr = fits_open(path)?;
        let hdu = fits_open_hdu(&mut fptr, 0)?;
        let unpert: i64 = fits_get_optional_key(&mut fptr, &hdu, "UNPERT")?.unwrap_or(0);
        let mult: Option<f64> = fits_get_optional_key(&mut fptr, &hdu, "REGMULT")?;
        let diag: Option<f64> = fits_get_optional_key(&mut fptr, &hdu, "REGDIAG")?;

        let evals = into_1d(path, "EVALS", read_real_image(&mut fptr, path, "EVALS")?)?;
        let evecs = into_2d(path, "EVECS", read_complex_image(&mut fptr, path, "EVECS")?)?;
        let unperturbed = if unpert != 0 {
            Some((
                into_1d(
                    path,
                    "EVALS_UNPERT",
                    read_real_image(&mut fptr, path, "EVALS_UNPERT")?,
                )?,
                into_2d(
                    path,
                    "EVECS_UNPERT",
                    read_complex_image(&mut fptr, path, "EVECS_UNPERT")?,
                )?,
            ))
        } else {
            None
        };
        let regulariser = match (mult, diag) {
            (Some(mult), Some(diag)) => Some(KlRegulariser { mult, diag }),
            _ => None,
        };
        Ok(PerturbationBasis {
            evals,
            evecs,
            unperturbed,
            regulariser,
        })
    }

    /// Does a mode have a usable basis file?
    pub fn complete(path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        let _session = fits_session();
        match fits_open(path) {
            Ok(mut fptr) => {
                fits_open_hdu(&mut fptr, "EVALS").is_ok() && fits_open_hdu(&mut fptr, "EVECS").is_ok()
            }
            Err(_) => false,
        }
    }
}
