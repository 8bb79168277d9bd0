// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from reading and writing operator FITS files. Each one carries the
//! source location of the store code that hit it.

use std::{panic::Location, path::Path};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitsError {
    /// A file couldn't be opened, opened for writing, or created.
    #[error("{caller}: Couldn't {action} {fits_filename}: {fits_error}")]
    Open {
        action: &'static str,
        fits_error: Box<fitsio::errors::Error>,
        fits_filename: Box<Path>,
        caller: &'static Location<'static>,
    },

    /// A header keyword that every operator file should have wasn't there.
    #[error("{caller}: {fits_filename} HDU {hdu_num}: Couldn't find key {key}")]
    MissingKey {
        key: Box<str>,
        fits_filename: Box<Path>,
        hdu_num: usize,
        caller: &'static Location<'static>,
    },

    /// Operators are stored as images; this HDU is something else.
    #[error("{caller}: {fits_filename} HDU {hdu_num}: Expected an image HDU")]
    NotImage {
        fits_filename: Box<Path>,
        hdu_num: usize,
        caller: &'static Location<'static>,
    },

    /// cfitsio failed while reading or writing a HDU.
    #[error("{caller}: {fits_filename} HDU '{hdu_description}': {fits_error}")]
    Fitsio {
        fits_error: Box<fitsio::errors::Error>,
        fits_filename: Box<Path>,
        hdu_description: Box<str>,
        caller: &'static Location<'static>,
    },

    /// A header keyword didn't hold the expected type.
    #[error("{caller}: Couldn't parse {key} in {fits_filename} HDU {hdu_num}")]
    Parse {
        key: Box<str>,
        fits_filename: Box<Path>,
        hdu_num: usize,
        caller: &'static Location<'static>,
    },
}
