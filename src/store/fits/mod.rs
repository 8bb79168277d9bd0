// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helper functions for reading and writing FITS files.
//!
//! cfitsio isn't guaranteed to be re-entrant, so every FITS session (open,
//! read or write, close) must hold the guard returned by [`fits_session`].

mod error;

pub use error::FitsError;

use std::{
    fmt::Display,
    panic::Location,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use fitsio::{
    hdu::*,
    images::{ImageDescription, ImageType, ReadImage, WriteImage},
    headers::WritesKey,
    FitsFile,
};

static FITS_IO: Mutex<()> = Mutex::new(());

/// Serialise access to cfitsio. A panicking holder doesn't leave cfitsio in a
/// bad state, so a poisoned lock is simply taken over.
pub(crate) fn fits_session() -> MutexGuard<'static, ()> {
    FITS_IO.lock().unwrap_or_else(|e| e.into_inner())
}

fn fitsio_error(
    e: fitsio::errors::Error,
    fits_fptr: &FitsFile,
    hdu_description: impl Display,
    caller: &'static Location<'static>,
) -> FitsError {
    FitsError::Fitsio {
        fits_error: Box::new(e),
        fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
        hdu_description: format!("{hdu_description}").into_boxed_str(),
        caller,
    }
}

fn open_error(
    action: &'static str,
    e: fitsio::errors::Error,
    file: &Path,
    caller: &'static Location<'static>,
) -> FitsError {
    FitsError::Open {
        action,
        fits_error: Box::new(e),
        fits_filename: file.to_path_buf().into_boxed_path(),
        caller,
    }
}

/// Open a fits file.
#[track_caller]
pub(crate) fn fits_open<P: AsRef<Path>>(file: P) -> Result<FitsFile, FitsError> {
    let caller = Location::caller();
    FitsFile::open(file.as_ref()).map_err(|e| open_error("open", e, file.as_ref(), caller))
}

/// Open a fits file for reading and writing.
#[track_caller]
pub(crate) fn fits_edit<P: AsRef<Path>>(file: P) -> Result<FitsFile, FitsError> {
    let caller = Location::caller();
    FitsFile::edit(file.as_ref()).map_err(|e| open_error("edit", e, file.as_ref(), caller))
}

/// Create a new fits file with an empty primary HDU, replacing any existing
/// file of the same name.
#[track_caller]
pub(crate) fn fits_create<P: AsRef<Path>>(file: P) -> Result<FitsFile, FitsError> {
    let caller = Location::caller();
    let file = file.as_ref();
    // cfitsio refuses to overwrite files.
    if file.exists() {
        if let Err(e) = std::fs::remove_file(file) {
            return Err(open_error("replace", fitsio::errors::Error::Io(e), file, caller));
        }
    }
    FitsFile::create(file)
        .open()
        .map_err(|e| open_error("create", e, file, caller))
}

/// Open a fits file's HDU.
#[track_caller]
pub(crate) fn fits_open_hdu<T: DescribesHdu + Display + Copy>(
    fits_fptr: &mut FitsFile,
    hdu_description: T,
) -> Result<FitsHdu, FitsError> {
    let caller = Location::caller();
    fits_fptr
        .hdu(hdu_description)
        .map_err(|e| fitsio_error(e, fits_fptr, hdu_description, caller))
}

/// Given a FITS file pointer, a HDU that belongs to it, and a keyword that may
/// or may not exist, pull out the value of the keyword, parsing it into the
/// desired type.
#[track_caller]
pub(crate) fn fits_get_optional_key<T: std::str::FromStr>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<Option<T>, FitsError> {
    let caller = Location::caller();
    let unparsed_value: String = match hdu.read_key(fits_fptr, keyword) {
        Ok(key_value) => key_value,
        Err(fitsio::errors::Error::Fits(fe)) if matches!(fe.status, 202 | 204) => return Ok(None),
        Err(e) => return Err(fitsio_error(e, fits_fptr, hdu.number + 1, caller)),
    };

    match unparsed_value.trim().parse() {
        Ok(parsed_value) => Ok(Some(parsed_value)),
        Err(_) => Err(FitsError::Parse {
            key: keyword.to_string().into_boxed_str(),
            fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
            hdu_num: hdu.number + 1,
            caller,
        }),
    }
}

/// Given a FITS file pointer, a HDU that belongs to it, and a keyword, pull out
/// the value of the keyword, parsing it into the desired type.
#[track_caller]
pub(crate) fn fits_get_required_key<T: std::str::FromStr>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<T, FitsError> {
    let caller = Location::caller();
    match fits_get_optional_key(fits_fptr, hdu, keyword) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(FitsError::MissingKey {
            key: keyword.to_string().into_boxed_str(),
            fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
            hdu_num: hdu.number + 1,
            caller,
        }),
        Err(error) => Err(error),
    }
}

/// Write a keyword into a HDU's header.
#[track_caller]
pub(crate) fn fits_write_key<T: WritesKey>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
    value: T,
) -> Result<(), FitsError> {
    let caller = Location::caller();
    hdu.write_key(fits_fptr, keyword, value)
        .map_err(|e| fitsio_error(e, fits_fptr, hdu.number + 1, caller))
}

/// Get the shape of the image on the supplied FITS file pointer and HDU, in C
/// order (i.e. `NAXISn` first).
#[track_caller]
pub(crate) fn fits_get_image_shape(
    fits_fptr: &FitsFile,
    hdu: &FitsHdu,
) -> Result<Vec<usize>, FitsError> {
    match &hdu.info {
        HduInfo::ImageInfo { shape, .. } => Ok(shape.clone()),
        _ => {
            let caller = Location::caller();
            Err(FitsError::NotImage {
                fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
                hdu_num: hdu.number + 1,
                caller,
            })
        }
    }
}

/// Given a FITS file pointer and a HDU, read the associated image.
#[track_caller]
pub(crate) fn fits_get_image<T: ReadImage>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
) -> Result<T, FitsError> {
    fits_get_image_shape(fits_fptr, hdu)?;
    let caller = Location::caller();
    hdu.read_image(fits_fptr)
        .map_err(|e| fitsio_error(e, fits_fptr, hdu.number + 1, caller))
}

/// Read the flat pixel range `[start, end)` of an image.
#[track_caller]
pub(crate) fn fits_read_section<T: ReadImage>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    start: usize,
    end: usize,
) -> Result<T, FitsError> {
    fits_get_image_shape(fits_fptr, hdu)?;
    let caller = Location::caller();
    hdu.read_section(fits_fptr, start, end)
        .map_err(|e| fitsio_error(e, fits_fptr, hdu.number + 1, caller))
}

/// Create a double-precision image HDU. `dims` is in C order.
#[track_caller]
pub(crate) fn fits_create_image(
    fits_fptr: &mut FitsFile,
    name: &str,
    dims: &[usize],
) -> Result<FitsHdu, FitsError> {
    let caller = Location::caller();
    let image_description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: dims,
    };
    fits_fptr
        .create_image(name, &image_description)
        .map_err(|e| fitsio_error(e, fits_fptr, name, caller))
}

/// Write a whole image.
#[track_caller]
pub(crate) fn fits_write_image<T: WriteImage>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    data: &[T],
) -> Result<(), FitsError> {
    let caller = Location::caller();
    hdu.write_image(fits_fptr, data)
        .map(|_| ())
        .map_err(|e| fitsio_error(e, fits_fptr, hdu.number + 1, caller))
}

/// Write the flat pixel range `[start, end)` of an image.
#[track_caller]
pub(crate) fn fits_write_section<T: WriteImage>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    start: usize,
    end: usize,
    data: &[T],
) -> Result<(), FitsError> {
    let caller = Location::caller();
    hdu.write_section(fits_fptr, start, end, data)
        .map(|_| ())
        .map_err(|e| fitsio_error(e, fits_fptr, hdu.number + 1, caller))
}
