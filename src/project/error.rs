// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with projecting between the sky, telescope and SVD
//! bases.

use std::path::PathBuf;

use thiserror::Error;

use crate::{linalg::LinalgError, store::StoreError, telescope::TelescopeError};

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("Expected the {what} to have shape {expected:?}, but it has {got:?}")]
    InvalidInput {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Got mode index {got}, but the biggest mode index is {max}")]
    BadModeIndex { got: usize, max: usize },

    #[error("{} doesn't exist; have the SVD files been generated?", path.display())]
    NoVariant { path: PathBuf },

    #[error("Unknown SVD variant '{0}'")]
    UnknownVariant(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Linalg(#[from] LinalgError),

    #[error(transparent)]
    Telescope(#[from] TelescopeError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}
