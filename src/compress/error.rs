// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with compressing beam transfer matrices.

use std::path::PathBuf;

use thiserror::Error;

use crate::{
    linalg::LinalgError, project::ProjectionError, store::StoreError,
    telescope::TelescopeError, topology::TopologyError,
};

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("m index {mi}{}: {err}", freq_context(.fi))]
    Stage {
        mi: usize,
        fi: Option<usize>,
        err: LinalgError,
    },

    #[error("m index {mi}: compression kept {got} modes, but there is only room for {max}")]
    TooManyModes { mi: usize, got: usize, max: usize },

    #[error("{}: expected {what} to have shape {expected:?}, but it has {got:?}", path.display())]
    BasisShape {
        path: PathBuf,
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("The {0} filter was used before its setup was run")]
    NotSetUp(&'static str),

    #[error("Failed to generate the filter basis of m indices {modes:?}")]
    BasisGeneration { modes: Vec<usize> },

    #[error("Filter setup failed on workers {ranks:?}")]
    SetupFailed { ranks: Vec<usize> },

    #[error(transparent)]
    Linalg(#[from] LinalgError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Telescope(#[from] TelescopeError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

fn freq_context(fi: &Option<usize>) -> String {
    match fi {
        Some(fi) => format!(" f index {fi}"),
        None => String::new(),
    }
}
