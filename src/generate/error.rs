// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with generating beam transfer matrices.

use thiserror::Error;

use crate::{
    compress::CompressError, project::ProjectionError, store::StoreError,
    telescope::TelescopeError, topology::TopologyError,
};

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("The telescope model doesn't match the descriptor the generation directory was set up with")]
    DescriptorMismatch,

    #[error("The coordinator failed to {0}; see its log")]
    CoordinatorFailed(&'static str),

    #[error("The telescope model returned transfer tensors of shape {got:?}, but {expected:?} was expected")]
    TransferShape {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Generating the raw transfer operators failed on workers {ranks:?}")]
    RawFailed { ranks: Vec<usize> },

    #[error("Failed to compress m indices {modes:?}; rerun to retry them")]
    ModesFailed { modes: Vec<usize> },

    #[error(transparent)]
    Compress(#[from] CompressError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Telescope(#[from] TelescopeError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}
