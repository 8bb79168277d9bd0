// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with the on-disk operator store.

use std::path::PathBuf;

use thiserror::Error;

use super::FitsError;
use crate::telescope::TelescopeError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{} does not exist; has it been generated?", path.display())]
    Missing { path: PathBuf },

    #[error("{} has no {hdu} HDU; was it skipped during generation?", path.display())]
    MissingHdu { path: PathBuf, hdu: &'static str },

    #[error("{}: couldn't understand header key {key}", path.display())]
    BadHeader { path: PathBuf, key: &'static str },

    #[error("Cannot read a single frequency of {what}: this operator mixes frequencies")]
    Unsupported { what: &'static str },

    #[error("{}: expected {what} to have shape {expected:?}, but it has {got:?}", path.display())]
    Shape {
        path: PathBuf,
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Got frequency index {got}, but the biggest frequency index is {max}")]
    BadFrequencyIndex { got: usize, max: usize },

    #[error("Got mode index {got}, but the biggest mode index is {max}")]
    BadModeIndex { got: usize, max: usize },

    #[error("Couldn't read the telescope descriptor {}: {err}", path.display())]
    DescriptorRead { path: PathBuf, err: String },

    #[error("Couldn't serialise the telescope descriptor: {0}")]
    DescriptorWrite(String),

    #[error(transparent)]
    Telescope(#[from] TelescopeError),

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
