// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with run configuration.

use std::path::PathBuf;

use thiserror::Error;

use crate::{project::ProjectionError, telescope::TelescopeError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file '{}' doesn't have a recognised file extension! Valid extensions are: {valid}", path.display())]
    UnknownFileType { path: PathBuf, valid: String },

    #[error("Couldn't decode toml structure from {}:\n{err}", path.display())]
    Toml { path: PathBuf, err: String },

    #[error("Couldn't decode json structure from {}:\n{err}", path.display())]
    Json { path: PathBuf, err: String },

    #[error("Couldn't serialise the config: {0}")]
    Serialise(String),

    #[error("{name} must be {requirement}, but got {value}")]
    InvalidThreshold {
        name: &'static str,
        requirement: &'static str,
        value: f64,
    },

    #[error("{name} must be at least 1")]
    ZeroCount { name: &'static str },

    #[error(transparent)]
    Telescope(#[from] TelescopeError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
