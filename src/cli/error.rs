// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all beamtransfer-related errors. This should be the *only*
//! error enum that is publicly visible to users of the binary.

use thiserror::Error;

use crate::{
    compress::CompressError, config::ConfigError, generate::GenerateError,
    project::ProjectionError, store::StoreError, telescope::TelescopeError,
    topology::TopologyError,
};

const README: &str = "the README";

/// The *only* publicly visible error from the binary. Each error message
/// should point at documentation, unless it's "generic".
#[derive(Error, Debug)]
pub enum BeamTransferError {
    /// An error related to config files.
    #[error("{0}\n\nSee the 'Configuration' section of {README}")]
    Config(String),

    /// An error related to the telescope section of a config.
    #[error("{0}\n\nSee the 'Telescope' section of {README}")]
    Telescope(String),

    /// An error while generating or compressing operators.
    #[error("{0}\n\nRerunning the same command resumes generation. See the 'Generation' section of {README}")]
    Generate(String),

    /// An error with a generation directory.
    #[error("{0}\n\nSee the 'Directory layout' section of {README}")]
    Store(String),

    /// A cfitsio error. Because these are usually quite spartan, some
    /// suggestions are provided here.
    #[error("cfitsio error: {0}\n\nIf you don't know what this means, try turning up verbosity (-v or -vv) and maybe disabling progress bars.")]
    Cfitsio(String),

    /// A generic error that can't be clarified further with documentation,
    /// e.g. IO errors.
    #[error("{0}")]
    Generic(String),
}

// When changing the error propagation below, ensure `Self::from(e)` uses the
// correct `e`!

impl From<ConfigError> for BeamTransferError {
    fn from(e: ConfigError) -> Self {
        let s = e.to_string();
        match e {
            ConfigError::UnknownFileType { .. }
            | ConfigError::Toml { .. }
            | ConfigError::Json { .. }
            | ConfigError::Serialise(_)
            | ConfigError::InvalidThreshold { .. }
            | ConfigError::ZeroCount { .. } => Self::Config(s),
            ConfigError::Telescope(e) => Self::from(e),
            ConfigError::Projection(e) => Self::from(e),
            ConfigError::IO(e) => Self::from(e),
        }
    }
}

impl From<GenerateError> for BeamTransferError {
    fn from(e: GenerateError) -> Self {
        let s = e.to_string();
        match e {
            GenerateError::DescriptorMismatch
            | GenerateError::CoordinatorFailed(_)
            | GenerateError::TransferShape { .. }
            | GenerateError::RawFailed { .. }
            | GenerateError::ModesFailed { .. }
            | GenerateError::Shape(_) => Self::Generate(s),
            GenerateError::Compress(e) => Self::from(e),
            GenerateError::Projection(e) => Self::from(e),
            GenerateError::Store(e) => Self::from(e),
            GenerateError::Telescope(e) => Self::from(e),
            GenerateError::Topology(e) => Self::from(e),
        }
    }
}

impl From<CompressError> for BeamTransferError {
    fn from(e: CompressError) -> Self {
        match e {
            CompressError::Store(e) => Self::from(e),
            CompressError::IO(e) => Self::from(e),
            e => Self::Generate(e.to_string()),
        }
    }
}

impl From<ProjectionError> for BeamTransferError {
    fn from(e: ProjectionError) -> Self {
        let s = e.to_string();
        match e {
            ProjectionError::NoVariant { .. } | ProjectionError::UnknownVariant(_) => {
                Self::Store(s)
            }
            ProjectionError::Store(e) => Self::from(e),
            ProjectionError::Telescope(e) => Self::from(e),
            ProjectionError::InvalidInput { .. }
            | ProjectionError::BadModeIndex { .. }
            | ProjectionError::Linalg(_)
            | ProjectionError::Shape(_) => Self::Generic(s),
        }
    }
}

impl From<StoreError> for BeamTransferError {
    fn from(e: StoreError) -> Self {
        let s = e.to_string();
        match e {
            StoreError::Fits(_) => Self::Cfitsio(s),
            StoreError::IO(e) => Self::from(e),
            StoreError::Telescope(e) => Self::from(e),
            _ => Self::Store(s),
        }
    }
}

impl From<TelescopeError> for BeamTransferError {
    fn from(e: TelescopeError) -> Self {
        Self::Telescope(e.to_string())
    }
}

impl From<TopologyError> for BeamTransferError {
    fn from(e: TopologyError) -> Self {
        Self::Generic(e.to_string())
    }
}

impl From<std::io::Error> for BeamTransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Generic(e.to_string())
    }
}
