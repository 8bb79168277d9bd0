// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
SVD compression of beam transfer matrices for transit radio interferometers.

Beam transfer matrices map a spherical-harmonic description of the sky into
the visibilities measured by a telescope, one angular mode (m) at a time. This
crate generates them (through a [`TelescopeModel`]), compresses each mode into
a noise-whitened "SVD basis" that keeps only the telescope directions carrying
recoverable sky signal, stores every operator on disk and projects vectors and
covariance matrices between the sky, telescope and SVD bases.
 */

pub mod cli;
pub mod compress;
pub mod config;
pub mod constants;
pub mod dimensions;
pub mod generate;
pub mod linalg;
pub mod project;
pub mod store;
pub mod telescope;
pub mod topology;

#[cfg(test)]
mod tests;

// Re-exports.
pub use cli::{BeamTransferCli, BeamTransferError};
pub use compress::{
    AdjointCorrection, CompressionPolicy, ExternalFilter, FullFrequency, FullPolarisation,
    Identity, Layout, PerturbationFilter, SvdVariant, TemperatureOnly, ThreeStage,
};
pub use config::BeamTransferConfig;
pub use dimensions::Dimensions;
pub use generate::{generate, GenerateOptions, GenerateReport};
pub use project::{BeamTransfer, LiveModes};
pub use telescope::{PerturbationModel, SyntheticTelescope, TelescopeDescriptor, TelescopeModel};
pub use topology::{SingleProcess, ThreadTopology, Topology, TopologyExt};

use crossbeam_utils::atomic::AtomicCell;

/// Should we draw progress bars? Off unless the binary turns them on.
pub static PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);

#[allow(non_camel_case_types)]
pub type c64 = num_complex::Complex<f64>;
