// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Query-time projections between the sky, telescope and SVD bases.

A [`BeamTransfer`] owns a generation directory and everything needed to
interpret it: the telescope descriptor, the compression policy (which fixes
the layout of the stored operators) and the significance cutoffs. Operators
are loaded lazily through the [`OperatorStore`] and its cache.

Vectors are packed as

* sky: `[F, Npol, L+1]`,
* telescope: `[F, ntel]` (`ntel` ordered (sign, baseline pair)),
* SVD: `[ndof]`, the live modes of every frequency one after another;

and matrices as

* sky: `[Npol, Npol, L+1, F, F]` (diagonal in `l`),
* telescope: `[F, ntel, F, ntel]`,
* SVD: `[ndof, ndof]`.
 */

mod error;
mod svd;
mod telescope;
#[cfg(test)]
mod tests;

pub use error::ProjectionError;
pub use telescope::project_matrix_sky_to_custom_telescope;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;
use ndarray::prelude::*;

use crate::{
    compress::{
        CompressionPolicy, FullFrequency, FullPolarisation, Identity, SvdVariant,
        TemperatureOnly, ThreeStage,
    },
    constants::{DEFAULT_CACHE_CAPACITY, DEFAULT_POLSVCUT, DEFAULT_SVCUT},
    dimensions::{svd_num_global, svd_num_per_frequency, Dimensions},
    store::{Layout, OperatorStore},
    telescope::TelescopeDescriptor,
};

/// Which SVD modes of an angular mode pass the significance cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveModes {
    /// Modes are per frequency: `num[fi]` live modes at each frequency, and
    /// frequency `fi` occupies `bounds[fi]..bounds[fi + 1]` of an SVD vector.
    PerFrequency { num: Vec<usize>, bounds: Vec<usize> },

    /// The leading modes of a spectrum spanning every frequency.
    Global(usize),

    /// No compression: every telescope degree of freedom.
    All(usize),
}

impl LiveModes {
    /// The total number of live modes.
    pub fn ndof(&self) -> usize {
        match self {
            LiveModes::PerFrequency { bounds, .. } => bounds.last().copied().unwrap_or(0),
            LiveModes::Global(n) | LiveModes::All(n) => *n,
        }
    }
}

/// The policy standing in for a stored variant when a directory is opened
/// for projection only. Filter variants are stored as full-frequency
/// operators with the filter already folded in.
pub fn stored_policy(variant: SvdVariant) -> Arc<dyn CompressionPolicy> {
    match variant {
        SvdVariant::ThreeStage => Arc::new(ThreeStage),
        SvdVariant::TemperatureOnly => Arc::new(TemperatureOnly),
        SvdVariant::FullPolarisation => Arc::new(FullPolarisation),
        SvdVariant::Identity => Arc::new(Identity),
        SvdVariant::FullFrequency
        | SvdVariant::FullFrequencyExternalFilter
        | SvdVariant::FullFrequencyPerturbationFilter => Arc::new(FullFrequency),
    }
}

/// A generation directory and how to interpret it.
pub struct BeamTransfer {
    directory: PathBuf,
    descriptor: TelescopeDescriptor,
    dims: Dimensions,
    policy: Arc<dyn CompressionPolicy>,
    svcut: f64,
    polsvcut: f64,
    store: OperatorStore,
}

impl std::fmt::Debug for BeamTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeamTransfer")
            .field("directory", &self.directory)
            .field("dims", &self.dims)
            .field("policy", &self.policy.name())
            .field("svcut", &self.svcut)
            .field("polsvcut", &self.polsvcut)
            .finish()
    }
}

impl BeamTransfer {
    /// Describe a (possibly not yet generated) directory. The default
    /// cutoffs and cache capacity are used; see the `with_` methods.
    pub fn new<P: Into<PathBuf>>(
        directory: P,
        descriptor: TelescopeDescriptor,
        policy: Arc<dyn CompressionPolicy>,
    ) -> Result<BeamTransfer, ProjectionError> {
        descriptor.validate()?;
        let directory = directory.into();
        let dims = Dimensions::from_descriptor(&descriptor);
        let store = OperatorStore::new(
            &directory,
            dims,
            policy.layout(),
            policy.svd_len(&dims),
            DEFAULT_CACHE_CAPACITY,
        );
        let svcut = policy.effective_svcut(DEFAULT_SVCUT);
        Ok(BeamTransfer {
            directory,
            descriptor,
            dims,
            policy,
            svcut,
            polsvcut: DEFAULT_POLSVCUT,
            store,
        })
    }

    /// Open a generated directory, with the policy given by its variant
    /// sentinel.
    pub fn open<P: Into<PathBuf>>(directory: P) -> Result<BeamTransfer, ProjectionError> {
        let directory = directory.into();
        let descriptor = OperatorStore::load_descriptor(&directory)?;
        let variant = read_stored_variant(&directory, &descriptor)?;
        debug!("{} holds SVD variant {variant}", directory.display());
        BeamTransfer::new(directory, descriptor, stored_policy(variant))
    }

    /// Set the main significance cutoff (ignored by policies that fix it).
    pub fn with_svcut(mut self, svcut: f64) -> BeamTransfer {
        self.svcut = self.policy.effective_svcut(svcut);
        self
    }

    /// Set the polarisation null-space cutoff used during compression.
    pub fn with_polsvcut(mut self, polsvcut: f64) -> BeamTransfer {
        self.polsvcut = polsvcut;
        self
    }

    /// Set how many loaded artifacts are kept in memory.
    pub fn with_cache_capacity(mut self, capacity: usize) -> BeamTransfer {
        self.store = OperatorStore::new(
            &self.directory,
            self.dims,
            self.policy.layout(),
            self.policy.svd_len(&self.dims),
            capacity,
        );
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn descriptor(&self) -> &TelescopeDescriptor {
        &self.descriptor
    }

    pub fn dims(&self) -> &Dimensions {
        &self.dims
    }

    pub fn policy(&self) -> &dyn CompressionPolicy {
        self.policy.as_ref()
    }

    pub fn store(&self) -> &OperatorStore {
        &self.store
    }

    pub fn layout(&self) -> Layout {
        self.policy.layout()
    }

    pub fn svcut(&self) -> f64 {
        self.svcut
    }

    pub fn polsvcut(&self) -> f64 {
        self.polsvcut
    }

    /// Telescope degrees of freedom per frequency.
    pub fn ntel(&self) -> usize {
        self.dims.ntel()
    }

    /// Sky degrees of freedom per frequency.
    pub fn nsky(&self) -> usize {
        self.dims.nsky()
    }

    pub fn nfreq(&self) -> usize {
        self.dims.nfreq
    }

    /// The per-frequency bound on compressed degrees of freedom.
    pub fn svd_len(&self) -> usize {
        self.policy.svd_len(&self.dims)
    }

    /// The upper bound on the degrees of freedom of any mode.
    pub fn ndofmax(&self) -> usize {
        self.dims.ndofmax(self.svd_len())
    }

    fn check_mode(&self, mi: usize) -> Result<(), ProjectionError> {
        if mi > self.dims.mmax {
            return Err(ProjectionError::BadModeIndex {
                got: mi,
                max: self.dims.mmax,
            });
        }
        Ok(())
    }

    /// Which SVD modes of `mi` pass the cutoff.
    pub fn svd_num(&self, mi: usize) -> Result<LiveModes, ProjectionError> {
        self.check_mode(mi)?;
        match self.layout() {
            Layout::Identity => Ok(LiveModes::All(self.dims.nfreq * self.dims.ntel())),
            Layout::FrequencyDiagonal => {
                let sv = self
                    .store
                    .beam_singularvalues(mi)?
                    .into_dimensionality::<Ix2>()?;
                let (num, bounds) = svd_num_per_frequency(sv.view(), self.svcut);
                Ok(LiveModes::PerFrequency { num, bounds })
            }
            Layout::FullFrequency => {
                let sv = self
                    .store
                    .beam_singularvalues(mi)?
                    .into_dimensionality::<Ix1>()?;
                Ok(LiveModes::Global(svd_num_global(sv.view(), self.svcut)))
            }
        }
    }

    /// The number of live SVD modes of `mi`.
    pub fn ndof(&self, mi: usize) -> Result<usize, ProjectionError> {
        Ok(self.svd_num(mi)?.ndof())
    }

    /// The frequencies of `mi` with at least one live mode.
    pub fn svd_freq_iter(&self, mi: usize) -> Result<Vec<usize>, ProjectionError> {
        Ok(match self.svd_num(mi)? {
            LiveModes::PerFrequency { num, .. } => (0..num.len()).filter(|&fi| num[fi] > 0).collect(),
            LiveModes::Global(0) | LiveModes::All(0) => vec![],
            LiveModes::Global(_) | LiveModes::All(_) => (0..self.dims.nfreq).collect(),
        })
    }

    /// The singular values of every mode, `[M+1, F, svd_len]` or
    /// `[M+1, F svd_len]`.
    pub fn svd_all(&self) -> Result<ArrayD<f64>, ProjectionError> {
        Ok(self.store.spectrum()?)
    }
}

/// Read and parse the variant sentinel of a directory.
pub fn read_stored_variant(
    directory: &Path,
    descriptor: &TelescopeDescriptor,
) -> Result<SvdVariant, ProjectionError> {
    let dims = Dimensions::from_descriptor(descriptor);
    let store = OperatorStore::new(directory, dims, Layout::FrequencyDiagonal, dims.svd_len(), 1);
    let name = store.read_variant()?.ok_or_else(|| ProjectionError::NoVariant {
        path: store.variant_path(),
    })?;
    name.parse()
        .map_err(|_| ProjectionError::UnknownVariant(name))
}

/// Fail unless `got` is `expected`.
fn check_shape(
    what: &'static str,
    expected: &[usize],
    got: &[usize],
) -> Result<(), ProjectionError> {
    if expected != got {
        return Err(ProjectionError::InvalidInput {
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        });
    }
    Ok(())
}
