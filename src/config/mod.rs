// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Run configuration, read from a toml or json file.
//!
//! Every field is optional in the file; anything not given takes its
//! default. The `telescope` section describes the [`SyntheticTelescope`] the
//! binary generates operators for.

mod error;

pub use error::ConfigError;

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    compress::{
        CompressionPolicy, ExternalFilter, ExternalFilterParams, FullFrequency, FullPolarisation,
        Identity, PerturbationFilter, PerturbationFilterParams, SvdVariant, TemperatureOnly,
        ThreeStage,
    },
    constants::{DEFAULT_CACHE_CAPACITY, DEFAULT_MEM_CEILING_GIB, DEFAULT_POLSVCUT, DEFAULT_SVCUT},
    dimensions::Dimensions,
    generate::GenerateOptions,
    project::BeamTransfer,
    telescope::{SyntheticParams, SyntheticPerturbation, SyntheticTelescope, TelescopeModel},
};

/// The relative size of the perturbation added to the synthetic telescope
/// for the perturbation filter.
pub const DEFAULT_PERTURBATION_AMPLITUDE: f64 = 0.05;

#[derive(Debug, Display, EnumIter, EnumString)]
pub enum ConfigFileType {
    #[strum(serialize = "toml")]
    Toml,
    #[strum(serialize = "json")]
    Json,
}

/// Everything needed to run generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BeamTransferConfig {
    /// The generation directory.
    pub directory: PathBuf,

    pub variant: SvdVariant,

    /// Modes with singular values below this fraction of the largest are
    /// discarded at query time.
    pub svcut: f64,

    /// The cutoff of the polarisation null space.
    pub polsvcut: f64,

    pub regen: bool,
    pub skip_svd: bool,
    pub skip_svd_inv: bool,

    /// [GiB]
    pub mem_ceiling_gib: f64,

    /// How many loaded artifacts are kept in memory.
    pub cache_capacity: usize,

    /// How many worker threads share the generation.
    pub workers: usize,

    pub external_filter: ExternalFilterParams,
    pub perturbation_filter: PerturbationFilterParams,
    pub perturbation_amplitude: f64,
    pub telescope: SyntheticParams,
}

impl Default for BeamTransferConfig {
    fn default() -> Self {
        BeamTransferConfig {
            directory: PathBuf::from("beamtransfer"),
            variant: SvdVariant::default(),
            svcut: DEFAULT_SVCUT,
            polsvcut: DEFAULT_POLSVCUT,
            regen: false,
            skip_svd: false,
            skip_svd_inv: false,
            mem_ceiling_gib: DEFAULT_MEM_CEILING_GIB,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            workers: 1,
            external_filter: ExternalFilterParams::default(),
            perturbation_filter: PerturbationFilterParams::default(),
            perturbation_amplitude: DEFAULT_PERTURBATION_AMPLITUDE,
            telescope: SyntheticParams::default(),
        }
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold {
            name,
            requirement: "positive",
            value,
        })
    }
}

fn check_fraction(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold {
            name,
            requirement: "in [0, 1)",
            value,
        })
    }
}

fn check_count(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroCount { name });
    }
    Ok(())
}

impl BeamTransferConfig {
    /// Read a config file; its type is given by its extension.
    pub fn from_file(path: &Path) -> Result<BeamTransferConfig, ConfigError> {
        debug!("Attempting to parse config file {}", path.display());
        let file_type = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .and_then(|e| ConfigFileType::from_str(&e).ok())
            .ok_or_else(|| ConfigError::UnknownFileType {
                path: path.to_path_buf(),
                valid: ConfigFileType::iter().join(", "),
            })?;

        let contents = std::fs::read_to_string(path)?;
        let config: BeamTransferConfig = match file_type {
            ConfigFileType::Toml => {
                debug!("Parsing toml file...");
                toml::from_str(&contents).map_err(|e| ConfigError::Toml {
                    path: path.to_path_buf(),
                    err: e.to_string(),
                })?
            }
            ConfigFileType::Json => {
                debug!("Parsing json file...");
                serde_json::from_str(&contents).map_err(|e| ConfigError::Json {
                    path: path.to_path_buf(),
                    err: e.to_string(),
                })?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check thresholds and counts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("svcut", self.svcut)?;
        check_positive("polsvcut", self.polsvcut)?;
        check_positive("mem_ceiling_gib", self.mem_ceiling_gib)?;
        check_count("cache_capacity", self.cache_capacity)?;
        check_count("workers", self.workers)?;

        match self.variant {
            SvdVariant::FullFrequencyExternalFilter => {
                let p = &self.external_filter;
                check_positive("external_filter.svthreshold_global", p.svthreshold_global)?;
                check_positive("external_filter.svthreshold_local", p.svthreshold_local)?;
            }
            SvdVariant::FullFrequencyPerturbationFilter => {
                let p = &self.perturbation_filter;
                if p.kl {
                    check_positive("perturbation_filter.regulariser", p.regulariser)?;
                }
                check_positive("perturbation_amplitude", self.perturbation_amplitude)?;
            }
            _ => (),
        }

        // Catches empty telescopes.
        SyntheticTelescope::new(self.telescope.clone())?;
        Ok(())
    }

    /// The config as toml, suitable for reading back in.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Serialise(e.to_string()))
    }

    pub fn synthetic_telescope(&self) -> Result<SyntheticTelescope, ConfigError> {
        Ok(SyntheticTelescope::new(self.telescope.clone())?)
    }

    /// The compression policy of the configured variant.
    pub fn build_policy(&self, dims: &Dimensions) -> Result<Arc<dyn CompressionPolicy>, ConfigError> {
        let policy: Arc<dyn CompressionPolicy> = match self.variant {
            SvdVariant::ThreeStage => Arc::new(ThreeStage),
            SvdVariant::TemperatureOnly => Arc::new(TemperatureOnly),
            SvdVariant::FullPolarisation => Arc::new(FullPolarisation),
            SvdVariant::Identity => Arc::new(Identity),
            SvdVariant::FullFrequency => Arc::new(FullFrequency),
            SvdVariant::FullFrequencyExternalFilter => {
                Arc::new(ExternalFilter::new(self.external_filter.clone(), dims))
            }
            SvdVariant::FullFrequencyPerturbationFilter => {
                let model = SyntheticPerturbation::new(
                    self.telescope.clone(),
                    self.perturbation_amplitude,
                )?;
                Arc::new(PerturbationFilter::new(
                    self.perturbation_filter.clone(),
                    Arc::new(model),
                    dims,
                ))
            }
        };
        Ok(policy)
    }

    /// The generation directory described by this config, for `telescope`.
    pub fn beam_transfer(&self, telescope: &dyn TelescopeModel) -> Result<BeamTransfer, ConfigError> {
        let descriptor = telescope.descriptor().clone();
        let dims = Dimensions::from_descriptor(&descriptor);
        let policy = self.build_policy(&dims)?;
        Ok(BeamTransfer::new(&self.directory, descriptor, policy)?
            .with_svcut(self.svcut)
            .with_polsvcut(self.polsvcut)
            .with_cache_capacity(self.cache_capacity))
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            regen: self.regen,
            skip_svd: self.skip_svd,
            skip_svd_inv: self.skip_svd_inv,
            mem_ceiling_gib: self.mem_ceiling_gib,
            ..Default::default()
        }
    }
}
