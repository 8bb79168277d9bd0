// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use clap::Parser;
use log::info;

use super::BeamTransferError;
use crate::{
    config::BeamTransferConfig,
    generate::{generate, GenerateReport},
    telescope::TelescopeModel,
    topology::{run_threaded, SingleProcess},
};

#[derive(Parser, Debug, Clone, Default)]
pub(super) struct GenerateArgs {
    /// The run configuration (toml or json).
    #[clap(name = "CONFIG", parse(from_os_str))]
    config: PathBuf,

    /// How many worker threads share the work. Overrides the config.
    #[clap(short, long)]
    workers: Option<usize>,

    /// Recompute SVD files that already exist.
    #[clap(long)]
    regen: bool,
}

impl GenerateArgs {
    /// Read the config and apply the command-line overrides.
    pub(super) fn merge(self) -> Result<BeamTransferConfig, BeamTransferError> {
        let mut config = BeamTransferConfig::from_file(&self.config)?;
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.regen |= self.regen;
        config.validate()?;
        Ok(config)
    }
}

pub(super) fn run(config: &BeamTransferConfig, dry_run: bool) -> Result<(), BeamTransferError> {
    let telescope = config.synthetic_telescope()?;
    let bt = config.beam_transfer(&telescope)?;
    let d = telescope.descriptor();
    info!("Generation directory: {}", bt.directory().display());
    info!("SVD variant: {}", bt.policy().name());
    info!(
        "{} frequencies, m up to {}, l up to {}, {} baseline pairs, {} sky polarisations",
        d.nfreq, d.mmax, d.lmax, d.npairs, d.num_pol_sky
    );
    info!("svcut: {:e}, polsvcut: {:e}", bt.svcut(), bt.polsvcut());
    info!("Using {} worker(s)", config.workers);

    if dry_run {
        info!("Dry run -- exiting now.");
        return Ok(());
    }

    let options = config.generate_options();
    let reports: Vec<GenerateReport> = if config.workers == 1 {
        vec![generate(&bt, &telescope, &SingleProcess, &options)?]
    } else {
        let results = run_threaded(config.workers, |topology| {
            generate(&bt, &telescope, topology, &options)
        })?;
        let mut reports = Vec::with_capacity(results.len());
        for (rank, result) in results.into_iter().enumerate() {
            match result {
                Some(r) => reports.push(r?),
                None => {
                    return Err(BeamTransferError::Generic(format!(
                        "Worker {rank} panicked"
                    )))
                }
            }
        }
        reports
    };

    let raw = reports.iter().any(|r| r.raw_generated);
    if raw {
        info!(
            "Made the raw operators in {} chunk(s)",
            reports.iter().map(|r| r.chunks).max().unwrap_or(0)
        );
    }
    let mut computed: Vec<usize> = reports.iter().flat_map(|r| r.computed.clone()).collect();
    computed.sort_unstable();
    let skipped: usize = reports.iter().map(|r| r.skipped.len()).sum();
    info!("Compressed m indices {computed:?}");
    if skipped > 0 {
        info!("{skipped} m indices were already complete");
    }
    Ok(())
}
