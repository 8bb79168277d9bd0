// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use super::BeamTransferError;
use crate::{
    compress::{Layout, SvdVariant},
    dimensions::Dimensions,
    project::stored_policy,
    store::OperatorStore,
};

#[derive(Parser, Debug, Clone, Default)]
pub(super) struct StatusArgs {
    /// The generation directory.
    #[clap(name = "DIRECTORY", parse(from_os_str))]
    directory: PathBuf,
}

impl StatusArgs {
    pub(super) fn run(self) -> Result<(), BeamTransferError> {
        let descriptor = OperatorStore::load_descriptor(&self.directory)?;
        let dims = Dimensions::from_descriptor(&descriptor);
        info!(
            "{}: {} frequencies, m up to {}, l up to {}, {} baseline pairs, {} sky polarisations",
            self.directory.display(),
            dims.nfreq,
            dims.mmax,
            dims.lmax,
            dims.npairs,
            dims.npol
        );

        // The layout only matters for reading operators, not for the
        // completion checks below.
        let probe = OperatorStore::new(
            &self.directory,
            dims,
            Layout::FrequencyDiagonal,
            dims.svd_len(),
            1,
        );
        info!(
            "Raw operators: {}",
            if probe.raw_complete() { "complete" } else { "incomplete" }
        );

        let variant = match probe.read_variant()? {
            Some(name) => match name.parse::<SvdVariant>() {
                Ok(v) => {
                    info!("SVD variant: {v}");
                    Some(v)
                }
                Err(_) => {
                    warn!("Unrecognised SVD variant '{name}'");
                    None
                }
            },
            None => {
                info!("SVD variant: <not yet written>");
                None
            }
        };
        if variant == Some(SvdVariant::Identity) {
            info!("Nothing is compressed with the identity variant");
            return Ok(());
        }

        let layout = variant.map(SvdVariant::layout).unwrap_or(Layout::FrequencyDiagonal);
        let svd_len = variant
            .map(|v| stored_policy(v).svd_len(&dims))
            .unwrap_or_else(|| dims.svd_len());
        let store = OperatorStore::new(&self.directory, dims, layout, svd_len, 1);
        let (complete, missing): (Vec<usize>, Vec<usize>) =
            (0..dims.num_modes()).partition(|&mi| store.svd_file_complete(mi));
        info!(
            "{} of {} m indices have complete SVD files",
            complete.len(),
            dims.num_modes()
        );
        if !missing.is_empty() {
            info!("Missing or incomplete: {missing:?}");
        }
        for &mi in &complete {
            let header = store.svd_header(mi)?;
            if header.used_fallback_pinv {
                info!("m index {mi} needed the SVD-based pseudo-inverse");
            }
            if !header.has_invbeam {
                info!("m index {mi} has no SVD to sky operator");
            }
            if variant.map(|v| v.to_string()).as_deref() != Some(header.variant.as_str()) {
                warn!("m index {mi} was made with variant '{}'", header.variant);
            }
        }
        Ok(())
    }
}
