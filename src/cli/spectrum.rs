// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use clap::Parser;
use log::info;

use super::BeamTransferError;
use crate::project::BeamTransfer;

#[derive(Parser, Debug, Clone, Default)]
pub(super) struct SpectrumArgs {
    /// The generation directory.
    #[clap(name = "DIRECTORY", parse(from_os_str))]
    directory: PathBuf,

    /// The significance cutoff, relative to the largest singular value of
    /// each m index. Default: the library default.
    #[clap(long)]
    svcut: Option<f64>,
}

impl SpectrumArgs {
    pub(super) fn run(self) -> Result<(), BeamTransferError> {
        let mut bt = BeamTransfer::open(&self.directory)?;
        if let Some(svcut) = self.svcut {
            bt = bt.with_svcut(svcut);
        }
        info!("SVD variant {}, svcut {:e}", bt.policy().name(), bt.svcut());

        let mut total = 0;
        for mi in 0..bt.dims().num_modes() {
            let ndof = bt.ndof(mi)?;
            total += ndof;
            info!("m {mi:>4}: {ndof:>6} modes");
        }
        info!("total: {total}, ndofmax: {}", bt.ndofmax());
        Ok(())
    }
}
