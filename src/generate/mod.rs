// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Generation of raw and compressed beam transfer matrices.

Every worker of a [`Topology`] calls [`generate`] with the same arguments.
Generation is restartable: raw operators are skipped once their completion
marker exists, and modes with a complete SVD file are skipped unless `regen`
is set. Files are only ever written by their owning worker, through a locked
write, so an interrupted run leaves either complete files or none.
 */

mod error;

pub use error::GenerateError;

use std::ops::Range;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, trace, warn};
use ndarray::prelude::*;

use crate::{
    c64,
    compress::CompressParams,
    constants::DEFAULT_MEM_CEILING_GIB,
    dimensions::Dimensions,
    project::BeamTransfer,
    store::{Layout, OperatorStore},
    telescope::{fill_signs, TelescopeModel},
    topology::{split_m, transpose_blocks, Topology, TopologyExt},
    PROGRESS_BARS,
};

/// Settings of a generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    /// Recompute SVD files that already exist.
    pub regen: bool,

    /// Stop once the raw operators exist.
    pub skip_svd: bool,

    /// Don't make the SVD to sky operators.
    pub skip_svd_inv: bool,

    /// Recompute the raw operators even if they are complete.
    pub force_raw: bool,

    /// How much memory each worker may use for transfer tensors while the
    /// raw operators are made [GiB].
    pub mem_ceiling_gib: f64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        GenerateOptions {
            regen: false,
            skip_svd: false,
            skip_svd_inv: false,
            force_raw: false,
            mem_ceiling_gib: DEFAULT_MEM_CEILING_GIB,
        }
    }
}

/// What a generation run did, from the point of view of one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateReport {
    /// Were the raw operators (re)made?
    pub raw_generated: bool,

    /// The number of chunks the raw operators were made in (zero if they
    /// weren't made).
    pub chunks: usize,

    /// Filter bases computed by this worker.
    pub bases_computed: Vec<usize>,

    /// Modes compressed by this worker.
    pub computed: Vec<usize>,

    /// Modes that already had a complete SVD file.
    pub skipped: Vec<usize>,
}

fn progress_bar(len: usize, unit: &str, message: &'static str) -> ProgressBar {
    let target = if PROGRESS_BARS.load() {
        ProgressDrawTarget::stdout()
    } else {
        ProgressDrawTarget::hidden()
    };
    ProgressBar::with_draw_target(Some(len as u64), target)
        .with_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{msg:18}}: [{{wide_bar:.blue}}] {{pos:3}}/{{len:3}} {unit} ({{elapsed_precise}}<{{eta_precise}})"
                ))
                .unwrap()
                .progress_chars("=> "),
        )
        .with_position(0)
        .with_message(message)
}

/// Run `f` on the coordinator only, and tell every worker whether it worked.
fn on_coordinator<T, F>(topology: &T, what: &'static str, f: F) -> Result<(), GenerateError>
where
    T: Topology,
    F: FnOnce() -> Result<(), GenerateError>,
{
    let result = topology.is_coordinator().then(f);
    let ok = topology.broadcast(result.as_ref().map(|r| r.is_ok()))?;
    match result {
        Some(Err(e)) => Err(e),
        _ if !ok => Err(GenerateError::CoordinatorFailed(what)),
        _ => Ok(()),
    }
}

/// Fail on every worker if any worker failed.
fn check_workers<T: Topology>(
    topology: &T,
    result: Result<(), GenerateError>,
) -> Result<(), GenerateError> {
    let failed = topology.all_gather(result.is_err())?;
    result?;
    let ranks: Vec<usize> = failed
        .iter()
        .enumerate()
        .filter(|&(_, &f)| f)
        .map(|(rank, _)| rank)
        .collect();
    if ranks.is_empty() {
        Ok(())
    } else {
        Err(GenerateError::RawFailed { ranks })
    }
}

/// Generate the raw transfer operators and the SVD files of every mode.
///
/// If any mode fails to compress, the others are still done, and
/// [`GenerateError::ModesFailed`] lists the failures (on every worker).
pub fn generate<T: Topology>(
    bt: &BeamTransfer,
    telescope: &dyn TelescopeModel,
    topology: &T,
    options: &GenerateOptions,
) -> Result<GenerateReport, GenerateError> {
    if telescope.descriptor() != bt.descriptor() {
        return Err(GenerateError::DescriptorMismatch);
    }
    let store = bt.store();
    let mut report = GenerateReport::default();
    info!(
        "Generating beam transfer matrices in {} ({} workers)",
        bt.directory().display(),
        topology.size()
    );

    on_coordinator(topology, "set up the generation directory", || {
        store.create_directories()?;
        match OperatorStore::load_descriptor(bt.directory()) {
            Ok(existing) if &existing == bt.descriptor() => (),
            Ok(_) => {
                warn!("The telescope has changed; the raw operators will be remade");
                store.clear_raw_complete()?;
                store.save_descriptor(bt.descriptor())?;
            }
            Err(_) => store.save_descriptor(bt.descriptor())?,
        }
        Ok(())
    })?;
    topology.barrier()?;

    let raw_done = topology
        .broadcast(topology.is_coordinator().then(|| store.raw_complete() && !options.force_raw))?;
    if raw_done {
        info!("Raw transfer operators already exist");
    } else {
        on_coordinator(topology, "clear the raw completion marker", || {
            Ok(store.clear_raw_complete()?)
        })?;
        report.chunks = generate_raw(bt, telescope, topology, options.mem_ceiling_gib)?;
        report.raw_generated = true;
        topology.barrier()?;
        on_coordinator(topology, "mark the raw operators complete", || {
            Ok(store.mark_raw_complete()?)
        })?;
        info!("Raw transfer operators complete");
    }

    if options.skip_svd {
        info!("Skipping the SVD");
        return Ok(report);
    }

    let policy = bt.policy();
    let setup = policy.setup(bt, topology)?;
    report.bases_computed = setup.bases_computed;
    if setup.stop_after_setup {
        info!("Filter bases complete; stopping before the SVD");
        return Ok(report);
    }

    let name = policy.name();
    let modes: Vec<usize> = (0..bt.dims().num_modes()).collect();
    let (pending, local) = if bt.layout() == Layout::Identity {
        (vec![], vec![])
    } else {
        topology.distribute_pending(modes.clone(), |mi| {
            !options.regen
                && store.svd_file_complete(mi)
                && store
                    .svd_header(mi)
                    .map(|h| h.variant == name)
                    .unwrap_or(false)
        })?
    };
    report.skipped = modes
        .iter()
        .copied()
        .filter(|mi| !pending.contains(mi))
        .collect();
    info!(
        "Compressing {} modes with {name} ({} already done)",
        pending.len(),
        report.skipped.len()
    );

    let params = CompressParams {
        polsvcut: bt.polsvcut(),
        with_invbeam: !options.skip_svd_inv,
    };
    let pb = progress_bar(local.len(), "modes", "Compressing");
    let mut failed = vec![];
    for &mi in &local {
        match compress_mode(bt, mi, &params) {
            Ok(nmodes) => {
                debug!("m index {mi}: kept {nmodes} modes");
                report.computed.push(mi);
            }
            Err(e) => {
                warn!("Failed to compress m index {mi}: {e}");
                failed.push(mi);
            }
        }
        pb.inc(1);
    }
    pb.finish();

    topology.barrier()?;
    let failed: Vec<usize> = topology.all_gather(failed)?.concat();

    if failed.is_empty() {
        on_coordinator(topology, "write the SVD spectrum", || {
            let spectrum_stale = !pending.is_empty() || !store.spectrum_path().exists();
            if bt.layout() != Layout::Identity && spectrum_stale {
                write_spectrum(bt)?;
            }
            if store.read_variant()?.as_deref() != Some(name.as_str()) {
                store.write_variant(&name)?;
            }
            Ok(())
        })?;
    }
    topology.barrier()?;

    if failed.is_empty() {
        Ok(report)
    } else {
        Err(GenerateError::ModesFailed { modes: failed })
    }
}

/// Compress one mode into its SVD file, returning the number of modes kept.
///
/// The SVD file is opened before anything is computed; if anything fails, its
/// partial contents are left under the temporary name.
fn compress_mode(
    bt: &BeamTransfer,
    mi: usize,
    params: &CompressParams,
) -> Result<usize, GenerateError> {
    let store = bt.store();
    let policy = bt.policy();
    let mut writer = store.svd_writer(mi, &policy.name(), params.with_invbeam)?;
    let beam = store.beam_m(mi)?;
    let products = policy.compress_mode(mi, beam.view(), bt.descriptor(), params)?;
    products.write(&mut writer)?;
    writer.finish(products.used_fallback_pinv())?;
    Ok(products.nmodes())
}

/// Stack the singular values of every mode and write them out.
fn write_spectrum(bt: &BeamTransfer) -> Result<(), GenerateError> {
    let store = bt.store();
    let spectra = (0..bt.dims().num_modes())
        .map(|mi| store.beam_singularvalues(mi).map(|sv| sv.into_owned()))
        .collect::<Result<Vec<ArrayD<f64>>, _>>()?;
    let views: Vec<ArrayViewD<f64>> = spectra.iter().map(|sv| sv.view()).collect();
    let spectrum = ndarray::stack(Axis(0), &views)?;
    store.write_spectrum(spectrum.view())?;
    debug!("Wrote the SVD spectrum, shape {:?}", spectrum.shape());
    Ok(())
}

/// The number of chunks the (frequency, baseline) pairs are made in, so that
/// each worker holds at most `mem_ceiling_gib` of transfer tensors at once.
pub fn num_raw_chunks(dims: &Dimensions, workers: usize, mem_ceiling_gib: f64) -> usize {
    let nfb = dims.nfreq * dims.npairs;
    let ceiling = mem_ceiling_gib * 1024_f64.powi(3);
    let per_worker = ((ceiling / dims.fb_bytes()).floor() as usize).max(1);
    nfb.div_ceil(per_worker * workers.max(1))
}

/// Make the raw operator of every mode. Each chunk of (frequency, baseline)
/// pairs is shared out between the workers; the transfer tensors are then
/// transposed so that each worker ends up with every pair of the modes it
/// owns, and writes them.
fn generate_raw<T: Topology>(
    bt: &BeamTransfer,
    telescope: &dyn TelescopeModel,
    topology: &T,
    mem_ceiling_gib: f64,
) -> Result<usize, GenerateError> {
    let dims = *bt.dims();
    let store = bt.store();
    let nfb = dims.nfreq * dims.npairs;
    let nmodes = dims.num_modes();
    let nchunks = num_raw_chunks(&dims, topology.size(), mem_ceiling_gib);
    let owned = topology.split_local(nmodes);
    info!("Making the raw transfer operators in {nchunks} chunks");
    debug!("Worker {} owns m indices {owned:?}", topology.rank());

    let result = owned
        .clone()
        .try_for_each(|mi| store.create_beam_m(mi))
        .map_err(GenerateError::from);
    check_workers(topology, result)?;

    let pb = progress_bar(nchunks, "chunks", "Raw operators");
    for chunk in split_m(nfb, nchunks) {
        let share = split_m(chunk.len(), topology.size())[topology.rank()].clone();
        let local_fb = chunk.start + share.start..chunk.start + share.end;
        let (local, result) = match raw_block(telescope, &dims, local_fb) {
            Ok(block) => (block, Ok(())),
            Err(e) => (
                Array5::zeros((0, nmodes, 2, dims.npol, dims.lside())),
                Err(e),
            ),
        };
        check_workers(topology, result)?;

        let mine = transpose_blocks(topology, local.view())?;
        let result = owned
            .clone()
            .enumerate()
            .try_for_each(|(j, mi)| {
                store.write_beam_m_fb(mi, chunk.start, mine.index_axis(Axis(1), j))
            })
            .map_err(GenerateError::from);
        check_workers(topology, result)?;
        trace!("Wrote (frequency, baseline) pairs {chunk:?}");
        pb.inc(1);
    }
    pb.finish();
    Ok(nchunks)
}

/// The raw operator of consecutive (frequency, baseline) pairs `fb` for every
/// mode, `[n, M+1, 2, Npol, L+1]`.
fn raw_block(
    telescope: &dyn TelescopeModel,
    dims: &Dimensions,
    fb: Range<usize>,
) -> Result<Array5<c64>, GenerateError> {
    let mut out = Array5::zeros((fb.len(), dims.num_modes(), 2, dims.npol, dims.lside()));
    if fb.is_empty() {
        return Ok(out);
    }
    let (f_indices, bl_indices): (Vec<usize>, Vec<usize>) = fb
        .map(|fb| (fb / dims.npairs, fb % dims.npairs))
        .unzip();
    let t = telescope.transfer_matrices(&bl_indices, &f_indices)?;
    let expected = [bl_indices.len(), dims.npol, dims.lside(), 2 * dims.mmax + 1];
    if t.shape() != expected {
        return Err(GenerateError::TransferShape {
            expected: expected.to_vec(),
            got: t.shape().to_vec(),
        });
    }

    for (t, mut modes) in t.outer_iter().zip(out.outer_iter_mut()) {
        for (mi, signs) in modes.outer_iter_mut().enumerate() {
            fill_signs(t, mi, dims.mmax, signs);
        }
    }
    Ok(out)
}
