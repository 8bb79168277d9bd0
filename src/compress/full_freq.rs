// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Policies that compress every frequency of a mode at once.
//!
//! The raw operator of a mode is laid out as a `[F ntel, F nsky]` block, rows
//! ordered (frequency, sign, baseline pair) and columns (frequency,
//! polarisation, multipole). Without preprocessing the block is block
//! diagonal; the filters below mix frequencies before the three stages run.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crossbeam_utils::atomic::AtomicCell;
use log::{debug, info, trace, warn};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use super::{
    frequency_block, invert, three_stage, CompressError, CompressParams, CompressionPolicy,
    FullFrequencyProducts, ModeProducts, PolicySetup, SvdVariant,
};
use crate::{
    c64,
    constants::{DEFAULT_EXTERNAL_SVTHRESHOLD, DEFAULT_KL_REGULARISER},
    dimensions::Dimensions,
    linalg::{adjoint, eigh, eigh_generalised, inv_or_pinv},
    project::{project_matrix_sky_to_custom_telescope, BeamTransfer},
    store::{basis_path, ExternalBasis, KlRegulariser, PerturbationBasis},
    telescope::{PerturbationModel, TelescopeDescriptor},
    topology::{Topology, TopologyExt},
};

/// Compress a mode with every frequency at once.
fn compress_full_frequency<P: CompressionPolicy + ?Sized>(
    policy: &P,
    mi: usize,
    beam: ArrayView5<c64>,
    descriptor: &TelescopeDescriptor,
    params: &CompressParams,
) -> Result<ModeProducts, CompressError> {
    let dims = Dimensions::from_descriptor(descriptor);
    let nfreq = dims.nfreq;
    let (npol, lside, ntel, nsky) = (dims.npol, dims.lside(), dims.ntel(), dims.nsky());
    let svd_len = nfreq * policy.svd_len(&dims);
    let stage_err = |err| CompressError::Stage { mi, fi: None, err };

    let mut block = Array2::zeros((nfreq * ntel, nfreq * nsky));
    for fi in 0..nfreq {
        block
            .slice_mut(s![fi * ntel..(fi + 1) * ntel, fi * nsky..(fi + 1) * nsky])
            .assign(&frequency_block(beam, fi)?);
    }
    let weights: Array1<f64> = (0..nfreq)
        .flat_map(|fi| descriptor.noise_weights(fi).into_iter())
        .collect();

    let (block, aux) = policy.preprocess(mi, block)?;
    let whitened = policy.prewhiten(block, weights.view());
    let reduction =
        three_stage(whitened.view(), nfreq, npol, lside, params.polsvcut).map_err(stage_err)?;
    let k = reduction.ut.nrows();
    if k > svd_len {
        return Err(CompressError::TooManyModes {
            mi,
            got: k,
            max: svd_len,
        });
    }
    trace!("m index {mi}: {:?}", reduction.trace);

    let beam_live = reduction.ut.dot(&whitened);
    let ut = reduction.ut * &weights.mapv(c64::from).insert_axis(Axis(0));
    let ut = policy.apply_preprocessing_to_operator(mi, ut, aux.as_ref())?;
    let inverse = invert(beam_live.view(), params).map_err(stage_err)?;

    let mut beam_svd = Array4::zeros((svd_len, nfreq, npol, lside));
    beam_svd
        .slice_mut(s![..k, .., .., ..])
        .assign(&beam_live.to_shape((k, nfreq, npol, lside))?);
    let mut beam_ut = Array2::zeros((svd_len, nfreq * ntel));
    beam_ut.slice_mut(s![..k, ..]).assign(&ut);
    let mut singular_values = Array1::zeros(svd_len);
    singular_values
        .slice_mut(s![..k])
        .assign(&reduction.singular_values);
    let (invbeam_svd, used_fallback_pinv) = match inverse {
        Some((inv, fallback)) => {
            let mut invbeam = Array4::zeros((nfreq, npol, lside, svd_len));
            invbeam
                .slice_mut(s![.., .., .., ..k])
                .assign(&inv.to_shape((nfreq, npol, lside, k))?);
            (Some(invbeam), fallback)
        }
        None => (None, false),
    };

    Ok(ModeProducts::FullFrequency(FullFrequencyProducts {
        beam_svd,
        invbeam_svd,
        beam_ut,
        singular_values,
        nmodes: k,
        used_fallback_pinv,
        trace: reduction.trace,
    }))
}

/// The three stages over every frequency at once, without preprocessing.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullFrequency;

impl CompressionPolicy for FullFrequency {
    fn variant(&self) -> SvdVariant {
        SvdVariant::FullFrequency
    }

    fn compress_mode(
        &self,
        mi: usize,
        beam: ArrayView5<c64>,
        descriptor: &TelescopeDescriptor,
        params: &CompressParams,
    ) -> Result<ModeProducts, CompressError> {
        compress_full_frequency(self, mi, beam, descriptor, params)
    }
}

/// The number of leading modes of an external basis to filter out.
///
/// A mode is cut if its singular value exceeds either `svthreshold_global`
/// times the largest singular value over every mode, or `svthreshold_local`
/// times the largest of this mode. `mode_cut` overrides both.
pub fn external_cut(
    sig: ArrayView1<f64>,
    global_max: f64,
    svthreshold_global: f64,
    svthreshold_local: f64,
    mode_cut: Option<usize>,
) -> usize {
    if let Some(cut) = mode_cut {
        return cut.min(sig.len());
    }
    let local_max = sig.first().copied().unwrap_or(0.0);
    let global = sig
        .iter()
        .filter(|&&s| s > svthreshold_global * global_max)
        .count();
    let local = sig
        .iter()
        .filter(|&&s| s > svthreshold_local * local_max)
        .count();
    global.max(local)
}

/// Settings of the external frequency filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalFilterParams {
    /// Where the per-mode bases live.
    pub basis_dir: PathBuf,
    pub svthreshold_global: f64,
    pub svthreshold_local: f64,
    pub mode_cut: Option<usize>,
}

impl Default for ExternalFilterParams {
    fn default() -> Self {
        Self {
            basis_dir: PathBuf::from("external_svd_basis"),
            svthreshold_global: DEFAULT_EXTERNAL_SVTHRESHOLD,
            svthreshold_local: DEFAULT_EXTERNAL_SVTHRESHOLD,
            mode_cut: None,
        }
    }
}

/// Full-frequency compression after projecting out the leading modes of an
/// externally computed frequency basis.
#[derive(Debug)]
pub struct ExternalFilter {
    params: ExternalFilterParams,
    mmax: usize,
    nfreq: usize,
    /// The largest singular value over every mode; set by `setup`.
    global_max: AtomicCell<Option<f64>>,
}

impl ExternalFilter {
    pub fn new(params: ExternalFilterParams, dims: &Dimensions) -> ExternalFilter {
        ExternalFilter {
            params,
            mmax: dims.mmax,
            nfreq: dims.nfreq,
            global_max: AtomicCell::new(None),
        }
    }

    pub fn params(&self) -> &ExternalFilterParams {
        &self.params
    }

    fn read_basis(&self, mi: usize) -> Result<ExternalBasis, CompressError> {
        let path = basis_path(&self.params.basis_dir, mi, self.mmax);
        let basis = ExternalBasis::read(&path)?;
        let k = basis.sig.len();
        if basis.vh.dim() != (k, self.nfreq) {
            return Err(CompressError::BasisShape {
                path,
                what: "vh",
                expected: vec![k, self.nfreq],
                got: basis.vh.shape().to_vec(),
            });
        }
        Ok(basis)
    }

    /// The `[F, F]` projector that removes the filtered modes of `mi`.
    pub fn projector(&self, mi: usize) -> Result<Array2<c64>, CompressError> {
        let global_max = self
            .global_max
            .load()
            .ok_or(CompressError::NotSetUp("external"))?;
        let basis = self.read_basis(mi)?;
        let cut = external_cut(
            basis.sig.view(),
            global_max,
            self.params.svthreshold_global,
            self.params.svthreshold_local,
            self.params.mode_cut,
        );
        debug!("m index {mi}: filtering {cut} external modes");
        let kept = basis.vh.slice(s![cut.., ..]);
        Ok(adjoint(kept).dot(&kept))
    }

    /// Use a known global maximum instead of running `setup`.
    pub fn set_global_max(&self, global_max: f64) {
        self.global_max.store(Some(global_max));
    }
}

/// `out[f', r] = sum_f p[f, f'] a[f, r]` for the rows of `a` grouped by
/// frequency.
fn mix_rows(p: ArrayView2<c64>, a: ArrayView2<c64>) -> Result<Array2<c64>, CompressError> {
    let nfreq = p.nrows();
    let (rows, cols) = a.dim();
    let grouped = a.to_shape((nfreq, rows / nfreq * cols))?;
    let mixed = p.t().dot(&grouped);
    Ok(mixed.to_shape((rows, cols))?.into_owned())
}

impl CompressionPolicy for ExternalFilter {
    fn variant(&self) -> SvdVariant {
        SvdVariant::FullFrequencyExternalFilter
    }

    fn setup(&self, bt: &BeamTransfer, topology: &dyn Topology) -> Result<PolicySetup, CompressError> {
        let local = topology
            .split_local(bt.dims().num_modes())
            .map(|mi| {
                self.read_basis(mi)
                    .map(|b| b.sig.first().copied().unwrap_or(0.0))
            })
            .collect::<Result<Vec<f64>, CompressError>>()
            .map(|sig0| sig0.into_iter().fold(f64::NEG_INFINITY, f64::max));

        let failed: Vec<usize> = topology
            .all_gather(local.is_err())?
            .into_iter()
            .enumerate()
            .filter_map(|(rank, failed)| failed.then_some(rank))
            .collect();
        let local_max = match local {
            Ok(v) if failed.is_empty() => v,
            Ok(_) => return Err(CompressError::SetupFailed { ranks: failed }),
            Err(e) => return Err(e),
        };

        let global_max = topology.all_reduce_max(local_max)?;
        info!("External filter: largest singular value over every mode is {global_max:e}");
        self.global_max.store(Some(global_max));
        Ok(PolicySetup::default())
    }

    fn preprocess(
        &self,
        mi: usize,
        block: Array2<c64>,
    ) -> Result<(Array2<c64>, Option<Array2<c64>>), CompressError> {
        let p = self.projector(mi)?;
        let block = mix_rows(p.view(), block.view())?;
        Ok((block, Some(p)))
    }

    fn apply_preprocessing_to_operator(
        &self,
        mi: usize,
        ut: Array2<c64>,
        aux: Option<&Array2<c64>>,
    ) -> Result<Array2<c64>, CompressError> {
        let p = match aux {
            Some(p) => p.clone(),
            None => self.projector(mi)?,
        };
        // ut (P^T x I), i.e. (P x I) applied to the rows of ut^T.
        let mixed = mix_rows(p.t(), ut.t())?;
        Ok(mixed.reversed_axes().as_standard_layout().into_owned())
    }

    fn compress_mode(
        &self,
        mi: usize,
        beam: ArrayView5<c64>,
        descriptor: &TelescopeDescriptor,
        params: &CompressParams,
    ) -> Result<ModeProducts, CompressError> {
        compress_full_frequency(self, mi, beam, descriptor, params)
    }
}

/// How the perturbation projector is folded into the telescope to SVD
/// operator.
#[derive(
    Debug, Default, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AdjointCorrection {
    /// `ut P`; keeps `beam_svd = ut B`.
    #[default]
    Direct,

    /// `ut P^H`.
    ConjugateTranspose,
}

/// Settings of the perturbation filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbationFilterParams {
    /// Where the per-mode eigenbases are written.
    pub basis_dir: PathBuf,

    /// How many of the largest eigenmodes are projected out.
    pub modes_to_cut: usize,

    /// Solve the generalised problem against the unperturbed covariance
    /// instead of diagonalising the perturbed one.
    pub kl: bool,

    /// The KL regulariser, relative to the largest diagonal element of the
    /// unperturbed covariance.
    pub regulariser: f64,

    pub adjoint_correction: AdjointCorrection,

    /// Stop once the bases exist.
    pub construct_modes_only: bool,

    /// Also diagonalise the unperturbed covariance.
    pub construct_unperturbed_modes: bool,
}

impl Default for PerturbationFilterParams {
    fn default() -> Self {
        Self {
            basis_dir: PathBuf::from("perturbation_basis"),
            modes_to_cut: 0,
            kl: false,
            regulariser: DEFAULT_KL_REGULARISER,
            adjoint_correction: AdjointCorrection::default(),
            construct_modes_only: false,
            construct_unperturbed_modes: false,
        }
    }
}

/// Full-frequency compression after projecting out the eigenmodes of a
/// perturbed-telescope covariance.
pub struct PerturbationFilter {
    params: PerturbationFilterParams,
    model: Arc<dyn PerturbationModel>,
    mmax: usize,
}

impl std::fmt::Debug for PerturbationFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerturbationFilter")
            .field("params", &self.params)
            .field("mmax", &self.mmax)
            .finish()
    }
}

/// Flatten a `[F, ntel, F, ntel]` covariance into a matrix.
fn flatten_covariance(c: Array4<c64>) -> Result<Array2<c64>, CompressError> {
    let (f, t, _, _) = c.dim();
    Ok(c.to_shape((f * t, f * t))?.into_owned())
}

impl PerturbationFilter {
    pub fn new(
        params: PerturbationFilterParams,
        model: Arc<dyn PerturbationModel>,
        dims: &Dimensions,
    ) -> PerturbationFilter {
        PerturbationFilter {
            params,
            model,
            mmax: dims.mmax,
        }
    }

    pub fn params(&self) -> &PerturbationFilterParams {
        &self.params
    }

    fn basis_path(&self, mi: usize) -> PathBuf {
        basis_path(&self.params.basis_dir, mi, self.mmax)
    }

    /// Compute and write the eigenbasis of mode `mi`.
    pub fn generate_basis(&self, bt: &BeamTransfer, mi: usize) -> Result<(), CompressError> {
        let cov = self.model.sky_covariance(mi)?;
        let perturbed = self.model.perturbed_beam_m(mi)?;
        let c_pert = flatten_covariance(project_matrix_sky_to_custom_telescope(
            cov.view(),
            perturbed.view(),
        )?)?;
        let project_unperturbed = || -> Result<Array2<c64>, CompressError> {
            let beam = bt.store().beam_m(mi)?;
            flatten_covariance(project_matrix_sky_to_custom_telescope(
                cov.view(),
                beam.view(),
            )?)
        };

        let mut c_unpert = None;
        let (evals, evecs, regulariser) = if self.params.kl {
            let c = project_unperturbed()?;
            let diag = c.diag().iter().map(|z| z.re).fold(0.0, f64::max);
            let n = c.nrows();
            let shift = c64::new(self.params.regulariser * diag, 0.0);
            let regularised = &c + &Array2::from_diag_elem(n, shift);
            let (evals, evecs) =
                eigh_generalised(c_pert.view(), regularised.view(), "KL perturbation basis")?;
            c_unpert = Some(c);
            (
                evals,
                evecs,
                Some(KlRegulariser {
                    mult: self.params.regulariser,
                    diag,
                }),
            )
        } else {
            let (evals, evecs) = eigh(c_pert.view(), "perturbation basis")?;
            (evals, evecs, None)
        };

        let unperturbed = if self.params.construct_unperturbed_modes {
            let c = match c_unpert {
                Some(c) => c,
                None => project_unperturbed()?,
            };
            Some(eigh(c.view(), "unperturbed basis")?)
        } else {
            None
        };

        PerturbationBasis {
            evals,
            evecs,
            unperturbed,
            regulariser,
        }
        .write(&self.basis_path(mi))?;
        Ok(())
    }

    /// The `[F ntel, F ntel]` projector that removes the filtered eigenmodes
    /// of `mi`.
    pub fn projector(&self, mi: usize) -> Result<Array2<c64>, CompressError> {
        let path = self.basis_path(mi);
        let basis = PerturbationBasis::read(&path)?;
        let n = basis.evals.len();
        if basis.evecs.dim() != (n, n) {
            return Err(CompressError::BasisShape {
                path,
                what: "evecs",
                expected: vec![n, n],
                got: basis.evecs.shape().to_vec(),
            });
        }
        let cut = self.params.modes_to_cut.min(n);
        let e_h = adjoint(basis.evecs.view());
        let mut left = if self.params.kl {
            inv_or_pinv(e_h.view(), "perturbation projector")?
        } else {
            basis.evecs
        };
        // Eigenvalues ascend, so the cut modes are the last ones.
        left.slice_mut(s![.., n - cut..]).fill(c64::new(0.0, 0.0));
        Ok(left.dot(&e_h))
    }

    fn check_rows(&self, path: &Path, p: &Array2<c64>, rows: usize) -> Result<(), CompressError> {
        if p.nrows() != rows {
            return Err(CompressError::BasisShape {
                path: path.to_path_buf(),
                what: "evecs",
                expected: vec![rows, rows],
                got: p.shape().to_vec(),
            });
        }
        Ok(())
    }
}

impl CompressionPolicy for PerturbationFilter {
    fn variant(&self) -> SvdVariant {
        SvdVariant::FullFrequencyPerturbationFilter
    }

    fn setup(&self, bt: &BeamTransfer, topology: &dyn Topology) -> Result<PolicySetup, CompressError> {
        let dir = &self.params.basis_dir;
        let created = if topology.is_coordinator() {
            fs::create_dir_all(dir).map_err(CompressError::from)
        } else {
            Ok(())
        };
        let ok = topology.broadcast(topology.is_coordinator().then_some(created.is_ok()))?;
        if !ok {
            created?;
            return Err(CompressError::SetupFailed { ranks: vec![0] });
        }

        let (pending, local) = topology.distribute_pending(
            (0..bt.dims().num_modes()).collect(),
            |mi| PerturbationBasis::complete(&self.basis_path(mi)),
        )?;
        info!(
            "Perturbation filter: {} of {} mode bases to generate",
            pending.len(),
            bt.dims().num_modes()
        );

        let mut computed = vec![];
        let mut failures = vec![];
        for &mi in &local {
            match self.generate_basis(bt, mi) {
                Ok(()) => {
                    debug!("Generated the perturbation basis of m index {mi}");
                    computed.push(mi);
                }
                Err(e) => {
                    warn!("Failed to generate the perturbation basis of m index {mi}: {e}");
                    failures.push(mi);
                }
            }
        }
        let failures: Vec<usize> = topology.all_gather(failures)?.concat();
        if !failures.is_empty() {
            return Err(CompressError::BasisGeneration { modes: failures });
        }

        Ok(PolicySetup {
            bases_computed: computed,
            stop_after_setup: self.params.construct_modes_only,
        })
    }

    fn preprocess(
        &self,
        mi: usize,
        block: Array2<c64>,
    ) -> Result<(Array2<c64>, Option<Array2<c64>>), CompressError> {
        let p = self.projector(mi)?;
        self.check_rows(&self.basis_path(mi), &p, block.nrows())?;
        let block = p.dot(&block);
        Ok((block, Some(p)))
    }

    fn apply_preprocessing_to_operator(
        &self,
        mi: usize,
        ut: Array2<c64>,
        aux: Option<&Array2<c64>>,
    ) -> Result<Array2<c64>, CompressError> {
        let p = match aux {
            Some(p) => p.clone(),
            None => self.projector(mi)?,
        };
        Ok(match self.params.adjoint_correction {
            AdjointCorrection::Direct => ut.dot(&p),
            AdjointCorrection::ConjugateTranspose => ut.dot(&adjoint(p.view())),
        })
    }

    fn compress_mode(
        &self,
        mi: usize,
        beam: ArrayView5<c64>,
        descriptor: &TelescopeDescriptor,
        params: &CompressParams,
    ) -> Result<ModeProducts, CompressError> {
        compress_full_frequency(self, mi, beam, descriptor, params)
    }
}
