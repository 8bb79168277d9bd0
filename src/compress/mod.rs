// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Compression of beam transfer matrices into SVD bases.

For every angular mode, the telescope directions that carry no recoverable
sky signal are projected out. The default algorithm works one frequency at a
time, on the noise-whitened block `B` (`[ntel, Npol (L+1)]`):

1. SVD-1: the image of `B` (skipped when the sky is unpolarised);
2. SVD-2: within that image, the null space of the polarised columns;
3. SVD-3: within that null space, the image of the temperature columns.

The product of the three (adjoint) left bases, `ut`, maps whitened telescope
data into the SVD basis. What is stored has the noise weighting (and any
preprocessing) folded into `ut`, so that it applies to unweighted data and
`beam_svd = ut B`.

How a mode is compressed is chosen by a [`CompressionPolicy`].
 */

mod diagonal;
mod error;
mod full_freq;

pub use diagonal::{FullPolarisation, Identity, TemperatureOnly, ThreeStage};
pub use error::CompressError;
pub use full_freq::{
    external_cut, AdjointCorrection, ExternalFilter, ExternalFilterParams, FullFrequency,
    PerturbationFilter, PerturbationFilterParams,
};
pub use crate::store::Layout;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    c64,
    constants::IMAGE_RTOL,
    dimensions::Dimensions,
    linalg::{adjoint, matrix_image, matrix_nullspace, pinv, LinalgError},
    project::BeamTransfer,
    store::{SvdFileWriter, StoreError},
    telescope::TelescopeDescriptor,
    topology::Topology,
};

/// The supported compression schemes.
#[derive(
    Debug,
    Default,
    Display,
    EnumIter,
    EnumString,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SvdVariant {
    /// Polarisation-aware three-stage SVD, one frequency at a time.
    #[default]
    ThreeStage,

    /// One SVD of the temperature columns per frequency.
    TemperatureOnly,

    /// One SVD of every column per frequency.
    FullPolarisation,

    /// No compression.
    Identity,

    /// The three stages over every frequency at once.
    FullFrequency,

    /// Full frequency, after projecting out modes of an external frequency
    /// basis.
    FullFrequencyExternalFilter,

    /// Full frequency, after projecting out eigenmodes of a perturbation
    /// covariance.
    FullFrequencyPerturbationFilter,
}

impl SvdVariant {
    /// How this variant's operators are stored.
    pub fn layout(self) -> Layout {
        match self {
            SvdVariant::ThreeStage | SvdVariant::TemperatureOnly | SvdVariant::FullPolarisation => {
                Layout::FrequencyDiagonal
            }
            SvdVariant::Identity => Layout::Identity,
            SvdVariant::FullFrequency
            | SvdVariant::FullFrequencyExternalFilter
            | SvdVariant::FullFrequencyPerturbationFilter => Layout::FullFrequency,
        }
    }
}

/// Per-mode settings shared by every policy.
#[derive(Debug, Clone, Copy)]
pub struct CompressParams {
    /// Polarisation null-space cutoff (SVD-2).
    pub polsvcut: f64,

    /// Should the SVD to sky operator (`invbeam_svd`) be made?
    pub with_invbeam: bool,
}

/// What a policy's setup did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySetup {
    /// Filter bases computed by this worker.
    pub bases_computed: Vec<usize>,

    /// Should generation stop once setup is done?
    pub stop_after_setup: bool,
}

/// Matrix sizes seen by each stage of a reduction. Stages that were skipped
/// are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTrace {
    /// The number of SVD-1 singular values above its tolerance.
    pub svd1_rank: Option<usize>,

    /// The dimension of the SVD-2 null space.
    pub svd2_dim: Option<usize>,

    /// The number of modes kept.
    pub retained: usize,
}

/// The outcome of a reduction of one whitened block: `ut` (`[k, rows]`) maps
/// whitened telescope data into the `k` kept modes.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub ut: Array2<c64>,
    pub singular_values: Array1<f64>,
    pub trace: StageTrace,
}

impl Reduction {
    fn empty(rows: usize, trace: StageTrace) -> Reduction {
        Reduction {
            ut: Array2::zeros((0, rows)),
            singular_values: Array1::zeros(0),
            trace,
        }
    }
}

/// The products of one frequency of a frequency-diagonal mode. Rows past
/// `nmodes` are zero.
#[derive(Debug, Clone)]
pub struct FrequencyProducts {
    /// `[svd_len, Npol, L+1]`
    pub beam_svd: Array3<c64>,
    /// `[Npol, L+1, svd_len]`
    pub invbeam_svd: Option<Array3<c64>>,
    /// `[svd_len, ntel]`
    pub beam_ut: Array2<c64>,
    /// `[svd_len]`
    pub singular_values: Array1<f64>,
    pub nmodes: usize,
    pub used_fallback_pinv: bool,
    pub trace: StageTrace,
}

/// The products of a full-frequency mode. Rows past `nmodes` are zero.
#[derive(Debug, Clone)]
pub struct FullFrequencyProducts {
    /// `[F svd_len, F, Npol, L+1]`
    pub beam_svd: Array4<c64>,
    /// `[F, Npol, L+1, F svd_len]`
    pub invbeam_svd: Option<Array4<c64>>,
    /// `[F svd_len, F ntel]`
    pub beam_ut: Array2<c64>,
    /// `[F svd_len]`
    pub singular_values: Array1<f64>,
    pub nmodes: usize,
    pub used_fallback_pinv: bool,
    pub trace: StageTrace,
}

/// Everything compression produces for one mode.
#[derive(Debug, Clone)]
pub enum ModeProducts {
    FrequencyDiagonal(Vec<FrequencyProducts>),
    FullFrequency(FullFrequencyProducts),
    /// The policy produces no operators.
    Empty,
}

impl ModeProducts {
    /// Was the SVD-based pseudo-inverse needed anywhere?
    pub fn used_fallback_pinv(&self) -> bool {
        match self {
            ModeProducts::FrequencyDiagonal(v) => v.iter().any(|p| p.used_fallback_pinv),
            ModeProducts::FullFrequency(p) => p.used_fallback_pinv,
            ModeProducts::Empty => false,
        }
    }

    /// The total number of kept modes.
    pub fn nmodes(&self) -> usize {
        match self {
            ModeProducts::FrequencyDiagonal(v) => v.iter().map(|p| p.nmodes).sum(),
            ModeProducts::FullFrequency(p) => p.nmodes,
            ModeProducts::Empty => 0,
        }
    }

    /// Write every product into an SVD file.
    pub fn write(&self, writer: &mut SvdFileWriter) -> Result<(), StoreError> {
        match self {
            ModeProducts::FrequencyDiagonal(v) => {
                for (fi, p) in v.iter().enumerate() {
                    writer.write_frequency(
                        fi,
                        p.beam_svd.view(),
                        p.invbeam_svd.as_ref().map(|a| a.view()),
                        p.beam_ut.view(),
                        p.singular_values.view(),
                    )?;
                }
            }
            ModeProducts::FullFrequency(p) => writer.write_full(
                p.beam_svd.view(),
                p.invbeam_svd.as_ref().map(|a| a.view()),
                p.beam_ut.view(),
                p.singular_values.view(),
            )?,
            ModeProducts::Empty => (),
        }
        Ok(())
    }
}

/// A strategy for compressing one mode.
///
/// The default methods give the behaviour of a policy without preprocessing:
/// `preprocess` does nothing, `prewhiten` scales the rows of a block by the
/// noise weights and `apply_preprocessing_to_operator` does nothing.
pub trait CompressionPolicy: Send + Sync {
    fn variant(&self) -> SvdVariant;

    /// The name recorded in generated files.
    fn name(&self) -> String {
        self.variant().to_string()
    }

    fn layout(&self) -> Layout {
        self.variant().layout()
    }

    /// The per-frequency bound on compressed degrees of freedom.
    fn svd_len(&self, dims: &Dimensions) -> usize {
        dims.svd_len()
    }

    /// The significance cutoff actually used, given the one asked for.
    fn effective_svcut(&self, svcut: f64) -> f64 {
        svcut
    }

    /// Work done once before any mode is compressed. Every worker calls this
    /// together.
    fn setup(
        &self,
        _bt: &BeamTransfer,
        _topology: &dyn Topology,
    ) -> Result<PolicySetup, CompressError> {
        Ok(PolicySetup::default())
    }

    /// Transform a raw block before prewhitening, returning anything needed
    /// to apply the same transformation to the final operator.
    fn preprocess(
        &self,
        _mi: usize,
        block: Array2<c64>,
    ) -> Result<(Array2<c64>, Option<Array2<c64>>), CompressError> {
        Ok((block, None))
    }

    /// Apply the noise weights (`[rows]`) to a block.
    fn prewhiten(&self, mut block: Array2<c64>, weights: ArrayView1<f64>) -> Array2<c64> {
        for (mut row, &w) in block.outer_iter_mut().zip(weights) {
            row.mapv_inplace(|z| z * w);
        }
        block
    }

    /// Fold the preprocessing into a telescope to SVD operator.
    fn apply_preprocessing_to_operator(
        &self,
        _mi: usize,
        ut: Array2<c64>,
        _aux: Option<&Array2<c64>>,
    ) -> Result<Array2<c64>, CompressError> {
        Ok(ut)
    }

    /// Compress the raw operator of a mode (`[F, 2, P, Npol, L+1]`).
    fn compress_mode(
        &self,
        mi: usize,
        beam: ArrayView5<c64>,
        descriptor: &TelescopeDescriptor,
        params: &CompressParams,
    ) -> Result<ModeProducts, CompressError>;
}

/// The columns of polarisations `pols` of a matrix whose columns are ordered
/// (block, polarisation, multipole).
fn pol_columns(
    a: ArrayView2<c64>,
    nblocks: usize,
    npol: usize,
    lside: usize,
    pols: std::ops::Range<usize>,
) -> Array2<c64> {
    let npick = pols.len();
    Array2::from_shape_fn((a.nrows(), nblocks * npick * lside), |(r, c)| {
        let block = c / (npick * lside);
        let pol = (c / lside) % npick + pols.start;
        let l = c % lside;
        a[(r, (block * npol + pol) * lside + l)]
    })
}

/// The three-stage reduction of a whitened block (`[rows, nblocks Npol
/// (L+1)]`, columns ordered (block, polarisation, multipole)).
///
/// A block with no signal at all, or one where the polarisation cut leaves
/// nothing, gives an empty reduction.
pub fn three_stage(
    whitened: ArrayView2<c64>,
    nblocks: usize,
    npol: usize,
    lside: usize,
    polsvcut: f64,
) -> Result<Reduction, LinalgError> {
    let rows = whitened.nrows();
    let mut trace = StageTrace::default();

    // ut2 is None when it would be the identity.
    let ut2 = if npol == 1 {
        None
    } else {
        let (u1, s1) = matrix_image(whitened, IMAGE_RTOL, "SVD1")?;
        trace.svd1_rank = Some(u1.ncols());
        if !s1.iter().any(|&v| v > 0.0) {
            return Ok(Reduction::empty(rows, trace));
        }
        let ut1 = adjoint(u1.view());
        let bf1 = ut1.dot(&whitened);
        let bfp = pol_columns(bf1.view(), nblocks, npol, lside, 1..npol);
        let (u2, _) = matrix_nullspace(bfp.view(), polsvcut, "SVD2")?;
        trace.svd2_dim = Some(u2.ncols());
        if u2.ncols() == 0 {
            return Ok(Reduction::empty(rows, trace));
        }
        Some(adjoint(u2.view()).dot(&ut1))
    };

    let bf2 = match ut2.as_ref() {
        Some(ut2) => ut2.dot(&whitened),
        None => whitened.to_owned(),
    };
    let bft = pol_columns(bf2.view(), nblocks, npol, lside, 0..1);
    let (u3, s3) = matrix_image(bft.view(), 0.0, "SVD3")?;
    let k = u3.ncols();
    let ut3 = adjoint(u3.view());
    let ut = match ut2 {
        Some(ut2) => ut3.dot(&ut2),
        None => ut3,
    };
    trace.retained = k;
    Ok(Reduction {
        ut,
        singular_values: s3.slice(s![..k]).to_owned(),
        trace,
    })
}

/// The raw block of one frequency, `[ntel, Npol (L+1)]`, with telescope rows
/// ordered (sign, baseline pair).
pub(crate) fn frequency_block(
    beam: ArrayView5<c64>,
    fi: usize,
) -> Result<Array2<c64>, CompressError> {
    let b = beam.index_axis(Axis(0), fi);
    let (nsign, npairs, npol, lside) = b.dim();
    Ok(b.to_shape((nsign * npairs, npol * lside))?.into_owned())
}

/// The pseudo-inverse of the live part of `beam_svd` (`[k, nsky]`), if it is
/// wanted.
fn invert(
    beam: ArrayView2<c64>,
    params: &CompressParams,
) -> Result<Option<(Array2<c64>, bool)>, LinalgError> {
    if params.with_invbeam {
        pinv(beam).map(Some)
    } else {
        Ok(None)
    }
}
