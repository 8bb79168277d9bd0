// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The on-disk layout of generated operators.
//!
//! ```text
//! <dir>/telescope.toml              serialised telescope descriptor
//! <dir>/beam_m/COMPLETED            raw generation finished
//! <dir>/beam_m/SVD_VARIANT          which compression produced the SVD files
//! <dir>/beam_m/<mi>/beam.fits       raw transfer operator of a mode
//! <dir>/beam_m/<mi>/svd.fits        compressed operators of a mode
//! <dir>/svdspectrum.fits            every mode's singular values
//! ```
//!
//! Mode directories are zero padded to the number of digits of the largest
//! mode index. FITS can't hold complex numbers, so complex images have a
//! trailing axis of length 2 (real, imaginary).

mod basis;
mod cache;
mod error;
mod fits;
mod lock;

pub use basis::{basis_path, ExternalBasis, KlRegulariser, PerturbationBasis};
pub use cache::{ArtifactKind, CacheKey};
pub use error::StoreError;
pub use fits::FitsError;
pub use lock::LockedFile;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use fitsio::FitsFile;
use log::{debug, trace};
use ndarray::prelude::*;
use strum_macros::{Display, EnumString};

use cache::{ArtifactCache, CachedArray};
use fits::*;
use crate::{c64, dimensions::Dimensions, telescope::TelescopeDescriptor};

pub const DESCRIPTOR_FILENAME: &str = "telescope.toml";
pub const BEAM_M_DIRNAME: &str = "beam_m";
pub const BEAM_M_FILENAME: &str = "beam.fits";
pub const SVD_FILENAME: &str = "svd.fits";
pub const SPECTRUM_FILENAME: &str = "svdspectrum.fits";
pub const COMPLETED_FILENAME: &str = "COMPLETED";
pub const VARIANT_FILENAME: &str = "SVD_VARIANT";

/// How the compressed operators of a mode are laid out.
#[derive(Debug, Display, EnumString, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One independent block per frequency.
    #[strum(serialize = "frequency-diagonal")]
    FrequencyDiagonal,

    /// One block spanning every frequency.
    #[strum(serialize = "full-frequency")]
    FullFrequency,

    /// No compression; the telescope basis is used as is.
    #[strum(serialize = "identity")]
    Identity,
}

/// Header metadata of a mode's SVD file.
#[derive(Debug, Clone, PartialEq)]
pub struct SvdHeader {
    pub mi: usize,
    pub nfreq: usize,
    pub svd_len: usize,
    pub variant: String,
    pub layout: Layout,
    /// Was the SVD-based pseudo-inverse needed for any block?
    pub used_fallback_pinv: bool,
    pub has_invbeam: bool,
}

/// The number of digits needed to write every mode index.
pub fn mode_width(mmax: usize) -> usize {
    mmax.to_string().len()
}

/// The zero-padded directory name of a mode.
pub fn mode_dirname(mi: usize, mmax: usize) -> String {
    format!("{mi:0width$}", width = mode_width(mmax))
}

fn artifact_hdu(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::BeamM => "BEAM_M",
        ArtifactKind::BeamSvd => "BEAM_SVD",
        ArtifactKind::InvbeamSvd => "INVBEAM_SVD",
        ArtifactKind::BeamUt => "BEAM_UT",
        ArtifactKind::SingularValues => "SINGULARVALUES",
    }
}

fn artifact_what(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::BeamM => "beam_m",
        ArtifactKind::BeamSvd => "beam_svd",
        ArtifactKind::InvbeamSvd => "invbeam_svd",
        ArtifactKind::BeamUt => "beam_ut",
        ArtifactKind::SingularValues => "beam_singularvalues",
    }
}

/// Flatten complex values into (re, im) pairs in C order.
pub(crate) fn complex_to_f64<S, D>(a: &ArrayBase<S, D>) -> Vec<f64>
where
    S: ndarray::Data<Elem = c64>,
    D: Dimension,
{
    let standard = a.as_standard_layout();
    match standard.as_slice() {
        Some(s) => bytemuck::cast_slice::<c64, f64>(s).to_vec(),
        None => a.iter().flat_map(|z| [z.re, z.im]).collect(),
    }
}

fn f64_to_complex(path: &Path, what: &'static str, data: &[f64]) -> Result<Vec<c64>, StoreError> {
    bytemuck::try_cast_slice::<f64, c64>(data)
        .map(|s| s.to_vec())
        .map_err(|_| StoreError::Shape {
            path: path.to_path_buf(),
            what,
            expected: vec![data.len() / 2, 2],
            got: vec![data.len()],
        })
}

/// Write a complex array as a new image HDU.
pub(crate) fn write_complex_image<D: Dimension>(
    fptr: &mut FitsFile,
    name: &str,
    a: ArrayView<c64, D>,
) -> Result<(), StoreError> {
    let mut dims = a.shape().to_vec();
    dims.push(2);
    let hdu = fits_create_image(fptr, name, &dims)?;
    if a.len() > 0 {
        fits_write_image(fptr, &hdu, &complex_to_f64(&a))?;
    }
    Ok(())
}

/// Write a real array as a new image HDU.
pub(crate) fn write_real_image<D: Dimension>(
    fptr: &mut FitsFile,
    name: &str,
    a: ArrayView<f64, D>,
) -> Result<(), StoreError> {
    let hdu = fits_create_image(fptr, name, a.shape())?;
    if a.len() > 0 {
        let data: Vec<f64> = a.iter().copied().collect();
        fits_write_image(fptr, &hdu, &data)?;
    }
    Ok(())
}

/// Read a whole complex image HDU.
pub(crate) fn read_complex_image(
    fptr: &mut FitsFile,
    path: &Path,
    name: &'static str,
) -> Result<ArrayD<c64>, StoreError> {
    let hdu = fits_open_hdu(fptr, name)?;
    let mut shape = fits_get_image_shape(fptr, &hdu)?;
    if shape.last() != Some(&2) {
        return Err(StoreError::Shape {
            path: path.to_path_buf(),
            what: name,
            expected: vec![2],
            got: shape,
        });
    }
    shape.pop();
    let data: Vec<f64> = if shape.iter().product::<usize>() == 0 {
        vec![]
    } else {
        fits_get_image(fptr, &hdu)?
    };
    let data = f64_to_complex(path, name, &data)?;
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|_| StoreError::Shape {
        path: path.to_path_buf(),
        what: name,
        expected: shape.clone(),
        got: vec![],
    })
}

/// Read a whole real image HDU.
pub(crate) fn read_real_image(
    fptr: &mut FitsFile,
    path: &Path,
    name: &'static str,
) -> Result<ArrayD<f64>, StoreError> {
    let hdu = fits_open_hdu(fptr, name)?;
    let shape = fits_get_image_shape(fptr, &hdu)?;
    let data: Vec<f64> = if shape.iter().product::<usize>() == 0 {
        vec![]
    } else {
        fits_get_image(fptr, &hdu)?
    };
    let got = vec![data.len()];
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|_| StoreError::Shape {
        path: path.to_path_buf(),
        what: name,
        expected: shape.clone(),
        got,
    })
}

/// Reads and writes every artifact of a generation directory.
///
/// Reads go through a small LRU cache; any write to a mode forgets what was
/// cached for it.
#[derive(Debug)]
pub struct OperatorStore {
    directory: PathBuf,
    dims: Dimensions,
    layout: Layout,
    svd_len: usize,
    cache: Mutex<ArtifactCache>,
}

impl OperatorStore {
    pub fn new<P: Into<PathBuf>>(
        directory: P,
        dims: Dimensions,
        layout: Layout,
        svd_len: usize,
        cache_capacity: usize,
    ) -> OperatorStore {
        OperatorStore {
            directory: directory.into(),
            dims,
            layout,
            svd_len,
            cache: Mutex::new(ArtifactCache::new(cache_capacity)),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn dims(&self) -> &Dimensions {
        &self.dims
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn svd_len(&self) -> usize {
        self.svd_len
    }

    fn cache(&self) -> MutexGuard<ArtifactCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.directory.join(DESCRIPTOR_FILENAME)
    }

    pub fn beam_m_dir(&self) -> PathBuf {
        self.directory.join(BEAM_M_DIRNAME)
    }

    pub fn mode_dir(&self, mi: usize) -> PathBuf {
        self.beam_m_dir().join(mode_dirname(mi, self.dims.mmax))
    }

    pub fn beam_m_path(&self, mi: usize) -> PathBuf {
        self.mode_dir(mi).join(BEAM_M_FILENAME)
    }

    pub fn svd_path(&self, mi: usize) -> PathBuf {
        self.mode_dir(mi).join(SVD_FILENAME)
    }

    pub fn spectrum_path(&self) -> PathBuf {
        self.directory.join(SPECTRUM_FILENAME)
    }

    pub fn completed_path(&self) -> PathBuf {
        self.beam_m_dir().join(COMPLETED_FILENAME)
    }

    pub fn variant_path(&self) -> PathBuf {
        self.beam_m_dir().join(VARIANT_FILENAME)
    }

    fn artifact_path(&self, kind: ArtifactKind, mi: usize) -> PathBuf {
        match kind {
            ArtifactKind::BeamM => self.beam_m_path(mi),
            _ => self.svd_path(mi),
        }
    }

    /// Create the run directory and every mode directory.
    pub fn create_directories(&self) -> Result<(), StoreError> {
        for mi in 0..self.dims.num_modes() {
            fs::create_dir_all(self.mode_dir(mi))?;
        }
        Ok(())
    }

    /// Write the telescope descriptor.
    pub fn save_descriptor(&self, descriptor: &TelescopeDescriptor) -> Result<(), StoreError> {
        let s = toml::to_string_pretty(descriptor)
            .map_err(|e| StoreError::DescriptorWrite(e.to_string()))?;
        let lock = LockedFile::acquire(self.descriptor_path(), false)?;
        fs::write(lock.path(), s)?;
        lock.commit()?;
        Ok(())
    }

    /// Read the telescope descriptor of a generation directory.
    pub fn load_descriptor(directory: &Path) -> Result<TelescopeDescriptor, StoreError> {
        let path = directory.join(DESCRIPTOR_FILENAME);
        if !path.exists() {
            return Err(StoreError::Missing { path });
        }
        let s = fs::read_to_string(&path)?;
        let descriptor: TelescopeDescriptor =
            toml::from_str(&s).map_err(|e| StoreError::DescriptorRead {
                path: path.clone(),
                err: e.to_string(),
            })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Has raw generation finished?
    pub fn raw_complete(&self) -> bool {
        self.completed_path().exists()
    }

    pub fn mark_raw_complete(&self) -> Result<(), StoreError> {
        fs::File::create(self.completed_path())?;
        Ok(())
    }

    pub fn clear_raw_complete(&self) -> Result<(), StoreError> {
        let path = self.completed_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn write_variant(&self, name: &str) -> Result<(), StoreError> {
        fs::write(self.variant_path(), name)?;
        Ok(())
    }

    /// The variant recorded by an earlier run, if any.
    pub fn read_variant(&self) -> Result<Option<String>, StoreError> {
        let path = self.variant_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?.trim().to_string()))
    }

    fn check_mode(&self, mi: usize) -> Result<(), StoreError> {
        if mi > self.dims.mmax {
            return Err(StoreError::BadModeIndex {
                got: mi,
                max: self.dims.mmax,
            });
        }
        Ok(())
    }

    fn check_freq(&self, fi: usize) -> Result<(), StoreError> {
        if fi >= self.dims.nfreq {
            return Err(StoreError::BadFrequencyIndex {
                got: fi,
                max: self.dims.nfreq - 1,
            });
        }
        Ok(())
    }

    /// Create (or replace) the raw operator file of a mode. The image starts
    /// out as zeros.
    pub fn create_beam_m(&self, mi: usize) -> Result<(), StoreError> {
        self.check_mode(mi)?;
        let mut dims = self.dims.beam_m_shape().to_vec();
        dims.push(2);
        {
            let _session = fits_session();
            let mut fptr = fits_create(self.beam_m_path(mi))?;
            let hdu = fits_open_hdu(&mut fptr, 0)?;
            fits_write_key(&mut fptr, &hdu, "M", mi as i64)?;
            fits_write_key(&mut fptr, &hdu, "NFREQ", self.dims.nfreq as i64)?;
            fits_create_image(&mut fptr, artifact_hdu(ArtifactKind::BeamM), &dims)?;
        }
        self.cache().invalidate_mode(mi);
        Ok(())
    }

    /// Write the raw operator of consecutive (frequency, baseline) pairs
    /// `fb_start..fb_start + n` of a mode, where `fb = fi * P + bi`. `data` is
    /// `[n, 2, Npol, L+1]`.
    pub fn write_beam_m_fb(
        &self,
        mi: usize,
        fb_start: usize,
        data: ArrayView4<c64>,
    ) -> Result<(), StoreError> {
        self.check_mode(mi)?;
        let d = &self.dims;
        let path = self.beam_m_path(mi);
        let (nfb, nsign, npol, lside) = data.dim();
        let expected = [nfb, 2, d.npol, d.lside()];
        if [nfb, nsign, npol, lside] != expected || fb_start + nfb > d.nfreq * d.npairs {
            return Err(StoreError::Shape {
                path,
                what: "raw transfer block",
                expected: expected.to_vec(),
                got: data.shape().to_vec(),
            });
        }
        let p = d.npairs;
        let stride = npol * lside * 2;

        {
            let _session = fits_session();
            let mut fptr = fits_edit(&path)?;
            let hdu = fits_open_hdu(&mut fptr, artifact_hdu(ArtifactKind::BeamM))?;
            let end = fb_start + nfb;
            let mut fb = fb_start;
            // Baselines of one frequency are contiguous within each sign.
            while fb < end {
                let fi = fb / p;
                let b0 = fb % p;
                let run = (p - b0).min(end - fb);
                let chunk = data.slice(s![fb - fb_start..fb - fb_start + run, .., .., ..]);
                for sign in 0..2 {
                    let flat = complex_to_f64(&chunk.index_axis(Axis(1), sign));
                    let start = ((fi * 2 + sign) * p + b0) * stride;
                    fits_write_section(&mut fptr, &hdu, start, start + run * stride, &flat)?;
                }
                fb += run;
            }
        }
        trace!("Wrote {nfb} raw blocks of mode {mi}");
        self.cache().invalidate_mode(mi);
        Ok(())
    }

    fn load(&self, key: CacheKey) -> Result<CachedArray, StoreError> {
        if let Some(v) = self.cache().get(&key) {
            return Ok(v);
        }
        let v = self.read_uncached(key)?;
        self.cache().insert(key, v.clone());
        Ok(v)
    }

    fn read_uncached(&self, key: CacheKey) -> Result<CachedArray, StoreError> {
        let CacheKey { kind, mi, fi } = key;
        self.check_mode(mi)?;
        let what = artifact_what(kind);
        if let Some(fi) = fi {
            self.check_freq(fi)?;
            if kind != ArtifactKind::BeamM && self.layout == Layout::FullFrequency {
                return Err(StoreError::Unsupported { what });
            }
        }
        let path = self.artifact_path(kind, mi);
        if !path.exists() {
            return Err(StoreError::Missing { path });
        }
        let name = artifact_hdu(kind);
        let complex = kind != ArtifactKind::SingularValues;
        trace!("Reading {what} of mode {mi} (frequency {fi:?}) from {}", path.display());

        let _session = fits_session();
        let mut fptr = fits_open(&path)?;
        if fits_open_hdu(&mut fptr, name).is_err() {
            return Err(StoreError::MissingHdu { path, hdu: name });
        }

        let array = match fi {
            None if complex => CachedArray::Complex(read_complex_image(&mut fptr, &path, name)?.into_shared()),
            None => CachedArray::Real(read_real_image(&mut fptr, &path, name)?.into_shared()),
            Some(fi) => {
                let hdu = fits_open_hdu(&mut fptr, name)?;
                let shape = fits_get_image_shape(&fptr, &hdu)?;
                if shape.first() != Some(&self.dims.nfreq) {
                    return Err(StoreError::Shape {
                        path,
                        what,
                        expected: vec![self.dims.nfreq],
                        got: shape,
                    });
                }
                let stride: usize = shape[1..].iter().product();
                let data: Vec<f64> = if stride == 0 {
                    vec![]
                } else {
                    fits_read_section(&mut fptr, &hdu, fi * stride, (fi + 1) * stride)?
                };
                let mut out_shape = shape[1..].to_vec();
                if complex {
                    out_shape.pop();
                    let data = f64_to_complex(&path, what, &data)?;
                    let a = ArrayD::from_shape_vec(IxDyn(&out_shape), data).map_err(|_| {
                        StoreError::Shape {
                            path: path.clone(),
                            what,
                            expected: out_shape.clone(),
                            got: vec![],
                        }
                    })?;
                    CachedArray::Complex(a.into_shared())
                } else {
                    let a = ArrayD::from_shape_vec(IxDyn(&out_shape), data).map_err(|_| {
                        StoreError::Shape {
                            path: path.clone(),
                            what,
                            expected: out_shape.clone(),
                            got: vec![],
                        }
                    })?;
                    CachedArray::Real(a.into_shared())
                }
            }
        };
        Ok(array)
    }

    fn load_complex<D: Dimension>(
        &self,
        kind: ArtifactKind,
        mi: usize,
        fi: Option<usize>,
    ) -> Result<ArcArray<c64, D>, StoreError> {
        let rank_error = |got: Vec<usize>| StoreError::Shape {
            path: self.artifact_path(kind, mi),
            what: artifact_what(kind),
            expected: vec![D::NDIM.unwrap_or(0)],
            got,
        };
        match self.load(CacheKey { kind, mi, fi })? {
            CachedArray::Complex(a) => {
                let shape = a.shape().to_vec();
                a.into_dimensionality::<D>().map_err(|_| rank_error(shape))
            }
            CachedArray::Real(a) => Err(rank_error(a.shape().to_vec())),
        }
    }

    fn load_real<D: Dimension>(
        &self,
        kind: ArtifactKind,
        mi: usize,
        fi: Option<usize>,
    ) -> Result<ArcArray<f64, D>, StoreError> {
        let rank_error = |got: Vec<usize>| StoreError::Shape {
            path: self.artifact_path(kind, mi),
            what: artifact_what(kind),
            expected: vec![D::NDIM.unwrap_or(0)],
            got,
        };
        match self.load(CacheKey { kind, mi, fi })? {
            CachedArray::Real(a) => {
                let shape = a.shape().to_vec();
                a.into_dimensionality::<D>().map_err(|_| rank_error(shape))
            }
            CachedArray::Complex(a) => Err(rank_error(a.shape().to_vec())),
        }
    }

    /// The raw operator of a mode, `[F, 2, P, Npol, L+1]`.
    pub fn beam_m(&self, mi: usize) -> Result<ArcArray<c64, Ix5>, StoreError> {
        self.load_complex(ArtifactKind::BeamM, mi, None)
    }

    /// The raw operator of a mode at one frequency, `[2, P, Npol, L+1]`.
    pub fn beam_m_freq(&self, mi: usize, fi: usize) -> Result<ArcArray<c64, Ix4>, StoreError> {
        self.load_complex(ArtifactKind::BeamM, mi, Some(fi))
    }

    /// The sky to SVD operator, `[F, svd_len, Npol, L+1]` or
    /// `[F svd_len, F, Npol, L+1]`.
    pub fn beam_svd(&self, mi: usize) -> Result<ArcArray<c64, Ix4>, StoreError> {
        self.load_complex(ArtifactKind::BeamSvd, mi, None)
    }

    /// `[svd_len, Npol, L+1]`
    pub fn beam_svd_freq(&self, mi: usize, fi: usize) -> Result<ArcArray<c64, Ix3>, StoreError> {
        self.load_complex(ArtifactKind::BeamSvd, mi, Some(fi))
    }

    /// The SVD to sky operator, `[F, Npol, L+1, svd_len]` or
    /// `[F, Npol, L+1, F svd_len]`.
    pub fn invbeam_svd(&self, mi: usize) -> Result<ArcArray<c64, Ix4>, StoreError> {
        self.load_complex(ArtifactKind::InvbeamSvd, mi, None)
    }

    /// `[Npol, L+1, svd_len]`
    pub fn invbeam_svd_freq(&self, mi: usize, fi: usize) -> Result<ArcArray<c64, Ix3>, StoreError> {
        self.load_complex(ArtifactKind::InvbeamSvd, mi, Some(fi))
    }

    /// The telescope to SVD operator, `[F, svd_len, ntel]` or
    /// `[F svd_len, F ntel]`.
    pub fn beam_ut(&self, mi: usize) -> Result<ArcArray<c64, IxDyn>, StoreError> {
        self.load_complex(ArtifactKind::BeamUt, mi, None)
    }

    /// `[svd_len, ntel]`
    pub fn beam_ut_freq(&self, mi: usize, fi: usize) -> Result<ArcArray<c64, Ix2>, StoreError> {
        self.load_complex(ArtifactKind::BeamUt, mi, Some(fi))
    }

    /// The singular values of a mode, `[F, svd_len]` or `[F svd_len]`.
    pub fn beam_singularvalues(&self, mi: usize) -> Result<ArcArray<f64, IxDyn>, StoreError> {
        self.load_real(ArtifactKind::SingularValues, mi, None)
    }

    /// `[svd_len]`
    pub fn beam_singularvalues_freq(
        &self,
        mi: usize,
        fi: usize,
    ) -> Result<ArcArray<f64, Ix1>, StoreError> {
        self.load_real(ArtifactKind::SingularValues, mi, Some(fi))
    }

    /// The C-order image dimensions of every SVD-file HDU.
    fn svd_image_dims(&self, with_invbeam: bool) -> Vec<(ArtifactKind, Vec<usize>)> {
        let d = &self.dims;
        let (f, s, npol, lside, ntel) = (d.nfreq, self.svd_len, d.npol, d.lside(), d.ntel());
        let mut dims = match self.layout {
            Layout::FullFrequency => vec![
                (ArtifactKind::BeamSvd, vec![f * s, f, npol, lside, 2]),
                (ArtifactKind::InvbeamSvd, vec![f, npol, lside, f * s, 2]),
                (ArtifactKind::BeamUt, vec![f * s, f * ntel, 2]),
                (ArtifactKind::SingularValues, vec![f * s]),
            ],
            _ => vec![
                (ArtifactKind::BeamSvd, vec![f, s, npol, lside, 2]),
                (ArtifactKind::InvbeamSvd, vec![f, npol, lside, s, 2]),
                (ArtifactKind::BeamUt, vec![f, s, ntel, 2]),
                (ArtifactKind::SingularValues, vec![f, s]),
            ],
        };
        if !with_invbeam {
            dims.retain(|(k, _)| *k != ArtifactKind::InvbeamSvd);
        }
        dims
    }

    /// Start writing the SVD file of a mode. Nothing is visible at the final
    /// path until [`SvdFileWriter::finish`].
    pub fn svd_writer(
        &self,
        mi: usize,
        variant: &str,
        with_invbeam: bool,
    ) -> Result<SvdFileWriter<'_>, StoreError> {
        self.check_mode(mi)?;
        let lock = LockedFile::acquire(self.svd_path(mi), true)?;
        {
            let _session = fits_session();
            let mut fptr = fits_create(lock.path())?;
            let hdu = fits_open_hdu(&mut fptr, 0)?;
            fits_write_key(&mut fptr, &hdu, "M", mi as i64)?;
            fits_write_key(&mut fptr, &hdu, "NFREQ", self.dims.nfreq as i64)?;
            fits_write_key(&mut fptr, &hdu, "SVDLEN", self.svd_len as i64)?;
            fits_write_key(&mut fptr, &hdu, "VARIANT", variant)?;
            fits_write_key(&mut fptr, &hdu, "LAYOUT", self.layout.to_string())?;
            for (kind, dims) in self.svd_image_dims(with_invbeam) {
                fits_create_image(&mut fptr, artifact_hdu(kind), &dims)?;
            }
        }
        debug!("Writing the SVD file of mode {mi} via {}", lock.path().display());
        Ok(SvdFileWriter {
            store: self,
            mi,
            lock,
            with_invbeam,
        })
    }

    /// Does a mode have a complete SVD file? It must exist, open, and have its
    /// products.
    pub fn svd_file_complete(&self, mi: usize) -> bool {
        let path = self.svd_path(mi);
        if !path.exists() {
            return false;
        }
        let _session = fits_session();
        let mut fptr = match fits_open(&path) {
            Ok(f) => f,
            Err(_) => return false,
        };
        [
            ArtifactKind::BeamSvd,
            ArtifactKind::BeamUt,
            ArtifactKind::SingularValues,
        ]
        .into_iter()
        .all(|kind| fits_open_hdu(&mut fptr, artifact_hdu(kind)).is_ok())
    }

    /// Read the header of a mode's SVD file.
    pub fn svd_header(&self, mi: usize) -> Result<SvdHeader, StoreError> {
        self.check_mode(mi)?;
        let path = self.svd_path(mi);
        if !path.exists() {
            return Err(StoreError::Missing { path });
        }
        let _session = fits_session();
        let mut fptr = fits_open(&path)?;
        let hdu = fits_open_hdu(&mut fptr, 0)?;
        let layout: String = fits_get_required_key(&mut fptr, &hdu, "LAYOUT")?;
        let layout = layout.parse().map_err(|_| StoreError::BadHeader {
            path: path.clone(),
            key: "LAYOUT",
        })?;
        let pinv: i64 = fits_get_optional_key(&mut fptr, &hdu, "PINV2")?.unwrap_or(0);
        let header = SvdHeader {
            mi: fits_get_required_key(&mut fptr, &hdu, "M")?,
            nfreq: fits_get_required_key(&mut fptr, &hdu, "NFREQ")?,
            svd_len: fits_get_required_key(&mut fptr, &hdu, "SVDLEN")?,
            variant: fits_get_required_key(&mut fptr, &hdu, "VARIANT")?,
            layout,
            used_fallback_pinv: pinv != 0,
            has_invbeam: fits_open_hdu(&mut fptr, artifact_hdu(ArtifactKind::InvbeamSvd)).is_ok(),
        };
        Ok(header)
    }

    /// Write the global spectrum.
    pub fn write_spectrum(&self, spectrum: ArrayViewD<f64>) -> Result<(), StoreError> {
        let lock = LockedFile::acquire(self.spectrum_path(), false)?;
        {
            let _session = fits_session();
            let mut fptr = fits_create(lock.path())?;
            write_real_image(&mut fptr, "SPECTRUM", spectrum)?;
        }
        lock.commit()?;
        Ok(())
    }

    /// Read the global spectrum, `[M+1, F, svd_len]` or `[M+1, F svd_len]`.
    pub fn spectrum(&self) -> Result<ArrayD<f64>, StoreError> {
        let path = self.spectrum_path();
        if !path.exists() {
            return Err(StoreError::Missing { path });
        }
        let _session = fits_session();
        let mut fptr = fits_open(&path)?;
        read_real_image(&mut fptr, &path, "SPECTRUM")
    }
}

/// An in-progress write of a mode's SVD file. Dropping it without calling
/// [`finish`](SvdFileWriter::finish) leaves the partial file behind (under its
/// temporary name) and the final path untouched.
pub struct SvdFileWriter<'a> {
    store: &'a OperatorStore,
    mi: usize,
    lock: LockedFile,
    with_invbeam: bool,
}

impl SvdFileWriter<'_> {
    fn check_shape(&self, what: &'static str, expected: &[usize], got: &[usize]) -> Result<(), StoreError> {
        if expected != got {
            return Err(StoreError::Shape {
                path: self.lock.path().to_path_buf(),
                what,
                expected: expected.to_vec(),
                got: got.to_vec(),
            });
        }
        Ok(())
    }

    /// Write the products of one frequency (frequency-diagonal layouts only).
    /// `beam_svd` is `[svd_len, Npol, L+1]`, `invbeam` `[Npol, L+1, svd_len]`,
    /// `ut` `[svd_len, ntel]` and `sv` `[svd_len]`.
    pub fn write_frequency(
        &mut self,
        fi: usize,
        beam_svd: ArrayView3<c64>,
        invbeam: Option<ArrayView3<c64>>,
        ut: ArrayView2<c64>,
        sv: ArrayView1<f64>,
    ) -> Result<(), StoreError> {
        let store = self.store;
        if store.layout == Layout::FullFrequency {
            return Err(StoreError::Unsupported { what: "svd file" });
        }
        store.check_freq(fi)?;
        let d = &store.dims;
        let s = store.svd_len;
        self.check_shape("beam_svd", &[s, d.npol, d.lside()], beam_svd.shape())?;
        self.check_shape("beam_ut", &[s, d.ntel()], ut.shape())?;
        self.check_shape("beam_singularvalues", &[s], sv.shape())?;
        if let Some(invbeam) = invbeam.as_ref() {
            self.check_shape("invbeam_svd", &[d.npol, d.lside(), s], invbeam.shape())?;
        }

        let _session = fits_session();
        let mut fptr = fits_edit(self.lock.path())?;
        let mut write = |kind: ArtifactKind, data: Vec<f64>| -> Result<(), StoreError> {
            let hdu = fits_open_hdu(&mut fptr, artifact_hdu(kind))?;
            let n = data.len();
            if n > 0 {
                fits_write_section(&mut fptr, &hdu, fi * n, (fi + 1) * n, &data)?;
            }
            Ok(())
        };
        write(ArtifactKind::BeamSvd, complex_to_f64(&beam_svd))?;
        write(ArtifactKind::BeamUt, complex_to_f64(&ut))?;
        write(ArtifactKind::SingularValues, sv.iter().copied().collect())?;
        if let (true, Some(invbeam)) = (self.with_invbeam, invbeam) {
            write(ArtifactKind::InvbeamSvd, complex_to_f64(&invbeam))?;
        }
        Ok(())
    }

    /// Write every product at once (full-frequency layout only).
    /// `beam_svd` is `[F svd_len, F, Npol, L+1]`, `invbeam`
    /// `[F, Npol, L+1, F svd_len]`, `ut` `[F svd_len, F ntel]` and `sv`
    /// `[F svd_len]`.
    pub fn write_full(
        &mut self,
        beam_svd: ArrayView4<c64>,
        invbeam: Option<ArrayView4<c64>>,
        ut: ArrayView2<c64>,
        sv: ArrayView1<f64>,
    ) -> Result<(), StoreError> {
        let store = self.store;
        if store.layout != Layout::FullFrequency {
            return Err(StoreError::Unsupported { what: "svd file" });
        }
        let d = &store.dims;
        let (f, fs) = (d.nfreq, d.nfreq * store.svd_len);
        self.check_shape("beam_svd", &[fs, f, d.npol, d.lside()], beam_svd.shape())?;
        self.check_shape("beam_ut", &[fs, f * d.ntel()], ut.shape())?;
        self.check_shape("beam_singularvalues", &[fs], sv.shape())?;
        if let Some(invbeam) = invbeam.as_ref() {
            self.check_shape("invbeam_svd", &[f, d.npol, d.lside(), fs], invbeam.shape())?;
        }

        let _session = fits_session();
        let mut fptr = fits_edit(self.lock.path())?;
        let mut write = |kind: ArtifactKind, data: Vec<f64>| -> Result<(), StoreError> {
            let hdu = fits_open_hdu(&mut fptr, artifact_hdu(kind))?;
            if !data.is_empty() {
                fits_write_image(&mut fptr, &hdu, &data)?;
            }
            Ok(())
        };
        write(ArtifactKind::BeamSvd, complex_to_f64(&beam_svd))?;
        write(ArtifactKind::BeamUt, complex_to_f64(&ut))?;
        write(ArtifactKind::SingularValues, sv.iter().copied().collect())?;
        if let (true, Some(invbeam)) = (self.with_invbeam, invbeam) {
            write(ArtifactKind::InvbeamSvd, complex_to_f64(&invbeam))?;
        }
        Ok(())
    }

    /// Record whether the fallback pseudo-inverse was needed, and move the
    /// file into place.
    pub fn finish(self, used_fallback_pinv: bool) -> Result<(), StoreError> {
        {
            let _session = fits_session();
            let mut fptr = fits_edit(self.lock.path())?;
            let hdu = fits_open_hdu(&mut fptr, 0)?;
            fits_write_key(&mut fptr, &hdu, "PINV2", i64::from(used_fallback_pinv))?;
        }
        self.lock.commit()?;
        self.store.cache().invalidate_mode(self.mi);
        Ok(())
    }
}
