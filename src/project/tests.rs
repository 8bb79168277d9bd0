// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use ndarray::prelude::*;
use tempfile::TempDir;

use super::*;
use crate::{
    c64,
    constants::{DIRTY_NORM_THRESHOLD, INVBEAM_RCOND},
    generate::{generate, GenerateOptions},
    linalg::{adjoint, pinv_rcond},
    store::StoreError,
    telescope::{beam_m_from_model, SyntheticParams, SyntheticTelescope, TelescopeModel},
    tests::{max_abs_diff, random_matrix},
    topology::SingleProcess,
};

fn params() -> SyntheticParams {
    SyntheticParams {
        nfreq: 2,
        mmax: 2,
        lmax: 3,
        npairs: 3,
        num_pol_sky: 2,
        seed: 5,
        ..Default::default()
    }
}

fn generated_with(
    policy: Arc<dyn CompressionPolicy>,
    options: &GenerateOptions,
) -> (TempDir, SyntheticTelescope, BeamTransfer) {
    let dir = tempfile::tempdir().unwrap();
    let tel = SyntheticTelescope::new(params()).unwrap();
    let bt = BeamTransfer::new(dir.path(), tel.descriptor().clone(), policy).unwrap();
    generate(&bt, &tel, &SingleProcess, options).unwrap();
    (dir, tel, bt)
}

fn generated(policy: Arc<dyn CompressionPolicy>) -> (TempDir, SyntheticTelescope, BeamTransfer) {
    generated_with(policy, &GenerateOptions::default())
}

fn random_sky(bt: &BeamTransfer, seed: u64) -> Array3<c64> {
    let d = bt.dims();
    random_matrix(d.nfreq, d.nsky(), seed)
        .into_shape_with_order((d.nfreq, d.npol, d.lside()))
        .unwrap()
}

/// A Hermitian, positive semi-definite sky covariance.
fn random_sky_covariance(bt: &BeamTransfer, seed: u64) -> Array5<c64> {
    let d = bt.dims();
    let (npol, nfreq) = (d.npol, d.nfreq);
    let mut cov = Array5::zeros((npol, npol, d.lside(), nfreq, nfreq));
    for l in 0..d.lside() {
        let m = random_matrix(npol * nfreq, npol * nfreq, seed + l as u64);
        let a = m.dot(&adjoint(m.view()));
        for pi in 0..npol {
            for pj in 0..npol {
                for fi in 0..nfreq {
                    for fj in 0..nfreq {
                        cov[(pi, pj, l, fi, fj)] = a[(pi * nfreq + fi, pj * nfreq + fj)];
                    }
                }
            }
        }
    }
    cov
}

fn tel_block(beam: ArrayView5<c64>, fi: usize) -> Array2<c64> {
    let b = beam.index_axis(Axis(0), fi);
    let (nsign, npairs, npol, lside) = b.dim();
    b.to_shape((nsign * npairs, npol * lside)).unwrap().into_owned()
}

fn scale(a: &ArrayD<c64>) -> f64 {
    a.iter().map(|z| z.norm()).fold(0.0, f64::max).max(1.0)
}

#[test]
fn test_sky_to_telescope() {
    let (_dir, tel, bt) = generated(Arc::new(ThreeStage));
    let v = random_sky(&bt, 1);
    for mi in 0..=2 {
        let beam = beam_m_from_model(&tel, mi).unwrap();
        let t = bt.project_vector_sky_to_telescope(mi, v.view()).unwrap();
        for fi in 0..2 {
            let expected = tel_block(beam.view(), fi).dot(&v.index_axis(Axis(0), fi).to_shape(8).unwrap());
            assert!(max_abs_diff(&t.row(fi), &expected) < 1e-12);
        }
    }
}

#[test]
fn test_sky_svd_round_trip_is_a_projection() {
    for policy in [
        Arc::new(ThreeStage) as Arc<dyn CompressionPolicy>,
        Arc::new(FullFrequency),
    ] {
        let (_dir, _tel, bt) = generated(policy);
        let v = random_sky(&bt, 2);
        for mi in 0..=2 {
            let s = bt.project_vector_sky_to_svd(mi, v.view(), false).unwrap();
            assert_eq!(s.len(), bt.ndof(mi).unwrap());
            if s.is_empty() {
                continue;
            }
            let once = bt.project_vector_svd_to_sky(mi, s.view(), false, false).unwrap();
            let s2 = bt.project_vector_sky_to_svd(mi, once.view(), false).unwrap();
            let twice = bt.project_vector_svd_to_sky(mi, s2.view(), false, false).unwrap();
            let tol = 1e-8 * scale(&once.clone().into_dyn());
            assert!(max_abs_diff(&once, &twice) < tol, "{:?} m index {mi}", bt.layout());
            // The SVD coefficients survive the trip.
            assert!(max_abs_diff(&s, &s2) < 1e-8 * scale(&s.clone().into_dyn()));

            let adjoint = bt.project_vector_svd_to_sky(mi, s.view(), false, true).unwrap();
            assert!(max_abs_diff(&once, &adjoint) > 1e-3);
        }
    }
}

#[test]
fn test_telescope_to_svd_matches_sky_to_svd() {
    for policy in [
        Arc::new(ThreeStage) as Arc<dyn CompressionPolicy>,
        Arc::new(FullFrequency),
    ] {
        let (_dir, _tel, bt) = generated(policy);
        let v = random_sky(&bt, 3);
        for mi in 0..=2 {
            let t = bt.project_vector_sky_to_telescope(mi, v.view()).unwrap();
            let via_tel = bt.project_vector_telescope_to_svd(mi, t.view()).unwrap();
            let direct = bt.project_vector_sky_to_svd(mi, v.view(), false).unwrap();
            assert!(max_abs_diff(&via_tel, &direct) < 1e-9 * scale(&direct.clone().into_dyn()));
        }
    }
}

#[test]
fn test_svd_to_telescope() {
    let (_dir, _tel, bt) = generated(Arc::new(ThreeStage));
    let mi = 1;
    let (num, bounds) = match bt.svd_num(mi).unwrap() {
        LiveModes::PerFrequency { num, bounds } => (num, bounds),
        other => panic!("unexpected live modes {other:?}"),
    };
    let s = random_matrix(1, bounds[2], 4).into_shape_with_order(bounds[2]).unwrap();
    let t = bt.project_vector_svd_to_telescope(mi, s.view()).unwrap();
    assert_eq!(t.dim(), (2, bt.ntel()));
    for fi in 0..2 {
        let ut = bt.store().beam_ut_freq(mi, fi).unwrap();
        let ut = ut.slice(s![..num[fi], ..]);
        let noise = bt.descriptor().noise_power_tel(fi).mapv(c64::from);
        let expected = adjoint(ut).dot(&s.slice(s![bounds[fi]..bounds[fi + 1]])) * &noise;
        assert!(max_abs_diff(&t.row(fi), &expected) < 1e-12);
    }
}

#[test]
fn test_matrix_projections_agree() {
    for policy in [
        Arc::new(ThreeStage) as Arc<dyn CompressionPolicy>,
        Arc::new(FullFrequency),
    ] {
        let (_dir, _tel, bt) = generated(policy);
        let cov = random_sky_covariance(&bt, 10);
        for mi in 0..=2 {
            let ndof = bt.ndof(mi).unwrap();
            let direct = bt.project_matrix_sky_to_svd(mi, cov.view(), false).unwrap();
            assert_eq!(direct.dim(), (ndof, ndof));
            let tel = bt.project_matrix_sky_to_telescope(mi, cov.view(), false).unwrap();
            let via_tel = bt.project_matrix_telescope_to_svd(mi, tel.view()).unwrap();
            let tol = 1e-9 * scale(&direct.clone().into_dyn());
            assert!(max_abs_diff(&direct, &via_tel) < tol);
            // Still Hermitian.
            assert!(max_abs_diff(&direct, &adjoint(direct.view())) < tol);
        }
    }
}

#[test]
fn test_sky_matrix_sums_polarisation_pairs() {
    let (_dir, tel, bt) = generated(Arc::new(ThreeStage));
    let cov = random_sky_covariance(&bt, 20);
    let mi = 2;
    let beam = beam_m_from_model(&tel, mi).unwrap();
    let tel_cov = bt.project_matrix_sky_to_telescope(mi, cov.view(), false).unwrap();
    // Build B C B^H by hand with the sky covariance as a dense matrix.
    let (nfreq, ntel, nsky, lside) = (2, bt.ntel(), bt.nsky(), bt.dims().lside());
    let mut c = Array2::zeros((nfreq * nsky, nfreq * nsky));
    for ((pi, pj, l, fi, fj), &v) in cov.indexed_iter() {
        c[(fi * nsky + pi * lside + l, fj * nsky + pj * lside + l)] = v;
    }
    let mut b = Array2::zeros((nfreq * ntel, nfreq * nsky));
    for fi in 0..nfreq {
        b.slice_mut(s![fi * ntel..(fi + 1) * ntel, fi * nsky..(fi + 1) * nsky])
            .assign(&tel_block(beam.view(), fi));
    }
    let expected = b.dot(&c).dot(&adjoint(b.view()));
    let got = tel_cov.into_shape_with_order((nfreq * ntel, nfreq * ntel)).unwrap();
    assert!(max_abs_diff(&got, &expected) < 1e-9 * scale(&expected.clone().into_dyn()));
}

#[test]
fn test_temponly() {
    let (_dir, _tel, bt) = generated(Arc::new(ThreeStage));
    let v = random_sky(&bt, 5);
    let mut t_only = v.clone();
    t_only.slice_mut(s![.., 1.., ..]).fill(c64::new(0.0, 0.0));
    let cov = random_sky_covariance(&bt, 30);
    let mut cov_t = Array5::zeros(cov.dim());
    cov_t
        .slice_mut(s![0, 0, .., .., ..])
        .assign(&cov.slice(s![0, 0, .., .., ..]));

    for mi in 0..=2 {
        let a = bt.project_vector_sky_to_svd(mi, v.view(), true).unwrap();
        let b = bt.project_vector_sky_to_svd(mi, t_only.view(), false).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-12);

        let a = bt.project_matrix_sky_to_svd(mi, cov.view(), true).unwrap();
        let b = bt.project_matrix_sky_to_svd(mi, cov_t.view(), false).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-9 * scale(&b.clone().into_dyn()));

        let s = bt.project_vector_sky_to_svd(mi, v.view(), false).unwrap();
        let sky = bt.project_vector_svd_to_sky(mi, s.view(), true, false).unwrap();
        assert!(sky.slice(s![.., 1.., ..]).iter().all(|z| z.norm() == 0.0));
    }
}

#[test]
fn test_diagonal_telescope_matrix() {
    for policy in [
        Arc::new(ThreeStage) as Arc<dyn CompressionPolicy>,
        Arc::new(FullFrequency),
    ] {
        let (_dir, _tel, bt) = generated(policy);
        let (nfreq, ntel) = (bt.nfreq(), bt.ntel());
        let d = Array2::from_shape_fn((nfreq, ntel), |(fi, ti)| {
            c64::new(1.0 + (fi * ntel + ti) as f64, 0.0)
        });
        let mut full = Array4::zeros((nfreq, ntel, nfreq, ntel));
        for ((fi, ti), &v) in d.indexed_iter() {
            full[(fi, ti, fi, ti)] = v;
        }
        for mi in 0..=2 {
            let a = bt.project_matrix_diagonal_telescope_to_svd(mi, d.view()).unwrap();
            let b = bt.project_matrix_telescope_to_svd(mi, full.view()).unwrap();
            assert!(max_abs_diff(&a, &b) < 1e-10 * scale(&b.clone().into_dyn()));
        }
    }
}

#[test]
fn test_invbeam_and_telescope_to_sky() {
    let (_dir, tel, bt) = generated(Arc::new(ThreeStage));
    let mi = 2;
    let beam = beam_m_from_model(&tel, mi).unwrap();
    let inv = bt.invbeam_m(mi).unwrap();
    assert_eq!(inv.dim(), (2, 2, 4, bt.ntel()));
    for fi in 0..2 {
        let b = tel_block(beam.view(), fi);
        let x = inv.index_axis(Axis(0), fi);
        let x = x.to_shape((bt.nsky(), bt.ntel())).unwrap();
        // A generalised inverse.
        let tol = 1e-8 * scale(&b.clone().into_dyn());
        assert!(max_abs_diff(&b.dot(&x).dot(&b), &b) < tol);
    }

    let v = random_sky(&bt, 6);
    let t = bt.project_vector_sky_to_telescope(mi, v.view()).unwrap();
    let once = bt.project_vector_telescope_to_sky(mi, t.view()).unwrap();
    let t2 = bt.project_vector_sky_to_telescope(mi, once.view()).unwrap();
    assert!(max_abs_diff(&t, &t2) < 1e-8 * scale(&t.clone().into_dyn()));
}

#[test]
fn test_backward_dirty() {
    let (_dir, tel, bt) = generated(Arc::new(ThreeStage));
    let t = random_matrix(bt.nfreq(), bt.ntel(), 7);
    for mi in 0..=2 {
        let beam = beam_m_from_model(&tel, mi).unwrap();
        let dirty = bt.project_vector_backward_dirty(mi, t.view()).unwrap();
        assert!(dirty.iter().all(|z| z.is_finite()));
        for fi in 0..2 {
            let b = tel_block(beam.view(), fi);
            let normalised: Array1<c64> = b
                .outer_iter()
                .zip(t.row(fi))
                .map(|(row, &v)| {
                    let norm: f64 = row.iter().map(|z| z.norm_sqr()).sum();
                    if norm < DIRTY_NORM_THRESHOLD {
                        c64::new(0.0, 0.0)
                    } else {
                        v / norm
                    }
                })
                .collect();
            let expected = adjoint(b.view()).dot(&normalised);
            let got = dirty.index_axis(Axis(0), fi);
            let got = got.to_shape(bt.nsky()).unwrap();
            assert!(max_abs_diff(&got, &expected) < 1e-12);
        }
    }
    // m = 0 has no response in its second sign; those entries are dropped,
    // not divided by zero.
    let mut t0 = t.clone();
    t0.slice_mut(s![.., bt.ntel() / 2..]).fill(c64::new(1e6, 0.0));
    let a = bt.project_vector_backward_dirty(0, t.view()).unwrap();
    let b = bt.project_vector_backward_dirty(0, t0.view()).unwrap();
    assert!(max_abs_diff(&a, &b) < 1e-12);
}

#[test]
fn test_identity_projections() {
    let (_dir, _tel, bt) = generated(Arc::new(Identity));
    let (nfreq, ntel) = (bt.nfreq(), bt.ntel());
    assert_eq!(bt.svcut(), 0.0);
    assert_eq!(bt.ndofmax(), nfreq * ntel);
    let mi = 1;
    assert_eq!(bt.svd_num(mi).unwrap(), LiveModes::All(nfreq * ntel));
    assert_eq!(bt.ndof(mi).unwrap(), nfreq * ntel);
    assert_eq!(bt.svd_freq_iter(mi).unwrap(), vec![0, 1]);

    let v = random_sky(&bt, 8);
    let t = bt.project_vector_sky_to_telescope(mi, v.view()).unwrap();
    let s = bt.project_vector_sky_to_svd(mi, v.view(), false).unwrap();
    let flat: Array1<c64> = t.iter().copied().collect();
    assert!(max_abs_diff(&s, &flat) < 1e-15);

    let s = bt.project_vector_telescope_to_svd(mi, t.view()).unwrap();
    assert!(max_abs_diff(&s, &flat) < 1e-15);
    let back = bt.project_vector_svd_to_telescope(mi, s.view()).unwrap();
    assert!(max_abs_diff(&back, &t) < 1e-15);

    let sky = bt.project_vector_svd_to_sky(mi, s.view(), false, false).unwrap();
    let expected = bt.project_vector_telescope_to_sky(mi, t.view()).unwrap();
    assert!(max_abs_diff(&sky, &expected) < 1e-15);

    let d = random_matrix(nfreq, ntel, 9);
    let m = bt.project_matrix_diagonal_telescope_to_svd(mi, d.view()).unwrap();
    let expected = Array2::from_diag(&d.iter().copied().collect::<Array1<c64>>());
    assert!(max_abs_diff(&m, &expected) < 1e-15);

    let full = random_matrix(nfreq * ntel, nfreq * ntel, 10);
    let tel_mat = full.to_shape((nfreq, ntel, nfreq, ntel)).unwrap();
    let m = bt.project_matrix_telescope_to_svd(mi, tel_mat.view()).unwrap();
    assert!(max_abs_diff(&m, &full) < 1e-15);

    let cov = random_sky_covariance(&bt, 11);
    let m = bt.project_matrix_sky_to_svd(mi, cov.view(), false).unwrap();
    let expected = bt
        .project_matrix_sky_to_telescope(mi, cov.view(), false)
        .unwrap()
        .into_shape_with_order((nfreq * ntel, nfreq * ntel))
        .unwrap();
    assert!(max_abs_diff(&m, &expected) < 1e-15);
}

#[test]
fn test_identity_inverse_is_unweighted() {
    let (_dir, tel, bt) = generated(Arc::new(Identity));
    let beam = beam_m_from_model(&tel, 1).unwrap();
    let inv = bt.invbeam_m(1).unwrap();
    for fi in 0..2 {
        let b = tel_block(beam.view(), fi);
        let expected = pinv_rcond(b.view(), INVBEAM_RCOND, "test").unwrap();
        let x = inv.index_axis(Axis(0), fi);
        let x = x.to_shape((bt.nsky(), bt.ntel())).unwrap();
        assert!(max_abs_diff(&x, &expected) < 1e-8);
    }
}

#[test]
fn test_cutoff_is_monotonic() {
    let (dir, _tel, bt) = generated(Arc::new(ThreeStage));
    let loose = BeamTransfer::open(dir.path()).unwrap().with_svcut(0.0);
    let strict = BeamTransfer::open(dir.path()).unwrap().with_svcut(0.5);
    for mi in 0..=2 {
        let n = bt.ndof(mi).unwrap();
        assert!(loose.ndof(mi).unwrap() >= n);
        assert!(strict.ndof(mi).unwrap() <= n);
        assert!(n <= bt.ndofmax());
        for fi in bt.svd_freq_iter(mi).unwrap() {
            assert!(fi < bt.nfreq());
        }
    }
    let all = bt.svd_all().unwrap();
    assert_eq!(all.shape(), &[3, 2, bt.svd_len()]);
}

#[test]
fn test_open_uses_the_stored_variant() {
    let (dir, _tel, bt) = generated(Arc::new(FullFrequency));
    let opened = BeamTransfer::open(dir.path()).unwrap();
    assert_eq!(opened.layout(), Layout::FullFrequency);
    assert_eq!(opened.policy().variant(), SvdVariant::FullFrequency);
    for mi in 0..=2 {
        assert_eq!(opened.svd_num(mi).unwrap(), bt.svd_num(mi).unwrap());
        assert!(matches!(opened.svd_num(mi).unwrap(), LiveModes::Global(_)));
    }
    // Full-frequency operators can't be read one frequency at a time.
    assert!(matches!(
        opened.store().beam_svd_freq(1, 0),
        Err(StoreError::Unsupported { .. })
    ));
}

#[test]
fn test_bad_input() {
    let (_dir, _tel, bt) = generated(Arc::new(ThreeStage));
    let wrong = Array3::zeros((2, 1, 4));
    assert!(matches!(
        bt.project_vector_sky_to_svd(0, wrong.view(), false),
        Err(ProjectionError::InvalidInput { .. })
    ));
    let s = Array1::zeros(bt.ndof(1).unwrap() + 1);
    assert!(matches!(
        bt.project_vector_svd_to_sky(1, s.view(), false, false),
        Err(ProjectionError::InvalidInput { .. })
    ));
    let t = Array2::zeros((2, bt.ntel()));
    assert!(matches!(
        bt.project_vector_telescope_to_svd(3, t.view()),
        Err(ProjectionError::BadModeIndex { got: 3, max: 2 })
    ));
    let m = Array4::zeros((2, bt.ntel(), 1, bt.ntel()));
    assert!(matches!(
        bt.project_matrix_telescope_to_svd(0, m.view()),
        Err(ProjectionError::InvalidInput { .. })
    ));
}

#[test]
fn test_missing_data() {
    let dir = tempfile::tempdir().unwrap();
    let tel = SyntheticTelescope::new(params()).unwrap();
    let bt = BeamTransfer::new(dir.path(), tel.descriptor().clone(), Arc::new(ThreeStage)).unwrap();
    assert!(matches!(
        bt.ndof(0),
        Err(ProjectionError::Store(StoreError::Missing { .. }))
    ));
    assert!(matches!(
        BeamTransfer::open(dir.path()),
        Err(ProjectionError::Store(StoreError::Missing { .. }))
    ));
}

#[test]
fn test_without_invbeam_only_the_adjoint_works() {
    let options = GenerateOptions {
        skip_svd_inv: true,
        ..Default::default()
    };
    let (_dir, _tel, bt) = generated_with(Arc::new(ThreeStage), &options);
    let v = random_sky(&bt, 12);
    let s = bt.project_vector_sky_to_svd(1, v.view(), false).unwrap();
    assert!(matches!(
        bt.project_vector_svd_to_sky(1, s.view(), false, false),
        Err(ProjectionError::Store(StoreError::MissingHdu { .. }))
    ));
    assert!(bt.project_vector_svd_to_sky(1, s.view(), false, true).is_ok());
}
