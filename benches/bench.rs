// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use criterion::*;

use beamtransfer::{
    compress::{CompressParams, CompressionPolicy, FullFrequency, ThreeStage},
    constants::DEFAULT_POLSVCUT,
    telescope::{beam_m_from_model, SyntheticParams},
    SyntheticTelescope, TelescopeModel,
};

fn telescope() -> SyntheticTelescope {
    SyntheticTelescope::new(SyntheticParams {
        nfreq: 8,
        mmax: 10,
        lmax: 20,
        npairs: 12,
        num_pol_sky: 3,
        seed: 3,
        ..Default::default()
    })
    .unwrap()
}

fn compression(c: &mut Criterion) {
    let tel = telescope();
    let beam = beam_m_from_model(&tel, 5).unwrap();
    let params = CompressParams {
        polsvcut: DEFAULT_POLSVCUT,
        with_invbeam: true,
    };

    let mut group = c.benchmark_group("compress one m index");
    group.sample_size(20);
    group.bench_function("three stage", |b| {
        b.iter(|| {
            ThreeStage
                .compress_mode(5, beam.view(), tel.descriptor(), &params)
                .unwrap()
        })
    });
    group.bench_function("full frequency", |b| {
        b.iter(|| {
            FullFrequency
                .compress_mode(5, beam.view(), tel.descriptor(), &params)
                .unwrap()
        })
    });
    group.finish();
}

fn raw_operator(c: &mut Criterion) {
    let tel = telescope();
    c.bench_function("raw operator of one m index", |b| {
        b.iter(|| beam_m_from_model(&tel, 5).unwrap())
    });
}

criterion_group!(benches, compression, raw_operator);
criterion_main!(benches);
