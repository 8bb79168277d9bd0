// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use ndarray::prelude::*;

use super::*;

#[test]
fn test_split_m() {
    assert_eq!(split_m(10, 3), vec![0..4, 4..7, 7..10]);
    assert_eq!(split_m(2, 4), vec![0..1, 1..2, 2..2, 2..2]);
    assert_eq!(split_m(0, 2), vec![0..0, 0..0]);
    assert_eq!(split_m(5, 1), vec![0..5]);
}

#[test]
fn test_single_process_collectives() {
    let t = SingleProcess;
    assert!(t.is_coordinator());
    assert_eq!(t.split_local(7), 0..7);
    assert_eq!(t.partition_list(&[3, 5, 9]), vec![3, 5, 9]);
    assert_eq!(t.all_gather(2.5).unwrap(), vec![2.5]);
    assert_eq!(t.broadcast(Some("x".to_string())).unwrap(), "x");
    assert_eq!(t.all_reduce_max(-1.0).unwrap(), -1.0);
    t.barrier().unwrap();

    let (pending, local) = t.distribute_pending(vec![0, 1, 2, 3], |i| i % 2 == 0).unwrap();
    assert_eq!(pending, vec![1, 3]);
    assert_eq!(local, vec![1, 3]);
}

#[test]
fn test_threaded_collectives() {
    let results = run_threaded(3, |t| {
        let gathered = t.all_gather(t.rank() * 10).unwrap();
        let max = t.all_reduce_max(t.rank() as f64).unwrap();
        let root = if t.is_coordinator() { Some(vec![1, 2, 3]) } else { None };
        let bcast = t.broadcast(root).unwrap();
        let to_each: Vec<(usize, usize)> = (0..t.size()).map(|j| (t.rank(), j)).collect();
        let received = t.all_to_all(to_each).unwrap();
        t.barrier().unwrap();
        (gathered, max, bcast, received)
    })
    .unwrap();

    assert_eq!(results.len(), 3);
    for (rank, result) in results.into_iter().enumerate() {
        let (gathered, max, bcast, received) = result.unwrap();
        assert_eq!(gathered, vec![0, 10, 20]);
        assert_eq!(max, 2.0);
        assert_eq!(bcast, vec![1, 2, 3]);
        assert_eq!(received, (0..3).map(|from| (from, rank)).collect::<Vec<_>>());
    }
}

#[test]
fn test_threaded_distribute_pending() {
    let results = run_threaded(2, |t| {
        // Only the coordinator's view of what's done counts.
        let rank = t.rank();
        t.distribute_pending((0..5).collect(), |i| rank == 0 && i == 2)
            .unwrap()
    })
    .unwrap();
    let (pending0, local0) = results[0].clone().unwrap();
    let (pending1, local1) = results[1].clone().unwrap();
    assert_eq!(pending0, vec![0, 1, 3, 4]);
    assert_eq!(pending1, pending0);
    assert_eq!(local0, vec![0, 1]);
    assert_eq!(local1, vec![3, 4]);
}

#[test]
fn test_transpose_blocks() {
    // Global array [rows = 5, cols = 4]; rows are spread over 2 workers as
    // 3 + 2, and element (r, c) is 10 r + c.
    let results = run_threaded(2, |t| {
        let rows = if t.rank() == 0 { 0..3 } else { 3..5 };
        let local = Array2::from_shape_fn((rows.len(), 4), |(r, c)| (10 * (r + rows.start) + c) as i32);
        transpose_blocks(t, local.view()).unwrap()
    })
    .unwrap();

    let expected = Array2::from_shape_fn((5, 4), |(r, c)| (10 * r + c) as i32);
    let first = results[0].as_ref().unwrap();
    let second = results[1].as_ref().unwrap();
    assert_eq!(first, &expected.slice(s![.., 0..2]));
    assert_eq!(second, &expected.slice(s![.., 2..4]));

    // A single worker keeps everything.
    let local = Array3::<f64>::ones((2, 3, 4));
    assert_eq!(transpose_blocks(&SingleProcess, local.view()).unwrap(), local);
}

#[test]
fn test_dead_worker_is_a_disconnection() {
    let results = run_threaded(2, |t| {
        if t.rank() == 1 {
            panic!("worker 1 dies");
        }
        t.barrier()
    })
    .unwrap();
    assert!(results[1].is_none());
    assert!(matches!(
        results[0],
        Some(Err(TopologyError::Disconnected { rank: 0, peer: 1 }))
    ));
}

#[test]
fn test_empty_world() {
    assert!(matches!(ThreadTopology::world(0), Err(TopologyError::NoWorkers)));
}
