// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An in-process world where each worker is a thread.
//!
//! Every ordered pair of workers has its own channel, so messages between two
//! workers arrive in the order they were sent, and a worker that dies is seen
//! by its peers as a disconnection rather than a hang.

use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, trace};
use scopeguard::defer_on_unwind;

use super::{Payload, Topology, TopologyError};

/// One worker of a threaded world.
pub struct ThreadTopology {
    rank: usize,
    /// `senders[j]` delivers to worker `j`.
    senders: Vec<Sender<Payload>>,
    /// `receivers[j]` holds what worker `j` sent here.
    receivers: Vec<Receiver<Payload>>,
}

impl ThreadTopology {
    /// Create the workers of a world of size `n`.
    pub fn world(n: usize) -> Result<Vec<ThreadTopology>, TopologyError> {
        if n == 0 {
            return Err(TopologyError::NoWorkers);
        }
        // channels[from][to]
        let channels: Vec<Vec<(Sender<Payload>, Receiver<Payload>)>> = (0..n)
            .map(|_| (0..n).map(|_| unbounded()).collect())
            .collect();
        let workers = (0..n)
            .map(|rank| ThreadTopology {
                rank,
                senders: (0..n).map(|to| channels[rank][to].0.clone()).collect(),
                receivers: (0..n).map(|from| channels[from][rank].1.clone()).collect(),
            })
            .collect();
        Ok(workers)
    }
}

impl std::fmt::Debug for ThreadTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadTopology")
            .field("rank", &self.rank)
            .field("size", &self.senders.len())
            .finish()
    }
}

impl Topology for ThreadTopology {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn exchange(&self, payloads: Vec<Payload>) -> Result<Vec<Payload>, TopologyError> {
        let rank = self.rank;
        if payloads.len() != self.size() {
            return Err(TopologyError::PayloadCount {
                rank,
                expected: self.size(),
                got: payloads.len(),
            });
        }
        for (peer, (tx, payload)) in self.senders.iter().zip(payloads).enumerate() {
            tx.send(payload)
                .map_err(|_| TopologyError::Disconnected { rank, peer })?;
        }
        self.receivers
            .iter()
            .enumerate()
            .map(|(peer, rx)| {
                rx.recv()
                    .map_err(|_| TopologyError::Disconnected { rank, peer })
            })
            .collect()
    }
}

/// Run `f` on every worker of a fresh `n`-worker world, one thread each.
/// Results are in rank order. A worker that panics yields `None`.
pub fn run_threaded<F, R>(n: usize, f: F) -> Result<Vec<Option<R>>, TopologyError>
where
    F: Fn(&ThreadTopology) -> R + Sync,
    R: Send,
{
    let workers = ThreadTopology::world(n)?;
    debug!("Starting a world of {n} worker threads");
    let panicked = AtomicCell::new(false);
    let results = thread::scope(|scope| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| {
                let f = &f;
                let panicked = &panicked;
                thread::Builder::new()
                    .name(format!("worker {}", worker.rank))
                    .spawn_scoped(scope, move || {
                        defer_on_unwind! { panicked.store(true); }
                        let result = f(&worker);
                        trace!("Worker {} finished", worker.rank);
                        // Dropping the worker here closes its channels.
                        drop(worker);
                        result
                    })
                    .expect("OS can create threads")
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().ok())
            .collect::<Vec<_>>()
    });
    if panicked.load() {
        debug!("At least one worker thread panicked");
    }
    Ok(results)
}
