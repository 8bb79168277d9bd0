// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! How cooperating workers talk to each other.
//!
//! Workers share no mutable state. The only coordination is through the
//! collectives of [`Topology`] (and the helpers of [`TopologyExt`] built on
//! top of it): every worker must call the same collectives in the same order.
//! Worker 0 is the "coordinator".

mod error;
mod thread;
#[cfg(test)]
mod tests;

pub use error::TopologyError;
pub use thread::{run_threaded, ThreadTopology};

use std::{any::Any, ops::Range};

use ndarray::{concatenate, prelude::*, RemoveAxis, Slice};

/// A message between workers.
pub type Payload = Box<dyn Any + Send>;

/// The process topology of a generation run.
pub trait Topology: Send + Sync {
    /// This worker's index, in `0..size`.
    fn rank(&self) -> usize;

    /// The number of workers.
    fn size(&self) -> usize;

    /// Send `payloads[j]` to worker `j`, and return what every worker sent to
    /// this one (indexed by sender). Every worker must call this together.
    fn exchange(&self, payloads: Vec<Payload>) -> Result<Vec<Payload>, TopologyError>;

    /// Block until every worker has arrived.
    fn barrier(&self) -> Result<(), TopologyError> {
        let payloads = (0..self.size()).map(|_| Box::new(()) as Payload).collect();
        self.exchange(payloads)?;
        Ok(())
    }
}

/// The only worker of a one-process world.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Topology for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange(&self, payloads: Vec<Payload>) -> Result<Vec<Payload>, TopologyError> {
        if payloads.len() != 1 {
            return Err(TopologyError::PayloadCount {
                rank: 0,
                expected: 1,
                got: payloads.len(),
            });
        }
        Ok(payloads)
    }

    fn barrier(&self) -> Result<(), TopologyError> {
        Ok(())
    }
}

/// Contiguous split of `n` items over `size` workers. The first `n % size`
/// workers get one extra item.
pub fn split_m(n: usize, size: usize) -> Vec<Range<usize>> {
    let size = size.max(1);
    let base = n / size;
    let rem = n % size;
    let mut start = 0;
    (0..size)
        .map(|rank| {
            let count = base + usize::from(rank < rem);
            let range = start..start + count;
            start += count;
            range
        })
        .collect()
}

fn downcast<T: 'static>(payload: Payload, rank: usize, peer: usize) -> Result<T, TopologyError> {
    payload
        .downcast::<T>()
        .map(|b| *b)
        .map_err(|_| TopologyError::UnexpectedPayload { rank, peer })
}

/// Collectives built from [`Topology::exchange`].
pub trait TopologyExt: Topology {
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// The items of `0..n` this worker is responsible for.
    fn split_local(&self, n: usize) -> Range<usize> {
        split_m(n, self.size())[self.rank()].clone()
    }

    /// This worker's contiguous share of `list`.
    fn partition_list<T: Clone>(&self, list: &[T]) -> Vec<T> {
        list[self.split_local(list.len())].to_vec()
    }

    /// Send each worker `values[j]`; get back what each worker sent here.
    fn all_to_all<T: Send + 'static>(&self, values: Vec<T>) -> Result<Vec<T>, TopologyError> {
        let payloads = values.into_iter().map(|v| Box::new(v) as Payload).collect();
        let rank = self.rank();
        self.exchange(payloads)?
            .into_iter()
            .enumerate()
            .map(|(peer, p)| downcast(p, rank, peer))
            .collect()
    }

    /// Every worker's `value`, in rank order.
    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>, TopologyError> {
        let values = vec![value; self.size()];
        self.all_to_all(values)
    }

    /// The coordinator's `value` on every worker. Only the coordinator's
    /// `value` needs to be `Some`.
    fn broadcast<T: Clone + Send + 'static>(&self, value: Option<T>) -> Result<T, TopologyError> {
        let rank = self.rank();
        let size = self.size();
        let payloads = if rank == 0 {
            let value = value.ok_or(TopologyError::UnexpectedPayload { rank, peer: rank })?;
            (0..size)
                .map(|_| Box::new(Some(value.clone())) as Payload)
                .collect()
        } else {
            (0..size).map(|_| Box::new(None::<T>) as Payload).collect()
        };
        let mut received = self.exchange(payloads)?;
        let from_root = received.swap_remove(0);
        downcast::<Option<T>>(from_root, rank, 0)?
            .ok_or(TopologyError::UnexpectedPayload { rank, peer: 0 })
    }

    /// The largest `value` over every worker.
    fn all_reduce_max(&self, value: f64) -> Result<f64, TopologyError> {
        Ok(self
            .all_gather(value)?
            .into_iter()
            .fold(f64::NEG_INFINITY, f64::max))
    }

    /// The coordinator drops every candidate for which `done` holds, the
    /// survivors are broadcast, and each worker gets its contiguous share.
    /// Returns (every pending item, this worker's share).
    fn distribute_pending<F>(
        &self,
        candidates: Vec<usize>,
        done: F,
    ) -> Result<(Vec<usize>, Vec<usize>), TopologyError>
    where
        F: Fn(usize) -> bool,
    {
        let pending = if self.is_coordinator() {
            Some(candidates.into_iter().filter(|&i| !done(i)).collect::<Vec<_>>())
        } else {
            None
        };
        let pending = self.broadcast(pending)?;
        let local = self.partition_list(&pending);
        Ok((pending, local))
    }
}

impl<T: Topology + ?Sized> TopologyExt for T {}

/// Redistribute a block-distributed array.
///
/// Each worker holds `local`, its own rows (axis 0) of a global array whose
/// axis 1 has length `ncols`. Afterwards each worker holds every row, but only
/// its contiguous share of axis 1 (as given by [`split_m`]); rows are in rank
/// order.
pub fn transpose_blocks<T, A, D>(
    topology: &T,
    local: ArrayView<A, D>,
) -> Result<Array<A, D>, TopologyError>
where
    T: Topology + ?Sized,
    A: Clone + Send + 'static,
    D: Dimension + RemoveAxis + 'static,
{
    let ncols = local.len_of(Axis(1));
    let outgoing: Vec<Array<A, D>> = split_m(ncols, topology.size())
        .into_iter()
        .map(|r| {
            local
                .slice_axis(Axis(1), Slice::from(r.start..r.end))
                .to_owned()
        })
        .collect();
    let incoming = topology.all_to_all(outgoing)?;
    let views: Vec<ArrayView<A, D>> = incoming.iter().map(|a| a.view()).collect();
    // Every piece has the same shape apart from axis 0, so this can't fail.
    concatenate(Axis(0), &views).map_err(|_| TopologyError::UnexpectedPayload {
        rank: topology.rank(),
        peer: topology.rank(),
    })
}
