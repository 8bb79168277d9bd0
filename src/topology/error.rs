// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from collective operations between workers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Worker {rank} lost its connection to worker {peer}; did that worker die?")]
    Disconnected { rank: usize, peer: usize },

    #[error("Worker {rank} received an unexpected message type from worker {peer}")]
    UnexpectedPayload { rank: usize, peer: usize },

    #[error("Worker {rank} expected {expected} outgoing messages, but got {got}")]
    PayloadCount {
        rank: usize,
        expected: usize,
        got: usize,
    },

    #[error("A world needs at least one worker")]
    NoWorkers,
}
