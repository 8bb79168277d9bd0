// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with telescope models.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelescopeError {
    #[error("Got {baselines} baseline indices but {freqs} frequency indices; these must be paired")]
    UnpairedIndices { baselines: usize, freqs: usize },

    #[error("Got baseline index {got}, but the biggest baseline index is {max}")]
    BadBaselineIndex { got: usize, max: usize },

    #[error("Got frequency index {got}, but the biggest frequency index is {max}")]
    BadFrequencyIndex { got: usize, max: usize },

    #[error("Got mode index {got}, but the biggest mode index is {max}")]
    BadModeIndex { got: usize, max: usize },

    #[error("The telescope descriptor lists {got} {what}, but it should have {expected}")]
    DescriptorLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("The telescope descriptor has a non-positive noise power ({value}) at frequency index {fi}, baseline index {bi}")]
    NonPositiveNoise { fi: usize, bi: usize, value: f64 },

    #[error("The telescope must have at least one {0}")]
    Empty(&'static str),
}
