// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Integration tests.
//!
//! Some help for laying out these tests was taken from:
//! https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod generate;
mod inspect;
mod no_stderr;

use std::{
    fs,
    path::{Path, PathBuf},
    process::Output,
    str::from_utf8,
};

use assert_cmd::{output::OutputError, Command};
use indoc::formatdoc;

fn beamtransfer_bin() -> Command {
    Command::cargo_bin("beamtransfer").unwrap()
}

fn get_cmd_output(result: Result<Output, OutputError>) -> (String, String) {
    let output = match result {
        Ok(o) => o,
        Err(o) => o.as_output().unwrap().clone(),
    };
    (
        from_utf8(&output.stdout).unwrap().to_string(),
        from_utf8(&output.stderr).unwrap().to_string(),
    )
}

/// Write a small config into `tmp_dir`, generating into `tmp_dir/bt`.
/// `extra` is appended to the top-level keys.
fn write_config(tmp_dir: &Path, extra: &str) -> (PathBuf, PathBuf) {
    let directory = tmp_dir.join("bt");
    let config = tmp_dir.join("run.toml");
    let contents = formatdoc! {"
        directory = '{dir}'
        {extra}

        [telescope]
        nfreq = 2
        mmax = 2
        lmax = 3
        npairs = 3
        num_pol_sky = 2
        seed = 4
        ",
        dir = directory.display(),
    };
    fs::write(&config, contents).unwrap();
    (config, directory)
}

/// Run `generate` on a config and insist that it works.
fn generate_ok(config: &Path, extra_args: &[&str]) -> String {
    let cmd = beamtransfer_bin()
        .args(["generate", &config.display().to_string(), "--no-progress-bars"])
        .args(extra_args)
        .ok();
    assert!(cmd.is_ok(), "generate failed: {}", cmd.err().unwrap());
    get_cmd_output(cmd).0
}
