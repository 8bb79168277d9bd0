// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tests of the subcommands that look at generated directories.

use tempfile::TempDir;

use crate::{beamtransfer_bin, generate_ok, get_cmd_output, write_config};

#[test]
fn test_status() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let (config, directory) = write_config(tmp_dir.path(), "skip_svd = true");
    let dir = directory.display().to_string();

    generate_ok(&config, &[]);
    let cmd = beamtransfer_bin().args(["status", &dir]).ok();
    assert!(cmd.is_ok(), "status failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("Raw operators: complete"), "{stdout}");
    assert!(stdout.contains("SVD variant: <not yet written>"), "{stdout}");
    assert!(stdout.contains("0 of 3 m indices have complete SVD files"), "{stdout}");

    let (config, _) = write_config(tmp_dir.path(), "skip_svd_inv = true");
    generate_ok(&config, &[]);
    let cmd = beamtransfer_bin().args(["status", &dir]).ok();
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("SVD variant: three-stage"), "{stdout}");
    assert!(stdout.contains("3 of 3 m indices have complete SVD files"), "{stdout}");
    assert!(stdout.contains("m index 2 has no SVD to sky operator"), "{stdout}");
}

#[test]
fn test_spectrum() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let (config, directory) = write_config(tmp_dir.path(), "");
    let dir = directory.display().to_string();

    // Nothing there yet.
    let cmd = beamtransfer_bin().args(["spectrum", &dir]).ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("does not exist"), "{stderr}");

    generate_ok(&config, &[]);
    let cmd = beamtransfer_bin().args(["spectrum", &dir, "--svcut", "0.5"]).ok();
    assert!(cmd.is_ok(), "spectrum failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("SVD variant three-stage, svcut 5e-1"), "{stdout}");
    assert!(stdout.contains("ndofmax: 8"), "{stdout}");
}
