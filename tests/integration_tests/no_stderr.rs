// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tests to ensure there is no stderr output for successful commands.

use tempfile::TempDir;

use crate::{beamtransfer_bin, get_cmd_output, write_config};

#[test]
fn test_generate_no_stderr() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let (config, directory) = write_config(tmp_dir.path(), "");

    let cmd = beamtransfer_bin()
        .args(["generate", &config.display().to_string()])
        .ok();
    assert!(
        cmd.is_ok(),
        "generate failed on a small telescope: {}",
        cmd.err().unwrap()
    );
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.is_empty(), "stderr wasn't empty: {stderr}");

    for sub_command in ["status", "spectrum"] {
        let cmd = beamtransfer_bin()
            .args([sub_command, &directory.display().to_string()])
            .ok();
        assert!(cmd.is_ok(), "{sub_command} failed: {}", cmd.err().unwrap());
        let (_, stderr) = get_cmd_output(cmd);
        assert!(stderr.is_empty(), "stderr wasn't empty: {stderr}");
    }
}
