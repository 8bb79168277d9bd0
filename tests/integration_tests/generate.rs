// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fs;

use tempfile::TempDir;

use crate::{beamtransfer_bin, generate_ok, get_cmd_output, write_config};
use beamtransfer::{BeamTransfer, BeamTransferConfig, SvdVariant};

#[test]
fn test_generate() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let (config, directory) = write_config(tmp_dir.path(), "");

    let stdout = generate_ok(&config, &[]);
    assert!(stdout.contains("Compressed m indices [0, 1, 2]"), "{stdout}");
    assert!(directory.join("beam_m").join("COMPLETED").exists());
    assert!(directory.join("svdspectrum.fits").exists());

    let bt = BeamTransfer::open(&directory).unwrap();
    assert_eq!(bt.policy().variant(), SvdVariant::ThreeStage);
    for mi in 0..=2 {
        assert!(bt.ndof(mi).unwrap() <= bt.ndofmax());
    }

    // Nothing to do the second time around.
    let stdout = generate_ok(&config, &[]);
    assert!(stdout.contains("Compressed m indices []"), "{stdout}");
    assert!(stdout.contains("3 m indices were already complete"), "{stdout}");

    // ... unless asked.
    let stdout = generate_ok(&config, &["--regen"]);
    assert!(stdout.contains("Compressed m indices [0, 1, 2]"), "{stdout}");
}

#[test]
fn test_generate_with_threads() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let (config, directory) = write_config(tmp_dir.path(), "variant = 'full-frequency'");

    let stdout = generate_ok(&config, &["--workers", "2"]);
    assert!(stdout.contains("Using 2 worker(s)"), "{stdout}");
    assert!(stdout.contains("Compressed m indices [0, 1, 2]"), "{stdout}");

    let bt = BeamTransfer::open(&directory).unwrap();
    assert_eq!(bt.policy().variant(), SvdVariant::FullFrequency);
}

#[test]
fn test_dry_run() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let (config, directory) = write_config(tmp_dir.path(), "");

    let stdout = generate_ok(&config, &["--dry-run"]);
    assert!(stdout.contains("Dry run"), "{stdout}");
    assert!(!directory.exists());
}

#[test]
fn test_save_toml() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let (config, _) = write_config(tmp_dir.path(), "svcut = 1e-3");
    let saved = tmp_dir.path().join("saved.toml");

    generate_ok(
        &config,
        &["--dry-run", "--workers", "3", "--save-toml", &saved.display().to_string()],
    );
    let original = BeamTransferConfig::from_file(&config).unwrap();
    let saved = BeamTransferConfig::from_file(&saved).unwrap();
    assert_eq!(saved.workers, 3);
    assert_eq!(
        saved,
        BeamTransferConfig {
            workers: 3,
            ..original
        }
    );
}

#[test]
fn test_bad_config() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");

    let config = tmp_dir.path().join("run.yaml");
    fs::write(&config, "variant: identity").unwrap();
    let cmd = beamtransfer_bin()
        .args(["generate", &config.display().to_string(), "--no-progress-bars"])
        .ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("recognised file extension"), "{stderr}");
    assert!(stderr.contains("Configuration"), "{stderr}");

    let (config, _) = write_config(tmp_dir.path(), "variant = 'five-stage'");
    let cmd = beamtransfer_bin()
        .args(["generate", &config.display().to_string(), "--no-progress-bars"])
        .ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("five-stage"), "{stderr}");

    let (config, _) = write_config(tmp_dir.path(), "");
    let cmd = beamtransfer_bin()
        .args(["generate", &config.display().to_string(), "--workers", "0"])
        .ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("workers must be at least 1"), "{stderr}");
}
