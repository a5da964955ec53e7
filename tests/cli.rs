//! Integration tests for the parts of the system that don't require an
//! actual serial device to exercise (spec.md §8, SPEC_FULL.md §8):
//! argument parsing, `--list-devices`, and configuration-error exit
//! codes (spec.md §7 "configuration... fatal before connect").

use assert_cmd::Command;
use predicates::prelude::*;

fn tio() -> Command {
    Command::cargo_bin("tio").unwrap()
}

#[test]
fn help_exits_success_and_lists_device_argument() {
    tio()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("baudrate"));
}

#[test]
fn version_exits_success() {
    tio()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tio"));
}

#[test]
fn list_devices_exits_success_with_no_device_argument() {
    // --list-devices never needs a device positional (spec.md §6).
    tio().arg("--list-devices").assert().success();
}

#[test]
fn missing_device_argument_is_fatal() {
    tio()
        .assert()
        .failure()
        .stderr(predicate::str::contains("no device argument").or(predicate::str::contains("device")));
}

#[test]
fn invalid_baudrate_is_rejected_by_clap() {
    tio()
        .args(["--baudrate", "not-a-number", "/dev/ttyUSB0"])
        .assert()
        .failure();
}

#[test]
fn invalid_databits_is_a_fatal_configuration_error() {
    tio()
        .args(["--databits", "3", "/dev/ttyUSB0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("databits"));
}

#[test]
fn invalid_parity_is_a_fatal_configuration_error() {
    tio()
        .args(["--parity", "bogus", "/dev/ttyUSB0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parity"));
}

#[test]
fn unknown_map_flag_is_a_fatal_configuration_error() {
    tio()
        .args(["--map", "NOT_A_FLAG", "/dev/ttyUSB0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("map flag"));
}

#[test]
fn invalid_color_is_a_fatal_configuration_error() {
    tio()
        .args(["--color", "999", "/dev/ttyUSB0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("color"));
}
