// Black-box checks of the insightctl binary surface.

use assert_cmd::Command;

#[test]
fn help_succeeds() {
    Command::cargo_bin("insightctl")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn unknown_subcommand_fails() {
    Command::cargo_bin("insightctl")
        .unwrap()
        .arg("frobnicate")
        .assert()
        .failure();
}

#[test]
fn query_without_symbols_fails_with_nonzero_exit() {
    Command::cargo_bin("insightctl")
        .unwrap()
        .args(["memory", "query", "init_task.comm"])
        .assert()
        .failure();
}

#[test]
fn missing_symbol_file_is_reported() {
    Command::cargo_bin("insightctl")
        .unwrap()
        .args(["--symbols", "/nonexistent/syms.isym", "list", "types"])
        .assert()
        .failure();
}
