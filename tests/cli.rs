use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_the_subcommands() {
    Command::cargo_bin("contentmill")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("run")
                .and(predicate::str::contains("status"))
                .and(predicate::str::contains("variants")),
        );
}

#[test]
fn version_flag_prints_the_crate_version() {
    Command::cargo_bin("contentmill")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("contentmill"));
}

#[test]
fn run_requires_a_url_argument() {
    Command::cargo_bin("contentmill")
        .unwrap()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("URL"));
}
