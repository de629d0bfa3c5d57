//! End-to-end CLI tests for the scatter binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn scatter() -> Command {
    Command::cargo_bin("scatter").unwrap()
}

#[test]
fn help_describes_the_tool() {
    scatter()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Parallel test runner"));
}

#[test]
fn validate_accepts_a_complete_config() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("scatter.toml");
    std::fs::write(
        &config_path,
        r#"
        [build]
        command = "make build-tests"

        [enumerate]
        command = "testctl list --json"

        [devices.families]
        "iPhone 6" = 2

        [executor]
        command = "testctl run --device {device_id} --only {tests}"
        "#,
    )
    .unwrap();

    scatter()
        .arg("--config")
        .arg(&config_path)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"));
}

#[test]
fn validate_rejects_an_incomplete_config() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("scatter.toml");
    std::fs::write(&config_path, "[scatter]\npartition = \"1/1\"\n").unwrap();

    scatter()
        .arg("--config")
        .arg(&config_path)
        .arg("validate")
        .assert()
        .failure();
}

#[test]
fn init_writes_a_valid_template_once() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("scatter.toml");

    scatter()
        .arg("--config")
        .arg(&config_path)
        .arg("init")
        .assert()
        .success();

    // The generated template must validate.
    scatter()
        .arg("--config")
        .arg(&config_path)
        .arg("validate")
        .assert()
        .success();

    // A second init refuses to overwrite.
    scatter()
        .arg("--config")
        .arg(&config_path)
        .arg("init")
        .assert()
        .failure();
}

#[test]
fn run_passes_with_a_scripted_harness() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("scatter.toml");
    let output_dir = dir.path().join("logs");

    let config = format!(
        r#"
        [scatter]
        output_dir = "{output_dir}"

        [build]
        enabled = false

        [enumerate]
        command = """printf '{{\"className\": \"LoginTests\", \"methodName\": \"testLogin\"}}\\n'"""

        [devices.families]
        "iPhone 6" = 1

        [executor]
        command = """printf '{{\"succeeded\": true, \"className\": \"LoginTests\", \"methodName\": \"testLogin\"}}\\n' > "{{result_log}}"; echo ran {{tests}}"""
        "#,
        output_dir = output_dir.display()
    );
    std::fs::write(&config_path, config).unwrap();

    scatter()
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("All tests passed!"));
}

#[test]
fn run_fails_when_a_test_never_passes() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("scatter.toml");
    let output_dir = dir.path().join("logs");

    let config = format!(
        r#"
        [scatter]
        output_dir = "{output_dir}"
        retry_ceiling = 2

        [build]
        enabled = false

        [enumerate]
        command = """printf '{{\"className\": \"LoginTests\", \"methodName\": \"testLogin\"}}\\n'"""

        [devices.families]
        "iPhone 6" = 1

        [executor]
        command = "echo running {{tests}}; exit 1"
        "#,
        output_dir = output_dir.display()
    );
    std::fs::write(&config_path, config).unwrap();

    scatter()
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .assert()
        .failure()
        .stdout(predicate::str::contains("never passed"));
}

#[test]
fn list_prints_enumerated_tests() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("scatter.toml");

    let config = r#"
        [enumerate]
        command = """printf '%s\\n' '{\"bundleName\": \"AppTests.xctest\"}' '{\"className\": \"LoginTests\", \"methodName\": \"testLogin\"}'"""

        [devices.families]
        "iPhone 6" = 1

        [executor]
        command = "true"
        "#;
    std::fs::write(&config_path, config).unwrap();

    scatter()
        .arg("--config")
        .arg(&config_path)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("LoginTests/testLogin"));
}
