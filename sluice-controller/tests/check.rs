use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

fn controller(dir: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("sluice-controller");
    cmd.current_dir(dir.path())
        .env_remove("SLUICE_CONFIG_PATH")
        .env_remove("SLUICE_REGISTRY_ROOT")
        .env("SLUICE_STORAGE_BACKEND", "local")
        .env("SLUICE_LOCAL_STORAGE_ROOT", dir.path());
    cmd
}

#[test]
fn check_passes_against_an_empty_registry() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("registry")).unwrap();

    controller(&dir).arg("check").assert().success();
}

#[test]
fn check_fails_when_the_registry_is_missing() {
    let dir = TempDir::new().unwrap();

    let output = controller(&dir)
        .arg("--registry-root")
        .arg(dir.path().join("absent"))
        .arg("check")
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(
        text.contains("failed to open trigger registry"),
        "unexpected stderr: {text}"
    );
}

#[test]
fn invalid_configuration_is_fatal() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("sluice.toml"),
        "[consumer]\ndispatch_workers = 0\n",
    )
    .unwrap();

    controller(&dir).arg("check").assert().failure().code(1);
}

#[test]
fn check_fails_when_a_trigger_bucket_is_missing() {
    let dir = TempDir::new().unwrap();
    let triggers = dir.path().join("registry/media/triggers");
    fs::create_dir_all(&triggers).unwrap();
    fs::write(
        triggers.join("photos.json"),
        r#"{"spec":{"bucket":"uploads","subDir":"photos/","pollFrequency":30,"functionSelector":{"matchLabels":{"fn":"resize"}}}}"#,
    )
    .unwrap();
    assert!(!dir.path().join("uploads").exists());

    let output = controller(&dir)
        .arg("check")
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(
        text.contains("storage bucket uploads is not reachable"),
        "unexpected stderr: {text}"
    );

    fs::create_dir(dir.path().join("uploads")).unwrap();
    controller(&dir).arg("check").assert().success();
}
