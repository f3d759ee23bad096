use std::{fs, path::Path, path::PathBuf};

use sluice_config::{ConfigLoadError, ConfigLoader};
use sluice_core::config::StorageBackend;
use tempfile::TempDir;

fn isolated(dir: &Path) -> ConfigLoader {
    ConfigLoader::new()
        .with_search_dir(dir)
        .with_vars(Vec::<(String, String)>::new())
}

fn write(dir: &Path, relative: &str, contents: &str) -> PathBuf {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn defaults_without_file_or_environment() {
    let dir = TempDir::new().unwrap();
    let load = isolated(dir.path()).load().unwrap();

    assert_eq!(load.config.consumer.dispatch_workers, 4);
    assert_eq!(load.config.invoker.cluster_domain, "svc.cluster.local");
    assert_eq!(load.config.reconciler.resync_interval_ms, 300_000);
    assert_eq!(load.config.storage.backend, StorageBackend::S3);
    assert!(load.config.metadata.config_path.is_none());
    assert!(!load.config.metadata.env_file_loaded);
    assert_eq!(load.warnings.len(), 1);
}

#[test]
fn partial_file_in_default_location_keeps_other_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write(
        dir.path(),
        "config/sluice.toml",
        r#"
[consumer]
dispatch_workers = 2

[invoker]
default_port = 9000
"#,
    );

    let load = isolated(dir.path()).load().unwrap();

    assert_eq!(load.config.metadata.config_path, Some(path));
    assert_eq!(load.config.consumer.dispatch_workers, 2);
    assert_eq!(load.config.consumer.dispatch_queue_capacity, 256);
    assert_eq!(load.config.invoker.default_port, 9000);
    assert_eq!(load.config.invoker.request_timeout_ms, 30_000);
    assert!(load.warnings.is_empty());
}

#[test]
fn environment_overrides_file_and_env_file() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "sluice.toml",
        r#"
[registry]
root = "/from/file"

[invoker]
cluster_domain = "file.local"
"#,
    );
    write(
        dir.path(),
        ".env",
        "SLUICE_CLUSTER_DOMAIN=dotenv.local\nSLUICE_DISPATCH_WORKERS=6\n",
    );

    let load = ConfigLoader::new()
        .with_search_dir(dir.path())
        .with_vars([
            ("SLUICE_DISPATCH_WORKERS", "12"),
            ("SLUICE_INVOKE_TIMEOUT", "2s"),
            ("SLUICE_RESYNC_INTERVAL", "90s"),
        ])
        .load()
        .unwrap();

    assert!(load.config.metadata.env_file_loaded);
    assert_eq!(load.config.registry.root, PathBuf::from("/from/file"));
    assert_eq!(load.config.invoker.cluster_domain, "dotenv.local");
    assert_eq!(load.config.consumer.dispatch_workers, 12);
    assert_eq!(load.config.invoker.request_timeout_ms, 2_000);
    assert_eq!(load.config.reconciler.resync_interval_ms, 90_000);
}

#[test]
fn registry_root_flag_wins_over_environment() {
    let dir = TempDir::new().unwrap();
    let load = isolated(dir.path())
        .with_vars([("SLUICE_REGISTRY_ROOT", "/from/env")])
        .with_registry_root("/from/flag")
        .load()
        .unwrap();

    assert_eq!(load.config.registry.root, PathBuf::from("/from/flag"));
}

#[test]
fn config_path_from_environment_is_used() {
    let dir = TempDir::new().unwrap();
    let path = write(
        dir.path(),
        "elsewhere/controller.toml",
        "[registry]\nrefresh_interval_ms = 250\n",
    );

    let load = isolated(dir.path())
        .with_vars([("SLUICE_CONFIG_PATH", path.to_str().unwrap())])
        .load()
        .unwrap();

    assert_eq!(load.config.metadata.config_path, Some(path));
    assert_eq!(load.config.registry.refresh_interval_ms, 250);
}

#[test]
fn missing_explicit_config_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = isolated(dir.path())
        .with_config_path(dir.path().join("absent.toml"))
        .load()
        .unwrap_err();

    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn malformed_file_reports_its_path() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "sluice.toml", "[consumer\ndispatch_workers = ");

    match isolated(dir.path()).load().unwrap_err() {
        ConfigLoadError::Parse { path: reported, .. } => {
            assert_eq!(reported, path)
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn zero_workers_and_timeouts_are_rejected() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "sluice.toml", "[consumer]\ndispatch_workers = 0\n");
    match isolated(dir.path()).load().unwrap_err() {
        ConfigLoadError::Invalid { field, .. } => {
            assert_eq!(field, "consumer.dispatch_workers")
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let dir = TempDir::new().unwrap();
    let err = isolated(dir.path())
        .with_vars([("SLUICE_INVOKE_TIMEOUT", "0s")])
        .load()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::Invalid {
            field: "invoker.request_timeout_ms",
            ..
        }
    ));
}

#[test]
fn local_backend_requires_a_root() {
    let dir = TempDir::new().unwrap();
    let err = isolated(dir.path())
        .with_vars([("SLUICE_STORAGE_BACKEND", "local")])
        .load()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::Invalid {
            field: "storage.local_root",
            ..
        }
    ));

    let load = isolated(dir.path())
        .with_vars([
            ("SLUICE_STORAGE_BACKEND", "local"),
            ("SLUICE_LOCAL_STORAGE_ROOT", "/srv/buckets"),
        ])
        .load()
        .unwrap();
    assert_eq!(load.config.storage.backend, StorageBackend::Local);
    assert_eq!(
        load.config.storage.local_root,
        Some(PathBuf::from("/srv/buckets"))
    );
}
