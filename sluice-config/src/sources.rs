use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use sluice_core::config::{
    ConsumerSettings, InvokerConfig, ReconcilerConfig, RegistryConfig,
    StorageBackend, StorageConfig,
};

use crate::loader::error::ConfigLoadError;

/// Raw configuration as written in `sluice.toml`. Every table is optional
/// and missing keys keep their defaults.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FileConfig {
    pub registry: RegistryConfig,
    pub storage: StorageConfig,
    pub invoker: InvokerConfig,
    pub consumer: ConsumerSettings,
    pub reconciler: ReconcilerConfig,
}

/// `SLUICE_*` overrides taken from the environment.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub registry_root: Option<PathBuf>,
    pub registry_refresh: Option<Duration>,
    pub storage_backend: Option<StorageBackend>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_allow_http: Option<bool>,
    pub local_storage_root: Option<PathBuf>,
    pub cluster_domain: Option<String>,
    pub function_port: Option<u16>,
    pub invoke_timeout: Option<Duration>,
    pub dispatch_workers: Option<usize>,
    pub resync_interval: Option<Duration>,
}

impl EnvConfig {
    /// Read overrides from the process environment.
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Self::from_vars(std::env::vars())
    }

    /// Read overrides from an explicit set of variables. Empty values count
    /// as unset.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigLoadError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, v)| k.starts_with("SLUICE_") && !v.trim().is_empty())
            .collect();
        let var = |name: &str| vars.get(name).map(|v| v.trim().to_string());

        Ok(Self {
            config_path: var("SLUICE_CONFIG_PATH").map(PathBuf::from),
            registry_root: var("SLUICE_REGISTRY_ROOT").map(PathBuf::from),
            registry_refresh: parse_duration_var(
                "SLUICE_REGISTRY_REFRESH",
                var("SLUICE_REGISTRY_REFRESH"),
            )?,
            storage_backend: parse_backend_var(var("SLUICE_STORAGE_BACKEND"))?,
            s3_region: var("SLUICE_S3_REGION"),
            s3_endpoint: var("SLUICE_S3_ENDPOINT"),
            s3_allow_http: parse_bool_var(
                "SLUICE_S3_ALLOW_HTTP",
                var("SLUICE_S3_ALLOW_HTTP"),
            )?,
            local_storage_root: var("SLUICE_LOCAL_STORAGE_ROOT")
                .map(PathBuf::from),
            cluster_domain: var("SLUICE_CLUSTER_DOMAIN"),
            function_port: parse_number_var(
                "SLUICE_FUNCTION_PORT",
                var("SLUICE_FUNCTION_PORT"),
            )?,
            invoke_timeout: parse_duration_var(
                "SLUICE_INVOKE_TIMEOUT",
                var("SLUICE_INVOKE_TIMEOUT"),
            )?,
            dispatch_workers: parse_number_var(
                "SLUICE_DISPATCH_WORKERS",
                var("SLUICE_DISPATCH_WORKERS"),
            )?,
            resync_interval: parse_duration_var(
                "SLUICE_RESYNC_INTERVAL",
                var("SLUICE_RESYNC_INTERVAL"),
            )?,
        })
    }
}

fn invalid(name: &str, value: &str, reason: impl Into<String>) -> ConfigLoadError {
    ConfigLoadError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_duration_var(
    name: &str,
    raw: Option<String>,
) -> Result<Option<Duration>, ConfigLoadError> {
    raw.map(|raw| {
        humantime::parse_duration(&raw)
            .map_err(|err| invalid(name, &raw, err.to_string()))
    })
    .transpose()
}

fn parse_number_var<T>(
    name: &str,
    raw: Option<String>,
) -> Result<Option<T>, ConfigLoadError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|raw| raw.parse().map_err(|err: T::Err| invalid(name, &raw, err.to_string())))
        .transpose()
}

fn parse_bool_var(
    name: &str,
    raw: Option<String>,
) -> Result<Option<bool>, ConfigLoadError> {
    raw.map(|raw| match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, &raw, "expected a boolean")),
    })
    .transpose()
}

fn parse_backend_var(
    raw: Option<String>,
) -> Result<Option<StorageBackend>, ConfigLoadError> {
    raw.map(|raw| match raw.to_ascii_lowercase().as_str() {
        "s3" => Ok(StorageBackend::S3),
        "local" => Ok(StorageBackend::Local),
        _ => Err(invalid(
            "SLUICE_STORAGE_BACKEND",
            &raw,
            "expected `s3` or `local`",
        )),
    })
    .transpose()
}
