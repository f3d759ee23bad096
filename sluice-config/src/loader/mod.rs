pub mod error;

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use once_cell::sync::Lazy;
use sluice_core::config::StorageBackend;
use tracing::debug;

use self::error::ConfigLoadError;
use crate::{
    models::{Config, ConfigMetadata, ConfigWarnings},
    sources::{EnvConfig, FileConfig},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![PathBuf::from("sluice.toml"), PathBuf::from("config/sluice.toml")]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Wins over both the file and the environment.
    pub registry_root: Option<PathBuf>,
    /// Used in place of the process environment when set.
    pub vars: Option<Vec<(String, String)>>,
    /// Directory the default config and `.env` locations are resolved
    /// against. Defaults to the working directory.
    pub search_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_registry_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.registry_root = Some(path.into());
        self
    }

    pub fn with_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.options.vars = Some(
            vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        );
        self
    }

    pub fn with_search_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.search_dir = Some(dir.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (mut vars, env_file_loaded) = self.read_env_file()?;
        // Real environment wins over the `.env` file.
        match &self.options.vars {
            Some(explicit) => vars.extend(explicit.iter().cloned()),
            None => vars.extend(std::env::vars()),
        }
        let env = EnvConfig::from_vars(vars)?;

        let (file_config, config_path) = self.load_file_config(&env)?;
        let mut warnings = ConfigWarnings::default();
        if config_path.is_none() {
            warnings.push_with_hint(
                "No sluice.toml detected; using defaults and environment variables",
                "Pass --config or set SLUICE_CONFIG_PATH to use a file",
            );
        }

        let mut config = compose(file_config.unwrap_or_default(), &env);
        if let Some(root) = &self.options.registry_root {
            config.registry.root = root.clone();
        }
        config.metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
        };

        validate(&config)?;
        if config.storage.backend == StorageBackend::Local
            && (config.storage.endpoint.is_some() || config.storage.region.is_some())
        {
            warnings.push("S3 region/endpoint are ignored by the local storage backend");
        }

        debug!(
            target: "sluice::config",
            config_path = ?config.metadata.config_path,
            env_file_loaded,
            registry_root = %config.registry.root.display(),
            backend = ?config.storage.backend,
            "configuration loaded"
        );
        Ok(ConfigLoad { config, warnings })
    }

    fn search_path(&self, relative: &Path) -> PathBuf {
        match &self.options.search_dir {
            Some(dir) => dir.join(relative),
            None => relative.to_path_buf(),
        }
    }

    fn read_env_file(
        &self,
    ) -> Result<(Vec<(String, String)>, bool), ConfigLoadError> {
        let path = match &self.options.env_file {
            Some(path) => path.clone(),
            None => self.search_path(Path::new(".env")),
        };

        let iter = match dotenvy::from_path_iter(&path) {
            Ok(iter) => iter,
            Err(dotenvy::Error::Io(err)) if err.kind() == ErrorKind::NotFound => {
                return Ok((Vec::new(), false));
            }
            Err(err) => return Err(err.into()),
        };

        let mut vars = Vec::new();
        for item in iter {
            vars.push(item?);
        }
        Ok((vars, true))
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let requested =
            self.options.config_path.clone().or_else(|| env.config_path.clone());

        let path = match requested {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::MissingConfig { path });
                }
                path
            }
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(|candidate| self.search_path(candidate))
                .find(|candidate| candidate.is_file())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        let contents =
            fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
                path: path.clone(),
                source,
            })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn compose(file: FileConfig, env: &EnvConfig) -> Config {
    let FileConfig {
        mut registry,
        mut storage,
        mut invoker,
        mut consumer,
        mut reconciler,
    } = file;

    if let Some(root) = &env.registry_root {
        registry.root = root.clone();
    }
    if let Some(refresh) = env.registry_refresh {
        registry.refresh_interval_ms = millis(refresh);
    }

    if let Some(backend) = env.storage_backend {
        storage.backend = backend;
    }
    if let Some(region) = &env.s3_region {
        storage.region = Some(region.clone());
    }
    if let Some(endpoint) = &env.s3_endpoint {
        storage.endpoint = Some(endpoint.clone());
    }
    if let Some(allow_http) = env.s3_allow_http {
        storage.allow_http = allow_http;
    }
    if let Some(root) = &env.local_storage_root {
        storage.local_root = Some(root.clone());
    }

    if let Some(domain) = &env.cluster_domain {
        invoker.cluster_domain = domain.clone();
    }
    if let Some(port) = env.function_port {
        invoker.default_port = port;
    }
    if let Some(timeout) = env.invoke_timeout {
        invoker.request_timeout_ms = millis(timeout);
    }

    if let Some(workers) = env.dispatch_workers {
        consumer.dispatch_workers = workers;
    }
    if let Some(interval) = env.resync_interval {
        reconciler.resync_interval_ms = millis(interval);
    }

    Config {
        registry,
        storage,
        invoker,
        consumer,
        reconciler,
        metadata: ConfigMetadata::default(),
    }
}

fn validate(config: &Config) -> Result<(), ConfigLoadError> {
    let non_zero = [
        ("consumer.dispatch_workers", config.consumer.dispatch_workers as u64),
        (
            "consumer.dispatch_queue_capacity",
            config.consumer.dispatch_queue_capacity as u64,
        ),
        (
            "consumer.checkpoint_channel_capacity",
            config.consumer.checkpoint_channel_capacity as u64,
        ),
        ("invoker.request_timeout_ms", config.invoker.request_timeout_ms),
        ("registry.refresh_interval_ms", config.registry.refresh_interval_ms),
        ("reconciler.resync_interval_ms", config.reconciler.resync_interval_ms),
    ];
    if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
        return Err(ConfigLoadError::invalid(*field, "must be greater than zero"));
    }

    if config.invoker.default_port == 0 {
        return Err(ConfigLoadError::invalid(
            "invoker.default_port",
            "must be a valid TCP port",
        ));
    }
    if config.invoker.cluster_domain.trim().is_empty() {
        return Err(ConfigLoadError::invalid(
            "invoker.cluster_domain",
            "must not be empty",
        ));
    }
    if !matches!(config.invoker.scheme.as_str(), "http" | "https") {
        return Err(ConfigLoadError::invalid(
            "invoker.scheme",
            format!("unsupported scheme {:?}", config.invoker.scheme),
        ));
    }
    if config.storage.backend == StorageBackend::Local
        && config.storage.local_root.is_none()
    {
        return Err(ConfigLoadError::invalid(
            "storage.local_root",
            "required by the local storage backend",
        ));
    }

    Ok(())
}
