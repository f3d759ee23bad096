use std::{fmt, path::PathBuf};

use sluice_core::{
    config::{
        ConsumerSettings, InvokerConfig, ReconcilerConfig, RegistryConfig,
        StorageConfig,
    },
    runtime::RuntimeSettings,
};

/// Fully resolved controller configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub registry: RegistryConfig,
    pub storage: StorageConfig,
    pub invoker: InvokerConfig,
    pub consumer: ConsumerSettings,
    pub reconciler: ReconcilerConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            consumer: self.consumer.clone(),
            reconciler: self.reconciler.clone(),
        }
    }
}

/// Where the resolved values came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hint {
            Some(hint) => write!(f, "{} ({hint})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigWarnings {
    items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(
        &mut self,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}
