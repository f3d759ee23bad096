//! Configuration loading for Sluice.
//!
//! Values are layered from lowest to highest precedence: built-in defaults,
//! a TOML file, a `.env` file, the process environment, and finally explicit
//! overrides supplied by the caller (usually CLI flags).

pub mod loader;
pub mod models;
pub mod sources;

pub use loader::{
    ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError,
};
pub use models::{Config, ConfigMetadata, ConfigWarning, ConfigWarnings};
pub use sources::{EnvConfig, FileConfig};
