use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sluice_config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use sluice_core::{
    dispatch::HttpFunctionInvoker,
    registry::{FileTriggerRegistry, FunctionDirectory, TriggerRegistry},
    runtime::{RuntimeDeps, SluiceRuntime},
    storage::ObjectStoreLister,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "sluice-controller",
    version,
    about = "Polls buckets declared by triggers and invokes matching functions for new objects"
)]
struct Cli {
    /// Path to a sluice.toml configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before the environment is read
    #[arg(long, value_name = "PATH", global = true)]
    env_file: Option<PathBuf>,

    /// Directory holding trigger and function manifests
    #[arg(long, value_name = "PATH", global = true)]
    registry_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the controller until SIGINT or SIGTERM (default)
    Run,
    /// Load configuration, reach the registry and every referenced bucket, then exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Check => check(config).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let ConfigLoad { config, warnings } =
        ConfigLoader::with_options(ConfigLoaderOptions {
            config_path: cli.config.clone(),
            env_file: cli.env_file.clone(),
            registry_root: cli.registry_root.clone(),
            ..ConfigLoaderOptions::default()
        })
        .load()
        .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sluice::scanner=warn,object_store=warn,reqwest=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "loaded configuration file");
    }
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    Ok(config)
}

struct Collaborators {
    registry: Arc<FileTriggerRegistry>,
    lister: Arc<ObjectStoreLister>,
    invoker: Arc<HttpFunctionInvoker>,
}

async fn connect(config: &Config) -> anyhow::Result<Collaborators> {
    let registry = FileTriggerRegistry::open(&config.registry)
        .await
        .context("failed to open trigger registry")?;
    let lister = ObjectStoreLister::new(config.storage.clone())
        .context("failed to build storage client")?;
    let invoker = HttpFunctionInvoker::new(config.invoker.clone())
        .context("failed to build function invoker")?;
    probe_buckets(&registry, &lister).await?;

    Ok(Collaborators {
        registry: Arc::new(registry),
        lister: Arc::new(lister),
        invoker: Arc::new(invoker),
    })
}

/// List one page of every bucket a valid trigger points at. An unreachable
/// backend or a missing bucket is fatal at startup.
async fn probe_buckets(
    registry: &FileTriggerRegistry,
    lister: &ObjectStoreLister,
) -> anyhow::Result<()> {
    let triggers = registry
        .list(None)
        .await
        .context("failed to list triggers")?;
    let buckets: BTreeSet<&str> = triggers
        .iter()
        .filter(|trigger| trigger.spec.validate(&trigger.key).is_ok())
        .map(|trigger| trigger.spec.bucket.as_str())
        .collect();

    for bucket in &buckets {
        lister
            .probe(bucket)
            .await
            .with_context(|| format!("storage bucket {bucket} is not reachable"))?;
    }
    info!(buckets = buckets.len(), "storage backend reachable");
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let Collaborators {
        registry,
        lister,
        invoker,
    } = connect(&config).await?;

    let refresh_stop = CancellationToken::new();
    let refresh_task = registry.spawn_refresh(refresh_stop.clone());

    let runtime = match SluiceRuntime::start(
        RuntimeDeps {
            registry: registry.clone(),
            functions: registry.clone(),
            lister,
            invoker,
        },
        config.runtime_settings(),
    )
    .await
    {
        Ok(runtime) => runtime,
        Err(err) => {
            refresh_stop.cancel();
            let _ = refresh_task.await;
            return Err(err).context("failed to start reconciler");
        }
    };

    let initial = runtime.initial_summary();
    info!(
        consumers = initial.started,
        registry_root = %config.registry.root.display(),
        "sluice controller running"
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    runtime.shutdown().await;
    refresh_stop.cancel();
    if let Err(err) = refresh_task.await {
        error!(error = %err, "registry refresh task failed");
    }
    info!("sluice controller stopped");
    Ok(())
}

async fn check(config: Config) -> anyhow::Result<()> {
    let Collaborators { registry, .. } = connect(&config).await?;

    let triggers = registry
        .list(None)
        .await
        .context("failed to list triggers")?;

    let mut invalid = 0usize;
    for trigger in &triggers {
        if let Err(err) = trigger.spec.validate(&trigger.key) {
            invalid += 1;
            warn!(trigger = %trigger.key, error = %err, "trigger would be rejected");
        }
    }

    let namespaces: BTreeSet<&str> = triggers
        .iter()
        .map(|trigger| trigger.key.namespace.as_str())
        .collect();
    let mut functions = 0usize;
    for namespace in namespaces {
        functions += registry
            .list_functions(namespace)
            .await
            .with_context(|| format!("failed to list functions in {namespace}"))?
            .len();
    }

    info!(
        triggers = triggers.len(),
        invalid,
        functions,
        backend = ?config.storage.backend,
        "configuration check passed"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
