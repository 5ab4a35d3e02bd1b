//! extauthz - Envoy external authorization service backed by Rego policies

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use prometheus_client::registry::Registry;
use tracing::{error, info, warn};

use extauthz::diagnostics::{bind_diagnostics, serve_diagnostics, DiagnosticState};
use extauthz::telemetry::init_logging;
use extauthz::watcher::{load_data_file, load_policy_dir, PolicyWatcher};
use extauthz::{Config, ExtAuthzPlugin, MemoryStore, TracingDecisionLogger};

/// Envoy ext_authz decision service evaluating Rego policies
#[derive(Parser, Debug)]
#[command(name = "extauthz", version, about, long_about = None)]
struct Cli {
    /// Plugin configuration file (YAML or JSON)
    #[arg(long, env = "EXTAUTHZ_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of `.rego` policy modules
    #[arg(long, env = "EXTAUTHZ_POLICY_DIR")]
    policy: PathBuf,

    /// Data document (YAML or JSON) exposed under `data`
    #[arg(long, env = "EXTAUTHZ_DATA")]
    data: Option<PathBuf>,

    /// Address for the `/health` and `/metrics` endpoints
    #[arg(long, default_value = "0.0.0.0:8282")]
    diagnostic_addr: SocketAddr,

    /// Reload policies when the policy directory changes
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    let config_bytes = match &cli.config {
        Some(path) => std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path.display(), e))?,
        None => Vec::new(),
    };
    let config = Config::from_bytes(&config_bytes)?;

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &cli.data {
        store.set_data(load_data_file(path)?);
    }
    let modules = load_policy_dir(&cli.policy)?;
    if modules.is_empty() {
        warn!(dir = %cli.policy.display(), "No policy modules found");
    }
    store.replace_policies(modules);

    let mut registry = Registry::default();
    let plugin = ExtAuthzPlugin::new(
        config,
        store.clone(),
        Arc::new(TracingDecisionLogger),
        &mut registry,
    );

    let diagnostics = DiagnosticState::new(Arc::new(registry), plugin.subscribe());
    let diagnostic_listener = bind_diagnostics(cli.diagnostic_addr).await?;
    let mut diagnostic_task = tokio::spawn(serve_diagnostics(diagnostic_listener, diagnostics));

    let _watcher = if cli.watch {
        Some(PolicyWatcher::spawn(store.clone(), &cli.policy)?)
    } else {
        None
    };

    let mut handle = plugin.start().await?;

    tokio::select! {
        result = &mut handle.task => {
            diagnostic_task.abort();
            return match result {
                Ok(served) => served.map_err(Into::into),
                Err(e) => Err(anyhow::anyhow!("server task failed: {}", e)),
            };
        }
        result = &mut diagnostic_task => {
            plugin.stop();
            let _ = handle.task.await;
            return match result {
                Ok(served) => served.map_err(Into::into),
                Err(e) => Err(anyhow::anyhow!("diagnostic task failed: {}", e)),
            };
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        }
    }

    plugin.stop();
    diagnostic_task.abort();
    match handle.task.await {
        Ok(served) => served?,
        Err(e) => return Err(anyhow::anyhow!("server task failed: {}", e)),
    }
    Ok(())
}
