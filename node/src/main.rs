//! Apiary node command line.
#![warn(missing_docs)]

mod cli;

use ac_chain_client::{ChainSource, MockSource, NodeClient};
use ac_db::MemStore;
use ap_utils::service::ServiceContext;
use ap_utils::AbortOnDrop;
use anyhow::{bail, Context};
use clap::Parser;
use cli::RunCmd;
use figment::{
    providers::{Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use std::sync::Arc;
use std::{env, path::Path};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Arguments come from the command line, or wholesale from a config file
    // when one is given. Without any arguments, a default config file is
    // picked up if present.
    let mut config: Figment = Figment::new();
    if env::args().count() > 1 {
        let cli_args = RunCmd::parse();
        if let Some(config_path) = cli_args.config_file.clone() {
            config = match config_path.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => config.merge(Toml::file(config_path)),
                Some("json") => config.merge(Json::file(config_path)),
                Some("yaml") | Some("yml") => config.merge(Yaml::file(config_path)),
                _ => bail!("Unsupported file type for config file."),
            }
        } else {
            config = config.merge(Serialized::defaults(cli_args));
        }
    } else {
        let path = Path::new("./configs/config.json");
        if path.exists() {
            config = config.merge(Json::file(path));
        }
    }
    let run_cmd: RunCmd = config.extract().context("Reading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    tracing::info!("🐝 {} starting", run_cmd.node_name());

    let store = Arc::new(MemStore::new(run_cmd.sync_params.pool_size.max(2)));

    let overlay = run_cmd.source_params.mock_blocks().context("Loading mock data file")?;
    let (source, overlay, can_fork): (Arc<dyn ChainSource>, _, bool) =
        match (&run_cmd.source_params.node_url, overlay) {
            (Some(url), overlay) => {
                tracing::info!("📡 Syncing from node {url}");
                let client = NodeClient::new(url.clone(), run_cmd.source_params.client_config())
                    .context("Creating the RPC client")?;
                (Arc::new(client), overlay, true)
            }
            (None, Some(mock)) => {
                tracing::info!("🎭 No node endpoint, serving blocks from the mock data file");
                (Arc::new(MockSource::new(mock, run_cmd.source_params.mock_head)), None, false)
            }
            (None, None) => bail!("Either --node-url or --mock-file must be given."),
        };

    let mut controller = ac_sync::build_sync(
        source,
        store,
        overlay,
        run_cmd.sync_params.pipeline_config(can_fork),
        run_cmd.sync_params.controller_config(),
        run_cmd.sync_params.probe_interval,
    );

    let ctx = ServiceContext::new();
    let _signal_watcher = AbortOnDrop::spawn({
        let ctx = ctx.clone();
        async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => tracing::info!("🛑 Shutdown signal received"),
                Err(err) => tracing::error!("Cannot listen for shutdown signals: {err:#}"),
            }
            ctx.cancel_global();
        }
    });

    controller.run(ctx).await.context("Running the sync service")?;
    tracing::info!("🏁 Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Setting up SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Setting up SIGINT handler")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("Setting up ctrl-c handler")?;
    Ok(())
}
