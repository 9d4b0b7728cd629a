// relay-node: circuit relay daemon.

mod config;

use std::path::PathBuf;

use anyhow::{bail, Context};
use rand::rngs::OsRng;
use relay_core::{Host, Keypair, MuxConfig, RelayService, TransportRegistry};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("relay-node {}", VERSION);
                return Ok(());
            }
            "--config" => match args.next() {
                Some(p) => config_path = Some(PathBuf::from(p)),
                None => bail!("--config needs a path"),
            },
            other => bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load(config_path.as_deref()).context("load config")?;
    let listen = cfg.listen_addrs()?;
    let relay_config = cfg.relay_config()?;
    let keypair = Keypair::generate(cfg.key_type()?, cfg.key_bits, &mut OsRng)
        .context("generate identity")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let host = Host::new(
            keypair,
            TransportRegistry::with_network_defaults(),
            MuxConfig::default(),
            listen,
        )
        .await
        .context("start host")?;
        let _relay = RelayService::spawn(&host, relay_config).context("enable relay")?;

        tracing::info!(peer = %host.peer_id(), "relay node started");
        for addr in host.p2p_addrs() {
            println!("{addr}");
        }

        shutdown_signal().await?;
        tracing::info!("shutting down");
        host.close().await;
        Ok(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
