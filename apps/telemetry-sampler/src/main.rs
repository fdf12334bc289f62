mod actuator;
mod config;
mod extract;
mod http;
mod poller;
mod sampler;
mod snapshot;

use crate::actuator::Actuator;
use crate::config::Config;
use crate::poller::Poller;
use crate::sampler::{Assembler, Sampler};
use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::watch;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_sampler=info".into());
    // stdout carries the snapshot stream.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let mut poller = Poller::new(config.tick_interval);
    for channel in &config.channels {
        let stream = TcpStream::connect(&channel.addr)
            .await
            .with_context(|| format!("failed to connect {} to {}", channel.name, channel.addr))?;
        tracing::info!(
            channel = %channel.name,
            addr = %channel.addr,
            staleness = %channel.staleness,
            "stream connected"
        );
        poller.register(channel.name.clone(), stream);
    }

    let actuator = match &config.control {
        Some(control) => {
            let actuator = Actuator::open(control, &config.channels).await?;
            tracing::info!(
                target_addr = %actuator.target(),
                channel = %control.channel,
                "actuation enabled"
            );
            Some(actuator)
        }
        None => None,
    };

    let mut sampler = Sampler::new(
        poller,
        Assembler::new(&config.channels),
        config.read_buffer_bytes,
        actuator,
    );

    let http_handle = match config.http_bind.clone() {
        Some(bind) => {
            let (status_tx, status_rx) = watch::channel(None);
            sampler = sampler.with_status(status_tx);
            let state = http::HttpState { status: status_rx };
            Some(tokio::spawn(async move {
                if let Err(err) = http::serve(&bind, state).await {
                    tracing::error!(error = %err, "status HTTP exited");
                }
            }))
        }
        None => None,
    };

    tracing::info!(
        channels = config.channels.len(),
        tick_ms = config.tick_interval.as_millis() as u64,
        read_buffer_bytes = config.read_buffer_bytes,
        "telemetry-sampler running"
    );

    let mut stdout = std::io::stdout();
    let result = tokio::select! {
        res = sampler.run(&mut stdout) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    if let Some(handle) = http_handle {
        handle.abort();
    }
    if let Err(err) = &result {
        tracing::error!(error = %err, "sampling loop stopped");
    }
    result
}
