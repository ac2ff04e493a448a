// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use metrics_emitter::{
    cloud,
    config::{load, CloudConfig, EmitterConfig},
    delivery::PushgatewayClient,
    runtime::ScrapeState,
    scheduler::{DeliveryOutcome, Scheduler},
    server::{app, cancel_on_shutdown_signal, server},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Define the `GIT_REVISION` and `VERSION` consts
metrics_emitter::bin_version!();

/// user agent we use when pushing metrics
static APP_USER_AGENT: &str = const_str::concat!(env!("CARGO_BIN_NAME"), "/", VERSION);

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_BIN_NAME"),
    version = VERSION,
    rename_all = "kebab-case"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Generate values every interval and push them to a Pushgateway.
    Push {
        #[arg(
            long,
            short,
            default_value = "./metrics-emitter.yaml",
            help = "Specify the config file path to use"
        )]
        config: String,
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },
    /// Serve the metrics for scraping, generating new values on every scrape.
    Serve {
        #[arg(
            long,
            short,
            default_value = "./metrics-emitter.yaml",
            help = "Specify the config file path to use"
        )]
        config: String,
        #[arg(long, short, default_value = "0.0.0.0:8081")]
        listen: String,
    },
    /// Send one batch of data points to a cloud monitoring API.
    PutCloud {
        #[arg(
            long,
            short,
            default_value = "./cloud-metrics.yaml",
            help = "Specify the config file path to use"
        )]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match args.command {
        Command::Push { config, once } => push(&config, once).await,
        Command::Serve { config, listen } => serve(&config, &listen).await,
        Command::PutCloud { config } => {
            let config: CloudConfig = load(&config)?;
            let requests = cloud::put_batch(&config).await?;
            tracing::info!(requests, datums = config.data.len(), "metric data sent");
            Ok(())
        }
    }
}

async fn push(config: &str, once: bool) -> Result<()> {
    let config: EmitterConfig = load(config)?;
    let push = config.push()?;
    let (registry, generator) = config.build()?;
    let client = PushgatewayClient::new(&push.url, push.timeout, APP_USER_AGENT)?
        .with_bearer_token(push.bearer_token.clone());
    let mut scheduler = Scheduler::new(
        registry,
        generator,
        client,
        push.grouping_key(),
        push.mode,
        push.interval,
    );

    if once {
        let report = scheduler.tick().await?;
        if let DeliveryOutcome::Failed { cause } = report.outcome {
            bail!("{cause}");
        }
        tracing::info!(sampled = report.stats.sampled, "metrics pushed once");
        return Ok(());
    }
    scheduler.run(cancel_on_shutdown_signal()).await?;
    Ok(())
}

async fn serve(config: &str, listen: &str) -> Result<()> {
    let config: EmitterConfig = load(config)?;
    let (registry, generator) = config.build()?;
    let app = app(ScrapeState::new(registry, generator));

    let addr = listen.parse::<SocketAddr>()?;
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    server(listener, app, cancel_on_shutdown_signal()).await?;
    Ok(())
}
