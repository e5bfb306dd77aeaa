use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tick_exchange::config::Settings;
use tick_exchange::feed::TickFeed;
use tick_exchange::metrics::install_recorder;
use tick_exchange::server::serve;
use tick_exchange::Exchange;

#[derive(Parser, Debug)]
#[command(name = "exchange", about = "Simulated exchange replaying recorded ticks")]
struct Args {
    #[arg(long, default_value = "config/example.yaml")]
    config: String,
    /// Overrides `listen_addr` from the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.config)?;
    let addr = match args.listen {
        Some(addr) => addr,
        None => settings.listen_addr.parse()?,
    };
    if let Some(metrics_addr) = &settings.metrics_addr {
        install_recorder(metrics_addr.parse()?)?;
        info!(%metrics_addr, "metrics exporter listening");
    }

    let feed = Arc::new(TickFeed::from_config(&settings.feed)?);
    let exchange = Arc::new(Exchange::new(feed, settings));
    let tasks = exchange.start()?;

    serve(Arc::clone(&exchange), addr, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    let _ = tasks.matching.await;
    let _ = tasks.feed.await;
    Ok(())
}
