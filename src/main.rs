use anyhow::Context;
use clap::Parser;
use pg_mirror::postgres::PgChangeSource;
use pg_mirror::{Collector, Config, Processor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-mirror")]
#[command(about = "Mirrors row changes between PostgreSQL databases", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);
    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    info!(
        source_host = %config.source.host,
        source_database = %config.source.database,
        destination_host = %config.destination.host,
        destination_database = %config.destination.database,
        slot = %config.collector.slot_name,
        publication = %config.collector.publication,
        "Configuration summary"
    );

    let processor = Processor::new(config.destination.pg_config(), config.processor.clone())
        .context("invalid processor configuration")?;
    let source = PgChangeSource::new(config.source.pg_config(), &config.collector);
    let collector = Collector::new(config.collector.clone(), Arc::new(source), Arc::new(processor));

    collector.start().await.context("failed to start collector")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    collector.stop().await;
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_mirror=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_mirror=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
