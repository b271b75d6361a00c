use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use proto_schedulo::schedulo::scheduler_server::SchedulerServer;
use schedulo::persist::{Driver, Persistence, RedisCache, RedisCacheConfig, SqlStore, SqlStoreConfig};

mod config;
mod server;

/// Schedulo is a persistent job scheduler: events are accepted over gRPC,
/// recorded in SQL behind a write-through Redis cache, and streamed to topic
/// subscribers when they fire.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file [default: $HOME/schedulo.config.yaml].
    #[clap(long = "path-to-config")]
    path_to_config: Option<PathBuf>,
    /// TCP port to listen on; overrides the configuration file [default: 9876].
    #[clap(long)]
    port: Option<u16>,
    /// TCP address to listen on; overrides the configuration file [default: 0.0.0.0].
    #[clap(long)]
    addr: Option<String>,
}

fn main() -> anyhow::Result<()> {
    // Reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async_main(args));

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let config_path = match args.path_to_config {
        Some(path) => path,
        None => {
            let home = std::env::var("HOME").context("HOME is not set")?;
            PathBuf::from(home).join("schedulo.config.yaml")
        }
    };

    let mut cfg = config::load(&config_path);
    if let Some(port) = args.port {
        cfg.network.port = port;
    }
    if let Some(addr) = args.addr {
        cfg.network.addr = addr;
    }

    // Bind before dialing the stores, so a bad address fails fast.
    let listener = tokio::net::TcpListener::bind((cfg.network.addr.as_str(), cfg.network.port))
        .await
        .context("failed to bind server port")?;

    let cache = Arc::new(
        RedisCache::connect(RedisCacheConfig {
            addr: cfg.cache.addr.clone(),
            pass: cfg.cache.pass.clone(),
            db: cfg.cache.db,
        })
        .await
        .context("failed to initialize the Redis cache")?,
    );

    let driver: Driver = cfg
        .database
        .driver
        .parse()
        .context("parsing the sql driver")?;
    let store = Arc::new(
        SqlStore::connect(
            Arc::clone(&cache) as Arc<dyn Persistence>,
            SqlStoreConfig {
                url: cfg.database.url.clone(),
                driver,
            },
        )
        .await
        .context("failed to initialize the SQL store")?,
    );

    let service = server::ScheduloServer::new(cfg.scheduler_config(), store, cache)
        .await
        .context("failed to start the scheduler")?;
    let scheduler = service.scheduler().clone();

    tracing::info!(
        addr = %cfg.network.addr,
        port = cfg.network.port,
        "listening"
    );

    tonic::transport::Server::builder()
        .add_service(SchedulerServer::new(service))
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::TcpListenerStream::new(listener),
            shutdown_signal(),
        )
        .await
        .context("server loop failed")?;

    scheduler.stop();
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("shutdown signal received");
}
