//! `GigaVector` Server binary - TCP wire-protocol server for `GigaVector`.

use clap::{Parser, ValueEnum};
use gigavector_core::{DistanceMetric, GigaConfig};
use gigavector_server::{Engine, EngineIndexKind, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// `GigaVector` Server - embeddable vector-search engine over a binary wire
/// protocol.
#[derive(Parser, Debug)]
#[command(name = "gigavector-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory for persistent storage.
    #[arg(long, default_value = "./data", env = "GIGAVECTOR_DATA_DIR")]
    data_dir: PathBuf,

    /// Optional `gigavector.toml` to layer under CLI/env overrides.
    #[arg(long, env = "GIGAVECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Host address to bind to.
    #[arg(long, env = "GIGAVECTOR_HOST")]
    host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "GIGAVECTOR_PORT")]
    port: Option<u16>,

    /// Vector dimension for this collection. Required on first run; ignored
    /// (and validated against) when an existing snapshot is found in
    /// `data_dir`.
    #[arg(long, env = "GIGAVECTOR_DIMENSION")]
    dimension: usize,

    /// Distance metric this collection's index is built for.
    #[arg(long, value_enum, default_value = "euclidean", env = "GIGAVECTOR_METRIC")]
    metric: MetricArg,

    /// ANN backend.
    #[arg(long, value_enum, default_value = "flat", env = "GIGAVECTOR_INDEX")]
    index: IndexArg,
}

/// CLI metric option, mirroring [`DistanceMetric`] (spec.md §4.1).
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum MetricArg {
    #[default]
    Euclidean,
    Cosine,
    Dot,
    Manhattan,
    Hamming,
}

impl From<MetricArg> for DistanceMetric {
    fn from(m: MetricArg) -> Self {
        match m {
            MetricArg::Euclidean => DistanceMetric::Euclidean,
            MetricArg::Cosine => DistanceMetric::Cosine,
            MetricArg::Dot => DistanceMetric::Dot,
            MetricArg::Manhattan => DistanceMetric::Manhattan,
            MetricArg::Hamming => DistanceMetric::Hamming,
        }
    }
}

/// CLI index-kind option, mirroring [`EngineIndexKind`] (spec.md §2.5-§2.7).
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum IndexArg {
    #[default]
    Flat,
    Hnsw,
    Ivfpq,
}

impl From<IndexArg> for EngineIndexKind {
    fn from(i: IndexArg) -> Self {
        match i {
            IndexArg::Flat => EngineIndexKind::Flat,
            IndexArg::Hnsw => EngineIndexKind::Hnsw,
            IndexArg::Ivfpq => EngineIndexKind::IvfPq,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GigaConfig::load_from_path(path)?,
        None => GigaConfig::load().unwrap_or_default(),
    };
    if let Some(host) = &args.host {
        config.server.bind_address = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    tracing::info!(data_dir = %args.data_dir.display(), "starting GigaVector server");

    let engine = Arc::new(Engine::open(
        args.data_dir,
        args.dimension,
        args.metric.into(),
        args.index.into(),
        &config,
    )?);

    let server = Server::bind(engine, config.server.clone())?;
    tracing::info!(
        address = %format!("{}:{}", config.server.bind_address, config.server.port),
        "GigaVector server listening"
    );
    let _handle = server.start();

    // No per-request cancellation tokens and no cooperative suspension
    // (spec.md §5): the server runs until the process is killed, at which
    // point the OS reclaims the listener and worker threads. `ServerHandle::stop`
    // exists for embedders that hold the handle themselves (tests, `Database`
    // wrappers) rather than for this binary's own lifecycle.
    loop {
        std::thread::park();
    }
}
