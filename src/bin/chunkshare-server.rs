use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chunkshare::server::{FileShareServer, ServerConfig};
use chunkshare::store::Catalog;
use chunkshare::{runtime, RpcConfig, RpcServer};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Tcp,
    Quic,
}

/// Ownership-scoped file sharing server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 1234)]
    port: u16,

    #[arg(short, long, value_enum, default_value_t = Transport::Tcp)]
    transport: Transport,

    /// Directory holding uploaded files
    #[arg(short, long, default_value = "files")]
    files_dir: PathBuf,

    /// SQLite catalog path
    #[arg(short, long, default_value = "project.db")]
    database: PathBuf,

    /// Keep the catalog in memory instead of SQLite
    #[arg(long, default_value = "false")]
    in_memory: bool,

    /// TLS certificate (QUIC only)
    #[arg(long, default_value = "certs/test_cert.pem")]
    cert: PathBuf,

    /// TLS private key (QUIC only)
    #[arg(long, default_value = "certs/test_key.pem")]
    key: PathBuf,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    debug: bool,
}

fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(runtime::server_worker_threads())
        .enable_all()
        .build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<(), BoxError> {
    let mut config = ServerConfig::new(&args.files_dir);
    if !args.in_memory {
        config = config.with_database(&args.database);
    }
    let rpc_config = RpcConfig::new(&args.cert, format!("{}:{}", args.host, args.port))
        .with_key_path(&args.key);
    info!(
        files_dir = %config.files_dir.display(),
        database = ?config.database,
        transport = ?args.transport,
        "starting server"
    );

    match &config.database {
        Some(database) => {
            let server = FileShareServer::open_sqlite(&config.files_dir, database)?;
            serve(server, rpc_config, args.transport).await
        }
        None => serve(FileShareServer::in_memory(&config.files_dir), rpc_config, args.transport).await,
    }
}

async fn serve<C: Catalog + 'static>(
    server: FileShareServer<C>,
    config: RpcConfig,
    transport: Transport,
) -> Result<(), BoxError> {
    let mut rpc = RpcServer::new(config);
    server.install(&rpc).await;
    match transport {
        Transport::Tcp => {
            let listener = rpc.bind_tcp().await?;
            rpc.start_tcp(listener).await?;
        }
        Transport::Quic => {
            let quic = rpc.bind()?;
            rpc.start(quic).await?;
        }
    }
    Ok(())
}
