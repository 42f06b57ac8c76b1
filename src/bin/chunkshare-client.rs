use clap::{Parser, ValueEnum};
use futures::{Stream, StreamExt};
use std::{io, path::PathBuf, pin::pin, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use chunkshare::client::{
    ClientConfig, ClientError, FileShareClient, INPUT_PROMPT, INVALID_COMMAND, LOGGED_IN,
};
use chunkshare::commands::parse_command;
use chunkshare::{messages, RpcClient, RpcConfig, RpcError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Tcp,
    Quic,
}

/// Interactive file sharing client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name to register and log in as
    username: String,

    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 1234)]
    port: u16,

    #[arg(short, long, value_enum, default_value_t = Transport::Tcp)]
    transport: Transport,

    /// Upload source and download destination
    #[arg(short, long, default_value = "files")]
    files_dir: PathBuf,

    /// Where automated runs store their CSV results
    #[arg(short, long, default_value = "experiments")]
    experiments_dir: PathBuf,

    /// Seconds to wait for the server between two transfer items
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// TLS certificate of the server (QUIC only)
    #[arg(long, default_value = "certs/test_cert.pem")]
    cert: PathBuf,

    /// TLS server name (QUIC only)
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let addr = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await?
        .next()
        .ok_or_else(|| RpcError::ConfigError(format!("cannot resolve {}", args.host)))?;
    let config = RpcConfig::new(&args.cert, "0.0.0.0:0")
        .with_server_name(args.server_name.as_str())
        .with_default_stream_timeout(Duration::from_secs(args.timeout));
    debug!(%addr, transport = ?args.transport, "connecting");
    let rpc = match args.transport {
        Transport::Tcp => RpcClient::connect_tcp(addr, config).await?,
        Transport::Quic => RpcClient::connect(addr, config).await?,
    };

    let client_config = ClientConfig::new(&args.files_dir, &args.experiments_dir);
    let client = match FileShareClient::register(rpc, &args.username, client_config).await {
        Ok(client) => client,
        Err(ClientError::InvalidUsername) => {
            println!("{}", messages::INVALID_USERNAME);
            return Ok(());
        }
        Err(err) => {
            debug!("registration failed: {err}");
            println!("{}", messages::DATA_ERROR);
            return Ok(());
        }
    };
    println!("{LOGGED_IN} {}.", client.username());

    let mut lines = pin!(command_lines());
    while let Some(line) = lines.next().await {
        match parse_command(&line?) {
            Ok(command) => {
                if !client.execute(command).await {
                    break;
                }
            }
            Err(err) => {
                debug!("{err}");
                println!("{INVALID_COMMAND}");
            }
        }
    }
    Ok(())
}

/// Prompts for and yields stdin lines until EOF.
fn command_lines() -> impl Stream<Item = io::Result<String>> {
    async_stream::try_stream! {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            println!("{INPUT_PROMPT}");
            match lines.next_line().await? {
                Some(line) => yield line,
                None => break,
            }
        }
    }
}
