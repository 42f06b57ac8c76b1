use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use s2n_quic::{client::Connect, provider::limits::Limits, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    future::Future,
    net::SocketAddr,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::RwLock,
};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

pub mod bench;
pub mod channel;
pub mod client;
pub mod codec;
pub mod commands;
pub mod controller;
pub mod error;
pub mod frame;
pub mod messages;
pub mod server;
pub mod session;
pub mod store;
pub mod streaming;

pub use channel::{ChannelReceiver, ChannelSender, Event, INITIAL_REQUEST_N};
pub use controller::{TransferController, TransferEvent};
pub use error::{ErrorKind, TransferError, TransferOutcome};
pub use messages::{Command, TransferRequest};
pub use session::Peer;

use frame::{Frame, FrameCodec};

pub mod runtime {
    //! Helpers for configuring Tokio runtimes.
    use std::{env, thread};

    /// Environment variable that controls the number of server worker threads.
    pub const SERVER_THREADS_ENV: &str = "CHUNKSHARE_SERVER_THREADS";

    /// Returns the worker thread count derived from [`SERVER_THREADS_ENV`],
    /// falling back to the number of available CPU threads.
    pub fn server_worker_threads() -> usize {
        threads_from_env(SERVER_THREADS_ENV).unwrap_or_else(default_worker_threads)
    }

    pub fn threads_from_env(key: &str) -> Option<usize> {
        let raw = env::var(key).ok()?;
        parse_threads(&raw)
    }

    fn default_worker_threads() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn parse_threads(raw: &str) -> Option<usize> {
        let value = raw.trim().parse::<usize>().ok()?;
        (value > 0).then_some(value)
    }

}

#[cfg(not(test))]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Method name the transfer controller binds its channel handler to.
pub const TRANSFER_METHOD: &str = "transfer";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    id: u64,
    method: String,
    params: Vec<u8>,
}

impl RpcRequest {
    pub fn new(id: u64, method: String, params: Vec<u8>) -> Self {
        Self { id, method, params }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    id: u64,
    result: Option<Vec<u8>>,
    error: Option<String>,
}

impl RpcResponse {
    pub fn new(id: u64, result: Option<Vec<u8>>, error: Option<String>) -> Self {
        Self { id, result, error }
    }

    pub fn from_result(id: u64, result: Result<Vec<u8>, RpcError>) -> Self {
        match result {
            Ok(data) => Self::new(id, Some(data), None),
            Err(e) => Self::new(id, None, Some(e.to_string())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn result(&self) -> Option<&Vec<u8>> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&String> {
        self.error.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub cert_path: PathBuf,

    pub key_path: Option<PathBuf>,

    pub server_name: String,

    pub bind_address: String,

    pub keep_alive_interval: Option<Duration>,

    /// Longest a client waits between two items of an open channel.
    pub default_stream_timeout: Duration,
}

impl RpcConfig {
    pub fn new<P: Into<PathBuf>>(cert_path: P, bind_address: impl Into<String>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: None,
            server_name: "localhost".to_string(),
            bind_address: bind_address.into(),
            keep_alive_interval: Some(Duration::from_secs(30)),
            default_stream_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_key_path<P: Into<PathBuf>>(mut self, key_path: P) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    pub fn with_default_stream_timeout(mut self, timeout: Duration) -> Self {
        self.default_stream_timeout = timeout;
        self
    }
}

type AsyncHandlerFn = Box<
    dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, RpcError>> + Send>>
        + Send
        + Sync,
>;

type AsyncChannelHandlerFn = Arc<
    dyn Fn(Bytes, ChannelSender, ChannelReceiver) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct ChannelRoute {
    initial_request_n: u32,
    handler: AsyncChannelHandlerFn,
}

#[derive(Clone)]
pub struct RpcServer {
    pub handlers: Arc<RwLock<HashMap<String, AsyncHandlerFn>>>,

    channel_handlers: Arc<RwLock<HashMap<String, ChannelRoute>>>,

    pub socket_addr: Option<SocketAddr>,

    pub config: RpcConfig,
}

/// A duplex byte stream: one QUIC bidirectional stream or one TCP connection.
#[async_trait]
pub(crate) trait StreamAdapter: Send {
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError>;
    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError>;
    async fn close_send(&mut self) -> Result<(), RpcError>;
}

#[async_trait]
impl StreamAdapter for s2n_quic::stream::BidirectionalStream {
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError> {
        self.send(data)
            .await
            .map_err(|err| RpcError::StreamError(err.to_string()))
    }

    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError> {
        self.receive()
            .await
            .map_err(|err| RpcError::StreamError(err.to_string()))
    }

    async fn close_send(&mut self) -> Result<(), RpcError> {
        self.finish()
            .map_err(|err| RpcError::StreamError(err.to_string()))
    }
}

#[async_trait]
impl StreamAdapter for TcpStream {
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError> {
        self.write_all(&data)
            .await
            .map_err(|err| RpcError::StreamError(err.to_string()))
    }

    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError> {
        let mut buffer = BytesMut::with_capacity(8192);
        let read = self
            .read_buf(&mut buffer)
            .await
            .map_err(|err| RpcError::StreamError(err.to_string()))?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(buffer.freeze()))
    }

    async fn close_send(&mut self) -> Result<(), RpcError> {
        AsyncWriteExt::shutdown(self)
            .await
            .map_err(|err| RpcError::StreamError(err.to_string()))
    }
}

#[async_trait]
pub(crate) trait ConnectionAdapter: Send + Sync {
    async fn open_bidirectional_stream(&mut self) -> Result<Box<dyn StreamAdapter + Send>, RpcError>;
}

pub(crate) struct QuicConnectionAdapter {
    inner: s2n_quic::Connection,
}

#[async_trait]
impl ConnectionAdapter for QuicConnectionAdapter {
    async fn open_bidirectional_stream(&mut self) -> Result<Box<dyn StreamAdapter + Send>, RpcError> {
        let stream = self
            .inner
            .open_bidirectional_stream()
            .await
            .map_err(|e| RpcError::StreamError(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

/// TCP has no native streams, so every request or channel gets its own connection.
pub(crate) struct TcpConnectionAdapter {
    addr: SocketAddr,
}

#[async_trait]
impl ConnectionAdapter for TcpConnectionAdapter {
    async fn open_bidirectional_stream(&mut self) -> Result<Box<dyn StreamAdapter + Send>, RpcError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| RpcError::ConnectionError(e.to_string()))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
pub(crate) trait ServerConnectionAdapter: Send {
    async fn accept_bidirectional_stream(
        &mut self,
    ) -> Result<Option<Box<dyn StreamAdapter + Send>>, RpcError>;
}

struct QuicServerConnection {
    inner: s2n_quic::connection::Connection,
}

#[async_trait]
impl ServerConnectionAdapter for QuicServerConnection {
    async fn accept_bidirectional_stream(
        &mut self,
    ) -> Result<Option<Box<dyn StreamAdapter + Send>>, RpcError> {
        match self.inner.accept_bidirectional_stream().await {
            Ok(Some(stream)) => Ok(Some(Box::new(stream))),
            Ok(None) => Ok(None),
            Err(e) => Err(RpcError::StreamError(e.to_string())),
        }
    }
}

struct TcpServerConnection {
    stream: Option<TcpStream>,
}

#[async_trait]
impl ServerConnectionAdapter for TcpServerConnection {
    async fn accept_bidirectional_stream(
        &mut self,
    ) -> Result<Option<Box<dyn StreamAdapter + Send>>, RpcError> {
        Ok(self
            .stream
            .take()
            .map(|stream| Box::new(stream) as Box<dyn StreamAdapter + Send>))
    }
}

#[async_trait]
pub(crate) trait ServerAdapter: Send {
    async fn accept(&mut self) -> Option<Box<dyn ServerConnectionAdapter>>;
}

struct QuicServerAdapter {
    inner: s2n_quic::Server,
}

#[async_trait]
impl ServerAdapter for QuicServerAdapter {
    async fn accept(&mut self) -> Option<Box<dyn ServerConnectionAdapter>> {
        self.inner
            .accept()
            .await
            .map(|connection| {
                Box::new(QuicServerConnection { inner: connection })
                    as Box<dyn ServerConnectionAdapter>
            })
    }
}

struct TcpServerAdapter {
    listener: TcpListener,
}

#[async_trait]
impl ServerAdapter for TcpServerAdapter {
    async fn accept(&mut self) -> Option<Box<dyn ServerConnectionAdapter>> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted tcp connection");
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!("could not disable nagle: {err}");
                    }
                    return Some(Box::new(TcpServerConnection {
                        stream: Some(stream),
                    }));
                }
                Err(err) => warn!("tcp accept failed: {err}"),
            }
        }
    }
}

fn transport_limits() -> Result<Limits, RpcError> {
    let limit_err = |e| RpcError::ConfigError(format!("Failed to set transport limits: {:?}", e));
    Limits::new()
        .with_max_open_local_bidirectional_streams(10_000)
        .map_err(limit_err)?
        .with_max_open_remote_bidirectional_streams(10_000)
        .map_err(limit_err)?
        .with_data_window(16 * 1024 * 1024)
        .map_err(limit_err)?
        .with_bidirectional_local_data_window(8 * 1024 * 1024)
        .map_err(limit_err)
}

impl RpcServer {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            channel_handlers: Arc::new(RwLock::new(HashMap::new())),
            socket_addr: None,
            config,
        }
    }

    pub async fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, RpcError>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(
            method.to_string(),
            Box::new(move |params: Vec<u8>| {
                Box::pin(handler(params)) as Pin<Box<dyn Future<Output = _> + Send>>
            }),
        );
    }

    pub async fn register_typed<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |params: Vec<u8>| {
            let handler = handler.clone();
            async move {
                let request: Req = bincode::deserialize(&params)?;
                let response = handler(request).await?;
                Ok(bincode::serialize(&response)?)
            }
        })
        .await;
    }

    /// Binds `handler` to channels opened for `method`. Each side of a new
    /// channel grants its peer `initial_request_n` items up front.
    pub async fn register_channel<F, Fut>(&self, method: &str, initial_request_n: u32, handler: F)
    where
        F: Fn(Bytes, ChannelSender, ChannelReceiver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: AsyncChannelHandlerFn = Arc::new(move |metadata, sender, receiver| {
            Box::pin(handler(metadata, sender, receiver))
        });
        let mut routes = self.channel_handlers.write().await;
        routes.insert(
            method.to_string(),
            ChannelRoute {
                initial_request_n,
                handler,
            },
        );
    }

    pub async fn start(&mut self, server: s2n_quic::Server) -> Result<(), RpcError> {
        let mut adapter = QuicServerAdapter { inner: server };
        self.start_with_adapter(&mut adapter).await
    }

    pub async fn start_tcp(&mut self, listener: TcpListener) -> Result<(), RpcError> {
        let mut adapter = TcpServerAdapter { listener };
        self.start_with_adapter(&mut adapter).await
    }

    async fn start_with_adapter<A>(&mut self, server: &mut A) -> Result<(), RpcError>
    where
        A: ServerAdapter,
    {
        while let Some(mut connection) = server.accept().await {
            let handlers = self.handlers.clone();
            let channel_handlers = self.channel_handlers.clone();

            tokio::spawn(async move {
                while let Ok(Some(stream)) = connection.accept_bidirectional_stream().await {
                    tokio::spawn(Self::handle_stream(
                        handlers.clone(),
                        channel_handlers.clone(),
                        stream,
                    ));
                }
            });
        }

        Ok(())
    }

    async fn handle_stream(
        handlers: Arc<RwLock<HashMap<String, AsyncHandlerFn>>>,
        channel_handlers: Arc<RwLock<HashMap<String, ChannelRoute>>>,
        mut stream: Box<dyn StreamAdapter + Send>,
    ) {
        let mut buffer = BytesMut::with_capacity(8192);
        let mut codec = FrameCodec;

        // The first frame decides whether this is a single request or a channel.
        let opening = loop {
            match codec.decode(&mut buffer) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(e) => {
                    debug!("dropping stream with malformed opening frame: {e}");
                    return;
                }
            }
            match stream.receive_bytes().await {
                Ok(Some(bytes)) => buffer.extend_from_slice(&bytes),
                Ok(None) => {
                    debug!("stream closed before its opening frame");
                    return;
                }
                Err(e) => {
                    debug!("stream error before opening frame: {e}");
                    return;
                }
            }
        };

        match opening {
            Frame::Request(body) => {
                let Some(response) = Self::dispatch_request(&handlers, &body).await else {
                    return;
                };
                let reply = bincode::serialize(&response)
                    .map_err(RpcError::from)
                    .and_then(|body| Frame::Response(Bytes::from(body)).to_bytes());
                match reply {
                    Ok(bytes) => {
                        if let Err(e) = stream.send_bytes(bytes).await {
                            debug!("failed to send response: {e}");
                        }
                        let _ = stream.close_send().await;
                    }
                    Err(e) => warn!("failed to encode response: {e}"),
                }
            }
            Frame::OpenChannel(body) => {
                let request = match bincode::deserialize::<RpcRequest>(&body) {
                    Ok(request) => request,
                    Err(e) => {
                        debug!("malformed channel request: {e}");
                        return;
                    }
                };
                let route = channel_handlers.read().await.get(request.method()).cloned();
                match route {
                    Some(route) => {
                        debug!(method = request.method(), "opening channel");
                        let (sender, receiver) =
                            channel::open(stream, buffer, route.initial_request_n);
                        (route.handler)(Bytes::from(request.params), sender, receiver).await;
                    }
                    None => {
                        let message = format!("Unknown method: {}", request.method());
                        Self::reject_channel(stream, message).await;
                    }
                }
            }
            other => debug!("unexpected opening frame: {}", other.name()),
        }
    }

    async fn dispatch_request(
        handlers: &Arc<RwLock<HashMap<String, AsyncHandlerFn>>>,
        body: &[u8],
    ) -> Option<RpcResponse> {
        let request = match bincode::deserialize::<RpcRequest>(body) {
            Ok(request) => request,
            Err(e) => {
                debug!("malformed rpc request: {e}");
                return None;
            }
        };
        debug!(method = request.method(), "received rpc request");
        let handlers = handlers.read().await;
        let response = match handlers.get(request.method()) {
            Some(handler) => {
                let result = handler(request.params().to_vec()).await;
                RpcResponse::from_result(request.id(), result)
            }
            None => RpcResponse::new(
                request.id(),
                None,
                Some(format!("Unknown method: {}", request.method())),
            ),
        };
        Some(response)
    }

    async fn reject_channel(mut stream: Box<dyn StreamAdapter + Send>, message: String) {
        let payload = messages::ErrorPayload::new(ErrorKind::Protocol, message);
        let frame = codec::encode_control(&payload)
            .map_err(|e| RpcError::ProtocolError(e.to_string()))
            .and_then(|payload| Frame::Error(payload).to_bytes());
        if let Ok(bytes) = frame {
            let _ = stream.send_bytes(bytes).await;
        }
        let _ = stream.close_send().await;
    }

    pub fn bind(&mut self) -> Result<s2n_quic::Server, RpcError> {
        let cert_path = canonicalize_path(&self.config.cert_path)?;
        let key_path =
            self.config.key_path.as_ref().ok_or_else(|| {
                RpcError::ConfigError("Server key path not configured".to_string())
            })?;
        let key_path = canonicalize_path(key_path)?;

        let server = s2n_quic::Server::builder()
            .with_tls((cert_path.as_path(), key_path.as_path()))
            .map_err(|e| RpcError::TlsError(format!("{:?}", e)))?
            .with_limits(transport_limits()?)
            .map_err(|e| RpcError::ConfigError(format!("Failed to apply limits: {:?}", e)))?
            .with_io(self.config.bind_address.as_str())
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?
            .start()
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?;

        let local_addr = server.local_addr().map_err(|_err| {
            RpcError::ConfigError("Could not retrieve local_addr() from server".to_string())
        })?;

        self.socket_addr = Some(local_addr);
        info!("quic server listening on {local_addr}");
        Ok(server)
    }

    pub async fn bind_tcp(&mut self) -> Result<TcpListener, RpcError> {
        let listener = TcpListener::bind(self.config.bind_address.as_str()).await?;
        let local_addr = listener.local_addr()?;
        self.socket_addr = Some(local_addr);
        info!("tcp server listening on {local_addr}");
        Ok(listener)
    }
}

fn canonicalize_path(path: &Path) -> Result<std::path::PathBuf, RpcError> {
    fs::canonicalize(path).map_err(|e| {
        RpcError::ConfigError(format!("Failed to canonicalize {}: {e}", path.display()))
    })
}

pub struct RpcClient {
    connection: Arc<RwLock<Box<dyn ConnectionAdapter + Send + Sync>>>,
    config: RpcConfig,
    pub next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub async fn connect(connect_addr: SocketAddr, config: RpcConfig) -> Result<Self, RpcError> {
        let client = Client::builder()
            .with_tls(config.cert_path.as_path())
            .map_err(|e| RpcError::TlsError(format!("{:?}", e)))?
            .with_limits(transport_limits()?)
            .map_err(|e| RpcError::ConfigError(format!("Failed to apply client limits: {:?}", e)))?
            .with_io(config.bind_address.as_str())
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?
            .start()
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?;

        let connect = Connect::new(connect_addr).with_server_name(config.server_name.as_str());
        let mut connection = client
            .connect(connect)
            .await
            .map_err(|e| RpcError::ConnectionError(e.to_string()))?;

        if config.keep_alive_interval.is_some() {
            connection
                .keep_alive(true)
                .map_err(|e| RpcError::ConfigError(e.to_string()))?;
        }

        Ok(Self::with_connection(
            Box::new(QuicConnectionAdapter { inner: connection }),
            config,
        ))
    }

    /// Connects over plain TCP. Nothing is exchanged until the first call.
    pub async fn connect_tcp(connect_addr: SocketAddr, config: RpcConfig) -> Result<Self, RpcError> {
        // Probe once so an unreachable server fails here rather than on first use.
        TcpStream::connect(connect_addr)
            .await
            .map_err(|e| RpcError::ConnectionError(e.to_string()))?;
        Ok(Self::with_connection(
            Box::new(TcpConnectionAdapter { addr: connect_addr }),
            config,
        ))
    }

    pub(crate) fn with_connection(
        connection: Box<dyn ConnectionAdapter + Send + Sync>,
        config: RpcConfig,
    ) -> Self {
        Self {
            connection: Arc::new(RwLock::new(connection)),
            config,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub async fn call(&self, method: &str, params: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = RpcRequest::new(id, method.to_string(), params);
        let req_data = bincode::serialize(&req)?;

        let mut stream = {
            let mut conn = self.connection.write().await;
            conn.open_bidirectional_stream().await?
        };

        stream
            .send_bytes(Frame::Request(Bytes::from(req_data)).to_bytes()?)
            .await?;

        let read_future = async {
            let mut buffer = BytesMut::with_capacity(1024);
            let mut codec = FrameCodec;
            loop {
                if let Some(frame) = codec.decode(&mut buffer)? {
                    let body = match frame {
                        Frame::Response(body) => body,
                        other => {
                            return Err(RpcError::ProtocolError(format!(
                                "expected a response frame, got {}",
                                other.name()
                            )))
                        }
                    };
                    let response: RpcResponse = bincode::deserialize(&body)?;
                    if response.id() != id {
                        return Err(RpcError::StreamError("Mismatched response id".into()));
                    }
                    return match (response.result(), response.error()) {
                        (Some(data), None) => Ok(data.to_vec()),
                        (None, Some(err_msg)) => Err(RpcError::StreamError(err_msg.to_string())),
                        _ => Err(RpcError::StreamError("Invalid response".into())),
                    };
                }
                match stream.receive_bytes().await? {
                    Some(chunk) => buffer.extend_from_slice(&chunk),
                    None => {
                        return Err(RpcError::ConnectionError(
                            "Stream closed unexpectedly".into(),
                        ))
                    }
                }
            }
        };

        match tokio::time::timeout(DEFAULT_TIMEOUT, read_future).await {
            Ok(res) => res,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    pub async fn call_typed<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let params = bincode::serialize(request)?;
        let response = self.call(method, params).await?;
        Ok(bincode::deserialize(&response)?)
    }

    /// Opens a channel for `method`, sending `metadata` with the opening frame.
    pub async fn open_channel(
        &self,
        method: &str,
        metadata: Bytes,
        initial_request_n: u32,
    ) -> Result<(ChannelSender, ChannelReceiver), RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = RpcRequest::new(id, method.to_string(), metadata.to_vec());
        let opening = Frame::OpenChannel(Bytes::from(bincode::serialize(&req)?)).to_bytes()?;

        let mut stream = {
            let mut conn = self.connection.write().await;
            conn.open_bidirectional_stream().await?
        };
        stream.send_bytes(opening).await?;

        Ok(channel::open(stream, BytesMut::new(), initial_request_n))
    }
}
