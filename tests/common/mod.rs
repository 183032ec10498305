//! Shared utilities for integration tests: a raw driver client and an
//! instrumented query backend.

#![allow(dead_code)]

use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use query_gateway::protocol::{Query, ProtocolVersion, Response, WireFormat};
use query_gateway::{AuthKey, GatewayConfig, QueryError, QueryHandler, QueryId, QueryServer, SharedCredentials};

/// Config bound to loopback on ephemeral ports.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_addresses = vec!["127.0.0.1".into()];
    config.listener.port = 0;
    config.listener.workers = 2;
    config.http.bind_address = "127.0.0.1:0".into();
    config
}

pub async fn start_server(
    config: &GatewayConfig,
    key: &str,
) -> (QueryServer<CountingHandler>, Arc<CountingHandler>, SharedCredentials) {
    let handler = Arc::new(CountingHandler::default());
    let credentials = SharedCredentials::new(AuthKey::new(key));
    let server = QueryServer::start(config, handler.clone(), Arc::new(credentials.clone()))
        .await
        .unwrap();
    (server, handler, credentials)
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Handshake bytes for `version`, with an auth key and wire format where the
/// version carries them.
pub fn hello(version: ProtocolVersion, key: &str, format: WireFormat) -> Vec<u8> {
    let mut bytes = version.magic().to_le_bytes().to_vec();
    if version.carries_auth_key() {
        bytes.extend_from_slice(&(key.len() as u32).to_le_bytes());
        bytes.extend_from_slice(key.as_bytes());
    }
    if version.negotiates_wire_format() {
        bytes.extend_from_slice(&format.magic().to_le_bytes());
    }
    bytes
}

/// Send raw handshake bytes and collect the server's reply up to its NUL.
pub async fn raw_handshake(port: u16, bytes: &[u8]) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], port)))
        .await
        .unwrap();
    stream.write_all(bytes).await.unwrap();

    let mut reply = Vec::new();
    loop {
        let byte = stream.read_u8().await.unwrap();
        if byte == 0 {
            break;
        }
        reply.push(byte);
    }
    (String::from_utf8(reply).unwrap(), stream)
}

/// A driver speaking V0_4 with JSON framing.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(port: u16, key: &str) -> Self {
        let (reply, stream) =
            raw_handshake(port, &hello(ProtocolVersion::V0_4, key, WireFormat::Json)).await;
        assert_eq!(reply, "SUCCESS");
        Self { stream }
    }

    pub async fn send(&mut self, token: i64, payload: &str) {
        let mut frame = token.to_le_bytes().to_vec();
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload.as_bytes());
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn recv(&mut self) -> (i64, Value) {
        let token = self.stream.read_i64_le().await.unwrap();
        let len = self.stream.read_u32_le().await.unwrap() as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await.unwrap();
        (token, serde_json::from_slice(&payload).unwrap())
    }

    /// True once the server has closed its end.
    pub async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

/// Per-session cache that reports when it is released.
pub struct CountingCache {
    live: Arc<AtomicUsize>,
}

impl Drop for CountingCache {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backend that counts live caches and concurrent executions.
///
/// Terms: `{"sleep_ms": n}` sleeps, `"block"` waits for the interruptor,
/// `"fail"` fails, anything else is echoed.
#[derive(Default)]
pub struct CountingHandler {
    pub live_caches: Arc<AtomicUsize>,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub started: AtomicUsize,
}

impl CountingHandler {
    pub fn live_caches(&self) -> usize {
        self.live_caches.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl QueryHandler for CountingHandler {
    type Cache = CountingCache;

    fn create_cache(&self, _peer: SocketAddr) -> CountingCache {
        self.live_caches.fetch_add(1, Ordering::SeqCst);
        CountingCache {
            live: self.live_caches.clone(),
        }
    }

    fn run_query(
        &self,
        _id: QueryId,
        query: Query,
        _cache: &CountingCache,
        interruptor: CancellationToken,
    ) -> impl Future<Output = Result<Response, QueryError>> + Send {
        async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            let term = query.term.clone().unwrap_or(Value::Null);
            let result = match term.as_str() {
                Some("block") => {
                    interruptor.cancelled().await;
                    Err(QueryError::Interrupted)
                }
                Some("fail") => Err(QueryError::failed("requested failure")),
                _ => {
                    let ms = term.get("sleep_ms").and_then(Value::as_u64).unwrap_or(0);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Response::atom(query.token, term)),
                        _ = interruptor.cancelled() => Err(QueryError::Interrupted),
                    }
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }
}
