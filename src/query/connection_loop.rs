//! Per-connection dispatch loop.
//!
//! # Responsibilities
//! - Read framed requests one at a time
//! - Admit at most `max_concurrent` executions (semaphore)
//! - Write responses, in request order unless the variant allows reordering
//! - Release the connection's query cache exactly once, on exit
//!
//! # Design Decisions
//! - Every in-flight query is a future owned by the loop itself, so the
//!   cache can be borrowed without reference counting and nothing outlives
//!   the connection
//! - Strict-order variants stop reading once `max_concurrent` replies are
//!   parked behind an unfinished query
//! - Reads go through `Framed`, which keeps partial frames buffered when a
//!   read is raced by another branch
//! - On client disconnect in-flight queries are interrupted and their
//!   results discarded; on shutdown they are interrupted and whatever they
//!   return is still written, with a bounded wait

use futures_util::stream::FuturesUnordered;
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::LimitsConfig;
use crate::net::ConnectionId;
use crate::observability::metrics;
use crate::protocol::{ProtocolVariant, Query, RawRequest, Response, WireCodec, WireError};
use crate::query::handler::{QueryError, QueryHandler, QueryId};

/// How long a shutting-down connection may spend writing each final response.
const DRAIN_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a dispatch loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The client closed its end.
    ClientClosed,
    /// The interruptor fired (shutdown).
    Interrupted,
    /// The backend asked for the connection to be closed.
    ClosedByHandler,
}

/// Transport or framing failure that ended a dispatch loop.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("read failed: {0}")]
    Read(#[source] WireError),

    #[error("write failed: {0}")]
    Write(#[source] WireError),
}

/// A finished (or refused) query waiting to be written.
#[derive(Debug)]
struct Completed {
    seq: u64,
    token: i64,
    noreply: bool,
    outcome: Result<Response, QueryError>,
}

impl Completed {
    fn ready(seq: u64, response: Response) -> Self {
        Self {
            seq,
            token: response.token,
            noreply: false,
            outcome: Ok(response),
        }
    }

    /// The response to write, if any, and whether to hang up afterwards.
    fn into_reply(self) -> (Option<Response>, bool) {
        let close = matches!(
            self.outcome,
            Err(QueryError::Failed {
                close_connection: true,
                ..
            })
        );
        let response = match self.outcome {
            Ok(mut response) => {
                metrics::record_query("ok");
                // The token always comes from the request.
                response.token = self.token;
                response
            }
            Err(QueryError::Interrupted) => {
                metrics::record_query("interrupted");
                QueryError::Interrupted.into_response(self.token)
            }
            Err(e) => {
                metrics::record_query("error");
                e.into_response(self.token)
            }
        };
        ((!self.noreply).then_some(response), close)
    }
}

/// Releases completed queries in the order the wire protocol requires.
#[derive(Debug)]
struct ResponseOrder {
    reorder: bool,
    next: u64,
    parked: BTreeMap<u64, Completed>,
}

impl ResponseOrder {
    fn new(reorder: bool) -> Self {
        Self {
            reorder,
            next: 0,
            parked: BTreeMap::new(),
        }
    }

    fn deliver(&mut self, done: Completed) -> Vec<Completed> {
        if self.reorder {
            return vec![done];
        }
        self.parked.insert(done.seq, done);

        let mut ready = Vec::new();
        while let Some(entry) = self.parked.first_entry() {
            if *entry.key() != self.next {
                break;
            }
            ready.push(entry.remove());
            self.next += 1;
        }
        ready
    }

    /// Completions held back behind an earlier, unfinished request.
    fn backlog(&self) -> usize {
        self.parked.len()
    }
}

enum WriteOutcome {
    Continue,
    Close,
    Interrupted,
}

async fn write_ready<S>(
    framed: &mut Framed<S, WireCodec>,
    ready: Vec<Completed>,
    interruptor: &CancellationToken,
) -> Result<WriteOutcome, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for done in ready {
        let (reply, close) = done.into_reply();
        if let Some(response) = reply {
            tokio::select! {
                biased;
                _ = interruptor.cancelled() => return Ok(WriteOutcome::Interrupted),
                res = framed.send(response) => res.map_err(ConnectionError::Write)?,
            }
        }
        if close {
            return Ok(WriteOutcome::Close);
        }
    }
    Ok(WriteOutcome::Continue)
}

/// Write final responses during shutdown. Returns false once the peer stops keeping up.
async fn write_on_shutdown<S>(framed: &mut Framed<S, WireCodec>, ready: Vec<Completed>) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for done in ready {
        if let (Some(response), _) = done.into_reply() {
            match tokio::time::timeout(DRAIN_WRITE_TIMEOUT, framed.send(response)).await {
                Ok(Ok(())) => {}
                _ => return false,
            }
        }
    }
    true
}

async fn run_one<H: QueryHandler>(
    handler: &H,
    cache: &H::Cache,
    id: QueryId,
    query: Query,
    interruptor: CancellationToken,
) -> Completed {
    let token = query.token;
    let noreply = query.is_noreply();
    let outcome = handler.run_query(id, query, cache, interruptor).await;
    Completed {
        seq: id.seq,
        token,
        noreply,
        outcome,
    }
}

/// Execute a single framed request outside a driver connection.
///
/// Used by the HTTP adapter. Returns `None` for `noreply` queries.
pub async fn dispatch_one<H: QueryHandler>(
    handler: &H,
    cache: &H::Cache,
    id: QueryId,
    request: RawRequest,
    interruptor: CancellationToken,
) -> Option<Response> {
    match Query::parse(request.token, &request.payload) {
        Ok(query) => run_one(handler, cache, id, query, interruptor)
            .await
            .into_reply()
            .0,
        Err(e) => {
            metrics::record_query("unparseable");
            Some(handler.unparseable_query(request.token, &e.0))
        }
    }
}

/// Dispatch loop for one driver connection that has completed its handshake.
pub struct ConnectionLoop<H: QueryHandler, S> {
    id: ConnectionId,
    variant: ProtocolVariant,
    framed: Framed<S, WireCodec>,
    handler: Arc<H>,
    cache: H::Cache,
    max_concurrent: usize,
}

impl<H, S> ConnectionLoop<H, S>
where
    H: QueryHandler,
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: ConnectionId,
        stream: S,
        variant: ProtocolVariant,
        handler: Arc<H>,
        cache: H::Cache,
        limits: &LimitsConfig,
    ) -> Self {
        let codec = WireCodec::new(variant.framing(), limits.max_query_size);
        Self {
            id,
            variant,
            framed: Framed::new(stream, codec),
            handler,
            cache,
            max_concurrent: variant.max_concurrent_queries(limits.max_concurrent_queries),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Serve requests until the client leaves, a framing error occurs, or
    /// `interruptor` fires.
    pub async fn run(self, interruptor: CancellationToken) -> Result<LoopExit, ConnectionError> {
        let ConnectionLoop {
            id,
            variant,
            mut framed,
            handler,
            cache,
            max_concurrent,
        } = self;

        let admission = Arc::new(Semaphore::new(max_concurrent));
        let queries = interruptor.child_token();
        let mut order = ResponseOrder::new(variant.allows_reordering());
        let mut next_seq: u64 = 0;
        let mut pending: Option<(u64, Query)> = None;
        let mut writable = true;
        let mut in_flight = FuturesUnordered::new();

        tracing::debug!(
            connection_id = %id,
            protocol = %variant,
            max_concurrent,
            "Dispatch loop started"
        );

        let exit = loop {
            let ready = tokio::select! {
                biased;

                _ = interruptor.cancelled() => break Ok(LoopExit::Interrupted),

                Some(done) = in_flight.next(), if !in_flight.is_empty() => order.deliver(done),

                permit = admission.clone().acquire_owned(), if pending.is_some() => {
                    // The semaphore is never closed.
                    let Ok(permit) = permit else { break Ok(LoopExit::Interrupted) };
                    if let Some((seq, query)) = pending.take() {
                        let query_id = QueryId::new(id, seq);
                        let signal = queries.child_token();
                        let handler = &*handler;
                        let cache = &cache;
                        in_flight.push(async move {
                            let done = run_one(handler, cache, query_id, query, signal).await;
                            drop(permit);
                            done
                        });
                    }
                    Vec::new()
                }

                // Parked replies count against the admission bound.
                frame = framed.next(), if pending.is_none() && order.backlog() < max_concurrent => match frame {
                    None => break Ok(LoopExit::ClientClosed),
                    Some(Err(e)) => break Err(ConnectionError::Read(e)),
                    Some(Ok(raw)) => {
                        let seq = next_seq;
                        next_seq += 1;
                        match Query::parse(raw.token, &raw.payload) {
                            Ok(query) => {
                                tracing::trace!(connection_id = %id, token = raw.token, "Query received");
                                pending = Some((seq, query));
                                Vec::new()
                            }
                            Err(e) => {
                                tracing::debug!(
                                    connection_id = %id,
                                    token = raw.token,
                                    error = %e,
                                    "Unparseable query"
                                );
                                metrics::record_query("unparseable");
                                let response = handler.unparseable_query(raw.token, &e.0);
                                order.deliver(Completed::ready(seq, response))
                            }
                        }
                    }
                },
            };

            match write_ready(&mut framed, ready, &interruptor).await {
                Ok(WriteOutcome::Continue) => {}
                Ok(WriteOutcome::Close) => break Ok(LoopExit::ClosedByHandler),
                Ok(WriteOutcome::Interrupted) => {
                    // A frame may be half written; nothing more can go out.
                    writable = false;
                    break Ok(LoopExit::Interrupted);
                }
                Err(e) => {
                    writable = false;
                    break Err(e);
                }
            }
        };

        queries.cancel();

        let mut answer_pending = writable && matches!(exit, Ok(LoopExit::Interrupted));
        while let Some(done) = in_flight.next().await {
            let ready = order.deliver(done);
            if answer_pending {
                answer_pending = write_on_shutdown(&mut framed, ready).await;
            }
        }
        if let Some((seq, query)) = pending.take() {
            if answer_pending {
                let ready = order.deliver(Completed::ready(seq, Response::shutting_down(query.token)));
                write_on_shutdown(&mut framed, ready).await;
            }
        }

        drop(in_flight);
        // The connection's query cache is released here and nowhere else.
        drop(cache);

        match &exit {
            Ok(reason) => tracing::debug!(connection_id = %id, exit = ?reason, "Dispatch loop finished"),
            Err(e) => tracing::debug!(connection_id = %id, error = %e, "Dispatch loop failed"),
        }
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Framing, JsonFraming, PackedFraming, ProtocolVersion, ResponseType, WireFormat};
    use bytes::BytesMut;
    use serde_json::{json, Value};
    use std::future::Future;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf};
    use tokio_util::codec::FramedRead;

    struct TestCache {
        live: Arc<AtomicUsize>,
    }

    impl Drop for TestCache {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Runs queries whose term is `{"sleep_ms": n}`, `"fail"`, `"close"` or `"wait"`.
    #[derive(Default)]
    struct TestHandler {
        active: AtomicUsize,
        max_seen: AtomicUsize,
        live_caches: Arc<AtomicUsize>,
    }

    impl QueryHandler for TestHandler {
        type Cache = TestCache;

        fn create_cache(&self, _peer: SocketAddr) -> TestCache {
            self.live_caches.fetch_add(1, Ordering::SeqCst);
            TestCache {
                live: self.live_caches.clone(),
            }
        }

        fn run_query(
            &self,
            _id: QueryId,
            query: Query,
            _cache: &TestCache,
            interruptor: CancellationToken,
        ) -> impl Future<Output = Result<Response, QueryError>> + Send {
            async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);

                let term = query.term.clone().unwrap_or(Value::Null);
                let result = match term.as_str() {
                    Some("fail") => Err(QueryError::failed("boom")),
                    Some("close") => Err(QueryError::Failed {
                        message: "fatal".into(),
                        close_connection: true,
                    }),
                    Some("wait") => {
                        interruptor.cancelled().await;
                        Err(QueryError::Interrupted)
                    }
                    _ => {
                        let ms = term.get("sleep_ms").and_then(Value::as_u64).unwrap_or(0);
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Response::atom(0, term)),
                            _ = interruptor.cancelled() => Err(QueryError::Interrupted),
                        }
                    }
                };

                self.active.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }
    }

    fn limits(max_concurrent_queries: usize) -> LimitsConfig {
        LimitsConfig {
            max_concurrent_queries,
            ..LimitsConfig::default()
        }
    }

    fn frame(framing: &dyn Framing, token: i64, payload: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        framing.encode_frame(token, payload.as_bytes(), &mut buf).unwrap();
        buf.to_vec()
    }

    struct Setup {
        conn: ConnectionLoop<TestHandler, DuplexStream>,
        client: DuplexStream,
        handler: Arc<TestHandler>,
    }

    fn setup(format: WireFormat, max: usize) -> Setup {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handler = Arc::new(TestHandler::default());
        let cache = handler.create_cache("127.0.0.1:1".parse().unwrap());
        let variant = ProtocolVariant::new(ProtocolVersion::V0_4, format);
        let conn = ConnectionLoop::new(ConnectionId::new(), server, variant, handler.clone(), cache, &limits(max));
        Setup { conn, client, handler }
    }

    async fn next_response(reader: &mut FramedRead<ReadHalf<DuplexStream>, WireCodec>) -> (i64, Value) {
        let raw = reader.next().await.unwrap().unwrap();
        (raw.token, serde_json::from_slice(&raw.payload).unwrap())
    }

    fn json_reader(read: ReadHalf<DuplexStream>) -> FramedRead<ReadHalf<DuplexStream>, WireCodec> {
        FramedRead::new(read, WireCodec::new(Box::new(JsonFraming), 1 << 20))
    }

    #[tokio::test]
    async fn test_malformed_then_valid_keeps_connection_open() {
        let Setup { conn, client, handler } = setup(WireFormat::Json, 4);
        let token = CancellationToken::new();
        let (read, mut write) = tokio::io::split(client);
        let mut reader = json_reader(read);

        let client_side = async move {
            write.write_all(&frame(&JsonFraming, 11, "{not json")).await.unwrap();
            write.write_all(&frame(&JsonFraming, 12, r#"[1, "hi"]"#)).await.unwrap();

            let mut seen = vec![next_response(&mut reader).await, next_response(&mut reader).await];
            seen.sort_by_key(|(t, _)| *t);
            assert_eq!(seen[0].0, 11);
            assert_eq!(seen[0].1["t"], json!(ResponseType::ClientError as u8));
            assert_eq!(seen[1], (12, json!({"t": 1, "r": ["hi"]})));

            // Still open: a third query is answered too.
            write.write_all(&frame(&JsonFraming, 13, "[1, 3]")).await.unwrap();
            assert_eq!(next_response(&mut reader).await.0, 13);
            drop(write);
        };

        let (exit, ()) = tokio::join!(conn.run(token), client_side);
        assert_eq!(exit.unwrap(), LoopExit::ClientClosed);
        assert_eq!(handler.live_caches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_admission_bound_is_respected() {
        let Setup { conn, client, handler } = setup(WireFormat::Json, 3);
        assert_eq!(conn.max_concurrent(), 3);
        let (read, mut write) = tokio::io::split(client);
        let mut reader = json_reader(read);

        let client_side = async move {
            for token in 0..10 {
                write
                    .write_all(&frame(&JsonFraming, token, r#"[1, {"sleep_ms": 20}]"#))
                    .await
                    .unwrap();
            }
            let mut tokens = Vec::new();
            for _ in 0..10 {
                tokens.push(next_response(&mut reader).await.0);
            }
            tokens.sort();
            assert_eq!(tokens, (0..10).collect::<Vec<_>>());
            drop(write);
        };

        let (exit, ()) = tokio::join!(conn.run(CancellationToken::new()), client_side);
        assert_eq!(exit.unwrap(), LoopExit::ClientClosed);
        let max_seen = handler.max_seen.load(Ordering::SeqCst);
        assert!(max_seen <= 3, "saw {} concurrent queries", max_seen);
        assert!(max_seen >= 2, "queries should overlap, saw {}", max_seen);
    }

    #[tokio::test]
    async fn test_packed_variant_answers_in_request_order() {
        let Setup { conn, client, handler } = setup(WireFormat::Packed, 16);
        assert_eq!(conn.max_concurrent(), 1);
        let (read, mut write) = tokio::io::split(client);
        let mut reader = FramedRead::new(read, WireCodec::new(Box::new(PackedFraming), 1 << 20));

        let client_side = async move {
            write.write_all(&frame(&PackedFraming, 1, r#"[1, {"sleep_ms": 30}]"#)).await.unwrap();
            write.write_all(&frame(&PackedFraming, 2, "oops")).await.unwrap();
            write.write_all(&frame(&PackedFraming, 3, r#"[1, {"sleep_ms": 1}]"#)).await.unwrap();

            let mut tokens = Vec::new();
            for _ in 0..3 {
                tokens.push(reader.next().await.unwrap().unwrap().token);
            }
            assert_eq!(tokens, vec![1, 2, 3]);
            drop(write);
        };

        let (exit, ()) = tokio::join!(conn.run(CancellationToken::new()), client_side);
        assert_eq!(exit.unwrap(), LoopExit::ClientClosed);
        assert_eq!(handler.max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_connection_continues() {
        let Setup { conn, client, .. } = setup(WireFormat::Json, 4);
        let (read, mut write) = tokio::io::split(client);
        let mut reader = json_reader(read);

        let client_side = async move {
            write.write_all(&frame(&JsonFraming, 1, r#"[1, "fail"]"#)).await.unwrap();
            let (token, body) = next_response(&mut reader).await;
            assert_eq!(token, 1);
            assert_eq!(body, json!({"t": 18, "r": ["boom"]}));

            write.write_all(&frame(&JsonFraming, 2, "[1, 2]")).await.unwrap();
            assert_eq!(next_response(&mut reader).await.0, 2);
            drop(write);
        };

        let (exit, ()) = tokio::join!(conn.run(CancellationToken::new()), client_side);
        assert_eq!(exit.unwrap(), LoopExit::ClientClosed);
    }

    #[tokio::test]
    async fn test_handler_can_close_connection() {
        let Setup { conn, client, handler } = setup(WireFormat::Json, 4);
        let (read, mut write) = tokio::io::split(client);
        let mut reader = json_reader(read);

        let client_side = async move {
            write.write_all(&frame(&JsonFraming, 5, r#"[1, "close"]"#)).await.unwrap();
            let (token, body) = next_response(&mut reader).await;
            assert_eq!(token, 5);
            assert_eq!(body["r"], json!(["fatal"]));
            // Keep the write half open: the server is the one hanging up.
            assert!(reader.next().await.is_none());
            drop(write);
        };

        let (exit, ()) = tokio::join!(conn.run(CancellationToken::new()), client_side);
        assert_eq!(exit.unwrap(), LoopExit::ClosedByHandler);
        assert_eq!(handler.live_caches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_noreply_query_gets_no_response() {
        let Setup { conn, client, .. } = setup(WireFormat::Json, 4);
        let (read, mut write) = tokio::io::split(client);
        let mut reader = json_reader(read);

        let client_side = async move {
            write
                .write_all(&frame(&JsonFraming, 1, r#"[1, 1, {"noreply": true}]"#))
                .await
                .unwrap();
            write.write_all(&frame(&JsonFraming, 2, "[1, 2]")).await.unwrap();
            assert_eq!(next_response(&mut reader).await.0, 2);
            drop(write);
        };

        let (exit, ()) = tokio::join!(conn.run(CancellationToken::new()), client_side);
        assert_eq!(exit.unwrap(), LoopExit::ClientClosed);
    }

    #[tokio::test]
    async fn test_shutdown_answers_in_flight_queries() {
        let Setup { conn, client, handler } = setup(WireFormat::Json, 4);
        let token = CancellationToken::new();
        let trip = token.clone();
        let (read, mut write) = tokio::io::split(client);
        let mut reader = json_reader(read);

        let client_side = async move {
            write.write_all(&frame(&JsonFraming, 7, r#"[1, "wait"]"#)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            trip.cancel();

            let (token, body) = next_response(&mut reader).await;
            assert_eq!(token, 7);
            assert_eq!(body["r"], json!([crate::protocol::message::SHUTTING_DOWN_MESSAGE]));
            drop(write);
        };

        let (exit, ()) = tokio::join!(conn.run(token), client_side);
        assert_eq!(exit.unwrap(), LoopExit::Interrupted);
        assert_eq!(handler.active.load(Ordering::SeqCst), 0);
        assert_eq!(handler.live_caches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_interrupts_in_flight_queries() {
        let Setup { conn, client, handler } = setup(WireFormat::Json, 4);
        let (_read, mut write) = tokio::io::split(client);

        let client_side = async move {
            write.write_all(&frame(&JsonFraming, 1, r#"[1, "wait"]"#)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            write.shutdown().await.unwrap();
        };

        let (exit, ()) = tokio::join!(conn.run(CancellationToken::new()), client_side);
        assert_eq!(exit.unwrap(), LoopExit::ClientClosed);
        assert_eq!(handler.active.load(Ordering::SeqCst), 0);
        assert_eq!(handler.live_caches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_loop() {
        let (client, server) = tokio::io::duplex(1024);
        let handler = Arc::new(TestHandler::default());
        let cache = handler.create_cache("127.0.0.1:1".parse().unwrap());
        let variant = ProtocolVariant::new(ProtocolVersion::V0_4, WireFormat::Json);
        let limits = LimitsConfig {
            max_query_size: 16,
            ..LimitsConfig::default()
        };
        let conn = ConnectionLoop::new(ConnectionId::new(), server, variant, handler.clone(), cache, &limits);

        let (_read, mut write) = tokio::io::split(client);
        let client_side = async move {
            write.write_all(&frame(&JsonFraming, 1, &"x".repeat(64))).await.unwrap();
            write
        };

        let (exit, _write) = tokio::join!(conn.run(CancellationToken::new()), client_side);
        assert!(matches!(
            exit,
            Err(ConnectionError::Read(WireError::FrameTooLarge { len: 64, max: 16 }))
        ));
        assert_eq!(handler.live_caches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parked_replies_stop_reads() {
        let Setup { conn, client, handler } = setup(WireFormat::Packed, 16);
        let token = CancellationToken::new();
        let trip = token.clone();
        let (_read, mut write) = tokio::io::split(client);

        let client_side = async move {
            write.write_all(&frame(&PackedFraming, 1, r#"[1, "wait"]"#)).await.unwrap();

            let total = 20_000;
            let mut sent = 0;
            let pushed = tokio::time::timeout(Duration::from_millis(200), async {
                for t in 0..total {
                    write.write_all(&frame(&PackedFraming, t + 2, "oops")).await.unwrap();
                    sent += 1;
                }
            })
            .await;
            assert!(pushed.is_err(), "malformed frames were all consumed behind a blocked query");
            assert!(sent < total);

            trip.cancel();
            write
        };

        let (exit, _write) = tokio::join!(conn.run(token), client_side);
        assert_eq!(exit.unwrap(), LoopExit::Interrupted);
        assert_eq!(handler.live_caches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_response_order_parks_out_of_order_completions() {
        let mut order = ResponseOrder::new(false);
        let done = |seq: u64| Completed::ready(seq, Response::atom(seq as i64, json!(seq)));

        assert!(order.deliver(done(1)).is_empty());
        assert!(order.deliver(done(2)).is_empty());
        let ready: Vec<u64> = order.deliver(done(0)).into_iter().map(|c| c.seq).collect();
        assert_eq!(ready, vec![0, 1, 2]);
    }

    #[test]
    fn test_response_order_passthrough_when_reordering() {
        let mut order = ResponseOrder::new(true);
        let ready = order.deliver(Completed::ready(5, Response::atom(5, json!(null))));
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_reply_echoes_request_token() {
        let done = Completed {
            seq: 0,
            token: 99,
            noreply: false,
            outcome: Ok(Response::atom(0, json!(1))),
        };
        let (reply, close) = done.into_reply();
        assert_eq!(reply.unwrap().token, 99);
        assert!(!close);
    }
}
