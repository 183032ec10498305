//! HTTP endpoint for drivers that cannot hold a TCP connection open.
//!
//! # Responsibilities
//! - Create the Axum router for the `/ajax/reql` endpoints
//! - Map each request onto one query dispatch against a cached session
//! - Wire up middleware (tracing, body limit, request ID)
//!
//! # Design Decisions
//! - Sessions live in the [`ConnectionCache`]; the HTTP connection itself
//!   carries no state
//! - Calls on one session run one at a time, in arrival order at the cache lock

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::auth::{AuthKey, CredentialStore};
use crate::config::HttpConfig;
use crate::http::error::HttpError;
use crate::http::request::{encode_query_reply, parse_query_body, UuidRequestId, X_AUTH_KEY, X_SESSION_ID};
use crate::query::{dispatch_one, QueryHandler, QueryId};
use crate::session::{ConnectionCache, HttpConn};

/// Application state injected into handlers.
pub struct HttpState<H: QueryHandler> {
    pub handler: Arc<H>,
    pub sessions: ConnectionCache<H::Cache>,
    pub credentials: Arc<dyn CredentialStore>,
    pub shutdown: CancellationToken,
}

impl<H: QueryHandler> Clone for HttpState<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            sessions: self.sessions.clone(),
            credentials: self.credentials.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SessionParams {
    conn_id: Option<i32>,
}

/// HTTP server for the query endpoint.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new<H: QueryHandler>(state: HttpState<H>, config: &HttpConfig) -> Self {
        Self {
            router: build_router(state, config),
        }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` fires, then finish in-flight requests.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the Axum router with all middleware layers.
pub fn build_router<H: QueryHandler>(state: HttpState<H>, config: &HttpConfig) -> Router {
    Router::new()
        .route("/ajax/reql", post(query::<H>))
        .route("/ajax/reql/", post(query::<H>))
        .route("/ajax/reql/open-new-connection", post(open_connection::<H>))
        .route("/ajax/reql/close-connection", post(close_connection::<H>))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_body_size))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
}

fn check_auth_key(headers: &HeaderMap, credentials: &dyn CredentialStore) -> Result<(), HttpError> {
    let presented = match headers.get(&X_AUTH_KEY) {
        Some(value) => value.to_str().map_err(|_| HttpError::BadAuthKey)?,
        None => "",
    };
    if credentials.validate(&AuthKey::new(presented)) {
        Ok(())
    } else {
        Err(HttpError::BadAuthKey)
    }
}

async fn open_session<H: QueryHandler>(
    state: &HttpState<H>,
    peer: SocketAddr,
    headers: &HeaderMap,
) -> Result<Arc<HttpConn<H::Cache>>, HttpError> {
    if state.shutdown.is_cancelled() {
        return Err(HttpError::ShuttingDown);
    }
    check_auth_key(headers, state.credentials.as_ref())?;
    let cache = state.handler.create_cache(peer);
    Ok(state.sessions.create(peer, cache).await?)
}

fn session_header(conn_id: i32) -> [(axum::http::HeaderName, HeaderValue); 1] {
    [(X_SESSION_ID, HeaderValue::from(conn_id))]
}

/// `POST /ajax/reql/open-new-connection`: body is the new session id.
async fn open_connection<H: QueryHandler>(
    State(state): State<HttpState<H>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let conn = open_session(&state, peer, &headers).await?;
    Ok((session_header(conn.id()), conn.id().to_string()).into_response())
}

/// `POST /ajax/reql/close-connection?conn_id=N`
async fn close_connection<H: QueryHandler>(
    State(state): State<HttpState<H>>,
    Query(params): Query<SessionParams>,
) -> Result<Response, HttpError> {
    let id = params.conn_id.ok_or(HttpError::NotOpen)?;
    if !state.sessions.erase(id).await {
        return Err(HttpError::NotOpen);
    }
    Ok(().into_response())
}

/// `POST /ajax/reql/?conn_id=N`: run one query on the session.
///
/// Without `conn_id` a session is opened first, under the same credential
/// check as `open-new-connection`.
async fn query<H: QueryHandler>(
    State(state): State<HttpState<H>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<SessionParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    if state.shutdown.is_cancelled() {
        return Err(HttpError::ShuttingDown);
    }
    let request = parse_query_body(body)?;
    let token = request.token;

    let conn = match params.conn_id {
        Some(id) => state.sessions.find(id).await.ok_or(HttpError::NotOpen)?,
        None => open_session(&state, peer, &headers).await?,
    };

    conn.pulse();
    let reply = {
        let cache = conn.lock_cache().await;
        let id = QueryId::new(conn.connection_id(), conn.next_query_seq());
        tracing::debug!(session_id = conn.id(), query_id = %id, token, "HTTP query");
        dispatch_one(state.handler.as_ref(), &*cache, id, request, conn.interruptor().clone()).await
    };
    conn.pulse();

    let body = encode_query_reply(token, reply.as_ref())?;
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))],
        session_header(conn.id()),
        body,
    )
        .into_response())
}
