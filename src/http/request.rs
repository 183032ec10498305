//! Request and response bodies for the HTTP query endpoint.
//!
//! ```text
//! request body:  [token: i64 LE][query payload]
//! response body: [token: i64 LE][response JSON]   (token only for noreply)
//! ```

use axum::http::{HeaderName, HeaderValue, Request};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

use crate::http::error::HttpError;
use crate::protocol::{RawRequest, Response};

pub const X_AUTH_KEY: HeaderName = HeaderName::from_static("x-auth-key");
pub const X_SESSION_ID: HeaderName = HeaderName::from_static("x-session-id");

const TOKEN_LEN: usize = 8;

/// Request ids for tracing, as UUID v4.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

/// Split an HTTP query body into its token and payload.
pub fn parse_query_body(mut body: Bytes) -> Result<RawRequest, HttpError> {
    if body.len() < TOKEN_LEN {
        return Err(HttpError::Malformed(format!(
            "Request body of {} bytes is too short to hold a query token.",
            body.len()
        )));
    }
    let token = body.get_i64_le();
    Ok(RawRequest { token, payload: body })
}

pub fn encode_query_reply(token: i64, response: Option<&Response>) -> Result<Bytes, serde_json::Error> {
    let payload = match response {
        Some(response) => response.to_json()?,
        None => Vec::new(),
    };
    let mut buf = BytesMut::with_capacity(TOKEN_LEN + payload.len());
    buf.put_i64_le(token);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}
