//! Query and response payloads.
//!
//! Requests are JSON arrays `[query_type, term?, options?]`; responses are
//! JSON objects `{"t": response_type, "r": [...]}`. The token travels in the
//! frame, not the payload, so a payload that fails to parse can still be
//! answered with the right token.

use serde::ser::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// What the client wants done with a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Start,
    Continue,
    Stop,
    NoreplyWait,
}

impl QueryType {
    fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(QueryType::Start),
            2 => Some(QueryType::Continue),
            3 => Some(QueryType::Stop),
            4 => Some(QueryType::NoreplyWait),
            _ => None,
        }
    }
}

/// A payload that could not be turned into a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

/// A parsed client request.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub token: i64,
    pub kind: QueryType,
    pub term: Option<Value>,
    pub options: Map<String, Value>,
}

impl Query {
    /// Parse a request payload received under `token`.
    pub fn parse(token: i64, payload: &[u8]) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ParseError(format!("Query is not valid JSON: {}", e)))?;

        let Value::Array(mut parts) = value else {
            return Err(ParseError("Expected a query to be an array.".into()));
        };
        if parts.is_empty() || parts.len() > 3 {
            return Err(ParseError(format!(
                "Expected 1 to 3 elements in the top-level query, but found {}.",
                parts.len()
            )));
        }

        let options = if parts.len() == 3 {
            match parts.pop() {
                Some(Value::Object(map)) => map,
                _ => return Err(ParseError("Expected global optargs to be an object.".into())),
            }
        } else {
            Map::new()
        };
        let term = if parts.len() == 2 { parts.pop() } else { None };

        let kind = parts[0]
            .as_i64()
            .and_then(QueryType::from_code)
            .ok_or_else(|| ParseError(format!("Unrecognized query type: {}", parts[0])))?;

        if kind == QueryType::Start && term.is_none() {
            return Err(ParseError("START query is missing a term.".into()));
        }

        Ok(Self {
            token,
            kind,
            term,
            options,
        })
    }

    /// Whether the client asked not to receive a response.
    pub fn is_noreply(&self) -> bool {
        self.options
            .get("noreply")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Kind of response sent back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseType {
    SuccessAtom = 1,
    SuccessSequence = 2,
    SuccessPartial = 3,
    WaitComplete = 4,
    ClientError = 16,
    CompileError = 17,
    RuntimeError = 18,
}

impl ResponseType {
    pub fn is_error(self) -> bool {
        (self as u8) >= 16
    }
}

impl Serialize for ResponseType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// Message used when a query is cut short by shutdown.
pub const SHUTTING_DOWN_MESSAGE: &str = "Server is shutting down.";

/// A response to one query, tagged with the query's token.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Response {
    #[serde(skip)]
    pub token: i64,
    #[serde(rename = "t")]
    pub kind: ResponseType,
    #[serde(rename = "r")]
    pub results: Vec<Value>,
    #[serde(rename = "b", skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Vec<Value>>,
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
}

impl Response {
    pub fn new(token: i64, kind: ResponseType, results: Vec<Value>) -> Self {
        Self {
            token,
            kind,
            results,
            backtrace: None,
            profile: None,
        }
    }

    pub fn atom(token: i64, value: Value) -> Self {
        Self::new(token, ResponseType::SuccessAtom, vec![value])
    }

    pub fn sequence(token: i64, values: Vec<Value>) -> Self {
        Self::new(token, ResponseType::SuccessSequence, values)
    }

    pub fn error(token: i64, kind: ResponseType, message: impl Into<String>) -> Self {
        Self::new(token, kind, vec![Value::String(message.into())])
    }

    /// Response for a query that was still pending when shutdown began.
    pub fn shutting_down(token: i64) -> Self {
        Self::error(token, ResponseType::RuntimeError, SHUTTING_DOWN_MESSAGE)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start() {
        let query = Query::parse(7, br#"[1, [39, ["foo"]], {"db": "test"}]"#).unwrap();
        assert_eq!(query.token, 7);
        assert_eq!(query.kind, QueryType::Start);
        assert_eq!(query.term, Some(json!([39, ["foo"]])));
        assert_eq!(query.options.get("db"), Some(&json!("test")));
        assert!(!query.is_noreply());
    }

    #[test]
    fn test_parse_continue_without_term() {
        let query = Query::parse(1, b"[2]").unwrap();
        assert_eq!(query.kind, QueryType::Continue);
        assert!(query.term.is_none());
    }

    #[test]
    fn test_noreply_option() {
        let query = Query::parse(1, br#"[1, 5, {"noreply": true}]"#).unwrap();
        assert!(query.is_noreply());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Query::parse(1, b"not json").unwrap_err().0.contains("not valid JSON"));
        assert!(Query::parse(1, b"{}").unwrap_err().0.contains("array"));
        assert!(Query::parse(1, b"[]").unwrap_err().0.contains("found 0"));
        assert!(Query::parse(1, b"[9, 1]").unwrap_err().0.contains("Unrecognized query type"));
        assert!(Query::parse(1, b"[1]").unwrap_err().0.contains("missing a term"));
        assert!(Query::parse(1, b"[1, 1, 2]").unwrap_err().0.contains("optargs"));
    }

    #[test]
    fn test_response_json_shape() {
        let response = Response::atom(5, json!("hello"));
        let value: Value = serde_json::from_slice(&response.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"t": 1, "r": ["hello"]}));
    }

    #[test]
    fn test_shutting_down_is_runtime_error() {
        let response = Response::shutting_down(3);
        assert_eq!(response.token, 3);
        assert!(response.kind.is_error());
        assert_eq!(response.results, vec![json!(SHUTTING_DOWN_MESSAGE)]);
    }
}
