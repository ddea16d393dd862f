//! JSON-RPC 2.0 types and stdio framing.
//!
//! Accepts both Content-Length framed and bare newline-delimited JSON.
//! The framing is detected per message and replies use the same one.

use std::io::{self, BufRead, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const CONFIGURATION_ERROR: i64 = -32000;

/// Largest Content-Length body read into memory.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    ContentLength,
    Bare,
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message }),
        }
    }
}

pub fn initialize_result(server_name: &str, version: &str) -> Value {
    serde_json::json!({
        "serverInfo": {
            "name": server_name,
            "version": version
        },
        "methods": [
            "admit", "record_outcome", "observe_load", "route",
            "heal", "status", "reset", "attempts", "ping"
        ]
    })
}

/// One unit read off the wire.
#[derive(Debug)]
pub enum Incoming {
    Request(JsonRpcRequest, Framing),
    /// Unparseable or oversized input. The stream is still usable and the
    /// caller should answer with `code`.
    Malformed {
        framing: Framing,
        id: Option<Value>,
        code: i64,
        message: String,
    },
}

impl Incoming {
    fn parse_error(framing: Framing, message: String) -> Self {
        Incoming::Malformed {
            framing,
            id: Some(Value::Null),
            code: PARSE_ERROR,
            message,
        }
    }
}

fn decode(bytes: &[u8], framing: Framing) -> Incoming {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, ?framing, "JSON parse error");
            return Incoming::parse_error(framing, format!("Parse error: {}", e));
        }
    };
    let id = Some(value.get("id").cloned().unwrap_or(Value::Null));
    match serde_json::from_value(value) {
        Ok(req) => Incoming::Request(req, framing),
        Err(e) => {
            tracing::warn!(error = %e, ?framing, "not a JSON-RPC request");
            Incoming::Malformed {
                framing,
                id,
                code: INVALID_REQUEST,
                message: format!("Invalid request: {}", e),
            }
        }
    }
}

/// Read one message. Returns None on EOF or a read error.
pub fn read_message(reader: &mut impl BufRead) -> Option<Incoming> {
    let mut line = String::new();
    let trimmed = loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                tracing::debug!("EOF on stdin");
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "stdin read error");
                return None;
            }
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            break trimmed;
        }
    };

    if trimmed.starts_with('{') {
        return Some(decode(trimmed.as_bytes(), Framing::Bare));
    }

    let Some(len_str) = trimmed.strip_prefix("Content-Length:") else {
        tracing::warn!(line = trimmed, "unexpected line");
        return Some(Incoming::parse_error(
            Framing::Bare,
            "Parse error: expected a JSON object or a Content-Length header".into(),
        ));
    };
    let content_length = len_str.trim().parse::<usize>();

    // Skip remaining headers up to the blank separator line.
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header) {
            Ok(0) => return None,
            Ok(_) if header.trim().is_empty() => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "header read error");
                return None;
            }
        }
    }

    let content_length = match content_length {
        Ok(n) => n,
        Err(_) => {
            tracing::warn!(value = len_str.trim(), "bad Content-Length");
            return Some(Incoming::parse_error(
                Framing::ContentLength,
                format!("Parse error: bad Content-Length '{}'", len_str.trim()),
            ));
        }
    };

    if content_length > MAX_FRAME_BYTES {
        tracing::warn!(content_length, limit = MAX_FRAME_BYTES, "frame too large, discarding body");
        let discarded = io::copy(&mut reader.by_ref().take(content_length as u64), &mut io::sink());
        if let Err(e) = discarded {
            tracing::warn!(error = %e, "body read error");
            return None;
        }
        return Some(Incoming::parse_error(
            Framing::ContentLength,
            format!(
                "Parse error: frame of {} bytes exceeds the {} byte limit",
                content_length, MAX_FRAME_BYTES
            ),
        ));
    }

    let mut body = vec![0u8; content_length];
    if let Err(e) = reader.read_exact(&mut body) {
        tracing::warn!(error = %e, expected = content_length, "body read error");
        return None;
    }
    Some(decode(&body, Framing::ContentLength))
}

/// Write one response using `framing`.
pub fn write_message(
    writer: &mut impl Write,
    response: &JsonRpcResponse,
    framing: Framing,
) -> std::io::Result<()> {
    let body = serde_json::to_string(response)?;
    match framing {
        Framing::Bare => {
            writer.write_all(body.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        Framing::ContentLength => {
            write!(writer, "Content-Length: {}\r\n\r\n", body.len())?;
            writer.write_all(body.as_bytes())?;
        }
    }
    writer.flush()
}
