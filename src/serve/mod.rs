//! Coordinator host: JSON-RPC 2.0 over stdio.
//!
//! One request at a time. `heal` blocks the loop until the attempt finishes.

pub mod protocol;

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::audit::{AuditSink, AuditStore};
use crate::clock::{Clock, SystemClock};
use crate::command::CommandCollaborators;
use crate::config::{expand_tilde, Config};
use crate::coordinator::Coordinator;
use crate::error::{ConfigError, ServeError};
use crate::healing::{FailureClassification, Severity};
use crate::telemetry::{FanoutSink, TelemetrySink, TracingSink};
use crate::tier::SystemLoadSample;

use protocol::{
    initialize_result, read_message, write_message, Incoming, JsonRpcResponse,
    CONFIGURATION_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
};

pub struct ServerState {
    pub coordinator: Coordinator,
    pub clock: Arc<dyn Clock>,
}

impl ServerState {
    /// Wire the coordinator with command-backed collaborators and the
    /// configured telemetry sinks.
    pub fn from_config(config: &Config) -> Result<Self, ServeError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tracing_sink: Arc<dyn TelemetrySink> = Arc::new(TracingSink);
        let mut sink = FanoutSink::new(vec![tracing_sink]);
        if let Some(db) = &config.audit_db {
            let path = expand_tilde(db);
            let store = Arc::new(AuditStore::open(&path)?);
            let audit = AuditSink::spawn(store, config.audit_retention, Arc::clone(&clock))?;
            tracing::info!(db = %path, retention_secs = config.audit_retention.as_secs(), "audit store opened");
            sink.push(Arc::new(audit));
        }
        let sink: Arc<dyn TelemetrySink> = Arc::new(sink);
        let collaborators = Arc::new(CommandCollaborators::new(
            config.actions.clone(),
            config.criteria.clone(),
        ));
        let coordinator = Coordinator::new(
            config,
            collaborators.clone(),
            collaborators,
            Arc::clone(&clock),
            sink,
        )?;
        Ok(Self { coordinator, clock })
    }
}

/// Run the server on stdio until stdin closes.
pub fn run_server(config: &Config) -> Result<(), ServeError> {
    config.validate_command_tables()?;
    let state = ServerState::from_config(config)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        tier = %state.coordinator.tiers().current().id,
        services = config.services.len(),
        strategies = config.strategies.len(),
        "waiting for requests on stdin"
    );
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(&state, &mut stdin.lock(), &mut stdout.lock());
    tracing::info!("stdin closed, shutting down");
    Ok(())
}

/// Request loop over arbitrary streams. Malformed input is answered and
/// skipped; only EOF or a write failure ends it.
pub fn serve(state: &ServerState, reader: &mut impl BufRead, writer: &mut impl Write) {
    while let Some(incoming) = read_message(reader) {
        let (response, framing) = match incoming {
            Incoming::Request(request, framing) => {
                if request.id.is_none() {
                    tracing::debug!(method = %request.method, "notification ignored");
                    continue;
                }
                tracing::debug!(method = %request.method, id = ?request.id, "request");
                let response =
                    handle_request(state, &request.method, request.id.clone(), request.params);
                (response, framing)
            }
            Incoming::Malformed {
                framing,
                id,
                code,
                message,
            } => (JsonRpcResponse::error(id, code, message), framing),
        };
        if let Err(e) = write_message(writer, &response, framing) {
            tracing::warn!(error = %e, "failed to write response");
            return;
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceParams {
    service: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OutcomeParams {
    service: String,
    success: bool,
    at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LoadParams {
    load: f64,
    at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteParams {
    capability: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HealParams {
    kind: String,
    service: String,
    #[serde(default)]
    severity: Severity,
    #[serde(default)]
    detection_methods: BTreeSet<String>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StatusParams {
    service: Option<String>,
}

enum MethodError {
    NotFound(String),
    BadParams(String),
    Config(ConfigError),
}

impl From<ConfigError> for MethodError {
    fn from(e: ConfigError) -> Self {
        MethodError::Config(e)
    }
}

fn params<T: DeserializeOwned>(raw: Option<Value>) -> Result<T, MethodError> {
    serde_json::from_value(raw.unwrap_or(Value::Null))
        .map_err(|e| MethodError::BadParams(e.to_string()))
}

/// `status` may be called without params.
fn optional_params<T: DeserializeOwned + Default>(raw: Option<Value>) -> Result<T, MethodError> {
    match raw {
        None | Some(Value::Null) => Ok(T::default()),
        some => params(some),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, MethodError> {
    serde_json::to_value(value).map_err(|e| MethodError::BadParams(e.to_string()))
}

pub fn handle_request(
    state: &ServerState,
    method: &str,
    id: Option<Value>,
    raw: Option<Value>,
) -> JsonRpcResponse {
    match dispatch(state, method, raw) {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(MethodError::NotFound(m)) => {
            JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", m))
        }
        Err(MethodError::BadParams(msg)) => {
            JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {}", msg))
        }
        Err(MethodError::Config(e)) => JsonRpcResponse::error(id, CONFIGURATION_ERROR, e.to_string()),
    }
}

fn dispatch(state: &ServerState, method: &str, raw: Option<Value>) -> Result<Value, MethodError> {
    let coordinator = &state.coordinator;
    match method {
        "initialize" => Ok(initialize_result(
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )),
        "ping" => Ok(serde_json::json!({})),
        "admit" => {
            let p: ServiceParams = params(raw)?;
            let admission = coordinator.admit(&p.service)?;
            to_value(&admission)
        }
        "record_outcome" => {
            let p: OutcomeParams = params(raw)?;
            let at = p.at.unwrap_or_else(|| state.clock.now());
            let transition = coordinator.record_outcome(&p.service, p.success, at)?;
            Ok(serde_json::json!({
                "state": coordinator.breakers().state(&p.service),
                "transition": to_value(&transition)?,
            }))
        }
        "observe_load" => {
            let p: LoadParams = params(raw)?;
            let at = p.at.unwrap_or_else(|| state.clock.now());
            let tier = coordinator.observe_load(SystemLoadSample::new(p.load, at));
            to_value(&*tier)
        }
        "route" => {
            let p: RouteParams = params(raw)?;
            to_value(&coordinator.route(&p.capability)?)
        }
        "heal" => {
            let p: HealParams = params(raw)?;
            let mut classification =
                FailureClassification::new(p.kind, p.service).with_severity(p.severity);
            classification.detection_methods_matched = p.detection_methods;
            to_value(&coordinator.heal(&classification))
        }
        "status" => {
            let p: StatusParams = optional_params(raw)?;
            match p.service {
                Some(service) => match coordinator.breakers().status(&service) {
                    Some(status) => to_value(&status),
                    None => Err(MethodError::BadParams(format!(
                        "no breaker for service '{}'",
                        service
                    ))),
                },
                None => to_value(&coordinator.status()),
            }
        }
        "reset" => {
            let p: ServiceParams = params(raw)?;
            let transition = coordinator.reset(&p.service)?;
            Ok(serde_json::json!({ "transition": to_value(&transition)? }))
        }
        "attempts" => to_value(&coordinator.healer().recent_attempts()),
        other => Err(MethodError::NotFound(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn state() -> ServerState {
        let config = Config::from_yaml_str(
            r#"
services:
  db:
    failure_threshold: 1
    open_timeout: 60
    success_threshold: 1
    monitoring_window: 60
tiers:
  - id: full
    rank: 1
    services: { storage: db }
    target: { max_response_time: 1s, min_availability: 0.99 }
    ux: optimal
"#,
        )
        .unwrap();
        ServerState::from_config(&config).unwrap()
    }

    fn call(state: &ServerState, method: &str, params: Value) -> JsonRpcResponse {
        handle_request(state, method, Some(serde_json::json!(1)), Some(params))
    }

    #[test]
    fn unknown_method_is_32601() {
        let s = state();
        let resp = call(&s, "bogus", Value::Null);
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn bad_params_is_32602() {
        let s = state();
        let resp = call(&s, "admit", serde_json::json!({ "svc": "db" }));
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn service_without_config_is_32000() {
        let s = state();
        let resp = call(&s, "admit", serde_json::json!({ "service": "unknown" }));
        assert_eq!(resp.error.unwrap().code, CONFIGURATION_ERROR);
    }

    #[test]
    fn failure_opens_circuit_and_route_fast_fails() {
        let s = state();
        let resp = call(
            &s,
            "record_outcome",
            serde_json::json!({ "service": "db", "success": false }),
        );
        let result = resp.result.unwrap();
        assert_eq!(result["state"], "open");
        assert_eq!(result["transition"]["reason"], "failure-threshold-exceeded");

        let route = call(&s, "route", serde_json::json!({ "capability": "storage" }))
            .result
            .unwrap();
        assert_eq!(route["route"], "fast_fail");
        assert_eq!(route["reason"], "circuit_rejected");
    }

    #[test]
    fn serve_answers_in_request_framing() {
        let s = state();
        let mut input = Cursor::new(
            "{\"jsonrpc\":\"2.0\",\"method\":\"notify\"}\n{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"ping\"}\n",
        );
        let mut out = Vec::new();
        serve(&s, &mut input, &mut out);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        let v: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(v["id"], 7);
    }

    #[test]
    fn serve_keeps_going_after_malformed_input() {
        let s = state();
        let ping = r#"{"jsonrpc":"2.0","id":8,"method":"ping"}"#;
        let raw = format!(
            "garbage\nContent-Length: {}\r\n\r\n{}Content-Length: {}\r\n\r\n{}",
            protocol::MAX_FRAME_BYTES + 10,
            " ".repeat(protocol::MAX_FRAME_BYTES + 10),
            ping.len(),
            ping
        );
        let mut out = Vec::new();
        serve(&s, &mut Cursor::new(raw), &mut out);
        let text = String::from_utf8(out).unwrap();

        let mut lines = text.lines();
        let first: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(first["error"]["code"], protocol::PARSE_ERROR);
        assert_eq!(first["id"], Value::Null);

        let framed: Vec<Value> = text
            .split("Content-Length: ")
            .skip(1)
            .map(|chunk| {
                let body = chunk.split("\r\n\r\n").nth(1).unwrap();
                serde_json::from_str(body).unwrap()
            })
            .collect();
        assert_eq!(framed.len(), 2);
        assert_eq!(framed[0]["error"]["code"], protocol::PARSE_ERROR);
        assert_eq!(framed[1]["id"], 8);
        assert!(framed[1]["error"].is_null());
    }
}
