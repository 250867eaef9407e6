use crate::error::EngineResult;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;

pub type HandlerResult = Result<serde_json::Value, serde_json::Value>;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn bad_type(req: &Request, key: &str, expected: &str) -> serde_json::Value {
    err(
        &req.id,
        "bad_params",
        format!("{key} must be {expected}"),
        Some(json!({ "param": key })),
    )
}

fn present<'r>(req: &'r Request, key: &str) -> Option<&'r serde_json::Value> {
    req.params.get(key).filter(|v| !v.is_null())
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match present(req, key) {
        None => Err(err(&req.id, "bad_params", format!("missing {key}"), None)),
        Some(v) => v
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| bad_type(req, key, "a string")),
    }
}

pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match present(req, key) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| bad_type(req, key, "a string")),
    }
}

pub fn optional_i64(req: &Request, key: &str) -> Result<Option<i64>, serde_json::Value> {
    match present(req, key) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| bad_type(req, key, "an integer")),
    }
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    optional_i64(req, key)?
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {key}"), None))
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match present(req, key) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| bad_type(req, key, "a number")),
    }
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    optional_f64(req, key)?
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {key}"), None))
}

pub fn optional_bool(req: &Request, key: &str) -> Result<Option<bool>, serde_json::Value> {
    match present(req, key) {
        None => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| bad_type(req, key, "a boolean")),
    }
}

/// Map an engine result into the response envelope.
pub fn reply<T: Serialize>(req: &Request, result: EngineResult<T>) -> HandlerResult {
    match result {
        Ok(v) => Ok(ok(&req.id, json!(v))),
        Err(e) => Err(engine_err(&req.id, &e)),
    }
}

/// Collapse a handler result into the envelope the router returns.
pub fn respond(result: HandlerResult) -> serde_json::Value {
    result.unwrap_or_else(|e| e)
}
