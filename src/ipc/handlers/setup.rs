use crate::config;
use crate::ipc::error::err;
use crate::ipc::helpers::{db_conn, reply, required_str, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};

#[derive(Clone, Copy)]
enum SetupSection {
    Averages,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "averages" => Some(Self::Averages),
            _ => None,
        }
    }
}

fn section(req: &Request) -> Result<SetupSection, serde_json::Value> {
    let raw = required_str(req, "section")?;
    SetupSection::parse(&raw)
        .ok_or_else(|| err(&req.id, "bad_params", format!("unknown setup section: {raw}"), None))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    match section(req)? {
        SetupSection::Averages => reply(req, config::load_averages_settings(conn)),
    }
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let Some(patch) = req.params.get("patch") else {
        return Err(err(&req.id, "bad_params", "missing patch", None));
    };
    match section(req)? {
        SetupSection::Averages => reply(req, config::update_averages_settings(conn, patch)),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(respond(handle_setup_get(state, req))),
        "setup.update" => Some(respond(handle_setup_update(state, req))),
        _ => None,
    }
}
