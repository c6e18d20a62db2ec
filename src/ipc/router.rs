use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

/// Methods that change `classes`, `students` or their ledgers.
const ROSTER_MUTATIONS: &[&str] = &[
    "classes.create",
    "classes.delete",
    "students.create",
    "students.update",
    "students.delete",
    "students.bulkImport",
    "grades.add",
    "grades.remove",
    "attendance.save",
];

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::auth::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::users::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::classes::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::grades::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::attendance::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::notifications::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::reports::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::roster::try_handle(state, req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

fn refresh_roster(state: &mut AppState) {
    let Some(conn) = state.db.as_ref() else {
        return;
    };
    if let Err(e) = state.roster.refresh(conn) {
        tracing::error!(error = %e, "roster refresh failed");
    }
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let span = tracing::info_span!("request", method = %req.method, id = %req.id);
    let _guard = span.enter();

    let resp = dispatch(state, &req);
    let succeeded = resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    if !succeeded {
        if let Some(code) = resp.pointer("/error/code").and_then(|v| v.as_str()) {
            tracing::debug!(code, "request failed");
        }
    } else if ROSTER_MUTATIONS.contains(&req.method.as_str()) {
        let changed = req.method != "grades.add"
            || resp.pointer("/result/added").and_then(|v| v.as_bool()) == Some(true);
        if changed {
            refresh_roster(state);
        }
    }
    resp
}
