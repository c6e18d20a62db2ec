use crate::auth::Capability;
use crate::ipc::error::{respond, HandlerResult};
use crate::ipc::helpers::{db_conn, require_capability, require_user, subscription_id};
use crate::ipc::types::{AppState, Event, Request};
use crate::roster::RosterSnapshot;
use serde_json::json;
use std::rc::Rc;

fn snapshot(state: &mut AppState, _req: &Request) -> HandlerResult {
    require_capability(state, Capability::ViewRoster)?;
    db_conn(state)?;
    let current = state.roster.snapshot();
    Ok(json!({ "snapshot": current.as_deref() }))
}

/// Each published snapshot becomes a `roster.changed` event line.
fn subscribe(state: &mut AppState, _req: &Request) -> HandlerResult {
    require_capability(state, Capability::ViewRoster)?;
    db_conn(state)?;
    let tx = state.events.clone();
    let id = state
        .roster
        .subscribe(move |id, snap: &Rc<RosterSnapshot>| {
            let _ = tx.send(Event::new("roster.changed", id, json!(&**snap)));
        });
    tracing::debug!(subscription = %id, "roster subscription added");
    Ok(json!({ "subscriptionId": id.to_string() }))
}

fn unsubscribe(state: &mut AppState, req: &Request) -> HandlerResult {
    require_user(state)?;
    let id = subscription_id(req)?;
    Ok(json!({ "unsubscribed": state.roster.unsubscribe(id) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "roster.snapshot" => snapshot(state, req),
        "roster.subscribe" => subscribe(state, req),
        "roster.unsubscribe" => unsubscribe(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
