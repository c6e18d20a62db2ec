use rusqlite::Connection;
use serde_json::json;

use crate::auth::{Capability, SessionUser};
use crate::feed::SubscriptionId;
use crate::ipc::error::HandlerErr;
use crate::ipc::types::{AppState, Request};

pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

/// Trimmed and non-empty, else `None`.
pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn required_name(req: &Request, key: &str) -> Result<String, HandlerErr> {
    let v = required_str(req, key)?.trim().to_string();
    if v.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must not be empty", key),
        ));
    }
    Ok(v)
}

pub fn subscription_id(req: &Request) -> Result<SubscriptionId, HandlerErr> {
    let raw = required_str(req, "subscriptionId")?;
    SubscriptionId::parse(&raw).ok_or_else(|| {
        HandlerErr::new("bad_params", "invalid subscriptionId")
            .with_details(json!({ "subscriptionId": raw }))
    })
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn db_err(code: &'static str, e: impl std::fmt::Display) -> HandlerErr {
    HandlerErr::new(code, e.to_string())
}

pub fn require_user(state: &AppState) -> Result<SessionUser, HandlerErr> {
    state
        .current_user()
        .cloned()
        .ok_or_else(|| HandlerErr::new("unauthenticated", "sign in first"))
}

pub fn require_capability(state: &AppState, cap: Capability) -> Result<SessionUser, HandlerErr> {
    let user = require_user(state)?;
    if !user.can(cap) {
        tracing::warn!(user_id = %user.id, capability = cap.as_str(), "permission denied");
        return Err(HandlerErr::new("forbidden", "not allowed for this role")
            .with_details(json!({ "capability": cap.as_str(), "role": user.role })));
    }
    Ok(user)
}

pub fn user_json(user: &SessionUser) -> serde_json::Value {
    let mut v = json!(user);
    v["capabilities"] = json!(user.capabilities());
    v
}
