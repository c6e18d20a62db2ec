use crate::auth::Capability;
use crate::db;
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{db_conn, db_err, optional_str, require_capability, required_str};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, AbsenceNotice};
use serde_json::json;

const DEFAULT_LOG_LIMIT: usize = 200;

fn list(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ViewRoster)?;
    let student_id = optional_str(req, "studentId");
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_LOG_LIMIT);
    let conn = db_conn(state)?;
    let entries = notify::list_log(conn, student_id.as_deref(), limit)
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "notifications": entries }))
}

fn outbox(state: &mut AppState, _req: &Request) -> HandlerResult {
    require_capability(state, Capability::ViewRoster)?;
    let conn = db_conn(state)?;
    let pending = notify::list_outbox(conn).map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "pending": pending }))
}

/// Queues a provider check message for one student.
fn send_test(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::SendTestNotification)?;
    let student_id = required_str(req, "studentId")?;
    let conn = db_conn(state)?;

    let (name, email) = notify::student_contact(conn, &student_id)
        .map_err(|e| db_err("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
    let Some(email) = email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty()) else {
        return Err(HandlerErr::new("no_email", "student has no registered email")
            .with_details(json!({ "studentId": student_id })));
    };

    let notice = AbsenceNotice {
        student_id: student_id.clone(),
        student_name: name,
        student_email: email,
        date: chrono::Local::now().format("%Y-%m-%d").to_string(),
        subject: notify::SYSTEM_TEST_SUBJECT.to_string(),
        kind: notify::SYSTEM_TEST.to_string(),
    };
    let outbox_id = notify::enqueue(conn, &notice, db::now_millis())
        .map_err(|e| db_err("db_insert_failed", e).with_details(json!({ "table": "notification_outbox" })))?;
    tracing::info!(student_id = %student_id, outbox_id = %outbox_id, "test notification queued");
    state.wake_notifier();
    Ok(json!({ "queued": true, "outboxId": outbox_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notifications.list" => list(state, req),
        "notifications.outbox" => outbox(state, req),
        "notifications.sendTest" => send_test(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
