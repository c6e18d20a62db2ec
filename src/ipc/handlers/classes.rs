use crate::auth::Capability;
use crate::db;
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{db_conn, db_err, require_capability, required_name, required_str};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, Schedule};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn list(state: &mut AppState, _req: &Request) -> HandlerResult {
    require_capability(state, Capability::ViewRoster)?;
    let conn = db_conn(state)?;
    let classes = roster::list_classes(conn).map_err(|e| db_err("db_query_failed", e))?;

    let mut out = Vec::with_capacity(classes.len());
    for class in classes {
        let student_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM students WHERE class_id = ?",
                [&class.id],
                |r| r.get(0),
            )
            .map_err(|e| db_err("db_query_failed", e))?;
        let mut v = json!(class);
        v["studentCount"] = json!(student_count);
        out.push(v);
    }
    Ok(json!({ "classes": out }))
}

fn create(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ManageClasses)?;
    let name = required_name(req, "name")?;
    let schedule_raw = required_str(req, "schedule")?;
    let schedule = Schedule::parse(&schedule_raw).ok_or_else(|| {
        HandlerErr::new(
            "bad_params",
            "schedule must be one of: Morning, Afternoon, Night, Full-time",
        )
        .with_details(json!({ "schedule": schedule_raw }))
    })?;
    let conn = db_conn(state)?;

    let class_id = Uuid::new_v4().to_string();
    let created_at = db::now_rfc3339();
    conn.execute(
        "INSERT INTO classes(id, name, schedule, created_at) VALUES(?, ?, ?, ?)",
        (&class_id, &name, schedule.as_str(), &created_at),
    )
    .map_err(|e| db_err("db_insert_failed", e).with_details(json!({ "table": "classes" })))?;

    tracing::info!(class_id = %class_id, "class created");
    Ok(json!({
        "classId": class_id,
        "name": name,
        "schedule": schedule,
        "createdAt": created_at
    }))
}

/// Removes only the class row. Students keep their `classId`.
fn delete(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ManageClasses)?;
    let class_id = required_str(req, "classId")?;
    let conn = db_conn(state)?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| r.get(0))
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    conn.execute("DELETE FROM classes WHERE id = ?", [&class_id])
        .map_err(|e| db_err("db_delete_failed", e).with_details(json!({ "table": "classes" })))?;
    let orphaned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| db_err("db_query_failed", e))?;

    tracing::info!(class_id = %class_id, orphaned, "class deleted");
    Ok(json!({ "deleted": true, "orphanedStudents": orphaned }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.list" => list(state, req),
        "classes.create" => create(state, req),
        "classes.delete" => delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
