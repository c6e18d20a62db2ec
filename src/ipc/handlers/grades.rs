use crate::auth::Capability;
use crate::grades::{self, GradeRef};
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{db_conn, db_err, optional_str, require_capability, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn ensure_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map_err(|e| db_err("db_query_failed", e))?
    .map(|_| ())
    .ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

fn summary_json(ledger: &[grades::Grade]) -> serde_json::Value {
    let avg = grades::grades_average(ledger);
    json!({
        "grades": ledger,
        "subjects": grades::subject_averages(ledger),
        "average": avg,
        "averageText": grades::format_average(avg),
        "passing": grades::is_passing(avg),
    })
}

/// Malformed values and missing subjects (including a teacher without an
/// assigned subject) are dropped with `added: false`.
fn add(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_capability(state, Capability::EnterGrades)?;
    let student_id = required_str(req, "studentId")?;
    // Teachers grade only their assigned subject; without one nothing is recorded.
    let subject = if user.is_teacher() {
        user.subject
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    } else {
        optional_str(req, "subject")
    };
    let value = match req.params.get("value") {
        Some(serde_json::Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()),
        Some(serde_json::Value::String(s)) => grades::parse_grade_value(s),
        _ => None,
    };
    let conn = db_conn(state)?;
    ensure_student(conn, &student_id)?;

    let (Some(subject), Some(value)) = (subject, value) else {
        tracing::debug!(student_id = %student_id, "grade input dropped");
        return Ok(json!({ "added": false }));
    };
    let grade = grades::append_grade(conn, &student_id, &subject, value)
        .map_err(|e| db_err("db_insert_failed", e).with_details(json!({ "table": "grades" })))?;
    let ledger = grades::list_grades(conn, &student_id).map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "added": true, "grade": grade, "summary": summary_json(&ledger) }))
}

fn remove(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::EnterGrades)?;
    let student_id = required_str(req, "studentId")?;
    let grade_id = optional_str(req, "gradeId");
    let target = match (&grade_id, req.params.get("index").and_then(|v| v.as_u64())) {
        (Some(id), _) => GradeRef::Id(id),
        (None, Some(i)) => GradeRef::Index(i as usize),
        (None, None) => return Err(HandlerErr::new("bad_params", "missing gradeId or index")),
    };
    let conn = db_conn(state)?;
    ensure_student(conn, &student_id)?;

    let removed = grades::remove_grade(conn, &student_id, target)
        .map_err(|e| db_err("db_delete_failed", e).with_details(json!({ "table": "grades" })))?
        .ok_or_else(|| HandlerErr::new("not_found", "grade not found"))?;
    let ledger = grades::list_grades(conn, &student_id).map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "removed": removed, "summary": summary_json(&ledger) }))
}

fn summary(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ViewRoster)?;
    let student_id = required_str(req, "studentId")?;
    let conn = db_conn(state)?;
    ensure_student(conn, &student_id)?;
    let ledger = grades::list_grades(conn, &student_id).map_err(|e| db_err("db_query_failed", e))?;
    Ok(summary_json(&ledger))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.add" => add(state, req),
        "grades.remove" => remove(state, req),
        "grades.summary" => summary(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
