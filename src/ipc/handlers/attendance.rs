use crate::attendance::{self, AttendanceStatus, GENERAL_SUBJECT};
use crate::auth::{Capability, SessionUser};
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{db_conn, db_err, require_capability, required_str};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use serde_json::json;
use std::collections::HashMap;

/// Teachers record against their own subject; everyone else uses the general register.
fn attendance_subject(user: &SessionUser) -> String {
    match (user.is_teacher(), user.subject.as_deref().map(str::trim)) {
        (true, Some(s)) if !s.is_empty() => s.to_string(),
        _ => GENERAL_SUBJECT.to_string(),
    }
}

fn required_date(req: &Request) -> Result<String, HandlerErr> {
    let date = required_str(req, "date")?;
    if !attendance::is_iso_date(&date) {
        return Err(HandlerErr::new("bad_params", "date must be YYYY-MM-DD")
            .with_details(json!({ "date": date })));
    }
    Ok(date)
}

fn parse_statuses(req: &Request) -> Result<HashMap<String, AttendanceStatus>, HandlerErr> {
    let Some(obj) = req.params.get("statuses").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "missing statuses"));
    };
    let mut out = HashMap::with_capacity(obj.len());
    for (student_id, raw) in obj {
        let status = raw
            .as_str()
            .and_then(AttendanceStatus::parse)
            .ok_or_else(|| {
                HandlerErr::new(
                    "bad_params",
                    "status must be one of: present, justified, certificate, unjustified",
                )
                .with_details(json!({ "studentId": student_id, "status": raw }))
            })?;
        out.insert(student_id.clone(), status);
    }
    Ok(out)
}

fn open(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_capability(state, Capability::TakeAttendance)?;
    let class_id = required_str(req, "classId")?;
    let date = required_date(req)?;
    let subject = attendance_subject(&user);
    let conn = db_conn(state)?;

    if roster::load_class(conn, &class_id)
        .map_err(|e| db_err("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::new("not_found", "class not found"));
    }
    let entries = attendance::open_sheet(conn, &class_id, &date, &subject)
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({
        "classId": class_id,
        "date": date,
        "subject": subject,
        "entries": entries
    }))
}

fn save(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_capability(state, Capability::TakeAttendance)?;
    let class_id = required_str(req, "classId")?;
    let date = required_date(req)?;
    let statuses = parse_statuses(req)?;
    let subject = attendance_subject(&user);
    let conn = db_conn(state)?;

    let members =
        attendance::class_members(conn, &class_id).map_err(|e| db_err("db_query_failed", e))?;
    if members.is_empty() {
        return Err(HandlerErr::new("no_students", "no students in this class")
            .with_details(json!({ "classId": class_id })));
    }

    let report = attendance::save_class(conn, &members, &date, &subject, &statuses);
    tracing::info!(
        class_id = %class_id,
        date = %date,
        subject = %subject,
        saved = report.saved.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        queued = report.notifications_queued,
        "attendance saved"
    );
    if report.notifications_queued > 0 {
        state.wake_notifier();
    }

    let mut result = json!(report);
    result["date"] = json!(date);
    result["subject"] = json!(subject);
    Ok(result)
}

fn history(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ViewRoster)?;
    let student_id = required_str(req, "studentId")?;
    let conn = db_conn(state)?;
    if roster::load_student(conn, &student_id)
        .map_err(|e| db_err("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    let records =
        attendance::list_records(conn, &student_id).map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "studentId": student_id, "records": records }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.open" => open(state, req),
        "attendance.save" => save(state, req),
        "attendance.history" => history(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
