use crate::attendance;
use crate::auth::Capability;
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{db_conn, db_err, optional_str, require_capability, required_str};
use crate::ipc::types::{AppState, Request};
use crate::reports::{self, SheetInput};
use crate::roster;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Model,
    Html,
}

fn parse_format(req: &Request) -> Result<Format, HandlerErr> {
    match req
        .params
        .get("format")
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_lowercase())
        .as_deref()
    {
        None | Some("json") | Some("model") => Ok(Format::Model),
        Some("html") => Ok(Format::Html),
        Some(other) => Err(HandlerErr::new("bad_params", "format must be one of: json, html")
            .with_details(json!({ "format": other }))),
    }
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

fn attendance_sheet(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::PrintReports)?;
    let class_id = required_str(req, "classId")?;
    let format = parse_format(req)?;
    let month = optional_str(req, "month");
    let teacher = optional_str(req, "teacher");
    let conn = db_conn(state)?;

    let class = roster::load_class(conn, &class_id)
        .map_err(|e| db_err("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::new("not_found", "class not found"))?;
    let students = attendance::class_members(conn, &class_id)
        .map_err(|e| db_err("db_query_failed", e))?
        .into_iter()
        .map(|m| (m.id, m.name))
        .collect();

    let sheet = reports::attendance_sheet(
        SheetInput {
            school_name: &state.config.school_name,
            class_name: &class.name,
            month: month.as_deref(),
            teacher: teacher.as_deref(),
            students,
        },
        today(),
    );
    let mut result = json!({ "model": sheet });
    if format == Format::Html {
        result["html"] = json!(reports::render_attendance_sheet_html(&sheet));
    }
    Ok(result)
}

fn parse_year(req: &Request) -> Result<Option<i32>, HandlerErr> {
    match req.params.get("year") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .and_then(|y| i32::try_from(y).ok())
            .map(Some)
            .ok_or_else(|| {
                HandlerErr::new("bad_params", "year must be an integer")
                    .with_details(json!({ "year": v }))
            }),
    }
}

fn report_card(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::PrintReports)?;
    let student_id = required_str(req, "studentId")?;
    let format = parse_format(req)?;
    let year = parse_year(req)?;
    let conn = db_conn(state)?;

    let student = roster::load_student(conn, &student_id)
        .map_err(|e| db_err("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
    let card = reports::report_card(
        &state.config.school_name,
        year,
        &student.id,
        &student.name,
        &student.grades,
        today(),
    );
    let mut result = json!({ "model": card });
    if format == Format::Html {
        result["html"] = json!(reports::render_report_card_html(&card));
    }
    Ok(result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.attendanceSheet" => attendance_sheet(state, req),
        "reports.reportCard" => report_card(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
