use crate::auth::Capability;
use crate::db;
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{
    db_conn, db_err, optional_str, require_capability, required_name, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use rusqlite::{params_from_iter, types::Value, Connection};
use serde_json::json;
use uuid::Uuid;

/// Updatable contact fields: (param key, column).
const CONTACT_FIELDS: [(&str, &str); 4] = [
    ("email", "email"),
    ("phone", "phone"),
    ("guardianName", "guardian_name"),
    ("birthDate", "birth_date"),
];

fn load(conn: &Connection, student_id: &str) -> HandlerResult {
    let student = roster::load_student(conn, student_id)
        .map_err(|e| db_err("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
    Ok(json!({ "student": student }))
}

fn list(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ViewRoster)?;
    let class_id = optional_str(req, "classId");
    let conn = db_conn(state)?;
    let students = roster::list_students(conn, class_id.as_deref())
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "students": students }))
}

fn get(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ViewRoster)?;
    let student_id = required_str(req, "studentId")?;
    load(db_conn(state)?, &student_id)
}

fn insert_student(
    conn: &Connection,
    name: &str,
    class_id: Option<&str>,
    contact: &[Option<String>; 4],
) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO students(id, name, class_id, email, phone, guardian_name, birth_date, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            name,
            class_id,
            contact[0].as_deref(),
            contact[1].as_deref(),
            contact[2].as_deref(),
            contact[3].as_deref(),
            &now,
            &now,
        ),
    )?;
    Ok(id)
}

fn create(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ManageStudents)?;
    let name = required_name(req, "name")?;
    let class_id = optional_str(req, "classId");
    let contact = CONTACT_FIELDS.map(|(key, _)| optional_str(req, key));
    let conn = db_conn(state)?;

    let id = insert_student(conn, &name, class_id.as_deref(), &contact)
        .map_err(|e| db_err("db_insert_failed", e).with_details(json!({ "table": "students" })))?;
    tracing::info!(student_id = %id, "student created");
    load(conn, &id)
}

/// Field-level update: only keys present in params are written; `null` clears a field.
fn update(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ManageStudents)?;
    let student_id = required_str(req, "studentId")?;

    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if req.params.get("name").is_some() {
        sets.push("name = ?".to_string());
        values.push(Value::Text(required_name(req, "name")?));
    }
    let optional_fields = std::iter::once(("classId", "class_id")).chain(CONTACT_FIELDS);
    for (key, column) in optional_fields {
        let Some(raw) = req.params.get(key) else {
            continue;
        };
        let value = match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::String(s) if s.trim().is_empty() => Value::Null,
            serde_json::Value::String(s) => Value::Text(s.trim().to_string()),
            _ => {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("{} must be a string or null", key),
                ))
            }
        };
        sets.push(format!("{} = ?", column));
        values.push(value);
    }
    if sets.is_empty() {
        return Err(HandlerErr::new("bad_params", "nothing to update"));
    }
    sets.push("updated_at = ?".to_string());
    values.push(Value::Text(db::now_rfc3339()));
    values.push(Value::Text(student_id.clone()));

    let conn = db_conn(state)?;
    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    let changed = conn
        .execute(&sql, params_from_iter(values))
        .map_err(|e| db_err("db_update_failed", e).with_details(json!({ "table": "students" })))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    load(conn, &student_id)
}

fn delete(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ManageStudents)?;
    let student_id = required_str(req, "studentId")?;
    let conn = db_conn(state)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    for sql in [
        "DELETE FROM grades WHERE student_id = ?",
        "DELETE FROM attendance WHERE student_id = ?",
    ] {
        tx.execute(sql, [&student_id])
            .map_err(|e| db_err("db_delete_failed", e))?;
    }
    let removed = tx
        .execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| db_err("db_delete_failed", e).with_details(json!({ "table": "students" })))?;
    if removed == 0 {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    tracing::info!(student_id = %student_id, "student deleted");
    Ok(json!({ "deleted": true }))
}

/// Accepts newline-separated text or an array of names; blank lines are ignored.
fn parse_names(req: &Request) -> Result<Vec<String>, HandlerErr> {
    let names: Vec<String> = match req.params.get("names") {
        Some(serde_json::Value::String(text)) => text.lines().map(str::to_string).collect(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
        _ => return Err(HandlerErr::new("bad_params", "missing names")),
    };
    Ok(names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect())
}

fn bulk_import(state: &mut AppState, req: &Request) -> HandlerResult {
    require_capability(state, Capability::ManageStudents)?;
    let class_id = required_str(req, "classId")?;
    let names = parse_names(req)?;
    if names.is_empty() {
        return Err(HandlerErr::new("bad_params", "no names to import"));
    }
    let conn = db_conn(state)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    let no_contact: [Option<String>; 4] = Default::default();
    let mut ids = Vec::with_capacity(names.len());
    for name in &names {
        let id = insert_student(&tx, name, Some(&class_id), &no_contact)
            .map_err(|e| db_err("db_insert_failed", e).with_details(json!({ "table": "students" })))?;
        ids.push(id);
    }
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    tracing::info!(class_id = %class_id, count = ids.len(), "students imported");
    Ok(json!({ "created": ids.len(), "studentIds": ids, "classId": class_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => list(state, req),
        "students.get" => get(state, req),
        "students.create" => create(state, req),
        "students.update" => update(state, req),
        "students.delete" => delete(state, req),
        "students.bulkImport" => bulk_import(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
