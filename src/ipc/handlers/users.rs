use crate::auth::{self, Capability, NewUser, ProvisionError, Role};
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{
    db_conn, db_err, optional_str, require_capability, required_name, required_str,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn list(state: &mut AppState, _req: &Request) -> HandlerResult {
    require_capability(state, Capability::ManageUsers)?;
    let conn = db_conn(state)?;
    let users = auth::list_role_records(conn).map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "users": users }))
}

fn create(state: &mut AppState, req: &Request) -> HandlerResult {
    let caller = require_capability(state, Capability::ManageUsers)?;
    let name = required_name(req, "name")?;
    let email = required_str(req, "email")?;
    let password = required_str(req, "password")?;
    let role_raw = required_str(req, "role")?;
    let role = Role::parse(&role_raw).ok_or_else(|| {
        HandlerErr::new("bad_params", "role must be one of: admin, secretary, teacher")
            .with_details(json!({ "role": role_raw }))
    })?;
    if role == Role::Admin && !caller.can(Capability::ProvisionAdmins) {
        return Err(HandlerErr::new("forbidden", "only admins may create admins"));
    }
    let subject = optional_str(req, "subject");
    if role == Role::Teacher && subject.is_none() {
        return Err(HandlerErr::new("bad_params", "missing subject"));
    }
    let phone = optional_str(req, "phone");
    let conn = db_conn(state)?;

    let record = auth::provision_user(
        conn,
        &NewUser {
            name: &name,
            email: &email,
            phone: phone.as_deref(),
            password: &password,
            role,
            subject: subject.as_deref(),
        },
    )
    .map_err(|e| match e {
        ProvisionError::Identity(a) => HandlerErr::new(a.code(), a.sign_up_message()),
        ProvisionError::RoleRecord(e) => HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "users" })),
    })?;
    tracing::info!(by = %caller.id, user_id = %record.id, role = %role, "user provisioned");
    Ok(json!({ "user": record }))
}

fn delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let caller = require_capability(state, Capability::DeleteUsers)?;
    let user_id = required_str(req, "userId")?;
    let conn = db_conn(state)?;
    let removed = auth::delete_role_record(conn, &user_id).map_err(|e| db_err("db_delete_failed", e))?;
    if !removed {
        return Err(HandlerErr::new("not_found", "user not found"));
    }
    tracing::info!(by = %caller.id, user_id = %user_id, "role record deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.list" => list(state, req),
        "users.create" => create(state, req),
        "users.delete" => delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
