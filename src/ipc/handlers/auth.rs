use crate::auth::{self, AuthError, Identity, SessionUser};
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{db_conn, required_str, subscription_id, user_json};
use crate::ipc::types::{AppState, Event, Request, Session};
use rusqlite::Connection;
use serde_json::json;

fn resolve(state: &AppState, conn: &Connection, identity: &Identity) -> SessionUser {
    auth::resolve_session_user(identity, &state.config.super_admin_email, |id| {
        auth::load_role_record(conn, id)
    })
}

fn session_result(token: &str, user: &SessionUser) -> serde_json::Value {
    json!({ "token": token, "user": user_json(user) })
}

fn sign_up(state: &mut AppState, req: &Request) -> HandlerResult {
    let email = required_str(req, "email")?;
    let password = required_str(req, "password")?;
    let conn = db_conn(state)?;

    let issued = auth::create_identity(conn, &email, &password)
        .and_then(|identity| Ok((auth::open_session(conn, &identity)?, identity)));
    let (token, identity) = issued.map_err(|e| {
        tracing::info!(code = e.code(), "sign-up rejected");
        HandlerErr::new(e.code(), e.sign_up_message())
    })?;
    let user = resolve(state, conn, &identity);
    tracing::info!(user_id = %user.id, role = ?user.role, "signed up");

    let result = session_result(&token, &user);
    state.replace_session(Some(Session { token, user }));
    Ok(result)
}

fn sign_in(state: &mut AppState, req: &Request) -> HandlerResult {
    let email = required_str(req, "email")?;
    let password = required_str(req, "password")?;
    let conn = db_conn(state)?;

    let issued = auth::verify_credentials(conn, &email, &password)
        .and_then(|identity| Ok((auth::open_session(conn, &identity)?, identity)));
    let (token, identity) = issued.map_err(|e| {
        tracing::warn!(error = %e, "sign-in failed");
        HandlerErr::new(
            AuthError::InvalidCredentials.code(),
            e.sign_in_message(),
        )
    })?;
    let user = resolve(state, conn, &identity);
    tracing::info!(user_id = %user.id, role = ?user.role, "signed in");

    let result = session_result(&token, &user);
    state.replace_session(Some(Session { token, user }));
    Ok(result)
}

fn sign_out(state: &mut AppState, _req: &Request) -> HandlerResult {
    let Some(session) = state.session.as_ref() else {
        return Ok(json!({ "signedOut": false }));
    };
    tracing::info!(user_id = %session.user.id, "signed out");
    state.replace_session(None);
    Ok(json!({ "signedOut": true }))
}

fn session(state: &mut AppState, _req: &Request) -> HandlerResult {
    Ok(match state.current_user() {
        Some(user) => json!({ "user": user_json(user) }),
        None => json!({ "user": null }),
    })
}

fn restore(state: &mut AppState, req: &Request) -> HandlerResult {
    let token = required_str(req, "token")?;
    let conn = db_conn(state)?;
    let identity = auth::restore_session(conn, &token).map_err(|e| HandlerErr::new(e.code(), e.to_string()))?;
    let user = resolve(state, conn, &identity);
    tracing::info!(user_id = %user.id, role = ?user.role, "session restored");

    let result = session_result(&token, &user);
    state.replace_session(Some(Session { token, user }));
    Ok(result)
}

fn subscribe(state: &mut AppState, _req: &Request) -> HandlerResult {
    let tx = state.events.clone();
    let id = state.session_feed.subscribe(move |id, user: &Option<SessionUser>| {
        let payload = match user {
            Some(u) => json!({ "user": user_json(u) }),
            None => json!({ "user": null }),
        };
        let _ = tx.send(Event::new("session.changed", id, payload));
    });
    let current = state.current_user().cloned();
    state.session_feed.deliver(id, &current);
    Ok(json!({ "subscriptionId": id.to_string() }))
}

fn unsubscribe(state: &mut AppState, req: &Request) -> HandlerResult {
    let id = subscription_id(req)?;
    Ok(json!({ "unsubscribed": state.session_feed.unsubscribe(id) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.signUp" => sign_up(state, req),
        "auth.signIn" => sign_in(state, req),
        "auth.signOut" => sign_out(state, req),
        "auth.session" => session(state, req),
        "auth.restore" => restore(state, req),
        "auth.subscribe" => subscribe(state, req),
        "auth.unsubscribe" => unsubscribe(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
