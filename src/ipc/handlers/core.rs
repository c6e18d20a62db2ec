use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, RetryPolicy, Worker};
use anyhow::Context;
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "signedIn": state.session.is_some(),
            "notifier": state.notifier.is_some(),
            "rosterSubscribers": state.roster.subscriber_count(),
            "schoolName": state.config.school_name,
        }),
    )
}

/// Opens (or creates) the workspace database, resets per-workspace state, loads the first
/// roster snapshot and starts the notification worker.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)
        .with_context(|| format!("failed to open workspace {}", path.display()))?;
    let mailer = notify::build_mailer(&state.config.mailer).context("failed to build mailer")?;

    state.notifier = None;
    state.set_session(None);
    state.roster.reset();
    state.roster.refresh(&conn).context("failed to load roster")?;
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);

    match Worker::spawn(
        &db::db_path(path),
        mailer,
        RetryPolicy::from_config(&state.config.notify),
        state.config.notify.poll_interval(),
    ) {
        Ok(worker) => {
            worker.wake();
            state.notifier = Some(worker);
        }
        Err(e) => {
            // Queued notifications stay in the outbox until a worker runs.
            tracing::error!(error = %e, "failed to start notification worker");
        }
    }
    tracing::info!(workspace = %path.display(), "workspace opened");
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, &path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
