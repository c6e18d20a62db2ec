mod attendance;
mod auth;
mod config;
mod db;
mod feed;
mod grades;
mod ipc;
mod notify;
mod reports;
mod roster;

use std::io::{self, BufRead, Write};
use std::sync::mpsc;

use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("AURORAD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the IPC stream.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn write_line(stdout: &mut impl Write, value: &impl serde::Serialize) {
    let line = serde_json::to_string(value).unwrap_or_else(|_| "{\"ok\":false}".to_string());
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let config = config::Config::load()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mailer = ?config.mailer,
        "aurorad starting"
    );

    let (events_tx, events_rx) = mpsc::channel::<ipc::Event>();
    let mut state = ipc::AppState::new(config, events_tx);
    if let Some(path) = state.config.workspace.clone() {
        if let Err(e) = ipc::open_workspace(&mut state, &path) {
            tracing::error!(error = %format!("{e:#}"), "configured workspace could not be opened");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!(error = %e, "unparseable request line");
                write_line(
                    &mut stdout,
                    &serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    }),
                );
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        write_line(&mut stdout, &resp);
        for event in events_rx.try_iter() {
            write_line(&mut stdout, &event);
        }
    }

    tracing::info!("stdin closed; shutting down");
    Ok(())
}
