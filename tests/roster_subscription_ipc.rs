use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

const SUPER_ADMIN: &str = "head@aurora.test";

fn spawn_sidecar(envs: &[(&str, &str)]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_aurorad");
    let mut cmd = Command::new(exe);
    cmd.env_remove("AURORAD_CONFIG")
        .env_remove("AURORAD_WORKSPACE")
        .env("AURORAD_SUPER_ADMIN_EMAIL", SUPER_ADMIN)
        .env("AURORAD_NOTIFY_POLL_MS", "50");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn aurorad");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

/// Returns the full response envelope; event lines in between are skipped.
fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        if value.get("event").is_some() {
            continue;
        }
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
        return value;
    }
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn open_as_admin(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let session = request_ok(
        stdin,
        reader,
        "admin",
        "auth.signUp",
        json!({ "email": SUPER_ADMIN, "password": "head-secret" }),
    );
    assert_eq!(session["user"]["role"], "admin");
}

fn read_event(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read event line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse event json");
    assert!(value.get("event").is_some(), "expected an event line, got {}", value);
    value
}

#[test]
fn subscribers_receive_current_snapshot_then_changes() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar(&[]);
    open_as_admin(&mut stdin, &mut reader, workspace.path());

    let snap = request_ok(&mut stdin, &mut reader, "1", "roster.snapshot", json!({}));
    let v0 = snap["snapshot"]["version"].as_u64().expect("version");
    assert_eq!(snap["snapshot"]["classes"], json!([]));

    let sub = request_ok(&mut stdin, &mut reader, "2", "roster.subscribe", json!({}));
    let sub_id = sub["subscriptionId"].as_str().expect("subscriptionId").to_string();
    let initial = read_event(&mut reader);
    assert_eq!(initial["event"], "roster.changed");
    assert_eq!(initial["subscriptionId"], sub_id.as_str());
    assert_eq!(initial["payload"]["version"], v0);

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "1A", "schedule": "Morning" }),
    );
    let changed = read_event(&mut reader);
    assert_eq!(changed["payload"]["version"], v0 + 1);
    assert_eq!(changed["payload"]["classes"][0]["id"], class["classId"]);

    // Dropped grade input changes nothing, so no event follows.
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "name": "Ana", "classId": class["classId"] }),
    );
    let with_student = read_event(&mut reader);
    assert_eq!(with_student["payload"]["students"][0]["name"], "Ana");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.add",
        json!({ "studentId": student["student"]["id"], "subject": "Math", "value": "x" }),
    );
    let unsub = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "roster.unsubscribe",
        json!({ "subscriptionId": sub_id }),
    );
    assert_eq!(unsub["unsubscribed"], true);

    // Next line is the response itself: no event after unsubscribing.
    writeln!(
        stdin,
        "{}",
        json!({ "id": "7", "method": "classes.create", "params": { "name": "2B", "schedule": "Night" } })
    )
    .expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(value["id"], "7");

    let latest = request_ok(&mut stdin, &mut reader, "8", "roster.snapshot", json!({}));
    assert_eq!(latest["snapshot"]["version"], v0 + 3);
    assert_eq!(latest["snapshot"]["classes"].as_array().map(|a| a.len()), Some(2));
}

#[test]
fn roster_requires_a_session_and_auth_requires_a_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar(&[]);
    let res = request(&mut stdin, &mut reader, "1", "roster.snapshot", json!({}));
    assert_eq!(error_code(&res), "unauthenticated");
    let res = request(
        &mut stdin,
        &mut reader,
        "2",
        "auth.signIn",
        json!({ "email": SUPER_ADMIN, "password": "whatever" }),
    );
    assert_eq!(error_code(&res), "no_workspace");
}

fn next_line(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read line");
    serde_json::from_str(line.trim()).expect("parse line json")
}

#[test]
fn signing_out_ends_roster_subscriptions_and_replaced_tokens_are_revoked() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar(&[]);
    open_as_admin(&mut stdin, &mut reader, workspace.path());

    let sub = request_ok(&mut stdin, &mut reader, "1", "roster.subscribe", json!({}));
    let sub_id = sub["subscriptionId"].as_str().expect("subscriptionId").to_string();
    let _initial = read_event(&mut reader);

    let out = request_ok(&mut stdin, &mut reader, "2", "auth.signOut", json!({}));
    assert_eq!(out["signedOut"], true);
    let res = request(
        &mut stdin,
        &mut reader,
        "3",
        "roster.unsubscribe",
        json!({ "subscriptionId": sub_id }),
    );
    assert_eq!(error_code(&res), "unauthenticated");

    let credentials = json!({ "email": SUPER_ADMIN, "password": "head-secret" });
    let first = request_ok(&mut stdin, &mut reader, "4", "auth.signIn", credentials.clone());
    let second = request_ok(&mut stdin, &mut reader, "5", "auth.signIn", credentials);
    assert_ne!(first["token"], second["token"]);

    // The subscription from the earlier session must not fire.
    writeln!(
        stdin,
        "{}",
        json!({ "id": "6", "method": "classes.create", "params": { "name": "3C", "schedule": "Afternoon" } })
    )
    .expect("write request");
    stdin.flush().expect("flush request");
    let value = next_line(&mut reader);
    assert_eq!(value["id"], "6", "unexpected line {}", value);
    assert_eq!(value["ok"], true);

    let res = request(
        &mut stdin,
        &mut reader,
        "7",
        "auth.restore",
        json!({ "token": first["token"] }),
    );
    assert_eq!(error_code(&res), "auth/session-not-found");
    let restored = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "auth.restore",
        json!({ "token": second["token"] }),
    );
    assert_eq!(restored["user"]["role"], "admin");
}
