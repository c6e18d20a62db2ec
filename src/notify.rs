use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::time::Duration;
use uuid::Uuid;

use crate::config::{MailerConfig, NotifyConfig};
use crate::db;

pub const ABSENCE_UNJUSTIFIED: &str = "absence_unjustified";
pub const SYSTEM_TEST: &str = "system_test";
pub const SYSTEM_TEST_SUBJECT: &str = "SYSTEM TEST";

#[derive(Debug, Clone, PartialEq)]
pub struct AbsenceNotice {
    pub student_id: String,
    pub student_name: String,
    pub student_email: String,
    pub date: String,
    pub subject: String,
    pub kind: String,
}

/// Parameters handed to the provider's template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateMessage {
    pub to_name: String,
    pub to_email: String,
    pub date: String,
    pub subject: String,
    pub student_name: String,
    pub message: String,
}

pub fn compose(notice: &AbsenceNotice) -> TemplateMessage {
    TemplateMessage {
        to_name: notice.student_name.clone(),
        to_email: notice.student_email.clone(),
        date: notice.date.clone(),
        subject: notice.subject.clone(),
        student_name: notice.student_name.clone(),
        message: if notice.kind == SYSTEM_TEST {
            format!(
                "Test message from the school notification system for {}.",
                notice.student_name
            )
        } else {
            format!(
                "This is to inform you that the student {} received an unexcused absence on {} in {}.",
                notice.student_name, notice.date, notice.subject
            )
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("email delivery is disabled")]
    Disabled,
    #[error("email provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("email provider rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("failed to write message: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait Mailer: Send {
    fn send(&self, msg: &TemplateMessage) -> Result<(), MailError>;
    fn name(&self) -> &'static str;
}

pub struct DisabledMailer;

impl Mailer for DisabledMailer {
    fn send(&self, _msg: &TemplateMessage) -> Result<(), MailError> {
        Err(MailError::Disabled)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Writes one JSON file per message into a pickup directory.
pub struct DropDirMailer {
    dir: PathBuf,
}

impl DropDirMailer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DropDirMailer { dir: dir.into() }
    }
}

impl Mailer for DropDirMailer {
    fn send(&self, msg: &TemplateMessage) -> Result<(), MailError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.json", Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(msg)?;
        std::fs::write(path, body)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "drop_dir"
    }
}

pub struct EmailJsMailer {
    client: reqwest::blocking::Client,
    endpoint: String,
    service_id: String,
    template_id: String,
    user_id: String,
}

impl EmailJsMailer {
    pub fn new(
        endpoint: &str,
        service_id: &str,
        template_id: &str,
        user_id: &str,
    ) -> Result<Self, MailError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(EmailJsMailer {
            client,
            endpoint: endpoint.to_string(),
            service_id: service_id.to_string(),
            template_id: template_id.to_string(),
            user_id: user_id.to_string(),
        })
    }
}

impl Mailer for EmailJsMailer {
    fn send(&self, msg: &TemplateMessage) -> Result<(), MailError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "service_id": self.service_id,
                "template_id": self.template_id,
                "user_id": self.user_id,
                "template_params": msg,
            }))
            .send()?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().unwrap_or_default();
        Err(MailError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    fn name(&self) -> &'static str {
        "emailjs"
    }
}

pub fn build_mailer(cfg: &MailerConfig) -> Result<Box<dyn Mailer>, MailError> {
    Ok(match cfg {
        MailerConfig::Disabled => Box::new(DisabledMailer),
        MailerConfig::DropDir { dir } => Box::new(DropDirMailer::new(dir.clone())),
        MailerConfig::Emailjs {
            service_id,
            template_id,
            user_id,
            endpoint,
        } => Box::new(EmailJsMailer::new(
            endpoint,
            service_id,
            template_id,
            user_id,
        )?),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &NotifyConfig) -> Self {
        RetryPolicy {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// Delay before the attempt that follows `attempts_made` failures.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let exp = attempts_made.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

pub fn enqueue(conn: &Connection, notice: &AbsenceNotice, now_ms: i64) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notification_outbox(
           id, student_id, student_name, student_email, date, subject, type,
           attempts, next_attempt_at, claimed, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, 0, ?, 0, ?)",
        (
            &id,
            &notice.student_id,
            &notice.student_name,
            &notice.student_email,
            &notice.date,
            &notice.subject,
            &notice.kind,
            now_ms,
            db::now_rfc3339(),
        ),
    )?;
    Ok(id)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
    pub rescheduled: usize,
    /// Released after a storage error; due again on the next pass.
    pub deferred: usize,
}

struct OutboxRow {
    id: String,
    notice: AbsenceNotice,
    attempts: u32,
}

/// Sends every due outbox entry once. Final outcomes are appended to the log and the
/// entry leaves the outbox; transient failures are rescheduled with backoff. An entry
/// whose outcome cannot be stored is released so a later pass picks it up.
pub fn dispatch_due(
    conn: &Connection,
    mailer: &dyn Mailer,
    policy: &RetryPolicy,
    now_ms: i64,
) -> rusqlite::Result<DispatchReport> {
    let mut report = DispatchReport::default();
    let mut stmt = conn.prepare(
        "SELECT id, student_id, student_name, student_email, date, subject, type, attempts
         FROM notification_outbox
         WHERE claimed = 0 AND next_attempt_at <= ?
         ORDER BY next_attempt_at, created_at",
    )?;
    let due = stmt
        .query_map([now_ms], |r| {
            Ok(OutboxRow {
                id: r.get(0)?,
                notice: AbsenceNotice {
                    student_id: r.get(1)?,
                    student_name: r.get(2)?,
                    student_email: r.get(3)?,
                    date: r.get(4)?,
                    subject: r.get(5)?,
                    kind: r.get(6)?,
                },
                attempts: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    for row in due {
        match settle(conn, mailer, policy, &row, now_ms) {
            Ok(Some(Settled::Sent)) => report.sent += 1,
            Ok(Some(Settled::Failed)) => report.failed += 1,
            Ok(Some(Settled::Rescheduled)) => report.rescheduled += 1,
            Ok(None) => {}
            Err(e) => {
                // The entry goes back to the queue; the rest of the batch still runs.
                tracing::error!(
                    outbox_id = %row.id,
                    student_id = %row.notice.student_id,
                    error = %e,
                    "outbox entry not settled; releasing claim"
                );
                if let Err(e) = conn.execute(
                    "UPDATE notification_outbox SET claimed = 0 WHERE id = ?",
                    [&row.id],
                ) {
                    tracing::error!(outbox_id = %row.id, error = %e, "failed to release claim");
                }
                report.deferred += 1;
            }
        }
    }
    Ok(report)
}

enum Settled {
    Sent,
    Failed,
    Rescheduled,
}

/// Claims one entry and records its outcome. `None` when another worker holds it.
fn settle(
    conn: &Connection,
    mailer: &dyn Mailer,
    policy: &RetryPolicy,
    row: &OutboxRow,
    now_ms: i64,
) -> rusqlite::Result<Option<Settled>> {
    let claimed = conn.execute(
        "UPDATE notification_outbox SET claimed = 1 WHERE id = ? AND claimed = 0",
        [&row.id],
    )?;
    if claimed != 1 {
        return Ok(None);
    }

    let attempts = row.attempts + 1;
    let outcome = match mailer.send(&compose(&row.notice)) {
        Ok(()) => {
            tracing::info!(
                student_id = %row.notice.student_id,
                mailer = mailer.name(),
                attempts,
                "notification sent"
            );
            finish(conn, row, "sent", None, attempts)?;
            Settled::Sent
        }
        Err(e) if attempts >= policy.max_attempts => {
            tracing::warn!(
                student_id = %row.notice.student_id,
                mailer = mailer.name(),
                attempts,
                error = %e,
                "notification failed; giving up"
            );
            finish(conn, row, "error", Some(&e.to_string()), attempts)?;
            Settled::Failed
        }
        Err(e) => {
            let delay = policy.backoff(attempts);
            tracing::debug!(
                student_id = %row.notice.student_id,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "notification failed; retrying later"
            );
            conn.execute(
                "UPDATE notification_outbox
                 SET claimed = 0, attempts = ?, next_attempt_at = ?, last_error = ?
                 WHERE id = ?",
                (
                    attempts,
                    now_ms + delay.as_millis() as i64,
                    e.to_string(),
                    &row.id,
                ),
            )?;
            Settled::Rescheduled
        }
    };
    Ok(Some(outcome))
}

fn finish(
    conn: &Connection,
    row: &OutboxRow,
    status: &str,
    detail: Option<&str>,
    attempts: u32,
) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO notifications(
           id, student_id, student_name, date, subject, type, status, detail, attempts, timestamp
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &row.notice.student_id,
            &row.notice.student_name,
            &row.notice.date,
            &row.notice.subject,
            &row.notice.kind,
            status,
            detail,
            attempts,
            db::now_rfc3339(),
        ),
    )?;
    tx.execute("DELETE FROM notification_outbox WHERE id = ?", [&row.id])?;
    tx.commit()
}

/// Entries claimed by a worker that died mid-send become due again.
pub fn release_stale_claims(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE notification_outbox SET claimed = 0 WHERE claimed = 1",
        [],
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub date: String,
    pub subject: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub detail: Option<String>,
    pub attempts: u32,
    pub timestamp: String,
}

pub fn list_log(
    conn: &Connection,
    student_id: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, student_name, date, subject, type, status, detail, attempts, timestamp
         FROM notifications
         WHERE (?1 IS NULL OR student_id = ?1)
         ORDER BY timestamp DESC, rowid DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map((student_id, limit as i64), |r| {
            Ok(LogEntry {
                id: r.get(0)?,
                student_id: r.get(1)?,
                student_name: r.get(2)?,
                date: r.get(3)?,
                subject: r.get(4)?,
                kind: r.get(5)?,
                status: r.get(6)?,
                detail: r.get(7)?,
                attempts: r.get(8)?,
                timestamp: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    pub student_id: String,
    pub date: String,
    pub subject: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub attempts: u32,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
}

pub fn list_outbox(conn: &Connection) -> rusqlite::Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, date, subject, type, attempts, next_attempt_at, last_error
         FROM notification_outbox
         ORDER BY next_attempt_at, created_at",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(OutboxEntry {
                id: r.get(0)?,
                student_id: r.get(1)?,
                date: r.get(2)?,
                subject: r.get(3)?,
                kind: r.get(4)?,
                attempts: r.get(5)?,
                next_attempt_at: r.get(6)?,
                last_error: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn student_contact(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Option<(String, Option<String>)>> {
    conn.query_row(
        "SELECT name, email FROM students WHERE id = ?",
        [student_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
}

enum WorkerMsg {
    Wake,
    Shutdown,
}

/// Background dispatcher with its own connection to the workspace database.
/// Dropping it asks the thread to stop without waiting for an in-flight send.
pub struct Worker {
    tx: Sender<WorkerMsg>,
}

impl Worker {
    pub fn spawn(
        db_path: &Path,
        mailer: Box<dyn Mailer>,
        policy: RetryPolicy,
        poll: Duration,
    ) -> anyhow::Result<Worker> {
        let conn = db::open_existing(db_path)?;
        let released = release_stale_claims(&conn)?;
        if released > 0 {
            tracing::info!(released, "released stale outbox claims");
        }
        let (tx, rx) = mpsc::channel::<WorkerMsg>();
        std::thread::Builder::new()
            .name("aurorad-notify".to_string())
            .spawn(move || {
                tracing::debug!(mailer = mailer.name(), "notification worker started");
                loop {
                    match rx.recv_timeout(poll) {
                        Ok(WorkerMsg::Wake) | Err(RecvTimeoutError::Timeout) => {}
                        Ok(WorkerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if let Err(e) = dispatch_due(&conn, mailer.as_ref(), &policy, db::now_millis()) {
                        tracing::error!(error = %e, "notification dispatch failed");
                    }
                }
                tracing::debug!("notification worker stopped");
            })?;
        Ok(Worker { tx })
    }

    pub fn wake(&self) {
        let _ = self.tx.send(WorkerMsg::Wake);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMsg::Shutdown);
    }
}
