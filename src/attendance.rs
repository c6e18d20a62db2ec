use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::db;
use crate::notify::{self, AbsenceNotice};

/// Subject used when the person taking attendance has no subject of their own.
pub const GENERAL_SUBJECT: &str = "General";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Justified,
    Certificate,
    Unjustified,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Justified => "justified",
            AttendanceStatus::Certificate => "certificate",
            AttendanceStatus::Unjustified => "unjustified",
        }
    }

    pub fn parse(s: &str) -> Option<AttendanceStatus> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(AttendanceStatus::Present),
            "justified" => Some(AttendanceStatus::Justified),
            "certificate" => Some(AttendanceStatus::Certificate),
            "unjustified" => Some(AttendanceStatus::Unjustified),
            _ => None,
        }
    }

    pub fn is_present(self) -> bool {
        self == AttendanceStatus::Present
    }

    /// Older records carry only a `present` flag.
    pub fn from_legacy(status: Option<&str>, present: bool) -> AttendanceStatus {
        status
            .and_then(AttendanceStatus::parse)
            .unwrap_or(if present {
                AttendanceStatus::Present
            } else {
                AttendanceStatus::Unjustified
            })
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub date: String,
    pub subject: String,
    pub status: AttendanceStatus,
    pub present: bool,
}

impl AttendanceRecord {
    pub fn new(date: &str, subject: &str, status: AttendanceStatus) -> Self {
        AttendanceRecord {
            date: date.to_string(),
            subject: subject.to_string(),
            status,
            present: status.is_present(),
        }
    }
}

pub fn is_iso_date(s: &str) -> bool {
    s.len() == 10 && chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

pub fn list_records(conn: &Connection, student_id: &str) -> rusqlite::Result<Vec<AttendanceRecord>> {
    let mut stmt = conn.prepare(
        "SELECT date, subject, status FROM attendance WHERE student_id = ? ORDER BY seq",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            let date: String = r.get(0)?;
            let subject: String = r.get(1)?;
            let status: String = r.get(2)?;
            Ok((date, subject, status))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(date, subject, status)| {
            let status = AttendanceStatus::from_legacy(Some(&status), false);
            AttendanceRecord::new(&date, &subject, status)
        })
        .collect())
}

pub fn status_for(
    conn: &Connection,
    student_id: &str,
    date: &str,
    subject: &str,
) -> rusqlite::Result<Option<AttendanceStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM attendance WHERE student_id = ? AND date = ? AND subject = ?",
            (student_id, date, subject),
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.map(|s| AttendanceStatus::from_legacy(Some(&s), false)))
}

/// Upsert keyed by (student, date, subject). A replaced record moves to the end of the
/// ledger, matching remove-then-append.
pub fn write_record(
    conn: &Connection,
    student_id: &str,
    record: &AttendanceRecord,
) -> rusqlite::Result<()> {
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), -1) + 1 FROM attendance WHERE student_id = ?",
        [student_id],
        |r| r.get(0),
    )?;
    conn.execute(
        "INSERT INTO attendance(student_id, date, subject, status, seq, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date, subject) DO UPDATE SET
           status = excluded.status,
           seq = excluded.seq,
           updated_at = excluded.updated_at",
        (
            student_id,
            &record.date,
            &record.subject,
            record.status.as_str(),
            seq,
            db::now_rfc3339(),
        ),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ClassMember {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
}

pub fn class_members(conn: &Connection, class_id: &str) -> rusqlite::Result<Vec<ClassMember>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, email FROM students
         WHERE class_id = ?
         ORDER BY name COLLATE NOCASE, created_at",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(ClassMember {
                id: r.get(0)?,
                name: r.get(1)?,
                email: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetEntry {
    pub student_id: String,
    pub name: String,
    pub status: AttendanceStatus,
    pub recorded: bool,
}

/// Current status per class member for one (date, subject); unrecorded members default to present.
pub fn open_sheet(
    conn: &Connection,
    class_id: &str,
    date: &str,
    subject: &str,
) -> rusqlite::Result<Vec<SheetEntry>> {
    let members = class_members(conn, class_id)?;
    let mut out = Vec::with_capacity(members.len());
    for m in members {
        let existing = status_for(conn, &m.id, date, subject)?;
        out.push(SheetEntry {
            student_id: m.id,
            name: m.name,
            status: existing.unwrap_or(AttendanceStatus::Present),
            recorded: existing.is_some(),
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReport {
    pub saved: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<SaveFailure>,
    pub notifications_queued: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveFailure {
    pub student_id: String,
    pub message: String,
}

/// Writes one status per class member. Each member commits on its own, so one failure
/// leaves the others saved.
pub fn save_class(
    conn: &Connection,
    members: &[ClassMember],
    date: &str,
    subject: &str,
    statuses: &HashMap<String, AttendanceStatus>,
) -> SaveReport {
    let mut report = SaveReport::default();
    for m in members {
        let Some(status) = statuses.get(&m.id).copied() else {
            tracing::warn!(student_id = %m.id, "no attendance status submitted; skipping");
            report.skipped.push(m.id.clone());
            continue;
        };
        match save_member(conn, m, date, subject, status) {
            Ok(queued) => {
                if queued {
                    report.notifications_queued += 1;
                }
                report.saved.push(m.id.clone());
            }
            Err(e) => {
                tracing::error!(student_id = %m.id, error = %e, "attendance write failed");
                report.failed.push(SaveFailure {
                    student_id: m.id.clone(),
                    message: e.to_string(),
                });
            }
        }
    }
    report
}

fn save_member(
    conn: &Connection,
    member: &ClassMember,
    date: &str,
    subject: &str,
    status: AttendanceStatus,
) -> rusqlite::Result<bool> {
    let tx = conn.unchecked_transaction()?;
    write_record(&tx, &member.id, &AttendanceRecord::new(date, subject, status))?;

    let mut queued = false;
    if status == AttendanceStatus::Unjustified {
        match member.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            Some(email) => {
                notify::enqueue(
                    &tx,
                    &AbsenceNotice {
                        student_id: member.id.clone(),
                        student_name: member.name.clone(),
                        student_email: email.to_string(),
                        date: date.to_string(),
                        subject: subject.to_string(),
                        kind: notify::ABSENCE_UNJUSTIFIED.to_string(),
                    },
                    db::now_millis(),
                )?;
                queued = true;
            }
            None => {
                tracing::info!(student_id = %member.id, "student has no email; no notification");
            }
        }
    }
    tx.commit()?;
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_student(conn: &Connection, id: &str, name: &str, class_id: &str, email: Option<&str>) {
        conn.execute(
            "INSERT INTO students(id, name, class_id, email, created_at, updated_at)
             VALUES(?, ?, ?, ?, 'now', 'now')",
            (id, name, class_id, email),
        )
        .expect("insert student");
    }

    #[test]
    fn status_parse_and_legacy_mapping() {
        assert_eq!(
            AttendanceStatus::parse("Certificate"),
            Some(AttendanceStatus::Certificate)
        );
        assert_eq!(AttendanceStatus::parse("late"), None);
        assert_eq!(
            AttendanceStatus::from_legacy(None, true),
            AttendanceStatus::Present
        );
        assert_eq!(
            AttendanceStatus::from_legacy(None, false),
            AttendanceStatus::Unjustified
        );
        assert_eq!(
            AttendanceStatus::from_legacy(Some("justified"), false),
            AttendanceStatus::Justified
        );
    }

    #[test]
    fn iso_date_validation() {
        assert!(is_iso_date("2024-02-29"));
        assert!(!is_iso_date("2023-02-29"));
        assert!(!is_iso_date("01/03/2024"));
        assert!(!is_iso_date("2024-3-1"));
    }

    #[test]
    fn save_class_replaces_and_queues_only_for_students_with_email() {
        let conn = db::open_in_memory();
        insert_student(&conn, "s1", "Ana", "c1", Some("ana@example.com"));
        insert_student(&conn, "s2", "Bruno", "c1", None);
        insert_student(&conn, "s3", "Carla", "c1", Some("carla@example.com"));
        let members = class_members(&conn, "c1").expect("members");

        let mut statuses = HashMap::new();
        statuses.insert("s1".to_string(), AttendanceStatus::Present);
        statuses.insert("s2".to_string(), AttendanceStatus::Unjustified);
        let first = save_class(&conn, &members, "2024-03-01", "Math", &statuses);
        assert_eq!(first.saved.len(), 2);
        assert_eq!(first.skipped, vec!["s3".to_string()]);
        assert_eq!(first.notifications_queued, 0);

        statuses.insert("s1".to_string(), AttendanceStatus::Unjustified);
        let second = save_class(&conn, &members, "2024-03-01", "Math", &statuses);
        assert_eq!(second.notifications_queued, 1);

        let ana = list_records(&conn, "s1").expect("records");
        assert_eq!(ana.len(), 1);
        assert_eq!(ana[0].status, AttendanceStatus::Unjustified);

        let queued: i64 = conn
            .query_row("SELECT COUNT(*) FROM notification_outbox", [], |r| r.get(0))
            .expect("count outbox");
        assert_eq!(queued, 1);
    }

    #[test]
    fn open_sheet_defaults_to_present() {
        let conn = db::open_in_memory();
        insert_student(&conn, "s1", "Ana", "c1", None);
        insert_student(&conn, "s2", "Bruno", "c1", None);
        write_record(
            &conn,
            "s2",
            &AttendanceRecord::new("2024-03-01", GENERAL_SUBJECT, AttendanceStatus::Certificate),
        )
        .expect("write");

        let sheet = open_sheet(&conn, "c1", "2024-03-01", GENERAL_SUBJECT).expect("sheet");
        assert_eq!(sheet.len(), 2);
        assert_eq!(sheet[0].status, AttendanceStatus::Present);
        assert!(!sheet[0].recorded);
        assert_eq!(sheet[1].status, AttendanceStatus::Certificate);
        assert!(sheet[1].recorded);
    }
}
