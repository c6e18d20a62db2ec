use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE_NAME: &str = "aurora.sqlite3";

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE_NAME)
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(db_path(workspace))?;
    configure(&conn)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Second handle on an already initialized workspace (used by the notification worker).
pub fn open_existing(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> anyhow::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // The worker thread writes through a second connection.
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    tracing::debug!(journal_mode = %mode, "database configured");
    Ok(())
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS identities(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            token TEXT PRIMARY KEY,
            identity_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(identity_id) REFERENCES identities(id)
        )",
        [],
    )?;

    // Role records. Keyed by identity id but deliberately without a foreign key:
    // deleting a role record never touches the identity.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone TEXT,
            role TEXT NOT NULL,
            subject TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            schedule TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // class_id is a weak reference: no FOREIGN KEY, class deletion leaves it dangling.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class_id TEXT,
            email TEXT,
            phone TEXT,
            guardian_name TEXT,
            birth_date TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            subject TEXT NOT NULL,
            value REAL NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, seq)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id, seq)",
        [],
    )?;

    // One row per (student, date, subject); saves are upserts.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            subject TEXT NOT NULL,
            status TEXT NOT NULL,
            seq INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(student_id, date, subject),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id, seq)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notification_outbox(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            student_email TEXT NOT NULL,
            date TEXT NOT NULL,
            subject TEXT NOT NULL,
            type TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            last_error TEXT,
            claimed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notification_outbox_due ON notification_outbox(claimed, next_attempt_at)",
        [],
    )?;

    // Append-only audit trail.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            date TEXT NOT NULL,
            subject TEXT NOT NULL,
            type TEXT NOT NULL,
            status TEXT NOT NULL,
            detail TEXT,
            attempts INTEGER NOT NULL,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_student ON notifications(student_id)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
pub fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    configure(&conn).expect("configure db");
    init_schema(&conn).expect("init schema");
    conn
}
