use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;

use crate::attendance::{self, AttendanceRecord};
use crate::feed::{Feed, SubscriptionId};
use crate::grades::{self, Grade};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    Morning,
    Afternoon,
    Night,
    #[serde(rename = "Full-time")]
    FullTime,
}

impl Schedule {
    pub fn as_str(self) -> &'static str {
        match self {
            Schedule::Morning => "Morning",
            Schedule::Afternoon => "Afternoon",
            Schedule::Night => "Night",
            Schedule::FullTime => "Full-time",
        }
    }

    pub fn parse(s: &str) -> Option<Schedule> {
        match s.trim().to_ascii_lowercase().as_str() {
            "morning" => Some(Schedule::Morning),
            "afternoon" => Some(Schedule::Afternoon),
            "night" => Some(Schedule::Night),
            "full-time" | "fulltime" | "full_time" => Some(Schedule::FullTime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDoc {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDoc {
    pub id: String,
    pub name: String,
    pub class_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub guardian_name: Option<String>,
    pub birth_date: Option<String>,
    pub grades: Vec<Grade>,
    pub attendance: Vec<AttendanceRecord>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterSnapshot {
    pub version: u64,
    pub classes: Vec<ClassDoc>,
    pub students: Vec<StudentDoc>,
}

fn class_from_row(r: &Row<'_>) -> rusqlite::Result<ClassDoc> {
    let schedule: String = r.get(2)?;
    Ok(ClassDoc {
        id: r.get(0)?,
        name: r.get(1)?,
        schedule: Schedule::parse(&schedule).unwrap_or(Schedule::Morning),
        created_at: r.get(3)?,
    })
}

pub fn list_classes(conn: &Connection) -> rusqlite::Result<Vec<ClassDoc>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, schedule, created_at FROM classes ORDER BY name COLLATE NOCASE, created_at",
    )?;
    let rows = stmt
        .query_map([], class_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_class(conn: &Connection, class_id: &str) -> rusqlite::Result<Option<ClassDoc>> {
    conn.query_row(
        "SELECT id, name, schedule, created_at FROM classes WHERE id = ?",
        [class_id],
        class_from_row,
    )
    .optional()
}

const STUDENT_COLUMNS: &str =
    "id, name, class_id, email, phone, guardian_name, birth_date, created_at, updated_at";

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<StudentDoc> {
    Ok(StudentDoc {
        id: r.get(0)?,
        name: r.get(1)?,
        class_id: r.get(2)?,
        email: r.get(3)?,
        phone: r.get(4)?,
        guardian_name: r.get(5)?,
        birth_date: r.get(6)?,
        grades: Vec::new(),
        attendance: Vec::new(),
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

pub fn load_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<StudentDoc>> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    let Some(mut student) = conn
        .query_row(&sql, [student_id], student_from_row)
        .optional()?
    else {
        return Ok(None);
    };
    student.grades = grades::list_grades(conn, student_id)?;
    student.attendance = attendance::list_records(conn, student_id)?;
    Ok(Some(student))
}

/// All students with embedded ledgers; `class_id` narrows to one class.
pub fn list_students(conn: &Connection, class_id: Option<&str>) -> rusqlite::Result<Vec<StudentDoc>> {
    let sql = format!(
        "SELECT {} FROM students
         WHERE (?1 IS NULL OR class_id = ?1)
         ORDER BY name COLLATE NOCASE, created_at",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut students = stmt
        .query_map([class_id], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grades_by: HashMap<String, Vec<Grade>> = HashMap::new();
    let mut gstmt = conn.prepare(
        "SELECT student_id, id, subject, value FROM grades ORDER BY student_id, seq",
    )?;
    let grade_rows = gstmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                Grade {
                    id: r.get(1)?,
                    subject: r.get(2)?,
                    value: r.get(3)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (sid, g) in grade_rows {
        grades_by.entry(sid).or_default().push(g);
    }

    let mut attendance_by: HashMap<String, Vec<AttendanceRecord>> = HashMap::new();
    let mut astmt = conn.prepare(
        "SELECT student_id, date, subject, status FROM attendance ORDER BY student_id, seq",
    )?;
    let attendance_rows = astmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (sid, date, subject, status) in attendance_rows {
        let status = attendance::AttendanceStatus::from_legacy(Some(&status), false);
        attendance_by
            .entry(sid)
            .or_default()
            .push(AttendanceRecord::new(&date, &subject, status));
    }

    for s in &mut students {
        s.grades = grades_by.remove(&s.id).unwrap_or_default();
        s.attendance = attendance_by.remove(&s.id).unwrap_or_default();
    }
    Ok(students)
}

pub fn load_snapshot(conn: &Connection, version: u64) -> rusqlite::Result<RosterSnapshot> {
    Ok(RosterSnapshot {
        version,
        classes: list_classes(conn)?,
        students: list_students(conn, None)?,
    })
}

/// Live mirror of the `classes` and `students` collections.
#[derive(Default)]
pub struct RosterStore {
    current: Option<Rc<RosterSnapshot>>,
    feed: Feed<Rc<RosterSnapshot>>,
}

impl RosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the first load.
    pub fn snapshot(&self) -> Option<Rc<RosterSnapshot>> {
        self.current.clone()
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(SubscriptionId, &Rc<RosterSnapshot>) + 'static,
    {
        let id = self.feed.subscribe(callback);
        if let Some(current) = &self.current {
            self.feed.deliver(id, current);
        }
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.feed.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.len()
    }

    /// Reloads from the store and pushes the new snapshot to every subscriber.
    pub fn refresh(&mut self, conn: &Connection) -> rusqlite::Result<Rc<RosterSnapshot>> {
        let version = self.current.as_ref().map(|s| s.version + 1).unwrap_or(1);
        let snapshot = Rc::new(load_snapshot(conn, version)?);
        self.current = Some(Rc::clone(&snapshot));
        self.feed.publish(&snapshot);
        tracing::debug!(
            version,
            classes = snapshot.classes.len(),
            students = snapshot.students.len(),
            subscribers = self.feed.len(),
            "roster refreshed"
        );
        Ok(snapshot)
    }

    /// Ends every subscription but keeps the current snapshot.
    pub fn close_subscriptions(&mut self) {
        if self.feed.len() > 0 {
            tracing::debug!(subscribers = self.feed.len(), "roster subscriptions closed");
        }
        self.feed.clear();
    }

    /// Drops the mirror and all subscriptions (workspace switch).
    pub fn reset(&mut self) {
        self.current = None;
        self.feed.clear();
    }
}
