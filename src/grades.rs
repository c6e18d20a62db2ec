use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::db;

/// Rounded averages at or above this pass.
pub const PASSING_AVERAGE: f64 = 7.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grade {
    pub id: String,
    pub subject: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject: String,
    pub values: Vec<f64>,
    pub average: f64,
    pub passing: bool,
}

/// Accepts `7.5` and `7,5`. Anything that does not parse to a finite number is `None`.
pub fn parse_grade_value(raw: &str) -> Option<f64> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    let v = t.replace(',', ".").parse::<f64>().ok()?;
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Mean rounded to two decimals; an empty ledger averages 0.
pub fn average<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut n: usize = 0;
    let mut sum = 0.0;
    for v in values {
        n += 1;
        sum += v;
    }
    if n == 0 {
        return 0.0;
    }
    round_2(sum / n as f64)
}

pub fn format_average(avg: f64) -> String {
    format!("{:.2}", avg)
}

pub fn is_passing(avg: f64) -> bool {
    round_2(avg) >= PASSING_AVERAGE
}

pub fn grades_average(grades: &[Grade]) -> f64 {
    average(grades.iter().map(|g| g.value))
}

/// Groups by subject in order of first appearance.
pub fn subject_averages(grades: &[Grade]) -> Vec<SubjectAverage> {
    let mut groups: Vec<(String, Vec<f64>)> = Vec::new();
    for g in grades {
        if g.subject.trim().is_empty() {
            continue;
        }
        match groups.iter_mut().find(|(s, _)| *s == g.subject) {
            Some((_, values)) => values.push(g.value),
            None => groups.push((g.subject.clone(), vec![g.value])),
        }
    }
    groups
        .into_iter()
        .map(|(subject, values)| {
            let avg = average(values.iter().copied());
            SubjectAverage {
                subject,
                values,
                average: avg,
                passing: is_passing(avg),
            }
        })
        .collect()
}

pub fn list_grades(conn: &Connection, student_id: &str) -> rusqlite::Result<Vec<Grade>> {
    let mut stmt = conn.prepare(
        "SELECT id, subject, value FROM grades WHERE student_id = ? ORDER BY seq",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok(Grade {
                id: r.get(0)?,
                subject: r.get(1)?,
                value: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Appends one row; the ledger is never rewritten as a whole.
pub fn append_grade(
    conn: &Connection,
    student_id: &str,
    subject: &str,
    value: f64,
) -> rusqlite::Result<Grade> {
    let tx = conn.unchecked_transaction()?;
    let seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), -1) + 1 FROM grades WHERE student_id = ?",
        [student_id],
        |r| r.get(0),
    )?;
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO grades(id, student_id, seq, subject, value, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, student_id, seq, subject, value, db::now_rfc3339()),
    )?;
    tx.commit()?;
    Ok(Grade {
        id,
        subject: subject.to_string(),
        value,
    })
}

#[derive(Debug, Clone, Copy)]
pub enum GradeRef<'a> {
    Id(&'a str),
    Index(usize),
}

/// Resolves the target against the stored ledger inside one transaction.
pub fn remove_grade(
    conn: &Connection,
    student_id: &str,
    target: GradeRef<'_>,
) -> rusqlite::Result<Option<Grade>> {
    let tx = conn.unchecked_transaction()?;
    let found: Option<Grade> = match target {
        GradeRef::Id(id) => tx
            .query_row(
                "SELECT id, subject, value FROM grades WHERE student_id = ? AND id = ?",
                (student_id, id),
                |r| {
                    Ok(Grade {
                        id: r.get(0)?,
                        subject: r.get(1)?,
                        value: r.get(2)?,
                    })
                },
            )
            .optional()?,
        GradeRef::Index(index) => tx
            .query_row(
                "SELECT id, subject, value FROM grades WHERE student_id = ?
                 ORDER BY seq LIMIT 1 OFFSET ?",
                (student_id, index as i64),
                |r| {
                    Ok(Grade {
                        id: r.get(0)?,
                        subject: r.get(1)?,
                        value: r.get(2)?,
                    })
                },
            )
            .optional()?,
    };
    let Some(grade) = found else {
        return Ok(None);
    };
    tx.execute("DELETE FROM grades WHERE id = ?", [&grade.id])?;
    tx.commit()?;
    Ok(Some(grade))
}
