use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::fmt::Write as _;

use crate::grades::{self, Grade};

pub const SHEET_DAYS: usize = 31;
pub const SHEET_MIN_ROWS: usize = 25;
pub const BLANK_MONTH: &str = "___________";
pub const BLANK_TEACHER: &str = "_______________________";
pub const NO_GRADES_PLACEHOLDER: &str = "No grades recorded.";
pub const APPROVED: &str = "APPROVED";
pub const FAILED: &str = "FAILED";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetRow {
    pub number: usize,
    pub student_id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegendItem {
    pub mark: &'static str,
    pub meaning: &'static str,
}

/// Blank monthly roll-call template; marks are filled in by hand.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSheet {
    pub school_name: String,
    pub class_name: String,
    pub month: String,
    pub teacher: String,
    pub days: Vec<usize>,
    pub rows: Vec<SheetRow>,
    pub legend: Vec<LegendItem>,
    pub issued_on: String,
}

pub struct SheetInput<'a> {
    pub school_name: &'a str,
    pub class_name: &'a str,
    pub month: Option<&'a str>,
    pub teacher: Option<&'a str>,
    /// (student id, name) in display order.
    pub students: Vec<(String, String)>,
}

fn non_blank(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

pub fn attendance_sheet(input: SheetInput<'_>, today: NaiveDate) -> AttendanceSheet {
    let count = input.students.len();
    let mut rows: Vec<SheetRow> = input
        .students
        .into_iter()
        .enumerate()
        .map(|(i, (id, name))| SheetRow {
            number: i + 1,
            student_id: Some(id),
            name: Some(name),
        })
        .collect();
    for n in count..SHEET_MIN_ROWS {
        rows.push(SheetRow {
            number: n + 1,
            student_id: None,
            name: None,
        });
    }

    AttendanceSheet {
        school_name: input.school_name.to_string(),
        class_name: input.class_name.to_string(),
        month: non_blank(input.month).unwrap_or(BLANK_MONTH).to_string(),
        teacher: non_blank(input.teacher).unwrap_or(BLANK_TEACHER).to_string(),
        days: (1..=SHEET_DAYS).collect(),
        rows,
        legend: vec![
            LegendItem {
                mark: "•",
                meaning: "Present",
            },
            LegendItem {
                mark: "F",
                meaning: "Absent",
            },
        ],
        issued_on: today.format("%Y-%m-%d").to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardRow {
    pub subject: String,
    pub grades: String,
    pub average: String,
    pub status: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub school_name: String,
    pub year: i32,
    pub student_id: String,
    pub student_name: String,
    pub registration: String,
    pub issued_on: String,
    pub rows: Vec<ReportCardRow>,
    pub placeholder: Option<&'static str>,
    pub overall_average: String,
    pub overall_status: &'static str,
    pub signatures: Vec<&'static str>,
}

fn status_label(passing: bool) -> &'static str {
    if passing {
        APPROVED
    } else {
        FAILED
    }
}

/// First eight characters of the id, uppercased.
pub fn registration_number(student_id: &str) -> String {
    let r: String = student_id.chars().take(8).collect::<String>().to_uppercase();
    if r.is_empty() {
        "N/A".to_string()
    } else {
        r
    }
}

pub fn report_card(
    school_name: &str,
    year: Option<i32>,
    student_id: &str,
    student_name: &str,
    ledger: &[Grade],
    today: NaiveDate,
) -> ReportCard {
    let rows: Vec<ReportCardRow> = grades::subject_averages(ledger)
        .into_iter()
        .map(|s| ReportCardRow {
            grades: s
                .values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" | "),
            average: grades::format_average(s.average),
            status: status_label(s.passing),
            subject: s.subject,
        })
        .collect();
    let overall = grades::grades_average(ledger);
    let name = student_name.trim();

    ReportCard {
        school_name: school_name.to_string(),
        year: year.unwrap_or_else(|| today.year()),
        student_id: student_id.to_string(),
        student_name: if name.is_empty() {
            "Unnamed".to_string()
        } else {
            name.to_string()
        },
        registration: registration_number(student_id),
        issued_on: today.format("%Y-%m-%d").to_string(),
        placeholder: rows.is_empty().then_some(NO_GRADES_PLACEHOLDER),
        rows,
        overall_average: grades::format_average(overall),
        overall_status: status_label(grades::is_passing(overall)),
        signatures: vec!["Guardian's signature", "Principal's signature"],
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const PRINT_CSS: &str = "body{font-family:sans-serif;color:#000}\
table{border-collapse:collapse;width:100%}\
th,td{border:1px solid #000;padding:2px 4px}\
.center{text-align:center}.right{text-align:right}\
.signatures{display:flex;justify-content:space-between;margin-top:48px}\
.signatures div{border-top:1px solid #000;width:12em;text-align:center;font-size:small}";

fn document(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{}</title><style>{}</style></head><body>\n{}</body></html>\n",
        escape_html(title),
        PRINT_CSS,
        body
    )
}

pub fn render_attendance_sheet_html(sheet: &AttendanceSheet) -> String {
    let mut b = String::new();
    let _ = writeln!(b, "<h1 class=\"center\">ATTENDANCE SHEET</h1>");
    let _ = writeln!(
        b,
        "<p>Class: {} &nbsp; Month: {} &nbsp; Teacher: {}</p>",
        escape_html(&sheet.class_name),
        escape_html(&sheet.month),
        escape_html(&sheet.teacher)
    );
    b.push_str("<table>\n<thead><tr><th>#</th><th>Student</th>");
    for d in &sheet.days {
        let _ = write!(b, "<th class=\"center\">{}</th>", d);
    }
    b.push_str("</tr></thead>\n<tbody>\n");
    let blank_days = "<td></td>".repeat(sheet.days.len());
    for row in &sheet.rows {
        let name = row
            .name
            .as_deref()
            .map(escape_html)
            .unwrap_or_else(|| "&nbsp;".to_string());
        let _ = writeln!(
            b,
            "<tr><td class=\"center\">{}</td><td>{}</td>{}</tr>",
            row.number, name, blank_days
        );
    }
    b.push_str("</tbody>\n</table>\n<p>Legend:");
    for item in &sheet.legend {
        let _ = write!(b, "<br>{} = {}", escape_html(item.mark), item.meaning);
    }
    let _ = writeln!(b, "</p>\n<p class=\"right\">Issued on: {}</p>", sheet.issued_on);
    document(&format!("{} - {}", sheet.school_name, sheet.class_name), &b)
}

pub fn render_report_card_html(card: &ReportCard) -> String {
    let mut b = String::new();
    let _ = writeln!(
        b,
        "<h1 class=\"center\">{}</h1>\n<h2 class=\"center\">Report Card - {}</h2>",
        escape_html(&card.school_name.to_uppercase()),
        card.year
    );
    let _ = writeln!(
        b,
        "<p>Student: {}<br>Registration: {}</p>\n<p class=\"right\">Issued on: {}</p>",
        escape_html(&card.student_name),
        escape_html(&card.registration),
        card.issued_on
    );
    b.push_str(
        "<table>\n<thead><tr><th>Subject</th><th>Grades</th><th>Average</th><th>Status</th></tr></thead>\n<tbody>\n",
    );
    for row in &card.rows {
        let _ = writeln!(
            b,
            "<tr><td>{}</td><td class=\"center\">{}</td><td class=\"center\"><b>{}</b></td><td class=\"center\">{}</td></tr>",
            escape_html(&row.subject),
            escape_html(&row.grades),
            row.average,
            row.status
        );
    }
    if let Some(placeholder) = card.placeholder {
        let _ = writeln!(b, "<tr><td colspan=\"4\" class=\"center\">{}</td></tr>", placeholder);
    }
    let _ = writeln!(
        b,
        "</tbody>\n<tfoot><tr><td colspan=\"2\" class=\"right\"><b>Overall average:</b></td><td class=\"center\"><b>{}</b></td><td class=\"center\"><b>{}</b></td></tr></tfoot>\n</table>",
        card.overall_average, card.overall_status
    );
    b.push_str("<div class=\"signatures\">");
    for s in &card.signatures {
        let _ = write!(b, "<div>{}</div>", escape_html(s));
    }
    b.push_str("</div>\n");
    document(&format!("{} - {}", card.school_name, card.student_name), &b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 9).expect("date")
    }

    fn grade(subject: &str, value: f64) -> Grade {
        Grade {
            id: format!("{}-{}", subject, value),
            subject: subject.to_string(),
            value,
        }
    }

    #[test]
    fn sheet_pads_to_minimum_rows_with_blank_defaults() {
        let sheet = attendance_sheet(
            SheetInput {
                school_name: "Aurora School",
                class_name: "1A",
                month: None,
                teacher: Some("  "),
                students: vec![
                    ("s1".to_string(), "Ana".to_string()),
                    ("s2".to_string(), "Bia".to_string()),
                ],
            },
            day(),
        );
        assert_eq!(sheet.days.len(), 31);
        assert_eq!(sheet.rows.len(), 25);
        assert_eq!(sheet.rows[1].name.as_deref(), Some("Bia"));
        assert_eq!(sheet.rows[2].number, 3);
        assert!(sheet.rows[2].name.is_none());
        assert_eq!(sheet.month, BLANK_MONTH);
        assert_eq!(sheet.teacher, BLANK_TEACHER);
        assert_eq!(sheet.issued_on, "2026-03-09");
    }

    #[test]
    fn sheet_keeps_every_student_past_the_minimum() {
        let students = (0..30)
            .map(|i| (format!("s{}", i), format!("Student {}", i)))
            .collect();
        let sheet = attendance_sheet(
            SheetInput {
                school_name: "S",
                class_name: "Big",
                month: Some("March"),
                teacher: None,
                students,
            },
            day(),
        );
        assert_eq!(sheet.rows.len(), 30);
        assert_eq!(sheet.month, "March");
    }

    #[test]
    fn report_card_math_six_and_eight_is_approved() {
        let card = report_card(
            "Aurora School",
            None,
            "abcdef123456",
            "Carla",
            &[grade("Math", 6.0), grade("Math", 8.0)],
            day(),
        );
        assert_eq!(card.registration, "ABCDEF12");
        assert_eq!(card.year, 2026);
        assert_eq!(card.rows.len(), 1);
        assert_eq!(card.rows[0].grades, "6 | 8");
        assert_eq!(card.rows[0].average, "7.00");
        assert_eq!(card.rows[0].status, APPROVED);
        assert_eq!(card.overall_average, "7.00");
        assert_eq!(card.overall_status, APPROVED);
        assert!(card.placeholder.is_none());
    }

    #[test]
    fn report_card_without_grades_uses_placeholder() {
        let card = report_card("S", Some(2025), "x", "", &[], day());
        assert!(card.rows.is_empty());
        assert_eq!(card.placeholder, Some(NO_GRADES_PLACEHOLDER));
        assert_eq!(card.overall_average, "0.00");
        assert_eq!(card.overall_status, FAILED);
        assert_eq!(card.student_name, "Unnamed");

        let html = render_report_card_html(&card);
        assert!(html.contains(NO_GRADES_PLACEHOLDER));
        assert!(html.contains("Guardian&#39;s signature"));
    }

    #[test]
    fn html_escapes_user_text() {
        let sheet = attendance_sheet(
            SheetInput {
                school_name: "S",
                class_name: "<b>1A</b>",
                month: None,
                teacher: None,
                students: vec![("s1".to_string(), "Ana & Bia".to_string())],
            },
            day(),
        );
        let html = render_attendance_sheet_html(&sheet);
        assert!(html.contains("&lt;b&gt;1A&lt;/b&gt;"));
        assert!(html.contains("Ana &amp; Bia"));
        assert!(html.contains("• = Present"));
        assert_eq!(html.matches("<tr><td class=\"center\">").count(), 25);
    }
}
