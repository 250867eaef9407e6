//! School setup: years, trimesters, classes, subjects, rosters.
//!
//! Only the shape the averaging engine reads is modelled here; the richer
//! administrative records (teachers, levels, alerts) live elsewhere.

use crate::db;
use crate::dirty;
use crate::error::{EngineError, EngineResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolYear {
    pub id: i64,
    pub label: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trimester {
    pub id: i64,
    pub school_year_id: Option<i64>,
    pub name: String,
    pub number: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: i64,
    pub name: String,
    pub school_year_id: Option<i64>,
    pub student_count: i64,
    pub subject_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: i64,
    pub name: String,
    pub coefficient: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: i64,
    pub class_id: Option<i64>,
    pub last_name: String,
    pub first_name: String,
}

impl Student {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// A trimester whose school-year link has been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTrimester {
    pub id: i64,
    pub school_year_id: i64,
}

pub fn create_school_year(
    conn: &Connection,
    label: &str,
    start_date: Option<&str>,
    end_date: Option<&str>,
) -> EngineResult<SchoolYear> {
    let label = label.trim();
    if label.is_empty() {
        return Err(EngineError::invalid("label must not be empty"));
    }
    let exists: Option<i64> = conn
        .query_row(
            "SELECT id FROM school_years WHERE label = ?",
            [label],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(EngineError::Conflict(format!(
            "school year {label} already exists"
        )));
    }
    conn.execute(
        "INSERT INTO school_years(label, start_date, end_date) VALUES(?, ?, ?)",
        (label, start_date, end_date),
    )?;
    Ok(SchoolYear {
        id: conn.last_insert_rowid(),
        label: label.to_string(),
        start_date: start_date.map(str::to_string),
        end_date: end_date.map(str::to_string),
    })
}

pub fn list_school_years(conn: &Connection) -> EngineResult<Vec<SchoolYear>> {
    let mut stmt = conn.prepare(
        "SELECT id, label, start_date, end_date FROM school_years ORDER BY label",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(SchoolYear {
                id: r.get(0)?,
                label: r.get(1)?,
                start_date: r.get(2)?,
                end_date: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_trimester(
    conn: &Connection,
    school_year_id: i64,
    name: &str,
    number: i64,
) -> EngineResult<Trimester> {
    if !(1..=3).contains(&number) {
        return Err(EngineError::invalid("trimester number must be 1, 2 or 3"));
    }
    ensure_exists(conn, "school_years", "school year", school_year_id)?;
    conn.execute(
        "INSERT INTO trimesters(school_year_id, name, number) VALUES(?, ?, ?)",
        (school_year_id, name.trim(), number),
    )?;
    Ok(Trimester {
        id: conn.last_insert_rowid(),
        school_year_id: Some(school_year_id),
        name: name.trim().to_string(),
        number,
    })
}

pub fn list_trimesters(
    conn: &Connection,
    school_year_id: Option<i64>,
) -> EngineResult<Vec<Trimester>> {
    let mut stmt = conn.prepare(
        "SELECT id, school_year_id, name, number
         FROM trimesters
         WHERE (?1 IS NULL OR school_year_id = ?1)
         ORDER BY school_year_id, number",
    )?;
    let rows = stmt
        .query_map([school_year_id], |r| {
            Ok(Trimester {
                id: r.get(0)?,
                school_year_id: r.get(1)?,
                name: r.get(2)?,
                number: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every trimester must carry a live school-year reference.
pub fn resolve_trimester(conn: &Connection, trimester_id: i64) -> EngineResult<ResolvedTrimester> {
    let row: Option<(Option<i64>, Option<i64>)> = conn
        .query_row(
            "SELECT t.school_year_id, y.id
             FROM trimesters t
             LEFT JOIN school_years y ON y.id = t.school_year_id
             WHERE t.id = ?",
            [trimester_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        None => Err(EngineError::not_found("trimester", trimester_id)),
        Some((_, Some(school_year_id))) => Ok(ResolvedTrimester {
            id: trimester_id,
            school_year_id,
        }),
        // 0 marks a trimester with no school-year link at all.
        Some((link, None)) => Err(EngineError::not_found("school year", link.unwrap_or(0))),
    }
}

pub fn create_class(
    conn: &Connection,
    name: &str,
    school_year_id: Option<i64>,
) -> EngineResult<ClassInfo> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::invalid("name must not be empty"));
    }
    if let Some(y) = school_year_id {
        ensure_exists(conn, "school_years", "school year", y)?;
    }
    conn.execute(
        "INSERT INTO classes(name, school_year_id) VALUES(?, ?)",
        (name, school_year_id),
    )?;
    Ok(ClassInfo {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        school_year_id,
        student_count: 0,
        subject_count: 0,
    })
}

pub fn list_classes(conn: &Connection) -> EngineResult<Vec<ClassInfo>> {
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.school_year_id,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id),
           (SELECT COUNT(*) FROM class_subjects cs WHERE cs.class_id = c.id)
         FROM classes c
         ORDER BY c.name",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(ClassInfo {
                id: r.get(0)?,
                name: r.get(1)?,
                school_year_id: r.get(2)?,
                student_count: r.get(3)?,
                subject_count: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_subject(conn: &Connection, name: &str, coefficient: f64) -> EngineResult<Subject> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::invalid("name must not be empty"));
    }
    if !coefficient.is_finite() || coefficient <= 0.0 {
        return Err(EngineError::invalid("coefficient must be > 0"));
    }
    conn.execute(
        "INSERT INTO subjects(name, coefficient) VALUES(?, ?)",
        (name, coefficient),
    )?;
    Ok(Subject {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        coefficient,
    })
}

pub fn list_subjects(conn: &Connection) -> EngineResult<Vec<Subject>> {
    let mut stmt = conn.prepare("SELECT id, name, coefficient FROM subjects ORDER BY name")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Subject {
                id: r.get(0)?,
                name: r.get(1)?,
                coefficient: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_subject(conn: &Connection, subject_id: i64) -> EngineResult<Subject> {
    conn.query_row(
        "SELECT id, name, coefficient FROM subjects WHERE id = ?",
        [subject_id],
        |r| {
            Ok(Subject {
                id: r.get(0)?,
                name: r.get(1)?,
                coefficient: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found("subject", subject_id))
}

/// Subjects taught in a class, in id order, with their coefficients.
pub fn class_subjects(conn: &Connection, class_id: i64) -> EngineResult<Vec<Subject>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.coefficient
         FROM class_subjects cs
         JOIN subjects s ON s.id = cs.subject_id
         WHERE cs.class_id = ?
         ORDER BY s.id",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(Subject {
                id: r.get(0)?,
                name: r.get(1)?,
                coefficient: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn link_class_subject(conn: &Connection, class_id: i64, subject_id: i64) -> EngineResult<bool> {
    ensure_exists(conn, "classes", "class", class_id)?;
    ensure_exists(conn, "subjects", "subject", subject_id)?;
    let n = conn.execute(
        "INSERT OR IGNORE INTO class_subjects(class_id, subject_id) VALUES(?, ?)",
        (class_id, subject_id),
    )?;
    Ok(n > 0)
}

pub fn unlink_class_subject(
    conn: &Connection,
    class_id: i64,
    subject_id: i64,
) -> EngineResult<bool> {
    let n = conn.execute(
        "DELETE FROM class_subjects WHERE class_id = ? AND subject_id = ?",
        (class_id, subject_id),
    )?;
    Ok(n > 0)
}

pub fn subject_taught_in_class(
    conn: &Connection,
    class_id: i64,
    subject_id: i64,
) -> EngineResult<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM class_subjects WHERE class_id = ? AND subject_id = ?",
            (class_id, subject_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

pub fn create_student(
    conn: &Connection,
    class_id: Option<i64>,
    last_name: &str,
    first_name: &str,
) -> EngineResult<Student> {
    let (last_name, first_name) = (last_name.trim(), first_name.trim());
    if last_name.is_empty() || first_name.is_empty() {
        return Err(EngineError::invalid("lastName and firstName are required"));
    }
    if let Some(c) = class_id {
        ensure_exists(conn, "classes", "class", c)?;
    }
    conn.execute(
        "INSERT INTO students(class_id, last_name, first_name) VALUES(?, ?, ?)",
        (class_id, last_name, first_name),
    )?;
    Ok(Student {
        id: conn.last_insert_rowid(),
        class_id,
        last_name: last_name.to_string(),
        first_name: first_name.to_string(),
    })
}

pub fn assign_student_class(
    conn: &Connection,
    student_id: i64,
    class_id: Option<i64>,
) -> EngineResult<Student> {
    db::with_transaction(conn, |tx| {
        if let Some(c) = class_id {
            ensure_exists(tx, "classes", "class", c)?;
        }
        let n = tx.execute(
            "UPDATE students SET class_id = ? WHERE id = ?",
            (class_id, student_id),
        )?;
        if n == 0 {
            return Err(EngineError::not_found("student", student_id));
        }
        // Dirty marks are drained per class: enrolment queues every graded
        // trimester for the new class, leaving a class drops the pending ones.
        match class_id {
            Some(_) => dirty::mark_all_graded(tx, student_id)?,
            None => dirty::clear_student(tx, student_id)?,
        };
        get_student(tx, student_id)
    })
}

pub fn get_student(conn: &Connection, student_id: i64) -> EngineResult<Student> {
    conn.query_row(
        "SELECT id, class_id, last_name, first_name FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(Student {
                id: r.get(0)?,
                class_id: r.get(1)?,
                last_name: r.get(2)?,
                first_name: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found("student", student_id))
}

pub fn list_students(conn: &Connection, class_id: Option<i64>) -> EngineResult<Vec<Student>> {
    let mut stmt = conn.prepare(
        "SELECT id, class_id, last_name, first_name
         FROM students
         WHERE (?1 IS NULL OR class_id = ?1)
         ORDER BY last_name, first_name, id",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(Student {
                id: r.get(0)?,
                class_id: r.get(1)?,
                last_name: r.get(2)?,
                first_name: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Roster in the order every ranking walks it: student id ascending.
pub fn class_roster(conn: &Connection, class_id: i64) -> EngineResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM students WHERE class_id = ? ORDER BY id")?;
    let ids = stmt
        .query_map([class_id], |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn ensure_class(conn: &Connection, class_id: i64) -> EngineResult<()> {
    ensure_exists(conn, "classes", "class", class_id)
}

fn ensure_exists(conn: &Connection, table: &str, entity: &'static str, id: i64) -> EngineResult<()> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let hit: Option<i64> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    if hit.is_none() {
        return Err(EngineError::not_found(entity, id));
    }
    Ok(())
}
