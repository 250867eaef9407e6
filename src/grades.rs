//! Grade store. Every write marks the owning (student, trimester) dirty in
//! the same transaction, as long as the student belongs to a class.

use crate::calc;
use crate::db;
use crate::dirty;
use crate::error::{EngineError, EngineResult};
use crate::school;
use rusqlite::{types::Type, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeKind {
    Devoir,
    Composition,
    Oral,
    Projet,
}

impl GradeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeKind::Devoir => "devoir",
            GradeKind::Composition => "composition",
            GradeKind::Oral => "oral",
            GradeKind::Projet => "projet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "devoir" => Some(GradeKind::Devoir),
            "composition" => Some(GradeKind::Composition),
            "oral" => Some(GradeKind::Oral),
            "projet" => Some(GradeKind::Projet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub id: i64,
    pub student_id: i64,
    pub subject_id: i64,
    pub trimester_id: i64,
    pub kind: GradeKind,
    pub value: f64,
    pub created_at: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct NewGrade {
    pub student_id: i64,
    pub subject_id: i64,
    pub trimester_id: i64,
    pub kind: GradeKind,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GradePatch {
    pub kind: Option<GradeKind>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GradeFilters {
    pub subject_id: Option<i64>,
    pub trimester_id: Option<i64>,
    pub kind: Option<GradeKind>,
}

const GRADE_COLUMNS: &str =
    "g.id, g.student_id, g.subject_id, g.trimester_id, g.kind, g.value, g.created_at, g.updated_at";

fn grade_from_row(r: &Row<'_>) -> rusqlite::Result<Grade> {
    let raw_kind: String = r.get(4)?;
    let Some(kind) = GradeKind::parse(&raw_kind) else {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown grade kind {raw_kind:?}").into(),
        ));
    };
    Ok(Grade {
        id: r.get(0)?,
        student_id: r.get(1)?,
        subject_id: r.get(2)?,
        trimester_id: r.get(3)?,
        kind,
        value: r.get(5)?,
        created_at: r.get(6)?,
        updated_at: r.get(7)?,
    })
}

fn check_value(value: f64) -> EngineResult<()> {
    if !calc::is_valid_grade_value(value) {
        return Err(EngineError::invalid(format!(
            "grade value must be between {} and {}",
            calc::GRADE_MIN,
            calc::GRADE_MAX
        )));
    }
    Ok(())
}

/// Marks drain per class roster, so a student without a class is not marked
/// here; enrolling them marks every trimester they hold grades in.
fn mark_if_enrolled(conn: &Connection, student_id: i64, trimester_id: i64) -> EngineResult<()> {
    if school::get_student(conn, student_id)?.class_id.is_some() {
        dirty::mark(conn, student_id, trimester_id)?;
    }
    Ok(())
}

pub fn get_grade(conn: &Connection, grade_id: i64) -> EngineResult<Grade> {
    let sql = format!("SELECT {GRADE_COLUMNS} FROM grades g WHERE g.id = ?");
    conn.query_row(&sql, [grade_id], grade_from_row)
        .optional()?
        .ok_or_else(|| EngineError::not_found("grade", grade_id))
}

pub fn create_grade(conn: &Connection, new: &NewGrade) -> EngineResult<Grade> {
    check_value(new.value)?;
    db::with_transaction(conn, |tx| {
        let student = school::get_student(tx, new.student_id)?;
        school::get_subject(tx, new.subject_id)?;
        school::resolve_trimester(tx, new.trimester_id)?;
        if let Some(class_id) = student.class_id {
            if !school::subject_taught_in_class(tx, class_id, new.subject_id)? {
                return Err(EngineError::invalid(
                    "subject is not taught in the student's class",
                ));
            }
        }

        tx.execute(
            "INSERT INTO grades(student_id, subject_id, trimester_id, kind, value, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                new.student_id,
                new.subject_id,
                new.trimester_id,
                new.kind.as_str(),
                new.value,
                db::now_rfc3339(),
            ),
        )?;
        let id = tx.last_insert_rowid();
        if student.class_id.is_some() {
            dirty::mark(tx, new.student_id, new.trimester_id)?;
        }
        get_grade(tx, id)
    })
}

pub fn update_grade(conn: &Connection, grade_id: i64, patch: &GradePatch) -> EngineResult<Grade> {
    if patch.kind.is_none() && patch.value.is_none() {
        return Err(EngineError::invalid("at least one field must be provided"));
    }
    if let Some(v) = patch.value {
        check_value(v)?;
    }
    db::with_transaction(conn, |tx| {
        let current = get_grade(tx, grade_id)?;
        let kind = patch.kind.unwrap_or(current.kind);
        let value = patch.value.unwrap_or(current.value);
        tx.execute(
            "UPDATE grades SET kind = ?, value = ?, updated_at = ? WHERE id = ?",
            (kind.as_str(), value, db::now_rfc3339(), grade_id),
        )?;
        mark_if_enrolled(tx, current.student_id, current.trimester_id)?;
        get_grade(tx, grade_id)
    })
}

/// Deleting a grade changes the averages it fed, so it marks dirty too.
pub fn delete_grade(conn: &Connection, grade_id: i64) -> EngineResult<Grade> {
    db::with_transaction(conn, |tx| {
        let current = get_grade(tx, grade_id)?;
        tx.execute("DELETE FROM grades WHERE id = ?", [grade_id])?;
        mark_if_enrolled(tx, current.student_id, current.trimester_id)?;
        Ok(current)
    })
}

pub fn grades_for_student(
    conn: &Connection,
    student_id: i64,
    filters: &GradeFilters,
) -> EngineResult<Vec<Grade>> {
    school::get_student(conn, student_id)?;
    let sql = format!(
        "SELECT {GRADE_COLUMNS}
         FROM grades g
         WHERE g.student_id = ?1
           AND (?2 IS NULL OR g.subject_id = ?2)
           AND (?3 IS NULL OR g.trimester_id = ?3)
           AND (?4 IS NULL OR g.kind = ?4)
         ORDER BY g.created_at DESC, g.id DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (
                student_id,
                filters.subject_id,
                filters.trimester_id,
                filters.kind.map(GradeKind::as_str),
            ),
            grade_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn grades_for_class(
    conn: &Connection,
    class_id: i64,
    filters: &GradeFilters,
) -> EngineResult<Vec<Grade>> {
    school::ensure_class(conn, class_id)?;
    let sql = format!(
        "SELECT {GRADE_COLUMNS}
         FROM grades g
         JOIN students s ON s.id = g.student_id
         WHERE s.class_id = ?1
           AND (?2 IS NULL OR g.subject_id = ?2)
           AND (?3 IS NULL OR g.trimester_id = ?3)
           AND (?4 IS NULL OR g.kind = ?4)
         ORDER BY g.student_id, g.subject_id, g.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (
                class_id,
                filters.subject_id,
                filters.trimester_id,
                filters.kind.map(GradeKind::as_str),
            ),
            grade_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
