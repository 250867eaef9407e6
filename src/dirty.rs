//! Pending-recompute set keyed by (student, trimester).
//!
//! Marks are written in the same transaction as the grade change that causes
//! them and are only cleared by an incremental recompute that covered them
//! and committed. A failed recompute leaves them in place, so work is
//! retried by the next run rather than dropped.

use crate::db;
use crate::error::EngineResult;
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyMark {
    pub student_id: i64,
    pub trimester_id: i64,
    pub marked_at: String,
}

/// Idempotent: a second mark for the same pair collapses into the first.
/// Returns whether a new mark was recorded.
pub fn mark(conn: &Connection, student_id: i64, trimester_id: i64) -> EngineResult<bool> {
    let n = conn.execute(
        "INSERT INTO dirty_marks(student_id, trimester_id, marked_at) VALUES(?, ?, ?)
         ON CONFLICT(student_id, trimester_id) DO NOTHING",
        (student_id, trimester_id, db::now_rfc3339()),
    )?;
    Ok(n > 0)
}

/// Dirty students of one class for one trimester, in roster order.
pub fn pending_for_class(
    conn: &Connection,
    class_id: i64,
    trimester_id: i64,
) -> EngineResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT d.student_id
         FROM dirty_marks d
         JOIN students s ON s.id = d.student_id
         WHERE d.trimester_id = ? AND s.class_id = ?
         ORDER BY d.student_id",
    )?;
    let ids = stmt
        .query_map((trimester_id, class_id), |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(class_id, trimester_id, pending = ids.len(), "read dirty marks");
    Ok(ids)
}

pub fn pending(conn: &Connection, trimester_id: i64) -> EngineResult<Vec<DirtyMark>> {
    let mut stmt = conn.prepare(
        "SELECT student_id, trimester_id, marked_at
         FROM dirty_marks
         WHERE trimester_id = ?
         ORDER BY student_id",
    )?;
    let marks = stmt
        .query_map([trimester_id], |r| {
            Ok(DirtyMark {
                student_id: r.get(0)?,
                trimester_id: r.get(1)?,
                marked_at: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(marks)
}

/// Mark every trimester in which the student holds at least one grade.
pub fn mark_all_graded(conn: &Connection, student_id: i64) -> EngineResult<usize> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO dirty_marks(student_id, trimester_id, marked_at)
         SELECT DISTINCT student_id, trimester_id, ?2 FROM grades WHERE student_id = ?1",
        (student_id, db::now_rfc3339()),
    )?;
    tracing::debug!(student_id, marked = n, "marked graded trimesters");
    Ok(n)
}

/// Drop every pending mark of one student, whatever the trimester.
pub fn clear_student(conn: &Connection, student_id: i64) -> EngineResult<usize> {
    let n = conn.execute("DELETE FROM dirty_marks WHERE student_id = ?", [student_id])?;
    tracing::debug!(student_id, cleared = n, "cleared student dirty marks");
    Ok(n)
}

pub fn clear(conn: &Connection, student_ids: &[i64], trimester_id: i64) -> EngineResult<usize> {
    if student_ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM dirty_marks WHERE trimester_id = ? AND student_id IN ({})",
        db::placeholders(student_ids.len())
    );
    let mut bind_values: Vec<Value> = Vec::with_capacity(student_ids.len() + 1);
    bind_values.push(Value::Integer(trimester_id));
    for id in student_ids {
        bind_values.push(Value::Integer(*id));
    }
    let n = conn.execute(&sql, params_from_iter(bind_values))?;
    tracing::debug!(trimester_id, cleared = n, "cleared dirty marks");
    Ok(n)
}
