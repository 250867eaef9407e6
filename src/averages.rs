//! Averaging engine: weighted subject averages and class ranks per
//! (class, trimester), kept in step with grades by full or incremental
//! recomputation.
//!
//! Subject ranks are positional: students are stably sorted by average
//! (descending, roster order among equals) and the rank is the 1-based
//! position, so two students tied at 15.00 get consecutive ranks. Persisted
//! report-card ranks depend on this, keep it.

use crate::calc;
use crate::config::AveragesSettings;
use crate::db;
use crate::dirty;
use crate::error::{EngineError, EngineResult};
use crate::school::{self, ResolvedTrimester};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use uuid::Uuid;

/// Which students of the class get fresh values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudentScope {
    All,
    Only(Vec<i64>),
}

impl StudentScope {
    fn contains(&self, student_id: i64, only: &HashSet<i64>) -> bool {
        match self {
            StudentScope::All => true,
            StudentScope::Only(_) => only.contains(&student_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AverageRow {
    pub student_id: i64,
    pub subject_id: i64,
    pub trimester_id: i64,
    pub school_year_id: i64,
    pub value: f64,
    pub rank: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// Delete every average of the class roster for the trimester, then insert.
    Scope,
    /// Insert or overwrite the given rows only.
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    pub run_id: String,
    pub count: usize,
    pub duration_ms: u64,
    pub affected_subjects: usize,
    pub strategy: Strategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_students: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum RecomputeOutcome {
    Completed(RecomputeSummary),
    /// Incremental run with no dirty students in the class.
    NothingPending,
}

impl RecomputeOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RecomputeOutcome::Completed(s) => json!(s),
            RecomputeOutcome::NothingPending => json!({
                "success": true,
                "message": "no dirty students",
                "data": [],
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubjectWeight {
    pub subject_id: i64,
    pub coefficient: f64,
}

/// Everything one ranking pass needs, already read from the store.
#[derive(Debug, Clone, Default)]
pub struct ClassGradeData {
    pub roster: Vec<i64>,
    pub subjects: Vec<SubjectWeight>,
    /// Grade values per (student, subject).
    pub grades: HashMap<(i64, i64), Vec<f64>>,
    /// Stored averages per (student, subject); consulted for students
    /// outside the scope so they still occupy their place in the ranking.
    pub stored: HashMap<(i64, i64), f64>,
}

/// Weighted subject average; `None` when the student has no grade.
pub fn subject_average(grades: &[f64], coefficient: f64) -> Option<f64> {
    calc::weighted_average(grades.iter().map(|v| (*v, coefficient))).map(calc::round_half_up_2)
}

/// Pure ranking pass over loaded data. Rows come out per subject (in the
/// given subject order) and, within a subject, in rank order. Only in-scope
/// students produce rows.
pub fn rank_subject_averages(
    data: &ClassGradeData,
    trimester: ResolvedTrimester,
    scope: &StudentScope,
    include_empty: bool,
) -> Vec<AverageRow> {
    let only: HashSet<i64> = match scope {
        StudentScope::All => HashSet::new(),
        StudentScope::Only(ids) => ids.iter().copied().collect(),
    };

    let mut out = Vec::new();
    for subject in &data.subjects {
        // (student_id, in_scope) keyed entries in roster order.
        let mut entries: Vec<((i64, bool), f64)> = Vec::with_capacity(data.roster.len());
        for &student_id in &data.roster {
            let key = (student_id, subject.subject_id);
            if scope.contains(student_id, &only) {
                let grades = data.grades.get(&key).map(Vec::as_slice).unwrap_or(&[]);
                let value = match subject_average(grades, subject.coefficient) {
                    Some(v) => v,
                    None if include_empty => 0.0,
                    None => continue,
                };
                entries.push(((student_id, true), value));
            } else if let Some(v) = data.stored.get(&key) {
                entries.push(((student_id, false), *v));
            }
        }

        for ((student_id, in_scope), value, rank) in calc::positional_ranks(&entries) {
            if !in_scope {
                continue;
            }
            out.push(AverageRow {
                student_id,
                subject_id: subject.subject_id,
                trimester_id: trimester.id,
                school_year_id: trimester.school_year_id,
                value,
                rank,
            });
        }
    }
    out
}

fn load_class_data(
    conn: &Connection,
    class_id: i64,
    trimester_id: i64,
    scope: &StudentScope,
) -> EngineResult<ClassGradeData> {
    let roster = school::class_roster(conn, class_id)?;
    let subjects: Vec<SubjectWeight> = school::class_subjects(conn, class_id)?
        .into_iter()
        .map(|s| SubjectWeight {
            subject_id: s.id,
            coefficient: s.coefficient,
        })
        .collect();

    let mut data = ClassGradeData {
        roster,
        subjects,
        ..Default::default()
    };
    if data.roster.is_empty() || data.subjects.is_empty() {
        return Ok(data);
    }
    if matches!(scope, StudentScope::Only(ids) if ids.is_empty()) {
        return Ok(data);
    }

    let (sql, bind_values) = match scope {
        StudentScope::All => (
            "SELECT g.student_id, g.subject_id, g.value
             FROM grades g
             JOIN students s ON s.id = g.student_id
             WHERE s.class_id = ? AND g.trimester_id = ?
             ORDER BY g.id"
                .to_string(),
            vec![Value::Integer(class_id), Value::Integer(trimester_id)],
        ),
        StudentScope::Only(ids) => {
            let mut bind_values = Vec::with_capacity(ids.len() + 2);
            bind_values.push(Value::Integer(class_id));
            bind_values.push(Value::Integer(trimester_id));
            bind_values.extend(ids.iter().map(|id| Value::Integer(*id)));
            (
                format!(
                    "SELECT g.student_id, g.subject_id, g.value
                     FROM grades g
                     JOIN students s ON s.id = g.student_id
                     WHERE s.class_id = ? AND g.trimester_id = ? AND g.student_id IN ({})
                     ORDER BY g.id",
                    db::placeholders(ids.len())
                ),
                bind_values,
            )
        }
    };

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(bind_values), |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, f64>(2)?))
    })?;
    for row in rows {
        let (student_id, subject_id, value) = row?;
        data.grades
            .entry((student_id, subject_id))
            .or_default()
            .push(value);
    }

    if matches!(scope, StudentScope::Only(_)) {
        data.stored = stored_class_values(conn, class_id, trimester_id)?;
    }
    Ok(data)
}

fn stored_class_values(
    conn: &Connection,
    class_id: i64,
    trimester_id: i64,
) -> EngineResult<HashMap<(i64, i64), f64>> {
    let mut stmt = conn.prepare(
        "SELECT a.student_id, a.subject_id, a.value
         FROM averages a
         JOIN students s ON s.id = a.student_id
         WHERE s.class_id = ? AND a.trimester_id = ?",
    )?;
    let rows = stmt
        .query_map((class_id, trimester_id), |r| {
            Ok(((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?), r.get::<_, f64>(2)?))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

/// Weighted subject averages and positional ranks for a class and trimester.
///
/// Fails with `NotFound` when the trimester (or its school year) cannot be
/// resolved. An empty roster or a class without subjects yields no rows.
pub fn compute_class_subject_averages(
    conn: &Connection,
    class_id: i64,
    trimester_id: i64,
    scope: &StudentScope,
    include_empty: bool,
) -> EngineResult<Vec<AverageRow>> {
    let trimester = school::resolve_trimester(conn, trimester_id)?;
    let data = load_class_data(conn, class_id, trimester_id, scope)?;
    Ok(rank_subject_averages(&data, trimester, scope, include_empty))
}

pub fn replace_averages(
    conn: &Connection,
    class_id: i64,
    trimester_id: i64,
    rows: &[AverageRow],
    mode: ReplaceMode,
) -> EngineResult<usize> {
    if mode == ReplaceMode::Scope {
        let removed = conn.execute(
            "DELETE FROM averages
             WHERE trimester_id = ?
               AND student_id IN (SELECT id FROM students WHERE class_id = ?)",
            (trimester_id, class_id),
        )?;
        tracing::debug!(class_id, trimester_id, removed, "cleared averages scope");
    }

    let computed_at = db::now_rfc3339();
    let mut stmt = conn.prepare(
        "INSERT INTO averages(student_id, subject_id, trimester_id, school_year_id, value, rank, computed_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, trimester_id) DO UPDATE SET
           school_year_id = excluded.school_year_id,
           value = excluded.value,
           rank = excluded.rank,
           computed_at = excluded.computed_at",
    )?;
    for row in rows {
        stmt.execute((
            row.student_id,
            row.subject_id,
            row.trimester_id,
            row.school_year_id,
            row.value,
            row.rank,
            &computed_at,
        ))?;
    }
    Ok(rows.len())
}

fn clear_student_averages(
    conn: &Connection,
    student_ids: &[i64],
    trimester_id: i64,
) -> EngineResult<usize> {
    if student_ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM averages WHERE trimester_id = ? AND student_id IN ({})",
        db::placeholders(student_ids.len())
    );
    let bind_values = std::iter::once(Value::Integer(trimester_id))
        .chain(student_ids.iter().map(|id| Value::Integer(*id)));
    Ok(conn.execute(&sql, params_from_iter(bind_values))?)
}

fn summarize(
    run_id: Uuid,
    rows: &[AverageRow],
    started: Instant,
    strategy: Strategy,
    updated_students: Option<usize>,
) -> RecomputeSummary {
    let duration_ms = started.elapsed().as_millis() as u64;
    let affected_subjects = rows
        .iter()
        .map(|r| r.subject_id)
        .collect::<HashSet<_>>()
        .len();
    RecomputeSummary {
        run_id: run_id.to_string(),
        count: rows.len(),
        duration_ms,
        affected_subjects,
        strategy,
        updated_students,
        message: format!("{} averages recomputed in {}ms", rows.len(), duration_ms),
    }
}

/// Recompute every average of the class for the trimester, replacing the
/// whole (class, trimester) scope in one transaction.
pub fn recompute_full(
    conn: &Connection,
    class_id: i64,
    trimester_id: i64,
    settings: &AveragesSettings,
) -> EngineResult<RecomputeSummary> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "recompute",
        class_id,
        trimester_id,
        strategy = "full",
        run_id = %run_id
    );
    let _guard = span.enter();
    let started = Instant::now();

    let result = db::with_transaction(conn, |tx| {
        school::ensure_class(tx, class_id)?;
        let rows = compute_class_subject_averages(
            tx,
            class_id,
            trimester_id,
            &StudentScope::All,
            settings.include_empty_on_full,
        )?;
        replace_averages(tx, class_id, trimester_id, &rows, ReplaceMode::Scope)?;
        Ok(rows)
    });

    match result {
        Ok(rows) => {
            let summary = summarize(run_id, &rows, started, Strategy::Full, None);
            tracing::info!(
                count = summary.count,
                affected_subjects = summary.affected_subjects,
                duration_ms = summary.duration_ms,
                "full recompute committed"
            );
            Ok(summary)
        }
        Err(e) => {
            tracing::warn!(error = %e, "full recompute rolled back");
            Err(e)
        }
    }
}

/// Recompute only the class's students with pending dirty marks for the
/// trimester, then clear exactly those marks. Marks survive any failure.
///
/// Empty subjects follow `include_empty_on_full` exactly as a full run does,
/// so both strategies store the same rows for a recomputed student.
pub fn recompute_incremental(
    conn: &Connection,
    class_id: i64,
    trimester_id: i64,
    settings: &AveragesSettings,
) -> EngineResult<RecomputeOutcome> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "recompute",
        class_id,
        trimester_id,
        strategy = "incremental",
        run_id = %run_id
    );
    let _guard = span.enter();
    let started = Instant::now();

    let result = db::with_transaction(conn, |tx| {
        school::ensure_class(tx, class_id)?;
        school::resolve_trimester(tx, trimester_id)?;
        let dirty_ids = dirty::pending_for_class(tx, class_id, trimester_id)?;
        if dirty_ids.is_empty() {
            return Ok(None);
        }

        let rows = compute_class_subject_averages(
            tx,
            class_id,
            trimester_id,
            &StudentScope::Only(dirty_ids.clone()),
            settings.include_empty_on_full,
        )?;
        // A dirty student may have lost every grade of a subject.
        clear_student_averages(tx, &dirty_ids, trimester_id)?;
        replace_averages(tx, class_id, trimester_id, &rows, ReplaceMode::Upsert)?;
        dirty::clear(tx, &dirty_ids, trimester_id)?;
        Ok(Some((rows, dirty_ids.len())))
    });

    match result {
        Ok(None) => {
            tracing::info!("no dirty students; nothing to recompute");
            Ok(RecomputeOutcome::NothingPending)
        }
        Ok(Some((rows, students))) => {
            let summary = summarize(run_id, &rows, started, Strategy::Incremental, Some(students));
            tracing::info!(
                count = summary.count,
                updated_students = students,
                affected_subjects = summary.affected_subjects,
                duration_ms = summary.duration_ms,
                "incremental recompute committed"
            );
            Ok(RecomputeOutcome::Completed(summary))
        }
        Err(e) => {
            tracing::warn!(error = %e, "incremental recompute rolled back; dirty marks kept");
            Err(e)
        }
    }
}

/// One-off recompute of a single (student, subject, trimester) average.
///
/// The rank is re-derived against the stored averages of the student's
/// classmates for that subject and trimester. With no grades left the stale
/// row is removed and `None` is returned.
pub fn create_or_update_single_average(
    conn: &Connection,
    student_id: i64,
    subject_id: i64,
    trimester_id: i64,
) -> EngineResult<Option<AverageRow>> {
    db::with_transaction(conn, |tx| {
        let student = school::get_student(tx, student_id)?;
        let subject = school::get_subject(tx, subject_id)?;
        let trimester = school::resolve_trimester(tx, trimester_id)?;

        let mut stmt = tx.prepare(
            "SELECT value FROM grades
             WHERE student_id = ? AND subject_id = ? AND trimester_id = ?
             ORDER BY id",
        )?;
        let grades = stmt
            .query_map((student_id, subject_id, trimester_id), |r| r.get::<_, f64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let Some(value) = subject_average(&grades, subject.coefficient) else {
            tx.execute(
                "DELETE FROM averages WHERE student_id = ? AND subject_id = ? AND trimester_id = ?",
                (student_id, subject_id, trimester_id),
            )?;
            return Ok(None);
        };

        let mut data = ClassGradeData {
            roster: match student.class_id {
                Some(class_id) => school::class_roster(tx, class_id)?,
                None => vec![student_id],
            },
            subjects: vec![SubjectWeight {
                subject_id,
                coefficient: subject.coefficient,
            }],
            ..Default::default()
        };
        if let Some(class_id) = student.class_id {
            data.stored = stored_class_values(tx, class_id, trimester_id)?;
        }
        data.grades.insert((student_id, subject_id), grades);

        let rows = rank_subject_averages(
            &data,
            trimester,
            &StudentScope::Only(vec![student_id]),
            false,
        );
        let Some(row) = rows.into_iter().next() else {
            return Err(EngineError::not_found("average", student_id));
        };
        debug_assert_eq!(row.value, value);

        let class_id = student.class_id.unwrap_or_default();
        replace_averages(
            tx,
            class_id,
            trimester_id,
            std::slice::from_ref(&row),
            ReplaceMode::Upsert,
        )?;
        Ok(Some(row))
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AverageFilters {
    pub subject_id: Option<i64>,
    pub trimester_id: Option<i64>,
    pub school_year_id: Option<i64>,
}

/// Stored average joined with the names a report or listing shows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AverageRecord {
    pub student_id: i64,
    pub student_name: String,
    pub subject_id: i64,
    pub subject_name: String,
    pub coefficient: f64,
    pub trimester_id: i64,
    pub school_year_id: i64,
    pub value: f64,
    pub rank: u32,
    pub computed_at: String,
}

const RECORD_SELECT: &str = "SELECT a.student_id, st.first_name || ' ' || st.last_name,
            a.subject_id, sj.name, sj.coefficient,
            a.trimester_id, a.school_year_id, a.value, a.rank, a.computed_at
     FROM averages a
     JOIN students st ON st.id = a.student_id
     JOIN subjects sj ON sj.id = a.subject_id";

fn record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<AverageRecord> {
    Ok(AverageRecord {
        student_id: r.get(0)?,
        student_name: r.get(1)?,
        subject_id: r.get(2)?,
        subject_name: r.get(3)?,
        coefficient: r.get(4)?,
        trimester_id: r.get(5)?,
        school_year_id: r.get(6)?,
        value: r.get(7)?,
        rank: r.get(8)?,
        computed_at: r.get(9)?,
    })
}

pub fn averages_for_student(
    conn: &Connection,
    student_id: i64,
    filters: &AverageFilters,
) -> EngineResult<Vec<AverageRecord>> {
    school::get_student(conn, student_id)?;
    let sql = format!(
        "{RECORD_SELECT}
         WHERE a.student_id = ?1
           AND (?2 IS NULL OR a.subject_id = ?2)
           AND (?3 IS NULL OR a.trimester_id = ?3)
           AND (?4 IS NULL OR a.school_year_id = ?4)
         ORDER BY sj.name, a.trimester_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (
                student_id,
                filters.subject_id,
                filters.trimester_id,
                filters.school_year_id,
            ),
            record_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn averages_for_class(
    conn: &Connection,
    class_id: i64,
    filters: &AverageFilters,
) -> EngineResult<Vec<AverageRecord>> {
    school::ensure_class(conn, class_id)?;
    let sql = format!(
        "{RECORD_SELECT}
         WHERE st.class_id = ?1
           AND (?2 IS NULL OR a.subject_id = ?2)
           AND (?3 IS NULL OR a.trimester_id = ?3)
           AND (?4 IS NULL OR a.school_year_id = ?4)
         ORDER BY sj.name, a.trimester_id, a.rank"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (
                class_id,
                filters.subject_id,
                filters.trimester_id,
                filters.school_year_id,
            ),
            record_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
