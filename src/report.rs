//! Student-level results built on stored subject averages: general average
//! and class rank, report-card records, and the trimester overview.

use crate::calc;
use crate::config::AveragesSettings;
use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::grades::GradeKind;
use crate::school;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralAverage {
    pub student_id: i64,
    pub value: f64,
    pub rank: u32,
    pub subject_count: usize,
}

/// Weighted general average of every roster student for the trimester, in
/// rank order. Students with no stored average count as 0.00. Ranking is
/// standard competition ranking on the 2-decimal values.
pub fn class_general_averages(
    conn: &Connection,
    class_id: i64,
    trimester_id: i64,
) -> EngineResult<Vec<GeneralAverage>> {
    school::ensure_class(conn, class_id)?;
    let roster = school::class_roster(conn, class_id)?;

    let mut stmt = conn.prepare(
        "SELECT a.student_id, a.value, sj.coefficient
         FROM averages a
         JOIN students st ON st.id = a.student_id
         JOIN subjects sj ON sj.id = a.subject_id
         WHERE st.class_id = ? AND a.trimester_id = ?",
    )?;
    let mut per_student: HashMap<i64, Vec<(f64, f64)>> = HashMap::new();
    let rows = stmt.query_map((class_id, trimester_id), |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?, r.get::<_, f64>(2)?))
    })?;
    for row in rows {
        let (student_id, value, coefficient) = row?;
        per_student
            .entry(student_id)
            .or_default()
            .push((value, coefficient));
    }

    let entries: Vec<(i64, f64)> = roster
        .iter()
        .map(|id| {
            let subject_values = per_student.get(id).map(Vec::as_slice).unwrap_or(&[]);
            let value = calc::weighted_average(subject_values.iter().copied())
                .map(calc::round_half_up_2)
                .unwrap_or(0.0);
            (*id, value)
        })
        .collect();

    Ok(calc::competition_ranks(&entries)
        .into_iter()
        .map(|(student_id, value, rank)| GeneralAverage {
            student_id,
            value,
            rank,
            subject_count: per_student.get(&student_id).map(Vec::len).unwrap_or(0),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject_id: i64,
    pub subject_name: String,
    pub coefficient: f64,
    pub average: f64,
    pub rank: u32,
    pub devoir1: Option<f64>,
    pub devoir2: Option<f64>,
    pub composition: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub id: i64,
    pub student_id: i64,
    pub student_name: String,
    pub class_id: i64,
    pub trimester_id: i64,
    pub school_year_id: i64,
    pub general_average: f64,
    pub appreciation: String,
    pub class_rank: Option<u32>,
    pub generated_at: String,
    pub subjects: Vec<SubjectLine>,
}

struct CardHeader {
    id: i64,
    school_year_id: i64,
    general_average: f64,
    appreciation: String,
    class_rank: Option<u32>,
    generated_at: String,
}

fn subject_lines(
    conn: &Connection,
    student_id: i64,
    trimester_id: i64,
) -> EngineResult<Vec<SubjectLine>> {
    let mut stmt = conn.prepare(
        "SELECT a.subject_id, sj.name, sj.coefficient, a.value, a.rank
         FROM averages a
         JOIN subjects sj ON sj.id = a.subject_id
         WHERE a.student_id = ? AND a.trimester_id = ?
         ORDER BY sj.name",
    )?;
    let mut lines = stmt
        .query_map((student_id, trimester_id), |r| {
            Ok(SubjectLine {
                subject_id: r.get(0)?,
                subject_name: r.get(1)?,
                coefficient: r.get(2)?,
                average: r.get(3)?,
                rank: r.get(4)?,
                devoir1: None,
                devoir2: None,
                composition: None,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grade_stmt = conn.prepare(
        "SELECT subject_id, kind, value
         FROM grades
         WHERE student_id = ? AND trimester_id = ?
         ORDER BY id",
    )?;
    let mut by_subject: BTreeMap<i64, Vec<(GradeKind, f64)>> = BTreeMap::new();
    let rows = grade_stmt.query_map((student_id, trimester_id), |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
    })?;
    for row in rows {
        let (subject_id, kind, value) = row?;
        if let Some(kind) = GradeKind::parse(&kind) {
            by_subject.entry(subject_id).or_default().push((kind, value));
        }
    }

    for line in &mut lines {
        let Some(grades) = by_subject.get(&line.subject_id) else {
            continue;
        };
        let mut devoirs = grades
            .iter()
            .filter(|(k, _)| *k == GradeKind::Devoir)
            .map(|(_, v)| *v);
        line.devoir1 = devoirs.next();
        line.devoir2 = devoirs.next();
        line.composition = grades
            .iter()
            .find(|(k, _)| *k == GradeKind::Composition)
            .map(|(_, v)| *v);
    }
    Ok(lines)
}

/// General average, appreciation and class rank for one student, computed
/// from the stored subject averages.
fn compute_header(
    conn: &Connection,
    student: &school::Student,
    class_id: i64,
    trimester_id: i64,
    lines: &[SubjectLine],
) -> EngineResult<(f64, Option<u32>)> {
    let general_average = calc::weighted_average(lines.iter().map(|l| (l.average, l.coefficient)))
        .map(calc::round_half_up_2)
        .unwrap_or(0.0);
    let class_rank = class_general_averages(conn, class_id, trimester_id)?
        .into_iter()
        .find(|g| g.student_id == student.id)
        .map(|g| g.rank);
    Ok((general_average, class_rank))
}

fn load_header(
    conn: &Connection,
    student_id: i64,
    trimester_id: i64,
) -> EngineResult<Option<CardHeader>> {
    Ok(conn
        .query_row(
            "SELECT id, school_year_id, general_average, appreciation, class_rank, generated_at
             FROM report_cards
             WHERE student_id = ? AND trimester_id = ?",
            (student_id, trimester_id),
            |r| {
                Ok(CardHeader {
                    id: r.get(0)?,
                    school_year_id: r.get(1)?,
                    general_average: r.get(2)?,
                    appreciation: r.get(3)?,
                    class_rank: r.get(4)?,
                    generated_at: r.get(5)?,
                })
            },
        )
        .optional()?)
}

fn write_card(
    conn: &Connection,
    student_id: i64,
    trimester_id: i64,
    replace: bool,
) -> EngineResult<ReportCard> {
    db::with_transaction(conn, |tx| {
        let student = school::get_student(tx, student_id)?;
        let trimester = school::resolve_trimester(tx, trimester_id)?;
        let Some(class_id) = student.class_id else {
            return Err(EngineError::invalid("student is not assigned to a class"));
        };

        let existing = load_header(tx, student_id, trimester_id)?;
        match (&existing, replace) {
            (Some(_), false) => {
                return Err(EngineError::Conflict(
                    "a report card already exists for this student and trimester".to_string(),
                ))
            }
            (None, true) => return Err(EngineError::not_found("report card", student_id)),
            _ => {}
        }

        let lines = subject_lines(tx, student_id, trimester_id)?;
        let (general_average, class_rank) =
            compute_header(tx, &student, class_id, trimester_id, &lines)?;
        let appreciation = calc::appreciation(general_average);
        let generated_at = db::now_rfc3339();

        tx.execute(
            "INSERT INTO report_cards(student_id, trimester_id, school_year_id, general_average,
                                      appreciation, class_rank, generated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, trimester_id) DO UPDATE SET
               school_year_id = excluded.school_year_id,
               general_average = excluded.general_average,
               appreciation = excluded.appreciation,
               class_rank = excluded.class_rank,
               generated_at = excluded.generated_at",
            (
                student_id,
                trimester_id,
                trimester.school_year_id,
                general_average,
                appreciation,
                class_rank,
                &generated_at,
            ),
        )?;
        let id = match existing {
            Some(h) => h.id,
            None => tx.last_insert_rowid(),
        };
        tracing::info!(
            student_id,
            trimester_id,
            general_average,
            class_rank,
            "report card written"
        );

        Ok(ReportCard {
            id,
            student_name: student.display_name(),
            student_id,
            class_id,
            trimester_id,
            school_year_id: trimester.school_year_id,
            general_average,
            appreciation: appreciation.to_string(),
            class_rank,
            generated_at,
            subjects: lines,
        })
    })
}

/// Create the report card; fails with `Conflict` when one exists already.
pub fn generate_report_card(
    conn: &Connection,
    student_id: i64,
    trimester_id: i64,
) -> EngineResult<ReportCard> {
    write_card(conn, student_id, trimester_id, false)
}

/// Recompute an existing report card from the current averages.
pub fn regenerate_report_card(
    conn: &Connection,
    student_id: i64,
    trimester_id: i64,
) -> EngineResult<ReportCard> {
    write_card(conn, student_id, trimester_id, true)
}

pub fn get_report_card(
    conn: &Connection,
    student_id: i64,
    trimester_id: i64,
) -> EngineResult<ReportCard> {
    let student = school::get_student(conn, student_id)?;
    let Some(header) = load_header(conn, student_id, trimester_id)? else {
        return Err(EngineError::not_found("report card", student_id));
    };
    Ok(ReportCard {
        id: header.id,
        student_name: student.display_name(),
        student_id,
        class_id: student.class_id.unwrap_or_default(),
        trimester_id,
        school_year_id: header.school_year_id,
        general_average: header.general_average,
        appreciation: header.appreciation,
        class_rank: header.class_rank,
        generated_at: header.generated_at,
        subjects: subject_lines(conn, student_id, trimester_id)?,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopStudent {
    pub student_id: i64,
    pub student_name: String,
    pub class_name: Option<String>,
    pub general_average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrugglingClass {
    pub class_id: i64,
    pub class_name: String,
    pub class_average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStatistics {
    pub report_card_count: usize,
    pub global_average: f64,
    pub top_students: Vec<TopStudent>,
    pub struggling_classes: Vec<StrugglingClass>,
}

/// Overview across every report card of a trimester.
pub fn global_statistics(
    conn: &Connection,
    trimester_id: i64,
    school_year_id: Option<i64>,
    settings: &AveragesSettings,
) -> EngineResult<GlobalStatistics> {
    let mut stmt = conn.prepare(
        "SELECT rc.student_id, st.first_name || ' ' || st.last_name, c.id, c.name, rc.general_average
         FROM report_cards rc
         JOIN students st ON st.id = rc.student_id
         LEFT JOIN classes c ON c.id = st.class_id
         WHERE rc.trimester_id = ?1 AND (?2 IS NULL OR rc.school_year_id = ?2)
         ORDER BY rc.general_average DESC, rc.student_id",
    )?;
    let cards = stmt
        .query_map((trimester_id, school_year_id), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<i64>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, f64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if cards.is_empty() {
        return Ok(GlobalStatistics {
            report_card_count: 0,
            global_average: 0.0,
            top_students: Vec::new(),
            struggling_classes: Vec::new(),
        });
    }

    let total: f64 = cards.iter().map(|c| c.4).sum();
    let global_average = calc::round_half_up_2(total / cards.len() as f64);

    let top_students = cards
        .iter()
        .take(settings.top_students)
        .map(|(student_id, name, _, class_name, avg)| TopStudent {
            student_id: *student_id,
            student_name: name.clone(),
            class_name: class_name.clone(),
            general_average: *avg,
        })
        .collect();

    // class_id -> (name, sum, count); BTreeMap keeps the output stable.
    let mut per_class: BTreeMap<i64, (String, f64, usize)> = BTreeMap::new();
    for (_, _, class_id, class_name, avg) in &cards {
        let (Some(class_id), Some(class_name)) = (class_id, class_name) else {
            continue;
        };
        let entry = per_class
            .entry(*class_id)
            .or_insert_with(|| (class_name.clone(), 0.0, 0));
        entry.1 += avg;
        entry.2 += 1;
    }
    let struggling_classes = per_class
        .into_iter()
        .filter_map(|(class_id, (class_name, sum, count))| {
            let class_average = sum / count as f64;
            (class_average < settings.difficulty_threshold).then(|| StrugglingClass {
                class_id,
                class_name,
                class_average: calc::round_half_up_2(class_average),
            })
        })
        .collect();

    Ok(GlobalStatistics {
        report_card_count: cards.len(),
        global_average,
        top_students,
        struggling_classes,
    })
}
