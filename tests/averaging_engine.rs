use gradebookd::averages::{self, AverageFilters, RecomputeOutcome, StudentScope, Strategy};
use gradebookd::config::{self, AveragesSettings};
use gradebookd::db;
use gradebookd::dirty;
use gradebookd::error::EngineError;
use gradebookd::grades::{self, GradeKind, NewGrade};
use gradebookd::school;
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

struct Fixture {
    conn: Connection,
    trimester: i64,
    class: i64,
    subject: i64,
    students: Vec<i64>,
}

impl Fixture {
    /// One class, one subject with coefficient 2, `n` students in id order.
    fn new(prefix: &str, n: usize) -> Self {
        let conn = db::open_db(&temp_dir(prefix), Duration::from_secs(5)).expect("open db");
        let year = school::create_school_year(&conn, "2025-2026", None, None).expect("year");
        let trimester = school::create_trimester(&conn, year.id, "T1", 1).expect("trimester");
        let class = school::create_class(&conn, "6e A", Some(year.id)).expect("class");
        let subject = school::create_subject(&conn, "Maths", 2.0).expect("subject");
        school::link_class_subject(&conn, class.id, subject.id).expect("link");
        let students = (0..n)
            .map(|i| {
                school::create_student(&conn, Some(class.id), &format!("Last{i}"), "Kid")
                    .expect("student")
                    .id
            })
            .collect();
        Self {
            conn,
            trimester: trimester.id,
            class: class.id,
            subject: subject.id,
            students,
        }
    }

    fn grade(&self, student: i64, value: f64) -> i64 {
        grades::create_grade(
            &self.conn,
            &NewGrade {
                student_id: student,
                subject_id: self.subject,
                trimester_id: self.trimester,
                kind: GradeKind::Devoir,
                value,
            },
        )
        .expect("create grade")
        .id
    }

    /// (student, value, rank) of the stored averages, ordered by student.
    fn stored(&self) -> Vec<(i64, f64, u32)> {
        let mut rows: Vec<_> = averages::averages_for_class(
            &self.conn,
            self.class,
            &AverageFilters {
                trimester_id: Some(self.trimester),
                ..Default::default()
            },
        )
        .expect("list averages")
        .into_iter()
        .map(|r| (r.student_id, r.value, r.rank))
        .collect();
        rows.sort_by_key(|r| r.0);
        rows
    }

    fn incremental(&self) -> Result<RecomputeOutcome, EngineError> {
        averages::recompute_incremental(
            &self.conn,
            self.class,
            self.trimester,
            &config::load_averages_settings(&self.conn).expect("settings"),
        )
    }

    fn full(&self) -> averages::RecomputeSummary {
        averages::recompute_full(
            &self.conn,
            self.class,
            self.trimester,
            &config::load_averages_settings(&self.conn).expect("settings"),
        )
        .expect("full recompute")
    }
}

#[test]
fn full_recompute_matches_worked_example() {
    let fx = Fixture::new("gradebook-example", 2);
    let (a, b) = (fx.students[0], fx.students[1]);
    fx.grade(a, 10.0);
    fx.grade(a, 14.0);
    fx.grade(b, 8.0);

    let summary = fx.full();
    assert_eq!(summary.count, 2);
    assert_eq!(summary.affected_subjects, 1);
    assert_eq!(summary.strategy, Strategy::Full);
    assert!(summary.updated_students.is_none());
    assert_eq!(fx.stored(), vec![(a, 12.0, 1), (b, 8.0, 2)]);

    let record = &averages::averages_for_student(&fx.conn, a, &AverageFilters::default())
        .expect("student averages")[0];
    assert_eq!(record.subject_name, "Maths");
    assert_eq!(record.coefficient, 2.0);
}

#[test]
fn full_recompute_rounds_half_up() {
    let fx = Fixture::new("gradebook-rounding", 1);
    let a = fx.students[0];
    // (12 + 12.5 + 12.535) / 3 = 12.345
    fx.grade(a, 12.0);
    fx.grade(a, 12.5);
    fx.grade(a, 12.535);
    fx.full();
    assert_eq!(fx.stored(), vec![(a, 12.35, 1)]);
}

#[test]
fn include_empty_writes_zero_with_lowest_rank() {
    let fx = Fixture::new("gradebook-include-empty", 3);
    let (a, b, c) = (fx.students[0], fx.students[1], fx.students[2]);
    fx.grade(a, 10.0);
    fx.grade(b, 4.0);

    fx.full();
    assert_eq!(fx.stored(), vec![(a, 10.0, 1), (b, 4.0, 2)]);

    config::update_averages_settings(&fx.conn, &json!({ "includeEmptyOnFull": true }))
        .expect("enable include empty");
    let summary = fx.full();
    assert_eq!(summary.count, 3);
    assert_eq!(fx.stored(), vec![(a, 10.0, 1), (b, 4.0, 2), (c, 0.0, 3)]);
}

#[test]
fn ties_get_distinct_positional_ranks_in_roster_order() {
    let fx = Fixture::new("gradebook-ties", 3);
    let (a, b, c) = (fx.students[0], fx.students[1], fx.students[2]);
    fx.grade(a, 15.0);
    fx.grade(b, 15.0);
    fx.grade(c, 17.0);
    fx.full();
    assert_eq!(fx.stored(), vec![(a, 15.0, 2), (b, 15.0, 3), (c, 17.0, 1)]);
}

#[test]
fn full_recompute_is_idempotent() {
    let fx = Fixture::new("gradebook-idempotent", 4);
    for (i, s) in fx.students.iter().enumerate() {
        fx.grade(*s, 6.0 + i as f64 * 3.5);
        fx.grade(*s, 18.0 - i as f64);
    }
    fx.full();
    let first = fx.stored();
    fx.full();
    assert_eq!(fx.stored(), first);
    assert_eq!(first.len(), 4);
}

#[test]
fn full_recompute_drops_rows_of_students_without_grades() {
    let fx = Fixture::new("gradebook-stale", 2);
    let (a, b) = (fx.students[0], fx.students[1]);
    fx.grade(a, 12.0);
    let gb = fx.grade(b, 9.0);
    fx.full();
    assert_eq!(fx.stored().len(), 2);

    grades::delete_grade(&fx.conn, gb).expect("delete grade");
    fx.full();
    assert_eq!(fx.stored(), vec![(a, 12.0, 1)]);
}

#[test]
fn empty_roster_and_missing_subjects_yield_zero_rows() {
    let fx = Fixture::new("gradebook-empty", 0);
    assert_eq!(fx.full().count, 0);

    let bare = school::create_class(&fx.conn, "no subjects", None).expect("class");
    school::create_student(&fx.conn, Some(bare.id), "Solo", "Kid").expect("student");
    let rows = averages::compute_class_subject_averages(
        &fx.conn,
        bare.id,
        fx.trimester,
        &StudentScope::All,
        true,
    )
    .expect("compute");
    assert!(rows.is_empty());
}

#[test]
fn unresolvable_trimester_is_not_found() {
    let fx = Fixture::new("gradebook-notfound", 1);
    fx.grade(fx.students[0], 11.0);

    let missing = averages::compute_class_subject_averages(
        &fx.conn,
        fx.class,
        9_999,
        &StudentScope::All,
        false,
    );
    assert!(matches!(
        missing,
        Err(EngineError::NotFound { entity: "trimester", id: 9_999 })
    ));

    fx.conn
        .execute(
            "INSERT INTO trimesters(school_year_id, name, number) VALUES(NULL, 'orphan', 1)",
            [],
        )
        .expect("orphan trimester");
    let orphan = fx.conn.last_insert_rowid();
    let err = averages::recompute_full(&fx.conn, fx.class, orphan, &AveragesSettings::default())
        .expect_err("orphan trimester must fail");
    assert_eq!(err.code(), "not_found");
    assert!(matches!(err, EngineError::NotFound { entity: "school year", .. }));
    assert!(fx.stored().is_empty());
}

#[test]
fn missing_class_is_not_found() {
    let fx = Fixture::new("gradebook-noclass", 1);
    let err = averages::recompute_full(&fx.conn, 4_242, fx.trimester, &AveragesSettings::default())
        .expect_err("missing class");
    assert!(matches!(err, EngineError::NotFound { entity: "class", id: 4_242 }));
}

#[test]
fn incremental_agrees_with_full_for_the_changed_student() {
    let fx = Fixture::new("gradebook-incremental", 3);
    let (a, b, c) = (fx.students[0], fx.students[1], fx.students[2]);
    fx.grade(a, 10.0);
    fx.grade(a, 14.0);
    fx.grade(b, 8.0);
    fx.grade(c, 16.0);

    // First incremental pass covers everyone marked by the grade inserts.
    match fx.incremental().expect("first pass") {
        RecomputeOutcome::Completed(s) => {
            assert_eq!(s.updated_students, Some(3));
            assert_eq!(s.strategy, Strategy::Incremental);
        }
        RecomputeOutcome::NothingPending => panic!("expected pending students"),
    }
    let before = fx.stored();
    assert_eq!(before, vec![(a, 12.0, 2), (b, 8.0, 3), (c, 16.0, 1)]);
    assert!(dirty::pending(&fx.conn, fx.trimester).expect("pending").is_empty());

    fx.grade(b, 20.0);
    assert_eq!(
        dirty::pending_for_class(&fx.conn, fx.class, fx.trimester).expect("pending"),
        vec![b]
    );
    match fx.incremental().expect("second pass") {
        RecomputeOutcome::Completed(s) => {
            assert_eq!(s.updated_students, Some(1));
            assert_eq!(s.count, 1);
        }
        RecomputeOutcome::NothingPending => panic!("expected b to be pending"),
    }
    let after = fx.stored();
    // b now sits between c (16) and a (12); a and c rows are not rewritten.
    assert_eq!(after[1], (b, 14.0, 2));
    assert_eq!(after[0], before[0]);
    assert_eq!(after[2], before[2]);

    fx.full();
    let full = fx.stored();
    assert_eq!(full[1], after[1]);
    assert_eq!(full, vec![(a, 12.0, 3), (b, 14.0, 2), (c, 16.0, 1)]);
}

#[test]
fn incremental_with_nothing_pending_reports_no_dirty_students() {
    let fx = Fixture::new("gradebook-nothing", 1);
    let outcome = fx.incremental().expect("run");
    assert!(matches!(outcome, RecomputeOutcome::NothingPending));
    assert_eq!(
        outcome.to_json(),
        json!({ "success": true, "message": "no dirty students", "data": [] })
    );
}

#[test]
fn incremental_removes_average_when_last_grade_deleted() {
    let fx = Fixture::new("gradebook-incremental-delete", 2);
    let (a, b) = (fx.students[0], fx.students[1]);
    fx.grade(a, 13.0);
    let gb = fx.grade(b, 9.0);
    fx.incremental().expect("first pass");
    assert_eq!(fx.stored().len(), 2);

    grades::delete_grade(&fx.conn, gb).expect("delete");
    fx.incremental().expect("second pass");
    assert_eq!(fx.stored(), vec![(a, 13.0, 1)]);
}

#[test]
fn dirty_marks_survive_a_failed_incremental_run() {
    let fx = Fixture::new("gradebook-dirty-failure", 2);
    let (a, b) = (fx.students[0], fx.students[1]);
    fx.grade(a, 11.0);
    fx.grade(b, 7.0);
    assert!(!dirty::mark(&fx.conn, a, fx.trimester).expect("re-mark"));

    fx.conn
        .execute_batch(
            "CREATE TRIGGER fail_averages BEFORE INSERT ON averages
             BEGIN SELECT RAISE(ABORT, 'injected write failure'); END;",
        )
        .expect("install trigger");

    let err = fx.incremental()
        .expect_err("write must fail");
    assert!(matches!(err, EngineError::Transaction(_)));
    assert_eq!(err.code(), "db_tx_failed");

    let still: Vec<i64> = dirty::pending(&fx.conn, fx.trimester)
        .expect("pending")
        .into_iter()
        .map(|m| m.student_id)
        .collect();
    assert_eq!(still, vec![a, b]);
    assert!(fx.stored().is_empty());

    fx.conn
        .execute_batch("DROP TRIGGER fail_averages;")
        .expect("drop trigger");
    fx.incremental().expect("retry");
    assert!(dirty::pending(&fx.conn, fx.trimester).expect("pending").is_empty());
    assert_eq!(fx.stored(), vec![(a, 11.0, 1), (b, 7.0, 2)]);
}

#[test]
fn incremental_leaves_other_classes_marks_alone() {
    let fx = Fixture::new("gradebook-other-class", 1);
    let other = school::create_class(&fx.conn, "6e B", None).expect("class");
    school::link_class_subject(&fx.conn, other.id, fx.subject).expect("link");
    let outsider =
        school::create_student(&fx.conn, Some(other.id), "Else", "Kid").expect("student").id;
    fx.grade(fx.students[0], 12.0);
    fx.grade(outsider, 15.0);

    fx.incremental().expect("run");
    let left: Vec<i64> = dirty::pending(&fx.conn, fx.trimester)
        .expect("pending")
        .into_iter()
        .map(|m| m.student_id)
        .collect();
    assert_eq!(left, vec![outsider]);
}

#[test]
fn single_upsert_ranks_against_stored_peers() {
    let fx = Fixture::new("gradebook-single", 2);
    let (a, b) = (fx.students[0], fx.students[1]);
    fx.grade(a, 10.0);
    fx.grade(a, 14.0);
    let gb = fx.grade(b, 8.0);
    fx.full();

    let g2 = fx.grade(b, 20.0);
    let row = averages::create_or_update_single_average(&fx.conn, b, fx.subject, fx.trimester)
        .expect("upsert")
        .expect("row");
    assert_eq!((row.value, row.rank), (14.0, 1));
    assert_eq!(fx.stored()[1], (b, 14.0, 1));

    grades::delete_grade(&fx.conn, gb).expect("delete");
    grades::delete_grade(&fx.conn, g2).expect("delete");
    let none = averages::create_or_update_single_average(&fx.conn, b, fx.subject, fx.trimester)
        .expect("upsert");
    assert!(none.is_none());
    assert_eq!(fx.stored(), vec![(a, 12.0, 1)]);
}

#[test]
fn single_upsert_reports_missing_references() {
    let fx = Fixture::new("gradebook-single-missing", 1);
    let s = fx.students[0];
    let err = averages::create_or_update_single_average(&fx.conn, 777, fx.subject, fx.trimester)
        .expect_err("missing student");
    assert!(matches!(err, EngineError::NotFound { entity: "student", id: 777 }));
    let err = averages::create_or_update_single_average(&fx.conn, s, 888, fx.trimester)
        .expect_err("missing subject");
    assert!(matches!(err, EngineError::NotFound { entity: "subject", id: 888 }));
}

#[test]
fn grade_writes_validate_and_mark_dirty() {
    let fx = Fixture::new("gradebook-grades", 1);
    let s = fx.students[0];
    let bad = grades::create_grade(
        &fx.conn,
        &NewGrade {
            student_id: s,
            subject_id: fx.subject,
            trimester_id: fx.trimester,
            kind: GradeKind::Oral,
            value: 20.5,
        },
    );
    assert!(matches!(bad, Err(EngineError::InvalidInput(_))));
    assert!(dirty::pending(&fx.conn, fx.trimester).expect("pending").is_empty());

    let id = fx.grade(s, 12.0);
    fx.incremental().expect("clear");
    grades::update_grade(
        &fx.conn,
        id,
        &grades::GradePatch {
            value: Some(18.0),
            ..Default::default()
        },
    )
    .expect("update");
    assert_eq!(
        dirty::pending_for_class(&fx.conn, fx.class, fx.trimester).expect("pending"),
        vec![s]
    );
    fx.incremental().expect("recompute");
    assert_eq!(fx.stored(), vec![(s, 18.0, 1)]);
}

/// (student, subject, value, rank) across every subject, for comparing runs.
fn all_rows(fx: &Fixture) -> Vec<(i64, i64, f64, u32)> {
    let mut rows: Vec<_> = averages::averages_for_class(
        &fx.conn,
        fx.class,
        &AverageFilters {
            trimester_id: Some(fx.trimester),
            ..Default::default()
        },
    )
    .expect("list averages")
    .into_iter()
    .map(|r| (r.student_id, r.subject_id, r.value, r.rank))
    .collect();
    rows.sort_by_key(|r| (r.0, r.1));
    rows
}

#[test]
fn incremental_keeps_empty_subject_placeholders_like_full() {
    let fx = Fixture::new("gradebook-incremental-empty", 2);
    let (a, b) = (fx.students[0], fx.students[1]);
    let french = school::create_subject(&fx.conn, "French", 1.0).expect("french").id;
    school::link_class_subject(&fx.conn, fx.class, french).expect("link french");
    config::update_averages_settings(&fx.conn, &json!({ "includeEmptyOnFull": true }))
        .expect("enable include empty");

    fx.grade(a, 12.0);
    grades::create_grade(
        &fx.conn,
        &NewGrade {
            student_id: b,
            subject_id: french,
            trimester_id: fx.trimester,
            kind: GradeKind::Devoir,
            value: 12.0,
        },
    )
    .expect("french grade");
    fx.grade(b, 12.0);
    fx.full();
    fx.incremental().expect("drain marks");

    // a still has nothing in French; the 0.00 placeholder must survive.
    fx.grade(a, 12.0);
    fx.incremental().expect("incremental");
    let incremental: Vec<_> = all_rows(&fx).into_iter().filter(|r| r.0 == a).collect();
    assert_eq!(incremental, vec![(a, fx.subject, 12.0, 1), (a, french, 0.0, 2)]);

    fx.full();
    let full: Vec<_> = all_rows(&fx).into_iter().filter(|r| r.0 == a).collect();
    assert_eq!(incremental, full);
}

#[test]
fn failed_full_recompute_keeps_previous_averages() {
    let fx = Fixture::new("gradebook-full-failure", 2);
    let (a, b) = (fx.students[0], fx.students[1]);
    fx.grade(a, 15.0);
    fx.grade(b, 9.0);
    fx.full();
    let before = fx.stored();
    assert_eq!(before, vec![(a, 15.0, 1), (b, 9.0, 2)]);

    fx.grade(b, 19.0);
    fx.conn
        .execute_batch(
            "CREATE TRIGGER fail_averages BEFORE INSERT ON averages
             BEGIN SELECT RAISE(ABORT, 'injected write failure'); END;",
        )
        .expect("install trigger");

    let err = averages::recompute_full(&fx.conn, fx.class, fx.trimester, &AveragesSettings::default())
        .expect_err("write must fail");
    assert!(matches!(err, EngineError::Transaction(_)));
    assert_eq!(err.code(), "db_tx_failed");
    assert_eq!(fx.stored(), before);
}

#[test]
fn unknown_stored_grade_kind_is_an_error() {
    let fx = Fixture::new("gradebook-bad-kind", 1);
    let id = fx.grade(fx.students[0], 11.0);
    fx.conn
        .execute("UPDATE grades SET kind = 'exam' WHERE id = ?", [id])
        .expect("corrupt kind");

    let err = grades::get_grade(&fx.conn, id).expect_err("unknown kind");
    assert!(matches!(
        err,
        EngineError::Database(rusqlite::Error::FromSqlConversionFailure(4, _, _))
    ));
    assert_eq!(err.code(), "db_query_failed");
}

#[test]
fn classless_students_are_marked_on_enrolment() {
    let fx = Fixture::new("gradebook-classless", 1);
    let drifter = school::create_student(&fx.conn, None, "Nomad", "Ari").expect("student").id;
    let gid = fx.grade(drifter, 14.0);
    grades::update_grade(
        &fx.conn,
        gid,
        &grades::GradePatch {
            value: Some(16.0),
            ..Default::default()
        },
    )
    .expect("update");
    assert!(dirty::pending(&fx.conn, fx.trimester).expect("pending").is_empty());

    school::assign_student_class(&fx.conn, drifter, Some(fx.class)).expect("enrol");
    assert_eq!(
        dirty::pending_for_class(&fx.conn, fx.class, fx.trimester).expect("pending"),
        vec![drifter]
    );
    fx.incremental().expect("incremental");
    assert!(fx.stored().contains(&(drifter, 16.0, 1)));
    assert!(dirty::pending(&fx.conn, fx.trimester).expect("pending").is_empty());

    // Leaving the class drops marks no roster could drain.
    fx.grade(drifter, 10.0);
    school::assign_student_class(&fx.conn, drifter, None).expect("leave");
    assert!(dirty::pending(&fx.conn, fx.trimester).expect("pending").is_empty());
}
