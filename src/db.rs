use crate::error::{EngineError, EngineResult};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path, busy_timeout: Duration) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_years(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            label TEXT NOT NULL UNIQUE,
            start_date TEXT,
            end_date TEXT
        )",
        [],
    )?;

    // school_year_id stays nullable: a trimester that lost its year must
    // surface as not_found during averaging instead of being unreadable.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS trimesters(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            school_year_id INTEGER,
            name TEXT NOT NULL,
            number INTEGER NOT NULL,
            FOREIGN KEY(school_year_id) REFERENCES school_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trimesters_year ON trimesters(school_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            school_year_id INTEGER,
            FOREIGN KEY(school_year_id) REFERENCES school_years(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            coefficient REAL NOT NULL CHECK(coefficient > 0)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            class_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            PRIMARY KEY(class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            class_id INTEGER,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            trimester_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            value REAL NOT NULL CHECK(value >= 0 AND value <= 20),
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(trimester_id) REFERENCES trimesters(id)
        )",
        [],
    )?;
    ensure_grades_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student_trimester ON grades(student_id, trimester_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_trimester_subject ON grades(trimester_id, subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS averages(
            student_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            trimester_id INTEGER NOT NULL,
            school_year_id INTEGER NOT NULL,
            value REAL NOT NULL,
            rank INTEGER NOT NULL,
            computed_at TEXT NOT NULL,
            PRIMARY KEY(student_id, subject_id, trimester_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(trimester_id) REFERENCES trimesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_averages_trimester_subject ON averages(trimester_id, subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dirty_marks(
            student_id INTEGER NOT NULL,
            trimester_id INTEGER NOT NULL,
            marked_at TEXT NOT NULL,
            PRIMARY KEY(student_id, trimester_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(trimester_id) REFERENCES trimesters(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_cards(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            trimester_id INTEGER NOT NULL,
            school_year_id INTEGER NOT NULL,
            general_average REAL NOT NULL,
            appreciation TEXT NOT NULL,
            class_rank INTEGER,
            generated_at TEXT NOT NULL,
            UNIQUE(student_id, trimester_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(trimester_id) REFERENCES trimesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_report_cards_trimester ON report_cards(trimester_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_grades_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grades ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

/// Runs `f` inside an IMMEDIATE transaction. The write lock is taken up
/// front so no other writer can slip a row in between our reads and our
/// writes. Any error rolls the transaction back; plain database errors are
/// reported as transaction failures.
pub fn with_transaction<T, F>(conn: &Connection, f: F) -> EngineResult<T>
where
    F: FnOnce(&Transaction<'_>) -> EngineResult<T>,
{
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(EngineError::Transaction)?;
    match f(&tx) {
        Ok(v) => {
            tx.commit().map_err(EngineError::Transaction)?;
            Ok(v)
        }
        Err(e) => {
            let _ = tx.rollback();
            Err(e.into_transaction())
        }
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `?,?,?` for `n` bind values.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
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

    #[test]
    fn open_db_is_reentrant_and_settings_roundtrip() {
        let ws = temp_dir("gradebook-db-open");
        let conn = open_db(&ws, Duration::from_secs(1)).expect("open");
        drop(conn);
        let conn = open_db(&ws, Duration::from_secs(1)).expect("reopen");
        assert!(table_has_column(&conn, "grades", "updated_at").expect("pragma"));

        assert_eq!(settings_get_json(&conn, "missing").expect("get"), None);
        let v = serde_json::json!({ "topStudents": 3 });
        settings_set_json(&conn, "setup.averages", &v).expect("set");
        assert_eq!(
            settings_get_json(&conn, "setup.averages").expect("get"),
            Some(v)
        );
    }

    #[test]
    fn with_transaction_rolls_back_on_error() {
        let ws = temp_dir("gradebook-db-tx");
        let conn = open_db(&ws, Duration::from_secs(1)).expect("open");
        let res: EngineResult<()> = with_transaction(&conn, |tx| {
            tx.execute("INSERT INTO school_years(label) VALUES('2025-2026')", [])?;
            Err(EngineError::invalid("abort"))
        });
        assert!(matches!(res, Err(EngineError::InvalidInput(_))));
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM school_years", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 0);
    }

    #[test]
    fn placeholders_join() {
        assert_eq!(placeholders(3), "?,?,?");
        assert_eq!(placeholders(1), "?");
    }
}
