use crate::grades::{self, GradeFilters, GradeKind, GradePatch, NewGrade};
use crate::ipc::error::err;
use crate::ipc::helpers::{
    db_conn, optional_f64, optional_i64, optional_str, reply, required_f64, required_i64,
    required_str, respond, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn parse_kind(req: &Request, raw: &str) -> Result<GradeKind, serde_json::Value> {
    GradeKind::parse(raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("unknown grade kind: {raw}"),
            Some(json!({ "allowed": ["devoir", "composition", "oral", "projet"] })),
        )
    })
}

fn parse_filters(req: &Request) -> Result<GradeFilters, serde_json::Value> {
    let kind = match optional_str(req, "kind")? {
        Some(raw) => Some(parse_kind(req, &raw)?),
        None => None,
    };
    Ok(GradeFilters {
        subject_id: optional_i64(req, "subjectId")?,
        trimester_id: optional_i64(req, "trimesterId")?,
        kind,
    })
}

fn handle_grades_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let kind = parse_kind(req, &required_str(req, "kind")?)?;
    let new = NewGrade {
        student_id: required_i64(req, "studentId")?,
        subject_id: required_i64(req, "subjectId")?,
        trimester_id: required_i64(req, "trimesterId")?,
        kind,
        value: required_f64(req, "value")?,
    };
    reply(req, grades::create_grade(conn, &new))
}

fn handle_grades_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let grade_id = required_i64(req, "gradeId")?;
    let kind = match optional_str(req, "kind")? {
        Some(raw) => Some(parse_kind(req, &raw)?),
        None => None,
    };
    let patch = GradePatch {
        kind,
        value: optional_f64(req, "value")?,
    };
    reply(req, grades::update_grade(conn, grade_id, &patch))
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let grade_id = required_i64(req, "gradeId")?;
    reply(req, grades::delete_grade(conn, grade_id).map(|g| json!({ "deleted": g })))
}

fn handle_grades_list_by_student(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_i64(req, "studentId")?;
    let filters = parse_filters(req)?;
    reply(
        req,
        grades::grades_for_student(conn, student_id, &filters).map(|g| json!({ "grades": g })),
    )
}

fn handle_grades_list_by_class(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let class_id = required_i64(req, "classId")?;
    let filters = parse_filters(req)?;
    reply(
        req,
        grades::grades_for_class(conn, class_id, &filters).map(|g| json!({ "grades": g })),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.create" => handle_grades_create(state, req),
        "grades.update" => handle_grades_update(state, req),
        "grades.delete" => handle_grades_delete(state, req),
        "grades.listByStudent" => handle_grades_list_by_student(state, req),
        "grades.listByClass" => handle_grades_list_by_class(state, req),
        _ => return None,
    };
    Some(respond(result))
}
