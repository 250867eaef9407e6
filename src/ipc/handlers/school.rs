//! School setup: years, trimesters, classes, subjects and students.

use crate::ipc::helpers::{
    db_conn, optional_i64, optional_str, reply, required_f64, required_i64, required_str, respond,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::school;
use serde_json::json;

fn handle_school_years_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let label = required_str(req, "label")?;
    let start_date = optional_str(req, "startDate")?;
    let end_date = optional_str(req, "endDate")?;
    reply(
        req,
        school::create_school_year(conn, &label, start_date.as_deref(), end_date.as_deref()),
    )
}

fn handle_school_years_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    reply(req, school::list_school_years(conn).map(|years| json!({ "schoolYears": years })))
}

fn handle_trimesters_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let school_year_id = required_i64(req, "schoolYearId")?;
    let name = required_str(req, "name")?;
    let number = required_i64(req, "number")?;
    reply(req, school::create_trimester(conn, school_year_id, &name, number))
}

fn handle_trimesters_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let school_year_id = optional_i64(req, "schoolYearId")?;
    reply(
        req,
        school::list_trimesters(conn, school_year_id).map(|t| json!({ "trimesters": t })),
    )
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let name = required_str(req, "name")?;
    let school_year_id = optional_i64(req, "schoolYearId")?;
    reply(req, school::create_class(conn, &name, school_year_id))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    reply(req, school::list_classes(conn).map(|c| json!({ "classes": c })))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let name = required_str(req, "name")?;
    let coefficient = required_f64(req, "coefficient")?;
    reply(req, school::create_subject(conn, &name, coefficient))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let class_id = optional_i64(req, "classId")?;
    let subjects = match class_id {
        Some(class_id) => school::ensure_class(conn, class_id)
            .and_then(|_| school::class_subjects(conn, class_id)),
        None => school::list_subjects(conn),
    };
    reply(req, subjects.map(|s| json!({ "subjects": s })))
}

fn handle_class_subjects_link(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let class_id = required_i64(req, "classId")?;
    let subject_id = required_i64(req, "subjectId")?;
    reply(
        req,
        school::link_class_subject(conn, class_id, subject_id).map(|created| json!({ "linked": created })),
    )
}

fn handle_class_subjects_unlink(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let class_id = required_i64(req, "classId")?;
    let subject_id = required_i64(req, "subjectId")?;
    reply(
        req,
        school::unlink_class_subject(conn, class_id, subject_id)
            .map(|removed| json!({ "unlinked": removed })),
    )
}

fn handle_students_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let class_id = optional_i64(req, "classId")?;
    let last_name = required_str(req, "lastName")?;
    let first_name = required_str(req, "firstName")?;
    reply(req, school::create_student(conn, class_id, &last_name, &first_name))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let class_id = optional_i64(req, "classId")?;
    reply(req, school::list_students(conn, class_id).map(|s| json!({ "students": s })))
}

fn handle_students_assign_class(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_i64(req, "studentId")?;
    let class_id = optional_i64(req, "classId")?;
    reply(req, school::assign_student_class(conn, student_id, class_id))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "schoolYears.create" => handle_school_years_create(state, req),
        "schoolYears.list" => handle_school_years_list(state, req),
        "trimesters.create" => handle_trimesters_create(state, req),
        "trimesters.list" => handle_trimesters_list(state, req),
        "classes.create" => handle_classes_create(state, req),
        "classes.list" => handle_classes_list(state, req),
        "subjects.create" => handle_subjects_create(state, req),
        "subjects.list" => handle_subjects_list(state, req),
        "classSubjects.link" => handle_class_subjects_link(state, req),
        "classSubjects.unlink" => handle_class_subjects_unlink(state, req),
        "students.create" => handle_students_create(state, req),
        "students.list" => handle_students_list(state, req),
        "students.assignClass" => handle_students_assign_class(state, req),
        _ => return None,
    };
    Some(respond(result))
}
