use crate::config;
use crate::ipc::helpers::{db_conn, optional_i64, reply, required_i64, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::report;
use serde_json::json;

fn student_and_trimester(req: &Request) -> Result<(i64, i64), serde_json::Value> {
    Ok((required_i64(req, "studentId")?, required_i64(req, "trimesterId")?))
}

fn handle_report_cards_generate(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let (student_id, trimester_id) = student_and_trimester(req)?;
    reply(req, report::generate_report_card(conn, student_id, trimester_id))
}

fn handle_report_cards_regenerate(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let (student_id, trimester_id) = student_and_trimester(req)?;
    reply(req, report::regenerate_report_card(conn, student_id, trimester_id))
}

fn handle_report_cards_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let (student_id, trimester_id) = student_and_trimester(req)?;
    reply(req, report::get_report_card(conn, student_id, trimester_id))
}

fn handle_classes_general_averages(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let class_id = required_i64(req, "classId")?;
    let trimester_id = required_i64(req, "trimesterId")?;
    reply(
        req,
        report::class_general_averages(conn, class_id, trimester_id)
            .map(|rows| json!({ "classId": class_id, "trimesterId": trimester_id, "students": rows })),
    )
}

fn handle_statistics_global(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let trimester_id = required_i64(req, "trimesterId")?;
    let school_year_id = optional_i64(req, "schoolYearId")?;
    reply(
        req,
        config::load_averages_settings(conn).and_then(|settings| {
            report::global_statistics(conn, trimester_id, school_year_id, &settings)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reportCards.generate" => handle_report_cards_generate(state, req),
        "reportCards.regenerate" => handle_report_cards_regenerate(state, req),
        "reportCards.get" => handle_report_cards_get(state, req),
        "classes.generalAverages" => handle_classes_general_averages(state, req),
        "statistics.global" => handle_statistics_global(state, req),
        _ => return None,
    };
    Some(respond(result))
}
