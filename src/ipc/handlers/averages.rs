use crate::averages::{self, AverageFilters, RecomputeOutcome};
use crate::config;
use crate::db;
use crate::dirty;
use crate::ipc::error::{engine_err, ok};
use crate::ipc::helpers::{
    db_conn, optional_bool, optional_i64, reply, required_i64, respond, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn with_metadata(mut result: serde_json::Value, strategy: &str) -> serde_json::Value {
    result["metadata"] = json!({
        "calculatedAt": db::now_rfc3339(),
        "strategy": strategy,
    });
    result
}

fn handle_averages_calculate(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let class_id = required_i64(req, "classId")?;
    let trimester_id = required_i64(req, "trimesterId")?;
    let force = optional_bool(req, "force")?.unwrap_or(false);

    let result = config::load_averages_settings(conn).and_then(|settings| {
        if force {
            averages::recompute_full(conn, class_id, trimester_id, &settings)
                .map(|summary| with_metadata(json!(summary), "full_recalculation"))
        } else {
            averages::recompute_incremental(conn, class_id, trimester_id, &settings).map(
                |outcome: RecomputeOutcome| with_metadata(outcome.to_json(), "incremental_update"),
            )
        }
    });
    match result {
        Ok(v) => Ok(ok(&req.id, v)),
        Err(e) => Err(engine_err(&req.id, &e)),
    }
}

fn handle_averages_upsert_one(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_i64(req, "studentId")?;
    let subject_id = required_i64(req, "subjectId")?;
    let trimester_id = required_i64(req, "trimesterId")?;
    reply(
        req,
        averages::create_or_update_single_average(conn, student_id, subject_id, trimester_id)
            .map(|row| json!({ "average": row })),
    )
}

fn parse_filters(req: &Request) -> Result<AverageFilters, serde_json::Value> {
    Ok(AverageFilters {
        subject_id: optional_i64(req, "subjectId")?,
        trimester_id: optional_i64(req, "trimesterId")?,
        school_year_id: optional_i64(req, "schoolYearId")?,
    })
}

fn handle_averages_by_student(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_i64(req, "studentId")?;
    let filters = parse_filters(req)?;
    reply(
        req,
        averages::averages_for_student(conn, student_id, &filters)
            .map(|rows| json!({ "averages": rows })),
    )
}

fn handle_averages_by_class(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let class_id = required_i64(req, "classId")?;
    let filters = parse_filters(req)?;
    reply(
        req,
        averages::averages_for_class(conn, class_id, &filters)
            .map(|rows| json!({ "averages": rows })),
    )
}

fn handle_averages_dirty(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let trimester_id = required_i64(req, "trimesterId")?;
    reply(req, dirty::pending(conn, trimester_id).map(|marks| json!({ "pending": marks })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "averages.calculate" => handle_averages_calculate(state, req),
        "averages.upsertOne" => handle_averages_upsert_one(state, req),
        "averages.byStudent" => handle_averages_by_student(state, req),
        "averages.byClass" => handle_averages_by_class(state, req),
        "averages.dirty" => handle_averages_dirty(state, req),
        _ => return None,
    };
    Some(respond(result))
}
