use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use serde_json::json;

fn period_params(req: &Request) -> Result<(String, String), serde_json::Value> {
    let period_id = match req.params.get("periodId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return Err(err(&req.id, "bad_params", "missing periodId", None)),
    };
    let actor_id = match req.params.get("actorId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return Err(err(&req.id, "bad_params", "missing actorId", None)),
    };
    Ok((period_id, actor_id))
}

fn handle_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (period_id, actor_id) = match period_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match lifecycle::open_semester(conn, &period_id, &actor_id) {
        Ok(period) => {
            state.rankings.invalidate_year(&period.academic_year_id);
            ok(&req.id, json!({ "period": period }))
        }
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (period_id, actor_id) = match period_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match lifecycle::close_semester(conn, &period_id, &actor_id) {
        Ok(outcome) => {
            state
                .rankings
                .invalidate_year(&outcome.period.academic_year_id);
            ok(&req.id, json!(outcome))
        }
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_reopen(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (period_id, actor_id) = match period_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match lifecycle::reopen_semester(conn, &period_id, &actor_id) {
        Ok(period) => {
            state.rankings.invalidate_year(&period.academic_year_id);
            ok(&req.id, json!({ "period": period }))
        }
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let academic_year_id = req.params.get("academicYearId").and_then(|v| v.as_str());

    let mut stmt = match conn.prepare(
        "SELECT id, academic_year_id, semester, status, opened_at, opened_by, closed_at, closed_by
         FROM semester_periods
         WHERE (? IS NULL OR academic_year_id = ?)
         ORDER BY academic_year_id, semester",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((academic_year_id, academic_year_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "academicYearId": r.get::<_, String>(1)?,
                "semester": r.get::<_, i64>(2)?,
                "status": r.get::<_, String>(3)?,
                "openedAt": r.get::<_, Option<String>>(4)?,
                "openedBy": r.get::<_, Option<String>>(5)?,
                "closedAt": r.get::<_, Option<String>>(6)?,
                "closedBy": r.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(periods) => ok(&req.id, json!({ "periods": periods })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "periods.open" => Some(handle_open(state, req)),
        "periods.close" => Some(handle_close(state, req)),
        "periods.reopen" => Some(handle_reopen(state, req)),
        "periods.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
