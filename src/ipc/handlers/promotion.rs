use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::promotion;
use serde_json::json;

fn handle_promote(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let actor_id = match req.params.get("actorId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing actorId", None),
    };

    match promotion::promote_student(conn, &student_id, &academic_year_id, &actor_id) {
        Ok(registration) => {
            // The new registration changes cohort membership in the target
            // year, so cached rankings for it are no longer valid.
            state.rankings.invalidate_scopes(
                &registration.academic_year_id,
                registration.section_id.as_deref(),
                Some(&registration.grade_id),
            );
            ok(&req.id, json!({ "registration": registration }))
        }
        Err(e) => engine_err(&req.id, e),
    }
}

/// Each student promotes in their own transaction: one rejection never rolls
/// back or aborts the others.
fn handle_promote_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_ids) = req.params.get("studentIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing studentIds[]", None);
    };
    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let actor_id = match req.params.get("actorId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing actorId", None),
    };

    let mut promoted: Vec<serde_json::Value> = Vec::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, raw) in student_ids.iter().enumerate() {
        let Some(student_id) = raw.as_str() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": "studentIds entries must be strings",
            }));
            continue;
        };
        match promotion::promote_student(conn, student_id, &academic_year_id, &actor_id) {
            Ok(registration) => {
                state.rankings.invalidate_scopes(
                    &registration.academic_year_id,
                    registration.section_id.as_deref(),
                    Some(&registration.grade_id),
                );
                promoted.push(json!(registration));
            }
            Err(e) => errors.push(json!({
                "index": i,
                "studentId": student_id,
                "code": e.code(),
                "message": e.public_message(),
            })),
        }
    }

    ok(
        &req.id,
        json!({
            "promoted": promoted,
            "errors": errors,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "promotion.promote" => Some(handle_promote(state, req)),
        "promotion.promoteBatch" => Some(handle_promote_batch(state, req)),
        _ => None,
    }
}
