use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_assessments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut required = |key: &str| -> Result<String, serde_json::Value> {
        match req.params.get(key).and_then(|v| v.as_str()) {
            Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
            _ => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
        }
    };
    let subject_id = match required("subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required("gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_type_id = match required("assessmentTypeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year_id = match required("academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required("title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_id = req.params.get("sectionId").and_then(|v| v.as_str());
    let semester = match req.params.get("semester").and_then(|v| v.as_i64()) {
        Some(s @ (1 | 2)) => s,
        _ => return err(&req.id, "bad_params", "semester must be 1 or 2", None),
    };
    let weight = match req.params.get("weight").and_then(|v| v.as_f64()) {
        Some(w) if w > 0.0 && w <= 100.0 => w,
        _ => {
            return err(
                &req.id,
                "validation",
                "weight must be in (0, 100]",
                None,
            )
        }
    };
    let max_score = match req.params.get("maxScore").and_then(|v| v.as_f64()) {
        Some(m) if m > 0.0 => m,
        _ => return err(&req.id, "validation", "maxScore must be > 0", None),
    };

    let assessment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assessments(id, subject_id, grade_id, section_id, assessment_type_id,
            academic_year_id, semester, title, weight, max_score, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'draft')",
        (
            &assessment_id,
            &subject_id,
            &grade_id,
            section_id,
            &assessment_type_id,
            &academic_year_id,
            semester,
            &title,
            weight,
            max_score,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    // Weight totals are informational only: a subject whose assessments do
    // not yet sum to 100 is in progress, never an error.
    let weight_total: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(weight), 0) FROM assessments
             WHERE subject_id = ? AND academic_year_id = ? AND semester = ?
               AND (section_id IS ? OR section_id = ?)",
            (&subject_id, &academic_year_id, semester, section_id, section_id),
            |r| r.get(0),
        )
        .unwrap_or(0.0);

    ok(
        &req.id,
        json!({
            "assessmentId": assessment_id,
            "status": "draft",
            "subjectWeightTotal": weight_total,
        }),
    )
}

fn handle_assessments_publish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let assessment_id = match req.params.get("assessmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing assessmentId", None),
    };

    let status: Option<String> = match conn
        .query_row(
            "SELECT status FROM assessments WHERE id = ?",
            [&assessment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match status.as_deref() {
        None => return err(&req.id, "not_found", "assessment not found", None),
        Some("draft") => {}
        Some("published") => {
            return err(
                &req.id,
                "state_conflict",
                "assessment is already published",
                None,
            )
        }
        Some(_) => {
            return err(
                &req.id,
                "state_conflict",
                "a locked assessment cannot be republished",
                None,
            )
        }
    }

    match conn.execute(
        "UPDATE assessments SET status = 'published' WHERE id = ?",
        [&assessment_id],
    ) {
        Ok(_) => ok(&req.id, json!({ "assessmentId": assessment_id, "status": "published" })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_assessments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let semester = req.params.get("semester").and_then(|v| v.as_i64());

    let mut stmt = match conn.prepare(
        "SELECT id, subject_id, grade_id, section_id, assessment_type_id, semester,
                title, weight, max_score, status
         FROM assessments
         WHERE academic_year_id = ? AND (? IS NULL OR semester = ?)
         ORDER BY semester, subject_id, title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&academic_year_id, semester, semester), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "gradeId": r.get::<_, String>(2)?,
                "sectionId": r.get::<_, Option<String>>(3)?,
                "assessmentTypeId": r.get::<_, String>(4)?,
                "semester": r.get::<_, i64>(5)?,
                "title": r.get::<_, String>(6)?,
                "weight": r.get::<_, f64>(7)?,
                "maxScore": r.get::<_, f64>(8)?,
                "status": r.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assessments) => ok(&req.id, json!({ "assessments": assessments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assessments.create" => Some(handle_assessments_create(state, req)),
        "assessments.publish" => Some(handle_assessments_publish(state, req)),
        "assessments.list" => Some(handle_assessments_list(state, req)),
        _ => None,
    }
}
