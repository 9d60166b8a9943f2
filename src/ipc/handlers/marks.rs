use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ranking;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const MARKS_BULK_MAX_ENTRIES: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

struct AssessmentRow {
    subject_id: String,
    academic_year_id: String,
    semester: i64,
    max_score: f64,
    status: String,
}

fn load_assessment(conn: &Connection, assessment_id: &str) -> Result<AssessmentRow, HandlerErr> {
    let row: Option<AssessmentRow> = conn
        .query_row(
            "SELECT subject_id, academic_year_id, semester, max_score, status
             FROM assessments WHERE id = ?",
            [assessment_id],
            |r| {
                Ok(AssessmentRow {
                    subject_id: r.get(0)?,
                    academic_year_id: r.get(1)?,
                    semester: r.get(2)?,
                    max_score: r.get(3)?,
                    status: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;
    row.ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "assessment not found".to_string(),
    })
}

/// Validate and upsert one mark. The semester must be open and the
/// assessment published; the score is bounded by the assessment's max.
fn enter_mark(
    conn: &Connection,
    student_id: &str,
    assessment_id: &str,
    score: f64,
) -> Result<AssessmentRow, HandlerErr> {
    let assessment = load_assessment(conn, assessment_id)?;

    match assessment.status.as_str() {
        "published" => {}
        "locked" => {
            return Err(HandlerErr {
                code: "state_conflict",
                message: "assessment is locked; reopen the semester to edit marks".to_string(),
            })
        }
        _ => {
            return Err(HandlerErr {
                code: "state_conflict",
                message: "assessment is not published".to_string(),
            })
        }
    }

    let period_status: Option<String> = conn
        .query_row(
            "SELECT status FROM semester_periods WHERE academic_year_id = ? AND semester = ?",
            (&assessment.academic_year_id, assessment.semester),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;
    if period_status.as_deref() != Some("open") {
        return Err(HandlerErr {
            code: "state_conflict",
            message: format!(
                "Semester {} is not open for mark entry",
                assessment.semester
            ),
        });
    }

    if !(0.0..=assessment.max_score).contains(&score) {
        return Err(HandlerErr {
            code: "validation",
            message: format!("score must be between 0 and {}", assessment.max_score),
        });
    }

    let student_exists: Option<String> = conn
        .query_row("SELECT id FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;
    if student_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
        });
    }

    conn.execute(
        "INSERT INTO marks(id, student_id, subject_id, assessment_id,
            academic_year_id, semester, score, max_score, is_locked)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
         ON CONFLICT(assessment_id, student_id) DO UPDATE SET
           score = excluded.score,
           max_score = excluded.max_score",
        (
            Uuid::new_v4().to_string(),
            student_id,
            &assessment.subject_id,
            assessment_id,
            &assessment.academic_year_id,
            assessment.semester,
            score,
            assessment.max_score,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
    })?;

    Ok(assessment)
}

fn handle_marks_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let assessment_id = match req.params.get("assessmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing assessmentId", None),
    };
    let Some(score) = req.params.get("score").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing/invalid score", None);
    };

    let assessment = match enter_mark(conn, &student_id, &assessment_id, score) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };

    if let Err(e) = ranking::invalidate_for_student(
        &mut state.rankings,
        conn,
        &student_id,
        &assessment.academic_year_id,
    ) {
        return crate::ipc::error::engine_err(&req.id, e);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_marks_bulk_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries[]", None);
    };
    if entries.len() > MARKS_BULK_MAX_ENTRIES {
        return err(
            &req.id,
            "bad_params",
            format!(
                "bulk payload exceeds max entries: {} > {}",
                entries.len(),
                MARKS_BULK_MAX_ENTRIES
            ),
            None,
        );
    }

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();
    let mut touched: Vec<(String, String)> = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let student_id = entry.get("studentId").and_then(|v| v.as_str());
        let assessment_id = entry.get("assessmentId").and_then(|v| v.as_str());
        let score = entry.get("score").and_then(|v| v.as_f64());
        let (Some(student_id), Some(assessment_id), Some(score)) =
            (student_id, assessment_id, score)
        else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": "entry requires studentId, assessmentId and score",
            }));
            continue;
        };

        match enter_mark(conn, student_id, assessment_id, score) {
            Ok(assessment) => {
                updated += 1;
                let key = (student_id.to_string(), assessment.academic_year_id);
                if !touched.contains(&key) {
                    touched.push(key);
                }
            }
            Err(e) => errors.push(json!({
                "index": i,
                "studentId": student_id,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    for (student_id, academic_year_id) in &touched {
        if let Err(e) = ranking::invalidate_for_student(
            &mut state.rankings,
            conn,
            student_id,
            academic_year_id,
        ) {
            return crate::ipc::error::engine_err(&req.id, e);
        }
    }

    let mut result = json!({ "ok": true, "updated": updated });
    if !errors.is_empty() {
        result["rejected"] = json!(errors.len());
        result["errors"] = json!(errors);
    }
    ok(&req.id, result)
}

fn handle_marks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
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
    let semester = req.params.get("semester").and_then(|v| v.as_i64());

    let mut stmt = match conn.prepare(
        "SELECT id, subject_id, assessment_id, semester, score, max_score, is_locked
         FROM marks
         WHERE student_id = ? AND academic_year_id = ? AND (? IS NULL OR semester = ?)
         ORDER BY semester, subject_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&student_id, &academic_year_id, semester, semester), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "assessmentId": r.get::<_, String>(2)?,
                "semester": r.get::<_, i64>(3)?,
                "score": r.get::<_, f64>(4)?,
                "maxScore": r.get::<_, f64>(5)?,
                "isLocked": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(marks) => ok(&req.id, json!({ "marks": marks })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.enter" => Some(handle_marks_enter(state, req)),
        "marks.bulkEnter" => Some(handle_marks_bulk_enter(state, req)),
        "marks.list" => Some(handle_marks_list(state, req)),
        _ => None,
    }
}
