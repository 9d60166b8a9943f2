use crate::aggregate::{self, round2};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ranking::{self, Cohort, Metric, RankedStudent};
use rusqlite::OptionalExtension;
use serde_json::json;

fn require_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

fn require_semester(req: &Request) -> Result<i64, serde_json::Value> {
    match req.params.get("semester").and_then(|v| v.as_i64()) {
        Some(s @ (1 | 2)) => Ok(s),
        _ => Err(err(&req.id, "bad_params", "semester must be 1 or 2", None)),
    }
}

fn handle_subject_averages(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match require_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year_id = match require_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match require_semester(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match aggregate::subject_averages(conn, &student_id, &academic_year_id, semester) {
        Ok(subjects) => {
            let rounded: Vec<serde_json::Value> = subjects
                .iter()
                .map(|s| {
                    json!({
                        "subjectId": s.subject_id,
                        "subjectName": s.subject_name,
                        "average": round2(s.average),
                    })
                })
                .collect();
            ok(&req.id, json!({ "subjects": rounded }))
        }
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_semester_average(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match require_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year_id = match require_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match require_semester(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match aggregate::semester_average(conn, &student_id, &academic_year_id, semester) {
        Ok(avg) => ok(&req.id, json!({ "average": avg.map(round2) })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_year_final(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match require_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year_id = match require_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match aggregate::year_final(conn, &student_id, &academic_year_id) {
        Ok(yf) => {
            let subjects: Vec<serde_json::Value> = yf
                .subjects
                .iter()
                .map(|s| {
                    json!({
                        "subjectId": s.subject_id,
                        "subjectName": s.subject_name,
                        "semester1": s.semester1.map(round2),
                        "semester2": s.semester2.map(round2),
                        "finalAverage": s.final_average.map(round2),
                    })
                })
                .collect();
            ok(
                &req.id,
                json!({
                    "semester1": yf.semester1.map(round2),
                    "semester2": yf.semester2.map(round2),
                    "combined": yf.combined.map(round2),
                    "subjects": subjects,
                }),
            )
        }
        Err(e) => engine_err(&req.id, e),
    }
}

fn parse_metric(req: &Request) -> Result<Metric, serde_json::Value> {
    match req.params.get("metric").and_then(|v| v.as_str()) {
        Some("semester1") => Ok(Metric::Semester(1)),
        Some("semester2") => Ok(Metric::Semester(2)),
        Some("final") => Ok(Metric::Final),
        _ => Err(err(
            &req.id,
            "bad_params",
            "metric must be one of: semester1, semester2, final",
            None,
        )),
    }
}

fn parse_cohort(req: &Request) -> Result<Cohort, serde_json::Value> {
    if let Some(section_id) = req.params.get("sectionId").and_then(|v| v.as_str()) {
        return Ok(Cohort::Section(section_id.to_string()));
    }
    if let Some(grade_id) = req.params.get("gradeId").and_then(|v| v.as_str()) {
        return Ok(Cohort::Grade(grade_id.to_string()));
    }
    Err(err(
        &req.id,
        "bad_params",
        "provide sectionId or gradeId for the cohort",
        None,
    ))
}

fn rank_answer(ranked: &[RankedStudent], student_id: &str) -> serde_json::Value {
    let hit = ranked.iter().find(|r| r.student_id == student_id);
    json!({
        "rank": hit.map(|r| r.rank),
        "average": hit.map(|r| round2(r.average)),
        "total": ranked.len(),
    })
}

fn handle_rank(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match require_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year_id = match require_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let metric = match parse_metric(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cohort = match parse_cohort(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Some(ranked) = state.rankings.get(&cohort, &academic_year_id, metric) {
        return ok(&req.id, rank_answer(ranked, &student_id));
    }

    let cohort_ids = match ranking::fetch_cohort(conn, &cohort, &academic_year_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let ranked = match ranking::rank_cohort(conn, &cohort_ids, &academic_year_id, metric) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let answer = rank_answer(&ranked, &student_id);
    state
        .rankings
        .put(&cohort, &academic_year_id, metric, ranked);
    ok(&req.id, answer)
}

fn handle_semester_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let academic_year_id = match require_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match require_semester(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = req.params.get("gradeId").and_then(|v| v.as_str());

    let mut stmt = match conn.prepare(
        "SELECT sr.student_id, s.last_name, s.first_name, sr.grade_id, sr.average, sr.rank,
                sr.teacher_remarks
         FROM semester_results sr
         JOIN students s ON s.id = sr.student_id
         WHERE sr.academic_year_id = ? AND sr.semester = ?
           AND (? IS NULL OR sr.grade_id = ?)
         ORDER BY sr.grade_id, sr.rank",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(
            (&academic_year_id, semester, grade_id, grade_id),
            |r| {
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok(json!({
                    "studentId": r.get::<_, String>(0)?,
                    "displayName": format!("{}, {}", last, first),
                    "gradeId": r.get::<_, String>(3)?,
                    "average": round2(r.get::<_, f64>(4)?),
                    "rank": r.get::<_, Option<i64>>(5)?,
                    "teacherRemarks": r.get::<_, Option<String>>(6)?,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Teacher remarks go onto the persisted result only once the semester is
/// closed; an open semester's results are recomputed and must not be edited
/// by hand.
fn handle_set_remark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match require_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year_id = match require_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match require_semester(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let remarks = match req.params.get("remarks").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing remarks", None),
    };

    let period_status: Option<String> = match conn
        .query_row(
            "SELECT status FROM semester_periods WHERE academic_year_id = ? AND semester = ?",
            (&academic_year_id, semester),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if period_status.as_deref() == Some("open") {
        return err(
            &req.id,
            "state_conflict",
            "results cannot be hand-edited while the semester is open",
            None,
        );
    }

    let changed = match conn.execute(
        "UPDATE semester_results SET teacher_remarks = ?
         WHERE student_id = ? AND academic_year_id = ? AND semester = ?",
        (&remarks, &student_id, &academic_year_id, semester),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "semester result not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.subjectAverages" => Some(handle_subject_averages(state, req)),
        "results.semesterAverage" => Some(handle_semester_average(state, req)),
        "results.yearFinal" => Some(handle_year_final(state, req)),
        "results.rank" => Some(handle_rank(state, req)),
        "results.semesterList" => Some(handle_semester_list(state, req)),
        "results.setRemark" => Some(handle_set_remark(state, req)),
        _ => None,
    }
}
