use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn require_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(err(
            &req.id,
            "bad_params",
            format!("missing {}", key),
            None,
        )),
    }
}

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let name = match require_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_date = match require_str(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_date = match require_str(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let is_current = req
        .params
        .get("isCurrent")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if is_current {
        // At most one year may be current.
        if let Err(e) = tx.execute("UPDATE academic_years SET is_current = 0", []) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let year_id = Uuid::new_v4().to_string();
    let status = if is_current { "active" } else { "planned" };
    if let Err(e) = tx.execute(
        "INSERT INTO academic_years(id, name, start_date, end_date, is_current, status)
         VALUES (?, ?, ?, ?, ?, ?)",
        (&year_id, &name, &start_date, &end_date, is_current as i64, status),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    // Every year carries exactly one period per semester plus its
    // registration gate, all born closed.
    let mut period_ids = Vec::with_capacity(2);
    for semester in [1_i64, 2] {
        let period_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO semester_periods(id, academic_year_id, semester, status)
             VALUES (?, ?, ?, 'closed')",
            (&period_id, &year_id, semester),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        period_ids.push(period_id);
    }
    if let Err(e) = tx.execute(
        "INSERT INTO registration_periods(id, academic_year_id, status)
         VALUES (?, ?, 'closed')",
        (Uuid::new_v4().to_string(), &year_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "academicYearId": year_id,
            "semester1PeriodId": period_ids[0],
            "semester2PeriodId": period_ids[1],
        }),
    )
}

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut stmt = match conn.prepare(
        "SELECT id, name, start_date, end_date, is_current, status
         FROM academic_years ORDER BY start_date",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": r.get::<_, String>(3)?,
                "isCurrent": r.get::<_, i64>(4)? != 0,
                "status": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(years) => ok(&req.id, json!({ "years": years })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let name = match require_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(level) = req.params.get("level").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing level", None);
    };

    let grade_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO grades(id, name, level) VALUES (?, ?, ?)",
        (&grade_id, &name, level),
    ) {
        Ok(_) => ok(&req.id, json!({ "gradeId": grade_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut stmt = match conn.prepare("SELECT id, name, level FROM grades ORDER BY level") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "level": r.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grade_id = match require_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match require_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let section_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO sections(id, grade_id, name) VALUES (?, ?, ?)",
        (&section_id, &grade_id, &name),
    ) {
        Ok(_) => ok(&req.id, json!({ "sectionId": section_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let name = match require_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO subjects(id, name) VALUES (?, ?)",
        (&subject_id, &name),
    ) {
        Ok(_) => ok(&req.id, json!({ "subjectId": subject_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_assessment_types_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let name = match require_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let type_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO assessment_types(id, name) VALUES (?, ?)",
        (&type_id, &name),
    ) {
        Ok(_) => ok(&req.id, json!({ "assessmentTypeId": type_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let first_name = match require_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match require_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = req.params.get("gradeId").and_then(|v| v.as_str());
    let section_id = req.params.get("sectionId").and_then(|v| v.as_str());

    let student_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO students(id, first_name, last_name, grade_id, section_id, active)
         VALUES (?, ?, ?, ?, ?, 1)",
        (&student_id, &first_name, &last_name, grade_id, section_id),
    ) {
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_students_register(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let grade_id = match require_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_id = req.params.get("sectionId").and_then(|v| v.as_str());
    let stream_id = req.params.get("streamId").and_then(|v| v.as_str());

    let registration_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO registrations(id, student_id, academic_year_id, grade_id, section_id, stream_id, status)
         VALUES (?, ?, ?, ?, ?, ?, 'active')",
        (
            &registration_id,
            &student_id,
            &academic_year_id,
            &grade_id,
            section_id,
            stream_id,
        ),
    ) {
        Ok(_) => {
            // Cohort membership changed; drop cached rankings for the scopes
            // the student just joined.
            state
                .rankings
                .invalidate_scopes(&academic_year_id, section_id, Some(&grade_id));
            ok(&req.id, json!({ "registrationId": registration_id }))
        }
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn set_registration_period(
    state: &mut AppState,
    req: &Request,
    status: &str,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let academic_year_id = match require_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM registration_periods WHERE academic_year_id = ?",
            [&academic_year_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(period_id) = existing else {
        return err(&req.id, "not_found", "registration period not found", None);
    };

    match conn.execute(
        "UPDATE registration_periods SET status = ? WHERE id = ?",
        (status, &period_id),
    ) {
        Ok(_) => ok(&req.id, json!({ "academicYearId": academic_year_id, "status": status })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(handle_years_create(state, req)),
        "years.list" => Some(handle_years_list(state, req)),
        "grades.create" => Some(handle_grades_create(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "sections.create" => Some(handle_sections_create(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "assessmentTypes.create" => Some(handle_assessment_types_create(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.register" => Some(handle_students_register(state, req)),
        "registration.openPeriod" => Some(set_registration_period(state, req, "open")),
        "registration.closePeriod" => Some(set_registration_period(state, req, "closed")),
        _ => None,
    }
}
