use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::ranking::{self, Cohort, Metric};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterPeriod {
    pub id: String,
    pub academic_year_id: String,
    pub semester: i64,
    pub status: String,
    pub opened_at: Option<String>,
    pub opened_by: Option<String>,
    pub closed_at: Option<String>,
    pub closed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextYear {
    pub academic_year_id: String,
    pub name: String,
}

/// Everything a close commits in one transaction, reported back to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOutcome {
    pub period: SemesterPeriod,
    pub semester_results_written: usize,
    pub final_results_written: usize,
    pub next_year: Option<NextYear>,
}

pub fn load_period(conn: &Connection, period_id: &str) -> Result<SemesterPeriod, EngineError> {
    let period = conn
        .query_row(
            "SELECT id, academic_year_id, semester, status, opened_at, opened_by, closed_at, closed_by
             FROM semester_periods WHERE id = ?",
            [period_id],
            |r| {
                Ok(SemesterPeriod {
                    id: r.get(0)?,
                    academic_year_id: r.get(1)?,
                    semester: r.get(2)?,
                    status: r.get(3)?,
                    opened_at: r.get(4)?,
                    opened_by: r.get(5)?,
                    closed_at: r.get(6)?,
                    closed_by: r.get(7)?,
                })
            },
        )
        .optional()?;
    period.ok_or_else(|| EngineError::NotFound("semester period not found".to_string()))
}

/// closed -> open for a period that has never been closed before. Previously
/// closed periods go through `reopen_semester` instead, so an accidental
/// second "open" cannot silently unlock a finalized semester.
pub fn open_semester(
    conn: &mut Connection,
    period_id: &str,
    actor_id: &str,
) -> Result<SemesterPeriod, EngineError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let period = load_period(&tx, period_id)?;

    if period.status == "open" {
        return Err(EngineError::StateConflict(format!(
            "Semester {} is already open",
            period.semester
        )));
    }
    if period.closed_at.is_some() {
        return Err(EngineError::StateConflict(format!(
            "Semester {} was closed; use reopen to unlock it again",
            period.semester
        )));
    }
    guard_no_other_open(&tx, &period)?;
    if period.semester == 2 {
        guard_semester1_closed(&tx, &period.academic_year_id)?;
    }

    let now = Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE semester_periods
         SET status = 'open', opened_at = ?, opened_by = ?
         WHERE id = ?",
        (&now, actor_id, period_id),
    )?;
    unlock_semester_rows(&tx, &period.academic_year_id, period.semester)?;

    let updated = load_period(&tx, period_id)?;
    tx.commit()?;
    info!(
        period_id,
        semester = period.semester,
        actor = actor_id,
        "semester opened"
    );
    Ok(updated)
}

/// open -> closed. Locks every mark and published assessment of the
/// (year, semester), persists semester results and ranks, and on a semester-2
/// close completes the year: final results, year status, and the next
/// academic year with semester 1 pre-opened and semester 2 pre-closed.
/// All of it in a single write-lock-first transaction.
pub fn close_semester(
    conn: &mut Connection,
    period_id: &str,
    actor_id: &str,
) -> Result<CloseOutcome, EngineError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let period = load_period(&tx, period_id)?;

    if period.status != "open" {
        return Err(EngineError::StateConflict(format!(
            "Semester {} is not open",
            period.semester
        )));
    }

    let mark_count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM marks WHERE academic_year_id = ? AND semester = ?",
        (&period.academic_year_id, period.semester),
        |r| r.get(0),
    )?;
    if mark_count == 0 {
        return Err(EngineError::StateConflict(
            "Cannot close semester with no results entered.".to_string(),
        ));
    }

    let now = Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE marks SET is_locked = 1 WHERE academic_year_id = ? AND semester = ?",
        (&period.academic_year_id, period.semester),
    )?;
    tx.execute(
        "UPDATE assessments SET status = 'locked'
         WHERE academic_year_id = ? AND semester = ? AND status = 'published'",
        (&period.academic_year_id, period.semester),
    )?;
    tx.execute(
        "UPDATE semester_periods
         SET status = 'closed', closed_at = ?, closed_by = ?
         WHERE id = ?",
        (&now, actor_id, period_id),
    )?;

    let semester_results_written =
        persist_semester_results(&tx, &period.academic_year_id, period.semester)?;

    let mut final_results_written = 0;
    let mut next_year = None;
    if period.semester == 2 {
        final_results_written = persist_final_results(&tx, &period.academic_year_id)?;
        tx.execute(
            "UPDATE academic_years SET status = 'completed', is_current = 0 WHERE id = ?",
            [&period.academic_year_id],
        )?;
        next_year = Some(create_next_year(&tx, &period.academic_year_id, actor_id, &now)?);
    }

    let updated = load_period(&tx, period_id)?;
    tx.commit()?;
    info!(
        period_id,
        semester = period.semester,
        actor = actor_id,
        semester_results_written,
        final_results_written,
        "semester closed"
    );
    Ok(CloseOutcome {
        period: updated,
        semester_results_written,
        final_results_written,
        next_year,
    })
}

/// closed -> open again, regardless of prior closure. Clears the closure
/// record and unlocks marks and assessments so corrections can be entered.
pub fn reopen_semester(
    conn: &mut Connection,
    period_id: &str,
    actor_id: &str,
) -> Result<SemesterPeriod, EngineError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let period = load_period(&tx, period_id)?;

    if period.status == "open" {
        return Err(EngineError::StateConflict(format!(
            "Semester {} is already open",
            period.semester
        )));
    }
    guard_no_other_open(&tx, &period)?;
    if period.semester == 2 {
        guard_semester1_closed(&tx, &period.academic_year_id)?;
    }

    let now = Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE semester_periods
         SET status = 'open', opened_at = ?, opened_by = ?, closed_at = NULL, closed_by = NULL
         WHERE id = ?",
        (&now, actor_id, period_id),
    )?;
    unlock_semester_rows(&tx, &period.academic_year_id, period.semester)?;

    let updated = load_period(&tx, period_id)?;
    tx.commit()?;
    info!(
        period_id,
        semester = period.semester,
        actor = actor_id,
        "semester reopened"
    );
    Ok(updated)
}

/// Invariant check, re-run inside the write transaction so concurrent opens
/// serialize on the SQLite write lock and cannot both pass.
fn guard_no_other_open(tx: &Transaction<'_>, period: &SemesterPeriod) -> Result<(), EngineError> {
    let other_open: Option<i64> = tx
        .query_row(
            "SELECT semester FROM semester_periods
             WHERE academic_year_id = ? AND status = 'open' AND id != ?",
            (&period.academic_year_id, &period.id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(semester) = other_open {
        return Err(EngineError::StateConflict(format!(
            "Semester {} is still open; close it first",
            semester
        )));
    }
    Ok(())
}

fn guard_semester1_closed(tx: &Transaction<'_>, academic_year_id: &str) -> Result<(), EngineError> {
    let sem1_status: Option<String> = tx
        .query_row(
            "SELECT status FROM semester_periods WHERE academic_year_id = ? AND semester = 1",
            [academic_year_id],
            |r| r.get(0),
        )
        .optional()?;
    match sem1_status.as_deref() {
        Some("closed") => Ok(()),
        _ => Err(EngineError::StateConflict(
            "Semester 1 must be closed before opening Semester 2".to_string(),
        )),
    }
}

fn unlock_semester_rows(
    tx: &Transaction<'_>,
    academic_year_id: &str,
    semester: i64,
) -> Result<(), EngineError> {
    tx.execute(
        "UPDATE marks SET is_locked = 0 WHERE academic_year_id = ? AND semester = ?",
        (academic_year_id, semester),
    )?;
    // Drafts stay drafts; only lifecycle-locked assessments come back.
    tx.execute(
        "UPDATE assessments SET status = 'published'
         WHERE academic_year_id = ? AND semester = ? AND status = 'locked'",
        (academic_year_id, semester),
    )?;
    Ok(())
}

/// Compute and upsert semester results (average + within-grade rank) for
/// every student registered in the year who has at least one mark. Existing
/// teacher remarks survive recomputation.
fn persist_semester_results(
    tx: &Transaction<'_>,
    academic_year_id: &str,
    semester: i64,
) -> Result<usize, EngineError> {
    let grade_ids = registered_grades(tx, academic_year_id)?;
    let mut written = 0;
    for grade_id in grade_ids {
        let cohort = ranking::fetch_cohort(tx, &Cohort::Grade(grade_id.clone()), academic_year_id)?;
        let ranked = ranking::rank_cohort(tx, &cohort, academic_year_id, Metric::Semester(semester))?;
        for r in &ranked {
            tx.execute(
                "INSERT INTO semester_results(id, student_id, academic_year_id, semester, grade_id, average, rank)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(student_id, academic_year_id, semester) DO UPDATE SET
                   grade_id = excluded.grade_id,
                   average = excluded.average,
                   rank = excluded.rank",
                (
                    Uuid::new_v4().to_string(),
                    &r.student_id,
                    academic_year_id,
                    semester,
                    &grade_id,
                    r.average,
                    r.rank,
                ),
            )?;
            written += 1;
        }
    }
    Ok(written)
}

/// Final results exist only for students whose combined year average is
/// computable, i.e. both semesters produced an average.
fn persist_final_results(tx: &Transaction<'_>, academic_year_id: &str) -> Result<usize, EngineError> {
    let grade_ids = registered_grades(tx, academic_year_id)?;
    let mut written = 0;
    for grade_id in grade_ids {
        let cohort = ranking::fetch_cohort(tx, &Cohort::Grade(grade_id.clone()), academic_year_id)?;
        let ranked = ranking::rank_cohort(tx, &cohort, academic_year_id, Metric::Final)?;
        for r in &ranked {
            tx.execute(
                "INSERT INTO final_results(id, student_id, academic_year_id, grade_id, combined_average, final_rank)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(student_id, academic_year_id) DO UPDATE SET
                   grade_id = excluded.grade_id,
                   combined_average = excluded.combined_average,
                   final_rank = excluded.final_rank",
                (
                    Uuid::new_v4().to_string(),
                    &r.student_id,
                    academic_year_id,
                    &grade_id,
                    r.average,
                    r.rank,
                ),
            )?;
            written += 1;
        }
    }
    Ok(written)
}

fn registered_grades(
    tx: &Transaction<'_>,
    academic_year_id: &str,
) -> Result<Vec<String>, EngineError> {
    let mut stmt = tx.prepare(
        "SELECT DISTINCT grade_id FROM registrations WHERE academic_year_id = ? ORDER BY grade_id",
    )?;
    let ids = stmt
        .query_map([academic_year_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Closing semester 2 rolls the school forward: the next academic year
/// becomes current/active with its semester 1 already open (the new term
/// starts accepting marks immediately) and its semester 2 closed. A year the
/// director already created by hand is reused, never duplicated — rollover
/// then only fills in whatever periods it is missing. The registration
/// period starts closed until the director opens it.
fn create_next_year(
    tx: &Transaction<'_>,
    completed_year_id: &str,
    actor_id: &str,
    now: &str,
) -> Result<NextYear, EngineError> {
    let (name, start_date, end_date): (String, String, String) = tx.query_row(
        "SELECT name, start_date, end_date FROM academic_years WHERE id = ?",
        [completed_year_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    let next_name = advance_year_name(&name);
    let next_start = advance_date(&start_date);

    let existing: Option<(String, String)> = tx
        .query_row(
            "SELECT id, name FROM academic_years
             WHERE id != ? AND (start_date = ? OR name = ?)
             ORDER BY start_date LIMIT 1",
            (completed_year_id, &next_start, &next_name),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    // At most one year may be current.
    tx.execute("UPDATE academic_years SET is_current = 0", [])?;

    let (next_year_id, next_name) = match existing {
        Some((id, existing_name)) => {
            tx.execute(
                "UPDATE academic_years SET is_current = 1, status = 'active' WHERE id = ?",
                [&id],
            )?;
            (id, existing_name)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO academic_years(id, name, start_date, end_date, is_current, status)
                 VALUES (?, ?, ?, ?, 1, 'active')",
                (&id, &next_name, &next_start, advance_date(&end_date)),
            )?;
            (id, next_name.clone())
        }
    };

    let sem1: Option<(String, String, Option<String>)> = tx
        .query_row(
            "SELECT id, status, closed_at FROM semester_periods
             WHERE academic_year_id = ? AND semester = 1",
            [&next_year_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    match sem1 {
        Some((period_id, status, closed_at)) => {
            // A period the director already closed once stays closed.
            if status == "closed" && closed_at.is_none() {
                tx.execute(
                    "UPDATE semester_periods SET status = 'open', opened_at = ?, opened_by = ?
                     WHERE id = ?",
                    (now, actor_id, &period_id),
                )?;
            }
        }
        None => {
            tx.execute(
                "INSERT INTO semester_periods(id, academic_year_id, semester, status, opened_at, opened_by)
                 VALUES (?, ?, 1, 'open', ?, ?)",
                (Uuid::new_v4().to_string(), &next_year_id, now, actor_id),
            )?;
        }
    }

    let has_sem2: Option<String> = tx
        .query_row(
            "SELECT id FROM semester_periods WHERE academic_year_id = ? AND semester = 2",
            [&next_year_id],
            |r| r.get(0),
        )
        .optional()?;
    if has_sem2.is_none() {
        tx.execute(
            "INSERT INTO semester_periods(id, academic_year_id, semester, status)
             VALUES (?, ?, 2, 'closed')",
            (Uuid::new_v4().to_string(), &next_year_id),
        )?;
    }

    let has_registration: Option<String> = tx
        .query_row(
            "SELECT id FROM registration_periods WHERE academic_year_id = ?",
            [&next_year_id],
            |r| r.get(0),
        )
        .optional()?;
    if has_registration.is_none() {
        tx.execute(
            "INSERT INTO registration_periods(id, academic_year_id, status)
             VALUES (?, ?, 'closed')",
            (Uuid::new_v4().to_string(), &next_year_id),
        )?;
    }

    info!(year = %next_name, "next academic year ready");
    Ok(NextYear {
        academic_year_id: next_year_id,
        name: next_name,
    })
}

/// "2025-2026" -> "2026-2027": every 4-digit run advances by one.
fn advance_year_name(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = String::with_capacity(name.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let run = &name[start..i];
            if run.len() == 4 {
                match run.parse::<u32>() {
                    Ok(n) => out.push_str(&(n + 1).to_string()),
                    Err(_) => out.push_str(run),
                }
            } else {
                out.push_str(run);
            }
        } else {
            out.push(name[i..].chars().next().unwrap_or('?'));
            i += name[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        }
    }
    out
}

fn advance_date(date: &str) -> String {
    match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        Ok(d) => d
            .with_year(d.year() + 1)
            .map(|nd| nd.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| date.to_string()),
        Err(_) => date.to_string(),
    }
}
