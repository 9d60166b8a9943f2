use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;

pub const PROMOTION_THRESHOLD: f64 = 50.0;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: String,
    pub student_id: String,
    pub academic_year_id: String,
    pub grade_id: String,
    pub section_id: Option<String>,
    pub status: String,
}

/// Promote one student out of `academic_year_id` into the following year.
///
/// Order of gates matters for the surfaced reason: the registration-period
/// gate rejects everything regardless of eligibility; eligibility and
/// next-grade lookups are per-student `NotEligible` rejections that a batch
/// caller reports without aborting the rest.
pub fn promote_student(
    conn: &mut Connection,
    student_id: &str,
    academic_year_id: &str,
    actor_id: &str,
) -> Result<Registration, EngineError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let registration = promote_in_tx(&tx, student_id, academic_year_id)?;
    tx.commit()?;
    info!(
        student_id,
        grade_id = %registration.grade_id,
        actor = actor_id,
        "student promoted"
    );
    Ok(registration)
}

fn promote_in_tx(
    tx: &Transaction<'_>,
    student_id: &str,
    academic_year_id: &str,
) -> Result<Registration, EngineError> {
    let student: Option<(Option<String>, Option<String>)> = tx
        .query_row(
            "SELECT grade_id, section_id FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((current_grade_id, current_section_id)) = student else {
        return Err(EngineError::NotFound("student not found".to_string()));
    };
    let Some(current_grade_id) = current_grade_id else {
        return Err(EngineError::NotEligible(
            "Student has no current grade placement".to_string(),
        ));
    };

    let upcoming = upcoming_year(tx, academic_year_id)?;
    let Some(upcoming_year_id) = upcoming else {
        return Err(EngineError::StateConflict(
            "No upcoming academic year exists yet".to_string(),
        ));
    };

    let reg_status: Option<String> = tx
        .query_row(
            "SELECT status FROM registration_periods WHERE academic_year_id = ?",
            [&upcoming_year_id],
            |r| r.get(0),
        )
        .optional()?;
    if reg_status.as_deref() != Some("open") {
        return Err(EngineError::StateConflict(
            "Registration is closed for the upcoming academic year".to_string(),
        ));
    }

    let already: Option<String> = tx
        .query_row(
            "SELECT id FROM registrations WHERE student_id = ? AND academic_year_id = ?",
            (student_id, &upcoming_year_id),
            |r| r.get(0),
        )
        .optional()?;
    if already.is_some() {
        return Err(EngineError::StateConflict(
            "Student is already registered for the upcoming academic year".to_string(),
        ));
    }

    let combined_average: Option<f64> = tx
        .query_row(
            "SELECT combined_average FROM final_results
             WHERE student_id = ? AND academic_year_id = ?",
            (student_id, academic_year_id),
            |r| r.get(0),
        )
        .optional()?;
    match combined_average {
        None => {
            return Err(EngineError::NotEligible(
                "No final result exists for the student this academic year".to_string(),
            ));
        }
        Some(avg) if avg < PROMOTION_THRESHOLD => {
            return Err(EngineError::NotEligible(format!(
                "Combined average {:.2} is below the promotion threshold of {:.0}",
                avg, PROMOTION_THRESHOLD
            )));
        }
        Some(_) => {}
    }

    let current_level: i64 = tx.query_row(
        "SELECT level FROM grades WHERE id = ?",
        [&current_grade_id],
        |r| r.get(0),
    )?;
    let next_grade_id: Option<String> = tx
        .query_row(
            "SELECT id FROM grades WHERE level = ?",
            [current_level + 1],
            |r| r.get(0),
        )
        .optional()?;
    let Some(next_grade_id) = next_grade_id else {
        return Err(EngineError::NotEligible(
            "No next grade exists above the student's current grade".to_string(),
        ));
    };

    // Keep named cohorts together: same-named section in the target grade if
    // one exists, otherwise leave the section unassigned.
    let next_section_id: Option<String> = match &current_section_id {
        Some(section_id) => {
            let name: Option<String> = tx
                .query_row(
                    "SELECT name FROM sections WHERE id = ?",
                    [section_id],
                    |r| r.get(0),
                )
                .optional()?;
            match name {
                Some(name) => tx
                    .query_row(
                        "SELECT id FROM sections WHERE grade_id = ? AND name = ?",
                        (&next_grade_id, &name),
                        |r| r.get(0),
                    )
                    .optional()?,
                None => None,
            }
        }
        None => None,
    };

    tx.execute(
        "UPDATE students SET grade_id = ?, section_id = ? WHERE id = ?",
        (&next_grade_id, &next_section_id, student_id),
    )?;
    let registration_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO registrations(id, student_id, academic_year_id, grade_id, section_id, status)
         VALUES (?, ?, ?, ?, ?, 'active')",
        (
            &registration_id,
            student_id,
            &upcoming_year_id,
            &next_grade_id,
            &next_section_id,
        ),
    )?;

    Ok(Registration {
        id: registration_id,
        student_id: student_id.to_string(),
        academic_year_id: upcoming_year_id,
        grade_id: next_grade_id,
        section_id: next_section_id,
        status: "active".to_string(),
    })
}

/// The year that follows the given one, by start date.
fn upcoming_year(tx: &Transaction<'_>, academic_year_id: &str) -> Result<Option<String>, EngineError> {
    let start_date: Option<String> = tx
        .query_row(
            "SELECT start_date FROM academic_years WHERE id = ?",
            [academic_year_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(start_date) = start_date else {
        return Err(EngineError::NotFound("academic year not found".to_string()));
    };
    let next: Option<String> = tx
        .query_row(
            "SELECT id FROM academic_years WHERE start_date > ? ORDER BY start_date LIMIT 1",
            [&start_date],
            |r| r.get(0),
        )
        .optional()?;
    Ok(next)
}
