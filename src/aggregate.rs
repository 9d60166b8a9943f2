use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::error::EngineError;

/// Rounding applied at presentation boundaries only. Aggregation keeps full
/// precision internally so rounding error never compounds across levels.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject_id: String,
    pub subject_name: String,
    pub average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectYearFinal {
    pub subject_id: String,
    pub subject_name: String,
    pub semester1: Option<f64>,
    pub semester2: Option<f64>,
    pub final_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearFinal {
    pub semester1: Option<f64>,
    pub semester2: Option<f64>,
    pub combined: Option<f64>,
    pub subjects: Vec<SubjectYearFinal>,
}

pub fn ensure_student_exists(conn: &Connection, student_id: &str) -> Result<(), EngineError> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()?;
    if found.is_none() {
        return Err(EngineError::NotFound("student not found".to_string()));
    }
    Ok(())
}

pub fn ensure_year_exists(conn: &Connection, academic_year_id: &str) -> Result<(), EngineError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM academic_years WHERE id = ?",
            [academic_year_id],
            |r| r.get(0),
        )
        .optional()?;
    if found.is_none() {
        return Err(EngineError::NotFound("academic year not found".to_string()));
    }
    Ok(())
}

/// Subject-by-subject semester averages for one student.
///
/// Each mark contributes `score / max_score * weight`; the subject average is
/// the sum of contributions from the assessments that actually have a mark.
/// Weights that do not (yet) total 100 compute on what is present — an
/// in-progress semester is a partial sum, not an error. Subjects with zero
/// marks do not appear at all.
pub fn subject_averages(
    conn: &Connection,
    student_id: &str,
    academic_year_id: &str,
    semester: i64,
) -> Result<Vec<SubjectAverage>, EngineError> {
    ensure_student_exists(conn, student_id)?;
    ensure_year_exists(conn, academic_year_id)?;

    let mut stmt = conn.prepare(
        "SELECT m.subject_id, s.name, m.score, m.max_score, a.weight
         FROM marks m
         JOIN assessments a ON a.id = m.assessment_id
         JOIN subjects s ON s.id = m.subject_id
         WHERE m.student_id = ? AND m.academic_year_id = ? AND m.semester = ?
         ORDER BY s.name, s.id",
    )?;
    let rows = stmt.query_map((student_id, academic_year_id, semester), |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, f64>(2)?,
            r.get::<_, f64>(3)?,
            r.get::<_, f64>(4)?,
        ))
    })?;

    let mut out: Vec<SubjectAverage> = Vec::new();
    for row in rows {
        let (subject_id, subject_name, score, max_score, weight) = row?;
        let contribution = if max_score > 0.0 {
            score / max_score * weight
        } else {
            0.0
        };
        match out.iter_mut().find(|s| s.subject_id == subject_id) {
            Some(existing) => existing.average += contribution,
            None => out.push(SubjectAverage {
                subject_id,
                subject_name,
                average: contribution,
            }),
        }
    }
    Ok(out)
}

/// Overall semester average: arithmetic mean of the subject averages for
/// subjects with at least one mark. `None` when the student has no marks in
/// the semester — never zero.
pub fn semester_average(
    conn: &Connection,
    student_id: &str,
    academic_year_id: &str,
    semester: i64,
) -> Result<Option<f64>, EngineError> {
    let subjects = subject_averages(conn, student_id, academic_year_id, semester)?;
    Ok(mean(subjects.iter().map(|s| s.average)))
}

/// Two-semester rollup for one student and year.
///
/// Per subject, the year final is the mean of the semester averages when both
/// exist, else whichever one exists. The combined year average requires BOTH
/// semester averages; a year with one closed semester is incomplete and stays
/// `None`.
pub fn year_final(
    conn: &Connection,
    student_id: &str,
    academic_year_id: &str,
) -> Result<YearFinal, EngineError> {
    let sem1_subjects = subject_averages(conn, student_id, academic_year_id, 1)?;
    let sem2_subjects = subject_averages(conn, student_id, academic_year_id, 2)?;

    let mut subjects: Vec<SubjectYearFinal> = Vec::new();
    for s in &sem1_subjects {
        subjects.push(SubjectYearFinal {
            subject_id: s.subject_id.clone(),
            subject_name: s.subject_name.clone(),
            semester1: Some(s.average),
            semester2: None,
            final_average: Some(s.average),
        });
    }
    for s in &sem2_subjects {
        match subjects.iter_mut().find(|x| x.subject_id == s.subject_id) {
            Some(existing) => {
                existing.semester2 = Some(s.average);
                let s1 = existing.semester1.unwrap_or(s.average);
                existing.final_average = Some((s1 + s.average) / 2.0);
            }
            None => subjects.push(SubjectYearFinal {
                subject_id: s.subject_id.clone(),
                subject_name: s.subject_name.clone(),
                semester1: None,
                semester2: Some(s.average),
                final_average: Some(s.average),
            }),
        }
    }
    subjects.sort_by(|a, b| {
        a.subject_name
            .cmp(&b.subject_name)
            .then_with(|| a.subject_id.cmp(&b.subject_id))
    });

    let semester1 = mean(sem1_subjects.iter().map(|s| s.average));
    let semester2 = mean(sem2_subjects.iter().map(|s| s.average));
    let combined = match (semester1, semester2) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        _ => None,
    };

    Ok(YearFinal {
        semester1,
        semester2,
        combined,
        subjects,
    })
}

fn mean<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count > 0 {
        Some(sum / count as f64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn seed_basic(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO academic_years(id, name, start_date, end_date, is_current, status)
             VALUES ('y1', '2025-2026', '2025-09-01', '2026-06-30', 1, 'active');
             INSERT INTO grades(id, name, level) VALUES ('g1', 'Grade 7', 7);
             INSERT INTO students(id, first_name, last_name, grade_id, active)
             VALUES ('stu1', 'Abel', 'Tesfaye', 'g1', 1);
             INSERT INTO subjects(id, name) VALUES ('math', 'Mathematics');
             INSERT INTO subjects(id, name) VALUES ('eng', 'English');
             INSERT INTO assessment_types(id, name) VALUES ('t_quiz', 'Quiz');",
        )
        .expect("seed basic rows");
    }

    fn add_mark(
        conn: &Connection,
        id: &str,
        subject: &str,
        semester: i64,
        score: f64,
        max_score: f64,
        weight: f64,
    ) {
        let assessment_id = format!("a_{}", id);
        conn.execute(
            "INSERT INTO assessments(id, subject_id, grade_id, assessment_type_id,
                academic_year_id, semester, title, weight, max_score, status)
             VALUES (?, ?, 'g1', 't_quiz', 'y1', ?, ?, ?, ?, 'published')",
            (&assessment_id, subject, semester, id, weight, max_score),
        )
        .expect("insert assessment");
        conn.execute(
            "INSERT INTO marks(id, student_id, subject_id, assessment_id,
                academic_year_id, semester, score, max_score, is_locked)
             VALUES (?, 'stu1', ?, ?, 'y1', ?, ?, ?, 0)",
            (id, subject, &assessment_id, semester, score, max_score),
        )
        .expect("insert mark");
    }

    #[test]
    fn weighted_contributions_sum_per_subject() {
        let conn = test_conn();
        seed_basic(&conn);
        // Quiz 18/20 at weight 10 plus Final 70/100 at weight 90 => 9 + 63.
        add_mark(&conn, "m1", "math", 1, 18.0, 20.0, 10.0);
        add_mark(&conn, "m2", "math", 1, 70.0, 100.0, 90.0);

        let subjects = subject_averages(&conn, "stu1", "y1", 1).expect("averages");
        assert_eq!(subjects.len(), 1);
        assert!((subjects[0].average - 72.0).abs() < 1e-9);
    }

    #[test]
    fn partial_weights_compute_on_present_assessments() {
        let conn = test_conn();
        seed_basic(&conn);
        // Only 40 of 100 weight entered so far: still a result, not an error.
        add_mark(&conn, "m1", "math", 1, 30.0, 40.0, 40.0);

        let subjects = subject_averages(&conn, "stu1", "y1", 1).expect("averages");
        assert_eq!(subjects.len(), 1);
        assert!((subjects[0].average - 30.0).abs() < 1e-9);
    }

    #[test]
    fn subjects_without_marks_are_excluded_not_zero() {
        let conn = test_conn();
        seed_basic(&conn);
        add_mark(&conn, "m1", "math", 1, 80.0, 100.0, 100.0);
        // English has an assessment but no mark for the student.
        conn.execute(
            "INSERT INTO assessments(id, subject_id, grade_id, assessment_type_id,
                academic_year_id, semester, title, weight, max_score, status)
             VALUES ('a_eng', 'eng', 'g1', 't_quiz', 'y1', 1, 'Essay', 100, 100, 'published')",
            [],
        )
        .expect("insert assessment");

        let subjects = subject_averages(&conn, "stu1", "y1", 1).expect("averages");
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].subject_id, "math");

        // Semester average is the lone subject, not dragged toward zero.
        let avg = semester_average(&conn, "stu1", "y1", 1).expect("semester average");
        assert_eq!(avg, Some(80.0));
    }

    #[test]
    fn semester_average_none_without_marks() {
        let conn = test_conn();
        seed_basic(&conn);
        let avg = semester_average(&conn, "stu1", "y1", 1).expect("semester average");
        assert_eq!(avg, None);
    }

    #[test]
    fn year_final_requires_both_semesters() {
        let conn = test_conn();
        seed_basic(&conn);
        add_mark(&conn, "m1", "math", 1, 80.0, 100.0, 100.0);

        let one_sided = year_final(&conn, "stu1", "y1").expect("year final");
        assert_eq!(one_sided.semester1, Some(80.0));
        assert_eq!(one_sided.semester2, None);
        assert_eq!(one_sided.combined, None);

        add_mark(&conn, "m2", "math", 2, 60.0, 100.0, 100.0);
        let both = year_final(&conn, "stu1", "y1").expect("year final");
        assert_eq!(both.combined, Some(70.0));
        assert_eq!(both.subjects.len(), 1);
        assert_eq!(both.subjects[0].final_average, Some(70.0));
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let conn = test_conn();
        seed_basic(&conn);
        let err = subject_averages(&conn, "nope", "y1", 1).unwrap_err();
        assert_eq!(err.code(), "not_found");
        let err = subject_averages(&conn, "stu1", "nope", 1).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn round2_is_presentation_only() {
        assert_eq!(round2(49.994999), 49.99);
        assert_eq!(round2(49.995001), 50.0);
        assert_eq!(round2(70.0), 70.0);
    }
}
