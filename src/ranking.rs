use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

use crate::aggregate;
use crate::error::EngineError;

/// What the cohort is compared on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Semester(i64),
    Final,
}

impl Metric {
    fn cache_key(self) -> String {
        match self {
            Metric::Semester(s) => format!("semester:{}", s),
            Metric::Final => "final".to_string(),
        }
    }
}

/// The comparison pool: every student registered in a section or a grade for
/// the year.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cohort {
    Section(String),
    Grade(String),
}

impl Cohort {
    fn cache_key(&self) -> String {
        match self {
            Cohort::Section(id) => format!("section:{}", id),
            Cohort::Grade(id) => format!("grade:{}", id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub student_id: String,
    pub average: f64,
    pub rank: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRank {
    pub rank: Option<i64>,
    pub total: i64,
}

/// Roster order for a cohort. The deterministic (last name, first name, id)
/// order doubles as the tie-break for equal averages.
pub fn fetch_cohort(
    conn: &Connection,
    cohort: &Cohort,
    academic_year_id: &str,
) -> Result<Vec<String>, EngineError> {
    let (sql, key) = match cohort {
        Cohort::Section(id) => (
            "SELECT r.student_id
             FROM registrations r JOIN students s ON s.id = r.student_id
             WHERE r.academic_year_id = ? AND r.section_id = ?
             ORDER BY s.last_name, s.first_name, s.id",
            id,
        ),
        Cohort::Grade(id) => (
            "SELECT r.student_id
             FROM registrations r JOIN students s ON s.id = r.student_id
             WHERE r.academic_year_id = ? AND r.grade_id = ?
             ORDER BY s.last_name, s.first_name, s.id",
            id,
        ),
    };
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map((academic_year_id, key), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Rank a cohort given as an explicit list of student ids, in input order.
///
/// Members whose metric cannot be computed (no marks, or an incomplete year
/// for the final metric) are excluded entirely: they never consume an ordinal
/// slot and never count toward the total. Ties receive distinct sequential
/// ranks in input order (stable sort).
pub fn rank_cohort(
    conn: &Connection,
    cohort_ids: &[String],
    academic_year_id: &str,
    metric: Metric,
) -> Result<Vec<RankedStudent>, EngineError> {
    let mut scorable: Vec<(String, f64)> = Vec::new();
    for student_id in cohort_ids {
        let value = match metric {
            Metric::Semester(semester) => {
                aggregate::semester_average(conn, student_id, academic_year_id, semester)?
            }
            Metric::Final => aggregate::year_final(conn, student_id, academic_year_id)?.combined,
        };
        if let Some(v) = value {
            scorable.push((student_id.clone(), v));
        }
    }

    scorable.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    Ok(scorable
        .into_iter()
        .enumerate()
        .map(|(i, (student_id, average))| RankedStudent {
            student_id,
            average,
            rank: i as i64 + 1,
        })
        .collect())
}

/// One student's position within a ranked cohort. `rank` is `None` when the
/// student has no computable metric; `total` counts scorable members only.
pub fn rank_student(
    conn: &Connection,
    student_id: &str,
    cohort_ids: &[String],
    academic_year_id: &str,
    metric: Metric,
) -> Result<StudentRank, EngineError> {
    let ranked = rank_cohort(conn, cohort_ids, academic_year_id, metric)?;
    let total = ranked.len() as i64;
    let rank = ranked
        .iter()
        .find(|r| r.student_id == student_id)
        .map(|r| r.rank);
    Ok(StudentRank { rank, total })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    cohort: String,
    academic_year_id: String,
    metric: String,
}

/// Cached cohort rankings with explicit invalidation on write. A mark
/// mutation invalidates exactly the (section, grade) entries of the affected
/// student for that year; lifecycle transitions drop the whole year. No TTLs.
#[derive(Debug, Default)]
pub struct RankingCache {
    entries: HashMap<CacheKey, Vec<RankedStudent>>,
}

impl RankingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        cohort: &Cohort,
        academic_year_id: &str,
        metric: Metric,
    ) -> Option<&Vec<RankedStudent>> {
        self.entries.get(&CacheKey {
            cohort: cohort.cache_key(),
            academic_year_id: academic_year_id.to_string(),
            metric: metric.cache_key(),
        })
    }

    pub fn put(
        &mut self,
        cohort: &Cohort,
        academic_year_id: &str,
        metric: Metric,
        ranking: Vec<RankedStudent>,
    ) {
        self.entries.insert(
            CacheKey {
                cohort: cohort.cache_key(),
                academic_year_id: academic_year_id.to_string(),
                metric: metric.cache_key(),
            },
            ranking,
        );
    }

    /// Drop every metric entry for the given section/grade scopes of a year.
    pub fn invalidate_scopes(
        &mut self,
        academic_year_id: &str,
        section_id: Option<&str>,
        grade_id: Option<&str>,
    ) {
        let section_key = section_id.map(|id| format!("section:{}", id));
        let grade_key = grade_id.map(|id| format!("grade:{}", id));
        self.entries.retain(|key, _| {
            if key.academic_year_id != academic_year_id {
                return true;
            }
            let hit = section_key.as_deref() == Some(key.cohort.as_str())
                || grade_key.as_deref() == Some(key.cohort.as_str());
            !hit
        });
    }

    /// Drop everything cached for a year (used by lifecycle transitions,
    /// which relock or unlock marks across all cohorts at once).
    pub fn invalidate_year(&mut self, academic_year_id: &str) {
        self.entries
            .retain(|key, _| key.academic_year_id != academic_year_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Invalidate the cache entries affected by a write to one student's marks:
/// the student's registered section and grade for that year.
pub fn invalidate_for_student(
    cache: &mut RankingCache,
    conn: &Connection,
    student_id: &str,
    academic_year_id: &str,
) -> Result<(), EngineError> {
    use rusqlite::OptionalExtension;
    let placement: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT grade_id, section_id FROM registrations
             WHERE student_id = ? AND academic_year_id = ?",
            (student_id, academic_year_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    if let Some((grade_id, section_id)) = placement {
        cache.invalidate_scopes(academic_year_id, section_id.as_deref(), Some(&grade_id));
    }
    Ok(())
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

    fn seed_cohort(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO academic_years(id, name, start_date, end_date, is_current, status)
             VALUES ('y1', '2025-2026', '2025-09-01', '2026-06-30', 1, 'active');
             INSERT INTO grades(id, name, level) VALUES ('g1', 'Grade 7', 7);
             INSERT INTO sections(id, grade_id, name) VALUES ('sec_a', 'g1', 'A');
             INSERT INTO subjects(id, name) VALUES ('math', 'Mathematics');
             INSERT INTO assessment_types(id, name) VALUES ('t_exam', 'Exam');
             INSERT INTO assessments(id, subject_id, grade_id, section_id, assessment_type_id,
                academic_year_id, semester, title, weight, max_score, status)
             VALUES ('a1', 'math', 'g1', 'sec_a', 't_exam', 'y1', 1, 'Exam 1', 100, 100, 'published');",
        )
        .expect("seed cohort rows");
    }

    fn add_student(conn: &Connection, id: &str, last: &str, score: Option<f64>) {
        conn.execute(
            "INSERT INTO students(id, first_name, last_name, grade_id, section_id, active)
             VALUES (?, 'Test', ?, 'g1', 'sec_a', 1)",
            (id, last),
        )
        .expect("insert student");
        conn.execute(
            "INSERT INTO registrations(id, student_id, academic_year_id, grade_id, section_id, status)
             VALUES (?, ?, 'y1', 'g1', 'sec_a', 'active')",
            (format!("r_{}", id), id),
        )
        .expect("insert registration");
        if let Some(v) = score {
            conn.execute(
                "INSERT INTO marks(id, student_id, subject_id, assessment_id,
                    academic_year_id, semester, score, max_score, is_locked)
                 VALUES (?, ?, 'math', 'a1', 'y1', 1, ?, 100, 0)",
                (format!("m_{}", id), id, v),
            )
            .expect("insert mark");
        }
    }

    #[test]
    fn ranks_are_sequential_and_gapless() {
        let conn = test_conn();
        seed_cohort(&conn);
        add_student(&conn, "s1", "Abebe", Some(70.0));
        add_student(&conn, "s2", "Bekele", Some(90.0));
        add_student(&conn, "s3", "Chala", Some(80.0));

        let cohort = fetch_cohort(&conn, &Cohort::Section("sec_a".into()), "y1").expect("cohort");
        let ranked = rank_cohort(&conn, &cohort, "y1", Metric::Semester(1)).expect("rank");
        let order: Vec<(&str, i64)> = ranked
            .iter()
            .map(|r| (r.student_id.as_str(), r.rank))
            .collect();
        assert_eq!(order, vec![("s2", 1), ("s3", 2), ("s1", 3)]);
    }

    #[test]
    fn ties_get_distinct_ranks_in_roster_order() {
        let conn = test_conn();
        seed_cohort(&conn);
        add_student(&conn, "s1", "Abebe", Some(85.0));
        add_student(&conn, "s2", "Bekele", Some(85.0));
        add_student(&conn, "s3", "Chala", Some(85.0));

        let cohort = fetch_cohort(&conn, &Cohort::Section("sec_a".into()), "y1").expect("cohort");
        let ranked = rank_cohort(&conn, &cohort, "y1", Metric::Semester(1)).expect("rank");
        let order: Vec<(&str, i64)> = ranked
            .iter()
            .map(|r| (r.student_id.as_str(), r.rank))
            .collect();
        // Stable sort: roster order breaks the tie, no shared ordinals.
        assert_eq!(order, vec![("s1", 1), ("s2", 2), ("s3", 3)]);
    }

    #[test]
    fn unscorable_students_consume_no_slot() {
        let conn = test_conn();
        seed_cohort(&conn);
        add_student(&conn, "s1", "Abebe", Some(60.0));
        add_student(&conn, "s2", "Bekele", None);
        add_student(&conn, "s3", "Chala", Some(75.0));

        let cohort = fetch_cohort(&conn, &Cohort::Section("sec_a".into()), "y1").expect("cohort");
        let ranked = rank_cohort(&conn, &cohort, "y1", Metric::Semester(1)).expect("rank");
        assert_eq!(ranked.len(), 2);

        let with_marks = rank_student(&conn, "s1", &cohort, "y1", Metric::Semester(1)).expect("rank");
        assert_eq!(with_marks.rank, Some(2));
        assert_eq!(with_marks.total, 2);

        let without = rank_student(&conn, "s2", &cohort, "y1", Metric::Semester(1)).expect("rank");
        assert_eq!(without.rank, None);
        assert_eq!(without.total, 2);
    }

    #[test]
    fn mark_write_invalidates_exactly_the_student_scopes() {
        let conn = test_conn();
        seed_cohort(&conn);
        add_student(&conn, "s1", "Abebe", Some(60.0));

        let mut cache = RankingCache::new();
        let section = Cohort::Section("sec_a".into());
        let grade = Cohort::Grade("g1".into());
        let ranked = rank_cohort(
            &conn,
            &fetch_cohort(&conn, &section, "y1").expect("cohort"),
            "y1",
            Metric::Semester(1),
        )
        .expect("rank");
        cache.put(&section, "y1", Metric::Semester(1), ranked.clone());
        cache.put(&grade, "y1", Metric::Semester(1), ranked.clone());
        cache.put(&grade, "other_year", Metric::Semester(1), ranked);
        assert_eq!(cache.len(), 3);

        invalidate_for_student(&mut cache, &conn, "s1", "y1").expect("invalidate");
        assert!(cache.get(&section, "y1", Metric::Semester(1)).is_none());
        assert!(cache.get(&grade, "y1", Metric::Semester(1)).is_none());
        // Entries for other years stay.
        assert!(cache.get(&grade, "other_year", Metric::Semester(1)).is_some());
    }
}
