use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("registrar.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Idempotent schema setup. Existing workspaces are migrated additively
/// (new columns via ALTER TABLE), never destructively.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'planned'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semester_periods(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'closed',
            opened_at TEXT,
            opened_by TEXT,
            closed_at TEXT,
            closed_by TEXT,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(academic_year_id, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semester_periods_year ON semester_periods(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            level INTEGER NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            UNIQUE(grade_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_grade ON sections(grade_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            grade_id TEXT,
            section_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_grade ON students(grade_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_section ON students(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_types(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            section_id TEXT,
            assessment_type_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            title TEXT NOT NULL,
            weight REAL NOT NULL,
            max_score REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(assessment_type_id) REFERENCES assessment_types(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_year_sem ON assessments(academic_year_id, semester)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_subject ON assessments(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            assessment_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            score REAL NOT NULL,
            max_score REAL NOT NULL,
            is_locked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(assessment_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student_year_sem ON marks(student_id, academic_year_id, semester)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_year_sem ON marks(academic_year_id, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semester_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            grade_id TEXT NOT NULL,
            average REAL NOT NULL,
            rank INTEGER,
            teacher_remarks TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            UNIQUE(student_id, academic_year_id, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semester_results_year_sem ON semester_results(academic_year_id, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS final_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            combined_average REAL NOT NULL,
            final_rank INTEGER,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            UNIQUE(student_id, academic_year_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_final_results_year ON final_results(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS registrations(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            section_id TEXT,
            stream_id TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            UNIQUE(student_id, academic_year_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_year_grade ON registrations(academic_year_id, grade_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_year_section ON registrations(academic_year_id, section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS registration_periods(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'closed',
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;

    ensure_assessments_title(conn)?;

    Ok(())
}

fn ensure_assessments_title(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces created assessments without a title column.
    if table_has_column(conn, "assessments", "title")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE assessments ADD COLUMN title TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
