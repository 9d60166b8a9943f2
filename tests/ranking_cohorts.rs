use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_registrard");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn registrard");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Cohort {
    year_id: String,
    section_id: String,
    grade_id: String,
    assessment_id: String,
    students: Vec<String>,
}

/// One open semester, one published 100-weight assessment, and three
/// registered students in section A of grade 7.
fn bootstrap(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
    names: &[(&str, &str)],
) -> Cohort {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year = request_ok(
        stdin,
        reader,
        "y",
        "years.create",
        json!({
            "name": "2025-2026",
            "startDate": "2025-09-01",
            "endDate": "2026-06-30",
            "isCurrent": true
        }),
    );
    let year_id = year["academicYearId"].as_str().expect("year id").to_string();
    let sem1_period_id = year["semester1PeriodId"].as_str().expect("p1");

    let grade = request_ok(
        stdin,
        reader,
        "g",
        "grades.create",
        json!({ "name": "Grade 7", "level": 7 }),
    );
    let grade_id = grade["gradeId"].as_str().expect("grade id").to_string();
    let section = request_ok(
        stdin,
        reader,
        "sec",
        "sections.create",
        json!({ "gradeId": grade_id, "name": "A" }),
    );
    let section_id = section["sectionId"].as_str().expect("section id").to_string();

    let mut students = Vec::new();
    for (i, (first, last)) in names.iter().enumerate() {
        let created = request_ok(
            stdin,
            reader,
            &format!("stu{}", i),
            "students.create",
            json!({
                "firstName": first,
                "lastName": last,
                "gradeId": grade_id,
                "sectionId": section_id
            }),
        );
        let student_id = created["studentId"].as_str().expect("student id").to_string();
        request_ok(
            stdin,
            reader,
            &format!("reg{}", i),
            "students.register",
            json!({
                "studentId": student_id,
                "academicYearId": year_id,
                "gradeId": grade_id,
                "sectionId": section_id
            }),
        );
        students.push(student_id);
    }

    let subject = request_ok(stdin, reader, "sj", "subjects.create", json!({ "name": "Mathematics" }));
    let type_resp = request_ok(
        stdin,
        reader,
        "ty",
        "assessmentTypes.create",
        json!({ "name": "Exam" }),
    );
    request_ok(
        stdin,
        reader,
        "open1",
        "periods.open",
        json!({ "periodId": sem1_period_id, "actorId": "director" }),
    );
    let created = request_ok(
        stdin,
        reader,
        "as",
        "assessments.create",
        json!({
            "subjectId": subject["subjectId"].as_str().expect("subject id"),
            "gradeId": grade_id,
            "assessmentTypeId": type_resp["assessmentTypeId"].as_str().expect("type id"),
            "academicYearId": year_id,
            "semester": 1,
            "title": "Exam",
            "weight": 100.0,
            "maxScore": 100.0
        }),
    );
    let assessment_id = created["assessmentId"].as_str().expect("assessment id").to_string();
    request_ok(
        stdin,
        reader,
        "pub",
        "assessments.publish",
        json!({ "assessmentId": assessment_id }),
    );

    Cohort {
        year_id,
        section_id,
        grade_id,
        assessment_id,
        students,
    }
}

fn enter_mark(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    cohort: &Cohort,
    student_id: &str,
    score: f64,
) {
    request_ok(
        stdin,
        reader,
        id,
        "marks.enter",
        json!({
            "studentId": student_id,
            "assessmentId": cohort.assessment_id,
            "score": score
        }),
    );
}

fn rank_of(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    cohort: &Cohort,
    student_id: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "results.rank",
        json!({
            "studentId": student_id,
            "academicYearId": cohort.year_id,
            "sectionId": cohort.section_id,
            "metric": "semester1"
        }),
    )
}

#[test]
fn ranks_are_gapless_and_ties_follow_roster_order() {
    let workspace = temp_dir("registrar-rank-ties");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    // Roster order sorts by last name: Abera before Chala before Girma.
    let cohort = bootstrap(
        &mut stdin,
        &mut reader,
        &workspace,
        &[("Sara", "Girma"), ("Meles", "Abera"), ("Hana", "Chala")],
    );

    // Girma 90, Abera 75, Chala 75: tie on 75 resolves by roster order.
    enter_mark(&mut stdin, &mut reader, "m0", &cohort, &cohort.students[0], 90.0);
    enter_mark(&mut stdin, &mut reader, "m1", &cohort, &cohort.students[1], 75.0);
    enter_mark(&mut stdin, &mut reader, "m2", &cohort, &cohort.students[2], 75.0);

    let girma = rank_of(&mut stdin, &mut reader, "r0", &cohort, &cohort.students[0]);
    assert_eq!(girma["rank"].as_i64(), Some(1));
    assert_eq!(girma["total"].as_u64(), Some(3));

    let abera = rank_of(&mut stdin, &mut reader, "r1", &cohort, &cohort.students[1]);
    assert_eq!(abera["rank"].as_i64(), Some(2));

    let chala = rank_of(&mut stdin, &mut reader, "r2", &cohort, &cohort.students[2]);
    assert_eq!(chala["rank"].as_i64(), Some(3));
}

#[test]
fn students_without_marks_are_left_out_of_the_ranking() {
    let workspace = temp_dir("registrar-rank-null");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let cohort = bootstrap(
        &mut stdin,
        &mut reader,
        &workspace,
        &[("Sara", "Girma"), ("Meles", "Abera")],
    );

    enter_mark(&mut stdin, &mut reader, "m0", &cohort, &cohort.students[0], 60.0);

    // The total counts scorable students, not the full roster.
    let marked = rank_of(&mut stdin, &mut reader, "r0", &cohort, &cohort.students[0]);
    assert_eq!(marked["rank"].as_i64(), Some(1));
    assert_eq!(marked["total"].as_u64(), Some(1));

    let unmarked = rank_of(&mut stdin, &mut reader, "r1", &cohort, &cohort.students[1]);
    assert!(unmarked["rank"].is_null());
    assert_eq!(unmarked["total"].as_u64(), Some(1));
}

#[test]
fn new_marks_refresh_cached_rankings() {
    let workspace = temp_dir("registrar-rank-refresh");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let cohort = bootstrap(
        &mut stdin,
        &mut reader,
        &workspace,
        &[("Sara", "Girma"), ("Meles", "Abera")],
    );

    enter_mark(&mut stdin, &mut reader, "m0", &cohort, &cohort.students[0], 60.0);
    enter_mark(&mut stdin, &mut reader, "m1", &cohort, &cohort.students[1], 50.0);

    let before = rank_of(&mut stdin, &mut reader, "r0", &cohort, &cohort.students[1]);
    assert_eq!(before["rank"].as_i64(), Some(2));

    // Overwrite pushes Abera ahead; the ranking must not serve a stale answer.
    enter_mark(&mut stdin, &mut reader, "m2", &cohort, &cohort.students[1], 95.0);

    let after = rank_of(&mut stdin, &mut reader, "r1", &cohort, &cohort.students[1]);
    assert_eq!(after["rank"].as_i64(), Some(1));
    let other = rank_of(&mut stdin, &mut reader, "r2", &cohort, &cohort.students[0]);
    assert_eq!(other["rank"].as_i64(), Some(2));
}

#[test]
fn late_registration_refreshes_cached_rankings() {
    let workspace = temp_dir("registrar-rank-register");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let cohort = bootstrap(
        &mut stdin,
        &mut reader,
        &workspace,
        &[("Sara", "Girma")],
    );

    enter_mark(&mut stdin, &mut reader, "m0", &cohort, &cohort.students[0], 70.0);

    // A new student with marks but no registration yet: not a cohort member.
    let extra = request_ok(
        &mut stdin,
        &mut reader,
        "stu-x",
        "students.create",
        json!({
            "firstName": "Meles",
            "lastName": "Abera",
            "gradeId": cohort.grade_id,
            "sectionId": cohort.section_id
        }),
    );
    let extra_id = extra["studentId"].as_str().expect("student id").to_string();
    enter_mark(&mut stdin, &mut reader, "m1", &cohort, &extra_id, 95.0);

    let before = rank_of(&mut stdin, &mut reader, "r0", &cohort, &cohort.students[0]);
    assert_eq!(before["rank"].as_i64(), Some(1));
    assert_eq!(before["total"].as_u64(), Some(1));

    // Registration adds them to the cohort; the cached ranking must go.
    request_ok(
        &mut stdin,
        &mut reader,
        "reg-x",
        "students.register",
        json!({
            "studentId": extra_id,
            "academicYearId": cohort.year_id,
            "gradeId": cohort.grade_id,
            "sectionId": cohort.section_id
        }),
    );

    let newcomer = rank_of(&mut stdin, &mut reader, "r1", &cohort, &extra_id);
    assert_eq!(newcomer["rank"].as_i64(), Some(1));
    assert_eq!(newcomer["total"].as_u64(), Some(2));
    let displaced = rank_of(&mut stdin, &mut reader, "r2", &cohort, &cohort.students[0]);
    assert_eq!(displaced["rank"].as_i64(), Some(2));
}

#[test]
fn grade_cohort_spans_sections() {
    let workspace = temp_dir("registrar-rank-grade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let cohort = bootstrap(
        &mut stdin,
        &mut reader,
        &workspace,
        &[("Sara", "Girma"), ("Meles", "Abera")],
    );

    // A third student in section B of the same grade.
    let section_b = request_ok(
        &mut stdin,
        &mut reader,
        "secb",
        "sections.create",
        json!({ "gradeId": cohort.grade_id, "name": "B" }),
    );
    let section_b_id = section_b["sectionId"].as_str().expect("section id");
    let extra = request_ok(
        &mut stdin,
        &mut reader,
        "stu-b",
        "students.create",
        json!({
            "firstName": "Yonas",
            "lastName": "Desta",
            "gradeId": cohort.grade_id,
            "sectionId": section_b_id
        }),
    );
    let extra_id = extra["studentId"].as_str().expect("student id").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "reg-b",
        "students.register",
        json!({
            "studentId": extra_id,
            "academicYearId": cohort.year_id,
            "gradeId": cohort.grade_id,
            "sectionId": section_b_id
        }),
    );

    enter_mark(&mut stdin, &mut reader, "m0", &cohort, &cohort.students[0], 70.0);
    enter_mark(&mut stdin, &mut reader, "m1", &cohort, &cohort.students[1], 80.0);
    enter_mark(&mut stdin, &mut reader, "m2", &cohort, &extra_id, 90.0);

    // Section cohort sees two students, grade cohort sees all three.
    let in_section = rank_of(&mut stdin, &mut reader, "rs", &cohort, &cohort.students[1]);
    assert_eq!(in_section["rank"].as_i64(), Some(1));
    assert_eq!(in_section["total"].as_u64(), Some(2));

    let in_grade = request_ok(
        &mut stdin,
        &mut reader,
        "rg",
        "results.rank",
        json!({
            "studentId": cohort.students[1],
            "academicYearId": cohort.year_id,
            "gradeId": cohort.grade_id,
            "metric": "semester1"
        }),
    );
    assert_eq!(in_grade["rank"].as_i64(), Some(2));
    assert_eq!(in_grade["total"].as_u64(), Some(3));
}
