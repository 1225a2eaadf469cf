use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    Assessment, AssessmentCriteria, Competency, CompetencyCategory, Enrollment, NewAssessment,
    ParseLabelError, RemedialRecord, RemedialSnapshot, SchoolClass, Student,
    StudentRemedialPatch, ToggleOptions,
};
use crate::remedial::{self, RemedialDiagnostic};

const STUDENT_COLUMNS: &str = "id, name, class_id, reading_level, in_remedial, \
     remedial_start_date, remedial_entry_level, remedial_history";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("student {0} not found")]
    NotFound(Uuid),

    #[error("class {0} not found")]
    ClassNotFound(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("student {0} changed remedial state while the update was in flight")]
    Conflict(Uuid),

    #[error("invalid stored value: {0}")]
    InvalidValue(#[from] ParseLabelError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct ToggleOutcome {
    pub student: Student,
    pub entered: bool,
    pub diagnostics: Vec<RemedialDiagnostic>,
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let classes = vec![
        (
            Uuid::parse_str("6b1f0c52-5d0e-4d8e-9a43-1f7f0b6f2a01")?,
            "Turma 2A",
            "2º Ano",
            2024,
            "Prof. Marcos Oliveira",
        ),
        (
            Uuid::parse_str("9e7c4a18-2b3d-4f61-8c2e-5a9d3b7e4c02")?,
            "Turma 2B",
            "2º Ano",
            2024,
            "Profa. Ana Costa",
        ),
        (
            Uuid::parse_str("c4d2e8f6-7a1b-4c3d-9e5f-0b8a6c4d2e03")?,
            "Turma 3A",
            "3º Ano",
            2024,
            "Prof. Ricardo Silva",
        ),
    ];

    for (id, name, grade_level, year, teacher) in classes {
        upsert_class(pool, id, name, grade_level, year, teacher).await?;
    }

    let students = vec![
        ("Alice Silva", "Turma 2A", "Em Desenvolvimento", Some("2024-05-01"), None),
        ("Bernardo Costa", "Turma 2A", "Fluente", None, None),
        ("Carla Dias", "Turma 2B", "Iniciante", Some("2024-05-15"), Some("Iniciante")),
        ("Davi Oliveira", "Turma 3A", "Fluente", None, None),
        ("Elena Souza", "Turma 2B", "Avançado", None, None),
    ];

    for (name, class_name, reading_level, started_on, entry_level) in students {
        let class_id = class_id_by_name(pool, class_name)
            .await?
            .with_context(|| format!("seed class {class_name} missing"))?;
        let started_at = started_on
            .map(remedial::parse_start_date)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO classroom.students
            (id, name, class_id, reading_level, in_remedial, remedial_start_date, remedial_entry_level)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (class_id, name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(class_id)
        .bind(reading_level)
        .bind(started_at.is_some())
        .bind(started_at)
        .bind(entry_level)
        .execute(pool)
        .await?;
    }

    let competencies = vec![
        ("Fluência de Leitura", "Capacidade de ler com ritmo e entonação.", CompetencyCategory::Leitura, 40),
        ("Compreensão de Texto", "Habilidade de interpretar e responder sobre o lido.", CompetencyCategory::Leitura, 30),
        ("Raciocínio Lógico", "Capacidade de resolver problemas estruturados.", CompetencyCategory::Matematica, 20),
        ("Trabalho em Equipe", "Interação e colaboração com colegas.", CompetencyCategory::Socioemocional, 10),
    ];

    for (name, description, category, weight) in competencies {
        sqlx::query(
            r#"
            INSERT INTO classroom.competencies (id, name, description, category, weight)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(description)
        .bind(category.as_str())
        .bind(weight)
        .execute(pool)
        .await?;
    }

    Ok(())
}

async fn upsert_class(
    pool: &PgPool,
    id: Uuid,
    name: &str,
    grade_level: &str,
    year: i32,
    teacher: &str,
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO classroom.classes (id, name, grade_level, year, teacher)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (name) DO UPDATE
        SET grade_level = EXCLUDED.grade_level, year = EXCLUDED.year, teacher = EXCLUDED.teacher
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(grade_level)
    .bind(year)
    .bind(teacher)
    .fetch_one(pool)
    .await?
    .get("id");

    Ok(id)
}

fn unique_violation(err: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    let duplicate = err
        .as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation());
    if duplicate {
        StoreError::Duplicate(what())
    } else {
        StoreError::Database(err)
    }
}

pub async fn add_class(
    pool: &PgPool,
    name: &str,
    grade_level: &str,
    year: i32,
    teacher: &str,
) -> Result<SchoolClass, StoreError> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO classroom.classes (id, name, grade_level, year, teacher)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(grade_level)
    .bind(year)
    .bind(teacher)
    .execute(pool)
    .await
    .map_err(|err| unique_violation(err, || format!("class {name}")))?;

    info!(class_id = %id, name, "class saved");

    Ok(SchoolClass {
        id,
        name: name.to_string(),
        grade_level: grade_level.to_string(),
        year,
        teacher: teacher.to_string(),
    })
}

pub async fn list_classes(pool: &PgPool) -> anyhow::Result<Vec<SchoolClass>> {
    let rows = sqlx::query(
        "SELECT id, name, grade_level, year, teacher FROM classroom.classes ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let mut classes = Vec::new();
    for row in rows {
        classes.push(SchoolClass {
            id: row.get("id"),
            name: row.get("name"),
            grade_level: row.get("grade_level"),
            year: row.get("year"),
            teacher: row.get("teacher"),
        });
    }

    Ok(classes)
}

pub async fn fetch_class(pool: &PgPool, name: &str) -> Result<Option<SchoolClass>, StoreError> {
    let row = sqlx::query(
        "SELECT id, name, grade_level, year, teacher FROM classroom.classes WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| SchoolClass {
        id: row.get("id"),
        name: row.get("name"),
        grade_level: row.get("grade_level"),
        year: row.get("year"),
        teacher: row.get("teacher"),
    }))
}

pub async fn update_class(pool: &PgPool, class: &SchoolClass) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE classroom.classes
        SET name = $2, grade_level = $3, year = $4, teacher = $5
        WHERE id = $1
        "#,
    )
    .bind(class.id)
    .bind(&class.name)
    .bind(&class.grade_level)
    .bind(class.year)
    .bind(&class.teacher)
    .execute(pool)
    .await
    .map_err(|err| unique_violation(err, || format!("class {}", class.name)))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::ClassNotFound(class.name.clone()));
    }

    info!(class_id = %class.id, name = %class.name, "class updated");
    Ok(())
}

/// Removes the class and, through the foreign key, every student in it.
pub async fn delete_class(pool: &PgPool, name: &str) -> Result<u64, StoreError> {
    let mut tx = pool.begin().await?;

    let removed_students: i64 = sqlx::query(
        r#"
        SELECT COUNT(*) AS total
        FROM classroom.students s
        JOIN classroom.classes c ON c.id = s.class_id
        WHERE c.name = $1
        "#,
    )
    .bind(name)
    .fetch_one(&mut *tx)
    .await?
    .get("total");

    let result = sqlx::query("DELETE FROM classroom.classes WHERE name = $1")
        .bind(name)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::ClassNotFound(name.to_string()));
    }

    tx.commit().await?;
    info!(name, removed_students, "class deleted");
    Ok(removed_students as u64)
}

pub async fn class_id_by_name(pool: &PgPool, name: &str) -> anyhow::Result<Option<Uuid>> {
    let row = sqlx::query("SELECT id FROM classroom.classes WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| row.get("id")))
}

pub async fn add_student(
    pool: &PgPool,
    name: &str,
    class_id: Uuid,
    reading_level: &str,
) -> anyhow::Result<Student> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO classroom.students (id, name, class_id, reading_level, in_remedial)
        VALUES ($1, $2, $3, $4, FALSE)
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(class_id)
    .bind(reading_level)
    .execute(pool)
    .await
    .with_context(|| format!("failed to register student {name}"))?;

    info!(student_id = %id, %class_id, "student registered");

    Ok(Student {
        id,
        name: name.to_string(),
        class_id,
        reading_level: reading_level.to_string(),
        enrollment: Enrollment::NotEnrolled,
        remedial_history: Vec::new(),
    })
}

/// Updates the roster fields of a student. Remedial columns are left alone; they
/// only change through `toggle_remedial`.
pub async fn update_student(
    pool: &PgPool,
    student_id: Uuid,
    name: &str,
    class_id: Uuid,
    reading_level: &str,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE classroom.students
        SET name = $2, class_id = $3, reading_level = $4
        WHERE id = $1
        "#,
    )
    .bind(student_id)
    .bind(name)
    .bind(class_id)
    .bind(reading_level)
    .execute(pool)
    .await
    .map_err(|err| unique_violation(err, || format!("student {name} in that class")))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(student_id));
    }

    info!(student_id = %student_id, reading_level, "student updated");
    Ok(())
}

pub async fn delete_student(pool: &PgPool, student_id: Uuid) -> anyhow::Result<bool> {
    let result = sqlx::query("DELETE FROM classroom.students WHERE id = $1")
        .bind(student_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn fetch_student(pool: &PgPool, student_id: Uuid) -> Result<Option<Student>, StoreError> {
    let query = format!("SELECT {STUDENT_COLUMNS} FROM classroom.students WHERE id = $1");
    let row = sqlx::query(&query)
        .bind(student_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(student_from_row).transpose()
}

pub async fn list_students(
    pool: &PgPool,
    class_id: Option<Uuid>,
) -> Result<Vec<Student>, StoreError> {
    let mut query = format!("SELECT {STUDENT_COLUMNS} FROM classroom.students");
    if class_id.is_some() {
        query.push_str(" WHERE class_id = $1");
    }
    query.push_str(" ORDER BY name");

    let mut rows = sqlx::query(&query);
    if let Some(value) = class_id {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    let mut students = Vec::new();

    for row in records.iter() {
        students.push(student_from_row(row)?);
    }

    Ok(students)
}

fn student_from_row(row: &PgRow) -> Result<Student, StoreError> {
    let in_remedial: Option<bool> = row.try_get("in_remedial")?;
    let started_at: Option<DateTime<Utc>> = row.try_get("remedial_start_date")?;
    let entry_level: Option<String> = row.try_get("remedial_entry_level")?;
    let history: Json<Vec<RemedialRecord>> = row.try_get("remedial_history")?;

    Ok(Student {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        class_id: row.try_get("class_id")?,
        reading_level: row.try_get("reading_level")?,
        enrollment: Enrollment::from_columns(in_remedial, started_at, entry_level),
        remedial_history: history.0,
    })
}

/// Writes `patch` only if the stored remedial columns still match `expected`.
/// A toggle computed from a stale snapshot fails with `StoreError::Conflict`.
pub async fn apply_remedial_patch(
    pool: &PgPool,
    student_id: Uuid,
    expected: &RemedialSnapshot,
    patch: &StudentRemedialPatch,
) -> Result<(), StoreError> {
    let history = patch.remedial_history.clone().map(Json);
    let history_len = i32::try_from(expected.history_len).unwrap_or(i32::MAX);

    let result = sqlx::query(
        r#"
        UPDATE classroom.students
        SET in_remedial = $3,
            remedial_start_date = $4,
            remedial_entry_level = $5,
            remedial_history = COALESCE($6, remedial_history)
        WHERE id = $1
          AND COALESCE(in_remedial, FALSE) = $2
          AND (CASE WHEN COALESCE(in_remedial, FALSE) THEN remedial_start_date END)
              IS NOT DISTINCT FROM $7
          AND jsonb_array_length(remedial_history) = $8
        "#,
    )
    .bind(student_id)
    .bind(expected.in_remedial)
    .bind(patch.in_remedial())
    .bind(patch.remedial_start_date())
    .bind(patch.remedial_entry_level())
    .bind(history)
    .bind(expected.started_at)
    .bind(history_len)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    let exists: Option<PgRow> = sqlx::query("SELECT 1 FROM classroom.students WHERE id = $1")
        .bind(student_id)
        .fetch_optional(pool)
        .await?;

    match exists {
        Some(_) => Err(StoreError::Conflict(student_id)),
        None => Err(StoreError::NotFound(student_id)),
    }
}

/// Reads the student, computes the toggle, persists it, and only then merges the
/// patch into the returned snapshot.
pub async fn toggle_remedial(
    pool: &PgPool,
    student_id: Uuid,
    options: &ToggleOptions,
) -> Result<ToggleOutcome, StoreError> {
    let mut student = fetch_student(pool, student_id)
        .await?
        .ok_or(StoreError::NotFound(student_id))?;

    let toggle = remedial::toggle(&student, options);
    for diagnostic in &toggle.diagnostics {
        warn!(student_id = %student_id, "{diagnostic}");
    }

    let snapshot = RemedialSnapshot::of(&student);
    apply_remedial_patch(pool, student_id, &snapshot, &toggle.patch).await?;
    toggle.patch.apply_to(&mut student);

    let entered = toggle.is_entering();
    if entered {
        info!(student_id = %student_id, "remedial enrollment opened");
    } else {
        debug!(
            student_id = %student_id,
            records = student.remedial_history.len(),
            "remedial enrollment closed"
        );
    }

    Ok(ToggleOutcome {
        student,
        entered,
        diagnostics: toggle.diagnostics,
    })
}

pub async fn import_students_csv(
    pool: &PgPool,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        name: String,
        class_name: String,
        reading_level: String,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let class_id = class_id_by_name(pool, &row.class_name)
            .await?
            .with_context(|| format!("unknown class {} for student {}", row.class_name, row.name))?;

        let result = sqlx::query(
            r#"
            INSERT INTO classroom.students (id, name, class_id, reading_level, in_remedial)
            VALUES ($1, $2, $3, $4, FALSE)
            ON CONFLICT (class_id, name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.name)
        .bind(class_id)
        .bind(&row.reading_level)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        } else {
            debug!(name = %row.name, class = %row.class_name, "student already registered");
        }
    }

    Ok(inserted)
}

pub async fn save_assessment(
    pool: &PgPool,
    assessment: &NewAssessment,
) -> Result<Assessment, StoreError> {
    let id = Uuid::new_v4();
    let criteria = assessment.criteria.clone().map(Json);

    sqlx::query(
        r#"
        INSERT INTO classroom.assessments
        (id, student_id, assessed_on, text_title, wpm, accuracy, comprehension, math_score, criteria, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(id)
    .bind(assessment.student_id)
    .bind(assessment.date)
    .bind(&assessment.text_title)
    .bind(assessment.wpm)
    .bind(assessment.accuracy)
    .bind(assessment.comprehension)
    .bind(assessment.math_score)
    .bind(criteria)
    .bind(&assessment.notes)
    .execute(pool)
    .await
    .map_err(|err| {
        let unknown_student = err
            .as_database_error()
            .is_some_and(|db_err| db_err.is_foreign_key_violation());
        if unknown_student {
            StoreError::NotFound(assessment.student_id)
        } else {
            StoreError::Database(err)
        }
    })?;

    info!(assessment_id = %id, student_id = %assessment.student_id, "assessment saved");

    Ok(Assessment {
        id,
        student_id: assessment.student_id,
        date: assessment.date,
        text_title: assessment.text_title.clone(),
        wpm: assessment.wpm,
        accuracy: assessment.accuracy,
        comprehension: assessment.comprehension,
        math_score: assessment.math_score,
        criteria: assessment.criteria.clone(),
        notes: assessment.notes.clone(),
    })
}

/// Assessments, newest first.
pub async fn list_assessments(
    pool: &PgPool,
    student_id: Option<Uuid>,
) -> Result<Vec<Assessment>, StoreError> {
    let mut query = String::from(
        "SELECT id, student_id, assessed_on, text_title, wpm, accuracy, comprehension, \
         math_score, criteria, notes FROM classroom.assessments",
    );
    if student_id.is_some() {
        query.push_str(" WHERE student_id = $1");
    }
    query.push_str(" ORDER BY assessed_on DESC, created_at DESC");

    let mut rows = sqlx::query(&query);
    if let Some(value) = student_id {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    let mut assessments = Vec::new();

    for row in records.iter() {
        let criteria: Option<Json<AssessmentCriteria>> = row.try_get("criteria")?;
        assessments.push(Assessment {
            id: row.try_get("id")?,
            student_id: row.try_get("student_id")?,
            date: row.try_get("assessed_on")?,
            text_title: row.try_get("text_title")?,
            wpm: row.try_get("wpm")?,
            accuracy: row.try_get("accuracy")?,
            comprehension: row.try_get("comprehension")?,
            math_score: row.try_get("math_score")?,
            criteria: criteria.map(|json| json.0),
            notes: row.try_get("notes")?,
        });
    }

    Ok(assessments)
}

pub async fn add_competency(
    pool: &PgPool,
    name: &str,
    description: &str,
    category: CompetencyCategory,
    weight: i32,
) -> Result<Competency, StoreError> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO classroom.competencies (id, name, description, category, weight)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(description)
    .bind(category.as_str())
    .bind(weight)
    .execute(pool)
    .await
    .map_err(|err| unique_violation(err, || format!("competency {name}")))?;

    info!(competency_id = %id, name, "competency saved");

    Ok(Competency {
        id,
        name: name.to_string(),
        description: description.to_string(),
        category,
        weight,
    })
}

fn competency_from_row(row: &PgRow) -> Result<Competency, StoreError> {
    let category: String = row.try_get("category")?;
    Ok(Competency {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        category: category.parse()?,
        weight: row.try_get("weight")?,
    })
}

pub async fn fetch_competency(
    pool: &PgPool,
    competency_id: Uuid,
) -> Result<Option<Competency>, StoreError> {
    let row = sqlx::query(
        "SELECT id, name, description, category, weight FROM classroom.competencies WHERE id = $1",
    )
    .bind(competency_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(competency_from_row).transpose()
}

pub async fn list_competencies(pool: &PgPool) -> Result<Vec<Competency>, StoreError> {
    let rows = sqlx::query(
        "SELECT id, name, description, category, weight FROM classroom.competencies ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(competency_from_row).collect()
}

pub async fn update_competency(pool: &PgPool, competency: &Competency) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE classroom.competencies
        SET name = $2, description = $3, category = $4, weight = $5
        WHERE id = $1
        "#,
    )
    .bind(competency.id)
    .bind(&competency.name)
    .bind(&competency.description)
    .bind(competency.category.as_str())
    .bind(competency.weight)
    .execute(pool)
    .await
    .map_err(|err| unique_violation(err, || format!("competency {}", competency.name)))?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete_competency(pool: &PgPool, competency_id: Uuid) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM classroom.competencies WHERE id = $1")
        .bind(competency_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
