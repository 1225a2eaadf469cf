use std::path::PathBuf;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod db;
mod models;
mod remedial;
mod report;

use config::Config;
use models::{
    AssessmentCriteria, CompetencyCategory, MathCriteria, NewAssessment, ProficiencyLevel,
    ToggleOptions,
};

#[derive(Parser)]
#[command(name = "classroom-remedial")]
#[command(about = "Class roster and remedial support tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load the demo roster
    Seed,
    /// Import students from a CSV file (name,class_name,reading_level)
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Register a class
    AddClass {
        #[arg(long)]
        name: String,
        #[arg(long)]
        grade_level: String,
        #[arg(long)]
        year: i32,
        #[arg(long)]
        teacher: String,
    },
    /// Change a class's details
    UpdateClass {
        #[arg(long)]
        name: String,
        #[arg(long)]
        new_name: Option<String>,
        #[arg(long)]
        grade_level: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        teacher: Option<String>,
    },
    /// Delete a class together with its students
    DeleteClass {
        #[arg(long)]
        name: String,
    },
    /// List classes
    Classes,
    /// Register a student in a class
    AddStudent {
        #[arg(long)]
        name: String,
        #[arg(long)]
        class: String,
        #[arg(long)]
        reading_level: String,
    },
    /// Change a student's name, class or reading level
    UpdateStudent {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        class: Option<String>,
        #[arg(long)]
        reading_level: Option<String>,
    },
    /// Remove a student from the roster
    DeleteStudent {
        #[arg(long)]
        id: Uuid,
    },
    /// List students
    Students {
        #[arg(long)]
        class: Option<String>,
    },
    /// Move a student into or out of remedial support
    Toggle {
        #[arg(long)]
        id: Uuid,
        /// Start date when entering (YYYY-MM-DD or RFC 3339), defaults to now
        #[arg(long)]
        start_date: Option<String>,
        /// Entry level when entering, defaults to the current reading level
        #[arg(long)]
        entry_level: Option<String>,
    },
    /// Show a student's remedial history
    History {
        #[arg(long)]
        id: Uuid,
        /// Print the history as JSON
        #[arg(long)]
        json: bool,
    },
    /// List students currently in remedial support
    Remedial {
        #[arg(long)]
        class: Option<String>,
    },
    /// Record a reading/math assessment for a student
    Assess {
        #[arg(long)]
        student: Uuid,
        /// Assessment date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        title: String,
        /// Words read per minute
        #[arg(long)]
        wpm: i32,
        /// Reading accuracy in percent
        #[arg(long)]
        accuracy: i32,
        /// Comprehension score
        #[arg(long)]
        comprehension: i32,
        #[arg(long)]
        math_score: Option<i32>,
        /// Rubric level for fluency (Insuficiente, Básico, Adequado, Avançado)
        #[arg(long)]
        fluency: Option<ProficiencyLevel>,
        #[arg(long)]
        decoding: Option<ProficiencyLevel>,
        #[arg(long)]
        comprehension_level: Option<ProficiencyLevel>,
        #[arg(long)]
        number_sense: bool,
        #[arg(long)]
        logic_reasoning: bool,
        #[arg(long)]
        operations: bool,
        #[arg(long)]
        geometry: bool,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// List assessments, newest first
    Assessments {
        #[arg(long)]
        student: Option<Uuid>,
    },
    /// Add an assessment criterion
    AddCompetency {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: String,
        /// Leitura, Matemática, Socioemocional or Geral
        #[arg(long)]
        category: CompetencyCategory,
        #[arg(long)]
        weight: i32,
    },
    /// Change an assessment criterion
    UpdateCompetency {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        category: Option<CompetencyCategory>,
        #[arg(long)]
        weight: Option<i32>,
    },
    /// Remove an assessment criterion
    DeleteCompetency {
        #[arg(long)]
        id: Uuid,
    },
    /// List assessment criteria
    Competencies,
    /// Generate a markdown report
    Report {
        #[arg(long)]
        class: Option<String>,
        #[arg(long, default_value = "remedial-report.md")]
        out: PathBuf,
    },
}

async fn resolve_class(pool: &PgPool, class: Option<&str>) -> anyhow::Result<Option<Uuid>> {
    match class {
        Some(name) => {
            let id = db::class_id_by_name(pool, name)
                .await?
                .with_context(|| format!("class {name} not found"))?;
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed roster inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_students_csv(&pool, &csv).await?;
            println!("Inserted {inserted} students from {}.", csv.display());
        }
        Commands::AddClass {
            name,
            grade_level,
            year,
            teacher,
        } => {
            let class = db::add_class(&pool, &name, &grade_level, year, &teacher).await?;
            println!("Class {} saved ({}).", class.name, class.id);
        }
        Commands::UpdateClass {
            name,
            new_name,
            grade_level,
            year,
            teacher,
        } => {
            let mut class = db::fetch_class(&pool, &name)
                .await?
                .with_context(|| format!("class {name} not found"))?;
            if let Some(value) = new_name {
                class.name = value;
            }
            if let Some(value) = grade_level {
                class.grade_level = value;
            }
            if let Some(value) = year {
                class.year = value;
            }
            if let Some(value) = teacher {
                class.teacher = value;
            }
            db::update_class(&pool, &class).await?;
            println!("Class {} updated.", class.name);
        }
        Commands::DeleteClass { name } => {
            let removed = db::delete_class(&pool, &name).await?;
            println!(
                "Class {name} deleted with {}.",
                report::count_label(removed as i64, "student")
            );
        }
        Commands::Classes => {
            let classes = db::list_classes(&pool).await?;
            if classes.is_empty() {
                println!("No classes registered.");
                return Ok(());
            }
            for class in classes.iter() {
                println!(
                    "- {} ({}, {}) taught by {}",
                    class.name, class.grade_level, class.year, class.teacher
                );
            }
        }
        Commands::AddStudent {
            name,
            class,
            reading_level,
        } => {
            let class_id = resolve_class(&pool, Some(class.as_str()))
                .await?
                .context("class is required")?;
            let student = db::add_student(&pool, &name, class_id, &reading_level).await?;
            println!("Student {} registered ({}).", student.name, student.id);
        }
        Commands::UpdateStudent {
            id,
            name,
            class,
            reading_level,
        } => {
            let mut student = db::fetch_student(&pool, id)
                .await?
                .with_context(|| format!("student {id} not found"))?;
            if let Some(value) = name {
                student.name = value;
            }
            if let Some(class_id) = resolve_class(&pool, class.as_deref()).await? {
                student.class_id = class_id;
            }
            if let Some(value) = reading_level {
                student.reading_level = value;
            }
            db::update_student(
                &pool,
                student.id,
                &student.name,
                student.class_id,
                &student.reading_level,
            )
            .await?;
            println!(
                "Student {} updated (reading level {}).",
                student.name, student.reading_level
            );
        }
        Commands::DeleteStudent { id } => {
            if db::delete_student(&pool, id).await? {
                println!("Student {id} removed.");
            } else {
                println!("No student with id {id}.");
            }
        }
        Commands::Students { class } => {
            let class_id = resolve_class(&pool, class.as_deref()).await?;
            let students = db::list_students(&pool, class_id).await?;

            if students.is_empty() {
                println!("No students registered.");
                return Ok(());
            }

            for student in students.iter() {
                let marker = if student.enrollment.is_enrolled() {
                    " [remedial]"
                } else {
                    ""
                };
                println!(
                    "- {} {} ({}){}",
                    student.id, student.name, student.reading_level, marker
                );
            }
        }
        Commands::Toggle {
            id,
            start_date,
            entry_level,
        } => {
            let options = ToggleOptions {
                start_date: start_date
                    .as_deref()
                    .map(remedial::parse_start_date)
                    .transpose()?,
                entry_level,
            };

            let outcome = db::toggle_remedial(&pool, id, &options)
                .await
                .with_context(|| format!("failed to update remedial support for {id}"))?;

            for diagnostic in outcome.diagnostics.iter() {
                println!("warning: {diagnostic}");
            }

            if outcome.entered {
                println!(
                    "{} entered remedial support at level {}.",
                    outcome.student.name,
                    outcome.student.enrollment.entry_level().unwrap_or("unknown")
                );
            } else if let Some(record) = outcome.student.remedial_history.last() {
                println!(
                    "{} left remedial support after {} ({} -> {}).",
                    outcome.student.name,
                    report::count_label(record.duration_days, "day"),
                    record.entry_level.as_deref().unwrap_or("unknown"),
                    record.exit_level
                );
            }
        }
        Commands::History { id, json } => {
            let student = db::fetch_student(&pool, id)
                .await?
                .with_context(|| format!("student {id} not found"))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&student.remedial_history)?);
                return Ok(());
            }

            println!("Remedial history for {}:", student.name);
            if let Some(started_at) = student.enrollment.started_at() {
                println!("- open since {}", started_at.format("%Y-%m-%d"));
            } else if student.enrollment.is_enrolled() {
                println!("- open since an unknown date");
            }
            for record in student.remedial_history.iter() {
                println!(
                    "- {} to {}: {} -> {} ({})",
                    record.entry_date.format("%Y-%m-%d"),
                    record.exit_date.format("%Y-%m-%d"),
                    record.entry_level.as_deref().unwrap_or("unknown"),
                    record.exit_level,
                    report::count_label(record.duration_days, "day")
                );
            }
            println!(
                "Total days in completed enrollments: {}",
                report::total_remedial_days(&student)
            );
        }
        Commands::Remedial { class } => {
            let class_id = resolve_class(&pool, class.as_deref()).await?;
            let students = db::list_students(&pool, class_id).await?;
            let classes = db::list_classes(&pool).await?;
            let enrolled = report::currently_enrolled(&students, &classes, Utc::now());

            if enrolled.is_empty() {
                println!("No students are in remedial support.");
                return Ok(());
            }

            println!("Students in remedial support:");
            for student in enrolled.iter() {
                println!(
                    "- {} ({}) level {}, {} so far",
                    student.student_name,
                    student.class_name,
                    student.entry_level.as_deref().unwrap_or("unknown"),
                    report::count_label(student.days_so_far, "day")
                );
            }
        }
        Commands::Assess {
            student,
            date,
            title,
            wpm,
            accuracy,
            comprehension,
            math_score,
            fluency,
            decoding,
            comprehension_level,
            number_sense,
            logic_reasoning,
            operations,
            geometry,
            notes,
        } => {
            let math = MathCriteria {
                number_sense,
                logic_reasoning,
                operations,
                geometry,
            };
            let assessment = NewAssessment {
                student_id: student,
                date: date.unwrap_or_else(|| Utc::now().date_naive()),
                text_title: title,
                wpm,
                accuracy,
                comprehension,
                math_score,
                criteria: AssessmentCriteria::from_parts(
                    fluency,
                    decoding,
                    comprehension_level,
                    math,
                )?,
                notes,
            };
            let saved = db::save_assessment(&pool, &assessment).await?;
            println!("Assessment {} saved for {}.", saved.id, saved.date);
        }
        Commands::Assessments { student } => {
            let assessments = db::list_assessments(&pool, student).await?;

            let Some(summary) = report::summarize_assessments(&assessments) else {
                println!("No assessments recorded.");
                return Ok(());
            };

            for assessment in assessments.iter() {
                let rubric = assessment
                    .criteria
                    .as_ref()
                    .map(|criteria| {
                        format!(
                            " [fluency {}, decoding {}, comprehension {}]",
                            criteria.fluency, criteria.decoding, criteria.comprehension
                        )
                    })
                    .unwrap_or_default();
                println!(
                    "- {} {}: {} wpm, {}% accuracy, comprehension {}{}",
                    assessment.date,
                    assessment.text_title,
                    assessment.wpm,
                    assessment.accuracy,
                    assessment.comprehension,
                    rubric
                );
            }
            println!(
                "{} (latest {}): avg {:.1} wpm, {:.1}% accuracy, comprehension {:.1}",
                report::count_label(summary.count as i64, "assessment"),
                summary.latest_date,
                summary.avg_wpm,
                summary.avg_accuracy,
                summary.avg_comprehension
            );
            if let Some(math) = summary.avg_math_score {
                println!("Average math score {math:.1}");
            }
        }
        Commands::AddCompetency {
            name,
            description,
            category,
            weight,
        } => {
            let competency =
                db::add_competency(&pool, &name, &description, category, weight).await?;
            println!("Competency {} saved ({}).", competency.name, competency.id);
        }
        Commands::UpdateCompetency {
            id,
            name,
            description,
            category,
            weight,
        } => {
            let mut competency = db::fetch_competency(&pool, id)
                .await?
                .with_context(|| format!("competency {id} not found"))?;
            if let Some(value) = name {
                competency.name = value;
            }
            if let Some(value) = description {
                competency.description = value;
            }
            if let Some(value) = category {
                competency.category = value;
            }
            if let Some(value) = weight {
                competency.weight = value;
            }
            if db::update_competency(&pool, &competency).await? {
                println!("Competency {} updated.", competency.name);
            } else {
                println!("No competency with id {id}.");
            }
        }
        Commands::DeleteCompetency { id } => {
            if db::delete_competency(&pool, id).await? {
                println!("Competency {id} removed.");
            } else {
                println!("No competency with id {id}.");
            }
        }
        Commands::Competencies => {
            let competencies = db::list_competencies(&pool).await?;
            if competencies.is_empty() {
                println!("No competencies registered.");
                return Ok(());
            }
            for competency in competencies.iter() {
                println!(
                    "- {} [{}] weight {}: {}",
                    competency.name, competency.category, competency.weight, competency.description
                );
            }
        }
        Commands::Report { class, out } => {
            let class_id = resolve_class(&pool, class.as_deref()).await?;
            let students = db::list_students(&pool, class_id).await?;
            let classes = db::list_classes(&pool).await?;
            let report = report::build_report(class.as_deref(), &students, &classes, Utc::now());
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
