use std::collections::HashMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Assessment, AssessmentSummary, ClassSummary, EnrolledStudent, SchoolClass, Student,
};

const UNKNOWN_CLASS: &str = "unassigned";

fn class_names(classes: &[SchoolClass]) -> HashMap<Uuid, &str> {
    classes.iter().map(|class| (class.id, class.name.as_str())).collect()
}

pub fn count_label(count: impl Into<i64>, noun: &str) -> String {
    let count = count.into();
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

pub fn total_remedial_days(student: &Student) -> i64 {
    student
        .remedial_history
        .iter()
        .map(|record| record.duration_days)
        .sum()
}

/// Students with an open enrollment, longest-running first.
pub fn currently_enrolled(
    students: &[Student],
    classes: &[SchoolClass],
    now: DateTime<Utc>,
) -> Vec<EnrolledStudent> {
    let names = class_names(classes);

    let mut enrolled: Vec<EnrolledStudent> = students
        .iter()
        .filter(|student| student.enrollment.is_enrolled())
        .map(|student| {
            let started_at = student.enrollment.started_at();
            EnrolledStudent {
                student_name: student.name.clone(),
                class_name: names
                    .get(&student.class_id)
                    .copied()
                    .unwrap_or(UNKNOWN_CLASS)
                    .to_string(),
                entry_level: student.enrollment.entry_level().map(str::to_string),
                started_at,
                days_so_far: started_at
                    .map(|start| (now - start).num_days().max(0))
                    .unwrap_or(0),
            }
        })
        .collect();

    enrolled.sort_by(|a, b| {
        b.days_so_far
            .cmp(&a.days_so_far)
            .then_with(|| a.student_name.cmp(&b.student_name))
    });
    enrolled
}

pub fn summarize_by_class(students: &[Student], classes: &[SchoolClass]) -> Vec<ClassSummary> {
    let names = class_names(classes);
    let mut map: HashMap<&str, ClassSummary> = HashMap::new();

    for student in students {
        let class_name = names
            .get(&student.class_id)
            .copied()
            .unwrap_or(UNKNOWN_CLASS);
        let entry = map.entry(class_name).or_insert_with(|| ClassSummary {
            class_name: class_name.to_string(),
            enrolled_count: 0,
            closed_count: 0,
            closed_days: 0,
        });

        if student.enrollment.is_enrolled() {
            entry.enrolled_count += 1;
        }
        entry.closed_count += student.remedial_history.len();
        entry.closed_days += total_remedial_days(student);
    }

    let mut summaries: Vec<ClassSummary> = map.into_values().collect();
    summaries.sort_by(|a, b| {
        b.enrolled_count
            .cmp(&a.enrolled_count)
            .then_with(|| a.class_name.cmp(&b.class_name))
    });
    summaries
}

pub fn summarize_assessments(assessments: &[Assessment]) -> Option<AssessmentSummary> {
    let latest_date = assessments.iter().map(|assessment| assessment.date).max()?;
    let count = assessments.len();
    let average = |total: i64, n: usize| total as f64 / n as f64;

    let total_wpm: i64 = assessments.iter().map(|a| i64::from(a.wpm)).sum();
    let total_accuracy: i64 = assessments.iter().map(|a| i64::from(a.accuracy)).sum();
    let total_comprehension: i64 = assessments.iter().map(|a| i64::from(a.comprehension)).sum();

    let math_scores: Vec<i64> = assessments
        .iter()
        .filter_map(|a| a.math_score.map(i64::from))
        .collect();
    let avg_math_score = if math_scores.is_empty() {
        None
    } else {
        Some(average(math_scores.iter().sum(), math_scores.len()))
    };

    Some(AssessmentSummary {
        count,
        avg_wpm: average(total_wpm, count),
        avg_accuracy: average(total_accuracy, count),
        avg_comprehension: average(total_comprehension, count),
        avg_math_score,
        latest_date,
    })
}

pub fn build_report(
    class_label: Option<&str>,
    students: &[Student],
    classes: &[SchoolClass],
    now: DateTime<Utc>,
) -> String {
    let enrolled = currently_enrolled(students, classes, now);
    let summaries = summarize_by_class(students, classes);

    let mut output = String::new();
    let label = class_label.unwrap_or("all classes");

    let _ = writeln!(output, "# Remedial Support Report");
    let _ = writeln!(
        output,
        "Generated for {} on {}",
        label,
        now.format("%Y-%m-%d")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Currently in Remedial Support");

    if enrolled.is_empty() {
        let _ = writeln!(output, "No students are in remedial support.");
    } else {
        for student in enrolled.iter() {
            let started = student
                .started_at
                .map(|start| start.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "unknown date".to_string());
            let _ = writeln!(
                output,
                "- {} ({}) since {} at level {}, {} so far",
                student.student_name,
                student.class_name,
                started,
                student.entry_level.as_deref().unwrap_or("unknown"),
                count_label(student.days_so_far, "day")
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Class Breakdown");

    if summaries.is_empty() {
        let _ = writeln!(output, "No students registered.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} enrolled now, {} ({})",
                summary.class_name,
                summary.enrolled_count,
                count_label(summary.closed_count as i64, "completed enrollment"),
                count_label(summary.closed_days, "day")
            );
        }
    }

    let mut completed: Vec<(&Student, i64)> = students
        .iter()
        .filter(|student| !student.remedial_history.is_empty())
        .map(|student| (student, total_remedial_days(student)))
        .collect();
    completed.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name.cmp(&b.0.name)));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Completed Enrollments");

    if completed.is_empty() {
        let _ = writeln!(output, "No completed enrollments yet.");
    } else {
        for (student, total_days) in completed.iter() {
            let _ = writeln!(
                output,
                "- {}: {}, {} total",
                student.name,
                count_label(student.remedial_history.len() as i64, "enrollment"),
                count_label(*total_days, "day")
            );
            for record in student.remedial_history.iter() {
                let _ = writeln!(
                    output,
                    "  - {} to {}: {} -> {} ({})",
                    record.entry_date.format("%Y-%m-%d"),
                    record.exit_date.format("%Y-%m-%d"),
                    record.entry_level.as_deref().unwrap_or("unknown"),
                    record.exit_level,
                    count_label(record.duration_days, "day")
                );
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Enrollment, RemedialRecord};
    use chrono::TimeZone;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    fn sample_class(name: &str) -> SchoolClass {
        SchoolClass {
            id: Uuid::new_v4(),
            name: name.to_string(),
            grade_level: "2º Ano".to_string(),
            year: 2024,
            teacher: "Profa. Ana Costa".to_string(),
        }
    }

    fn sample_student(name: &str, class: &SchoolClass, enrollment: Enrollment) -> Student {
        Student {
            id: Uuid::new_v4(),
            name: name.to_string(),
            class_id: class.id,
            reading_level: "Básico".to_string(),
            enrollment,
            remedial_history: Vec::new(),
        }
    }

    #[test]
    fn total_days_sums_closed_records() {
        let class = sample_class("Turma 2A");
        let mut student = sample_student("Alice Silva", &class, Enrollment::NotEnrolled);
        student.remedial_history = vec![
            RemedialRecord::close(at(2024, 1, 1), None, at(2024, 1, 15), "Básico"),
            RemedialRecord::close(at(2024, 3, 1), None, at(2024, 3, 6), "Adequado"),
        ];

        assert_eq!(total_remedial_days(&student), 19);
    }

    #[test]
    fn enrolled_listing_orders_longest_first() {
        let class = sample_class("Turma 2B");
        let students = vec![
            sample_student("Carla Dias", &class, Enrollment::open(at(2024, 5, 15), "Iniciante")),
            sample_student("Alice Silva", &class, Enrollment::open(at(2024, 5, 1), "Iniciante")),
            sample_student("Elena Souza", &class, Enrollment::NotEnrolled),
        ];

        let enrolled = currently_enrolled(&students, &[class], at(2024, 5, 20));

        assert_eq!(enrolled.len(), 2);
        assert_eq!(enrolled[0].student_name, "Alice Silva");
        assert_eq!(enrolled[0].days_so_far, 19);
        assert_eq!(enrolled[1].days_so_far, 5);
        assert_eq!(enrolled[1].class_name, "Turma 2B");
    }

    #[test]
    fn legacy_enrollment_without_start_counts_zero_days() {
        let class = sample_class("Turma 2A");
        let students = vec![sample_student(
            "Alice Silva",
            &class,
            Enrollment::from_columns(Some(true), None, None),
        )];

        let enrolled = currently_enrolled(&students, &[], at(2024, 5, 20));

        assert_eq!(enrolled[0].days_so_far, 0);
        assert_eq!(enrolled[0].class_name, UNKNOWN_CLASS);
    }

    #[test]
    fn class_summary_counts_open_and_closed() {
        let class_a = sample_class("Turma 2A");
        let class_b = sample_class("Turma 3A");
        let mut closed = sample_student("Davi Oliveira", &class_b, Enrollment::NotEnrolled);
        closed.remedial_history = vec![RemedialRecord::close(
            at(2024, 2, 1),
            Some("Iniciante".to_string()),
            at(2024, 2, 8),
            "Básico",
        )];
        let students = vec![
            sample_student("Alice Silva", &class_a, Enrollment::open(at(2024, 5, 1), "Básico")),
            sample_student("Bernardo Costa", &class_a, Enrollment::NotEnrolled),
            closed,
        ];

        let summaries = summarize_by_class(&students, &[class_a, class_b]);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].class_name, "Turma 2A");
        assert_eq!(summaries[0].enrolled_count, 1);
        assert_eq!(summaries[1].closed_count, 1);
        assert_eq!(summaries[1].closed_days, 7);
    }

    #[test]
    fn report_lists_sections() {
        let class = sample_class("Turma 2A");
        let mut student = sample_student("Alice Silva", &class, Enrollment::NotEnrolled);
        student.remedial_history = vec![RemedialRecord::close(
            at(2024, 5, 1),
            Some("Iniciante".to_string()),
            at(2024, 5, 15),
            "Básico",
        )];

        let report = build_report(Some("Turma 2A"), &[student], &[class], at(2024, 6, 1));

        assert!(report.starts_with("# Remedial Support Report"));
        assert!(report.contains("Generated for Turma 2A on 2024-06-01"));
        assert!(report.contains("No students are in remedial support."));
        assert!(report.contains("- Alice Silva: 1 enrollment, 14 days total"));
        assert!(report.contains("- Turma 2A: 0 enrolled now, 1 completed enrollment (14 days)"));
        assert!(report.contains("2024-05-01 to 2024-05-15: Iniciante -> Básico (14 days)"));
    }

    #[test]
    fn empty_report_has_placeholders() {
        let report = build_report(None, &[], &[], at(2024, 6, 1));
        assert!(report.contains("all classes"));
        assert!(report.contains("No students registered."));
        assert!(report.contains("No completed enrollments yet."));
    }

    #[test]
    fn counts_are_pluralized() {
        assert_eq!(count_label(1, "day"), "1 day");
        assert_eq!(count_label(0, "day"), "0 days");
        assert_eq!(count_label(2i64, "enrollment"), "2 enrollments");
    }

    #[test]
    fn open_enrollment_of_one_day_reads_singular() {
        let class = sample_class("Turma 2B");
        let students = vec![sample_student(
            "Carla Dias",
            &class,
            Enrollment::open(at(2024, 5, 19), "Iniciante"),
        )];

        let report = build_report(None, &students, &[class], at(2024, 5, 20));

        assert!(report.contains("at level Iniciante, 1 day so far"));
    }

    fn sample_assessment(day: u32, wpm: i32, math_score: Option<i32>) -> Assessment {
        Assessment {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            date: chrono::NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            text_title: "O Gato de Botas".to_string(),
            wpm,
            accuracy: 90,
            comprehension: 6,
            math_score,
            criteria: None,
            notes: String::new(),
        }
    }

    #[test]
    fn assessment_summary_averages_and_skips_missing_math() {
        let assessments = vec![
            sample_assessment(10, 52, Some(8)),
            sample_assessment(2, 45, None),
        ];

        let summary = summarize_assessments(&assessments).unwrap();

        assert_eq!(summary.count, 2);
        assert!((summary.avg_wpm - 48.5).abs() < 0.001);
        assert!((summary.avg_accuracy - 90.0).abs() < 0.001);
        assert_eq!(summary.avg_math_score, Some(8.0));
        assert_eq!(summary.latest_date, chrono::NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert!(summarize_assessments(&[]).is_none());
    }
}
