use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{
    Enrollment, OpenEnrollment, RemedialRecord, Student, StudentRemedialPatch, ToggleOptions,
};

/// Inconsistencies found while computing a toggle. None of them stop the
/// toggle; the tracker falls back to a safe value and reports what it did.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemedialDiagnostic {
    #[error("student {student_id} is in remedial support without a start date; recorded a zero-day enrollment")]
    MissingStartDate { student_id: Uuid },

    #[error("student {student_id} is in remedial support without an entry level")]
    MissingEntryLevel { student_id: Uuid },

    #[error("student {student_id} exits at {exit} before entering at {entry}; duration clamped to 0")]
    ClockSkew {
        student_id: Uuid,
        entry: DateTime<Utc>,
        exit: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct Toggle {
    pub patch: StudentRemedialPatch,
    pub diagnostics: Vec<RemedialDiagnostic>,
}

impl Toggle {
    pub fn is_entering(&self) -> bool {
        self.patch.in_remedial()
    }
}

pub fn toggle(student: &Student, options: &ToggleOptions) -> Toggle {
    toggle_at(student, options, Utc::now())
}

/// Computes the next remedial state of `student` as if the toggle happened at `now`.
pub fn toggle_at(student: &Student, options: &ToggleOptions, now: DateTime<Utc>) -> Toggle {
    match &student.enrollment {
        Enrollment::NotEnrolled => enter(student, options, now),
        Enrollment::Enrolled(open) => exit(student, open, now),
    }
}

fn enter(student: &Student, options: &ToggleOptions, now: DateTime<Utc>) -> Toggle {
    let started_at = options.start_date.unwrap_or(now);
    let entry_level = options
        .entry_level
        .clone()
        .unwrap_or_else(|| student.reading_level.clone());

    Toggle {
        patch: StudentRemedialPatch {
            enrollment: Enrollment::open(started_at, entry_level),
            remedial_history: None,
        },
        diagnostics: Vec::new(),
    }
}

fn exit(student: &Student, open: &OpenEnrollment, now: DateTime<Utc>) -> Toggle {
    let mut diagnostics = Vec::new();

    let entry_date = match open.started_at {
        Some(started_at) => started_at,
        None => {
            diagnostics.push(RemedialDiagnostic::MissingStartDate {
                student_id: student.id,
            });
            now
        }
    };

    if open.entry_level.is_none() {
        diagnostics.push(RemedialDiagnostic::MissingEntryLevel {
            student_id: student.id,
        });
    }

    if now < entry_date {
        diagnostics.push(RemedialDiagnostic::ClockSkew {
            student_id: student.id,
            entry: entry_date,
            exit: now,
        });
    }

    let record = RemedialRecord::close(
        entry_date,
        open.entry_level.clone(),
        now,
        student.reading_level.clone(),
    );

    let mut history = student.remedial_history.clone();
    history.push(record);

    Toggle {
        patch: StudentRemedialPatch {
            enrollment: Enrollment::NotEnrolled,
            remedial_history: Some(history),
        },
        diagnostics,
    }
}

/// Parses a caller-supplied start date: an RFC 3339 timestamp or a plain
/// `YYYY-MM-DD` date, read as midnight UTC.
pub fn parse_start_date(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        bail!("start date is empty");
    }

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid start date {value:?}, expected YYYY-MM-DD or RFC 3339"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("invalid start date")?;
    Ok(midnight.and_utc())
}
