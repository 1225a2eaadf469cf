use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SchoolClass {
    pub id: Uuid,
    pub name: String,
    pub grade_level: String,
    pub year: i32,
    pub teacher: String,
}

#[derive(Debug, Clone)]
pub struct Student {
    pub id: Uuid,
    pub name: String,
    pub class_id: Uuid,
    pub reading_level: String,
    pub enrollment: Enrollment,
    pub remedial_history: Vec<RemedialRecord>,
}

/// Remedial-support state of a single student.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Enrollment {
    #[default]
    NotEnrolled,
    Enrolled(OpenEnrollment),
}

/// An enrollment that has not been closed yet.
///
/// Both fields are always set for enrollments opened by the tracker. They are
/// `None` only for legacy rows that carry the remedial flag without the
/// matching start date or entry level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEnrollment {
    pub started_at: Option<DateTime<Utc>>,
    pub entry_level: Option<String>,
}

impl Enrollment {
    pub fn open(started_at: DateTime<Utc>, entry_level: impl Into<String>) -> Self {
        Enrollment::Enrolled(OpenEnrollment {
            started_at: Some(started_at),
            entry_level: Some(entry_level.into()),
        })
    }

    /// Rebuilds the enrollment from its stored columns. A missing or false flag
    /// means not enrolled, whatever the other two columns hold.
    pub fn from_columns(
        in_remedial: Option<bool>,
        started_at: Option<DateTime<Utc>>,
        entry_level: Option<String>,
    ) -> Self {
        if in_remedial.unwrap_or(false) {
            Enrollment::Enrolled(OpenEnrollment {
                started_at,
                entry_level,
            })
        } else {
            Enrollment::NotEnrolled
        }
    }

    pub fn is_enrolled(&self) -> bool {
        matches!(self, Enrollment::Enrolled(_))
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Enrollment::Enrolled(open) => open.started_at,
            Enrollment::NotEnrolled => None,
        }
    }

    pub fn entry_level(&self) -> Option<&str> {
        match self {
            Enrollment::Enrolled(open) => open.entry_level.as_deref(),
            Enrollment::NotEnrolled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemedialRecord {
    pub entry_date: DateTime<Utc>,
    pub entry_level: Option<String>,
    pub exit_date: DateTime<Utc>,
    pub exit_level: String,
    pub duration_days: i64,
}

impl RemedialRecord {
    pub fn close(
        entry_date: DateTime<Utc>,
        entry_level: Option<String>,
        exit_date: DateTime<Utc>,
        exit_level: impl Into<String>,
    ) -> Self {
        // num_days truncates toward zero, which is floor once negatives are clamped.
        let duration_days = (exit_date - entry_date).num_days().max(0);
        RemedialRecord {
            entry_date,
            entry_level,
            exit_date,
            exit_level: exit_level.into(),
            duration_days,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToggleOptions {
    pub start_date: Option<DateTime<Utc>>,
    pub entry_level: Option<String>,
}

/// Fields of a student that a toggle changes. `remedial_history` is only
/// present when an enrollment was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRemedialPatch {
    pub enrollment: Enrollment,
    pub remedial_history: Option<Vec<RemedialRecord>>,
}

impl StudentRemedialPatch {
    pub fn in_remedial(&self) -> bool {
        self.enrollment.is_enrolled()
    }

    pub fn remedial_start_date(&self) -> Option<DateTime<Utc>> {
        self.enrollment.started_at()
    }

    pub fn remedial_entry_level(&self) -> Option<&str> {
        self.enrollment.entry_level()
    }

    pub fn apply_to(&self, student: &mut Student) {
        student.enrollment = self.enrollment.clone();
        if let Some(history) = &self.remedial_history {
            student.remedial_history = history.clone();
        }
    }
}

/// The remedial columns a patch was computed from. The store only applies the
/// patch while the row still matches, which catches a stale snapshot even when
/// another writer has exited and re-entered in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemedialSnapshot {
    pub in_remedial: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub history_len: usize,
}

impl RemedialSnapshot {
    pub fn of(student: &Student) -> Self {
        RemedialSnapshot {
            in_remedial: student.enrollment.is_enrolled(),
            started_at: student.enrollment.started_at(),
            history_len: student.remedial_history.len(),
        }
    }

    pub fn matches(&self, student: &Student) -> bool {
        *self == RemedialSnapshot::of(student)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} {value:?}")]
pub struct ParseLabelError {
    kind: &'static str,
    value: String,
}

fn fold_label(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .replace(['á', 'â', 'ã'], "a")
        .replace('ç', "c")
        .replace(['é', 'ê'], "e")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProficiencyLevel {
    Insuficiente,
    #[serde(rename = "Básico")]
    Basico,
    Adequado,
    #[serde(rename = "Avançado")]
    Avancado,
}

impl ProficiencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProficiencyLevel::Insuficiente => "Insuficiente",
            ProficiencyLevel::Basico => "Básico",
            ProficiencyLevel::Adequado => "Adequado",
            ProficiencyLevel::Avancado => "Avançado",
        }
    }
}

impl fmt::Display for ProficiencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProficiencyLevel {
    type Err = ParseLabelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match fold_label(value).as_str() {
            "insuficiente" => Ok(ProficiencyLevel::Insuficiente),
            "basico" => Ok(ProficiencyLevel::Basico),
            "adequado" => Ok(ProficiencyLevel::Adequado),
            "avancado" => Ok(ProficiencyLevel::Avancado),
            _ => Err(ParseLabelError {
                kind: "proficiency level",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MathCriteria {
    pub number_sense: bool,
    pub logic_reasoning: bool,
    pub operations: bool,
    pub geometry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentCriteria {
    pub fluency: ProficiencyLevel,
    pub decoding: ProficiencyLevel,
    pub comprehension: ProficiencyLevel,
    pub math: Option<MathCriteria>,
}

impl AssessmentCriteria {
    /// Rubric for an assessment: the three reading levels come together or not
    /// at all. Math criteria are only kept when at least one skill was checked.
    pub fn from_parts(
        fluency: Option<ProficiencyLevel>,
        decoding: Option<ProficiencyLevel>,
        comprehension: Option<ProficiencyLevel>,
        math: MathCriteria,
    ) -> anyhow::Result<Option<Self>> {
        let math = (math != MathCriteria::default()).then_some(math);
        match (fluency, decoding, comprehension) {
            (Some(fluency), Some(decoding), Some(comprehension)) => Ok(Some(AssessmentCriteria {
                fluency,
                decoding,
                comprehension,
                math,
            })),
            (None, None, None) => {
                anyhow::ensure!(
                    math.is_none(),
                    "math criteria need the fluency, decoding and comprehension levels"
                );
                Ok(None)
            }
            _ => anyhow::bail!("fluency, decoding and comprehension levels must be given together"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAssessment {
    pub student_id: Uuid,
    pub date: NaiveDate,
    pub text_title: String,
    pub wpm: i32,
    pub accuracy: i32,
    pub comprehension: i32,
    pub math_score: Option<i32>,
    pub criteria: Option<AssessmentCriteria>,
    pub notes: String,
}

#[derive(Debug, Clone)]
pub struct Assessment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub date: NaiveDate,
    pub text_title: String,
    pub wpm: i32,
    pub accuracy: i32,
    pub comprehension: i32,
    pub math_score: Option<i32>,
    pub criteria: Option<AssessmentCriteria>,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompetencyCategory {
    Leitura,
    Matematica,
    Socioemocional,
    Geral,
}

impl CompetencyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompetencyCategory::Leitura => "Leitura",
            CompetencyCategory::Matematica => "Matemática",
            CompetencyCategory::Socioemocional => "Socioemocional",
            CompetencyCategory::Geral => "Geral",
        }
    }
}

impl fmt::Display for CompetencyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompetencyCategory {
    type Err = ParseLabelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match fold_label(value).as_str() {
            "leitura" => Ok(CompetencyCategory::Leitura),
            "matematica" => Ok(CompetencyCategory::Matematica),
            "socioemocional" => Ok(CompetencyCategory::Socioemocional),
            "geral" => Ok(CompetencyCategory::Geral),
            _ => Err(ParseLabelError {
                kind: "competency category",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Competency {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub category: CompetencyCategory,
    pub weight: i32,
}

#[derive(Debug, Clone)]
pub struct AssessmentSummary {
    pub count: usize,
    pub avg_wpm: f64,
    pub avg_accuracy: f64,
    pub avg_comprehension: f64,
    pub avg_math_score: Option<f64>,
    pub latest_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct ClassSummary {
    pub class_name: String,
    pub enrolled_count: usize,
    pub closed_count: usize,
    pub closed_days: i64,
}

#[derive(Debug, Clone)]
pub struct EnrolledStudent {
    pub student_name: String,
    pub class_name: String,
    pub entry_level: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub days_so_far: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn absent_or_false_flag_is_not_enrolled() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(
            Enrollment::from_columns(None, Some(start), Some("Básico".to_string())),
            Enrollment::NotEnrolled
        );
        assert_eq!(
            Enrollment::from_columns(Some(false), Some(start), None),
            Enrollment::NotEnrolled
        );
        assert!(Enrollment::from_columns(Some(true), None, None).is_enrolled());
    }

    #[test]
    fn close_clamps_inverted_dates() {
        let entry = Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap();
        let exit = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let record = RemedialRecord::close(entry, None, exit, "Básico");
        assert_eq!(record.duration_days, 0);
    }

    #[test]
    fn close_floors_partial_days() {
        let entry = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let exit = Utc.with_ymd_and_hms(2024, 5, 3, 7, 59, 0).unwrap();
        let record = RemedialRecord::close(entry, Some("Iniciante".to_string()), exit, "Básico");
        assert_eq!(record.duration_days, 1);
    }

    #[test]
    fn patch_without_history_keeps_existing_records() {
        let entry = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let exit = Utc.with_ymd_and_hms(2024, 1, 11, 0, 0, 0).unwrap();
        let mut student = Student {
            id: Uuid::new_v4(),
            name: "Alice Silva".to_string(),
            class_id: Uuid::new_v4(),
            reading_level: "Básico".to_string(),
            enrollment: Enrollment::NotEnrolled,
            remedial_history: vec![RemedialRecord::close(entry, None, exit, "Básico")],
        };
        let patch = StudentRemedialPatch {
            enrollment: Enrollment::open(exit, "Básico"),
            remedial_history: None,
        };
        patch.apply_to(&mut student);
        assert!(student.enrollment.is_enrolled());
        assert_eq!(student.remedial_history.len(), 1);
    }

    #[test]
    fn remedial_record_uses_camel_case_keys() {
        let record = RemedialRecord::close(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Some("Iniciante".to_string()),
            Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap(),
            "Básico",
        );

        let value = serde_json::to_value(&record).unwrap();
        let object = value.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["durationDays", "entryDate", "entryLevel", "exitDate", "exitLevel"]
        );
        assert_eq!(object["durationDays"], 14i64);
        assert_eq!(object["entryLevel"], "Iniciante");

        let back: RemedialRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn legacy_record_with_null_entry_level_deserializes() {
        let raw = r#"{
            "entryDate": "2024-05-01T00:00:00Z",
            "entryLevel": null,
            "exitDate": "2024-05-15T00:00:00Z",
            "exitLevel": "Básico",
            "durationDays": 14
        }"#;

        let record: RemedialRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.entry_level, None);
        assert_eq!(record.duration_days, 14);
    }

    fn enrolled_student(started_at: DateTime<Utc>) -> Student {
        Student {
            id: Uuid::new_v4(),
            name: "Carla Dias".to_string(),
            class_id: Uuid::new_v4(),
            reading_level: "Iniciante".to_string(),
            enrollment: Enrollment::open(started_at, "Iniciante"),
            remedial_history: Vec::new(),
        }
    }

    #[test]
    fn snapshot_rejects_row_that_exited_and_reentered() {
        let stale = enrolled_student(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let mut current = stale.clone();
        current.remedial_history.push(RemedialRecord::close(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Some("Iniciante".to_string()),
            Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap(),
            "Básico",
        ));
        current.enrollment = Enrollment::open(
            Utc.with_ymd_and_hms(2024, 5, 12, 0, 0, 0).unwrap(),
            "Básico",
        );

        let snapshot = RemedialSnapshot::of(&stale);
        assert!(snapshot.matches(&stale));
        assert!(current.enrollment.is_enrolled());
        assert!(!snapshot.matches(&current));
    }

    #[test]
    fn snapshot_rejects_reentry_with_same_history_length() {
        let stale = enrolled_student(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let current = enrolled_student(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());

        assert!(!RemedialSnapshot::of(&stale).matches(&current));
    }

    #[test]
    fn proficiency_levels_parse_with_or_without_accents() {
        assert_eq!("Básico".parse::<ProficiencyLevel>().unwrap(), ProficiencyLevel::Basico);
        assert_eq!("avancado".parse::<ProficiencyLevel>().unwrap(), ProficiencyLevel::Avancado);
        assert_eq!(" ADEQUADO ".parse::<ProficiencyLevel>().unwrap(), ProficiencyLevel::Adequado);
        assert!("Fluente".parse::<ProficiencyLevel>().is_err());
        assert_eq!(
            serde_json::to_string(&ProficiencyLevel::Avancado).unwrap(),
            "\"Avançado\""
        );
    }

    #[test]
    fn competency_categories_parse() {
        assert_eq!(
            "Matemática".parse::<CompetencyCategory>().unwrap(),
            CompetencyCategory::Matematica
        );
        assert_eq!(
            "socioemocional".parse::<CompetencyCategory>().unwrap().as_str(),
            "Socioemocional"
        );
        assert!("Artes".parse::<CompetencyCategory>().is_err());
    }

    #[test]
    fn criteria_require_all_reading_levels() {
        let math = MathCriteria {
            operations: true,
            ..MathCriteria::default()
        };

        let full = AssessmentCriteria::from_parts(
            Some(ProficiencyLevel::Basico),
            Some(ProficiencyLevel::Insuficiente),
            Some(ProficiencyLevel::Adequado),
            math,
        )
        .unwrap()
        .unwrap();
        assert_eq!(full.math, Some(math));

        let reading_only = AssessmentCriteria::from_parts(
            Some(ProficiencyLevel::Basico),
            Some(ProficiencyLevel::Basico),
            Some(ProficiencyLevel::Basico),
            MathCriteria::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(reading_only.math, None);

        assert!(AssessmentCriteria::from_parts(None, None, None, MathCriteria::default())
            .unwrap()
            .is_none());
        assert!(AssessmentCriteria::from_parts(
            Some(ProficiencyLevel::Basico),
            None,
            None,
            MathCriteria::default()
        )
        .is_err());
        assert!(AssessmentCriteria::from_parts(None, None, None, math).is_err());
    }
}
