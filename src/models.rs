use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Student {
    pub id: i64,
    pub name: String,
    pub school_name: Option<String>,
    pub birth_date: Option<String>,
    pub phone_number: Option<String>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// A tutoring meeting. `selected` marks sessions already written into a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: i64,
    pub student_id: i64,
    pub remark: Option<String>,
    #[serde(default = "today", deserialize_with = "flexible_date")]
    pub date: NaiveDate,
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProgrammeSelection {
    pub id: i64,
    pub student_id: i64,
    pub chapter_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    pub unrecorded_count: i64,
    pub recorded_count: i64,
}

impl SessionCounts {
    pub fn of(sessions: &[Session]) -> Self {
        let recorded = sessions.iter().filter(|s| s.selected).count() as i64;
        Self {
            unrecorded_count: sessions.len() as i64 - recorded,
            recorded_count: recorded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentSummary {
    #[serde(flatten)]
    pub student: Student,
    #[serde(flatten)]
    pub counts: SessionCounts,
}

/// Normalized profile fields. `None` clears the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub school_name: Option<String>,
    pub birth_date: Option<String>,
    pub phone_number: Option<String>,
}

pub fn today() -> NaiveDate {
    Utc::now().naive_utc().date()
}

fn flexible_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_date(&raw).ok_or_else(|| serde::de::Error::custom(format!("unrecognized date `{}`", raw)))
}

/// Accepts ISO dates as well as the `dd.mm.yyyy` and timestamp forms of older data files.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d.%m.%Y"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|dt| dt.date()))
        .ok()
}
