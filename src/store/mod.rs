pub mod json;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Backend, Config};
use crate::err::Result;
use crate::models::{ProfileUpdate, Session, SessionCounts, Student};

pub use json::JsonStore;
pub use postgres::PgStore;

/// Durable storage for students, their sessions and curriculum selections.
///
/// Unknown ids yield `Error::NotFound`. A session or selection always belongs to an
/// existing student, and every method either commits all of its changes or none.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    fn backend_tag(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    /// Archived students are ordered by name, the others by creation time.
    async fn list_students(&self, archived: bool) -> Result<Vec<Student>>;
    async fn student(&self, id: i64) -> Result<Student>;
    async fn create_student(&self, name: &str) -> Result<Student>;
    async fn set_archived(&self, id: i64, archived: bool) -> Result<Student>;
    async fn update_profile(&self, id: i64, profile: &ProfileUpdate) -> Result<Student>;
    /// Removes the student together with its sessions and selections.
    async fn delete_student(&self, id: i64) -> Result<()>;

    async fn session_counts(&self, student_id: i64) -> Result<SessionCounts>;
    /// Counters of every student that has sessions, keyed by student id.
    async fn session_counts_by_student(&self) -> Result<HashMap<i64, SessionCounts>>;
    /// Unselected sessions first, newest first within each group.
    async fn list_sessions(&self, student_id: i64) -> Result<Vec<Session>>;
    async fn add_session(&self, student_id: i64, remark: Option<&str>) -> Result<Session>;
    async fn update_remark(&self, student_id: i64, session_id: i64, remark: &str)
        -> Result<Session>;
    async fn delete_session(&self, student_id: i64, session_id: i64) -> Result<()>;
    /// Marks exactly `ids` among the student's sessions as selected.
    async fn replace_selected_sessions(&self, student_id: i64, ids: &[i64]) -> Result<()>;

    async fn programme_selections(&self, student_id: i64) -> Result<Vec<String>>;
    async fn replace_programme_selections(&self, student_id: i64, chapters: &[String])
        -> Result<()>;
}

pub async fn open(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match &config.backend {
        Backend::Postgres { database_url } => Arc::new(PgStore::connect(database_url).await?),
        Backend::Json { path } => Arc::new(JsonStore::open(path).await?),
    };
    Ok(store)
}

pub(crate) fn student_not_found(id: i64) -> crate::err::Error {
    crate::err::Error::not_found(format!("Student {} does not exist", id))
}

pub(crate) fn session_not_found(student_id: i64, session_id: i64) -> crate::err::Error {
    crate::err::Error::not_found(format!(
        "Session {} does not exist for student {}",
        session_id, student_id
    ))
}
