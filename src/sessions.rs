//! Per-student session log.

use crate::err::{Error, Result};
use crate::models::{Session, SessionCounts};
use crate::store::Store;

/// Whether a session may be appended without a remark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemarkPolicy {
    #[default]
    Required,
    Optional,
}

impl RemarkPolicy {
    pub fn from_flag(allow_blank: bool) -> Self {
        if allow_blank {
            RemarkPolicy::Optional
        } else {
            RemarkPolicy::Required
        }
    }
}

pub async fn list(store: &dyn Store, student_id: i64) -> Result<Vec<Session>> {
    store.list_sessions(student_id).await
}

pub fn counts(sessions: &[Session]) -> SessionCounts {
    SessionCounts::of(sessions)
}

pub async fn append(
    store: &dyn Store,
    policy: RemarkPolicy,
    student_id: i64,
    remark: &str,
) -> Result<Session> {
    let remark = remark.trim();
    let remark = match (remark.is_empty(), policy) {
        (true, RemarkPolicy::Required) => {
            return Err(Error::validation("The remark cannot be empty"))
        }
        (true, RemarkPolicy::Optional) => None,
        (false, _) => Some(remark),
    };
    let session = store.add_session(student_id, remark).await?;
    log::info!("Added session {} for student {}", session.id, student_id);
    Ok(session)
}

pub async fn edit_remark(
    store: &dyn Store,
    student_id: i64,
    session_id: i64,
    remark: &str,
) -> Result<Session> {
    let remark = remark.trim();
    if remark.is_empty() {
        return Err(Error::validation("The remark cannot be empty"));
    }
    let session = store.update_remark(student_id, session_id, remark).await?;
    log::debug!("Edited remark of session {}", session_id);
    Ok(session)
}

pub async fn delete(store: &dyn Store, student_id: i64, session_id: i64) -> Result<()> {
    store.delete_session(student_id, session_id).await?;
    log::info!("Deleted session {} of student {}", session_id, student_id);
    Ok(())
}

/// Marks exactly `ids` as recorded; every other session of the student is cleared.
pub async fn save_selection(store: &dyn Store, student_id: i64, ids: &[i64]) -> Result<()> {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    store.replace_selected_sessions(student_id, &ids).await?;
    log::debug!("Student {} now has {} recorded sessions selected", student_id, ids.len());
    Ok(())
}

/// Parses the repeated `selected_sessions` form values.
pub fn parse_selection<'a, I>(values: I) -> Result<Vec<i64>>
where
    I: IntoIterator<Item = &'a str>,
{
    values
        .into_iter()
        .map(|raw| {
            raw.trim()
                .parse::<i64>()
                .map_err(|_| Error::invalid_payload(format!("`{}` is not a session id", raw)))
        })
        .collect()
}
