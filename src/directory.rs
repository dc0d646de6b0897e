//! The student roster: creation, archiving, deletion and profile fields.

use crate::err::{Error, Result};
use crate::models::{ProfileUpdate, Student, StudentSummary};
use crate::store::Store;

pub const NAME_MAX: usize = 100;
pub const SCHOOL_NAME_MAX: usize = 150;
pub const BIRTH_DATE_MAX: usize = 10;
pub const PHONE_NUMBER_MAX: usize = 20;

/// Active students in creation order, each with its session counters.
pub async fn list_active(store: &dyn Store) -> Result<Vec<StudentSummary>> {
    let students = store.list_students(false).await?;
    let counts = store.session_counts_by_student().await?;
    Ok(students
        .into_iter()
        .map(|student| StudentSummary {
            counts: counts.get(&student.id).copied().unwrap_or_default(),
            student,
        })
        .collect())
}

pub async fn list_archived(store: &dyn Store) -> Result<Vec<Student>> {
    store.list_students(true).await
}

pub async fn get(store: &dyn Store, id: i64) -> Result<Student> {
    store.student(id).await
}

pub async fn create(store: &dyn Store, name: &str) -> Result<Student> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("Student name is required"));
    }
    check_length("Student name", name, NAME_MAX)?;
    let student = store.create_student(name).await?;
    log::info!("Created student {} ({})", student.id, student.name);
    Ok(student)
}

pub async fn archive(store: &dyn Store, id: i64) -> Result<Student> {
    let student = store.set_archived(id, true).await?;
    log::info!("Archived student {}", id);
    Ok(student)
}

pub async fn unarchive(store: &dyn Store, id: i64) -> Result<Student> {
    let student = store.set_archived(id, false).await?;
    log::info!("Restored student {}", id);
    Ok(student)
}

pub async fn delete(store: &dyn Store, id: i64) -> Result<()> {
    store.delete_student(id).await?;
    log::info!("Deleted student {} with its sessions and selections", id);
    Ok(())
}

/// Raw form values for the profile. Blank values clear the field.
#[derive(Debug, Clone, Default)]
pub struct ProfileForm<'a> {
    pub school_name: &'a str,
    pub birth_date: &'a str,
    pub phone_number: &'a str,
}

pub async fn update_profile(store: &dyn Store, id: i64, form: ProfileForm<'_>) -> Result<Student> {
    let profile = ProfileUpdate {
        school_name: optional("School name", form.school_name, SCHOOL_NAME_MAX)?,
        birth_date: optional("Birth date", form.birth_date, BIRTH_DATE_MAX)?,
        phone_number: optional("Phone number", form.phone_number, PHONE_NUMBER_MAX)?,
    };
    let student = store.update_profile(id, &profile).await?;
    log::debug!("Updated profile of student {}", id);
    Ok(student)
}

fn optional(field: &str, raw: &str, max: usize) -> Result<Option<String>> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    check_length(field, value, max)?;
    Ok(Some(value.to_string()))
}

pub(crate) fn check_length(field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(Error::validation(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(())
}
