use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{session_not_found, student_not_found, Store};
use crate::err::{Error, Result};
use crate::io::{read_io_file, write_io_file};
use crate::models::{today, ProfileUpdate, ProgrammeSelection, Session, SessionCounts, Student};

/// The whole data file. Older files carry a `selected_sessions` map keyed by student id;
/// it is folded into the per-session flags on load and never written back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    students: Vec<Student>,
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    programme_selections: Vec<ProgrammeSelection>,
    #[serde(default)]
    next_ids: NextIds,
    #[serde(default, skip_serializing)]
    selected_sessions: HashMap<String, Vec<serde_json::Value>>,
}

impl Document {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut doc: Document = serde_json::from_slice(bytes)?;
        doc.upgrade();
        Ok(doc)
    }

    fn upgrade(&mut self) {
        for student in &mut self.students {
            clear_blank(&mut student.school_name);
            clear_blank(&mut student.birth_date);
            clear_blank(&mut student.phone_number);
        }
        renumber_repeats(&mut self.students, &mut self.next_ids.students, "student", |s| {
            &mut s.id
        });

        let legacy = std::mem::take(&mut self.selected_sessions);
        for (student, ids) in legacy {
            let student_id = match student.parse::<i64>() {
                Ok(id) => id,
                Err(_) => {
                    log::warn!("Ignoring selection entry for malformed student id `{}`", student);
                    continue;
                }
            };
            let ids: HashSet<i64> = ids.iter().filter_map(legacy_id).collect();
            for session in self.sessions.iter_mut().filter(|s| s.student_id == student_id) {
                session.selected = ids.contains(&session.id);
            }
        }

        renumber_repeats(&mut self.sessions, &mut self.next_ids.sessions, "session", |s| {
            &mut s.id
        });
        renumber_repeats(
            &mut self.programme_selections,
            &mut self.next_ids.programme_selections,
            "programme selection",
            |p| &mut p.id,
        );

        let known: HashSet<i64> = self.students.iter().map(|s| s.id).collect();
        let before = self.sessions.len() + self.programme_selections.len();
        self.sessions.retain(|s| known.contains(&s.student_id));
        self.programme_selections
            .retain(|p| known.contains(&p.student_id));
        let dropped = before - self.sessions.len() - self.programme_selections.len();
        if dropped > 0 {
            log::warn!("Dropped {} records owned by missing students", dropped);
        }
    }

    fn student(&self, id: i64) -> Result<&Student> {
        self.students
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| student_not_found(id))
    }

    fn student_mut(&mut self, id: i64) -> Result<&mut Student> {
        self.students
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| student_not_found(id))
    }

    fn session_mut(&mut self, student_id: i64, session_id: i64) -> Result<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.student_id == student_id)
            .ok_or_else(|| session_not_found(student_id, session_id))
    }

    fn sessions_of(&self, student_id: i64) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| s.student_id == student_id)
            .cloned()
            .collect()
    }
}

fn clear_blank(field: &mut Option<String>) {
    if field.as_deref().map_or(false, |v| v.trim().is_empty()) {
        *field = None;
    }
}

fn legacy_id(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Id counters, so ids of deleted records are never handed out again.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NextIds {
    #[serde(default)]
    students: i64,
    #[serde(default)]
    sessions: i64,
    #[serde(default)]
    programme_selections: i64,
}

fn next_id<T>(counter: &mut i64, items: &[T], id: impl Fn(&T) -> i64) -> i64 {
    let next = (*counter).max(items.iter().map(id).max().unwrap_or(0) + 1);
    *counter = next + 1;
    next
}

/// Older files allocated ids from the collection length, so a delete followed by an
/// insert could repeat one. Later occurrences get fresh ids; the first keeps its own.
fn renumber_repeats<T>(
    items: &mut [T],
    counter: &mut i64,
    kind: &str,
    id: impl Fn(&mut T) -> &mut i64,
) {
    let highest = items.iter_mut().map(|item| *id(item)).max().unwrap_or(0);
    let mut next = (*counter).max(highest + 1);
    let mut seen = HashSet::new();
    for item in items.iter_mut() {
        let slot = id(item);
        if !seen.insert(*slot) {
            log::warn!("Renumbering repeated {} id {} to {}", kind, slot, next);
            *slot = next;
            next += 1;
        }
    }
    *counter = next;
}

/// Keeps the document in memory and rewrites the file on every change.
pub struct JsonStore {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl JsonStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match read_io_file(&path).await? {
            Some(bytes) => Document::parse(&bytes).map_err(|err| {
                Error::store(
                    "SerializationError",
                    format!("{} is not a valid data file: {}", path.display(), err),
                )
            })?,
            None => {
                log::info!("{} not found, creating an empty data file", path.display());
                let doc = Document::default();
                write_document(&path, &doc).await?;
                doc
            }
        };
        log::debug!(
            "Loaded {} students and {} sessions from {}",
            doc.students.len(),
            doc.sessions.len(),
            path.display()
        );
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Document) -> Result<T> + Send,
    {
        let doc = self.doc.lock().await;
        f(&doc)
    }

    /// Applies `f` to a copy of the document and swaps it in once the file is written.
    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Document) -> Result<T> + Send,
        T: Send,
    {
        let mut doc = self.doc.lock().await;
        let mut draft = doc.clone();
        let out = f(&mut draft)?;
        write_document(&self.path, &draft).await?;
        *doc = draft;
        Ok(out)
    }
}

async fn write_document(path: &Path, doc: &Document) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(doc)?;
    write_io_file(path, &bytes).await?;
    Ok(())
}

#[async_trait]
impl Store for JsonStore {
    fn backend_tag(&self) -> &'static str {
        "json"
    }

    async fn ping(&self) -> Result<()> {
        read_io_file(&self.path)
            .await?
            .ok_or_else(|| Error::store("IOError", format!("{} is missing", self.path.display())))?;
        Ok(())
    }

    async fn list_students(&self, archived: bool) -> Result<Vec<Student>> {
        self.read(|doc| {
            let mut students: Vec<Student> = doc
                .students
                .iter()
                .filter(|s| s.is_archived == archived)
                .cloned()
                .collect();
            if archived {
                students.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
            } else {
                students.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            }
            Ok(students)
        })
        .await
    }

    async fn student(&self, id: i64) -> Result<Student> {
        self.read(|doc| doc.student(id).cloned()).await
    }

    async fn create_student(&self, name: &str) -> Result<Student> {
        self.mutate(|doc| {
            let student = Student {
                id: next_id(&mut doc.next_ids.students, &doc.students, |s| s.id),
                name: name.to_string(),
                school_name: None,
                birth_date: None,
                phone_number: None,
                is_archived: false,
                created_at: Utc::now(),
            };
            doc.students.push(student.clone());
            Ok(student)
        })
        .await
    }

    async fn set_archived(&self, id: i64, archived: bool) -> Result<Student> {
        self.mutate(|doc| {
            let student = doc.student_mut(id)?;
            student.is_archived = archived;
            Ok(student.clone())
        })
        .await
    }

    async fn update_profile(&self, id: i64, profile: &ProfileUpdate) -> Result<Student> {
        self.mutate(|doc| {
            let student = doc.student_mut(id)?;
            student.school_name = profile.school_name.clone();
            student.birth_date = profile.birth_date.clone();
            student.phone_number = profile.phone_number.clone();
            Ok(student.clone())
        })
        .await
    }

    async fn delete_student(&self, id: i64) -> Result<()> {
        self.mutate(|doc| {
            doc.student(id)?;
            doc.students.retain(|s| s.id != id);
            doc.sessions.retain(|s| s.student_id != id);
            doc.programme_selections.retain(|p| p.student_id != id);
            Ok(())
        })
        .await
    }

    async fn session_counts(&self, student_id: i64) -> Result<SessionCounts> {
        self.read(|doc| {
            doc.student(student_id)?;
            Ok(SessionCounts::of(&doc.sessions_of(student_id)))
        })
        .await
    }

    async fn session_counts_by_student(&self) -> Result<HashMap<i64, SessionCounts>> {
        self.read(|doc| {
            let mut counts: HashMap<i64, SessionCounts> = HashMap::new();
            for session in &doc.sessions {
                let entry = counts.entry(session.student_id).or_default();
                if session.selected {
                    entry.recorded_count += 1;
                } else {
                    entry.unrecorded_count += 1;
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn list_sessions(&self, student_id: i64) -> Result<Vec<Session>> {
        self.read(|doc| {
            doc.student(student_id)?;
            let mut sessions = doc.sessions_of(student_id);
            sessions.sort_by(|a, b| a.selected.cmp(&b.selected).then(b.id.cmp(&a.id)));
            Ok(sessions)
        })
        .await
    }

    async fn add_session(&self, student_id: i64, remark: Option<&str>) -> Result<Session> {
        self.mutate(|doc| {
            doc.student(student_id)?;
            let session = Session {
                id: next_id(&mut doc.next_ids.sessions, &doc.sessions, |s| s.id),
                student_id,
                remark: remark.map(str::to_string),
                date: today(),
                selected: false,
            };
            doc.sessions.push(session.clone());
            Ok(session)
        })
        .await
    }

    async fn update_remark(
        &self,
        student_id: i64,
        session_id: i64,
        remark: &str,
    ) -> Result<Session> {
        self.mutate(|doc| {
            let session = doc.session_mut(student_id, session_id)?;
            session.remark = Some(remark.to_string());
            Ok(session.clone())
        })
        .await
    }

    async fn delete_session(&self, student_id: i64, session_id: i64) -> Result<()> {
        self.mutate(|doc| {
            doc.session_mut(student_id, session_id)?;
            doc.sessions.retain(|s| s.id != session_id);
            Ok(())
        })
        .await
    }

    async fn replace_selected_sessions(&self, student_id: i64, ids: &[i64]) -> Result<()> {
        self.mutate(|doc| {
            doc.student(student_id)?;
            for session in doc.sessions.iter_mut().filter(|s| s.student_id == student_id) {
                session.selected = ids.contains(&session.id);
            }
            Ok(())
        })
        .await
    }

    async fn programme_selections(&self, student_id: i64) -> Result<Vec<String>> {
        self.read(|doc| {
            doc.student(student_id)?;
            Ok(doc
                .programme_selections
                .iter()
                .filter(|p| p.student_id == student_id)
                .map(|p| p.chapter_name.clone())
                .collect())
        })
        .await
    }

    async fn replace_programme_selections(
        &self,
        student_id: i64,
        chapters: &[String],
    ) -> Result<()> {
        self.mutate(|doc| {
            doc.student(student_id)?;
            doc.programme_selections
                .retain(|p| p.student_id != student_id);
            for chapter in chapters {
                let id = next_id(
                    &mut doc.next_ids.programme_selections,
                    &doc.programme_selections,
                    |p| p.id,
                );
                doc.programme_selections.push(ProgrammeSelection {
                    id,
                    student_id,
                    chapter_name: chapter.clone(),
                });
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> (tempfile::TempDir, JsonStore) {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("data.json")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn satisfies_store_contract() {
        let (_dir, store) = fresh().await;
        super::super::contract::run(&store).await;
    }

    #[tokio::test]
    async fn changes_survive_reopen() {
        let (dir, store) = fresh().await;
        let alice = store.create_student("Alice").await.unwrap();
        let intro = store.add_session(alice.id, Some("intro")).await.unwrap();
        store
            .replace_selected_sessions(alice.id, &[intro.id])
            .await
            .unwrap();
        drop(store);

        let reopened = JsonStore::open(dir.path().join("data.json")).await.unwrap();
        let sessions = reopened.list_sessions(alice.id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].selected);
        assert_eq!(sessions[0].remark.as_deref(), Some("intro"));
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_delete() {
        let (_dir, store) = fresh().await;
        let alice = store.create_student("Alice").await.unwrap();
        store.add_session(alice.id, Some("a")).await.unwrap();
        let last = store.add_session(alice.id, Some("b")).await.unwrap();
        store.delete_session(alice.id, last.id).await.unwrap();
        let next = store.add_session(alice.id, Some("c")).await.unwrap();
        assert!(next.id > last.id);

        store.delete_student(alice.id).await.unwrap();
        let bob = store.create_student("Bob").await.unwrap();
        assert!(bob.id > alice.id);
    }

    #[tokio::test]
    async fn loads_legacy_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            r#"{
                "students": [
                    {"id": 1, "name": "Alice", "phone_number": ""},
                    {"id": 2, "name": "Bob", "phone_number": "0600000000"}
                ],
                "sessions": [
                    {"id": 1, "student_id": 1, "remark": "intro", "date": "02.10.2023"},
                    {"id": 2, "student_id": 1, "remark": "limits", "date": "09.10.2023"},
                    {"id": 3, "student_id": 2, "remark": "logs", "date": "10.10.2023"},
                    {"id": 4, "student_id": 7, "remark": "orphan", "date": "10.10.2023"}
                ],
                "selected_sessions": {"1": ["2"], "2": [3]}
            }"#,
        )
        .unwrap();

        let store = JsonStore::open(&path).await.unwrap();
        let alice = store.student(1).await.unwrap();
        assert_eq!(alice.phone_number, None);
        assert_eq!(
            store.student(2).await.unwrap().phone_number.as_deref(),
            Some("0600000000")
        );

        let sessions = store.list_sessions(1).await.unwrap();
        assert_eq!(
            sessions
                .iter()
                .map(|s| (s.id, s.selected))
                .collect::<Vec<_>>(),
            vec![(1, false), (2, true)]
        );
        assert!(store.list_sessions(2).await.unwrap()[0].selected);

        // The next write drops the legacy map and the orphaned session.
        store.create_student("Cleo").await.unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("selected_sessions").is_none());
        assert_eq!(raw["sessions"].as_array().unwrap().len(), 3);
        assert_eq!(raw["sessions"][1]["selected"], true);
    }

    #[tokio::test]
    async fn repeated_ids_get_fresh_ones_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            r#"{
                "students": [
                    {"id": 1, "name": "Alice"},
                    {"id": 1, "name": "Bob"}
                ],
                "sessions": [
                    {"id": 1, "student_id": 1, "remark": "intro", "date": "02.10.2023"},
                    {"id": 2, "student_id": 1, "remark": "limits", "date": "09.10.2023"},
                    {"id": 2, "student_id": 1, "remark": "logs", "date": "16.10.2023"}
                ]
            }"#,
        )
        .unwrap();

        let store = JsonStore::open(&path).await.unwrap();
        assert_eq!(store.student(1).await.unwrap().name, "Alice");
        assert_eq!(store.student(2).await.unwrap().name, "Bob");

        let mut ids: Vec<i64> = store
            .list_sessions(1)
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);

        store.delete_session(1, 2).await.unwrap();
        let left = store.list_sessions(1).await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().any(|s| s.remark.as_deref() == Some("logs")));

        let next = store.add_session(1, Some("recap")).await.unwrap();
        assert_eq!(next.id, 4);
    }

    #[tokio::test]
    async fn corrupted_file_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, b"{\"students\": [").unwrap();

        assert!(matches!(
            JsonStore::open(&path).await,
            Err(Error::Store { .. })
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"students\": [");
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_untouched() {
        let (dir, store) = fresh().await;
        store.create_student("Alice").await.unwrap();

        // A directory squatting on the temp path makes the next write fail.
        std::fs::create_dir(dir.path().join("data.json.tmp")).unwrap();
        assert!(store.create_student("Bob").await.is_err());
        assert_eq!(store.list_students(false).await.unwrap().len(), 1);
    }
}
