use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use super::{session_not_found, student_not_found, Store};
use crate::err::{Error, Result};
use crate::models::{ProfileUpdate, Session, SessionCounts, Student};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS students (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(100) NOT NULL,
        school_name VARCHAR(150),
        birth_date VARCHAR(10),
        phone_number VARCHAR(20),
        is_archived BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        id BIGSERIAL PRIMARY KEY,
        student_id BIGINT NOT NULL REFERENCES students (id) ON DELETE CASCADE,
        remark TEXT,
        date DATE NOT NULL DEFAULT CURRENT_DATE,
        selected BOOLEAN NOT NULL DEFAULT FALSE
    )",
    "CREATE TABLE IF NOT EXISTS selections_maths_2bac (
        id BIGSERIAL PRIMARY KEY,
        student_id BIGINT NOT NULL REFERENCES students (id) ON DELETE CASCADE,
        chapter_name VARCHAR(255) NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS sessions_student_id_idx ON sessions (student_id)",
    "CREATE INDEX IF NOT EXISTS selections_maths_2bac_student_id_idx
        ON selections_maths_2bac (student_id)",
];

/// Columns that tables created by the earlier Flask deployment declared narrower than
/// `SCHEMA`. Students come first so the referenced key is widened before its references.
const LEGACY_COLUMNS: &str = "SELECT table_name::text, column_name::text
    FROM information_schema.columns
    WHERE table_schema = current_schema()
      AND table_name IN ('students', 'sessions', 'selections_maths_2bac')
      AND ((column_name IN ('id', 'student_id') AND data_type = 'integer')
        OR (column_name = 'created_at' AND data_type = 'timestamp without time zone'))
    ORDER BY table_name <> 'students', table_name, column_name";

fn widen_column(table: &str, column: &str) -> String {
    if column == "created_at" {
        format!(
            "ALTER TABLE {} ALTER COLUMN created_at TYPE TIMESTAMPTZ USING created_at AT TIME ZONE 'UTC'",
            table
        )
    } else {
        format!("ALTER TABLE {} ALTER COLUMN {} TYPE BIGINT", table, column)
    }
}

const STUDENT_COLUMNS: &str =
    "id, name, school_name, birth_date, phone_number, is_archived, created_at";
const SESSION_COLUMNS: &str = "id, student_id, remark, date, selected";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    pub async fn create_tables(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        self.widen_legacy_columns().await
    }

    /// Brings `INTEGER` ids and zone-less `created_at` columns to the types the models
    /// decode. Stored timestamps are taken as UTC.
    async fn widen_legacy_columns(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let legacy = sqlx::query_as::<_, (String, String)>(LEGACY_COLUMNS)
            .fetch_all(&mut tx)
            .await?;
        for (table, column) in &legacy {
            log::warn!("Widening legacy column {}.{}", table, column);
            sqlx::query(&widen_column(table, column))
                .execute(&mut tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn ensure_student(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<()> {
        let found = sqlx::query_scalar::<_, i64>("SELECT id FROM students WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(tx)
            .await?;
        found.map(|_| ()).ok_or_else(|| student_not_found(id))
    }

    async fn exists(&self, id: i64) -> Result<()> {
        let found = sqlx::query_scalar::<_, i64>("SELECT id FROM students WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        found.map(|_| ()).ok_or_else(|| student_not_found(id))
    }
}

#[async_trait]
impl Store for PgStore {
    fn backend_tag(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn list_students(&self, archived: bool) -> Result<Vec<Student>> {
        let order = if archived { "name ASC, id ASC" } else { "created_at ASC, id ASC" };
        let students = sqlx::query_as::<_, Student>(&format!(
            "SELECT {} FROM students WHERE is_archived = $1 ORDER BY {}",
            STUDENT_COLUMNS, order
        ))
        .bind(archived)
        .fetch_all(&self.pool)
        .await?;
        Ok(students)
    }

    async fn student(&self, id: i64) -> Result<Student> {
        sqlx::query_as::<_, Student>(&format!(
            "SELECT {} FROM students WHERE id = $1",
            STUDENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| student_not_found(id))
    }

    async fn create_student(&self, name: &str) -> Result<Student> {
        let student = sqlx::query_as::<_, Student>(&format!(
            "INSERT INTO students (name, is_archived, created_at) VALUES ($1, FALSE, now())
             RETURNING {}",
            STUDENT_COLUMNS
        ))
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(student)
    }

    async fn set_archived(&self, id: i64, archived: bool) -> Result<Student> {
        sqlx::query_as::<_, Student>(&format!(
            "UPDATE students SET is_archived = $2 WHERE id = $1 RETURNING {}",
            STUDENT_COLUMNS
        ))
        .bind(id)
        .bind(archived)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| student_not_found(id))
    }

    async fn update_profile(&self, id: i64, profile: &ProfileUpdate) -> Result<Student> {
        sqlx::query_as::<_, Student>(&format!(
            "UPDATE students SET school_name = $2, birth_date = $3, phone_number = $4
             WHERE id = $1 RETURNING {}",
            STUDENT_COLUMNS
        ))
        .bind(id)
        .bind(&profile.school_name)
        .bind(&profile.birth_date)
        .bind(&profile.phone_number)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| student_not_found(id))
    }

    /// Children are removed explicitly: legacy foreign keys carry no `ON DELETE CASCADE`.
    async fn delete_student(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_student(&mut tx, id).await?;
        for statement in [
            "DELETE FROM sessions WHERE student_id = $1",
            "DELETE FROM selections_maths_2bac WHERE student_id = $1",
            "DELETE FROM students WHERE id = $1",
        ] {
            sqlx::query(statement).bind(id).execute(&mut tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn session_counts(&self, student_id: i64) -> Result<SessionCounts> {
        self.exists(student_id).await?;
        let (unrecorded_count, recorded_count) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*) FILTER (WHERE NOT selected), COUNT(*) FILTER (WHERE selected)
             FROM sessions WHERE student_id = $1",
        )
        .bind(student_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(SessionCounts {
            unrecorded_count,
            recorded_count,
        })
    }

    async fn session_counts_by_student(&self) -> Result<HashMap<i64, SessionCounts>> {
        let rows = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT student_id, COUNT(*) FILTER (WHERE NOT selected), COUNT(*) FILTER (WHERE selected)
             FROM sessions GROUP BY student_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(student_id, unrecorded_count, recorded_count)| {
                (
                    student_id,
                    SessionCounts {
                        unrecorded_count,
                        recorded_count,
                    },
                )
            })
            .collect())
    }

    async fn list_sessions(&self, student_id: i64) -> Result<Vec<Session>> {
        self.exists(student_id).await?;
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM sessions WHERE student_id = $1 ORDER BY selected ASC, id DESC",
            SESSION_COLUMNS
        ))
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn add_session(&self, student_id: i64, remark: Option<&str>) -> Result<Session> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_student(&mut tx, student_id).await?;
        let session = sqlx::query_as::<_, Session>(&format!(
            "INSERT INTO sessions (student_id, remark, date, selected)
             VALUES ($1, $2, CURRENT_DATE, FALSE) RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(student_id)
        .bind(remark)
        .fetch_one(&mut tx)
        .await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn update_remark(
        &self,
        student_id: i64,
        session_id: i64,
        remark: &str,
    ) -> Result<Session> {
        sqlx::query_as::<_, Session>(&format!(
            "UPDATE sessions SET remark = $3 WHERE id = $2 AND student_id = $1 RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(student_id)
        .bind(session_id)
        .bind(remark)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| session_not_found(student_id, session_id))
    }

    async fn delete_session(&self, student_id: i64, session_id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM sessions WHERE id = $2 AND student_id = $1")
            .bind(student_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() < 1 {
            return Err(session_not_found(student_id, session_id));
        }
        Ok(())
    }

    async fn replace_selected_sessions(&self, student_id: i64, ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_student(&mut tx, student_id).await?;
        sqlx::query("UPDATE sessions SET selected = (id = ANY($2)) WHERE student_id = $1")
            .bind(student_id)
            .bind(ids.to_vec())
            .execute(&mut tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn programme_selections(&self, student_id: i64) -> Result<Vec<String>> {
        self.exists(student_id).await?;
        let chapters = sqlx::query_scalar::<_, String>(
            "SELECT chapter_name FROM selections_maths_2bac WHERE student_id = $1 ORDER BY id",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chapters)
    }

    async fn replace_programme_selections(
        &self,
        student_id: i64,
        chapters: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_student(&mut tx, student_id).await?;
        sqlx::query("DELETE FROM selections_maths_2bac WHERE student_id = $1")
            .bind(student_id)
            .execute(&mut tx)
            .await?;
        for chapter in chapters {
            sqlx::query("INSERT INTO selections_maths_2bac (student_id, chapter_name) VALUES ($1, $2)")
                .bind(student_id)
                .bind(chapter)
                .execute(&mut tx)
                .await?;
        }
        tx.commit().await.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const DROP_TABLES: &str = "DROP TABLE IF EXISTS selections_maths_2bac, sessions, students";

    const FLASK_TABLES: &[&str] = &[
        "CREATE TABLE students (
            id SERIAL PRIMARY KEY,
            name VARCHAR(100) NOT NULL,
            school_name VARCHAR(150),
            birth_date VARCHAR(10),
            phone_number VARCHAR(20),
            is_archived BOOLEAN NOT NULL,
            created_at TIMESTAMP NOT NULL
        )",
        "CREATE TABLE sessions (
            id SERIAL PRIMARY KEY,
            student_id INTEGER NOT NULL REFERENCES students (id),
            remark TEXT,
            date DATE NOT NULL,
            selected BOOLEAN NOT NULL
        )",
        "CREATE TABLE selections_maths_2bac (
            id SERIAL PRIMARY KEY,
            student_id INTEGER NOT NULL REFERENCES students (id),
            chapter_name VARCHAR(255) NOT NULL
        )",
        "INSERT INTO students (name, is_archived, created_at)
            VALUES ('Alice', FALSE, '2023-10-02 08:00:00')",
        "INSERT INTO sessions (student_id, remark, date, selected)
            VALUES (1, 'intro', '2023-10-02', TRUE)",
        "INSERT INTO selections_maths_2bac (student_id, chapter_name)
            VALUES (1, 'Intégrale')",
    ];

    #[test]
    fn legacy_columns_widen_to_model_types() {
        assert_eq!(
            widen_column("sessions", "student_id"),
            "ALTER TABLE sessions ALTER COLUMN student_id TYPE BIGINT"
        );
        assert_eq!(
            widen_column("students", "created_at"),
            "ALTER TABLE students ALTER COLUMN created_at TYPE TIMESTAMPTZ \
             USING created_at AT TIME ZONE 'UTC'"
        );
    }

    async fn execute(url: &str, statements: &[&str]) {
        let pool = PgPoolOptions::new().max_connections(1).connect(url).await.unwrap();
        for statement in statements {
            sqlx::query(statement).execute(&pool).await.unwrap();
        }
        pool.close().await;
    }

    /// Runs only when `TEST_DATABASE_URL` points at a disposable database. Both
    /// scenarios share the tables, so they run in sequence.
    #[tokio::test]
    async fn upgrades_flask_tables_and_satisfies_store_contract() {
        let url = match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("TEST_DATABASE_URL not set, skipping postgres tests");
                return;
            }
        };

        execute(&url, &[DROP_TABLES]).await;
        execute(&url, FLASK_TABLES).await;
        let store = PgStore::connect(&url).await.unwrap();

        let students = store.list_students(false).await.unwrap();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].name, "Alice");
        assert_eq!(
            students[0].created_at,
            Utc.ymd(2023, 10, 2).and_hms(8, 0, 0)
        );
        let alice = students[0].id;
        assert!(store.list_sessions(alice).await.unwrap()[0].selected);
        assert_eq!(
            store.session_counts_by_student().await.unwrap()[&alice].recorded_count,
            1
        );

        let recap = store.add_session(alice, Some("recap")).await.unwrap();
        assert!(!recap.selected);
        let bob = store.create_student("Bob").await.unwrap();
        assert!(!bob.is_archived);

        store.delete_student(alice).await.unwrap();
        assert!(matches!(
            store.list_sessions(alice).await,
            Err(Error::NotFound { .. })
        ));
        store.pool.close().await;

        execute(&url, &[DROP_TABLES]).await;
        let store = PgStore::connect(&url).await.unwrap();
        super::super::contract::run(&store).await;
    }
}
