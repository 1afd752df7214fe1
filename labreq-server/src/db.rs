//! SQLite persistence for requests, staff accounts, and the test catalog.
//!
//! States are stored with explicit relational columns; the two list-valued
//! columns (`selected_tests`, `available_tests`) hold JSON text arrays, which
//! is the closest SQLite gets to the original array columns.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::lifecycle::draft::{RequestDraft, RequestPatch};
use crate::lifecycle::state::{Priority, RequestStatus};
use crate::model::{ChatId, Request, RequestId, Role, StaffCode, TestCategory, User};
use crate::store::{apply_patch, CasOutcome, LinkOutcome, NewUser};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

/// SQLite database handle.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
/// Callers should wrap operations in `tokio::task::spawn_blocking` for async
/// compatibility; `SqliteRepository` does exactly that.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Open or create the database file at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }

        // Future migrations go here.

        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                first_name TEXT NOT NULL,
                surname TEXT NOT NULL,
                middle_name TEXT NOT NULL DEFAULT '',
                dob TEXT NOT NULL,
                gender TEXT NOT NULL,
                phone TEXT NOT NULL,
                email TEXT NOT NULL,
                location TEXT NOT NULL,
                selected_tests TEXT NOT NULL,
                doctor_code TEXT,
                assign_to TEXT NOT NULL,
                priority TEXT NOT NULL CHECK(priority IN ('Routine', 'Urgent')),
                collection_date TEXT NOT NULL,
                collection_time TEXT NOT NULL,
                request_status TEXT NOT NULL CHECK(request_status IN (
                    'pending', 'in-progress', 'completed', 'cancelled'
                )),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_requests_assignee_status
            ON requests(assign_to, request_status);

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                contact TEXT NOT NULL,
                user_type TEXT NOT NULL CHECK(user_type IN (
                    'admin', 'doctor', 'phlebotomist'
                )),
                active INTEGER NOT NULL DEFAULT 1,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                chat_id INTEGER UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category_name TEXT NOT NULL UNIQUE,
                category_description TEXT NOT NULL DEFAULT '',
                available_tests TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        Ok(())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub fn insert_request(
        &self,
        draft: &RequestDraft,
        status: RequestStatus,
        now: DateTime<Utc>,
    ) -> Result<Request> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let selected_tests = serde_json::to_string(&draft.selected_tests)
            .context("Failed to encode selected tests")?;
        let timestamp = format_timestamp(now);

        conn.execute(
            r#"
            INSERT INTO requests (
                first_name, surname, middle_name, dob, gender, phone, email,
                location, selected_tests, doctor_code, assign_to, priority,
                collection_date, collection_time, request_status,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            rusqlite::params![
                &draft.first_name,
                &draft.surname,
                &draft.middle_name,
                draft.dob.format(DATE_FORMAT).to_string(),
                &draft.gender,
                &draft.phone,
                &draft.email,
                &draft.location,
                selected_tests,
                draft.doctor_code.as_ref().map(|c| c.0.as_str()),
                &draft.assign_to.0,
                draft.priority.as_str(),
                draft.collection_date.format(DATE_FORMAT).to_string(),
                draft.collection_time.format(TIME_FORMAT).to_string(),
                status.as_str(),
                &timestamp,
                &timestamp,
            ],
        )
        .context("Failed to insert request")?;

        let id = RequestId(conn.last_insert_rowid());
        Self::get_request_locked(&conn, id)?
            .ok_or_else(|| anyhow!("Inserted request {} not found", id))
    }

    pub fn get_request(&self, id: RequestId) -> Result<Option<Request>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        Self::get_request_locked(&conn, id)
    }

    fn get_request_locked(conn: &Connection, id: RequestId) -> Result<Option<Request>> {
        let mut stmt = conn
            .prepare(&format!("{} WHERE id = ?1", SELECT_REQUEST))
            .context("Failed to prepare request query")?;

        let result = stmt.query_row(rusqlite::params![id.0], request_row);

        match result {
            Ok(row) => Ok(Some(row_to_request(row)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get request"),
        }
    }

    pub fn list_requests(
        &self,
        assigned_to: Option<&StaffCode>,
        status: Option<RequestStatus>,
    ) -> Result<Vec<Request>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        // Both filters are optional; NULL parameters disable them.
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE (?1 IS NULL OR assign_to = ?1)
                   AND (?2 IS NULL OR request_status = ?2)
                 ORDER BY created_at DESC, id DESC",
                SELECT_REQUEST
            ))
            .context("Failed to prepare list query")?;

        let rows = stmt
            .query_map(
                rusqlite::params![
                    assigned_to.map(|c| c.0.as_str()),
                    status.map(|s| s.as_str()),
                ],
                request_row,
            )
            .context("Failed to query requests")?;

        let mut requests = Vec::new();
        for row_result in rows {
            let row = row_result.context("Failed to read request row")?;
            requests.push(row_to_request(row)?);
        }
        Ok(requests)
    }

    pub fn update_request_fields(
        &self,
        id: RequestId,
        patch: &RequestPatch,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Request>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        // Read-modify-write under the connection lock; apply_patch is shared
        // with the in-memory backend so the semantics cannot drift.
        let Some(mut request) = Self::get_request_locked(&conn, id)? else {
            return Ok(None);
        };
        apply_patch(&mut request, patch, updated_at);

        let selected_tests = serde_json::to_string(&request.selected_tests)
            .context("Failed to encode selected tests")?;

        conn.execute(
            r#"
            UPDATE requests SET
                first_name = ?1, surname = ?2, middle_name = ?3, dob = ?4,
                gender = ?5, phone = ?6, email = ?7, location = ?8,
                selected_tests = ?9, doctor_code = ?10, priority = ?11,
                collection_date = ?12, collection_time = ?13, updated_at = ?14
            WHERE id = ?15
            "#,
            rusqlite::params![
                &request.first_name,
                &request.surname,
                &request.middle_name,
                request.dob.format(DATE_FORMAT).to_string(),
                &request.gender,
                &request.phone,
                &request.email,
                &request.location,
                selected_tests,
                request.doctor_code.as_ref().map(|c| c.0.as_str()),
                request.priority.as_str(),
                request.collection_date.format(DATE_FORMAT).to_string(),
                request.collection_time.format(TIME_FORMAT).to_string(),
                format_timestamp(request.updated_at),
                id.0,
            ],
        )
        .context("Failed to update request fields")?;

        Ok(Some(request))
    }

    pub fn update_assignee(
        &self,
        id: RequestId,
        assignee: &StaffCode,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Request>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let rows = conn
            .execute(
                "UPDATE requests SET assign_to = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![&assignee.0, format_timestamp(updated_at), id.0],
            )
            .context("Failed to update assignee")?;

        if rows == 0 {
            return Ok(None);
        }
        Self::get_request_locked(&conn, id)
    }

    /// The guarded status write: applies only when the stored status still
    /// equals `expected`, so concurrent transitions from the same prior state
    /// cannot both succeed.
    pub fn compare_and_set_status(
        &self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let rows = conn
            .execute(
                r#"
                UPDATE requests SET request_status = ?1, updated_at = ?2
                WHERE id = ?3 AND request_status = ?4
                "#,
                rusqlite::params![
                    next.as_str(),
                    format_timestamp(updated_at),
                    id.0,
                    expected.as_str(),
                ],
            )
            .context("Failed to update request status")?;

        if rows == 0 {
            return match Self::get_request_locked(&conn, id)? {
                Some(_) => Ok(CasOutcome::Stale),
                None => Ok(CasOutcome::NotFound),
            };
        }

        match Self::get_request_locked(&conn, id)? {
            Some(request) => Ok(CasOutcome::Updated(request)),
            None => Ok(CasOutcome::NotFound),
        }
    }

    pub fn delete_request(&self, id: RequestId) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute("DELETE FROM requests WHERE id = ?1", rusqlite::params![id.0])
            .context("Failed to delete request")?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub fn insert_user(&self, new: &NewUser) -> Result<User> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let created_at = format_timestamp(Utc::now());

        conn.execute(
            r#"
            INSERT INTO users (code, name, email, contact, user_type, active, is_deleted, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, ?6)
            "#,
            rusqlite::params![
                &new.code.0,
                &new.name,
                &new.email,
                &new.contact,
                new.role.as_str(),
                &created_at,
            ],
        )
        .context("Failed to insert user")?;

        Self::find_user_locked(&conn, "code = ?1", rusqlite::params![&new.code.0])?
            .ok_or_else(|| anyhow!("Inserted user {} not found", new.code))
    }

    pub fn find_user_by_code(&self, code: &StaffCode) -> Result<Option<User>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        Self::find_user_locked(&conn, "code = ?1", rusqlite::params![&code.0])
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        Self::find_user_locked(&conn, "email = ?1", rusqlite::params![email])
    }

    pub fn find_user_by_chat(&self, chat_id: ChatId) -> Result<Option<User>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        Self::find_user_locked(&conn, "chat_id = ?1", rusqlite::params![chat_id.0])
    }

    fn find_user_locked(
        conn: &Connection,
        predicate: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<User>> {
        let mut stmt = conn
            .prepare(&format!("{} WHERE {}", SELECT_USER, predicate))
            .context("Failed to prepare user query")?;

        let result = stmt.query_row(params, user_row);

        match result {
            Ok(row) => Ok(Some(row_to_user(row)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get user"),
        }
    }

    pub fn link_chat_id(&self, code: &StaffCode, chat_id: ChatId) -> Result<LinkOutcome> {
        let conn = self.conn.lock().expect("mutex poisoned");

        // Claimed-identity exclusivity: the chat id may belong to at most one
        // account. The UNIQUE index backs this up; the explicit check gives a
        // clean outcome instead of a constraint error.
        let claimed_by: Option<String> = {
            let mut stmt = conn
                .prepare("SELECT code FROM users WHERE chat_id = ?1")
                .context("Failed to prepare claim query")?;
            match stmt.query_row(rusqlite::params![chat_id.0], |row| row.get(0)) {
                Ok(code) => Some(code),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e).context("Failed to check chat claim"),
            }
        };

        if let Some(owner) = claimed_by {
            if owner != code.0 {
                return Ok(LinkOutcome::ChatAlreadyClaimed);
            }
        }

        let rows = conn
            .execute(
                "UPDATE users SET chat_id = ?1 WHERE code = ?2",
                rusqlite::params![chat_id.0, &code.0],
            )
            .context("Failed to link chat id")?;

        if rows == 0 {
            return Ok(LinkOutcome::NotFound);
        }

        match Self::find_user_locked(&conn, "code = ?1", rusqlite::params![&code.0])? {
            Some(user) => Ok(LinkOutcome::Linked(user)),
            None => Ok(LinkOutcome::NotFound),
        }
    }

    pub fn set_user_active(&self, code: &StaffCode, active: bool) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute(
                "UPDATE users SET active = ?1 WHERE code = ?2",
                rusqlite::params![active, &code.0],
            )
            .context("Failed to update user active flag")?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Test catalog
    // =========================================================================

    pub fn upsert_test_category(&self, category: &TestCategory) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let available_tests = serde_json::to_string(&category.available_tests)
            .context("Failed to encode available tests")?;

        conn.execute(
            r#"
            INSERT INTO tests (category_name, category_description, available_tests)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (category_name)
            DO UPDATE SET
                category_description = excluded.category_description,
                available_tests = excluded.available_tests
            "#,
            rusqlite::params![
                &category.category_name,
                &category.category_description,
                available_tests,
            ],
        )
        .context("Failed to upsert test category")?;

        Ok(())
    }

    pub fn list_test_catalog(&self) -> Result<Vec<TestCategory>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let mut stmt = conn
            .prepare(
                "SELECT category_name, category_description, available_tests
                 FROM tests ORDER BY category_name ASC",
            )
            .context("Failed to prepare catalog query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to query test catalog")?;

        let mut catalog = Vec::new();
        for row_result in rows {
            let (category_name, category_description, tests_json) =
                row_result.context("Failed to read catalog row")?;
            let available_tests: Vec<String> = serde_json::from_str(&tests_json)
                .with_context(|| format!("Corrupt test list for category {}", category_name))?;
            catalog.push(TestCategory {
                category_name,
                category_description,
                available_tests,
            });
        }
        Ok(catalog)
    }
}

const SELECT_REQUEST: &str = r#"
    SELECT id, first_name, surname, middle_name, dob, gender, phone, email,
           location, selected_tests, doctor_code, assign_to, priority,
           collection_date, collection_time, request_status, created_at, updated_at
    FROM requests
"#;

const SELECT_USER: &str = r#"
    SELECT id, code, name, email, contact, user_type, active, is_deleted,
           chat_id, created_at
    FROM users
"#;

/// Intermediate struct for reading request rows.
struct RequestRow {
    id: i64,
    first_name: String,
    surname: String,
    middle_name: String,
    dob: String,
    gender: String,
    phone: String,
    email: String,
    location: String,
    selected_tests: String,
    doctor_code: Option<String>,
    assign_to: String,
    priority: String,
    collection_date: String,
    collection_time: String,
    request_status: String,
    created_at: String,
    updated_at: String,
}

fn request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRow> {
    Ok(RequestRow {
        id: row.get(0)?,
        first_name: row.get(1)?,
        surname: row.get(2)?,
        middle_name: row.get(3)?,
        dob: row.get(4)?,
        gender: row.get(5)?,
        phone: row.get(6)?,
        email: row.get(7)?,
        location: row.get(8)?,
        selected_tests: row.get(9)?,
        doctor_code: row.get(10)?,
        assign_to: row.get(11)?,
        priority: row.get(12)?,
        collection_date: row.get(13)?,
        collection_time: row.get(14)?,
        request_status: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn row_to_request(row: RequestRow) -> Result<Request> {
    let selected_tests: Vec<String> = serde_json::from_str(&row.selected_tests)
        .with_context(|| format!("Corrupt selected_tests for request {}", row.id))?;

    let status = RequestStatus::parse(&row.request_status)
        .ok_or_else(|| anyhow!("Unknown request_status: {}", row.request_status))?;
    let priority = Priority::parse(&row.priority)
        .ok_or_else(|| anyhow!("Unknown priority: {}", row.priority))?;

    Ok(Request {
        id: RequestId(row.id),
        first_name: row.first_name,
        surname: row.surname,
        middle_name: row.middle_name,
        dob: parse_date(&row.dob)?,
        gender: row.gender,
        phone: row.phone,
        email: row.email,
        location: row.location,
        selected_tests,
        doctor_code: row.doctor_code.map(StaffCode),
        assign_to: StaffCode(row.assign_to),
        priority,
        collection_date: parse_date(&row.collection_date)?,
        collection_time: parse_time(&row.collection_time)?,
        status,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}

/// Intermediate struct for reading user rows.
struct UserRow {
    id: i64,
    code: String,
    name: String,
    email: String,
    contact: String,
    user_type: String,
    active: bool,
    is_deleted: bool,
    chat_id: Option<i64>,
    created_at: String,
}

fn user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        contact: row.get(4)?,
        user_type: row.get(5)?,
        active: row.get(6)?,
        is_deleted: row.get(7)?,
        chat_id: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn row_to_user(row: UserRow) -> Result<User> {
    let role = Role::parse(&row.user_type)
        .ok_or_else(|| anyhow!("Unknown user_type: {}", row.user_type))?;

    Ok(User {
        id: row.id,
        code: StaffCode(row.code),
        name: row.name,
        email: row.email,
        contact: row.contact,
        role,
        active: row.active,
        deleted: row.is_deleted,
        chat_id: row.chat_id.map(ChatId),
        created_at: parse_timestamp(&row.created_at)?,
    })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp: {}", s))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).with_context(|| format!("Invalid date: {}", s))
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, TIME_FORMAT).with_context(|| format!("Invalid time: {}", s))
}
