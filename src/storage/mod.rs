pub mod models;

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::authz;
use crate::error::AlarmError;
use models::{
    Alarm, AlarmEvent, Group, Page, PagePermission, PagePermissionRow, Subject, User, VisiblePage,
};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T, AlarmError>>) -> Result<T, AlarmError> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(AlarmError::InternalFailure(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        ))),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS groups (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS group_memberships (
    user_id TEXT NOT NULL,
    group_id TEXT NOT NULL,
    PRIMARY KEY (user_id, group_id)
);
CREATE TABLE IF NOT EXISTS pages (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS page_permissions (
    page_id TEXT NOT NULL,
    subject_type TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    can_view INTEGER NOT NULL DEFAULT 0,
    can_edit INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (page_id, subject_type, subject_id)
);
CREATE TABLE IF NOT EXISTS alarms (
    id TEXT PRIMARY KEY,
    page_id TEXT NOT NULL,
    ticker TEXT NOT NULL,
    option TEXT NOT NULL,
    condition TEXT NOT NULL,
    created_by TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_triggered TEXT
);
CREATE TABLE IF NOT EXISTS alarm_events (
    id TEXT PRIMARY KEY,
    alarm_id TEXT NOT NULL,
    triggered_by TEXT NOT NULL,
    price REAL,
    triggered_at TEXT NOT NULL
);
";

// ─── Executor-generic reads ─────────────────────────────────────────────────
//
// These read the same row shapes whether run against the pool (ordinary
// reads) or against a `&mut Transaction` (the atomic authorize+mutate paths
// below) — writing the query once and letting the caller choose the
// executor is cheaper than hand-duplicating every SELECT per call site.

async fn fetch_page<'e, E>(exec: E, page_id: &str) -> Result<Page, AlarmError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Page>("SELECT * FROM pages WHERE id = ?")
        .bind(page_id)
        .fetch_optional(exec)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?
        .ok_or_else(|| AlarmError::not_found(format!("page {page_id}")))
}

async fn fetch_user<'e, E>(exec: E, user_id: &str) -> Result<User, AlarmError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(exec)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?
        .ok_or_else(|| AlarmError::not_found(format!("user {user_id}")))
}

async fn fetch_group<'e, E>(exec: E, group_id: &str) -> Result<Group, AlarmError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE id = ?")
        .bind(group_id)
        .fetch_optional(exec)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?
        .ok_or_else(|| AlarmError::not_found(format!("group {group_id}")))
}

async fn fetch_alarm<'e, E>(exec: E, alarm_id: &str) -> Result<Alarm, AlarmError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Alarm>("SELECT * FROM alarms WHERE id = ?")
        .bind(alarm_id)
        .fetch_optional(exec)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?
        .ok_or_else(|| AlarmError::not_found(format!("alarm {alarm_id}")))
}

async fn fetch_groups_of_user<'e, E>(exec: E, user_id: &str) -> Result<HashSet<String>, AlarmError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> = sqlx::query_as("SELECT group_id FROM group_memberships WHERE user_id = ?")
        .bind(user_id)
        .fetch_all(exec)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?;
    Ok(rows.into_iter().map(|(g,)| g).collect())
}

async fn fetch_group_members<'e, E>(exec: E, group_id: &str) -> Result<Vec<String>, AlarmError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> = sqlx::query_as("SELECT user_id FROM group_memberships WHERE group_id = ?")
        .bind(group_id)
        .fetch_all(exec)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?;
    Ok(rows.into_iter().map(|(u,)| u).collect())
}

async fn fetch_permissions<'e, E>(exec: E, page_id: &str) -> Result<Vec<PagePermission>, AlarmError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows: Vec<PagePermissionRow> = sqlx::query_as("SELECT * FROM page_permissions WHERE page_id = ?")
        .bind(page_id)
        .fetch_all(exec)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?;
    Ok(rows.into_iter().map(PagePermission::from).collect())
}

/// Owner ∪ direct user `can_view`/`can_edit` grants ∪ members of every
/// group granted `can_view`/`can_edit`, given `page`'s already-read
/// permission rows. Shared by the pool-based `users_with_view_access`
/// and the in-transaction before/after snapshots in `share_page`/
/// `unshare_page`.
async fn audience_in_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    page: &Page,
    perms: &[PagePermission],
) -> Result<HashSet<String>, AlarmError> {
    let mut audience = HashSet::new();
    audience.insert(page.owner_id.clone());
    for perm in perms {
        if !(perm.can_view || perm.can_edit) {
            continue;
        }
        match &perm.subject {
            Subject::User(uid) => {
                audience.insert(uid.clone());
            }
            Subject::Group(gid) => {
                for member in fetch_group_members(&mut **tx, gid).await? {
                    audience.insert(member);
                }
            }
        }
    }
    Ok(audience)
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(data_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("alarmd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn new_in_memory() -> anyhow::Result<Self> {
        // A real temp-file database rather than `:memory:` — sqlx's pool may
        // open more than one connection, and each `:memory:` connection gets
        // its own database, silently losing writes across connections.
        let dir = tempfile::tempdir()?;
        let store = Self::new(dir.path()).await?;
        // Leak the TempDir so it outlives the returned Store instead of
        // deleting the database out from under it at the end of this fn.
        std::mem::forget(dir);
        Ok(store)
    }

    async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
        for stmt in SCHEMA.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
        Ok(())
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'_, Sqlite>, AlarmError> {
        self.pool.begin().await.map_err(|e| AlarmError::InternalFailure(e.into()))
    }

    // ─── Users ──────────────────────────────────────────────────────────────

    pub async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, AlarmError> {
        let id = Self::new_id();
        let created_at = Self::now();
        let result = sqlx::query(
            "INSERT INTO users (id, username, password_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(username)
        .bind(password_hash)
        .bind(&created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(User {
                id,
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                created_at,
            }),
            Err(e) if is_unique_violation(&e) => {
                Err(AlarmError::conflict(format!("username already taken: {username}")))
            }
            Err(e) => Err(AlarmError::InternalFailure(e.into())),
        }
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<User, AlarmError> {
        with_timeout(async {
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AlarmError::InternalFailure(e.into()))?
                .ok_or_else(|| AlarmError::not_found(format!("user '{username}'")))
        })
        .await
    }

    pub async fn get_user(&self, id: &str) -> Result<User, AlarmError> {
        with_timeout(fetch_user(&self.pool, id)).await
    }

    // ─── Groups ─────────────────────────────────────────────────────────────

    pub async fn create_group(&self, name: &str, creator_id: &str) -> Result<Group, AlarmError> {
        let id = Self::new_id();
        let mut tx = self.begin().await?;

        let insert = sqlx::query("INSERT INTO groups (id, name) VALUES (?, ?)")
            .bind(&id)
            .bind(name)
            .execute(&mut *tx)
            .await;

        if let Err(e) = insert {
            if is_unique_violation(&e) {
                return Err(AlarmError::conflict(format!("group name already taken: {name}")));
            }
            return Err(AlarmError::InternalFailure(e.into()));
        }

        sqlx::query("INSERT INTO group_memberships (user_id, group_id) VALUES (?, ?)")
            .bind(creator_id)
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        tx.commit().await.map_err(|e| AlarmError::InternalFailure(e.into()))?;

        Ok(Group { id, name: name.to_string() })
    }

    pub async fn get_group(&self, id: &str) -> Result<Group, AlarmError> {
        fetch_group(&self.pool, id).await
    }

    /// Validates both ids against their own tables before inserting, so a
    /// bogus `group_id`/`user_id` surfaces as `NotFound` rather than
    /// silently creating a dangling membership row that later feeds
    /// `users_with_view_access`/authorization.
    pub async fn add_member(&self, group_id: &str, user_id: &str) -> Result<(), AlarmError> {
        let mut tx = self.begin().await?;
        fetch_group(&mut *tx, group_id).await?;
        fetch_user(&mut *tx, user_id).await?;

        let result = sqlx::query("INSERT INTO group_memberships (user_id, group_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(group_id)
            .execute(&mut *tx)
            .await;

        match result {
            Ok(_) => {
                tx.commit().await.map_err(|e| AlarmError::InternalFailure(e.into()))?;
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                Err(AlarmError::conflict(format!("{user_id} is already a member of {group_id}")))
            }
            Err(e) => Err(AlarmError::InternalFailure(e.into())),
        }
    }

    pub async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<(), AlarmError> {
        let result = sqlx::query("DELETE FROM group_memberships WHERE user_id = ? AND group_id = ?")
            .bind(user_id)
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(AlarmError::not_found(format!("{user_id} in group {group_id}")));
        }
        Ok(())
    }

    pub async fn list_groups_of_user(&self, user_id: &str) -> Result<HashSet<String>, AlarmError> {
        fetch_groups_of_user(&self.pool, user_id).await
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<String>, AlarmError> {
        fetch_group_members(&self.pool, group_id).await
    }

    // ─── Pages ──────────────────────────────────────────────────────────────

    pub async fn create_page(&self, name: &str, owner_id: &str) -> Result<Page, AlarmError> {
        let id = Self::new_id();
        let created_at = Self::now();
        sqlx::query("INSERT INTO pages (id, name, owner_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(name)
            .bind(owner_id)
            .bind(&created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        Ok(Page {
            id,
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            created_at,
        })
    }

    /// Every page in the database, regardless of ownership — used by the
    /// `admin list-pages` CLI, which bypasses the authorization layer
    /// entirely since it runs against the SQLite file directly, not a
    /// live session.
    pub async fn list_all_pages(&self) -> Result<Vec<Page>, AlarmError> {
        sqlx::query_as::<_, Page>("SELECT * FROM pages ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AlarmError::InternalFailure(e.into()))
    }

    pub async fn get_page(&self, page_id: &str) -> Result<Page, AlarmError> {
        fetch_page(&self.pool, page_id).await
    }

    /// The read used to build `initial_state`: every page this user can see,
    /// paired with `is_owner`/`can_edit`, resolved via [`crate::authz`] so the
    /// resolver stays the single source of truth for the view/edit verdict.
    pub async fn list_pages_visible_to(&self, user_id: &str) -> Result<Vec<VisiblePage>, AlarmError> {
        let owned: Vec<Page> = sqlx::query_as("SELECT * FROM pages WHERE owner_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        let mut visible: Vec<VisiblePage> = owned
            .into_iter()
            .map(|page| VisiblePage { page, is_owner: true, can_edit: true })
            .collect();
        let owned_ids: HashSet<String> = visible.iter().map(|v| v.page.id.clone()).collect();

        let groups = self.list_groups_of_user(user_id).await?;

        // Candidate pages: anywhere a permission row names this user directly
        // or one of their groups.
        let mut candidate_ids: HashSet<String> = sqlx::query_as::<_, (String,)>(
            "SELECT DISTINCT page_id FROM page_permissions WHERE subject_type = 'user' AND subject_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?
        .into_iter()
        .map(|(p,)| p)
        .collect();

        if !groups.is_empty() {
            let placeholders = groups.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT DISTINCT page_id FROM page_permissions WHERE subject_type = 'group' AND subject_id IN ({placeholders})"
            );
            let mut q = sqlx::query_as::<_, (String,)>(&sql);
            for g in &groups {
                q = q.bind(g);
            }
            let rows = q
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AlarmError::InternalFailure(e.into()))?;
            candidate_ids.extend(rows.into_iter().map(|(p,)| p));
        }

        for page_id in candidate_ids {
            if owned_ids.contains(&page_id) {
                continue;
            }
            let page = self.get_page(&page_id).await?;
            let perms = self.list_permissions(&page_id).await?;
            let verdict = authz::resolve(user_id, &page, &perms, &groups);
            if verdict.view {
                visible.push(VisiblePage { page, is_owner: false, can_edit: verdict.edit });
            }
        }

        Ok(visible)
    }

    /// Low-level upsert: validates the subject exists and isn't the page
    /// owner, then writes the row. Not used on the `share_page` dispatcher
    /// path (see [`Store::share_page`]), which needs the same validation
    /// plus the caller's authorization verdict inside a single transaction;
    /// kept here as the direct, spec-documented `upsert_permission` op for
    /// callers (and tests) that already hold a verified `share` grant.
    pub async fn upsert_permission(
        &self,
        page_id: &str,
        subject: &Subject,
        can_view: bool,
        can_edit: bool,
    ) -> Result<(), AlarmError> {
        let mut tx = self.begin().await?;

        let page = fetch_page(&mut *tx, page_id).await?;
        if let Subject::User(uid) = subject {
            if uid == &page.owner_id {
                return Err(AlarmError::conflict("cannot grant a permission row to the page owner"));
            }
        }
        match subject {
            Subject::User(uid) => {
                fetch_user(&mut *tx, uid).await?;
            }
            Subject::Group(gid) => {
                fetch_group(&mut *tx, gid).await?;
            }
        }

        sqlx::query(
            "INSERT INTO page_permissions (page_id, subject_type, subject_id, can_view, can_edit)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(page_id, subject_type, subject_id)
             DO UPDATE SET can_view = excluded.can_view, can_edit = excluded.can_edit",
        )
        .bind(page_id)
        .bind(subject.kind())
        .bind(subject.id())
        .bind(can_view)
        .bind(can_edit)
        .execute(&mut *tx)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        tx.commit().await.map_err(|e| AlarmError::InternalFailure(e.into()))
    }

    pub async fn delete_permission(&self, page_id: &str, subject: &Subject) -> Result<(), AlarmError> {
        let result = sqlx::query(
            "DELETE FROM page_permissions WHERE page_id = ? AND subject_type = ? AND subject_id = ?",
        )
        .bind(page_id)
        .bind(subject.kind())
        .bind(subject.id())
        .execute(&self.pool)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(AlarmError::not_found("permission row"));
        }
        Ok(())
    }

    pub async fn list_permissions(&self, page_id: &str) -> Result<Vec<PagePermission>, AlarmError> {
        fetch_permissions(&self.pool, page_id).await
    }

    /// Grants `subject` the given flags on `page_id`, atomically: the
    /// caller's `share` verdict, the subject validation, the audience
    /// snapshots, and the permission write all run on one transaction, so a
    /// concurrent revoke of the caller's own share right cannot land between
    /// the authorization read and the mutation. Returns the view-audience
    /// before and after the change, for the dispatcher's diff broadcast.
    pub async fn share_page(
        &self,
        page_id: &str,
        caller_id: &str,
        subject: &Subject,
        can_view: bool,
        can_edit: bool,
    ) -> Result<(HashSet<String>, HashSet<String>), AlarmError> {
        let mut tx = self.begin().await?;

        let page = fetch_page(&mut *tx, page_id).await?;
        let groups = fetch_groups_of_user(&mut *tx, caller_id).await?;
        let perms = fetch_permissions(&mut *tx, page_id).await?;
        let verdict = authz::resolve(caller_id, &page, &perms, &groups);
        if !verdict.share {
            return Err(AlarmError::not_authorized("only the owner may share a page"));
        }

        if let Subject::User(uid) = subject {
            if uid == &page.owner_id {
                return Err(AlarmError::conflict("cannot grant a permission row to the page owner"));
            }
        }
        match subject {
            Subject::User(uid) => {
                fetch_user(&mut *tx, uid).await?;
            }
            Subject::Group(gid) => {
                fetch_group(&mut *tx, gid).await?;
            }
        }

        let before = audience_in_tx(&mut tx, &page, &perms).await?;

        sqlx::query(
            "INSERT INTO page_permissions (page_id, subject_type, subject_id, can_view, can_edit)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(page_id, subject_type, subject_id)
             DO UPDATE SET can_view = excluded.can_view, can_edit = excluded.can_edit",
        )
        .bind(page_id)
        .bind(subject.kind())
        .bind(subject.id())
        .bind(can_view)
        .bind(can_edit)
        .execute(&mut *tx)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        let after_perms = fetch_permissions(&mut *tx, page_id).await?;
        let after = audience_in_tx(&mut tx, &page, &after_perms).await?;

        tx.commit().await.map_err(|e| AlarmError::InternalFailure(e.into()))?;
        Ok((before, after))
    }

    /// Revokes `subject`'s row on `page_id`, atomically with the caller's
    /// `share` verdict read — see [`Store::share_page`].
    pub async fn unshare_page(
        &self,
        page_id: &str,
        caller_id: &str,
        subject: &Subject,
    ) -> Result<(HashSet<String>, HashSet<String>), AlarmError> {
        let mut tx = self.begin().await?;

        let page = fetch_page(&mut *tx, page_id).await?;
        let groups = fetch_groups_of_user(&mut *tx, caller_id).await?;
        let perms = fetch_permissions(&mut *tx, page_id).await?;
        let verdict = authz::resolve(caller_id, &page, &perms, &groups);
        if !verdict.share {
            return Err(AlarmError::not_authorized("only the owner may unshare a page"));
        }

        let before = audience_in_tx(&mut tx, &page, &perms).await?;

        let result = sqlx::query(
            "DELETE FROM page_permissions WHERE page_id = ? AND subject_type = ? AND subject_id = ?",
        )
        .bind(page_id)
        .bind(subject.kind())
        .bind(subject.id())
        .execute(&mut *tx)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(AlarmError::not_found("permission row"));
        }

        let after_perms = fetch_permissions(&mut *tx, page_id).await?;
        let after = audience_in_tx(&mut tx, &page, &after_perms).await?;

        tx.commit().await.map_err(|e| AlarmError::InternalFailure(e.into()))?;
        Ok((before, after))
    }

    // ─── Alarms ─────────────────────────────────────────────────────────────

    /// Creates the alarm atomically with the `edit` verdict read for
    /// `created_by` on `page_id` — nothing can revoke that edit grant
    /// between the check and the insert.
    pub async fn create_alarm(
        &self,
        page_id: &str,
        ticker: &str,
        option: &str,
        condition: &str,
        created_by: &str,
    ) -> Result<Alarm, AlarmError> {
        let mut tx = self.begin().await?;

        let page = fetch_page(&mut *tx, page_id).await?;
        let groups = fetch_groups_of_user(&mut *tx, created_by).await?;
        let perms = fetch_permissions(&mut *tx, page_id).await?;
        let verdict = authz::resolve(created_by, &page, &perms, &groups);
        if !verdict.edit {
            return Err(AlarmError::not_authorized("edit required to create an alarm"));
        }

        let id = Self::new_id();
        let created_at = Self::now();
        sqlx::query(
            "INSERT INTO alarms (id, page_id, ticker, option, condition, created_by, active, created_at, last_triggered)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, NULL)",
        )
        .bind(&id)
        .bind(page_id)
        .bind(ticker)
        .bind(option)
        .bind(condition)
        .bind(created_by)
        .bind(&created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        tx.commit().await.map_err(|e| AlarmError::InternalFailure(e.into()))?;

        Ok(Alarm {
            id,
            page_id: page_id.to_string(),
            ticker: ticker.to_string(),
            option: option.to_string(),
            condition: condition.to_string(),
            created_by: created_by.to_string(),
            active: true,
            created_at,
            last_triggered: None,
        })
    }

    pub async fn get_alarm(&self, alarm_id: &str) -> Result<Alarm, AlarmError> {
        fetch_alarm(&self.pool, alarm_id).await
    }

    /// Patch semantics: only the `Some` fields are modified. An all-`None`
    /// patch is a no-op that still returns the current row. Atomic with the
    /// `edit` verdict read for `by_user_id` on the alarm's page.
    pub async fn update_alarm(
        &self,
        alarm_id: &str,
        by_user_id: &str,
        ticker: Option<&str>,
        option: Option<&str>,
        condition: Option<&str>,
        active: Option<bool>,
    ) -> Result<Alarm, AlarmError> {
        let mut tx = self.begin().await?;

        let current = fetch_alarm(&mut *tx, alarm_id).await?;
        let page = fetch_page(&mut *tx, &current.page_id).await?;
        let groups = fetch_groups_of_user(&mut *tx, by_user_id).await?;
        let perms = fetch_permissions(&mut *tx, &current.page_id).await?;
        let verdict = authz::resolve(by_user_id, &page, &perms, &groups);
        if !verdict.edit {
            return Err(AlarmError::not_authorized("edit required to update an alarm"));
        }

        let ticker = ticker.unwrap_or(&current.ticker);
        let option = option.unwrap_or(&current.option);
        let condition = condition.unwrap_or(&current.condition);
        let active = active.unwrap_or(current.active);

        sqlx::query("UPDATE alarms SET ticker = ?, option = ?, condition = ?, active = ? WHERE id = ?")
            .bind(ticker)
            .bind(option)
            .bind(condition)
            .bind(active)
            .bind(alarm_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        tx.commit().await.map_err(|e| AlarmError::InternalFailure(e.into()))?;

        Ok(Alarm {
            id: alarm_id.to_string(),
            page_id: current.page_id,
            ticker: ticker.to_string(),
            option: option.to_string(),
            condition: condition.to_string(),
            created_by: current.created_by,
            active,
            created_at: current.created_at,
            last_triggered: current.last_triggered,
        })
    }

    /// Deletes the alarm and returns its `page_id` so the caller can
    /// compute fan-out without a second round-trip. Atomic with the `edit`
    /// verdict read for `by_user_id` on the alarm's page.
    pub async fn delete_alarm(&self, alarm_id: &str, by_user_id: &str) -> Result<String, AlarmError> {
        let mut tx = self.begin().await?;

        let alarm = fetch_alarm(&mut *tx, alarm_id).await?;
        let page = fetch_page(&mut *tx, &alarm.page_id).await?;
        let groups = fetch_groups_of_user(&mut *tx, by_user_id).await?;
        let perms = fetch_permissions(&mut *tx, &alarm.page_id).await?;
        let verdict = authz::resolve(by_user_id, &page, &perms, &groups);
        if !verdict.edit {
            return Err(AlarmError::not_authorized("edit required to delete an alarm"));
        }

        sqlx::query("DELETE FROM alarms WHERE id = ?")
            .bind(alarm_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        tx.commit().await.map_err(|e| AlarmError::InternalFailure(e.into()))?;
        Ok(alarm.page_id)
    }

    /// Atomic with the `view` verdict read for `by_user_id` on the alarm's
    /// page — triggering only requires `view`, so a revoke of even read
    /// access must not race a trigger.
    pub async fn trigger_alarm(
        &self,
        alarm_id: &str,
        by_user_id: &str,
        price: Option<f64>,
    ) -> Result<(Alarm, AlarmEvent), AlarmError> {
        let mut tx = self.begin().await?;

        let current = fetch_alarm(&mut *tx, alarm_id).await?;
        let page = fetch_page(&mut *tx, &current.page_id).await?;
        let groups = fetch_groups_of_user(&mut *tx, by_user_id).await?;
        let perms = fetch_permissions(&mut *tx, &current.page_id).await?;
        let verdict = authz::resolve(by_user_id, &page, &perms, &groups);
        if !verdict.view {
            return Err(AlarmError::not_authorized("view required to trigger an alarm"));
        }

        let triggered_at = Self::now();
        sqlx::query("UPDATE alarms SET last_triggered = ? WHERE id = ?")
            .bind(&triggered_at)
            .bind(alarm_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        let event_id = Self::new_id();
        sqlx::query(
            "INSERT INTO alarm_events (id, alarm_id, triggered_by, price, triggered_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event_id)
        .bind(alarm_id)
        .bind(by_user_id)
        .bind(price)
        .bind(&triggered_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AlarmError::InternalFailure(e.into()))?;

        tx.commit().await.map_err(|e| AlarmError::InternalFailure(e.into()))?;

        let alarm = Alarm {
            last_triggered: Some(triggered_at.clone()),
            ..current
        };
        let event = AlarmEvent {
            id: event_id,
            alarm_id: alarm_id.to_string(),
            triggered_by: by_user_id.to_string(),
            price,
            triggered_at,
        };
        Ok((alarm, event))
    }

    pub async fn list_alarms_in_pages(&self, page_ids: &HashSet<String>) -> Result<Vec<Alarm>, AlarmError> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = page_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT * FROM alarms WHERE page_id IN ({placeholders})");
        let mut q = sqlx::query_as::<_, Alarm>(&sql);
        for id in page_ids {
            q = q.bind(id);
        }
        q.fetch_all(&self.pool)
            .await
            .map_err(|e| AlarmError::InternalFailure(e.into()))
    }

    /// Owner ∪ direct user `can_view`/`can_edit` grants ∪ members of every
    /// group granted `can_view`/`can_edit` — edit implies view, per
    /// [`crate::authz`].
    pub async fn users_with_view_access(&self, page_id: &str) -> Result<HashSet<String>, AlarmError> {
        let page = fetch_page(&self.pool, page_id).await?;
        let perms = fetch_permissions(&self.pool, page_id).await?;

        let mut audience = HashSet::new();
        audience.insert(page.owner_id);

        for perm in &perms {
            if !(perm.can_view || perm.can_edit) {
                continue;
            }
            match &perm.subject {
                Subject::User(uid) => {
                    audience.insert(uid.clone());
                }
                Subject::Group(gid) => {
                    for member in fetch_group_members(&self.pool, gid).await? {
                        audience.insert(member);
                    }
                }
            }
        }

        Ok(audience)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_group_adds_creator_as_member() {
        let store = Store::new_in_memory().await.unwrap();
        let alice = store.create_user("alice", "hash").await.unwrap();
        let group = store.create_group("traders", &alice.id).await.unwrap();
        let members = store.group_members(&group.id).await.unwrap();
        assert_eq!(members, vec![alice.id]);
    }

    #[tokio::test]
    async fn duplicate_username_is_conflict() {
        let store = Store::new_in_memory().await.unwrap();
        store.create_user("alice", "hash").await.unwrap();
        let err = store.create_user("alice", "hash2").await.unwrap_err();
        assert!(matches!(err, AlarmError::Conflict(_)));
    }

    #[tokio::test]
    async fn owner_cannot_be_granted_a_permission_row() {
        let store = Store::new_in_memory().await.unwrap();
        let alice = store.create_user("alice", "hash").await.unwrap();
        let page = store.create_page("Trading", &alice.id).await.unwrap();
        let err = store
            .upsert_permission(&page.id, &Subject::User(alice.id.clone()), true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, AlarmError::Conflict(_)));
    }

    #[tokio::test]
    async fn upsert_permission_rejects_a_nonexistent_subject() {
        let store = Store::new_in_memory().await.unwrap();
        let alice = store.create_user("alice", "hash").await.unwrap();
        let page = store.create_page("Trading", &alice.id).await.unwrap();
        let err = store
            .upsert_permission(&page.id, &Subject::User("no-such-user".to_string()), true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AlarmError::NotFound(_)));

        let err = store
            .upsert_permission(&page.id, &Subject::Group("no-such-group".to_string()), true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AlarmError::NotFound(_)));
    }

    #[tokio::test]
    async fn add_member_rejects_a_nonexistent_group_or_user() {
        let store = Store::new_in_memory().await.unwrap();
        let alice = store.create_user("alice", "hash").await.unwrap();
        let group = store.create_group("traders", &alice.id).await.unwrap();

        let err = store.add_member(&group.id, "no-such-user").await.unwrap_err();
        assert!(matches!(err, AlarmError::NotFound(_)));

        let err = store.add_member("no-such-group", &alice.id).await.unwrap_err();
        assert!(matches!(err, AlarmError::NotFound(_)));
    }

    #[tokio::test]
    async fn users_with_view_access_includes_owner_and_group_members() {
        let store = Store::new_in_memory().await.unwrap();
        let alice = store.create_user("alice", "hash").await.unwrap();
        let bob = store.create_user("bob", "hash").await.unwrap();
        let page = store.create_page("Trading", &alice.id).await.unwrap();
        let group = store.create_group("traders", &alice.id).await.unwrap();
        store.add_member(&group.id, &bob.id).await.unwrap();
        store
            .upsert_permission(&page.id, &Subject::Group(group.id.clone()), true, false)
            .await
            .unwrap();

        let audience = store.users_with_view_access(&page.id).await.unwrap();
        assert!(audience.contains(&alice.id));
        assert!(audience.contains(&bob.id));
    }

    #[tokio::test]
    async fn delete_alarm_cascades_nothing_but_returns_page_id() {
        let store = Store::new_in_memory().await.unwrap();
        let alice = store.create_user("alice", "hash").await.unwrap();
        let page = store.create_page("Trading", &alice.id).await.unwrap();
        let alarm = store
            .create_alarm(&page.id, "EUR/USD", "spot", "above", &alice.id)
            .await
            .unwrap();
        let returned_page_id = store.delete_alarm(&alarm.id, &alice.id).await.unwrap();
        assert_eq!(returned_page_id, page.id);
        assert!(store.get_alarm(&alarm.id).await.is_err());
    }

    #[tokio::test]
    async fn update_alarm_with_an_empty_patch_is_a_no_op() {
        let store = Store::new_in_memory().await.unwrap();
        let alice = store.create_user("alice", "hash").await.unwrap();
        let page = store.create_page("Trading", &alice.id).await.unwrap();
        let alarm = store
            .create_alarm(&page.id, "EUR/USD", "spot", "above", &alice.id)
            .await
            .unwrap();

        let unchanged = store
            .update_alarm(&alarm.id, &alice.id, None, None, None, None)
            .await
            .unwrap();

        assert_eq!(unchanged.ticker, alarm.ticker);
        assert_eq!(unchanged.option, alarm.option);
        assert_eq!(unchanged.condition, alarm.condition);
        assert_eq!(unchanged.active, alarm.active);
    }

    #[tokio::test]
    async fn non_editor_cannot_create_an_alarm_even_with_view_access() {
        let store = Store::new_in_memory().await.unwrap();
        let alice = store.create_user("alice", "hash").await.unwrap();
        let bob = store.create_user("bob", "hash").await.unwrap();
        let page = store.create_page("Trading", &alice.id).await.unwrap();
        store
            .upsert_permission(&page.id, &Subject::User(bob.id.clone()), true, false)
            .await
            .unwrap();

        let err = store
            .create_alarm(&page.id, "EUR/USD", "spot", "above", &bob.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AlarmError::AuthorizationFailure(_)));
    }
}
