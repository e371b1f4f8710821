//! sqlite-adapter: SQLite implementation of the `UserRepository` port.
//!
//! Purpose
//! - Relational backend for the users data-access layer, file based so the
//!   system runs locally without any server.
//! - Filter translation lives in [`query`]; this module owns connections,
//!   transactions, routing, and row mapping.
//!
//! Notes
//! - Uses `rusqlite` with the `bundled` feature for portability and `hooks`
//!   for the progress handler that interrupts statements on cancellation.
//! - Stores timestamps as signed nanoseconds since UNIX_EPOCH (INTEGER).
//! - An optional read replica (opened read-only) serves reads unless the call
//!   forces the primary or runs inside a transaction.

pub mod query;

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use domain::validate::validate_options;
use domain::{
    CallContext, ListResult, RepoError, ResolvedFilter, ScopedOptions, User, UserDraft, UserId,
    UserPatch, UserRepository,
};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension,
};
use tracing::{debug, warn};

use crate::query::USER_COLUMNS;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest single lock wait before the call's token and deadline are polled.
const LOCK_POLL: Duration = Duration::from_millis(25);
/// VM instructions between cancellation polls.
const PROGRESS_OPS: i32 = 1_000;

/// SQLite-backed user repository.
pub struct SqliteRepo {
    path: PathBuf,
    primary: Mutex<Connection>,
    replica: Option<Mutex<Connection>>,
}

/// Caller-owned transaction on its own connection.
///
/// Opened with `BEGIN IMMEDIATE`, so it holds the write lock from the start
/// and rows it reads cannot change underneath it. Rolled back on drop unless
/// committed.
pub struct SqliteTx {
    conn: Mutex<Connection>,
    finished: bool,
}

#[derive(Clone, Copy)]
enum Route {
    Read,
    Write,
}

impl SqliteRepo {
    /// Open (or create) a SQLite database at the given path and ensure schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepoError> {
        let path = path.as_ref().to_path_buf();
        let conn = open(&path)?;
        init_schema(&conn)?;
        Ok(Self {
            path,
            primary: Mutex::new(conn),
            replica: None,
        })
    }

    /// Serve reads from a follower database, opened read-only.
    pub fn with_replica<P: AsRef<Path>>(mut self, replica_path: P) -> Result<Self, RepoError> {
        let conn = Connection::open_with_flags(
            replica_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(map_sqerr)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqerr)?;
        self.replica = Some(Mutex::new(conn));
        Ok(self)
    }

    /// Construct from env vars `DB_PATH` (defaults to `./data/users.db`) and
    /// the optional `DB_REPLICA_PATH`.
    pub fn from_env() -> Result<Self, RepoError> {
        let path = std::env::var("DB_PATH").unwrap_or_else(|_| "./data/users.db".to_string());
        ensure_parent_dir(Path::new(&path));
        let repo = Self::new(path)?;
        match std::env::var("DB_REPLICA_PATH") {
            Ok(replica) if !replica.is_empty() => repo.with_replica(replica),
            _ => Ok(repo),
        }
    }

    /// Start a transaction on a dedicated connection to the primary.
    pub fn begin(&self) -> Result<SqliteTx, RepoError> {
        if self.path.as_os_str() == ":memory:" {
            return Err(RepoError::Unsupported {
                backend: "sqlite",
                feature: "transactions on an in-memory database",
            });
        }
        let conn = open(&self.path)?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(map_sqerr)?;
        Ok(SqliteTx {
            conn: Mutex::new(conn),
            finished: false,
        })
    }

    /// Run `f` on the connection this call is routed to, with cancellation
    /// wired into the statement loop and into waits on another connection's
    /// lock. A busy attempt changed nothing, so `f` is retried until the lock
    /// frees up, the call is stopped, or `BUSY_TIMEOUT` runs out.
    fn run<T>(
        &self,
        ctx: &CallContext,
        opts: &ScopedOptions<'_, SqliteTx>,
        route: Route,
        mut f: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, RepoError> {
        ctx.check()?;
        validate_options(opts)?;
        let target = match (opts.tx, route, &self.replica) {
            (Some(tx), _, _) => &tx.conn,
            (None, Route::Read, Some(replica)) if !opts.force_primary => replica,
            _ => &self.primary,
        };
        let conn = target
            .lock()
            .map_err(|_| RepoError::storage("mutex poisoned"))?;
        let started = Instant::now();
        watch(&conn, ctx);
        let res = loop {
            if let Err(e) = conn.busy_timeout(lock_wait(ctx, started)) {
                break Err(e);
            }
            match f(&conn) {
                Err(e) if is_busy(&e) && started.elapsed() < BUSY_TIMEOUT => {
                    if ctx.check().is_err() {
                        break Err(e);
                    }
                    debug!(
                        waited_ms = started.elapsed().as_millis() as u64,
                        "database busy, retrying"
                    );
                }
                other => break other,
            }
        };
        conn.progress_handler(0, None::<fn() -> bool>);
        if let Err(e) = conn.busy_timeout(BUSY_TIMEOUT) {
            warn!(error = %e, "restoring busy timeout failed");
        }
        res.map_err(|e| map_call_err(ctx, e))
    }
}

impl SqliteTx {
    pub fn commit(mut self) -> Result<(), RepoError> {
        self.finish("COMMIT")
    }

    pub fn rollback(mut self) -> Result<(), RepoError> {
        self.finish("ROLLBACK")
    }

    fn finish(&mut self, sql: &str) -> Result<(), RepoError> {
        self.finished = true;
        let conn = self
            .conn
            .get_mut()
            .map_err(|_| RepoError::storage("mutex poisoned"))?;
        conn.execute_batch(sql).map_err(map_sqerr)
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(conn) = self.conn.get_mut() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "implicit rollback failed");
            }
        }
    }
}

/// Create the directory holding the database file. A failure is logged and
/// reported as `false`; opening the database then fails with the real error.
pub fn ensure_parent_dir(path: &Path) -> bool {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return true;
    };
    match std::fs::create_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "could not create database directory");
            false
        }
    }
}

fn open(path: &Path) -> Result<Connection, RepoError> {
    let conn = Connection::open(path).map_err(map_sqerr)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqerr)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), RepoError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            age INTEGER NOT NULL CHECK (age BETWEEN 0 AND 255),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_users_created_at ON users(created_at);
        CREATE INDEX IF NOT EXISTS idx_users_age ON users(age);
        "#,
    )
    .map_err(map_sqerr)
}

/// Abort the running statement once the token fires or the deadline passes.
fn watch(conn: &Connection, ctx: &CallContext) {
    let token = AssertUnwindSafe(ctx.token().clone());
    let deadline = ctx.deadline();
    conn.progress_handler(
        PROGRESS_OPS,
        Some(move || token.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d)),
    );
}

/// Next slice of lock waiting: at most `LOCK_POLL`, never past the deadline
/// or the overall `BUSY_TIMEOUT`.
fn lock_wait(ctx: &CallContext, started: Instant) -> Duration {
    let now = Instant::now();
    let mut wait = LOCK_POLL.min(BUSY_TIMEOUT.saturating_sub(now - started));
    if let Some(deadline) = ctx.deadline() {
        wait = wait.min(deadline.saturating_duration_since(now));
    }
    // Zero would disable the busy handler and fail without waiting.
    wait.max(Duration::from_millis(1))
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::DatabaseBusy)
}

fn map_sqerr(e: rusqlite::Error) -> RepoError {
    RepoError::storage(e)
}

/// A stopped call reports the cancellation, whatever the statement failed
/// with: interrupts from `watch` and busy locks given up on alike.
fn map_call_err(ctx: &CallContext, e: rusqlite::Error) -> RepoError {
    match ctx.check() {
        Err(stop) => stop,
        Ok(()) => map_sqerr(e),
    }
}

pub(crate) fn to_nanos(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|n| -n)
            .unwrap_or(i64::MIN),
    }
}

pub(crate) fn from_nanos(nanos: i64) -> SystemTime {
    let magnitude = Duration::from_nanos(nanos.unsigned_abs());
    if nanos >= 0 {
        UNIX_EPOCH + magnitude
    } else {
        UNIX_EPOCH - magnitude
    }
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId::new(row.get(0)?),
        name: row.get(1)?,
        age: row.get(2)?,
        created_at: from_nanos(row.get(3)?),
        updated_at: from_nanos(row.get(4)?),
    })
}

impl UserRepository for SqliteRepo {
    type Tx = SqliteTx;

    fn get_by_id(
        &self,
        ctx: &CallContext,
        id: UserId,
        opts: &ScopedOptions<'_, SqliteTx>,
    ) -> Result<Option<User>, RepoError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
        self.run(ctx, opts, Route::Read, |conn| {
            conn.query_row(&sql, params![id.get()], row_to_user).optional()
        })
    }

    fn get_all(
        &self,
        ctx: &CallContext,
        filter: &ResolvedFilter,
        opts: &ScopedOptions<'_, SqliteTx>,
    ) -> Result<ListResult<User>, RepoError> {
        let plan = query::translate(filter)?;
        debug!(predicate = plan.where_clause(), "sqlite get_all");
        self.run(ctx, opts, Route::Read, |conn| {
            let total: i64 =
                conn.query_row(&plan.count_sql(), params_from_iter(plan.params()), |r| r.get(0))?;
            let mut stmt = conn.prepare(&plan.select_sql())?;
            let items = stmt
                .query_map(params_from_iter(plan.page_params()), row_to_user)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ListResult::new(
                items,
                u64::try_from(total).unwrap_or_default(),
                filter.offset,
            ))
        })
    }

    fn create(
        &self,
        ctx: &CallContext,
        draft: &UserDraft,
        opts: &ScopedOptions<'_, SqliteTx>,
    ) -> Result<User, RepoError> {
        let id = self.run(ctx, opts, Route::Write, |conn| {
            conn.execute(
                "INSERT INTO users(name, age, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    draft.name,
                    draft.age,
                    to_nanos(draft.created_at),
                    to_nanos(draft.updated_at)
                ],
            )?;
            Ok(UserId::new(conn.last_insert_rowid()))
        })?;
        Ok(draft.clone().into_user(id))
    }

    fn update(
        &self,
        ctx: &CallContext,
        id: UserId,
        patch: &UserPatch,
        updated_at: SystemTime,
        opts: &ScopedOptions<'_, SqliteTx>,
    ) -> Result<(), RepoError> {
        let (sql, values) = query::update_statement(id, patch, updated_at);
        let changed = self.run(ctx, opts, Route::Write, |conn| {
            conn.execute(&sql, params_from_iter(values.iter()))
        })?;
        if changed == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    fn delete(
        &self,
        ctx: &CallContext,
        ids: &[UserId],
        opts: &ScopedOptions<'_, SqliteTx>,
    ) -> Result<u64, RepoError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let (sql, values) = query::delete_statement(ids);
        let removed = self.run(ctx, opts, Route::Write, |conn| {
            conn.execute(&sql, params_from_iter(values.iter()))
        })?;
        Ok(removed as u64)
    }
}
