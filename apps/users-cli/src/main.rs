//! users-cli: operator CLI over the users repository.
//!
//! Runs one repository operation per invocation against the backend chosen by
//! `STORAGE_PROVIDER` and prints the result as JSON on stdout.
//! - Storage: SQLite (default feature), in-memory, or DynamoDB when built with
//!   the `dynamo` feature.
//! - Timestamps in and out are RFC 3339.
//! - Ctrl-C cancels the in-flight call.
//!
//! Run:
//! ```bash
//! cargo run -p users-cli -- create --name ann --age 30
//! cargo run -p users-cli -- list --age-min 18 --order-by name --limit 10
//!
//! # with Dynamo adapter enabled
//! STORAGE_PROVIDER=dynamo DYNAMO_ENDPOINT_URL=http://localhost:8000 \
//!   cargo run -p users-cli --features dynamo -- get 1 --primary
//! ```
//!
//! Configuration: See `config.rs` for all environment variables.

mod config;

use std::process::ExitCode;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use domain::adapters::memory_repo::InMemoryRepo;
use domain::service::UserService;
use domain::{
    CallContext, Clock, FilterSpec, ListResult, NewUser, OrderBy, RepoError, ScopedOptions, User,
    UserId, UserPatch, UserRepository,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Config, LogFormat, StorageProvider};

#[derive(Debug, Parser)]
#[command(name = "users", version, about = "Query and modify stored users")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch one user; prints `null` when it does not exist
    Get {
        id: i64,
        /// Read from the primary instead of a replica
        #[arg(long)]
        primary: bool,
    },
    /// List users matching a filter, newest first by default
    List(ListArgs),
    /// Create a user
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        age: u8,
        /// Defaults to now
        #[arg(long, value_parser = parse_time)]
        created_at: Option<SystemTime>,
    },
    /// Apply a partial update, e.g. --patch '{"name":"X"}'
    Update {
        id: i64,
        #[arg(long)]
        patch: String,
    },
    /// Delete one or more users
    Delete {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    offset: Option<u64>,
    /// Page size; 0 or absent means the default of 30
    #[arg(long)]
    limit: Option<u32>,
    /// age, name or created_at
    #[arg(long, value_parser = parse_order)]
    order_by: Option<OrderBy>,
    /// Inclusive lower bound on creation time
    #[arg(long, value_parser = parse_time)]
    created_after: Option<SystemTime>,
    /// Inclusive upper bound on creation time
    #[arg(long, value_parser = parse_time)]
    created_before: Option<SystemTime>,
    #[arg(long)]
    age_min: Option<u8>,
    #[arg(long)]
    age_max: Option<u8>,
    /// Comma-separated ids
    #[arg(long, value_delimiter = ',')]
    ids: Vec<i64>,
    /// Read from the primary instead of a replica
    #[arg(long)]
    primary: bool,
}

impl ListArgs {
    fn to_spec(&self) -> FilterSpec {
        FilterSpec {
            offset: self.offset,
            limit: self.limit,
            order_by: self.order_by,
            created_at_gte: self.created_after,
            created_at_lte: self.created_before,
            age_gte: self.age_min,
            age_lte: self.age_max,
            ids: self.ids.iter().copied().map(UserId::new).collect(),
        }
    }
}

fn parse_time(s: &str) -> Result<SystemTime, String> {
    DateTime::parse_from_rfc3339(s)
        .map(SystemTime::from)
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

fn parse_order(s: &str) -> Result<OrderBy, String> {
    OrderBy::parse(s).ok_or_else(|| format!("unknown field '{s}' (expected age, name or created_at)"))
}

fn format_time(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

#[derive(Debug, Serialize)]
struct UserOut {
    id: i64,
    name: String,
    age: u8,
    created_at: String,
    updated_at: String,
}

impl From<&User> for UserOut {
    fn from(u: &User) -> Self {
        Self {
            id: u.id.get(),
            name: u.name.clone(),
            age: u.age,
            created_at: format_time(u.created_at),
            updated_at: format_time(u.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
struct ListOut {
    items: Vec<UserOut>,
    total: u64,
    has_more: bool,
}

impl From<&ListResult<User>> for ListOut {
    fn from(page: &ListResult<User>) -> Self {
        Self {
            items: page.items.iter().map(UserOut::from).collect(),
            total: page.total,
            has_more: page.has_more,
        }
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value, RepoError> {
    serde_json::to_value(value).map_err(RepoError::storage)
}

/// Run `command` against any backend; the result is what gets printed.
fn execute<R, C>(svc: &UserService<R, C>, ctx: &CallContext, command: Command) -> Result<Value, RepoError>
where
    R: UserRepository,
    C: Clock,
{
    match command {
        Command::Get { id, primary } => {
            let mut opts = ScopedOptions::new();
            opts.force_primary = primary;
            let user = svc.get_by_id(ctx, UserId::new(id), &opts)?;
            to_json(user.as_ref().map(UserOut::from))
        }
        Command::List(args) => {
            let mut opts = ScopedOptions::new();
            opts.force_primary = args.primary;
            let page = svc.get_all(ctx, &args.to_spec(), &opts)?;
            to_json(ListOut::from(&page))
        }
        Command::Create {
            name,
            age,
            created_at,
        } => {
            let mut input = NewUser::new(name, age);
            if let Some(at) = created_at {
                input = input.created_at(at);
            }
            let user = svc.create(ctx, input, &ScopedOptions::new())?;
            to_json(UserOut::from(&user))
        }
        Command::Update { id, patch } => {
            let patch = UserPatch::from_json(&patch)?;
            svc.update(ctx, UserId::new(id), &patch, &ScopedOptions::new())?;
            Ok(json!({ "updated": id }))
        }
        Command::Delete { ids } => {
            let ids: Vec<UserId> = ids.into_iter().map(UserId::new).collect();
            let removed = svc.delete(ctx, &ids, &ScopedOptions::new())?;
            Ok(json!({ "deleted": removed }))
        }
    }
}

// Construct the configured backend and run the command on it.
fn dispatch(cfg: &Config, ctx: &CallContext, command: Command) -> Result<Value, RepoError> {
    match cfg.storage_provider {
        StorageProvider::Memory => {
            execute(&UserService::new(InMemoryRepo::new(), domain::SystemClock), ctx, command)
        }
        #[cfg(feature = "sqlite")]
        StorageProvider::Sqlite => {
            sqlite_adapter::ensure_parent_dir(&cfg.db_path);
            let mut repo = sqlite_adapter::SqliteRepo::new(&cfg.db_path)?;
            if let Some(replica) = &cfg.db_replica_path {
                repo = repo.with_replica(replica)?;
            }
            execute(&UserService::new(repo, domain::SystemClock), ctx, command)
        }
        #[cfg(feature = "dynamo")]
        StorageProvider::Dynamo => {
            let tables = aws_dynamo::DynamoTables::new(
                cfg.dynamo_table_users.clone(),
                cfg.dynamo_table_counters.clone(),
            );
            let repo = aws_dynamo::DynamoRepo::new(tables, cfg.dynamo_endpoint_url.clone())?;
            execute(&UserService::new(repo, domain::SystemClock), ctx, command)
        }
        #[allow(unreachable_patterns)]
        other => Err(RepoError::Unsupported {
            backend: match other {
                StorageProvider::Sqlite => "sqlite",
                StorageProvider::Dynamo => "dynamo",
                StorageProvider::Memory => "memory",
            },
            feature: "this build (enable the matching cargo feature)",
        }),
    }
}

fn init_tracing(cfg: &Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the JSON result, so logs go to stderr.
    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
}

/// Cancel `token` on Ctrl-C. The watcher thread dies with the process.
fn cancel_on_interrupt(token: CancellationToken) {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "ctrl-c watcher unavailable");
                return;
            }
        };
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                token.cancel();
            }
        });
    });
}

fn exit_code(err: &RepoError) -> u8 {
    match err {
        RepoError::Validation(_) => 2,
        RepoError::NotFound => 3,
        RepoError::Cancelled | RepoError::DeadlineExceeded => 4,
        _ => 1,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&cfg);
    cfg.warn_if_ignored();
    info!(provider = ?cfg.storage_provider, "users-cli starting");

    let ctx = cfg.call_context();
    cancel_on_interrupt(ctx.token().clone());

    match dispatch(&cfg, &ctx, cli.command) {
        Ok(value) => {
            println!("{value:#}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::FixedClock;
    use std::time::{Duration, UNIX_EPOCH};

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_713_312_000)
    }

    fn svc() -> UserService<InMemoryRepo, FixedClock> {
        UserService::new(InMemoryRepo::new(), FixedClock(now()))
    }

    fn run(svc: &UserService<InMemoryRepo, FixedClock>, args: &[&str]) -> Result<Value, RepoError> {
        let cli = Cli::try_parse_from(std::iter::once("users").chain(args.iter().copied())).unwrap();
        execute(svc, &CallContext::new(), cli.command)
    }

    #[test]
    fn list_flags_build_filter() {
        let cli = Cli::try_parse_from([
            "users",
            "list",
            "--limit",
            "5",
            "--order-by",
            "age",
            "--created-after",
            "2024-04-01T00:00:00Z",
            "--age-min",
            "0",
            "--ids",
            "3,1",
        ])
        .unwrap();
        let Command::List(args) = cli.command else {
            panic!("expected list");
        };
        let spec = args.to_spec();
        assert_eq!(spec.limit, Some(5));
        assert_eq!(spec.order_by, Some(OrderBy::Age));
        assert_eq!(
            spec.created_at_gte,
            Some(UNIX_EPOCH + Duration::from_secs(1_711_929_600))
        );
        assert_eq!(spec.age_gte, Some(0));
        assert_eq!(spec.age_lte, None);
        assert_eq!(spec.ids, vec![UserId::new(3), UserId::new(1)]);
    }

    #[test]
    fn rejects_bad_flags() {
        assert!(Cli::try_parse_from(["users", "list", "--order-by", "email"]).is_err());
        assert!(Cli::try_parse_from(["users", "list", "--created-after", "yesterday"]).is_err());
        assert!(Cli::try_parse_from(["users", "delete"]).is_err());
    }

    #[test]
    fn rfc3339_offsets_normalize_to_utc() {
        let t = parse_time("2024-04-17T02:00:00+02:00").unwrap();
        assert_eq!(t, now());
        assert_eq!(format_time(t), "2024-04-17T00:00:00Z");
    }

    #[test]
    fn create_then_list_prints_json() {
        let svc = svc();
        let created = run(&svc, &["create", "--name", "ann", "--age", "30"]).unwrap();
        assert_eq!(created["id"], 1);
        assert_eq!(created["created_at"], "2024-04-17T00:00:00Z");

        let listed = run(&svc, &["list"]).unwrap();
        assert_eq!(listed["total"], 1);
        assert_eq!(listed["has_more"], false);
        assert_eq!(listed["items"][0]["name"], "ann");
    }

    #[test]
    fn get_missing_prints_null() {
        let svc = svc();
        assert_eq!(run(&svc, &["get", "9", "--primary"]).unwrap(), Value::Null);
    }

    #[test]
    fn update_and_delete() {
        let svc = svc();
        run(&svc, &["create", "--name", "ann", "--age", "30"]).unwrap();
        let updated = run(&svc, &["update", "1", "--patch", r#"{"age":31}"#]).unwrap();
        assert_eq!(updated["updated"], 1);
        assert_eq!(run(&svc, &["get", "1"]).unwrap()["age"], 31);

        let err = run(&svc, &["update", "1", "--patch", r#"{"email":"x"}"#]).unwrap_err();
        assert!(matches!(err, RepoError::Validation(_)));

        let deleted = run(&svc, &["delete", "1", "2"]).unwrap();
        assert_eq!(deleted["deleted"], 1);
    }

    #[test]
    fn exit_codes_by_error_kind() {
        assert_eq!(exit_code(&RepoError::NotFound), 3);
        assert_eq!(exit_code(&RepoError::Cancelled), 4);
        assert_eq!(exit_code(&RepoError::Validation("x".into())), 2);
        assert_eq!(exit_code(&RepoError::storage("disk")), 1);
    }
}
