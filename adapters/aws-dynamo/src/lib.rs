//! DynamoDB adapter implementing the `UserRepository` port.
//!
//! - Stores users in the Users table with numeric primary key `id`.
//! - Ids come from a monotonic counter item (`name = "users"`) in the Counters
//!   table, so they stay sequential like an autoincrement column.
//! - Provides `from_env()` wiring using env vars `DYNAMO_TABLE_USERS`,
//!   `DYNAMO_TABLE_COUNTERS`, and `DYNAMO_ENDPOINT_URL` (for DynamoDB Local).
//!
//! Notes:
//! - The domain `UserRepository` trait is synchronous. We bridge to the async AWS
//!   SDK using an internal `tokio::runtime::Runtime` and `block_on`, racing every
//!   request against the call's cancellation token and deadline.
//! - `get_all` scans with a filter expression, then sorts and paginates in
//!   memory. There is no secondary index to order by.
//! - Transactions buffer writes and submit them as one `TransactWriteItems`
//!   call on commit. Row locks are not available.

pub mod query;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_sdk_dynamodb::error::BuildError;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, Delete, KeySchemaElement, KeyType, Put,
    ReturnValue, ScalarAttributeType, TransactWriteItem, Update,
};
use aws_sdk_dynamodb::Client;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use domain::filter::apply_page;
use domain::validate::validate_options;
use domain::{
    CallContext, ListResult, RepoError, ResolvedFilter, ScopedOptions, User, UserDraft, UserId,
    UserPatch, UserRepository,
};
use tracing::debug;

/// Largest number of writes one `TransactWriteItems` call accepts.
pub const MAX_TX_WRITES: usize = 100;

const COUNTER_KEY: &str = "users";

/// Configuration for DynamoDB table names.
#[derive(Clone, Debug)]
pub struct DynamoTables {
    pub users: String,
    pub counters: String,
}

impl DynamoTables {
    /// Create with explicit table names.
    pub fn new(users: impl Into<String>, counters: impl Into<String>) -> Self {
        Self {
            users: users.into(),
            counters: counters.into(),
        }
    }

    /// Build from `DYNAMO_TABLE_USERS` and `DYNAMO_TABLE_COUNTERS`, defaulting
    /// to `users` and `counters`.
    pub fn from_env() -> Self {
        let users = std::env::var("DYNAMO_TABLE_USERS").unwrap_or_else(|_| "users".into());
        let counters =
            std::env::var("DYNAMO_TABLE_COUNTERS").unwrap_or_else(|_| "counters".into());
        Self { users, counters }
    }
}

/// Repository backed by AWS DynamoDB.
///
/// Supports both standalone mode (creates its own Tokio runtime) and embedded
/// mode (reuses the existing runtime via `Handle::current()`).
#[derive(Clone)]
pub struct DynamoRepo {
    table_users: String,
    table_counters: String,
    client: Client,
    // Optional runtime - None when called from inside an existing runtime
    rt: Option<Arc<tokio::runtime::Runtime>>,
}

/// Buffered write transaction.
///
/// Reads bound to it are strongly consistent but see committed data only;
/// buffered writes become visible together when `DynamoRepo::commit` runs.
/// Each user can be written at most once per transaction, so a user created
/// in it cannot also be updated or deleted in it. Dropping it without
/// committing sends nothing.
#[derive(Debug, Default)]
pub struct DynamoTx {
    writes: Mutex<Buffer>,
}

#[derive(Debug, Default)]
struct Buffer {
    items: Vec<TransactWriteItem>,
    keys: HashSet<UserId>,
}

impl DynamoTx {
    pub fn len(&self) -> usize {
        self.writes.lock().map(|w| w.items.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail if `id` already has a buffered write.
    fn ensure_unwritten(&self, id: UserId) -> Result<(), RepoError> {
        let writes = self
            .writes
            .lock()
            .map_err(|_| RepoError::storage("mutex poisoned"))?;
        if writes.keys.contains(&id) {
            return Err(already_written(id));
        }
        Ok(())
    }

    fn push(&self, items: Vec<(UserId, TransactWriteItem)>) -> Result<(), RepoError> {
        let mut writes = self
            .writes
            .lock()
            .map_err(|_| RepoError::storage("mutex poisoned"))?;
        if writes.items.len() + items.len() > MAX_TX_WRITES {
            return Err(RepoError::Validation(format!(
                "a transaction holds at most {MAX_TX_WRITES} writes"
            )));
        }
        let mut seen = HashSet::new();
        if let Some((id, _)) = items
            .iter()
            .find(|(id, _)| writes.keys.contains(id) || !seen.insert(*id))
        {
            return Err(already_written(*id));
        }
        for (id, item) in items {
            writes.keys.insert(id);
            writes.items.push(item);
        }
        Ok(())
    }
}

fn already_written(id: UserId) -> RepoError {
    RepoError::Validation(format!("user {id} is already written in this transaction"))
}

impl DynamoRepo {
    /// Create a new repo from explicit table names and an AWS SDK client.
    ///
    /// If called from within a Tokio runtime, reuses the existing runtime.
    /// Otherwise creates a new runtime.
    pub fn with_client(tables: DynamoTables, client: Client) -> Result<Self, RepoError> {
        let rt = Self::maybe_create_runtime()?;
        Ok(Self {
            table_users: tables.users,
            table_counters: tables.counters,
            client,
            rt,
        })
    }

    /// Construct with table names and a default AWS SDK client using env/IMDS.
    /// `endpoint_url` points the client at DynamoDB Local or another stand-in.
    pub fn new(tables: DynamoTables, endpoint_url: Option<String>) -> Result<Self, RepoError> {
        let rt = Self::maybe_create_runtime()?;
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(url) = endpoint_url {
            loader = loader.endpoint_url(url);
        }
        let conf = Self::block_on_with_rt(&rt, loader.load());
        let client = Client::new(&conf);
        Ok(Self {
            table_users: tables.users,
            table_counters: tables.counters,
            client,
            rt,
        })
    }

    /// Construct from environment variables:
    /// - `DYNAMO_TABLE_USERS` (optional, defaults to "users")
    /// - `DYNAMO_TABLE_COUNTERS` (optional, defaults to "counters")
    /// - `DYNAMO_ENDPOINT_URL` (optional)
    pub fn from_env() -> Result<Self, RepoError> {
        let endpoint = std::env::var("DYNAMO_ENDPOINT_URL")
            .ok()
            .filter(|s| !s.is_empty());
        Self::new(DynamoTables::from_env(), endpoint)
    }

    /// Check if we're inside a Tokio runtime. If yes, return None (reuse existing).
    /// If no, create a new runtime.
    fn maybe_create_runtime() -> Result<Option<Arc<tokio::runtime::Runtime>>, RepoError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            Ok(None)
        } else {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .map_err(|e| RepoError::storage(format!("tokio runtime init: {e}")))?;
            Ok(Some(Arc::new(rt)))
        }
    }

    /// Run an async future, using either our owned runtime or the current runtime.
    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        Self::block_on_with_rt(&self.rt, fut)
    }

    fn block_on_with_rt<F: Future>(rt: &Option<Arc<tokio::runtime::Runtime>>, fut: F) -> F::Output {
        match rt {
            Some(rt) => rt.block_on(fut),
            None => {
                // Inside an existing runtime - use block_in_place + Handle::current()
                tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
            }
        }
    }

    /// Drive `fut` to completion unless the call is cancelled or runs out of
    /// time first. An abandoned request is dropped mid-flight.
    fn run<T>(
        &self,
        ctx: &CallContext,
        fut: impl Future<Output = Result<T, RepoError>>,
    ) -> Result<T, RepoError> {
        ctx.check()?;
        let token = ctx.token().clone();
        let deadline = ctx.deadline();
        self.block_on(async move {
            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(RepoError::Cancelled),
                _ = expiry => Err(RepoError::DeadlineExceeded),
                res = fut => res,
            }
        })
    }

    /// Atomically increment the id counter and return the new value.
    async fn next_user_id(&self) -> Result<UserId, RepoError> {
        let out = self
            .client
            .update_item()
            .table_name(&self.table_counters)
            .key("name", AttributeValue::S(COUNTER_KEY.into()))
            .update_expression("ADD #v :one")
            .expression_attribute_names("#v", "value")
            .expression_attribute_values(":one", AttributeValue::N("1".into()))
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await
            .map_err(map_sdk_err)?;
        let attrs = out
            .attributes()
            .ok_or_else(|| RepoError::storage("counter update returned no attributes"))?;
        let v = attrs
            .get("value")
            .and_then(|av| av.as_n().ok())
            .ok_or_else(|| RepoError::storage("counter missing value"))?;
        v.parse::<i64>()
            .map(UserId::new)
            .map_err(|e| RepoError::storage(format!("parse counter: {e}")))
    }

    async fn fetch(&self, id: UserId, consistent: bool) -> Result<Option<User>, RepoError> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table_users)
            .set_key(Some(key(id)))
            .consistent_read(consistent)
            .send()
            .await
            .map_err(map_sdk_err)?;
        out.item().map(item_to_user).transpose()
    }

    /// Start buffering writes for one atomic commit.
    pub fn begin(&self) -> DynamoTx {
        DynamoTx::default()
    }

    /// Submit every write buffered in `tx` as one all-or-nothing request.
    pub fn commit(&self, ctx: &CallContext, tx: DynamoTx) -> Result<(), RepoError> {
        let writes = tx
            .writes
            .into_inner()
            .map_err(|_| RepoError::storage("mutex poisoned"))?
            .items;
        if writes.is_empty() {
            return Ok(());
        }
        let count = writes.len();
        self.run(ctx, async {
            self.client
                .transact_write_items()
                .set_transact_items(Some(writes))
                .send()
                .await
                .map_err(|e| match e.as_service_error() {
                    Some(TransactWriteItemsError::TransactionCanceledException(tc))
                        if tc
                            .cancellation_reasons()
                            .iter()
                            .any(|r| r.code() == Some("ConditionalCheckFailed")) =>
                    {
                        RepoError::NotFound
                    }
                    _ => map_sdk_err(e),
                })
        })?;
        debug!(writes = count, "dynamo commit");
        Ok(())
    }

    /// Create the users and counters tables if they do not exist yet.
    pub fn create_tables(&self, ctx: &CallContext) -> Result<(), RepoError> {
        let specs = [
            (&self.table_users, "id", ScalarAttributeType::N),
            (&self.table_counters, "name", ScalarAttributeType::S),
        ];
        self.run(ctx, async {
            for (table, attr, kind) in specs {
                let key_schema = KeySchemaElement::builder()
                    .attribute_name(attr)
                    .key_type(KeyType::Hash)
                    .build()
                    .map_err(map_build_err)?;
                let definition = AttributeDefinition::builder()
                    .attribute_name(attr)
                    .attribute_type(kind)
                    .build()
                    .map_err(map_build_err)?;
                let res = self
                    .client
                    .create_table()
                    .table_name(table)
                    .key_schema(key_schema)
                    .attribute_definitions(definition)
                    .billing_mode(BillingMode::PayPerRequest)
                    .send()
                    .await;
                match res {
                    Ok(_) => debug!(table = %table, "created table"),
                    Err(e) if e.code() == Some("ResourceInUseException") => {}
                    Err(e) => return Err(map_sdk_err(e)),
                }
            }
            Ok(())
        })
    }
}

/// Reject option combinations this backend cannot honor. Returns whether reads
/// must be strongly consistent: primary-forced calls and anything in a transaction.
fn vet_options(opts: &ScopedOptions<'_, DynamoTx>) -> Result<bool, RepoError> {
    validate_options(opts)?;
    if opts.lock {
        return Err(RepoError::Unsupported {
            backend: "dynamo",
            feature: "row locks",
        });
    }
    Ok(opts.force_primary || opts.tx.is_some())
}

fn map_sdk_err<E: ProvideErrorMetadata + std::fmt::Display>(e: E) -> RepoError {
    match e.code() {
        Some("ConditionalCheckFailedException") => RepoError::NotFound,
        Some("ResourceNotFoundException") => RepoError::storage(format!("missing table: {e}")),
        _ => RepoError::storage(format!("dynamo error: {e}")),
    }
}

fn map_build_err(e: BuildError) -> RepoError {
    RepoError::storage(e)
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

fn key(id: UserId) -> HashMap<String, AttributeValue> {
    HashMap::from([("id".to_string(), AttributeValue::N(id.get().to_string()))])
}

fn user_to_item(user: &User) -> HashMap<String, AttributeValue> {
    let mut m = key(user.id);
    m.insert("name".into(), AttributeValue::S(user.name.clone()));
    m.insert("age".into(), AttributeValue::N(user.age.to_string()));
    m.insert(
        "created_at".into(),
        AttributeValue::N(to_nanos(user.created_at).to_string()),
    );
    m.insert(
        "updated_at".into(),
        AttributeValue::N(to_nanos(user.updated_at).to_string()),
    );
    m
}

fn item_to_user(item: &HashMap<String, AttributeValue>) -> Result<User, RepoError> {
    fn num<T: std::str::FromStr>(
        item: &HashMap<String, AttributeValue>,
        attr: &str,
    ) -> Result<T, RepoError> {
        item.get(attr)
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<T>().ok())
            .ok_or_else(|| RepoError::storage(format!("user item missing or bad {attr}")))
    }
    let name = item
        .get("name")
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| RepoError::storage("user item missing name"))?
        .to_string();
    Ok(User {
        id: UserId::new(num(item, "id")?),
        name,
        age: num(item, "age")?,
        created_at: from_nanos(num(item, "created_at")?),
        updated_at: from_nanos(num(item, "updated_at")?),
    })
}

impl UserRepository for DynamoRepo {
    type Tx = DynamoTx;

    fn get_by_id(
        &self,
        ctx: &CallContext,
        id: UserId,
        opts: &ScopedOptions<'_, DynamoTx>,
    ) -> Result<Option<User>, RepoError> {
        let consistent = vet_options(opts)?;
        self.run(ctx, self.fetch(id, consistent))
    }

    fn get_all(
        &self,
        ctx: &CallContext,
        filter: &ResolvedFilter,
        opts: &ScopedOptions<'_, DynamoTx>,
    ) -> Result<ListResult<User>, RepoError> {
        let plan = query::translate(filter)?;
        let consistent = vet_options(opts)?;
        let matches = self.run(ctx, async {
            let mut users = Vec::new();
            let mut start = None;
            loop {
                let out = self
                    .client
                    .scan()
                    .table_name(&self.table_users)
                    .filter_expression(&plan.expression)
                    .set_expression_attribute_names(Some(plan.names.clone()))
                    .set_expression_attribute_values(Some(plan.values.clone()))
                    .consistent_read(consistent)
                    .set_exclusive_start_key(start.take())
                    .send()
                    .await
                    .map_err(map_sdk_err)?;
                for item in out.items() {
                    users.push(item_to_user(item)?);
                }
                match out.last_evaluated_key() {
                    Some(k) if !k.is_empty() => start = Some(k.clone()),
                    _ => break,
                }
            }
            Ok(users)
        })?;
        debug!(scanned_matches = matches.len(), "dynamo get_all");
        Ok(apply_page(matches, filter))
    }

    fn create(
        &self,
        ctx: &CallContext,
        draft: &UserDraft,
        opts: &ScopedOptions<'_, DynamoTx>,
    ) -> Result<User, RepoError> {
        vet_options(opts)?;
        let user = self.run(ctx, async {
            let id = self.next_user_id().await?;
            let user = draft.clone().into_user(id);
            if let Some(tx) = opts.tx {
                let put = Put::builder()
                    .table_name(&self.table_users)
                    .set_item(Some(user_to_item(&user)))
                    .condition_expression("attribute_not_exists(#id)")
                    .expression_attribute_names("#id", "id")
                    .build()
                    .map_err(map_build_err)?;
                tx.push(vec![(id, TransactWriteItem::builder().put(put).build())])?;
                return Ok(user);
            }
            self.client
                .put_item()
                .table_name(&self.table_users)
                .set_item(Some(user_to_item(&user)))
                .condition_expression("attribute_not_exists(#id)")
                .expression_attribute_names("#id", "id")
                .send()
                .await
                .map_err(|e| match e.code() {
                    Some("ConditionalCheckFailedException") => {
                        RepoError::storage(format!("id {id} already taken; counter out of sync"))
                    }
                    _ => map_sdk_err(e),
                })?;
            Ok(user)
        })?;
        Ok(user)
    }

    fn update(
        &self,
        ctx: &CallContext,
        id: UserId,
        patch: &UserPatch,
        updated_at: SystemTime,
        opts: &ScopedOptions<'_, DynamoTx>,
    ) -> Result<(), RepoError> {
        vet_options(opts)?;
        let (expr, condition) = query::update(patch, updated_at);
        self.run(ctx, async {
            if let Some(tx) = opts.tx {
                tx.ensure_unwritten(id)?;
                if self.fetch(id, true).await?.is_none() {
                    return Err(RepoError::NotFound);
                }
                let update = Update::builder()
                    .table_name(&self.table_users)
                    .set_key(Some(key(id)))
                    .update_expression(expr.expression)
                    .condition_expression(condition)
                    .set_expression_attribute_names(Some(expr.names))
                    .set_expression_attribute_values(Some(expr.values))
                    .build()
                    .map_err(map_build_err)?;
                return tx.push(vec![(id, TransactWriteItem::builder().update(update).build())]);
            }
            self.client
                .update_item()
                .table_name(&self.table_users)
                .set_key(Some(key(id)))
                .update_expression(expr.expression)
                .condition_expression(condition)
                .set_expression_attribute_names(Some(expr.names))
                .set_expression_attribute_values(Some(expr.values))
                .send()
                .await
                .map_err(map_sdk_err)?;
            Ok(())
        })
    }

    fn delete(
        &self,
        ctx: &CallContext,
        ids: &[UserId],
        opts: &ScopedOptions<'_, DynamoTx>,
    ) -> Result<u64, RepoError> {
        vet_options(opts)?;
        let mut unique = ids.to_vec();
        unique.sort_unstable();
        unique.dedup();
        if unique.is_empty() {
            return Ok(0);
        }
        self.run(ctx, async {
            if let Some(tx) = opts.tx {
                for id in &unique {
                    tx.ensure_unwritten(*id)?;
                }
                let mut removed = 0;
                let mut writes = Vec::with_capacity(unique.len());
                for id in &unique {
                    if self.fetch(*id, true).await?.is_none() {
                        continue;
                    }
                    removed += 1;
                    let delete = Delete::builder()
                        .table_name(&self.table_users)
                        .set_key(Some(key(*id)))
                        .build()
                        .map_err(map_build_err)?;
                    writes.push((*id, TransactWriteItem::builder().delete(delete).build()));
                }
                tx.push(writes)?;
                return Ok(removed);
            }
            let mut removed = 0;
            for id in &unique {
                let out = self
                    .client
                    .delete_item()
                    .table_name(&self.table_users)
                    .set_key(Some(key(*id)))
                    .return_values(ReturnValue::AllOld)
                    .send()
                    .await
                    .map_err(map_sdk_err)?;
                if out.attributes().is_some_and(|a| !a.is_empty()) {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}
