//! Domain library for the users data-access layer.
//!
//! This crate holds the entity types, the filter resolution policy, the
//! storage port (`UserRepository`), the facade (`service::UserService`) and the
//! error taxonomy shared by every backend. Storage engines live in the adapter
//! crates; keep IO concerns out of this crate.

use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod adapters;
#[cfg(any(test, feature = "test-utils"))]
pub mod conformance;
pub mod filter;
pub mod options;
pub mod service;
pub mod validate;

pub use filter::{FilterSpec, OrderBy, ResolvedFilter};
pub use options::{CallContext, ScopedOptions};

/// Storage-assigned identifier of a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for UserId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stored user record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub age: u8,
    /// Set once at creation; `Update` never touches it.
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// Input data for creating a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewUser {
    pub name: String,
    pub age: u8,
    /// Caller-assigned creation time. `None` means "now" per the service clock.
    pub created_at: Option<SystemTime>,
}

impl NewUser {
    pub fn new<S: Into<String>>(name: S, age: u8) -> Self {
        Self {
            name: name.into(),
            age,
            created_at: None,
        }
    }

    pub fn created_at(mut self, at: SystemTime) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Fill unset timestamps. A new record starts with `updated_at == created_at`.
    pub fn stamp(self, now: SystemTime) -> UserDraft {
        let created_at = self.created_at.unwrap_or(now);
        UserDraft {
            name: self.name,
            age: self.age,
            created_at,
            updated_at: created_at,
        }
    }
}

/// A fully stamped user waiting for storage to assign its identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserDraft {
    pub name: String,
    pub age: u8,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl UserDraft {
    pub fn into_user(self, id: UserId) -> User {
        User {
            id,
            name: self.name,
            age: self.age,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Partial update of a user; only `Some` fields change.
///
/// Deserializing rejects unknown keys, so `{"created_at": ..}` or a typo such
/// as `{"nmae": ..}` fails with a validation error instead of reaching storage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub age: Option<u8>,
}

impl UserPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn age(mut self, age: u8) -> Self {
        self.age = Some(age);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.age.is_none()
    }

    /// Parse a JSON object mapping field names to new values.
    pub fn from_json(raw: &str) -> Result<Self, RepoError> {
        serde_json::from_str(raw).map_err(|e| RepoError::Validation(format!("invalid patch: {e}")))
    }

    /// Apply the patch to an in-memory record.
    pub fn apply(&self, user: &mut User, updated_at: SystemTime) {
        if let Some(name) = &self.name {
            user.name = name.clone();
        }
        if let Some(age) = self.age {
            user.age = age;
        }
        user.updated_at = updated_at;
    }
}

/// Paginated list result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListResult<T> {
    pub items: Vec<T>,
    /// Number of matches ignoring limit and offset.
    pub total: u64,
    pub has_more: bool,
}

impl<T> ListResult<T> {
    pub fn new(items: Vec<T>, total: u64, offset: u64) -> Self {
        let has_more = offset + (items.len() as u64) < total;
        Self {
            items,
            total,
            has_more,
        }
    }
}

/// Time source abstraction to make code testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock pinned to a single instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub SystemTime);

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.0
    }
}

/// Storage port implemented by every backend.
///
/// Implementations receive filters that are already resolved; they validate
/// and translate them into their native query model. Each call is a single
/// exchange with storage and must honor the cancellation state of `ctx`.
pub trait UserRepository: Send + Sync {
    /// Caller-owned transaction handle accepted through `ScopedOptions::tx`.
    type Tx;

    /// `Ok(None)` when no record has this id.
    fn get_by_id(
        &self,
        ctx: &CallContext,
        id: UserId,
        opts: &ScopedOptions<'_, Self::Tx>,
    ) -> Result<Option<User>, RepoError>;

    fn get_all(
        &self,
        ctx: &CallContext,
        filter: &ResolvedFilter,
        opts: &ScopedOptions<'_, Self::Tx>,
    ) -> Result<ListResult<User>, RepoError>;

    /// Persist a draft and return it with its assigned id.
    fn create(
        &self,
        ctx: &CallContext,
        draft: &UserDraft,
        opts: &ScopedOptions<'_, Self::Tx>,
    ) -> Result<User, RepoError>;

    /// Fails with `RepoError::NotFound` when no record has this id.
    fn update(
        &self,
        ctx: &CallContext,
        id: UserId,
        patch: &UserPatch,
        updated_at: SystemTime,
        opts: &ScopedOptions<'_, Self::Tx>,
    ) -> Result<(), RepoError>;

    /// Remove every listed record and return how many existed.
    fn delete(
        &self,
        ctx: &CallContext,
        ids: &[UserId],
        opts: &ScopedOptions<'_, Self::Tx>,
    ) -> Result<u64, RepoError>;
}

/// Errors surfaced by the repository layer.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("user not found")]
    NotFound,
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("{backend} does not support {feature}")]
    Unsupported {
        backend: &'static str,
        feature: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl RepoError {
    pub fn storage<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        RepoError::Storage(err.into())
    }

    /// True for both an explicit cancel and an expired deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RepoError::Cancelled | RepoError::DeadlineExceeded)
    }
}
