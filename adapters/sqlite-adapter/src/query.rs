//! Relational translation of resolved filters and patches.
//!
//! Every value is bound through numbered placeholders (`?1`, `?2`, ...); only
//! whitelisted column names are ever interpolated into SQL text.

use std::time::SystemTime;

use domain::validate::validate_filter;
use domain::{RepoError, ResolvedFilter, UserId, UserPatch};
use rusqlite::types::Value;

use crate::to_nanos;

/// Column list shared by every `SELECT` so `row_to_user` can read by position.
pub(crate) const USER_COLUMNS: &str = "id, name, age, created_at, updated_at";

/// Predicate, ordering, and pagination for one `get_all` call.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectPlan {
    where_clause: String,
    params: Vec<Value>,
    order_column: &'static str,
    limit: i64,
    offset: i64,
}

impl SelectPlan {
    pub fn where_clause(&self) -> &str {
        &self.where_clause
    }

    /// Parameters for the predicate only.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Count of every match, ignoring limit and offset.
    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM users WHERE {}", self.where_clause)
    }

    /// One page, newest (or largest) first, ties broken by id.
    pub fn select_sql(&self) -> String {
        format!(
            "SELECT {USER_COLUMNS} FROM users WHERE {} ORDER BY {} DESC, id DESC LIMIT ?{} OFFSET ?{}",
            self.where_clause,
            self.order_column,
            self.params.len() + 1,
            self.params.len() + 2
        )
    }

    /// Predicate parameters followed by limit and offset, matching `select_sql`.
    pub fn page_params(&self) -> Vec<Value> {
        let mut all = self.params.clone();
        all.push(Value::Integer(self.limit));
        all.push(Value::Integer(self.offset));
        all
    }
}

/// Validate `filter` and build the conjunction of its predicates.
pub fn translate(filter: &ResolvedFilter) -> Result<SelectPlan, RepoError> {
    validate_filter(filter)?;

    let mut conditions = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    params.push(Value::Integer(to_nanos(filter.created_at_gte)));
    conditions.push(format!("created_at >= ?{}", params.len()));
    params.push(Value::Integer(to_nanos(filter.created_at_lte)));
    conditions.push(format!("created_at <= ?{}", params.len()));

    if let Some(min) = filter.age_gte {
        params.push(Value::Integer(min.into()));
        conditions.push(format!("age >= ?{}", params.len()));
    }
    if let Some(max) = filter.age_lte {
        params.push(Value::Integer(max.into()));
        conditions.push(format!("age <= ?{}", params.len()));
    }
    if !filter.ids.is_empty() {
        let first = params.len() + 1;
        params.extend(filter.ids.iter().map(|id| Value::Integer(id.get())));
        conditions.push(format!("id IN ({})", placeholders(first, filter.ids.len())));
    }

    let offset = i64::try_from(filter.offset)
        .map_err(|_| RepoError::Validation(format!("offset {} is too large", filter.offset)))?;

    Ok(SelectPlan {
        where_clause: conditions.join(" AND "),
        params,
        order_column: filter.order_by.as_str(),
        limit: filter.limit.into(),
        offset,
    })
}

/// `UPDATE` touching only the patched columns plus `updated_at`.
pub fn update_statement(
    id: UserId,
    patch: &UserPatch,
    updated_at: SystemTime,
) -> (String, Vec<Value>) {
    let mut sets = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if let Some(name) = &patch.name {
        params.push(Value::Text(name.clone()));
        sets.push(format!("name = ?{}", params.len()));
    }
    if let Some(age) = patch.age {
        params.push(Value::Integer(age.into()));
        sets.push(format!("age = ?{}", params.len()));
    }
    params.push(Value::Integer(to_nanos(updated_at)));
    sets.push(format!("updated_at = ?{}", params.len()));

    params.push(Value::Integer(id.get()));
    let sql = format!(
        "UPDATE users SET {} WHERE id = ?{}",
        sets.join(", "),
        params.len()
    );
    (sql, params)
}

/// Batch `DELETE` by id.
pub fn delete_statement(ids: &[UserId]) -> (String, Vec<Value>) {
    let sql = format!(
        "DELETE FROM users WHERE id IN ({})",
        placeholders(1, ids.len())
    );
    let params = ids.iter().map(|id| Value::Integer(id.get())).collect();
    (sql, params)
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}
