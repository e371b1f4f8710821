//! Filter specification and the default-resolution policy.
//!
//! A `FilterSpec` is what a caller asks for; every field is optional. A
//! `ResolvedFilter` is the same request with defaults applied against an
//! injected "now", ready for a backend to translate. Resolution is pure and
//! never rejects input; consistency checks live in `validate::validate_filter`
//! and run inside each backend's translator.

use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{ListResult, User, UserId};

/// Page size used when the caller leaves `limit` unset or zero.
pub const DEFAULT_LIMIT: u32 = 30;
/// Largest page a single call may return.
pub const MAX_LIMIT: u32 = 1000;
/// Length of the default `created_at` window ending at "now".
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Sortable fields. Results are always ordered descending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    Age,
    Name,
    #[default]
    CreatedAt,
}

impl OrderBy {
    /// Field name as stored, shared by the relational column and the document attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderBy::Age => "age",
            OrderBy::Name => "name",
            OrderBy::CreatedAt => "created_at",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "age" => Some(OrderBy::Age),
            "name" => Some(OrderBy::Name),
            "created_at" => Some(OrderBy::CreatedAt),
            _ => None,
        }
    }

    /// Descending order on this field, ties broken by descending id.
    pub fn compare_desc(self, a: &User, b: &User) -> Ordering {
        let primary = match self {
            OrderBy::Age => b.age.cmp(&a.age),
            OrderBy::Name => b.name.cmp(&a.name),
            OrderBy::CreatedAt => b.created_at.cmp(&a.created_at),
        };
        primary.then_with(|| b.id.cmp(&a.id))
    }
}

/// Caller-supplied query intent. Unset fields take defaults on resolution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterSpec {
    pub offset: Option<u64>,
    pub limit: Option<u32>,
    pub order_by: Option<OrderBy>,
    pub created_at_gte: Option<SystemTime>,
    pub created_at_lte: Option<SystemTime>,
    pub age_gte: Option<u8>,
    pub age_lte: Option<u8>,
    /// Restrict to these ids. Conjoined with every other predicate.
    pub ids: Vec<UserId>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn created_at_gte(mut self, at: SystemTime) -> Self {
        self.created_at_gte = Some(at);
        self
    }

    pub fn created_at_lte(mut self, at: SystemTime) -> Self {
        self.created_at_lte = Some(at);
        self
    }

    pub fn age_gte(mut self, age: u8) -> Self {
        self.age_gte = Some(age);
        self
    }

    pub fn age_lte(mut self, age: u8) -> Self {
        self.age_lte = Some(age);
        self
    }

    pub fn ids<I: IntoIterator<Item = UserId>>(mut self, ids: I) -> Self {
        self.ids = ids.into_iter().collect();
        self
    }

    /// Apply defaults against `now`.
    pub fn resolve(&self, now: SystemTime) -> ResolvedFilter {
        let limit = match self.limit {
            None | Some(0) => DEFAULT_LIMIT,
            Some(limit) => limit.min(MAX_LIMIT),
        };
        let created_at_gte = self.created_at_gte.unwrap_or_else(|| {
            now.checked_sub(DEFAULT_WINDOW).unwrap_or(UNIX_EPOCH)
        });
        let mut ids = self.ids.clone();
        ids.sort_unstable();
        ids.dedup();

        ResolvedFilter {
            offset: self.offset.unwrap_or(0),
            limit,
            order_by: self.order_by.unwrap_or_default(),
            created_at_gte,
            created_at_lte: self.created_at_lte.unwrap_or(now),
            age_gte: self.age_gte,
            age_lte: self.age_lte,
            ids,
        }
    }
}

/// A `FilterSpec` with every default applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedFilter {
    pub offset: u64,
    pub limit: u32,
    pub order_by: OrderBy,
    /// Inclusive lower bound.
    pub created_at_gte: SystemTime,
    /// Inclusive upper bound.
    pub created_at_lte: SystemTime,
    /// `None` means no bound; `Some(0)` is a real bound.
    pub age_gte: Option<u8>,
    pub age_lte: Option<u8>,
    /// Sorted and de-duplicated; empty means no identity predicate.
    pub ids: Vec<UserId>,
}

impl ResolvedFilter {
    /// Evaluate the predicate (everything except ordering and pagination).
    pub fn matches(&self, user: &User) -> bool {
        user.created_at >= self.created_at_gte
            && user.created_at <= self.created_at_lte
            && self.age_gte.map_or(true, |min| user.age >= min)
            && self.age_lte.map_or(true, |max| user.age <= max)
            && (self.ids.is_empty() || self.ids.binary_search(&user.id).is_ok())
    }
}

/// Order, count, and page a set of records that already satisfy the predicate.
///
/// Backends without native ordering or counting share this so they report the
/// same page and total as the relational translator.
pub fn apply_page(mut matches: Vec<User>, filter: &ResolvedFilter) -> ListResult<User> {
    matches.sort_by(|a, b| filter.order_by.compare_desc(a, b));
    let total = matches.len() as u64;
    let skip = usize::try_from(filter.offset).unwrap_or(usize::MAX);
    let items: Vec<User> = matches
        .into_iter()
        .skip(skip)
        .take(filter.limit as usize)
        .collect();
    ListResult::new(items, total, filter.offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_713_312_000)
    }

    fn user(id: i64, name: &str, age: u8, created_secs: u64) -> User {
        let at = UNIX_EPOCH + Duration::from_secs(created_secs);
        User {
            id: UserId::new(id),
            name: name.into(),
            age,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn resolve_applies_defaults() {
        let r = FilterSpec::new().resolve(now());
        assert_eq!(r.offset, 0);
        assert_eq!(r.limit, DEFAULT_LIMIT);
        assert_eq!(r.order_by, OrderBy::CreatedAt);
        assert_eq!(r.created_at_lte, now());
        assert_eq!(r.created_at_gte, now() - DEFAULT_WINDOW);
        assert_eq!(r.age_gte, None);
        assert_eq!(r.age_lte, None);
        assert!(r.ids.is_empty());
    }

    #[test]
    fn resolve_zero_limit_uses_default_and_large_limit_clamps() {
        assert_eq!(FilterSpec::new().limit(0).resolve(now()).limit, DEFAULT_LIMIT);
        assert_eq!(FilterSpec::new().limit(5_000).resolve(now()).limit, MAX_LIMIT);
        assert_eq!(FilterSpec::new().limit(2).resolve(now()).limit, 2);
    }

    #[test]
    fn resolve_keeps_zero_age_bound() {
        let r = FilterSpec::new().age_gte(0).age_lte(0).resolve(now());
        assert_eq!(r.age_gte, Some(0));
        assert_eq!(r.age_lte, Some(0));
    }

    #[test]
    fn resolve_keeps_caller_window() {
        let lo = UNIX_EPOCH + Duration::from_secs(10);
        let hi = UNIX_EPOCH + Duration::from_secs(20);
        let r = FilterSpec::new().created_at_gte(lo).created_at_lte(hi).resolve(now());
        assert_eq!(r.created_at_gte, lo);
        assert_eq!(r.created_at_lte, hi);
    }

    #[test]
    fn resolve_sorts_and_dedups_ids() {
        let r = FilterSpec::new()
            .ids([4, 3, 4, 1].map(UserId::new))
            .resolve(now());
        assert_eq!(r.ids, [1, 3, 4].map(UserId::new).to_vec());
    }

    #[test]
    fn matches_is_inclusive_on_both_bounds() {
        let r = FilterSpec::new()
            .created_at_gte(UNIX_EPOCH + Duration::from_secs(10))
            .created_at_lte(UNIX_EPOCH + Duration::from_secs(20))
            .age_gte(22)
            .age_lte(45)
            .resolve(now());
        assert!(r.matches(&user(1, "a", 22, 10)));
        assert!(r.matches(&user(2, "b", 45, 20)));
        assert!(!r.matches(&user(3, "c", 46, 15)));
        assert!(!r.matches(&user(4, "d", 30, 21)));
    }

    #[test]
    fn matches_conjoins_ids() {
        let r = FilterSpec::new()
            .created_at_gte(UNIX_EPOCH)
            .ids([UserId::new(1), UserId::new(2)])
            .age_gte(30)
            .resolve(now());
        assert!(r.matches(&user(1, "a", 31, 5)));
        assert!(!r.matches(&user(2, "b", 20, 5)));
        assert!(!r.matches(&user(3, "c", 31, 5)));
    }

    #[test]
    fn apply_page_orders_descending_with_id_tiebreak() {
        let r = FilterSpec::new().order_by(OrderBy::Age).limit(2).resolve(now());
        let page = apply_page(
            vec![user(1, "a", 30, 1), user(2, "b", 40, 2), user(3, "c", 40, 3)],
            &r,
        );
        let ids: Vec<i64> = page.items.iter().map(|u| u.id.get()).collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(page.total, 3);
        assert!(page.has_more);
    }

    #[test]
    fn apply_page_offset_past_end_is_empty() {
        let r = FilterSpec::new().offset(10).resolve(now());
        let page = apply_page(vec![user(1, "a", 30, 1)], &r);
        assert!(page.items.is_empty());
        assert_eq!(page.total, 1);
        assert!(!page.has_more);
    }

    #[test]
    fn order_by_parse() {
        assert_eq!(OrderBy::parse("AGE"), Some(OrderBy::Age));
        assert_eq!(OrderBy::parse("created_at"), Some(OrderBy::CreatedAt));
        assert_eq!(OrderBy::parse("id"), None);
    }
}
