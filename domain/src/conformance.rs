//! Backend conformance suite.
//!
//! Every backend runs the same cases through `UserService` so the filter
//! contract is checked identically no matter how a backend translates it.
//! Adapter crates enable it with the `test-utils` feature and call
//! [`run_all`] with a constructor for fresh, empty repositories.
//!
//! Fixture: six users created on consecutive days from 2024-04-10 23:00 UTC,
//! with ids 1..=6 in creation order, and a clock fixed at 2024-04-17 00:00 UTC.
#![allow(clippy::unwrap_used)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::service::UserService;
use crate::{
    CallContext, FilterSpec, FixedClock, ListResult, NewUser, OrderBy, RepoError, ScopedOptions,
    User, UserId, UserPatch, UserRepository,
};

/// 2024-04-01 00:00:00 UTC.
const APRIL_1_2024: u64 = 1_711_929_600;

/// Seeded `(name, age)` pairs in creation order.
pub const SEED: [(&str, u8); 6] = [
    ("first", 55),
    ("second", 22),
    ("third", 40),
    ("forth", 30),
    ("five", 45),
    ("six", 66),
];

/// A UTC instant in April 2024.
pub fn april(day: u64, hour: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(APRIL_1_2024 + (day - 1) * 86_400 + hour * 3_600)
}

/// The instant the fixture clock is pinned to.
pub fn anchor() -> SystemTime {
    april(17, 0)
}

/// Create the six fixture users, oldest first.
pub fn seed<R: UserRepository>(svc: &UserService<R, FixedClock>) -> Vec<User> {
    let ctx = CallContext::new();
    SEED.iter()
        .enumerate()
        .map(|(i, (name, age))| {
            let input = NewUser::new(*name, *age).created_at(april(10 + i as u64, 23));
            svc.create(&ctx, input, &ScopedOptions::new()).unwrap()
        })
        .collect()
}

type Case<R> = fn(&UserService<R, FixedClock>);

fn cases<R: UserRepository>() -> Vec<(&'static str, Case<R>)> {
    vec![
        ("default_page", default_page::<R>),
        ("limit_two", limit_two::<R>),
        ("offset_moves_page", offset_moves_page::<R>),
        ("created_at_lte", created_at_lte::<R>),
        ("created_at_gte", created_at_gte::<R>),
        ("created_between", created_between::<R>),
        ("window_bounds_inclusive", window_bounds_inclusive::<R>),
        ("default_window_excludes_outside", default_window_excludes_outside::<R>),
        ("order_by_age", order_by_age::<R>),
        ("order_by_name", order_by_name::<R>),
        ("age_range", age_range::<R>),
        ("total_ignores_pagination", total_ignores_pagination::<R>),
        ("ids_filter", ids_filter::<R>),
        ("ids_narrow_other_predicates", ids_narrow_other_predicates::<R>),
        ("zero_age_is_a_bound", zero_age_is_a_bound::<R>),
        ("empty_result", empty_result::<R>),
        ("create_round_trip", create_round_trip::<R>),
        ("missing_id_is_soft_miss", missing_id_is_soft_miss::<R>),
        ("partial_update", partial_update::<R>),
        ("update_missing_not_found", update_missing_not_found::<R>),
        ("delete_then_soft_miss", delete_then_soft_miss::<R>),
        ("batch_delete", batch_delete::<R>),
        ("cancelled_context", cancelled_context::<R>),
        ("inverted_window_rejected", inverted_window_rejected::<R>),
        ("lock_without_tx_rejected", lock_without_tx_rejected::<R>),
    ]
}

/// Run every case against a fresh, seeded repository from `make`.
pub fn run_all<R, F>(make: F)
where
    R: UserRepository,
    F: Fn() -> R,
{
    for (name, case) in cases::<R>() {
        eprintln!("conformance case: {name}");
        let svc = UserService::new(make(), FixedClock(anchor()));
        seed(&svc);
        case(&svc);
    }
}

fn list<R: UserRepository>(svc: &UserService<R, FixedClock>, spec: FilterSpec) -> ListResult<User> {
    svc.get_all(&CallContext::new(), &spec, &ScopedOptions::new())
        .unwrap()
}

fn ids(page: &ListResult<User>) -> Vec<i64> {
    page.items.iter().map(|u| u.id.get()).collect()
}

fn get<R: UserRepository>(svc: &UserService<R, FixedClock>, id: i64) -> Option<User> {
    svc.get_by_id(&CallContext::new(), UserId::new(id), &ScopedOptions::new())
        .unwrap()
}

fn default_page<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new());
    assert_eq!(ids(&page), vec![6, 5, 4, 3, 2, 1]);
    assert_eq!(page.total, 6);
    assert!(!page.has_more);
}

fn limit_two<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new().offset(0).limit(2));
    assert_eq!(ids(&page), vec![6, 5]);
    assert_eq!(page.total, 6);
    assert!(page.has_more);
}

fn offset_moves_page<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new().offset(1).limit(6));
    assert_eq!(ids(&page), vec![5, 4, 3, 2, 1]);
    assert_eq!(page.total, 6);
}

fn created_at_lte<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new().created_at_lte(april(13, 0)));
    assert_eq!(ids(&page), vec![3, 2, 1]);
}

fn created_at_gte<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new().created_at_gte(april(14, 0)));
    assert_eq!(ids(&page), vec![6, 5]);
}

fn created_between<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(
        svc,
        FilterSpec::new()
            .created_at_gte(april(13, 0))
            .created_at_lte(april(15, 0)),
    );
    assert_eq!(ids(&page), vec![5, 4]);
}

fn window_bounds_inclusive<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let exact = april(12, 23);
    let page = list(svc, FilterSpec::new().created_at_gte(exact).created_at_lte(exact));
    assert_eq!(ids(&page), vec![3]);
}

fn default_window_excludes_outside<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let ctx = CallContext::new();
    let opts = ScopedOptions::new();
    let stale = anchor() - Duration::from_secs(31 * 86_400);
    let future = anchor() + Duration::from_secs(86_400);
    svc.create(&ctx, NewUser::new("stale", 20).created_at(stale), &opts)
        .unwrap();
    svc.create(&ctx, NewUser::new("future", 20).created_at(future), &opts)
        .unwrap();

    let page = list(svc, FilterSpec::new());
    assert_eq!(page.total, 6);
    assert_eq!(ids(&page), vec![6, 5, 4, 3, 2, 1]);
}

fn order_by_age<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new().order_by(OrderBy::Age));
    let ages: Vec<u8> = page.items.iter().map(|u| u.age).collect();
    assert_eq!(ages, vec![66, 55, 45, 40, 30, 22]);
}

fn order_by_name<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new().order_by(OrderBy::Name));
    let names: Vec<&str> = page.items.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["third", "six", "second", "forth", "five", "first"]);
}

fn age_range<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new().age_gte(22).age_lte(45));
    assert_eq!(ids(&page), vec![5, 4, 3, 2]);
    assert_eq!(page.total, 4);
    assert!(page.items.iter().all(|u| (22..=45).contains(&u.age)));
}

fn total_ignores_pagination<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new().age_gte(22).age_lte(45).limit(2));
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total, 4);
    assert!(page.has_more);

    let tail = list(svc, FilterSpec::new().age_gte(22).age_lte(45).limit(2).offset(3));
    assert_eq!(ids(&tail), vec![2]);
    assert_eq!(tail.total, 4);
    assert!(!tail.has_more);
}

fn ids_filter<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new().ids([3, 4].map(UserId::new)));
    assert_eq!(ids(&page), vec![4, 3]);
    assert_eq!(page.total, 2);
}

fn ids_narrow_other_predicates<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(
        svc,
        FilterSpec::new().ids([1, 2, 3].map(UserId::new)).age_gte(30),
    );
    assert_eq!(ids(&page), vec![3, 1]);
    assert_eq!(page.total, 2);
}

fn zero_age_is_a_bound<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let baby = svc
        .create(
            &CallContext::new(),
            NewUser::new("baby", 0).created_at(april(16, 0)),
            &ScopedOptions::new(),
        )
        .unwrap();
    let page = list(svc, FilterSpec::new().age_lte(0));
    assert_eq!(ids(&page), vec![baby.id.get()]);

    let everyone = list(svc, FilterSpec::new().age_gte(0));
    assert_eq!(everyone.total, 7);
}

fn empty_result<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let page = list(svc, FilterSpec::new().age_gte(100));
    assert!(page.items.is_empty());
    assert_eq!(page.total, 0);
    assert!(!page.has_more);
}

fn create_round_trip<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let at = april(16, 12) + Duration::from_nanos(123_456_789);
    let created = svc
        .create(
            &CallContext::new(),
            NewUser::new("zed", 41).created_at(at),
            &ScopedOptions::new(),
        )
        .unwrap();
    assert_eq!(created.id, UserId::new(7));

    let got = get(svc, created.id.get()).unwrap();
    assert_eq!(got, created);
    assert_eq!(got.name, "zed");
    assert_eq!(got.age, 41);
    assert_eq!(got.created_at, at);
}

fn missing_id_is_soft_miss<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    assert!(get(svc, 999).is_none());
}

fn partial_update<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let before = get(svc, 1).unwrap();
    svc.update(
        &CallContext::new(),
        before.id,
        &UserPatch::new().name("X"),
        &ScopedOptions::new(),
    )
    .unwrap();

    let after = get(svc, 1).unwrap();
    assert_eq!(after.name, "X");
    assert_eq!(after.age, before.age);
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.updated_at, anchor());

    let untouched = get(svc, 2).unwrap();
    assert_eq!(untouched.name, "second");
}

fn update_missing_not_found<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let err = svc
        .update(
            &CallContext::new(),
            UserId::new(999),
            &UserPatch::new().age(1),
            &ScopedOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::NotFound), "got {err:?}");
}

fn delete_then_soft_miss<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let removed = svc
        .delete(&CallContext::new(), &[UserId::new(2)], &ScopedOptions::new())
        .unwrap();
    assert_eq!(removed, 1);
    assert!(get(svc, 2).is_none());
}

fn batch_delete<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let removed = svc
        .delete(
            &CallContext::new(),
            &[3, 4, 999].map(UserId::new),
            &ScopedOptions::new(),
        )
        .unwrap();
    assert_eq!(removed, 2);
    assert!(get(svc, 3).is_none());
    assert!(get(svc, 4).is_none());
    assert_eq!(list(svc, FilterSpec::new()).total, 4);
}

fn cancelled_context<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let ctx = CallContext::new();
    ctx.cancel();
    let opts = ScopedOptions::new();

    let err = svc
        .create(&ctx, NewUser::new("late", 30).created_at(april(16, 0)), &opts)
        .unwrap_err();
    assert!(err.is_cancellation(), "got {err:?}");
    let err = svc.get_by_id(&ctx, UserId::new(1), &opts).unwrap_err();
    assert!(matches!(err, RepoError::Cancelled), "got {err:?}");
    let err = svc.get_all(&ctx, &FilterSpec::new(), &opts).unwrap_err();
    assert!(matches!(err, RepoError::Cancelled), "got {err:?}");

    assert_eq!(list(svc, FilterSpec::new()).total, 6);
}

fn inverted_window_rejected<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let err = svc
        .get_all(
            &CallContext::new(),
            &FilterSpec::new()
                .created_at_gte(april(15, 0))
                .created_at_lte(april(14, 0)),
            &ScopedOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::Validation(_)), "got {err:?}");
}

fn lock_without_tx_rejected<R: UserRepository>(svc: &UserService<R, FixedClock>) {
    let err = svc
        .get_by_id(
            &CallContext::new(),
            UserId::new(1),
            &ScopedOptions::new().for_update(),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::Validation(_)), "got {err:?}");
}
